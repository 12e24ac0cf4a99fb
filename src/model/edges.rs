use anyhow::Result;

use crate::configs::ModelConfig;
use crate::graph::{GraphState, GraphStateSpec};
use crate::nn::ops;
use crate::nn::{Activation, LayerStack, ParamSet, Tape, Var};

/// Proposes per-pair edge updates from the sentence encoding and the two
/// endpoint node feature vectors, vectorized over all ordered pairs.
pub struct EdgeProposal {
    dist_stack: LayerStack,
    gate_stack: LayerStack,
}

impl EdgeProposal {
    pub fn new(ps: &mut ParamSet, cfg: &ModelConfig, spec: &GraphStateSpec) -> EdgeProposal {
        let feat = spec.num_node_ids + spec.node_state_width;
        let pair_in = cfg.input_repr_size + 2 * feat;
        let hidden = [cfg.propose_repr_size];
        EdgeProposal {
            dist_stack: LayerStack::new(
                ps,
                "edges.dist",
                pair_in,
                &hidden,
                spec.edge_cats(),
                Activation::Softmax,
            ),
            gate_stack: LayerStack::new(ps, "edges.gate", pair_in, &hidden, 1, Activation::Sigmoid),
        }
    }

    pub fn apply(
        &self,
        tape: &mut Tape,
        ps: &ParamSet,
        graph: GraphState,
        sentence: Var,
    ) -> Result<GraphState> {
        let n = graph.nodes;
        if n == 0 {
            return Ok(graph);
        }
        let x = graph.node_features(tape)?; // [B,N,F]
        let xi = ops::tile_new(tape, x, 2, n)?; // [B,N,N,F] source per pair
        let xj = ops::tile_new(tape, x, 1, n)?; // destination per pair
        let sent = ops::tile_new(tape, sentence, 1, n)?;
        let sent = ops::tile_new(tape, sent, 2, n)?; // [B,N,N,R]
        let pair = ops::concat(tape, 3, &[sent, xi, xj])?;

        let dist = self.dist_stack.forward(tape, ps, pair)?; // [B,N,N,E+1]
        let gate = self.gate_stack.forward(tape, ps, pair)?;
        let gate = ops::reshape(tape, gate, &[graph.batch, n, n])?;
        graph.update_edges(tape, dist, gate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::CheckMode;
    use ndarray::prelude::*;
    use ndarray::IxDyn;
    use ndarray_rand::RandomExt;
    use rand_distr::Normal;

    #[test]
    fn edge_update_keeps_valid_distributions() {
        let cfg = ModelConfig {
            num_input_words: 10,
            num_output_words: 5,
            num_node_ids: 3,
            num_edge_types: 2,
            node_state_size: 4,
            input_repr_size: 6,
            propose_repr_size: 5,
            ..Default::default()
        };
        let spec = GraphStateSpec { num_node_ids: 3, node_state_width: 4, num_edge_types: 2 };
        let mut ps = ParamSet::new();
        let edges = EdgeProposal::new(&mut ps, &cfg, &spec);
        let mut tape = Tape::new(CheckMode::Off);
        let g = GraphState::with_static_nodes(&mut tape, &spec, 2);
        let s = tape.constant(ArrayD::from_elem(IxDyn(&[2, 3]), 1.0));
        let g = GraphState { strength: s, ..g };
        let sent = tape.constant(ArrayD::random(IxDyn(&[2, 6]), Normal::new(0.0, 1.0).unwrap()));
        let g2 = edges.apply(&mut tape, &ps, g, sent).unwrap();
        let sums = tape.value(g2.edges).sum_axis(Axis(3));
        assert!(sums.iter().all(|&x| (x - 1.0).abs() < 1e-4));
    }

    #[test]
    fn edges_of_phantom_nodes_stay_no_relation() {
        let cfg = ModelConfig {
            num_input_words: 10,
            num_output_words: 5,
            num_node_ids: 3,
            num_edge_types: 2,
            node_state_size: 4,
            input_repr_size: 6,
            propose_repr_size: 5,
            ..Default::default()
        };
        let spec = GraphStateSpec { num_node_ids: 3, node_state_width: 4, num_edge_types: 2 };
        let mut ps = ParamSet::new();
        let edges = EdgeProposal::new(&mut ps, &cfg, &spec);
        let mut tape = Tape::new(CheckMode::Off);
        // all strengths zero: the pair gate vanishes and no edge can form
        let g = GraphState::with_static_nodes(&mut tape, &spec, 2);
        let sent = tape.constant(ArrayD::random(IxDyn(&[2, 6]), Normal::new(0.0, 1.0).unwrap()));
        let g2 = edges.apply(&mut tape, &ps, g, sent).unwrap();
        let es = g2.edge_strength(&mut tape).unwrap();
        assert!(tape.value(es).iter().all(|&x| x.abs() < 1e-6));
    }
}
