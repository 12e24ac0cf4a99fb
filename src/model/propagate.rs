use anyhow::Result;

use crate::configs::ModelConfig;
use crate::graph::{GraphState, GraphStateSpec};
use crate::nn::ops;
use crate::nn::{GruCell, Linear, ParamSet, Tape, Var};

/// Message-passing update over the soft graph. Each step, every node
/// aggregates incoming messages along each edge type in both directions,
/// weighted by the edge's category mass and the sending node's strength,
/// then runs a GRU over (messages, own state). Identity embeddings feed the
/// message transforms through the node features, so nodes stay individually
/// addressable as their states mutate.
pub struct Propagation {
    fwd: Linear,
    bwd: Linear,
    gru: GruCell,
    prop_width: usize,
    edge_types: usize,
}

impl Propagation {
    pub fn new(ps: &mut ParamSet, cfg: &ModelConfig, spec: &GraphStateSpec) -> Propagation {
        let feat = spec.num_node_ids + spec.node_state_width;
        let p = cfg.propagate_repr_size;
        let e = spec.num_edge_types;
        Propagation {
            fwd: Linear::new(ps, "propagate.fwd", feat, e * p),
            bwd: Linear::new(ps, "propagate.bwd", feat, e * p),
            gru: GruCell::new(ps, "propagate.gru", 2 * p, spec.node_state_width),
            prop_width: p,
            edge_types: e,
        }
    }

    /// Messages delivered to each node: ([B,N,P] forward, [B,N,P] backward).
    /// A graph with no edge mass (or no nodes) aggregates to exactly zero.
    fn messages(&self, tape: &mut Tape, ps: &ParamSet, graph: &GraphState) -> Result<(Var, Var)> {
        let (b, n) = (graph.batch, graph.nodes);
        let (e, p) = (self.edge_types, self.prop_width);
        let x = graph.node_features(tape)?; // [B,N,F]
        let fwd = self.fwd.forward(tape, ps, x)?;
        let fwd = ops::tanh(tape, fwd)?;
        let fwd = ops::reshape(tape, fwd, &[b, n * e, p])?; // sender-major (i,e)
        let bwd = self.bwd.forward(tape, ps, x)?;
        let bwd = ops::tanh(tape, bwd)?;
        let bwd = ops::reshape(tape, bwd, &[b, n * e, p])?;

        // per-type edge mass, excluding the "no relation" slot: [B,i,j,e]
        let er = ops::slice_axis(tape, graph.edges, 3, 1, e + 1)?;

        // forward direction: receiver j sums over senders i
        let wf = ops::mul_outer(tape, er, graph.strength)?; // weight by s_i
        let wf = ops::swap_axes(tape, wf, 1, 2)?; // [B,j,i,e]
        let wf = ops::reshape(tape, wf, &[b, n, n * e])?;
        let m_fwd = ops::bmm(tape, wf, fwd, false, false)?; // [B,N,P]

        // backward direction: receiver i sums over senders j
        let wb = ops::swap_axes(tape, er, 1, 2)?; // [B,j,i,e]
        let wb = ops::mul_outer(tape, wb, graph.strength)?; // weight by s_j
        let wb = ops::swap_axes(tape, wb, 1, 2)?; // [B,i,j,e]
        let wb = ops::reshape(tape, wb, &[b, n, n * e])?;
        let m_bwd = ops::bmm(tape, wb, bwd, false, false)?;

        Ok((m_fwd, m_bwd))
    }

    pub fn step(&self, tape: &mut Tape, ps: &ParamSet, graph: GraphState) -> Result<GraphState> {
        let (b, n) = (graph.batch, graph.nodes);
        if n == 0 {
            return Ok(graph);
        }
        let (m_fwd, m_bwd) = self.messages(tape, ps, &graph)?;
        let input = ops::concat(tape, 2, &[m_fwd, m_bwd])?;
        let input = ops::reshape(tape, input, &[b * n, 2 * self.prop_width])?;
        let state = ops::reshape(tape, graph.state, &[b * n, self.gru.state_size()])?;
        let next = self.gru.step(tape, ps, input, state)?;
        let next = ops::reshape(tape, next, &[b, n, self.gru.state_size()])?;
        let gate = tape.ones(&[b, n]);
        graph.update_states(tape, next, gate)
    }

    pub fn run(
        &self,
        tape: &mut Tape,
        ps: &ParamSet,
        mut graph: GraphState,
        steps: usize,
    ) -> Result<GraphState> {
        for _ in 0..steps {
            graph = self.step(tape, ps, graph)?;
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::CheckMode;
    use ndarray::prelude::*;
    use ndarray::IxDyn;
    use ndarray_rand::RandomExt;
    use rand_distr::{Normal, Uniform};

    fn setup() -> (ModelConfig, GraphStateSpec, ParamSet, Propagation) {
        let cfg = ModelConfig {
            num_input_words: 10,
            num_output_words: 5,
            num_node_ids: 3,
            num_edge_types: 2,
            node_state_size: 4,
            propagate_repr_size: 5,
            ..Default::default()
        };
        let spec = GraphStateSpec { num_node_ids: 3, node_state_width: 4, num_edge_types: 2 };
        let mut ps = ParamSet::new();
        let prop = Propagation::new(&mut ps, &cfg, &spec);
        (cfg, spec, ps, prop)
    }

    #[test]
    fn empty_edges_give_zero_messages() {
        let (_, spec, ps, prop) = setup();
        let mut tape = Tape::new(CheckMode::Off);
        let g = GraphState::with_static_nodes(&mut tape, &spec, 2);
        let s = tape.constant(ArrayD::from_elem(IxDyn(&[2, 3]), 1.0));
        let st = tape.constant(ArrayD::random(IxDyn(&[2, 3, 4]), Normal::new(0.0, 1.0).unwrap()));
        let g = GraphState { strength: s, state: st, ..g };
        let (mf, mb) = prop.messages(&mut tape, &ps, &g).unwrap();
        assert!(tape.value(mf).iter().all(|&v| v.abs() < 1e-6));
        assert!(tape.value(mb).iter().all(|&v| v.abs() < 1e-6));
    }

    #[test]
    fn phantom_nodes_do_not_leak_into_messages() {
        // Two graphs identical on live nodes, different on a zero-strength
        // node's state: message aggregates must match.
        let (_, spec, ps, prop) = setup();
        let run = |phantom_state: f32| {
            let mut tape = Tape::new(CheckMode::Off);
            let g = GraphState::with_static_nodes(&mut tape, &spec, 1);
            let mut s = ArrayD::<f32>::zeros(IxDyn(&[1, 3]));
            s[[0, 0]] = 1.0;
            s[[0, 1]] = 1.0;
            let mut st = ArrayD::<f32>::zeros(IxDyn(&[1, 3, 4]));
            st.index_axis_mut(Axis(1), 0).fill(0.3);
            st.index_axis_mut(Axis(1), 1).fill(-0.2);
            st.index_axis_mut(Axis(1), 2).fill(phantom_state);
            // a real edge 0 -> 1 of type 1, and a stray edge from the phantom
            let mut e = ArrayD::<f32>::zeros(IxDyn(&[1, 3, 3, 3]));
            e.index_axis_mut(Axis(3), 0).fill(1.0);
            e[[0, 0, 1, 0]] = 0.0;
            e[[0, 0, 1, 2]] = 1.0;
            e[[0, 2, 1, 0]] = 0.0;
            e[[0, 2, 1, 1]] = 1.0;
            let g = GraphState {
                strength: tape.constant(s),
                state: tape.constant(st),
                edges: tape.constant(e),
                ..g
            };
            let (mf, mb) = prop.messages(&mut tape, &ps, &g).unwrap();
            (tape.value(mf).clone(), tape.value(mb).clone())
        };
        let (f1, b1) = run(0.9);
        let (f2, b2) = run(-0.9);
        for (a, b) in f1.iter().zip(f2.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
        for (a, b) in b1.iter().zip(b2.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn zero_node_graph_is_a_no_op() {
        let (_, spec, ps, prop) = setup();
        let mut tape = Tape::new(CheckMode::Off);
        let g = GraphState::empty(&mut tape, &spec, 2);
        let g2 = prop.run(&mut tape, &ps, g, 3).unwrap();
        assert_eq!(g2.nodes, 0);
    }

    #[test]
    fn propagation_respects_step_count() {
        let (_, spec, ps, prop) = setup();
        let mut tape = Tape::new(CheckMode::Off);
        let g = GraphState::with_static_nodes(&mut tape, &spec, 1);
        let s = tape.constant(ArrayD::random(IxDyn(&[1, 3]), Uniform::new(0.5f32, 1.0)));
        let st = tape.constant(ArrayD::random(IxDyn(&[1, 3, 4]), Normal::new(0.0, 1.0).unwrap()));
        let g = GraphState { strength: s, state: st, ..g };
        let one = prop.run(&mut tape, &ps, g, 1).unwrap();
        let two = prop.run(&mut tape, &ps, one, 1).unwrap();
        assert_ne!(tape.value(one.state), tape.value(two.state));
    }
}
