use anyhow::Result;

use crate::configs::ModelConfig;
use crate::graph::{GraphState, GraphStateSpec};
use crate::nn::ops;
use crate::nn::{Activation, GruCell, LayerStack, ParamSet, Tape, Var};

/// Proposes graph membership changes from a sentence encoding.
///
/// Static regime: raises pre-registered candidate nodes' strengths and writes
/// their creation-time states. Dynamic regime: appends up to
/// `new_nodes_per_iter` fresh nodes per sentence, each with a predicted
/// strength, id distribution and initial state. Either way, when nodes are
/// mutable an additional gated state write updates existing nodes.
pub struct NodeProposal {
    dynamic: bool,
    mutable: bool,
    new_per_iter: usize,
    // static-regime candidate scoring over [sent, pooled, id]
    strength_stack: Option<LayerStack>,
    init_stack: Option<LayerStack>,
    // mutation write over the same features
    update_gate: Option<LayerStack>,
    update_state: Option<LayerStack>,
    // dynamic-regime candidate unroll
    cand_gru: Option<GruCell>,
    cand_strength: Option<LayerStack>,
    cand_ids: Option<LayerStack>,
    cand_init: Option<LayerStack>,
}

impl NodeProposal {
    pub fn new(ps: &mut ParamSet, cfg: &ModelConfig, spec: &GraphStateSpec) -> NodeProposal {
        let feat = cfg.input_repr_size + cfg.propose_repr_size + spec.num_node_ids;
        let hidden = [cfg.propose_repr_size];
        let (strength_stack, init_stack) = if cfg.dynamic_nodes {
            (None, None)
        } else {
            (
                Some(LayerStack::new(ps, "propose.strength", feat, &hidden, 1, Activation::Sigmoid)),
                Some(LayerStack::new(
                    ps,
                    "propose.init",
                    feat,
                    &hidden,
                    spec.node_state_width,
                    Activation::Tanh,
                )),
            )
        };
        let (update_gate, update_state) = if cfg.nodes_mutable {
            (
                Some(LayerStack::new(ps, "propose.update_gate", feat, &hidden, 1, Activation::Sigmoid)),
                Some(LayerStack::new(
                    ps,
                    "propose.update_state",
                    feat,
                    &hidden,
                    spec.node_state_width,
                    Activation::Tanh,
                )),
            )
        } else {
            (None, None)
        };
        let (cand_gru, cand_strength, cand_ids, cand_init) = if cfg.dynamic_nodes {
            let cand_in = cfg.input_repr_size + cfg.propose_repr_size;
            let w = cfg.propose_repr_size;
            (
                Some(GruCell::new(ps, "propose.cand_gru", cand_in, w)),
                Some(LayerStack::new(ps, "propose.cand_strength", w, &[], 1, Activation::Sigmoid)),
                Some(LayerStack::new(
                    ps,
                    "propose.cand_ids",
                    w,
                    &[],
                    spec.num_node_ids,
                    Activation::Softmax,
                )),
                Some(LayerStack::new(
                    ps,
                    "propose.cand_init",
                    w,
                    &[],
                    spec.node_state_width,
                    Activation::Tanh,
                )),
            )
        } else {
            (None, None, None, None)
        };
        NodeProposal {
            dynamic: cfg.dynamic_nodes,
            mutable: cfg.nodes_mutable,
            new_per_iter: cfg.new_nodes_per_iter,
            strength_stack,
            init_stack,
            update_gate,
            update_state,
            cand_gru,
            cand_strength,
            cand_ids,
            cand_init,
        }
    }

    /// Per-node features [B, N, sent + pooled + id].
    fn node_inputs(
        &self,
        tape: &mut Tape,
        graph: &GraphState,
        sentence: Var,
        pooled: Var,
    ) -> Result<Var> {
        let sent = ops::tile_new(tape, sentence, 1, graph.nodes)?;
        let pool = ops::tile_new(tape, pooled, 1, graph.nodes)?;
        ops::concat(tape, 2, &[sent, pool, graph.ids])
    }

    pub fn apply(
        &self,
        tape: &mut Tape,
        ps: &ParamSet,
        spec: &GraphStateSpec,
        graph: GraphState,
        sentence: Var,
        pooled: Var,
    ) -> Result<GraphState> {
        let graph = if self.dynamic {
            self.append_new(tape, ps, spec, graph, sentence, pooled)?
        } else {
            self.raise_static(tape, ps, graph, sentence, pooled)?
        };
        if self.mutable && graph.nodes > 0 {
            let feats = self.node_inputs(tape, &graph, sentence, pooled)?;
            let gate = self.update_gate.as_ref().unwrap().forward(tape, ps, feats)?;
            let gate = ops::reshape(tape, gate, &[graph.batch, graph.nodes])?;
            let proposal = self.update_state.as_ref().unwrap().forward(tape, ps, feats)?;
            graph.update_states(tape, proposal, gate)
        } else {
            Ok(graph)
        }
    }

    /// Static regime: strengthen candidates, write creation-time states
    /// gated by incr*(1 - old strength) so established nodes keep theirs.
    fn raise_static(
        &self,
        tape: &mut Tape,
        ps: &ParamSet,
        graph: GraphState,
        sentence: Var,
        pooled: Var,
    ) -> Result<GraphState> {
        let feats = self.node_inputs(tape, &graph, sentence, pooled)?;
        let incr = self.strength_stack.as_ref().unwrap().forward(tape, ps, feats)?;
        let incr = ops::reshape(tape, incr, &[graph.batch, graph.nodes])?;
        let init = self.init_stack.as_ref().unwrap().forward(tape, ps, feats)?;

        let fresh = ops::one_minus(tape, graph.strength)?;
        let creation_gate = ops::mul(tape, incr, fresh)?;
        let graph = graph.strengthen(tape, incr)?;
        // update_states multiplies the gate by the (now raised) strength
        graph.update_states(tape, init, creation_gate)
    }

    /// Dynamic regime: unroll the candidate GRU and append every candidate,
    /// weak ones arriving with near-zero strength.
    fn append_new(
        &self,
        tape: &mut Tape,
        ps: &ParamSet,
        spec: &GraphStateSpec,
        graph: GraphState,
        sentence: Var,
        pooled: Var,
    ) -> Result<GraphState> {
        let gru = self.cand_gru.as_ref().unwrap();
        let input = ops::concat(tape, 1, &[sentence, pooled])?;
        let mut state = gru.initial_state(tape, graph.batch);
        let mut strengths = Vec::with_capacity(self.new_per_iter);
        let mut ids = Vec::with_capacity(self.new_per_iter);
        let mut inits = Vec::with_capacity(self.new_per_iter);
        for _ in 0..self.new_per_iter {
            state = gru.step(tape, ps, input, state)?;
            strengths.push(self.cand_strength.as_ref().unwrap().forward(tape, ps, state)?);
            ids.push(self.cand_ids.as_ref().unwrap().forward(tape, ps, state)?);
            inits.push(self.cand_init.as_ref().unwrap().forward(tape, ps, state)?);
        }
        let strength = ops::concat(tape, 1, &strengths)?; // [B, K]
        let id = ops::stack_new(tape, 1, &ids)?; // [B, K, I]
        let init = ops::stack_new(tape, 1, &inits)?; // [B, K, S]
        graph.append_nodes(tape, spec, strength, id, init)
    }
}
