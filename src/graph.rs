//! Batched, differentiable graph state: fixed-capacity node slots with a
//! soft strength vector as the liveness flag, dense per-pair edge-category
//! tensors, and the strength-weighted operations that mutate them. A
//! pointer-style graph would break differentiability; everything here is a
//! dense tensor the tape can flow gradients through.

use anyhow::Result;
use itertools::Itertools;
use ndarray::prelude::*;
use ndarray::IxDyn;

use crate::nn::ops;
use crate::nn::{Activation, LayerStack, ParamSet, Tape, Var};

/// Immutable once the model is constructed.
#[derive(Debug, Clone, Copy)]
pub struct GraphStateSpec {
    pub num_node_ids: usize,
    pub node_state_width: usize,
    /// Real relation types; slot 0 of the stored distribution is the
    /// distinguished "no relation" category.
    pub num_edge_types: usize,
}

impl GraphStateSpec {
    /// Categories stored per ordered node pair.
    pub fn edge_cats(&self) -> usize {
        self.num_edge_types + 1
    }
}

/// One batch of graphs, all living on the tape.
///
/// `strength` is [B, N] in [0,1]; `ids` is [B, N, I]; `state` is [B, N, S];
/// `edges` is [B, N, N, E+1], a categorical distribution per ordered pair.
#[derive(Clone, Copy)]
pub struct GraphState {
    pub strength: Var,
    pub ids: Var,
    pub state: Var,
    pub edges: Var,
    pub batch: usize,
    pub nodes: usize,
}

fn no_relation_edges(batch: usize, nodes: usize, cats: usize) -> ArrayD<f32> {
    let mut e = ArrayD::<f32>::zeros(IxDyn(&[batch, nodes, nodes, cats]));
    if nodes > 0 {
        e.index_axis_mut(Axis(3), 0).fill(1.0);
    }
    e
}

impl GraphState {
    /// Dynamic regime start: no nodes at all.
    pub fn empty(tape: &mut Tape, spec: &GraphStateSpec, batch: usize) -> GraphState {
        GraphState {
            strength: tape.zeros(&[batch, 0]),
            ids: tape.zeros(&[batch, 0, spec.num_node_ids]),
            state: tape.zeros(&[batch, 0, spec.node_state_width]),
            edges: tape.zeros(&[batch, 0, 0, spec.edge_cats()]),
            batch,
            nodes: 0,
        }
    }

    /// Static regime start: one pre-registered node slot per candidate id,
    /// one-hot identity, zero strength and state, all pairs "no relation".
    pub fn with_static_nodes(tape: &mut Tape, spec: &GraphStateSpec, batch: usize) -> GraphState {
        let n = spec.num_node_ids;
        let mut ids = ArrayD::<f32>::zeros(IxDyn(&[batch, n, n]));
        for b in 0..batch {
            for i in 0..n {
                ids[[b, i, i]] = 1.0;
            }
        }
        GraphState {
            strength: tape.zeros(&[batch, n]),
            ids: tape.constant(ids),
            state: tape.zeros(&[batch, n, spec.node_state_width]),
            edges: tape.constant(no_relation_edges(batch, n, spec.edge_cats())),
            batch,
            nodes: n,
        }
    }

    /// Dynamic regime: appends `k` new node slots with the given strengths
    /// [B,k], id distributions [B,k,I] and initial states [B,k,S]. Existing
    /// node content is untouched; new pairs start at "no relation".
    pub fn append_nodes(
        &self,
        tape: &mut Tape,
        spec: &GraphStateSpec,
        strength: Var,
        ids: Var,
        state: Var,
    ) -> Result<GraphState> {
        let k = tape.value(strength).shape()[1];
        let n = self.nodes;
        let grown = n + k;
        let new_strength = ops::concat(tape, 1, &[self.strength, strength])?;
        let new_ids = ops::concat(tape, 1, &[self.ids, ids])?;
        let new_state = ops::concat(tape, 1, &[self.state, state])?;

        let padded = ops::pad_zeros(tape, self.edges, 1, k)?;
        let padded = ops::pad_zeros(tape, padded, 2, k)?;
        // fresh pairs need a valid distribution: one-hot at "no relation"
        let mut fresh = no_relation_edges(self.batch, grown, spec.edge_cats());
        if n > 0 {
            fresh
                .slice_mut(ndarray::s![.., 0..n, 0..n, ..])
                .fill(0.0);
        }
        let fresh = tape.constant(fresh);
        let new_edges = ops::add(tape, padded, fresh)?;

        Ok(GraphState {
            strength: new_strength,
            ids: new_ids,
            state: new_state,
            edges: new_edges,
            batch: self.batch,
            nodes: grown,
        })
    }

    /// Static regime: raises node strengths by the proposed increment `p`
    /// through s' = 1 - (1-s)(1-p) = s + p - s*p. Monotone in both arguments,
    /// so strengths never decrease.
    pub fn strengthen(&self, tape: &mut Tape, incr: Var) -> Result<GraphState> {
        let sum = ops::add(tape, self.strength, incr)?;
        let prod = ops::mul(tape, self.strength, incr)?;
        let strength = ops::sub(tape, sum, prod)?;
        Ok(GraphState { strength, ..*self })
    }

    /// Gated state update: h' = h + (gate * strength) ⊙ (proposal - h).
    /// The strength factor keeps phantom nodes inert.
    pub fn update_states(&self, tape: &mut Tape, proposal: Var, gate: Var) -> Result<GraphState> {
        let g = ops::mul(tape, gate, self.strength)?;
        let delta = ops::sub(tape, proposal, self.state)?;
        let gated = ops::mul_outer(tape, delta, g)?;
        let state = ops::add(tape, self.state, gated)?;
        Ok(GraphState { state, ..*self })
    }

    /// Gated edge update toward a proposed per-pair category distribution,
    /// with the gate additionally masked by both endpoint strengths.
    pub fn update_edges(&self, tape: &mut Tape, proposal: Var, gate: Var) -> Result<GraphState> {
        let si = ops::tile_new(tape, self.strength, 2, self.nodes)?; // [B,N(i),N(j)] from s_i
        let sj = ops::tile_new(tape, self.strength, 1, self.nodes)?; // broadcast over i
        let pair = ops::mul(tape, si, sj)?;
        let g = ops::mul(tape, gate, pair)?;
        let delta = ops::sub(tape, proposal, self.edges)?;
        let gated = ops::mul_outer(tape, delta, g)?;
        let edges = ops::add(tape, self.edges, gated)?;
        Ok(GraphState { edges, ..*self })
    }

    /// Zeroes every node state, keeping strengths, ids and edges.
    pub fn wipe_state(&self, tape: &mut Tape, spec: &GraphStateSpec) -> GraphState {
        let state = tape.zeros(&[self.batch, self.nodes, spec.node_state_width]);
        GraphState { state, ..*self }
    }

    /// Per-node feature vector [ids, state]: the identity embedding
    /// participates as a fixed, non-decaying component.
    pub fn node_features(&self, tape: &mut Tape) -> Result<Var> {
        ops::concat(tape, 2, &[self.ids, self.state])
    }

    /// Per ordered pair, 1 - P(no relation): [B, N, N].
    pub fn edge_strength(&self, tape: &mut Tape) -> Result<Var> {
        let none = ops::slice_axis(tape, self.edges, 3, 0, 1)?;
        let none = ops::reshape(tape, none, &[self.batch, self.nodes, self.nodes])?;
        ops::one_minus(tape, none)
    }

    /// Strength-weighted match score [B] between this graph's node identities
    /// and a ground-truth focus id one-hot [B, I]. With `best_only`, the
    /// arg-max node (chosen at forward time) contributes alone; otherwise the
    /// full sum does.
    pub fn best_match(&self, tape: &mut Tape, target: Var, best_only: bool) -> Result<Var> {
        if self.nodes == 0 {
            return Ok(tape.zeros(&[self.batch]));
        }
        let tgt = ops::tile_new(tape, target, 1, self.nodes)?; // [B,N,I]
        let overlap = ops::mul(tape, self.ids, tgt)?;
        let per_node = ops::sum_axis(tape, overlap, 2)?; // [B,N]
        let scores = ops::mul(tape, per_node, self.strength)?;
        if !best_only {
            return ops::sum_axis(tape, scores, 1);
        }
        let vals = tape.value(scores).clone().into_dimensionality::<Ix2>()?;
        let mut mask = Array2::<f32>::zeros(vals.raw_dim());
        for (b, row) in vals.outer_iter().enumerate() {
            let best = row.iter().position_max_by(|a, b| a.total_cmp(b)).unwrap_or(0);
            mask[[b, best]] = 1.0;
        }
        let mask = tape.constant(mask.into_dyn());
        let picked = ops::mul(tape, scores, mask)?;
        ops::sum_axis(tape, picked, 1)
    }
}

/// Gated graph readout: pooled = Σ_n s_n · σ(gate(x_n)) ⊙ tanh(head(x_n))
/// over x_n = [ids, state].
pub struct GraphReadout {
    gate: LayerStack,
    head: LayerStack,
    width: usize,
}

impl GraphReadout {
    pub fn new(ps: &mut ParamSet, name: &str, spec: &GraphStateSpec, width: usize) -> GraphReadout {
        let feat = spec.num_node_ids + spec.node_state_width;
        GraphReadout {
            gate: LayerStack::new(ps, &format!("{name}.gate"), feat, &[], width, Activation::Sigmoid),
            head: LayerStack::new(ps, &format!("{name}.head"), feat, &[], width, Activation::Tanh),
            width,
        }
    }

    pub fn forward(&self, tape: &mut Tape, ps: &ParamSet, graph: &GraphState) -> Result<Var> {
        if graph.nodes == 0 {
            return Ok(tape.zeros(&[graph.batch, self.width]));
        }
        let x = graph.node_features(tape)?;
        let gate = self.gate.forward(tape, ps, x)?;
        let head = self.head.forward(tape, ps, x)?;
        let per_node = ops::mul(tape, gate, head)?;
        let masked = ops::mul_outer(tape, per_node, graph.strength)?;
        ops::sum_axis(tape, masked, 1)
    }
}
