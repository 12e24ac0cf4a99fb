use anyhow::Result;
use itertools::Itertools;
use ndarray::prelude::*;

use crate::configs::{ModelConfig, OutputFormat};
use crate::graph::{GraphState, GraphStateSpec};
use crate::nn::ops;
use crate::nn::{Activation, GruCell, LayerStack, ParamSet, Tape, Var};

/// A deterministically collapsed answer, one entry per batch element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapped {
    Word(Vec<usize>),
    Sequence(Vec<Vec<usize>>),
    Node(Vec<usize>),
}

/// Decodes a graph state (and its pooled representation) into an answer
/// distribution. One capability, three implementations, selected at model
/// construction.
pub enum Decoder {
    /// Feed-forward classifier over the pooled vector: [B, W].
    SingleWord { stack: LayerStack },
    /// GRU unrolled for a fixed number of steps, pooled vector as the input
    /// at every step, shared per-step classifier: [B, L, W].
    Sequence { gru: GruCell, classify: LayerStack, seq_len: usize },
    /// Per-node score over [state, ids], dead nodes pushed down by
    /// log(strength): [B, N].
    NodeSelection { score: LayerStack },
}

impl Decoder {
    pub fn new(ps: &mut ParamSet, cfg: &ModelConfig, spec: &GraphStateSpec) -> Decoder {
        let repr = cfg.output_repr_size;
        match cfg.output_format {
            OutputFormat::SingleWord => Decoder::SingleWord {
                stack: LayerStack::new(
                    ps,
                    "output.word",
                    repr,
                    &[repr],
                    cfg.num_output_words,
                    Activation::Softmax,
                ),
            },
            OutputFormat::Sequence => Decoder::Sequence {
                gru: GruCell::new(ps, "output.seq_gru", repr, repr),
                classify: LayerStack::new(
                    ps,
                    "output.seq_classify",
                    repr,
                    &[],
                    cfg.num_output_words,
                    Activation::Softmax,
                ),
                seq_len: cfg.answer_seq_len,
            },
            OutputFormat::NodeSelection => Decoder::NodeSelection {
                score: LayerStack::new(
                    ps,
                    "output.node_score",
                    spec.num_node_ids + spec.node_state_width,
                    &[repr],
                    1,
                    Activation::Identity,
                ),
            },
        }
    }

    /// Produces the answer distribution(s) for a batch.
    pub fn decode(
        &self,
        tape: &mut Tape,
        ps: &ParamSet,
        graph: &GraphState,
        pooled: Var,
    ) -> Result<Var> {
        match self {
            Decoder::SingleWord { stack } => stack.forward(tape, ps, pooled),
            Decoder::Sequence { gru, classify, seq_len } => {
                let batch = tape.value(pooled).shape()[0];
                let mut state = gru.initial_state(tape, batch);
                let mut states = Vec::with_capacity(*seq_len);
                for _ in 0..*seq_len {
                    state = gru.step(tape, ps, pooled, state)?;
                    states.push(state);
                }
                // step-major stack, squashed for the shared classifier, then
                // back to batch-major
                let all = ops::stack_new(tape, 0, &states)?; // [L,B,S]
                let repr = gru.state_size();
                let flat = ops::reshape(tape, all, &[*seq_len * batch, repr])?;
                let dists = classify.forward(tape, ps, flat)?;
                let w = tape.value(dists).shape()[1];
                let dists = ops::reshape(tape, dists, &[*seq_len, batch, w])?;
                ops::swap_axes(tape, dists, 0, 1) // [B,L,W]
            }
            Decoder::NodeSelection { score } => {
                let x = graph.node_features(tape)?;
                let s = score.forward(tape, ps, x)?; // [B,N,1]
                let s = ops::reshape(tape, s, &[graph.batch, graph.nodes])?;
                let live = ops::log_eps(tape, graph.strength, ops::LOG_EPS)?;
                let logits = ops::add(tape, s, live)?;
                ops::softmax(tape, logits)
            }
        }
    }

    /// Collapses a decoded distribution to the arg-max choice. Evaluation
    /// and visualization only; never on the tape.
    pub fn snap_to_best(&self, answer: &ArrayD<f32>) -> Snapped {
        match self {
            Decoder::SingleWord { .. } | Decoder::NodeSelection { .. } => {
                let a = answer.view().into_dimensionality::<Ix2>().expect("answer must be [B, k]");
                let picks = a.outer_iter().map(argmax).collect();
                match self {
                    Decoder::SingleWord { .. } => Snapped::Word(picks),
                    _ => Snapped::Node(picks),
                }
            }
            Decoder::Sequence { .. } => {
                let a = answer.view().into_dimensionality::<Ix3>().expect("answer must be [B, L, W]");
                let seqs = a
                    .outer_iter()
                    .map(|story| story.outer_iter().map(argmax).collect())
                    .collect();
                Snapped::Sequence(seqs)
            }
        }
    }
}

fn argmax(row: ArrayView1<f32>) -> usize {
    row.iter().position_max_by(|a, b| a.total_cmp(b)).unwrap_or(0)
}
