use anyhow::Result;
use ndarray::prelude::*;

use crate::nn::ops;
use crate::nn::{GruCell, Linear, ParamSet, Tape, Var};

/// Runs a GRU over a word-index sequence (presented as per-position one-hot
/// batches) and returns the final state as the sequence representation.
pub struct SequenceEncoder {
    embed: Linear,
    gru: GruCell,
}

impl SequenceEncoder {
    pub fn new(ps: &mut ParamSet, name: &str, vocab: usize, repr: usize) -> SequenceEncoder {
        SequenceEncoder {
            embed: Linear::new(ps, &format!("{name}.embed"), vocab, repr),
            gru: GruCell::new(ps, &format!("{name}.gru"), repr, repr),
        }
    }

    /// `words[t]` is the [B, vocab] one-hot batch for position t.
    pub fn encode(
        &self,
        tape: &mut Tape,
        ps: &ParamSet,
        words: &[Array2<f32>],
        batch: usize,
    ) -> Result<Var> {
        let mut state = self.gru.initial_state(tape, batch);
        for step in words {
            let x = tape.constant(step.clone().into_dyn());
            let emb = self.embed.forward(tape, ps, x)?;
            let emb = ops::tanh(tape, emb)?;
            state = self.gru.step(tape, ps, emb, state)?;
        }
        Ok(state)
    }
}
