use anyhow::Result;

use super::ops;
use super::tape::{Tape, Var};
use super::{Linear, ParamSet};

/// Single-step gated recurrent unit. Update and reset gates are sigmoids of
/// an affine combination of input and previous state; the candidate is a
/// tanh of the input and the reset-gated state; the new state is the
/// update-gated convex combination of previous state and candidate.
///
/// Inputs are [B, input_size] / [B, state_size] (any leading shape works as
/// long as it matches between the two).
pub struct GruCell {
    update: Linear,
    reset: Linear,
    candidate: Linear,
    state_size: usize,
}

impl GruCell {
    pub fn new(ps: &mut ParamSet, name: &str, input_size: usize, state_size: usize) -> GruCell {
        let joint = input_size + state_size;
        GruCell {
            update: Linear::new(ps, &format!("{name}.update"), joint, state_size),
            reset: Linear::new(ps, &format!("{name}.reset"), joint, state_size),
            candidate: Linear::new(ps, &format!("{name}.candidate"), joint, state_size),
            state_size,
        }
    }

    pub fn state_size(&self) -> usize {
        self.state_size
    }

    /// Zero initial state for a batch.
    pub fn initial_state(&self, tape: &mut Tape, batch: usize) -> Var {
        tape.zeros(&[batch, self.state_size])
    }

    pub fn step(&self, tape: &mut Tape, ps: &ParamSet, input: Var, state: Var) -> Result<Var> {
        let last = tape.value(input).ndim() - 1;
        let joined = ops::concat(tape, last, &[input, state])?;
        let z_pre = self.update.forward(tape, ps, joined)?;
        let z = ops::sigmoid(tape, z_pre)?;
        let r_pre = self.reset.forward(tape, ps, joined)?;
        let r = ops::sigmoid(tape, r_pre)?;
        let gated_state = ops::mul(tape, r, state)?;
        let cand_in = ops::concat(tape, last, &[input, gated_state])?;
        let c_pre = self.candidate.forward(tape, ps, cand_in)?;
        let c = ops::tanh(tape, c_pre)?;
        // h' = h + z*(c - h)
        let delta = ops::sub(tape, c, state)?;
        let gated = ops::mul(tape, z, delta)?;
        ops::add(tape, state, gated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::CheckMode;
    use ndarray::IxDyn;
    use ndarray::prelude::*;
    use ndarray_rand::RandomExt;
    use rand_distr::Normal;

    #[test]
    fn step_preserves_state_shape() {
        let mut ps = ParamSet::new();
        let gru = GruCell::new(&mut ps, "gru", 4, 6);
        let mut tape = Tape::new(CheckMode::Off);
        let x = tape.constant(ArrayD::random(IxDyn(&[3, 4]), Normal::new(0.0, 1.0).unwrap()));
        let h = gru.initial_state(&mut tape, 3);
        let h1 = gru.step(&mut tape, &ps, x, h).unwrap();
        assert_eq!(tape.value(h1).shape(), &[3, 6]);
    }

    #[test]
    fn zero_input_zero_state_is_bounded() {
        // With zero bias the candidate is tanh(0) = 0, so the state stays 0.
        let mut ps = ParamSet::new();
        let gru = GruCell::new(&mut ps, "gru", 4, 6);
        let mut tape = Tape::new(CheckMode::Off);
        let x = tape.zeros(&[2, 4]);
        let h = gru.initial_state(&mut tape, 2);
        let h1 = gru.step(&mut tape, &ps, x, h).unwrap();
        assert!(tape.value(h1).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn step_is_deterministic() {
        let mut ps = ParamSet::new();
        let gru = GruCell::new(&mut ps, "gru", 4, 6);
        let input = ArrayD::random(IxDyn(&[3, 4]), Normal::new(0.0, 1.0).unwrap());
        let run = |ps: &ParamSet| {
            let mut tape = Tape::new(CheckMode::Off);
            let x = tape.constant(input.clone());
            let h = gru.initial_state(&mut tape, 3);
            let h1 = gru.step(&mut tape, ps, x, h).unwrap();
            tape.value(h1).clone()
        };
        assert_eq!(run(&ps), run(&ps));
    }
}
