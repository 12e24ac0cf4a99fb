use anyhow::Result;

use super::ops;
use super::tape::{Tape, Var};
use super::{Initializer, ParamId, ParamSet};

/// Affine layer, He-normal weights and zero bias. Accepts any leading shape:
/// [..., in] -> [..., out].
pub struct Linear {
    w: ParamId,
    b: ParamId,
    in_dim: usize,
    out_dim: usize,
}

impl Linear {
    pub fn new(ps: &mut ParamSet, name: &str, in_dim: usize, out_dim: usize) -> Linear {
        let w = ps.register(
            format!("{name}.w"),
            Initializer::HeNormal.init(&[in_dim, out_dim], in_dim, out_dim),
        );
        let b = ps.register(
            format!("{name}.b"),
            Initializer::Zeros.init(&[out_dim], in_dim, out_dim),
        );
        Linear { w, b, in_dim, out_dim }
    }

    pub fn forward(&self, tape: &mut Tape, ps: &ParamSet, x: Var) -> Result<Var> {
        let shape = tape.value(x).shape().to_vec();
        debug_assert_eq!(*shape.last().unwrap(), self.in_dim);
        let rows: usize = shape[..shape.len() - 1].iter().product();
        let flat = ops::reshape(tape, x, &[rows, self.in_dim])?;
        let w = tape.param(ps, self.w);
        let b = tape.param(ps, self.b);
        let y = ops::matmul(tape, flat, w)?;
        let y = ops::add_bias(tape, y, b)?;
        let mut out_shape = shape;
        *out_shape.last_mut().unwrap() = self.out_dim;
        ops::reshape(tape, y, &out_shape)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Sigmoid,
    Tanh,
    /// Over the last axis.
    Softmax,
}

impl Activation {
    fn apply(self, tape: &mut Tape, x: Var) -> Result<Var> {
        match self {
            Activation::Identity => Ok(x),
            Activation::Sigmoid => ops::sigmoid(tape, x),
            Activation::Tanh => ops::tanh(tape, x),
            Activation::Softmax => ops::softmax(tape, x),
        }
    }
}

/// Feed-forward block: hidden Linear+ReLU layers, then an output Linear with
/// a configured activation. Shape contract matches [`Linear`].
pub struct LayerStack {
    hidden: Vec<Linear>,
    out: Linear,
    activation: Activation,
}

impl LayerStack {
    pub fn new(
        ps: &mut ParamSet,
        name: &str,
        in_dim: usize,
        hidden: &[usize],
        out_dim: usize,
        activation: Activation,
    ) -> LayerStack {
        let mut layers = Vec::with_capacity(hidden.len());
        let mut prev = in_dim;
        for (i, &h) in hidden.iter().enumerate() {
            layers.push(Linear::new(ps, &format!("{name}.h{i}"), prev, h));
            prev = h;
        }
        let out = Linear::new(ps, &format!("{name}.out"), prev, out_dim);
        LayerStack { hidden: layers, out, activation }
    }

    pub fn forward(&self, tape: &mut Tape, ps: &ParamSet, x: Var) -> Result<Var> {
        let mut cur = x;
        for layer in &self.hidden {
            cur = layer.forward(tape, ps, cur)?;
            cur = ops::relu(tape, cur)?;
        }
        let y = self.out.forward(tape, ps, cur)?;
        self.activation.apply(tape, y)
    }
}
