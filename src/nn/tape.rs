use anyhow::{bail, Result};
use ndarray::prelude::*;
use smallvec::SmallVec;

use super::{ParamId, ParamSet};
use crate::configs::CheckMode;

/// Gradient contributions flowing from one tape node back to its parents.
pub type GradList = SmallVec<[(Var, ArrayD<f32>); 2]>;

type BackFn = Box<dyn Fn(&ArrayD<f32>) -> GradList>;

/// Handle to a value recorded on a [`Tape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Var(pub(crate) usize);

struct Node {
    value: ArrayD<f32>,
    grad: Option<ArrayD<f32>>,
    op: &'static str,
    back: Option<BackFn>,
    param: Option<ParamId>,
}

/// Reverse-mode tape over ndarray tensors. One tape records one forward pass;
/// backward closures capture the forward-time values they need, in the style
/// of a layer returning its own `back_fn`.
pub struct Tape {
    nodes: Vec<Node>,
    check: CheckMode,
}

impl Tape {
    pub fn new(check: CheckMode) -> Tape {
        Tape { nodes: Vec::new(), check }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn value(&self, v: Var) -> &ArrayD<f32> {
        &self.nodes[v.0].value
    }

    pub fn grad(&self, v: Var) -> Option<&ArrayD<f32>> {
        self.nodes[v.0].grad.as_ref()
    }

    /// Records a leaf with no gradient parents.
    pub fn constant(&mut self, value: ArrayD<f32>) -> Var {
        self.push_node("constant", value, None, None)
    }

    pub fn zeros(&mut self, shape: &[usize]) -> Var {
        self.constant(ArrayD::zeros(IxDyn(shape)))
    }

    pub fn ones(&mut self, shape: &[usize]) -> Var {
        self.constant(ArrayD::from_elem(IxDyn(shape), 1.0))
    }

    /// Stages a parameter's current weights onto the tape. After `backward`,
    /// `grads_into` routes the accumulated gradient back to the ParamSet.
    pub fn param(&mut self, ps: &ParamSet, id: ParamId) -> Var {
        self.push_node("param", ps.get(id).w.clone(), None, Some(id))
    }

    /// Records a non-leaf op. Fails when a check mode catches a bad value.
    pub fn push(&mut self, op: &'static str, value: ArrayD<f32>, back: BackFn) -> Result<Var> {
        match self.check {
            CheckMode::Off => {}
            CheckMode::NanCheck => check_finite(op, &value)?,
            CheckMode::Debug => {
                check_finite(op, &value)?;
                let (lo, hi) = value_range(&value);
                tracing::trace!(op, min = lo, max = hi, shape = ?value.shape(), "forward");
            }
        }
        Ok(self.push_node(op, value, Some(back), None))
    }

    fn push_node(
        &mut self,
        op: &'static str,
        value: ArrayD<f32>,
        back: Option<BackFn>,
        param: Option<ParamId>,
    ) -> Var {
        let id = Var(self.nodes.len());
        self.nodes.push(Node { value, grad: None, op, back, param });
        id
    }

    /// Seeds d(loss) = 1 and sweeps the tape in reverse. Parents always
    /// precede children, so one pass suffices.
    pub fn backward(&mut self, loss: Var) -> Result<()> {
        let seed = ArrayD::from_elem(self.nodes[loss.0].value.raw_dim(), 1.0);
        self.nodes[loss.0].grad = Some(seed);

        for i in (0..=loss.0).rev() {
            let (before, rest) = self.nodes.split_at_mut(i);
            let node = &mut rest[0];
            let grad = match node.grad.as_ref() {
                Some(g) => g,
                None => continue,
            };
            if self.check != CheckMode::Off {
                check_finite(node.op, grad)
                    .map_err(|e| e.context(format!("gradient of {}", node.op)))?;
            }
            let back = match node.back.as_ref() {
                Some(b) => b,
                None => continue,
            };
            for (parent, contrib) in back(grad) {
                debug_assert!(parent.0 < i, "tape parent recorded after child");
                let pn = &mut before[parent.0];
                match pn.grad.as_mut() {
                    Some(g) => *g += &contrib,
                    None => pn.grad = Some(contrib),
                }
            }
        }
        Ok(())
    }

    /// Accumulates gradients of staged parameters back into the set.
    pub fn grads_into(&self, ps: &mut ParamSet) {
        for node in &self.nodes {
            if let (Some(id), Some(grad)) = (node.param, node.grad.as_ref()) {
                ps.get_mut(id).g += grad;
            }
        }
    }
}

fn check_finite(op: &str, value: &ArrayD<f32>) -> Result<()> {
    if let Some(bad) = value.iter().find(|x| !x.is_finite()) {
        bail!("non-finite value {} produced by op `{}`", bad, op);
    }
    Ok(())
}

fn value_range(value: &ArrayD<f32>) -> (f32, f32) {
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for &x in value.iter() {
        lo = lo.min(x);
        hi = hi.max(x);
    }
    (lo, hi)
}
