//! Differentiable ops recorded on the [`Tape`]. Each op computes its value
//! eagerly and registers a backward closure capturing the forward-time
//! values it needs.

use anyhow::Result;
use ndarray::prelude::*;
use ndarray::{concatenate, Slice};
use smallvec::smallvec;

use super::tape::{GradList, Tape, Var};

fn reshaped(x: &ArrayD<f32>, shape: &[usize]) -> ArrayD<f32> {
    ArrayD::from_shape_vec(IxDyn(shape), x.iter().copied().collect())
        .expect("reshape changes element count")
}

fn to2(x: &ArrayD<f32>, cols: usize) -> Array2<f32> {
    let rows = if cols == 0 { 0 } else { x.len() / cols };
    Array2::from_shape_vec((rows, cols), x.iter().copied().collect())
        .expect("row-flatten changes element count")
}

pub fn add(tape: &mut Tape, a: Var, b: Var) -> Result<Var> {
    let y = tape.value(a) + tape.value(b);
    tape.push("add", y, Box::new(move |g| smallvec![(a, g.clone()), (b, g.clone())]))
}

pub fn sub(tape: &mut Tape, a: Var, b: Var) -> Result<Var> {
    let y = tape.value(a) - tape.value(b);
    tape.push("sub", y, Box::new(move |g| smallvec![(a, g.clone()), (b, -g.clone())]))
}

pub fn mul(tape: &mut Tape, a: Var, b: Var) -> Result<Var> {
    let av = tape.value(a).clone();
    let bv = tape.value(b).clone();
    let y = &av * &bv;
    tape.push("mul", y, Box::new(move |g| smallvec![(a, g * &bv), (b, g * &av)]))
}

/// y = k*x + c, elementwise.
pub fn affine(tape: &mut Tape, x: Var, k: f32, c: f32) -> Result<Var> {
    let y = tape.value(x).mapv(|v| k * v + c);
    tape.push("affine", y, Box::new(move |g| smallvec![(x, g.mapv(|v| v * k))]))
}

pub fn scale(tape: &mut Tape, x: Var, k: f32) -> Result<Var> {
    affine(tape, x, k, 0.0)
}

pub fn one_minus(tape: &mut Tape, x: Var) -> Result<Var> {
    affine(tape, x, -1.0, 1.0)
}

/// x of shape [..., H] plus a bias of shape [H].
pub fn add_bias(tape: &mut Tape, x: Var, bias: Var) -> Result<Var> {
    let y = tape.value(x) + tape.value(bias);
    let back = move |g: &ArrayD<f32>| {
        let mut gb = g.clone();
        while gb.ndim() > 1 {
            gb = gb.sum_axis(Axis(0));
        }
        smallvec![(x, g.clone()), (bias, gb)]
    };
    tape.push("add_bias", y, Box::new(back))
}

/// 2-D matrix product.
pub fn matmul(tape: &mut Tape, a: Var, b: Var) -> Result<Var> {
    let av = tape
        .value(a)
        .clone()
        .into_dimensionality::<Ix2>()
        .expect("matmul lhs must be 2-d");
    let bv = tape
        .value(b)
        .clone()
        .into_dimensionality::<Ix2>()
        .expect("matmul rhs must be 2-d");
    let y = av.dot(&bv);
    let back = move |g: &ArrayD<f32>| {
        let g2 = g.clone().into_dimensionality::<Ix2>().expect("matmul grad must be 2-d");
        let da = g2.dot(&bv.t());
        let db = av.t().dot(&g2);
        smallvec![(a, da.into_dyn()), (b, db.into_dyn())]
    };
    tape.push("matmul", y.into_dyn(), Box::new(back))
}

/// Batched matrix product over [B, ·, ·] operands with optional per-operand
/// transposition of the trailing two axes.
pub fn bmm(tape: &mut Tape, a: Var, b: Var, trans_a: bool, trans_b: bool) -> Result<Var> {
    let a3 = tape
        .value(a)
        .clone()
        .into_dimensionality::<Ix3>()
        .expect("bmm lhs must be 3-d");
    let b3 = tape
        .value(b)
        .clone()
        .into_dimensionality::<Ix3>()
        .expect("bmm rhs must be 3-d");
    let bsz = a3.shape()[0];
    let m = if trans_a { a3.shape()[2] } else { a3.shape()[1] };
    let n = if trans_b { b3.shape()[1] } else { b3.shape()[2] };
    let mut y = Array3::<f32>::zeros((bsz, m, n));
    for i in 0..bsz {
        let ai = a3.index_axis(Axis(0), i);
        let ai = if trans_a { ai.reversed_axes() } else { ai };
        let bi = b3.index_axis(Axis(0), i);
        let bi = if trans_b { bi.reversed_axes() } else { bi };
        y.index_axis_mut(Axis(0), i).assign(&ai.dot(&bi));
    }
    let back = move |g: &ArrayD<f32>| {
        let g3 = g.clone().into_dimensionality::<Ix3>().expect("bmm grad must be 3-d");
        let mut da = Array3::<f32>::zeros(a3.raw_dim());
        let mut db = Array3::<f32>::zeros(b3.raw_dim());
        for i in 0..bsz {
            let gi = g3.index_axis(Axis(0), i);
            let ai = a3.index_axis(Axis(0), i);
            let ai = if trans_a { ai.reversed_axes() } else { ai };
            let bi = b3.index_axis(Axis(0), i);
            let bi = if trans_b { bi.reversed_axes() } else { bi };
            // d(A'B') w.r.t. the transposed operands, mapped back
            let dai = gi.dot(&bi.t());
            let dbi = ai.t().dot(&gi);
            if trans_a {
                da.index_axis_mut(Axis(0), i).assign(&dai.t());
            } else {
                da.index_axis_mut(Axis(0), i).assign(&dai);
            }
            if trans_b {
                db.index_axis_mut(Axis(0), i).assign(&dbi.t());
            } else {
                db.index_axis_mut(Axis(0), i).assign(&dbi);
            }
        }
        smallvec![(a, da.into_dyn()), (b, db.into_dyn())]
    };
    tape.push("bmm", y.into_dyn(), Box::new(back))
}

pub fn sigmoid(tape: &mut Tape, x: Var) -> Result<Var> {
    let y = tape.value(x).mapv(|v| 1.0 / (1.0 + (-v).exp()));
    let yc = y.clone();
    let back = move |g: &ArrayD<f32>| {
        let d = &yc * &yc.mapv(|v| 1.0 - v);
        smallvec![(x, g * &d)]
    };
    tape.push("sigmoid", y, Box::new(back))
}

pub fn tanh(tape: &mut Tape, x: Var) -> Result<Var> {
    let y = tape.value(x).mapv(f32::tanh);
    let yc = y.clone();
    let back = move |g: &ArrayD<f32>| smallvec![(x, g * &yc.mapv(|v| 1.0 - v * v))];
    tape.push("tanh", y, Box::new(back))
}

pub fn relu(tape: &mut Tape, x: Var) -> Result<Var> {
    let xv = tape.value(x).clone();
    let y = xv.mapv(|v| v.max(0.0));
    let back = move |g: &ArrayD<f32>| {
        let mask = xv.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });
        smallvec![(x, g * &mask)]
    };
    tape.push("relu", y, Box::new(back))
}

/// Softmax over the last axis.
pub fn softmax(tape: &mut Tape, x: Var) -> Result<Var> {
    let xv = tape.value(x);
    let shape = xv.shape().to_vec();
    let h = *shape.last().expect("softmax input must have at least one axis");
    let x2 = to2(xv, h);
    let mut y2 = Array2::<f32>::zeros(x2.raw_dim());
    for (mut orow, xrow) in y2.outer_iter_mut().zip(x2.outer_iter()) {
        let mx = xrow.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let mut sum = 0.0;
        for (o, &v) in orow.iter_mut().zip(xrow.iter()) {
            *o = (v - mx).exp();
            sum += *o;
        }
        orow.mapv_inplace(|v| v / sum);
    }
    let y = reshaped(&y2.into_dyn(), &shape);
    let yc = y.clone();
    let back = move |g: &ArrayD<f32>| {
        let g2 = to2(g, h);
        let y2 = to2(&yc, h);
        let mut dx = Array2::<f32>::zeros(g2.raw_dim());
        for ((mut drow, grow), yrow) in dx.outer_iter_mut().zip(g2.outer_iter()).zip(y2.outer_iter())
        {
            let dot: f32 = grow.iter().zip(yrow.iter()).map(|(a, b)| a * b).sum();
            for ((d, &gv), &yv) in drow.iter_mut().zip(grow.iter()).zip(yrow.iter()) {
                *d = yv * (gv - dot);
            }
        }
        smallvec![(x, reshaped(&dx.into_dyn(), yc.shape()))]
    };
    tape.push("softmax", y, Box::new(back))
}

/// Log-softmax over the last axis.
pub fn log_softmax(tape: &mut Tape, x: Var) -> Result<Var> {
    let xv = tape.value(x);
    let shape = xv.shape().to_vec();
    let h = *shape.last().expect("log_softmax input must have at least one axis");
    let x2 = to2(xv, h);
    let mut y2 = Array2::<f32>::zeros(x2.raw_dim());
    for (mut orow, xrow) in y2.outer_iter_mut().zip(x2.outer_iter()) {
        let mx = xrow.fold(f32::NEG_INFINITY, |a, &b| a.max(b));
        let lse = xrow.iter().map(|&v| (v - mx).exp()).sum::<f32>().ln() + mx;
        for (o, &v) in orow.iter_mut().zip(xrow.iter()) {
            *o = v - lse;
        }
    }
    let y = reshaped(&y2.into_dyn(), &shape);
    let yc = y.clone();
    let back = move |g: &ArrayD<f32>| {
        let g2 = to2(g, h);
        let y2 = to2(&yc, h);
        let mut dx = Array2::<f32>::zeros(g2.raw_dim());
        for ((mut drow, grow), yrow) in dx.outer_iter_mut().zip(g2.outer_iter()).zip(y2.outer_iter())
        {
            let gsum: f32 = grow.iter().sum();
            for ((d, &gv), &yv) in drow.iter_mut().zip(grow.iter()).zip(yrow.iter()) {
                *d = gv - yv.exp() * gsum;
            }
        }
        smallvec![(x, reshaped(&dx.into_dyn(), yc.shape()))]
    };
    tape.push("log_softmax", y, Box::new(back))
}

/// Sums out one axis.
pub fn sum_axis(tape: &mut Tape, x: Var, axis: usize) -> Result<Var> {
    let xv = tape.value(x);
    let xdim = xv.raw_dim();
    let y = xv.sum_axis(Axis(axis));
    let back = move |g: &ArrayD<f32>| {
        let gexp = g.clone().insert_axis(Axis(axis));
        let gb = gexp.broadcast(xdim.clone()).expect("sum_axis grad broadcast").to_owned();
        smallvec![(x, gb)]
    };
    tape.push("sum_axis", y, Box::new(back))
}

pub fn sum_all(tape: &mut Tape, x: Var) -> Result<Var> {
    let xv = tape.value(x);
    let xdim = xv.raw_dim();
    let y = ArrayD::from_elem(IxDyn(&[]), xv.sum());
    let back = move |g: &ArrayD<f32>| {
        let gv = g.iter().next().copied().unwrap_or(0.0);
        smallvec![(x, ArrayD::from_elem(xdim.clone(), gv))]
    };
    tape.push("sum_all", y, Box::new(back))
}

pub fn mean_all(tape: &mut Tape, x: Var) -> Result<Var> {
    let n = tape.value(x).len().max(1) as f32;
    let s = sum_all(tape, x)?;
    scale(tape, s, 1.0 / n)
}

pub fn reshape(tape: &mut Tape, x: Var, shape: &[usize]) -> Result<Var> {
    let orig = tape.value(x).shape().to_vec();
    let y = reshaped(tape.value(x), shape);
    let back = move |g: &ArrayD<f32>| smallvec![(x, reshaped(g, &orig))];
    tape.push("reshape", y, Box::new(back))
}

/// Concatenates along an existing axis.
pub fn concat(tape: &mut Tape, axis: usize, parts: &[Var]) -> Result<Var> {
    let views: Vec<_> = parts.iter().map(|&p| tape.value(p).view()).collect();
    let y = concatenate(Axis(axis), &views)?;
    let lens: Vec<usize> = parts.iter().map(|&p| tape.value(p).shape()[axis]).collect();
    let parts = parts.to_vec();
    let back = move |g: &ArrayD<f32>| {
        let mut out = GradList::new();
        let mut off = 0;
        for (&p, &len) in parts.iter().zip(lens.iter()) {
            let part = g
                .slice_axis(Axis(axis), Slice::from(off..off + len))
                .to_owned();
            out.push((p, part));
            off += len;
        }
        out
    };
    tape.push("concat", y, Box::new(back))
}

/// Stacks along a fresh axis.
pub fn stack_new(tape: &mut Tape, axis: usize, parts: &[Var]) -> Result<Var> {
    let expanded: Vec<ArrayD<f32>> = parts
        .iter()
        .map(|&p| tape.value(p).clone().insert_axis(Axis(axis)))
        .collect();
    let views: Vec<_> = expanded.iter().map(|a| a.view()).collect();
    let y = concatenate(Axis(axis), &views)?;
    let parts = parts.to_vec();
    let back = move |g: &ArrayD<f32>| {
        parts
            .iter()
            .enumerate()
            .map(|(i, &p)| (p, g.index_axis(Axis(axis), i).to_owned()))
            .collect()
    };
    tape.push("stack", y, Box::new(back))
}

/// Broadcasts x along a fresh axis of length n.
pub fn tile_new(tape: &mut Tape, x: Var, axis: usize, n: usize) -> Result<Var> {
    let xv = tape.value(x);
    let mut shape = xv.shape().to_vec();
    shape.insert(axis, n);
    let y = xv
        .clone()
        .insert_axis(Axis(axis))
        .broadcast(IxDyn(&shape))
        .expect("tile broadcast")
        .to_owned();
    let back = move |g: &ArrayD<f32>| smallvec![(x, g.sum_axis(Axis(axis)))];
    tape.push("tile", y, Box::new(back))
}

/// Grows an axis by appending `after` zero slots.
pub fn pad_zeros(tape: &mut Tape, x: Var, axis: usize, after: usize) -> Result<Var> {
    let xv = tape.value(x);
    let orig = xv.shape()[axis];
    let mut shape = xv.shape().to_vec();
    shape[axis] += after;
    let mut y = ArrayD::<f32>::zeros(IxDyn(&shape));
    if orig > 0 {
        y.slice_axis_mut(Axis(axis), Slice::from(0..orig)).assign(xv);
    }
    let back = move |g: &ArrayD<f32>| {
        smallvec![(x, g.slice_axis(Axis(axis), Slice::from(0..orig)).to_owned())]
    };
    tape.push("pad_zeros", y, Box::new(back))
}

pub fn slice_axis(tape: &mut Tape, x: Var, axis: usize, start: usize, end: usize) -> Result<Var> {
    let xv = tape.value(x);
    let xdim = xv.raw_dim();
    let y = xv.slice_axis(Axis(axis), Slice::from(start..end)).to_owned();
    let back = move |g: &ArrayD<f32>| {
        let mut dx = ArrayD::<f32>::zeros(xdim.clone());
        dx.slice_axis_mut(Axis(axis), Slice::from(start..end)).assign(g);
        smallvec![(x, dx)]
    };
    tape.push("slice_axis", y, Box::new(back))
}

pub fn swap_axes(tape: &mut Tape, x: Var, a: usize, b: usize) -> Result<Var> {
    let mut y = tape.value(x).clone();
    y.swap_axes(a, b);
    let y = y.as_standard_layout().to_owned();
    let back = move |g: &ArrayD<f32>| {
        let mut dg = g.clone();
        dg.swap_axes(a, b);
        smallvec![(x, dg.as_standard_layout().to_owned())]
    };
    tape.push("swap_axes", y, Box::new(back))
}

/// Elementwise product where `mask`'s shape is a prefix of `x`'s shape;
/// the mask broadcasts over the trailing axes. The strength-masking
/// primitive: everything a weak node touches is scaled by its strength.
pub fn mul_outer(tape: &mut Tape, x: Var, mask: Var) -> Result<Var> {
    let xv = tape.value(x).clone();
    let mv = tape.value(mask).clone();
    debug_assert!(xv.shape().starts_with(mv.shape()), "mask must be a shape prefix");
    let mdims = mv.ndim();
    let mut mshape = mv.shape().to_vec();
    while mshape.len() < xv.ndim() {
        mshape.push(1);
    }
    let mb = reshaped(&mv, &mshape)
        .broadcast(xv.raw_dim())
        .expect("mask broadcast")
        .to_owned();
    let y = &xv * &mb;
    let back = move |g: &ArrayD<f32>| {
        let dx = g * &mb;
        let mut dm = g * &xv;
        while dm.ndim() > mdims {
            dm = dm.sum_axis(Axis(dm.ndim() - 1));
        }
        smallvec![(x, dx), (mask, dm)]
    };
    tape.push("mul_outer", y, Box::new(back))
}

/// ln(x + eps), safe near zero for strengths and probabilities.
pub fn log_eps(tape: &mut Tape, x: Var, eps: f32) -> Result<Var> {
    let xv = tape.value(x).clone();
    let y = xv.mapv(|v| (v + eps).ln());
    let back = move |g: &ArrayD<f32>| smallvec![(x, g / &xv.mapv(|v| v + eps))];
    tape.push("log", y, Box::new(back))
}

pub const LOG_EPS: f32 = 1e-6;

/// Mean (over the leading batch axis) cross-entropy between a probability
/// tensor and a same-shaped target tensor.
pub fn cross_entropy(tape: &mut Tape, probs: Var, target: Var) -> Result<Var> {
    let batch = tape.value(probs).shape().first().copied().unwrap_or(1).max(1);
    let lp = log_eps(tape, probs, LOG_EPS)?;
    let m = mul(tape, lp, target)?;
    let s = sum_all(tape, m)?;
    scale(tape, s, -1.0 / batch as f32)
}

/// Mean (over the leading batch axis) binary cross-entropy.
pub fn binary_cross_entropy(tape: &mut Tape, pred: Var, target: Var) -> Result<Var> {
    let batch = tape.value(pred).shape().first().copied().unwrap_or(1).max(1);
    let lp = log_eps(tape, pred, LOG_EPS)?;
    let pos = mul(tape, lp, target)?;
    let not_pred = one_minus(tape, pred)?;
    let not_target = one_minus(tape, target)?;
    let lnp = log_eps(tape, not_pred, LOG_EPS)?;
    let neg = mul(tape, lnp, not_target)?;
    let both = add(tape, pos, neg)?;
    let s = sum_all(tape, both)?;
    scale(tape, s, -1.0 / batch as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::CheckMode;
    use ndarray::IxDyn;
    use ndarray_rand::RandomExt;
    use rand_distr::Normal;

    /// Finite-difference check of d(loss)/d(input) against the tape, where
    /// `build` maps the input var to a scalar loss var.
    fn check_grad(build: impl Fn(&mut Tape, Var) -> Var, x: ArrayD<f32>) {
        let mut tape = Tape::new(CheckMode::Off);
        let v = tape.constant(x.clone());
        let loss = build(&mut tape, v);
        assert_eq!(tape.value(loss).ndim(), 0, "loss must be scalar");
        tape.backward(loss).unwrap();
        let analytic = tape.grad(v).unwrap().clone();

        let eval = |xx: &ArrayD<f32>| -> f32 {
            let mut t = Tape::new(CheckMode::Off);
            let v = t.constant(xx.clone());
            let l = build(&mut t, v);
            t.value(l).iter().next().copied().unwrap()
        };

        let eps = 1e-2f32;
        let mut xp = x.clone();
        let slice: Vec<usize> = (0..x.len()).collect();
        for i in slice {
            let flat = xp.as_slice_mut().unwrap();
            let old = flat[i];
            flat[i] = old + eps;
            let up = eval(&xp);
            xp.as_slice_mut().unwrap()[i] = old - eps;
            let down = eval(&xp);
            xp.as_slice_mut().unwrap()[i] = old;
            let numeric = (up - down) / (2.0 * eps);
            let a = analytic.as_slice().unwrap()[i];
            assert!(
                (a - numeric).abs() <= 2e-2 + 5e-2 * numeric.abs(),
                "grad mismatch at {i}: analytic {a}, numeric {numeric}"
            );
        }
    }

    fn randn(shape: &[usize]) -> ArrayD<f32> {
        ArrayD::random(IxDyn(shape), Normal::new(0.0, 1.0).unwrap())
    }

    #[test]
    fn grad_sigmoid_tanh_relu() {
        check_grad(
            |t, v| {
                let s = sigmoid(t, v).unwrap();
                sum_all(t, s).unwrap()
            },
            randn(&[6]),
        );
        check_grad(
            |t, v| {
                let s = tanh(t, v).unwrap();
                sum_all(t, s).unwrap()
            },
            randn(&[6]),
        );
        // keep relu inputs away from the kink
        let x = ArrayD::from_shape_vec(IxDyn(&[4]), vec![-1.5, -0.4, 0.7, 2.0]).unwrap();
        check_grad(
            |t, v| {
                let s = relu(t, v).unwrap();
                sum_all(t, s).unwrap()
            },
            x,
        );
    }

    #[test]
    fn grad_softmax_and_log_softmax() {
        let weight = randn(&[2, 5]);
        let w = weight.clone();
        check_grad(
            move |t, v| {
                let s = softmax(t, v).unwrap();
                let c = t.constant(w.clone());
                let m = mul(t, s, c).unwrap();
                sum_all(t, m).unwrap()
            },
            randn(&[2, 5]),
        );
        let w = weight;
        check_grad(
            move |t, v| {
                let s = log_softmax(t, v).unwrap();
                let c = t.constant(w.clone());
                let m = mul(t, s, c).unwrap();
                sum_all(t, m).unwrap()
            },
            randn(&[2, 5]),
        );
    }

    #[test]
    fn grad_matmul() {
        let b = randn(&[3, 2]);
        check_grad(
            move |t, v| {
                let c = t.constant(b.clone());
                let y = matmul(t, v, c).unwrap();
                sum_all(t, y).unwrap()
            },
            randn(&[4, 3]),
        );
    }

    #[test]
    fn grad_bmm_all_transpose_combos() {
        for (ta, tb) in [(false, false), (true, false), (false, true), (true, true)] {
            let ashape = if ta { [2, 4, 3] } else { [2, 3, 4] };
            let bshape = if tb { [2, 5, 4] } else { [2, 4, 5] };
            let b = randn(&bshape);
            check_grad(
                move |t, v| {
                    let c = t.constant(b.clone());
                    let y = bmm(t, v, c, ta, tb).unwrap();
                    sum_all(t, y).unwrap()
                },
                randn(&ashape),
            );
        }
    }

    #[test]
    fn grad_mul_outer() {
        let mask = randn(&[2, 3]);
        check_grad(
            move |t, v| {
                let m = t.constant(mask.clone());
                let y = mul_outer(t, v, m).unwrap();
                sum_all(t, y).unwrap()
            },
            randn(&[2, 3, 4]),
        );
        // gradient w.r.t. the mask itself
        let x = randn(&[2, 3, 4]);
        check_grad(
            move |t, v| {
                let xc = t.constant(x.clone());
                let y = mul_outer(t, xc, v).unwrap();
                sum_all(t, y).unwrap()
            },
            randn(&[2, 3]),
        );
    }

    #[test]
    fn grad_shape_ops() {
        check_grad(
            |t, v| {
                let r = reshape(t, v, &[6, 2]).unwrap();
                let s = slice_axis(t, r, 0, 1, 5).unwrap();
                let w = swap_axes(t, s, 0, 1).unwrap();
                let p = pad_zeros(t, w, 1, 2).unwrap();
                let q = tile_new(t, p, 0, 3).unwrap();
                let u = sum_axis(t, q, 2).unwrap();
                sum_all(t, u).unwrap()
            },
            randn(&[3, 4]),
        );
    }

    #[test]
    fn grad_concat_stack_bias() {
        let other = randn(&[2, 3]);
        let bias = randn(&[3]);
        check_grad(
            move |t, v| {
                let o = t.constant(other.clone());
                let c = concat(t, 0, &[v, o]).unwrap();
                let b = t.constant(bias.clone());
                let y = add_bias(t, c, b).unwrap();
                let st = stack_new(t, 1, &[y, y]).unwrap();
                sum_all(t, st).unwrap()
            },
            randn(&[2, 3]),
        );
    }

    #[test]
    fn grad_losses() {
        let target = {
            let mut t = ArrayD::zeros(IxDyn(&[3, 4]));
            t[[0, 1]] = 1.0;
            t[[1, 0]] = 1.0;
            t[[2, 3]] = 1.0;
            t
        };
        let tc = target.clone();
        check_grad(
            move |t, v| {
                let p = softmax(t, v).unwrap();
                let tgt = t.constant(tc.clone());
                cross_entropy(t, p, tgt).unwrap()
            },
            randn(&[3, 4]),
        );
        let tc = target;
        check_grad(
            move |t, v| {
                let p = sigmoid(t, v).unwrap();
                let tgt = t.constant(tc.clone());
                binary_cross_entropy(t, p, tgt).unwrap()
            },
            randn(&[3, 4]),
        );
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let mut t = Tape::new(CheckMode::Off);
        let v = t.constant(randn(&[4, 7]));
        let s = softmax(&mut t, v).unwrap();
        for row in to2(t.value(s), 7).outer_iter() {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn empty_inputs_are_defined() {
        let mut t = Tape::new(CheckMode::Off);
        let v = t.zeros(&[2, 0, 3]);
        let s = sum_axis(&mut t, v, 1).unwrap();
        assert_eq!(t.value(s).shape(), &[2, 3]);
        assert!(t.value(s).iter().all(|&x| x == 0.0));
        let p = pad_zeros(&mut t, v, 1, 2).unwrap();
        assert_eq!(t.value(p).shape(), &[2, 2, 3]);
    }
}
