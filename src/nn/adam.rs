use ndarray::prelude::*;

use super::ParamSet;

/// Adam with bias correction. Moment buffers are allocated lazily to match
/// the ParamSet it first steps, and are indexed by registration order.
pub struct Adam {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    t: i32,
    mt: Vec<ArrayD<f32>>,
    vt: Vec<ArrayD<f32>>,
}

impl Adam {
    pub fn new(lr: f32) -> Adam {
        Adam { lr, beta1: 0.9, beta2: 0.999, eps: 1e-8, t: 0, mt: Vec::new(), vt: Vec::new() }
    }

    /// One update from the accumulated gradients. Does not zero them.
    pub fn step(&mut self, ps: &mut ParamSet) {
        if self.mt.is_empty() {
            for p in ps.iter() {
                self.mt.push(ArrayD::zeros(p.w.raw_dim()));
                self.vt.push(ArrayD::zeros(p.w.raw_dim()));
            }
        }
        self.t += 1;
        let b1c = 1.0 - self.beta1.powi(self.t);
        let b2c = 1.0 - self.beta2.powi(self.t);
        for (i, p) in ps.iter_mut().enumerate() {
            let m = &mut self.mt[i];
            let v = &mut self.vt[i];
            azip_update(m, v, &p.g, self.beta1, self.beta2);
            for ((w, &mi), &vi) in p.w.iter_mut().zip(m.iter()).zip(v.iter()) {
                let mhat = mi / b1c;
                let vhat = vi / b2c;
                *w -= self.lr * mhat / (vhat.sqrt() + self.eps);
            }
        }
    }
}

fn azip_update(m: &mut ArrayD<f32>, v: &mut ArrayD<f32>, g: &ArrayD<f32>, b1: f32, b2: f32) {
    for ((mi, vi), &gi) in m.iter_mut().zip(v.iter_mut()).zip(g.iter()) {
        *mi = b1 * *mi + (1.0 - b1) * gi;
        *vi = b2 * *vi + (1.0 - b2) * gi * gi;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Initializer;
    use ndarray::IxDyn;

    #[test]
    fn step_descends_a_quadratic() {
        // minimize 0.5*w^2: gradient is w itself
        let mut ps = ParamSet::new();
        let id = ps.register("w", ArrayD::from_elem(IxDyn(&[3]), 2.0));
        let mut opt = Adam::new(0.1);
        for _ in 0..200 {
            ps.zero_grads();
            let w = ps.get(id).w.clone();
            ps.get_mut(id).g += &w;
            opt.step(&mut ps);
        }
        assert!(ps.get(id).w.iter().all(|&w| w.abs() < 0.1));
    }

    #[test]
    fn zero_grad_leaves_params_nearly_fixed() {
        let mut ps = ParamSet::new();
        let id = ps.register("w", Initializer::NormalScaled(0.0, 1.0).init(&[4], 4, 4));
        let before = ps.get(id).w.clone();
        let mut opt = Adam::new(0.01);
        ps.zero_grads();
        opt.step(&mut ps);
        let after = &ps.get(id).w;
        for (a, b) in before.iter().zip(after.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}
