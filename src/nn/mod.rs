use std::path::Path;

use anyhow::{bail, Context, Result};
use ndarray::prelude::*;
use ndarray::IxDyn;
use ndarray_rand::RandomExt;
use rand_distr::Normal;
use serde::{Deserialize, Serialize};

pub mod adam;
pub mod gru;
pub mod layers;
pub mod ops;
pub mod tape;

pub use adam::Adam;
pub use gru::GruCell;
pub use layers::{Activation, LayerStack, Linear};
pub use tape::{Tape, Var};

/// Used to generate the initial values for the parameters of the model.
#[derive(Debug, Copy, Clone)]
pub enum Initializer {
    /// Normal distribution scaled using He scale factor.
    HeNormal,
    /// Normal distribution scaled using Glorot scale factor.
    GlorotNormal,
    /// Normal distribution with given mean and standard deviation.
    NormalScaled(f32, f32),
    /// Zeros.
    Zeros,
}

impl Initializer {
    pub fn init(self, shape: &[usize], fan_in: usize, fan_out: usize) -> ArrayD<f32> {
        let dim = IxDyn(shape);
        match self {
            Initializer::HeNormal => {
                let std = (2.0 / fan_in as f32).sqrt();
                ArrayD::random(dim, Normal::new(0.0, std).unwrap())
            }
            Initializer::GlorotNormal => {
                let std = (2.0 / (fan_in + fan_out) as f32).sqrt();
                ArrayD::random(dim, Normal::new(0.0, std).unwrap())
            }
            Initializer::NormalScaled(mean, std) => {
                ArrayD::random(dim, Normal::new(mean, std).unwrap())
            }
            Initializer::Zeros => ArrayD::zeros(dim),
        }
    }
}

/// A learned tensor and its accumulated gradient.
pub struct Param {
    pub name: String,
    pub w: ArrayD<f32>,
    pub g: ArrayD<f32>,
}

impl Param {
    pub fn new(name: String, w: ArrayD<f32>) -> Param {
        let g = ArrayD::zeros(w.raw_dim());
        Param { name, w, g }
    }
}

/// Handle into a [`ParamSet`]; stable for the lifetime of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamId(pub(crate) usize);

/// The flat collection of every learned tensor in a model. Exclusively
/// mutated by the optimizer step; serialized whole to checkpoints.
#[derive(Default)]
pub struct ParamSet {
    params: Vec<Param>,
}

impl ParamSet {
    pub fn new() -> ParamSet {
        ParamSet { params: Vec::new() }
    }

    pub fn register(&mut self, name: impl Into<String>, w: ArrayD<f32>) -> ParamId {
        let id = ParamId(self.params.len());
        self.params.push(Param::new(name.into(), w));
        id
    }

    pub fn get(&self, id: ParamId) -> &Param {
        &self.params[id.0]
    }

    pub fn get_mut(&mut self, id: ParamId) -> &mut Param {
        &mut self.params[id.0]
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Param> {
        self.params.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Param> {
        self.params.iter_mut()
    }

    pub fn zero_grads(&mut self) {
        for p in &mut self.params {
            p.g.fill(0.0);
        }
    }

    /// Global gradient L2 norm, used for clipping.
    pub fn grad_norm(&self) -> f32 {
        self.params
            .iter()
            .map(|p| p.g.iter().map(|x| x * x).sum::<f32>())
            .sum::<f32>()
            .sqrt()
    }

    pub fn scale_grads(&mut self, factor: f32) {
        for p in &mut self.params {
            p.g.mapv_inplace(|x| x * factor);
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let entries: Vec<CheckpointEntry> = self
            .params
            .iter()
            .map(|p| CheckpointEntry {
                name: p.name.clone(),
                shape: p.w.shape().to_vec(),
                data: p.w.iter().copied().collect(),
            })
            .collect();
        let text = ron::to_string(&entries).context("failed to serialize checkpoint")?;
        std::fs::write(path, text)
            .with_context(|| format!("failed to write checkpoint {}", path.display()))?;
        Ok(())
    }

    /// Loads a checkpoint into an already-constructed set. Every parameter
    /// must be present with a matching shape; anything else is fatal.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read checkpoint {}", path.display()))?;
        let entries: Vec<CheckpointEntry> = ron::from_str(&text)
            .with_context(|| format!("malformed checkpoint {}", path.display()))?;
        if entries.len() != self.params.len() {
            bail!(
                "checkpoint {} has {} parameters, model has {}",
                path.display(),
                entries.len(),
                self.params.len()
            );
        }
        for (param, entry) in self.params.iter_mut().zip(entries) {
            if param.name != entry.name {
                bail!(
                    "checkpoint parameter {} does not match model parameter {}",
                    entry.name,
                    param.name
                );
            }
            if param.w.shape() != entry.shape.as_slice() {
                bail!(
                    "checkpoint parameter {} has shape {:?}, expected {:?}",
                    entry.name,
                    entry.shape,
                    param.w.shape()
                );
            }
            param.w = ArrayD::from_shape_vec(IxDyn(&entry.shape), entry.data)
                .with_context(|| format!("checkpoint parameter {} has wrong length", entry.name))?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct CheckpointEntry {
    name: String,
    shape: Vec<usize>,
    data: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_roundtrip() {
        let mut ps = ParamSet::new();
        let a = ps.register("a", Initializer::HeNormal.init(&[3, 4], 3, 4));
        let b = ps.register("b", Initializer::Zeros.init(&[4], 4, 4));
        let dir = std::env::temp_dir().join(format!("ggtnn-ckpt-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("params.ron");
        ps.save(&path).unwrap();

        let mut other = ParamSet::new();
        let a2 = other.register("a", Initializer::Zeros.init(&[3, 4], 3, 4));
        let b2 = other.register("b", Initializer::HeNormal.init(&[4], 4, 4));
        other.load(&path).unwrap();
        assert_eq!(ps.get(a).w, other.get(a2).w);
        assert_eq!(ps.get(b).w, other.get(b2).w);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_rejects_shape_mismatch() {
        let mut ps = ParamSet::new();
        ps.register("a", Initializer::Zeros.init(&[3, 4], 3, 4));
        let dir = std::env::temp_dir().join(format!("ggtnn-ckpt2-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("params.ron");
        ps.save(&path).unwrap();

        let mut other = ParamSet::new();
        other.register("a", Initializer::Zeros.init(&[4, 3], 4, 3));
        assert!(other.load(&path).is_err());

        let mut missing = ParamSet::new();
        missing.register("a", Initializer::Zeros.init(&[3, 4], 3, 4));
        missing.register("b", Initializer::Zeros.init(&[1], 1, 1));
        assert!(missing.load(&path).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_missing_file_is_fatal() {
        let mut ps = ParamSet::new();
        ps.register("a", Initializer::Zeros.init(&[2], 2, 2));
        assert!(ps.load(Path::new("/nonexistent/params.ron")).is_err());
    }
}
