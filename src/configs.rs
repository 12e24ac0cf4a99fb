use std::path::PathBuf;

use anyhow::{bail, Result};
use derivative::Derivative;
use serde::{Deserialize, Serialize};

/// How the decoder turns a graph state into an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    /// One distribution over the answer vocabulary.
    SingleWord,
    /// A fixed-length sequence of distributions over the answer vocabulary.
    Sequence,
    /// One distribution over the graph's nodes.
    NodeSelection,
}

/// Numeric instrumentation compiled into the forward/backward passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CheckMode {
    #[default]
    Off,
    /// Scan every op output and gradient for NaN/Inf, abort with the op name.
    NanCheck,
    /// NanCheck plus per-op value-range traces.
    Debug,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
pub struct ModelConfig {
    pub num_input_words: usize,
    pub num_output_words: usize,
    pub num_node_ids: usize,
    #[derivative(Default(value = "50"))]
    pub node_state_size: usize,
    pub num_edge_types: usize,
    #[derivative(Default(value = "100"))]
    pub input_repr_size: usize,
    #[derivative(Default(value = "100"))]
    pub output_repr_size: usize,
    #[derivative(Default(value = "50"))]
    pub propose_repr_size: usize,
    #[derivative(Default(value = "50"))]
    pub propagate_repr_size: usize,
    #[derivative(Default(value = "2"))]
    pub new_nodes_per_iter: usize,
    #[derivative(Default(value = "OutputFormat::SingleWord"))]
    pub output_format: OutputFormat,
    /// Fixed length of the decoded sequence (Sequence format only).
    #[derivative(Default(value = "1"))]
    pub answer_seq_len: usize,
    #[derivative(Default(value = "5"))]
    pub final_propagate: usize,
    pub dynamic_nodes: bool,
    #[derivative(Default(value = "true"))]
    pub nodes_mutable: bool,
    pub wipe_node_state: bool,
    /// 0 disables per-sentence propagation.
    pub intermediate_propagate: usize,
    #[derivative(Default(value = "true"))]
    pub best_node_match_only: bool,
    #[derivative(Default(value = "true"))]
    pub train_with_graph: bool,
    #[derivative(Default(value = "true"))]
    pub train_with_query: bool,
    pub check_mode: CheckMode,
}

impl ModelConfig {
    /// Fatal configuration errors, reported before any parameter is allocated.
    pub fn validate(&self) -> Result<()> {
        if self.num_input_words == 0 {
            bail!("num_input_words must be nonzero");
        }
        if self.num_output_words == 0 {
            bail!("num_output_words must be nonzero");
        }
        if self.num_node_ids == 0 {
            bail!("num_node_ids must be nonzero");
        }
        if self.node_state_size == 0 {
            bail!("node_state_size must be nonzero");
        }
        if self.final_propagate == 0 {
            bail!("final_propagate must be at least 1");
        }
        if self.dynamic_nodes && self.new_nodes_per_iter == 0 {
            bail!("dynamic_nodes requires new_nodes_per_iter > 0");
        }
        if !self.train_with_graph && !self.train_with_query {
            bail!("at least one of train_with_graph / train_with_query must be set");
        }
        if self.output_format == OutputFormat::Sequence && self.answer_seq_len == 0 {
            bail!("Sequence output requires answer_seq_len > 0");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
pub struct TrainConfig {
    #[derivative(Default(value = "10000"))]
    pub num_updates: usize,
    #[derivative(Default(value = "10"))]
    pub batch_size: usize,
    #[derivative(Default(value = "0.002"))]
    pub learning_rate: f32,
    /// 0 disables gradient-norm clipping.
    #[derivative(Default(value = "5.0"))]
    pub grad_clip: f32,
    #[derivative(Default(value = "500"))]
    pub checkpoint_every: usize,
    #[derivative(Default(value = "250"))]
    pub validate_every: usize,
    #[derivative(Default(value = "12345"))]
    pub seed: u64,
    pub outputdir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;

    #[test]
    fn defaults_are_valid_once_sized() {
        let cfg = ModelConfig {
            num_input_words: 10,
            num_output_words: 5,
            num_node_ids: 4,
            num_edge_types: 2,
            ..Default::default()
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn conflicting_flags_rejected() {
        let base = ModelConfig {
            num_input_words: 10,
            num_output_words: 5,
            num_node_ids: 4,
            num_edge_types: 2,
            ..Default::default()
        };

        let mut cfg = base.clone();
        cfg.dynamic_nodes = true;
        cfg.new_nodes_per_iter = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = base.clone();
        cfg.final_propagate = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = base;
        cfg.train_with_graph = false;
        cfg.train_with_query = false;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_roundtrip() {
        let cfg = ModelConfig {
            num_input_words: 10,
            num_output_words: 5,
            num_node_ids: 4,
            num_edge_types: 2,
            output_format: OutputFormat::Sequence,
            answer_seq_len: 3,
            ..Default::default()
        };
        let s = cfg.config();
        let mut other = ModelConfig::default();
        other.load_config(&s).unwrap();
        assert_eq!(other.num_node_ids, 4);
        assert_eq!(other.output_format, OutputFormat::Sequence);
    }
}
