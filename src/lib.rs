use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};

pub mod configs;
pub mod datasets;
pub mod graph;
pub mod model;
pub mod nn;
pub mod train;
pub mod visualize;

/// Anything serde-serializable can round-trip through a ron config string.
pub trait Config: Send + Sync {
    fn config(&self) -> String;
    fn load_config(&mut self, config: &str) -> Result<()>;
}

impl<T: Serialize + DeserializeOwned + Send + Sync> Config for T {
    fn config(&self) -> String {
        ron::to_string(self).unwrap()
    }
    fn load_config(&mut self, config: &str) -> Result<()> {
        *self = ron::from_str(config).context(format!("Failed to load config {}", config))?;
        Ok(())
    }
}
