//! TOML-file configuration source.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{FactoryConfig, QueueSpec};
use crate::factory::interface::ConfigSource;
use crate::factory::FactoryResult;
use crate::Map;

/// Reads the queue set from a TOML file on every reconfiguration pass.
/// Optional global overrides (from the CLI) are applied to each spec after
/// parsing, so that overridden specs also diff consistently.
pub struct FileConfigSource {
    path: PathBuf,
    sleep_override: Option<Duration>,
    max_cycles_override: Option<u64>,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            sleep_override: None,
            max_cycles_override: None,
        }
    }

    pub fn with_sleep_override(mut self, sleep: Option<Duration>) -> Self {
        self.sleep_override = sleep;
        self
    }

    pub fn with_max_cycles_override(mut self, max_cycles: Option<u64>) -> Self {
        self.max_cycles_override = max_cycles;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parses the whole configuration file, including the `[factory]` table.
pub fn load_factory_config(path: &Path) -> crate::Result<FactoryConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: FactoryConfig = toml::from_str(&content)?;
    Ok(config)
}

impl ConfigSource for FileConfigSource {
    fn load(&self) -> FactoryResult<Map<String, QueueSpec>> {
        let config = load_factory_config(&self.path)
            .map_err(|error| anyhow::anyhow!("{}: {error}", self.path.display()))?;

        let mut specs: Map<String, QueueSpec> = Map::default();
        for mut spec in config.queues {
            if let Some(sleep) = self.sleep_override {
                spec.sleep = sleep;
            }
            if let Some(max_cycles) = self.max_cycles_override {
                spec.max_cycles = Some(max_cycles);
            }
            let name = spec.name.clone();
            if specs.insert(name.clone(), spec).is_some() {
                anyhow::bail!("Duplicate queue name `{name}` in {}", self.path.display());
            }
        }
        Ok(specs)
    }
}
