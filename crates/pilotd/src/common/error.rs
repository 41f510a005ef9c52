use thiserror::Error;

/// Errors of the typed configuration-loading surface. Collaborator-facing
/// operations use `FactoryResult` (anyhow) instead.
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<toml::de::Error> for FactoryError {
    fn from(error: toml::de::Error) -> Self {
        Self::ConfigError(error.to_string())
    }
}
