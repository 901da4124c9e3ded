use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid symbol {symbol:?}: {reason}")]
    InvalidSymbol { symbol: String, reason: String },
    #[error("{backend} backend selected but {setting} is not set")]
    MissingSetting {
        backend: &'static str,
        setting: &'static str,
    },
    #[error("invalid config: {0}")]
    Validation(String),
}
