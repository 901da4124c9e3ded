use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("invalid instrument: {0}")]
    InvalidInstrument(String),
    #[error("unknown granularity '{0}', expected one of: 1m, 5m, 15m, 1h, 4h, 1d, 1w, 1M")]
    UnknownGranularity(String),
}
