//! Instrument identity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SchemaError;

/// Exchange + symbol pair, upper-cased on construction.
///
/// Used as the subscription identity, the cache key suffix and the owner
/// key for bar builders. Both parts must be non-empty. Deserialization
/// goes through [`InstrumentKey::new`] as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawInstrumentKey")]
pub struct InstrumentKey {
    exchange: String,
    symbol: String,
}

/// Wire shape of [`InstrumentKey`] before normalization.
#[derive(Deserialize)]
struct RawInstrumentKey {
    exchange: String,
    symbol: String,
}

impl TryFrom<RawInstrumentKey> for InstrumentKey {
    type Error = SchemaError;

    fn try_from(raw: RawInstrumentKey) -> Result<Self, Self::Error> {
        Self::new(&raw.exchange, &raw.symbol)
    }
}

impl InstrumentKey {
    pub fn new(exchange: &str, symbol: &str) -> Result<Self, SchemaError> {
        let exchange = exchange.trim().to_uppercase();
        let symbol = symbol.trim().to_uppercase();

        if exchange.is_empty() || symbol.is_empty() {
            return Err(SchemaError::InvalidInstrument(format!(
                "exchange and symbol must be non-empty (got '{}:{}')",
                exchange, symbol
            )));
        }
        if exchange.contains(':') {
            return Err(SchemaError::InvalidInstrument(format!(
                "exchange may not contain ':' (got '{}')",
                exchange
            )));
        }

        Ok(Self { exchange, symbol })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Provider wire form, `EXCHANGE:SYMBOL`.
    pub fn wire_name(&self) -> String {
        format!("{}:{}", self.exchange, self.symbol)
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

impl FromStr for InstrumentKey {
    type Err = SchemaError;

    /// Parses `EXCHANGE:SYMBOL`. The symbol part may itself contain ':'.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (exchange, symbol) = s.split_once(':').ok_or_else(|| {
            SchemaError::InvalidInstrument(format!("expected EXCHANGE:SYMBOL, got '{}'", s))
        })?;
        Self::new(exchange, symbol)
    }
}
