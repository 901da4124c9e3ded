//! Provider session messages
//!
//! Every non-heartbeat payload is a JSON object `{"m": method, "p": [params]}`.
//! The server hello is the exception: it has no `m` and carries a
//! `session_id`.

use chrono::{DateTime, Utc};
use quotebar_schema::{InstrumentKey, Quote};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WebSocketError;

pub const HEARTBEAT_PREFIX: &str = "~h~";

const SESSION_PREFIX: &str = "qs_";
const SESSION_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SESSION_SUFFIX_LEN: usize = 12;

pub fn is_heartbeat(payload: &str) -> bool {
    payload.starts_with(HEARTBEAT_PREFIX)
}

/// Fresh quote session id: `qs_` followed by 12 chars of `[a-z0-9]`.
pub fn generate_session_id() -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..SESSION_SUFFIX_LEN)
        .map(|_| SESSION_CHARSET[rng.random_range(0..SESSION_CHARSET.len())] as char)
        .collect();
    format!("{SESSION_PREFIX}{suffix}")
}

#[derive(Debug, Serialize)]
struct Command<'a> {
    m: &'a str,
    p: Vec<Value>,
}

fn command(method: &str, params: Vec<Value>) -> Result<String, WebSocketError> {
    Ok(serde_json::to_string(&Command { m: method, p: params })?)
}

pub fn set_auth_token(token: &str) -> Result<String, WebSocketError> {
    command("set_auth_token", vec![Value::from(token)])
}

pub fn quote_create_session(session: &str) -> Result<String, WebSocketError> {
    command("quote_create_session", vec![Value::from(session)])
}

pub fn quote_set_fields(session: &str, fields: &[String]) -> Result<String, WebSocketError> {
    let mut params = vec![Value::from(session)];
    params.extend(fields.iter().map(|f| Value::from(f.as_str())));
    command("quote_set_fields", params)
}

pub fn quote_add_symbols(session: &str, instrument: &InstrumentKey) -> Result<String, WebSocketError> {
    command(
        "quote_add_symbols",
        vec![Value::from(session), Value::from(instrument.wire_name())],
    )
}

pub fn quote_remove_symbols(
    session: &str,
    instrument: &InstrumentKey,
) -> Result<String, WebSocketError> {
    command(
        "quote_remove_symbols",
        vec![Value::from(session), Value::from(instrument.wire_name())],
    )
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    m: Option<String>,
    #[serde(default)]
    p: Vec<Value>,
    session_id: Option<String>,
}

/// Field values of a `qsd` update. Every field is optional; the provider
/// only sends what changed.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QuoteValues {
    pub lp: Option<f64>,
    pub volume: Option<f64>,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub ch: Option<f64>,
    pub chp: Option<f64>,
    pub open_price: Option<f64>,
    pub high_price: Option<f64>,
    pub low_price: Option<f64>,
    pub prev_close_price: Option<f64>,
    /// Epoch seconds of the last trade
    pub lp_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QuoteData {
    /// Provider symbol, `EXCHANGE:SYMBOL`
    pub n: String,
    #[serde(default)]
    pub s: Option<String>,
    #[serde(default)]
    pub v: QuoteValues,
}

impl QuoteData {
    /// Quote for this update, or `None` for partial updates without a
    /// last price or with an unparseable symbol.
    pub fn to_quote(&self, received_at: DateTime<Utc>) -> Option<Quote> {
        let last_price = self.v.lp?;
        let instrument: InstrumentKey = self.n.parse().ok()?;
        let timestamp = self
            .v
            .lp_time
            .and_then(|secs| DateTime::from_timestamp(secs.trunc() as i64, 0))
            .unwrap_or(received_at);

        Some(Quote {
            instrument,
            timestamp,
            last_price,
            bid: self.v.bid,
            ask: self.v.ask,
            volume: self.v.volume,
            change: self.v.ch,
            change_percent: self.v.chp,
            open_price: self.v.open_price,
            high_price: self.v.high_price,
            low_price: self.v.low_price,
            prev_close: self.v.prev_close_price,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderMessage {
    Heartbeat(String),
    Hello { session_id: String },
    QuoteData { session: String, data: QuoteData },
    QuoteCompleted { session: String, symbol: Option<String> },
    /// `critical_error` / `protocol_error`
    Error { method: String, params: Vec<Value> },
    Other { method: String },
}

impl ProviderMessage {
    pub fn parse(payload: &str) -> Result<Self, WebSocketError> {
        if is_heartbeat(payload) {
            return Ok(Self::Heartbeat(payload.to_string()));
        }

        let raw: RawMessage = serde_json::from_str(payload)?;
        let Some(method) = raw.m else {
            return match raw.session_id {
                Some(session_id) => Ok(Self::Hello { session_id }),
                None => Err(WebSocketError::Connection(format!(
                    "payload without method: {}",
                    payload.chars().take(64).collect::<String>()
                ))),
            };
        };

        let mut params = raw.p.into_iter();
        match method.as_str() {
            "qsd" => {
                let session = session_param(params.next());
                let data_value = params.next().unwrap_or(Value::Null);
                let data = serde_json::from_value(data_value)?;
                Ok(Self::QuoteData { session, data })
            }
            "quote_completed" => Ok(Self::QuoteCompleted {
                session: session_param(params.next()),
                symbol: params.next().and_then(|v| v.as_str().map(str::to_string)),
            }),
            "critical_error" | "protocol_error" => Ok(Self::Error {
                method,
                params: params.collect(),
            }),
            _ => Ok(Self::Other { method }),
        }
    }
}

fn session_param(value: Option<Value>) -> String {
    value
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_session_id_shape() {
        let sid = generate_session_id();
        assert_eq!(sid.len(), 15);
        assert!(sid.starts_with("qs_"));
        assert!(sid[3..].bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
        assert_ne!(sid, generate_session_id());
    }

    #[test]
    fn test_outbound_commands() {
        let key = InstrumentKey::new("nasdaq", "aapl").unwrap();
        assert_eq!(
            quote_add_symbols("qs_abc", &key).unwrap(),
            r#"{"m":"quote_add_symbols","p":["qs_abc","NASDAQ:AAPL"]}"#
        );
        assert_eq!(
            quote_remove_symbols("qs_abc", &key).unwrap(),
            r#"{"m":"quote_remove_symbols","p":["qs_abc","NASDAQ:AAPL"]}"#
        );
        assert_eq!(
            quote_set_fields("qs_abc", &["lp".to_string(), "volume".to_string()]).unwrap(),
            r#"{"m":"quote_set_fields","p":["qs_abc","lp","volume"]}"#
        );
        assert_eq!(
            set_auth_token("tok").unwrap(),
            r#"{"m":"set_auth_token","p":["tok"]}"#
        );
    }

    #[test]
    fn test_parse_qsd() {
        let payload = r#"{"m":"qsd","p":["qs_abc",{"n":"NASDAQ:AAPL","s":"ok","v":{"lp":189.5,"volume":1200,"lp_time":1704207605}}]}"#;
        let msg = ProviderMessage::parse(payload).unwrap();
        let ProviderMessage::QuoteData { session, data } = msg else {
            panic!("expected quote data");
        };
        assert_eq!(session, "qs_abc");

        let fallback = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let quote = data.to_quote(fallback).unwrap();
        assert_eq!(quote.instrument.wire_name(), "NASDAQ:AAPL");
        assert_eq!(quote.last_price, 189.5);
        assert_eq!(quote.volume, Some(1200.0));
        assert_eq!(quote.timestamp, Utc.with_ymd_and_hms(2024, 1, 2, 15, 0, 5).unwrap());
    }

    #[test]
    fn test_qsd_without_last_price_is_not_a_quote() {
        let payload = r#"{"m":"qsd","p":["qs_abc",{"n":"NASDAQ:AAPL","s":"ok","v":{"bid":189.4}}]}"#;
        let ProviderMessage::QuoteData { data, .. } = ProviderMessage::parse(payload).unwrap() else {
            panic!("expected quote data");
        };
        assert!(data.to_quote(Utc::now()).is_none());
    }

    #[test]
    fn test_missing_lp_time_uses_arrival_time() {
        let data = QuoteData {
            n: "BINANCE:BTCUSDT".to_string(),
            s: None,
            v: QuoteValues { lp: Some(42_000.0), ..Default::default() },
        };
        let arrival = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(data.to_quote(arrival).unwrap().timestamp, arrival);
    }

    #[test]
    fn test_parse_control_messages() {
        assert_eq!(
            ProviderMessage::parse("~h~7").unwrap(),
            ProviderMessage::Heartbeat("~h~7".to_string())
        );
        assert_eq!(
            ProviderMessage::parse(r#"{"session_id":"<0.1.2>_abc","timestamp":1}"#).unwrap(),
            ProviderMessage::Hello { session_id: "<0.1.2>_abc".to_string() }
        );
        assert!(matches!(
            ProviderMessage::parse(r#"{"m":"quote_completed","p":["qs_abc","NASDAQ:AAPL"]}"#).unwrap(),
            ProviderMessage::QuoteCompleted { symbol: Some(_), .. }
        ));
        assert!(matches!(
            ProviderMessage::parse(r#"{"m":"critical_error","p":["qs_abc","bad"]}"#).unwrap(),
            ProviderMessage::Error { .. }
        ));
        assert!(matches!(
            ProviderMessage::parse(r#"{"m":"series_loading","p":[]}"#).unwrap(),
            ProviderMessage::Other { .. }
        ));
    }

    #[test]
    fn test_malformed_payloads_are_errors() {
        assert!(ProviderMessage::parse("not json").is_err());
        assert!(ProviderMessage::parse(r#"{"p":[]}"#).is_err());
        assert!(ProviderMessage::parse(r#"{"m":"qsd","p":["qs_abc"]}"#).is_err());
    }
}
