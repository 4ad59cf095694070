use std::fmt;

use async_trait::async_trait;

#[async_trait]
pub trait PriceSource: Sync + Send {
    async fn fetch(&self, instrument: &str) -> anyhow::Result<PriceQuote>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct PriceQuote {
    pub price: f64,
    pub change: f64,
    /// Change in percent units, as displayed.
    pub percent: f64,
    /// The provider's own percent figure, used for the sign rule.
    pub percent_raw: f64,
    pub session: Option<MarketSession>,
    pub symbol: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MarketSession {
    Pre,
    Regular,
    Post,
    Other(String),
}

impl MarketSession {
    pub fn from_label(label: &str) -> MarketSession {
        match label {
            "PRE" => MarketSession::Pre,
            "REGULAR" => MarketSession::Regular,
            "POST" => MarketSession::Post,
            other => MarketSession::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for MarketSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketSession::Pre => f.write_str("PRE"),
            MarketSession::Regular => f.write_str("REGULAR"),
            MarketSession::Post => f.write_str("POST"),
            MarketSession::Other(label) => f.write_str(label),
        }
    }
}

pub const RATE_LIMITED: &str = "rate limited";

pub fn is_rate_limited(err: &anyhow::Error) -> bool {
    format!("{:#}", err).contains(RATE_LIMITED)
}
