use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};
use serde_json::Value as JsonValue;

use super::datasource::{MarketSession, PriceQuote, PriceSource, RATE_LIMITED};

pub struct YahooQuoteSource {
    client: Arc<Client>,
}

impl YahooQuoteSource {
    pub fn new(client: Arc<Client>) -> YahooQuoteSource {
        YahooQuoteSource { client }
    }

    async fn run_query(&self, symbol: &str) -> Result<JsonValue> {
        let resp_payload = self
            .client
            .get(&format!(
                "https://query2.finance.yahoo.com/v10/finance/quoteSummary/{}?modules=price",
                symbol
            ))
            .send()
            .await?;
        if resp_payload.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(anyhow!("Yahoo: {} for {}", RATE_LIMITED, symbol));
        }
        let response: JsonValue = resp_payload.json().await?;
        debug!("Yahoo: {} {}", symbol, response);
        if !response["quoteSummary"]["error"].is_null() {
            return Err(anyhow!(
                "Yahoo: {}",
                response["quoteSummary"]["error"]["description"]
            ));
        }
        Ok(response)
    }
}

fn raw(price: &JsonValue, field: &str) -> Result<f64> {
    price[field]["raw"]
        .as_f64()
        .ok_or(anyhow!("Failed to parse Yahoo response: missing {}", field))
}

/// Picks post-market, pre-market or regular-session figures according to the
/// session the provider reports. Indices, funds and FX report an extended
/// session with empty change objects; those read as no change.
pub fn parse_quote_summary(response: &JsonValue) -> Result<PriceQuote> {
    let price = &response["quoteSummary"]["result"][0]["price"];
    if price.is_null() {
        return Err(anyhow!("Yahoo returned bad data"));
    }
    let session = price["marketState"].as_str().map(MarketSession::from_label);
    let (change_field, percent_field) = match session {
        Some(MarketSession::Post) => ("postMarketChange", "postMarketChangePercent"),
        Some(MarketSession::Pre) => ("preMarketChange", "preMarketChangePercent"),
        _ => ("regularMarketChange", "regularMarketChangePercent"),
    };
    let extended = matches!(session, Some(MarketSession::Post) | Some(MarketSession::Pre));
    let figure = |field: &str| -> Result<f64> {
        match price[field]["raw"].as_f64() {
            Some(value) => Ok(value),
            None if extended => Ok(0.),
            None => raw(price, field),
        }
    };
    let change = figure(change_field)?;
    let percent_raw = figure(percent_field)?;
    Ok(PriceQuote {
        price: raw(price, "regularMarketPrice")?,
        change,
        percent: percent_raw * 100.,
        percent_raw,
        session,
        symbol: price["symbol"].as_str().map(str::to_owned),
    })
}

#[async_trait]
impl PriceSource for YahooQuoteSource {
    async fn fetch(&self, instrument: &str) -> Result<PriceQuote> {
        parse_quote_summary(&self.run_query(instrument).await?)
    }
}
