use std::{str::FromStr, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde_json::Value as JsonValue;

use super::datasource::{PriceQuote, PriceSource, RATE_LIMITED};

pub struct TwelveDataSource {
    client: Arc<Client>,
    api_key: String,
}

impl TwelveDataSource {
    pub fn new(client: Arc<Client>, api_key: String) -> TwelveDataSource {
        TwelveDataSource { client, api_key }
    }

    async fn run_query(&self, symbol: &str, interval: &str) -> Result<JsonValue> {
        let response: JsonValue = self
            .client
            .get("https://api.twelvedata.com/time_series")
            .query(&[
                ("symbol", symbol),
                ("interval", interval),
                ("outputsize", "2"),
                ("apikey", self.api_key.as_str()),
            ])
            .send()
            .await?
            .json()
            .await?;
        debug!("Twelve Data: {} {} {}", symbol, interval, response);
        if response["status"].as_str() == Some("error") {
            if response["code"].as_i64() == Some(429) {
                return Err(anyhow!("Twelve Data: {}: {}", RATE_LIMITED, response["message"]));
            }
            return Err(anyhow!("Twelve Data: {}", response["message"]));
        }
        Ok(response)
    }
}

fn close_at(series: &JsonValue, index: usize) -> Result<f64> {
    let close = series["values"][index]["close"]
        .as_str()
        .ok_or(anyhow!("Failed to parse Twelve Data response"))?;
    Ok(f64::from_str(close)?)
}

pub fn quote_from_series(minutes: &JsonValue, days: &JsonValue) -> Result<PriceQuote> {
    let now = close_at(minutes, 0)?;
    let prev_close = close_at(days, 1)?;
    if prev_close == 0. {
        return Err(anyhow!("Twelve Data: previous close is zero"));
    }
    let change = now - prev_close;
    let percent = change / prev_close * 100.;
    Ok(PriceQuote {
        price: now,
        change,
        percent,
        percent_raw: percent,
        session: None,
        symbol: minutes["meta"]["symbol"].as_str().map(str::to_owned),
    })
}

#[async_trait]
impl PriceSource for TwelveDataSource {
    async fn fetch(&self, instrument: &str) -> Result<PriceQuote> {
        let minutes = self.run_query(instrument, "1min").await?;
        let days = self.run_query(instrument, "1day").await?;
        quote_from_series(&minutes, &days)
    }
}
