use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};
use serde_json::Value as JsonValue;

use super::datasource::{PriceQuote, PriceSource, RATE_LIMITED};

pub struct CoinGeckoSource {
    client: Arc<Client>,
}

impl CoinGeckoSource {
    pub fn new(client: Arc<Client>) -> CoinGeckoSource {
        CoinGeckoSource { client }
    }

    async fn run_query(&self, asset: &str) -> Result<JsonValue> {
        let resp_payload = self
            .client
            .get(&format!(
                "https://api.coingecko.com/api/v3/coins/{}?localization=false&tickers=false&community_data=false&developer_data=false",
                asset
            ))
            .send()
            .await?;
        if resp_payload.status() == StatusCode::TOO_MANY_REQUESTS {
            return Err(anyhow!("CoinGecko: {} for {}", RATE_LIMITED, asset));
        }
        let response: JsonValue = resp_payload.json().await?;
        debug!("CoinGecko: {} {}", asset, response["market_data"]["current_price"]["usd"]);
        if let Some(error) = response["error"].as_str() {
            return Err(anyhow!("CoinGecko: {}", error));
        }
        if let Some(message) = response["status"]["error_message"].as_str() {
            // throttled responses sometimes come back as 200 with an error body
            if message.to_ascii_lowercase().contains("rate limit") {
                return Err(anyhow!("CoinGecko: {}: {}", RATE_LIMITED, message));
            }
            return Err(anyhow!("CoinGecko: {}", message));
        }
        Ok(response)
    }
}

pub fn parse_coin(response: &JsonValue) -> Result<PriceQuote> {
    let market_data = &response["market_data"];
    let price = market_data["current_price"]["usd"]
        .as_f64()
        .ok_or(anyhow!("Failed to parse CoinGecko response"))?;
    let change = market_data["price_change_24h_in_currency"]["usd"]
        .as_f64()
        .unwrap_or(0.);
    let percent = market_data["price_change_percentage_24h"]
        .as_f64()
        .unwrap_or(0.);
    Ok(PriceQuote {
        price,
        change,
        percent,
        percent_raw: percent,
        session: None,
        symbol: response["symbol"].as_str().map(str::to_owned),
    })
}

#[async_trait]
impl PriceSource for CoinGeckoSource {
    async fn fetch(&self, instrument: &str) -> Result<PriceQuote> {
        parse_coin(&self.run_query(instrument).await?)
    }
}
