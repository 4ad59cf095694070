use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{error, info};

#[async_trait]
pub trait RateSource: Sync + Send {
    /// Spot rate converting one unit of the base currency into `currency`.
    async fn spot_rate(&self, currency: &str) -> Result<f64>;
}

pub struct YahooRateSource {
    connector: Arc<yahoo_finance_api::YahooConnector>,
}

impl YahooRateSource {
    pub fn new(connector: Arc<yahoo_finance_api::YahooConnector>) -> YahooRateSource {
        YahooRateSource { connector }
    }
}

#[async_trait]
impl RateSource for YahooRateSource {
    async fn spot_rate(&self, currency: &str) -> Result<f64> {
        let symbol = format!("{}=X", currency.to_ascii_uppercase());
        let quote = self
            .connector
            .get_latest_quotes(&symbol, "1d")
            .await?
            .last_quote()?;
        info!("Yahoo: {} {:?}", &symbol, &quote);
        if quote.close <= 0. {
            return Err(anyhow!("Bad exchange rate for {}", currency));
        }
        Ok(quote.close)
    }
}

/// Computes the multiplier applied to every raw price for the lifetime of a
/// watcher. Never fails: an unavailable rate falls back to 1 for equities and
/// to the configured multiplier for crypto assets.
pub async fn exchange_multiplier(
    rates: &dyn RateSource,
    currency: &str,
    base_currency: &str,
    multiplier: u32,
    crypto: bool,
) -> f64 {
    let multiplier = f64::from(multiplier);
    if currency.eq_ignore_ascii_case(base_currency) {
        return multiplier;
    }
    info!("Using {}", currency);
    match rates.spot_rate(currency).await {
        Ok(rate) => rate * multiplier,
        Err(e) => {
            error!(
                "Unable to fetch exchange rate for {}, default to {}: {}",
                currency, base_currency, e
            );
            if crypto {
                multiplier
            } else {
                1.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::testing::FakeRates;

    #[tokio::test]
    async fn same_currency_uses_multiplier_without_fetching() {
        let rates = FakeRates::new(Some(0.9));
        assert_eq!(exchange_multiplier(&rates, "usd", "USD", 3, true).await, 3.);
        assert_eq!(exchange_multiplier(&rates, "USD", "USD", 1, false).await, 1.);
        assert_eq!(rates.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn other_currency_scales_the_rate() {
        let rates = FakeRates::new(Some(0.5));
        assert_eq!(exchange_multiplier(&rates, "EUR", "USD", 4, true).await, 2.);
        assert_eq!(rates.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_lookup_falls_back() {
        let rates = FakeRates::new(None);
        assert_eq!(exchange_multiplier(&rates, "EUR", "USD", 5, false).await, 1.);
        assert_eq!(exchange_multiplier(&rates, "EUR", "USD", 5, true).await, 5.);
    }
}
