mod cache;
mod coingecko;
mod datasource;
mod exchange;
mod twelvedata;
mod yahoo;

pub use cache::{CachedSource, PriceCache, DEFAULT_TTL};
pub use coingecko::CoinGeckoSource;
#[cfg(test)]
pub use datasource::MarketSession;
pub use datasource::{is_rate_limited, PriceQuote, PriceSource, RATE_LIMITED};
pub use exchange::{exchange_multiplier, RateSource, YahooRateSource};
pub use twelvedata::TwelveDataSource;
pub use yahoo::YahooQuoteSource;
