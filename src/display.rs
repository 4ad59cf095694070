use crate::config::WatcherConfig;
use crate::datasources::PriceQuote;

pub const UP: &str = "⬈";
pub const DOWN: &str = "⬊";
pub const CENT: &str = "¢";

/// Threshold on the provider's raw percent above which a '+' is shown.
const PLUS_THRESHOLD: f64 = 0.0005;

pub fn format_price(price: f64, decimals: Option<u8>, crypto: bool) -> String {
    if let Some(decimals) = decimals {
        return format!("{:.*}", usize::from(decimals), price);
    }
    if !crypto {
        return format!("{:.2}", price);
    }
    if price < 0.01 {
        let cents = price * 100.;
        if cents < 0.00001 {
            format!("{:.8}{}", cents, CENT)
        } else {
            format!("{:.6}{}", cents, CENT)
        }
    } else if price < 1.0 {
        format!("{:.3}", price)
    } else {
        format!("{:.2}", price)
    }
}

pub fn format_change(change: f64) -> String {
    format!("{:.2}", change)
}

/// Two-decimal percent without the '%' glyph.
pub fn format_percent(percent: f64, percent_raw: f64) -> String {
    let formatted = format!("{:.2}", percent);
    if percent_raw >= PLUS_THRESHOLD {
        format!("+{}", formatted)
    } else {
        formatted
    }
}

/// Direction is read off the formatted change, so "-0.00" counts as a drop.
pub fn is_increase(change: &str) -> bool {
    !change.starts_with('-')
}

pub fn decorator(custom: &str, increase: bool) -> String {
    if !custom.is_empty() {
        custom.to_owned()
    } else if increase {
        UP.to_owned()
    } else {
        DOWN.to_owned()
    }
}

pub fn format_ratio(ratio: f64, label: &str) -> String {
    if ratio < 0.1 {
        format!("{:.4} {}", ratio, label)
    } else {
        format!("{:.2} {}", ratio, label)
    }
}

/// Ratio between the watched asset and its pair, `name/pair` unless flipped.
pub fn pair_activity(
    price: f64,
    name: &str,
    pair_price: f64,
    pair_name: &str,
    flip: bool,
) -> String {
    if flip {
        format_ratio(pair_price / price, &format!("{}/{}", pair_name, name))
    } else {
        format_ratio(price / pair_price, &format!("{}/{}", name, pair_name))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Rendered {
    pub price: String,
    pub change: String,
    pub percent: String,
    pub increase: bool,
}

impl Rendered {
    pub fn new(quote: &PriceQuote, config: &WatcherConfig, multiplier: f64) -> Rendered {
        let change = format_change(quote.change * multiplier);
        Rendered {
            price: format_price(quote.price * multiplier, config.decimals, config.crypto),
            increase: is_increase(&change),
            change,
            percent: format_percent(quote.percent, quote.percent_raw),
        }
    }
}

/// Symbol shown for a crypto asset: the configured ticker, then the
/// provider's symbol, then the asset name.
pub fn display_name(config: &WatcherConfig, quote: &PriceQuote) -> String {
    if !config.ticker.is_empty() {
        config.ticker.clone()
    } else {
        quote
            .symbol
            .as_deref()
            .unwrap_or(&config.name)
            .to_uppercase()
    }
}

pub fn nickname(config: &WatcherConfig, rendered: &Rendered) -> String {
    match &config.currency_symbol {
        Some(symbol) => format!("{}{}", symbol, rendered.price),
        None => format!("{} {}", rendered.price, config.currency.to_uppercase()),
    }
}

/// Activity shown next to the nickname, e.g. "+0.82 % | TSLA (POST)".
pub fn nickname_activity(config: &WatcherConfig, quote: &PriceQuote, rendered: &Rendered) -> String {
    if config.crypto {
        let symbol = quote
            .symbol
            .as_deref()
            .unwrap_or(&config.name)
            .to_uppercase();
        return format!(
            "{} % | {}{}",
            rendered.percent,
            symbol,
            config.currency.to_uppercase()
        );
    }
    match &quote.session {
        Some(session) => format!(
            "{} % | {} ({})",
            rendered.percent,
            config.name.to_uppercase(),
            session
        ),
        None => format!("{} % | {}", rendered.percent, config.name.to_uppercase()),
    }
}

/// Activity fallback when the pair quote is unavailable.
pub fn percent_activity(rendered: &Rendered) -> String {
    format!("{}%", rendered.percent)
}

/// Status-only activity, e.g. "201.75 ⬈ +0.82".
pub fn status_activity(config: &WatcherConfig, rendered: &Rendered, decorator: &str) -> String {
    if config.crypto {
        format!("{} {} {}%", rendered.price, decorator, rendered.percent)
    } else {
        format!("{} {} {}", rendered.price, decorator, rendered.percent)
    }
}
