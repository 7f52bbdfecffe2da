pub mod calibration;
pub mod ledger;
pub mod position;
pub mod signal;

use std::fmt;

/// Ordered pair of tickers. `base` is leg 1 and `quote` is leg 2.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairSpec {
    pub base: String,
    pub quote: String,
}

const STORAGE_KEY_SEPARATOR: char = '|';

impl PairSpec {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }

    /// Flat key used only at the persistence boundary, e.g. `BTC-USD|ETH-USD`.
    pub fn storage_key(&self) -> String {
        format!("{}{}{}", self.base, STORAGE_KEY_SEPARATOR, self.quote)
    }

    pub fn from_storage_key(key: &str) -> Option<Self> {
        let (base, quote) = key.split_once(STORAGE_KEY_SEPARATOR)?;
        let (base, quote) = (base.trim(), quote.trim());
        if base.is_empty() || quote.is_empty() || quote.contains(STORAGE_KEY_SEPARATOR) {
            return None;
        }
        Some(Self::new(base, quote))
    }

    /// Ticker names with a quote-currency suffix such as `-USD` stripped.
    pub fn short_names(&self, suffix: &str) -> (String, String) {
        (
            short_name(&self.base, suffix),
            short_name(&self.quote, suffix),
        )
    }

    pub fn label(&self, suffix: &str) -> String {
        let (a, b) = self.short_names(suffix);
        format!("{}/{}", a, b)
    }
}

impl fmt::Display for PairSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)
    }
}

pub fn short_name(symbol: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        return symbol.to_string();
    }
    symbol.strip_suffix(suffix).unwrap_or(symbol).to_string()
}

/// Every distinct ticker of the universe, in first-seen order.
pub fn universe_tickers(universe: &[PairSpec]) -> Vec<String> {
    let mut tickers: Vec<String> = Vec::new();
    for pair in universe {
        for symbol in [&pair.base, &pair.quote] {
            if !tickers.iter().any(|t| t == symbol) {
                tickers.push(symbol.clone());
            }
        }
    }
    tickers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_key_uses_pipe_separator() {
        let pair = PairSpec::new("BTC-USD", "ETH-USD");
        assert_eq!(pair.storage_key(), "BTC-USD|ETH-USD");
        assert_eq!(PairSpec::from_storage_key("BTC-USD|ETH-USD"), Some(pair));
    }

    #[test]
    fn malformed_storage_keys_are_rejected() {
        assert_eq!(PairSpec::from_storage_key("BTC-USD"), None);
        assert_eq!(PairSpec::from_storage_key("|ETH-USD"), None);
        assert_eq!(PairSpec::from_storage_key("A|B|C"), None);
    }

    #[test]
    fn label_strips_display_suffix() {
        let pair = PairSpec::new("SOL-USD", "AVAX-USD");
        assert_eq!(pair.label("-USD"), "SOL/AVAX");
        assert_eq!(pair.label(""), "SOL-USD/AVAX-USD");
    }

    #[test]
    fn universe_tickers_are_deduplicated_in_order() {
        let universe = vec![
            PairSpec::new("BTC-USD", "ETH-USD"),
            PairSpec::new("ETH-USD", "SOL-USD"),
        ];
        assert_eq!(
            universe_tickers(&universe),
            vec!["BTC-USD", "ETH-USD", "SOL-USD"]
        );
    }
}
