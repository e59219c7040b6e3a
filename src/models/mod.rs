use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Quote currency of a trading pair.
///
/// EUR is the accounting currency; USD, USDC and USDT are treated as
/// USD-pegged and converted through the cached exchange rate. Anything else
/// is carried through as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum QuoteCurrency {
    Eur,
    Usd,
    Usdc,
    Usdt,
    Other(String),
}

impl QuoteCurrency {
    pub fn code(&self) -> &str {
        match self {
            QuoteCurrency::Eur => "EUR",
            QuoteCurrency::Usd => "USD",
            QuoteCurrency::Usdc => "USDC",
            QuoteCurrency::Usdt => "USDT",
            QuoteCurrency::Other(code) => code,
        }
    }

    /// USD-pegged currencies converted via the cached EUR rate.
    pub fn is_usd_pegged(&self) -> bool {
        matches!(
            self,
            QuoteCurrency::Usd | QuoteCurrency::Usdc | QuoteCurrency::Usdt
        )
    }
}

impl From<String> for QuoteCurrency {
    fn from(s: String) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "EUR" => QuoteCurrency::Eur,
            "USD" => QuoteCurrency::Usd,
            "USDC" => QuoteCurrency::Usdc,
            "USDT" => QuoteCurrency::Usdt,
            _ => QuoteCurrency::Other(s),
        }
    }
}

impl From<QuoteCurrency> for String {
    fn from(c: QuoteCurrency) -> String {
        c.code().to_string()
    }
}

impl fmt::Display for QuoteCurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Ticker result for an asset, tagged with the pair that actually answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceQuote {
    pub price: f64,
    pub currency: QuoteCurrency,
    pub best_bid: f64,
    pub best_ask: f64,
    /// Product id the quote came from, e.g. "BTC-USDC"
    pub pair: String,
}

/// One open holding under management.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub asset: String,
    pub entry_price: f64,
    pub entry_currency: QuoteCurrency,
    /// Base units held when the baseline was recorded
    pub amount: f64,
    pub entry_time: DateTime<Utc>,
    /// Cumulative base units sold off through partial exits
    #[serde(default)]
    pub total_sold: f64,
    /// Set once a SELL rounded below the pair's minimum order size;
    /// suppresses repeated futile submissions
    #[serde(default)]
    pub too_small_to_sell: bool,
}

impl Position {
    pub fn remaining(&self) -> f64 {
        self.amount - self.total_sold
    }
}

/// Ledger entry left behind by a full exit; enables a time-boxed re-entry buy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoldPosition {
    pub asset: String,
    pub sale_price: f64,
    pub sale_currency: QuoteCurrency,
    pub sale_amount: f64,
    pub sale_time: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SoldPosition {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Observed price point, retained inside the rolling history window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceHistoryEntry {
    pub price: f64,
    pub currency: QuoteCurrency,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an order amount is denominated in base units or quote notional.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AmountKind {
    BaseSize,
    QuoteSize,
}

impl AmountKind {
    pub fn field(&self) -> &'static str {
        match self {
            AmountKind::BaseSize => "base_size",
            AmountKind::QuoteSize => "quote_size",
        }
    }

    /// Venue wants string amounts; base sizes get full precision, quote
    /// notionals are cents.
    pub fn format(&self, amount: f64) -> String {
        match self {
            AmountKind::BaseSize => format!("{:.8}", amount),
            AmountKind::QuoteSize => format!("{:.2}", amount),
        }
    }
}

/// Trading-pair metadata used for precision rounding and minimum-size checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductInfo {
    pub product_id: String,
    pub base_increment: f64,
    pub base_min_size: f64,
    pub base_max_size: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_currency_from_string() {
        assert_eq!(QuoteCurrency::from("EUR".to_string()), QuoteCurrency::Eur);
        assert_eq!(QuoteCurrency::from("usdc".to_string()), QuoteCurrency::Usdc);
        assert_eq!(
            QuoteCurrency::from("GBP".to_string()),
            QuoteCurrency::Other("GBP".to_string())
        );
    }

    #[test]
    fn test_quote_currency_roundtrips_through_json() {
        let json = serde_json::to_string(&QuoteCurrency::Usdt).unwrap();
        assert_eq!(json, "\"USDT\"");

        let parsed: QuoteCurrency = serde_json::from_str("\"EUR\"").unwrap();
        assert_eq!(parsed, QuoteCurrency::Eur);
    }

    #[test]
    fn test_usd_pegged_classification() {
        assert!(QuoteCurrency::Usd.is_usd_pegged());
        assert!(QuoteCurrency::Usdc.is_usd_pegged());
        assert!(QuoteCurrency::Usdt.is_usd_pegged());
        assert!(!QuoteCurrency::Eur.is_usd_pegged());
        assert!(!QuoteCurrency::Other("GBP".to_string()).is_usd_pegged());
    }

    #[test]
    fn test_position_remaining() {
        let position = Position {
            asset: "BTC".to_string(),
            entry_price: 100.0,
            entry_currency: QuoteCurrency::Eur,
            amount: 2.0,
            entry_time: Utc::now(),
            total_sold: 0.5,
            too_small_to_sell: false,
        };

        assert_eq!(position.remaining(), 1.5);
    }

    #[test]
    fn test_sold_position_expiry() {
        let now = Utc::now();
        let sold = SoldPosition {
            asset: "ETH".to_string(),
            sale_price: 2000.0,
            sale_currency: QuoteCurrency::Usdc,
            sale_amount: 1.0,
            sale_time: now - chrono::Duration::days(31),
            expires_at: now - chrono::Duration::days(1),
        };

        assert!(sold.is_expired(now));
        assert!(!sold.is_expired(now - chrono::Duration::days(2)));
    }

    #[test]
    fn test_amount_kind_formatting() {
        assert_eq!(AmountKind::BaseSize.format(0.5), "0.50000000");
        assert_eq!(AmountKind::QuoteSize.format(25.0), "25.00");
        assert_eq!(AmountKind::BaseSize.field(), "base_size");
        assert_eq!(AmountKind::QuoteSize.field(), "quote_size");
    }
}
