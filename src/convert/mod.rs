use crate::api::CoinbaseClient;
use crate::models::QuoteCurrency;
use chrono::{DateTime, Duration, Utc};

/// Static rate used whenever a fresh quote cannot be fetched.
const USD_TO_EUR_FALLBACK: f64 = 0.92;

/// A fresh rate is good for an hour before the next cycle re-fetches it.
const RATE_REFRESH_INTERVAL_SECS: i64 = 3600;

/// Where the cached rate came from, so staleness shows up in logs and tests
/// instead of being swallowed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateSource {
    Fresh { fetched_at: DateTime<Utc> },
    Fallback,
}

/// Converts USD-pegged quote amounts into EUR through a time-boxed cached
/// rate. Conversion itself never touches the network and never fails; only
/// `refresh` does I/O.
pub struct CurrencyConverter {
    rate: f64,
    source: RateSource,
    last_refresh: Option<DateTime<Utc>>,
}

impl CurrencyConverter {
    pub fn new() -> Self {
        Self {
            rate: USD_TO_EUR_FALLBACK,
            source: RateSource::Fallback,
            last_refresh: None,
        }
    }

    /// Build a converter with a known rate, for deterministic evaluation in
    /// tests.
    pub fn with_rate(rate: f64) -> Self {
        Self {
            rate,
            source: RateSource::Fresh {
                fetched_at: Utc::now(),
            },
            last_refresh: Some(Utc::now()),
        }
    }

    /// Refresh the cached USDC/EUR rate if the refresh interval has elapsed.
    /// A failed fetch drops back to the static fallback rather than erroring.
    pub async fn refresh(&mut self, client: &CoinbaseClient, now: DateTime<Utc>) -> RateSource {
        let due = match self.last_refresh {
            None => true,
            Some(at) => now - at >= Duration::seconds(RATE_REFRESH_INTERVAL_SECS),
        };

        if !due {
            return self.source;
        }

        match client
            .get_price("USDC", Some(&[QuoteCurrency::Eur]))
            .await
        {
            Ok(quote) if quote.currency == QuoteCurrency::Eur && quote.price > 0.0 => {
                self.rate = quote.price;
                self.source = RateSource::Fresh { fetched_at: now };
                tracing::info!("fetched EUR/USD rate: {:.4}", self.rate);
            }
            Ok(quote) => {
                tracing::warn!(
                    "rate refresh answered in {} instead of EUR, using fallback {}",
                    quote.currency,
                    USD_TO_EUR_FALLBACK
                );
                self.rate = USD_TO_EUR_FALLBACK;
                self.source = RateSource::Fallback;
            }
            Err(e) => {
                tracing::warn!(
                    "failed to fetch EUR/USD rate: {}, using fallback {}",
                    e,
                    USD_TO_EUR_FALLBACK
                );
                self.rate = USD_TO_EUR_FALLBACK;
                self.source = RateSource::Fallback;
            }
        }

        self.last_refresh = Some(now);
        self.source
    }

    /// Convert an amount in the given currency to EUR. Identity on EUR,
    /// cached-rate multiply on USD-pegged currencies; anything else passes
    /// through unchanged with a warning.
    pub fn to_eur(&self, amount: f64, currency: &QuoteCurrency) -> f64 {
        match currency {
            QuoteCurrency::Eur => amount,
            QuoteCurrency::Usd | QuoteCurrency::Usdc | QuoteCurrency::Usdt => amount * self.rate,
            QuoteCurrency::Other(code) => {
                tracing::warn!("no conversion for {}, passing value through unchanged", code);
                amount
            }
        }
    }

    /// Inverse conversion, used to size quote-denominated buy orders from an
    /// EUR notional.
    pub fn from_eur(&self, amount_eur: f64, currency: &QuoteCurrency) -> f64 {
        match currency {
            QuoteCurrency::Eur => amount_eur,
            QuoteCurrency::Usd | QuoteCurrency::Usdc | QuoteCurrency::Usdt => {
                amount_eur / self.rate
            }
            QuoteCurrency::Other(code) => {
                tracing::warn!("no conversion for {}, passing value through unchanged", code);
                amount_eur
            }
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn source(&self) -> RateSource {
        self.source
    }
}

impl Default for CurrencyConverter {
    fn default() -> Self {
        Self::new()
    }
}
