use crate::convert::CurrencyConverter;
use crate::models::{PriceHistoryEntry, PriceQuote};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Observed prices older than this are dropped; the rolling high only looks
/// at the retained window.
const HISTORY_WINDOW_DAYS: i64 = 7;

/// Bounded, time-windowed record of observed prices per asset.
///
/// Owns the asset → ordered entry lists exclusively; the snapshot document
/// serializes them on every save.
#[derive(Debug, Default)]
pub struct PriceHistoryStore {
    entries: HashMap<String, Vec<PriceHistoryEntry>>,
}

impl PriceHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from a previously persisted map.
    pub fn from_map(entries: HashMap<String, Vec<PriceHistoryEntry>>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &HashMap<String, Vec<PriceHistoryEntry>> {
        &self.entries
    }

    /// Append an observation for an asset.
    pub fn record(&mut self, asset: &str, quote: &PriceQuote, now: DateTime<Utc>) {
        self.entries
            .entry(asset.to_string())
            .or_default()
            .push(PriceHistoryEntry {
                price: quote.price,
                currency: quote.currency.clone(),
                timestamp: now,
            });
    }

    /// Drop entries older than the retention window and remove emptied asset
    /// buckets. Returns how many entries were removed.
    pub fn cleanup_expired(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(HISTORY_WINDOW_DAYS);
        let mut removed = 0;

        self.entries.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| e.timestamp >= cutoff);
            removed += before - entries.len();
            !entries.is_empty()
        });

        if removed > 0 {
            tracing::debug!("cleaned up {} expired price history entries", removed);
        }

        removed
    }

    /// Highest retained price for an asset in EUR. `None` when nothing has
    /// been observed, which is distinct from a high of zero.
    pub fn rolling_high(&self, asset: &str, converter: &CurrencyConverter) -> Option<f64> {
        self.entries
            .get(asset)?
            .iter()
            .map(|e| converter.to_eur(e.price, &e.currency))
            .reduce(f64::max)
    }

    #[cfg(test)]
    pub fn entry_count(&self, asset: &str) -> usize {
        self.entries.get(asset).map_or(0, Vec::len)
    }
}
