use crate::models::{Position, PriceQuote, SoldPosition};
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// How long after a full exit a re-entry buy remains possible.
const REENTRY_WINDOW_DAYS: i64 = 30;

/// Exclusive owner of the per-asset position state machine.
///
/// An asset is either untracked, tracked (possibly partially sold), or
/// sitting in the sold-positions ledger awaiting re-entry. Full exits move a
/// position into the ledger; a position with `total_sold == amount` never
/// exists.
#[derive(Debug, Default)]
pub struct PositionTracker {
    positions: HashMap<String, Position>,
    sold_positions: HashMap<String, SoldPosition>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore from persisted maps.
    pub fn from_parts(
        positions: HashMap<String, Position>,
        sold_positions: HashMap<String, SoldPosition>,
    ) -> Self {
        Self {
            positions,
            sold_positions,
        }
    }

    pub fn positions(&self) -> &HashMap<String, Position> {
        &self.positions
    }

    pub fn sold_positions(&self) -> &HashMap<String, SoldPosition> {
        &self.sold_positions
    }

    pub fn position(&self, asset: &str) -> Option<&Position> {
        self.positions.get(asset)
    }

    pub fn is_tracked(&self, asset: &str) -> bool {
        self.positions.contains_key(asset)
    }

    /// First observation of a held asset: record the current price as the
    /// baseline. No trade happens on this cycle.
    pub fn track_new(&mut self, asset: &str, quote: &PriceQuote, amount: f64, now: DateTime<Utc>) {
        let position = Position {
            asset: asset.to_string(),
            entry_price: quote.price,
            entry_currency: quote.currency.clone(),
            amount,
            entry_time: now,
            total_sold: 0.0,
            too_small_to_sell: false,
        };

        tracing::info!(
            "tracked new position: {} @ {:.8} {}, amount: {:.8}",
            asset,
            quote.price,
            quote.currency,
            amount
        );
        self.positions.insert(asset.to_string(), position);
    }

    /// Accumulate a partial sell. The invariant `total_sold < amount` is
    /// enforced here: a sell that would liquidate the whole position must go
    /// through `record_full_exit` instead.
    pub fn record_partial_sell(&mut self, asset: &str, sold_amount: f64) -> Result<f64> {
        let position = self
            .positions
            .get_mut(asset)
            .ok_or_else(|| anyhow!("no tracked position for {}", asset))?;

        if sold_amount <= 0.0 {
            bail!("partial sell amount must be positive, got {}", sold_amount);
        }

        let new_total = position.total_sold + sold_amount;
        if new_total >= position.amount {
            bail!(
                "partial sell of {} would liquidate {} ({} of {}); use a full exit",
                sold_amount,
                asset,
                new_total,
                position.amount
            );
        }

        position.total_sold = new_total;
        tracing::info!(
            "partial sell: {}, sold {:.8}, total sold: {:.8}",
            asset,
            sold_amount,
            new_total
        );
        Ok(new_total)
    }

    /// Close out a position entirely, leaving a sold-position ledger entry
    /// that keeps the asset eligible for re-entry until the window expires.
    pub fn record_full_exit(
        &mut self,
        asset: &str,
        quote: &PriceQuote,
        sale_amount: f64,
        now: DateTime<Utc>,
    ) -> Result<SoldPosition> {
        self.positions
            .remove(asset)
            .ok_or_else(|| anyhow!("no tracked position for {}", asset))?;

        let sold = SoldPosition {
            asset: asset.to_string(),
            sale_price: quote.price,
            sale_currency: quote.currency.clone(),
            sale_amount,
            sale_time: now,
            expires_at: now + Duration::days(REENTRY_WINDOW_DAYS),
        };

        tracing::info!(
            "position closed: {} @ {:.8} {}, re-entry window until {}",
            asset,
            quote.price,
            quote.currency,
            sold.expires_at
        );
        // Replaces any previous ledger entry: at most one per asset
        self.sold_positions.insert(asset.to_string(), sold.clone());
        Ok(sold)
    }

    /// Record a successful buy: a fresh baseline replaces whatever was
    /// tracked, and a pending re-entry entry is consumed. Returns true when
    /// this buy was a re-entry.
    pub fn record_buy(
        &mut self,
        asset: &str,
        quote: &PriceQuote,
        amount: f64,
        now: DateTime<Utc>,
    ) -> bool {
        let was_reentry = self.sold_positions.remove(asset).is_some();
        self.track_new(asset, quote, amount, now);
        was_reentry
    }

    /// Mark a position as too small to sell so further attempts are
    /// suppressed. Logged once, when the flag flips.
    pub fn flag_too_small_to_sell(&mut self, asset: &str) {
        if let Some(position) = self.positions.get_mut(asset) {
            if !position.too_small_to_sell {
                position.too_small_to_sell = true;
                tracing::warn!(
                    "{}: remaining amount is below the pair's minimum order size, \
                     suppressing further sell attempts",
                    asset
                );
            }
        }
    }

    /// Drop expired sold-position entries; returns the purged assets.
    pub fn purge_expired_sold(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .sold_positions
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.asset.clone())
            .collect();

        for asset in &expired {
            self.sold_positions.remove(asset);
            tracing::info!("re-entry window expired for {}", asset);
        }

        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QuoteCurrency;

    fn quote(price: f64) -> PriceQuote {
        PriceQuote {
            price,
            currency: QuoteCurrency::Eur,
            best_bid: price,
            best_ask: price,
            pair: "BTC-EUR".to_string(),
        }
    }

    #[test]
    fn test_track_new_records_baseline() {
        let mut tracker = PositionTracker::new();
        let now = Utc::now();

        tracker.track_new("BTC", &quote(95000.0), 0.5, now);

        let position = tracker.position("BTC").unwrap();
        assert_eq!(position.entry_price, 95000.0);
        assert_eq!(position.entry_currency, QuoteCurrency::Eur);
        assert_eq!(position.amount, 0.5);
        assert_eq!(position.total_sold, 0.0);
        assert!(!position.too_small_to_sell);
    }

    #[test]
    fn test_partial_sell_accumulates() {
        let mut tracker = PositionTracker::new();
        tracker.track_new("BTC", &quote(100.0), 2.0, Utc::now());

        let total = tracker.record_partial_sell("BTC", 0.5).unwrap();
        assert_eq!(total, 0.5);

        let total = tracker.record_partial_sell("BTC", 0.5).unwrap();
        assert_eq!(total, 1.0);

        let position = tracker.position("BTC").unwrap();
        assert!(position.total_sold < position.amount);
        assert_eq!(position.remaining(), 1.0);
    }

    #[test]
    fn test_partial_sell_cannot_liquidate() {
        let mut tracker = PositionTracker::new();
        tracker.track_new("BTC", &quote(100.0), 2.0, Utc::now());

        // total_sold == amount must never exist; a full liquidation has to go
        // through record_full_exit
        let result = tracker.record_partial_sell("BTC", 2.0);
        assert!(result.is_err());

        let position = tracker.position("BTC").unwrap();
        assert_eq!(position.total_sold, 0.0);
    }

    #[test]
    fn test_partial_sell_rejects_nonpositive_amount() {
        let mut tracker = PositionTracker::new();
        tracker.track_new("BTC", &quote(100.0), 2.0, Utc::now());

        assert!(tracker.record_partial_sell("BTC", 0.0).is_err());
        assert!(tracker.record_partial_sell("BTC", -1.0).is_err());
    }

    #[test]
    fn test_full_exit_converts_to_sold_position() {
        let mut tracker = PositionTracker::new();
        let now = Utc::now();
        tracker.track_new("BTC", &quote(100.0), 2.0, now);

        let sold = tracker.record_full_exit("BTC", &quote(151.0), 2.0, now).unwrap();

        assert!(!tracker.is_tracked("BTC"));
        assert_eq!(sold.sale_price, 151.0);
        assert_eq!(sold.expires_at, now + Duration::days(30));
        assert!(tracker.sold_positions().contains_key("BTC"));
    }

    #[test]
    fn test_full_exit_requires_tracked_position() {
        let mut tracker = PositionTracker::new();
        let result = tracker.record_full_exit("BTC", &quote(100.0), 1.0, Utc::now());
        assert!(result.is_err());
    }

    #[test]
    fn test_at_most_one_sold_position_per_asset() {
        let mut tracker = PositionTracker::new();
        let now = Utc::now();

        tracker.track_new("BTC", &quote(100.0), 1.0, now);
        tracker.record_full_exit("BTC", &quote(150.0), 1.0, now).unwrap();

        // Buy back in, exit again at a different price
        tracker.record_buy("BTC", &quote(130.0), 1.0, now);
        tracker.record_full_exit("BTC", &quote(200.0), 1.0, now).unwrap();

        assert_eq!(tracker.sold_positions().len(), 1);
        assert_eq!(tracker.sold_positions()["BTC"].sale_price, 200.0);
    }

    #[test]
    fn test_reentry_buy_consumes_ledger_entry() {
        let mut tracker = PositionTracker::new();
        let now = Utc::now();

        tracker.track_new("ETH", &quote(2000.0), 1.0, now);
        tracker.record_full_exit("ETH", &quote(3000.0), 1.0, now).unwrap();

        let was_reentry = tracker.record_buy("ETH", &quote(2600.0), 0.01, now);

        assert!(was_reentry);
        assert!(tracker.sold_positions().is_empty());
        assert_eq!(tracker.position("ETH").unwrap().entry_price, 2600.0);
    }

    #[test]
    fn test_fresh_buy_is_not_a_reentry() {
        let mut tracker = PositionTracker::new();
        let was_reentry = tracker.record_buy("SOL", &quote(150.0), 0.1, Utc::now());

        assert!(!was_reentry);
        assert!(tracker.is_tracked("SOL"));
    }

    #[test]
    fn test_purge_expired_sold_positions() {
        let mut tracker = PositionTracker::new();
        let now = Utc::now();

        tracker.track_new("OLD", &quote(10.0), 1.0, now - Duration::days(40));
        tracker
            .record_full_exit("OLD", &quote(20.0), 1.0, now - Duration::days(31))
            .unwrap();
        tracker.track_new("NEW", &quote(10.0), 1.0, now);
        tracker.record_full_exit("NEW", &quote(20.0), 1.0, now).unwrap();

        let purged = tracker.purge_expired_sold(now);

        assert_eq!(purged, vec!["OLD".to_string()]);
        assert!(!tracker.sold_positions().contains_key("OLD"));
        assert!(tracker.sold_positions().contains_key("NEW"));
    }

    #[test]
    fn test_too_small_flag_is_sticky() {
        let mut tracker = PositionTracker::new();
        tracker.track_new("PEPE", &quote(0.00001), 10.0, Utc::now());

        tracker.flag_too_small_to_sell("PEPE");
        tracker.flag_too_small_to_sell("PEPE");

        assert!(tracker.position("PEPE").unwrap().too_small_to_sell);
    }

    #[test]
    fn test_restore_from_parts() {
        let mut tracker = PositionTracker::new();
        let now = Utc::now();
        tracker.track_new("BTC", &quote(100.0), 2.0, now);
        tracker.track_new("ETH", &quote(2000.0), 1.0, now);
        tracker.record_full_exit("ETH", &quote(2500.0), 1.0, now).unwrap();

        let restored = PositionTracker::from_parts(
            tracker.positions().clone(),
            tracker.sold_positions().clone(),
        );

        assert!(restored.is_tracked("BTC"));
        assert!(restored.sold_positions().contains_key("ETH"));
    }
}
