use crate::api::{ApiError, CoinbaseClient};
use crate::convert::CurrencyConverter;
use crate::execution::{ExecutionContext, ExecutionOutcome, OrderExecutor, PositionTracker};
use crate::history::PriceHistoryStore;
use crate::persistence::{SnapshotStore, StateDocument};
use crate::strategy::triggers::{
    self, BuyDecision, TriggerConfig,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::time::{sleep, Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Continue,
    /// Budget fell below the minimum balance floor; no further orders
    Halt,
}

/// Owns one monitoring run: the exchange client, the converter, the position
/// and history state, and the durable snapshot they are written back to.
///
/// A cycle runs to completion before the inter-cycle sleep; every state
/// mutation is followed by a snapshot write, so a crash between cycles loses
/// at most the in-flight cycle's uncommitted decision.
pub struct TradingMonitor {
    client: CoinbaseClient,
    converter: CurrencyConverter,
    store: SnapshotStore,
    document: StateDocument,
    config: TriggerConfig,
    tracker: PositionTracker,
    history: PriceHistoryStore,
    executor: OrderExecutor,
    budget_eur: f64,
}

impl TradingMonitor {
    /// Load the state document and build the run. Invalid configuration is
    /// fatal here, before any monitoring starts.
    pub fn new(client: CoinbaseClient, store: SnapshotStore) -> Result<Self> {
        let document = store.load()?;
        let config = document.trigger_config();
        let tracker = PositionTracker::from_parts(
            document.position_tracking.clone(),
            document.sold_positions.clone(),
        );
        let history = PriceHistoryStore::from_map(document.price_history.clone());
        let executor = OrderExecutor::new(document.dry_run, document.fees.taker_fee_rate);
        let budget_eur = document.trading_budget_eur;

        tracing::info!(
            "trading monitor initialized - mode: {}",
            if document.dry_run {
                "DRY RUN"
            } else {
                "LIVE TRADING"
            }
        );

        Ok(Self {
            client,
            converter: CurrencyConverter::new(),
            store,
            document,
            config,
            tracker,
            history,
            executor,
            budget_eur,
        })
    }

    /// Override the document's mode for this run; no live orders go out.
    pub fn force_dry_run(&mut self) {
        if !self.document.dry_run {
            self.document.dry_run = true;
            self.executor = OrderExecutor::new(true, self.document.fees.taker_fee_rate);
            tracing::info!("dry-run override active, no live orders will be placed");
        }
    }

    pub fn budget_eur(&self) -> f64 {
        self.budget_eur
    }

    pub fn dry_run(&self) -> bool {
        self.document.dry_run
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.document.check_interval_minutes * 60)
    }

    pub fn check_interval_minutes(&self) -> u64 {
        self.document.check_interval_minutes
    }

    /// Write the current state back to the snapshot document.
    pub fn flush(&mut self) -> Result<()> {
        self.save_snapshot()
    }

    fn save_snapshot(&mut self) -> Result<()> {
        self.document.trading_budget_eur = self.budget_eur;
        self.document.position_tracking = self.tracker.positions().clone();
        self.document.sold_positions = self.tracker.sold_positions().clone();
        self.document.price_history = self.history.entries().clone();
        self.store.save(&self.document)
    }

    /// Monitor until halted. The inter-cycle sleep is a plain cancellable
    /// wait; dropping this future (ctrl-c in the caller's select) interrupts
    /// it or any in-flight retry promptly.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            if self.cycle().await? == CycleOutcome::Halt {
                tracing::warn!("trading stopped due to insufficient balance");
                return Ok(());
            }

            tracing::info!(
                "sleeping for {} minutes...",
                self.document.check_interval_minutes
            );
            sleep(self.check_interval()).await;
        }
    }

    /// Run one monitoring cycle: refresh the rate, purge expired state,
    /// check the budget floor, evaluate sell triggers for every held asset,
    /// then evaluate buy opportunities.
    pub async fn cycle(&mut self) -> Result<CycleOutcome> {
        let now = Utc::now();
        tracing::info!("🔍 monitoring cycle - {}", now.format("%Y-%m-%d %H:%M:%S"));

        self.converter.refresh(&self.client, now).await;

        // Expired state goes away before any trigger can see it
        let purged = self.tracker.purge_expired_sold(now);
        let trimmed = self.history.cleanup_expired(now);
        if !purged.is_empty() || trimmed > 0 {
            self.save_snapshot()?;
        }

        match self.client.get_balance("EUR").await {
            Ok(balance) => tracing::info!(
                "💶 actual EUR balance: €{:.2} | budget tracker: €{:.2}",
                balance,
                self.budget_eur
            ),
            Err(e) => tracing::warn!("could not fetch EUR balance: {}", e),
        }

        if self.budget_eur < self.document.minimum_balance_eur {
            tracing::warn!(
                "⚠️  TRADING HALTED: budget depleted (€{:.2} < €{:.2})",
                self.budget_eur,
                self.document.minimum_balance_eur
            );
            return Ok(CycleOutcome::Halt);
        }

        let holdings = match self.client.get_holdings().await {
            Ok(holdings) => holdings,
            Err(e) => {
                tracing::error!("failed to fetch holdings, skipping cycle: {}", e);
                return Ok(CycleOutcome::Continue);
            }
        };

        let holdings: HashMap<String, f64> = holdings
            .into_iter()
            .filter(|(asset, _)| self.document.tracked_assets.contains(asset))
            .collect();

        tracing::info!("📊 monitoring {} held assets...", holdings.len());
        for (asset, amount) in &holdings {
            self.process_held_asset(asset, *amount, now).await?;
        }

        self.evaluate_buy_opportunities(&holdings, now).await?;

        tracing::info!("💰 updated trading budget: €{:.2}", self.budget_eur);
        Ok(CycleOutcome::Continue)
    }

    /// Price one held asset and run the sell-side trigger rules against it.
    /// A missing price skips the asset for this cycle, nothing more.
    async fn process_held_asset(
        &mut self,
        asset: &str,
        amount: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let quote = match self.client.get_price(asset, None).await {
            Ok(quote) => quote,
            Err(ApiError::NotFound { .. }) => {
                tracing::info!("  {}: price not available, skipping this cycle", asset);
                return Ok(());
            }
            Err(e) => {
                tracing::warn!("  {}: price fetch failed ({}), skipping this cycle", asset, e);
                return Ok(());
            }
        };

        if self.document.buy_assets.iter().any(|a| a == asset) {
            self.history.record(asset, &quote, now);
            self.save_snapshot()?;
        }

        let value_eur = self
            .converter
            .to_eur(amount * quote.price, &quote.currency);
        tracing::info!(
            "  {}: {:.8} | {} @ {:.8} {} | value €{:.2}",
            asset,
            amount,
            quote.pair,
            quote.price,
            quote.currency,
            value_eur
        );

        let Some(position) = self.tracker.position(asset) else {
            // First observation establishes the baseline; no trade this cycle
            self.tracker.track_new(asset, &quote, amount, now);
            self.save_snapshot()?;
            return Ok(());
        };

        if position.too_small_to_sell {
            return Ok(());
        }

        let decision =
            triggers::evaluate_sell(position, amount, &quote, &self.config, &self.converter);

        if let Some(decision) = decision {
            tracing::info!("  🎯 {}: {}", asset, decision.trigger);

            let mut ctx = ExecutionContext {
                client: &self.client,
                converter: &self.converter,
                tracker: &mut self.tracker,
                budget_eur: &mut self.budget_eur,
            };
            let outcome = self.executor.execute_sell(&mut ctx, &decision, now).await?;

            if let ExecutionOutcome::Aborted { reason } = &outcome {
                tracing::warn!("  {}: sell aborted: {}", asset, reason);
            }
            // The too-small flag set by an aborted sell is durable state too
            self.save_snapshot()?;
        }

        Ok(())
    }

    /// The buy-side pass: dip buys for configured assets we do not hold, and
    /// re-entries for recently exited assets.
    async fn evaluate_buy_opportunities(
        &mut self,
        holdings: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let dip_candidates: Vec<String> = self
            .document
            .buy_assets
            .iter()
            .filter(|asset| {
                !holdings.contains_key(*asset)
                    && !self.tracker.is_tracked(asset)
                    && !self.tracker.sold_positions().contains_key(*asset)
            })
            .cloned()
            .collect();

        for asset in dip_candidates {
            let quote = match self.client.get_price(&asset, None).await {
                Ok(quote) => quote,
                Err(e) => {
                    tracing::debug!("{}: no price for dip evaluation: {}", asset, e);
                    continue;
                }
            };

            // Record before evaluating: a fresh extreme cannot sit the
            // required dip below itself, so it only becomes an effective
            // baseline on later cycles
            self.history.record(&asset, &quote, now);
            self.save_snapshot()?;

            let rolling_high = self.history.rolling_high(&asset, &self.converter);
            if let Some(decision) =
                triggers::evaluate_dip_buy(&asset, &quote, rolling_high, &self.config, &self.converter)
            {
                self.try_buy(decision, now).await?;
            }
        }

        let reentry_candidates: Vec<String> = self
            .tracker
            .sold_positions()
            .keys()
            .filter(|asset| !holdings.contains_key(*asset) && !self.tracker.is_tracked(asset))
            .cloned()
            .collect();

        for asset in reentry_candidates {
            let quote = match self.client.get_price(&asset, None).await {
                Ok(quote) => quote,
                Err(e) => {
                    tracing::debug!("{}: no price for re-entry evaluation: {}", asset, e);
                    continue;
                }
            };

            let Some(sold) = self.tracker.sold_positions().get(&asset) else {
                continue;
            };
            if let Some(decision) =
                triggers::evaluate_reentry(sold, &quote, &self.config, &self.converter)
            {
                self.try_buy(decision, now).await?;
            }
        }

        Ok(())
    }

    /// Gate a buy against the budget floor, then execute it.
    async fn try_buy(&mut self, decision: BuyDecision, now: DateTime<Utc>) -> Result<()> {
        if !triggers::can_afford_buy(
            self.budget_eur,
            decision.notional_eur,
            self.config.taker_fee_rate,
            self.document.minimum_balance_eur,
        ) {
            tracing::info!(
                "skipping {} buy ({}): €{:.2} budget cannot cover €{:.2} plus fee above the €{:.2} floor",
                decision.asset,
                decision.trigger,
                self.budget_eur,
                decision.notional_eur,
                self.document.minimum_balance_eur
            );
            return Ok(());
        }

        tracing::info!("  🎯 {}: {}", decision.asset, decision.trigger);

        let mut ctx = ExecutionContext {
            client: &self.client,
            converter: &self.converter,
            tracker: &mut self.tracker,
            budget_eur: &mut self.budget_eur,
        };
        let outcome = self.executor.execute_buy(&mut ctx, &decision, now).await?;

        match outcome {
            ExecutionOutcome::Executed { .. } => self.save_snapshot()?,
            ExecutionOutcome::Aborted { reason } => {
                tracing::warn!("  {} buy aborted: {}", decision.asset, reason);
            }
        }

        Ok(())
    }
}
