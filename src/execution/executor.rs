use crate::api::{CoinbaseClient, OrderOutcome};
use crate::convert::CurrencyConverter;
use crate::execution::PositionTracker;
use crate::models::{AmountKind, OrderSide};
use crate::strategy::{BuyDecision, SellDecision};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};

/// Everything an order execution is allowed to touch. The tracker and the
/// budget ledger are the only mutable state.
pub struct ExecutionContext<'a> {
    pub client: &'a CoinbaseClient,
    pub converter: &'a CurrencyConverter,
    pub tracker: &'a mut PositionTracker,
    pub budget_eur: &'a mut f64,
}

/// What happened to a decision.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Executed {
        /// Signed EUR change applied to the budget ledger
        budget_delta_eur: f64,
        fee_eur: f64,
        /// Realized P&L for sells; buys have none
        pnl_eur: Option<f64>,
    },
    Aborted {
        reason: String,
    },
}

/// Turns trade decisions into (possibly simulated) orders and applies the
/// results to the tracker and budget ledger.
///
/// In dry-run mode no order leaves the process; state is updated as if the
/// order filled at the quoted price. In live mode amounts are rounded to the
/// pair's precision first, and a SELL that rounds below the minimum order
/// size aborts and flags the position instead of submitting.
pub struct OrderExecutor {
    dry_run: bool,
    taker_fee_rate: f64,
}

impl OrderExecutor {
    pub fn new(dry_run: bool, taker_fee_rate: f64) -> Self {
        Self {
            dry_run,
            taker_fee_rate,
        }
    }

    pub async fn execute_sell(
        &self,
        ctx: &mut ExecutionContext<'_>,
        decision: &SellDecision,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome> {
        let quote = &decision.quote;

        let position = ctx
            .tracker
            .position(&decision.asset)
            .ok_or_else(|| anyhow!("no tracked position for {}", decision.asset))?;

        if position.too_small_to_sell {
            return Ok(ExecutionOutcome::Aborted {
                reason: format!("{} is flagged too small to sell", decision.asset),
            });
        }

        let entry_eur = ctx
            .converter
            .to_eur(position.entry_price, &position.entry_currency);

        let amount = if self.dry_run {
            decision.amount
        } else {
            let rounded = ctx
                .client
                .round_to_precision(decision.amount, &quote.pair, OrderSide::Sell)
                .await;

            if let Ok(product) = ctx.client.get_product(&quote.pair).await {
                if rounded < product.base_min_size {
                    ctx.tracker.flag_too_small_to_sell(&decision.asset);
                    return Ok(ExecutionOutcome::Aborted {
                        reason: format!(
                            "rounded amount {:.8} is below the minimum order size {:.8} for {}",
                            rounded, product.base_min_size, quote.pair
                        ),
                    });
                }
            }

            tracing::info!(
                "placing SELL order: {:.8} {} on {}",
                rounded,
                decision.asset,
                quote.pair
            );
            match ctx
                .client
                .place_order(&quote.pair, OrderSide::Sell, rounded, AmountKind::BaseSize)
                .await
            {
                Ok(OrderOutcome::Filled { order_id }) => {
                    tracing::info!("SELL order filled: {}", order_id);
                    rounded
                }
                Ok(OrderOutcome::Rejected { reason }) => {
                    tracing::error!("SELL order rejected for {}: {}", decision.asset, reason);
                    return Ok(ExecutionOutcome::Aborted { reason });
                }
                Err(e) => {
                    tracing::error!("SELL order failed for {}: {}", decision.asset, e);
                    return Ok(ExecutionOutcome::Aborted {
                        reason: e.to_string(),
                    });
                }
            }
        };

        let gross_eur = ctx.converter.to_eur(amount * quote.price, &quote.currency);
        let fee_eur = gross_eur * self.taker_fee_rate;
        let net_eur = gross_eur - fee_eur;
        let pnl_eur = net_eur - amount * entry_eur;

        *ctx.budget_eur += net_eur;

        if decision.is_full_exit {
            ctx.tracker
                .record_full_exit(&decision.asset, quote, amount, now)?;
        } else {
            ctx.tracker.record_partial_sell(&decision.asset, amount)?;
        }

        tracing::info!(
            "{}SELL {:.8} {} @ {:.8} {} | gross €{:.2}, fee €{:.2}, net €{:.2}, P&L €{:+.2}",
            if self.dry_run { "[DRY RUN] " } else { "" },
            amount,
            decision.asset,
            quote.price,
            quote.currency,
            gross_eur,
            fee_eur,
            net_eur,
            pnl_eur
        );

        Ok(ExecutionOutcome::Executed {
            budget_delta_eur: net_eur,
            fee_eur,
            pnl_eur: Some(pnl_eur),
        })
    }

    pub async fn execute_buy(
        &self,
        ctx: &mut ExecutionContext<'_>,
        decision: &BuyDecision,
        now: DateTime<Utc>,
    ) -> Result<ExecutionOutcome> {
        let quote = &decision.quote;

        let notional_eur = decision.notional_eur;
        let fee_eur = notional_eur * self.taker_fee_rate;
        let total_eur = notional_eur + fee_eur;

        // The order is sized in the pair's quote currency; the baseline is
        // recorded in base units bought at the quoted price.
        let notional_quote = ctx.converter.from_eur(notional_eur, &quote.currency);
        let base_amount = notional_quote / quote.price;

        if !self.dry_run {
            tracing::info!(
                "placing BUY order: {} {:.2} of {} on {}",
                quote.currency,
                notional_quote,
                decision.asset,
                quote.pair
            );
            match ctx
                .client
                .place_order(
                    &quote.pair,
                    OrderSide::Buy,
                    notional_quote,
                    AmountKind::QuoteSize,
                )
                .await
            {
                Ok(OrderOutcome::Filled { order_id }) => {
                    tracing::info!("BUY order filled: {}", order_id);
                }
                Ok(OrderOutcome::Rejected { reason }) => {
                    tracing::error!("BUY order rejected for {}: {}", decision.asset, reason);
                    return Ok(ExecutionOutcome::Aborted { reason });
                }
                Err(e) => {
                    tracing::error!("BUY order failed for {}: {}", decision.asset, e);
                    return Ok(ExecutionOutcome::Aborted {
                        reason: e.to_string(),
                    });
                }
            }
        }

        *ctx.budget_eur -= total_eur;
        let was_reentry = ctx
            .tracker
            .record_buy(&decision.asset, quote, base_amount, now);

        tracing::info!(
            "{}BUY {:.8} {} @ {:.8} {} | cost €{:.2}, fee €{:.2}, total €{:.2}{}",
            if self.dry_run { "[DRY RUN] " } else { "" },
            base_amount,
            decision.asset,
            quote.price,
            quote.currency,
            notional_eur,
            fee_eur,
            total_eur,
            if was_reentry { " (re-entry)" } else { "" }
        );

        Ok(ExecutionOutcome::Executed {
            budget_delta_eur: -total_eur,
            fee_eur,
            pnl_eur: None,
        })
    }
}
