use crate::convert::CurrencyConverter;
use crate::models::{Position, PriceQuote, SoldPosition};
use std::fmt;

/// A re-entry fires when the price sits in this band below the recorded sale
/// price (inclusive on both ends).
const REENTRY_MIN_DROP_PCT: f64 = 10.0;
const REENTRY_MAX_DROP_PCT: f64 = 15.0;

/// Immutable per-run trigger thresholds.
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub profit_target_percent: f64,
    pub profit_target_sell_percent: f64,
    pub final_profit_target_percent: f64,
    pub stop_loss_percent: f64,
    pub buy_dip_percent: f64,
    pub buy_amount_eur: f64,
    pub taker_fee_rate: f64,
}

/// Which sell rule fired, carrying the EUR percentage change that tripped it.
#[derive(Debug, Clone, PartialEq)]
pub enum SellTrigger {
    FinalProfitTarget { pct_change: f64 },
    ProfitTarget { pct_change: f64 },
    StopLoss { pct_change: f64 },
}

impl fmt::Display for SellTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SellTrigger::FinalProfitTarget { pct_change } => {
                write!(f, "final profit target hit: {:+.2}%", pct_change)
            }
            SellTrigger::ProfitTarget { pct_change } => {
                write!(f, "profit target hit: {:+.2}%", pct_change)
            }
            SellTrigger::StopLoss { pct_change } => {
                write!(f, "stop loss hit: {:+.2}%", pct_change)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SellDecision {
    pub asset: String,
    /// Base units to sell
    pub amount: f64,
    pub quote: PriceQuote,
    pub trigger: SellTrigger,
    pub is_full_exit: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuyTrigger {
    DipFromHigh { rolling_high_eur: f64, drop_pct: f64 },
    Reentry { sale_price_eur: f64, drop_pct: f64 },
}

impl fmt::Display for BuyTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuyTrigger::DipFromHigh {
                rolling_high_eur,
                drop_pct,
            } => write!(
                f,
                "dip buy: {:.2}% below 7-day high of €{:.4}",
                drop_pct, rolling_high_eur
            ),
            BuyTrigger::Reentry {
                sale_price_eur,
                drop_pct,
            } => write!(
                f,
                "re-entry: {:.2}% below sale price of €{:.4}",
                drop_pct, sale_price_eur
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuyDecision {
    pub asset: String,
    /// EUR notional to spend
    pub notional_eur: f64,
    pub quote: PriceQuote,
    pub trigger: BuyTrigger,
}

/// `(current − entry) / entry × 100`, both operands in EUR.
pub fn percentage_change(entry_eur: f64, current_eur: f64) -> f64 {
    (current_eur - entry_eur) / entry_eur * 100.0
}

struct SellContext<'a> {
    position: &'a Position,
    quote: &'a PriceQuote,
    config: &'a TriggerConfig,
    held_amount: f64,
    pct_change: f64,
}

type SellRule = fn(&SellContext) -> Option<SellDecision>;

/// Sell rules in precedence order; the first match wins. The final-profit
/// rule sits above the partial-profit rule so a large enough gain always
/// takes the full exit.
const SELL_RULES: &[SellRule] = &[final_profit_target, profit_target, stop_loss];

fn final_profit_target(ctx: &SellContext) -> Option<SellDecision> {
    if ctx.pct_change >= ctx.config.final_profit_target_percent {
        return Some(SellDecision {
            asset: ctx.position.asset.clone(),
            amount: ctx.held_amount,
            quote: ctx.quote.clone(),
            trigger: SellTrigger::FinalProfitTarget {
                pct_change: ctx.pct_change,
            },
            is_full_exit: true,
        });
    }
    None
}

/// Fires at most once per position lifetime: once `total_sold` is non-zero
/// the partial target is spent.
fn profit_target(ctx: &SellContext) -> Option<SellDecision> {
    if ctx.pct_change >= ctx.config.profit_target_percent && ctx.position.total_sold == 0.0 {
        let sell_amount = ctx.position.amount * (ctx.config.profit_target_sell_percent / 100.0);
        return Some(SellDecision {
            asset: ctx.position.asset.clone(),
            amount: sell_amount,
            quote: ctx.quote.clone(),
            trigger: SellTrigger::ProfitTarget {
                pct_change: ctx.pct_change,
            },
            is_full_exit: false,
        });
    }
    None
}

fn stop_loss(ctx: &SellContext) -> Option<SellDecision> {
    if ctx.pct_change <= -ctx.config.stop_loss_percent {
        return Some(SellDecision {
            asset: ctx.position.asset.clone(),
            amount: ctx.held_amount,
            quote: ctx.quote.clone(),
            trigger: SellTrigger::StopLoss {
                pct_change: ctx.pct_change,
            },
            is_full_exit: true,
        });
    }
    None
}

/// Evaluate the sell-side rule list for a tracked position against the
/// current quote. Entry and current prices are both converted to EUR before
/// comparison, so cross-currency baselines compare correctly and the
/// same-currency case is just the identity conversion.
pub fn evaluate_sell(
    position: &Position,
    held_amount: f64,
    quote: &PriceQuote,
    config: &TriggerConfig,
    converter: &CurrencyConverter,
) -> Option<SellDecision> {
    let entry_eur = converter.to_eur(position.entry_price, &position.entry_currency);
    let current_eur = converter.to_eur(quote.price, &quote.currency);
    let pct_change = percentage_change(entry_eur, current_eur);

    let ctx = SellContext {
        position,
        quote,
        config,
        held_amount,
        pct_change,
    };

    SELL_RULES.iter().find_map(|rule| rule(&ctx))
}

/// Dip buy: the asset's current EUR price sits at least `buy_dip_percent`
/// below the 7-day rolling high. No high recorded means no signal.
pub fn evaluate_dip_buy(
    asset: &str,
    quote: &PriceQuote,
    rolling_high_eur: Option<f64>,
    config: &TriggerConfig,
    converter: &CurrencyConverter,
) -> Option<BuyDecision> {
    let high = rolling_high_eur?;
    if high <= 0.0 {
        return None;
    }

    let current_eur = converter.to_eur(quote.price, &quote.currency);
    let drop_pct = (high - current_eur) / high * 100.0;

    if drop_pct >= config.buy_dip_percent {
        return Some(BuyDecision {
            asset: asset.to_string(),
            notional_eur: config.buy_amount_eur,
            quote: quote.clone(),
            trigger: BuyTrigger::DipFromHigh {
                rolling_high_eur: high,
                drop_pct,
            },
        });
    }
    None
}

/// Re-entry buy: the current EUR price is 10–15% below the recorded sale
/// price of a recently exited position.
pub fn evaluate_reentry(
    sold: &SoldPosition,
    quote: &PriceQuote,
    config: &TriggerConfig,
    converter: &CurrencyConverter,
) -> Option<BuyDecision> {
    let sale_eur = converter.to_eur(sold.sale_price, &sold.sale_currency);
    if sale_eur <= 0.0 {
        return None;
    }

    let current_eur = converter.to_eur(quote.price, &quote.currency);
    let drop_pct = (sale_eur - current_eur) / sale_eur * 100.0;

    if (REENTRY_MIN_DROP_PCT..=REENTRY_MAX_DROP_PCT).contains(&drop_pct) {
        return Some(BuyDecision {
            asset: sold.asset.clone(),
            notional_eur: config.buy_amount_eur,
            quote: quote.clone(),
            trigger: BuyTrigger::Reentry {
                sale_price_eur: sale_eur,
                drop_pct,
            },
        });
    }
    None
}

/// A buy may only go out if the running budget stays at or above the
/// minimum balance floor after paying cost plus fee.
pub fn can_afford_buy(
    budget_eur: f64,
    notional_eur: f64,
    taker_fee_rate: f64,
    minimum_balance_eur: f64,
) -> bool {
    let total_cost = notional_eur * (1.0 + taker_fee_rate);
    budget_eur - total_cost >= minimum_balance_eur
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QuoteCurrency;
    use chrono::Utc;

    fn config() -> TriggerConfig {
        TriggerConfig {
            profit_target_percent: 25.0,
            profit_target_sell_percent: 50.0,
            final_profit_target_percent: 50.0,
            stop_loss_percent: 15.0,
            buy_dip_percent: 10.0,
            buy_amount_eur: 25.0,
            taker_fee_rate: 0.006,
        }
    }

    fn position(entry_price: f64, amount: f64, total_sold: f64) -> Position {
        Position {
            asset: "BTC".to_string(),
            entry_price,
            entry_currency: QuoteCurrency::Eur,
            amount,
            entry_time: Utc::now(),
            total_sold,
            too_small_to_sell: false,
        }
    }

    fn eur_quote(price: f64) -> PriceQuote {
        PriceQuote {
            price,
            currency: QuoteCurrency::Eur,
            best_bid: price,
            best_ask: price,
            pair: "BTC-EUR".to_string(),
        }
    }

    fn converter() -> CurrencyConverter {
        CurrencyConverter::with_rate(0.9)
    }

    #[test]
    fn test_final_profit_target_sells_everything() {
        // Entry 100, current 151: +51% clears the +50% final target
        let pos = position(100.0, 2.0, 0.0);
        let decision =
            evaluate_sell(&pos, 2.0, &eur_quote(151.0), &config(), &converter()).unwrap();

        assert!(decision.is_full_exit);
        assert_eq!(decision.amount, 2.0);
        assert!(matches!(
            decision.trigger,
            SellTrigger::FinalProfitTarget { .. }
        ));
    }

    #[test]
    fn test_final_target_takes_precedence_over_partial() {
        // +60% exceeds both thresholds; the full exit must win
        let pos = position(100.0, 2.0, 0.0);
        let decision =
            evaluate_sell(&pos, 2.0, &eur_quote(160.0), &config(), &converter()).unwrap();

        assert!(decision.is_full_exit);
        assert!(matches!(
            decision.trigger,
            SellTrigger::FinalProfitTarget { .. }
        ));
    }

    #[test]
    fn test_profit_target_sells_half_of_original() {
        // Entry 100, current 126: +26% clears +25%, sells 50% of original
        let pos = position(100.0, 2.0, 0.0);
        let decision =
            evaluate_sell(&pos, 2.0, &eur_quote(126.0), &config(), &converter()).unwrap();

        assert!(!decision.is_full_exit);
        assert_eq!(decision.amount, 1.0);
        assert!(matches!(decision.trigger, SellTrigger::ProfitTarget { .. }));
    }

    #[test]
    fn test_profit_target_fires_only_once() {
        // Same price, but a partial sell already happened
        let pos = position(100.0, 2.0, 1.0);
        let decision = evaluate_sell(&pos, 1.0, &eur_quote(126.0), &config(), &converter());

        assert!(decision.is_none());
    }

    #[test]
    fn test_stop_loss_full_exit() {
        // Entry 100, current 84: -16% breaches the -15% stop
        let pos = position(100.0, 2.0, 0.0);
        let decision =
            evaluate_sell(&pos, 2.0, &eur_quote(84.0), &config(), &converter()).unwrap();

        assert!(decision.is_full_exit);
        assert_eq!(decision.amount, 2.0);
        assert!(matches!(decision.trigger, SellTrigger::StopLoss { .. }));
    }

    #[test]
    fn test_stop_loss_applies_after_partial_sell() {
        let pos = position(100.0, 2.0, 1.0);
        let decision =
            evaluate_sell(&pos, 1.0, &eur_quote(84.0), &config(), &converter()).unwrap();

        assert!(decision.is_full_exit);
        // Remaining held amount, not the original
        assert_eq!(decision.amount, 1.0);
    }

    #[test]
    fn test_no_trigger_inside_thresholds() {
        let pos = position(100.0, 2.0, 0.0);

        for price in [90.0, 100.0, 110.0, 124.9] {
            assert!(
                evaluate_sell(&pos, 2.0, &eur_quote(price), &config(), &converter()).is_none(),
                "unexpected trigger at {}",
                price
            );
        }
    }

    #[test]
    fn test_cross_currency_change_is_compared_in_eur() {
        // Entry 100 USDC at rate 0.9 = 90 EUR; current 136 EUR = +51.1%
        let mut pos = position(100.0, 2.0, 0.0);
        pos.entry_currency = QuoteCurrency::Usdc;

        let decision =
            evaluate_sell(&pos, 2.0, &eur_quote(136.0), &config(), &converter()).unwrap();

        assert!(matches!(
            decision.trigger,
            SellTrigger::FinalProfitTarget { .. }
        ));
    }

    #[test]
    fn test_percentage_change() {
        assert_eq!(percentage_change(100.0, 151.0), 51.0);
        assert_eq!(percentage_change(100.0, 84.0), -16.0);
        assert_eq!(percentage_change(50.0, 50.0), 0.0);
    }

    #[test]
    fn test_dip_buy_triggers_below_threshold() {
        let decision = evaluate_dip_buy(
            "SOL",
            &eur_quote(89.0),
            Some(100.0),
            &config(),
            &converter(),
        )
        .unwrap();

        assert_eq!(decision.asset, "SOL");
        assert_eq!(decision.notional_eur, 25.0);
        assert!(matches!(decision.trigger, BuyTrigger::DipFromHigh { .. }));
    }

    #[test]
    fn test_dip_buy_needs_enough_of_a_drop() {
        let decision = evaluate_dip_buy(
            "SOL",
            &eur_quote(95.0),
            Some(100.0),
            &config(),
            &converter(),
        );

        assert!(decision.is_none());
    }

    #[test]
    fn test_dip_buy_needs_a_recorded_high() {
        let decision = evaluate_dip_buy("SOL", &eur_quote(50.0), None, &config(), &converter());

        assert!(decision.is_none());
    }

    #[test]
    fn test_current_high_never_dips_below_itself() {
        // The freshly recorded extreme is the high: 0% drop, no trigger
        let decision = evaluate_dip_buy(
            "SOL",
            &eur_quote(100.0),
            Some(100.0),
            &config(),
            &converter(),
        );

        assert!(decision.is_none());
    }

    fn sold(sale_price: f64) -> SoldPosition {
        let now = Utc::now();
        SoldPosition {
            asset: "ETH".to_string(),
            sale_price,
            sale_currency: QuoteCurrency::Eur,
            sale_amount: 1.0,
            sale_time: now,
            expires_at: now + chrono::Duration::days(30),
        }
    }

    #[test]
    fn test_reentry_inside_band() {
        // 12% below the 100 sale price
        let decision =
            evaluate_reentry(&sold(100.0), &eur_quote(88.0), &config(), &converter()).unwrap();

        assert_eq!(decision.asset, "ETH");
        assert!(matches!(decision.trigger, BuyTrigger::Reentry { .. }));
    }

    #[test]
    fn test_reentry_band_is_inclusive() {
        assert!(evaluate_reentry(&sold(100.0), &eur_quote(90.0), &config(), &converter()).is_some());
        assert!(evaluate_reentry(&sold(100.0), &eur_quote(85.0), &config(), &converter()).is_some());
    }

    #[test]
    fn test_reentry_outside_band() {
        // 5% below: not deep enough
        assert!(evaluate_reentry(&sold(100.0), &eur_quote(95.0), &config(), &converter()).is_none());
        // 20% below: too deep, the dip looks like a real decline
        assert!(evaluate_reentry(&sold(100.0), &eur_quote(80.0), &config(), &converter()).is_none());
    }

    #[test]
    fn test_can_afford_buy_respects_floor() {
        // 25 notional + 0.15 fee = 25.15 total
        assert!(can_afford_buy(150.0, 25.0, 0.006, 100.0));
        assert!(!can_afford_buy(125.0, 25.0, 0.006, 100.0));
    }
}
