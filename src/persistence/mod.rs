use crate::models::{Position, PriceHistoryEntry, SoldPosition};
use crate::strategy::TriggerConfig;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

/// Trigger thresholds as they appear in the state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSettings {
    pub profit_target_percent: f64,
    pub profit_target_sell_percent: f64,
    pub final_profit_target_percent: f64,
    pub stop_loss_percent: f64,
    pub buy_dip_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeSettings {
    pub taker_fee_rate: f64,
}

/// The single durable document: configuration and trading state together.
///
/// Rewritten wholesale after every mutation; this file is the system of
/// record across restarts. The history and sold-position sections default to
/// empty so a freshly written config loads cleanly on first run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    pub trading_budget_eur: f64,
    pub minimum_balance_eur: f64,
    pub check_interval_minutes: u64,
    pub dry_run: bool,
    pub tracked_assets: Vec<String>,
    #[serde(default)]
    pub buy_assets: Vec<String>,
    #[serde(default)]
    pub buy_amount_eur: f64,
    pub triggers: TriggerSettings,
    pub fees: FeeSettings,
    #[serde(default)]
    pub position_tracking: HashMap<String, Position>,
    #[serde(default)]
    pub price_history: HashMap<String, Vec<PriceHistoryEntry>>,
    #[serde(default)]
    pub sold_positions: HashMap<String, SoldPosition>,
}

impl StateDocument {
    /// Startup validation. An invalid document is fatal: monitoring must not
    /// begin on top of it.
    pub fn validate(&self) -> Result<()> {
        if self.trading_budget_eur <= 0.0 {
            bail!(
                "trading_budget_eur must be positive, got {}",
                self.trading_budget_eur
            );
        }
        if self.minimum_balance_eur < 0.0 {
            bail!(
                "minimum_balance_eur must not be negative, got {}",
                self.minimum_balance_eur
            );
        }
        if self.check_interval_minutes == 0 {
            bail!("check_interval_minutes must be at least 1");
        }
        if self.tracked_assets.is_empty() {
            bail!("tracked_assets must not be empty");
        }

        let t = &self.triggers;
        for (name, value) in [
            ("profit_target_percent", t.profit_target_percent),
            ("final_profit_target_percent", t.final_profit_target_percent),
            ("stop_loss_percent", t.stop_loss_percent),
            ("buy_dip_percent", t.buy_dip_percent),
        ] {
            if value <= 0.0 {
                bail!("triggers.{} must be positive, got {}", name, value);
            }
        }
        if t.profit_target_sell_percent <= 0.0 || t.profit_target_sell_percent >= 100.0 {
            bail!(
                "triggers.profit_target_sell_percent must be between 0 and 100 exclusive, got {}",
                t.profit_target_sell_percent
            );
        }
        if !(0.0..1.0).contains(&self.fees.taker_fee_rate) {
            bail!(
                "fees.taker_fee_rate must be in [0, 1), got {}",
                self.fees.taker_fee_rate
            );
        }
        if !self.buy_assets.is_empty() && self.buy_amount_eur <= 0.0 {
            bail!("buy_amount_eur must be positive when buy_assets is set");
        }

        for (asset, position) in &self.position_tracking {
            if position.total_sold < 0.0 || position.total_sold >= position.amount {
                bail!(
                    "position {} violates 0 <= total_sold < amount ({} of {})",
                    asset,
                    position.total_sold,
                    position.amount
                );
            }
        }

        Ok(())
    }

    /// Flatten the threshold sections into the evaluator's config view.
    pub fn trigger_config(&self) -> TriggerConfig {
        TriggerConfig {
            profit_target_percent: self.triggers.profit_target_percent,
            profit_target_sell_percent: self.triggers.profit_target_sell_percent,
            final_profit_target_percent: self.triggers.final_profit_target_percent,
            stop_loss_percent: self.triggers.stop_loss_percent,
            buy_dip_percent: self.triggers.buy_dip_percent,
            buy_amount_eur: self.buy_amount_eur,
            taker_fee_rate: self.fees.taker_fee_rate,
        }
    }
}

/// Loads and atomically rewrites the state document.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn load(&self) -> Result<StateDocument> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read state document {}", self.path.display()))?;

        let document: StateDocument = serde_json::from_str(&raw)
            .with_context(|| format!("invalid state document {}", self.path.display()))?;

        document.validate()?;
        Ok(document)
    }

    /// Whole-document replace: write to a sibling temp file, then rename over
    /// the original. A crash mid-write leaves the previous snapshot intact;
    /// a partial document is never observable.
    pub fn save(&self, document: &StateDocument) -> Result<()> {
        let json = serde_json::to_string_pretty(document)
            .context("failed to serialize state document")?;

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json)
            .with_context(|| format!("failed to write snapshot {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| {
            format!(
                "failed to replace snapshot {} with {}",
                self.path.display(),
                tmp.display()
            )
        })?;

        tracing::debug!("state snapshot written to {}", self.path.display());
        Ok(())
    }
}
