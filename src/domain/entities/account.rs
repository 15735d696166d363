//! Account state: per-asset balances and the derived account metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::LedgerError;

/// Holdings of a single asset. `total == free + locked` at all times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: f64,
    pub locked: f64,
    pub total: f64,
}

impl AssetBalance {
    pub fn empty(asset: impl Into<String>) -> Self {
        Self {
            asset: asset.into(),
            free: 0.0,
            locked: 0.0,
            total: 0.0,
        }
    }

    pub fn credit(&mut self, amount: f64) {
        self.free += amount;
        self.total = self.free + self.locked;
    }

    /// Removes `amount` from the free balance. Fails without touching the
    /// balance if not enough is free.
    pub fn debit(&mut self, amount: f64) -> Result<(), LedgerError> {
        if amount > self.free {
            return Err(LedgerError::InsufficientFunds {
                asset: self.asset.clone(),
                requested: amount,
                available: self.free,
            });
        }
        self.free -= amount;
        self.total = self.free + self.locked;
        Ok(())
    }

    /// Applies a signed adjustment (realized PnL, fees) to the free balance.
    /// Losses may take the free balance below zero.
    pub fn adjust(&mut self, delta: f64) {
        self.free += delta;
        self.total = self.free + self.locked;
    }

    /// Check the `total == free + locked` invariant.
    pub fn validate(&self) -> Result<(), String> {
        if self.locked < 0.0 {
            return Err(format!("{}: locked balance must be non-negative", self.asset));
        }
        let sum = self.free + self.locked;
        if (sum - self.total).abs() > 1e-9 {
            return Err(format!(
                "Invariant violated for {}: total ({}) != free ({}) + locked ({})",
                self.asset, self.total, self.free, self.locked
            ));
        }
        Ok(())
    }
}

/// Derived account metrics, recomputed wholesale after every price update
/// or mutation. Only `identity` and `realized_pnl` carry state of their own.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub identity: String,
    /// Value of all balances converted to the settlement asset.
    pub balance: f64,
    pub equity: f64,
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub realized_pnl: f64,
    pub margin: f64,
    #[serde(default)]
    pub order_margin: f64,
    pub available_funds: f64,
    pub updated_at: DateTime<Utc>,
}

impl AccountInfo {
    pub fn new(identity: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            identity: identity.into(),
            balance: 0.0,
            equity: 0.0,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            margin: 0.0,
            order_margin: 0.0,
            available_funds: 0.0,
            updated_at: now,
        }
    }
}
