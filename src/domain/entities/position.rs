use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entities::order::OrderSide;

pub type PositionId = u64;

pub const QUANTITY_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// +1 for long, -1 for short.
    pub fn direction(&self) -> f64 {
        match self {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
        }
    }

    /// Order side that opens or adds to a position of this side.
    pub fn opening_side(&self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }
}

impl From<OrderSide> for PositionSide {
    fn from(side: OrderSide) -> Self {
        match side {
            OrderSide::Buy => PositionSide::Long,
            OrderSide::Sell => PositionSide::Short,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// An open position. A position whose quantity reaches zero is removed
/// from the ledger, so `quantity` is always positive while it exists.
///
/// `mark_price`, `unrealized_pnl`, `liquidation_price` and `risk_reward`
/// are derived and rewritten by [`Position::mark`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: f64,
    pub avg_price: f64,
    pub leverage: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub mark_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub liquidation_price: Option<f64>,
    #[serde(default)]
    pub risk_reward: Option<f64>,
    pub opened_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn open(
        id: PositionId,
        symbol: impl Into<String>,
        side: PositionSide,
        quantity: f64,
        price: f64,
        leverage: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Position {
            id,
            symbol: symbol.into(),
            side,
            quantity,
            avg_price: price,
            leverage,
            stop_loss: None,
            take_profit: None,
            mark_price: price,
            unrealized_pnl: 0.0,
            liquidation_price: None,
            risk_reward: None,
            opened_at: now,
            updated_at: now,
        }
    }

    /// Nets a same-side fill: quantity adds up, average price is the
    /// quantity-weighted mean of all fills.
    pub fn add_fill(&mut self, quantity: f64, price: f64, now: DateTime<Utc>) {
        let total = self.quantity + quantity;
        self.avg_price = (self.avg_price * self.quantity + price * quantity) / total;
        self.quantity = total;
        self.updated_at = now;
    }

    /// Removes up to `quantity` and returns the amount actually removed.
    pub fn reduce(&mut self, quantity: f64, now: DateTime<Utc>) -> f64 {
        let closed = quantity.min(self.quantity);
        self.quantity -= closed;
        // Float dust left by partial closes counts as flat.
        if self.quantity <= QUANTITY_EPSILON {
            self.quantity = 0.0;
        }
        self.updated_at = now;
        closed
    }

    pub fn is_closed(&self) -> bool {
        self.quantity <= 0.0
    }

    /// PnL of `quantity` units if closed at `price`.
    pub fn pnl_at(&self, price: f64, quantity: f64) -> f64 {
        (price - self.avg_price) * quantity * self.side.direction()
    }

    pub fn notional(&self) -> f64 {
        self.avg_price * self.quantity
    }

    pub fn margin(&self) -> f64 {
        self.notional() / self.leverage
    }

    /// Rewrites every derived field from `mark_price`.
    pub fn mark(&mut self, mark_price: f64, maintenance_margin_rate: f64) {
        self.mark_price = mark_price;
        self.unrealized_pnl = self.pnl_at(mark_price, self.quantity);
        self.liquidation_price = self.isolated_liquidation_price(maintenance_margin_rate);
        self.risk_reward = self.risk_reward_ratio();
    }

    /// Isolated-margin liquidation price: the mark at which the loss eats the
    /// posted margin down to the maintenance requirement.
    pub fn isolated_liquidation_price(&self, maintenance_margin_rate: f64) -> Option<f64> {
        let price = match self.side {
            PositionSide::Long => {
                self.avg_price * (1.0 - 1.0 / self.leverage + maintenance_margin_rate)
            }
            PositionSide::Short => {
                self.avg_price * (1.0 + 1.0 / self.leverage - maintenance_margin_rate)
            }
        };
        (price.is_finite() && price > 0.0).then_some(price)
    }

    /// Distance to take profit over distance to stop loss.
    pub fn risk_reward_ratio(&self) -> Option<f64> {
        let (stop_loss, take_profit) = (self.stop_loss?, self.take_profit?);
        let risk = (self.avg_price - stop_loss).abs();
        let reward = (take_profit - self.avg_price).abs();
        (risk > 0.0).then(|| reward / risk)
    }
}
