use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::entities::order::{OrderId, OrderSide};

pub type ExecutionId = u64;

/// Immutable fill record. The ledger only ever appends these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub order_id: OrderId,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
    /// PnL realized by the part of this fill that reduced an opposite position.
    #[serde(default)]
    pub realized_pnl: f64,
    pub timestamp: DateTime<Utc>,
}
