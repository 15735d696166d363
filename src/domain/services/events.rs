//! Typed ledger events published on a broadcast bus.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::domain::entities::account::{AccountInfo, AssetBalance};
use crate::domain::entities::execution::Execution;
use crate::domain::entities::order::Order;
use crate::domain::entities::position::Position;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum LedgerEvent {
    OrderUpdated(Order),
    PositionUpdated(Position),
    /// Final state of a position that was fully closed and removed.
    PositionClosed(Position),
    ExecutionAdded(Execution),
    AccountUpdated(AccountInfo),
    BalancesUpdated(Vec<AssetBalance>),
}

/// Fan-out of ledger events to any number of consumers. Publishing with no
/// subscriber is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: LedgerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
