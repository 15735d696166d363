//! Broker Actor
//!
//! Owns the ledger for one identity. Every mutation, every price tick and
//! every simulated fill goes through one mailbox, so the ledger never sees
//! two operations at once and a fill always reads the latest price processed
//! before it. Fills are scheduled messages posted back into the same mailbox.
//!
//! Streamed ticks bypass the queue: they land in a per-symbol latest-price
//! slot that the actor drains before handling any message, so a burst never
//! fills the mailbox and the newest price is never dropped.

use futures_util::FutureExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::application::services::scheduler::{ScheduledJob, Scheduler};
use crate::config::AppConfig;
use crate::domain::entities::account::{AccountInfo, AssetBalance};
use crate::domain::entities::execution::Execution;
use crate::domain::entities::order::{Order, OrderId, OrderRequest, OrderStatus};
use crate::domain::entities::position::{Position, PositionId};
use crate::domain::errors::{BrokerError, LedgerError};
use crate::domain::repositories::snapshot_store::SnapshotStore;
use crate::domain::services::clock::Clock;
use crate::domain::services::events::{EventBus, LedgerEvent};
use crate::domain::services::ledger::{Ledger, LedgerConfig, PositionUpdate};

/// Channel reply timeout duration (5 seconds)
const CHANNEL_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

const MAILBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub identity: String,
    pub ledger: LedgerConfig,
    /// Delay between accepting an order and filling it.
    pub fill_latency: Duration,
}

impl BrokerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            identity: config.identity.clone(),
            ledger: config.ledger_config(),
            fill_latency: config.fill_latency,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            identity: "default".to_string(),
            ledger: LedgerConfig::default(),
            fill_latency: Duration::from_millis(500),
        }
    }
}

type Reply<T> = mpsc::Sender<Result<T, BrokerError>>;

/// Ticks posted since the actor last looked, newest price per symbol.
#[derive(Debug, Default)]
struct PostedPrices {
    latest: HashMap<String, f64>,
    wake_queued: bool,
}

type PostedSlot = Arc<Mutex<PostedPrices>>;

fn lock_posted(slot: &PostedSlot) -> MutexGuard<'_, PostedPrices> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Messages that can be sent to the broker actor
#[derive(Debug)]
pub enum BrokerMessage {
    /// Load the identity's snapshot and start accepting mutations
    Connect { reply: Reply<AccountInfo> },
    /// Persist, drop pending fills and stop accepting mutations
    Disconnect { reply: Reply<()> },
    GetAccountInfo { reply: mpsc::Sender<AccountInfo> },
    GetPositions { reply: mpsc::Sender<Vec<Position>> },
    GetOrders { reply: mpsc::Sender<Vec<Order>> },
    GetExecutions { reply: mpsc::Sender<Vec<Execution>> },
    GetBalances { reply: mpsc::Sender<Vec<AssetBalance>> },
    Deposit {
        asset: String,
        amount: f64,
        reply: Reply<AssetBalance>,
    },
    Withdraw {
        asset: String,
        amount: f64,
        reply: Reply<AssetBalance>,
    },
    PlaceOrder {
        request: OrderRequest,
        reply: Reply<Order>,
    },
    CancelOrder { id: OrderId, reply: Reply<Order> },
    ClosePosition {
        id: PositionId,
        quantity: Option<f64>,
        reply: Reply<Execution>,
    },
    ModifyPosition {
        id: PositionId,
        update: PositionUpdate,
        reply: Reply<Position>,
    },
    /// Last-trade price from the market-data layer
    UpdatePrice {
        symbol: String,
        price: f64,
        reply: mpsc::Sender<bool>,
    },
    /// Wake-up after ticks were left in the latest-price slot
    PricesPosted,
    /// Posted by the scheduler once the fill latency has elapsed
    FillOrder { id: OrderId },
    SwitchIdentity {
        identity: String,
        reply: Reply<AccountInfo>,
    },
    Shutdown,
}

pub struct BrokerActor {
    settings: BrokerSettings,
    ledger: Ledger,
    store: Arc<dyn SnapshotStore>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    mailbox: mpsc::WeakSender<BrokerMessage>,
    posted: PostedSlot,
    fills: HashMap<OrderId, ScheduledJob>,
    connected: bool,
}

impl BrokerActor {
    /// Spawn the broker actor. It starts disconnected with an empty ledger;
    /// `connect` loads the identity's snapshot.
    pub fn spawn(
        settings: BrokerSettings,
        store: Arc<dyn SnapshotStore>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
    ) -> BrokerHandle {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let events = EventBus::default();
        let ledger = Ledger::new(
            settings.identity.clone(),
            settings.ledger.clone(),
            clock.clone(),
            events.clone(),
        );
        let identity = settings.identity.clone();
        let posted = PostedSlot::default();

        let actor = Self {
            settings,
            ledger,
            store,
            scheduler,
            clock,
            events: events.clone(),
            mailbox: tx.downgrade(),
            posted: posted.clone(),
            fills: HashMap::new(),
            connected: false,
        };
        tokio::spawn(actor.run(rx));

        info!("BrokerActor spawned for identity: {}", identity);
        BrokerHandle {
            sender: tx,
            events,
            posted,
        }
    }

    /// Main actor loop
    async fn run(mut self, mut rx: mpsc::Receiver<BrokerMessage>) {
        info!("BrokerActor {} started", self.settings.identity);

        while let Some(msg) = rx.recv().await {
            self.apply_posted_prices();
            match msg {
                BrokerMessage::Connect { reply } => {
                    let result = self.connect().await;
                    respond(reply, result, "Connect").await;
                }
                BrokerMessage::Disconnect { reply } => {
                    self.disconnect().await;
                    respond(reply, Ok(()), "Disconnect").await;
                }
                BrokerMessage::GetAccountInfo { reply } => {
                    respond(reply, self.ledger.account().clone(), "GetAccountInfo").await;
                }
                BrokerMessage::GetPositions { reply } => {
                    respond(reply, self.ledger.positions(), "GetPositions").await;
                }
                BrokerMessage::GetOrders { reply } => {
                    respond(reply, self.ledger.orders(), "GetOrders").await;
                }
                BrokerMessage::GetExecutions { reply } => {
                    respond(reply, self.ledger.executions().to_vec(), "GetExecutions").await;
                }
                BrokerMessage::GetBalances { reply } => {
                    respond(reply, self.ledger.balances(), "GetBalances").await;
                }
                BrokerMessage::Deposit {
                    asset,
                    amount,
                    reply,
                } => {
                    let result = self.mutate(|ledger| ledger.deposit(&asset, amount)).await;
                    log_outcome("Deposit", &result);
                    respond(reply, result, "Deposit").await;
                }
                BrokerMessage::Withdraw {
                    asset,
                    amount,
                    reply,
                } => {
                    let result = self.mutate(|ledger| ledger.withdraw(&asset, amount)).await;
                    log_outcome("Withdraw", &result);
                    respond(reply, result, "Withdraw").await;
                }
                BrokerMessage::PlaceOrder { request, reply } => {
                    let result = self.mutate(|ledger| ledger.place_order(request)).await;
                    if let Ok(order) = &result {
                        if order.status == OrderStatus::Working {
                            self.schedule_fill(order.id);
                        }
                    }
                    log_outcome("PlaceOrder", &result);
                    respond(reply, result, "PlaceOrder").await;
                }
                BrokerMessage::CancelOrder { id, reply } => {
                    let result = self.mutate(|ledger| ledger.cancel_order(id)).await;
                    if result.is_ok() {
                        if let Some(job) = self.fills.remove(&id) {
                            job.cancel();
                        }
                    }
                    log_outcome("CancelOrder", &result);
                    respond(reply, result, "CancelOrder").await;
                }
                BrokerMessage::ClosePosition {
                    id,
                    quantity,
                    reply,
                } => {
                    let result = self
                        .mutate(|ledger| ledger.close_position(id, quantity))
                        .await;
                    log_outcome("ClosePosition", &result);
                    respond(reply, result, "ClosePosition").await;
                }
                BrokerMessage::ModifyPosition { id, update, reply } => {
                    let result = self
                        .mutate(|ledger| ledger.modify_position(id, update))
                        .await;
                    log_outcome("ModifyPosition", &result);
                    respond(reply, result, "ModifyPosition").await;
                }
                BrokerMessage::UpdatePrice {
                    symbol,
                    price,
                    reply,
                } => {
                    let accepted = self.ledger.update_price(&symbol, price);
                    respond(reply, accepted, "UpdatePrice").await;
                }
                BrokerMessage::PricesPosted => {}
                BrokerMessage::FillOrder { id } => {
                    self.fill(id).await;
                }
                BrokerMessage::SwitchIdentity { identity, reply } => {
                    let result = self.switch_identity(identity).await;
                    respond(reply, result, "SwitchIdentity").await;
                }
                BrokerMessage::Shutdown => {
                    info!("BrokerActor {} shutting down", self.settings.identity);
                    if self.connected {
                        self.disconnect().await;
                    }
                    break;
                }
            }
        }

        self.cancel_fills();
        info!("BrokerActor {} stopped", self.settings.identity);
    }

    fn apply_posted_prices(&mut self) {
        let latest = {
            let mut posted = lock_posted(&self.posted);
            posted.wake_queued = false;
            std::mem::take(&mut posted.latest)
        };
        for (symbol, price) in latest {
            self.ledger.update_price(&symbol, price);
        }
    }

    async fn connect(&mut self) -> Result<AccountInfo, BrokerError> {
        if !self.connected {
            let identity = self.settings.identity.clone();
            self.load(&identity).await?;
            self.connected = true;
            info!("Broker connected for {}", identity);
        }
        Ok(self.ledger.account().clone())
    }

    async fn disconnect(&mut self) {
        if !self.connected {
            return;
        }
        self.cancel_fills();
        self.persist().await;
        self.connected = false;
        info!("Broker disconnected for {}", self.settings.identity);
    }

    async fn switch_identity(&mut self, identity: String) -> Result<AccountInfo, BrokerError> {
        let identity = identity.trim().to_string();
        if identity.is_empty() {
            return Err(LedgerError::InvalidOrder("identity must not be empty".to_string()).into());
        }
        if self.connected && identity == self.settings.identity {
            return Ok(self.ledger.account().clone());
        }

        if self.connected {
            self.cancel_fills();
            self.persist().await;
        }
        info!("Switching ledger identity {} -> {}", self.settings.identity, identity);
        self.load(&identity).await?;
        self.settings.identity = identity;
        self.connected = true;
        Ok(self.ledger.account().clone())
    }

    /// Replaces the ledger with the identity's persisted state, keeping the
    /// price table, and reschedules fills for orders still working.
    async fn load(&mut self, identity: &str) -> Result<(), BrokerError> {
        let snapshot = self.store.load(identity).await?;
        let prices = self.ledger.last_prices().clone();
        self.cancel_fills();

        let mut ledger = match snapshot {
            Some(snapshot) => {
                info!(
                    "Loaded snapshot for {}: {} balance(s), {} position(s), {} order(s)",
                    identity,
                    snapshot.balances.len(),
                    snapshot.positions.len(),
                    snapshot.orders.len()
                );
                Ledger::from_snapshot(
                    snapshot,
                    self.settings.ledger.clone(),
                    self.clock.clone(),
                    self.events.clone(),
                )
            }
            None => {
                info!("No snapshot for {}, starting a fresh account", identity);
                Ledger::new(
                    identity,
                    self.settings.ledger.clone(),
                    self.clock.clone(),
                    self.events.clone(),
                )
            }
        };
        ledger.seed_prices(&prices);
        self.ledger = ledger;

        for id in self.ledger.working_order_ids() {
            debug!("Rescheduling fill for working order {}", id);
            self.schedule_fill(id);
        }
        self.events
            .publish(LedgerEvent::BalancesUpdated(self.ledger.balances()));
        self.events
            .publish(LedgerEvent::AccountUpdated(self.ledger.account().clone()));
        Ok(())
    }

    async fn mutate<T>(
        &mut self,
        operation: impl FnOnce(&mut Ledger) -> Result<T, LedgerError>,
    ) -> Result<T, BrokerError> {
        if !self.connected {
            return Err(BrokerError::NotConnected);
        }
        let value = operation(&mut self.ledger)?;
        self.persist().await;
        Ok(value)
    }

    async fn fill(&mut self, id: OrderId) {
        if self.fills.remove(&id).is_none() {
            debug!("Ignoring stale fill for order {}", id);
            return;
        }
        match self.ledger.fill_order(id) {
            Ok(order) => {
                debug!("Order {} resolved as {}", id, order.status);
                self.persist().await;
            }
            Err(e) => warn!("Fill of order {} skipped: {}", id, e),
        }
    }

    fn schedule_fill(&mut self, id: OrderId) {
        let mailbox = self.mailbox.clone();
        let job = self.scheduler.schedule(
            self.settings.fill_latency,
            async move {
                if let Some(sender) = mailbox.upgrade() {
                    if sender.send(BrokerMessage::FillOrder { id }).await.is_err() {
                        debug!("Broker gone before order {} could fill", id);
                    }
                }
            }
            .boxed(),
        );
        if let Some(previous) = self.fills.insert(id, job) {
            previous.cancel();
        }
    }

    fn cancel_fills(&mut self) {
        for (_, job) in self.fills.drain() {
            job.cancel();
        }
    }

    async fn persist(&self) {
        let snapshot = self.ledger.snapshot();
        if let Err(e) = self.store.save(&snapshot).await {
            error!(
                "Failed to persist ledger for {}: {}",
                self.settings.identity, e
            );
        }
    }
}

async fn respond<T>(reply: mpsc::Sender<T>, value: T, what: &str) {
    if reply.send(value).await.is_err() {
        error!("Failed to send {} reply", what);
    }
}

fn log_outcome<T: std::fmt::Debug>(what: &str, result: &Result<T, BrokerError>) {
    match result {
        Ok(value) => debug!("{} succeeded: {:?}", what, value),
        Err(e) => warn!("{} failed: {}", what, e),
    }
}

/// Cloneable handle to the broker actor.
#[derive(Clone)]
pub struct BrokerHandle {
    sender: mpsc::Sender<BrokerMessage>,
    events: EventBus,
    posted: PostedSlot,
}

impl BrokerHandle {
    async fn request<T>(
        &self,
        message: impl FnOnce(mpsc::Sender<T>) -> BrokerMessage,
    ) -> Result<T, BrokerError> {
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        self.sender.send(message(reply_tx)).await?;
        timeout(CHANNEL_REPLY_TIMEOUT, reply_rx.recv())
            .await
            .map_err(|_| BrokerError::Timeout)?
            .ok_or(BrokerError::NoResponse)
    }

    pub async fn connect(&self) -> Result<AccountInfo, BrokerError> {
        self.request(|reply| BrokerMessage::Connect { reply }).await?
    }

    pub async fn disconnect(&self) -> Result<(), BrokerError> {
        self.request(|reply| BrokerMessage::Disconnect { reply }).await?
    }

    pub async fn get_account_info(&self) -> Result<AccountInfo, BrokerError> {
        self.request(|reply| BrokerMessage::GetAccountInfo { reply }).await
    }

    pub async fn get_positions(&self) -> Result<Vec<Position>, BrokerError> {
        self.request(|reply| BrokerMessage::GetPositions { reply }).await
    }

    pub async fn get_orders(&self) -> Result<Vec<Order>, BrokerError> {
        self.request(|reply| BrokerMessage::GetOrders { reply }).await
    }

    pub async fn get_executions(&self) -> Result<Vec<Execution>, BrokerError> {
        self.request(|reply| BrokerMessage::GetExecutions { reply }).await
    }

    pub async fn get_balances(&self) -> Result<Vec<AssetBalance>, BrokerError> {
        self.request(|reply| BrokerMessage::GetBalances { reply }).await
    }

    pub async fn deposit(&self, asset: &str, amount: f64) -> Result<AssetBalance, BrokerError> {
        let asset = asset.to_string();
        self.request(|reply| BrokerMessage::Deposit {
            asset,
            amount,
            reply,
        })
        .await?
    }

    pub async fn withdraw(&self, asset: &str, amount: f64) -> Result<AssetBalance, BrokerError> {
        let asset = asset.to_string();
        self.request(|reply| BrokerMessage::Withdraw {
            asset,
            amount,
            reply,
        })
        .await?
    }

    pub async fn place_order(&self, request: OrderRequest) -> Result<Order, BrokerError> {
        self.request(|reply| BrokerMessage::PlaceOrder { request, reply })
            .await?
    }

    pub async fn cancel_order(&self, id: OrderId) -> Result<Order, BrokerError> {
        self.request(|reply| BrokerMessage::CancelOrder { id, reply })
            .await?
    }

    pub async fn close_position(
        &self,
        id: PositionId,
        quantity: Option<f64>,
    ) -> Result<Execution, BrokerError> {
        self.request(|reply| BrokerMessage::ClosePosition {
            id,
            quantity,
            reply,
        })
        .await?
    }

    pub async fn modify_position(
        &self,
        id: PositionId,
        update: PositionUpdate,
    ) -> Result<Position, BrokerError> {
        self.request(|reply| BrokerMessage::ModifyPosition { id, update, reply })
            .await?
    }

    /// Applies a price and waits until the ledger has recomputed.
    pub async fn update_price(&self, symbol: &str, price: f64) -> Result<bool, BrokerError> {
        let symbol = symbol.to_string();
        self.request(|reply| BrokerMessage::UpdatePrice {
            symbol,
            price,
            reply,
        })
        .await
    }

    /// Fire-and-forget price update for callers that must not block, such as
    /// adapter tick callbacks. Overwrites any price for `symbol` the actor has
    /// not picked up yet and takes effect before the next message is handled.
    pub fn post_price(&self, symbol: &str, price: f64) {
        let mut posted = lock_posted(&self.posted);
        posted.latest.insert(symbol.to_string(), price);
        if posted.wake_queued {
            return;
        }
        match self.sender.try_send(BrokerMessage::PricesPosted) {
            Ok(()) => posted.wake_queued = true,
            // Whatever is queued drains the slot first.
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Broker mailbox full, {} price waits in slot", symbol)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Broker stopped, dropping tick for {}", symbol)
            }
        }
    }

    pub async fn switch_identity(&self, identity: &str) -> Result<AccountInfo, BrokerError> {
        let identity = identity.to_string();
        self.request(|reply| BrokerMessage::SwitchIdentity { identity, reply })
            .await?
    }

    /// Stream of ledger events. Every subscriber sees every event published
    /// after it subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.sender.send(BrokerMessage::Shutdown).await {
            error!("Failed to send shutdown to broker: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::scheduler::ManualScheduler;
    use crate::domain::entities::order::OrderSide;
    use crate::domain::services::clock::FixedClock;
    use crate::persistence::InMemorySnapshotStore;
    use chrono::Utc;

    const LATENCY: Duration = Duration::from_millis(500);

    struct Harness {
        broker: BrokerHandle,
        scheduler: Arc<ManualScheduler>,
        store: Arc<InMemorySnapshotStore>,
    }

    fn spawn_with(identity: &str, store: Arc<InMemorySnapshotStore>) -> Harness {
        let scheduler = Arc::new(ManualScheduler::new());
        let settings = BrokerSettings {
            identity: identity.to_string(),
            fill_latency: LATENCY,
            ..BrokerSettings::default()
        };
        let broker = BrokerActor::spawn(
            settings,
            store.clone(),
            scheduler.clone(),
            Arc::new(FixedClock::new(Utc::now())),
        );
        Harness {
            broker,
            scheduler,
            store,
        }
    }

    async fn connected() -> Harness {
        let harness = spawn_with("alice", Arc::new(InMemorySnapshotStore::default()));
        harness.broker.connect().await.unwrap();
        harness
    }

    #[tokio::test]
    async fn test_mutations_require_connect() {
        let harness = spawn_with("alice", Arc::new(InMemorySnapshotStore::default()));
        let err = harness.broker.deposit("USDT", 100.0).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected));
        assert!(harness.broker.get_balances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_market_order_fills_after_latency() {
        let harness = connected().await;
        let broker = &harness.broker;
        broker.deposit("USDT", 100000.0).await.unwrap();
        broker.update_price("BTC-USDT", 65000.0).await.unwrap();

        let order = broker
            .place_order(OrderRequest::market("BTC-USDT", OrderSide::Buy, 1.0))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Working);
        assert_eq!(harness.scheduler.pending(), 1);
        assert!(broker.get_positions().await.unwrap().is_empty());

        harness.scheduler.advance(LATENCY).await;

        let orders = broker.get_orders().await.unwrap();
        assert_eq!(orders[0].status, OrderStatus::Filled);
        assert_eq!(orders[0].fill_price, Some(65000.0));
        let positions = broker.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 1.0);
        assert_eq!(positions[0].avg_price, 65000.0);
        assert_eq!(broker.get_executions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fill_reads_latest_price() {
        let harness = connected().await;
        let broker = &harness.broker;
        broker.deposit("USDT", 100000.0).await.unwrap();
        broker.update_price("BTC-USDT", 65000.0).await.unwrap();
        broker
            .place_order(OrderRequest::market("BTC-USDT", OrderSide::Buy, 1.0))
            .await
            .unwrap();
        broker.update_price("BTC-USDT", 65500.0).await.unwrap();

        harness.scheduler.advance(LATENCY).await;
        let positions = broker.get_positions().await.unwrap();
        assert_eq!(positions[0].avg_price, 65500.0);
    }

    #[tokio::test]
    async fn test_fill_without_price_rejects_order() {
        let harness = connected().await;
        let broker = &harness.broker;
        broker
            .place_order(OrderRequest::market("SOL-USDT", OrderSide::Buy, 1.0))
            .await
            .unwrap();
        harness.scheduler.advance(LATENCY).await;

        let orders = broker.get_orders().await.unwrap();
        assert_eq!(orders[0].status, OrderStatus::Rejected);
        assert!(orders[0].reject_reason.as_deref().unwrap().contains("SOL-USDT"));
        assert!(broker.get_executions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_drops_pending_fill() {
        let harness = connected().await;
        let broker = &harness.broker;
        broker.update_price("BTC-USDT", 65000.0).await.unwrap();
        let order = broker
            .place_order(OrderRequest::limit("BTC-USDT", OrderSide::Buy, 1.0, 64000.0))
            .await
            .unwrap();

        let canceled = broker.cancel_order(order.id).await.unwrap();
        assert_eq!(canceled.status, OrderStatus::Canceled);
        assert_eq!(harness.scheduler.pending(), 0);

        harness.scheduler.advance(LATENCY).await;
        assert_eq!(broker.get_orders().await.unwrap()[0].status, OrderStatus::Canceled);
        assert!(broker.get_positions().await.unwrap().is_empty());

        let err = broker.cancel_order(order.id).await.unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Ledger(LedgerError::OrderNotWorking { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejected_withdrawal_leaves_state_unchanged() {
        let harness = connected().await;
        let broker = &harness.broker;
        broker.deposit("USDT", 10000.0).await.unwrap();

        let err = broker.withdraw("USDT", 200000.0).await.unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Ledger(LedgerError::InsufficientFunds { .. })
        ));
        let balances = broker.get_balances().await.unwrap();
        assert_eq!(balances[0].free, 10000.0);
        assert_eq!(balances[0].total, 10000.0);
    }

    #[tokio::test]
    async fn test_every_mutation_is_persisted() {
        let harness = connected().await;
        harness.broker.deposit("USDT", 2500.0).await.unwrap();

        let document = harness.store.raw("alice").await.unwrap();
        assert_eq!(document["balances"][0]["asset"], "USDT");
        assert_eq!(document["balances"][0]["total"], 2500.0);
    }

    #[tokio::test]
    async fn test_restart_restores_state_and_reschedules_working_orders() {
        let store = Arc::new(InMemorySnapshotStore::default());
        let first = spawn_with("alice", store.clone());
        first.broker.connect().await.unwrap();
        first.broker.deposit("USDT", 50000.0).await.unwrap();
        first
            .broker
            .place_order(OrderRequest::market("ETH-USDT", OrderSide::Buy, 2.0))
            .await
            .unwrap();
        first.broker.shutdown().await;

        let second = spawn_with("alice", store);
        let account = second.broker.connect().await.unwrap();
        assert_eq!(account.balance, 50000.0);
        assert_eq!(second.scheduler.pending(), 1);

        second.broker.update_price("ETH-USDT", 3000.0).await.unwrap();
        second.scheduler.advance(LATENCY).await;
        let positions = second.broker.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].avg_price, 3000.0);

        let order = second
            .broker
            .place_order(OrderRequest::market("ETH-USDT", OrderSide::Sell, 1.0))
            .await
            .unwrap();
        assert_eq!(order.id, 2);
    }

    #[tokio::test]
    async fn test_switch_identity_reinitializes_ledger() {
        let harness = connected().await;
        let broker = &harness.broker;
        broker.deposit("USDT", 10000.0).await.unwrap();
        broker.update_price("BTC-USDT", 65000.0).await.unwrap();

        let bob = broker.switch_identity("bob").await.unwrap();
        assert_eq!(bob.identity, "bob");
        assert_eq!(bob.balance, 0.0);
        assert!(broker.get_balances().await.unwrap().is_empty());

        // Prices survive the switch, so bob can trade immediately.
        broker.deposit("USDT", 1000.0).await.unwrap();
        broker
            .place_order(OrderRequest::market("BTC-USDT", OrderSide::Buy, 0.01))
            .await
            .unwrap();
        harness.scheduler.advance(LATENCY).await;
        assert_eq!(broker.get_positions().await.unwrap().len(), 1);

        let alice = broker.switch_identity("alice").await.unwrap();
        assert_eq!(alice.balance, 10000.0);
        assert!(broker.get_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_drops_pending_fills() {
        let harness = connected().await;
        let broker = &harness.broker;
        broker.update_price("BTC-USDT", 65000.0).await.unwrap();
        broker
            .place_order(OrderRequest::market("BTC-USDT", OrderSide::Buy, 1.0))
            .await
            .unwrap();
        broker.disconnect().await.unwrap();
        assert_eq!(harness.scheduler.pending(), 0);

        harness.scheduler.advance(LATENCY).await;
        assert_eq!(broker.get_orders().await.unwrap()[0].status, OrderStatus::Working);

        broker.connect().await.unwrap();
        harness.scheduler.advance(LATENCY).await;
        assert_eq!(broker.get_orders().await.unwrap()[0].status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let harness = connected().await;
        let mut events = harness.broker.subscribe();
        harness.broker.deposit("USDT", 10000.0).await.unwrap();

        let mut saw_balances = false;
        let mut saw_account = false;
        while let Ok(event) = events.try_recv() {
            match event {
                LedgerEvent::BalancesUpdated(balances) => {
                    saw_balances = balances[0].total == 10000.0;
                }
                LedgerEvent::AccountUpdated(account) => {
                    saw_account = account.equity == 10000.0;
                }
                _ => {}
            }
        }
        assert!(saw_balances);
        assert!(saw_account);
    }

    #[tokio::test]
    async fn test_post_price_is_applied_in_order() {
        let harness = connected().await;
        harness.broker.post_price("BTC-USDT", 1.0);
        harness.broker.post_price("BTC-USDT", 2.0);
        harness.broker.deposit("BTC", 1.0).await.unwrap();
        harness.broker.post_price("BTC-USDT", 3.0);

        let account = harness.broker.get_account_info().await.unwrap();
        assert_eq!(account.balance, 3.0);
    }

    #[tokio::test]
    async fn test_tick_burst_keeps_latest_price() {
        let harness = connected().await;
        let broker = &harness.broker;
        broker.deposit("USDT", 100000.0).await.unwrap();

        // More ticks than the mailbox holds, posted without yielding.
        for n in 1..=(MAILBOX_CAPACITY * 2) {
            broker.post_price("BTC-USDT", n as f64);
        }
        broker
            .place_order(OrderRequest::market("BTC-USDT", OrderSide::Buy, 1.0))
            .await
            .unwrap();
        harness.scheduler.advance(LATENCY).await;

        let orders = broker.get_orders().await.unwrap();
        assert_eq!(orders[0].status, OrderStatus::Filled);
        assert_eq!(orders[0].fill_price, Some((MAILBOX_CAPACITY * 2) as f64));
    }

    #[tokio::test]
    async fn test_posted_price_is_visible_to_next_request() {
        let harness = connected().await;
        harness.broker.deposit("ETH", 2.0).await.unwrap();
        harness.broker.post_price("ETH-USDT", 3000.0);
        harness.broker.post_price("ETH-USDT", 3100.0);

        let account = harness.broker.get_account_info().await.unwrap();
        assert_eq!(account.balance, 6200.0);
    }
}
