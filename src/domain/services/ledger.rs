//! Simulated brokerage ledger.
//!
//! A plain synchronous state machine over balances, orders, positions and
//! executions. The broker actor owns it and serializes every call, so
//! nothing here locks. Every successful mutation ends with a wholesale
//! [`Ledger::recompute`] followed by the matching [`LedgerEvent`]s; a
//! rejected mutation returns an error before touching any state.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::entities::account::{AccountInfo, AssetBalance};
use crate::domain::entities::execution::{Execution, ExecutionId};
use crate::domain::entities::order::{Order, OrderId, OrderRequest, OrderStatus, OrderType};
use crate::domain::entities::position::{Position, PositionId, PositionSide, QUANTITY_EPSILON};
use crate::domain::errors::LedgerError;
use crate::domain::services::clock::Clock;
use crate::domain::services::events::{EventBus, LedgerEvent};
use crate::domain::value_objects::price::{Price, Quantity};
use crate::persistence::snapshot::{LedgerSnapshot, CURRENT_SCHEMA_VERSION};

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerConfig {
    /// Asset in which PnL and fees settle and account values are expressed.
    pub settlement_asset: String,
    pub default_leverage: f64,
    pub taker_fee_rate: f64,
    pub maintenance_margin_rate: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            settlement_asset: "USDT".to_string(),
            default_leverage: 1.0,
            taker_fee_rate: 0.0,
            maintenance_margin_rate: 0.005,
        }
    }
}

/// Stop loss / take profit edit. `None` leaves the current level untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

#[derive(Debug, Default)]
struct NetOutcome {
    realized: f64,
    touched: Option<PositionId>,
    closed: Option<Position>,
}

pub struct Ledger {
    config: LedgerConfig,
    clock: Arc<dyn Clock>,
    events: EventBus,
    account: AccountInfo,
    balances: BTreeMap<String, AssetBalance>,
    positions: BTreeMap<PositionId, Position>,
    orders: BTreeMap<OrderId, Order>,
    executions: Vec<Execution>,
    last_prices: HashMap<String, f64>,
    next_order_id: OrderId,
    next_position_id: PositionId,
    next_execution_id: ExecutionId,
}

impl Ledger {
    pub fn new(
        identity: impl Into<String>,
        config: LedgerConfig,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        let account = AccountInfo::new(identity, clock.now());
        Self {
            config,
            clock,
            events,
            account,
            balances: BTreeMap::new(),
            positions: BTreeMap::new(),
            orders: BTreeMap::new(),
            executions: Vec::new(),
            last_prices: HashMap::new(),
            next_order_id: 1,
            next_position_id: 1,
            next_execution_id: 1,
        }
    }

    /// Rebuilds a ledger from a persisted snapshot. Derived fields are
    /// recomputed rather than trusted.
    pub fn from_snapshot(
        snapshot: LedgerSnapshot,
        config: LedgerConfig,
        clock: Arc<dyn Clock>,
        events: EventBus,
    ) -> Self {
        let mut ledger = Self::new(snapshot.identity.clone(), config, clock, events);
        ledger.account.realized_pnl = snapshot.account.realized_pnl;
        ledger.balances = snapshot
            .balances
            .into_iter()
            .map(|balance| (balance.asset.clone(), balance))
            .collect();
        ledger.positions = snapshot
            .positions
            .into_iter()
            .map(|position| (position.id, position))
            .collect();
        ledger.orders = snapshot
            .orders
            .into_iter()
            .map(|order| (order.id, order))
            .collect();
        ledger.executions = snapshot.executions;

        // Counters never go backwards, even if the document was edited by hand.
        ledger.next_order_id = snapshot
            .next_order_id
            .max(ledger.orders.keys().max().map_or(1, |id| id + 1));
        ledger.next_position_id = snapshot
            .next_position_id
            .max(ledger.positions.keys().max().map_or(1, |id| id + 1));
        ledger.next_execution_id = snapshot
            .next_execution_id
            .max(ledger.executions.iter().map(|e| e.id).max().map_or(1, |id| id + 1));

        ledger.recompute();
        ledger
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            version: CURRENT_SCHEMA_VERSION,
            identity: self.account.identity.clone(),
            account: self.account.clone(),
            balances: self.balances(),
            positions: self.positions(),
            orders: self.orders(),
            executions: self.executions.clone(),
            next_order_id: self.next_order_id,
            next_position_id: self.next_position_id,
            next_execution_id: self.next_execution_id,
        }
    }

    pub fn identity(&self) -> &str {
        &self.account.identity
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn account(&self) -> &AccountInfo {
        &self.account
    }

    pub fn balances(&self) -> Vec<AssetBalance> {
        self.balances.values().cloned().collect()
    }

    pub fn balance(&self, asset: &str) -> Option<&AssetBalance> {
        self.balances.get(&asset.to_ascii_uppercase())
    }

    pub fn positions(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }

    pub fn position(&self, id: PositionId) -> Option<&Position> {
        self.positions.get(&id)
    }

    pub fn orders(&self) -> Vec<Order> {
        self.orders.values().cloned().collect()
    }

    pub fn order(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    /// Orders still waiting for their simulated fill.
    pub fn working_order_ids(&self) -> Vec<OrderId> {
        self.orders
            .values()
            .filter(|order| order.status == OrderStatus::Working)
            .map(|order| order.id)
            .collect()
    }

    pub fn executions(&self) -> &[Execution] {
        &self.executions
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.last_prices.get(&symbol.to_ascii_uppercase()).copied()
    }

    pub fn last_prices(&self) -> &HashMap<String, f64> {
        &self.last_prices
    }

    /// Carries a price table over from another ledger without publishing.
    pub fn seed_prices(&mut self, prices: &HashMap<String, f64>) {
        self.last_prices.extend(
            prices
                .iter()
                .filter(|(_, price)| price.is_finite() && **price > 0.0)
                .map(|(symbol, price)| (symbol.clone(), *price)),
        );
        self.recompute();
    }

    pub fn deposit(&mut self, asset: &str, amount: f64) -> Result<AssetBalance, LedgerError> {
        let asset = check_amount(asset, amount)?;
        let balance = self
            .balances
            .entry(asset.clone())
            .or_insert_with(|| AssetBalance::empty(asset.clone()));
        balance.credit(amount);
        let updated = balance.clone();

        info!("Deposited {} {} for {}", amount, asset, self.account.identity);
        self.recompute();
        self.publish_balances();
        self.publish_account();
        Ok(updated)
    }

    pub fn withdraw(&mut self, asset: &str, amount: f64) -> Result<AssetBalance, LedgerError> {
        let asset = check_amount(asset, amount)?;
        let balance = self
            .balances
            .get_mut(&asset)
            .ok_or_else(|| LedgerError::InsufficientFunds {
                asset: asset.clone(),
                requested: amount,
                available: 0.0,
            })?;
        balance.debit(amount)?;
        let updated = balance.clone();

        info!("Withdrew {} {} for {}", amount, asset, self.account.identity);
        self.recompute();
        self.publish_balances();
        self.publish_account();
        Ok(updated)
    }

    /// Accepts an order in the Working state. The fill happens later through
    /// [`Ledger::fill_order`].
    pub fn place_order(&mut self, mut request: OrderRequest) -> Result<Order, LedgerError> {
        request.symbol = request.symbol.trim().to_ascii_uppercase();
        request.validate()?;

        let leverage = request.leverage.unwrap_or(self.config.default_leverage);
        let id = self.next_order_id;
        self.next_order_id += 1;

        let order = Order::working(id, &request, leverage, self.clock.now());
        self.orders.insert(id, order.clone());
        debug!(
            "Order {} accepted: {} {} {} ({:?})",
            id, order.side, order.quantity, order.symbol, order.order_type
        );

        self.recompute();
        self.events.publish(LedgerEvent::OrderUpdated(order.clone()));
        self.publish_account();
        Ok(order)
    }

    /// Resolves a working order against the last known price. Without a
    /// reference price the order ends Rejected, which is an outcome rather
    /// than an error. A second call for the same order fails with
    /// `OrderNotWorking`, so each order has exactly one terminal transition.
    pub fn fill_order(&mut self, id: OrderId) -> Result<Order, LedgerError> {
        let now = self.clock.now();
        let order = self.orders.get(&id).ok_or(LedgerError::OrderNotFound(id))?;
        if order.status != OrderStatus::Working {
            return Err(LedgerError::OrderNotWorking {
                id,
                status: order.status.to_string(),
            });
        }

        let Some(last) = self.last_prices.get(&order.symbol).copied() else {
            let reason = LedgerError::NoReferencePrice(order.symbol.clone()).to_string();
            let order = self
                .orders
                .get_mut(&id)
                .ok_or(LedgerError::OrderNotFound(id))?;
            order.reject(reason, now)?;
            let rejected = order.clone();
            warn!("Order {} rejected: no reference price for {}", id, rejected.symbol);

            self.recompute();
            self.events.publish(LedgerEvent::OrderUpdated(rejected.clone()));
            self.publish_account();
            return Ok(rejected);
        };

        let fill_price = match order.order_type {
            OrderType::Market => last,
            OrderType::Limit | OrderType::Stop => order.price.unwrap_or(last),
        };

        let order = self
            .orders
            .get_mut(&id)
            .ok_or(LedgerError::OrderNotFound(id))?;
        order.fill(fill_price, now)?;
        let filled = order.clone();

        let fee = fill_price * filled.quantity * self.config.taker_fee_rate;
        let outcome = self.net_fill(&filled, fill_price);
        self.settle(outcome.realized - fee);
        let execution = self.record_execution(&filled, fill_price, filled.quantity, fee, outcome.realized);
        info!(
            "Order {} filled: {} {} {} @ {} (realized {})",
            id, filled.side, filled.quantity, filled.symbol, fill_price, outcome.realized
        );

        self.recompute();
        self.events.publish(LedgerEvent::OrderUpdated(filled.clone()));
        self.events.publish(LedgerEvent::ExecutionAdded(execution));
        self.publish_position_outcome(outcome.touched, outcome.closed);
        self.publish_balances();
        self.publish_account();
        Ok(filled)
    }

    pub fn cancel_order(&mut self, id: OrderId) -> Result<Order, LedgerError> {
        let order = self
            .orders
            .get_mut(&id)
            .ok_or(LedgerError::OrderNotFound(id))?;
        order.cancel(self.clock.now())?;
        let canceled = order.clone();
        info!("Order {} canceled", id);

        self.recompute();
        self.events.publish(LedgerEvent::OrderUpdated(canceled.clone()));
        self.publish_account();
        Ok(canceled)
    }

    /// Closes `quantity` of a position (all of it by default) at the last
    /// price, recording a synthetic filled order and its execution.
    pub fn close_position(
        &mut self,
        id: PositionId,
        quantity: Option<f64>,
    ) -> Result<Execution, LedgerError> {
        let position = self
            .positions
            .get(&id)
            .ok_or(LedgerError::PositionNotFound(id))?;
        let quantity = match quantity {
            Some(requested) => {
                let requested = Quantity::new(requested)?.value();
                if requested > position.quantity + QUANTITY_EPSILON {
                    return Err(LedgerError::InvalidQuantity(format!(
                        "cannot close {} of position {} holding {}",
                        requested, id, position.quantity
                    )));
                }
                requested.min(position.quantity)
            }
            None => position.quantity,
        };
        let mark = self
            .last_prices
            .get(&position.symbol)
            .copied()
            .ok_or_else(|| LedgerError::NoReferencePrice(position.symbol.clone()))?;

        let now = self.clock.now();
        let request = OrderRequest::market(
            position.symbol.clone(),
            position.side.opening_side().opposite(),
            quantity,
        )
        .with_leverage(position.leverage);
        let order_id = self.next_order_id;
        self.next_order_id += 1;
        let mut order = Order::working(order_id, &request, position.leverage, now);
        order.fill(mark, now)?;
        self.orders.insert(order_id, order.clone());

        let fee = mark * quantity * self.config.taker_fee_rate;
        let (realized, closed) = {
            let position = self
                .positions
                .get_mut(&id)
                .ok_or(LedgerError::PositionNotFound(id))?;
            let closed_quantity = position.reduce(quantity, now);
            let realized = position.pnl_at(mark, closed_quantity);
            if position.is_closed() {
                position.mark(mark, self.config.maintenance_margin_rate);
            }
            (realized, position.is_closed())
        };
        let closed = if closed { self.positions.remove(&id) } else { None };
        let touched = closed.is_none().then_some(id);

        self.settle(realized - fee);
        let execution = self.record_execution(&order, mark, quantity, fee, realized);
        info!(
            "Position {} closed {} @ {} (realized {})",
            id, quantity, mark, realized
        );

        self.recompute();
        self.events.publish(LedgerEvent::OrderUpdated(order));
        self.events.publish(LedgerEvent::ExecutionAdded(execution.clone()));
        self.publish_position_outcome(touched, closed);
        self.publish_balances();
        self.publish_account();
        Ok(execution)
    }

    /// Updates stop loss / take profit only. Quantity and price are untouched.
    pub fn modify_position(
        &mut self,
        id: PositionId,
        update: PositionUpdate,
    ) -> Result<Position, LedgerError> {
        for level in [update.stop_loss, update.take_profit].into_iter().flatten() {
            Price::new(level)?;
        }
        let now = self.clock.now();
        let position = self
            .positions
            .get_mut(&id)
            .ok_or(LedgerError::PositionNotFound(id))?;
        if let Some(stop_loss) = update.stop_loss {
            position.stop_loss = Some(stop_loss);
        }
        if let Some(take_profit) = update.take_profit {
            position.take_profit = Some(take_profit);
        }
        position.updated_at = now;

        self.recompute();
        let position = self
            .positions
            .get(&id)
            .cloned()
            .ok_or(LedgerError::PositionNotFound(id))?;
        self.events.publish(LedgerEvent::PositionUpdated(position.clone()));
        Ok(position)
    }

    /// Records a new last price and marks exposure to it. Returns false for
    /// a non-positive or non-finite price, which is ignored.
    pub fn update_price(&mut self, symbol: &str, price: f64) -> bool {
        if !price.is_finite() || price <= 0.0 {
            warn!("Ignoring invalid price {} for {}", price, symbol);
            return false;
        }
        let symbol = symbol.trim().to_ascii_uppercase();
        self.last_prices.insert(symbol.clone(), price);

        let previous = self.account.clone();
        self.recompute();

        let marked: Vec<Position> = self
            .positions
            .values()
            .filter(|position| position.symbol == symbol)
            .cloned()
            .collect();
        for position in marked {
            self.events.publish(LedgerEvent::PositionUpdated(position));
        }

        let unchanged = AccountInfo {
            updated_at: previous.updated_at,
            ..self.account.clone()
        } == previous;
        if !unchanged {
            self.publish_account();
        }
        true
    }

    /// Rewrites every derived field from primary state. Idempotent.
    pub fn recompute(&mut self) {
        let maintenance_margin_rate = self.config.maintenance_margin_rate;
        for position in self.positions.values_mut() {
            let mark = self
                .last_prices
                .get(&position.symbol)
                .copied()
                .unwrap_or(position.mark_price);
            position.mark(mark, maintenance_margin_rate);
        }

        let balance: f64 = self
            .balances
            .values()
            .map(|balance| self.settlement_value(balance))
            .sum();
        let unrealized_pnl: f64 = self.positions.values().map(|p| p.unrealized_pnl).sum();
        let margin: f64 = self.positions.values().map(Position::margin).sum();
        let order_margin: f64 = self
            .orders
            .values()
            .filter(|order| order.status == OrderStatus::Working)
            .filter_map(|order| {
                order
                    .reference_price(self.last_prices.get(&order.symbol).copied())
                    .map(|price| price * order.quantity / order.leverage)
            })
            .sum();

        let account = &mut self.account;
        account.balance = balance;
        account.unrealized_pnl = unrealized_pnl;
        account.equity = balance + unrealized_pnl;
        account.margin = margin;
        account.order_margin = order_margin;
        account.available_funds = account.equity - margin - order_margin;
        account.updated_at = self.clock.now();
    }

    /// Value of a balance in the settlement asset. Unpriced assets count 0.
    fn settlement_value(&self, balance: &AssetBalance) -> f64 {
        if balance.asset == self.config.settlement_asset {
            return balance.total;
        }
        let pair = format!("{}-{}", balance.asset, self.config.settlement_asset);
        self.last_prices
            .get(&pair)
            .map_or(0.0, |price| balance.total * price)
    }

    /// Nets a fill into the book: reduce an opposite position first, then
    /// add what is left to the same-side position or open a new one.
    fn net_fill(&mut self, order: &Order, price: f64) -> NetOutcome {
        let now = self.clock.now();
        let side = PositionSide::from(order.side);
        let mut remaining = order.quantity;
        let mut outcome = NetOutcome::default();

        let opposite = self
            .positions
            .values()
            .find(|p| p.symbol == order.symbol && p.side != side)
            .map(|p| p.id);
        if let Some(id) = opposite {
            if let Some(position) = self.positions.get_mut(&id) {
                let closed = position.reduce(remaining, now);
                outcome.realized = position.pnl_at(price, closed);
                remaining -= closed;
                if position.is_closed() {
                    position.mark(price, self.config.maintenance_margin_rate);
                } else {
                    outcome.touched = Some(id);
                }
            }
            if outcome.touched.is_none() {
                outcome.closed = self.positions.remove(&id);
            }
        }

        if remaining > QUANTITY_EPSILON {
            let same = self
                .positions
                .values()
                .find(|p| p.symbol == order.symbol && p.side == side)
                .map(|p| p.id);
            let id = match same.and_then(|id| self.positions.get_mut(&id)) {
                Some(position) => {
                    position.add_fill(remaining, price, now);
                    position.id
                }
                None => {
                    let id = self.next_position_id;
                    self.next_position_id += 1;
                    let mut position =
                        Position::open(id, &order.symbol, side, remaining, price, order.leverage, now);
                    position.stop_loss = order.stop_loss;
                    position.take_profit = order.take_profit;
                    self.positions.insert(id, position);
                    id
                }
            };
            outcome.touched = Some(id);
        }
        outcome
    }

    /// Applies realized PnL net of fees to the settlement balance.
    fn settle(&mut self, delta: f64) {
        if delta == 0.0 {
            return;
        }
        let asset = self.config.settlement_asset.clone();
        self.balances
            .entry(asset.clone())
            .or_insert_with(|| AssetBalance::empty(asset))
            .adjust(delta);
    }

    fn record_execution(
        &mut self,
        order: &Order,
        price: f64,
        quantity: f64,
        fee: f64,
        realized_pnl: f64,
    ) -> Execution {
        let execution = Execution {
            id: self.next_execution_id,
            order_id: order.id,
            symbol: order.symbol.clone(),
            side: order.side,
            price,
            quantity,
            fee,
            realized_pnl,
            timestamp: self.clock.now(),
        };
        self.next_execution_id += 1;
        self.account.realized_pnl += realized_pnl;
        self.executions.push(execution.clone());
        execution
    }

    fn publish_position_outcome(&self, touched: Option<PositionId>, closed: Option<Position>) {
        if let Some(position) = closed {
            self.events.publish(LedgerEvent::PositionClosed(position));
        }
        if let Some(position) = touched.and_then(|id| self.positions.get(&id)) {
            self.events.publish(LedgerEvent::PositionUpdated(position.clone()));
        }
    }

    fn publish_balances(&self) {
        self.events.publish(LedgerEvent::BalancesUpdated(self.balances()));
    }

    fn publish_account(&self) {
        self.events.publish(LedgerEvent::AccountUpdated(self.account.clone()));
    }
}

fn check_amount(asset: &str, amount: f64) -> Result<String, LedgerError> {
    let asset = asset.trim().to_ascii_uppercase();
    if asset.is_empty() || !amount.is_finite() || amount <= 0.0 {
        return Err(LedgerError::InvalidAmount { asset, amount });
    }
    Ok(asset)
}
