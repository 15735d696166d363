use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::{LedgerError, ValidationError};
use crate::domain::value_objects::price::{Price, Quantity};

pub type OrderId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Working,
    Filled,
    /// Reserved: the simulated venue fills orders in one shot.
    PartiallyFilled,
    Rejected,
    Canceled,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Canceled
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Working => write!(f, "WORKING"),
            OrderStatus::Filled => write!(f, "FILLED"),
            OrderStatus::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            OrderStatus::Rejected => write!(f, "REJECTED"),
            OrderStatus::Canceled => write!(f, "CANCELED"),
        }
    }
}

/// Parameters of `place_order` as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    #[serde(default = "default_order_type")]
    pub order_type: OrderType,
    pub quantity: f64,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub leverage: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

fn default_order_type() -> OrderType {
    OrderType::Market
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            leverage: None,
            stop_loss: None,
            take_profit: None,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: OrderSide, quantity: f64, price: f64) -> Self {
        Self {
            order_type: OrderType::Limit,
            price: Some(price),
            ..Self::market(symbol, side, quantity)
        }
    }

    pub fn with_leverage(mut self, leverage: f64) -> Self {
        self.leverage = Some(leverage);
        self
    }

    /// Checks the request shape. Limit and stop orders must carry a price.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.symbol.trim().is_empty() {
            return Err(ValidationError::InvalidSymbol("symbol is empty".to_string()));
        }
        Quantity::new(self.quantity)?;
        match (self.order_type, self.price) {
            (_, Some(price)) => {
                Price::new(price)?;
            }
            (OrderType::Limit | OrderType::Stop, None) => {
                return Err(ValidationError::InvalidPrice(
                    "limit and stop orders must have a price".to_string(),
                ));
            }
            (OrderType::Market, None) => {}
        }
        if let Some(leverage) = self.leverage {
            if !leverage.is_finite() || leverage < 1.0 {
                return Err(ValidationError::InvalidQuantity(format!(
                    "leverage must be at least 1, got {leverage}"
                )));
            }
        }
        for level in [self.stop_loss, self.take_profit].into_iter().flatten() {
            Price::new(level)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub leverage: f64,
    pub status: OrderStatus,
    #[serde(default)]
    pub fill_price: Option<f64>,
    #[serde(default)]
    pub reject_reason: Option<String>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn working(id: OrderId, request: &OrderRequest, leverage: f64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            leverage,
            status: OrderStatus::Working,
            fill_price: None,
            reject_reason: None,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            created_at: now,
            updated_at: now,
        }
    }

    /// Price used to reserve margin while the order is working.
    pub fn reference_price(&self, last_price: Option<f64>) -> Option<f64> {
        self.price.or(last_price)
    }

    pub fn fill(&mut self, price: f64, now: DateTime<Utc>) -> Result<(), LedgerError> {
        self.transition(OrderStatus::Filled, now)?;
        self.fill_price = Some(price);
        Ok(())
    }

    pub fn reject(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<(), LedgerError> {
        self.transition(OrderStatus::Rejected, now)?;
        self.reject_reason = Some(reason.into());
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), LedgerError> {
        self.transition(OrderStatus::Canceled, now)
    }

    fn transition(&mut self, to: OrderStatus, now: DateTime<Utc>) -> Result<(), LedgerError> {
        if self.status.is_terminal() {
            return Err(LedgerError::OrderNotWorking {
                id: self.id,
                status: self.status.to_string(),
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}
