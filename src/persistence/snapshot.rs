//! Versioned on-disk ledger document.
//!
//! Documents are loaded through [`migrate`], which upgrades older layouts
//! step by step and then merges the result field by field over defaults, so
//! a document missing a field still loads.
//!
//! Nested records (account, balances, positions, orders, executions) are
//! merged over their own defaults as well: derived metrics default to 0,
//! leverage to 1 and missing timestamps to the load time.
//!
//! Layout history:
//! - v1: account metrics under `account_info`, the cash balance as the
//!   single number `account_info.balance`, no per-asset balances.
//! - v2: account under `account`, per-asset `balances`, cumulative
//!   `account.realized_pnl`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::domain::entities::account::{AccountInfo, AssetBalance};
use crate::domain::entities::execution::{Execution, ExecutionId};
use crate::domain::entities::order::{Order, OrderId};
use crate::domain::entities::position::{Position, PositionId};
use crate::persistence::PersistenceError;

pub const CURRENT_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSnapshot {
    pub version: u32,
    pub identity: String,
    pub account: AccountInfo,
    pub balances: Vec<AssetBalance>,
    pub positions: Vec<Position>,
    pub orders: Vec<Order>,
    pub executions: Vec<Execution>,
    pub next_order_id: OrderId,
    pub next_position_id: PositionId,
    pub next_execution_id: ExecutionId,
}

impl Default for LedgerSnapshot {
    fn default() -> Self {
        Self {
            version: CURRENT_SCHEMA_VERSION,
            identity: String::new(),
            account: AccountInfo::default(),
            balances: Vec::new(),
            positions: Vec::new(),
            orders: Vec::new(),
            executions: Vec::new(),
            next_order_id: 1,
            next_position_id: 1,
            next_execution_id: 1,
        }
    }
}

/// Upgrades a stored document to the current layout and decodes it.
/// A document without a `version` field is treated as v1.
pub fn migrate(document: Value, settlement_asset: &str) -> Result<LedgerSnapshot, PersistenceError> {
    let Value::Object(mut fields) = document else {
        return Err(PersistenceError::Serialization(
            "snapshot document is not a JSON object".to_string(),
        ));
    };

    let version = fields
        .get("version")
        .and_then(Value::as_u64)
        .map_or(1, |v| v as u32);
    if version > CURRENT_SCHEMA_VERSION {
        return Err(PersistenceError::UnsupportedVersion {
            found: version,
            supported: CURRENT_SCHEMA_VERSION,
        });
    }

    if version < 2 {
        info!("Migrating ledger snapshot from v{} to v2", version);
        fields = v1_to_v2(fields, settlement_asset);
    }
    fields.insert("version".to_string(), json!(CURRENT_SCHEMA_VERSION));
    fill_nested_defaults(&mut fields)?;

    let mut snapshot: LedgerSnapshot = serde_json::from_value(Value::Object(fields))?;
    if snapshot.identity.is_empty() {
        snapshot.identity = snapshot.account.identity.clone();
    }
    snapshot.account.identity = snapshot.identity.clone();
    Ok(snapshot)
}

/// Completes every nested record with defaults for the fields it lacks.
fn fill_nested_defaults(fields: &mut Map<String, Value>) -> Result<(), PersistenceError> {
    let loaded_at = Utc::now();
    let now = json!(loaded_at);

    let identity = fields.get("identity").cloned().unwrap_or(json!(""));
    let account_defaults = serde_json::to_value(AccountInfo::new(String::new(), loaded_at))?;
    let account = fields.remove("account").unwrap_or_else(|| json!({}));
    let mut account = merge_over(&account_defaults, account, "account")?;
    if account.get("identity").and_then(Value::as_str).map_or(true, str::is_empty) {
        account.insert("identity".to_string(), identity);
    }
    fields.insert("account".to_string(), Value::Object(account));

    complete_each(fields, "balances", |balance| {
        let free = balance.get("free").and_then(Value::as_f64);
        let locked = balance.get("locked").and_then(Value::as_f64).unwrap_or(0.0);
        let total = balance.get("total").and_then(Value::as_f64);
        let (free, total) = match (free, total) {
            (Some(free), Some(total)) => (free, total),
            (Some(free), None) => (free, free + locked),
            (None, Some(total)) => (total - locked, total),
            (None, None) => (0.0, locked),
        };
        balance.insert("free".to_string(), json!(free));
        balance.insert("locked".to_string(), json!(locked));
        balance.insert("total".to_string(), json!(total));
    })?;

    let position_defaults = json!({
        "leverage": 1.0,
        "stop_loss": null,
        "take_profit": null,
        "unrealized_pnl": 0.0,
        "liquidation_price": null,
        "risk_reward": null,
        "opened_at": now,
        "updated_at": now,
    });
    complete_each(fields, "positions", |position| {
        apply_defaults(position, &position_defaults);
        // Without a stored mark the entry price is the best guess until the
        // next tick arrives.
        if !position.contains_key("mark_price") {
            let entry = position.get("avg_price").cloned().unwrap_or(json!(0.0));
            position.insert("mark_price".to_string(), entry);
        }
    })?;

    let order_defaults = json!({
        "order_type": "market",
        "price": null,
        "leverage": 1.0,
        "fill_price": null,
        "reject_reason": null,
        "stop_loss": null,
        "take_profit": null,
        "created_at": now,
        "updated_at": now,
    });
    complete_each(fields, "orders", |order| apply_defaults(order, &order_defaults))?;

    let execution_defaults = json!({
        "fee": 0.0,
        "realized_pnl": 0.0,
        "timestamp": now,
    });
    complete_each(fields, "executions", |execution| {
        apply_defaults(execution, &execution_defaults)
    })?;
    Ok(())
}

fn merge_over(
    defaults: &Value,
    stored: Value,
    what: &str,
) -> Result<Map<String, Value>, PersistenceError> {
    let Value::Object(mut stored) = stored else {
        return Err(PersistenceError::Serialization(format!(
            "snapshot {} is not a JSON object",
            what
        )));
    };
    apply_defaults(&mut stored, defaults);
    Ok(stored)
}

fn apply_defaults(record: &mut Map<String, Value>, defaults: &Value) {
    if let Value::Object(defaults) = defaults {
        for (key, value) in defaults {
            record.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
}

fn complete_each(
    fields: &mut Map<String, Value>,
    key: &str,
    mut complete: impl FnMut(&mut Map<String, Value>),
) -> Result<(), PersistenceError> {
    match fields.get_mut(key) {
        None | Some(Value::Null) => {
            fields.remove(key);
            Ok(())
        }
        Some(Value::Array(records)) => {
            for record in records.iter_mut() {
                let Value::Object(record) = record else {
                    return Err(PersistenceError::Serialization(format!(
                        "snapshot {} entry is not a JSON object",
                        key
                    )));
                };
                complete(record);
            }
            Ok(())
        }
        Some(_) => Err(PersistenceError::Serialization(format!(
            "snapshot {} is not a JSON array",
            key
        ))),
    }
}

fn v1_to_v2(mut fields: Map<String, Value>, settlement_asset: &str) -> Map<String, Value> {
    let mut account = match fields.remove("account_info") {
        Some(Value::Object(account)) => account,
        _ => Map::new(),
    };
    let cash = account.get("balance").and_then(Value::as_f64).unwrap_or(0.0);
    account.entry("realized_pnl").or_insert(json!(0.0));
    fields.insert("account".to_string(), Value::Object(account));

    if !fields.contains_key("balances") && cash != 0.0 {
        fields.insert(
            "balances".to_string(),
            json!([{
                "asset": settlement_asset,
                "free": cash,
                "locked": 0.0,
                "total": cash,
            }]),
        );
    }
    fields
}
