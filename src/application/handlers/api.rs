use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::application::actors::broker_actor::BrokerHandle;
use crate::application::services::datafeed::{Datafeed, DatafeedConfiguration, HistoryPage};
use crate::domain::entities::account::{AccountInfo, AssetBalance};
use crate::domain::entities::execution::Execution;
use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::order::{Order, OrderId, OrderRequest};
use crate::domain::entities::position::{Position, PositionId};
use crate::domain::errors::{BrokerError, LedgerError, MarketDataError};
use crate::domain::repositories::provider_adapter::HistoryRequest;
use crate::domain::services::ledger::PositionUpdate;
use crate::domain::value_objects::period::Period;

/// Shared state of every HTTP handler.
#[derive(Clone)]
pub struct ApiState {
    pub broker: BrokerHandle,
    pub datafeed: Arc<Datafeed>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug)]
pub enum ApiError {
    MarketData(MarketDataError),
    Broker(BrokerError),
    BadRequest(String),
}

impl From<MarketDataError> for ApiError {
    fn from(e: MarketDataError) -> Self {
        ApiError::MarketData(e)
    }
}

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        ApiError::Broker(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::MarketData(e) => match e {
                MarketDataError::NotFound(_) | MarketDataError::AggregatedNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                MarketDataError::Unsupported(_) => StatusCode::BAD_REQUEST,
                MarketDataError::Transport(_)
                | MarketDataError::Parse(_)
                | MarketDataError::AdapterClosed => StatusCode::BAD_GATEWAY,
            },
            ApiError::Broker(e) => match e {
                BrokerError::Ledger(ledger) => match ledger {
                    LedgerError::OrderNotFound(_) | LedgerError::PositionNotFound(_) => {
                        StatusCode::NOT_FOUND
                    }
                    LedgerError::OrderNotWorking { .. } => StatusCode::CONFLICT,
                    LedgerError::InsufficientFunds { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    _ => StatusCode::BAD_REQUEST,
                },
                BrokerError::NotConnected => StatusCode::CONFLICT,
                BrokerError::Timeout | BrokerError::NoResponse | BrokerError::ChannelClosed(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                BrokerError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::MarketData(e) => e.to_string(),
            ApiError::Broker(e) => e.to_string(),
            ApiError::BadRequest(message) => message.clone(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.message());
        }
        (
            status,
            Json(ErrorResponse {
                error: self.message(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Routes of the datafeed and brokerage HTTP surface.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/datafeed/config", get(datafeed_config))
        .route("/datafeed/search", get(search_symbols))
        .route("/datafeed/symbols/:id", get(resolve_symbol))
        .route("/datafeed/history", get(history))
        .route("/broker/connect", post(connect))
        .route("/broker/disconnect", post(disconnect))
        .route("/broker/identity", post(switch_identity))
        .route("/broker/account", get(account_info))
        .route("/broker/balances", get(balances))
        .route("/broker/deposit", post(deposit))
        .route("/broker/withdraw", post(withdraw))
        .route("/broker/orders", get(orders).post(place_order))
        .route("/broker/orders/:id", axum::routing::delete(cancel_order))
        .route("/broker/positions", get(positions))
        .route("/broker/positions/:id", axum::routing::patch(modify_position))
        .route("/broker/positions/:id/close", post(close_position))
        .route("/broker/executions", get(executions))
        .route("/broker/prices", post(update_price))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "running" }))
}

async fn datafeed_config(State(state): State<ApiState>) -> Json<DatafeedConfiguration> {
    Json(state.datafeed.on_ready())
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub query: String,
}

async fn search_symbols(
    State(state): State<ApiState>,
    Query(params): Query<SearchQuery>,
) -> Json<Vec<Instrument>> {
    Json(state.datafeed.search_symbols(&params.query).await)
}

async fn resolve_symbol(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResult<Instrument> {
    Ok(Json(state.datafeed.resolve_symbol(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub symbol: String,
    pub period: String,
    #[serde(default)]
    pub from: Option<i64>,
    #[serde(default)]
    pub to: Option<i64>,
    #[serde(default)]
    pub cursor: Option<i64>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub first_data_request: bool,
}

async fn history(
    State(state): State<ApiState>,
    Query(params): Query<HistoryQuery>,
) -> ApiResult<HistoryPage> {
    let period: Period = params
        .period
        .parse()
        .map_err(|e: crate::domain::errors::ValidationError| ApiError::BadRequest(e.to_string()))?;
    let request = HistoryRequest {
        from: params.from,
        to: params.to,
        first_data_request: params.first_data_request,
        cursor: params.cursor,
        limit: params.limit,
    };
    Ok(Json(
        state
            .datafeed
            .get_history_kline_data(&params.symbol, period, &request)
            .await?,
    ))
}

async fn connect(State(state): State<ApiState>) -> ApiResult<AccountInfo> {
    Ok(Json(state.broker.connect().await?))
}

async fn disconnect(State(state): State<ApiState>) -> Result<StatusCode, ApiError> {
    state.broker.disconnect().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct IdentityRequest {
    pub identity: String,
}

async fn switch_identity(
    State(state): State<ApiState>,
    Json(body): Json<IdentityRequest>,
) -> ApiResult<AccountInfo> {
    if body.identity.trim().is_empty() {
        return Err(ApiError::BadRequest("identity must not be empty".to_string()));
    }
    Ok(Json(state.broker.switch_identity(&body.identity).await?))
}

async fn account_info(State(state): State<ApiState>) -> ApiResult<AccountInfo> {
    Ok(Json(state.broker.get_account_info().await?))
}

async fn balances(State(state): State<ApiState>) -> ApiResult<Vec<AssetBalance>> {
    Ok(Json(state.broker.get_balances().await?))
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub asset: String,
    pub amount: f64,
}

async fn deposit(
    State(state): State<ApiState>,
    Json(body): Json<TransferRequest>,
) -> ApiResult<AssetBalance> {
    Ok(Json(state.broker.deposit(&body.asset, body.amount).await?))
}

async fn withdraw(
    State(state): State<ApiState>,
    Json(body): Json<TransferRequest>,
) -> ApiResult<AssetBalance> {
    Ok(Json(state.broker.withdraw(&body.asset, body.amount).await?))
}

async fn orders(State(state): State<ApiState>) -> ApiResult<Vec<Order>> {
    Ok(Json(state.broker.get_orders().await?))
}

async fn place_order(
    State(state): State<ApiState>,
    Json(request): Json<OrderRequest>,
) -> ApiResult<Order> {
    Ok(Json(state.broker.place_order(request).await?))
}

async fn cancel_order(
    State(state): State<ApiState>,
    Path(id): Path<OrderId>,
) -> ApiResult<Order> {
    Ok(Json(state.broker.cancel_order(id).await?))
}

async fn positions(State(state): State<ApiState>) -> ApiResult<Vec<Position>> {
    Ok(Json(state.broker.get_positions().await?))
}

async fn modify_position(
    State(state): State<ApiState>,
    Path(id): Path<PositionId>,
    Json(update): Json<PositionUpdate>,
) -> ApiResult<Position> {
    Ok(Json(state.broker.modify_position(id, update).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct CloseRequest {
    #[serde(default)]
    pub quantity: Option<f64>,
}

async fn close_position(
    State(state): State<ApiState>,
    Path(id): Path<PositionId>,
    body: Option<Json<CloseRequest>>,
) -> ApiResult<Execution> {
    let quantity = body.and_then(|Json(body)| body.quantity);
    Ok(Json(state.broker.close_position(id, quantity).await?))
}

async fn executions(State(state): State<ApiState>) -> ApiResult<Vec<Execution>> {
    Ok(Json(state.broker.get_executions().await?))
}

#[derive(Debug, Deserialize)]
pub struct PriceRequest {
    pub symbol: String,
    pub price: f64,
}

#[derive(Debug, Serialize)]
pub struct PriceResponse {
    pub applied: bool,
}

async fn update_price(
    State(state): State<ApiState>,
    Json(body): Json<PriceRequest>,
) -> ApiResult<PriceResponse> {
    let applied = state.broker.update_price(&body.symbol, body.price).await?;
    Ok(Json(PriceResponse { applied }))
}
