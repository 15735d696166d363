//! Polygon.io stocks aggregate stream and REST market data.
//!
//! The socket only carries per-minute aggregates (`AM.*`). Every channel on
//! a ticker shares that topic and coarser periods are rolled up by the
//! adapter.

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use super::protocol::{integer, number, HistoryWindow, InboundFrame, TopicBar, VenueProtocol};
use crate::domain::entities::instrument::{AssetClass, Instrument};
use crate::domain::entities::venue::Venue;
use crate::domain::errors::MarketDataError;
use crate::domain::value_objects::bar::Bar;
use crate::domain::value_objects::channel::ChannelKey;
use crate::domain::value_objects::period::Period;

pub const POLYGON_WS_URL: &str = "wss://socket.polygon.io/stocks";
pub const POLYGON_REST_URL: &str = "https://api.polygon.io";

const SEARCH_LIMIT: usize = 20;
const MAX_AGGREGATES: usize = 50_000;

#[derive(Debug, Clone)]
pub struct PolygonProtocol {
    ws_url: String,
    rest_url: String,
    api_key: String,
}

impl PolygonProtocol {
    pub fn new(
        ws_url: impl Into<String>,
        rest_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            ws_url: ws_url.into(),
            rest_url: rest_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self::new(POLYGON_WS_URL, POLYGON_REST_URL, api_key)
    }

    fn check_status(body: &Value) -> Result<(), MarketDataError> {
        match body.get("status").and_then(Value::as_str) {
            Some("ERROR") | Some("NOT_AUTHORIZED") => Err(MarketDataError::Transport(format!(
                "Polygon: {}",
                body.get("error")
                    .or_else(|| body.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("request failed")
            ))),
            _ => Ok(()),
        }
    }

    fn instrument(entry: &Value) -> Option<Instrument> {
        let ticker = entry.get("ticker")?.as_str()?;
        let market = entry.get("market").and_then(Value::as_str).unwrap_or("stocks");
        let asset_class = if market == "crypto" {
            AssetClass::Crypto
        } else {
            AssetClass::Stock
        };
        let quote = entry
            .get("currency_name")
            .and_then(Value::as_str)
            .unwrap_or("usd")
            .to_ascii_uppercase();
        let base = ticker.strip_prefix("X:").unwrap_or(ticker);
        let base = base.strip_suffix(quote.as_str()).unwrap_or(base);
        let name = entry.get("name").and_then(Value::as_str).unwrap_or(ticker);
        Some(Instrument::new(Venue::Polygon, ticker, base, quote, asset_class).with_name(name))
    }

    fn date(timestamp_ms: i64) -> String {
        Utc.timestamp_millis_opt(timestamp_ms)
            .single()
            .map(|time| time.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "1970-01-01".to_string())
    }

    fn aggregate_event(event: &Value) -> Option<TopicBar> {
        let symbol = event.get("sym")?.as_str()?;
        let volume = number(event.get("v")?)?;
        let vwap = event.get("vw").and_then(number).unwrap_or(0.0);
        let bar = Bar::new(
            integer(event.get("s")?)?,
            number(event.get("o")?)?,
            number(event.get("h")?)?,
            number(event.get("l")?)?,
            number(event.get("c")?)?,
            volume,
        )
        .with_turnover(vwap * volume);
        Some(TopicBar {
            topic: format!("AM.{}", symbol),
            bar,
        })
    }
}

impl VenueProtocol for PolygonProtocol {
    fn venue(&self) -> Venue {
        Venue::Polygon
    }

    fn websocket_url(&self) -> &str {
        &self.ws_url
    }

    fn topic(&self, channel: &ChannelKey) -> String {
        format!("AM.{}", channel.symbol)
    }

    fn stream_period(&self, _period: Period) -> Period {
        Period::one_minute()
    }

    fn subscribe_message(&self, topics: &[String]) -> String {
        json!({"action": "subscribe", "params": topics.join(",")}).to_string()
    }

    fn unsubscribe_message(&self, topics: &[String]) -> String {
        json!({"action": "unsubscribe", "params": topics.join(",")}).to_string()
    }

    fn auth_message(&self) -> Option<String> {
        Some(json!({"action": "auth", "params": self.api_key}).to_string())
    }

    fn parse_frame(&self, text: &str) -> Result<InboundFrame, MarketDataError> {
        let frame: Value = serde_json::from_str(text)?;
        let events = match &frame {
            Value::Array(events) => events.as_slice(),
            single => std::slice::from_ref(single),
        };

        let mut bars = Vec::new();
        for event in events {
            match event.get("ev").and_then(Value::as_str) {
                Some("status") => {
                    let message = event
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    match event.get("status").and_then(Value::as_str) {
                        Some("auth_success") => return Ok(InboundFrame::AuthSuccess),
                        Some("auth_failed") => return Ok(InboundFrame::AuthFailed(message)),
                        Some("error") => return Ok(InboundFrame::VenueError(message)),
                        _ => {}
                    }
                }
                Some("AM") | Some("A") => {
                    let bar = Self::aggregate_event(event).ok_or_else(|| {
                        MarketDataError::Parse(format!("malformed aggregate: {}", event))
                    })?;
                    bars.push(bar);
                }
                _ => {}
            }
        }

        if bars.is_empty() {
            Ok(InboundFrame::Ignored)
        } else {
            Ok(InboundFrame::Bars(bars))
        }
    }

    fn resolve_url(&self, symbol: &str) -> String {
        format!(
            "{}/v3/reference/tickers/{}?apiKey={}",
            self.rest_url, symbol, self.api_key
        )
    }

    fn parse_resolve(&self, symbol: &str, body: &Value) -> Result<Instrument, MarketDataError> {
        Self::check_status(body)?;
        body.get("results")
            .and_then(Self::instrument)
            .ok_or_else(|| MarketDataError::NotFound(format!("POLYGON: {}", symbol)))
    }

    fn search_url(&self, query: &str) -> String {
        let mut url = format!(
            "{}/v3/reference/tickers?active=true&limit={}&apiKey={}",
            self.rest_url, SEARCH_LIMIT, self.api_key
        );
        if let Ok(mut parsed) = url::Url::parse(&url) {
            parsed.query_pairs_mut().append_pair("search", query.trim());
            url = parsed.to_string();
        }
        url
    }

    fn parse_search(&self, _query: &str, body: &Value) -> Result<Vec<Instrument>, MarketDataError> {
        Self::check_status(body)?;
        Ok(body
            .get("results")
            .and_then(Value::as_array)
            .map(|results| results.iter().filter_map(Self::instrument).collect())
            .unwrap_or_default())
    }

    fn history_url(
        &self,
        instrument: &Instrument,
        period: Period,
        window: HistoryWindow,
    ) -> Result<String, MarketDataError> {
        Ok(format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}?adjusted=true&sort=asc&limit={}&apiKey={}",
            self.rest_url,
            instrument.symbol,
            period.multiplier(),
            period.timespan().as_str(),
            Self::date(window.from),
            Self::date(window.to),
            window.limit.min(MAX_AGGREGATES),
            self.api_key
        ))
    }

    fn parse_history(&self, body: &Value) -> Result<Vec<Bar>, MarketDataError> {
        Self::check_status(body)?;
        let Some(results) = body.get("results").and_then(Value::as_array) else {
            return Ok(Vec::new());
        };
        Ok(results
            .iter()
            .filter_map(|row| {
                let volume = number(row.get("v")?)?;
                let vwap = row.get("vw").and_then(number).unwrap_or(0.0);
                Some(
                    Bar::new(
                        integer(row.get("t")?)?,
                        number(row.get("o")?)?,
                        number(row.get("h")?)?,
                        number(row.get("l")?)?,
                        number(row.get("c")?)?,
                        volume,
                    )
                    .with_turnover(vwap * volume),
                )
            })
            .collect())
    }
}
