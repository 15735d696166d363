//! OKX public candle stream and REST market data.

use serde_json::{json, Value};

use super::protocol::{integer, number, precision_from_tick, HistoryWindow, InboundFrame, TopicBar, VenueProtocol};
use crate::domain::entities::instrument::{AssetClass, Instrument};
use crate::domain::entities::venue::Venue;
use crate::domain::errors::MarketDataError;
use crate::domain::value_objects::bar::Bar;
use crate::domain::value_objects::channel::ChannelKey;
use crate::domain::value_objects::period::Period;

pub const OKX_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/business";
pub const OKX_REST_URL: &str = "https://www.okx.com";

const SEARCH_LIMIT: usize = 50;

#[derive(Debug, Clone)]
pub struct OkxProtocol {
    ws_url: String,
    rest_url: String,
}

impl OkxProtocol {
    pub fn new(ws_url: impl Into<String>, rest_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            rest_url: rest_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Topics are `candle1m:BTC-USDT`; the frame needs them split back apart.
    fn args(topics: &[String]) -> Vec<Value> {
        topics
            .iter()
            .filter_map(|topic| topic.split_once(':'))
            .map(|(channel, inst_id)| json!({"channel": channel, "instId": inst_id}))
            .collect()
    }

    fn check_code(body: &Value) -> Result<(), MarketDataError> {
        match body.get("code").and_then(Value::as_str) {
            Some("0") | None => Ok(()),
            Some(code) => Err(MarketDataError::Transport(format!(
                "OKX error {}: {}",
                code,
                body.get("msg").and_then(Value::as_str).unwrap_or_default()
            ))),
        }
    }

    fn instrument(entry: &Value) -> Option<Instrument> {
        let inst_id = entry.get("instId")?.as_str()?;
        let base = entry.get("baseCcy")?.as_str()?;
        let quote = entry.get("quoteCcy")?.as_str()?;
        let precision = entry
            .get("tickSz")
            .and_then(Value::as_str)
            .map_or(2, precision_from_tick);
        Some(
            Instrument::new(Venue::Okx, inst_id, base, quote, AssetClass::Crypto)
                .with_name(format!("{}/{}", base, quote))
                .with_price_precision(precision),
        )
    }

    /// Candle rows: `[ts, o, h, l, c, vol, volCcy, volCcyQuote, confirm]`.
    fn candle(row: &Value) -> Option<Bar> {
        let row = row.as_array()?;
        let bar = Bar::new(
            integer(row.first()?)?,
            number(row.get(1)?)?,
            number(row.get(2)?)?,
            number(row.get(3)?)?,
            number(row.get(4)?)?,
            number(row.get(5)?)?,
        );
        let turnover = row.get(7).or_else(|| row.get(6)).and_then(number).unwrap_or(0.0);
        Some(bar.with_turnover(turnover))
    }
}

impl Default for OkxProtocol {
    fn default() -> Self {
        Self::new(OKX_WS_URL, OKX_REST_URL)
    }
}

impl VenueProtocol for OkxProtocol {
    fn venue(&self) -> Venue {
        Venue::Okx
    }

    fn websocket_url(&self) -> &str {
        &self.ws_url
    }

    fn topic(&self, channel: &ChannelKey) -> String {
        format!("candle{}:{}", channel.period.text(), channel.symbol)
    }

    fn subscribe_message(&self, topics: &[String]) -> String {
        json!({"op": "subscribe", "args": Self::args(topics)}).to_string()
    }

    fn unsubscribe_message(&self, topics: &[String]) -> String {
        json!({"op": "unsubscribe", "args": Self::args(topics)}).to_string()
    }

    fn heartbeat_message(&self) -> Option<String> {
        Some("ping".to_string())
    }

    fn parse_frame(&self, text: &str) -> Result<InboundFrame, MarketDataError> {
        if text == "pong" {
            return Ok(InboundFrame::Pong);
        }
        let frame: Value = serde_json::from_str(text)?;

        if let Some(event) = frame.get("event").and_then(Value::as_str) {
            return Ok(match event {
                "error" => InboundFrame::VenueError(format!(
                    "{} (code {})",
                    frame.get("msg").and_then(Value::as_str).unwrap_or_default(),
                    frame.get("code").and_then(Value::as_str).unwrap_or_default()
                )),
                _ => InboundFrame::Ignored,
            });
        }

        let (Some(arg), Some(data)) = (frame.get("arg"), frame.get("data").and_then(Value::as_array))
        else {
            return Ok(InboundFrame::Ignored);
        };
        let channel = arg.get("channel").and_then(Value::as_str).unwrap_or_default();
        let inst_id = arg.get("instId").and_then(Value::as_str).unwrap_or_default();
        if !channel.starts_with("candle") {
            return Ok(InboundFrame::Ignored);
        }

        let topic = format!("{}:{}", channel, inst_id);
        let bars = data
            .iter()
            .map(|row| {
                Self::candle(row)
                    .map(|bar| TopicBar {
                        topic: topic.clone(),
                        bar,
                    })
                    .ok_or_else(|| MarketDataError::Parse(format!("malformed OKX candle: {}", row)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(InboundFrame::Bars(bars))
    }

    fn resolve_url(&self, symbol: &str) -> String {
        format!(
            "{}/api/v5/public/instruments?instType=SPOT&instId={}",
            self.rest_url, symbol
        )
    }

    fn parse_resolve(&self, symbol: &str, body: &Value) -> Result<Instrument, MarketDataError> {
        if body.get("code").and_then(Value::as_str) == Some("51001") {
            return Err(MarketDataError::NotFound(format!("OKX: {}", symbol)));
        }
        Self::check_code(body)?;
        body.get("data")
            .and_then(Value::as_array)
            .and_then(|data| data.iter().find_map(Self::instrument))
            .ok_or_else(|| MarketDataError::NotFound(format!("OKX: {}", symbol)))
    }

    fn search_url(&self, _query: &str) -> String {
        format!("{}/api/v5/public/instruments?instType=SPOT", self.rest_url)
    }

    fn parse_search(&self, query: &str, body: &Value) -> Result<Vec<Instrument>, MarketDataError> {
        Self::check_code(body)?;
        let needle = query.trim().to_ascii_uppercase();
        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .map(|data| {
                data.iter()
                    .filter_map(Self::instrument)
                    .filter(|instrument| instrument.symbol.contains(&needle))
                    .take(SEARCH_LIMIT)
                    .collect()
            })
            .unwrap_or_default())
    }

    fn history_url(
        &self,
        instrument: &Instrument,
        period: Period,
        window: HistoryWindow,
    ) -> Result<String, MarketDataError> {
        // `after` pages backwards: records strictly older than the timestamp.
        Ok(format!(
            "{}/api/v5/market/history-candles?instId={}&bar={}&after={}&limit={}",
            self.rest_url,
            instrument.symbol,
            period.text(),
            window.to + 1,
            window.limit.min(100)
        ))
    }

    fn parse_history(&self, body: &Value) -> Result<Vec<Bar>, MarketDataError> {
        Self::check_code(body)?;
        let rows = body
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| MarketDataError::Parse("OKX history without data".to_string()))?;
        let mut bars: Vec<Bar> = rows.iter().filter_map(Self::candle).collect();
        bars.sort_by_key(|bar| bar.timestamp);
        Ok(bars)
    }
}
