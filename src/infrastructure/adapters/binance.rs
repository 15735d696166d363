//! Binance spot kline stream and REST market data.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

use super::protocol::{integer, number, precision_from_tick, HistoryWindow, InboundFrame, TopicBar, VenueProtocol};
use crate::domain::entities::instrument::{AssetClass, Instrument};
use crate::domain::entities::venue::Venue;
use crate::domain::errors::MarketDataError;
use crate::domain::value_objects::bar::Bar;
use crate::domain::value_objects::channel::ChannelKey;
use crate::domain::value_objects::period::{Period, Timespan};

pub const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/ws";
pub const BINANCE_REST_URL: &str = "https://api.binance.com";

const SEARCH_LIMIT: usize = 50;
const MAX_KLINES: usize = 1000;

#[derive(Debug)]
pub struct BinanceProtocol {
    ws_url: String,
    rest_url: String,
    /// Request ids echoed back in `{"result":null,"id":n}` acknowledgements.
    next_id: AtomicU64,
}

impl BinanceProtocol {
    pub fn new(ws_url: impl Into<String>, rest_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
            rest_url: rest_url.into().trim_end_matches('/').to_string(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Kline interval names: `1m`, `4h`, `1d`, `1w`, `1M`.
    pub fn interval(period: Period) -> String {
        let unit = match period.timespan() {
            Timespan::Minute => "m",
            Timespan::Hour => "h",
            Timespan::Day => "d",
            Timespan::Week => "w",
            Timespan::Month => "M",
        };
        format!("{}{}", period.multiplier(), unit)
    }

    fn request(&self, method: &str, topics: &[String]) -> String {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        json!({"method": method, "params": topics, "id": id}).to_string()
    }

    fn instrument(entry: &Value) -> Option<Instrument> {
        let symbol = entry.get("symbol")?.as_str()?;
        let base = entry.get("baseAsset")?.as_str()?;
        let quote = entry.get("quoteAsset")?.as_str()?;
        let precision = entry
            .get("filters")
            .and_then(Value::as_array)
            .and_then(|filters| {
                filters
                    .iter()
                    .find(|f| f.get("filterType").and_then(Value::as_str) == Some("PRICE_FILTER"))
            })
            .and_then(|f| f.get("tickSize"))
            .and_then(Value::as_str)
            .map_or(2, precision_from_tick);
        Some(
            Instrument::new(Venue::Binance, symbol, base, quote, AssetClass::Crypto)
                .with_name(format!("{}/{}", base, quote))
                .with_price_precision(precision),
        )
    }

    fn is_trading(entry: &Value) -> bool {
        entry
            .get("status")
            .and_then(Value::as_str)
            .map_or(true, |status| status == "TRADING")
    }

    /// REST kline rows: `[openTime, o, h, l, c, v, closeTime, quoteVolume, ...]`.
    fn kline_row(row: &Value) -> Option<Bar> {
        let row = row.as_array()?;
        let bar = Bar::new(
            integer(row.first()?)?,
            number(row.get(1)?)?,
            number(row.get(2)?)?,
            number(row.get(3)?)?,
            number(row.get(4)?)?,
            number(row.get(5)?)?,
        );
        Some(bar.with_turnover(row.get(7).and_then(number).unwrap_or(0.0)))
    }

    fn kline_event(kline: &Value) -> Option<Bar> {
        let bar = Bar::new(
            integer(kline.get("t")?)?,
            number(kline.get("o")?)?,
            number(kline.get("h")?)?,
            number(kline.get("l")?)?,
            number(kline.get("c")?)?,
            number(kline.get("v")?)?,
        );
        Some(bar.with_turnover(kline.get("q").and_then(number).unwrap_or(0.0)))
    }
}

impl Default for BinanceProtocol {
    fn default() -> Self {
        Self::new(BINANCE_WS_URL, BINANCE_REST_URL)
    }
}

impl VenueProtocol for BinanceProtocol {
    fn venue(&self) -> Venue {
        Venue::Binance
    }

    fn websocket_url(&self) -> &str {
        &self.ws_url
    }

    fn topic(&self, channel: &ChannelKey) -> String {
        format!(
            "{}@kline_{}",
            channel.symbol.to_ascii_lowercase(),
            Self::interval(channel.period)
        )
    }

    fn subscribe_message(&self, topics: &[String]) -> String {
        self.request("SUBSCRIBE", topics)
    }

    fn unsubscribe_message(&self, topics: &[String]) -> String {
        self.request("UNSUBSCRIBE", topics)
    }

    fn parse_frame(&self, text: &str) -> Result<InboundFrame, MarketDataError> {
        let frame: Value = serde_json::from_str(text)?;
        // Combined streams wrap the payload as {"stream": .., "data": ..}.
        let payload = frame.get("data").unwrap_or(&frame);

        if let Some(error) = payload.get("error") {
            return Ok(InboundFrame::VenueError(
                error
                    .get("msg")
                    .and_then(Value::as_str)
                    .map_or_else(|| error.to_string(), str::to_string),
            ));
        }
        if payload.get("e").and_then(Value::as_str) != Some("kline") {
            return Ok(InboundFrame::Ignored);
        }

        let kline = payload
            .get("k")
            .ok_or_else(|| MarketDataError::Parse("kline event without k".to_string()))?;
        let symbol = kline
            .get("s")
            .or_else(|| payload.get("s"))
            .and_then(Value::as_str)
            .ok_or_else(|| MarketDataError::Parse("kline without symbol".to_string()))?;
        let interval = kline
            .get("i")
            .and_then(Value::as_str)
            .ok_or_else(|| MarketDataError::Parse("kline without interval".to_string()))?;
        let bar = Self::kline_event(kline)
            .ok_or_else(|| MarketDataError::Parse(format!("malformed kline: {}", kline)))?;

        Ok(InboundFrame::Bars(vec![TopicBar {
            topic: format!("{}@kline_{}", symbol.to_ascii_lowercase(), interval),
            bar,
        }]))
    }

    fn native_symbol(&self, symbol: &str) -> String {
        symbol
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase()
    }

    fn resolve_url(&self, symbol: &str) -> String {
        format!("{}/api/v3/exchangeInfo?symbol={}", self.rest_url, symbol)
    }

    fn parse_resolve(&self, symbol: &str, body: &Value) -> Result<Instrument, MarketDataError> {
        body.get("symbols")
            .and_then(Value::as_array)
            .and_then(|symbols| {
                symbols
                    .iter()
                    .filter(|entry| entry.get("symbol").and_then(Value::as_str) == Some(symbol))
                    .find_map(Self::instrument)
            })
            .ok_or_else(|| MarketDataError::NotFound(format!("BINANCE: {}", symbol)))
    }

    fn search_url(&self, _query: &str) -> String {
        format!("{}/api/v3/exchangeInfo", self.rest_url)
    }

    fn parse_search(&self, query: &str, body: &Value) -> Result<Vec<Instrument>, MarketDataError> {
        let needle = self.native_symbol(query);
        let symbols = body
            .get("symbols")
            .and_then(Value::as_array)
            .ok_or_else(|| MarketDataError::Parse("exchangeInfo without symbols".to_string()))?;
        Ok(symbols
            .iter()
            .filter(|entry| Self::is_trading(entry))
            .filter_map(Self::instrument)
            .filter(|instrument| instrument.symbol.contains(&needle))
            .take(SEARCH_LIMIT)
            .collect())
    }

    fn history_url(
        &self,
        instrument: &Instrument,
        period: Period,
        window: HistoryWindow,
    ) -> Result<String, MarketDataError> {
        Ok(format!(
            "{}/api/v3/klines?symbol={}&interval={}&startTime={}&endTime={}&limit={}",
            self.rest_url,
            instrument.symbol,
            Self::interval(period),
            window.from,
            window.to,
            window.limit.min(MAX_KLINES)
        ))
    }

    fn parse_history(&self, body: &Value) -> Result<Vec<Bar>, MarketDataError> {
        let rows = body
            .as_array()
            .ok_or_else(|| MarketDataError::Parse(format!("unexpected klines payload: {}", body)))?;
        Ok(rows.iter().filter_map(Self::kline_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_and_subscribe_frame() {
        let binance = BinanceProtocol::default();
        let channel = ChannelKey::new(Venue::Binance, "BTCUSDT", Period::one_minute());
        let topic = binance.topic(&channel);
        assert_eq!(topic, "btcusdt@kline_1m");

        let frame: Value = serde_json::from_str(
            &binance.subscribe_message(&[topic, "ethusdt@kline_4h".to_string()]),
        )
        .unwrap();
        assert_eq!(frame["method"], "SUBSCRIBE");
        assert_eq!(frame["params"], json!(["btcusdt@kline_1m", "ethusdt@kline_4h"]));
        assert_eq!(frame["id"], 1);

        let frame: Value =
            serde_json::from_str(&binance.unsubscribe_message(&["btcusdt@kline_1m".to_string()]))
                .unwrap();
        assert_eq!(frame["method"], "UNSUBSCRIBE");
        assert_eq!(frame["id"], 2);
    }

    #[test]
    fn test_interval_names() {
        assert_eq!(BinanceProtocol::interval("1D".parse().unwrap()), "1d");
        assert_eq!(BinanceProtocol::interval("1M".parse().unwrap()), "1M");
        assert_eq!(BinanceProtocol::interval("15m".parse().unwrap()), "15m");
    }

    #[test]
    fn test_parse_kline_event() {
        let binance = BinanceProtocol::default();
        let text = r#"{"e":"kline","E":1700000001000,"s":"BTCUSDT","k":{"t":1700000000000,"T":1700000059999,"s":"BTCUSDT","i":"1m","o":"65000.0","c":"65010.5","h":"65020.0","l":"64990.0","v":"3.2","q":"208000.0","x":false}}"#;
        let InboundFrame::Bars(bars) = binance.parse_frame(text).unwrap() else {
            panic!("expected bars");
        };
        assert_eq!(bars[0].topic, "btcusdt@kline_1m");
        assert_eq!(bars[0].bar.close, 65010.5);
        assert_eq!(bars[0].bar.turnover, 208000.0);
    }

    #[test]
    fn test_parse_ack_and_error() {
        let binance = BinanceProtocol::default();
        assert_eq!(
            binance.parse_frame(r#"{"result":null,"id":1}"#).unwrap(),
            InboundFrame::Ignored
        );
        assert!(matches!(
            binance
                .parse_frame(r#"{"error":{"code":2,"msg":"Invalid request"},"id":3}"#)
                .unwrap(),
            InboundFrame::VenueError(message) if message == "Invalid request"
        ));
    }

    #[test]
    fn test_native_symbol_strips_separators() {
        let binance = BinanceProtocol::default();
        assert_eq!(binance.native_symbol("btc-usdt"), "BTCUSDT");
        assert_eq!(binance.native_symbol("ETH/USDT"), "ETHUSDT");
    }

    #[test]
    fn test_parse_resolve() {
        let binance = BinanceProtocol::default();
        let body = json!({"symbols": [{
            "symbol": "ETHUSDT", "status": "TRADING", "baseAsset": "ETH", "quoteAsset": "USDT",
            "filters": [{"filterType": "PRICE_FILTER", "tickSize": "0.01000000"}]
        }]});
        let instrument = binance.parse_resolve("ETHUSDT", &body).unwrap();
        assert_eq!(instrument.ledger_symbol(), "ETH-USDT");
        assert_eq!(instrument.price_precision, 2);
        assert!(binance.parse_resolve("XRPUSDT", &body).is_err());
    }

    #[test]
    fn test_parse_history_rows() {
        let binance = BinanceProtocol::default();
        let body = json!([
            [1700000000000i64, "1.0", "2.0", "0.5", "1.5", "10", 1700000059999i64, "15", 3, "5", "7", "0"]
        ]);
        let bars = binance.parse_history(&body).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].high, 2.0);
        assert_eq!(bars[0].turnover, 15.0);
    }
}
