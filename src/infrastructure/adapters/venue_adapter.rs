//! Generic websocket adapter driven by a [`VenueProtocol`].
//!
//! One connection task per adapter owns the socket, the channel table and the
//! reconnect timer. `subscribe`/`unsubscribe` only enqueue commands, so they
//! are safe to call at any time, including while a reconnect is pending.

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::protocol::{HistoryWindow, InboundFrame, TopicBar, VenueProtocol};
use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::venue::Venue;
use crate::domain::errors::MarketDataError;
use crate::domain::repositories::provider_adapter::{
    AdapterEvent, HistoryRequest, ProviderAdapter, TickSink,
};
use crate::domain::services::candle_builder::CandleBuilder;
use crate::domain::value_objects::bar::{Bar, BarSeries};
use crate::domain::value_objects::channel::ChannelKey;
use crate::domain::value_objects::period::Period;

type WsWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub reconnect_delay: Duration,
    pub heartbeat_interval: Duration,
    pub connect_timeout: Duration,
    pub history_limit: usize,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(25),
            connect_timeout: Duration::from_secs(10),
            history_limit: 300,
        }
    }
}

enum Command {
    Subscribe { channel: ChannelKey, sink: TickSink },
    Unsubscribe(ChannelKey),
    Connect,
    Shutdown,
}

enum SessionEnd {
    Closed(String),
    Shutdown,
}

enum Wait {
    Reconnect,
    Shutdown,
}

enum TaskSlot<P: VenueProtocol> {
    Idle(Option<ConnectionTask<P>>),
    Running(JoinHandle<ConnectionTask<P>>),
}

pub struct VenueAdapter<P: VenueProtocol> {
    protocol: Arc<P>,
    settings: AdapterSettings,
    http: reqwest::Client,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<AdapterEvent>,
    task: Mutex<TaskSlot<P>>,
}

impl<P: VenueProtocol> VenueAdapter<P> {
    pub fn new(protocol: P, settings: AdapterSettings) -> Self {
        let protocol = Arc::new(protocol);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let task = ConnectionTask {
            protocol: protocol.clone(),
            settings: settings.clone(),
            commands: command_rx,
            events: events.clone(),
            channels: HashMap::new(),
            candles: CandleBuilder::new(),
        };
        Self {
            protocol,
            settings,
            http: reqwest::Client::new(),
            commands,
            events,
            task: Mutex::new(TaskSlot::Idle(Some(task))),
        }
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("{} adapter command dropped: connection task is gone", self.venue());
        }
    }

    fn report(&self, error: &MarketDataError) {
        let _ = self.events.send(AdapterEvent::Error {
            venue: self.venue(),
            message: error.to_string(),
        });
    }

    async fn get_json(&self, url: &str, symbol: &str) -> Result<serde_json::Value, MarketDataError> {
        debug!("{} GET {}", self.venue(), url);
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::BAD_REQUEST {
            return Err(MarketDataError::NotFound(format!("{}: {}", self.venue(), symbol)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MarketDataError::Transport(format!(
                "{} returned {}: {}",
                self.venue(),
                status,
                body
            )));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl<P: VenueProtocol> ProviderAdapter for VenueAdapter<P> {
    fn venue(&self) -> Venue {
        self.protocol.venue()
    }

    async fn connect(&self) -> Result<(), MarketDataError> {
        let mut slot = self.task.lock().await;
        if let TaskSlot::Running(handle) = &*slot {
            if !handle.is_finished() {
                self.send(Command::Connect);
                return Ok(());
            }
        }

        let task = match std::mem::replace(&mut *slot, TaskSlot::Idle(None)) {
            TaskSlot::Idle(Some(task)) => task,
            TaskSlot::Running(handle) => handle
                .await
                .map_err(|e| MarketDataError::Transport(format!("connection task failed: {}", e)))?,
            TaskSlot::Idle(None) => return Err(MarketDataError::AdapterClosed),
        };
        info!("Starting {} connection task", self.venue());
        *slot = TaskSlot::Running(tokio::spawn(task.run()));
        Ok(())
    }

    async fn disconnect(&self) {
        let mut slot = self.task.lock().await;
        if !matches!(&*slot, TaskSlot::Running(_)) {
            return;
        }
        if let TaskSlot::Running(handle) = std::mem::replace(&mut *slot, TaskSlot::Idle(None)) {
            self.send(Command::Shutdown);
            match handle.await {
                Ok(task) => *slot = TaskSlot::Idle(Some(task)),
                Err(e) => error!("{} connection task ended abnormally: {}", self.venue(), e),
            }
        }
    }

    async fn resolve_symbol(&self, symbol: &str) -> Result<Instrument, MarketDataError> {
        let native = self.protocol.native_symbol(symbol);
        let url = self.protocol.resolve_url(&native);
        let body = self.get_json(&url, &native).await?;
        self.protocol.parse_resolve(&native, &body)
    }

    async fn search_symbols(&self, query: &str) -> Result<Vec<Instrument>, MarketDataError> {
        let url = self.protocol.search_url(query);
        let body = self.get_json(&url, query).await.map_err(|e| {
            self.report(&e);
            e
        })?;
        self.protocol.parse_search(query, &body)
    }

    async fn get_history_bars(
        &self,
        instrument: &Instrument,
        period: Period,
        request: &HistoryRequest,
    ) -> Result<Vec<Bar>, MarketDataError> {
        let now = chrono::Utc::now().timestamp_millis();
        let window = HistoryWindow::resolve(request, period, now, self.settings.history_limit);
        let url = self.protocol.history_url(instrument, period, window)?;

        let result = async {
            let body = self.get_json(&url, &instrument.symbol).await?;
            self.protocol.parse_history(&body)
        }
        .await;
        let bars = result.map_err(|e| {
            warn!("{} history for {} failed: {}", self.venue(), instrument.symbol, e);
            self.report(&e);
            e
        })?;

        let series: BarSeries = bars
            .into_iter()
            .filter(|bar| window.contains(bar.timestamp))
            .filter(|bar| request.cursor.map_or(true, |cursor| bar.timestamp < cursor))
            .collect();
        debug!(
            "{} history for {} {}: {} bars",
            self.venue(),
            instrument.symbol,
            period,
            series.len()
        );
        Ok(series.into_vec())
    }

    fn subscribe(&self, channel: ChannelKey, sink: TickSink) {
        self.send(Command::Subscribe { channel, sink });
    }

    fn unsubscribe(&self, channel: &ChannelKey) {
        self.send(Command::Unsubscribe(channel.clone()));
    }

    fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }
}

struct ConnectionTask<P: VenueProtocol> {
    protocol: Arc<P>,
    settings: AdapterSettings,
    commands: mpsc::UnboundedReceiver<Command>,
    events: broadcast::Sender<AdapterEvent>,
    channels: HashMap<ChannelKey, TickSink>,
    candles: CandleBuilder,
}

impl<P: VenueProtocol> ConnectionTask<P> {
    fn venue(&self) -> Venue {
        self.protocol.venue()
    }

    fn emit(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }

    /// Runs until shut down and hands itself back so the channel table
    /// survives a disconnect / connect cycle.
    async fn run(mut self) -> Self {
        let mut attempt: u32 = 0;
        loop {
            let url = self.protocol.websocket_url().to_string();
            info!("Connecting to {} WebSocket at {}", self.venue(), url);

            match tokio::time::timeout(self.settings.connect_timeout, connect_async(url.as_str())).await
            {
                Ok(Ok((stream, _))) => {
                    attempt = 0;
                    info!("Successfully connected to {} WebSocket", self.venue());
                    if self.drain_pending() {
                        break;
                    }
                    self.emit(AdapterEvent::Connected {
                        venue: self.venue(),
                    });
                    match self.session(stream).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Closed(reason) => {
                            warn!("{} WebSocket closed: {}", self.venue(), reason);
                            self.emit(AdapterEvent::Disconnected {
                                venue: self.venue(),
                                reason,
                            });
                        }
                    }
                }
                Ok(Err(e)) => {
                    error!("Failed to connect to {}: {}", self.venue(), e);
                    self.emit(AdapterEvent::Error {
                        venue: self.venue(),
                        message: format!("connect failed: {}", e),
                    });
                }
                Err(_) => {
                    error!("Timed out connecting to {}", self.venue());
                    self.emit(AdapterEvent::Error {
                        venue: self.venue(),
                        message: "connect timed out".to_string(),
                    });
                }
            }

            self.candles.clear();
            attempt += 1;
            let delay = self.settings.reconnect_delay;
            info!("Reconnecting to {} in {:?} (attempt {})", self.venue(), delay, attempt);
            self.emit(AdapterEvent::reconnect_scheduled(self.venue(), delay, attempt));
            if let Wait::Shutdown = self.wait_for_reconnect(delay).await {
                break;
            }
        }
        info!("{} connection task stopped", self.venue());
        self
    }

    /// Waits out the single pending reconnect timer while still accepting
    /// channel changes. An explicit connect cuts the wait short.
    async fn wait_for_reconnect(&mut self, delay: Duration) -> Wait {
        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => return Wait::Reconnect,
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => return Wait::Shutdown,
                    Some(Command::Connect) => {
                        info!("Explicit connect for {} supersedes pending reconnect", self.venue());
                        return Wait::Reconnect;
                    }
                    Some(Command::Subscribe { channel, sink }) => {
                        debug!("Queued {} while {} is offline", channel, self.venue());
                        self.channels.insert(channel, sink);
                    }
                    Some(Command::Unsubscribe(channel)) => {
                        self.channels.remove(&channel);
                        self.candles.remove(&channel);
                    }
                },
            }
        }
    }

    /// Applies channel changes queued while connecting so the first
    /// subscribe batch covers them. Returns true if a shutdown was queued.
    fn drain_pending(&mut self) -> bool {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Shutdown => return true,
                Command::Connect => {}
                Command::Subscribe { channel, sink } => {
                    self.channels.insert(channel, sink);
                }
                Command::Unsubscribe(channel) => {
                    self.channels.remove(&channel);
                    self.candles.remove(&channel);
                }
            }
        }
        false
    }

    async fn session(&mut self, stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> SessionEnd {
        let (mut write, mut read) = stream.split();
        let mut wire: HashSet<String> = HashSet::new();
        let mut authenticated = true;

        if let Some(auth) = self.protocol.auth_message() {
            authenticated = false;
            debug!("Sending {} auth frame", self.venue());
            if let Err(e) = write.send(Message::Text(auth)).await {
                return SessionEnd::Closed(format!("failed to send auth frame: {}", e));
            }
        } else if let Err(reason) = self.replay(&mut write, &mut wire).await {
            return SessionEnd::Closed(reason);
        }

        let heartbeat_message = self.protocol.heartbeat_message();
        let period = self.settings.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = read.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        match self.protocol.parse_frame(&text) {
                            Ok(InboundFrame::Bars(bars)) => self.dispatch(bars),
                            Ok(InboundFrame::AuthSuccess) => {
                                info!("Authenticated with {}", self.venue());
                                authenticated = true;
                                self.emit(AdapterEvent::Authenticated { venue: self.venue() });
                                if let Err(reason) = self.replay(&mut write, &mut wire).await {
                                    return SessionEnd::Closed(reason);
                                }
                            }
                            Ok(InboundFrame::AuthFailed(reason)) => {
                                error!("{} rejected authentication: {}", self.venue(), reason);
                                self.emit(AdapterEvent::Error {
                                    venue: self.venue(),
                                    message: format!("authentication failed: {}", reason),
                                });
                                return SessionEnd::Closed(format!("authentication failed: {}", reason));
                            }
                            Ok(InboundFrame::VenueError(reason)) => {
                                warn!("{} reported an error: {}", self.venue(), reason);
                                self.emit(AdapterEvent::Error { venue: self.venue(), message: reason });
                            }
                            Ok(InboundFrame::Pong) => debug!("Heartbeat answered by {}", self.venue()),
                            Ok(InboundFrame::Ignored) => {}
                            Err(e) => {
                                warn!("Unparseable frame from {}: {} ({})", self.venue(), e, text);
                                self.emit(AdapterEvent::Error { venue: self.venue(), message: e.to_string() });
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        debug!("Received ping from {}, responding with pong", self.venue());
                        if let Err(e) = write.send(Message::Pong(payload)).await {
                            return SessionEnd::Closed(format!("failed to send pong: {}", e));
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Closed(format!("closed by server: {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        self.emit(AdapterEvent::Error { venue: self.venue(), message: e.to_string() });
                        return SessionEnd::Closed(format!("read error: {}", e));
                    }
                    None => return SessionEnd::Closed("stream ended".to_string()),
                },
                command = self.commands.recv() => match command {
                    None | Some(Command::Shutdown) => {
                        info!("Closing {} WebSocket", self.venue());
                        let _ = write.send(Message::Close(None)).await;
                        return SessionEnd::Shutdown;
                    }
                    Some(Command::Connect) => debug!("{} is already connected", self.venue()),
                    Some(Command::Subscribe { channel, sink }) => {
                        let topic = self.protocol.topic(&channel);
                        self.channels.insert(channel, sink);
                        if authenticated && wire.insert(topic.clone()) {
                            let frame = self.protocol.subscribe_message(std::slice::from_ref(&topic));
                            info!("Subscribing {} {}", self.venue(), topic);
                            if let Err(e) = write.send(Message::Text(frame)).await {
                                return SessionEnd::Closed(format!("failed to send subscribe: {}", e));
                            }
                        }
                    }
                    Some(Command::Unsubscribe(channel)) => {
                        if self.channels.remove(&channel).is_none() {
                            continue;
                        }
                        self.candles.remove(&channel);
                        let topic = self.protocol.topic(&channel);
                        let still_needed = self.channels.keys().any(|other| self.protocol.topic(other) == topic);
                        if !still_needed && wire.remove(&topic) {
                            let frame = self.protocol.unsubscribe_message(std::slice::from_ref(&topic));
                            info!("Unsubscribing {} {}", self.venue(), topic);
                            if let Err(e) = write.send(Message::Text(frame)).await {
                                return SessionEnd::Closed(format!("failed to send unsubscribe: {}", e));
                            }
                        }
                    }
                },
                _ = heartbeat.tick(), if heartbeat_message.is_some() => {
                    if let Some(ping) = &heartbeat_message {
                        debug!("Sending heartbeat to {}", self.venue());
                        if let Err(e) = write.send(Message::Text(ping.clone())).await {
                            return SessionEnd::Closed(format!("failed to send heartbeat: {}", e));
                        }
                    }
                }
            }
        }
    }

    /// Sends every active topic not yet on this socket as one batch.
    async fn replay(&self, write: &mut WsWrite, wire: &mut HashSet<String>) -> Result<(), String> {
        let mut topics: Vec<String> = self
            .channels
            .keys()
            .map(|channel| self.protocol.topic(channel))
            .filter(|topic| !wire.contains(topic))
            .collect();
        topics.sort();
        topics.dedup();
        if topics.is_empty() {
            return Ok(());
        }

        let frame = self.protocol.subscribe_message(&topics);
        info!("Resubscribing {} {} channel(s) on {}", topics.len(), self.venue(), frame);
        write
            .send(Message::Text(frame))
            .await
            .map_err(|e| format!("failed to send subscribe batch: {}", e))?;
        wire.extend(topics);
        Ok(())
    }

    fn dispatch(&mut self, bars: Vec<TopicBar>) {
        for TopicBar { topic, bar } in bars {
            let targets: Vec<(ChannelKey, TickSink)> = self
                .channels
                .iter()
                .filter(|(channel, _)| self.protocol.topic(channel) == topic)
                .map(|(channel, sink)| (channel.clone(), sink.clone()))
                .collect();
            if targets.is_empty() {
                debug!("No listener for {} topic {}", self.venue(), topic);
            }
            for (channel, sink) in targets {
                if self.protocol.stream_period(channel.period) == channel.period {
                    sink(&channel, &bar);
                } else if let Some(rolled) = self.candles.fold(&channel, &bar) {
                    sink(&channel, &rolled);
                }
            }
        }
    }
}
