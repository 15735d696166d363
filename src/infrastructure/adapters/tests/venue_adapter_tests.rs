use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use super::MockVenueServer;
use crate::domain::entities::venue::Venue;
use crate::domain::repositories::provider_adapter::{AdapterEvent, ProviderAdapter, TickSink};
use crate::domain::value_objects::bar::Bar;
use crate::domain::value_objects::channel::ChannelKey;
use crate::infrastructure::adapters::okx::OkxProtocol;
use crate::infrastructure::adapters::polygon::PolygonProtocol;
use crate::infrastructure::adapters::venue_adapter::{AdapterSettings, VenueAdapter};

const QUIET: Duration = Duration::from_millis(250);

fn settings(reconnect: Duration) -> AdapterSettings {
    AdapterSettings {
        reconnect_delay: reconnect,
        heartbeat_interval: Duration::from_secs(3600),
        connect_timeout: Duration::from_secs(2),
        history_limit: 100,
    }
}

fn okx(server: &MockVenueServer, settings: AdapterSettings) -> VenueAdapter<OkxProtocol> {
    VenueAdapter::new(OkxProtocol::new(server.url(), "http://127.0.0.1:1"), settings)
}

fn polygon(server: &MockVenueServer) -> VenueAdapter<PolygonProtocol> {
    VenueAdapter::new(
        PolygonProtocol::new(server.url(), "http://127.0.0.1:1", "KEY"),
        settings(Duration::from_millis(100)),
    )
}

fn channel(venue: Venue, symbol: &str, period: &str) -> ChannelKey {
    ChannelKey::new(venue, symbol, period.parse().unwrap())
}

fn recording_sink() -> (TickSink, mpsc::UnboundedReceiver<(ChannelKey, Bar)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let sink: TickSink = Arc::new(move |channel: &ChannelKey, bar: &Bar| {
        let _ = tx.send((channel.clone(), *bar));
    });
    (sink, rx)
}

fn noop_sink() -> TickSink {
    Arc::new(|_: &ChannelKey, _: &Bar| {})
}

async fn wait_for(
    events: &mut broadcast::Receiver<AdapterEvent>,
    wanted: impl Fn(&AdapterEvent) -> bool,
) -> AdapterEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream failed: {}", e),
            }
        }
    })
    .await
    .expect("adapter event not received")
}

fn json(frame: &str) -> Value {
    serde_json::from_str(frame).unwrap()
}

#[tokio::test]
async fn test_channels_registered_before_connect_go_out_in_one_batch() {
    let mut server = MockVenueServer::start().await;
    let adapter = okx(&server, settings(Duration::from_millis(100)));

    adapter.subscribe(channel(Venue::Okx, "BTC-USDT", "1m"), noop_sink());
    adapter.subscribe(channel(Venue::Okx, "ETH-USDT", "1m"), noop_sink());
    adapter.connect().await.unwrap();

    let frame = json(&server.next_data_frame().await);
    assert_eq!(frame["op"], "subscribe");
    assert_eq!(frame["args"].as_array().unwrap().len(), 2);
    assert!(server.try_next_frame(QUIET).await.is_none());

    adapter.disconnect().await;
}

#[tokio::test]
async fn test_socket_close_schedules_one_reconnect_and_replays_batch() {
    let mut server = MockVenueServer::start().await;
    let adapter = okx(&server, settings(Duration::from_millis(100)));
    let mut events = adapter.events();

    adapter.subscribe(channel(Venue::Okx, "BTC-USDT", "1m"), noop_sink());
    adapter.subscribe(channel(Venue::Okx, "BTC-USDT", "1H"), noop_sink());
    adapter.connect().await.unwrap();
    server.next_data_frame().await;

    server.close_current().await;
    let scheduled = wait_for(&mut events, |e| {
        matches!(e, AdapterEvent::ReconnectScheduled { .. })
    })
    .await;
    assert_eq!(
        scheduled,
        AdapterEvent::ReconnectScheduled {
            venue: Venue::Okx,
            delay_ms: 100,
            attempt: 1
        }
    );

    server.wait_for_connections(2).await;
    let frame = json(&server.next_data_frame().await);
    assert_eq!(frame["op"], "subscribe");
    assert_eq!(
        frame["args"],
        json!([
            {"channel": "candle1H", "instId": "BTC-USDT"},
            {"channel": "candle1m", "instId": "BTC-USDT"}
        ])
    );

    tokio::time::sleep(QUIET).await;
    assert_eq!(server.connections(), 2);
    let mut extra = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, AdapterEvent::ReconnectScheduled { .. }) {
            extra += 1;
        }
    }
    assert_eq!(extra, 0);

    adapter.disconnect().await;
}

#[tokio::test]
async fn test_pushed_candles_reach_the_sink() {
    let mut server = MockVenueServer::start().await;
    let adapter = okx(&server, settings(Duration::from_millis(100)));
    let (sink, mut ticks) = recording_sink();
    let btc = channel(Venue::Okx, "BTC-USDT", "1m");

    adapter.subscribe(btc.clone(), sink);
    adapter.connect().await.unwrap();
    server.next_data_frame().await;

    server
        .send(r#"{"arg":{"channel":"candle1m","instId":"BTC-USDT"},"data":[["1700000000000","65000","65100","64900","65050","1","65050","65050","0"]]}"#)
        .await;
    server
        .send(r#"{"arg":{"channel":"candle1m","instId":"ETH-USDT"},"data":[["1700000000000","1","1","1","1","1","1","1","0"]]}"#)
        .await;

    let (received_channel, bar) = tokio::time::timeout(Duration::from_secs(5), ticks.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received_channel, btc);
    assert_eq!(bar.close, 65050.0);
    assert!(tokio::time::timeout(QUIET, ticks.recv()).await.is_err());

    adapter.disconnect().await;
}

#[tokio::test]
async fn test_heartbeat_is_sent_while_open() {
    let mut server = MockVenueServer::start().await;
    let adapter = okx(
        &server,
        AdapterSettings {
            heartbeat_interval: Duration::from_millis(50),
            ..settings(Duration::from_millis(100))
        },
    );
    adapter.connect().await.unwrap();
    assert_eq!(server.next_frame().await, "ping");
    adapter.disconnect().await;
}

#[tokio::test]
async fn test_heartbeat_stops_while_waiting_to_reconnect() {
    let mut server = MockVenueServer::start().await;
    let adapter = okx(
        &server,
        AdapterSettings {
            heartbeat_interval: Duration::from_millis(50),
            ..settings(Duration::from_secs(60))
        },
    );
    let mut events = adapter.events();
    adapter.connect().await.unwrap();
    assert_eq!(server.next_frame().await, "ping");

    server.close_current().await;
    wait_for(&mut events, |e| {
        matches!(e, AdapterEvent::ReconnectScheduled { .. })
    })
    .await;
    while server.try_next_frame(Duration::from_millis(1)).await.is_some() {}

    assert!(server.try_next_frame(Duration::from_millis(300)).await.is_none());
    assert_eq!(server.connections(), 1);

    adapter.disconnect().await;
}

#[tokio::test]
async fn test_heartbeat_does_not_outlive_its_socket() {
    let mut server = MockVenueServer::start().await;
    let adapter = okx(
        &server,
        AdapterSettings {
            heartbeat_interval: Duration::from_millis(100),
            ..settings(Duration::from_millis(50))
        },
    );
    let mut events = adapter.events();
    adapter.connect().await.unwrap();
    assert_eq!(server.next_frame().await, "ping");

    server.close_current().await;
    wait_for(&mut events, |e| {
        matches!(e, AdapterEvent::ReconnectScheduled { .. })
    })
    .await;
    server.wait_for_connections(2).await;
    while server.try_next_frame(Duration::from_millis(1)).await.is_some() {}

    // One timer per live socket: a leaked timer from the first session
    // would double the cadence on the second.
    tokio::time::sleep(Duration::from_millis(550)).await;
    let mut pings = 0;
    while let Some(frame) = server.try_next_frame(Duration::from_millis(1)).await {
        assert_eq!(frame, "ping");
        pings += 1;
    }
    assert!((3..=7).contains(&pings), "saw {} heartbeats", pings);
    assert_eq!(server.connections(), 2);

    adapter.disconnect().await;
    while server.try_next_frame(Duration::from_millis(1)).await.is_some() {}
    assert!(server.try_next_frame(QUIET).await.is_none());
}

#[tokio::test]
async fn test_unsubscribe_sends_frame_once_topic_unused() {
    let mut server = MockVenueServer::start().await;
    let adapter = okx(&server, settings(Duration::from_millis(100)));
    let btc = channel(Venue::Okx, "BTC-USDT", "1m");

    adapter.connect().await.unwrap();
    server.wait_for_connections(1).await;
    adapter.subscribe(btc.clone(), noop_sink());
    let frame = json(&server.next_data_frame().await);
    assert_eq!(frame["op"], "subscribe");

    adapter.unsubscribe(&btc);
    let frame = json(&server.next_data_frame().await);
    assert_eq!(frame["op"], "unsubscribe");
    assert_eq!(frame["args"][0]["instId"], "BTC-USDT");

    adapter.unsubscribe(&btc);
    assert!(server.try_next_frame(QUIET).await.is_none());

    adapter.disconnect().await;
}

#[tokio::test]
async fn test_auth_frame_gates_subscriptions() {
    let mut server = MockVenueServer::start().await;
    let adapter = polygon(&server);
    let mut events = adapter.events();

    adapter.subscribe(channel(Venue::Polygon, "AAPL", "1m"), noop_sink());
    adapter.subscribe(channel(Venue::Polygon, "MSFT", "1m"), noop_sink());
    adapter.connect().await.unwrap();

    assert_eq!(server.next_frame().await, r#"{"action":"auth","params":"KEY"}"#);
    assert!(server.try_next_frame(QUIET).await.is_none());

    server
        .send(r#"[{"ev":"status","status":"auth_success","message":"authenticated"}]"#)
        .await;
    wait_for(&mut events, |e| matches!(e, AdapterEvent::Authenticated { .. })).await;
    assert_eq!(
        server.next_frame().await,
        r#"{"action":"subscribe","params":"AM.AAPL,AM.MSFT"}"#
    );

    adapter.disconnect().await;
}

#[tokio::test]
async fn test_failed_auth_reports_error_and_reconnects() {
    let mut server = MockVenueServer::start().await;
    let adapter = polygon(&server);
    let mut events = adapter.events();

    adapter.connect().await.unwrap();
    server.next_frame().await;
    server
        .send(r#"[{"ev":"status","status":"auth_failed","message":"invalid key"}]"#)
        .await;

    let error = wait_for(&mut events, |e| matches!(e, AdapterEvent::Error { .. })).await;
    assert!(matches!(error, AdapterEvent::Error { message, .. } if message.contains("invalid key")));
    wait_for(&mut events, |e| matches!(e, AdapterEvent::ReconnectScheduled { .. })).await;

    adapter.disconnect().await;
}

#[tokio::test]
async fn test_shared_topic_unsubscribes_with_last_channel() {
    let mut server = MockVenueServer::start().await;
    let adapter = polygon(&server);
    let minute = channel(Venue::Polygon, "AAPL", "1m");
    let hour = channel(Venue::Polygon, "AAPL", "1H");

    adapter.subscribe(minute.clone(), noop_sink());
    adapter.subscribe(hour.clone(), noop_sink());
    adapter.connect().await.unwrap();
    server.next_frame().await;
    server.send(r#"[{"ev":"status","status":"auth_success"}]"#).await;
    assert_eq!(
        server.next_frame().await,
        r#"{"action":"subscribe","params":"AM.AAPL"}"#
    );

    adapter.unsubscribe(&minute);
    assert!(server.try_next_frame(QUIET).await.is_none());

    adapter.unsubscribe(&hour);
    assert_eq!(
        server.next_frame().await,
        r#"{"action":"unsubscribe","params":"AM.AAPL"}"#
    );

    adapter.disconnect().await;
}

#[tokio::test]
async fn test_hour_channel_receives_rolled_up_minutes() {
    let mut server = MockVenueServer::start().await;
    let adapter = polygon(&server);
    let (sink, mut ticks) = recording_sink();

    adapter.subscribe(channel(Venue::Polygon, "AAPL", "1H"), sink);
    adapter.connect().await.unwrap();
    server.next_frame().await;
    server.send(r#"[{"ev":"status","status":"auth_success"}]"#).await;
    server.next_frame().await;

    server
        .send(r#"[{"ev":"AM","sym":"AAPL","v":100,"o":10,"h":12,"l":9,"c":11,"s":1699999200000,"e":1699999260000},{"ev":"AM","sym":"AAPL","v":50,"o":11,"h":13,"l":10,"c":12,"s":1699999260000,"e":1699999320000}]"#)
        .await;

    let (_, first) = tokio::time::timeout(Duration::from_secs(5), ticks.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.volume, 100.0);
    let (_, second) = tokio::time::timeout(Duration::from_secs(5), ticks.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.timestamp, 1_699_999_200_000);
    assert_eq!(second.open, 10.0);
    assert_eq!(second.high, 13.0);
    assert_eq!(second.close, 12.0);
    assert_eq!(second.volume, 150.0);

    adapter.disconnect().await;
}

#[tokio::test]
async fn test_explicit_connect_supersedes_pending_reconnect() {
    let server = MockVenueServer::start().await;
    let adapter = okx(&server, settings(Duration::from_secs(60)));
    let mut events = adapter.events();

    adapter.connect().await.unwrap();
    server.wait_for_connections(1).await;
    server.close_current().await;
    wait_for(&mut events, |e| matches!(e, AdapterEvent::ReconnectScheduled { .. })).await;

    adapter.connect().await.unwrap();
    server.wait_for_connections(2).await;

    adapter.disconnect().await;
}

#[tokio::test]
async fn test_failed_connect_reports_error_and_schedules_reconnect() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let adapter = VenueAdapter::new(
        OkxProtocol::new(dead_url, "http://127.0.0.1:1"),
        settings(Duration::from_secs(60)),
    );
    let mut events = adapter.events();
    adapter.connect().await.unwrap();

    wait_for(&mut events, |e| matches!(e, AdapterEvent::Error { .. })).await;
    let scheduled =
        wait_for(&mut events, |e| matches!(e, AdapterEvent::ReconnectScheduled { .. })).await;
    assert!(matches!(
        scheduled,
        AdapterEvent::ReconnectScheduled { attempt: 1, .. }
    ));

    adapter.disconnect().await;
}

#[tokio::test]
async fn test_channels_survive_disconnect_and_connect() {
    let mut server = MockVenueServer::start().await;
    let adapter = okx(&server, settings(Duration::from_millis(100)));

    adapter.subscribe(channel(Venue::Okx, "BTC-USDT", "1m"), noop_sink());
    adapter.connect().await.unwrap();
    server.next_data_frame().await;

    adapter.disconnect().await;
    adapter.connect().await.unwrap();
    server.wait_for_connections(2).await;

    let frame = json(&server.next_data_frame().await);
    assert_eq!(frame["args"][0]["instId"], "BTC-USDT");

    adapter.disconnect().await;
}
