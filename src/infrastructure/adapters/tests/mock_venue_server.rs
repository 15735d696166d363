use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

enum Control {
    Send(String),
    Close,
}

/// Minimal websocket venue: records every text frame clients send and lets
/// the test push frames to, or drop, the most recent connection.
pub struct MockVenueServer {
    addr: SocketAddr,
    received: mpsc::UnboundedReceiver<String>,
    controls: Arc<Mutex<Vec<mpsc::UnboundedSender<Control>>>>,
    accepted: Arc<AtomicUsize>,
}

impl MockVenueServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, received) = mpsc::unbounded_channel();
        let controls: Arc<Mutex<Vec<mpsc::UnboundedSender<Control>>>> = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));

        let task_controls = controls.clone();
        let task_accepted = accepted.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let Ok(ws) = accept_async(stream).await else {
                    continue;
                };
                let (control_tx, mut control_rx) = mpsc::unbounded_channel();
                task_controls.lock().await.push(control_tx);
                task_accepted.fetch_add(1, Ordering::SeqCst);
                let received_tx = received_tx.clone();

                tokio::spawn(async move {
                    let (mut write, mut read) = ws.split();
                    loop {
                        tokio::select! {
                            message = read.next() => match message {
                                Some(Ok(Message::Text(text))) => {
                                    let _ = received_tx.send(text);
                                }
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                Some(Ok(_)) => {}
                            },
                            control = control_rx.recv() => match control {
                                Some(Control::Send(text)) => {
                                    if write.send(Message::Text(text)).await.is_err() {
                                        break;
                                    }
                                }
                                Some(Control::Close) | None => {
                                    let _ = write.send(Message::Close(None)).await;
                                    break;
                                }
                            },
                        }
                    }
                });
            }
        });

        Self {
            addr,
            received,
            controls,
            accepted,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Next frame sent by any client, failing the test after five seconds.
    pub async fn next_frame(&mut self) -> String {
        self.try_next_frame(Duration::from_secs(5))
            .await
            .expect("no frame received from client")
    }

    pub async fn try_next_frame(&mut self, wait: Duration) -> Option<String> {
        tokio::time::timeout(wait, self.received.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next frame that is not a heartbeat.
    pub async fn next_data_frame(&mut self) -> String {
        loop {
            let frame = self.next_frame().await;
            if frame != "ping" {
                return frame;
            }
        }
    }

    pub async fn send(&self, text: &str) {
        if let Some(connection) = self.controls.lock().await.last() {
            let _ = connection.send(Control::Send(text.to_string()));
        }
    }

    pub async fn close_current(&self) {
        if let Some(connection) = self.controls.lock().await.last() {
            let _ = connection.send(Control::Close);
        }
    }

    pub async fn wait_for_connections(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.connections() < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {} connection(s), saw {}",
                count,
                self.connections()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
