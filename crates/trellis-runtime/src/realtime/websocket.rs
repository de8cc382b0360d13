//! Websocket pub/sub transport.
//!
//! Frames are JSON text messages:
//!
//! - client → server: `{"type":"subscribe","channel":"..."}`
//! - server → client: `{"type":"message","channel":"...","data":{...}}`
//!
//! The connection loop reconnects with exponential backoff and re-sends a
//! `subscribe` frame for every channel it knows about, so subscriptions
//! survive disconnects without being recreated.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use super::transport::{PubSubTransport, Subscription};
use crate::error::{Result, RuntimeError};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Delay before reconnect attempt number `attempt` (0-based).
pub fn backoff_delay(attempt: u32) -> Duration {
    std::cmp::min(INITIAL_BACKOFF * 2u32.pow(attempt.min(10)), MAX_BACKOFF)
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame<'a> {
    Subscribe { channel: &'a str },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerFrame {
    Message {
        channel: String,
        #[serde(default)]
        data: Value,
    },
    #[serde(other)]
    Other,
}

enum Command {
    Subscribe {
        channel: String,
        tx: mpsc::UnboundedSender<Value>,
    },
}

type Subscribers = HashMap<String, Vec<mpsc::UnboundedSender<Value>>>;

pub struct WebSocketTransport {
    url: Url,
    commands: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WebSocketTransport {
    /// Start the connection loop. `token`, when set, is sent as the `token` query parameter.
    pub fn connect(url: &str, token: Option<&str>) -> Result<Self> {
        let mut url = Url::parse(url)?;
        match url.scheme() {
            "ws" | "wss" => {}
            "http" => set_scheme(&mut url, "ws")?,
            "https" => set_scheme(&mut url, "wss")?,
            other => {
                return Err(RuntimeError::Transport(format!(
                    "unsupported URL scheme: {other}"
                )));
            }
        }
        if let Some(token) = token {
            url.query_pairs_mut().append_pair("token", token);
        }

        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(connection_loop(url.clone(), rx));
        Ok(Self {
            url,
            commands,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

fn set_scheme(url: &mut Url, scheme: &str) -> Result<()> {
    url.set_scheme(scheme)
        .map_err(|_| RuntimeError::Transport(format!("cannot use scheme {scheme} for {url}")))
}

#[async_trait]
impl PubSubTransport for WebSocketTransport {
    async fn subscribe(&self, channel: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.commands
            .send(Command::Subscribe {
                channel: channel.to_string(),
                tx,
            })
            .map_err(|_| RuntimeError::Transport("transport closed".into()))?;
        Ok(Subscription::new(channel, rx))
    }

    async fn close(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
            debug!(url = %self.url, "Pub/sub transport closed");
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

/// Returns when every [`WebSocketTransport`] handle is gone.
async fn connection_loop(url: Url, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut subscribers: Subscribers = HashMap::new();
    let mut attempt = 0u32;

    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                attempt = 0;
                info!(url = %redacted(&url), "Pub/sub connected");
                let reconnect = handle_connection(ws, &mut commands, &mut subscribers).await;
                if !reconnect {
                    return;
                }
                warn!("Pub/sub connection lost, will reconnect");
            }
            Err(e) => warn!(error = %e, "Pub/sub connection failed"),
        }

        let delay = backoff_delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!(delay_ms = delay.as_millis() as u64, "Reconnecting");

        // Keep accepting subscriptions while waiting.
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                cmd = commands.recv() => match cmd {
                    Some(Command::Subscribe { channel, tx }) => {
                        subscribers.entry(channel).or_default().push(tx);
                    }
                    None => return,
                },
            }
        }
    }
}

/// Returns true to reconnect, false when the transport was dropped.
async fn handle_connection(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    subscribers: &mut Subscribers,
) -> bool {
    let (mut sink, mut stream) = ws.split();

    for channel in subscribers.keys() {
        if send_subscribe(&mut sink, channel).await.is_err() {
            return true;
        }
    }

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(Command::Subscribe { channel, tx }) => {
                    let known = subscribers.contains_key(&channel);
                    subscribers.entry(channel.clone()).or_default().push(tx);
                    if !known && send_subscribe(&mut sink, &channel).await.is_err() {
                        return true;
                    }
                }
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return false;
                }
            },
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(ServerFrame::Message { channel, data }) => {
                        if let Some(subs) = subscribers.get_mut(&channel) {
                            subs.retain(|tx| tx.send(data.clone()).is_ok());
                        }
                    }
                    Ok(ServerFrame::Other) => {}
                    Err(e) => warn!(error = %e, "Unparseable pub/sub frame"),
                },
                Some(Ok(Message::Ping(data))) => {
                    let _ = sink.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | None => return true,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Pub/sub websocket error");
                    return true;
                }
            },
        }
    }
}

async fn send_subscribe<S>(sink: &mut S, channel: &str) -> std::result::Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let Ok(frame) = serde_json::to_string(&ClientFrame::Subscribe { channel }) else {
        return Err(());
    };
    debug!(channel, "Subscribing");
    sink.send(Message::text(frame)).await.map_err(|_| ())
}

fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    #[test]
    fn test_backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(100));
        assert_eq!(backoff_delay(1), Duration::from_millis(200));
        assert_eq!(backoff_delay(4), Duration::from_millis(1600));
        assert_eq!(backoff_delay(9), Duration::from_secs(30));
        assert_eq!(backoff_delay(50), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_connect_rewrites_scheme_and_appends_token() {
        let transport = WebSocketTransport::connect("https://rt.example.com/ws", Some("t0k")).unwrap();
        assert_eq!(transport.url().as_str(), "wss://rt.example.com/ws?token=t0k");
        transport.close().await;

        assert!(WebSocketTransport::connect("ftp://rt.example.com", None).is_err());
    }

    async fn next_text(
        ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    ) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_subscription_survives_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let transport = WebSocketTransport::connect(&format!("ws://{addr}/"), None).unwrap();
        let mut sub = transport.subscribe("dev:wf_1").await.unwrap();

        let (socket, _) = listener.accept().await.unwrap();
        let mut server = tokio_tungstenite::accept_async(socket).await.unwrap();
        assert_eq!(
            next_text(&mut server).await,
            json!({"type": "subscribe", "channel": "dev:wf_1"})
        );
        server
            .send(Message::text(
                json!({"type": "message", "channel": "dev:wf_1", "data": {"n": 1}}).to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(sub.next().await, Some(json!({"n": 1})));

        drop(server);

        let (socket, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut server = tokio_tungstenite::accept_async(socket).await.unwrap();
        assert_eq!(
            next_text(&mut server).await,
            json!({"type": "subscribe", "channel": "dev:wf_1"})
        );
        server
            .send(Message::text(
                json!({"type": "message", "channel": "dev:wf_1", "data": {"n": 2}}).to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(sub.next().await, Some(json!({"n": 2})));

        transport.close().await;
    }
}
