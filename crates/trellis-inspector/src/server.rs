//! Inspector protocol endpoint.
//!
//! One endpoint per process, bound to `127.0.0.1`, serving a single
//! websocket client at a time. Disconnecting the client releases any
//! paused thread.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use trellis_sandbox::{ConsoleEntry, ConsoleSink};

use crate::error::{InspectorError, Result};
use crate::protocol::{Command, Notification, Request, Response as ProtocolResponse};
use crate::session::DebugSession;

/// Default inspector port.
pub const DEFAULT_INSPECT_PORT: u16 = 9229;

const CONSOLE_CAPACITY: usize = 256;
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Set while any [`Inspector`] in the process is serving.
static PROCESS_ACTIVE: AtomicBool = AtomicBool::new(false);

struct BroadcastSink(broadcast::Sender<ConsoleEntry>);

impl ConsoleSink for BroadcastSink {
    fn emit(&self, entry: &ConsoleEntry) {
        let _ = self.0.send(entry.clone());
    }
}

#[derive(Clone)]
struct EndpointState {
    session: Arc<dyn DebugSession>,
    console: broadcast::Sender<ConsoleEntry>,
    client_connected: Arc<AtomicBool>,
    shutdown: watch::Receiver<bool>,
}

struct Running {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The debugger endpoint for one [`DebugSession`].
pub struct Inspector {
    session: Arc<dyn DebugSession>,
    console: broadcast::Sender<ConsoleEntry>,
    running: Mutex<Option<Running>>,
}

impl Inspector {
    pub fn new(session: Arc<dyn DebugSession>) -> Self {
        let (console, _) = broadcast::channel(CONSOLE_CAPACITY);
        session.attach_console(Arc::new(BroadcastSink(console.clone())));
        Self {
            session,
            console,
            running: Mutex::new(None),
        }
    }

    pub fn session(&self) -> &Arc<dyn DebugSession> {
        &self.session
    }

    /// Start serving on `127.0.0.1:port`. Repeated calls return the bound address.
    pub async fn start(&self, port: u16) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if let Some(r) = running.as_ref() {
            return Ok(r.addr);
        }
        if PROCESS_ACTIVE.swap(true, Ordering::SeqCst) {
            return Err(InspectorError::AlreadyActive);
        }

        let bound = async {
            let listener = TcpListener::bind(("127.0.0.1", port)).await?;
            let addr = listener.local_addr()?;
            Ok::<_, std::io::Error>((listener, addr))
        }
        .await;
        let (listener, addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                PROCESS_ACTIVE.store(false, Ordering::SeqCst);
                return Err(InspectorError::Bind { port, source });
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = EndpointState {
            session: self.session.clone(),
            console: self.console.clone(),
            client_connected: Arc::new(AtomicBool::new(false)),
            shutdown: shutdown_rx.clone(),
        };
        let app = Router::new()
            .route("/", get(ws_handler))
            .route("/json/version", get(version))
            .with_state(state);

        let mut signal = shutdown_rx;
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = signal.changed().await;
            });
            if let Err(e) = serve.await {
                warn!(error = %e, "Inspector endpoint failed");
            }
        });

        info!("Inspector listening on ws://{addr}");
        *running = Some(Running {
            addr,
            shutdown,
            task,
        });
        Ok(addr)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.addr)
    }

    /// Stop serving and release paused threads. Safe when never started.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown.send(true);
        self.session.detach();

        let mut task = running.task;
        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            task.abort();
        }
        PROCESS_ACTIVE.store(false, Ordering::SeqCst);
        debug!("Inspector stopped");
    }
}

#[derive(Serialize)]
struct VersionInfo {
    #[serde(rename = "Browser")]
    browser: String,
    #[serde(rename = "Protocol-Version")]
    protocol_version: &'static str,
}

async fn version() -> Json<VersionInfo> {
    Json(VersionInfo {
        browser: format!("trellis/{}", env!("CARGO_PKG_VERSION")),
        protocol_version: "1.0",
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<EndpointState>) -> Response {
    if state.client_connected.swap(true, Ordering::SeqCst) {
        return (
            StatusCode::CONFLICT,
            "a debugger client is already connected",
        )
            .into_response();
    }
    ws.on_upgrade(move |socket| async move {
        let connected = state.client_connected.clone();
        handle_socket(socket, state).await;
        connected.store(false, Ordering::SeqCst);
    })
}

async fn handle_socket(socket: WebSocket, state: EndpointState) {
    let (mut sender, mut receiver) = socket.split();
    let mut notifications = state.session.subscribe();
    let mut console = state.console.subscribe();
    let mut shutdown = state.shutdown.clone();
    let mut console_enabled = false;

    debug!("Debugger client connected");

    loop {
        tokio::select! {
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text.to_string(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "Debugger connection error");
                        break;
                    }
                };
                let response = match serde_json::from_str::<Request>(&text) {
                    Ok(request) => {
                        let id = request.id;
                        match Command::parse(&request) {
                            Ok(command) => {
                                if command == Command::RuntimeEnable {
                                    console_enabled = true;
                                }
                                match command.execute(state.session.as_ref()).await {
                                    Ok(result) => ProtocolResponse::ok(id, result),
                                    Err(e) => ProtocolResponse::error(id, e.to_string()),
                                }
                            }
                            Err(e) => ProtocolResponse::error(id, e.to_string()),
                        }
                    }
                    Err(e) => ProtocolResponse::error(0, format!("Invalid message: {e}")),
                };
                if send_json(&mut sender, &response).await.is_err() {
                    break;
                }
            }
            note = notifications.recv() => match note {
                Ok(note) => {
                    if send_json(&mut sender, &Notification::from(&note)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Debugger client lagging, notifications dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            entry = console.recv() => match entry {
                Ok(entry) if console_enabled => {
                    if send_json(&mut sender, &Notification::console(&entry)).await.is_err() {
                        break;
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }

    state.session.detach();
    debug!("Debugger client disconnected");
}

async fn send_json<T: Serialize>(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &T,
) -> std::result::Result<(), axum::Error> {
    let json = serde_json::to_string(msg).map_err(axum::Error::new)?;
    sender.send(Message::Text(json.into())).await
}
