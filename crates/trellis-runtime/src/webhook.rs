//! Webhook producer: the local HTTP listener.
//!
//! The listener binds once, on the first update that carries a webhook
//! trigger, and stays bound until [`Producer::stop`]. Each update rebuilds
//! the binding table:
//!
//! 1. New triggers are matched to current bindings by content (path,
//!    method, provider metadata). A match keeps its path, URL and metadata
//!    and runs no lifecycle hooks.
//! 2. Bindings left without a match are torn down. Teardown failures are
//!    logged and never stop the update.
//! 3. Unmatched triggers get their explicit or a generated path, run
//!    `setup`, and only then receive traffic.
//!
//! The HTTP response waits for the router: `200 {success:true}` once every
//! handler succeeded, `500` when the handler failed.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
};
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use trellis_types::{
    Event, EventKind, LifecycleContext, ProviderMeta, Trigger, TriggerId, WebhookMetadata,
    WebhookRequest, WebhookSpec,
};

use crate::error::{Result, RuntimeError};
use crate::producer::Producer;
use crate::stream::EventStream;

pub const DEFAULT_WEBHOOK_HOST: &str = "127.0.0.1";
pub const DEFAULT_WEBHOOK_PORT: u16 = 3000;

const GENERATED_PATH_LEN: usize = 12;

/// Listener settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub host: String,
    /// `0` picks a free port.
    pub port: u16,
    /// Externally reachable base URL (e.g. a tunnel). Defaults to the bound address.
    pub public_url: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_WEBHOOK_HOST.to_string(),
            port: DEFAULT_WEBHOOK_PORT,
            public_url: None,
        }
    }
}

impl WebhookConfig {
    pub fn base_url(&self, addr: SocketAddr) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{addr}"),
        }
    }
}

/// Identity of a webhook trigger across reloads.
#[derive(Debug, Clone, PartialEq)]
struct BindingKey {
    path: Option<String>,
    method: String,
    provider_meta: Option<ProviderMeta>,
}

impl BindingKey {
    fn of(spec: &WebhookSpec) -> Self {
        Self {
            path: spec.path.clone(),
            method: spec.method.clone(),
            provider_meta: spec.provider_meta.clone(),
        }
    }
}

/// An active webhook.
#[derive(Clone)]
pub struct Binding {
    pub trigger: Arc<Trigger>,
    pub path: String,
    pub url: String,
    /// Scratch space shared by the trigger's `setup` and `teardown` hooks.
    pub metadata: WebhookMetadata,
    key: BindingKey,
}

impl Binding {
    pub fn method(&self) -> &str {
        &self.key.method
    }

    fn spec(&self) -> Option<&WebhookSpec> {
        self.trigger.as_webhook()
    }

    fn lifecycle_context(&self) -> LifecycleContext {
        LifecycleContext {
            url: self.url.clone(),
            path: self.path.clone(),
            method: self.key.method.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

#[derive(Default)]
struct Shared {
    bindings: RwLock<HashMap<String, Binding>>,
    stream: RwLock<Option<EventStream>>,
}

struct Server {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct WebhookProducer {
    config: WebhookConfig,
    shared: Arc<Shared>,
    server: Option<Server>,
}

impl WebhookProducer {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared::default()),
            server: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|s| s.addr)
    }

    /// Current bindings, sorted by path.
    pub fn bindings(&self) -> Vec<Binding> {
        let mut bindings: Vec<Binding> = self.shared.bindings.read().values().cloned().collect();
        bindings.sort_by(|a, b| a.path.cmp(&b.path));
        bindings
    }

    /// The HTTP surface, sharing this producer's binding table.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/webhook/{*path}", any(handle_webhook))
            .route("/health", get(health))
            .fallback(not_found)
            .layer(TraceLayer::new_for_http())
            .with_state(self.shared.clone())
    }

    async fn ensure_listening(&mut self) -> Result<SocketAddr> {
        if let Some(server) = &self.server {
            return Ok(server.addr);
        }

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RuntimeError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener
            .local_addr()
            .map_err(|source| RuntimeError::Bind { addr, source })?;

        let app = self.router();
        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = signal.await;
            });
            if let Err(e) = serve.await {
                error!(error = %e, "Webhook listener failed");
            }
        });

        info!(addr = %local, "Webhook listener started");
        self.server = Some(Server {
            addr: local,
            shutdown,
            task,
        });
        Ok(local)
    }
}

fn generate_path(table: &HashMap<String, Binding>) -> String {
    loop {
        let candidate = uuid::Uuid::new_v4().simple().to_string()[..GENERATED_PATH_LEN].to_string();
        if !table.contains_key(&candidate) {
            return candidate;
        }
    }
}

async fn teardown(binding: &Binding) {
    let Some(hook) = binding.spec().and_then(|s| s.teardown.clone()) else {
        return;
    };
    match hook.call(binding.lifecycle_context()).await {
        Ok(()) => debug!(path = %binding.path, "Webhook teardown complete"),
        Err(e) => warn!(path = %binding.path, error = %e, "Webhook teardown failed"),
    }
}

#[async_trait]
impl Producer for WebhookProducer {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn update_triggers(
        &mut self,
        triggers: &[Arc<Trigger>],
        stream: EventStream,
    ) -> Result<()> {
        *self.shared.stream.write() = Some(stream);

        let webhooks: Vec<Arc<Trigger>> = triggers
            .iter()
            .filter(|t| t.as_webhook().is_some())
            .cloned()
            .collect();
        let base_url = if webhooks.is_empty() {
            None
        } else {
            let addr = self.ensure_listening().await?;
            Some(self.config.base_url(addr))
        };

        let mut unclaimed: Vec<Binding> = self.shared.bindings.read().values().cloned().collect();
        let mut table: HashMap<String, Binding> = HashMap::new();
        let mut added = Vec::new();
        for trigger in webhooks {
            let Some(spec) = trigger.as_webhook() else {
                continue;
            };
            let key = BindingKey::of(spec);
            match unclaimed.iter().position(|b| b.key == key) {
                Some(idx) => {
                    let mut binding = unclaimed.swap_remove(idx);
                    binding.trigger = trigger;
                    table.insert(binding.path.clone(), binding);
                }
                None => added.push((trigger, key)),
            }
        }

        for binding in &unclaimed {
            teardown(binding).await;
        }

        let Some(base_url) = base_url else {
            self.shared.bindings.write().clear();
            return Ok(());
        };

        for (trigger, key) in added {
            let path = match &key.path {
                Some(path) if table.contains_key(path) => {
                    warn!(path = %path, trigger = %trigger.id(), "Duplicate webhook path, trigger skipped");
                    continue;
                }
                Some(path) => path.clone(),
                None => generate_path(&table),
            };
            let binding = Binding {
                url: format!("{base_url}/webhook/{path}"),
                path,
                trigger,
                metadata: WebhookMetadata::new(),
                key,
            };

            if let Some(setup) = binding.spec().and_then(|s| s.setup.clone())
                && let Err(source) = setup.call(binding.lifecycle_context()).await
            {
                error!(path = %binding.path, error = %source, "Webhook setup failed");
                *self.shared.bindings.write() = table;
                return Err(RuntimeError::WebhookSetup {
                    path: binding.path,
                    source,
                });
            }

            info!(url = %binding.url, method = binding.method(), "Webhook bound");
            table.insert(binding.path.clone(), binding);
        }

        *self.shared.bindings.write() = table;
        Ok(())
    }

    fn webhook_urls(&self) -> Vec<(TriggerId, String)> {
        self.bindings()
            .into_iter()
            .map(|b| (b.trigger.id(), b.url))
            .collect()
    }

    async fn stop(&mut self) -> Result<()> {
        let bindings: Vec<Binding> = self.shared.bindings.write().drain().map(|(_, b)| b).collect();
        for binding in &bindings {
            teardown(binding).await;
        }
        self.shared.stream.write().take();

        if let Some(server) = self.server.take() {
            let _ = server.shutdown.send(());
            let _ = server.task.await;
            info!(addr = %server.addr, "Webhook listener stopped");
        }
        Ok(())
    }
}

/// Rejections returned by the webhook surface.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Webhook not found")]
    NotFound,
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Webhook validation failed")]
    ValidationFailed,
    #[error("Webhook handler failed")]
    HandlerFailed,
    #[error("Event stream closed")]
    Unavailable,
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match self {
            WebhookError::NotFound => StatusCode::NOT_FOUND,
            WebhookError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            WebhookError::ValidationFailed => StatusCode::UNAUTHORIZED,
            WebhookError::HandlerFailed => StatusCode::INTERNAL_SERVER_ERROR,
            WebhookError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

async fn not_found() -> WebhookError {
    WebhookError::NotFound
}

fn header_map(headers: &HeaderMap) -> Map<String, Value> {
    let mut map = Map::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        match map.get_mut(name.as_str()) {
            Some(Value::String(existing)) => {
                existing.push_str(", ");
                existing.push_str(&value);
            }
            _ => {
                map.insert(name.as_str().to_string(), Value::String(value));
            }
        }
    }
    map
}

fn query_map(query: Option<&str>) -> Map<String, Value> {
    query
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

async fn handle_webhook(
    State(shared): State<Arc<Shared>>,
    Path(path): Path<String>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> std::result::Result<Json<Value>, WebhookError> {
    let binding = shared
        .bindings
        .read()
        .get(&path)
        .cloned()
        .ok_or(WebhookError::NotFound)?;
    let spec = binding.spec().ok_or(WebhookError::NotFound)?;
    if !spec.method.eq_ignore_ascii_case(method.as_str()) {
        return Err(WebhookError::MethodNotAllowed);
    }

    let request = WebhookRequest {
        method: method.to_string(),
        path: path.clone(),
        headers: header_map(&headers),
        query: query_map(query.as_deref()),
        body: parse_body(&body),
        received_at: Utc::now(),
    };
    let event = serde_json::to_value(&request).map_err(|_| WebhookError::Unavailable)?;

    if let Some(validator) = &spec.validation {
        match validator.validate(&event).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(path = %path, "Webhook validation rejected request");
                return Err(WebhookError::ValidationFailed);
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Webhook validation errored");
                return Err(WebhookError::ValidationFailed);
            }
        }
    }

    let stream = shared.stream.read().clone().ok_or(WebhookError::Unavailable)?;
    let (ack, outcome) = oneshot::channel();
    stream
        .publish(Event::targeted(EventKind::Webhook, binding.trigger.clone(), event).with_ack(ack))
        .map_err(|_| WebhookError::Unavailable)?;

    match outcome.await {
        Ok(outcome) if outcome.is_success() => Ok(Json(json!({ "success": true }))),
        Ok(_) => Err(WebhookError::HandlerFailed),
        Err(_) => Err(WebhookError::Unavailable),
    }
}

async fn health(State(shared): State<Arc<Shared>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "webhooks": shared.bindings.read().len(),
    }))
}
