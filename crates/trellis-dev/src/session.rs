//! The dev session: one project, one router, hot reload.
//!
//! Startup resolves the workflow, fetches provider configuration, executes
//! the project, checks that every used provider is configured, starts the
//! router and publishes the trigger set to the backend. Two reload flows
//! follow:
//!
//! - code reload (a source file changed): execute again with the cached
//!   provider configuration and swap the router's triggers
//! - provider reload (configuration was completed): fetch configuration,
//!   execute, validate, swap

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use trellis_client::{
    Backend, BackendClient, SyncDevTriggersRequest, TriggerSummary, merge_config,
};
use trellis_config::DevConfig;
use trellis_inspector::{ErrorEnricher, Inspector, LuaDebugSession};
use trellis_runtime::{
    CronProducer, EventRouter, PubSubTransport, RealtimeConfig, RealtimeProducer,
    WebSocketTransport, WebhookConfig, WebhookProducer,
};
use trellis_sandbox::{
    Console, ModuleExports, ProjectLoader, Registry, SandboxEngine, VirtualProject,
};
use trellis_types::{ProviderConfig, Trigger, TriggerId};

use crate::error::{DevError, Result};
use crate::providers::{MissingProvider, Prompter, ProviderValidator, TerminalPrompter};
use crate::source::ProjectSource;
use crate::watcher::EntryWatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DevOptions {
    /// Start the inspector and enrich handler failures.
    pub debug: bool,
    /// Fail on missing provider configuration instead of prompting.
    pub unattended: bool,
}

struct DebugBridge {
    inspector: Inspector,
    enricher: Arc<ErrorEnricher>,
}

pub struct DevSession {
    config: DevConfig,
    options: DevOptions,
    backend: Option<Arc<dyn Backend>>,
    transport: Option<Arc<dyn PubSubTransport>>,
    prompter: Option<Arc<dyn Prompter>>,
    source: ProjectSource,
    engine: SandboxEngine,
    debug: Option<DebugBridge>,
    provider_configs: Vec<ProviderConfig>,
    router: Option<EventRouter>,
    exports: Option<ModuleExports>,
    state: SessionState,
}

impl DevSession {
    /// A session with no backend, no realtime transport and no prompter.
    pub fn new(config: DevConfig, options: DevOptions) -> Self {
        let console = Console::new();
        let mut engine = SandboxEngine::new().with_console(console.clone());
        let debug = if options.debug {
            let session = LuaDebugSession::new(console);
            engine = engine.with_line_observer(session.clone());
            Some(DebugBridge {
                inspector: Inspector::new(session),
                enricher: Arc::new(
                    ErrorEnricher::new().with_project_root(config.project_dir.clone()),
                ),
            })
        } else {
            None
        };

        Self {
            source: ProjectSource::new(config.project_dir.clone()),
            config,
            options,
            backend: None,
            transport: None,
            prompter: None,
            engine,
            debug,
            provider_configs: Vec::new(),
            router: None,
            exports: None,
            state: SessionState::Idle,
        }
    }

    /// Wire up the backend client, realtime connection and terminal
    /// prompter the configuration asks for.
    pub fn from_config(config: DevConfig, options: DevOptions) -> Result<Self> {
        let backend = match &config.backend_url {
            Some(url) => {
                let mut builder = BackendClient::builder()
                    .base_url(url)
                    .namespace(&config.namespace);
                if let Some(token) = &config.api_token {
                    builder = builder.api_token(token);
                }
                Some(Arc::new(builder.build()?) as Arc<dyn Backend>)
            }
            None => {
                warn!("No backend URL configured; running without backend");
                None
            }
        };
        let transport = match &config.websocket_url {
            Some(url) => Some(Arc::new(WebSocketTransport::connect(
                url,
                config.api_token.as_deref(),
            )?) as Arc<dyn PubSubTransport>),
            None => None,
        };
        let prompter = if options.unattended {
            None
        } else {
            let terminal = TerminalPrompter::new();
            terminal
                .is_interactive()
                .then(|| Arc::new(terminal) as Arc<dyn Prompter>)
        };

        let mut session = Self::new(config, options);
        session.backend = backend;
        session.transport = transport;
        session.prompter = prompter;
        Ok(session)
    }

    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn PubSubTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Ignored in unattended sessions.
    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        if !self.options.unattended {
            self.prompter = Some(prompter);
        }
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &DevConfig {
        &self.config
    }

    pub fn provider_configs(&self) -> &[ProviderConfig] {
        &self.provider_configs
    }

    pub fn triggers(&self) -> Vec<Arc<Trigger>> {
        self.router
            .as_ref()
            .map(EventRouter::triggers)
            .unwrap_or_default()
    }

    pub fn webhook_urls(&self) -> HashMap<TriggerId, String> {
        self.router
            .as_ref()
            .map(EventRouter::webhook_urls)
            .unwrap_or_default()
    }

    /// The reporter handler failures go through in debug sessions.
    pub fn error_enricher(&self) -> Option<Arc<ErrorEnricher>> {
        self.debug.as_ref().map(|d| d.enricher.clone())
    }

    pub async fn inspector_addr(&self) -> Option<SocketAddr> {
        match &self.debug {
            Some(debug) => debug.inspector.local_addr().await,
            None => None,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(DevError::InvalidState("session already started"));
        }

        self.resolve_workflow().await?;
        self.refresh_provider_configs().await;
        let mut exports = self.execute().await?;

        let missing = self.missing_providers(&exports);
        if !missing.is_empty() {
            if self.configure_providers(missing).await? {
                exports = self.provider_cycle().await?;
            } else {
                self.ensure_providers(&exports)?;
            }
        }

        let mut router = self.build_router();
        router.start(exports.triggers.clone()).await?;
        self.router = Some(router);
        self.exports = Some(exports);
        self.state = SessionState::Running;

        // Generated webhook paths only exist once the router has bound them.
        self.sync_triggers().await;
        self.start_debug_bridge().await;
        self.log_summary();
        Ok(())
    }

    /// Execute the changed sources and swap the trigger set. Provider
    /// configuration is reused.
    pub async fn reload_code(&mut self) -> Result<()> {
        if self.state != SessionState::Running {
            return Err(DevError::InvalidState("session is not running"));
        }
        let exports = self.execute().await?;
        self.swap_triggers(exports).await
    }

    /// Fetch provider configuration again, execute, validate and swap.
    pub async fn reload_providers(&mut self) -> Result<()> {
        if self.state != SessionState::Running {
            return Err(DevError::InvalidState("session is not running"));
        }
        let exports = self.provider_cycle().await?;
        self.swap_triggers(exports).await
    }

    /// Stop producers and the inspector. In-flight handlers run to completion.
    pub async fn stop(&mut self) {
        if self.state == SessionState::Stopped {
            return;
        }
        if let Some(mut router) = self.router.take() {
            router.stop().await;
        }
        if let Some(transport) = &self.transport {
            transport.close().await;
        }
        if let Some(debug) = &self.debug {
            debug.inspector.stop().await;
        }
        self.exports = None;
        self.state = SessionState::Stopped;
        info!("Dev session stopped");
    }

    /// Start if needed, then reload on source changes until Ctrl-C.
    pub async fn run_until_shutdown(&mut self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Like [`run_until_shutdown`](Self::run_until_shutdown) with a custom
    /// shutdown signal.
    pub async fn run_until(&mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        if self.state == SessionState::Idle {
            self.start().await?;
        }

        let watcher = EntryWatcher::new(self.source.root()).watch();
        let (mut signals, _handle, mut watching) = match watcher {
            Ok((signals, handle)) => (signals, Some(handle), true),
            Err(e) => {
                warn!(error = %e, "Hot reload disabled");
                (tokio::sync::mpsc::channel(1).1, None, false)
            }
        };

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                signal = signals.recv(), if watching => match signal {
                    Some(signal) => {
                        info!(files = ?signal.paths, "Sources changed, reloading");
                        if let Err(e) = self.reload_code().await {
                            error!(error = %e, "Reload failed; previous triggers stay active");
                        }
                    }
                    None => {
                        warn!("File watcher stopped; hot reload disabled");
                        watching = false;
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutting down");
                    break;
                }
            }
        }

        self.stop().await;
        Ok(())
    }

    async fn resolve_workflow(&self) -> Result<()> {
        let Some(workflow_id) = &self.config.workflow_id else {
            debug!("No workflow id configured");
            return Ok(());
        };
        let Some(backend) = &self.backend else {
            debug!(workflow_id = %workflow_id, "No backend; skipping workflow check");
            return Ok(());
        };
        match backend.fetch_workflow(workflow_id).await? {
            Some(workflow) => {
                info!(workflow_id = %workflow.id, name = %workflow.name, "Resolved workflow");
                Ok(())
            }
            None => Err(DevError::WorkflowNotFound {
                workflow_id: workflow_id.clone(),
                namespace: self.config.namespace.clone(),
            }),
        }
    }

    /// A failed fetch keeps the current configuration.
    async fn refresh_provider_configs(&mut self) {
        let Some(backend) = &self.backend else {
            return;
        };
        match backend.fetch_providers().await {
            Ok(configs) => {
                debug!(count = configs.len(), "Fetched provider configurations");
                self.provider_configs = configs;
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch provider configurations; continuing without them");
            }
        }
    }

    async fn execute(&self) -> Result<ModuleExports> {
        let source = self.source.clone();
        let files = tokio::task::spawn_blocking(move || source.load())
            .await
            .map_err(|e| DevError::Io(std::io::Error::other(e.to_string())))??;
        let project = ProjectLoader::new().prepare(
            VirtualProject::new(files.sources, self.config.entry.clone()),
            self.provider_configs.clone(),
        )?;
        if let Some(debug) = &self.debug {
            debug.enricher.set_files(project.files().clone());
            let maps = debug.enricher.source_maps();
            maps.clear();
            for (generated, json) in &files.source_maps {
                if let Err(e) = maps.register(generated, json) {
                    warn!(file = %generated, error = %e, "Ignoring source map");
                }
            }
        }
        let exports = self
            .engine
            .execute_blocking(project, Registry::new())
            .await?;
        if exports.triggers.is_empty() {
            warn!(entry = %self.config.entry, "Project registered no triggers");
        }
        Ok(exports)
    }

    async fn provider_cycle(&mut self) -> Result<ModuleExports> {
        self.refresh_provider_configs().await;
        let exports = self.execute().await?;
        self.ensure_providers(&exports)?;
        Ok(exports)
    }

    fn missing_providers(&self, exports: &ModuleExports) -> Vec<MissingProvider> {
        ProviderValidator::new(&self.provider_configs).missing(&exports.providers)
    }

    fn ensure_providers(&self, exports: &ModuleExports) -> Result<()> {
        let missing = self.missing_providers(exports);
        if missing.is_empty() {
            return Ok(());
        }
        Err(DevError::MissingProviders(
            missing.iter().map(MissingProvider::key).collect(),
        ))
    }

    /// Prompt for each missing provider and store what was entered.
    /// Returns whether anything was configured.
    async fn configure_providers(&mut self, missing: Vec<MissingProvider>) -> Result<bool> {
        let Some(prompter) = self.prompter.clone() else {
            return Err(DevError::MissingProviders(
                missing.iter().map(MissingProvider::key).collect(),
            ));
        };

        let mut configured = false;
        for item in missing {
            let asked = item.clone();
            let prompter = prompter.clone();
            let entered = tokio::task::spawn_blocking(move || prompter.prompt(&asked))
                .await
                .map_err(|e| DevError::Prompt(e.to_string()))?
                .map_err(|e| DevError::Prompt(e.to_string()))?;
            let Some(entered) = entered else {
                warn!(provider = %item.key(), "Provider configuration skipped");
                continue;
            };

            let base = item
                .existing
                .as_ref()
                .map(|c| c.config.clone())
                .unwrap_or_default();
            let config = ProviderConfig {
                provider_type: item.provider.provider_type.clone(),
                alias: item.provider.alias.clone(),
                config: merge_config(&base, entered),
            };
            if let Some(backend) = &self.backend {
                match backend.save_provider_config(&config).await {
                    Ok(()) => info!(provider = %config.key(), "Saved provider configuration"),
                    Err(e) => warn!(provider = %config.key(), error = %e, "Failed to save provider configuration"),
                }
            }
            self.provider_configs.retain(|c| c.key() != config.key());
            self.provider_configs.push(config);
            configured = true;
        }
        Ok(configured)
    }

    fn build_router(&self) -> EventRouter {
        let webhooks = WebhookProducer::new(WebhookConfig {
            host: self.config.host.clone(),
            port: self.config.port,
            public_url: self.config.public_url.clone(),
        });
        let mut router = EventRouter::new()
            .with_producer(Box::new(webhooks))
            .with_producer(Box::new(CronProducer::new()));
        if let Some(transport) = &self.transport {
            router = router.with_producer(Box::new(RealtimeProducer::new(
                RealtimeConfig {
                    namespace: self.config.namespace.clone(),
                    workflow_id: self.config.workflow_id.clone(),
                },
                transport.clone(),
            )));
        }
        router
    }

    async fn swap_triggers(&mut self, exports: ModuleExports) -> Result<()> {
        let router = self
            .router
            .as_mut()
            .ok_or(DevError::InvalidState("session is not running"))?;
        router.update_triggers(exports.triggers.clone()).await?;
        self.exports = Some(exports);
        self.sync_triggers().await;
        self.log_summary();
        Ok(())
    }

    /// Publish the active triggers, with their assigned URLs, to the backend.
    async fn sync_triggers(&self) {
        let (Some(backend), Some(workflow_id), Some(router)) =
            (&self.backend, &self.config.workflow_id, &self.router)
        else {
            return;
        };
        let urls = router.webhook_urls();
        let request = SyncDevTriggersRequest {
            triggers: router
                .triggers()
                .iter()
                .map(|t| TriggerSummary::from_trigger(t, urls.get(&t.id()).map(String::as_str)))
                .collect(),
        };
        match backend.sync_dev_triggers(workflow_id, &request).await {
            Ok(response) => debug!(
                triggers = request.triggers.len(),
                registered = response.registered.len(),
                "Synced dev triggers"
            ),
            Err(e) => warn!(error = %e, "Failed to sync dev triggers"),
        }
    }

    async fn start_debug_bridge(&self) {
        let (Some(debug), Some(router)) = (&self.debug, &self.router) else {
            return;
        };
        match debug.inspector.start(self.config.inspect_port).await {
            Ok(addr) => {
                router.set_error_reporter(Some(debug.enricher.clone()));
                info!("Debugger listening on ws://{addr}");
            }
            Err(e) => warn!(error = %e, "Inspector unavailable; continuing without it"),
        }
    }

    fn log_summary(&self) {
        let (Some(router), Some(exports)) = (&self.router, &self.exports) else {
            return;
        };
        let urls = router.webhook_urls();
        for trigger in &exports.triggers {
            match urls.get(&trigger.id()) {
                Some(url) => info!(trigger = %trigger.describe(), url = %url, "Trigger active"),
                None => info!(trigger = %trigger.describe(), "Trigger active"),
            }
        }
        info!(
            triggers = exports.triggers.len(),
            providers = exports.providers.len(),
            "Dev session ready"
        );
    }
}
