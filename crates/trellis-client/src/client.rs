//! Backend client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Map, Value};
use tracing::debug;
use trellis_types::ProviderConfig;
use url::Url;

use crate::error::{ClientError, ErrorResponse, Result};
use crate::types::{
    ProvidersResponse, SaveProviderConfigRequest, SyncDevTriggersRequest, SyncDevTriggersResponse,
    Workflow,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// What the dev runtime needs from the backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// `None` when the workflow does not exist in the namespace.
    async fn fetch_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>>;

    async fn fetch_providers(&self) -> Result<Vec<ProviderConfig>>;

    async fn sync_dev_triggers(
        &self,
        workflow_id: &str,
        request: &SyncDevTriggersRequest,
    ) -> Result<SyncDevTriggersResponse>;

    async fn save_provider_config(&self, config: &ProviderConfig) -> Result<()>;
}

/// HTTP implementation of [`Backend`], scoped to one namespace.
#[derive(Clone)]
pub struct BackendClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    http: reqwest::Client,
    base_url: Url,
    namespace: String,
    timeout: Duration,
}

impl BackendClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// `api/v1/namespaces/<namespace>/<path>` below the base URL.
    fn url(&self, path: &str) -> Result<Url> {
        let path = path.trim_start_matches('/');
        self.inner
            .base_url
            .join(&format!("api/v1/namespaces/{}/{path}", self.inner.namespace))
            .map_err(ClientError::from)
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path)?;
        debug!(%url, "GET");
        let response = self
            .inner
            .http
            .get(url)
            .timeout(self.inner.timeout)
            .send()
            .await?;
        handle_response(response).await
    }

    async fn post<T, B>(&self, path: &str, body: &B) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
        B: serde::Serialize + ?Sized,
    {
        let url = self.url(path)?;
        debug!(%url, "POST");
        let response = self
            .inner
            .http
            .post(url)
            .json(body)
            .timeout(self.inner.timeout)
            .send()
            .await?;
        handle_response(response).await
    }

    async fn put<B>(&self, path: &str, body: &B) -> Result<()>
    where
        B: serde::Serialize + ?Sized,
    {
        let url = self.url(path)?;
        debug!(%url, "PUT");
        let response = self
            .inner
            .http
            .put(url)
            .json(body)
            .timeout(self.inner.timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(extract_error(response).await);
        }
        Ok(())
    }
}

async fn handle_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(extract_error(response).await);
    }
    let bytes = response.bytes().await?;
    if bytes.is_empty() {
        return Ok(serde_json::from_value(Value::Null)?);
    }
    Ok(serde_json::from_slice(&bytes)?)
}

async fn extract_error(response: reqwest::Response) -> ClientError {
    let status = response.status().as_u16();
    match response.json::<ErrorResponse>().await {
        Ok(err) => match status {
            404 => ClientError::NotFound(err.message),
            401 | 403 => ClientError::Auth(err.message),
            _ => ClientError::Api {
                status,
                code: err.code,
                message: err.message,
            },
        },
        Err(_) => ClientError::Api {
            status,
            code: "unknown".to_string(),
            message: format!("HTTP {status}"),
        },
    }
}

#[async_trait]
impl Backend for BackendClient {
    async fn fetch_workflow(&self, workflow_id: &str) -> Result<Option<Workflow>> {
        match self.get(&format!("workflows/{workflow_id}")).await {
            Ok(workflow) => Ok(Some(workflow)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn fetch_providers(&self) -> Result<Vec<ProviderConfig>> {
        let response: ProvidersResponse = self.get("providers").await?;
        Ok(response.providers)
    }

    async fn sync_dev_triggers(
        &self,
        workflow_id: &str,
        request: &SyncDevTriggersRequest,
    ) -> Result<SyncDevTriggersResponse> {
        let response: Option<SyncDevTriggersResponse> = self
            .post(&format!("workflows/{workflow_id}/dev-triggers"), request)
            .await?;
        Ok(response.unwrap_or_default())
    }

    async fn save_provider_config(&self, config: &ProviderConfig) -> Result<()> {
        let body: SaveProviderConfigRequest<'_> = SaveProviderConfigRequest {
            config: &config.config,
        };
        self.put(
            &format!("providers/{}/{}", config.provider_type, config.alias),
            &body,
        )
        .await
    }
}

/// Builder for [`BackendClient`].
#[derive(Debug)]
pub struct ClientBuilder {
    base_url: Option<String>,
    api_token: Option<String>,
    namespace: Option<String>,
    timeout: Duration,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            base_url: None,
            api_token: None,
            namespace: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn api_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<BackendClient> {
        let base_url = self
            .base_url
            .ok_or_else(|| ClientError::Config("base_url is required".to_string()))?;
        let namespace = self
            .namespace
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| ClientError::Config("namespace is required".to_string()))?;

        let mut base_url = Url::parse(&base_url)?;
        if !base_url.path().ends_with('/') {
            base_url.set_path(&format!("{}/", base_url.path()));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.api_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ClientError::Config("Invalid API token".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(format!("trellis/{}", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(BackendClient {
            inner: Arc::new(ClientInner {
                http,
                base_url,
                namespace,
                timeout: self.timeout,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge freshly entered values over an existing configuration.
pub fn merge_config(base: &Map<String, Value>, entered: Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    merged.extend(entered);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_requires_base_url_and_namespace() {
        assert!(matches!(
            ClientBuilder::new().namespace("acme").build(),
            Err(ClientError::Config(_))
        ));
        assert!(matches!(
            ClientBuilder::new().base_url("http://localhost:8080").build(),
            Err(ClientError::Config(_))
        ));
    }

    #[test]
    fn test_urls_are_namespace_scoped() {
        let client = BackendClient::builder()
            .base_url("https://api.example.com/base")
            .namespace("acme")
            .build()
            .unwrap();
        assert_eq!(client.base_url().as_str(), "https://api.example.com/base/");
        assert_eq!(
            client.url("/workflows/wf_1").unwrap().as_str(),
            "https://api.example.com/base/api/v1/namespaces/acme/workflows/wf_1"
        );
    }

    #[test]
    fn test_merge_config_prefers_entered_values() {
        let base: Map<String, Value> =
            serde_json::from_value(serde_json::json!({"a": 1, "b": 2})).unwrap();
        let entered: Map<String, Value> =
            serde_json::from_value(serde_json::json!({"b": 3})).unwrap();
        let merged = merge_config(&base, entered);
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 3);
    }
}
