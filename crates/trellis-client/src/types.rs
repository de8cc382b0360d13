//! Wire types exchanged with the backend.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use trellis_types::{ProviderConfig, ProviderMeta, Trigger, TriggerSpec};

/// A workflow as the backend knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ProvidersResponse {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// Trigger metadata sent on every dev sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub trigger_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Public URL of a bound webhook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(
        default,
        rename = "_providerMeta",
        skip_serializing_if = "Option::is_none"
    )]
    pub provider_meta: Option<ProviderMeta>,
}

impl TriggerSummary {
    pub fn from_trigger(trigger: &Trigger, url: Option<&str>) -> Self {
        let mut summary = Self {
            id: trigger.id().to_string(),
            trigger_type: trigger.kind().as_str().to_string(),
            path: None,
            method: None,
            url: url.map(str::to_string),
            expression: None,
            channel: None,
            message_type: None,
            provider_meta: None,
        };
        match trigger.spec() {
            TriggerSpec::Webhook(spec) => {
                summary.path = spec.path.clone();
                summary.method = Some(spec.method.clone());
                summary.provider_meta = spec.provider_meta.clone();
            }
            TriggerSpec::Cron(spec) => summary.expression = Some(spec.expression.clone()),
            TriggerSpec::Realtime(spec) => {
                summary.channel = Some(spec.channel.clone());
                summary.message_type = spec.message_type.clone();
            }
        }
        summary
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDevTriggersRequest {
    pub triggers: Vec<TriggerSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDevTriggersResponse {
    /// Webhook URLs the backend registered on behalf of provider triggers.
    #[serde(default)]
    pub registered: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct SaveProviderConfigRequest<'a> {
    pub config: &'a Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_types::{WebhookSpec, handler_fn};

    #[test]
    fn test_summary_of_provider_webhook() {
        let meta = ProviderMeta {
            provider_type: "slack".into(),
            provider_alias: "default".into(),
            trigger_type: "onMessage".into(),
            input: json!({"channel_id": "C1"}),
        };
        let trigger = Trigger::webhook(
            WebhookSpec::new().with_path("slack").with_provider_meta(meta),
            handler_fn(|_, _| async { Ok(()) }),
        );
        let value = serde_json::to_value(TriggerSummary::from_trigger(
            &trigger,
            Some("https://tunnel.example.com/webhook/slack"),
        ))
        .unwrap();

        assert_eq!(value["type"], "webhook");
        assert_eq!(value["method"], "POST");
        assert_eq!(value["url"], "https://tunnel.example.com/webhook/slack");
        assert_eq!(value["_providerMeta"]["provider_alias"], "default");
        assert!(value.get("expression").is_none());
    }

    #[test]
    fn test_summary_of_realtime() {
        let trigger = Trigger::realtime(
            "orders",
            Some("created".into()),
            handler_fn(|_, _| async { Ok(()) }),
        );
        let summary = TriggerSummary::from_trigger(&trigger, None);
        assert_eq!(summary.channel.as_deref(), Some("orders"));
        assert_eq!(
            serde_json::to_value(&summary).unwrap()["messageType"],
            "created"
        );
    }
}
