//! Provider declarations and configuration.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Alias used when a provider is instantiated without one.
pub const DEFAULT_PROVIDER_ALIAS: &str = "default";

/// Registry key for a provider instance: `"type:alias"`.
pub fn provider_key(provider_type: &str, alias: &str) -> String {
    format!("{provider_type}:{alias}")
}

/// Routing metadata attached to provider-owned webhook triggers.
///
/// Field names match the `trigger_metadata` object delivered over the dev
/// channel, so equality here is equality on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMeta {
    pub provider_type: String,
    pub provider_alias: String,
    pub trigger_type: String,
    #[serde(default)]
    pub input: Value,
}

/// A secret a provider expects in its configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl SecretDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            required: true,
        }
    }
}

/// A provider instantiated by user code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsedProvider {
    #[serde(rename = "type")]
    pub provider_type: String,
    pub alias: String,
    #[serde(
        default,
        rename = "secretDefinitions",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub secret_definitions: Vec<SecretDefinition>,
}

impl UsedProvider {
    pub fn new(provider_type: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            provider_type: provider_type.into(),
            alias: alias.into(),
            secret_definitions: Vec::new(),
        }
    }

    pub fn key(&self) -> String {
        provider_key(&self.provider_type, &self.alias)
    }
}

/// Backend-stored configuration for one provider instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub provider_type: String,
    #[serde(default = "default_alias")]
    pub alias: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

fn default_alias() -> String {
    DEFAULT_PROVIDER_ALIAS.to_string()
}

impl ProviderConfig {
    pub fn key(&self) -> String {
        provider_key(&self.provider_type, &self.alias)
    }

    /// Names of required secrets that have no non-empty value in `config`.
    pub fn missing_secrets<'a>(&self, definitions: &'a [SecretDefinition]) -> Vec<&'a str> {
        definitions
            .iter()
            .filter(|def| def.required)
            .filter(|def| match self.config.get(&def.name) {
                None | Some(Value::Null) => true,
                Some(Value::String(s)) => s.is_empty(),
                Some(_) => false,
            })
            .map(|def| def.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_provider_key() {
        assert_eq!(provider_key("slack", "default"), "slack:default");
    }

    #[test]
    fn test_meta_equality_is_structural() {
        let a = ProviderMeta {
            provider_type: "slack".into(),
            provider_alias: "default".into(),
            trigger_type: "onMessage".into(),
            input: json!({"channel_id": "C1"}),
        };
        let wire: ProviderMeta = serde_json::from_value(json!({
            "provider_type": "slack",
            "provider_alias": "default",
            "trigger_type": "onMessage",
            "input": {"channel_id": "C1"}
        }))
        .unwrap();
        assert_eq!(a, wire);

        let mut other_alias = a.clone();
        other_alias.provider_alias = "work".into();
        assert_ne!(a, other_alias);
    }

    #[test]
    fn test_used_provider_serializes_without_empty_secrets() {
        let used = UsedProvider::new("slack", "default");
        assert_eq!(
            serde_json::to_value(&used).unwrap(),
            json!({"type": "slack", "alias": "default"})
        );
    }

    #[test]
    fn test_provider_config_defaults_alias() {
        let config: ProviderConfig =
            serde_json::from_value(json!({"type": "github", "config": {"token": "x"}})).unwrap();
        assert_eq!(config.alias, "default");
        assert_eq!(config.key(), "github:default");
    }

    #[test]
    fn test_missing_secrets() {
        let config: ProviderConfig = serde_json::from_value(json!({
            "type": "slack",
            "config": {"bot_token": "xoxb", "signing_secret": ""}
        }))
        .unwrap();
        let mut optional = SecretDefinition::new("team");
        optional.required = false;
        let defs = vec![
            SecretDefinition::new("bot_token"),
            SecretDefinition::new("signing_secret"),
            SecretDefinition::new("app_token"),
            optional,
        ];
        assert_eq!(
            config.missing_secrets(&defs),
            vec!["signing_secret", "app_token"]
        );
    }
}
