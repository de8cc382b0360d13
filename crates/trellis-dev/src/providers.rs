//! Provider configuration checks and interactive setup.

use console::{Term, style};
use serde_json::{Map, Value};
use trellis_types::{ProviderConfig, SecretDefinition, UsedProvider};

/// A used provider whose configuration is absent or incomplete.
#[derive(Debug, Clone, PartialEq)]
pub struct MissingProvider {
    pub provider: UsedProvider,
    /// Stored configuration, when one exists but lacks secrets.
    pub existing: Option<ProviderConfig>,
    pub missing_secrets: Vec<SecretDefinition>,
}

impl MissingProvider {
    pub fn key(&self) -> String {
        self.provider.key()
    }
}

/// Checks used providers against the fetched configurations.
pub struct ProviderValidator<'a> {
    configs: &'a [ProviderConfig],
}

impl<'a> ProviderValidator<'a> {
    pub fn new(configs: &'a [ProviderConfig]) -> Self {
        Self { configs }
    }

    /// Providers without a configuration, or with required secrets unset.
    /// Each `type:alias` is reported once.
    pub fn missing(&self, used: &[UsedProvider]) -> Vec<MissingProvider> {
        let mut out: Vec<MissingProvider> = Vec::new();
        for provider in used {
            let key = provider.key();
            if out.iter().any(|m| m.key() == key) {
                continue;
            }
            let existing = self.configs.iter().find(|c| c.key() == key);
            let missing_secrets: Vec<SecretDefinition> = match existing {
                Some(config) => {
                    let names = config.missing_secrets(&provider.secret_definitions);
                    provider
                        .secret_definitions
                        .iter()
                        .filter(|d| names.contains(&d.name.as_str()))
                        .cloned()
                        .collect()
                }
                None => provider
                    .secret_definitions
                    .iter()
                    .filter(|d| d.required)
                    .cloned()
                    .collect(),
            };
            if existing.is_none() || !missing_secrets.is_empty() {
                out.push(MissingProvider {
                    provider: provider.clone(),
                    existing: existing.cloned(),
                    missing_secrets,
                });
            }
        }
        out
    }
}

/// Asks the developer for provider configuration.
///
/// Called from a blocking thread.
pub trait Prompter: Send + Sync {
    /// Values for the missing secrets, or `None` to skip this provider.
    fn prompt(&self, missing: &MissingProvider) -> std::io::Result<Option<Map<String, Value>>>;
}

/// [`Prompter`] on the controlling terminal. Secret input is hidden.
pub struct TerminalPrompter {
    term: Term,
}

impl TerminalPrompter {
    pub fn new() -> Self {
        Self {
            term: Term::stderr(),
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.term.is_term()
    }
}

impl Default for TerminalPrompter {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompter for TerminalPrompter {
    fn prompt(&self, missing: &MissingProvider) -> std::io::Result<Option<Map<String, Value>>> {
        self.term.write_line(&format!(
            "{} Provider {} needs configuration",
            style("?").yellow().bold(),
            style(missing.key()).cyan()
        ))?;

        if missing.missing_secrets.is_empty() {
            self.term.write_str("  Create an empty configuration? [Y/n] ")?;
            let answer = self.term.read_line()?;
            return Ok(match answer.trim().to_lowercase().as_str() {
                "" | "y" | "yes" => Some(Map::new()),
                _ => None,
            });
        }

        let mut values = Map::new();
        for secret in &missing.missing_secrets {
            match &secret.description {
                Some(description) => self.term.write_str(&format!(
                    "  {} ({}): ",
                    style(&secret.name).bold(),
                    description
                ))?,
                None => self
                    .term
                    .write_str(&format!("  {}: ", style(&secret.name).bold()))?,
            }
            let value = self.term.read_secure_line()?;
            let value = value.trim();
            if value.is_empty() {
                self.term.write_line("  Skipped.")?;
                return Ok(None);
            }
            values.insert(secret.name.clone(), Value::String(value.to_string()));
        }
        Ok(Some(values))
    }
}
