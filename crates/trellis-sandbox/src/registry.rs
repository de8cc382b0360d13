//! Registration registry: the capture buffer between user code and the host.
//!
//! A [`Registry`] is created by the caller and handed to
//! [`SandboxEngine::execute`](crate::SandboxEngine::execute). The entry
//! wrapper clears it and injects provider configs before user code runs;
//! module evaluation populates it; the engine reads it once evaluation
//! completes. Nothing else crosses the sandbox boundary.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use trellis_types::{ProviderConfig, Trigger, UsedProvider, provider_key};

#[derive(Default)]
struct RegistryState {
    triggers: Vec<Arc<Trigger>>,
    /// Insertion-ordered; keys are unique `type:alias` pairs.
    used_providers: Vec<UsedProvider>,
    provider_configs: HashMap<String, ProviderConfig>,
}

/// Cloneable handle onto one execution cycle's registrations.
#[derive(Clone, Default)]
pub struct Registry {
    state: Arc<Mutex<RegistryState>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop triggers, used providers and injected configs.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.triggers.clear();
        state.used_providers.clear();
        state.provider_configs.clear();
    }

    /// Replace the provider configuration map.
    pub fn inject_provider_configs(&self, configs: impl IntoIterator<Item = ProviderConfig>) {
        let mut state = self.state.lock();
        state.provider_configs = configs.into_iter().map(|c| (c.key(), c)).collect();
    }

    pub fn provider_config(&self, provider_type: &str, alias: &str) -> Option<ProviderConfig> {
        self.state
            .lock()
            .provider_configs
            .get(&provider_key(provider_type, alias))
            .cloned()
    }

    pub fn register_trigger(&self, trigger: Trigger) -> Arc<Trigger> {
        let trigger = Arc::new(trigger);
        self.state.lock().triggers.push(trigger.clone());
        trigger
    }

    pub fn triggers(&self) -> Vec<Arc<Trigger>> {
        self.state.lock().triggers.clone()
    }

    /// Record a provider instance without secret definitions.
    pub fn track_provider_usage(&self, provider_type: &str, alias: &str) {
        self.track_provider(UsedProvider::new(provider_type, alias));
    }

    /// Record a provider instance. Repeated declarations merge their secret definitions.
    pub fn track_provider(&self, provider: UsedProvider) {
        let mut state = self.state.lock();
        let key = provider.key();
        match state.used_providers.iter_mut().find(|p| p.key() == key) {
            Some(existing) => {
                for def in provider.secret_definitions {
                    if !existing
                        .secret_definitions
                        .iter()
                        .any(|d| d.name == def.name)
                    {
                        existing.secret_definitions.push(def);
                    }
                }
            }
            None => state.used_providers.push(provider),
        }
    }

    pub fn clear_used_providers(&self) {
        self.state.lock().used_providers.clear();
    }

    pub fn used_providers(&self) -> Vec<UsedProvider> {
        self.state.lock().used_providers.clone()
    }

    /// Non-owning handle, held by host functions living inside the VM.
    pub fn downgrade(&self) -> WeakRegistry {
        WeakRegistry {
            state: Arc::downgrade(&self.state),
        }
    }
}

/// Weak counterpart of [`Registry`].
#[derive(Clone)]
pub struct WeakRegistry {
    state: Weak<Mutex<RegistryState>>,
}

impl WeakRegistry {
    pub fn upgrade(&self) -> Option<Registry> {
        self.state.upgrade().map(|state| Registry { state })
    }
}
