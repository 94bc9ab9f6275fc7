//! Named adapter lookup with an explicit default.
//!
//! No process-wide registration: the host constructs a registry and hands it
//! to the router. Registration is only observable through the instance it
//! happened on.

use crate::adapters::{AdapterInfo, Capability, DispatchAdapter, capability_strings};
use crate::core::error::{ErrorCode, PortunusError};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct AdapterRegistry {
    adapters: BTreeMap<String, Arc<dyn DispatchAdapter>>,
    default_adapter_id: String,
}

impl AdapterRegistry {
    pub fn new(default_adapter_id: impl Into<String>) -> Self {
        AdapterRegistry {
            adapters: BTreeMap::new(),
            default_adapter_id: default_adapter_id.into(),
        }
    }

    /// Wrap one adapter into a registry with that adapter as the default.
    /// This is the legacy single-adapter construction path.
    pub fn single(adapter: Arc<dyn DispatchAdapter>) -> Result<Self, PortunusError> {
        let mut registry = AdapterRegistry::new(adapter.adapter_id().to_string());
        registry.register(adapter)?;
        Ok(registry)
    }

    pub fn default_adapter_id(&self) -> &str {
        &self.default_adapter_id
    }

    pub fn register(&mut self, adapter: Arc<dyn DispatchAdapter>) -> Result<(), PortunusError> {
        let id = adapter.adapter_id().to_string();
        if id.is_empty() {
            return Err(PortunusError::Config(
                "Adapter id must be non-empty".to_string(),
            ));
        }
        if adapter.adapter_kind().is_empty() {
            return Err(PortunusError::Config(format!(
                "Adapter '{id}' has an empty kind"
            )));
        }
        if self.adapters.contains_key(&id) {
            return Err(PortunusError::Config(format!(
                "Adapter '{id}' is already registered"
            )));
        }
        self.adapters.insert(id, adapter);
        Ok(())
    }

    pub fn get(&self, adapter_id: &str) -> Result<Arc<dyn DispatchAdapter>, PortunusError> {
        self.adapters.get(adapter_id).cloned().ok_or_else(|| {
            PortunusError::operational_with(
                ErrorCode::UnknownAdapter,
                format!("Adapter '{adapter_id}' is not registered"),
                serde_json::json!({
                    "adapter_id": adapter_id,
                    "available_adapters": self.list_ids(),
                }),
            )
        })
    }

    /// The default adapter. Fails unless the default id is registered.
    pub fn get_default(&self) -> Result<Arc<dyn DispatchAdapter>, PortunusError> {
        self.get(&self.default_adapter_id)
    }

    pub fn list_ids(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }

    pub fn list_adapters(&self) -> Vec<AdapterInfo> {
        self.adapters
            .values()
            .map(|a| AdapterInfo::of(a.as_ref()))
            .collect()
    }

    pub fn find_by_capability(&self, capability: Capability) -> Vec<String> {
        self.adapters
            .iter()
            .filter(|(_, a)| a.capabilities().contains(&capability))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn has_capability(&self, adapter_id: &str, capability: Capability) -> bool {
        self.adapters
            .get(adapter_id)
            .is_some_and(|a| a.capabilities().contains(&capability))
    }

    pub fn require_capability(
        &self,
        adapter_id: &str,
        capability: Capability,
    ) -> Result<(), PortunusError> {
        let adapter = self.get(adapter_id)?;
        if adapter.capabilities().contains(&capability) {
            return Ok(());
        }
        Err(PortunusError::operational_with(
            ErrorCode::CapabilityMissing,
            format!(
                "Adapter '{}' lacks required capability '{}'",
                adapter_id, capability
            ),
            serde_json::json!({
                "adapter_id": adapter_id,
                "required_capability": capability.as_str(),
                "adapter_capabilities": capability_strings(adapter.capabilities()),
            }),
        ))
    }
}
