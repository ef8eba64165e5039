//! Process-wide list of open vaults

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Open vaults by instance id. Cheap to clone; clones share the list.
#[derive(Debug, Clone, Default)]
pub struct VaultRegistry {
    open: Arc<Mutex<BTreeMap<String, String>>>,
}

impl VaultRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, instance_id: &str, vault_id: &str) {
        self.open
            .lock()
            .insert(instance_id.to_string(), vault_id.to_string());
        tracing::debug!(instance = instance_id, vault = vault_id, "registered vault");
    }

    pub(crate) fn deregister(&self, instance_id: &str) {
        if let Some(vault_id) = self.open.lock().remove(instance_id) {
            tracing::debug!(instance = instance_id, vault = %vault_id, "deregistered vault");
        }
    }

    /// `(instance id, vault id)` of every open vault.
    pub fn list(&self) -> Vec<(String, String)> {
        self.open
            .lock()
            .iter()
            .map(|(instance, vault)| (instance.clone(), vault.clone()))
            .collect()
    }

    pub fn is_open(&self, vault_id: &str) -> bool {
        self.open.lock().values().any(|v| v == vault_id)
    }

    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_deregister() {
        let registry = VaultRegistry::new();
        let shared = registry.clone();
        registry.register("a", "users@mem");
        registry.register("b", "users@mem");
        assert_eq!(shared.len(), 2);
        assert!(shared.is_open("users@mem"));

        registry.deregister("a");
        registry.deregister("missing");
        assert_eq!(shared.list(), vec![("b".to_string(), "users@mem".to_string())]);

        registry.deregister("b");
        assert!(shared.is_empty());
        assert!(!shared.is_open("users@mem"));
    }
}
