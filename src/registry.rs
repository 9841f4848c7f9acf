use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_postgres::Transaction;

use crate::error::Error;

/// The signature a plugin entry must implement: run host-language logic
/// against the in-flight migration transaction for one direction.
pub type PluginFn = Arc<
    dyn for<'a> Fn(
            &'a Transaction<'a>,
        ) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>>
        + Send
        + Sync,
>;

/// A process-wide `version -> closure` table standing in for dynamic code
/// loading. Migrations whose artifacts are not `.sql` resolve their up/down
/// logic here instead of being read and executed as a statement batch, since
/// this crate has no way to load arbitrary code by path.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    up: HashMap<i64, PluginFn>,
    down: HashMap<i64, PluginFn>,
}

impl PluginRegistry {
    pub fn new() -> PluginRegistry {
        PluginRegistry::default()
    }

    /// Register the up and down logic for a plugin-kind migration version.
    pub fn register(&mut self, version: i64, up: PluginFn, down: PluginFn) {
        self.up.insert(version, up);
        self.down.insert(version, down);
    }

    pub(crate) fn up_for(&self, version: i64) -> Option<&PluginFn> {
        self.up.get(&version)
    }

    pub(crate) fn down_for(&self, version: i64) -> Option<&PluginFn> {
        self.down.get(&version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_empty() {
        let registry = PluginRegistry::new();
        assert!(registry.up_for(1).is_none());
        assert!(registry.down_for(1).is_none());
    }

    #[test]
    fn register_makes_entries_retrievable() {
        let mut registry = PluginRegistry::new();
        let up: PluginFn = Arc::new(|_tx| Box::pin(async { Ok(()) }));
        let down: PluginFn = Arc::new(|_tx| Box::pin(async { Ok(()) }));
        registry.register(42, up, down);
        assert!(registry.up_for(42).is_some());
        assert!(registry.down_for(42).is_some());
        assert!(registry.up_for(7).is_none());
    }
}
