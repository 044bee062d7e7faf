//! Path → host lookup.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::errors::{Result, ServerError};
use crate::host::ServiceHost;

/// Hosts keyed by normalized path.
///
/// Guarded by its own lock so lookups during handshakes never wait on a
/// registry.
#[derive(Default)]
pub(crate) struct ServiceTable {
    hosts: RwLock<HashMap<String, Arc<dyn ServiceHost>>>,
}

impl ServiceTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `host` under its own path.
    pub(crate) fn add(&self, host: Arc<dyn ServiceHost>) -> Result<()> {
        match self.hosts.write().entry(host.path().to_string()) {
            Entry::Occupied(entry) => Err(ServerError::DuplicatePath(entry.key().clone())),
            Entry::Vacant(entry) => {
                let _ = entry.insert(host);
                Ok(())
            }
        }
    }

    pub(crate) fn remove(&self, path: &str) -> Option<Arc<dyn ServiceHost>> {
        self.hosts.write().remove(path)
    }

    pub(crate) fn get(&self, path: &str) -> Option<Arc<dyn ServiceHost>> {
        self.hosts.read().get(path).cloned()
    }

    pub(crate) fn hosts(&self) -> Vec<Arc<dyn ServiceHost>> {
        self.hosts.read().values().cloned().collect()
    }

    /// Sorted for stable output.
    pub(crate) fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.hosts.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub(crate) fn len(&self) -> usize {
        self.hosts.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::Behavior;
    use crate::host::WebSocketServiceHost;
    use crate::session::Session;
    use crate::transport::IncomingMessage;
    use assert_matches::assert_matches;
    use async_trait::async_trait;

    struct Quiet;

    #[async_trait]
    impl Behavior for Quiet {
        async fn on_message(&mut self, _session: &Arc<Session>, _message: IncomingMessage) {}
    }

    fn host(path: &str) -> Arc<dyn ServiceHost> {
        Arc::new(WebSocketServiceHost::new(path, || Quiet).unwrap())
    }

    #[test]
    fn add_get_remove() {
        let table = ServiceTable::new();
        table.add(host("/b")).unwrap();
        table.add(host("/a")).unwrap();

        assert_eq!(table.paths(), vec!["/a", "/b"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("/a").unwrap().path(), "/a");
        assert!(table.get("/c").is_none());

        assert!(table.remove("/a").is_some());
        assert!(table.remove("/a").is_none());
        assert_eq!(table.hosts().len(), 1);
    }

    #[test]
    fn duplicate_path_is_rejected() {
        let table = ServiceTable::new();
        table.add(host("/chat")).unwrap();
        assert_matches!(
            table.add(host("/chat/")),
            Err(ServerError::DuplicatePath(path)) if path == "/chat"
        );
    }
}
