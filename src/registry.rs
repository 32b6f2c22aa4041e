use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "viewer-{}", self.0)
    }
}

/// Active viewer connections, keyed by source id.
///
/// A source id has an entry exactly while at least one viewer for it is
/// registered. Built once at startup and shared by every connection task.
#[derive(Default)]
pub struct ConnectionRegistry {
    viewers: RwLock<HashMap<String, HashSet<ConnectionId>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a viewer for `source`. The viewer stays registered until the
    /// returned guard is dropped.
    pub fn register(self: &Arc<Self>, source: &str) -> RegistryGuard {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut viewers = self.viewers.write().unwrap_or_else(|e| e.into_inner());
        viewers.entry(source.to_string()).or_default().insert(id);
        log::debug!(
            "registry: {} joined {} ({} viewers)",
            id,
            source,
            viewers[source].len()
        );

        RegistryGuard {
            registry: Arc::clone(self),
            source: source.to_string(),
            id,
        }
    }

    fn unregister(&self, source: &str, id: ConnectionId) {
        let mut viewers = self.viewers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(set) = viewers.get_mut(source) {
            set.remove(&id);
            if set.is_empty() {
                viewers.remove(source);
            }
        }
        log::debug!("registry: {} left {}", id, source);
    }

    /// Number of viewers currently watching `source`.
    pub fn viewers(&self, source: &str) -> usize {
        self.viewers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(source)
            .map_or(0, HashSet::len)
    }

    pub fn sources(&self) -> Vec<String> {
        self.viewers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn total_viewers(&self) -> usize {
        self.viewers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(HashSet::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.viewers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }

    /// Drop every entry. Used at shutdown once connections had their chance
    /// to leave on their own.
    pub fn clear(&self) {
        let mut viewers = self.viewers.write().unwrap_or_else(|e| e.into_inner());
        if !viewers.is_empty() {
            log::warn!("registry: dropping {} sources at shutdown", viewers.len());
        }
        viewers.clear();
    }
}

/// Keeps one viewer registered; unregisters on drop.
pub struct RegistryGuard {
    registry: Arc<ConnectionRegistry>,
    source: String,
    id: ConnectionId,
}

impl RegistryGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for RegistryGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.source, self.id);
    }
}
