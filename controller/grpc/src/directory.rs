use std::collections::BTreeMap;
use std::sync::Arc;

/// Exporter labels under this prefix express router affinity; the
/// remainder of the key is matched against the router entry's labels.
pub const AFFINITY_PREFIX: &str = "router.patchbay.dev/";

/// The entry every dial falls back to when no affinity matches.
const DEFAULT_ROUTER: &str = "default";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouterEntry {
    pub name: String,
    /// `host:port` reachable by both clients and exporters; also the
    /// audience stream tokens are pinned to.
    pub endpoint: String,
    pub labels: BTreeMap<String, String>,
}

/// The read-only mapping of reachable routers, loaded from configuration.
/// Both sides of a dial are handed the same entry so that they converge on
/// one router instance.
#[derive(Clone, Debug, Default)]
pub struct Directory {
    entries: Arc<[RouterEntry]>,
}

impl Directory {
    pub fn new(entries: Vec<RouterEntry>) -> Self {
        Self {
            entries: entries.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Picks the router for an exporter: the first entry whose labels cover
    /// the exporter's router-affinity labels, otherwise the default entry.
    pub fn select(&self, exporter_labels: &BTreeMap<String, String>) -> Option<&RouterEntry> {
        let affinity = exporter_labels
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(AFFINITY_PREFIX).map(|k| (k, v)))
            .collect::<Vec<_>>();

        if !affinity.is_empty() {
            if let Some(entry) = self.entries.iter().find(|e| {
                affinity
                    .iter()
                    .all(|(k, v)| e.labels.get(*k).map(String::as_str) == Some(v.as_str()))
            }) {
                return Some(entry);
            }
        }
        self.entries.iter().find(|e| e.name == DEFAULT_ROUTER)
    }
}
