//! Endpoint registry: endpoint id to display name, shared by every per-endpoint state machine.
//!
//! Discoverers learn a peer's name when the endpoint is found; advertisers only learn it when the
//! peer initiates a connection. Both feed the same registry.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::identity::EndpointId;

/// Name returned for an endpoint the registry knows nothing about.
pub const UNKNOWN_DEVICE: &str = "Unknown Device";

/// A known peer and the name it announced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub id: EndpointId,
    pub display_name: String,
}

struct Entry {
    display_name: String,
    /// Epoch in which the name was recorded.
    epoch: u64,
}

struct Inner {
    entries: HashMap<EndpointId, Entry>,
    epoch: u64,
}

/// Thread-safe name registry. First writer wins per epoch; the epoch advances on stop-all.
pub struct EndpointRegistry {
    inner: RwLock<Inner>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: HashMap::new(),
                epoch: 0,
            }),
        }
    }

    /// Record a name for `id`. Keeps an existing name recorded in the current epoch.
    /// Returns true if the name was stored.
    pub fn record_name(&self, id: &EndpointId, name: &str) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let epoch = inner.epoch;
        match inner.entries.get_mut(id) {
            Some(entry) if entry.epoch == epoch => false,
            Some(entry) => {
                entry.display_name = name.to_owned();
                entry.epoch = epoch;
                true
            }
            None => {
                inner.entries.insert(
                    id.clone(),
                    Entry {
                        display_name: name.to_owned(),
                        epoch,
                    },
                );
                true
            }
        }
    }

    /// Name for `id`, or [`UNKNOWN_DEVICE`]. Never fails.
    pub fn lookup_name(&self, id: &EndpointId) -> String {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .entries
            .get(id)
            .map(|e| e.display_name.clone())
            .unwrap_or_else(|| UNKNOWN_DEVICE.to_owned())
    }

    pub fn contains(&self, id: &EndpointId) -> bool {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.entries.contains_key(id)
    }

    /// Drop the name for `id`. Only for discovery-lost; a connected peer keeps its name.
    pub fn forget(&self, id: &EndpointId) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.entries.remove(id);
    }

    /// Start a new epoch, keeping only entries for which `keep` returns true.
    /// Kept entries may be overwritten once in the new epoch.
    pub fn advance_epoch<F>(&self, keep: F)
    where
        F: Fn(&EndpointId) -> bool,
    {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.entries.retain(|id, _| keep(id));
        inner.epoch = inner.epoch.saturating_add(1);
    }

    pub fn epoch(&self) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .epoch
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All records, sorted by id.
    pub fn snapshot(&self) -> Vec<EndpointRecord> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut out: Vec<EndpointRecord> = inner
            .entries
            .iter()
            .map(|(id, e)| EndpointRecord {
                id: id.clone(),
                display_name: e.display_name.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}
