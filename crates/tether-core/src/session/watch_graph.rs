//! Parent/watcher relationships between sessions
//!
//! Relationships are stored as session ids in both directions. Neither side
//! holds the other's `Arc`, so destroying either session never leaks the other.

use std::collections::HashMap;

use super::types::SessionId;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
pub struct WatchGraph {
    /// parent -> watchers, in registration order
    watchers: HashMap<SessionId, Vec<SessionId>>,
    /// watcher -> parent
    parents: HashMap<SessionId, SessionId>,
}

impl WatchGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `watcher` as observing `parent`
    pub fn add_watcher(&mut self, parent: SessionId, watcher: SessionId) -> Result<()> {
        if parent == watcher {
            return Err(Error::Watch(format!("session {} cannot watch itself", parent)));
        }
        if let Some(existing) = self.parents.get(&watcher) {
            return Err(Error::Watch(format!(
                "session {} already watches {}",
                watcher, existing
            )));
        }
        // Walk up from the parent; reaching the watcher would close a cycle
        let mut cursor = Some(parent);
        while let Some(id) = cursor {
            if id == watcher {
                return Err(Error::Watch(format!(
                    "watching {} from {} would create a cycle",
                    parent, watcher
                )));
            }
            cursor = self.parents.get(&id).copied();
        }

        self.watchers.entry(parent).or_default().push(watcher);
        self.parents.insert(watcher, parent);
        Ok(())
    }

    /// Remove one watcher; returns false if it was not registered
    pub fn remove_watcher(&mut self, watcher: SessionId) -> bool {
        let Some(parent) = self.parents.remove(&watcher) else {
            return false;
        };
        if let Some(list) = self.watchers.get_mut(&parent) {
            list.retain(|id| *id != watcher);
            if list.is_empty() {
                self.watchers.remove(&parent);
            }
        }
        true
    }

    pub fn get_parent(&self, watcher: SessionId) -> Option<SessionId> {
        self.parents.get(&watcher).copied()
    }

    pub fn get_watchers(&self, parent: SessionId) -> Vec<SessionId> {
        self.watchers.get(&parent).cloned().unwrap_or_default()
    }

    pub fn is_watcher(&self, id: SessionId) -> bool {
        self.parents.contains_key(&id)
    }

    /// Drop every edge touching `id`. Returns the watchers that lost their parent.
    pub fn remove_session(&mut self, id: SessionId) -> Vec<SessionId> {
        self.remove_watcher(id);
        let orphans = self.watchers.remove(&id).unwrap_or_default();
        for watcher in &orphans {
            self.parents.remove(watcher);
        }
        orphans
    }
}
