//! Ownership of the current bridge per session
//!
//! A reconnect that builds a fresh [`Bridge`] installs it over the old one.
//! Late disconnect reports from the superseded bridge are ignored by
//! identity, so they cannot tear down the replacement.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::bridge::Bridge;

/// Session id -> current bridge
#[derive(Debug, Default)]
pub struct BridgeRegistry {
    bridges: RwLock<HashMap<String, Bridge>>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `bridge` current for its session, returning the one it replaces
    pub fn install(&self, bridge: Bridge) -> Option<Bridge> {
        let session_id = bridge.session_id().to_string();
        let previous = self.bridges.write().insert(session_id.clone(), bridge);
        if previous.is_some() {
            debug!("Replaced bridge for session {}", session_id);
        }
        previous
    }

    pub fn get(&self, session_id: &str) -> Option<Bridge> {
        self.bridges.read().get(session_id).cloned()
    }

    pub fn is_current(&self, bridge: &Bridge) -> bool {
        self.bridges
            .read()
            .get(bridge.session_id())
            .is_some_and(|current| Bridge::ptr_eq(current, bridge))
    }

    /// Handle a disconnect reported by `bridge`.
    ///
    /// Removes the session only if `bridge` is still its current bridge.
    /// Returns false for a superseded bridge.
    pub fn on_disconnected(&self, bridge: &Bridge) -> bool {
        let mut bridges = self.bridges.write();
        match bridges.get(bridge.session_id()) {
            Some(current) if Bridge::ptr_eq(current, bridge) => {
                bridges.remove(bridge.session_id());
                true
            }
            _ => {
                debug!(
                    "Ignoring disconnect from superseded bridge for session {}",
                    bridge.session_id()
                );
                false
            }
        }
    }

    pub fn len(&self) -> usize {
        self.bridges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.read().is_empty()
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.bridges.read().keys().cloned().collect()
    }
}
