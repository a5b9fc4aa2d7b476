//! The port registry (C2): hands out host ports from a fixed range,
//! deterministically and without recycling churn.

use crate::config::Config;
use crate::engine::ContainerEngine;
use crate::error::ControllerError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

struct State {
    /// app id -> port currently held by that app, whether the container is
    /// running or merely stopped-but-not-removed.
    assigned: HashMap<String, u16>,
}

/// Allocates and tracks host ports in `[base_port, max_port]`.
///
/// A port stays assigned to its app across stop/start cycles and is only
/// released on an explicit `remove`; this is what lets a reconnecting user
/// land back on the same preview URL.
pub struct PortRegistry {
    base_port: u16,
    max_port: u16,
    state: Mutex<State>,
}

impl PortRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            base_port: config.base_port,
            max_port: config.max_port,
            state: Mutex::new(State { assigned: HashMap::new() }),
        }
    }

    /// Rebuild assignment state from what the engine reports, used by the
    /// reconciler's bootstrap walk. Ports already tracked for `app_id` are
    /// left untouched.
    pub fn reserve(&self, app_id: &str, port: u16) {
        let mut state = self.state.lock();
        state.assigned.entry(app_id.to_string()).or_insert(port);
    }

    /// Port already assigned to `app_id`, if any.
    pub fn get(&self, app_id: &str) -> Option<u16> {
        self.state.lock().assigned.get(app_id).copied()
    }

    /// Assign a port to `app_id`, returning its existing one if it already
    /// has one. Scans the range lowest-first and skips ports already taken
    /// by this registry's own bookkeeping.
    pub fn allocate(&self, app_id: &str) -> Result<u16, ControllerError> {
        let mut state = self.state.lock();
        if let Some(port) = state.assigned.get(app_id) {
            return Ok(*port);
        }

        let taken: std::collections::HashSet<u16> = state.assigned.values().copied().collect();
        for port in self.base_port..=self.max_port {
            if !taken.contains(&port) {
                state.assigned.insert(app_id.to_string(), port);
                debug!(app_id, port, "allocated port");
                return Ok(port);
            }
        }

        Err(ControllerError::NoPortsAvailable)
    }

    /// Release the port held by `app_id`, making it available for reuse.
    pub fn release(&self, app_id: &str) {
        self.state.lock().assigned.remove(app_id);
    }

    /// Whether a host port is free according to the engine's own view of the
    /// world (not just this registry's bookkeeping) — used before binding a
    /// port the registry believes is free but another process may hold.
    pub async fn is_host_port_free(engine: &Arc<dyn ContainerEngine>, prefix: &str, port: u16) -> bool {
        match engine.list(prefix).await {
            Ok(containers) => !containers.iter().any(|c| c.host_port == Some(port)),
            Err(_) => true,
        }
    }

    /// `allocate`, host-checked: if `app_id` already holds an assignment and
    /// the port is still free on the host, reuse it; otherwise release the
    /// stale assignment (if any) and scan for the lowest port that is both
    /// unassigned in this registry's own bookkeeping *and* free according to
    /// the engine's own view — another process may have bound a port this
    /// registry had never handed out. Matches §4.2 exactly.
    pub async fn allocate_with_host_check(
        &self,
        app_id: &str,
        engine: &Arc<dyn ContainerEngine>,
        container_prefix: &str,
    ) -> Result<u16, ControllerError> {
        if let Some(existing) = self.get(app_id) {
            if Self::is_host_port_free(engine, container_prefix, existing).await {
                return Ok(existing);
            }
            debug!(app_id, port = existing, "previously assigned port is no longer free on the host, reallocating");
            self.release(app_id);
        }

        let occupied: std::collections::HashSet<u16> = match engine.list(container_prefix).await {
            Ok(containers) => containers.into_iter().filter_map(|c| c.host_port).collect(),
            Err(_) => std::collections::HashSet::new(),
        };

        let mut state = self.state.lock();
        let taken: std::collections::HashSet<u16> = state.assigned.values().copied().collect();
        for port in self.base_port..=self.max_port {
            if !taken.contains(&port) && !occupied.contains(&port) {
                state.assigned.insert(app_id.to_string(), port);
                debug!(app_id, port, "allocated port");
                return Ok(port);
            }
        }

        Err(ControllerError::NoPortsAvailable)
    }
}
