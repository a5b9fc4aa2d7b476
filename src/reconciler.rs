//! The reconciler (C5): rebuilds C2/C3 state from the engine on bootstrap,
//! then ticks on a fixed, non-reentrant schedule triggering idle reaps.

use crate::controller::ContainerLifecycleController;
use crate::engine::ContainerEngine;
use crate::ports::PortRegistry;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const APP_PREFIX: &str = "dyad-app-";

pub struct Reconciler {
    engine: Arc<dyn ContainerEngine>,
    ports: Arc<PortRegistry>,
    controller: Arc<ContainerLifecycleController>,
    interval: Duration,
    idle_timeout: Duration,
    /// Guards against a slow tick overlapping the next scheduled one.
    ticking: AtomicBool,
}

impl Reconciler {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        ports: Arc<PortRegistry>,
        controller: Arc<ContainerLifecycleController>,
        interval: Duration,
        idle_timeout: Duration,
    ) -> Self {
        Self { engine, ports, controller, interval, idle_timeout, ticking: AtomicBool::new(false) }
    }

    /// Walk the engine once, adopting every `dyad-app-*` container into C2/C3.
    /// Running containers get `now` as their last-activity baseline; stopped
    /// ones get `now - T_idle - slack` so they are reap-eligible but not
    /// force-reaped the instant the reconciler starts.
    pub async fn bootstrap(&self) {
        info!("reconciler bootstrap: listing tracked containers");
        let containers = match self.engine.list(APP_PREFIX).await {
            Ok(containers) => containers,
            Err(e) => {
                error!(error = %e, "bootstrap failed to list containers from engine");
                return;
            }
        };

        let backdate_by = self.idle_timeout + Duration::from_secs(60);
        for container in containers {
            let Some(app_id) = container.name.strip_prefix(APP_PREFIX) else { continue };
            let Some(port) = container.host_port else {
                warn!(app_id, "adopted container has no published port, skipping");
                continue;
            };

            self.ports.reserve(app_id, port);

            let running = !container.status_text.to_lowercase().contains("exited");
            if running {
                self.controller.adopt(app_id, "ready", Some(Utc::now()));
            } else {
                self.controller.adopt(app_id, "stopped", None);
                let backdated = Utc::now() - chrono::Duration::from_std(backdate_by).unwrap_or(chrono::Duration::zero());
                self.controller.activity().set_last_activity(app_id, backdated);
            }

            debug!(app_id, port, running, "adopted container at bootstrap");
        }
    }

    /// Run `bootstrap` once, then tick forever on `interval`.
    pub async fn run(self: Arc<Self>) {
        self.bootstrap().await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.clone().tick().await;
        }
    }

    async fn tick(self: Arc<Self>) {
        if self.ticking.swap(true, Ordering::SeqCst) {
            warn!("reconciler tick skipped: previous tick still running");
            return;
        }

        let app_ids = self.controller.tracked_app_ids();
        for app_id in app_ids {
            match self.controller.reap_if_idle(&app_id).await {
                Ok(true) => info!(app_id, "reconciler reaped idle container"),
                Ok(false) => {}
                Err(e) => error!(app_id, error = %e, "reconciler failed to reap container, will retry next tick"),
            }
        }

        self.ticking.store(false, Ordering::SeqCst);
    }
}
