//! Watchdog: a CLIENT-type service that keeps other services alive.
//!
//! On start it spawns one internal connection which, every `interval_ms`,
//! validates each target (restarting stopped ones) and logs lifecycle events
//! for the targets as they arrive.

use std::time::Duration;

use svhost_protocol::{HostError, HostResult, ServiceConfig};
use svhost_server::{Service, ServiceHandle, ServiceManager};
use svhost_transport::Connection;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const IMPLEMENTATION: &str = "watchdog";

const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

pub struct WatchdogService {
    interval: Duration,
    /// Service names to watch; empty means every other top-level service.
    targets: Vec<String>,
}

impl WatchdogService {
    pub fn from_config(config: &ServiceConfig) -> HostResult<Self> {
        let interval = config.attr_millis_or("interval_ms", DEFAULT_INTERVAL);
        if interval.is_zero() {
            return Err(HostError::Config(format!(
                "service '{}': interval_ms must be positive",
                config.name
            )));
        }
        Ok(Self {
            interval,
            targets: config.attr_list("targets"),
        })
    }

    fn targets(&self, svc: &ServiceHandle, manager: &ServiceManager) -> Vec<String> {
        if !self.targets.is_empty() {
            return self.targets.clone();
        }
        let own = svc.name();
        manager
            .services()
            .into_iter()
            .map(|s| s.name())
            .filter(|name| *name != own)
            .collect()
    }

    async fn sweep(&self, svc: &ServiceHandle, manager: &ServiceManager) {
        for target in self.targets(svc, manager) {
            match manager.validate_name(&target).await {
                Ok(()) => debug!("Watchdog '{}': '{target}' ok", svc.name()),
                Err(e) => {
                    svc.record_error();
                    warn!("Watchdog '{}': '{target}' failed validation: {e}", svc.name());
                }
            }
        }
        svc.touch();
    }
}

impl Service for WatchdogService {
    fn accepts_sockets(&self) -> bool {
        false
    }

    async fn start(&self, svc: &ServiceHandle) -> HostResult<()> {
        let monitor = Connection::internal().with_property("role", "monitor");
        svc.spawn_internal(monitor)?;
        Ok(())
    }

    async fn serve(&self, svc: &ServiceHandle, _conn: Connection) -> HostResult<()> {
        let manager = svc
            .manager()
            .ok_or_else(|| HostError::Config("service host has shut down".into()))?;
        let mut events = manager.subscribe();
        let first = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(first, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = svc.stopped() => break,
                _ = ticker.tick() => self.sweep(svc, &manager).await,
                event = events.recv() => match event {
                    Ok(event) => {
                        if event.service != svc.id() && self.targets(svc, &manager).contains(&event.name) {
                            svc.record_received();
                            info!("Watchdog '{}': '{}' {:?}", svc.name(), event.name, event.kind);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!("Watchdog '{}' missed {skipped} event(s)", svc.name());
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }
}
