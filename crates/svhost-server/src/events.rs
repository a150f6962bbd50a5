//! Typed lifecycle events.
//!
//! The manager and the service runtime publish every lifecycle transition on
//! a broadcast channel. Supervisors such as the watchdog subscribe with
//! [`ServiceManager::subscribe`](crate::ServiceManager::subscribe).

use chrono::{DateTime, Utc};

use crate::unit::ServiceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Registered with the manager.
    Initialize,
    /// Start requested by the manager.
    Start,
    /// Shutdown requested by the manager.
    Shutdown,
    /// Transitioned to running.
    Started,
    /// Start hook failed; the service was shut back down.
    StartFailed,
    /// Transitioned to stopped.
    Stopped,
    /// Permanently deleted from the registry.
    Removed,
}

#[derive(Debug, Clone)]
pub struct ServiceEvent {
    pub service: ServiceId,
    pub name: String,
    pub port: u16,
    pub kind: LifecycleEvent,
    pub at: DateTime<Utc>,
}

impl ServiceEvent {
    pub fn new(service: ServiceId, name: impl Into<String>, port: u16, kind: LifecycleEvent) -> Self {
        Self {
            service,
            name: name.into(),
            port,
            kind,
            at: Utc::now(),
        }
    }
}
