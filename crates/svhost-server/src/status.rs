//! Point-in-time service snapshots for reporting.

use std::fmt;

use chrono::{DateTime, Utc};
use svhost_protocol::{ServiceType, StartupPolicy};

use crate::unit::ServiceId;

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub id: ServiceId,
    pub name: String,
    pub port: u16,
    pub implementation: String,
    pub service_type: ServiceType,
    pub startup: StartupPolicy,
    pub state: ServiceState,
    pub listening: bool,
    pub active_connections: usize,
    pub total_connections: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub errors: u64,
    pub last_action: DateTime<Utc>,
    pub children: Vec<ServiceStatus>,
}

impl ServiceStatus {
    /// One-line rendering used by the control `status` command.
    pub fn summary(&self) -> String {
        format!(
            "{} {} {} {} {} {}{} active={} total={} received={} sent={} errors={} last={}",
            self.port,
            self.name,
            self.implementation,
            self.service_type,
            self.startup,
            self.state,
            if self.listening { " listening" } else { "" },
            self.active_connections,
            self.total_connections,
            self.messages_received,
            self.messages_sent,
            self.errors,
            self.last_action.format("%Y-%m-%d %H:%M:%S"),
        )
    }

    /// Summary lines for this service and, indented, its children.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = vec![self.summary()];
        for child in &self.children {
            lines.extend(child.lines().into_iter().map(|l| format!("  {l}")));
        }
        lines
    }
}
