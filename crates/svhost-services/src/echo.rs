//! Line echo service.

use svhost_protocol::{HostResult, ServiceConfig};
use svhost_server::{Service, ServiceHandle};
use svhost_transport::Connection;

pub const IMPLEMENTATION: &str = "echo";

/// Writes every received line back, optionally prefixed (`prefix` attribute).
pub struct EchoService {
    prefix: String,
}

impl EchoService {
    pub fn from_config(config: &ServiceConfig) -> HostResult<Self> {
        Ok(Self {
            prefix: config.attr_string_or("prefix", ""),
        })
    }
}

impl Service for EchoService {
    async fn serve(&self, svc: &ServiceHandle, mut conn: Connection) -> HostResult<()> {
        loop {
            let line = tokio::select! {
                _ = svc.stopped() => break,
                line = conn.read_line() => line?,
            };
            let Some(line) = line else { break };
            svc.record_received();
            conn.write_line(&format!("{}{line}", self.prefix)).await?;
            svc.record_sent();
        }
        conn.close().await;
        Ok(())
    }
}
