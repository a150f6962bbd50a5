//! Daytime service: one timestamp line per connection, then close.

use chrono::Utc;
use chrono::format::{Item, StrftimeItems};
use svhost_protocol::{HostError, HostResult, ServiceConfig};
use svhost_server::{Service, ServiceHandle};
use svhost_transport::Connection;

pub const IMPLEMENTATION: &str = "daytime";

const DEFAULT_FORMAT: &str = "%A, %B %-d, %Y %H:%M:%S UTC";

pub struct DaytimeService {
    format: String,
}

impl DaytimeService {
    /// `format` is a strftime pattern, rejected up front if malformed.
    pub fn from_config(config: &ServiceConfig) -> HostResult<Self> {
        let format = config.attr_string_or("format", DEFAULT_FORMAT);
        if StrftimeItems::new(&format).any(|item| matches!(item, Item::Error)) {
            return Err(HostError::Config(format!(
                "service '{}': invalid time format '{format}'",
                config.name
            )));
        }
        Ok(Self { format })
    }
}

impl Service for DaytimeService {
    async fn serve(&self, svc: &ServiceHandle, mut conn: Connection) -> HostResult<()> {
        let now = Utc::now().format(&self.format).to_string();
        let written = conn.write_line(&now).await;
        conn.close().await;
        written?;
        svc.record_sent();
        Ok(())
    }
}
