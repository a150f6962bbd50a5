//! Control-protocol service.
//!
//! A password-gated, line-oriented session for managing the host at runtime.
//! Each command answers with zero or more response lines followed by one
//! status line. Only one session may be open at a time.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use svhost_protocol::{
    AddRequest, Command, CommandName, HostConfig, HostError, HostResult, ServiceConfig,
    StartupPolicy, StatusCode, StatusCodes,
};
use svhost_transport::Connection;
use tracing::{debug, info, warn};

use crate::manager::ServiceManager;
use crate::service::Service;
use crate::unit::ServiceHandle;

/// Implementation identifier the control service registers under.
pub const IMPLEMENTATION: &str = "control";

const DIGEST_PREFIX: &str = "sha256:";

pub struct ControlService {
    /// Hex SHA-256 of the configured password.
    digest: SecretString,
    codes: StatusCodes,
    session_timeout: Option<Duration>,
    session_open: AtomicBool,
}

impl ControlService {
    /// Build from the service's attributes. `password` is required and is
    /// either plain text or `sha256:<hex digest>`.
    pub fn from_config(config: &ServiceConfig) -> HostResult<Self> {
        let password = config.attribute("password")?;
        let digest = match password.strip_prefix(DIGEST_PREFIX) {
            Some(encoded) => {
                let bytes = hex::decode(encoded.trim()).map_err(|e| {
                    HostError::Config(format!("service '{}': bad password digest: {e}", config.name))
                })?;
                if bytes.len() != 32 {
                    return Err(HostError::Config(format!(
                        "service '{}': password digest must be 32 bytes",
                        config.name
                    )));
                }
                hex::encode(bytes)
            }
            None => hex::encode(Sha256::digest(password.as_bytes())),
        };

        let timeout = config.attr_millis_or("session_timeout_ms", Duration::ZERO);
        Ok(Self {
            digest: SecretString::from(digest),
            codes: StatusCodes::from_attributes(&config.attributes),
            session_timeout: (!timeout.is_zero()).then_some(timeout),
            session_open: AtomicBool::new(false),
        })
    }

    fn check_password(&self, candidate: &str) -> bool {
        let candidate = hex::encode(Sha256::digest(candidate.as_bytes()));
        constant_time_eq(candidate.as_bytes(), self.digest.expose_secret().as_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Clears the singleton flag when a session ends.
struct SessionSlot<'a>(&'a AtomicBool);

impl Drop for SessionSlot<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Service for ControlService {
    async fn serve(&self, svc: &ServiceHandle, mut conn: Connection) -> HostResult<()> {
        if self.session_open.swap(true, Ordering::AcqRel) {
            warn!("Control service '{}' refused a second session from {:?}", svc.name(), conn.peer());
            let _ = conn.write_line("only one control connection allowed").await;
            conn.close().await;
            return Ok(());
        }
        let _slot = SessionSlot(&self.session_open);

        let manager = svc
            .manager()
            .ok_or_else(|| HostError::Config("service host has shut down".into()))?;
        info!("Control session opened from {:?}", conn.peer());

        let mut session = Session {
            control: self,
            svc,
            manager,
            conn,
            authorized: false,
        };
        let result = session.run().await;
        session.conn.close().await;
        info!("Control session closed");
        result.map_err(HostError::from)
    }
}

#[derive(PartialEq, Eq)]
enum Flow {
    Continue,
    Quit,
}

struct Session<'a> {
    control: &'a ControlService,
    svc: &'a ServiceHandle,
    manager: ServiceManager,
    conn: Connection,
    authorized: bool,
}

impl Session<'_> {
    async fn run(&mut self) -> io::Result<()> {
        let svc = self.svc;
        loop {
            let line = tokio::select! {
                _ = svc.stopped() => break,
                read = self.next_line() => read?,
            };
            let Some(line) = line else { break };
            svc.record_received();
            if line.trim().is_empty() {
                continue;
            }
            if self.dispatch(&line).await? == Flow::Quit {
                break;
            }
        }
        Ok(())
    }

    /// `Ok(None)` at end of stream or when the session timed out.
    async fn next_line(&mut self) -> io::Result<Option<String>> {
        let Some(limit) = self.control.session_timeout else {
            return self.conn.read_line().await;
        };
        match tokio::time::timeout(limit, self.conn.read_line()).await {
            Ok(read) => read,
            Err(_) => {
                debug!("Control session idle for {limit:?}, closing");
                self.reply(Vec::new(), StatusCode::RequestTimeout).await?;
                Ok(None)
            }
        }
    }

    async fn dispatch(&mut self, line: &str) -> io::Result<Flow> {
        let (name, rest) = match Command::split(line) {
            Ok(parts) => parts,
            Err(e) => {
                self.reply(vec![e.to_string()], StatusCode::InvalidContent).await?;
                return Ok(Flow::Continue);
            }
        };
        if name.requires_auth() && !self.authorized {
            self.reply(vec!["password required".into()], StatusCode::Unauthorized)
                .await?;
            return Ok(Flow::Continue);
        }
        let command = match Command::from_parts(name, rest) {
            Ok(command) => command,
            Err(e) => {
                self.reply(vec![e.to_string()], StatusCode::InvalidContent).await?;
                return Ok(Flow::Continue);
            }
        };
        debug!("Control command: {}", name.as_str());

        let (lines, code) = match command {
            Command::Password(candidate) => {
                self.authorized = self.control.check_password(&candidate);
                if self.authorized {
                    (Vec::new(), StatusCode::Ok)
                } else {
                    warn!("Control session from {:?}: wrong password", self.conn.peer());
                    (Vec::new(), StatusCode::Unauthorized)
                }
            }
            Command::Help => (
                CommandName::ALL
                    .iter()
                    .flat_map(|c| c.usage().iter().map(|u| u.to_string()))
                    .collect(),
                StatusCode::Ok,
            ),
            Command::Quit => {
                self.reply(vec!["goodbye".into()], StatusCode::Ok).await?;
                return Ok(Flow::Quit);
            }
            Command::Status => (self.status_lines(), StatusCode::Ok),
            Command::Max(max) => {
                self.manager.set_max_connections(max);
                (vec![format!("max connections {max}")], StatusCode::Ok)
            }
            Command::Start(ports) => self.start(&ports).await,
            Command::Stop(ports) => self.stop(&ports, false).await,
            Command::Remove(ports) => self.stop(&ports, true).await,
            Command::Add(request) => self.add(request).await,
        };
        self.reply(lines, code).await?;
        Ok(Flow::Continue)
    }

    async fn reply(&mut self, lines: Vec<String>, code: StatusCode) -> io::Result<()> {
        for line in &lines {
            self.conn.write_line(line).await?;
            self.svc.record_sent();
        }
        self.conn.write_line(self.control.codes.text(code)).await?;
        self.svc.record_sent();
        Ok(())
    }

    fn status_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .manager
            .status()
            .iter()
            .flat_map(|status| status.lines())
            .collect();
        lines.push(format!(
            "connections {}/{}",
            self.manager.active_connections(),
            self.manager.max_connections()
        ));
        lines
    }

    async fn start(&self, ports: &[u16]) -> (Vec<String>, StatusCode) {
        let mut outcome = Outcome::default();
        for &port in ports {
            match self.manager.start(port).await {
                Ok(()) => outcome.ok(format!("started {port}")),
                Err(e) => outcome.failed(format!("start {port}"), e),
            }
        }
        outcome.finish()
    }

    /// `stop` and `remove`. SYSTEM services cannot be stopped remotely.
    async fn stop(&self, ports: &[u16], permanent: bool) -> (Vec<String>, StatusCode) {
        let verb = if permanent { "remove" } else { "stop" };
        let mut outcome = Outcome::default();
        for &port in ports {
            let Some(service) = self.manager.get(port) else {
                outcome.failed(format!("{verb} {port}"), HostError::UnknownPort(port));
                continue;
            };
            if service.startup() == StartupPolicy::System {
                outcome.failed(format!("{verb} {port}"), HostError::SystemService(service.name()));
                continue;
            }
            self.manager.remove(port, permanent).await;
            let done = if permanent { "removed" } else { "stopped" };
            outcome.ok(format!("{done} {port}"));
        }
        outcome.finish()
    }

    async fn add(&self, request: AddRequest) -> (Vec<String>, StatusCode) {
        let mut outcome = Outcome::default();
        let configs = match self.resolve_add(request) {
            Ok(configs) => configs,
            Err(e) => {
                outcome.failed("add".into(), e);
                return outcome.finish();
            }
        };
        for config in configs {
            let (name, port) = (config.name.clone(), config.port);
            if config.startup == StartupPolicy::Disabled {
                outcome.ok(format!("skipped disabled {name}"));
                continue;
            }
            match self.add_one(config).await {
                Ok(()) => outcome.ok(format!("added {name} on port {port}")),
                Err(e) => outcome.failed(format!("add {name}"), e),
            }
        }
        outcome.finish()
    }

    fn resolve_add(&self, request: AddRequest) -> HostResult<Vec<ServiceConfig>> {
        match request {
            AddRequest::Derive {
                source,
                name,
                port,
                overrides,
            } => {
                let base = self
                    .manager
                    .config_by_name(&source)
                    .ok_or(HostError::UnknownService(source))?;
                let config = base.derive(&name, port, &overrides);
                config.validate()?;
                Ok(vec![config])
            }
            AddRequest::File(path) => Ok(HostConfig::load(&path)?.services),
            AddRequest::Inline(package) => Ok(HostConfig::from_json_str(&package)?.services),
        }
    }

    /// Register and start a service now. A DELAYED_START service added at
    /// runtime starts immediately but keeps its policy.
    async fn add_one(&self, config: ServiceConfig) -> HostResult<()> {
        let delayed = config.startup == StartupPolicy::DelayedStart;
        let service = self.manager.create(config)?;
        self.manager.add(service.clone()).await?;
        if delayed {
            self.manager.start(service.port()).await?;
        }
        Ok(())
    }
}

/// Response lines of a multi-target command plus the status of its first
/// failure.
#[derive(Default)]
struct Outcome {
    lines: Vec<String>,
    failure: Option<StatusCode>,
}

impl Outcome {
    fn ok(&mut self, line: String) {
        self.lines.push(line);
    }

    fn failed(&mut self, what: String, error: HostError) {
        warn!("Control: {what} failed: {error}");
        self.lines.push(format!("{what}: {error}"));
        self.failure.get_or_insert(error.status());
    }

    fn finish(self) -> (Vec<String>, StatusCode) {
        (self.lines, self.failure.unwrap_or(StatusCode::Ok))
    }
}
