//! Service runtime: lifecycle state machine, connection admission and children.
//!
//! A [`ServiceHandle`] is a cheap, clonable reference to one hosted service.
//! The handle owns the generic behaviour every service shares; the
//! implementation-specific hooks live behind the [`Service`](crate::Service)
//! trait object it wraps.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use svhost_protocol::{HostError, HostResult, ServiceConfig, ServiceType, StartupPolicy};
use svhost_transport::{Acceptor, Connection, ConnectionId, Listener, Terminator, refuse};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::events::{LifecycleEvent, ServiceEvent};
use crate::manager::{HostShared, ServiceManager};
use crate::service::{BoxFuture, ServiceDyn};
use crate::status::{ServiceState, ServiceStatus};

/// How long shutdown waits for each aborted connection task to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

tokio::task_local! {
    /// Set inside every connection task so shutdown can recognise the
    /// connection it is running on.
    static CURRENT_CONNECTION: ConnectionId;
}

/// Opaque arena key for a hosted service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(u64);

impl ServiceId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "svc-{}", self.0)
    }
}

/// Process-wide connection accounting shared by every service.
#[derive(Debug, Default)]
pub(crate) struct GlobalConnections {
    pub(crate) max: AtomicUsize,
    pub(crate) active: AtomicUsize,
}

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    total: AtomicU64,
    received: AtomicU64,
    sent: AtomicU64,
    errors: AtomicU64,
}

/// Registry entry for one live connection.
struct ConnectionEntry {
    active: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ConnectionEntry {
    /// Deactivate and abort the task. Returns the task so the caller can
    /// wait for it to wind down.
    fn close(&self) -> Option<JoinHandle<()>> {
        self.closed.store(true, Ordering::SeqCst);
        self.active.store(false, Ordering::Release);
        let task = self.task.lock().take();
        if let Some(task) = &task {
            task.abort();
        }
        task
    }

    fn set_task(&self, task: JoinHandle<()>) {
        let mut slot = self.task.lock();
        if self.closed.load(Ordering::SeqCst) {
            task.abort();
            return;
        }
        *slot = Some(task);
    }
}

/// Returns a connection's admission slot when its task ends, however it ends.
struct ConnectionGuard {
    svc: ServiceHandle,
    id: ConnectionId,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let inner = &self.svc.inner;
        inner.connections.remove(&self.id);
        inner.counters.active.fetch_sub(1, Ordering::AcqRel);
        inner.global.active.fetch_sub(1, Ordering::AcqRel);
        *inner.last_action.lock() = Utc::now();
    }
}

struct UnitInner {
    id: ServiceId,
    parent: Option<ServiceId>,
    config: RwLock<ServiceConfig>,
    terminator: Terminator,
    behavior: Arc<dyn ServiceDyn>,
    host: Weak<HostShared>,
    global: Arc<GlobalConnections>,
    events: broadcast::Sender<ServiceEvent>,
    running: AtomicBool,
    running_tx: watch::Sender<bool>,
    state: Mutex<ServiceState>,
    /// Serialises start/shutdown of this service.
    transition: tokio::sync::Mutex<()>,
    listener: Mutex<Option<Listener>>,
    connections: DashMap<ConnectionId, Arc<ConnectionEntry>>,
    children: RwLock<BTreeMap<u16, ServiceId>>,
    counters: Counters,
    last_action: Mutex<DateTime<Utc>>,
}

impl Acceptor for UnitInner {
    fn accept(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        ServiceHandle { inner: self }.admit_socket(stream, peer);
    }
}

/// Shared handle to a hosted service.
#[derive(Clone)]
pub struct ServiceHandle {
    inner: Arc<UnitInner>,
}

impl ServiceHandle {
    pub(crate) fn new(
        id: ServiceId,
        parent: Option<ServiceId>,
        config: ServiceConfig,
        behavior: Arc<dyn ServiceDyn>,
        host: &Arc<HostShared>,
    ) -> Self {
        let terminator = Terminator::from_escaped(
            &config.attr_string_or("terminator", svhost_protocol::DEFAULT_TERMINATOR),
        );
        let (running_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(UnitInner {
                id,
                parent,
                config: RwLock::new(config),
                terminator,
                behavior,
                host: Arc::downgrade(host),
                global: host.global.clone(),
                events: host.events.clone(),
                running: AtomicBool::new(false),
                running_tx,
                state: Mutex::new(ServiceState::Stopped),
                transition: tokio::sync::Mutex::new(()),
                listener: Mutex::new(None),
                connections: DashMap::new(),
                children: RwLock::new(BTreeMap::new()),
                counters: Counters::default(),
                last_action: Mutex::new(Utc::now()),
            }),
        }
    }

    // ── Identity & configuration ──────────────────────────────────────────

    pub fn id(&self) -> ServiceId {
        self.inner.id
    }

    /// The parent's ID for child services, `None` for top-level services.
    pub fn parent(&self) -> Option<ServiceId> {
        self.inner.parent
    }

    pub fn name(&self) -> String {
        self.inner.config.read().name.clone()
    }

    pub fn port(&self) -> u16 {
        self.inner.config.read().port
    }

    pub fn implementation(&self) -> String {
        self.inner.config.read().implementation.clone()
    }

    /// Deep copy of the current configuration.
    pub fn config(&self) -> ServiceConfig {
        self.inner.config.read().clone()
    }

    pub fn startup(&self) -> StartupPolicy {
        self.inner.config.read().startup
    }

    pub fn set_startup(&self, startup: StartupPolicy) {
        self.inner.config.write().startup = startup;
    }

    pub fn terminator(&self) -> &Terminator {
        &self.inner.terminator
    }

    /// The host manager, while it is alive.
    pub fn manager(&self) -> Option<ServiceManager> {
        self.inner.host.upgrade().map(ServiceManager::from_shared)
    }

    fn host(&self) -> HostResult<Arc<HostShared>> {
        self.inner
            .host
            .upgrade()
            .ok_or_else(|| HostError::Config("service host has shut down".into()))
    }

    // ── State ─────────────────────────────────────────────────────────────

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ServiceState {
        *self.inner.state.lock()
    }

    fn set_state(&self, state: ServiceState) {
        *self.inner.state.lock() = state;
    }

    /// Whether the service currently owns a bound listener.
    pub fn is_listening(&self) -> bool {
        self.inner.listener.lock().is_some()
    }

    /// Port the listener is actually bound to.
    pub fn listener_port(&self) -> Option<u16> {
        self.inner.listener.lock().as_ref().map(Listener::port)
    }

    /// Resolves once the service is not running. Serve loops `select!` on
    /// this to observe shutdown between reads.
    pub async fn stopped(&self) {
        let mut rx = self.inner.running_tx.subscribe();
        let _ = rx.wait_for(|running| !*running).await;
    }

    // ── Counters ──────────────────────────────────────────────────────────

    pub fn active_connections(&self) -> usize {
        self.inner.counters.active.load(Ordering::Acquire)
    }

    pub fn total_connections(&self) -> u64 {
        self.inner.counters.total.load(Ordering::Relaxed)
    }

    pub fn messages_received(&self) -> u64 {
        self.inner.counters.received.load(Ordering::Relaxed)
    }

    pub fn messages_sent(&self) -> u64 {
        self.inner.counters.sent.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.inner.counters.errors.load(Ordering::Relaxed)
    }

    pub fn record_received(&self) {
        self.inner.counters.received.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_sent(&self) {
        self.inner.counters.sent.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_error(&self) {
        self.inner.counters.errors.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn last_action(&self) -> DateTime<Utc> {
        *self.inner.last_action.lock()
    }

    pub fn touch(&self) {
        *self.inner.last_action.lock() = Utc::now();
    }

    /// IDs of the connections currently registered.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.connections.iter().map(|e| *e.key()).collect()
    }

    // ── Admission ─────────────────────────────────────────────────────────

    /// Admission path for an accepted socket: refuse it when a limit is
    /// reached, otherwise register it and spawn its serve task.
    pub fn admit_socket(&self, stream: TcpStream, peer: SocketAddr) {
        let (name, service_max, ignore_limit) = {
            let config = self.inner.config.read();
            (
                config.name.clone(),
                config.max_connections,
                config.ignore_connection_limit,
            )
        };

        if !self.is_running() {
            debug!("Service '{name}' is not running, dropping {peer}");
            return;
        }

        if let Err(reason) = self.reserve_socket_slot(service_max, ignore_limit) {
            warn!("Service '{name}' refused {peer}: {reason}");
            let terminator = self.inner.terminator.clone();
            tokio::spawn(async move { refuse(stream, &terminator).await });
            return;
        }

        // Abrupt close discards unsent data instead of blocking.
        #[allow(deprecated)]
        let _ = stream.set_linger(None);

        let conn = Connection::from_socket(stream, peer, self.inner.terminator.clone());
        let id = self.launch(conn);
        debug!("Service '{name}' admitted {peer} as {id}");
    }

    /// Start an internal (socket-less) connection running this service's
    /// serve logic. Internal connections bypass both connection limits.
    pub fn spawn_internal(&self, conn: Connection) -> HostResult<ConnectionId> {
        if !conn.is_internal() {
            return Err(HostError::Config(
                "socket connections are admitted through the listener".into(),
            ));
        }
        if !self.is_running() {
            return Err(HostError::NotRunning(self.name()));
        }
        self.inner.counters.active.fetch_add(1, Ordering::AcqRel);
        self.inner.global.active.fetch_add(1, Ordering::AcqRel);
        Ok(self.launch(conn))
    }

    /// Check-and-increment both counters atomically, global first.
    fn reserve_socket_slot(&self, service_max: usize, ignore_limit: bool) -> Result<(), &'static str> {
        let global = &self.inner.global;
        let global_max = global.max.load(Ordering::Acquire);

        global
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if !ignore_limit && global_max != 0 && current >= global_max {
                    None
                } else {
                    Some(current + 1)
                }
            })
            .map_err(|_| "global connection limit reached")?;

        let reserved = self.inner.counters.active.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |current| {
                if service_max != 0 && current >= service_max {
                    None
                } else {
                    Some(current + 1)
                }
            },
        );
        if reserved.is_err() {
            global.active.fetch_sub(1, Ordering::AcqRel);
            return Err("service connection limit reached");
        }
        Ok(())
    }

    /// Register an already-counted connection and spawn its task.
    fn launch(&self, conn: Connection) -> ConnectionId {
        let id = conn.id();
        let entry = Arc::new(ConnectionEntry {
            active: conn.active_flag(),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        self.inner.connections.insert(id, entry.clone());
        self.inner.counters.total.fetch_add(1, Ordering::Relaxed);
        self.touch();

        let guard = ConnectionGuard { svc: self.clone(), id };
        let svc = self.clone();
        let task = tokio::spawn(CURRENT_CONNECTION.scope(id, async move {
            let _guard = guard;
            let name = svc.name();
            match svc.inner.behavior.serve_dyn(&svc, conn).await {
                Ok(()) => debug!("Service '{name}' connection {id} closed"),
                Err(e) => {
                    svc.record_error();
                    warn!("Service '{name}' connection {id} failed: {e}");
                }
            }
        }));
        entry.set_task(task);

        // A shutdown that snapshotted the set before our insert would miss us.
        if !self.is_running() {
            entry.close();
        }
        id
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Stopped → Running. Binds the listener for SERVER-type services, runs
    /// the implementation's start hook, then starts declared children.
    /// No-op if already running.
    pub async fn start(&self) -> HostResult<()> {
        let _transition = self.inner.transition.lock().await;
        if self.is_running() {
            return Ok(());
        }

        let config = self.config();
        let name = config.name.clone();
        self.set_state(ServiceState::Starting);
        self.inner.running.store(true, Ordering::SeqCst);
        self.inner.running_tx.send_replace(true);

        if config.service_type == ServiceType::Server && self.inner.behavior.accepts_sockets_dyn() {
            let bind: IpAddr = config.attr_or("bind", IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            let addr = SocketAddr::new(bind, config.port);
            match Listener::bind(&name, addr, Arc::downgrade(&self.inner)).await {
                Ok(listener) => *self.inner.listener.lock() = Some(listener),
                Err(e) => error!("Service '{name}' could not listen on {addr}: {e}"),
            }
        }

        if let Err(e) = self.inner.behavior.start_dyn(self).await {
            error!("Service '{name}' failed to start, shutting it down: {e}");
            for child in self.stop_locked().await {
                child.shutdown().await;
            }
            self.publish(LifecycleEvent::StartFailed);
            return Err(HostError::start_failed(name, e));
        }

        self.start_children(&config).await;

        self.set_state(ServiceState::Running);
        self.touch();
        info!("Service '{name}' started (port {})", config.port);
        self.publish(LifecycleEvent::Started);
        Ok(())
    }

    /// Type-erased `start` for the child recursion.
    fn start_boxed(&self) -> BoxFuture<'_, HostResult<()>> {
        Box::pin(self.start())
    }

    /// Running → Stopped for this service and, breadth-first, every
    /// descendant. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let mut queue = VecDeque::from([self.clone()]);
        while let Some(svc) = queue.pop_front() {
            let children = {
                let _transition = svc.inner.transition.lock().await;
                svc.stop_locked().await
            };
            queue.extend(children);
        }
    }

    /// Start if stopped, otherwise run the implementation's self-check.
    pub async fn validate(&self) -> HostResult<()> {
        if !self.is_running() {
            return self.start().await;
        }
        self.inner.behavior.validate_dyn(self).await
    }

    /// Stop this service only. The caller holds the transition lock.
    /// Returns the detached children, which the caller must shut down.
    async fn stop_locked(&self) -> Vec<ServiceHandle> {
        let was_running = self.inner.running.swap(false, Ordering::SeqCst);
        let name = self.name();
        if was_running {
            self.set_state(ServiceState::Stopping);
            self.inner.running_tx.send_replace(false);
        }

        let listener = self.inner.listener.lock().take();
        if let Some(mut listener) = listener {
            listener.shutdown().await;
        }

        if was_running {
            self.inner.behavior.shutdown_dyn(self).await;
        }

        self.drain_connections(&name).await;
        let children = self.detach_children();

        self.set_state(ServiceState::Stopped);
        if was_running {
            self.touch();
            info!("Service '{name}' stopped");
            self.publish(LifecycleEvent::Stopped);
        }
        children
    }

    async fn drain_connections(&self, name: &str) {
        let current = CURRENT_CONNECTION.try_with(|id| *id).ok();
        let entries: Vec<(ConnectionId, Arc<ConnectionEntry>)> = self
            .inner
            .connections
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let mut tasks = Vec::with_capacity(entries.len());
        for (id, entry) in entries {
            if Some(id) == current {
                // Cannot abort the task we are running on; it sees the flag.
                entry.active.store(false, Ordering::Release);
                continue;
            }
            if let Some(task) = entry.close() {
                tasks.push(task);
            }
        }

        for task in tasks {
            if tokio::time::timeout(DRAIN_TIMEOUT, task).await.is_err() {
                warn!("Service '{name}': connection did not drain within {DRAIN_TIMEOUT:?}");
            }
        }
    }

    // ── Children ──────────────────────────────────────────────────────────

    pub fn child(&self, port: u16) -> Option<ServiceHandle> {
        let id = self.inner.children.read().get(&port).copied()?;
        self.inner.host.upgrade()?.resolve(id)
    }

    pub fn children(&self) -> Vec<ServiceHandle> {
        let ids: Vec<ServiceId> = self.inner.children.read().values().copied().collect();
        let Some(host) = self.inner.host.upgrade() else {
            return Vec::new();
        };
        ids.into_iter().filter_map(|id| host.resolve(id)).collect()
    }

    /// Instantiate a stopped child of this service. It is not registered
    /// until passed to [`add_child_service`](Self::add_child_service).
    pub fn create_child(&self, config: ServiceConfig) -> HostResult<ServiceHandle> {
        self.host()?.instantiate(config, Some(self.id()))
    }

    /// Instantiate a child from `config`, register it under its port and
    /// start it immediately.
    pub async fn add_child(&self, config: ServiceConfig) -> HostResult<ServiceHandle> {
        let child = self.create_child(config)?;
        self.add_child_service(child.clone()).await?;
        Ok(child)
    }

    /// Register a child created by [`create_child`](Self::create_child)
    /// under its port and start it. Children have no delayed start.
    pub async fn add_child_service(&self, child: ServiceHandle) -> HostResult<()> {
        let host = self.host()?;
        if child.parent() != Some(self.id()) {
            return Err(HostError::Config(format!(
                "service '{}' was not created as a child of '{}'",
                child.name(),
                self.name()
            )));
        }
        if !self.is_running() {
            return Err(HostError::NotRunning(self.name()));
        }
        let port = child.port();
        {
            let mut children = self.inner.children.write();
            if children.contains_key(&port) {
                return Err(HostError::DuplicatePort(port));
            }
            children.insert(port, child.id());
        }
        if let Err(e) = host.attach(child.clone()) {
            self.inner.children.write().remove(&port);
            warn!("Service '{}' rejected child '{}': {e}", self.name(), child.name());
            return Err(e);
        }

        if let Err(e) = child.start_boxed().await {
            self.inner.children.write().remove(&port);
            host.detach(child.id());
            return Err(e);
        }
        info!(
            "Service '{}' added child '{}' on port {port}",
            self.name(),
            child.name()
        );
        Ok(())
    }

    /// Shut a child down and forget it. `false` for unknown ports.
    pub async fn remove_child(&self, port: u16) -> bool {
        let Some(id) = self.inner.children.write().remove(&port) else {
            return false;
        };
        let Some(host) = self.inner.host.upgrade() else {
            return false;
        };
        if let Some(child) = host.detach(id) {
            child.shutdown().await;
            info!("Service '{}' removed child on port {port}", self.name());
        }
        true
    }

    async fn start_children(&self, config: &ServiceConfig) {
        for child_config in &config.children {
            if let Some(existing) = self.child(child_config.port) {
                if let Err(e) = existing.start_boxed().await {
                    error!("Service '{}': child '{}' failed to start: {e}", config.name, existing.name());
                }
                continue;
            }
            if let Err(e) = self.add_child(child_config.clone()).await {
                error!(
                    "Service '{}': could not create child '{}': {e}",
                    config.name, child_config.name
                );
            }
        }
    }

    fn detach_children(&self) -> Vec<ServiceHandle> {
        let ids: Vec<ServiceId> = std::mem::take(&mut *self.inner.children.write())
            .into_values()
            .collect();
        if ids.is_empty() {
            return Vec::new();
        }
        match self.inner.host.upgrade() {
            Some(host) => ids.into_iter().filter_map(|id| host.detach(id)).collect(),
            None => {
                warn!("Service '{}': host gone, {} children orphaned", self.name(), ids.len());
                Vec::new()
            }
        }
    }

    // ── Reporting ─────────────────────────────────────────────────────────

    pub fn status(&self) -> ServiceStatus {
        let config = self.config();
        ServiceStatus {
            id: self.id(),
            name: config.name,
            port: config.port,
            implementation: config.implementation,
            service_type: config.service_type,
            startup: config.startup,
            state: self.state(),
            listening: self.is_listening(),
            active_connections: self.active_connections(),
            total_connections: self.total_connections(),
            messages_received: self.messages_received(),
            messages_sent: self.messages_sent(),
            errors: self.errors(),
            last_action: self.last_action(),
            children: self.children().iter().map(ServiceHandle::status).collect(),
        }
    }

    pub(crate) fn publish(&self, kind: LifecycleEvent) {
        let event = ServiceEvent::new(self.id(), self.name(), self.port(), kind);
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("id", &self.inner.id)
            .field("name", &self.name())
            .field("port", &self.port())
            .field("state", &self.state())
            .finish()
    }
}
