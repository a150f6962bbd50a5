use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::RwLock;
use svhost_protocol::{HostConfig, HostError, HostResult, ServiceConfig, StartupPolicy};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::events::{LifecycleEvent, ServiceEvent};
use crate::service::{Factory, Service, ServiceDyn};
use crate::status::ServiceStatus;
use crate::unit::{GlobalConnections, ServiceHandle, ServiceId};

const EVENT_CAPACITY: usize = 256;

/// Every live service, children included, keyed by ID. Top-level services
/// and attached children have separate port and name indexes; a port or
/// name is held by at most one entry across both.
#[derive(Default)]
struct Registry {
    services: HashMap<ServiceId, ServiceHandle>,
    by_port: BTreeMap<u16, ServiceId>,
    by_name: HashMap<String, ServiceId>,
    child_ports: HashMap<u16, ServiceId>,
    child_names: HashMap<String, ServiceId>,
}

impl Registry {
    fn check_free(&self, port: u16, name: &str) -> HostResult<()> {
        if self.by_port.contains_key(&port) || self.child_ports.contains_key(&port) {
            return Err(HostError::DuplicatePort(port));
        }
        if self.by_name.contains_key(name) || self.child_names.contains_key(name) {
            return Err(HostError::DuplicateName(name.to_string()));
        }
        Ok(())
    }
}

/// State shared by the manager and every service it created.
pub(crate) struct HostShared {
    registry: RwLock<Registry>,
    factories: RwLock<HashMap<String, Factory>>,
    pub(crate) global: Arc<GlobalConnections>,
    pub(crate) events: broadcast::Sender<ServiceEvent>,
    next_id: AtomicU64,
}

impl HostShared {
    /// Build a stopped service from `config` through the registered factory.
    pub(crate) fn instantiate(
        self: &Arc<Self>,
        config: ServiceConfig,
        parent: Option<ServiceId>,
    ) -> HostResult<ServiceHandle> {
        config.validate()?;
        let factory = self
            .factories
            .read()
            .get(&config.implementation)
            .cloned()
            .ok_or_else(|| HostError::UnknownServiceType(config.implementation.clone()))?;
        let behavior = factory(&config)?;
        let id = ServiceId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        debug!(
            "Created service '{}' ({}) as {id}",
            config.name, config.implementation
        );
        Ok(ServiceHandle::new(id, parent, config, behavior, self))
    }

    /// Claim a child's port and name. Fails if a top-level service or
    /// another child already holds either.
    pub(crate) fn attach(&self, child: ServiceHandle) -> HostResult<()> {
        let (id, port, name) = (child.id(), child.port(), child.name());
        let mut registry = self.registry.write();
        registry.check_free(port, &name)?;
        registry.child_ports.insert(port, id);
        registry.child_names.insert(name, id);
        registry.services.insert(id, child);
        Ok(())
    }

    /// Forget a child, releasing its port and name.
    pub(crate) fn detach(&self, id: ServiceId) -> Option<ServiceHandle> {
        let mut registry = self.registry.write();
        let child = registry.services.remove(&id)?;
        let (port, name) = (child.port(), child.name());
        if registry.child_ports.get(&port) == Some(&id) {
            registry.child_ports.remove(&port);
        }
        if registry.child_names.get(&name) == Some(&id) {
            registry.child_names.remove(&name);
        }
        Some(child)
    }

    pub(crate) fn resolve(&self, id: ServiceId) -> Option<ServiceHandle> {
        self.registry.read().services.get(&id).cloned()
    }
}

/// Registry of hosted services keyed by port.
///
/// Cheap to clone; all clones share one registry. Services reach it through
/// [`ServiceHandle::manager`].
#[derive(Clone)]
pub struct ServiceManager {
    shared: Arc<HostShared>,
}

impl ServiceManager {
    /// `max_connections` of 0 means unlimited.
    pub fn new(max_connections: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(HostShared {
                registry: RwLock::new(Registry::default()),
                factories: RwLock::new(HashMap::new()),
                global: Arc::new(GlobalConnections {
                    max: AtomicUsize::new(max_connections),
                    active: AtomicUsize::new(0),
                }),
                events,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<HostShared>) -> Self {
        Self { shared }
    }

    // ── Factories ─────────────────────────────────────────────────────────

    /// Register the constructor for an implementation identifier. A later
    /// registration under the same identifier replaces the earlier one.
    pub fn register_factory<S, F>(&self, implementation: impl Into<String>, factory: F)
    where
        S: Service,
        F: Fn(&ServiceConfig) -> HostResult<S> + Send + Sync + 'static,
    {
        let implementation = implementation.into();
        let factory: Factory =
            Arc::new(move |config| Ok(Arc::new(factory(config)?) as Arc<dyn ServiceDyn>));
        debug!("Registered service implementation '{implementation}'");
        self.shared.factories.write().insert(implementation, factory);
    }

    pub fn has_factory(&self, implementation: &str) -> bool {
        self.shared.factories.read().contains_key(implementation)
    }

    /// Registered implementation identifiers, sorted.
    pub fn implementations(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.factories.read().keys().cloned().collect();
        names.sort();
        names
    }

    // ── Registration ──────────────────────────────────────────────────────

    /// Instantiate a stopped, unregistered service from its configuration.
    pub fn create(&self, config: ServiceConfig) -> HostResult<ServiceHandle> {
        if config.startup == StartupPolicy::Disabled {
            return Err(HostError::Config(format!(
                "service '{}' is disabled",
                config.name
            )));
        }
        self.shared.instantiate(config, None)
    }

    /// Register a service under its port and start it if its policy says so.
    ///
    /// A start failure leaves the service registered and stopped, and is
    /// returned to the caller.
    pub async fn add(&self, service: ServiceHandle) -> HostResult<()> {
        if service.parent().is_some() {
            return Err(HostError::Config(format!(
                "service '{}' is a child; add it through its parent",
                service.name()
            )));
        }
        let (name, port, id) = (service.name(), service.port(), service.id());
        {
            let mut registry = self.shared.registry.write();
            if let Err(e) = registry.check_free(port, &name) {
                warn!("Service '{name}' rejected: {e}");
                return Err(e);
            }
            registry.by_port.insert(port, id);
            registry.by_name.insert(name.clone(), id);
            registry.services.insert(id, service.clone());
        }
        info!("Registered service '{name}' on port {port}");
        service.publish(LifecycleEvent::Initialize);

        if service.startup().starts_on_add() {
            service.publish(LifecycleEvent::Start);
            service.start().await?;
        }
        Ok(())
    }

    /// `create` followed by `add`.
    pub async fn add_config(&self, config: ServiceConfig) -> HostResult<ServiceHandle> {
        let service = self.create(config)?;
        self.add(service.clone()).await?;
        Ok(service)
    }

    /// Apply a host configuration: the global limit (when non-zero) and every
    /// non-disabled service. Failures are logged and skipped. Returns the
    /// number of services that were added and started as their policy asks.
    pub async fn load(&self, config: &HostConfig) -> usize {
        if config.max_connections != 0 {
            self.set_max_connections(config.max_connections);
        }
        let mut loaded = 0;
        for service in &config.services {
            if service.startup == StartupPolicy::Disabled {
                info!("Skipping disabled service '{}'", service.name);
                continue;
            }
            match self.add_config(service.clone()).await {
                Ok(_) => loaded += 1,
                Err(e) => error!("Failed to load service '{}': {e}", service.name),
            }
        }
        loaded
    }

    /// Shut down the service on `port`; with `permanent` also delete it.
    /// Returns `false` when nothing is registered there.
    pub async fn remove(&self, port: u16, permanent: bool) -> bool {
        let Some(service) = self.get(port) else {
            return false;
        };
        service.publish(LifecycleEvent::Shutdown);
        service.shutdown().await;

        if permanent {
            let id = service.id();
            {
                let mut registry = self.shared.registry.write();
                if registry.by_port.get(&port) == Some(&id) {
                    registry.by_port.remove(&port);
                }
                if registry.by_name.get(&service.name()) == Some(&id) {
                    registry.by_name.remove(&service.name());
                }
                registry.services.remove(&id);
            }
            info!("Removed service '{}' from port {port}", service.name());
            service.publish(LifecycleEvent::Removed);
        }
        true
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────

    /// Start the service on `port` if it is not running.
    pub async fn start(&self, port: u16) -> HostResult<()> {
        let service = self.get(port).ok_or(HostError::UnknownPort(port))?;
        if service.is_running() {
            return Ok(());
        }
        service.publish(LifecycleEvent::Start);
        service.start().await
    }

    /// Start a stopped service, or run a running service's self-check.
    pub async fn validate(&self, port: u16) -> HostResult<()> {
        let service = self.get(port).ok_or(HostError::UnknownPort(port))?;
        self.validate_service(&service).await
    }

    pub async fn validate_name(&self, name: &str) -> HostResult<()> {
        let service = self
            .get_by_name(name)
            .ok_or_else(|| HostError::UnknownService(name.to_string()))?;
        self.validate_service(&service).await
    }

    async fn validate_service(&self, service: &ServiceHandle) -> HostResult<()> {
        if !service.is_running() {
            service.publish(LifecycleEvent::Start);
        }
        service.validate().await
    }

    /// Start every stopped DELAYED_START service. Returns how many started.
    pub async fn start_delayed(&self) -> usize {
        let mut started = 0;
        for service in self.services() {
            if service.startup() != StartupPolicy::DelayedStart || service.is_running() {
                continue;
            }
            service.publish(LifecycleEvent::Start);
            match service.start().await {
                Ok(()) => started += 1,
                Err(e) => error!("Delayed start of '{}' failed: {e}", service.name()),
            }
        }
        if started > 0 {
            info!("Started {started} delayed service(s)");
        }
        started
    }

    /// Shut down every registered service. Registrations are kept.
    pub async fn shutdown_all(&self) {
        let services = self.services();
        info!("Shutting down {} service(s)", services.len());
        for service in services {
            service.publish(LifecycleEvent::Shutdown);
            service.shutdown().await;
        }
    }

    // ── Lookup ────────────────────────────────────────────────────────────

    pub fn get(&self, port: u16) -> Option<ServiceHandle> {
        let registry = self.shared.registry.read();
        let id = registry.by_port.get(&port)?;
        registry.services.get(id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<ServiceHandle> {
        let registry = self.shared.registry.read();
        let id = registry.by_name.get(name)?;
        registry.services.get(id).cloned()
    }

    /// Top-level services in port order.
    pub fn services(&self) -> Vec<ServiceHandle> {
        let registry = self.shared.registry.read();
        registry
            .by_port
            .values()
            .filter_map(|id| registry.services.get(id).cloned())
            .collect()
    }

    pub fn ports(&self) -> Vec<u16> {
        self.shared.registry.read().by_port.keys().copied().collect()
    }

    /// Configuration of the top-level service registered as `name`.
    pub fn config_by_name(&self, name: &str) -> Option<ServiceConfig> {
        self.get_by_name(name).map(|s| s.config())
    }

    pub fn len(&self) -> usize {
        self.shared.registry.read().by_port.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Connections & reporting ───────────────────────────────────────────

    pub fn max_connections(&self) -> usize {
        self.shared.global.max.load(Ordering::Acquire)
    }

    /// Takes effect for the next admission; open connections are untouched.
    pub fn set_max_connections(&self, max: usize) {
        self.shared.global.max.store(max, Ordering::Release);
        info!("Global connection limit set to {max}");
    }

    /// Open connections across every service, internal ones included.
    pub fn active_connections(&self) -> usize {
        self.shared.global.active.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.shared.events.subscribe()
    }

    /// Snapshot of every top-level service (children nested) in port order.
    pub fn status(&self) -> Vec<ServiceStatus> {
        self.services().iter().map(ServiceHandle::status).collect()
    }
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new(0)
    }
}
