//! Service manager and runtime tests.
//!
//! Drives the registry, lifecycle and admission control through the public
//! API with real sockets on loopback ports.

use std::time::Duration;

use svhost_protocol::{
    BUSY_MESSAGE, ChildRole, HostError, HostResult, ServiceConfig, ServiceType, StartupPolicy,
};
use svhost_server::{LifecycleEvent, Service, ServiceHandle, ServiceManager, ServiceState};
use svhost_transport::Connection;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn manager(max_connections: usize) -> ServiceManager {
    let manager = ServiceManager::new(max_connections);
    svhost_services::register_builtin(&manager);
    manager.register_factory("idle", |config: &ServiceConfig| {
        Ok(IdleService {
            workers: config.attr_or("workers", 0),
        })
    });
    manager.register_factory("faulty", |_config: &ServiceConfig| Ok(FaultyService));
    manager
}

fn echo(name: &str, port: u16) -> ServiceConfig {
    ServiceConfig::new(name, port, "echo")
}

fn topic_tree(port: u16, pub_port: u16, sub_port: u16) -> ServiceConfig {
    ServiceConfig::new("quotes", port, "topic")
        .with_child(
            ChildRole::Publisher,
            ServiceConfig::new("quotes-in", pub_port, "topic-publisher")
                .with_attribute("topic", "quotes"),
        )
        .with_child(
            ChildRole::Subscriber,
            ServiceConfig::new("quotes-out", sub_port, "topic-subscriber")
                .with_attribute("topic", "quotes"),
        )
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(port: u16) -> Self {
        let stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
    }

    /// Next line, or `None` at end of stream. `Err` when nothing arrives in time.
    async fn recv_within(&mut self, limit: Duration) -> Result<Option<String>, ()> {
        let mut line = String::new();
        match tokio::time::timeout(limit, self.reader.read_line(&mut line)).await {
            Err(_) => Err(()),
            Ok(Ok(0)) | Ok(Err(_)) => Ok(None),
            Ok(Ok(_)) => Ok(Some(line.trim_end_matches(['\r', '\n']).to_string())),
        }
    }

    async fn recv(&mut self) -> Option<String> {
        self.recv_within(Duration::from_secs(5))
            .await
            .expect("no line within 5s")
    }

    /// Admitted clients hear nothing until they speak; refused ones are told.
    async fn admitted(&mut self) -> bool {
        match self.recv_within(Duration::from_millis(300)).await {
            Err(()) => true,
            Ok(Some(line)) => {
                assert_eq!(line, BUSY_MESSAGE);
                false
            }
            Ok(None) => panic!("closed without a busy message"),
        }
    }
}

/// Spawns `workers` internal connections that idle until the service stops.
struct IdleService {
    workers: usize,
}

impl Service for IdleService {
    async fn start(&self, svc: &ServiceHandle) -> HostResult<()> {
        for _ in 0..self.workers {
            svc.spawn_internal(Connection::internal())?;
        }
        Ok(())
    }

    async fn serve(&self, svc: &ServiceHandle, _conn: Connection) -> HostResult<()> {
        svc.stopped().await;
        Ok(())
    }
}

struct FaultyService;

impl Service for FaultyService {
    async fn start(&self, _svc: &ServiceHandle) -> HostResult<()> {
        Err(HostError::Config("no backend".into()))
    }

    async fn serve(&self, _svc: &ServiceHandle, _conn: Connection) -> HostResult<()> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_port_is_rejected() {
    let m = manager(0);
    let port = free_port();
    m.add_config(echo("a", port)).await.unwrap();

    let err = m.add_config(echo("b", port)).await.unwrap_err();
    assert!(matches!(err, HostError::DuplicatePort(p) if p == port));
    assert_eq!(m.len(), 1);
    assert_eq!(m.get(port).unwrap().name(), "a");
    m.shutdown_all().await;
}

#[tokio::test]
async fn duplicate_name_is_rejected() {
    let m = manager(0);
    m.add_config(echo("same", free_port())).await.unwrap();

    let err = m.add_config(echo("same", free_port())).await.unwrap_err();
    assert!(matches!(err, HostError::DuplicateName(ref n) if n == "same"));
    assert_eq!(m.len(), 1);
    m.shutdown_all().await;
}

#[tokio::test]
async fn unknown_implementation_is_rejected() {
    let m = manager(0);
    let err = m
        .create(ServiceConfig::new("x", free_port(), "gopher"))
        .unwrap_err();
    assert!(matches!(err, HostError::UnknownServiceType(ref t) if t == "gopher"));
    assert!(m.is_empty());
}

#[tokio::test]
async fn disabled_services_are_never_created() {
    let m = manager(0);
    let config = echo("off", free_port()).with_startup(StartupPolicy::Disabled);
    assert!(m.create(config.clone()).is_err());

    let host = svhost_protocol::HostConfig {
        services: vec![config, echo("on", free_port())],
        ..Default::default()
    };
    assert_eq!(m.load(&host).await, 1);
    assert!(m.get_by_name("off").is_none());
    assert!(m.get_by_name("on").unwrap().is_running());
    m.shutdown_all().await;
}

#[tokio::test]
async fn control_requires_a_password() {
    let m = manager(0);
    let err = m
        .create(ServiceConfig::new("ctl", free_port(), "control"))
        .unwrap_err();
    assert!(matches!(err, HostError::AttributeNotFound(ref k) if k == "password"));
}

#[tokio::test]
async fn manual_start_and_permanent_remove() {
    let m = manager(0);
    let port = free_port();
    let svc = m
        .add_config(echo("manual", port).with_startup(StartupPolicy::Manual))
        .await
        .unwrap();
    assert!(!svc.is_running());
    assert_eq!(svc.state(), ServiceState::Stopped);

    m.start(port).await.unwrap();
    assert!(svc.is_running());
    assert!(svc.is_listening());
    // Starting a running service is a no-op.
    m.start(port).await.unwrap();

    assert!(m.remove(port, false).await);
    assert!(!svc.is_running());
    assert!(m.get(port).is_some());

    assert!(m.remove(port, true).await);
    assert!(m.get(port).is_none());
    assert!(m.get_by_name("manual").is_none());
    assert!(!m.remove(port, true).await);
    assert!(matches!(m.start(port).await, Err(HostError::UnknownPort(_))));
}

#[tokio::test]
async fn delayed_start_pass() {
    let m = manager(0);
    let port = free_port();
    let svc = m
        .add_config(echo("later", port).with_startup(StartupPolicy::DelayedStart))
        .await
        .unwrap();
    assert!(!svc.is_running());

    assert_eq!(m.start_delayed().await, 1);
    assert!(svc.is_running());
    assert_eq!(svc.startup(), StartupPolicy::DelayedStart);
    assert_eq!(m.start_delayed().await, 0);
    m.shutdown_all().await;
}

#[tokio::test]
async fn validate_starts_stopped_services() {
    let m = manager(0);
    let port = free_port();
    let svc = m
        .add_config(echo("v", port).with_startup(StartupPolicy::Manual))
        .await
        .unwrap();
    m.validate_name("v").await.unwrap();
    assert!(svc.is_running());
    m.validate(port).await.unwrap();
    assert!(matches!(
        m.validate_name("nobody").await,
        Err(HostError::UnknownService(_))
    ));
    m.shutdown_all().await;
}

#[tokio::test]
async fn lifecycle_events_are_published() {
    let m = manager(0);
    let mut events = m.subscribe();
    let port = free_port();
    m.add_config(echo("ev", port)).await.unwrap();
    m.remove(port, true).await;

    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.name, "ev");
        kinds.push(event.kind);
    }
    assert_eq!(
        kinds,
        vec![
            LifecycleEvent::Initialize,
            LifecycleEvent::Start,
            LifecycleEvent::Started,
            LifecycleEvent::Shutdown,
            LifecycleEvent::Stopped,
            LifecycleEvent::Removed,
        ]
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Connections & admission
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn echo_counts_messages_and_releases_slots() {
    let m = manager(0);
    let port = free_port();
    let svc = m.add_config(echo("echo", port)).await.unwrap();

    let mut client = Client::connect(port).await;
    client.send("hello").await;
    assert_eq!(client.recv().await.as_deref(), Some("hello"));
    assert_eq!(svc.active_connections(), 1);
    assert_eq!(m.active_connections(), 1);
    assert_eq!(svc.messages_received(), 1);
    eventually("sent counter", || svc.messages_sent() == 1).await;

    drop(client);
    eventually("connection release", || svc.active_connections() == 0).await;
    assert_eq!(m.active_connections(), 0);
    assert_eq!(svc.total_connections(), 1);
    assert!(svc.connection_ids().is_empty());
    m.shutdown_all().await;
}

#[tokio::test]
async fn service_limit_refuses_with_busy_message() {
    let m = manager(0);
    let port = free_port();
    let svc = m
        .add_config(echo("one", port).with_max_connections(1))
        .await
        .unwrap();

    let mut first = Client::connect(port).await;
    first.send("ping").await;
    assert_eq!(first.recv().await.as_deref(), Some("ping"));

    let mut second = Client::connect(port).await;
    assert!(!second.admitted().await);
    assert_eq!(second.recv().await, None);
    assert_eq!(svc.active_connections(), 1);
    assert_eq!(svc.total_connections(), 1);

    drop(first);
    eventually("slot release", || svc.active_connections() == 0).await;
    let mut third = Client::connect(port).await;
    third.send("again").await;
    assert_eq!(third.recv().await.as_deref(), Some("again"));
    m.shutdown_all().await;
}

#[tokio::test]
async fn global_limit_honours_ignore_flag() {
    let m = manager(1);
    let (plain_port, exempt_port) = (free_port(), free_port());
    m.add_config(echo("plain", plain_port)).await.unwrap();
    let mut exempt = echo("exempt", exempt_port);
    exempt.ignore_connection_limit = true;
    m.add_config(exempt).await.unwrap();

    let mut a = Client::connect(plain_port).await;
    a.send("a").await;
    assert_eq!(a.recv().await.as_deref(), Some("a"));

    let mut b = Client::connect(plain_port).await;
    assert!(!b.admitted().await);

    let mut c = Client::connect(exempt_port).await;
    c.send("c").await;
    assert_eq!(c.recv().await.as_deref(), Some("c"));
    assert_eq!(m.active_connections(), 2);

    // Raising the cap applies to the next admission.
    m.set_max_connections(0);
    let mut d = Client::connect(plain_port).await;
    d.send("d").await;
    assert_eq!(d.recv().await.as_deref(), Some("d"));
    m.shutdown_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admission_never_exceeds_the_bound() {
    let m = manager(0);
    let port = free_port();
    let svc = m
        .add_config(echo("bounded", port).with_max_connections(3))
        .await
        .unwrap();

    let mut clients = Vec::new();
    for _ in 0..10 {
        clients.push(tokio::spawn(async move {
            let mut client = Client::connect(port).await;
            let admitted = client.admitted().await;
            (admitted, client)
        }));
    }
    let mut admitted = 0;
    let mut held = Vec::new();
    for task in clients {
        let (ok, client) = task.await.unwrap();
        if ok {
            admitted += 1;
        }
        held.push(client);
    }
    assert_eq!(admitted, 3);
    assert_eq!(svc.active_connections(), 3);
    assert_eq!(svc.total_connections(), 3);

    drop(held);
    eventually("all slots released", || m.active_connections() == 0).await;
    m.shutdown_all().await;
}

#[tokio::test]
async fn internal_connections_bypass_limits_but_are_counted() {
    let m = manager(1);
    let port = free_port();
    let svc = m
        .add_config(
            ServiceConfig::new("idle", port, "idle")
                .with_type(ServiceType::Client)
                .with_max_connections(1)
                .with_attribute("workers", "3"),
        )
        .await
        .unwrap();

    assert!(!svc.is_listening());
    assert_eq!(svc.active_connections(), 3);
    assert_eq!(m.active_connections(), 3);

    svc.shutdown().await;
    assert_eq!(svc.active_connections(), 0);
    assert_eq!(m.active_connections(), 0);
    assert!(matches!(
        svc.spawn_internal(Connection::internal()),
        Err(HostError::NotRunning(_))
    ));
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn shutdown_is_idempotent_and_closes_everything() {
    let m = manager(0);
    let port = free_port();
    let svc = m.add_config(echo("closing", port)).await.unwrap();

    let mut client = Client::connect(port).await;
    client.send("x").await;
    assert_eq!(client.recv().await.as_deref(), Some("x"));

    svc.shutdown().await;
    let after_once = (svc.is_running(), svc.active_connections(), svc.children().len());
    svc.shutdown().await;
    let after_twice = (svc.is_running(), svc.active_connections(), svc.children().len());

    assert_eq!(after_once, (false, 0, 0));
    assert_eq!(after_once, after_twice);
    assert_eq!(svc.state(), ServiceState::Stopped);
    assert!(!svc.is_listening());
    assert_eq!(client.recv().await, None);
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

    // Restartable while registered.
    svc.start().await.unwrap();
    let mut again = Client::connect(port).await;
    again.send("y").await;
    assert_eq!(again.recv().await.as_deref(), Some("y"));
    m.shutdown_all().await;
}

#[tokio::test]
async fn failed_start_shuts_back_down() {
    let m = manager(0);
    let port = free_port();
    let mut events = m.subscribe();

    let err = m
        .add_config(ServiceConfig::new("broken", port, "faulty"))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::StartFailed { ref name, .. } if name == "broken"));

    let svc = m.get(port).unwrap();
    assert!(!svc.is_running());
    assert!(!svc.is_listening());
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        saw_failure |= event.kind == LifecycleEvent::StartFailed;
    }
    assert!(saw_failure);
}

#[tokio::test]
async fn shutdown_cascades_to_children() {
    let m = manager(0);
    let (port, pub_port, sub_port) = (free_port(), free_port(), free_port());
    let parent = m
        .add_config(topic_tree(port, pub_port, sub_port))
        .await
        .unwrap();

    let children = parent.children();
    assert_eq!(children.len(), 2);
    assert!(children.iter().all(ServiceHandle::is_running));
    assert!(children.iter().all(|c| c.parent() == Some(parent.id())));
    assert_eq!(parent.child(pub_port).unwrap().name(), "quotes-in");
    // Children are not top-level registrations.
    assert_eq!(m.len(), 1);
    assert!(m.get(pub_port).is_none());

    parent.shutdown().await;
    assert!(children.iter().all(|c| !c.is_running()));
    assert!(parent.children().is_empty());
    assert!(TcpStream::connect(("127.0.0.1", sub_port)).await.is_err());

    // Restart recreates the declared children.
    parent.start().await.unwrap();
    assert_eq!(parent.children().len(), 2);
    assert!(parent.children().iter().all(ServiceHandle::is_running));

    let status = parent.status();
    assert_eq!(status.children.len(), 2);
    assert_eq!(status.lines().len(), 3);
    m.shutdown_all().await;
}

#[tokio::test]
async fn runtime_children() {
    let m = manager(0);
    let port = free_port();
    let parent = m
        .add_config(ServiceConfig::new("bus", port, "topic"))
        .await
        .unwrap();

    let child_port = free_port();
    let child = parent
        .add_child(
            ServiceConfig::new("bus-pub", child_port, "topic-publisher").with_attribute("topic", "t"),
        )
        .await
        .unwrap();
    assert!(child.is_running());

    let dup = parent
        .add_child(ServiceConfig::new("bus-pub2", child_port, "topic-publisher"))
        .await
        .unwrap_err();
    assert!(matches!(dup, HostError::DuplicatePort(p) if p == child_port));

    let made = parent
        .create_child(ServiceConfig::new("bus-sub", free_port(), "topic-subscriber"))
        .unwrap();
    parent.add_child_service(made.clone()).await.unwrap();
    assert!(made.is_running());
    assert_eq!(parent.children().len(), 2);

    assert!(!parent.remove_child(1).await);
    assert!(parent.remove_child(child_port).await);
    assert!(!child.is_running());
    assert_eq!(parent.children().len(), 1);

    parent.shutdown().await;
    assert!(!made.is_running());
    let late = parent
        .add_child(ServiceConfig::new("late", free_port(), "topic-publisher"))
        .await
        .unwrap_err();
    assert!(matches!(late, HostError::NotRunning(_)));
}

#[tokio::test]
async fn topic_validation_reports_missing_children() {
    let m = manager(0);
    let (port, pub_port, sub_port) = (free_port(), free_port(), free_port());
    let parent = m
        .add_config(topic_tree(port, pub_port, sub_port))
        .await
        .unwrap();
    m.validate(port).await.unwrap();

    assert!(parent.remove_child(sub_port).await);
    let err = m.validate_name("quotes").await.unwrap_err();
    assert!(matches!(err, HostError::ValidationFailed { ref name, .. } if name == "quotes"));
    assert!(parent.is_running());
    m.shutdown_all().await;
}

#[tokio::test]
async fn child_ports_and_names_are_unique_across_the_registry() {
    let m = manager(0);
    let (port, pub_port, sub_port) = (free_port(), free_port(), free_port());
    let parent = m
        .add_config(topic_tree(port, pub_port, sub_port))
        .await
        .unwrap();

    // Top-level services cannot take a child's port or name.
    let err = m.add_config(echo("clash", sub_port)).await.unwrap_err();
    assert!(matches!(err, HostError::DuplicatePort(p) if p == sub_port));
    let err = m.add_config(echo("quotes-in", free_port())).await.unwrap_err();
    assert!(matches!(err, HostError::DuplicateName(ref n) if n == "quotes-in"));
    assert_eq!(m.len(), 1);
    assert!(parent.child(sub_port).unwrap().is_listening());

    // Children cannot take a top-level port or name either.
    let solo_port = free_port();
    m.add_config(echo("solo", solo_port)).await.unwrap();
    let err = parent
        .add_child(ServiceConfig::new("extra", solo_port, "topic-publisher"))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::DuplicatePort(p) if p == solo_port));
    let err = parent
        .add_child(ServiceConfig::new("solo", free_port(), "topic-publisher"))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::DuplicateName(ref n) if n == "solo"));
    assert_eq!(parent.children().len(), 2);

    // A stopped parent releases its children's ports and names.
    parent.shutdown().await;
    m.add_config(echo("quotes-in", sub_port)).await.unwrap();
    m.shutdown_all().await;
}
