//! In-process publish/subscribe topics.
//!
//! A `topic` service is a parent whose children do the work: publisher
//! children accept lines and fan them out on the shared [`TopicBus`],
//! subscriber children deliver every message of their topic to each
//! connected client while reading the client's acknowledgements on an
//! auxiliary task. The parent port answers topic queries.
//!
//! ```toml
//! [[service]]
//! name = "quotes"
//! port = 7100
//! implementation = "topic"
//!
//! [[service.children]]
//! name = "quotes-in"
//! port = 7101
//! implementation = "topic-publisher"
//! role = "publisher"
//! attributes = { topic = "quotes" }
//! ```

use std::sync::Arc;

use dashmap::DashMap;
use svhost_protocol::{HostError, HostResult, ServiceConfig};
use svhost_server::{Service, ServiceHandle, ServiceManager};
use svhost_transport::Connection;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub const IMPLEMENTATION: &str = "topic";
pub const PUBLISHER: &str = "topic-publisher";
pub const SUBSCRIBER: &str = "topic-subscriber";

const DEFAULT_TOPIC: &str = "default";
const CHANNEL_CAPACITY: usize = 256;

/// Named broadcast channels, created on first use.
#[derive(Default)]
pub struct TopicBus {
    topics: DashMap<String, broadcast::Sender<String>>,
}

impl TopicBus {
    fn sender(&self, topic: &str) -> broadcast::Sender<String> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Returns the number of subscribers the message reached.
    pub fn publish(&self, topic: &str, message: String) -> usize {
        self.sender(topic).send(message).unwrap_or(0)
    }

    pub fn subscribe(&self, topic: &str) -> broadcast::Receiver<String> {
        self.sender(topic).subscribe()
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// Register the parent and both child implementations around one bus.
pub fn register(manager: &ServiceManager) {
    let bus = Arc::new(TopicBus::default());

    let parent_bus = bus.clone();
    manager.register_factory(IMPLEMENTATION, move |_config: &ServiceConfig| {
        Ok(TopicService {
            bus: parent_bus.clone(),
        })
    });
    let publisher_bus = bus.clone();
    manager.register_factory(PUBLISHER, move |config: &ServiceConfig| {
        Ok(TopicPublisher::new(publisher_bus.clone(), config))
    });
    manager.register_factory(SUBSCRIBER, move |config: &ServiceConfig| {
        Ok(TopicSubscriber::new(bus.clone(), config))
    });
}

fn topic_of(config: &ServiceConfig) -> String {
    config.attr_string_or("topic", DEFAULT_TOPIC)
}

// ─────────────────────────────────────────────────────────────────────────────
// Parent
// ─────────────────────────────────────────────────────────────────────────────

/// Answers `<topic>` with its subscriber count and an empty line with the
/// list of known topics.
pub struct TopicService {
    bus: Arc<TopicBus>,
}

impl Service for TopicService {
    async fn serve(&self, svc: &ServiceHandle, mut conn: Connection) -> HostResult<()> {
        loop {
            let line = tokio::select! {
                _ = svc.stopped() => break,
                line = conn.read_line() => line?,
            };
            let Some(line) = line else { break };
            svc.record_received();
            let topic = line.trim();
            let reply = if topic.is_empty() {
                format!("topics {}", self.bus.topics().join(","))
            } else {
                format!("topic {topic} subscribers {}", self.bus.subscriber_count(topic))
            };
            conn.write_line(&reply).await?;
            svc.record_sent();
        }
        conn.close().await;
        Ok(())
    }

    /// Fails while any declared publisher or subscriber child is down.
    async fn validate(&self, svc: &ServiceHandle) -> HostResult<()> {
        for child in &svc.config().children {
            let running = svc.child(child.port).is_some_and(|c| c.is_running());
            if !running {
                return Err(HostError::validation_failed(
                    svc.name(),
                    format!("child '{}' on port {} is not running", child.name, child.port),
                ));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Publisher
// ─────────────────────────────────────────────────────────────────────────────

pub struct TopicPublisher {
    bus: Arc<TopicBus>,
    topic: String,
}

impl TopicPublisher {
    pub fn new(bus: Arc<TopicBus>, config: &ServiceConfig) -> Self {
        Self {
            bus,
            topic: topic_of(config),
        }
    }
}

impl Service for TopicPublisher {
    async fn serve(&self, svc: &ServiceHandle, mut conn: Connection) -> HostResult<()> {
        loop {
            let line = tokio::select! {
                _ = svc.stopped() => break,
                line = conn.read_line() => line?,
            };
            let Some(line) = line else { break };
            svc.record_received();
            let reached = self.bus.publish(&self.topic, line);
            debug!("Topic '{}': message reached {reached} subscriber(s)", self.topic);
            conn.write_line(&format!("ack {reached}")).await?;
            svc.record_sent();
        }
        conn.close().await;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Subscriber
// ─────────────────────────────────────────────────────────────────────────────

pub struct TopicSubscriber {
    bus: Arc<TopicBus>,
    topic: String,
}

impl TopicSubscriber {
    pub fn new(bus: Arc<TopicBus>, config: &ServiceConfig) -> Self {
        Self {
            bus,
            topic: topic_of(config),
        }
    }
}

/// Aborts the wrapped task when dropped, so an aborted serve task takes its
/// auxiliary reader down with it.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Service for TopicSubscriber {
    async fn serve(&self, svc: &ServiceHandle, mut conn: Connection) -> HostResult<()> {
        let mut messages = self.bus.subscribe(&self.topic);
        let Some((mut reader, mut writer)) = conn.take_split() else {
            return Err(HostError::Config(format!(
                "topic subscriber '{}' needs a socket connection",
                svc.name()
            )));
        };

        let acks = svc.clone();
        let mut ack_reader = AbortOnDrop(tokio::spawn(async move {
            while let Ok(Some(ack)) = reader.read_line().await {
                acks.record_received();
                debug!("Subscriber '{}' ack: {ack}", acks.name());
            }
        }));

        loop {
            tokio::select! {
                _ = svc.stopped() => break,
                // Client hung up.
                _ = &mut ack_reader.0 => break,
                message = messages.recv() => match message {
                    Ok(message) => {
                        if writer.write_line(&message).await.is_err() {
                            break;
                        }
                        svc.record_sent();
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Subscriber '{}' lagged, skipped {skipped} message(s)", svc.name());
                        svc.record_error();
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        writer.shutdown().await;
        Ok(())
    }
}
