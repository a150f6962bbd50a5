//! Bundled service implementations.
//!
//! Each module exposes the implementation identifier it registers under and
//! a `from_config` constructor. [`register_builtin`] installs all of them,
//! plus the control service, into a manager's factory registry.

pub mod daytime;
pub mod echo;
pub mod topic;
pub mod watchdog;

use svhost_server::{ControlService, ServiceManager, control};

pub use daytime::DaytimeService;
pub use echo::EchoService;
pub use topic::{TopicBus, TopicPublisher, TopicService, TopicSubscriber};
pub use watchdog::WatchdogService;

/// Register every bundled implementation with `manager`.
pub fn register_builtin(manager: &ServiceManager) {
    manager.register_factory(control::IMPLEMENTATION, ControlService::from_config);
    manager.register_factory(echo::IMPLEMENTATION, EchoService::from_config);
    manager.register_factory(daytime::IMPLEMENTATION, DaytimeService::from_config);
    manager.register_factory(watchdog::IMPLEMENTATION, WatchdogService::from_config);
    topic::register(manager);
}
