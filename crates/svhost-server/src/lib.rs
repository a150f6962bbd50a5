//! svhost server: the service hosting framework.
//!
//! Owns the registry of hosted services, their lifecycle and connection
//! admission, and the control-protocol service that manages them at runtime.

pub mod control;
pub mod events;
pub mod manager;
pub mod service;
pub mod status;
pub mod unit;

pub use control::ControlService;
pub use events::{LifecycleEvent, ServiceEvent};
pub use manager::ServiceManager;
pub use service::Service;
pub use status::{ServiceState, ServiceStatus};
pub use unit::{ServiceHandle, ServiceId};
