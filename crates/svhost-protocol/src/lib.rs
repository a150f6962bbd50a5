//! svhost protocol and configuration types.
//!
//! This crate is the single source of truth for the data the host passes
//! between layers: service configurations, the control-protocol command
//! grammar, control status codes, and the shared error type.

pub mod command;
pub mod config;
pub mod error;
pub mod status;

pub use command::{AddRequest, Command, CommandError, CommandName, Override};
pub use config::{
    ChildRole, HostConfig, ServiceConfig, ServiceType, StartupPolicy, parse_or_default,
};
pub use error::{HostError, HostResult};
pub use status::{StatusCode, StatusCodes};

/// Message written to a client whose connection is refused by admission control.
pub const BUSY_MESSAGE: &str = "Connection refused; the server is busy; please try again later";

/// Default record terminator for line-oriented services.
pub const DEFAULT_TERMINATOR: &str = "\r\n";
