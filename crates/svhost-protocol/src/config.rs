//! Service configuration model and host configuration documents.
//!
//! A [`HostConfig`] document holds host-wide settings and a list of
//! [`ServiceConfig`]s. Documents are TOML or JSON:
//!
//! ```toml
//! max_connections = 200
//! delayed_start_ms = 5000
//!
//! [[service]]
//! name = "control"
//! port = 7000
//! implementation = "control"
//! startup = "system"
//!
//! [service.attributes]
//! password = "secret"
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::command::Override;
use crate::error::{HostError, HostResult};

// ─────────────────────────────────────────────────────────────────────────────
// Enumerations
// ─────────────────────────────────────────────────────────────────────────────

/// Whether a service accepts inbound sockets (server) or only runs its own
/// internal workers (client).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    #[default]
    #[serde(alias = "SERVER")]
    Server,
    #[serde(alias = "CLIENT")]
    Client,
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("SERVER"),
            Self::Client => f.write_str("CLIENT"),
        }
    }
}

/// When a registered service is started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartupPolicy {
    /// Started as soon as it is registered.
    #[default]
    #[serde(alias = "AUTOMATIC")]
    Automatic,
    /// Registered immediately, started by the later delayed-start pass.
    #[serde(alias = "DELAYEDSTART", alias = "delayed_start")]
    DelayedStart,
    /// Started only on explicit command.
    #[serde(alias = "MANUAL")]
    Manual,
    /// Started on registration and cannot be stopped remotely.
    #[serde(alias = "SYSTEM")]
    System,
    /// Never instantiated.
    #[serde(alias = "DISABLED")]
    Disabled,
}

impl StartupPolicy {
    /// Policies that start the service as part of registration.
    pub fn starts_on_add(&self) -> bool {
        matches!(self, Self::Automatic | Self::System)
    }
}

impl fmt::Display for StartupPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Automatic => "AUTOMATIC",
            Self::DelayedStart => "DELAYEDSTART",
            Self::Manual => "MANUAL",
            Self::System => "SYSTEM",
            Self::Disabled => "DISABLED",
        };
        f.write_str(s)
    }
}

impl FromStr for StartupPolicy {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "automatic" => Ok(Self::Automatic),
            "delayedstart" | "delayed_start" => Ok(Self::DelayedStart),
            "manual" => Ok(Self::Manual),
            "system" => Ok(Self::System),
            "disabled" => Ok(Self::Disabled),
            other => Err(HostError::Config(format!("unknown startup policy '{other}'"))),
        }
    }
}

/// Role of a nested child service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChildRole {
    #[serde(alias = "sub")]
    Subscriber,
    #[serde(alias = "pub")]
    Publisher,
}

impl ChildRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscriber => "subscriber",
            Self::Publisher => "publisher",
        }
    }
}

impl fmt::Display for ChildRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChildRole {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sub" | "subscriber" => Ok(Self::Subscriber),
            "pub" | "publisher" => Ok(Self::Publisher),
            other => Err(HostError::Config(format!("unknown child role '{other}'"))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// ServiceConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Description of one service. `Clone` is a deep copy, so a derived config
/// never shares its attribute map with the config it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub port: u16,
    /// Factory key used to construct the implementation.
    pub implementation: String,
    #[serde(rename = "type", default)]
    pub service_type: ServiceType,
    #[serde(default)]
    pub startup: StartupPolicy,
    /// 0 means unlimited.
    #[serde(default)]
    pub max_connections: usize,
    #[serde(default)]
    pub ignore_connection_limit: bool,
    /// Set on nested child configs only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ChildRole>,
    #[serde(default, deserialize_with = "attribute_map")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ServiceConfig>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>, port: u16, implementation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port,
            implementation: implementation.into(),
            service_type: ServiceType::Server,
            startup: StartupPolicy::Automatic,
            max_connections: 0,
            ignore_connection_limit: false,
            role: None,
            attributes: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn with_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = service_type;
        self
    }

    pub fn with_startup(mut self, startup: StartupPolicy) -> Self {
        self.startup = startup;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_child(mut self, role: ChildRole, mut child: ServiceConfig) -> Self {
        child.role = Some(role);
        self.children.push(child);
        self
    }

    /// Check the fields the registry depends on.
    pub fn validate(&self) -> HostResult<()> {
        if self.name.trim().is_empty() {
            return Err(HostError::Config("service name must not be empty".into()));
        }
        if self.implementation.trim().is_empty() {
            return Err(HostError::Config(format!(
                "service '{}' has no implementation",
                self.name
            )));
        }
        if self.port == 0 {
            return Err(HostError::Config(format!("service '{}' has no port", self.name)));
        }
        let mut child_ports = HashSet::new();
        for child in &self.children {
            child.validate()?;
            if !child_ports.insert(child.port) {
                return Err(HostError::Config(format!(
                    "service '{}' declares two children on port {}",
                    self.name, child.port
                )));
            }
        }
        Ok(())
    }

    // ── Attributes ────────────────────────────────────────────────────────

    pub fn attribute(&self, key: &str) -> HostResult<&str> {
        self.attributes
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| HostError::AttributeNotFound(key.to_string()))
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Typed attribute lookup; falls back to `default` (with a warning when
    /// the stored value does not parse).
    pub fn attr_or<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        parse_or_default(&self.name, key, self.attributes.get(key).map(String::as_str), default)
    }

    pub fn attr_string_or(&self, key: &str, default: &str) -> String {
        self.attributes
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    pub fn attr_bool_or(&self, key: &str, default: bool) -> bool {
        let Some(raw) = self.attributes.get(key) else {
            return default;
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => true,
            "false" | "no" | "off" | "0" => false,
            _ => {
                warn!(
                    "Service '{}': attribute {key}='{raw}' is not a boolean, using {default}",
                    self.name
                );
                default
            }
        }
    }

    /// Millisecond attribute as a `Duration`.
    pub fn attr_millis_or(&self, key: &str, default: Duration) -> Duration {
        let ms = self.attr_or::<u64>(key, default.as_millis() as u64);
        Duration::from_millis(ms)
    }

    /// Comma-separated list attribute. Missing key yields an empty list.
    pub fn attr_list(&self, key: &str) -> Vec<String> {
        self.attributes
            .get(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    // ── Derivation ────────────────────────────────────────────────────────

    /// Derive a new config from this one with a new identity and overrides.
    ///
    /// Child overrides of a role replace the inherited children of that role;
    /// the first inherited child of the role serves as a template.
    pub fn derive(&self, name: &str, port: u16, overrides: &[Override]) -> ServiceConfig {
        let mut derived = self.clone();
        derived.name = name.to_string();
        derived.port = port;

        let overridden_roles: HashSet<ChildRole> = overrides
            .iter()
            .filter_map(|ov| match ov {
                Override::Child { role, .. } => Some(*role),
                Override::Attribute { .. } => None,
            })
            .collect();
        derived
            .children
            .retain(|c| c.role.is_none_or(|r| !overridden_roles.contains(&r)));

        for ov in overrides {
            derived.apply_override(ov, self);
        }

        for child in &mut derived.children {
            let role = child.role.map(|r| r.as_str()).unwrap_or("child");
            child.name = format!("{name}-{role}-{}", child.port);
        }
        derived
    }

    fn apply_override(&mut self, ov: &Override, template_source: &ServiceConfig) {
        match ov {
            Override::Attribute { key, value } => {
                self.attributes.insert(key.clone(), value.clone());
            }
            Override::Child { role, port, key, value } => {
                if let Some(child) = self
                    .children
                    .iter_mut()
                    .find(|c| c.role == Some(*role) && c.port == *port)
                {
                    child.attributes.insert(key.clone(), value.clone());
                    return;
                }
                let mut child = template_source
                    .children
                    .iter()
                    .find(|c| c.role == Some(*role))
                    .cloned()
                    .unwrap_or_else(|| {
                        ServiceConfig::new(
                            "",
                            *port,
                            format!("{}-{}", template_source.implementation, role),
                        )
                    });
                child.port = *port;
                child.role = Some(*role);
                child.attributes.insert(key.clone(), value.clone());
                self.children.push(child);
            }
        }
    }
}

/// Parse an optional raw attribute value, logging and falling back to
/// `default` when it is present but malformed.
pub fn parse_or_default<T>(owner: &str, key: &str, raw: Option<&str>, default: T) -> T
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(e) => {
            warn!("Service '{owner}': attribute {key}='{raw}' is invalid ({e}), using default");
            default
        }
    }
}

/// Accept scalar TOML/JSON values in the attribute table and keep them as strings.
fn attribute_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Bool(bool),
        Int(i64),
        Float(f64),
    }

    let raw = BTreeMap::<String, Scalar>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                Scalar::Text(s) => s,
                Scalar::Bool(b) => b.to_string(),
                Scalar::Int(i) => i.to_string(),
                Scalar::Float(f) => f.to_string(),
            };
            (k, v)
        })
        .collect())
}

// ─────────────────────────────────────────────────────────────────────────────
// HostConfig
// ─────────────────────────────────────────────────────────────────────────────

/// A configuration document: host settings plus the services to register.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Global connection cap (0 = unlimited).
    #[serde(default)]
    pub max_connections: usize,
    /// Delay before the delayed-start pass runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delayed_start_ms: Option<u64>,
    #[serde(default, rename = "service", alias = "services")]
    pub services: Vec<ServiceConfig>,
}

impl HostConfig {
    /// Load a document from disk. `.toml` files are TOML, anything else JSON.
    pub fn load(path: &Path) -> HostResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            HostError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let is_toml = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("toml"));
        if is_toml {
            Self::from_toml_str(&text)
        } else {
            Self::from_json_str(&text)
        }
    }

    pub fn from_toml_str(text: &str) -> HostResult<Self> {
        let config: HostConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> HostResult<Self> {
        let config: HostConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> HostResult<()> {
        for service in &self.services {
            service.validate()?;
        }
        Ok(())
    }
}
