//! Control-protocol command grammar.
//!
//! One command per line. The first whitespace-separated token, lower-cased,
//! selects the command; the rest of the line is its arguments:
//!
//! ```text
//! password <string>
//! add <serviceName> <newServiceName> <port> [<key=value>|<sub|pub:port:key=value> ...]
//! add <path/to/config>
//! add xml <inline-package>
//! remove <port> [<port> ...]
//! stop <port> [<port> ...]
//! start <port> [<port> ...]
//! max <intValue>
//! status
//! help
//! quit
//! ```

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ChildRole;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("{command}: missing {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("invalid override '{0}'")]
    InvalidOverride(String),
}

/// Command keywords, in the order `help` lists them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandName {
    Password,
    Add,
    Remove,
    Stop,
    Start,
    Max,
    Status,
    Help,
    Quit,
}

impl CommandName {
    pub const ALL: [CommandName; 9] = [
        Self::Password,
        Self::Add,
        Self::Remove,
        Self::Stop,
        Self::Start,
        Self::Max,
        Self::Status,
        Self::Help,
        Self::Quit,
    ];

    /// Look up a keyword, ignoring case.
    pub fn from_token(token: &str) -> Option<Self> {
        let token = token.to_ascii_lowercase();
        Self::ALL.into_iter().find(|name| name.as_str() == token)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Stop => "stop",
            Self::Start => "start",
            Self::Max => "max",
            Self::Status => "status",
            Self::Help => "help",
            Self::Quit => "quit",
        }
    }

    /// Usage lines shown by `help`.
    pub fn usage(&self) -> &'static [&'static str] {
        match self {
            Self::Password => &["password <string>"],
            Self::Add => &[
                "add <serviceName> <newServiceName> <port> [<key=value>|<sub|pub:port:key=value> ...]",
                "add <path/to/config>",
                "add xml <inline-package>",
            ],
            Self::Remove => &["remove <port> [<port> ...]"],
            Self::Stop => &["stop <port> [<port> ...]"],
            Self::Start => &["start <port> [<port> ...]"],
            Self::Max => &["max <intValue>"],
            Self::Status => &["status"],
            Self::Help => &["help"],
            Self::Quit => &["quit"],
        }
    }

    /// Commands an unauthenticated session may issue.
    pub fn requires_auth(&self) -> bool {
        !matches!(self, Self::Password | Self::Help | Self::Quit)
    }
}

/// An override applied to a config derived by `add <name> <new> <port> ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Override {
    /// `key=value` on the new service itself.
    Attribute { key: String, value: String },
    /// `sub:port:key=value` / `pub:port:key=value` on a nested child.
    Child {
        role: ChildRole,
        port: u16,
        key: String,
        value: String,
    },
}

impl Override {
    pub fn parse(token: &str) -> Result<Self, CommandError> {
        let invalid = || CommandError::InvalidOverride(token.to_string());

        if let Some((prefix, rest)) = token.split_once(':') {
            if let Ok(role) = prefix.parse::<ChildRole>() {
                let (port, assignment) = rest.split_once(':').ok_or_else(invalid)?;
                let port = parse_port(port)?;
                let (key, value) = assignment.split_once('=').ok_or_else(invalid)?;
                if key.is_empty() {
                    return Err(invalid());
                }
                return Ok(Self::Child {
                    role,
                    port,
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }

        let (key, value) = token.split_once('=').ok_or_else(invalid)?;
        if key.is_empty() {
            return Err(invalid());
        }
        Ok(Self::Attribute {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

/// The three forms of `add`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddRequest {
    /// Derive a new service from an existing one.
    Derive {
        source: String,
        name: String,
        port: u16,
        overrides: Vec<Override>,
    },
    /// Load services from a configuration file.
    File(PathBuf),
    /// Load services from an inline one-line package.
    Inline(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Password(String),
    Add(AddRequest),
    Remove(Vec<u16>),
    Stop(Vec<u16>),
    Start(Vec<u16>),
    Max(usize),
    Status,
    Help,
    Quit,
}

impl Command {
    /// Split a line into its keyword and the raw argument text.
    pub fn split(line: &str) -> Result<(CommandName, &str), CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(CommandError::Empty);
        }
        let (token, rest) = match line.split_once(char::is_whitespace) {
            Some((token, rest)) => (token, rest.trim()),
            None => (line, ""),
        };
        let name =
            CommandName::from_token(token).ok_or_else(|| CommandError::Unknown(token.into()))?;
        Ok((name, rest))
    }

    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let (name, rest) = Self::split(line)?;
        Self::from_parts(name, rest)
    }

    /// Parse the arguments of an already-identified command.
    pub fn from_parts(name: CommandName, rest: &str) -> Result<Self, CommandError> {
        match name {
            CommandName::Password => {
                if rest.is_empty() {
                    return Err(CommandError::MissingArgument {
                        command: "password",
                        argument: "password",
                    });
                }
                Ok(Self::Password(rest.to_string()))
            }
            CommandName::Add => parse_add(rest).map(Self::Add),
            CommandName::Remove => parse_ports("remove", rest).map(Self::Remove),
            CommandName::Stop => parse_ports("stop", rest).map(Self::Stop),
            CommandName::Start => parse_ports("start", rest).map(Self::Start),
            CommandName::Max => {
                let value = rest.split_whitespace().next().ok_or(CommandError::MissingArgument {
                    command: "max",
                    argument: "value",
                })?;
                value
                    .parse::<usize>()
                    .map(Self::Max)
                    .map_err(|_| CommandError::InvalidNumber(value.to_string()))
            }
            CommandName::Status => Ok(Self::Status),
            CommandName::Help => Ok(Self::Help),
            CommandName::Quit => Ok(Self::Quit),
        }
    }
}

fn parse_add(rest: &str) -> Result<AddRequest, CommandError> {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    match tokens.as_slice() {
        [] => Err(CommandError::MissingArgument {
            command: "add",
            argument: "service or configuration",
        }),
        [keyword, ..] if keyword.eq_ignore_ascii_case("xml") => {
            let package = rest[keyword.len()..].trim();
            if package.is_empty() {
                return Err(CommandError::MissingArgument {
                    command: "add",
                    argument: "inline package",
                });
            }
            Ok(AddRequest::Inline(package.to_string()))
        }
        [path] => Ok(AddRequest::File(PathBuf::from(path))),
        [_, _] => Err(CommandError::MissingArgument {
            command: "add",
            argument: "port",
        }),
        [source, name, port, overrides @ ..] => Ok(AddRequest::Derive {
            source: source.to_string(),
            name: name.to_string(),
            port: parse_port(port)?,
            overrides: overrides
                .iter()
                .map(|t| Override::parse(t))
                .collect::<Result<_, _>>()?,
        }),
    }
}

fn parse_ports(command: &'static str, rest: &str) -> Result<Vec<u16>, CommandError> {
    let ports = rest
        .split_whitespace()
        .map(parse_port)
        .collect::<Result<Vec<_>, _>>()?;
    if ports.is_empty() {
        return Err(CommandError::MissingArgument {
            command,
            argument: "port",
        });
    }
    Ok(ports)
}

fn parse_port(token: &str) -> Result<u16, CommandError> {
    match token.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(CommandError::InvalidPort(token.to_string())),
    }
}
