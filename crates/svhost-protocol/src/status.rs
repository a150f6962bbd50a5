//! Control-protocol status codes.
//!
//! Every control command ends with exactly one status line. The semantic slots
//! are fixed; the strings written on the wire are configurable per control
//! service.

use std::collections::BTreeMap;

/// Fixed semantic slots for the terminal status line of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    InvalidContent,
    Unauthorized,
    RequestTimeout,
    DatabaseError,
    SystemError,
}

impl StatusCode {
    pub const ALL: [StatusCode; 6] = [
        Self::Ok,
        Self::InvalidContent,
        Self::Unauthorized,
        Self::RequestTimeout,
        Self::DatabaseError,
        Self::SystemError,
    ];

    /// Attribute key used to override this slot's wire string.
    pub fn attribute_key(&self) -> &'static str {
        match self {
            Self::Ok => "status.ok",
            Self::InvalidContent => "status.invalid_content",
            Self::Unauthorized => "status.unauthorized",
            Self::RequestTimeout => "status.request_timeout",
            Self::DatabaseError => "status.database_error",
            Self::SystemError => "status.system_error",
        }
    }

    pub fn default_text(&self) -> &'static str {
        match self {
            Self::Ok => "200 OK",
            Self::InvalidContent => "400 INVALID CONTENT",
            Self::Unauthorized => "401 UNAUTHORIZED",
            Self::RequestTimeout => "408 REQUEST TIMEOUT",
            Self::DatabaseError => "502 DATABASE ERROR",
            Self::SystemError => "500 SYSTEM ERROR",
        }
    }
}

/// The wire strings for each status slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCodes {
    ok: String,
    invalid_content: String,
    unauthorized: String,
    request_timeout: String,
    database_error: String,
    system_error: String,
}

impl Default for StatusCodes {
    fn default() -> Self {
        Self {
            ok: StatusCode::Ok.default_text().into(),
            invalid_content: StatusCode::InvalidContent.default_text().into(),
            unauthorized: StatusCode::Unauthorized.default_text().into(),
            request_timeout: StatusCode::RequestTimeout.default_text().into(),
            database_error: StatusCode::DatabaseError.default_text().into(),
            system_error: StatusCode::SystemError.default_text().into(),
        }
    }
}

impl StatusCodes {
    /// Build the table from service attributes, keeping defaults for any
    /// slot that is not overridden.
    pub fn from_attributes(attributes: &BTreeMap<String, String>) -> Self {
        let mut codes = Self::default();
        for code in StatusCode::ALL {
            if let Some(text) = attributes.get(code.attribute_key()) {
                let text = text.trim();
                if !text.is_empty() {
                    *codes.slot_mut(code) = text.to_string();
                }
            }
        }
        codes
    }

    pub fn text(&self, code: StatusCode) -> &str {
        match code {
            StatusCode::Ok => &self.ok,
            StatusCode::InvalidContent => &self.invalid_content,
            StatusCode::Unauthorized => &self.unauthorized,
            StatusCode::RequestTimeout => &self.request_timeout,
            StatusCode::DatabaseError => &self.database_error,
            StatusCode::SystemError => &self.system_error,
        }
    }

    fn slot_mut(&mut self, code: StatusCode) -> &mut String {
        match code {
            StatusCode::Ok => &mut self.ok,
            StatusCode::InvalidContent => &mut self.invalid_content,
            StatusCode::Unauthorized => &mut self.unauthorized,
            StatusCode::RequestTimeout => &mut self.request_timeout,
            StatusCode::DatabaseError => &mut self.database_error,
            StatusCode::SystemError => &mut self.system_error,
        }
    }
}
