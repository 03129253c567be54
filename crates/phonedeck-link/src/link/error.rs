//! Link-specific error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised link error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkError {
    pub kind: LinkErrorKind,
    pub message: String,
    /// Device the failure happened on, if known.
    pub port_name: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum LinkErrorKind {
    /// The device could not be opened or claimed (busy, missing,
    /// unsupported settings).
    ConnectionError,
    /// Send / receive failed on an open connection, or local file I/O failed.
    IoError,
    /// The retry budget ran out without a non-empty reply.
    NoAnswer,
    /// A reply could not be decoded.
    ParseError,
    /// Connection parameters or operation arguments are out of range.
    InvalidParameters,
}

pub type LinkResult<T> = Result<T, LinkError>;

// ── Construction helpers ─────────────────────────────────────────────

impl LinkError {
    pub fn new(kind: LinkErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            port_name: None,
        }
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port_name = Some(port.into());
        self
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::ConnectionError, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::IoError, msg)
    }

    pub fn no_answer(command: &str, trials: u32) -> Self {
        Self::new(
            LinkErrorKind::NoAnswer,
            format!("no answer to '{}' after {} trials", command, trials),
        )
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::ParseError, msg)
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::new(LinkErrorKind::InvalidParameters, msg)
    }

    pub fn is_no_answer(&self) -> bool {
        self.kind == LinkErrorKind::NoAnswer
    }

    /// Bracketed diagnostic rendered in place of a reply.
    pub fn placeholder(&self) -> String {
        format!("<Exception: {}>", self.message)
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.port_name {
            Some(port) => write!(f, "[{:?}] {}: {}", self.kind, port, self.message),
            None => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<std::io::Error> for LinkError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<serialport::Error> for LinkError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::Io(_) => Self::io(e.to_string()),
            serialport::ErrorKind::InvalidInput => Self::invalid(e.to_string()),
            _ => Self::connection(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for LinkError {
    fn from(e: serde_json::Error) -> Self {
        Self::invalid(format!("invalid configuration: {}", e))
    }
}

impl From<LinkError> for String {
    fn from(e: LinkError) -> String {
        e.to_string()
    }
}
