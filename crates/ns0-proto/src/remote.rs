//! Marshalled remote errors.
//!
//! A handler failure on the slave travels back as a 550 reply whose body
//! is one or more `#`-prefixed comment lines (human-readable summary)
//! followed by base64 of the JSON encoding of [`RemoteError`]. The client
//! decodes it and re-raises a native error, keeping the remote trace as a
//! diagnostic field.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::{ProtoError, Result};

/// Classification of a remote failure, mapped back to a native error kind
/// on the client side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    /// An OS-level failure; `errno` is set when known.
    Os,
    /// Invalid argument values.
    Value,
    /// A lookup for an unknown key (pid, interface, …).
    Key,
    /// Wire-protocol violation detected while serving.
    Protocol,
    /// An external command exited non-zero.
    Command,
    /// Anything else.
    Runtime,
}

/// The tagged union carried inside a 550 reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
    pub message: String,
    /// Free-form rendering of the remote failure context.
    #[serde(default)]
    pub remote_trace: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            errno: None,
            message: message.into(),
            remote_trace: String::new(),
        }
    }

    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.remote_trace = trace.into();
        self
    }

    /// Render the 550 reply body: summary comment, then the payload.
    pub fn to_reply_body(&self) -> String {
        let summary = self.message.split('\n').next().unwrap_or_default();
        let payload = serde_json::to_string(self).unwrap_or_else(|_| {
            // Fallback for a value that cannot serialise itself; the
            // struct is plain data so this only guards corruption.
            String::from("{\"kind\":\"runtime\",\"message\":\"unserialisable error\"}")
        });
        format!("# {:?} {}\n{}", self.kind, summary, STANDARD.encode(payload))
    }

    /// Decode the body of a 550 reply (comment lines skipped).
    pub fn from_reply_body(lines: &[String]) -> Result<Self> {
        let b64: String = lines
            .iter()
            .filter(|l| !l.starts_with('#'))
            .map(String::as_str)
            .collect();
        let raw = STANDARD
            .decode(b64.trim())
            .map_err(|e| ProtoError::BadRemoteError(e.to_string()))?;
        serde_json::from_slice(&raw).map_err(|e| ProtoError::BadRemoteError(e.to_string()))
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "remote {:?} error: {}", self.kind, self.message)?;
        if let Some(errno) = self.errno {
            write!(f, " (errno {errno})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RemoteError {}
