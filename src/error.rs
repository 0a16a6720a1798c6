//! Error types for tether
//!
//! Every error carries a retriable/non-retriable classification that
//! upstream retry policies key off via [`Error::is_retriable`].

use serde_json::Value;
use thiserror::Error;

/// Result type for tether operations
pub type Result<T> = std::result::Result<T, Error>;

/// How a failed navigation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationError {
    /// The document load completed with an HTTP error status
    HttpStatus(i64),
    /// The load failed at the network level (DNS, TLS, aborted, ...)
    Net(String),
}

impl std::fmt::Display for NavigationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NavigationError::HttpStatus(status) => write!(f, "HTTP status {}", status),
            NavigationError::Net(text) => write!(f, "{}", text),
        }
    }
}

/// Error type for tether
#[derive(Debug, Error)]
pub enum Error {
    /// No connection has been established yet
    #[error("not connected to a browser endpoint")]
    NotConnected,

    /// The connection dropped (explicit disconnect or dead channel)
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// The browser rejected a command
    #[error("command {method} failed: {message}")]
    CommandFailed {
        method: String,
        message: String,
        /// Parameters the command was sent with, for diagnostics
        params: Value,
    },

    /// A command reply did not arrive within its deadline
    #[error("command {method} timed out after {timeout_ms}ms")]
    CommandTimeout { method: String, timeout_ms: u64 },

    /// A created target never completed its attach within the budget
    #[error("target {target_id} did not attach within {timeout_ms}ms")]
    AttachTimeout { target_id: String, timeout_ms: u64 },

    /// A frame lifecycle wait hit its deadline
    #[error("navigation in frame {frame_id} timed out after {timeout_ms}ms")]
    NavigationTimeout { frame_id: String, timeout_ms: u64 },

    /// Unknown or destroyed target session
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// The target detached while commands were in flight
    #[error("target detached: {0}")]
    TargetDetached(String),

    /// The target crashed; in-flight work for it is lost
    #[error("target crashed: {0}")]
    TargetCrashed(String),

    /// The frame's document load failed
    #[error("navigation failed in frame {frame_id}: {reason}")]
    NavigationFailed {
        frame_id: String,
        reason: NavigationError,
    },

    /// Remote evaluation raised an exception
    #[error("evaluation failed: {0}")]
    Evaluation(String),

    /// No scripting context is ready for the frame
    #[error("no scripting context for frame {0}")]
    NoContext(String),

    /// Frame not found in the tree
    #[error("frame not found: {0}")]
    FrameNotFound(String),

    /// Transport error
    #[error("transport error: {context}")]
    Transport {
        context: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Decode error (e.g., base64)
    #[error("decode error: {0}")]
    Decode(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a transport error with context
    pub fn transport(context: impl Into<String>) -> Self {
        Self::Transport {
            context: context.into(),
            source: None,
        }
    }

    /// Create a transport error with IO source
    pub fn transport_io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Transport {
            context: context.into(),
            source: Some(source),
        }
    }

    /// Create a command-failed error carrying the method and params
    pub fn command_failed(
        method: impl Into<String>,
        message: impl Into<String>,
        params: Value,
    ) -> Self {
        Self::CommandFailed {
            method: method.into(),
            message: message.into(),
            params,
        }
    }

    /// Create a navigation-failed error for an HTTP error status
    pub fn http_failure(frame_id: impl Into<String>, status: i64) -> Self {
        Self::NavigationFailed {
            frame_id: frame_id.into(),
            reason: NavigationError::HttpStatus(status),
        }
    }

    /// Create a navigation-failed error for a network-level failure
    pub fn net_failure(frame_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::NavigationFailed {
            frame_id: frame_id.into(),
            reason: NavigationError::Net(text.into()),
        }
    }

    /// Whether upstream retry policy may retry the failed operation.
    ///
    /// Timeouts are intentional limits, crashes are fatal to the target,
    /// and navigation failures need a caller decision; everything driven
    /// by transient remote state is retriable.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::NotConnected
            | Error::Disconnected(_)
            | Error::CommandFailed { .. }
            | Error::InvalidTarget(_)
            | Error::TargetDetached(_)
            | Error::Evaluation(_)
            | Error::NoContext(_)
            | Error::FrameNotFound(_)
            | Error::AttachTimeout { .. }
            | Error::Transport { .. } => true,
            Error::CommandTimeout { .. }
            | Error::NavigationTimeout { .. }
            | Error::TargetCrashed(_)
            | Error::NavigationFailed { .. }
            | Error::Serialization(_)
            | Error::Decode(_)
            | Error::Io(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retriable_classification() {
        assert!(Error::NotConnected.is_retriable());
        assert!(Error::Disconnected("reader closed".into()).is_retriable());
        assert!(Error::command_failed("Page.navigate", "no such frame", json!({})).is_retriable());
        assert!(Error::TargetDetached("sess-1".into()).is_retriable());
        assert!(Error::Evaluation("node detached".into()).is_retriable());
        assert!(Error::NoContext("frame-1".into()).is_retriable());
        assert!(Error::AttachTimeout {
            target_id: "t1".into(),
            timeout_ms: 1000
        }
        .is_retriable());

        assert!(!Error::CommandTimeout {
            method: "Page.navigate".into(),
            timeout_ms: 30_000
        }
        .is_retriable());
        assert!(!Error::TargetCrashed("sess-1".into()).is_retriable());
        assert!(!Error::http_failure("frame-1", 404).is_retriable());
        assert!(!Error::net_failure("frame-1", "net::ERR_NAME_NOT_RESOLVED").is_retriable());
        assert!(!Error::NavigationTimeout {
            frame_id: "frame-1".into(),
            timeout_ms: 500
        }
        .is_retriable());
    }

    #[test]
    fn command_failed_keeps_diagnostics() {
        let err = Error::command_failed(
            "Target.attachToTarget",
            "No target with given id",
            json!({"targetId": "abc"}),
        );
        match err {
            Error::CommandFailed { method, params, .. } => {
                assert_eq!(method, "Target.attachToTarget");
                assert_eq!(params["targetId"], "abc");
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn navigation_error_display() {
        let err = Error::http_failure("f", 503);
        assert!(err.to_string().contains("HTTP status 503"));
        let err = Error::net_failure("f", "net::ERR_ABORTED");
        assert!(err.to_string().contains("net::ERR_ABORTED"));
    }
}
