//! Error types for the controller manager
//!
//! Errors are structured with fields to aid debugging in production.
//! Variants carry the runnable name or configuration field involved so that
//! a single log line is enough to locate the failure.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for manager, runnable and reconciler operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid value passed to a constructor or found in a resource spec
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "interval")
        field: Option<String>,
    },

    /// Invalid or missing process configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's wrong
        message: String,
    },

    /// A runnable could not be added to the manager
    #[error("failed to register runnable {runnable}: {message}")]
    Registration {
        /// Name of the runnable being registered
        runnable: String,
        /// Why registration was refused
        message: String,
    },

    /// A runnable failed while running
    #[error("runnable {runnable} failed: {message}")]
    Runnable {
        /// Name of the failing runnable
        runnable: String,
        /// Description of the failure
        message: String,
    },

    /// Lease API failure during leader election
    #[error("leader election error: {message}")]
    LeaderElection {
        /// Description of what failed
        message: String,
    },

    /// The lease was lost while runnables were active
    #[error("leader election lost for {identity}")]
    LeadershipLost {
        /// Holder identity of this process
        identity: String,
    },

    /// Runnables did not stop within the graceful shutdown timeout
    #[error("{} runnable(s) did not stop within {timeout:?}: {}", .pending.len(), .pending.join(", "))]
    ShutdownTimeout {
        /// The configured graceful shutdown timeout
        timeout: Duration,
        /// Names of runnables still running when the timeout expired
        pending: Vec<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "telemetry", "signals")
        context: String,
    },
}

impl Error {
    /// Create a validation error for a specific field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a registration error for the named runnable
    pub fn registration(runnable: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Registration {
            runnable: runnable.into(),
            message: msg.into(),
        }
    }

    /// Create a runtime failure for the named runnable
    pub fn runnable(runnable: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Runnable {
            runnable: runnable.into(),
            message: msg.into(),
        }
    }

    /// Create a leader election error
    pub fn leader_election(msg: impl Into<String>) -> Self {
        Self::LeaderElection {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration, validation and registration errors need a fix before
    /// anything can succeed. Lease API errors and transient Kubernetes
    /// errors may clear on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Validation { .. } => false,
            Error::Config { .. } => false,
            Error::Registration { .. } => false,
            Error::Runnable { .. } => true,
            Error::LeaderElection { .. } => true,
            Error::LeadershipLost { .. } => false,
            Error::ShutdownTimeout { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the runnable name if this error is associated with one
    pub fn runnable_name(&self) -> Option<&str> {
        match self {
            Error::Registration { runnable, .. } => Some(runnable),
            Error::Runnable { runnable, .. } => Some(runnable),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: startup misconfiguration is reported with enough context to fix it
    #[test]
    fn story_startup_errors_are_not_retryable() {
        let err = Error::config("unable to find leader election namespace");
        assert!(err.to_string().contains("configuration error"));
        assert!(!err.is_retryable());

        let err = Error::registration("interval-logger", "a runnable with this name is already registered");
        assert!(err.to_string().contains("interval-logger"));
        assert_eq!(err.runnable_name(), Some("interval-logger"));
        assert!(!err.is_retryable());

        let err = Error::validation_for_field("interval", "must be greater than zero");
        match &err {
            Error::Validation { field, .. } => assert_eq!(field.as_deref(), Some("interval")),
            _ => panic!("Expected Validation variant"),
        }
    }

    /// Story: a failing runnable is named in the error the manager returns
    #[test]
    fn story_runnable_failure_names_the_runnable() {
        let err = Error::runnable("test-controller", "watch stream ended");
        assert_eq!(
            err.to_string(),
            "runnable test-controller failed: watch stream ended"
        );
        assert_eq!(err.runnable_name(), Some("test-controller"));
    }

    /// Story: losing the lease is terminal for this process
    #[test]
    fn story_leadership_loss_is_terminal() {
        let err = Error::LeadershipLost {
            identity: "manager-0_ab12".to_string(),
        };
        assert!(err.to_string().contains("manager-0_ab12"));
        assert!(!err.is_retryable());

        // Lease API hiccups during acquisition are retried
        assert!(Error::leader_election("connection reset").is_retryable());
    }

    #[test]
    fn shutdown_timeout_lists_pending_runnables() {
        let err = Error::ShutdownTimeout {
            timeout: Duration::from_secs(30),
            pending: vec!["a".to_string(), "b".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("2 runnable(s) did not stop within 30s"));
        assert!(msg.ends_with("a, b"));
    }

    #[test]
    fn kube_client_errors_are_retryable_server_errors_only() {
        let not_found = Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        }));
        assert!(!not_found.is_retryable());

        let unavailable = Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "etcd unavailable".to_string(),
            reason: "ServiceUnavailable".to_string(),
            code: 503,
        }));
        assert!(unavailable.is_retryable());
    }

    #[test]
    fn internal_error_carries_context() {
        let err = Error::internal_with_context("telemetry", "subscriber already set");
        assert_eq!(
            err.to_string(),
            "internal error [telemetry]: subscriber already set"
        );
        assert!(Error::internal("x").to_string().contains(UNKNOWN_CONTEXT));
    }
}
