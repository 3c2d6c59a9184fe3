//! Runnable contract shared by everything the manager starts
//!
//! A runnable is a long-lived background task. The manager calls
//! [`Runnable::start`] exactly once, on its own task, and hands it a
//! cancellation token that fires when the process shuts down. `start` must
//! not return until the runnable has stopped.
//!
//! Runnables are leader-gated by default: the manager defers them until this
//! process holds the leader lease. Override
//! [`Runnable::needs_leader_election`] to run on every replica.

mod interval_logger;

use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;

pub use interval_logger::{IntervalLogger, DEFAULT_INTERVAL};

/// A background task owned by the manager
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Unique name used for registration, logs and metrics
    fn name(&self) -> &str;

    /// Run until `shutdown` fires or the task fails
    async fn start(&self, shutdown: CancellationToken) -> Result<()>;

    /// Whether this runnable must wait for leadership before starting
    ///
    /// Queried once when the manager starts. Must be side-effect free.
    fn needs_leader_election(&self) -> bool {
        true
    }
}

/// Lifecycle of a registered runnable
///
/// `Idle -> Running -> Stopped`. `Stopped` is terminal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunnableState {
    /// Registered, `start` not yet invoked
    #[default]
    Idle,
    /// `start` invoked and not yet returned
    Running,
    /// `start` returned
    Stopped,
}

impl fmt::Display for RunnableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnableState::Idle => write!(f, "Idle"),
            RunnableState::Running => write!(f, "Running"),
            RunnableState::Stopped => write!(f, "Stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain;

    #[async_trait]
    impl Runnable for Plain {
        fn name(&self) -> &str {
            "plain"
        }

        async fn start(&self, shutdown: CancellationToken) -> Result<()> {
            shutdown.cancelled().await;
            Ok(())
        }
    }

    #[test]
    fn runnables_are_gated_unless_they_opt_out() {
        assert!(Plain.needs_leader_election());
    }

    #[test]
    fn state_starts_idle() {
        assert_eq!(RunnableState::default(), RunnableState::Idle);
        assert_eq!(RunnableState::Running.to_string(), "Running");
    }

    #[tokio::test]
    async fn start_returns_once_token_is_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(Plain.start(token).await.is_ok());
    }
}
