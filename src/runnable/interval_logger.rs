//! Periodic heartbeat logger
//!
//! Emits "starting", then a "test message" every interval, then "stopping"
//! when the shutdown token fires. Each tick is independent: there is no
//! jitter, drift correction or backoff, and no failure path besides being
//! started twice.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::Runnable;
use crate::manager::Manager;
use crate::metrics::INTERVAL_LOGGER_MESSAGES_TOTAL;
use crate::{Error, Result};

/// Heartbeat interval used by the manager binary
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Runnable that logs a heartbeat on a fixed interval
#[derive(Debug)]
pub struct IntervalLogger {
    id: String,
    name: String,
    interval: Duration,
    require_leader_election: bool,
    started: AtomicBool,
    messages: AtomicU64,
}

impl IntervalLogger {
    /// Create a logger named `name` that ticks every `interval`
    ///
    /// `name` is reported as `controller_name` on every event and may be
    /// empty (an unset `POD_NAME`). The interval must be non-zero.
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        require_leader_election: bool,
    ) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::validation_for_field(
                "interval",
                "interval must be greater than zero",
            ));
        }

        let name = name.into();
        let id = if name.is_empty() {
            "interval-logger".to_string()
        } else {
            format!("interval-logger/{name}")
        };

        Ok(Self {
            id,
            name,
            interval,
            require_leader_election,
            started: AtomicBool::new(false),
            messages: AtomicU64::new(0),
        })
    }

    /// Name reported as `controller_name`
    pub fn logger_name(&self) -> &str {
        &self.name
    }

    /// Number of "test message" events emitted so far
    pub fn messages_emitted(&self) -> u64 {
        self.messages.load(Ordering::SeqCst)
    }

    /// Register this logger with the manager
    pub fn setup_with_manager(self, manager: &mut Manager) -> Result<()> {
        manager.add(self)
    }
}

#[async_trait]
impl Runnable for IntervalLogger {
    fn name(&self) -> &str {
        &self.id
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::runnable(&self.id, "interval logger already started"));
        }

        info!(
            controller_name = %self.name,
            require_leader_election = self.require_leader_election,
            "starting"
        );

        loop {
            tokio::select! {
                // Shutdown wins a tie so no message follows a fired token
                biased;

                _ = shutdown.cancelled() => {
                    info!(
                        controller_name = %self.name,
                        require_leader_election = self.require_leader_election,
                        "stopping"
                    );
                    return Ok(());
                }
                _ = tokio::time::sleep(self.interval) => {
                    self.messages.fetch_add(1, Ordering::SeqCst);
                    INTERVAL_LOGGER_MESSAGES_TOTAL
                        .with_label_values(&[self.name.as_str()])
                        .inc();
                    info!(
                        controller_name = %self.name,
                        require_leader_election = self.require_leader_election,
                        "test message"
                    );
                }
            }
        }
    }

    fn needs_leader_election(&self) -> bool {
        self.require_leader_election
    }
}
