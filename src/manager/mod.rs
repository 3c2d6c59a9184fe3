//! Controller manager
//!
//! Owns every registered runnable, starts them together and propagates a
//! single shutdown token. Runnables that need leader election are held back
//! until the elector acquires the lease; the rest start immediately.
//!
//! The manager stops when the caller's shutdown token fires, when a runnable
//! fails, or when the lease is lost. In every case it cancels all runnables,
//! waits up to the graceful shutdown timeout for them to return, and releases
//! the lease if it was held.

mod status;

use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::leader_election::LeaderElector;
use crate::metrics::{RUNNABLE_FAILURES_TOTAL, RUNNABLE_STARTS_TOTAL};
use crate::probes::ProbeServer;
use crate::runnable::{Runnable, RunnableState};
use crate::{Error, Result};

pub use status::ManagerStatus;

/// Default time runnables get to stop after shutdown begins
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Name reported for the election task when it outlives the graceful timeout
pub const LEADER_ELECTION_TASK: &str = "leader-election";

/// Options fixed at manager construction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Address for `/metrics`, `/healthz` and `/readyz`; `None` disables it
    pub metrics_bind_address: Option<SocketAddr>,
    /// Time runnables get to return once shutdown begins
    pub graceful_shutdown_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            metrics_bind_address: None,
            graceful_shutdown_timeout: DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Builder for [`Manager`]
pub struct ManagerBuilder {
    config: ManagerConfig,
    elector: Option<LeaderElector>,
}

impl ManagerBuilder {
    /// Gate leader-election runnables on this elector
    ///
    /// Without an elector, every runnable starts immediately.
    pub fn leader_election(mut self, elector: LeaderElector) -> Self {
        self.elector = Some(elector);
        self
    }

    /// Build the manager, registering the probe server if configured
    pub fn build(self) -> Result<Manager> {
        let mut manager = Manager {
            config: self.config,
            elector: self.elector.map(Arc::new),
            runnables: Vec::new(),
            status: ManagerStatus::default(),
        };

        if let Some(addr) = manager.config.metrics_bind_address {
            let server = ProbeServer::new(addr, manager.status.clone());
            manager.add(server)?;
        }

        Ok(manager)
    }
}

/// Owns runnables and drives them from start to shutdown
pub struct Manager {
    config: ManagerConfig,
    elector: Option<Arc<LeaderElector>>,
    runnables: Vec<Arc<dyn Runnable>>,
    status: ManagerStatus,
}

impl Manager {
    /// Create a builder with the given configuration
    pub fn builder(config: ManagerConfig) -> ManagerBuilder {
        ManagerBuilder {
            config,
            elector: None,
        }
    }

    /// Register a runnable
    ///
    /// Names must be unique within a manager.
    pub fn add<R: Runnable + 'static>(&mut self, runnable: R) -> Result<()> {
        self.add_shared(Arc::new(runnable))
    }

    /// Register a runnable the caller keeps a handle on
    pub fn add_shared(&mut self, runnable: Arc<dyn Runnable>) -> Result<()> {
        let name = runnable.name().to_string();
        if !self.status.register(&name) {
            return Err(Error::registration(
                name,
                "a runnable with this name is already registered",
            ));
        }
        debug!(runnable = %name, "Registered runnable");
        self.runnables.push(runnable);
        Ok(())
    }

    /// Handle on manager state that stays valid after `start` consumes the manager
    pub fn status(&self) -> ManagerStatus {
        self.status.clone()
    }

    /// Whether leader-gated runnables wait for a lease
    pub fn leader_election_enabled(&self) -> bool {
        self.elector.is_some()
    }

    /// Run every registered runnable until `shutdown` fires or one fails
    ///
    /// Returns `Ok(())` after a graceful stop. Returns the first runnable
    /// error, `LeadershipLost` if the lease was lost, or `ShutdownTimeout`
    /// if runnables outlived the graceful shutdown timeout.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let Manager {
            config,
            elector,
            runnables,
            status,
        } = self;

        let stop = CancellationToken::new();
        let mut tasks: JoinSet<(String, Result<()>)> = JoinSet::new();

        let (gated, ungated): (Vec<_>, Vec<_>) = runnables
            .into_iter()
            .partition(|r| r.needs_leader_election());

        status.mark_started();
        info!(
            ungated = ungated.len(),
            gated = gated.len(),
            leader_election = elector.is_some(),
            "Starting manager"
        );

        for runnable in ungated {
            spawn_runnable(&mut tasks, runnable, &stop, &status);
        }

        let (elected_tx, mut elected_rx) = oneshot::channel();
        let mut pending_gated = Some(gated);
        let mut election: Option<JoinHandle<Result<()>>> = None;

        match &elector {
            None => {
                status.mark_elected();
                for runnable in pending_gated.take().unwrap_or_default() {
                    spawn_runnable(&mut tasks, runnable, &stop, &status);
                }
            }
            Some(elector) => {
                let elector = Arc::clone(elector);
                let cancel = stop.clone();
                election = Some(tokio::spawn(async move {
                    if !elector.acquire(&cancel).await {
                        return Ok(());
                    }
                    let _ = elected_tx.send(());
                    elector.hold(&cancel).await
                }));
            }
        }

        let outcome: Result<()> = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping runnables");
                    break Ok(());
                }

                Ok(()) = &mut elected_rx, if pending_gated.is_some() => {
                    status.mark_elected();
                    for runnable in pending_gated.take().unwrap_or_default() {
                        spawn_runnable(&mut tasks, runnable, &stop, &status);
                    }
                }

                joined = join_election(&mut election), if election.is_some() => {
                    election = None;
                    match joined {
                        Ok(Ok(())) => debug!("Leader election task finished"),
                        Ok(Err(e)) => {
                            error!(error = %e, "Leader election lost, stopping manager");
                            break Err(e);
                        }
                        Err(e) => {
                            break Err(Error::internal_with_context(
                                LEADER_ELECTION_TASK,
                                e.to_string(),
                            ));
                        }
                    }
                }

                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined {
                        Ok((name, Ok(()))) => {
                            status.set_state(&name, RunnableState::Stopped);
                            info!(runnable = %name, "Runnable returned before shutdown");
                        }
                        Ok((name, Err(e))) => {
                            status.set_state(&name, RunnableState::Stopped);
                            RUNNABLE_FAILURES_TOTAL.with_label_values(&[name.as_str()]).inc();
                            error!(runnable = %name, error = %e, "Runnable failed, stopping manager");
                            break Err(e);
                        }
                        Err(e) => {
                            break Err(Error::internal_with_context("manager", e.to_string()));
                        }
                    }
                }
            }
        };

        stop.cancel();

        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                if let Ok((name, result)) = joined {
                    status.set_state(&name, RunnableState::Stopped);
                    match result {
                        Ok(()) => debug!(runnable = %name, "Runnable stopped"),
                        Err(e) => {
                            RUNNABLE_FAILURES_TOTAL.with_label_values(&[name.as_str()]).inc();
                            warn!(runnable = %name, error = %e, "Runnable failed during shutdown");
                        }
                    }
                }
            }
            if let Some(handle) = election.as_mut() {
                let _ = handle.await;
            }
        };

        let drained = tokio::time::timeout(config.graceful_shutdown_timeout, drain).await;
        let drain_result = match drained {
            Ok(()) => Ok(()),
            Err(_) => {
                let mut pending = status.running();
                tasks.abort_all();
                if let Some(handle) = election.take() {
                    if !handle.is_finished() {
                        pending.push(LEADER_ELECTION_TASK.to_string());
                    }
                    handle.abort();
                }
                error!(
                    timeout_secs = config.graceful_shutdown_timeout.as_secs(),
                    pending = ?pending,
                    "Runnables did not stop in time"
                );
                Err(Error::ShutdownTimeout {
                    timeout: config.graceful_shutdown_timeout,
                    pending,
                })
            }
        };

        if let Some(elector) = &elector {
            if let Err(e) = elector.release().await {
                warn!(identity = %elector.identity(), error = %e, "Failed to release lease");
            }
        }

        info!("Manager stopped");
        outcome.and(drain_result)
    }
}

fn spawn_runnable(
    tasks: &mut JoinSet<(String, Result<()>)>,
    runnable: Arc<dyn Runnable>,
    stop: &CancellationToken,
    status: &ManagerStatus,
) {
    let name = runnable.name().to_string();
    let token = stop.child_token();

    status.set_state(&name, RunnableState::Running);
    RUNNABLE_STARTS_TOTAL.with_label_values(&[name.as_str()]).inc();
    debug!(
        runnable = %name,
        leader_election = runnable.needs_leader_election(),
        "Starting runnable"
    );

    tasks.spawn(async move {
        let result = AssertUnwindSafe(runnable.start(token))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(Error::runnable(
                    &name,
                    format!("panicked: {}", panic_message(panic.as_ref())),
                ))
            });
        (name, result)
    });
}

async fn join_election(
    election: &mut Option<JoinHandle<Result<()>>>,
) -> std::result::Result<Result<()>, tokio::task::JoinError> {
    match election {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
