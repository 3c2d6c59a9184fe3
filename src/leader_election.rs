//! Leader election using Kubernetes Leases
//!
//! Only one manager replica runs leader-gated runnables at a time. The
//! elector holds a `coordination.k8s.io/v1` Lease and renews it every retry
//! period; a replica that cannot renew within the renew deadline, or finds
//! the lease held by someone else, gives up leadership.
//!
//! # Atomicity
//!
//! Uses resourceVersion for compare-and-swap semantics. If the lease changes
//! between read and write, the update fails with 409 Conflict and the
//! attempt counts as "not acquired". Two replicas can never both believe
//! they took the same lease generation.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::metrics::LEADER_STATUS;
use crate::{Error, Result, POD_NAMESPACE_ENV, POD_NAME_ENV};

/// How long a lease is valid after its last renewal
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);

/// How long the leader keeps trying to renew before giving up
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);

/// Pause between acquire or renew attempts
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(2);

/// In-cluster namespace file mounted with the service account token
pub const SERVICE_ACCOUNT_NAMESPACE_PATH: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Upper bound of the random jitter added to the acquire retry period
const RETRY_JITTER_FACTOR: f64 = 0.2;

// ============================================================================
// Configuration
// ============================================================================

/// Lease identity and timing for one elector
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaderElectionConfig {
    /// Name of the Lease object
    pub lease_name: String,
    /// Namespace of the Lease object
    pub namespace: String,
    /// Holder identity written to the lease
    pub identity: String,
    /// Validity of the lease after each renewal
    pub lease_duration: Duration,
    /// Time the leader keeps retrying renewal before stepping down
    pub renew_deadline: Duration,
    /// Pause between attempts
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    /// Create a config with the default 15s/10s/2s timing
    pub fn new(
        lease_name: impl Into<String>,
        namespace: impl Into<String>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            lease_name: lease_name.into(),
            namespace: namespace.into(),
            identity: identity.into(),
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
        }
    }

    /// Check that names are set and `retry_period < renew_deadline < lease_duration`
    pub fn validate(&self) -> Result<()> {
        if self.lease_name.is_empty() {
            return Err(Error::validation_for_field(
                "lease_name",
                "lease name must not be empty",
            ));
        }
        if self.namespace.is_empty() {
            return Err(Error::validation_for_field(
                "namespace",
                "lease namespace must not be empty",
            ));
        }
        if self.identity.is_empty() {
            return Err(Error::validation_for_field(
                "identity",
                "holder identity must not be empty",
            ));
        }
        if self.retry_period.is_zero() {
            return Err(Error::validation_for_field(
                "retry_period",
                "retry period must be greater than zero",
            ));
        }
        if self.renew_deadline <= self.retry_period {
            return Err(Error::validation_for_field(
                "renew_deadline",
                "renew deadline must be greater than the retry period",
            ));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::validation_for_field(
                "lease_duration",
                "lease duration must be greater than the renew deadline",
            ));
        }
        lease_duration_seconds(self.lease_duration)?;
        Ok(())
    }
}

/// Lease duration as stored in `spec.leaseDurationSeconds`
fn lease_duration_seconds(duration: Duration) -> Result<i32> {
    i32::try_from(duration.as_secs()).map_err(|_| {
        Error::validation_for_field(
            "lease_duration",
            format!("lease duration must be at most {} seconds", i32::MAX),
        )
    })
}

/// Resolve the lease namespace
///
/// Order: explicit flag, `POD_NAMESPACE`, the in-cluster service account
/// namespace file. Running out of cluster without any of these is a
/// configuration error.
pub fn resolve_namespace(flag: Option<&str>) -> Result<String> {
    let from_env = std::env::var(POD_NAMESPACE_ENV).ok();
    let from_file = std::fs::read_to_string(Path::new(SERVICE_ACCOUNT_NAMESPACE_PATH)).ok();
    pick_namespace(flag, from_env.as_deref(), from_file.as_deref())
}

fn pick_namespace(
    flag: Option<&str>,
    from_env: Option<&str>,
    from_file: Option<&str>,
) -> Result<String> {
    [flag, from_env, from_file]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|ns| !ns.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            Error::config(
                "unable to find leader election namespace: not running in-cluster, \
                 set --leader-election-namespace or POD_NAMESPACE",
            )
        })
}

/// Holder identity for this process: pod name plus a random suffix
///
/// Falls back to `HOSTNAME`, then to a fixed prefix, so that two processes
/// on one host still get distinct identities.
pub fn default_identity() -> String {
    let base = std::env::var(POD_NAME_ENV)
        .ok()
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
        .unwrap_or_else(|| "controller-manager".to_string());
    identity_with_suffix(&base)
}

fn identity_with_suffix(base: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{base}_{}", suffix.to_lowercase())
}

// ============================================================================
// Lease decisions
// ============================================================================

/// What to do with the lease as currently stored in the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeaseDecision {
    /// No lease exists yet
    Create,
    /// We already hold it
    Renew,
    /// Expired or released; take it over with the given transition count
    TakeOver {
        /// Value to store in `leaseTransitions`
        transitions: i32,
    },
    /// Someone else holds a live lease
    HeldByOther {
        /// Current holder
        holder: String,
    },
}

/// Decide how `identity` should act on `existing` at time `now`
///
/// A lease without a holder, or without renew time or duration, is
/// treated as expired.
pub fn evaluate_lease(existing: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseDecision {
    let Some(lease) = existing else {
        return LeaseDecision::Create;
    };

    let spec = lease.spec.as_ref();
    let holder = spec
        .and_then(|s| s.holder_identity.as_deref())
        .filter(|h| !h.is_empty());
    let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);

    let Some(holder) = holder else {
        return LeaseDecision::TakeOver {
            transitions: transitions + 1,
        };
    };

    if holder == identity {
        return LeaseDecision::Renew;
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    let is_expired = match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(i64::from(duration)),
        _ => true,
    };

    if is_expired {
        LeaseDecision::TakeOver {
            transitions: transitions + 1,
        }
    } else {
        LeaseDecision::HeldByOther {
            holder: holder.to_string(),
        }
    }
}

// ============================================================================
// Lease lock
// ============================================================================

/// Storage backend for the leader lease
///
/// Abstracted so the election loop can be tested without a cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseLock: Send + Sync {
    /// Acquire the lease if free or expired, or renew it if already held
    ///
    /// Returns `Ok(false)` when another holder owns a live lease or won a
    /// concurrent update.
    async fn try_acquire_or_renew(&self) -> Result<bool>;

    /// Clear the holder so a standby can acquire without waiting for expiry
    async fn release(&self) -> Result<()>;
}

/// Lease lock backed by the Kubernetes API
pub struct KubeLeaseLock {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
    lease_duration_seconds: i32,
}

impl KubeLeaseLock {
    /// Create a lock for the lease described by `config`
    ///
    /// Fails if the lease duration does not fit `spec.leaseDurationSeconds`.
    pub fn new(client: Client, config: &LeaderElectionConfig) -> Result<Self> {
        Ok(Self {
            api: Api::namespaced(client, &config.namespace),
            lease_name: config.lease_name.clone(),
            identity: config.identity.clone(),
            lease_duration_seconds: lease_duration_seconds(config.lease_duration)?,
        })
    }

    fn desired_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration_seconds),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn create_lease(&self, now: DateTime<Utc>) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                ..Default::default()
            },
            spec: Some(self.desired_spec(now, 0)),
        };

        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(identity = %self.identity, lease = %self.lease_name, "Created new lease");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease creation conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn renew_lease(&self, existing: Lease, now: DateTime<Utc>) -> Result<bool> {
        if existing.metadata.resource_version.is_none() {
            return Err(Error::leader_election("lease missing resourceVersion"));
        }

        let mut updated = existing;
        if let Some(ref mut spec) = updated.spec {
            spec.renew_time = Some(MicroTime(now));
        }

        match self
            .api
            .replace(&self.lease_name, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => {
                debug!(identity = %self.identity, "Lease renewed");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                warn!(identity = %self.identity, "Lease renewal conflict");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn take_over_lease(
        &self,
        resource_version: Option<String>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool> {
        let rv = resource_version
            .ok_or_else(|| Error::leader_election("lease missing resourceVersion"))?;

        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                resource_version: Some(rv),
                ..Default::default()
            },
            spec: Some(self.desired_spec(now, transitions)),
        };

        match self
            .api
            .replace(&self.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                info!(
                    identity = %self.identity,
                    transitions,
                    "Took over expired lease"
                );
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease takeover conflict, will retry");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LeaseLock for KubeLeaseLock {
    async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = Utc::now();
        let existing = self.api.get_opt(&self.lease_name).await?;

        match evaluate_lease(existing.as_ref(), &self.identity, now) {
            LeaseDecision::Create => self.create_lease(now).await,
            LeaseDecision::Renew => match existing {
                Some(lease) => self.renew_lease(lease, now).await,
                None => Ok(false),
            },
            LeaseDecision::TakeOver { transitions } => {
                let rv = existing.and_then(|l| l.metadata.resource_version);
                self.take_over_lease(rv, now, transitions).await
            }
            LeaseDecision::HeldByOther { holder } => {
                debug!(identity = %self.identity, %holder, "Lease held by another");
                Ok(false)
            }
        }
    }

    async fn release(&self) -> Result<()> {
        let Some(lease) = self.api.get_opt(&self.lease_name).await? else {
            debug!(identity = %self.identity, "Lease not found, nothing to release");
            return Ok(());
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_ref());
        if holder != Some(&self.identity) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        // Renew time in the past makes the lease immediately acquirable
        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "spec": {
                "holderIdentity": null,
                "renewTime": past.to_rfc3339()
            }
        });

        self.api
            .patch(
                &self.lease_name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;

        info!(identity = %self.identity, "Lease released for fast failover");
        Ok(())
    }
}

// ============================================================================
// Elector
// ============================================================================

/// Leader elector driving a [`LeaseLock`]
pub struct LeaderElector {
    lock: Arc<dyn LeaseLock>,
    lease_name: String,
    identity: String,
    renew_deadline: Duration,
    retry_period: Duration,
    is_leader: AtomicBool,
}

impl LeaderElector {
    /// Create an elector backed by a Kubernetes Lease
    pub fn new(client: Client, config: LeaderElectionConfig) -> Result<Self> {
        let lock = Arc::new(KubeLeaseLock::new(client, &config)?);
        Self::with_lock(lock, config)
    }

    /// Create an elector over an arbitrary lock
    pub fn with_lock(lock: Arc<dyn LeaseLock>, config: LeaderElectionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            lock,
            lease_name: config.lease_name,
            identity: config.identity,
            renew_deadline: config.renew_deadline,
            retry_period: config.retry_period,
            is_leader: AtomicBool::new(false),
        })
    }

    /// Holder identity written to the lease
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether this elector currently believes it holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    fn set_leader(&self, leader: bool) {
        self.is_leader.store(leader, Ordering::SeqCst);
        LEADER_STATUS.set(i64::from(leader));
    }

    /// Block until the lease is acquired
    ///
    /// Lease API errors are logged and retried. Returns `false` if `cancel`
    /// fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Waiting for leadership..."
        );

        loop {
            if cancel.is_cancelled() {
                return false;
            }

            match self.lock.try_acquire_or_renew().await {
                Ok(true) => {
                    self.set_leader(true);
                    info!(identity = %self.identity, lease = %self.lease_name, "Leadership acquired");
                    return true;
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_ms = self.retry_period.as_millis() as u64,
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_ms = self.retry_period.as_millis() as u64,
                        "Failed to acquire lease, retrying..."
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(jittered(self.retry_period)) => {}
            }
        }
    }

    /// Keep renewing the lease until `cancel` fires or leadership is lost
    ///
    /// Returns `Ok(())` on cancellation. Returns `LeadershipLost` when
    /// another holder owns the lease, or when no renewal succeeded within
    /// the renew deadline.
    pub async fn hold(&self, cancel: &CancellationToken) -> Result<()> {
        let mut last_renewed = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.retry_period) => {}
            }

            match self.lock.try_acquire_or_renew().await {
                Ok(true) => last_renewed = Instant::now(),
                Ok(false) => {
                    warn!(identity = %self.identity, "Lease taken by another holder");
                    return Err(self.lost());
                }
                Err(e) if last_renewed.elapsed() >= self.renew_deadline => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        deadline_secs = self.renew_deadline.as_secs(),
                        "Failed to renew lease within deadline"
                    );
                    return Err(self.lost());
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Failed to renew lease, retrying");
                }
            }
        }
    }

    fn lost(&self) -> Error {
        self.set_leader(false);
        Error::LeadershipLost {
            identity: self.identity.clone(),
        }
    }

    /// Release the lease if this elector holds it
    pub async fn release(&self) -> Result<()> {
        if !self.is_leader() {
            debug!(identity = %self.identity, "Not leader, nothing to release");
            return Ok(());
        }
        self.set_leader(false);
        self.lock.release().await
    }
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.0..=RETRY_JITTER_FACTOR);
    base + Duration::from_secs_f64(base.as_secs_f64() * factor)
}
