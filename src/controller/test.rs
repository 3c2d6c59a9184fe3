//! Test controller - reconciles Test resources
//!
//! The reconcile body is an extension point: it identifies the resource and
//! reports "done, no requeue" without reading or writing anything.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::{log_reconcile_result, WATCH_TIMEOUT_SECS};
use crate::crd::Test;
use crate::manager::Manager;
use crate::runnable::Runnable;
use crate::{Error, Result};

/// Controller name used in logs and metrics
pub const CONTROLLER_NAME: &str = "Test";

/// Shared state handed to every reconcile call
pub struct Context {
    /// Kubernetes client for API operations
    pub client: Client,
}

impl Context {
    /// Create a new controller context with the given Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Reconcile a Test resource
///
/// Returns `Action::await_change()`: nothing is requeued until the resource
/// changes again.
#[instrument(
    skip(test, _ctx),
    fields(name = %test.name_any(), namespace = %test.namespace().unwrap_or_default())
)]
pub async fn reconcile(test: Arc<Test>, _ctx: Arc<Context>) -> Result<Action> {
    debug!("reconciling test");
    Ok(Action::await_change())
}

/// Requeue failed reconciliations after a fixed delay
pub fn error_policy(test: Arc<Test>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        test = %test.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

/// Leader-gated runnable driving the Test controller
pub struct TestReconciler {
    client: Client,
}

impl TestReconciler {
    /// Create a reconciler watching Test resources in every namespace
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Register this reconciler with the manager
    pub fn setup_with_manager(self, manager: &mut Manager) -> Result<()> {
        manager.add(self)
    }
}

#[async_trait]
impl Runnable for TestReconciler {
    fn name(&self) -> &str {
        "test-controller"
    }

    async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        let ctx = Arc::new(Context::new(self.client.clone()));
        let tests: Api<Test> = Api::all(self.client.clone());

        info!(controller = CONTROLLER_NAME, "Starting controller");

        Controller::new(tests, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .graceful_shutdown_on(shutdown.cancelled_owned())
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result(CONTROLLER_NAME))
            .await;

        info!(controller = CONTROLLER_NAME, "Controller stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::TestSpec;
    use axum::http::{Request, Response};
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Client whose every request fails, counting how many were attempted
    fn counting_client() -> (Client, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let service = tower::service_fn(move |_req: Request<kube::client::Body>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                Err::<Response<kube::client::Body>, _>(std::io::Error::other(
                    "no API server in unit tests",
                ))
            }
        });
        (Client::new(service, "default"), calls)
    }

    fn sample(name: &str, namespace: &str, foo: Option<&str>) -> Arc<Test> {
        let mut test = Test::new(
            name,
            TestSpec {
                foo: foo.map(str::to_string),
            },
        );
        test.metadata.namespace = Some(namespace.to_string());
        Arc::new(test)
    }

    #[rstest]
    #[case::with_foo("test-sample", "default", Some("bar"))]
    #[case::empty_spec("empty", "team-a", None)]
    #[tokio::test]
    async fn reconcile_is_done_without_side_effects(
        #[case] name: &str,
        #[case] namespace: &str,
        #[case] foo: Option<&str>,
    ) {
        let (client, calls) = counting_client();
        let ctx = Arc::new(Context::new(client));

        let action = reconcile(sample(name, namespace, foo), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    /// Story: repeated events for the same resource are each settled alone
    #[tokio::test]
    async fn story_repeated_reconciles_stay_idle() {
        let (client, calls) = counting_client();
        let ctx = Arc::new(Context::new(client));
        let test = sample("test-sample", "default", Some("bar"));

        for _ in 0..3 {
            let action = reconcile(Arc::clone(&test), Arc::clone(&ctx)).await.unwrap();
            assert_eq!(action, Action::await_change());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn error_policy_requeues_after_five_seconds() {
        let (client, _) = counting_client();
        let ctx = Arc::new(Context::new(client));

        let action = error_policy(
            sample("test-sample", "default", None),
            &Error::internal("transient"),
            ctx,
        );

        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn reconciler_is_leader_gated() {
        let (client, _) = counting_client();
        let reconciler = TestReconciler::new(client);

        assert_eq!(reconciler.name(), "test-controller");
        assert!(reconciler.needs_leader_election());
    }

    #[tokio::test]
    async fn setup_registers_with_manager() {
        let (client, _) = counting_client();
        let mut manager = Manager::builder(Default::default()).build().unwrap();

        TestReconciler::new(client.clone())
            .setup_with_manager(&mut manager)
            .unwrap();
        assert!(TestReconciler::new(client)
            .setup_with_manager(&mut manager)
            .is_err());
    }
}
