//! Reconcilers for custom resources
//!
//! Each controller is a leader-gated runnable wrapping a
//! `kube::runtime::Controller` whose watch stops on the manager's shutdown
//! token.

mod test;

pub use test::{error_policy, reconcile, Context, TestReconciler, CONTROLLER_NAME};

use crate::metrics::RECONCILE_TOTAL;

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
///
/// Forces the API server to close idle watches before the client times out.
pub const WATCH_TIMEOUT_SECS: u32 = 25;

/// Log and count each reconcile outcome reported by a controller stream
pub fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => {
                RECONCILE_TOTAL
                    .with_label_values(&[controller_name, "success"])
                    .inc();
                tracing::debug!(?action, "{} reconciliation completed", controller_name)
            }
            Err(e) => {
                RECONCILE_TOTAL
                    .with_label_values(&[controller_name, "error"])
                    .inc();
                tracing::error!(error = ?e, "{} reconciliation error", controller_name)
            }
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reconcile_results_are_counted_by_outcome() {
        let log = log_reconcile_result::<&str, &str>("counting");
        let success = RECONCILE_TOTAL.with_label_values(&["counting", "success"]);
        let failure = RECONCILE_TOTAL.with_label_values(&["counting", "error"]);
        let (ok_before, err_before) = (success.get(), failure.get());

        log(Ok("done")).await;
        log(Ok("done")).await;
        log(Err("watch failed")).await;

        assert_eq!(success.get() - ok_before, 2);
        assert_eq!(failure.get() - err_before, 1);
    }
}
