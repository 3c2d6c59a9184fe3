//! OS signal handling for the manager binary
//!
//! The first SIGINT or SIGTERM cancels the shutdown token so runnables can
//! stop gracefully. A second signal exits immediately with code 1.

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{Error, Result};

/// Exit code used when a second signal interrupts graceful shutdown
pub const FORCED_EXIT_CODE: i32 = 1;

/// Create a shutdown token wired to SIGINT and SIGTERM
///
/// Must be called from within a tokio runtime.
pub fn shutdown_token() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let signals = os_signals()?;
    let cancel = token.clone();

    tokio::spawn(async move {
        if escalate(signals, &cancel).await {
            warn!("Received second shutdown signal, exiting immediately");
            std::process::exit(FORCED_EXIT_CODE);
        }
    });

    Ok(token)
}

/// Cancel `token` on the first signal; return true if a second one arrives
async fn escalate<S>(signals: S, token: &CancellationToken) -> bool
where
    S: Stream<Item = ()>,
{
    futures::pin_mut!(signals);

    if signals.next().await.is_none() {
        return false;
    }
    info!("Received shutdown signal, stopping manager");
    token.cancel();

    signals.next().await.is_some()
}

#[cfg(unix)]
fn os_signals() -> Result<impl Stream<Item = ()> + Send + 'static> {
    use tokio::signal::unix::{signal, SignalKind};

    let map_err = |e: std::io::Error| {
        Error::internal_with_context("signals", format!("failed to install handler: {e}"))
    };
    let sigint = signal(SignalKind::interrupt()).map_err(map_err)?;
    let sigterm = signal(SignalKind::terminate()).map_err(map_err)?;

    Ok(futures::stream::unfold(
        (sigint, sigterm),
        |(mut sigint, mut sigterm)| async move {
            let received = tokio::select! {
                s = sigint.recv() => s,
                s = sigterm.recv() => s,
            };
            received.map(|()| ((), (sigint, sigterm)))
        },
    ))
}

#[cfg(not(unix))]
fn os_signals() -> Result<impl Stream<Item = ()> + Send + 'static> {
    Ok(futures::stream::unfold((), |()| async {
        tokio::signal::ctrl_c().await.ok().map(|()| ((), ()))
    }))
}
