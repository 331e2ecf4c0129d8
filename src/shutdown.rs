use tokio_util::sync::CancellationToken;
use tracing::info;

/// Cancels the returned token on SIGINT or SIGTERM.
///
/// Executors stop dequeuing once it fires; jobs already in flight finish
/// (provider calls are bounded by their own timeout).
pub fn install_signal_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => info!("Received SIGINT, draining workers"),
                        _ = sigterm.recv() => info!("Received SIGTERM, draining workers"),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler, listening for Ctrl+C only");
                    let _ = ctrl_c.await;
                    info!("Received SIGINT, draining workers");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Received Ctrl+C, draining workers");
        }

        trigger.cancel();
    });

    token
}
