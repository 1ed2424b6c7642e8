use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Returns a token cancelled on SIGTERM or Ctrl-C.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.cancel();
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(
                target = "render_lease::shutdown",
                error = %err,
                "Failed to install SIGTERM handler; listening for Ctrl-C only"
            );
            ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!(target = "render_lease::shutdown", "Received SIGTERM, shutting down");
        }
        _ = ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(target = "render_lease::shutdown", "Received Ctrl-C, shutting down"),
        Err(err) => {
            warn!(
                target = "render_lease::shutdown",
                error = %err,
                "Failed to listen for Ctrl-C"
            );
            std::future::pending::<()>().await;
        }
    }
}
