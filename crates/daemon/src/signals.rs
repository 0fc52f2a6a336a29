//! Signal handling for graceful daemon shutdown and on-demand runs.
//!
//! SIGTERM and SIGINT (Ctrl+C on every platform) stop the daemon. On Unix,
//! SIGHUP requests an immediate sync run.

use std::fmt;

use tokio::sync::mpsc;
use tracing::{error, info};

/// The signal that ended the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interrupt => write!(f, "SIGINT"),
            Self::Terminate => write!(f, "SIGTERM"),
        }
    }
}

/// Wait for a shutdown signal.
///
/// A handler that cannot be installed is logged and never fires.
pub async fn wait_for_shutdown() -> ShutdownSignal {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let signal = tokio::select! {
        _ = ctrl_c => ShutdownSignal::Interrupt,
        _ = terminate => ShutdownSignal::Terminate,
    };
    info!(%signal, "received shutdown signal");
    signal
}

/// Forward SIGHUP to `trigger` as a sync request until the receiver is gone.
#[cfg(unix)]
pub fn forward_sync_requests(trigger: mpsc::Sender<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "failed to install SIGHUP handler");
            return;
        }
    };
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("received SIGHUP");
            if trigger.send(()).await.is_err() {
                break;
            }
        }
    });
}

#[cfg(not(unix))]
pub fn forward_sync_requests(_trigger: mpsc::Sender<()>) {}
