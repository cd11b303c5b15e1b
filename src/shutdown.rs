//! Process shutdown on SIGINT or SIGTERM.

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;

/// Cancel `token` when the process receives SIGINT or SIGTERM.
///
/// The listeners are installed before this returns, so a signal sent
/// afterwards is never missed. Must be called inside a tokio runtime.
pub fn cancel_on_signal(token: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            let name = tokio::select! {
                _ = term.recv() => "SIGTERM",
                _ = int.recv() => "SIGINT",
            };
            info!(signal = name, "shutting down");
            token.cancel();
        });
    }
    #[cfg(not(unix))]
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!(signal = "ctrl-c", "shutting down");
        token.cancel();
    });
    Ok(())
}
