/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C) and SIGTERM both cancel the token handed to the control
/// loops. The loops observe it at the top of each tick and during their sleep.
use tokio_util::sync::CancellationToken;

/// Spawn a task that cancels `token` on the first SIGINT or SIGTERM.
pub fn install(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            () = shutdown_signal() => {
                tracing::info!("shutdown signal received");
                token.cancel();
            }
            () = token.cancelled() => {}
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
            let _ = ctrl_c.await;
        }
    }
}

/// Sleep for `period` unless cancelled first. Returns false when cancelled.
pub async fn sleep_or_cancel(token: &CancellationToken, period: std::time::Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => false,
        () = tokio::time::sleep(period) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_sleep_completes_when_not_cancelled() {
        let token = CancellationToken::new();
        assert!(sleep_or_cancel(&token, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_sleep_returns_early_on_cancel() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let start = Instant::now();
        assert!(!sleep_or_cancel(&token, Duration::from_secs(30)).await);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_install_task_exits_when_token_cancelled_elsewhere() {
        let token = CancellationToken::new();
        let handle = install(token.clone());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_sigterm_cancels_token() {
        // Keeps the default SIGTERM action (process exit) disarmed for the test binary.
        let _guard =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).unwrap();
        let token = CancellationToken::new();
        let _handle = install(token.clone());
        // Let the handler register before raising.
        tokio::time::sleep(Duration::from_millis(50)).await;
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();
        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .unwrap();
    }
}
