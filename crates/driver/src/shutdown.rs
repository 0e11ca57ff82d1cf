//! Stop signal for the scheduling loop.
//!
//! Resolves on SIGINT or SIGTERM. The scheduler finishes the step in
//! flight, frees every occupied slot and returns what completed so far.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for SIGINT: {e}");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    {
        tokio::select! {
            () = ctrl_c => tracing::info!("Received SIGINT, stopping after the current step"),
            () = terminate => tracing::info!("Received SIGTERM, stopping after the current step"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await;
        tracing::info!("Received Ctrl+C, stopping after the current step");
    }
}

/// Flag raised once `shutdown_signal` resolves.
pub fn stop_flag() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let raised = Arc::clone(&stop);
    tokio::spawn(async move {
        shutdown_signal().await;
        raised.store(true, Ordering::Release);
    });
    stop
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_signal_is_send_future() {
        fn assert_send_future<T: std::future::Future<Output = ()> + Send>(_f: T) {}
        assert_send_future(shutdown_signal());
    }

    #[tokio::test]
    async fn stop_flag_starts_lowered() {
        let stop = stop_flag();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!stop.load(Ordering::Acquire));
    }
}
