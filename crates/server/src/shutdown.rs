use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::mpsc;

#[derive(Debug)]
pub(crate) struct ShutdownController {
    forced: AtomicU8,
}

impl ShutdownController {
    pub(crate) fn new() -> Self {
        Self {
            forced: AtomicU8::new(0),
        }
    }

    pub(crate) fn bump_forced(&self) -> u8 {
        self.forced.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// First Ctrl-C requests a graceful shutdown; a second one force-quits.
pub(crate) fn spawn_ctrl_c_handler(
    shutdown: Arc<ShutdownController>,
    shutdown_tx: mpsc::UnboundedSender<()>,
) {
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let n = shutdown.bump_forced();
            if n == 1 {
                tracing::info!("shutdown requested; press Ctrl-C again to force quit");
                let _ = shutdown_tx.send(());
            } else {
                tracing::warn!("forced quit");
                std::process::exit(130);
            }
        }
    });
}
