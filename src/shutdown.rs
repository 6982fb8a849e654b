//! SIGINT / SIGTERM handling for the controller loop.

use std::future::Future;

use futures::future;
use tokio::select;
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

type Signal = Option<&'static str>;

pub struct Shutdown {
    rx: watch::Receiver<Signal>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            rx: spawn_signal_listener(),
        }
    }

    /// Resolves once a signal arrived. Never resolves if no listener could be installed.
    ///
    /// The returned future is `Sync`, as `Controller::graceful_shutdown_on` requires.
    pub fn signalled(&self) -> impl Future<Output = ()> + Send + Sync + 'static {
        let mut rx = self.rx.clone();
        let (done_tx, done_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let received = rx.wait_for(Option::is_some).await.map(|signal| *signal);
            let Ok(signal) = received else {
                return future::pending::<()>().await;
            };
            info!(
                "Stopping controller after {}, waiting for running reconciles.",
                signal.unwrap_or("signal")
            );
            let _ = done_tx.send(());
        });
        async move {
            let _ = done_rx.await;
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_signal_listener() -> watch::Receiver<Signal> {
    let (tx, rx) = watch::channel(None);

    tokio::spawn(async move {
        let mut sigterm = match unix_signal(SignalKind::terminate()) {
            Ok(sigterm) => Some(sigterm),
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                None
            }
        };
        let terminated = async {
            match sigterm.as_mut() {
                Some(sigterm) => {
                    sigterm.recv().await;
                }
                None => future::pending::<()>().await,
            }
        };

        let received = select! {
            res = signal::ctrl_c() => match res {
                Ok(()) => "SIGINT",
                Err(e) => {
                    warn!("Failed to listen for SIGINT: {}", e);
                    return;
                }
            },
            _ = terminated => "SIGTERM",
        };
        info!("Received {}.", received);
        let _ = tx.send(Some(received));
    });

    rx
}
