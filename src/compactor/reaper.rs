//! Expiration Reaper
//!
//! Background thread that periodically asks the compactor for an expiration
//! pass.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use tokio::sync::oneshot;

use crate::error::Result;

use super::{CompactorMsg, ExpirationObserver};

/// Handle to the reaper thread; stops it on drop
pub struct ExpirationReaper {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ExpirationReaper {
    pub fn start(
        interval: Duration,
        compactor: Sender<CompactorMsg>,
        observer: Arc<dyn ExpirationObserver>,
    ) -> Result<Self> {
        let (shutdown, shutdown_rx) = channel::bounded::<()>(1);
        let ticker = channel::tick(interval);

        let handle = thread::Builder::new()
            .name("sifs-reaper".to_string())
            .spawn(move || loop {
                crossbeam::select! {
                    recv(ticker) -> _ => {
                        let (done, wait) = oneshot::channel();
                        let msg = CompactorMsg::Expire { observer: Arc::clone(&observer), done };
                        if compactor.send(msg).is_err() {
                            break;
                        }
                        // Errors were already reported to the observer
                        let _ = wait.blocking_recv();
                    }
                    recv(shutdown_rx) -> _ => break,
                }
            })?;

        tracing::debug!(interval_ms = interval.as_millis() as u64, "Expiration reaper started");
        Ok(Self {
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }

    /// Stop the thread, waiting for a running pass to finish
    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("Expiration reaper panicked");
            }
        }
    }
}

impl Drop for ExpirationReaper {
    fn drop(&mut self) {
        self.stop();
    }
}
