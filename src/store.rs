//! Store Facade
//!
//! The asynchronous face of the store. Every call runs the synchronous
//! [`Engine`] on tokio's blocking pool, bounded by `io_threads` permits, and
//! reports failures as [`PersistenceError`].
//!
//! ## Lifecycle
//! ```text
//!   new() ──▶ start() ──▶ write / load / delete / publish_* ... ──▶ stop()
//!                ▲                                                   │
//!                └───────────────────── restart ─────────────────────┘
//! ```
//!
//! Operations in flight when `stop` runs hold their own reference to the
//! engine and complete; new calls fail with [`ErrorKind::NotRunning`].
//!
//! [`ErrorKind::NotRunning`]: crate::error::ErrorKind::NotRunning

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Semaphore};

use crate::compactor::{EntryPosition, ExpirationObserver};
use crate::config::StoreConfig;
use crate::engine::{Collaborators, Engine, KeyFilter, StoreStats};
use crate::error::{PersistenceError, SifsError};
use crate::partition::KeyPartitioner;
use crate::record::Record;
use crate::storage::FileManager;
use crate::time::TimeService;

/// Result type of the facade
pub type StoreResult<T> = std::result::Result<T, PersistenceError>;

/// Items buffered ahead of a publisher's consumer
const PUBLISHER_BUFFER: usize = 64;

/// Soft-index file store
pub struct SoftIndexFileStore {
    config: StoreConfig,
    collab: Collaborators,
    engine: RwLock<Option<Arc<Engine>>>,
    /// Serializes start and stop
    lifecycle: tokio::sync::Mutex<()>,
    io_permits: Arc<Semaphore>,
}

impl SoftIndexFileStore {
    /// A stopped store with the default collaborators
    pub fn new(config: StoreConfig) -> Self {
        let collab = Collaborators::for_config(&config);
        Self {
            io_permits: Arc::new(Semaphore::new(config.io_threads)),
            config,
            collab,
            engine: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_partitioner(mut self, partitioner: Arc<dyn KeyPartitioner>) -> Self {
        self.collab.partitioner = partitioner;
        self
    }

    pub fn with_time_service(mut self, time: Arc<dyn TimeService>) -> Self {
        self.collab.time = time;
        self
    }

    /// Observer of background expiration passes
    pub fn with_expiration_observer(mut self, observer: Arc<dyn ExpirationObserver>) -> Self {
        self.collab.observer = observer;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The running engine, if any
    pub fn engine(&self) -> Option<Arc<Engine>> {
        self.engine.read().clone()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Open the engine; a no-op when already started
    pub async fn start(&self) -> StoreResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.engine.read().is_some() {
            return Ok(());
        }

        let config = self.config.clone();
        let collab = self.collab.clone();
        let engine = tokio::task::spawn_blocking(move || Engine::open(config, collab))
            .await
            .map_err(|e| SifsError::TaskFailed(e.to_string()))??;
        *self.engine.write() = Some(Arc::new(engine));
        Ok(())
    }

    /// Stop the engine; a no-op when already stopped
    pub async fn stop(&self) -> StoreResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(engine) = self.engine.write().take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || engine.stop())
            .await
            .map_err(|e| SifsError::TaskFailed(e.to_string()))??;
        Ok(())
    }

    /// Whether the store is running with its directories in place
    pub fn is_available(&self) -> bool {
        self.engine().map(|e| e.is_available()).unwrap_or(false)
    }

    // =========================================================================
    // Data Operations
    // =========================================================================

    /// Write a record; a record without a value deletes the key
    pub async fn write(&self, record: Record) -> StoreResult<()> {
        self.run_blocking(move |engine| engine.write(record)).await
    }

    pub async fn load(&self, key: impl Into<Bytes>) -> StoreResult<Option<Record>> {
        let key = key.into();
        self.run_blocking(move |engine| engine.load(&key)).await
    }

    pub async fn contains_key(&self, key: impl Into<Bytes>) -> StoreResult<bool> {
        let key = key.into();
        self.run_blocking(move |engine| engine.contains_key(&key)).await
    }

    /// Delete a key; `true` if a live value was present
    pub async fn delete(&self, key: impl Into<Bytes>) -> StoreResult<bool> {
        let key = key.into();
        self.run_blocking(move |engine| engine.delete(&key)).await
    }

    /// Live entries across all segments
    pub async fn size(&self) -> StoreResult<u64> {
        self.run_blocking(|engine| Ok(engine.size())).await
    }

    /// Live entries of the given segments
    pub async fn size_of(&self, segments: &[u32]) -> StoreResult<u64> {
        let segments = segments.to_vec();
        self.run_blocking(move |engine| Ok(engine.size_of(&segments))).await
    }

    /// Entry count from counters only, without touching the blocking pool
    pub fn approximate_size(&self) -> StoreResult<u64> {
        Ok(self.running()?.size())
    }

    pub async fn clear(&self) -> StoreResult<()> {
        self.run_blocking(|engine| engine.clear()).await
    }

    /// Compact every closed data file
    pub async fn force_compaction(&self) -> StoreResult<()> {
        self.run_blocking(|engine| engine.force_compaction()).await
    }

    pub async fn stats(&self) -> StoreResult<StoreStats> {
        self.run_blocking(|engine| Ok(engine.stats())).await
    }

    // =========================================================================
    // Publishers
    // =========================================================================

    /// Keys of live, unexpired entries, optionally limited to some segments
    /// and to keys accepted by `filter`
    pub fn publish_keys(
        &self,
        segments: Option<Vec<u32>>,
        filter: Option<KeyFilter>,
    ) -> Publisher<Bytes> {
        self.publish(move |engine, tx| {
            for key in engine.keys(segments.as_deref(), filter) {
                if tx.blocking_send(Ok(key)).is_err() {
                    break;
                }
            }
        })
    }

    /// Live records, optionally limited to some segments and to keys accepted
    /// by `filter`
    pub fn publish_entries(
        &self,
        segments: Option<Vec<u32>>,
        filter: Option<KeyFilter>,
        include_values: bool,
        include_expired: bool,
    ) -> Publisher<Record> {
        self.publish(move |engine, tx| {
            let entries =
                engine.entries(segments.as_deref(), filter, include_values, include_expired);
            for entry in entries {
                let failed = entry.is_err();
                if tx.blocking_send(entry.map_err(Into::into)).is_err() || failed {
                    break;
                }
            }
        })
    }

    /// Run an expiration pass and stream the records it expired
    ///
    /// The pass runs to completion even if the stream is dropped early.
    pub fn purge_expired(&self) -> Publisher<Record> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.running() {
            Ok(engine) => {
                let observer = Arc::new(ChannelObserver {
                    files: Arc::clone(engine.files()),
                    tx: tx.clone(),
                });
                tokio::task::spawn_blocking(move || {
                    if let Err(e) = engine.purge_expired(observer) {
                        let _ = tx.send(Err(e.into()));
                    }
                });
            }
            Err(e) => {
                let _ = tx.send(Err(e));
            }
        }
        Publisher {
            source: Source::Unbounded(rx),
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn running(&self) -> StoreResult<Arc<Engine>> {
        self.engine().ok_or_else(|| SifsError::NotRunning.into())
    }

    /// Run `op` on the blocking pool under an I/O permit
    async fn run_blocking<T, F>(&self, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Engine) -> crate::Result<T> + Send + 'static,
    {
        let engine = self.running()?;
        let permit = Arc::clone(&self.io_permits)
            .acquire_owned()
            .await
            .map_err(|_| SifsError::NotRunning)?;

        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            op(&engine)
        })
        .await
        .map_err(|e| SifsError::TaskFailed(e.to_string()))?;
        Ok(result?)
    }

    /// Feed a bounded publisher from a blocking producer
    fn publish<T, F>(&self, produce: F) -> Publisher<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Engine>, &mpsc::Sender<StoreResult<T>>) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(PUBLISHER_BUFFER);
        match self.running() {
            Ok(engine) => {
                tokio::task::spawn_blocking(move || produce(engine, &tx));
            }
            Err(e) => {
                let _ = tx.try_send(Err(e));
            }
        }
        Publisher {
            source: Source::Bounded(rx),
        }
    }
}

// =============================================================================
// Publisher
// =============================================================================

enum Source<T> {
    Bounded(mpsc::Receiver<StoreResult<T>>),
    Unbounded(mpsc::UnboundedReceiver<StoreResult<T>>),
}

/// Lazy stream of store items
///
/// Producers stop once the publisher is dropped. Errors end the stream.
pub struct Publisher<T> {
    source: Source<T>,
}

impl<T> Stream for Publisher<T> {
    type Item = StoreResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match &mut self.get_mut().source {
            Source::Bounded(rx) => rx.poll_recv(cx),
            Source::Unbounded(rx) => rx.poll_recv(cx),
        }
    }
}

impl<T> Unpin for Publisher<T> {}

/// Forwards records retired by an expiration pass to a publisher
struct ChannelObserver {
    files: Arc<FileManager>,
    tx: mpsc::UnboundedSender<StoreResult<Record>>,
}

impl std::fmt::Debug for ChannelObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelObserver")
            .field("dir", &self.files.dir())
            .finish()
    }
}

impl ExpirationObserver for ChannelObserver {
    fn on_entry_position(&self, position: &EntryPosition) {
        match self.files.read_record(position.location) {
            Ok(Some(record)) => {
                let _ = self.tx.send(Ok(record));
            }
            Ok(None) => {}
            Err(e) => {
                let _ = self.tx.send(Err(e.into()));
            }
        }
    }

    fn on_entry_record(&self, _segment: u32, record: &Record) {
        let _ = self.tx.send(Ok(record.clone()));
    }
}
