use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

use crate::status::DataSourceState;
use crate::store::{AllData, PatchTarget};
use crate::update_sink::UpdateSink;

/// Tracks whether a data source has finished its first fetch.
///
/// The result is set at most once: `true` after the first full dataset has been stored, `false`
/// if the source shut down permanently before that. Later completions are ignored, so a
/// reconnect after a transient failure cannot re-arm the start future.
pub struct InitComplete {
    sender: watch::Sender<Option<bool>>,
}

impl InitComplete {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self { sender }
    }

    pub fn complete(&self, success: bool) {
        self.sender.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(success);
                true
            } else {
                false
            }
        });
    }

    /// The outcome, if the source has resolved yet.
    pub fn result(&self) -> Option<bool> {
        *self.sender.borrow()
    }

    /// Wait until the source resolves. Returns immediately if it already has.
    pub async fn wait(&self) -> bool {
        let mut receiver = self.sender.subscribe();
        loop {
            if let Some(result) = *receiver.borrow_and_update() {
                return result;
            }
            if receiver.changed().await.is_err() {
                return false;
            }
        }
    }
}

impl Default for InitComplete {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether an HTTP error status leaves any hope of a retry succeeding. Authorization failures
/// are permanent: the SDK key is wrong, and no amount of reconnecting will fix it.
pub(crate) fn is_http_error_recoverable(status: u16) -> bool {
    !matches!(status, 401 | 403)
}

/// A producer of flag data. Implementations push everything they receive through the
/// [UpdateSink] and report their health through it as well.
pub trait DataSource: Send + Sync {
    /// Begin delivering data. Must not block: long-running work belongs on a spawned task that
    /// terminates when `shutdown` fires.
    fn start(
        &self,
        sink: Arc<UpdateSink>,
        init_complete: Arc<InitComplete>,
        shutdown: broadcast::Receiver<()>,
    );
}

/// The data source used when flag data is delivered entirely out-of-band (for example by a
/// separate process writing to a shared persistent store). It performs no I/O and immediately
/// reports itself healthy.
pub struct NullDataSource;

impl DataSource for NullDataSource {
    fn start(
        &self,
        sink: Arc<UpdateSink>,
        init_complete: Arc<InitComplete>,
        _shutdown: broadcast::Receiver<()>,
    ) {
        sink.update_status(DataSourceState::Valid, None);
        init_complete.complete(true);
    }
}

/// An in-process data source fed by hand: the initial dataset is stored on start, and further
/// updates can be pushed at any time. Useful in tests and embedded setups.
pub struct TestDataSource {
    initial: Mutex<AllData>,
    sink: Mutex<Option<Arc<UpdateSink>>>,
}

impl TestDataSource {
    pub fn new(initial: AllData) -> Arc<Self> {
        Arc::new(Self {
            initial: Mutex::new(initial),
            sink: Mutex::new(None),
        })
    }

    /// Push a single-item update, as a stream patch would. Returns false until the source has
    /// been started.
    pub fn update(&self, key: &str, item: PatchTarget) -> bool {
        match self.sink.lock().as_ref() {
            Some(sink) => sink.upsert(key, item),
            None => false,
        }
    }

    /// Replace the full dataset, as a stream put would.
    pub fn replace_all(&self, data: AllData) -> bool {
        match self.sink.lock().as_ref() {
            Some(sink) => {
                let applied = sink.init(data);
                if applied {
                    sink.update_status(DataSourceState::Valid, None);
                }
                applied
            }
            None => false,
        }
    }
}

impl DataSource for TestDataSource {
    fn start(
        &self,
        sink: Arc<UpdateSink>,
        init_complete: Arc<InitComplete>,
        _shutdown: broadcast::Receiver<()>,
    ) {
        let initial = self.initial.lock().clone();
        let stored = sink.init(initial);
        *self.sink.lock() = Some(Arc::clone(&sink));
        if stored {
            sink.update_status(DataSourceState::Valid, None);
        }
        init_complete.complete(stored);
    }
}
