use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use log::{debug, error};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;

/// Lifecycle states of a data source.
///
/// `Initializing` is entered exactly once, at construction, and is never returned to: early
/// interruptions are folded into it so that an application can treat "still initializing" as a
/// single condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataSourceState {
    /// No data has ever been received.
    Initializing,
    /// The connection is healthy and data is current.
    Valid,
    /// The connection has failed; cached data is being served while the source reconnects.
    Interrupted,
    /// The data source has shut down permanently and will not reconnect.
    Off,
}

/// Classification of a data source failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A transport-level problem: connection refused, reset, timed out.
    NetworkError,
    /// The service answered with a non-success HTTP status.
    ErrorResponse,
    /// The service answered, but the payload could not be understood.
    InvalidData,
    /// The data store rejected a write.
    StoreError,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::ErrorResponse => "ERROR_RESPONSE",
            ErrorKind::InvalidData => "INVALID_DATA",
            ErrorKind::StoreError => "STORE_ERROR",
            ErrorKind::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Details of the most recent data source failure.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    /// HTTP status, for [ErrorKind::ErrorResponse].
    pub status_code: Option<u16>,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl ErrorInfo {
    fn new(kind: ErrorKind, status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind,
            status_code,
            message: message.into(),
            time: Utc::now(),
        }
    }

    pub fn network_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkError, None, message)
    }

    pub fn error_response(status_code: u16) -> Self {
        Self::new(
            ErrorKind::ErrorResponse,
            Some(status_code),
            format!("HTTP error {}", status_code),
        )
    }

    pub fn invalid_data(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidData, None, message)
    }

    pub fn store_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StoreError, None, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, None, message)
    }

    fn outage_label(&self) -> String {
        match (self.kind, self.status_code) {
            (ErrorKind::ErrorResponse, Some(code)) => format!("{}({})", self.kind, code),
            _ => self.kind.to_string(),
        }
    }
}

/// A snapshot of the data source's condition.
#[derive(Clone, Debug, PartialEq)]
pub struct DataSourceStatus {
    pub state: DataSourceState,
    /// When the current state was entered.
    pub state_since: DateTime<Utc>,
    /// The most recent failure, regardless of the current state. Never cleared once set.
    pub last_error: Option<ErrorInfo>,
}

type StatusListener = Arc<dyn Fn(DataSourceStatus) + Send + Sync>;

/// Identifies a registered listener so it can be removed later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenerHandle(usize);

impl ListenerHandle {
    pub(crate) fn new(id: usize) -> Self {
        Self(id)
    }

    pub(crate) fn id(&self) -> usize {
        self.0
    }
}

/// Holds the current [DataSourceStatus] and notifies listeners when it changes.
pub struct StatusBroadcaster {
    status: RwLock<DataSourceStatus>,
    listeners: RwLock<HashMap<usize, StatusListener>>,
    next_listener_id: Mutex<usize>,
    outage: Option<Arc<OutageTracker>>,
}

impl StatusBroadcaster {
    pub fn new(outage_timeout: Option<Duration>) -> Self {
        Self {
            status: RwLock::new(DataSourceStatus {
                state: DataSourceState::Initializing,
                state_since: Utc::now(),
                last_error: None,
            }),
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: Mutex::new(0),
            outage: outage_timeout.map(|timeout| Arc::new(OutageTracker::new(timeout))),
        }
    }

    pub fn status(&self) -> DataSourceStatus {
        self.status.read().clone()
    }

    pub fn add_listener(&self, listener: StatusListener) -> ListenerHandle {
        let mut next_id = self.next_listener_id.lock();
        let id = *next_id;
        *next_id += 1;
        self.listeners.write().insert(id, listener);
        ListenerHandle::new(id)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.listeners.write().remove(&handle.id());
    }

    /// Detach all listeners and disarm any pending outage timer. Called on client shutdown.
    pub(crate) fn shutdown(&self) {
        self.listeners.write().clear();
        if let Some(outage) = &self.outage {
            outage.disarm();
        }
    }

    /// Apply a state report from the data source.
    ///
    /// A report that changes nothing is dropped. An `Interrupted` report received while still
    /// `Initializing` keeps the state at `Initializing` (the failure details are still
    /// recorded). A missing error leaves the previous `last_error` intact.
    pub(crate) fn update(&self, new_state: DataSourceState, error: Option<ErrorInfo>) {
        let updated = {
            let mut status = self.status.write();

            let new_state = if status.state == DataSourceState::Initializing
                && new_state == DataSourceState::Interrupted
            {
                DataSourceState::Initializing
            } else {
                new_state
            };

            let state_changed = status.state != new_state;
            let error_changed = match &error {
                None => false,
                Some(e) => status.last_error.as_ref() != Some(e),
            };

            if !state_changed && !error_changed {
                None
            } else {
                if state_changed {
                    status.state = new_state;
                    status.state_since = Utc::now();
                }
                if let Some(e) = error {
                    status.last_error = Some(e);
                }
                Some(status.clone())
            }
        };

        if let Some(status) = &updated {
            if let Some(outage) = &self.outage {
                outage.track(status.state, status.last_error.as_ref());
            }
            let listeners = self.listeners.read().values().cloned().collect::<Vec<_>>();
            for listener in listeners {
                listener(status.clone());
            }
        } else if let Some(outage) = &self.outage {
            // repeated identical failures still count toward the outage tally
            if new_state != DataSourceState::Valid {
                let status = self.status.read();
                outage.track(status.state, status.last_error.as_ref());
            }
        }
    }
}

/// Aggregates failures seen during a continuous non-[DataSourceState::Valid] interval.
///
/// When an outage has lasted longer than the configured timeout, a single summary line is
/// logged enumerating every distinct error and how often it occurred, instead of one line per
/// failure.
struct OutageTracker {
    timeout: Duration,
    state: Mutex<OutageState>,
}

#[derive(Default)]
struct OutageState {
    in_outage: bool,
    // bumped whenever an outage starts or ends, so a timer from a stale window never fires
    generation: u64,
    error_counts: HashMap<String, usize>,
    emitted: Option<String>,
}

impl OutageTracker {
    fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(OutageState::default()),
        }
    }

    fn track(self: &Arc<Self>, source_state: DataSourceState, error: Option<&ErrorInfo>) {
        if source_state == DataSourceState::Valid {
            self.disarm();
            return;
        }

        let armed_generation = {
            let mut state = self.state.lock();
            if let Some(error) = error {
                *state.error_counts.entry(error.outage_label()).or_insert(0) += 1;
            }
            if state.in_outage {
                None
            } else {
                state.in_outage = true;
                state.generation += 1;
                Some(state.generation)
            }
        };

        if let Some(generation) = armed_generation {
            match Handle::try_current() {
                Ok(handle) => {
                    let tracker = Arc::clone(self);
                    let timeout = self.timeout;
                    handle.spawn(async move {
                        tokio::time::sleep(timeout).await;
                        if let Some(summary) = tracker.flush_summary(generation) {
                            error!(
                                "A streaming outage has lasted at least {:?} with the following errors: {}",
                                timeout, summary
                            );
                        }
                    });
                }
                Err(_) => debug!("no async runtime available, outage logging disabled"),
            }
        }
    }

    fn disarm(&self) {
        let mut state = self.state.lock();
        state.in_outage = false;
        state.generation += 1;
        state.error_counts.clear();
        state.emitted = None;
    }

    /// Produce the summary for the outage window `generation`, or None if the source recovered
    /// in the meantime.
    fn flush_summary(&self, generation: u64) -> Option<String> {
        let mut state = self.state.lock();
        if !state.in_outage || state.generation != generation || state.emitted.is_some() {
            return None;
        }
        let summary = state
            .error_counts
            .iter()
            .sorted_by(|a, b| a.0.cmp(b.0))
            .map(|(label, count)| {
                format!(
                    "{} ({} {})",
                    label,
                    count,
                    if *count == 1 { "time" } else { "times" }
                )
            })
            .join(", ");
        state.emitted = Some(summary.clone());
        Some(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn broadcaster() -> StatusBroadcaster {
        StatusBroadcaster::new(None)
    }

    #[test]
    fn starts_initializing() {
        let b = broadcaster();
        assert_eq!(b.status().state, DataSourceState::Initializing);
        assert!(b.status().last_error.is_none());
    }

    #[test]
    fn interrupted_while_initializing_stays_initializing() {
        let b = broadcaster();
        b.update(
            DataSourceState::Interrupted,
            Some(ErrorInfo::error_response(503)),
        );

        let status = b.status();
        assert_eq!(status.state, DataSourceState::Initializing);
        assert_eq!(
            status.last_error.map(|e| e.kind),
            Some(ErrorKind::ErrorResponse),
            "the failure is still recorded"
        );
    }

    #[test]
    fn interrupted_after_valid_is_interrupted() {
        let b = broadcaster();
        b.update(DataSourceState::Valid, None);
        b.update(
            DataSourceState::Interrupted,
            Some(ErrorInfo::network_error("conn reset")),
        );
        assert_eq!(b.status().state, DataSourceState::Interrupted);
    }

    #[test]
    fn never_returns_to_initializing() {
        let b = broadcaster();
        b.update(DataSourceState::Valid, None);
        b.update(DataSourceState::Interrupted, None);
        b.update(DataSourceState::Valid, None);
        assert_eq!(b.status().state, DataSourceState::Valid);
        b.update(DataSourceState::Off, Some(ErrorInfo::error_response(401)));
        assert_eq!(b.status().state, DataSourceState::Off);
    }

    #[test]
    fn missing_error_leaves_last_error_intact() {
        let b = broadcaster();
        b.update(
            DataSourceState::Interrupted,
            Some(ErrorInfo::error_response(500)),
        );
        b.update(DataSourceState::Valid, None);

        let status = b.status();
        assert_eq!(status.state, DataSourceState::Valid);
        assert_eq!(
            status.last_error.map(|e| e.status_code),
            Some(Some(500)),
            "a None error does not clear the previous one"
        );
    }

    #[test]
    fn state_since_only_moves_on_state_change() {
        let b = broadcaster();
        b.update(DataSourceState::Valid, None);
        let since = b.status().state_since;

        b.update(DataSourceState::Valid, None);
        assert_eq!(b.status().state_since, since);
    }

    #[test]
    fn listeners_fire_only_on_observable_change() {
        let b = broadcaster();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        b.add_listener(Arc::new(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        b.update(DataSourceState::Valid, None);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // identical report: no event
        b.update(DataSourceState::Valid, None);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // same state but a fresh error is observable
        b.update(DataSourceState::Valid, Some(ErrorInfo::network_error("x")));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let b = broadcaster();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let handle = b.add_listener(Arc::new(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));
        b.remove_listener(handle);
        b.update(DataSourceState::Valid, None);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn outage_summary_counts_distinct_errors() {
        let tracker = Arc::new(OutageTracker::new(Duration::from_millis(100)));

        tracker.track(
            DataSourceState::Interrupted,
            Some(&ErrorInfo::error_response(501)),
        );
        tracker.track(
            DataSourceState::Interrupted,
            Some(&ErrorInfo::error_response(502)),
        );
        tracker.track(
            DataSourceState::Interrupted,
            Some(&ErrorInfo::network_error("io")),
        );
        tracker.track(
            DataSourceState::Interrupted,
            Some(&ErrorInfo::error_response(501)),
        );

        let generation = tracker.state.lock().generation;
        let summary = tracker.flush_summary(generation).expect("still in outage");
        assert!(summary.contains("NETWORK_ERROR (1 time)"), "was: {}", summary);
        assert!(summary.contains("ERROR_RESPONSE(501) (2 times)"), "was: {}", summary);
        assert!(summary.contains("ERROR_RESPONSE(502) (1 time)"), "was: {}", summary);
    }

    #[test]
    fn recovery_before_timeout_cancels_summary() {
        let tracker = Arc::new(OutageTracker::new(Duration::from_millis(100)));

        tracker.track(
            DataSourceState::Interrupted,
            Some(&ErrorInfo::error_response(500)),
        );
        let generation = tracker.state.lock().generation;
        tracker.track(DataSourceState::Valid, None);

        assert!(tracker.flush_summary(generation).is_none());
        assert!(
            tracker.state.lock().error_counts.is_empty(),
            "tally resets on recovery"
        );
    }

    #[tokio::test]
    async fn outage_timer_emits_one_aggregated_line() {
        let b = StatusBroadcaster::new(Some(Duration::from_millis(100)));

        // a blip that recovers quickly produces nothing
        b.update(DataSourceState::Valid, None);
        b.update(
            DataSourceState::Interrupted,
            Some(ErrorInfo::error_response(500)),
        );
        b.update(DataSourceState::Valid, None);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(b.outage.as_ref().unwrap().state.lock().emitted.is_none());

        // a sustained burst is summarized once
        b.update(
            DataSourceState::Interrupted,
            Some(ErrorInfo::error_response(501)),
        );
        b.update(
            DataSourceState::Interrupted,
            Some(ErrorInfo::error_response(502)),
        );
        b.update(
            DataSourceState::Interrupted,
            Some(ErrorInfo::network_error("io")),
        );
        b.update(
            DataSourceState::Interrupted,
            Some(ErrorInfo::error_response(501)),
        );
        tokio::time::sleep(Duration::from_millis(200)).await;

        let emitted = b.outage.as_ref().unwrap().state.lock().emitted.clone();
        let emitted = emitted.expect("summary should have been emitted");
        assert!(emitted.contains("NETWORK_ERROR (1 time)"), "was: {}", emitted);
        assert!(emitted.contains("ERROR_RESPONSE(501) (2 times)"), "was: {}", emitted);
        assert!(emitted.contains("ERROR_RESPONSE(502) (1 time)"), "was: {}", emitted);
    }
}
