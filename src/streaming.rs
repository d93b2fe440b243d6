use std::sync::Arc;
use std::time::{Duration, Instant};

use eventsource_stream::Eventsource;
use futures::StreamExt;
use log::{debug, error, info, warn};
use rand::Rng;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

use crate::data_source::{is_http_error_recoverable, DataSource, InitComplete};
use crate::flag::Flag;
use crate::segment::Segment;
use crate::status::{DataSourceState, ErrorInfo};
use crate::store::{AllData, DataKind, PatchTarget, StorageItem};
use crate::update_sink::UpdateSink;

// Five minutes of silence means the connection is dead even if TCP has not noticed.
const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
// A connection held this long counts as sustained and resets the backoff.
const CONNECTION_RESET_INTERVAL: Duration = Duration::from_secs(60);

/// A data source that keeps a server-sent-event connection open and feeds every message into
/// the update sink.
///
/// The stream carries three message types: `put` (a full dataset), `patch` (one flag or
/// segment), and `delete` (a tombstone). Reconnects use exponential backoff with decorrelated
/// jitter; 401/403 responses shut the source down for good.
pub struct StreamingDataSource {
    stream_base_uri: String,
    http: reqwest::Client,
    initial_reconnect_delay: Duration,
}

impl StreamingDataSource {
    pub(crate) fn new(
        http: reqwest::Client,
        stream_base_uri: &str,
        initial_reconnect_delay: Duration,
    ) -> Self {
        Self {
            stream_base_uri: stream_base_uri.trim_end_matches('/').to_string(),
            http,
            initial_reconnect_delay,
        }
    }
}

impl DataSource for StreamingDataSource {
    fn start(
        &self,
        sink: Arc<UpdateSink>,
        init_complete: Arc<InitComplete>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let uri = format!("{}/all", self.stream_base_uri);
        let http = self.http.clone();
        let mut backoff = Backoff::new(
            self.initial_reconnect_delay,
            MAX_RECONNECT_DELAY,
            CONNECTION_RESET_INTERVAL,
        );

        tokio::spawn(async move {
            loop {
                let delay = backoff.next_delay();
                if !delay.is_zero() {
                    debug!("waiting {:?} before reconnecting event stream", delay);
                    tokio::select! {
                        _ = shutdown.recv() => return,
                        _ = sleep(delay) => {}
                    }
                }

                debug!("connecting to event stream at {}", uri);
                let response = tokio::select! {
                    _ = shutdown.recv() => return,
                    r = http.get(&uri).header("Accept", "text/event-stream").send() => r,
                };

                let response = match response {
                    Ok(response) => response,
                    Err(e) => {
                        warn!("event stream connection failed: {}", e);
                        sink.update_status(
                            DataSourceState::Interrupted,
                            Some(ErrorInfo::network_error(e.to_string())),
                        );
                        continue;
                    }
                };

                let status = response.status();
                if !status.is_success() {
                    let code = status.as_u16();
                    if is_http_error_recoverable(code) {
                        warn!("event stream returned HTTP {}, will retry", code);
                        sink.update_status(
                            DataSourceState::Interrupted,
                            Some(ErrorInfo::error_response(code)),
                        );
                        continue;
                    }
                    error!(
                        "event stream returned HTTP {}; the SDK key is not authorized, giving up",
                        code
                    );
                    sink.update_status(
                        DataSourceState::Off,
                        Some(ErrorInfo::error_response(code)),
                    );
                    init_complete.complete(false);
                    return;
                }

                backoff.mark_connected();
                let events = response.bytes_stream().eventsource();
                tokio::pin!(events);

                // each connection is a fresh run for store-failure logging purposes
                let mut store_failure_logged = false;

                'read: loop {
                    let next = tokio::select! {
                        _ = shutdown.recv() => return,
                        n = timeout(STREAM_READ_TIMEOUT, events.next()) => n,
                    };

                    let event = match next {
                        Err(_) => {
                            warn!(
                                "event stream silent for {:?}, restarting connection",
                                STREAM_READ_TIMEOUT
                            );
                            sink.update_status(
                                DataSourceState::Interrupted,
                                Some(ErrorInfo::network_error("stream read timeout")),
                            );
                            break 'read;
                        }
                        Ok(None) => {
                            warn!("event stream closed by server, restarting connection");
                            sink.update_status(
                                DataSourceState::Interrupted,
                                Some(ErrorInfo::network_error("stream closed by server")),
                            );
                            break 'read;
                        }
                        Ok(Some(Err(e))) => {
                            warn!("event stream read error: {}", e);
                            sink.update_status(
                                DataSourceState::Interrupted,
                                Some(ErrorInfo::network_error(e.to_string())),
                            );
                            break 'read;
                        }
                        Ok(Some(Ok(event))) => event,
                    };

                    match apply_message(&sink, &event.event, &event.data) {
                        MessageOutcome::Applied { first_dataset } => {
                            sink.update_status(DataSourceState::Valid, None);
                            if first_dataset && init_complete.result().is_none() {
                                info!("data source successfully initialized");
                                init_complete.complete(true);
                            }
                        }
                        MessageOutcome::Ignored => {}
                        MessageOutcome::InvalidData(message) => {
                            warn!("malformed event stream message: {}", message);
                            sink.update_status(
                                DataSourceState::Interrupted,
                                Some(ErrorInfo::invalid_data(message)),
                            );
                            break 'read;
                        }
                        MessageOutcome::StoreFailure => {
                            // the sink has already reported the failure; what is left to decide
                            // is how the data gets re-synced
                            if sink.store_monitors_status() {
                                if !store_failure_logged {
                                    warn!("data store write failed; waiting for the store to recover");
                                    store_failure_logged = true;
                                }
                            } else {
                                if !store_failure_logged {
                                    warn!("data store write failed; restarting stream to re-synchronize");
                                    store_failure_logged = true;
                                }
                                break 'read;
                            }
                        }
                    }
                }
            }
        });
    }
}

enum MessageOutcome {
    Applied { first_dataset: bool },
    Ignored,
    InvalidData(String),
    StoreFailure,
}

#[derive(Deserialize)]
struct PutData {
    data: AllData,
}

#[derive(Deserialize)]
struct PatchData {
    path: String,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct DeleteData {
    path: String,
    version: u64,
}

fn apply_message(sink: &UpdateSink, event_type: &str, data: &str) -> MessageOutcome {
    match event_type {
        "put" => match serde_json::from_str::<PutData>(data) {
            Ok(put) => {
                if sink.init(put.data) {
                    MessageOutcome::Applied { first_dataset: true }
                } else {
                    MessageOutcome::StoreFailure
                }
            }
            Err(e) => MessageOutcome::InvalidData(format!("unparseable put event: {}", e)),
        },
        "patch" => {
            let patch: PatchData = match serde_json::from_str(data) {
                Ok(patch) => patch,
                Err(e) => {
                    return MessageOutcome::InvalidData(format!("unparseable patch event: {}", e))
                }
            };
            let (kind, key) = match parse_item_path(&patch.path) {
                Some(target) => target,
                None => {
                    warn!("ignoring patch for unrecognized path {}", patch.path);
                    return MessageOutcome::Ignored;
                }
            };
            let item = match kind {
                DataKind::Feature => {
                    serde_json::from_value::<StorageItem<Flag>>(patch.data).map(PatchTarget::Flag)
                }
                DataKind::Segment => serde_json::from_value::<StorageItem<Segment>>(patch.data)
                    .map(PatchTarget::Segment),
            };
            match item {
                Ok(item) => {
                    if sink.upsert(key, item) {
                        MessageOutcome::Applied { first_dataset: false }
                    } else {
                        MessageOutcome::StoreFailure
                    }
                }
                Err(e) => MessageOutcome::InvalidData(format!("unparseable patch event: {}", e)),
            }
        }
        "delete" => {
            let delete: DeleteData = match serde_json::from_str(data) {
                Ok(delete) => delete,
                Err(e) => {
                    return MessageOutcome::InvalidData(format!("unparseable delete event: {}", e))
                }
            };
            let (kind, key) = match parse_item_path(&delete.path) {
                Some(target) => target,
                None => {
                    warn!("ignoring delete for unrecognized path {}", delete.path);
                    return MessageOutcome::Ignored;
                }
            };
            let item = match kind {
                DataKind::Feature => PatchTarget::Flag(StorageItem::Tombstone(delete.version)),
                DataKind::Segment => PatchTarget::Segment(StorageItem::Tombstone(delete.version)),
            };
            if sink.upsert(key, item) {
                MessageOutcome::Applied { first_dataset: false }
            } else {
                MessageOutcome::StoreFailure
            }
        }
        other => {
            debug!("ignoring unrecognized event type {}", other);
            MessageOutcome::Ignored
        }
    }
}

fn parse_item_path(path: &str) -> Option<(DataKind, &str)> {
    if let Some(key) = path.strip_prefix("/flags/") {
        Some((DataKind::Feature, key))
    } else if let Some(key) = path.strip_prefix("/segments/") {
        Some((DataKind::Segment, key))
    } else {
        None
    }
}

/// Exponential backoff with decorrelated jitter. The very first attempt is immediate; each
/// retry then waits a random duration between the base delay and three times the previous
/// delay, capped at `max`. A connection that stays up long enough resets the sequence.
struct Backoff {
    base: Duration,
    max: Duration,
    next: Duration,
    reset_interval: Duration,
    connected_at: Option<Instant>,
}

impl Backoff {
    fn new(base: Duration, max: Duration, reset_interval: Duration) -> Self {
        Self {
            base: base.min(max),
            max,
            next: Duration::ZERO,
            reset_interval,
            connected_at: None,
        }
    }

    fn mark_connected(&mut self) {
        self.connected_at = Some(Instant::now());
    }

    fn next_delay(&mut self) -> Duration {
        if let Some(connected) = self.connected_at.take() {
            if connected.elapsed() >= self.reset_interval {
                // back to the initial delay; only the very first attempt after construction
                // gets to skip the wait entirely
                self.next = self.base;
            }
        }

        let delay = self.next;

        let lower = self.base.as_millis() as u64;
        let upper = delay
            .saturating_mul(3)
            .clamp(self.base, self.max)
            .as_millis() as u64;
        self.next = if upper <= lower {
            self.base
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(lower..=upper))
        };

        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ChangeBroadcaster;
    use crate::status::StatusBroadcaster;
    use crate::store::{DataStore, InMemoryDataStore, Store};
    use crate::test_common::basic_flag;
    use parking_lot::RwLock;

    fn fixture() -> (Arc<UpdateSink>, Arc<RwLock<Box<dyn DataStore>>>) {
        let store: Arc<RwLock<Box<dyn DataStore>>> =
            Arc::new(RwLock::new(Box::new(InMemoryDataStore::new())));
        let sink = UpdateSink::new(
            Arc::clone(&store),
            ChangeBroadcaster::new(),
            Arc::new(StatusBroadcaster::new(None)),
        );
        (sink, store)
    }

    fn put_payload() -> String {
        let flag = serde_json::to_string(&basic_flag("flag1")).unwrap();
        format!(
            r#"{{"path": "/", "data": {{"flags": {{"flag1": {}}}, "segments": {{}}}}}}"#,
            flag
        )
    }

    #[test]
    fn put_event_stores_the_full_dataset() {
        let (sink, store) = fixture();
        let outcome = apply_message(&sink, "put", &put_payload());
        assert!(matches!(
            outcome,
            MessageOutcome::Applied { first_dataset: true }
        ));
        assert!(store.read().is_initialized());
        assert!(store.read().flag("flag1").is_some());
    }

    #[test]
    fn patch_event_upserts_one_item() {
        let (sink, store) = fixture();
        apply_message(&sink, "put", &put_payload());

        let mut updated = basic_flag("flag1");
        updated.version = 2;
        let patch = format!(
            r#"{{"path": "/flags/flag1", "data": {}}}"#,
            serde_json::to_string(&updated).unwrap()
        );
        let outcome = apply_message(&sink, "patch", &patch);
        assert!(matches!(
            outcome,
            MessageOutcome::Applied { first_dataset: false }
        ));
        assert_eq!(store.read().flag_item("flag1").unwrap().version(), 2);
    }

    #[test]
    fn patch_event_can_target_segments() {
        let (sink, store) = fixture();
        let patch = r#"{"path": "/segments/seg1", "data": {"key": "seg1", "version": 5}}"#;
        assert!(matches!(
            apply_message(&sink, "patch", patch),
            MessageOutcome::Applied { .. }
        ));
        assert_eq!(store.read().segment_item("seg1").unwrap().version(), 5);
    }

    #[test]
    fn delete_event_writes_a_tombstone() {
        let (sink, store) = fixture();
        apply_message(&sink, "put", &put_payload());

        let outcome = apply_message(
            &sink,
            "delete",
            r#"{"path": "/flags/flag1", "version": 9}"#,
        );
        assert!(matches!(outcome, MessageOutcome::Applied { .. }));
        assert!(store.read().flag("flag1").is_none());
        assert_eq!(
            store.read().flag_item("flag1"),
            Some(StorageItem::Tombstone(9))
        );
    }

    #[test]
    fn unknown_paths_are_ignored_not_errors() {
        let (sink, _) = fixture();
        let outcome = apply_message(
            &sink,
            "patch",
            r#"{"path": "/widgets/w1", "data": {"key": "w1", "version": 1}}"#,
        );
        assert!(matches!(outcome, MessageOutcome::Ignored));

        let outcome = apply_message(&sink, "delete", r#"{"path": "/nope", "version": 1}"#);
        assert!(matches!(outcome, MessageOutcome::Ignored));
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        let (sink, _) = fixture();
        assert!(matches!(
            apply_message(&sink, "heartbeat", "{}"),
            MessageOutcome::Ignored
        ));
    }

    #[test]
    fn malformed_payloads_are_invalid_data() {
        let (sink, _) = fixture();
        assert!(matches!(
            apply_message(&sink, "put", "{not json"),
            MessageOutcome::InvalidData(_)
        ));
        assert!(matches!(
            apply_message(&sink, "patch", r#"{"path": "/flags/x", "data": {"on": []}}"#),
            MessageOutcome::InvalidData(_)
        ));
        assert!(matches!(
            apply_message(&sink, "delete", r#"{"path": "/flags/x"}"#),
            MessageOutcome::InvalidData(_)
        ));
    }

    #[test]
    fn parse_item_path_recognizes_both_kinds() {
        assert_eq!(
            parse_item_path("/flags/my-flag"),
            Some((DataKind::Feature, "my-flag"))
        );
        assert_eq!(
            parse_item_path("/segments/my-segment"),
            Some((DataKind::Segment, "my-segment"))
        );
        assert_eq!(parse_item_path("/other/thing"), None);
    }

    #[test]
    fn first_attempt_is_immediate() {
        let mut backoff = Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(30),
            Duration::from_secs(60),
        );
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        assert!(!backoff.next_delay().is_zero());
    }

    #[test]
    fn delays_stay_within_base_and_max() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(700);
        let mut backoff = Backoff::new(base, max, Duration::from_secs(60));
        backoff.next_delay(); // discard the immediate first attempt

        for _ in 0..100 {
            let delay = backoff.next_delay();
            assert!(delay >= base, "delay {:?} under base", delay);
            assert!(delay <= max, "delay {:?} over max", delay);
        }
    }

    #[test]
    fn sustained_connection_resets_the_sequence() {
        let base = Duration::from_millis(50);
        let mut backoff = Backoff::new(base, Duration::from_secs(30), Duration::from_millis(10));
        backoff.next_delay();
        for _ in 0..5 {
            backoff.next_delay();
        }

        backoff.mark_connected();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(
            backoff.next_delay(),
            base,
            "a sustained connection drops back to the initial delay"
        );
    }

    #[test]
    fn short_lived_connection_does_not_reset() {
        let base = Duration::from_millis(50);
        let mut backoff = Backoff::new(base, Duration::from_secs(30), Duration::from_secs(60));
        backoff.next_delay();
        backoff.next_delay();

        backoff.mark_connected(); // dropped immediately
        assert!(!backoff.next_delay().is_zero());
    }
}
