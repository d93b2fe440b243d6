use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use crate::data_source::{is_http_error_recoverable, DataSource, InitComplete};
use crate::status::{DataSourceState, ErrorInfo};
use crate::store::AllData;
use crate::update_sink::UpdateSink;

/// A data source that fetches the full dataset on a fixed interval.
///
/// Each cycle issues a conditional GET; a 304 means the cached data is still current and no
/// write happens. Unauthorized responses stop the task permanently, everything else is retried
/// on the next tick.
pub struct PollingDataSource {
    base_uri: String,
    http: reqwest::Client,
    poll_interval: Duration,
}

impl PollingDataSource {
    pub(crate) fn new(http: reqwest::Client, base_uri: &str, poll_interval: Duration) -> Self {
        Self {
            base_uri: base_uri.trim_end_matches('/').to_string(),
            http,
            poll_interval,
        }
    }
}

impl DataSource for PollingDataSource {
    fn start(
        &self,
        sink: Arc<UpdateSink>,
        init_complete: Arc<InitComplete>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut requester = FeatureRequester::new(
            self.http.clone(),
            format!("{}/sdk/latest-all", self.base_uri),
        );
        let poll_interval = self.poll_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    _ = interval.tick() => {}
                }

                let outcome = tokio::select! {
                    _ = shutdown.recv() => return,
                    outcome = requester.fetch() => outcome,
                };

                match outcome {
                    FetchResult::Fresh(data) => {
                        debug!("poll returned a new dataset");
                        if sink.init(data) {
                            sink.update_status(DataSourceState::Valid, None);
                            if init_complete.result().is_none() {
                                info!("data source successfully initialized");
                                init_complete.complete(true);
                            }
                        }
                        // a store failure has already been reported by the sink; the next tick
                        // re-fetches regardless
                    }
                    FetchResult::NotModified => {
                        debug!("poll returned 304, data is current");
                        sink.update_status(DataSourceState::Valid, None);
                    }
                    FetchResult::Recoverable(error) => {
                        warn!("poll failed ({}), will retry", error.message);
                        sink.update_status(DataSourceState::Interrupted, Some(error));
                    }
                    FetchResult::Unrecoverable(error) => {
                        error!(
                            "poll returned {}; the SDK key is not authorized, giving up",
                            error.message
                        );
                        sink.update_status(DataSourceState::Off, Some(error));
                        init_complete.complete(false);
                        return;
                    }
                }
            }
        });
    }
}

enum FetchResult {
    Fresh(AllData),
    NotModified,
    Recoverable(ErrorInfo),
    Unrecoverable(ErrorInfo),
}

/// Issues the actual HTTP fetches. The ETag from the last successful response lives here, so
/// every fetch after the first is conditional.
struct FeatureRequester {
    http: reqwest::Client,
    uri: String,
    etag: Option<String>,
}

impl FeatureRequester {
    fn new(http: reqwest::Client, uri: String) -> Self {
        Self {
            http,
            uri,
            etag: None,
        }
    }

    async fn fetch(&mut self) -> FetchResult {
        let mut request = self.http.get(&self.uri);
        if let Some(etag) = &self.etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return FetchResult::Recoverable(ErrorInfo::network_error(e.to_string())),
        };

        let status = response.status();
        if status == reqwest::StatusCode::NOT_MODIFIED {
            return FetchResult::NotModified;
        }
        if !status.is_success() {
            let code = status.as_u16();
            let error = ErrorInfo::error_response(code);
            return if is_http_error_recoverable(code) {
                FetchResult::Recoverable(error)
            } else {
                FetchResult::Unrecoverable(error)
            };
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string);

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return FetchResult::Recoverable(ErrorInfo::network_error(e.to_string())),
        };

        match serde_json::from_str::<AllData>(&body) {
            Ok(data) => {
                self.etag = etag;
                FetchResult::Fresh(data)
            }
            Err(e) => FetchResult::Recoverable(ErrorInfo::invalid_data(format!(
                "unparseable poll response: {}",
                e
            ))),
        }
    }
}
