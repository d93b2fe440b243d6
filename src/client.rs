use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hmac::{Hmac, Mac};
use log::warn;
use parking_lot::{Mutex, RwLock};
use sha2::Sha256;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::broadcast::{ChangeBroadcaster, FlagTracker};
use crate::config::{Config, DataSourceConfig};
use crate::data_source::{DataSource, InitComplete, NullDataSource};
use crate::eval::{self, evaluate, Detail};
use crate::flag_value::FlagValue;
use crate::polling::PollingDataSource;
use crate::status::StatusBroadcaster;
use crate::store::{DataStore, Store};
use crate::streaming::StreamingDataSource;
use crate::update_sink::UpdateSink;
use crate::user::User;

type HmacSha256 = Hmac<Sha256>;

/// Error returned by [Client::build] for configurations that can never work.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),
}

// Owns the data source lifecycle so it can be restarted (for a full re-sync) or stopped, from
// either the client or a background callback.
struct SourceRunner {
    data_source: Option<Arc<dyn DataSource>>,
    sink: Arc<UpdateSink>,
    init_complete: Arc<InitComplete>,
    shutdown: Mutex<Option<broadcast::Sender<()>>>,
}

impl SourceRunner {
    fn start(&self) {
        let mut shutdown = self.shutdown.lock();
        if let Some(previous) = shutdown.take() {
            let _ = previous.send(());
        }
        match &self.data_source {
            Some(data_source) => {
                let (tx, rx) = broadcast::channel(2);
                data_source.start(Arc::clone(&self.sink), Arc::clone(&self.init_complete), rx);
                *shutdown = Some(tx);
            }
            // offline: there is nothing to fetch, so the client is as ready as it will ever be
            None => self.init_complete.complete(true),
        }
    }

    fn stop(&self) {
        if let Some(shutdown) = self.shutdown.lock().take() {
            let _ = shutdown.send(());
        }
    }
}

/// The top-level SDK client: holds the local flag replica, runs the data source that keeps it
/// current, and answers variation queries from memory.
///
/// Construction does not touch the network; call [Client::start] from within an async runtime
/// to begin fetching data, and [Client::wait_for_initialization] to find out when the first
/// dataset has arrived.
pub struct Client {
    sdk_key: String,
    offline: bool,
    store: Arc<RwLock<Box<dyn DataStore>>>,
    status_broadcaster: Arc<StatusBroadcaster>,
    flag_broadcaster: Arc<ChangeBroadcaster>,
    init_complete: Arc<InitComplete>,
    runner: Arc<SourceRunner>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl Client {
    pub fn build(config: Config) -> Result<Self, BuildError> {
        let requires_key = !config.offline
            && matches!(
                config.data_source,
                DataSourceConfig::Streaming | DataSourceConfig::Polling
            );
        if requires_key && config.sdk_key.is_empty() {
            return Err(BuildError::InvalidConfig(
                "sdk_key must not be empty".into(),
            ));
        }

        let store: Arc<RwLock<Box<dyn DataStore>>> =
            Arc::new(RwLock::new(config.data_store_factory.build()));
        let flag_broadcaster = ChangeBroadcaster::new();
        let status_broadcaster = Arc::new(StatusBroadcaster::new(config.outage_timeout));
        let sink = UpdateSink::new(
            Arc::clone(&store),
            Arc::clone(&flag_broadcaster),
            Arc::clone(&status_broadcaster),
        );

        let data_source: Option<Arc<dyn DataSource>> = if config.offline {
            None
        } else {
            Some(match &config.data_source {
                DataSourceConfig::Streaming => Arc::new(StreamingDataSource::new(
                    config.http_client(),
                    &config.service_endpoints.stream_uri,
                    config.initial_reconnect_delay,
                )),
                DataSourceConfig::Polling => Arc::new(PollingDataSource::new(
                    config.http_client(),
                    &config.service_endpoints.base_uri,
                    config.poll_interval,
                )),
                DataSourceConfig::ExternalOnly => Arc::new(NullDataSource),
                DataSourceConfig::Custom(source) => Arc::clone(source),
            })
        };

        let runner = Arc::new(SourceRunner {
            data_source,
            sink: Arc::clone(&sink),
            init_complete: Arc::new(InitComplete::new()),
            shutdown: Mutex::new(None),
        });

        // a persistent store that recovers with stale contents asks the source to resend
        let refresh_runner = Arc::clone(&runner);
        sink.set_refresh_hook(Box::new(move || {
            warn!("data store recovered with possibly stale data; restarting data source");
            refresh_runner.start();
        }));

        Ok(Self {
            sdk_key: config.sdk_key,
            offline: config.offline,
            store,
            status_broadcaster,
            flag_broadcaster,
            init_complete: Arc::clone(&runner.init_complete),
            runner,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Begin fetching flag data. Must be called inside a tokio runtime unless the client is
    /// offline. Calling it more than once has no effect.
    pub fn start(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.runner.start();
    }

    /// Resolves once the data source has either stored its first full dataset (`true`) or shut
    /// down permanently without one (`false`).
    pub async fn wait_for_initialization(&self) -> bool {
        self.init_complete.wait().await
    }

    /// Whether the client has flag data to evaluate against (or is offline, in which case it is
    /// always considered initialized).
    pub fn initialized(&self) -> bool {
        self.offline || self.init_complete.result() == Some(true)
    }

    /// Shut everything down: the data source connection, its timers, and all background tasks.
    /// Safe to call repeatedly and from listener callbacks.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.runner.stop();
        self.flag_broadcaster.clear_listeners();
        self.status_broadcaster.shutdown();
    }

    /// The HMAC-SHA256 of the user key under the SDK key, for use with secure mode in
    /// client-side SDKs.
    pub fn secure_mode_hash(&self, user: &User) -> String {
        let mut mac = HmacSha256::new_from_slice(self.sdk_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(user.key().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Observe flag changes and per-user value changes.
    pub fn flag_tracker(&self) -> FlagTracker {
        let store = Arc::clone(&self.store);
        FlagTracker::new(
            Arc::clone(&self.flag_broadcaster),
            Arc::new(move |flag_key, user| {
                let store = store.read();
                match store.flag(flag_key) {
                    Some(flag) => evaluate(store.to_store(), &flag, user, None)
                        .map(|v| v.clone())
                        .value
                        .unwrap_or(FlagValue::Json(serde_json::Value::Null)),
                    None => FlagValue::Json(serde_json::Value::Null),
                }
            }),
        )
    }

    /// Current data source status, and registration point for status listeners.
    pub fn data_source_status_provider(&self) -> Arc<StatusBroadcaster> {
        Arc::clone(&self.status_broadcaster)
    }

    pub fn bool_variation(&self, user: &User, flag_key: &str, default: bool) -> bool {
        self.bool_variation_detail(user, flag_key, default)
            .value
            .unwrap_or(default)
    }

    pub fn bool_variation_detail(
        &self,
        user: &User,
        flag_key: &str,
        default: bool,
    ) -> Detail<bool> {
        self.variation_detail(user, flag_key, default.into())
            .try_map(|v| v.as_bool(), default, eval::Error::WrongType)
    }

    pub fn str_variation(&self, user: &User, flag_key: &str, default: String) -> String {
        self.str_variation_detail(user, flag_key, default.clone())
            .value
            .unwrap_or(default)
    }

    pub fn str_variation_detail(
        &self,
        user: &User,
        flag_key: &str,
        default: String,
    ) -> Detail<String> {
        self.variation_detail(user, flag_key, default.clone().into())
            .try_map(|v| v.as_string(), default, eval::Error::WrongType)
    }

    pub fn int_variation(&self, user: &User, flag_key: &str, default: i64) -> i64 {
        self.int_variation_detail(user, flag_key, default)
            .value
            .unwrap_or(default)
    }

    pub fn int_variation_detail(
        &self,
        user: &User,
        flag_key: &str,
        default: i64,
    ) -> Detail<i64> {
        self.variation_detail(user, flag_key, default.into())
            .try_map(|v| v.as_int(), default, eval::Error::WrongType)
    }

    pub fn float_variation(&self, user: &User, flag_key: &str, default: f64) -> f64 {
        self.float_variation_detail(user, flag_key, default)
            .value
            .unwrap_or(default)
    }

    pub fn float_variation_detail(
        &self,
        user: &User,
        flag_key: &str,
        default: f64,
    ) -> Detail<f64> {
        self.variation_detail(user, flag_key, default.into())
            .try_map(|v| v.as_float(), default, eval::Error::WrongType)
    }

    pub fn json_variation(
        &self,
        user: &User,
        flag_key: &str,
        default: serde_json::Value,
    ) -> serde_json::Value {
        self.variation_detail(user, flag_key, FlagValue::Json(default.clone()))
            .map(|v| v.as_json())
            .value
            .unwrap_or(default)
    }

    /// The untyped evaluation everything else is built on.
    pub fn variation_detail(
        &self,
        user: &User,
        flag_key: &str,
        default: FlagValue,
    ) -> Detail<FlagValue> {
        let store = self.store.read();

        // "not ready" only applies while the outcome of the first fetch is still unknown; a
        // source that has shut down permanently serves whatever is cached
        let resolved = self.offline || self.init_complete.result().is_some();
        if !resolved && !store.is_initialized() {
            return Detail::err_default(eval::Error::ClientNotReady, default);
        }

        match store.flag(flag_key) {
            Some(flag) => evaluate(store.to_store(), &flag, user, None)
                .map(|v| v.clone())
                .or(default),
            None => Detail::err_default(eval::Error::FlagNotFound, default),
        }
    }

    /// Evaluate every flag in the store for one user.
    pub fn all_flags_detail(&self, user: &User) -> HashMap<String, Detail<FlagValue>> {
        let store = self.store.read();
        store
            .all_flags()
            .iter()
            .map(|(key, flag)| {
                let detail = evaluate(store.to_store(), flag, user, None).map(|v| v.clone());
                (key.clone(), detail)
            })
            .collect()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}
