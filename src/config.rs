use std::sync::Arc;
use std::time::Duration;

use log::warn;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};

use crate::data_source::DataSource;
use crate::store::{DataStoreFactory, InMemoryDataStoreFactory};

const DEFAULT_BASE_URI: &str = "https://sdk.flagstream.io";
const DEFAULT_STREAM_URI: &str = "https://stream.flagstream.io";
const DEFAULT_EVENTS_URI: &str = "https://events.flagstream.io";

const DEFAULT_SDK_USER_AGENT: &str = concat!("flagstream-server/", env!("CARGO_PKG_VERSION"));
const WRAPPER_HEADER: &str = "X-FlagStream-Wrapper";

/// Polling any faster than this just burns quota; lower configured values are clamped up.
pub const MINIMUM_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// The service URIs the SDK talks to. Only needs changing for proxies or private instances.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceEndpoints {
    pub base_uri: String,
    pub stream_uri: String,
    pub events_uri: String,
}

impl Default for ServiceEndpoints {
    fn default() -> Self {
        Self {
            base_uri: DEFAULT_BASE_URI.to_string(),
            stream_uri: DEFAULT_STREAM_URI.to_string(),
            events_uri: DEFAULT_EVENTS_URI.to_string(),
        }
    }
}

/// Which kind of data source the client should run.
#[derive(Clone)]
pub enum DataSourceConfig {
    /// A persistent server-sent-event connection. The default.
    Streaming,
    /// Periodic full fetches.
    Polling,
    /// No data source at all: flag data arrives out-of-band, for example through a shared
    /// persistent store maintained by another process.
    ExternalOnly,
    /// A caller-provided source, such as [crate::TestDataSource].
    Custom(Arc<dyn DataSource>),
}

/// Immutable client configuration. Build one with [Config::builder].
pub struct Config {
    pub(crate) sdk_key: String,
    pub(crate) offline: bool,
    pub(crate) service_endpoints: ServiceEndpoints,
    pub(crate) data_source: DataSourceConfig,
    pub(crate) poll_interval: Duration,
    pub(crate) initial_reconnect_delay: Duration,
    pub(crate) outage_timeout: Option<Duration>,
    pub(crate) data_store_factory: Arc<dyn DataStoreFactory>,
    pub(crate) wrapper_name: Option<String>,
    pub(crate) wrapper_version: Option<String>,
    pub(crate) diagnostic_opt_out: bool,
}

impl Config {
    pub fn builder(sdk_key: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(sdk_key)
    }

    pub fn sdk_key(&self) -> &str {
        &self.sdk_key
    }

    pub fn offline(&self) -> bool {
        self.offline
    }

    pub fn service_endpoints(&self) -> &ServiceEndpoints {
        &self.service_endpoints
    }

    /// Whether periodic diagnostic telemetry is disabled.
    pub fn diagnostic_opt_out(&self) -> bool {
        self.diagnostic_opt_out
    }

    pub(crate) fn http_client(&self) -> reqwest::Client {
        let mut headers = HeaderMap::new();
        match HeaderValue::from_str(&self.sdk_key) {
            Ok(value) => {
                headers.insert(AUTHORIZATION, value);
            }
            Err(_) => warn!("sdk key contains characters not permitted in a header; requests will be unauthenticated"),
        }
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_SDK_USER_AGENT));
        if let Some(wrapper) = self.wrapper_header_value() {
            if let Ok(value) = HeaderValue::from_str(&wrapper) {
                headers.insert(WRAPPER_HEADER, value);
            }
        }

        reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .expect("failed to build HTTP client")
    }

    pub(crate) fn wrapper_header_value(&self) -> Option<String> {
        let name = self.wrapper_name.as_ref()?;
        Some(match &self.wrapper_version {
            Some(version) => format!("{}/{}", name, version),
            None => name.clone(),
        })
    }
}

/// Builder for [Config]. Every option has a sensible default; only the SDK key is mandatory.
pub struct ConfigBuilder {
    sdk_key: String,
    offline: bool,
    service_endpoints: ServiceEndpoints,
    data_source: DataSourceConfig,
    poll_interval: Duration,
    initial_reconnect_delay: Duration,
    outage_timeout: Option<Duration>,
    data_store_factory: Arc<dyn DataStoreFactory>,
    wrapper_name: Option<String>,
    wrapper_version: Option<String>,
    diagnostic_opt_out: bool,
}

impl ConfigBuilder {
    pub fn new(sdk_key: impl Into<String>) -> Self {
        Self {
            sdk_key: sdk_key.into(),
            offline: false,
            service_endpoints: ServiceEndpoints::default(),
            data_source: DataSourceConfig::Streaming,
            poll_interval: DEFAULT_POLL_INTERVAL,
            initial_reconnect_delay: DEFAULT_INITIAL_RECONNECT_DELAY,
            outage_timeout: None,
            data_store_factory: Arc::new(InMemoryDataStoreFactory::new()),
            wrapper_name: None,
            wrapper_version: None,
            diagnostic_opt_out: false,
        }
    }

    /// Run with no network activity at all: no data source and no analytics. Evaluations are
    /// served from whatever the configured data store contains.
    pub fn offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn data_source(mut self, data_source: DataSourceConfig) -> Self {
        self.data_source = data_source;
        self
    }

    pub fn base_uri(mut self, uri: &str) -> Self {
        self.service_endpoints.base_uri = uri.trim_end_matches('/').to_string();
        self
    }

    pub fn stream_uri(mut self, uri: &str) -> Self {
        self.service_endpoints.stream_uri = uri.trim_end_matches('/').to_string();
        self
    }

    pub fn events_uri(mut self, uri: &str) -> Self {
        self.service_endpoints.events_uri = uri.trim_end_matches('/').to_string();
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn initial_reconnect_delay(mut self, delay: Duration) -> Self {
        self.initial_reconnect_delay = delay;
        self
    }

    /// How long the data source may stay unhealthy before a single aggregated error line is
    /// logged. None disables outage logging entirely.
    pub fn outage_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.outage_timeout = timeout;
        self
    }

    pub fn data_store_factory(mut self, factory: Arc<dyn DataStoreFactory>) -> Self {
        self.data_store_factory = factory;
        self
    }

    /// Identify a wrapper library on every request, e.g. `("my-wrapper", Some("1.2.0"))`.
    pub fn wrapper(mut self, name: &str, version: Option<&str>) -> Self {
        self.wrapper_name = Some(name.to_string());
        self.wrapper_version = version.map(ToString::to_string);
        self
    }

    pub fn diagnostic_opt_out(mut self, opt_out: bool) -> Self {
        self.diagnostic_opt_out = opt_out;
        self
    }

    pub fn build(self) -> Config {
        let poll_interval = self.poll_interval.max(MINIMUM_POLL_INTERVAL);
        if poll_interval != self.poll_interval {
            warn!(
                "configured poll interval {:?} is below the minimum, using {:?}",
                self.poll_interval, poll_interval
            );
        }

        Config {
            sdk_key: self.sdk_key,
            offline: self.offline,
            service_endpoints: self.service_endpoints,
            data_source: self.data_source,
            poll_interval,
            initial_reconnect_delay: self.initial_reconnect_delay,
            outage_timeout: self.outage_timeout,
            data_store_factory: self.data_store_factory,
            wrapper_name: self.wrapper_name,
            wrapper_version: self.wrapper_version,
            diagnostic_opt_out: self.diagnostic_opt_out,
        }
    }
}
