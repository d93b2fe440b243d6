use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::flag::Flag;
use crate::segment::Segment;

/// The read-only view of flag data required by the evaluator.
pub trait Store {
    fn flag(&self, flag_key: &str) -> Option<Flag>;

    fn segment(&self, segment_key: &str) -> Option<Segment>;
}

/// The namespaces of items a data store holds. Kinds with lower priority are written first
/// during a full init, so segments land before the flags that reference them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataKind {
    Segment,
    Feature,
}

impl DataKind {
    pub fn priority(&self) -> u8 {
        match self {
            DataKind::Segment => 0,
            DataKind::Feature => 1,
        }
    }
}

/// Anything carrying the monotonically increasing version number the store compares on.
pub trait Versioned {
    fn version(&self) -> u64;
}

impl Versioned for Flag {
    fn version(&self) -> u64 {
        self.version
    }
}

impl Versioned for Segment {
    fn version(&self) -> u64 {
        self.version
    }
}

/// A versioned slot in the store: either a live item or a tombstone left behind by a delete.
///
/// Tombstones are invisible to evaluation but participate in version comparisons, so an update
/// that raced with a delete cannot resurrect the item.
#[derive(Clone, Debug, PartialEq)]
pub enum StorageItem<T> {
    Item(T),
    Tombstone(u64),
}

impl<T: Versioned> StorageItem<T> {
    pub fn version(&self) -> u64 {
        match self {
            StorageItem::Item(item) => item.version(),
            StorageItem::Tombstone(version) => *version,
        }
    }

    pub fn item(&self) -> Option<&T> {
        match self {
            StorageItem::Item(item) => Some(item),
            StorageItem::Tombstone(_) => None,
        }
    }
}

// The wire form of a deleted item is {"deleted": true, "version": N}; anything else is the item
// itself.
impl<'de, T: DeserializeOwned> Deserialize<'de> for StorageItem<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        if value
            .get("deleted")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
        {
            let version = value
                .get("version")
                .and_then(serde_json::Value::as_u64)
                .ok_or_else(|| serde::de::Error::missing_field("version"))?;
            Ok(StorageItem::Tombstone(version))
        } else {
            serde_json::from_value(value)
                .map(StorageItem::Item)
                .map_err(serde::de::Error::custom)
        }
    }
}

impl<T: Serialize> Serialize for StorageItem<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            StorageItem::Item(item) => item.serialize(serializer),
            StorageItem::Tombstone(version) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("deleted", &true)?;
                map.serialize_entry("version", version)?;
                map.end()
            }
        }
    }
}

/// A complete dataset, as delivered by a stream `put` or a poll response.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AllData {
    #[serde(default)]
    pub flags: HashMap<String, StorageItem<Flag>>,
    #[serde(default)]
    pub segments: HashMap<String, StorageItem<Segment>>,
}

/// A single-item write, tagged with the kind it belongs to.
#[derive(Clone, Debug)]
pub enum PatchTarget {
    Flag(StorageItem<Flag>),
    Segment(StorageItem<Segment>),
}

impl PatchTarget {
    pub fn kind(&self) -> DataKind {
        match self {
            PatchTarget::Flag(_) => DataKind::Feature,
            PatchTarget::Segment(_) => DataKind::Segment,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            PatchTarget::Flag(item) => item.version(),
            PatchTarget::Segment(item) => item.version(),
        }
    }
}

/// Error produced by data store operations. For the in-memory store this never occurs;
/// persistent stores surface their backend failures through it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("data store failure: {0}")]
pub struct StoreError(pub String);

/// Availability of a data store, for implementations that can lose their backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataStoreStatus {
    /// Whether the store can currently be used.
    pub available: bool,
    /// True when the store came back but its contents may be stale, in which case the data
    /// source should be asked to resend everything.
    pub refresh_needed: bool,
}

type DataStoreStatusListener = Arc<dyn Fn(DataStoreStatus) + Send + Sync>;

/// Fan-out point for [DataStoreStatus] changes. In-memory stores have no use for this; stores
/// backed by an external service hand one out so the SDK can trigger a refresh after an outage.
#[derive(Default)]
pub struct DataStoreStatusBroadcaster {
    listeners: RwLock<Vec<DataStoreStatusListener>>,
}

impl DataStoreStatusBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: DataStoreStatusListener) {
        self.listeners.write().push(listener);
    }

    pub fn broadcast(&self, status: DataStoreStatus) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(status);
        }
    }
}

/// The full data store contract: the evaluator's read view plus versioned writes.
///
/// `init` atomically replaces everything; `upsert` applies an item only if its version is
/// higher than what is already present. All writes are serialized by the update coordinator, so
/// implementations only need interior consistency, not locking.
pub trait DataStore: Store + Send + Sync {
    fn init(&mut self, data: AllData) -> Result<(), StoreError>;

    /// Current slot for a flag key, tombstones included.
    fn flag_item(&self, key: &str) -> Option<StorageItem<Flag>>;

    /// Current slot for a segment key, tombstones included.
    fn segment_item(&self, key: &str) -> Option<StorageItem<Segment>>;

    /// Snapshot of every flag slot, tombstones included.
    fn all_flag_items(&self) -> HashMap<String, StorageItem<Flag>>;

    /// Snapshot of every segment slot, tombstones included.
    fn all_segment_items(&self) -> HashMap<String, StorageItem<Segment>>;

    /// Snapshot of live flags only, for bulk evaluation.
    fn all_flags(&self) -> HashMap<String, Flag>;

    /// Apply the item if its version is newer than the stored one. Returns whether the write
    /// took effect.
    fn upsert(&mut self, key: &str, item: PatchTarget) -> Result<bool, StoreError>;

    /// True once an `init` has succeeded.
    fn is_initialized(&self) -> bool;

    /// Availability reporting, for stores that can fail. None means the store is always
    /// available.
    fn status_broadcaster(&self) -> Option<Arc<DataStoreStatusBroadcaster>> {
        None
    }

    fn to_store(&self) -> &dyn Store;
}

/// Constructs the data store a client will use. The default builds [InMemoryDataStore].
pub trait DataStoreFactory: Send + Sync {
    fn build(&self) -> Box<dyn DataStore>;
}

/// The default store: plain maps guarded by the client's outer lock.
#[derive(Default)]
pub struct InMemoryDataStore {
    flags: HashMap<String, StorageItem<Flag>>,
    segments: HashMap<String, StorageItem<Segment>>,
    initialized: bool,
}

impl InMemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for InMemoryDataStore {
    fn flag(&self, flag_key: &str) -> Option<Flag> {
        self.flags.get(flag_key).and_then(|item| item.item()).cloned()
    }

    fn segment(&self, segment_key: &str) -> Option<Segment> {
        self.segments
            .get(segment_key)
            .and_then(|item| item.item())
            .cloned()
    }
}

impl DataStore for InMemoryDataStore {
    fn init(&mut self, data: AllData) -> Result<(), StoreError> {
        self.flags = data.flags;
        self.segments = data.segments;
        self.initialized = true;
        Ok(())
    }

    fn flag_item(&self, key: &str) -> Option<StorageItem<Flag>> {
        self.flags.get(key).cloned()
    }

    fn segment_item(&self, key: &str) -> Option<StorageItem<Segment>> {
        self.segments.get(key).cloned()
    }

    fn all_flag_items(&self) -> HashMap<String, StorageItem<Flag>> {
        self.flags.clone()
    }

    fn all_segment_items(&self) -> HashMap<String, StorageItem<Segment>> {
        self.segments.clone()
    }

    fn all_flags(&self) -> HashMap<String, Flag> {
        self.flags
            .iter()
            .filter_map(|(key, item)| item.item().map(|flag| (key.clone(), flag.clone())))
            .collect()
    }

    fn upsert(&mut self, key: &str, item: PatchTarget) -> Result<bool, StoreError> {
        match item {
            PatchTarget::Flag(item) => {
                let current_version = self.flags.get(key).map(|i| i.version());
                if current_version.map_or(true, |v| item.version() > v) {
                    self.flags.insert(key.to_string(), item);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            PatchTarget::Segment(item) => {
                let current_version = self.segments.get(key).map(|i| i.version());
                if current_version.map_or(true, |v| item.version() > v) {
                    self.segments.insert(key.to_string(), item);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn to_store(&self) -> &dyn Store {
        self
    }
}

/// Factory for [InMemoryDataStore].
#[derive(Default)]
pub struct InMemoryDataStoreFactory;

impl InMemoryDataStoreFactory {
    pub fn new() -> Self {
        Self
    }
}

impl DataStoreFactory for InMemoryDataStoreFactory {
    fn build(&self) -> Box<dyn DataStore> {
        Box::new(InMemoryDataStore::new())
    }
}
