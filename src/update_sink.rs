use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};

use log::warn;
use parking_lot::{Mutex, RwLock};

use crate::broadcast::{ChangeBroadcaster, FlagChangeEvent};
use crate::flag::Flag;
use crate::status::{DataSourceState, ErrorInfo, StatusBroadcaster};
use crate::store::{AllData, DataKind, DataStore, PatchTarget, StorageItem, Versioned};

/// The single write path between data sources and the data store.
///
/// Besides forwarding writes, the sink diffs old against new data, follows the prerequisite and
/// segment reference graphs to find every flag whose evaluation may have changed, and emits one
/// [FlagChangeEvent] per affected flag. It also relays data source state reports to the status
/// broadcaster.
pub struct UpdateSink {
    store: Arc<RwLock<Box<dyn DataStore>>>,
    flag_broadcaster: Arc<ChangeBroadcaster>,
    status_broadcaster: Arc<StatusBroadcaster>,
    // guards the graphs, and spans every store mutation plus the affected-set computation so
    // that events always reflect the write that produced them
    dependency_tracker: Mutex<DependencyTracker>,
    refresh_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl UpdateSink {
    pub fn new(
        store: Arc<RwLock<Box<dyn DataStore>>>,
        flag_broadcaster: Arc<ChangeBroadcaster>,
        status_broadcaster: Arc<StatusBroadcaster>,
    ) -> Arc<Self> {
        let sink = Arc::new(Self {
            store: Arc::clone(&store),
            flag_broadcaster,
            status_broadcaster,
            dependency_tracker: Mutex::new(DependencyTracker::default()),
            refresh_hook: Mutex::new(None),
        });

        // a store that can lose its backend tells us when it comes back stale, and we in turn
        // ask the data source for a full resend
        if let Some(broadcaster) = store.read().status_broadcaster() {
            let weak: Weak<UpdateSink> = Arc::downgrade(&sink);
            broadcaster.add_listener(Arc::new(move |status| {
                if status.available && status.refresh_needed {
                    if let Some(sink) = weak.upgrade() {
                        sink.request_data_source_refresh();
                    }
                }
            }));
        }

        sink
    }

    /// Replace the entire dataset, then notify listeners of every flag whose configuration or
    /// transitive dependencies differ from the previous dataset.
    pub fn init(&self, data: AllData) -> bool {
        let affected = {
            let mut tracker = self.dependency_tracker.lock();
            let mut store = self.store.write();

            let old_flags = store.all_flag_items();
            let old_segments = store.all_segment_items();

            tracker.reset_from(&data);

            let mut seeds: Vec<DependencyKey> = changed_keys(&old_flags, &data.flags)
                .into_iter()
                .map(|key| DependencyKey::new(DataKind::Feature, key))
                .collect();
            seeds.extend(
                changed_keys(&old_segments, &data.segments)
                    .into_iter()
                    .map(|key| DependencyKey::new(DataKind::Segment, key)),
            );

            if let Err(e) = store.init(data) {
                warn!("data store failed to apply new dataset: {}", e);
                drop(store);
                drop(tracker);
                self.update_status(
                    DataSourceState::Interrupted,
                    Some(ErrorInfo::store_error(e.to_string())),
                );
                return false;
            }

            tracker.affected_flags(seeds)
        };

        self.broadcast_changes(affected);
        true
    }

    /// Apply one item if it is newer than what the store holds, then notify listeners of the
    /// affected flags. Returns false only when the store rejected the write; a stale-version
    /// no-op is still a success.
    pub fn upsert(&self, key: &str, item: PatchTarget) -> bool {
        let affected = {
            let mut tracker = self.dependency_tracker.lock();
            let mut store = self.store.write();

            let kind = item.kind();
            let flag_edges = match &item {
                PatchTarget::Flag(item) => Some(flag_dependencies(item)),
                PatchTarget::Segment(_) => None,
            };

            match store.upsert(key, item) {
                Err(e) => {
                    warn!("data store failed to apply update of {}: {}", key, e);
                    drop(store);
                    drop(tracker);
                    self.update_status(
                        DataSourceState::Interrupted,
                        Some(ErrorInfo::store_error(e.to_string())),
                    );
                    return false;
                }
                Ok(false) => return true, // out-of-date version, nothing changed
                Ok(true) => {
                    if let Some(edges) = flag_edges {
                        tracker.update_flag_edges(key, edges);
                    }
                    tracker.affected_flags(vec![DependencyKey::new(kind, key.to_string())])
                }
            }
        };

        self.broadcast_changes(affected);
        true
    }

    /// Relay a data source state report to the status broadcaster.
    pub fn update_status(&self, state: DataSourceState, error: Option<ErrorInfo>) {
        self.status_broadcaster.update(state, error);
    }

    /// Whether the underlying store reports its own availability. Data sources use this to
    /// decide between restarting on a write failure and waiting for the store to recover.
    pub fn store_monitors_status(&self) -> bool {
        self.store.read().status_broadcaster().is_some()
    }

    /// Bind the callback that asks the active data source to re-fetch everything.
    pub(crate) fn set_refresh_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        *self.refresh_hook.lock() = Some(hook);
    }

    fn request_data_source_refresh(&self) {
        if let Some(hook) = &*self.refresh_hook.lock() {
            hook();
        }
    }

    fn broadcast_changes(&self, affected: HashSet<String>) {
        if affected.is_empty() {
            return;
        }
        let events = affected
            .into_iter()
            .map(|key| FlagChangeEvent { key })
            .collect();
        self.flag_broadcaster.broadcast(events);
    }
}

fn changed_keys<T: Versioned>(
    old: &HashMap<String, StorageItem<T>>,
    new: &HashMap<String, StorageItem<T>>,
) -> HashSet<String> {
    let mut changed = HashSet::new();
    for (key, item) in new {
        match old.get(key) {
            Some(previous) if previous.version() == item.version() => {}
            _ => {
                changed.insert(key.clone());
            }
        }
    }
    for key in old.keys() {
        if !new.contains_key(key) {
            changed.insert(key.clone());
        }
    }
    changed
}

fn flag_dependencies(item: &StorageItem<Flag>) -> HashSet<DependencyKey> {
    let mut deps = HashSet::new();
    if let StorageItem::Item(flag) = item {
        for prereq in &flag.prerequisites {
            deps.insert(DependencyKey::new(DataKind::Feature, prereq.key.clone()));
        }
        for rule in &flag.rules {
            for clause in &rule.clauses {
                for segment_key in clause.segment_keys() {
                    deps.insert(DependencyKey::new(DataKind::Segment, segment_key.to_string()));
                }
            }
        }
    }
    deps
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct DependencyKey {
    kind: DataKind,
    key: String,
}

impl DependencyKey {
    fn new(kind: DataKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }
}

/// Reverse-adjacency maps over the prerequisite and segment graphs.
///
/// Walking dependents of a changed item directly makes a broadcast cost proportional to the
/// number of affected flags instead of the number of flags times graph depth.
#[derive(Default)]
struct DependencyTracker {
    // flag -> the items it references
    dependencies_of: HashMap<DependencyKey, HashSet<DependencyKey>>,
    // item -> the flags referencing it
    dependents_of: HashMap<DependencyKey, HashSet<DependencyKey>>,
}

impl DependencyTracker {
    /// Rebuild both graphs from a full dataset.
    fn reset_from(&mut self, data: &AllData) {
        self.dependencies_of.clear();
        self.dependents_of.clear();
        for (key, item) in &data.flags {
            self.update_flag_edges(key, flag_dependencies(item));
        }
    }

    /// Replace the outgoing edges of one flag. Segments reference nothing, so only flag
    /// upserts ever change the graphs.
    fn update_flag_edges(&mut self, flag_key: &str, deps: HashSet<DependencyKey>) {
        let from = DependencyKey::new(DataKind::Feature, flag_key.to_string());
        if let Some(old_deps) = self.dependencies_of.insert(from.clone(), deps.clone()) {
            for dep in old_deps {
                if let Some(dependents) = self.dependents_of.get_mut(&dep) {
                    dependents.remove(&from);
                }
            }
        }
        for dep in deps {
            self.dependents_of.entry(dep).or_default().insert(from.clone());
        }
    }

    /// Breadth-first closure over `dependents_of`, starting from the directly modified items.
    /// Returns the keys of every affected flag; seed segments themselves are not flags and are
    /// filtered out.
    fn affected_flags(&self, seeds: Vec<DependencyKey>) -> HashSet<String> {
        let mut visited: HashSet<DependencyKey> = seeds.iter().cloned().collect();
        let mut queue: VecDeque<DependencyKey> = seeds.into();

        while let Some(item) = queue.pop_front() {
            if let Some(dependents) = self.dependents_of.get(&item) {
                for dependent in dependents {
                    if visited.insert(dependent.clone()) {
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }

        visited
            .into_iter()
            .filter(|k| k.kind == DataKind::Feature)
            .map(|k| k.key)
            .collect()
    }
}
