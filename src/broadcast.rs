use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::flag_value::FlagValue;
use crate::status::ListenerHandle;
use crate::user::User;

/// Sent to flag-change listeners whenever a flag's configuration may have changed, directly or
/// through a prerequisite or segment it depends on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FlagChangeEvent {
    pub key: String,
}

type FlagChangeListener = Arc<dyn Fn(&FlagChangeEvent) + Send + Sync>;

/// Fan-out point for [FlagChangeEvent]s.
///
/// Delivery happens on a dedicated background task so a slow listener never blocks the data
/// source; events from one batch are always delivered before events of any later batch. When no
/// runtime is running (synchronous tests), delivery is inline.
pub struct ChangeBroadcaster {
    listeners: RwLock<HashMap<usize, FlagChangeListener>>,
    next_listener_id: Mutex<usize>,
    dispatcher: Mutex<Option<mpsc::UnboundedSender<Vec<FlagChangeEvent>>>>,
}

impl ChangeBroadcaster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: Mutex::new(0),
            dispatcher: Mutex::new(None),
        })
    }

    pub fn add_listener(&self, listener: FlagChangeListener) -> ListenerHandle {
        let mut next_id = self.next_listener_id.lock();
        let id = *next_id;
        *next_id += 1;
        self.listeners.write().insert(id, listener);
        ListenerHandle::new(id)
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.listeners.write().remove(&handle.id());
    }

    pub fn has_listeners(&self) -> bool {
        !self.listeners.read().is_empty()
    }

    pub(crate) fn clear_listeners(&self) {
        self.listeners.write().clear();
    }

    pub(crate) fn broadcast(self: &Arc<Self>, events: Vec<FlagChangeEvent>) {
        if events.is_empty() {
            return;
        }
        match Handle::try_current() {
            Ok(handle) => {
                let mut dispatcher = self.dispatcher.lock();
                let sender = match dispatcher.as_ref() {
                    Some(sender) if !sender.is_closed() => sender.clone(),
                    _ => {
                        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<FlagChangeEvent>>();
                        let weak = Arc::downgrade(self);
                        handle.spawn(async move {
                            while let Some(batch) = rx.recv().await {
                                match weak.upgrade() {
                                    Some(broadcaster) => broadcaster.deliver(&batch),
                                    None => break,
                                }
                            }
                        });
                        *dispatcher = Some(tx.clone());
                        tx
                    }
                };
                if sender.send(events).is_err() {
                    debug!("flag change dispatcher stopped, dropping events");
                }
            }
            Err(_) => self.deliver(&events),
        }
    }

    fn deliver(&self, events: &[FlagChangeEvent]) {
        let listeners = self.listeners.read().values().cloned().collect::<Vec<_>>();
        for event in events {
            for listener in &listeners {
                listener(event);
            }
        }
    }
}

/// Describes a change in the value a particular flag returns for a particular user.
#[derive(Clone, Debug, PartialEq)]
pub struct FlagValueChange {
    pub key: String,
    pub old_value: FlagValue,
    pub new_value: FlagValue,
}

pub(crate) type EvalFn = Arc<dyn Fn(&str, &User) -> FlagValue + Send + Sync>;

/// The application-facing surface for observing flag changes.
///
/// Plain listeners see the key of every changed flag. Value-change listeners are bound to one
/// (flag, user) pair: each matching change re-evaluates the flag and fires only when the
/// result actually differs from the previously seen value.
pub struct FlagTracker {
    broadcaster: Arc<ChangeBroadcaster>,
    evaluator: EvalFn,
}

impl FlagTracker {
    pub(crate) fn new(broadcaster: Arc<ChangeBroadcaster>, evaluator: EvalFn) -> Self {
        Self {
            broadcaster,
            evaluator,
        }
    }

    pub fn add_flag_change_listener(
        &self,
        listener: impl Fn(&FlagChangeEvent) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.broadcaster.add_listener(Arc::new(listener))
    }

    /// Watch the value of `flag_key` for `user`. The current value is captured at registration
    /// time as the baseline.
    pub fn add_flag_value_change_listener(
        &self,
        flag_key: &str,
        user: User,
        listener: impl Fn(&FlagValueChange) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let flag_key = flag_key.to_string();
        let evaluator = Arc::clone(&self.evaluator);
        let last_value = Mutex::new(evaluator(&flag_key, &user));

        self.broadcaster.add_listener(Arc::new(move |event| {
            if event.key != flag_key {
                return;
            }
            let new_value = evaluator(&flag_key, &user);
            let mut last = last_value.lock();
            if *last == new_value {
                return;
            }
            let change = FlagValueChange {
                key: flag_key.clone(),
                old_value: last.clone(),
                new_value: new_value.clone(),
            };
            *last = new_value;
            drop(last);
            listener(&change);
        }))
    }

    pub fn remove_listener(&self, handle: ListenerHandle) {
        self.broadcaster.remove_listener(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    fn event(key: &str) -> FlagChangeEvent {
        FlagChangeEvent {
            key: key.to_string(),
        }
    }

    #[test]
    fn listeners_receive_every_event() {
        let broadcaster = ChangeBroadcaster::new();
        let (tx, rx) = std_mpsc::channel();
        broadcaster.add_listener(Arc::new(move |e: &FlagChangeEvent| {
            tx.send(e.key.clone()).unwrap();
        }));

        broadcaster.broadcast(vec![event("a"), event("b")]);

        assert_eq!(rx.try_recv().unwrap(), "a");
        assert_eq!(rx.try_recv().unwrap(), "b");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn removed_listeners_are_silent() {
        let broadcaster = ChangeBroadcaster::new();
        let (tx, rx) = std_mpsc::channel();
        let handle = broadcaster.add_listener(Arc::new(move |e: &FlagChangeEvent| {
            tx.send(e.key.clone()).unwrap();
        }));
        broadcaster.remove_listener(handle);

        broadcaster.broadcast(vec![event("a")]);
        assert!(rx.try_recv().is_err());
        assert!(!broadcaster.has_listeners());
    }

    #[tokio::test]
    async fn background_delivery_preserves_batch_order() {
        let broadcaster = ChangeBroadcaster::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broadcaster.add_listener(Arc::new(move |e: &FlagChangeEvent| {
            let _ = tx.send(e.key.clone());
        }));

        broadcaster.broadcast(vec![event("a"), event("b")]);
        broadcaster.broadcast(vec![event("c")]);

        for expected in ["a", "b", "c"] {
            let got = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
                .await
                .expect("timed out")
                .expect("channel closed");
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn value_change_listener_fires_only_on_changes() {
        let broadcaster = ChangeBroadcaster::new();
        let current = Arc::new(Mutex::new(FlagValue::Bool(false)));

        let eval_source = Arc::clone(&current);
        let tracker = FlagTracker::new(
            Arc::clone(&broadcaster),
            Arc::new(move |_key, _user| eval_source.lock().clone()),
        );

        let (tx, rx) = std_mpsc::channel();
        tracker.add_flag_value_change_listener(
            "watched",
            User::with_key("u").build(),
            move |change| {
                tx.send(change.clone()).unwrap();
            },
        );

        // an event for a different flag does nothing
        broadcaster.broadcast(vec![event("other")]);
        assert!(rx.try_recv().is_err());

        // an event with an unchanged value does nothing
        broadcaster.broadcast(vec![event("watched")]);
        assert!(rx.try_recv().is_err());

        // the value flips: one notification with old and new
        *current.lock() = FlagValue::Bool(true);
        broadcaster.broadcast(vec![event("watched")]);
        let change = rx.try_recv().unwrap();
        assert_eq!(change.old_value, FlagValue::Bool(false));
        assert_eq!(change.new_value, FlagValue::Bool(true));

        // stable again
        broadcaster.broadcast(vec![event("watched")]);
        assert!(rx.try_recv().is_err());
    }
}
