//! Change watchers
//!
//! Every committed transaction publishes the keys it wrote on the store's
//! broadcast channel. A watcher is one tokio task subscribed to that
//! channel: it emits an initial event, then waits for change sets, drains
//! whatever else is already queued, recomputes its view and emits only when
//! the view changed. Watchers must be created inside a tokio runtime.

use std::collections::{BTreeMap, BTreeSet};

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::application::effective_config;
use crate::life::Life;
use crate::model::{Collection, DocKey};
use crate::settings::config_hash;
use crate::state::{relations_of, units_of, State};
use crate::txn::Store;

/// Why a watcher is recomputing
#[derive(Debug)]
enum Wake {
    Initial,
    Changed(BTreeSet<DocKey>),
    /// Change sets were dropped; the view must be rebuilt from scratch
    Lagged,
}

impl Wake {
    fn touches(&self, collections: &[Collection]) -> bool {
        match self {
            Wake::Initial | Wake::Lagged => true,
            Wake::Changed(keys) => keys.iter().any(|k| collections.contains(&k.collection)),
        }
    }
}

/// Stream of events from one watcher task
///
/// Dropping the watcher stops the task.
#[derive(Debug)]
pub struct Watcher<T> {
    rx: mpsc::Receiver<T>,
    stop: watch::Sender<bool>,
}

/// Watcher whose events carry no payload
pub type NotifyWatcher = Watcher<()>;

/// Watcher emitting batches of entity names
pub type StringsWatcher = Watcher<Vec<String>>;

impl<T> Watcher<T> {
    /// Next event, or `None` once the watcher has stopped
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Stop the watcher; further calls do nothing
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }
}

impl<T> Drop for Watcher<T> {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

fn spawn<T, F>(st: &State, mut compute: F) -> Watcher<T>
where
    T: Send + 'static,
    F: FnMut(&dyn Store, &Wake) -> Option<T> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(st.config().watcher_buffer);
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let store = st.shared_store();
    // Subscribe before the initial read so no commit falls in between.
    let mut changes = store.subscribe();

    tokio::spawn(async move {
        let mut wake = Wake::Initial;
        loop {
            if *stop_rx.borrow() {
                break;
            }
            if let Some(event) = compute(store.as_ref(), &wake) {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }

            let first = tokio::select! {
                _ = stop_rx.changed() => break,
                received = changes.recv() => received,
            };
            let mut keys = BTreeSet::new();
            let mut lagged = false;
            match first {
                Ok(set) => keys.extend(set.keys),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "watcher lagged behind store changes");
                    lagged = true;
                }
                Err(RecvError::Closed) => break,
            }
            loop {
                match changes.try_recv() {
                    Ok(set) => keys.extend(set.keys),
                    Err(TryRecvError::Lagged(_)) => lagged = true,
                    Err(_) => break,
                }
            }
            wake = if lagged {
                Wake::Lagged
            } else {
                Wake::Changed(keys)
            };
        }
    });

    Watcher { rx, stop: stop_tx }
}

/// Notify whenever `key` is written
pub(crate) fn watch_document(st: &State, key: DocKey) -> NotifyWatcher {
    spawn(st, move |_, wake| match wake {
        Wake::Changed(keys) => keys.contains(&key).then_some(()),
        Wake::Initial | Wake::Lagged => Some(()),
    })
}

/// Names whose life differs between `known` and `current`, including
/// appearances and disappearances; `known` is updated to `current`
fn life_delta(known: &mut BTreeMap<String, Life>, current: BTreeMap<String, Life>) -> Vec<String> {
    let mut changed: BTreeSet<String> = known
        .keys()
        .filter(|name| !current.contains_key(*name))
        .cloned()
        .collect();
    for (name, life) in &current {
        if known.get(name) != Some(life) {
            changed.insert(name.clone());
        }
    }
    *known = current;
    changed.into_iter().collect()
}

fn watch_lives<L>(st: &State, collection: Collection, list: L) -> StringsWatcher
where
    L: Fn(&dyn Store) -> BTreeMap<String, Life> + Send + 'static,
{
    let mut known = BTreeMap::new();
    spawn(st, move |store, wake| {
        if !wake.touches(&[collection]) {
            return None;
        }
        let delta = life_delta(&mut known, list(store));
        match wake {
            Wake::Initial => Some(delta),
            _ => (!delta.is_empty()).then_some(delta),
        }
    })
}

/// Unit names of `application` whose life changed
pub(crate) fn watch_unit_lives(st: &State, application: &str) -> StringsWatcher {
    let application = application.to_string();
    watch_lives(st, Collection::Units, move |store| {
        units_of(store, &application)
            .into_iter()
            .map(|u| (u.name, u.life))
            .collect()
    })
}

/// Relation keys of `application` whose life changed
pub(crate) fn watch_relation_lives(st: &State, application: &str) -> StringsWatcher {
    let application = application.to_string();
    watch_lives(st, Collection::Relations, move |store| {
        relations_of(store, &application)
            .into_iter()
            .map(|r| (r.key, r.life))
            .collect()
    })
}

/// Hash of `application`'s effective config, whenever it changes
pub(crate) fn watch_config_hash(st: &State, application: &str) -> StringsWatcher {
    let application = application.to_string();
    let mut last: Option<String> = None;
    spawn(st, move |store, wake| {
        if !wake.touches(&[Collection::Applications, Collection::Settings]) {
            return None;
        }
        let hash = effective_config(store, &application)
            .and_then(|config| config_hash(&config))
            .ok()?;
        if last.as_deref() == Some(hash.as_str()) {
            return None;
        }
        last = Some(hash.clone());
        Some(vec![hash])
    })
}
