use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use super::{Assert, ChangeSet, Mutation, Op, Record, Store, TxnError};
use crate::model::{Collection, DocKey};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

type Hook = Box<dyn FnOnce() + Send>;

/// In-process [`Store`]
///
/// Reads take a shared lock; `apply` validates and writes under the
/// exclusive lock, so no other commit can interleave between the check of
/// an assertion and the write it guards. The global revision is bumped
/// once per commit and stamped on every document the commit wrote.
pub struct MemoryStore {
    docs: RwLock<BTreeMap<DocKey, Record>>,
    revno: AtomicU64,
    changes: broadcast::Sender<ChangeSet>,
    before_hooks: Mutex<VecDeque<Hook>>,
    hook_running: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            docs: RwLock::new(BTreeMap::new()),
            revno: AtomicU64::new(0),
            changes,
            before_hooks: Mutex::new(VecDeque::new()),
            hook_running: AtomicBool::new(false),
        }
    }

    /// Queue closures to run one at a time, each immediately before one of
    /// the following `apply` calls
    ///
    /// Applies issued from inside a hook do not consume further hooks. Used
    /// by tests to interleave a competing writer between another caller's
    /// read and its commit.
    pub fn set_before_hooks(&self, hooks: Vec<Box<dyn FnOnce() + Send>>) {
        let mut queue = self.before_hooks.lock();
        queue.clear();
        queue.extend(hooks);
    }

    /// Number of queued hooks not yet run
    pub fn pending_hooks(&self) -> usize {
        self.before_hooks.lock().len()
    }

    fn run_next_hook(&self) {
        if self.hook_running.load(Ordering::SeqCst) {
            return;
        }
        let hook = self.before_hooks.lock().pop_front();
        if let Some(hook) = hook {
            self.hook_running.store(true, Ordering::SeqCst);
            hook();
            self.hook_running.store(false, Ordering::SeqCst);
        }
    }

    fn commit(&self, ops: Vec<Op>) -> Result<ChangeSet, TxnError> {
        let mut docs = self.docs.write();

        // Staged view: `None` marks a removal.
        let mut staged: BTreeMap<DocKey, Option<Record>> = BTreeMap::new();
        let mut written = BTreeSet::new();

        for op in ops {
            let current = match staged.get(&op.key) {
                Some(entry) => entry.clone(),
                None => docs.get(&op.key).cloned(),
            };

            if !op.assert.holds(current.as_ref()) {
                return Err(TxnError::Aborted {
                    key: op.key,
                    reason: format!("assertion {:?} failed", op.assert),
                });
            }

            let next = match (op.mutation, current) {
                (Mutation::None, _) => continue,
                (Mutation::Insert(doc), None) => Some(Record { doc, revno: 0 }),
                (Mutation::Replace(doc), Some(rec)) => Some(Record { doc, ..rec }),
                (Mutation::Update { update, .. }, Some(mut rec)) => {
                    update(&mut rec.doc);
                    Some(rec)
                }
                (Mutation::Remove, Some(_)) => None,
                (Mutation::Insert(_), Some(_)) => {
                    return Err(TxnError::Aborted {
                        key: op.key,
                        reason: "insert of existing document".to_string(),
                    })
                }
                (_, None) => {
                    return Err(TxnError::Aborted {
                        key: op.key,
                        reason: "document missing".to_string(),
                    })
                }
            };
            written.insert(op.key.clone());
            staged.insert(op.key, next);
        }

        let revno = self.revno.fetch_add(1, Ordering::SeqCst) + 1;
        for (key, entry) in staged {
            match entry {
                Some(mut rec) => {
                    rec.revno = revno;
                    docs.insert(key, rec);
                }
                None => {
                    docs.remove(&key);
                }
            }
        }

        Ok(ChangeSet {
            revno,
            keys: written,
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("docs", &self.docs.read().len())
            .field("revno", &self.revno.load(Ordering::SeqCst))
            .finish()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &DocKey) -> Option<Record> {
        self.docs.read().get(key).cloned()
    }

    fn scan(&self, collection: Collection) -> Vec<(DocKey, Record)> {
        self.docs
            .read()
            .iter()
            .filter(|(k, _)| k.collection == collection)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn apply(&self, ops: Vec<Op>) -> Result<u64, TxnError> {
        self.run_next_hook();
        let changes = self.commit(ops)?;
        let revno = changes.revno;
        if !changes.keys.is_empty() {
            // No receivers is fine.
            let _ = self.changes.send(changes);
        }
        Ok(revno)
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeSet> {
        self.changes.subscribe()
    }

    fn revno(&self) -> u64 {
        self.revno.load(Ordering::SeqCst)
    }
}
