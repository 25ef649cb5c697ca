use tracing::debug;

use super::{Op, Store, TxnError};
use crate::core_types::schema::EVENT_TXN_ABORTED;
use crate::errors::{Result, StateError};

/// Run a transaction to completion, rebuilding it after each abort
///
/// `build` receives the attempt number (0-based) and returns the ops to
/// apply, built from a fresh read. An empty list means nothing needs doing
/// and ends the loop successfully. Errors from `build` end the loop
/// immediately; only store aborts are retried.
///
/// # Errors
///
/// Returns whatever `build` returns, or `ExcessiveContention` once
/// `max_attempts` builds have all aborted.
pub fn run<F>(store: &dyn Store, max_attempts: u32, mut build: F) -> Result<()>
where
    F: FnMut(u32) -> Result<Vec<Op>>,
{
    for attempt in 0..max_attempts {
        let ops = build(attempt)?;
        if ops.is_empty() {
            return Ok(());
        }
        let ops_len = ops.len();
        match store.apply(ops) {
            Ok(_) => return Ok(()),
            Err(TxnError::Aborted { key, reason }) => {
                debug!(
                    event = EVENT_TXN_ABORTED,
                    attempt,
                    ops_len,
                    key = %key,
                    reason = %reason,
                    "transaction aborted; rebuilding"
                );
            }
        }
    }
    Err(StateError::ExcessiveContention)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Collection, DocKey, RefCountDoc};
    use crate::txn::{Assert, MemoryStore};

    #[test]
    fn test_empty_ops_is_noop_success() {
        let store = MemoryStore::new();
        run(&store, 3, |_| Ok(vec![])).unwrap();
        assert_eq!(store.revno(), 0);
    }

    #[test]
    fn test_build_error_is_not_retried() {
        let store = MemoryStore::new();
        let mut calls = 0;
        let err = run(&store, 5, |_| {
            calls += 1;
            Err(StateError::not_found("application \"x\""))
        })
        .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_persistent_abort_becomes_contention() {
        let store = MemoryStore::new();
        let key = DocKey::new(Collection::RefCounts, "never");
        let mut attempts = Vec::new();
        let err = run(&store, 4, |attempt| {
            attempts.push(attempt);
            Ok(vec![Op::assert(key.clone(), Assert::Exists)])
        })
        .unwrap_err();
        assert_eq!(err, StateError::ExcessiveContention);
        assert_eq!(attempts, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_rebuild_after_abort_succeeds() {
        let store = MemoryStore::new();
        let key = DocKey::new(Collection::RefCounts, "k");
        store
            .apply(vec![Op::insert(key.clone(), RefCountDoc { count: 1 })])
            .unwrap();
        run(&store, 3, |attempt| {
            if attempt == 0 {
                // Stale: pretends the doc is absent.
                Ok(vec![Op::insert(key.clone(), RefCountDoc { count: 1 })])
            } else {
                Ok(vec![Op::replace(key.clone(), RefCountDoc { count: 2 })])
            }
        })
        .unwrap();
        let rec = store.get(&key).unwrap();
        assert_eq!(rec.doc.as_refcount().unwrap().count, 2);
    }
}
