//! Reference counts over the transactional store
//!
//! A counter is keyed by `(owner, key)` and lives in its own document. It is
//! created at 1 on first use and its document is removed when it reaches 0,
//! so "absent" and "zero" are the same observable state. A decrement that
//! finds the document gone is either a caller bug (first attempt) or a lost
//! race against a concurrent decrement (retry); the two are reported
//! differently.

use crate::errors::{Result, StateError};
use crate::model::{Collection, DocKey, Document, RefCountDoc};
use crate::txn::{Assert, Op, Store};

pub fn refcount_key(owner: &str, key: &str) -> DocKey {
    DocKey::new(Collection::RefCounts, format!("{}#{}", owner, key))
}

fn count_of(doc: &Document) -> Option<u64> {
    doc.as_refcount().map(|r| r.count)
}

/// Op adding one reference, creating the counter if needed
pub fn increment_op(store: &dyn Store, owner: &str, key: &str) -> Op {
    let doc_key = refcount_key(owner, key);
    if store.get(&doc_key).is_some() {
        Op::update(doc_key, "refcount += 1", |doc| {
            if let Some(rc) = doc.as_refcount_mut() {
                rc.count += 1;
            }
        })
    } else {
        Op::insert(doc_key, RefCountDoc { count: 1 })
    }
}

/// Op dropping one reference, plus whether this drop takes it to zero
///
/// The op asserts the count it was built from, so a concurrent change to
/// the counter aborts the transaction.
///
/// # Errors
///
/// Returns `NotFound` when the counter is absent on the first attempt and
/// `ReferenceRace` when it is absent on a retry.
pub fn decrement_op(
    store: &dyn Store,
    owner: &str,
    key: &str,
    attempt: u32,
) -> Result<(Op, bool)> {
    decrement_by_op(store, owner, key, 1, attempt)
}

/// Op dropping `n` references at once
///
/// Several holders released in one transaction must go through a single
/// op, since each op is built from the same read.
///
/// # Errors
///
/// As [`decrement_op`]; a counter holding fewer than `n` references is
/// treated like an absent one.
pub fn decrement_by_op(
    store: &dyn Store,
    owner: &str,
    key: &str,
    n: u64,
    attempt: u32,
) -> Result<(Op, bool)> {
    let doc_key = refcount_key(owner, key);
    let current = store
        .get(&doc_key)
        .and_then(|rec| count_of(&rec.doc))
        .filter(|count| *count >= n)
        .ok_or_else(|| {
            if attempt == 0 {
                StateError::not_found(format!("refcount {:?} of {:?}", key, owner))
            } else {
                StateError::ReferenceRace {
                    owner: owner.to_string(),
                    key: key.to_string(),
                }
            }
        })?;

    if current == n {
        let op = Op::remove(doc_key).when(Assert::check(format!("refcount == {}", n), move |doc| {
            count_of(doc) == Some(n)
        }));
        Ok((op, true))
    } else {
        let op = Op::update(doc_key, format!("refcount -= {}", n), move |doc| {
            if let Some(rc) = doc.as_refcount_mut() {
                rc.count -= n;
            }
        })
        .when(Assert::check(format!("refcount > {}", n), move |doc| {
            count_of(doc).is_some_and(|c| c > n)
        }));
        Ok((op, false))
    }
}

/// Current count
///
/// # Errors
///
/// Returns `NotFound` when no reference is held.
pub fn read(store: &dyn Store, owner: &str, key: &str) -> Result<u64> {
    store
        .get(&refcount_key(owner, key))
        .and_then(|rec| count_of(&rec.doc))
        .ok_or_else(|| StateError::not_found(format!("refcount {:?} of {:?}", key, owner)))
}

/// Current count, treating an absent counter as zero
pub fn read_or_zero(store: &dyn Store, owner: &str, key: &str) -> u64 {
    read(store, owner, key).unwrap_or(0)
}

/// Op asserting the counter holds exactly `count`
pub fn assert_count_op(owner: &str, key: &str, count: u64) -> Op {
    let doc_key = refcount_key(owner, key);
    if count == 0 {
        Op::assert(doc_key, Assert::Missing)
    } else {
        Op::assert(
            doc_key,
            Assert::check(format!("refcount == {}", count), move |doc| {
                count_of(doc) == Some(count)
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ExErrorKind;
    use crate::txn::MemoryStore;

    #[test]
    fn test_increment_creates_then_bumps() {
        let store = MemoryStore::new();
        store.apply(vec![increment_op(&store, "mysql", "offers")]).unwrap();
        assert_eq!(read(&store, "mysql", "offers").unwrap(), 1);
        store.apply(vec![increment_op(&store, "mysql", "offers")]).unwrap();
        assert_eq!(read(&store, "mysql", "offers").unwrap(), 2);
    }

    #[test]
    fn test_decrement_to_zero_removes_document() {
        let store = MemoryStore::new();
        store.apply(vec![increment_op(&store, "a", "k")]).unwrap();
        store.apply(vec![increment_op(&store, "a", "k")]).unwrap();

        let (op, zero) = decrement_op(&store, "a", "k", 0).unwrap();
        assert!(!zero);
        store.apply(vec![op]).unwrap();
        assert_eq!(read(&store, "a", "k").unwrap(), 1);

        let (op, zero) = decrement_op(&store, "a", "k", 0).unwrap();
        assert!(zero);
        store.apply(vec![op]).unwrap();
        assert!(read(&store, "a", "k").unwrap_err().is_not_found());
        assert!(store.get(&refcount_key("a", "k")).is_none());
        assert_eq!(read_or_zero(&store, "a", "k"), 0);
    }

    #[test]
    fn test_missing_counter_first_attempt_is_not_found() {
        let store = MemoryStore::new();
        let err = decrement_op(&store, "a", "k", 0).unwrap_err();
        assert_eq!(err.kind(), ExErrorKind::NotFound);
    }

    #[test]
    fn test_missing_counter_on_retry_is_race() {
        let store = MemoryStore::new();
        let err = decrement_op(&store, "a", "k", 2).unwrap_err();
        assert_eq!(err.kind(), ExErrorKind::ReferenceRace);
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_stale_decrement_aborts() {
        let store = MemoryStore::new();
        store.apply(vec![increment_op(&store, "a", "k")]).unwrap();
        store.apply(vec![increment_op(&store, "a", "k")]).unwrap();

        // Built against count 2, applied after another holder dropped out.
        let (stale, _) = decrement_op(&store, "a", "k", 0).unwrap();
        let (other, _) = decrement_op(&store, "a", "k", 0).unwrap();
        store.apply(vec![other]).unwrap();
        assert!(store.apply(vec![stale]).is_err());
        assert_eq!(read(&store, "a", "k").unwrap(), 1);
    }

    #[test]
    fn test_decrement_by_releases_several_holders() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            store.apply(vec![increment_op(&store, "a", "k")]).unwrap();
        }
        let (op, zero) = decrement_by_op(&store, "a", "k", 2, 0).unwrap();
        assert!(!zero);
        store.apply(vec![op]).unwrap();
        assert_eq!(read(&store, "a", "k").unwrap(), 1);
        assert!(decrement_by_op(&store, "a", "k", 2, 0).unwrap_err().is_not_found());
    }

    #[test]
    fn test_assert_count_op() {
        let store = MemoryStore::new();
        store.apply(vec![assert_count_op("a", "k", 0)]).unwrap();
        assert!(store.apply(vec![assert_count_op("a", "k", 1)]).is_err());
        store.apply(vec![increment_op(&store, "a", "k")]).unwrap();
        store.apply(vec![assert_count_op("a", "k", 1)]).unwrap();
    }
}
