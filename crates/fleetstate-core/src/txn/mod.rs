//! Optimistic-concurrency transactions
//!
//! A transaction is a list of [`Op`]s. Each op names one document, an
//! assertion about its current state, and a mutation. A store applies the
//! list atomically: every assertion is checked against the state as left by
//! the preceding ops, and if any fails nothing is written.
//!
//! Callers never hold locks across reads. They read, build ops that assert
//! what they read, and hand the builder to [`run`], which rebuilds on abort.

mod memory;
mod runner;

pub use memory::MemoryStore;
pub use runner::run;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{Collection, DocKey, Document};

/// A stored document with the revision that last wrote it
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub doc: Document,
    pub revno: u64,
}

pub type CheckFn = Arc<dyn Fn(&Document) -> bool + Send + Sync>;
pub type UpdateFn = Arc<dyn Fn(&mut Document) + Send + Sync>;

/// Precondition on a document's current state
#[derive(Clone)]
pub enum Assert {
    Any,
    Exists,
    Missing,
    /// Document exists and was last written at exactly this revision
    Revno(u64),
    /// Document exists and satisfies the named predicate
    Check { desc: String, check: CheckFn },
}

impl Assert {
    pub fn check(
        desc: impl Into<String>,
        check: impl Fn(&Document) -> bool + Send + Sync + 'static,
    ) -> Self {
        Assert::Check {
            desc: desc.into(),
            check: Arc::new(check),
        }
    }

    fn holds(&self, current: Option<&Record>) -> bool {
        match (self, current) {
            (Assert::Any, _) => true,
            (Assert::Exists, found) => found.is_some(),
            (Assert::Missing, found) => found.is_none(),
            (Assert::Revno(want), Some(rec)) => rec.revno == *want,
            (Assert::Check { check, .. }, Some(rec)) => check(&rec.doc),
            (Assert::Revno(_), None) | (Assert::Check { .. }, None) => false,
        }
    }
}

impl fmt::Debug for Assert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assert::Any => f.write_str("Any"),
            Assert::Exists => f.write_str("Exists"),
            Assert::Missing => f.write_str("Missing"),
            Assert::Revno(r) => write!(f, "Revno({})", r),
            Assert::Check { desc, .. } => write!(f, "Check({})", desc),
        }
    }
}

/// Write applied when the assertion holds
///
/// `Insert` requires the document to be absent; `Replace`, `Update` and
/// `Remove` require it to be present. A violated requirement aborts the
/// transaction like a failed assertion.
#[derive(Clone)]
pub enum Mutation {
    None,
    Insert(Document),
    Replace(Document),
    Update { desc: String, update: UpdateFn },
    Remove,
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mutation::None => f.write_str("None"),
            Mutation::Insert(doc) => f.debug_tuple("Insert").field(doc).finish(),
            Mutation::Replace(doc) => f.debug_tuple("Replace").field(doc).finish(),
            Mutation::Update { desc, .. } => write!(f, "Update({})", desc),
            Mutation::Remove => f.write_str("Remove"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Op {
    pub key: DocKey,
    pub assert: Assert,
    pub mutation: Mutation,
}

impl Op {
    /// Assertion-only op
    pub fn assert(key: DocKey, assert: Assert) -> Self {
        Self {
            key,
            assert,
            mutation: Mutation::None,
        }
    }

    pub fn insert(key: DocKey, doc: impl Into<Document>) -> Self {
        Self {
            key,
            assert: Assert::Missing,
            mutation: Mutation::Insert(doc.into()),
        }
    }

    pub fn replace(key: DocKey, doc: impl Into<Document>) -> Self {
        Self {
            key,
            assert: Assert::Exists,
            mutation: Mutation::Replace(doc.into()),
        }
    }

    pub fn update(
        key: DocKey,
        desc: impl Into<String>,
        update: impl Fn(&mut Document) + Send + Sync + 'static,
    ) -> Self {
        Self {
            key,
            assert: Assert::Exists,
            mutation: Mutation::Update {
                desc: desc.into(),
                update: Arc::new(update),
            },
        }
    }

    pub fn remove(key: DocKey) -> Self {
        Self {
            key,
            assert: Assert::Exists,
            mutation: Mutation::Remove,
        }
    }

    /// Replace the default assertion
    pub fn when(mut self, assert: Assert) -> Self {
        self.assert = assert;
        self
    }
}

/// Keys written by one committed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub revno: u64,
    pub keys: BTreeSet<DocKey>,
}

impl ChangeSet {
    pub fn touches(&self, collection: Collection) -> bool {
        self.keys.iter().any(|k| k.collection == collection)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxnError {
    #[error("transaction aborted at {key}: {reason}")]
    Aborted { key: DocKey, reason: String },
}

/// Transactional document store
pub trait Store: Send + Sync {
    fn get(&self, key: &DocKey) -> Option<Record>;

    /// Every document of a collection, in key order
    fn scan(&self, collection: Collection) -> Vec<(DocKey, Record)>;

    /// Apply ops atomically, returning the commit revision
    ///
    /// # Errors
    ///
    /// Returns `TxnError::Aborted` naming the first op whose assertion or
    /// mutation precondition failed; nothing is written in that case.
    fn apply(&self, ops: Vec<Op>) -> std::result::Result<u64, TxnError>;

    /// Receive a [`ChangeSet`] for every commit after this call
    fn subscribe(&self) -> broadcast::Receiver<ChangeSet>;

    /// Revision of the latest commit
    fn revno(&self) -> u64;
}
