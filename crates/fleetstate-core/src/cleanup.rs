//! Deferred cleanup records
//!
//! Destroy operations queue the work they cannot finish in one transaction
//! as cleanup documents. [`State::cleanup`] processes them oldest first; a
//! record is removed only once its work succeeded, so a failed record is
//! retried on the next call.

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::Result;
use crate::logged_op;
use crate::model::{CleanupDoc, CleanupKind, Collection, DocKey};
use crate::refcount::refcount_key;
use crate::relation::Relation;
use crate::settings::{charm_usage, CHARM_USAGE_OWNER};
use crate::state::{read_unit, relations_of, scopes_of_relation, scopes_of_unit, units_of, State};
use crate::storage;
use crate::txn::{Assert, Op};
use crate::unit::Unit;

/// Passes made per call; new records queued by a pass are picked up by
/// the next one
const MAX_PASSES: usize = 16;

/// Op queueing a cleanup record
pub(crate) fn queue_op(kind: CleanupKind) -> Op {
    let id = Uuid::now_v7().to_string();
    Op::insert(
        DocKey::new(Collection::Cleanups, id.clone()),
        CleanupDoc {
            id,
            kind,
            created_at: Utc::now(),
        },
    )
}

fn pending(st: &State) -> Vec<CleanupDoc> {
    let mut docs: Vec<CleanupDoc> = st
        .store()
        .scan(Collection::Cleanups)
        .into_iter()
        .filter_map(|(_, rec)| rec.doc.as_cleanup().cloned())
        .collect();
    docs.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
    docs
}

impl State {
    /// Whether cleanup records are waiting
    pub fn needs_cleanup(&self) -> bool {
        !self.store().scan(Collection::Cleanups).is_empty()
    }

    /// Process pending cleanup records
    ///
    /// Failures of individual records are logged and leave the record in
    /// place.
    ///
    /// # Errors
    ///
    /// Returns an error only when a processed record cannot be removed.
    pub fn cleanup(&self) -> Result<()> {
        logged_op!("cleanup", "model", self.cleanup_inner())
    }

    fn cleanup_inner(&self) -> Result<()> {
        for pass in 0..MAX_PASSES {
            let docs = pending(self);
            if docs.is_empty() {
                return Ok(());
            }
            let mut done = 0;
            for doc in docs {
                match self.process_cleanup(&doc.kind) {
                    Ok(()) => {
                        self.remove_cleanup(&doc.id)?;
                        done += 1;
                    }
                    Err(err) => {
                        warn!(
                            cleanup = doc.kind.name(),
                            id = %doc.id,
                            error = %err,
                            "cleanup failed; will retry"
                        );
                    }
                }
            }
            debug!(pass, done, "cleanup pass finished");
            if done == 0 {
                break;
            }
        }
        Ok(())
    }

    fn remove_cleanup(&self, id: &str) -> Result<()> {
        let key = DocKey::new(Collection::Cleanups, id);
        self.run(|_| {
            if self.store().get(&key).is_some() {
                Ok(vec![Op::remove(key.clone())])
            } else {
                Ok(vec![])
            }
        })
    }

    fn process_cleanup(&self, kind: &CleanupKind) -> Result<()> {
        match kind {
            CleanupKind::DyingApplicationUnits { application, force } => {
                for doc in units_of(self.store(), application) {
                    let unit = Unit::new(self.clone(), doc);
                    if *force {
                        unit.destroy_with_force()?;
                    } else {
                        unit.destroy()?;
                    }
                }
                Ok(())
            }
            CleanupKind::ApplicationRelations { application, force } => {
                for doc in relations_of(self.store(), application) {
                    let rel = Relation::new(self.clone(), doc);
                    if *force {
                        for scope in scopes_of_relation(self.store(), rel.key()) {
                            rel.leave_scope_named(&scope.unit)?;
                        }
                    }
                    rel.destroy()?;
                }
                Ok(())
            }
            CleanupKind::ForceDestroyedUnit { unit } => self.force_remove_unit(unit),
            CleanupKind::DeadUnits { application } => {
                for doc in units_of(self.store(), application) {
                    if doc.life.is_dead() {
                        Unit::new(self.clone(), doc).remove()?;
                    }
                }
                Ok(())
            }
            CleanupKind::Charm { url } => self.run(|_| {
                let store = self.store();
                let key = DocKey::charm(url);
                if store.get(&key).is_none() || charm_usage(store, url) > 0 {
                    return Ok(vec![]);
                }
                Ok(vec![
                    Op::assert(refcount_key(CHARM_USAGE_OWNER, url), Assert::Missing),
                    Op::remove(key),
                ])
            }),
            CleanupKind::ApplicationStorage { application } => {
                self.run(|_| Ok(storage::remove_detached_ops(self.store(), application)))
            }
        }
    }

    /// Leave every scope, then kill and remove the unit and its subordinates
    fn force_remove_unit(&self, name: &str) -> Result<()> {
        let doc = match read_unit(self.store(), name) {
            Ok((doc, _)) => doc,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        for sub in &doc.subordinates {
            self.force_remove_unit(sub)?;
        }
        for scope in scopes_of_unit(self.store(), name) {
            self.relation(&scope.relation_key)?.leave_scope_named(name)?;
        }
        let unit = Unit::new(self.clone(), doc);
        unit.ensure_dead()?;
        unit.remove()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::{MemoryStore, Store};

    #[test]
    fn test_queue_op_inserts_record() {
        let store = MemoryStore::new();
        store
            .apply(vec![queue_op(CleanupKind::Charm {
                url: "ch:mysql-1".into(),
            })])
            .unwrap();
        let docs = store.scan(Collection::Cleanups);
        assert_eq!(docs.len(), 1);
        let doc = docs[0].1.doc.as_cleanup().unwrap();
        assert_eq!(doc.kind.name(), "charm");
        assert_eq!(docs[0].0.id, doc.id);
    }
}
