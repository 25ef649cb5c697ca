//! Storage constraints and instances
//!
//! An application records one [`StorageConstraints`] per store its charm
//! declares. Each unit gets `count` instances of every store when it is
//! created; instances are detached when the unit goes and removed by the
//! application-storage cleanup.

use std::collections::BTreeMap;

use crate::catalog::StoragePoolRegistry;
use crate::errors::{Result, StateError};
use crate::model::{
    CharmMeta, Collection, DocKey, StorageConstraints, StorageInstanceDoc, StorageKind,
    StorageMeta,
};
use crate::txn::{Op, Store};

pub const DEFAULT_SIZE_MIB: u64 = 1024;

/// Sequence numbering storage instances model-wide
pub const STORAGE_SEQUENCE: &str = "storage";

pub type StorageConstraintsMap = BTreeMap<String, StorageConstraints>;

fn quoted(value: impl std::fmt::Display) -> String {
    format!("\"{}\"", value)
}

fn describe_max(max: Option<u64>) -> String {
    max.map_or_else(|| "unbounded".to_string(), |m| m.to_string())
}

fn validate_one(name: &str, meta: &StorageMeta, cons: &StorageConstraints, pools: &dyn StoragePoolRegistry) -> Result<()> {
    if !pools.pool_exists(&cons.pool) {
        return Err(StateError::StorageConstraint {
            message: format!("storage {:?}: pool {:?} not found", name, cons.pool),
        });
    }
    if cons.count < meta.count_min || meta.count_max.is_some_and(|max| cons.count > max) {
        return Err(StateError::StorageConstraint {
            message: format!(
                "storage {:?}: count {} outside range [{}, {}]",
                name,
                cons.count,
                meta.count_min,
                describe_max(meta.count_max)
            ),
        });
    }
    if cons.size_mib < meta.minimum_size_mib {
        return Err(StateError::StorageConstraint {
            message: format!(
                "storage {:?}: size {}M below charm minimum {}M",
                name, cons.size_mib, meta.minimum_size_mib
            ),
        });
    }
    Ok(())
}

/// Full constraint set for every store `meta` declares
///
/// Caller-provided constraints win, then `prior` ones, then a default of
/// the registry's pool for the store kind, `max(minimum, 1024)` MiB and the
/// charm's minimum count.
///
/// # Errors
///
/// Returns `StorageConstraint` for constraints naming unknown stores or
/// pools, or violating the charm's count or size range.
pub fn default_constraints(
    meta: &CharmMeta,
    provided: &StorageConstraintsMap,
    prior: Option<&StorageConstraintsMap>,
    pools: &dyn StoragePoolRegistry,
) -> Result<StorageConstraintsMap> {
    if let Some(unknown) = provided.keys().find(|name| !meta.storage.contains_key(*name)) {
        return Err(StateError::StorageConstraint {
            message: format!("charm {:?} has no store called {:?}", meta.name, unknown),
        });
    }

    let mut resolved = StorageConstraintsMap::new();
    for (name, store_meta) in &meta.storage {
        let cons = match provided.get(name).or_else(|| prior.and_then(|p| p.get(name))) {
            Some(cons) => cons.clone(),
            None => {
                let pool = pools.default_pool(store_meta.kind).ok_or_else(|| {
                    StateError::StorageConstraint {
                        message: format!(
                            "storage {:?}: no default pool for {} storage",
                            name, store_meta.kind
                        ),
                    }
                })?;
                StorageConstraints {
                    pool,
                    size_mib: store_meta.minimum_size_mib.max(DEFAULT_SIZE_MIB),
                    count: store_meta.count_min,
                }
            }
        };
        validate_one(name, store_meta, &cons, pools)?;
        resolved.insert(name.clone(), cons);
    }
    Ok(resolved)
}

/// Check that `new` can replace `old` for an application
///
/// `attached` counts the instances of each store currently attached to
/// units, `current` holds the application's constraints and `provided` the
/// caller's constraints for the upgrade.
///
/// # Errors
///
/// Returns the first of `StorageRemoved`, `StorageChanged`,
/// `StorageContracted` or `StorageConstraint` that applies, checking stores
/// in name order.
pub fn check_upgrade(
    old: &CharmMeta,
    new: &CharmMeta,
    attached: &BTreeMap<String, u64>,
    current: &StorageConstraintsMap,
    provided: &StorageConstraintsMap,
) -> Result<()> {
    for (name, old_meta) in &old.storage {
        let Some(new_meta) = new.storage.get(name) else {
            if old_meta.is_required() {
                return Err(StateError::StorageRemoved {
                    name: name.clone(),
                    reason: "required".to_string(),
                });
            }
            if attached.get(name).copied().unwrap_or(0) > 0 {
                return Err(StateError::StorageRemoved {
                    name: name.clone(),
                    reason: "in-use".to_string(),
                });
            }
            continue;
        };

        let changed = |field: &str, from: String, to: String| StateError::StorageChanged {
            name: name.clone(),
            field: field.to_string(),
            from,
            to,
        };
        if old_meta.kind != new_meta.kind {
            return Err(changed("type", quoted(old_meta.kind), quoted(new_meta.kind)));
        }
        if old_meta.shared != new_meta.shared {
            return Err(changed(
                "shared",
                old_meta.shared.to_string(),
                new_meta.shared.to_string(),
            ));
        }
        if old_meta.read_only != new_meta.read_only {
            return Err(changed(
                "read-only",
                old_meta.read_only.to_string(),
                new_meta.read_only.to_string(),
            ));
        }
        if old_meta.location != new_meta.location {
            return Err(changed(
                "location",
                quoted(old_meta.location.as_deref().unwrap_or_default()),
                quoted(new_meta.location.as_deref().unwrap_or_default()),
            ));
        }

        let contracted = match (old_meta.count_max, new_meta.count_max) {
            (None, Some(_)) => true,
            (Some(old_max), Some(new_max)) => new_max < old_max,
            (_, None) => false,
        };
        if contracted {
            return Err(StateError::StorageContracted {
                name: name.clone(),
                message: format!(
                    "max decreased from {} to {}",
                    describe_max(old_meta.count_max),
                    describe_max(new_meta.count_max)
                ),
            });
        }

        let current_count = current.get(name).map_or(0, |c| c.count);
        if new_meta.count_min > current_count {
            let satisfied = provided
                .get(name)
                .is_some_and(|c| c.count >= new_meta.count_min);
            if !satisfied {
                return Err(StateError::StorageConstraint {
                    message: format!(
                        "storage {:?} minimum count increased to {} (currently {}); \
                         a storage constraint with a sufficient count is required",
                        name, new_meta.count_min, current_count
                    ),
                });
            }
        }
    }
    Ok(())
}

/// Instances one unit needs for `stores`
pub fn instance_count(stores: &[(String, StorageKind, StorageConstraints)]) -> u64 {
    stores.iter().map(|(_, _, c)| c.count).sum()
}

/// Ops creating the instances of `stores` for `unit`, numbered from `first`
pub fn instance_ops(
    application: &str,
    unit: &str,
    stores: &[(String, StorageKind, StorageConstraints)],
    first: u64,
) -> Vec<Op> {
    let mut ops = Vec::new();
    let mut next = first;
    for (name, kind, cons) in stores {
        for _ in 0..cons.count {
            let id = format!("{}/{}", name, next);
            next += 1;
            ops.push(Op::insert(
                DocKey::new(Collection::StorageInstances, id.clone()),
                StorageInstanceDoc {
                    id,
                    storage_name: name.clone(),
                    kind: *kind,
                    application: application.to_string(),
                    unit: Some(unit.to_string()),
                    pool: cons.pool.clone(),
                    size_mib: cons.size_mib,
                },
            ));
        }
    }
    ops
}

/// Stores of `meta` paired with their constraints, skipping zero counts
pub fn stores_with_constraints(
    meta: &CharmMeta,
    constraints: &StorageConstraintsMap,
    only: impl Fn(&str) -> bool,
) -> Vec<(String, StorageKind, StorageConstraints)> {
    meta.storage
        .iter()
        .filter(|(name, _)| only(name))
        .filter_map(|(name, m)| {
            constraints
                .get(name)
                .filter(|c| c.count > 0)
                .map(|c| (name.clone(), m.kind, c.clone()))
        })
        .collect()
}

pub fn instances_of(store: &dyn Store, application: &str) -> Vec<StorageInstanceDoc> {
    store
        .scan(Collection::StorageInstances)
        .into_iter()
        .filter_map(|(_, rec)| rec.doc.as_storage_instance().cloned())
        .filter(|inst| inst.application == application)
        .collect()
}

/// Attached instance count per store name
pub fn attached_counts(store: &dyn Store, application: &str) -> BTreeMap<String, u64> {
    let mut counts = BTreeMap::new();
    for inst in instances_of(store, application) {
        if inst.unit.is_some() {
            *counts.entry(inst.storage_name).or_insert(0) += 1;
        }
    }
    counts
}

/// Ops detaching every instance attached to `unit`
pub fn detach_ops(store: &dyn Store, application: &str, unit: &str) -> Vec<Op> {
    instances_of(store, application)
        .into_iter()
        .filter(|inst| inst.unit.as_deref() == Some(unit))
        .map(|inst| {
            Op::update(
                DocKey::new(Collection::StorageInstances, inst.id),
                "detach storage",
                |doc| {
                    if let Some(inst) = doc.as_storage_instance_mut() {
                        inst.unit = None;
                    }
                },
            )
        })
        .collect()
}

/// Ops removing detached instances of `application`
pub fn remove_detached_ops(store: &dyn Store, application: &str) -> Vec<Op> {
    instances_of(store, application)
        .into_iter()
        .filter(|inst| inst.unit.is_none())
        .map(|inst| Op::remove(DocKey::new(Collection::StorageInstances, inst.id)))
        .collect()
}
