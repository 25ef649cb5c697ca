//! Charm upgrades
//!
//! `set_charm` validates the target charm against everything the
//! application already has (relations, storage, settings, bindings), then
//! swaps it in one transaction that asserts the application did not change
//! underneath. A conflicting writer aborts the swap and the whole pipeline
//! runs again against fresh state.

use std::collections::{BTreeMap, BTreeSet};

use crate::application::{read_bindings, read_storage_constraints, Application};
use crate::bindings::resolve_bindings;
use crate::errors::{Result, StateError};
use crate::model::{
    Bindings, BindingsDoc, Charm, CharmMeta, CharmOrigin, CharmRelation, DocKey, RelationDoc,
    Settings, SettingsDoc, StorageConstraintsDoc, WorkloadStatus,
};
use crate::settings::{self, SettingsDrops};
use crate::state::{
    peer_relation_docs, read_application, read_charm, relations_of, scopes_of_relation,
    sequence_op, unsupported_base, units_of, State, RELATION_SEQUENCE,
};
use crate::storage::{self, StorageConstraintsMap, STORAGE_SEQUENCE};
use crate::txn::{Assert, Op};

/// Parameters of [`Application::set_charm`]
#[derive(Debug, Clone)]
pub struct SetCharmConfig {
    /// Target charm; must be registered with `State::add_charm`
    pub charm: Charm,
    pub charm_origin: CharmOrigin,
    /// Overrides applied on top of the carried-over settings
    pub config_settings: Settings,
    /// Upgrade even when units are in an error state
    pub force_units: bool,
    /// Upgrade even when the charm does not support the application's base
    pub force_base: bool,
    /// Skip LXD profile validation and allow removing busy peer relations
    pub force: bool,
    pub endpoint_bindings: Bindings,
    pub storage_constraints: StorageConstraintsMap,
}

impl SetCharmConfig {
    pub fn new(charm: Charm) -> Self {
        Self {
            charm,
            charm_origin: CharmOrigin::default(),
            config_settings: Settings::new(),
            force_units: false,
            force_base: false,
            force: false,
            endpoint_bindings: Bindings::new(),
            storage_constraints: StorageConstraintsMap::new(),
        }
    }
}

pub(crate) fn set_charm(app: &Application, cfg: &SetCharmConfig) -> Result<()> {
    let st = app.state();
    let name = app.name();
    st.run(|attempt| upgrade_ops(st, name, cfg, attempt))
        .map_err(|e| {
            e.annotate(format!(
                "upgrade application {:?} to charm {:?}",
                name, cfg.charm.url
            ))
        })
}

/// What an upgrade does to the application's relations
#[derive(Debug, Default)]
struct RelationPlan {
    /// Peer relations whose endpoint the new charm drops
    removed: Vec<RelationDoc>,
    /// Peer endpoints the new charm adds
    added: Vec<CharmRelation>,
    /// Kept relations whose endpoint limit or optionality changed
    updated: Vec<(String, CharmRelation)>,
}

fn plan_relations(
    application: &str,
    meta: &CharmMeta,
    relations: &[RelationDoc],
    force: bool,
) -> Result<RelationPlan> {
    let mut plan = RelationPlan::default();
    let mut kept_peers = BTreeSet::new();
    let mut established: BTreeMap<&str, u64> = BTreeMap::new();

    for rel in relations {
        let Some(ep) = rel.endpoint_for(application) else {
            continue;
        };
        if rel.is_peer() {
            match meta.peers.get(&ep.relation.name) {
                Some(peer) if peer.interface == ep.relation.interface => {
                    kept_peers.insert(peer.name.as_str());
                    if differs(peer, &ep.relation) {
                        plan.updated.push((rel.key.clone(), peer.clone()));
                    }
                }
                _ => {
                    if rel.unit_count > 1 && !force {
                        return Err(StateError::InUse {
                            message: format!(
                                "cannot remove peer relation {:?} with {} units in scope",
                                rel.key, rel.unit_count
                            ),
                        });
                    }
                    plan.removed.push(rel.clone());
                }
            }
            continue;
        }

        let kept = meta.relation(&ep.relation.name).filter(|r| {
            r.role == ep.relation.role && r.interface == ep.relation.interface
        });
        let Some(kept) = kept else {
            return Err(StateError::WouldBreakRelation {
                relation: rel.key.clone(),
            });
        };
        *established.entry(kept.name.as_str()).or_insert(0) += 1;
        if differs(kept, &ep.relation) {
            plan.updated.push((rel.key.clone(), kept.clone()));
        }
    }

    for (endpoint, count) in established {
        let Some(declared) = meta.relation(endpoint) else {
            continue;
        };
        if declared.limit > 0 && count > u64::from(declared.limit) {
            return Err(StateError::QuotaLimitExceeded {
                message: format!(
                    "new charm version imposes a maximum relation limit of {} for \"{}:{}\" \
                     which cannot be satisfied by the number of already established relations ({})",
                    declared.limit, application, endpoint, count
                ),
            });
        }
    }

    plan.added = meta
        .peers
        .values()
        .filter(|peer| !kept_peers.contains(peer.name.as_str()))
        .cloned()
        .collect();
    Ok(plan)
}

/// Relation-level differences carried onto existing relations; scope is
/// fixed when the relation is created
fn differs(new: &CharmRelation, old: &CharmRelation) -> bool {
    new.limit != old.limit || new.optional != old.optional
}

fn upgrade_ops(st: &State, name: &str, cfg: &SetCharmConfig, attempt: u32) -> Result<Vec<Op>> {
    let store = st.store();
    let (app, _) = read_application(store, name)?;
    if !app.life.is_alive() {
        return Err(StateError::not_alive(format!("application {:?}", name)));
    }
    let new = read_charm(store, &cfg.charm.url)?;
    let old = read_charm(store, &app.charm_url)?;

    // 1. subordinacy
    if old.meta.subordinate != new.meta.subordinate {
        let message = if new.meta.subordinate {
            "cannot change an application from principal to subordinate"
        } else {
            "cannot change an application from subordinate to principal"
        };
        return Err(StateError::ImmutableField {
            message: message.to_string(),
        });
    }

    // 2. base
    if !cfg.force_base && !new.meta.supports_base(&app.base) {
        return Err(unsupported_base(&app.base, &new.meta.bases));
    }

    // 3. LXD profile
    if !cfg.force {
        if let Some(profile) = &new.meta.lxd_profile {
            profile.validate()?;
        }
    }

    let units = units_of(store, name);
    if !cfg.force_units {
        if let Some(unit) = units
            .iter()
            .find(|u| u.status.status == WorkloadStatus::Error)
        {
            return Err(StateError::UnitInError {
                unit: unit.name.clone(),
            });
        }
    }

    // 4. endpoints
    let plan = plan_relations(name, &new.meta, &relations_of(store, name), cfg.force)?;

    // 5. storage compatibility
    let current_storage = read_storage_constraints(store, name)?;
    storage::check_upgrade(
        &old.meta,
        &new.meta,
        &storage::attached_counts(store, name),
        &current_storage,
        &cfg.storage_constraints,
    )?;

    // 6. settings
    let (old_values, settings_revno) =
        settings::read_settings_record(store, name, &app.charm_url)?;
    let values = settings::apply_changes(
        &settings::filter_to_schema(&old_values, &new.config),
        &cfg.config_settings,
    );
    new.config.validate(&values)?;

    // 7. storage constraints and attachments for new stores
    let new_storage = storage::default_constraints(
        &new.meta,
        &cfg.storage_constraints,
        Some(&current_storage),
        st.pools(),
    )?;
    let added_stores = storage::stores_with_constraints(&new.meta, &new_storage, |store_name| {
        !old.meta.storage.contains_key(store_name)
    });

    // 8. bindings
    let (prior_bindings, bindings_revno) = read_bindings(store, name)?;
    let bindings = resolve_bindings(
        &new.meta.binding_endpoints(),
        &cfg.endpoint_bindings,
        Some(&prior_bindings),
        &st.config().default_space,
        st.spaces(),
    )?;

    let mut ops = vec![
        Op::assert(DocKey::charm(&new.url), Assert::Exists),
        Op::assert(
            DocKey::settings(name, &app.charm_url),
            Assert::Revno(settings_revno),
        ),
    ];

    let (old_url, units_before, relations_before) =
        (app.charm_url.clone(), app.unit_count, app.relation_count);
    let relations_after = relations_before + plan.added.len() as u64 - plan.removed.len() as u64;
    let (new_url, origin, force_units) =
        (new.url.clone(), cfg.charm_origin.clone(), cfg.force_units);
    ops.push(
        Op::update(DocKey::application(name), "swap charm", move |doc| {
            if let Some(app) = doc.as_application_mut() {
                app.charm_url = new_url.clone();
                app.charm_origin = origin.clone();
                app.force_charm = force_units;
                app.charm_modified_version += 1;
                app.relation_count = relations_after;
            }
        })
        .when(Assert::check(
            format!(
                "alive on {} with {} units and {} relations",
                old_url, units_before, relations_before
            ),
            {
                let old_url = old_url.clone();
                move |doc| {
                    doc.as_application().is_some_and(|a| {
                        a.life.is_alive()
                            && a.charm_url == old_url
                            && a.unit_count == units_before
                            && a.relation_count == relations_before
                    })
                }
            },
        )),
    );

    if new.url != old_url {
        ops.extend(settings::add_ref_ops(store, name, &new.url, Some(&values)));
        let mut drops = SettingsDrops::default();
        drops.add(name, &old_url);
        ops.extend(drops.into_ops(store, attempt)?);
    } else if values != old_values {
        ops.push(Op::replace(
            DocKey::settings(name, &old_url),
            SettingsDoc { values },
        ));
    }

    if bindings != prior_bindings {
        ops.push(
            Op::replace(DocKey::bindings(name), BindingsDoc { bindings })
                .when(Assert::Revno(bindings_revno)),
        );
    }
    if new_storage != current_storage {
        ops.push(Op::replace(
            DocKey::storage_constraints(name),
            StorageConstraintsDoc {
                constraints: new_storage,
            },
        ));
    }

    for rel in &plan.removed {
        let units_in_scope = rel.unit_count;
        ops.push(
            Op::remove(DocKey::relation(&rel.key)).when(Assert::check(
                format!("{} units in scope", units_in_scope),
                move |doc| {
                    doc.as_relation()
                        .is_some_and(|r| r.unit_count == units_in_scope)
                },
            )),
        );
        for scope in scopes_of_relation(store, &rel.key) {
            ops.push(Op::remove(DocKey::scope(&rel.key, &scope.unit)));
        }
    }
    if !plan.added.is_empty() {
        let (first, seq_op) = sequence_op(store, RELATION_SEQUENCE, plan.added.len() as u64);
        ops.push(seq_op);
        for rel in peer_relation_docs(name, &plan.added, first) {
            ops.push(Op::insert(DocKey::relation(&rel.key), rel));
        }
    }
    for (key, def) in plan.updated {
        let app_name = name.to_string();
        ops.push(Op::update(
            DocKey::relation(&key),
            "update endpoint",
            move |doc| {
                if let Some(rel) = doc.as_relation_mut() {
                    for ep in rel
                        .endpoints
                        .iter_mut()
                        .filter(|ep| ep.application_name == app_name)
                    {
                        ep.relation.limit = def.limit;
                        ep.relation.optional = def.optional;
                    }
                }
            },
        ));
    }

    let per_unit = storage::instance_count(&added_stores);
    if per_unit > 0 && !units.is_empty() {
        let (mut next, seq_op) =
            sequence_op(store, STORAGE_SEQUENCE, per_unit * units.len() as u64);
        ops.push(seq_op);
        for unit in &units {
            ops.extend(storage::instance_ops(name, &unit.name, &added_stores, next));
            next += per_unit;
        }
    }

    Ok(ops)
}
