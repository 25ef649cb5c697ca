//! Unit handle and unit lifecycle
//!
//! A unit with no subordinates and no relation scopes is removed as soon as
//! it is destroyed. Otherwise it goes Dying and waits for its agent (or a
//! forced cleanup) to leave scopes, mark it Dead and remove it.

use chrono::Utc;

use crate::application::{can_remove, remove_application_ops, Application};
use crate::cleanup;
use crate::errors::{Result, StateError};
use crate::life::Life;
use crate::logged_op;
use crate::model::{CleanupKind, DocKey, UnitDoc, UnitStatus, WorkloadStatus};
use crate::refcount;
use crate::settings::{self, settings_ref_key, SettingsDrops};
use crate::state::{
    app_unchanged, read_application, read_unit, relations_of, scopes_of_unit, State,
};
use crate::storage;
use crate::txn::{Assert, Op, Store};

#[derive(Debug, Clone)]
pub struct Unit {
    st: State,
    doc: UnitDoc,
}

impl Unit {
    pub(crate) fn new(st: State, doc: UnitDoc) -> Self {
        Self { st, doc }
    }

    pub fn name(&self) -> &str {
        &self.doc.name
    }

    pub fn application_name(&self) -> &str {
        &self.doc.application
    }

    pub fn life(&self) -> Life {
        self.doc.life
    }

    pub fn principal(&self) -> Option<&str> {
        self.doc.principal.as_deref()
    }

    pub fn is_subordinate(&self) -> bool {
        self.doc.principal.is_some()
    }

    pub fn subordinates(&self) -> &[String] {
        &self.doc.subordinates
    }

    pub fn machine_id(&self) -> Option<&str> {
        self.doc.machine_id.as_deref()
    }

    /// Charm the unit runs, which may lag its application's
    pub fn charm_url(&self) -> Option<&str> {
        self.doc.charm_url.as_deref()
    }

    pub fn status(&self) -> &UnitStatus {
        &self.doc.status
    }

    pub fn provider_id(&self) -> Option<&str> {
        self.doc.provider_id.as_deref()
    }

    pub fn address(&self) -> Option<&str> {
        self.doc.address.as_deref()
    }

    pub fn ports(&self) -> &[u16] {
        &self.doc.ports
    }

    pub fn doc(&self) -> &UnitDoc {
        &self.doc
    }

    /// # Errors
    ///
    /// Returns `NotFound` once the unit has been removed.
    pub fn refresh(&mut self) -> Result<()> {
        let (doc, _) = read_unit(self.st.store(), self.name())?;
        self.doc = doc;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `NotFound` once the application has been removed.
    pub fn application(&self) -> Result<Application> {
        self.st.application(self.application_name())
    }

    /// Start removing the unit
    ///
    /// Removes it at once when nothing blocks, otherwise marks it Dying.
    /// Destroying a unit that is gone or already going is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `ExcessiveContention` when concurrent writers keep winning.
    pub fn destroy(&self) -> Result<()> {
        let name = self.name().to_string();
        logged_op!("destroy_unit", name, {
            self.destroy_inner()
                .map_err(|e| e.annotate(format!("destroy unit {:?}", name)))
        })
    }

    fn destroy_inner(&self) -> Result<()> {
        let name = self.name();
        self.st.run(|attempt| {
            let store = self.st.store();
            let unit = match read_unit(store, name) {
                Ok((doc, _)) => doc,
                Err(e) if e.is_not_found() => return Ok(vec![]),
                Err(e) => return Err(e),
            };
            if !unit.life.is_alive() {
                return Ok(vec![]);
            }
            if unit.subordinates.is_empty() && scopes_of_unit(store, name).is_empty() {
                return remove_unit_ops(store, &unit, attempt);
            }
            Ok(vec![set_life_op(name, Life::Alive, Life::Dying)])
        })
    }

    /// Mark the unit Dying and queue its forced removal
    ///
    /// # Errors
    ///
    /// Returns `ExcessiveContention` when concurrent writers keep winning.
    pub fn destroy_with_force(&self) -> Result<()> {
        let name = self.name().to_string();
        logged_op!("destroy_unit_with_force", name, {
            self.st
                .run(|_| {
                    let unit = match read_unit(self.st.store(), &name) {
                        Ok((doc, _)) => doc,
                        Err(e) if e.is_not_found() => return Ok(vec![]),
                        Err(e) => return Err(e),
                    };
                    let first = match unit.life {
                        Life::Dead => return Ok(vec![]),
                        Life::Alive => set_life_op(&name, Life::Alive, Life::Dying),
                        Life::Dying => Op::assert(DocKey::unit(&name), life_is(Life::Dying)),
                    };
                    Ok(vec![
                        first,
                        cleanup::queue_op(CleanupKind::ForceDestroyedUnit { unit: name.clone() }),
                    ])
                })
                .map_err(|e| e.annotate(format!("force destroy unit {:?}", name)))
        })
    }

    /// Mark the unit Dead
    ///
    /// # Errors
    ///
    /// Returns `InUse` while the unit has subordinates or is in a relation
    /// scope.
    pub fn ensure_dead(&self) -> Result<()> {
        let name = self.name().to_string();
        logged_op!("ensure_dead", name, {
            self.ensure_dead_inner()
                .map_err(|e| e.annotate(format!("make unit {:?} dead", name)))
        })
    }

    fn ensure_dead_inner(&self) -> Result<()> {
        let name = self.name();
        self.st.run(|_| {
            let store = self.st.store();
            let unit = match read_unit(store, name) {
                Ok((doc, _)) => doc,
                Err(e) if e.is_not_found() => return Ok(vec![]),
                Err(e) => return Err(e),
            };
            if unit.life.is_dead() {
                return Ok(vec![]);
            }
            if !unit.subordinates.is_empty() {
                return Err(StateError::InUse {
                    message: format!("unit {:?} still has subordinate units", name),
                });
            }
            if !scopes_of_unit(store, name).is_empty() {
                return Err(StateError::InUse {
                    message: format!("unit {:?} is still in relation scope", name),
                });
            }

            let from = unit.life;
            let mut ops = vec![Op::update(DocKey::unit(name), "life = dead", |doc| {
                if let Some(unit) = doc.as_unit_mut() {
                    if Life::can_transition(unit.life, Life::Dead) {
                        unit.life = Life::Dead;
                    }
                }
            })
            .when(Assert::check(
                format!("{} without subordinates", from),
                move |doc| {
                    doc.as_unit()
                        .is_some_and(|u| u.life == from && u.subordinates.is_empty())
                },
            ))];
            for rel in relations_of(store, &unit.application) {
                ops.push(Op::assert(DocKey::scope(&rel.key, name), Assert::Missing));
            }
            let app_alive = read_application(store, &unit.application)
                .map(|(app, _)| app.life.is_alive())
                .unwrap_or(false);
            if !app_alive {
                ops.push(cleanup::queue_op(CleanupKind::DeadUnits {
                    application: unit.application.clone(),
                }));
            }
            Ok(ops)
        })
    }

    /// Remove a Dead unit
    ///
    /// # Errors
    ///
    /// Returns `InUse` unless the unit is Dead.
    pub fn remove(&self) -> Result<()> {
        let name = self.name().to_string();
        logged_op!("remove_unit", name, {
            self.st
                .run(|attempt| {
                    let store = self.st.store();
                    let unit = match read_unit(store, &name) {
                        Ok((doc, _)) => doc,
                        Err(e) if e.is_not_found() => return Ok(vec![]),
                        Err(e) => return Err(e),
                    };
                    if !unit.life.is_dead() {
                        return Err(StateError::InUse {
                            message: format!("unit {:?} is not dead", name),
                        });
                    }
                    remove_unit_ops(store, &unit, attempt)
                })
                .map_err(|e| e.annotate(format!("remove unit {:?}", name)))
        })
    }

    /// Record that the unit now runs `url`
    ///
    /// The application must already hold settings for `url`, which is the
    /// case for its current charm.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no settings exist for `url`, `ReferenceRace`
    /// when they were dropped while this call was retrying, and `NotAlive`
    /// for a dead unit.
    pub fn set_charm_url(&self, url: &str) -> Result<()> {
        let name = self.name().to_string();
        logged_op!("set_unit_charm_url", name, {
            self.st
                .run(|attempt| {
                    let store = self.st.store();
                    let (unit, _) = read_unit(store, &name)?;
                    if unit.life.is_dead() {
                        return Err(StateError::not_alive(format!("unit {:?}", name)));
                    }
                    if unit.charm_url.as_deref() == Some(url) {
                        return Ok(vec![]);
                    }
                    let ref_key = settings_ref_key(url);
                    refcount::read(store, &unit.application, &ref_key).map_err(|_| {
                        if attempt == 0 {
                            StateError::not_found(format!(
                                "settings for application {:?} charm {:?}",
                                unit.application, url
                            ))
                        } else {
                            StateError::ReferenceRace {
                                owner: unit.application.clone(),
                                key: ref_key.clone(),
                            }
                        }
                    })?;

                    let old = unit.charm_url.clone();
                    let expected = old.clone();
                    let new_url = url.to_string();
                    let mut ops = vec![Op::update(
                        DocKey::unit(&name),
                        "set charm url",
                        move |doc| {
                            if let Some(unit) = doc.as_unit_mut() {
                                unit.charm_url = Some(new_url.clone());
                            }
                        },
                    )
                    .when(Assert::check("not dead on same charm", move |doc| {
                        doc.as_unit()
                            .is_some_and(|u| !u.life.is_dead() && u.charm_url == expected)
                    }))];
                    ops.extend(settings::add_ref_ops(store, &unit.application, url, None));
                    if let Some(old) = &old {
                        let mut drops = SettingsDrops::default();
                        drops.add(&unit.application, old);
                        ops.extend(drops.into_ops(store, attempt)?);
                    }
                    Ok(ops)
                })
                .map_err(|e| e.annotate(format!("set charm url of unit {:?}", name)))
        })
    }

    /// # Errors
    ///
    /// Returns `NotFound` for removed units and `NotAlive` for dead ones.
    pub fn set_status(&self, status: WorkloadStatus, message: impl Into<String>) -> Result<()> {
        let name = self.name().to_string();
        let message = message.into();
        logged_op!("set_unit_status", name, {
            self.st
                .run(|_| {
                    let (unit, _) = read_unit(self.st.store(), &name)?;
                    if unit.life.is_dead() {
                        return Err(StateError::not_alive(format!("unit {:?}", name)));
                    }
                    let status = UnitStatus {
                        status,
                        message: message.clone(),
                        since: Utc::now(),
                    };
                    Ok(vec![Op::update(DocKey::unit(&name), "set status", move |doc| {
                        if let Some(unit) = doc.as_unit_mut() {
                            unit.status = status.clone();
                        }
                    })
                    .when(Assert::check("not dead", |doc| {
                        doc.life().is_some_and(|life| !life.is_dead())
                    }))])
                })
                .map_err(|e| e.annotate(format!("set status of unit {:?}", name)))
        })
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` for subordinates and for units already on
    /// another machine, `NotAlive` for units going away.
    pub fn assign_to_machine(&self, machine_id: &str) -> Result<()> {
        let name = self.name().to_string();
        logged_op!("assign_to_machine", name, {
            self.st
                .run(|_| {
                    let (unit, _) = read_unit(self.st.store(), &name)?;
                    if !unit.life.is_alive() {
                        return Err(StateError::not_alive(format!("unit {:?}", name)));
                    }
                    if unit.principal.is_some() {
                        return Err(StateError::invalid(format!(
                            "unit {:?} is a subordinate",
                            name
                        )));
                    }
                    match unit.machine_id.as_deref() {
                        Some(current) if current == machine_id => return Ok(vec![]),
                        Some(current) => {
                            return Err(StateError::invalid(format!(
                                "unit {:?} is already assigned to machine {:?}",
                                name, current
                            )))
                        }
                        None => {}
                    }
                    let machine = machine_id.to_string();
                    Ok(vec![Op::update(DocKey::unit(&name), "assign machine", move |doc| {
                        if let Some(unit) = doc.as_unit_mut() {
                            unit.machine_id = Some(machine.clone());
                        }
                    })
                    .when(Assert::check("alive and unassigned", |doc| {
                        doc.as_unit()
                            .is_some_and(|u| u.life.is_alive() && u.machine_id.is_none())
                    }))])
                })
                .map_err(|e| {
                    e.annotate(format!("assign unit {:?} to machine {:?}", name, machine_id))
                })
        })
    }
}

fn life_is(life: Life) -> Assert {
    Assert::check(format!("life {}", life), move |doc| doc.life() == Some(life))
}

fn set_life_op(unit: &str, from: Life, to: Life) -> Op {
    Op::update(DocKey::unit(unit), format!("life = {}", to), move |doc| {
        if let Some(unit) = doc.as_unit_mut() {
            if Life::can_transition(unit.life, to) {
                unit.life = to;
            }
        }
    })
    .when(life_is(from))
}

/// Ops removing `unit` as read
///
/// Decrements the application's unit count, releases the unit's settings
/// reference and storage, and removes a Dying application whose last unit
/// this was.
pub(crate) fn remove_unit_ops(store: &dyn Store, unit: &UnitDoc, attempt: u32) -> Result<Vec<Op>> {
    let name = unit.name.as_str();
    let life = unit.life;
    let mut ops = vec![Op::remove(DocKey::unit(name)).when(Assert::check(
        format!("{} without subordinates", life),
        move |doc| {
            doc.as_unit()
                .is_some_and(|u| u.life == life && u.subordinates.is_empty())
        },
    ))];
    for rel in relations_of(store, &unit.application) {
        ops.push(Op::assert(DocKey::scope(&rel.key, name), Assert::Missing));
    }

    let (app, _) = read_application(store, &unit.application)?;
    ops.push(
        Op::update(
            DocKey::application(&app.name),
            "unit_count -= 1",
            |doc| {
                if let Some(app) = doc.as_application_mut() {
                    app.unit_count = app.unit_count.saturating_sub(1);
                }
            },
        )
        .when(app_unchanged(&app)),
    );

    if let Some(principal) = &unit.principal {
        if store.get(&DocKey::unit(principal)).is_some() {
            let me = name.to_string();
            ops.push(Op::update(
                DocKey::unit(principal),
                "remove subordinate",
                move |doc| {
                    if let Some(p) = doc.as_unit_mut() {
                        p.subordinates.retain(|s| *s != me);
                    }
                },
            ));
        }
    }

    let detach = storage::detach_ops(store, &unit.application, name);
    if !detach.is_empty() {
        ops.extend(detach);
        ops.push(cleanup::queue_op(CleanupKind::ApplicationStorage {
            application: unit.application.clone(),
        }));
    }

    let mut drops = SettingsDrops::default();
    if let Some(url) = &unit.charm_url {
        drops.add(&unit.application, url);
    }
    if !app.life.is_alive() {
        let mut after = app.clone();
        after.unit_count = after.unit_count.saturating_sub(1);
        if can_remove(&after) {
            ops.extend(remove_application_ops(store, &after, &mut drops));
        }
    }
    ops.extend(drops.into_ops(store, attempt)?);
    Ok(ops)
}
