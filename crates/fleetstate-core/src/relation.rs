//! Relation handle, scope membership and relation lifecycle
//!
//! Units enter a relation's scope to take part in it. A relation with no
//! units in scope is removed as soon as it is destroyed; otherwise it goes
//! Dying and the last unit to leave removes it.

use crate::application::{can_remove, remove_application_ops};
use crate::errors::{Result, StateError};
use crate::life::Life;
use crate::logged_op;
use crate::model::{DocKey, Endpoint, RelationDoc, ScopeDoc};
use crate::settings::SettingsDrops;
use crate::state::{
    app_unchanged, assert_alive, read_application, read_relation, read_unit, scopes_of_relation,
    State,
};
use crate::txn::{Assert, Op, Store};
use crate::unit::Unit;

#[derive(Debug, Clone)]
pub struct Relation {
    st: State,
    doc: RelationDoc,
}

impl Relation {
    pub(crate) fn new(st: State, doc: RelationDoc) -> Self {
        Self { st, doc }
    }

    pub fn id(&self) -> u64 {
        self.doc.id
    }

    pub fn key(&self) -> &str {
        &self.doc.key
    }

    pub fn life(&self) -> Life {
        self.doc.life
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.doc.endpoints
    }

    pub fn endpoint(&self, application: &str) -> Option<&Endpoint> {
        self.doc.endpoint_for(application)
    }

    /// Units in scope when the snapshot was taken
    pub fn unit_count(&self) -> u64 {
        self.doc.unit_count
    }

    pub fn is_suspended(&self) -> bool {
        self.doc.suspended
    }

    pub fn doc(&self) -> &RelationDoc {
        &self.doc
    }

    /// # Errors
    ///
    /// Returns `NotFound` once the relation has been removed.
    pub fn refresh(&mut self) -> Result<()> {
        let (doc, _) = read_relation(self.st.store(), self.key())?;
        self.doc = doc;
        Ok(())
    }

    /// Names of the units currently in scope
    pub fn units_in_scope(&self) -> Vec<String> {
        scopes_of_relation(self.st.store(), self.key())
            .into_iter()
            .map(|s| s.unit)
            .collect()
    }

    /// Remove the relation, or mark it Dying while units are in scope
    ///
    /// # Errors
    ///
    /// Returns `ExcessiveContention` when concurrent writers keep winning.
    pub fn destroy(&self) -> Result<()> {
        let key = self.key().to_string();
        logged_op!("destroy_relation", key, {
            self.st
                .run(|attempt| {
                    let store = self.st.store();
                    let rel = match read_relation(store, &key) {
                        Ok((doc, _)) => doc,
                        Err(e) if e.is_not_found() => return Ok(vec![]),
                        Err(e) => return Err(e),
                    };
                    if !rel.life.is_alive() {
                        return Ok(vec![]);
                    }
                    if rel.unit_count == 0 {
                        return remove_relation_ops(store, &rel, attempt);
                    }
                    let units = rel.unit_count;
                    Ok(vec![Op::update(DocKey::relation(&key), "life = dying", |doc| {
                        if let Some(rel) = doc.as_relation_mut() {
                            if Life::can_transition(rel.life, Life::Dying) {
                                rel.life = Life::Dying;
                            }
                        }
                    })
                    .when(Assert::check(
                        format!("alive with {} units in scope", units),
                        move |doc| {
                            doc.as_relation()
                                .is_some_and(|r| r.life.is_alive() && r.unit_count == units)
                        },
                    ))])
                })
                .map_err(|e| e.annotate(format!("destroy relation {:?}", key)))
        })
    }

    /// Record that `unit` takes part in the relation
    ///
    /// Entering a scope twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `NotAlive` when the relation or unit is going away and
    /// `InvalidArgument` when the unit's application is not a participant.
    pub fn enter_scope(&self, unit: &Unit) -> Result<()> {
        let key = self.key().to_string();
        let unit_name = unit.name().to_string();
        logged_op!("enter_scope", key, {
            self.st
                .run(|_| {
                    let store = self.st.store();
                    let (rel, _) = read_relation(store, &key)?;
                    if !rel.life.is_alive() {
                        return Err(StateError::not_alive(format!("relation {:?}", key)));
                    }
                    let (unit, _) = read_unit(store, &unit_name)?;
                    if !unit.life.is_alive() {
                        return Err(StateError::not_alive(format!("unit {:?}", unit_name)));
                    }
                    if !rel.involves(&unit.application) {
                        return Err(StateError::invalid(format!(
                            "unit {:?} is not part of relation {:?}",
                            unit_name, key
                        )));
                    }
                    let scope_key = DocKey::scope(&key, &unit_name);
                    if store.get(&scope_key).is_some() {
                        return Ok(vec![]);
                    }
                    Ok(vec![
                        Op::assert(DocKey::unit(&unit_name), assert_alive()),
                        Op::insert(
                            scope_key,
                            ScopeDoc {
                                relation_key: key.clone(),
                                unit: unit_name.clone(),
                            },
                        ),
                        Op::update(DocKey::relation(&key), "unit_count += 1", |doc| {
                            if let Some(rel) = doc.as_relation_mut() {
                                rel.unit_count += 1;
                            }
                        })
                        .when(assert_alive()),
                    ])
                })
                .map_err(|e| {
                    e.annotate(format!("enter scope of relation {:?} for {:?}", key, unit_name))
                })
        })
    }

    /// Record that `unit` no longer takes part in the relation
    ///
    /// The last unit leaving a Dying relation removes it.
    ///
    /// # Errors
    ///
    /// Returns `ExcessiveContention` when concurrent writers keep winning.
    pub fn leave_scope(&self, unit: &Unit) -> Result<()> {
        self.leave_scope_named(unit.name())
    }

    pub(crate) fn leave_scope_named(&self, unit_name: &str) -> Result<()> {
        let key = self.key().to_string();
        logged_op!("leave_scope", key, {
            self.st
                .run(|attempt| {
                    let store = self.st.store();
                    let scope_key = DocKey::scope(&key, unit_name);
                    if store.get(&scope_key).is_none() {
                        return Ok(vec![]);
                    }
                    let (rel, _) = read_relation(store, &key)?;
                    let (life, units) = (rel.life, rel.unit_count);
                    let mut ops = vec![
                        Op::remove(scope_key),
                        Op::update(DocKey::relation(&key), "unit_count -= 1", |doc| {
                            if let Some(rel) = doc.as_relation_mut() {
                                rel.unit_count = rel.unit_count.saturating_sub(1);
                            }
                        })
                        .when(Assert::check(
                            format!("{} with {} units in scope", life, units),
                            move |doc| {
                                doc.as_relation()
                                    .is_some_and(|r| r.life == life && r.unit_count == units)
                            },
                        )),
                    ];
                    if !life.is_alive() && units <= 1 {
                        let mut after = rel.clone();
                        after.unit_count = 0;
                        ops.extend(remove_relation_ops(store, &after, attempt)?);
                    }
                    Ok(ops)
                })
                .map_err(|e| {
                    e.annotate(format!("leave scope of relation {:?} for {:?}", key, unit_name))
                })
        })
    }

    /// # Errors
    ///
    /// Returns `NotAlive` when the relation is going away.
    pub fn set_suspended(&self, suspended: bool) -> Result<()> {
        let key = self.key().to_string();
        logged_op!("set_relation_suspended", key, {
            self.st
                .run(|_| {
                    let (rel, revno) = read_relation(self.st.store(), &key)?;
                    if !rel.life.is_alive() {
                        return Err(StateError::not_alive(format!("relation {:?}", key)));
                    }
                    if rel.suspended == suspended {
                        return Ok(vec![]);
                    }
                    Ok(vec![Op::update(
                        DocKey::relation(&key),
                        "set suspended",
                        move |doc| {
                            if let Some(rel) = doc.as_relation_mut() {
                                rel.suspended = suspended;
                            }
                        },
                    )
                    .when(Assert::Revno(revno))])
                })
                .map_err(|e| e.annotate(format!("set suspended on relation {:?}", key)))
        })
    }
}

/// Ops removing a relation whose staged state is `rel`
///
/// Decrements the relation count of each participant and removes any Dying
/// participant this leaves without units or relations.
pub(crate) fn remove_relation_ops(
    store: &dyn Store,
    rel: &RelationDoc,
    attempt: u32,
) -> Result<Vec<Op>> {
    let life = rel.life;
    let mut ops = vec![Op::remove(DocKey::relation(&rel.key)).when(Assert::check(
        format!("{} with no units in scope", life),
        move |doc| {
            doc.as_relation()
                .is_some_and(|r| r.life == life && r.unit_count == 0)
        },
    ))];
    let mut drops = SettingsDrops::default();
    for application in rel.applications() {
        let (app, _) = read_application(store, application)?;
        ops.push(
            Op::update(
                DocKey::application(application),
                "relation_count -= 1",
                |doc| {
                    if let Some(app) = doc.as_application_mut() {
                        app.relation_count = app.relation_count.saturating_sub(1);
                    }
                },
            )
            .when(app_unchanged(&app)),
        );
        if !app.life.is_alive() {
            let mut after = app.clone();
            after.relation_count = after.relation_count.saturating_sub(1);
            if can_remove(&after) {
                ops.extend(remove_application_ops(store, &after, &mut drops));
            }
        }
    }
    ops.extend(drops.into_ops(store, attempt)?);
    Ok(ops)
}
