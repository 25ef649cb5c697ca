//! Application handle
//!
//! [`Application`] wraps a snapshot of an application document. Reads on
//! the handle return the snapshot; every mutation reads fresh state inside
//! its transaction and asserts what it read. Call [`Application::refresh`]
//! to pick up changes made elsewhere.

use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::bindings;
use crate::cleanup;
use crate::core_types::UnitName;
use crate::destroy::DestroyApplicationOperation;
use crate::errors::{Result, StateError};
use crate::life::Life;
use crate::logged_op;
use crate::model::{
    ApplicationDoc, Base, Bindings, BindingsDoc, CaasState, Charm, CharmOrigin, CleanupKind,
    Constraints, DocKey, ExposedEndpoint, Settings, SettingsDoc, UnitDoc, UnitStatus,
};
use crate::relation::Relation;
use crate::settings::{self, SettingsDrops};
use crate::state::{
    assert_alive, read_application, read_charm, read_unit, relations_of, sequence_at_least_op,
    sequence_op, units_of, State,
};
use crate::storage::{self, StorageConstraintsMap, STORAGE_SEQUENCE};
use crate::txn::{Assert, Op, Store};
use crate::unit::Unit;
use crate::upgrade::{self, SetCharmConfig};
use crate::watcher::{self, NotifyWatcher, StringsWatcher};

/// Refcount key counting the offers of an application
pub const OFFERS_REF_KEY: &str = "offers";

/// Optional details for [`Application::add_unit`]
#[derive(Debug, Clone, Default)]
pub struct AddUnitParams {
    pub provider_id: Option<String>,
    pub address: Option<String>,
    pub ports: Vec<u16>,
    /// Explicit `app/N` name; the unit sequence is raised past it
    pub unit_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Application {
    st: State,
    doc: ApplicationDoc,
}

impl Application {
    pub(crate) fn new(st: State, doc: ApplicationDoc) -> Self {
        Self { st, doc }
    }

    pub(crate) fn state(&self) -> &State {
        &self.st
    }

    pub fn name(&self) -> &str {
        &self.doc.name
    }

    pub fn charm_url(&self) -> &str {
        &self.doc.charm_url
    }

    pub fn charm_origin(&self) -> &CharmOrigin {
        &self.doc.charm_origin
    }

    pub fn base(&self) -> &Base {
        &self.doc.base
    }

    pub fn life(&self) -> Life {
        self.doc.life
    }

    pub fn is_subordinate(&self) -> bool {
        self.doc.subordinate
    }

    pub fn unit_count(&self) -> u64 {
        self.doc.unit_count
    }

    pub fn relation_count(&self) -> u64 {
        self.doc.relation_count
    }

    pub fn min_units(&self) -> u64 {
        self.doc.min_units
    }

    pub fn is_exposed(&self) -> bool {
        self.doc.exposed
    }

    pub fn exposed_endpoints(&self) -> &BTreeMap<String, ExposedEndpoint> {
        &self.doc.exposed_endpoints
    }

    /// Bumped by every successful `set_charm`
    pub fn charm_modified_version(&self) -> u64 {
        self.doc.charm_modified_version
    }

    pub fn force_charm(&self) -> bool {
        self.doc.force_charm
    }

    pub fn caas_state(&self) -> Option<&CaasState> {
        self.doc.caas.as_ref()
    }

    pub fn doc(&self) -> &ApplicationDoc {
        &self.doc
    }

    /// Reload the snapshot
    ///
    /// # Errors
    ///
    /// Returns `NotFound` once the application has been removed.
    pub fn refresh(&mut self) -> Result<()> {
        let (doc, _) = read_application(self.st.store(), self.name())?;
        self.doc = doc;
        Ok(())
    }

    /// Current charm
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the application or its charm is gone.
    pub fn charm(&self) -> Result<Charm> {
        let (doc, _) = read_application(self.st.store(), self.name())?;
        read_charm(self.st.store(), &doc.charm_url)
    }

    pub fn units(&self) -> Vec<Unit> {
        units_of(self.st.store(), self.name())
            .into_iter()
            .map(|doc| Unit::new(self.st.clone(), doc))
            .collect()
    }

    pub fn relations(&self) -> Vec<Relation> {
        relations_of(self.st.store(), self.name())
            .into_iter()
            .map(|doc| Relation::new(self.st.clone(), doc))
            .collect()
    }

    /// Switch the application to another charm
    ///
    /// # Errors
    ///
    /// Every failure reads `cannot upgrade application "X" to charm "Y": …`.
    pub fn set_charm(&self, cfg: SetCharmConfig) -> Result<()> {
        let name = self.name().to_string();
        logged_op!("set_charm", name, upgrade::set_charm(self, &cfg))
    }

    pub fn destroy_operation(&self) -> DestroyApplicationOperation {
        DestroyApplicationOperation::new(self.clone())
    }

    /// Destroy without force or offer removal
    ///
    /// # Errors
    ///
    /// As [`DestroyApplicationOperation::run`].
    pub fn destroy(&self) -> Result<()> {
        self.destroy_operation().run()
    }

    // ===== Units =====

    /// Add a principal unit
    ///
    /// # Errors
    ///
    /// Returns `NotAlive` for a dying application, `InvalidArgument` for
    /// subordinate applications or a malformed explicit name and
    /// `AlreadyExists` when the explicit name is taken.
    pub fn add_unit(&self, params: AddUnitParams) -> Result<Unit> {
        let name = self.name().to_string();
        logged_op!("add_unit", name, {
            self.add_unit_inner(&params, None)
                .map_err(|e| e.annotate(format!("add unit to application {:?}", name)))
        })
    }

    /// Add a unit of this subordinate application to `principal`
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` unless this application is subordinate and
    /// related to the principal's application, `NotAlive` when either side
    /// is going away and `AlreadyExists` when the principal already has a
    /// unit of this application.
    pub fn add_subordinate_unit(&self, principal: &Unit) -> Result<Unit> {
        let name = self.name().to_string();
        logged_op!("add_subordinate_unit", name, {
            self.add_unit_inner(&AddUnitParams::default(), Some(principal.name()))
                .map_err(|e| {
                    e.annotate(format!(
                        "add unit of application {:?} to {:?}",
                        name,
                        principal.name()
                    ))
                })
        })
    }

    fn add_unit_inner(&self, params: &AddUnitParams, principal: Option<&str>) -> Result<Unit> {
        let st = &self.st;
        let app_name = self.name();
        let unit_sequence = format!("application-{}", app_name);
        let mut created = String::new();

        st.run(|_| {
            let store = st.store();
            let (app, _) = read_application(store, app_name)?;
            if !app.life.is_alive() {
                return Err(StateError::not_alive(format!("application {:?}", app_name)));
            }
            match (app.subordinate, principal) {
                (true, None) => {
                    return Err(StateError::invalid(format!(
                        "cannot directly add units to subordinate application {:?}",
                        app_name
                    )))
                }
                (false, Some(_)) => {
                    return Err(StateError::invalid(format!(
                        "application {:?} is not a subordinate",
                        app_name
                    )))
                }
                _ => {}
            }

            let mut ops = Vec::new();
            let unit_name = match &params.unit_name {
                Some(requested) => {
                    let parsed = UnitName::parse(requested)
                        .filter(|u| u.application() == app_name)
                        .ok_or_else(|| {
                            StateError::invalid(format!(
                                "invalid unit name {:?} for application {:?}",
                                requested, app_name
                            ))
                        })?;
                    ops.extend(sequence_at_least_op(store, &unit_sequence, parsed.index()));
                    parsed.to_string()
                }
                None => {
                    let (index, seq_op) = sequence_op(store, &unit_sequence, 1);
                    ops.push(seq_op);
                    UnitName::new(app_name, index).to_string()
                }
            };
            if store.get(&DocKey::unit(&unit_name)).is_some() {
                return Err(StateError::AlreadyExists {
                    entity: format!("unit {:?}", unit_name),
                });
            }

            let mut machine_id = None;
            if let Some(principal) = principal {
                let (pdoc, _) = read_unit(store, principal)?;
                if !pdoc.life.is_alive() {
                    return Err(StateError::not_alive(format!("unit {:?}", principal)));
                }
                let related = relations_of(store, app_name)
                    .iter()
                    .any(|rel| rel.life.is_alive() && rel.involves(&pdoc.application));
                if !related {
                    return Err(StateError::invalid(format!(
                        "application {:?} is not related to application {:?}",
                        app_name, pdoc.application
                    )));
                }
                let prefix = format!("{}/", app_name);
                if pdoc.subordinates.iter().any(|s| s.starts_with(&prefix)) {
                    return Err(StateError::AlreadyExists {
                        entity: format!(
                            "subordinate of application {:?} for unit {:?}",
                            app_name, principal
                        ),
                    });
                }
                let sub = unit_name.clone();
                let check_prefix = prefix.clone();
                ops.push(
                    Op::update(DocKey::unit(principal), "add subordinate", move |doc| {
                        if let Some(unit) = doc.as_unit_mut() {
                            unit.subordinates.push(sub.clone());
                        }
                    })
                    .when(Assert::check("alive without this subordinate", move |doc| {
                        doc.as_unit().is_some_and(|u| {
                            u.life.is_alive()
                                && !u.subordinates.iter().any(|s| s.starts_with(&check_prefix))
                        })
                    })),
                );
                machine_id = pdoc.machine_id.clone();
            }

            let url = app.charm_url.clone();
            ops.push(Op::insert(
                DocKey::unit(&unit_name),
                UnitDoc {
                    name: unit_name.clone(),
                    application: app_name.to_string(),
                    life: Life::Alive,
                    principal: principal.map(str::to_string),
                    subordinates: Vec::new(),
                    machine_id,
                    charm_url: Some(url.clone()),
                    status: UnitStatus::default(),
                    provider_id: params.provider_id.clone(),
                    address: params.address.clone(),
                    ports: params.ports.clone(),
                },
            ));
            let expected_url = url.clone();
            ops.push(
                Op::update(DocKey::application(app_name), "unit_count += 1", |doc| {
                    if let Some(app) = doc.as_application_mut() {
                        app.unit_count += 1;
                    }
                })
                .when(Assert::check("alive on same charm", move |doc| {
                    doc.as_application()
                        .is_some_and(|a| a.life.is_alive() && a.charm_url == expected_url)
                })),
            );
            ops.extend(settings::add_ref_ops(store, app_name, &url, None));

            let charm = read_charm(store, &url)?;
            let constraints = read_storage_constraints(store, app_name)?;
            let stores = storage::stores_with_constraints(&charm.meta, &constraints, |_| true);
            let needed = storage::instance_count(&stores);
            if needed > 0 {
                let (first, seq_op) = sequence_op(store, STORAGE_SEQUENCE, needed);
                ops.push(seq_op);
                ops.extend(storage::instance_ops(app_name, &unit_name, &stores, first));
            }

            created = unit_name;
            Ok(ops)
        })?;
        st.unit(&created)
    }

    // ===== Constraints and expose =====

    /// # Errors
    ///
    /// Returns `InvalidArgument` for invalid constraints and `NotAlive`
    /// when the application is going away.
    pub fn set_constraints(&self, constraints: Constraints) -> Result<()> {
        constraints.validate().map_err(|e| {
            e.annotate(format!("set constraints for application {:?}", self.name()))
        })?;
        self.modify_alive(
            "set_constraints",
            "set constraints for application",
            move |app| app.constraints = constraints.clone(),
        )
    }

    /// # Errors
    ///
    /// Returns `NotFound` once the application has been removed.
    pub fn constraints(&self) -> Result<Constraints> {
        let (doc, _) = read_application(self.st.store(), self.name())?;
        Ok(doc.constraints)
    }

    /// Expose endpoints, merging into existing expose settings
    ///
    /// `""` stands for every endpoint. An entry with neither spaces nor
    /// CIDRs opens the endpoint to all addresses.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for unknown endpoints, spaces or malformed
    /// CIDRs.
    pub fn merge_expose_settings(
        &self,
        exposed: BTreeMap<String, ExposedEndpoint>,
    ) -> Result<()> {
        let endpoints = self
            .charm()
            .map_err(|e| e.annotate(format!("merge expose settings of {:?}", self.name())))?
            .meta
            .binding_endpoints();
        let mut normalized = BTreeMap::new();
        for (endpoint, mut settings) in exposed {
            if !endpoint.is_empty() && !endpoints.contains(&endpoint) {
                return Err(StateError::invalid(format!(
                    "endpoint {:?} not found",
                    endpoint
                ))
                .annotate(format!("merge expose settings of {:?}", self.name())));
            }
            if let Some(space) = settings
                .to_spaces
                .iter()
                .find(|s| !self.st.spaces().space_exists(s))
            {
                return Err(StateError::invalid(format!("space {:?} not found", space))
                    .annotate(format!("merge expose settings of {:?}", self.name())));
            }
            if let Some(cidr) = settings.to_cidrs.iter().find(|c| !is_valid_cidr(c)) {
                return Err(StateError::invalid(format!("invalid CIDR {:?}", cidr))
                    .annotate(format!("merge expose settings of {:?}", self.name())));
            }
            if settings.to_spaces.is_empty() && settings.to_cidrs.is_empty() {
                settings.to_cidrs = vec!["0.0.0.0/0".to_string(), "::/0".to_string()];
            }
            normalized.insert(endpoint, settings);
        }

        self.modify_alive(
            "merge_expose_settings",
            "merge expose settings of application",
            move |app| {
                app.exposed = true;
                app.exposed_endpoints
                    .extend(normalized.iter().map(|(k, v)| (k.clone(), v.clone())));
            },
        )
    }

    /// Remove expose settings for `endpoints`
    ///
    /// The application stops being exposed when none remain.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when an endpoint is not exposed.
    pub fn unset_expose_settings(&self, endpoints: &[String]) -> Result<()> {
        let name = self.name().to_string();
        logged_op!("unset_expose_settings", name, {
            self.st
                .run(|_| {
                    let (app, revno) = read_application(self.st.store(), &name)?;
                    if !app.life.is_alive() {
                        return Err(StateError::not_alive(format!("application {:?}", name)));
                    }
                    if let Some(missing) = endpoints
                        .iter()
                        .find(|ep| !app.exposed_endpoints.contains_key(*ep))
                    {
                        return Err(StateError::invalid(format!(
                            "endpoint {:?} is not exposed",
                            missing
                        )));
                    }
                    let remove: Vec<String> = endpoints.to_vec();
                    Ok(vec![Op::update(
                        DocKey::application(&name),
                        "unset expose settings",
                        move |doc| {
                            if let Some(app) = doc.as_application_mut() {
                                for ep in &remove {
                                    app.exposed_endpoints.remove(ep);
                                }
                                if app.exposed_endpoints.is_empty() {
                                    app.exposed = false;
                                }
                            }
                        },
                    )
                    .when(Assert::Revno(revno))])
                })
                .map_err(|e| e.annotate(format!("unset expose settings of {:?}", name)))
        })
    }

    /// # Errors
    ///
    /// Returns `NotAlive` when the application is going away.
    pub fn clear_exposed(&self) -> Result<()> {
        self.modify_alive("clear_exposed", "clear exposed of application", |app| {
            app.exposed = false;
            app.exposed_endpoints.clear();
        })
    }

    // ===== Bindings =====

    /// # Errors
    ///
    /// Returns `NotFound` once the application has been removed.
    pub fn endpoint_bindings(&self) -> Result<Bindings> {
        read_bindings(self.st.store(), self.name()).map(|(b, _)| b)
    }

    /// Merge explicit binding changes
    ///
    /// Without `force`, moving an endpoint that a live relation uses is
    /// rejected.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBindings` for unknown endpoints or spaces and for
    /// unforced moves of endpoints in use.
    pub fn merge_bindings(&self, changes: &Bindings, force: bool) -> Result<()> {
        let name = self.name().to_string();
        logged_op!("merge_bindings", name, {
            self.merge_bindings_inner(changes, force)
                .map_err(|e| e.annotate(format!("merge endpoint bindings of {:?}", name)))
        })
    }

    fn merge_bindings_inner(&self, changes: &Bindings, force: bool) -> Result<()> {
        let name = self.name();
        self.st.run(|_| {
            let store = self.st.store();
            let (app, _) = read_application(store, name)?;
            if !app.life.is_alive() {
                return Err(StateError::not_alive(format!("application {:?}", name)));
            }
            let charm = read_charm(store, &app.charm_url)?;
            let (current, revno) = read_bindings(store, name)?;
            let merged = bindings::merge_bindings(
                &current,
                changes,
                &charm.meta.binding_endpoints(),
                self.st.spaces(),
            )?;
            if merged == current {
                return Ok(vec![]);
            }
            if !force {
                let changed = bindings::changed_endpoints(&current, &merged);
                for rel in relations_of(store, name) {
                    if !rel.life.is_alive() {
                        continue;
                    }
                    if let Some(ep) = rel.endpoint_for(name) {
                        if changed.contains(&ep.relation.name) {
                            return Err(StateError::InvalidBindings {
                                message: format!(
                                    "endpoint {:?} is used by relation {:?}; use force to rebind",
                                    ep.relation.name, rel.key
                                ),
                            });
                        }
                    }
                }
            }
            Ok(vec![
                Op::assert(DocKey::application(name), assert_alive()),
                Op::replace(DocKey::bindings(name), BindingsDoc { bindings: merged })
                    .when(Assert::Revno(revno)),
            ])
        })
    }

    // ===== Scaling =====

    /// # Errors
    ///
    /// Returns `NotAlive` when the application is going away.
    pub fn set_min_units(&self, min_units: u64) -> Result<()> {
        self.modify_alive("set_min_units", "set minimum units of application", move |app| {
            app.min_units = min_units
        })
    }

    /// Add units until the number of alive units reaches min-units
    ///
    /// # Errors
    ///
    /// As [`Application::add_unit`].
    pub fn ensure_min_units(&self) -> Result<()> {
        let name = self.name().to_string();
        logged_op!("ensure_min_units", name, {
            self.ensure_min_units_inner()
                .map_err(|e| e.annotate(format!("ensure minimum units for application {:?}", name)))
        })
    }

    fn ensure_min_units_inner(&self) -> Result<()> {
        let store = self.st.store();
        let (app, _) = read_application(store, self.name())?;
        if !app.life.is_alive() {
            return Ok(());
        }
        let alive = units_of(store, self.name())
            .iter()
            .filter(|u| u.life.is_alive())
            .count() as u64;
        for _ in alive..app.min_units {
            self.add_unit_inner(&AddUnitParams::default(), None)?;
        }
        Ok(())
    }

    /// Record a desired scale for a CAAS application
    ///
    /// Without `force` the application must be alive and `generation` must
    /// not be older than the stored one. With `force` the generation is
    /// bumped past the stored one regardless.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for IAAS applications, `NotAlive` when the
    /// application is going away and `Forbidden` for a stale generation.
    pub fn set_scale(&self, scale: u64, generation: u64, force: bool) -> Result<()> {
        let name = self.name().to_string();
        logged_op!("set_scale", name, {
            self.st
                .run(|_| {
                    let (app, revno) = read_application(self.st.store(), &name)?;
                    let caas = app.caas.as_ref().ok_or_else(|| {
                        StateError::invalid("scale is only supported on CAAS models")
                    })?;
                    let next_generation = if force {
                        caas.scale_generation + 1
                    } else {
                        if !app.life.is_alive() {
                            return Err(StateError::not_alive(format!(
                                "application {:?}",
                                name
                            )));
                        }
                        if generation < caas.scale_generation {
                            return Err(StateError::Forbidden {
                                message: format!(
                                    "application generation {} can't be set to {}",
                                    caas.scale_generation, generation
                                ),
                            });
                        }
                        generation
                    };
                    Ok(vec![Op::update(
                        DocKey::application(&name),
                        "set scale",
                        move |doc| {
                            if let Some(caas) =
                                doc.as_application_mut().and_then(|a| a.caas.as_mut())
                            {
                                caas.desired_scale = scale;
                                caas.scale_generation = next_generation;
                            }
                        },
                    )
                    .when(Assert::Revno(revno))])
                })
                .map_err(|e| e.annotate(format!("set scale for application {:?}", name)))
        })
    }

    /// Adjust the desired scale by `delta`, returning the new scale
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for IAAS applications or a scale that would
    /// go negative and `NotAlive` when the application is going away.
    pub fn change_scale(&self, delta: i64) -> Result<u64> {
        let name = self.name().to_string();
        let mut new_scale = 0;
        logged_op!("change_scale", name, {
            self.st
                .run(|_| {
                    let (app, revno) = read_application(self.st.store(), &name)?;
                    let caas = app.caas.as_ref().ok_or_else(|| {
                        StateError::invalid("scale is only supported on CAAS models")
                    })?;
                    if !app.life.is_alive() {
                        return Err(StateError::not_alive(format!("application {:?}", name)));
                    }
                    let scale = caas
                        .desired_scale
                        .checked_add_signed(delta)
                        .ok_or_else(|| {
                            StateError::invalid(format!(
                                "cannot remove more units than currently exist, scale is {}",
                                caas.desired_scale
                            ))
                        })?;
                    new_scale = scale;
                    Ok(vec![Op::update(
                        DocKey::application(&name),
                        "change scale",
                        move |doc| {
                            if let Some(caas) =
                                doc.as_application_mut().and_then(|a| a.caas.as_mut())
                            {
                                caas.desired_scale = scale;
                                caas.scale_generation += 1;
                            }
                        },
                    )
                    .when(Assert::Revno(revno))])
                })
                .map_err(|e| e.annotate(format!("change scale for application {:?}", name)))
        })?;
        Ok(new_scale)
    }

    /// Signal that the cluster resources of a dying CAAS application are
    /// released, removing it if nothing else holds it
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for IAAS applications and `Forbidden`
    /// while the application is alive.
    pub fn clear_resources(&self) -> Result<()> {
        let name = self.name().to_string();
        logged_op!("clear_resources", name, {
            self.st
                .run(|attempt| {
                    let store = self.st.store();
                    let (app, _) = read_application(store, &name)?;
                    let caas = app.caas.as_ref().ok_or_else(|| {
                        StateError::invalid("resources are only tracked on CAAS models")
                    })?;
                    if app.life.is_alive() {
                        return Err(StateError::Forbidden {
                            message: format!("application {:?} is alive", name),
                        });
                    }
                    if caas.resources_cleared {
                        return Ok(vec![]);
                    }
                    let mut after = app.clone();
                    if let Some(caas) = after.caas.as_mut() {
                        caas.resources_cleared = true;
                    }
                    if can_remove(&after) {
                        let mut drops = SettingsDrops::default();
                        let mut ops = remove_application_ops(store, &after, &mut drops);
                        ops.insert(
                            0,
                            Op::assert(DocKey::application(&name), app_unchanged_full(&app)),
                        );
                        ops.extend(drops.into_ops(store, attempt)?);
                        return Ok(ops);
                    }
                    Ok(vec![Op::update(
                        DocKey::application(&name),
                        "resources cleared",
                        |doc| {
                            if let Some(caas) =
                                doc.as_application_mut().and_then(|a| a.caas.as_mut())
                            {
                                caas.resources_cleared = true;
                            }
                        },
                    )
                    .when(app_unchanged_full(&app))])
                })
                .map_err(|e| e.annotate(format!("clear resources of application {:?}", name)))
        })
    }

    // ===== Config and storage =====

    /// Charm defaults overlaid with the stored settings
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the application or its settings are gone.
    pub fn charm_config(&self) -> Result<Settings> {
        effective_config(self.st.store(), self.name())
    }

    /// Merge `changes` into the stored settings; `null` resets a key
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for unknown keys or mistyped values and
    /// `NotAlive` when the application is going away.
    pub fn update_charm_config(&self, changes: &Settings) -> Result<()> {
        let name = self.name().to_string();
        logged_op!("update_charm_config", name, {
            self.st
                .run(|_| {
                    let store = self.st.store();
                    let (app, _) = read_application(store, &name)?;
                    if !app.life.is_alive() {
                        return Err(StateError::not_alive(format!("application {:?}", name)));
                    }
                    let charm = read_charm(store, &app.charm_url)?;
                    let key = DocKey::settings(&name, &app.charm_url);
                    let rec = store.get(&key).ok_or_else(|| {
                        StateError::not_found(format!("settings for application {:?}", name))
                    })?;
                    let current = rec
                        .doc
                        .as_settings()
                        .map(|s| s.values.clone())
                        .unwrap_or_default();
                    let values = settings::apply_changes(&current, changes);
                    charm.config.validate(&values)?;
                    if values == current {
                        return Ok(vec![]);
                    }
                    Ok(vec![
                        Op::replace(key, SettingsDoc { values }).when(Assert::Revno(rec.revno))
                    ])
                })
                .map_err(|e| e.annotate(format!("update config of application {:?}", name)))
        })
    }

    /// # Errors
    ///
    /// Returns `NotFound` once the application has been removed.
    pub fn storage_constraints(&self) -> Result<StorageConstraintsMap> {
        read_storage_constraints(self.st.store(), self.name())
    }

    // ===== Watchers =====

    /// Notify on any change to the application document
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn watch(&self) -> NotifyWatcher {
        watcher::watch_document(&self.st, DocKey::application(self.name()))
    }

    /// Unit names whose life changed, including additions and removals
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn watch_units(&self) -> StringsWatcher {
        watcher::watch_unit_lives(&self.st, self.name())
    }

    /// Relation keys whose life changed, including additions and removals
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn watch_relations(&self) -> StringsWatcher {
        watcher::watch_relation_lives(&self.st, self.name())
    }

    /// Hash of the effective charm config, emitted when it changes
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn watch_config_settings_hash(&self) -> StringsWatcher {
        watcher::watch_config_hash(&self.st, self.name())
    }

    fn modify_alive<F>(&self, op: &'static str, context: &str, update: F) -> Result<()>
    where
        F: Fn(&mut ApplicationDoc) + Clone + Send + Sync + 'static,
    {
        let name = self.name().to_string();
        logged_op!(op, name, {
            self.st
                .run(|_| {
                    let (app, revno) = read_application(self.st.store(), &name)?;
                    if !app.life.is_alive() {
                        return Err(StateError::not_alive(format!("application {:?}", name)));
                    }
                    let update = update.clone();
                    Ok(vec![Op::update(DocKey::application(&name), op, move |doc| {
                        if let Some(app) = doc.as_application_mut() {
                            update(app);
                        }
                    })
                    .when(Assert::Revno(revno))])
                })
                .map_err(|e| e.annotate(format!("{} {:?}", context, name)))
        })
    }
}

fn is_valid_cidr(cidr: &str) -> bool {
    let Some((addr, prefix)) = cidr.split_once('/') else {
        return false;
    };
    let (Ok(addr), Ok(prefix)) = (addr.parse::<IpAddr>(), prefix.parse::<u8>()) else {
        return false;
    };
    match addr {
        IpAddr::V4(_) => prefix <= 32,
        IpAddr::V6(_) => prefix <= 128,
    }
}

/// Assert the whole application document is as read
fn app_unchanged_full(doc: &ApplicationDoc) -> Assert {
    let expected = doc.clone();
    Assert::check("application unchanged", move |d| {
        d.as_application() == Some(&expected)
    })
}

pub(crate) fn read_bindings(store: &dyn Store, application: &str) -> Result<(Bindings, u64)> {
    store
        .get(&DocKey::bindings(application))
        .and_then(|rec| rec.doc.as_bindings().map(|b| (b.bindings.clone(), rec.revno)))
        .ok_or_else(|| StateError::not_found(format!("bindings for application {:?}", application)))
}

pub(crate) fn read_storage_constraints(
    store: &dyn Store,
    application: &str,
) -> Result<StorageConstraintsMap> {
    store
        .get(&DocKey::storage_constraints(application))
        .and_then(|rec| rec.doc.as_storage_constraints().map(|s| s.constraints.clone()))
        .ok_or_else(|| {
            StateError::not_found(format!(
                "storage constraints for application {:?}",
                application
            ))
        })
}

/// Effective config of an application's current charm
pub(crate) fn effective_config(store: &dyn Store, application: &str) -> Result<Settings> {
    let (app, _) = read_application(store, application)?;
    let charm = read_charm(store, &app.charm_url)?;
    let values = settings::read_settings(store, application, &app.charm_url)?;
    Ok(settings::effective_config(&charm.config, &values))
}

/// Whether nothing holds the application any more
pub(crate) fn can_remove(doc: &ApplicationDoc) -> bool {
    doc.unit_count == 0
        && doc.relation_count == 0
        && doc.caas.as_ref().map_or(true, |c| c.resources_cleared)
}

/// Ops removing an application whose staged state is `doc`
///
/// `doc` is the state the application will be in once the preceding ops of
/// the same transaction have applied. The settings reference it holds is
/// added to `drops` so the caller can merge it with unit references.
pub(crate) fn remove_application_ops(
    store: &dyn Store,
    doc: &ApplicationDoc,
    drops: &mut SettingsDrops,
) -> Vec<Op> {
    let life = doc.life;
    let name = doc.name.clone();
    let mut ops = vec![Op::remove(DocKey::application(&name)).when(Assert::check(
        format!("{} without units or relations", life),
        move |d| {
            d.as_application().is_some_and(|a| {
                a.life == life && a.unit_count == 0 && a.relation_count == 0
            })
        },
    ))];
    drops.add(&name, &doc.charm_url);
    for key in [DocKey::bindings(&name), DocKey::storage_constraints(&name)] {
        if store.get(&key).is_some() {
            ops.push(Op::remove(key));
        }
    }
    ops.push(cleanup::queue_op(CleanupKind::ApplicationStorage {
        application: name,
    }));
    ops
}
