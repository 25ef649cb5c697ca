//! Model-wide entry point
//!
//! [`State`] owns the store handle, configuration and external catalogs.
//! It is cheap to clone; entity handles carry a clone.

use std::sync::Arc;

use crate::application::{Application, OFFERS_REF_KEY};
use crate::bindings::resolve_bindings;
use crate::catalog::{SpaceCatalog, StoragePoolRegistry};
use crate::config::StateConfig;
use crate::core_types::is_valid_application_name;
use crate::errors::{Result, StateError};
use crate::life::Life;
use crate::logged_op;
use crate::model::{
    relation_key, ApplicationDoc, Base, BindingsDoc, Bindings, CaasState, Charm, CharmDoc,
    CharmOrigin, CharmRelation, Collection, Constraints, DocKey, Document, Endpoint, OfferDoc,
    RelationDoc, RelationScope, ScopeDoc, SequenceDoc, Settings,
    StorageConstraintsDoc, UnitDoc,
};
use crate::refcount;
use crate::relation::Relation;
use crate::settings;
use crate::storage::{default_constraints, StorageConstraintsMap};
use crate::txn::{self, Assert, Op, Store};
use crate::unit::Unit;

/// Sequence numbering relations model-wide
pub(crate) const RELATION_SEQUENCE: &str = "relation";

/// Arguments for [`State::add_application`]
#[derive(Debug, Clone)]
pub struct AddApplicationArgs {
    pub name: String,
    pub charm: Charm,
    pub origin: CharmOrigin,
    /// Defaults to the first base the charm supports
    pub base: Option<Base>,
    pub constraints: Constraints,
    pub bindings: Bindings,
    pub storage: StorageConstraintsMap,
    pub settings: Settings,
}

impl AddApplicationArgs {
    pub fn new(name: impl Into<String>, charm: Charm) -> Self {
        Self {
            name: name.into(),
            charm,
            origin: CharmOrigin::default(),
            base: None,
            constraints: Constraints::default(),
            bindings: Bindings::new(),
            storage: StorageConstraintsMap::new(),
            settings: Settings::new(),
        }
    }
}

#[derive(Clone)]
pub struct State {
    store: Arc<dyn Store>,
    config: Arc<StateConfig>,
    spaces: Arc<dyn SpaceCatalog>,
    pools: Arc<dyn StoragePoolRegistry>,
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("config", &self.config)
            .field("revno", &self.store.revno())
            .finish()
    }
}

impl State {
    /// # Errors
    ///
    /// Returns `InvalidArgument` when `config` does not validate.
    pub fn new(
        store: Arc<dyn Store>,
        config: StateConfig,
        spaces: Arc<dyn SpaceCatalog>,
        pools: Arc<dyn StoragePoolRegistry>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config: Arc::new(config),
            spaces,
            pools,
        })
    }

    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub(crate) fn shared_store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub(crate) fn spaces(&self) -> &dyn SpaceCatalog {
        self.spaces.as_ref()
    }

    pub(crate) fn pools(&self) -> &dyn StoragePoolRegistry {
        self.pools.as_ref()
    }

    /// Run a transaction with the configured attempt bound
    pub(crate) fn run<F>(&self, build: F) -> Result<()>
    where
        F: FnMut(u32) -> Result<Vec<Op>>,
    {
        txn::run(self.store(), self.config.max_txn_attempts, build)
    }

    /// Register a charm so applications can use it
    ///
    /// Registering the same charm twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for invalid metadata and `AlreadyExists`
    /// when a different charm is registered under the same URL.
    pub fn add_charm(&self, charm: Charm) -> Result<()> {
        let url = charm.url.clone();
        logged_op!("add_charm", url, {
            self.add_charm_inner(&charm)
                .map_err(|e| e.annotate(format!("add charm {:?}", url)))
        })
    }

    fn add_charm_inner(&self, charm: &Charm) -> Result<()> {
        charm.meta.validate()?;
        self.run(|_| match read_charm(self.store(), &charm.url) {
            Ok(existing) if existing == *charm => Ok(vec![]),
            Ok(_) => Err(StateError::AlreadyExists {
                entity: format!("charm {:?}", charm.url),
            }),
            Err(e) if e.is_not_found() => Ok(vec![Op::insert(
                DocKey::charm(&charm.url),
                CharmDoc {
                    charm: charm.clone(),
                },
            )]),
            Err(e) => Err(e),
        })
    }

    /// # Errors
    ///
    /// Returns `NotFound` for unregistered URLs.
    pub fn charm(&self, url: &str) -> Result<Charm> {
        read_charm(self.store(), url)
    }

    /// Deploy a new application
    ///
    /// Creates the application with its settings, bindings and storage
    /// constraints, plus one relation per peer endpoint of the charm.
    ///
    /// # Errors
    ///
    /// Validation errors for the name, charm, base, constraints, bindings,
    /// storage or settings; `AlreadyExists` when the name is taken;
    /// `NotFound` when the charm is not registered.
    pub fn add_application(&self, args: AddApplicationArgs) -> Result<Application> {
        let name = args.name.clone();
        logged_op!("add_application", name, {
            self.add_application_inner(&args)
                .map_err(|e| e.annotate(format!("add application {:?}", name)))
        })
    }

    fn add_application_inner(&self, args: &AddApplicationArgs) -> Result<Application> {
        let name = args.name.as_str();
        let charm = &args.charm;
        let meta = &charm.meta;

        if !is_valid_application_name(name) {
            return Err(StateError::invalid(format!(
                "invalid application name {:?}",
                name
            )));
        }
        meta.validate()?;
        let base = match &args.base {
            Some(base) => base.clone(),
            None => meta
                .bases
                .first()
                .cloned()
                .ok_or_else(|| StateError::invalid("charm declares no bases"))?,
        };
        if !meta.supports_base(&base) {
            return Err(unsupported_base(&base, meta.bases.as_slice()));
        }
        if let Some(profile) = &meta.lxd_profile {
            profile.validate()?;
        }
        args.constraints.validate()?;
        charm.config.validate(&args.settings)?;
        let values = settings::apply_changes(&Settings::new(), &args.settings);
        let bindings = resolve_bindings(
            &meta.binding_endpoints(),
            &args.bindings,
            None,
            &self.config.default_space,
            self.spaces(),
        )?;
        let storage = default_constraints(meta, &args.storage, None, self.pools())?;
        let caas = self.config.is_caas().then(CaasState::default);
        let peers: Vec<CharmRelation> = meta.peers.values().cloned().collect();

        self.run(|_| {
            let store = self.store();
            if store.get(&DocKey::application(name)).is_some() {
                return Err(StateError::AlreadyExists {
                    entity: format!("application {:?}", name),
                });
            }
            if store.get(&DocKey::charm(&charm.url)).is_none() {
                return Err(StateError::not_found(format!("charm {:?}", charm.url)));
            }

            let mut ops = vec![Op::assert(DocKey::charm(&charm.url), Assert::Exists)];
            let mut peer_docs = Vec::new();
            if !peers.is_empty() {
                let (first, seq_op) = sequence_op(store, RELATION_SEQUENCE, peers.len() as u64);
                ops.push(seq_op);
                peer_docs = peer_relation_docs(name, &peers, first);
            }

            ops.push(Op::insert(
                DocKey::application(name),
                ApplicationDoc {
                    name: name.to_string(),
                    charm_url: charm.url.clone(),
                    charm_origin: args.origin.clone(),
                    base: base.clone(),
                    life: Life::Alive,
                    subordinate: meta.subordinate,
                    unit_count: 0,
                    relation_count: peer_docs.len() as u64,
                    min_units: 0,
                    exposed: false,
                    exposed_endpoints: Default::default(),
                    constraints: args.constraints.clone(),
                    charm_modified_version: 0,
                    force_charm: false,
                    caas: caas.clone(),
                },
            ));
            ops.extend(settings::add_ref_ops(store, name, &charm.url, Some(&values)));
            ops.push(Op::insert(
                DocKey::bindings(name),
                BindingsDoc {
                    bindings: bindings.clone(),
                },
            ));
            ops.push(Op::insert(
                DocKey::storage_constraints(name),
                StorageConstraintsDoc {
                    constraints: storage.clone(),
                },
            ));
            for rel in &peer_docs {
                ops.push(Op::insert(DocKey::relation(&rel.key), rel.clone()));
            }
            Ok(ops)
        })?;
        self.application(name)
    }

    /// # Errors
    ///
    /// Returns `NotFound` when no such application exists.
    pub fn application(&self, name: &str) -> Result<Application> {
        let (doc, _) = read_application(self.store(), name)?;
        Ok(Application::new(self.clone(), doc))
    }

    pub fn all_applications(&self) -> Vec<Application> {
        self.store()
            .scan(Collection::Applications)
            .into_iter()
            .filter_map(|(_, rec)| rec.doc.as_application().cloned())
            .map(|doc| Application::new(self.clone(), doc))
            .collect()
    }

    /// # Errors
    ///
    /// Returns `NotFound` when no such unit exists.
    pub fn unit(&self, name: &str) -> Result<Unit> {
        let (doc, _) = read_unit(self.store(), name)?;
        Ok(Unit::new(self.clone(), doc))
    }

    /// # Errors
    ///
    /// Returns `NotFound` when no relation has this key.
    pub fn relation(&self, key: &str) -> Result<Relation> {
        let (doc, _) = read_relation(self.store(), key)?;
        Ok(Relation::new(self.clone(), doc))
    }

    /// # Errors
    ///
    /// Returns `NotFound` when no relation has this id.
    pub fn relation_by_id(&self, id: u64) -> Result<Relation> {
        self.store()
            .scan(Collection::Relations)
            .into_iter()
            .filter_map(|(_, rec)| rec.doc.as_relation().cloned())
            .find(|rel| rel.id == id)
            .map(|doc| Relation::new(self.clone(), doc))
            .ok_or_else(|| StateError::not_found(format!("relation {}", id)))
    }

    /// Endpoint `name` of application `application`'s current charm
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when the application or endpoint does not exist.
    pub fn endpoint(&self, application: &str, name: &str) -> Result<Endpoint> {
        let (app, _) = read_application(self.store(), application)?;
        let charm = read_charm(self.store(), &app.charm_url)?;
        charm
            .meta
            .relation(name)
            .map(|rel| Endpoint::new(application, rel.clone()))
            .ok_or_else(|| StateError::not_found(format!("endpoint \"{}:{}\"", application, name)))
    }

    /// Relate two endpoints of different applications
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for incompatible endpoints, `AlreadyExists`
    /// for a duplicate, `NotAlive` when either application is going away and
    /// `QuotaLimitExceeded` when an endpoint is at its relation limit.
    pub fn add_relation(&self, ep1: &Endpoint, ep2: &Endpoint) -> Result<Relation> {
        let mut endpoints = vec![ep1.clone(), ep2.clone()];
        let key = relation_key(&endpoints);
        logged_op!("add_relation", key, {
            self.add_relation_inner(&mut endpoints, &key)
                .map_err(|e| e.annotate(format!("add relation {:?}", key)))
        })
    }

    fn add_relation_inner(&self, endpoints: &mut [Endpoint], key: &str) -> Result<Relation> {
        if !endpoints[0].can_relate_to(&endpoints[1]) {
            return Err(StateError::invalid(format!(
                "endpoints \"{}\" and \"{}\" cannot be related",
                endpoints[0], endpoints[1]
            )));
        }
        let container = endpoints.iter().any(Endpoint::is_container_scoped);
        if container {
            for ep in endpoints.iter_mut() {
                ep.relation.scope = RelationScope::Container;
            }
        }

        self.run(|_| {
            let store = self.store();
            if store.get(&DocKey::relation(key)).is_some() {
                return Err(StateError::AlreadyExists {
                    entity: format!("relation {:?}", key),
                });
            }
            let mut ops = Vec::new();
            let mut any_subordinate = false;
            for ep in endpoints.iter() {
                let (app, _) = read_application(store, &ep.application_name)?;
                if !app.life.is_alive() {
                    return Err(StateError::not_alive(format!(
                        "application {:?}",
                        app.name
                    )));
                }
                let charm = read_charm(store, &app.charm_url)?;
                let declared = charm.meta.relation(&ep.relation.name).ok_or_else(|| {
                    StateError::not_found(format!("endpoint \"{}\"", ep))
                })?;
                if declared.role != ep.relation.role || declared.interface != ep.relation.interface
                {
                    return Err(StateError::invalid(format!(
                        "endpoint \"{}\" does not match the application's charm",
                        ep
                    )));
                }
                any_subordinate |= app.subordinate;

                if declared.limit > 0 {
                    let established = relations_of(store, &app.name)
                        .iter()
                        .filter(|rel| {
                            rel.endpoint_for(&app.name)
                                .is_some_and(|e| e.relation.name == declared.name)
                        })
                        .count() as u64;
                    if established >= u64::from(declared.limit) {
                        return Err(StateError::QuotaLimitExceeded {
                            message: format!(
                                "establishing a new relation for \"{}\" would exceed its maximum relation limit of {}",
                                ep, declared.limit
                            ),
                        });
                    }
                }

                let expected_url = app.charm_url.clone();
                ops.push(
                    Op::update(DocKey::application(&app.name), "relation_count += 1", |doc| {
                        if let Some(app) = doc.as_application_mut() {
                            app.relation_count += 1;
                        }
                    })
                    .when(Assert::check("alive on same charm", move |doc| {
                        doc.as_application()
                            .is_some_and(|a| a.life.is_alive() && a.charm_url == expected_url)
                    })),
                );
            }
            if container && !any_subordinate {
                return Err(StateError::invalid(
                    "container-scoped relations require a subordinate application",
                ));
            }

            let (id, seq_op) = sequence_op(store, RELATION_SEQUENCE, 1);
            ops.push(seq_op);
            ops.push(Op::insert(
                DocKey::relation(key),
                RelationDoc {
                    id,
                    key: key.to_string(),
                    endpoints: endpoints.to_vec(),
                    life: Life::Alive,
                    unit_count: 0,
                    suspended: false,
                },
            ));
            Ok(ops)
        })?;
        self.relation(key)
    }

    /// Offer an application to other models
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` for a taken offer name and `NotFound` or
    /// `NotAlive` when the application cannot be offered.
    pub fn add_offer(&self, name: &str, application: &str) -> Result<()> {
        logged_op!("add_offer", name, {
            self.run(|_| {
                let store = self.store();
                if store.get(&DocKey::offer(name)).is_some() {
                    return Err(StateError::AlreadyExists {
                        entity: format!("offer {:?}", name),
                    });
                }
                let (app, _) = read_application(store, application)?;
                if !app.life.is_alive() {
                    return Err(StateError::not_alive(format!("application {:?}", application)));
                }
                Ok(vec![
                    Op::assert(DocKey::application(application), assert_alive()),
                    Op::insert(
                        DocKey::offer(name),
                        OfferDoc {
                            name: name.to_string(),
                            application: application.to_string(),
                        },
                    ),
                    refcount::increment_op(store, application, OFFERS_REF_KEY),
                ])
            })
            .map_err(|e| e.annotate(format!("add offer {:?}", name)))
        })
    }

    /// # Errors
    ///
    /// Returns `NotFound` for unknown offers.
    pub fn remove_offer(&self, name: &str) -> Result<()> {
        logged_op!("remove_offer", name, {
            self.run(|attempt| {
                let store = self.store();
                let offer = store
                    .get(&DocKey::offer(name))
                    .and_then(|rec| rec.doc.as_offer().cloned())
                    .ok_or_else(|| StateError::not_found(format!("offer {:?}", name)))?;
                let (dec, _) =
                    refcount::decrement_op(store, &offer.application, OFFERS_REF_KEY, attempt)?;
                Ok(vec![Op::remove(DocKey::offer(name)), dec])
            })
            .map_err(|e| e.annotate(format!("remove offer {:?}", name)))
        })
    }

    /// Offers of `application`
    pub fn offers_for(&self, application: &str) -> Vec<OfferDoc> {
        offers_of(self.store(), application)
    }
}

pub(crate) fn unsupported_base(base: &Base, supported: &[Base]) -> StateError {
    StateError::BaseUnsupported {
        base: base.to_string(),
        supported: supported
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", "),
    }
}

/// Allocate `count` consecutive values of a named sequence
///
/// Returns the first value and the op that claims the range.
pub fn sequence_op(store: &dyn Store, name: &str, count: u64) -> (u64, Op) {
    let key = DocKey::sequence(name);
    match store
        .get(&key)
        .and_then(|rec| rec.doc.as_sequence().copied())
    {
        None => (0, Op::insert(key, SequenceDoc { counter: count })),
        Some(seq) => {
            let first = seq.counter;
            let op = Op::update(key, format!("sequence += {}", count), move |doc| {
                if let Some(seq) = doc.as_sequence_mut() {
                    seq.counter += count;
                }
            })
            .when(Assert::check(format!("sequence == {}", first), move |doc| {
                doc.as_sequence().map(|s| s.counter) == Some(first)
            }));
            (first, op)
        }
    }
}

/// Op raising a sequence so it never hands out `value` or below
pub(crate) fn sequence_at_least_op(store: &dyn Store, name: &str, value: u64) -> Option<Op> {
    let key = DocKey::sequence(name);
    match store
        .get(&key)
        .and_then(|rec| rec.doc.as_sequence().copied())
    {
        None => Some(Op::insert(key, SequenceDoc { counter: value + 1 })),
        Some(seq) if seq.counter <= value => {
            let first = seq.counter;
            Some(
                Op::update(key, "sequence bump", move |doc| {
                    if let Some(seq) = doc.as_sequence_mut() {
                        seq.counter = value + 1;
                    }
                })
                .when(Assert::check(format!("sequence == {}", first), move |doc| {
                    doc.as_sequence().map(|s| s.counter) == Some(first)
                })),
            )
        }
        Some(_) => None,
    }
}

pub(crate) fn peer_relation_docs(application: &str, peers: &[CharmRelation], first_id: u64) -> Vec<RelationDoc> {
    peers
        .iter()
        .zip(first_id..)
        .map(|(peer, id)| {
            let endpoints = vec![Endpoint::new(application, peer.clone())];
            RelationDoc {
                id,
                key: relation_key(&endpoints),
                endpoints,
                life: Life::Alive,
                unit_count: 0,
                suspended: false,
            }
        })
        .collect()
}

pub(crate) fn assert_alive() -> Assert {
    Assert::check("alive", |doc: &Document| doc.life() == Some(Life::Alive))
}

/// Assert an application document still has the life and counts read
pub(crate) fn app_unchanged(doc: &ApplicationDoc) -> Assert {
    let (life, units, relations) = (doc.life, doc.unit_count, doc.relation_count);
    Assert::check(
        format!("life {} units {} relations {}", life, units, relations),
        move |d| {
            d.as_application().is_some_and(|a| {
                a.life == life && a.unit_count == units && a.relation_count == relations
            })
        },
    )
}

pub(crate) fn read_application(store: &dyn Store, name: &str) -> Result<(ApplicationDoc, u64)> {
    store
        .get(&DocKey::application(name))
        .and_then(|rec| rec.doc.as_application().cloned().map(|d| (d, rec.revno)))
        .ok_or_else(|| StateError::not_found(format!("application {:?}", name)))
}

pub(crate) fn read_unit(store: &dyn Store, name: &str) -> Result<(UnitDoc, u64)> {
    store
        .get(&DocKey::unit(name))
        .and_then(|rec| rec.doc.as_unit().cloned().map(|d| (d, rec.revno)))
        .ok_or_else(|| StateError::not_found(format!("unit {:?}", name)))
}

pub(crate) fn read_relation(store: &dyn Store, key: &str) -> Result<(RelationDoc, u64)> {
    store
        .get(&DocKey::relation(key))
        .and_then(|rec| rec.doc.as_relation().cloned().map(|d| (d, rec.revno)))
        .ok_or_else(|| StateError::not_found(format!("relation {:?}", key)))
}

pub(crate) fn read_charm(store: &dyn Store, url: &str) -> Result<Charm> {
    store
        .get(&DocKey::charm(url))
        .and_then(|rec| rec.doc.as_charm().map(|c| c.charm.clone()))
        .ok_or_else(|| StateError::not_found(format!("charm {:?}", url)))
}

pub(crate) fn units_of(store: &dyn Store, application: &str) -> Vec<UnitDoc> {
    store
        .scan(Collection::Units)
        .into_iter()
        .filter_map(|(_, rec)| rec.doc.as_unit().cloned())
        .filter(|unit| unit.application == application)
        .collect()
}

pub(crate) fn relations_of(store: &dyn Store, application: &str) -> Vec<RelationDoc> {
    store
        .scan(Collection::Relations)
        .into_iter()
        .filter_map(|(_, rec)| rec.doc.as_relation().cloned())
        .filter(|rel| rel.involves(application))
        .collect()
}

fn scopes(store: &dyn Store) -> impl Iterator<Item = ScopeDoc> {
    store
        .scan(Collection::RelationScopes)
        .into_iter()
        .filter_map(|(_, rec)| rec.doc.as_scope().cloned())
}

pub(crate) fn scopes_of_unit(store: &dyn Store, unit: &str) -> Vec<ScopeDoc> {
    scopes(store).filter(|s| s.unit == unit).collect()
}

pub(crate) fn scopes_of_relation(store: &dyn Store, relation_key: &str) -> Vec<ScopeDoc> {
    scopes(store).filter(|s| s.relation_key == relation_key).collect()
}

pub(crate) fn offers_of(store: &dyn Store, application: &str) -> Vec<OfferDoc> {
    store
        .scan(Collection::Offers)
        .into_iter()
        .filter_map(|(_, rec)| rec.doc.as_offer().cloned())
        .filter(|offer| offer.application == application)
        .collect()
}
