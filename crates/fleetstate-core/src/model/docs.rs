//! Persistent document shapes
//!
//! Every record the store holds is one variant of [`Document`]. Handles
//! (`Application`, `Unit`, `Relation`) wrap a snapshot of their document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::charm::{Base, CharmOrigin, CharmRelation, RelationRole, RelationScope, Settings, StorageKind};
use super::constraints::Constraints;
use super::Charm;
use crate::life::Life;

/// Endpoint-name to space-id map; `""` holds the application default
pub type Bindings = BTreeMap<String, String>;

/// Per-endpoint expose settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExposedEndpoint {
    pub to_spaces: Vec<String>,
    pub to_cidrs: Vec<String>,
}

/// CAAS-only application state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CaasState {
    pub desired_scale: u64,
    pub scale_generation: u64,
    pub scaling: bool,
    pub scale_target: u64,
    /// Set by the external signal that cluster resources are released
    pub resources_cleared: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationDoc {
    pub name: String,
    pub charm_url: String,
    pub charm_origin: CharmOrigin,
    pub base: Base,
    pub life: Life,
    pub subordinate: bool,
    pub unit_count: u64,
    pub relation_count: u64,
    pub min_units: u64,
    pub exposed: bool,
    pub exposed_endpoints: BTreeMap<String, ExposedEndpoint>,
    pub constraints: Constraints,
    pub charm_modified_version: u64,
    pub force_charm: bool,
    pub caas: Option<CaasState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadStatus {
    #[default]
    Waiting,
    Active,
    Maintenance,
    Blocked,
    Error,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub status: WorkloadStatus,
    pub message: String,
    pub since: DateTime<Utc>,
}

impl Default for UnitStatus {
    fn default() -> Self {
        Self {
            status: WorkloadStatus::Waiting,
            message: "waiting for agent".to_string(),
            since: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitDoc {
    pub name: String,
    pub application: String,
    pub life: Life,
    pub principal: Option<String>,
    pub subordinates: Vec<String>,
    pub machine_id: Option<String>,
    pub charm_url: Option<String>,
    pub status: UnitStatus,
    pub provider_id: Option<String>,
    pub address: Option<String>,
    pub ports: Vec<u16>,
}

/// One side of a relation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub application_name: String,
    pub relation: CharmRelation,
}

impl Endpoint {
    pub fn new(application_name: impl Into<String>, relation: CharmRelation) -> Self {
        Self {
            application_name: application_name.into(),
            relation,
        }
    }

    /// Whether the two endpoints can form a relation
    pub fn can_relate_to(&self, other: &Endpoint) -> bool {
        self.relation.interface == other.relation.interface
            && self.relation.role != RelationRole::Peer
            && self.relation.role.counterpart() == other.relation.role
            && self.application_name != other.application_name
    }

    pub fn is_container_scoped(&self) -> bool {
        self.relation.scope == RelationScope::Container
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.application_name, self.relation.name)
    }
}

/// Canonical relation key: endpoints sorted, peer relations have one
pub fn relation_key(endpoints: &[Endpoint]) -> String {
    let mut names: Vec<String> = endpoints.iter().map(ToString::to_string).collect();
    names.sort();
    names.join(" ")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationDoc {
    pub id: u64,
    pub key: String,
    pub endpoints: Vec<Endpoint>,
    pub life: Life,
    /// Units currently in scope, across all applications
    pub unit_count: u64,
    pub suspended: bool,
}

impl RelationDoc {
    pub fn endpoint_for(&self, application: &str) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|ep| ep.application_name == application)
    }

    pub fn involves(&self, application: &str) -> bool {
        self.endpoint_for(application).is_some()
    }

    pub fn is_peer(&self) -> bool {
        self.endpoints.len() == 1
    }

    /// Distinct applications taking part, in endpoint order
    pub fn applications(&self) -> Vec<&str> {
        let mut apps: Vec<&str> = Vec::new();
        for ep in &self.endpoints {
            if !apps.contains(&ep.application_name.as_str()) {
                apps.push(&ep.application_name);
            }
        }
        apps
    }
}

/// Membership of one unit in one relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDoc {
    pub relation_key: String,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SettingsDoc {
    pub values: Settings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefCountDoc {
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BindingsDoc {
    pub bindings: Bindings,
}

/// Requested storage for one store of an application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConstraints {
    pub pool: String,
    pub size_mib: u64,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StorageConstraintsDoc {
    pub constraints: BTreeMap<String, StorageConstraints>,
}

/// Storage instance, attached to a unit until that unit is removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInstanceDoc {
    pub id: String,
    pub storage_name: String,
    pub kind: StorageKind,
    pub application: String,
    pub unit: Option<String>,
    pub pool: String,
    pub size_mib: u64,
}

/// Deferred work queued by destroy operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CleanupKind {
    /// Destroy every unit of a dying application
    DyingApplicationUnits { application: String, force: bool },
    /// Destroy every relation an application takes part in
    ApplicationRelations { application: String, force: bool },
    /// Remove a unit regardless of scopes, after leaving them
    ForceDestroyedUnit { unit: String },
    /// Remove units of an application that reached Dead
    DeadUnits { application: String },
    /// Remove a charm nothing references any more
    Charm { url: String },
    /// Remove detached storage instances of an application
    ApplicationStorage { application: String },
}

impl CleanupKind {
    pub fn name(&self) -> &'static str {
        match self {
            CleanupKind::DyingApplicationUnits { .. } => "dying-application-units",
            CleanupKind::ApplicationRelations { .. } => "application-relations",
            CleanupKind::ForceDestroyedUnit { .. } => "force-destroyed-unit",
            CleanupKind::DeadUnits { .. } => "dead-units",
            CleanupKind::Charm { .. } => "charm",
            CleanupKind::ApplicationStorage { .. } => "application-storage",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupDoc {
    pub id: String,
    pub kind: CleanupKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferDoc {
    pub name: String,
    pub application: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharmDoc {
    pub charm: Charm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceDoc {
    /// Next value to hand out
    pub counter: u64,
}

/// Collections the store is partitioned into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Collection {
    Applications,
    Units,
    Relations,
    RelationScopes,
    Settings,
    RefCounts,
    Bindings,
    StorageConstraints,
    StorageInstances,
    Cleanups,
    Offers,
    Charms,
    Sequences,
}

/// Address of one document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocKey {
    pub collection: Collection,
    pub id: String,
}

impl DocKey {
    pub fn new(collection: Collection, id: impl Into<String>) -> Self {
        Self {
            collection,
            id: id.into(),
        }
    }

    pub fn application(name: &str) -> Self {
        Self::new(Collection::Applications, name)
    }

    pub fn unit(name: &str) -> Self {
        Self::new(Collection::Units, name)
    }

    pub fn relation(key: &str) -> Self {
        Self::new(Collection::Relations, key)
    }

    pub fn scope(relation_key: &str, unit: &str) -> Self {
        Self::new(
            Collection::RelationScopes,
            format!("{}#{}", relation_key, unit),
        )
    }

    pub fn settings(application: &str, charm_url: &str) -> Self {
        Self::new(
            Collection::Settings,
            format!("a#{}#{}", application, charm_url),
        )
    }

    pub fn bindings(application: &str) -> Self {
        Self::new(Collection::Bindings, application)
    }

    pub fn storage_constraints(application: &str) -> Self {
        Self::new(Collection::StorageConstraints, application)
    }

    pub fn charm(url: &str) -> Self {
        Self::new(Collection::Charms, url)
    }

    pub fn offer(name: &str) -> Self {
        Self::new(Collection::Offers, name)
    }

    pub fn sequence(name: &str) -> Self {
        Self::new(Collection::Sequences, name)
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.collection, self.id)
    }
}

macro_rules! documents {
    ($($variant:ident($doc:ty) => $as_ref:ident, $as_mut:ident;)*) => {
        /// Any record held by the store
        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        pub enum Document {
            $($variant($doc),)*
        }

        impl Document {
            $(
                pub fn $as_ref(&self) -> Option<&$doc> {
                    match self {
                        Document::$variant(doc) => Some(doc),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }

                pub fn $as_mut(&mut self) -> Option<&mut $doc> {
                    match self {
                        Document::$variant(doc) => Some(doc),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }
            )*
        }

        $(
            impl From<$doc> for Document {
                fn from(doc: $doc) -> Self {
                    Document::$variant(doc)
                }
            }
        )*
    };
}

documents! {
    Application(ApplicationDoc) => as_application, as_application_mut;
    Unit(UnitDoc) => as_unit, as_unit_mut;
    Relation(RelationDoc) => as_relation, as_relation_mut;
    Scope(ScopeDoc) => as_scope, as_scope_mut;
    Settings(SettingsDoc) => as_settings, as_settings_mut;
    RefCount(RefCountDoc) => as_refcount, as_refcount_mut;
    Bindings(BindingsDoc) => as_bindings, as_bindings_mut;
    StorageConstraints(StorageConstraintsDoc) => as_storage_constraints, as_storage_constraints_mut;
    StorageInstance(StorageInstanceDoc) => as_storage_instance, as_storage_instance_mut;
    Cleanup(CleanupDoc) => as_cleanup, as_cleanup_mut;
    Offer(OfferDoc) => as_offer, as_offer_mut;
    Charm(CharmDoc) => as_charm, as_charm_mut;
    Sequence(SequenceDoc) => as_sequence, as_sequence_mut;
}

impl Document {
    /// Life of lifecycle-bearing documents
    pub fn life(&self) -> Option<Life> {
        match self {
            Document::Application(doc) => Some(doc.life),
            Document::Unit(doc) => Some(doc.life),
            Document::Relation(doc) => Some(doc.life),
            _ => None,
        }
    }
}
