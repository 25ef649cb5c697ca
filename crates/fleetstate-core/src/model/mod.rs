pub mod charm;
pub mod constraints;
pub mod docs;

pub use charm::{
    Base, Charm, CharmMeta, CharmOrigin, CharmRelation, CharmSource, ConfigOption, ConfigSchema,
    LxdProfile, OptionType, Platform, RelationRole, RelationScope, Settings, StorageKind,
    StorageMeta,
};
pub use constraints::Constraints;
pub use docs::{
    relation_key, ApplicationDoc, Bindings, BindingsDoc, CaasState, CharmDoc, CleanupDoc,
    CleanupKind, Collection, DocKey, Document, Endpoint, ExposedEndpoint, OfferDoc, RefCountDoc,
    RelationDoc, ScopeDoc, SequenceDoc, SettingsDoc, StorageConstraints, StorageConstraintsDoc,
    StorageInstanceDoc, UnitDoc, UnitStatus, WorkloadStatus,
};
