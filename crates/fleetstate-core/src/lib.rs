//! fleetstate core - consistency layer for fleet orchestration state
//!
//! Tracks applications, their units, the relations between them, and the
//! charm, config, storage and network bindings each application carries,
//! while many callers mutate that state concurrently. There is no global
//! lock: every write is an optimistic transaction over a [`txn::Store`],
//! asserting what it read and rebuilt on conflict.
//!
//! Main entry points:
//! - [`State`]: model-wide operations (add applications, relations, offers,
//!   run cleanups)
//! - [`Application`]: charm upgrades, destroy, units, bindings, scaling,
//!   config and watchers
//! - [`Unit`] and [`Relation`]: per-entity lifecycle

pub use fleetstate_core_types as core_types;

pub mod application;
pub mod bindings;
pub mod catalog;
pub mod cleanup;
pub mod config;
pub mod destroy;
pub mod errors;
pub mod life;
pub mod logging_facility;
pub mod model;
pub mod refcount;
pub mod relation;
pub mod settings;
pub mod state;
pub mod storage;
pub mod txn;
pub mod unit;
pub mod upgrade;
pub mod watcher;

// Re-export commonly used types
pub use application::{AddUnitParams, Application};
pub use catalog::{ResourceReleaser, SpaceCatalog, StoragePoolRegistry};
pub use config::{ModelType, StateConfig};
pub use destroy::DestroyApplicationOperation;
pub use errors::{ExError, ExErrorKind, Result, StateError};
pub use life::Life;
pub use relation::Relation;
pub use state::{AddApplicationArgs, State};
pub use txn::{MemoryStore, Store};
pub use unit::Unit;
pub use upgrade::SetCharmConfig;
pub use watcher::{NotifyWatcher, StringsWatcher, Watcher};
