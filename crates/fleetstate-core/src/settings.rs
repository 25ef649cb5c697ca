//! Charm settings documents and their reference counts
//!
//! Each application keeps one settings document per charm URL in use by it
//! or any of its units. The document is reference counted: the application
//! holds one reference on its current charm and each unit holds one on the
//! charm it runs. A second counter tracks how many settings documents use a
//! charm at all; when that reaches zero the charm is queued for removal.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::cleanup;
use crate::errors::{Result, StateError};
use crate::model::{CleanupKind, ConfigSchema, DocKey, Settings, SettingsDoc};
use crate::refcount;
use crate::txn::{Op, Store};

/// Refcount owner counting settings documents per charm
pub const CHARM_USAGE_OWNER: &str = "charm";

pub fn settings_ref_key(charm_url: &str) -> String {
    format!("settings/{}", charm_url)
}

/// References an application and its units hold on `charm_url`
pub fn settings_refcount(store: &dyn Store, application: &str, charm_url: &str) -> u64 {
    refcount::read_or_zero(store, application, &settings_ref_key(charm_url))
}

/// Settings documents using `charm_url`, across all applications
pub fn charm_usage(store: &dyn Store, charm_url: &str) -> u64 {
    refcount::read_or_zero(store, CHARM_USAGE_OWNER, charm_url)
}

/// Ops taking one reference on the settings of `(application, charm_url)`
///
/// The first reference creates the document. When `values` is given the
/// document content is set to it, whether new or existing.
pub fn add_ref_ops(
    store: &dyn Store,
    application: &str,
    charm_url: &str,
    values: Option<&Settings>,
) -> Vec<Op> {
    let ref_key = settings_ref_key(charm_url);
    let doc_key = DocKey::settings(application, charm_url);
    let mut ops = vec![refcount::increment_op(store, application, &ref_key)];

    if refcount::read(store, application, &ref_key).is_err() {
        ops.push(Op::insert(
            doc_key,
            SettingsDoc {
                values: values.cloned().unwrap_or_default(),
            },
        ));
        ops.push(refcount::increment_op(store, CHARM_USAGE_OWNER, charm_url));
    } else if let Some(values) = values {
        ops.push(Op::replace(
            doc_key,
            SettingsDoc {
                values: values.clone(),
            },
        ));
    }
    ops
}

/// Ops dropping one reference on the settings of `(application, charm_url)`
///
/// # Errors
///
/// Propagates `NotFound` or `ReferenceRace` from the refcount decrement.
pub fn drop_ref_ops(
    store: &dyn Store,
    application: &str,
    charm_url: &str,
    attempt: u32,
) -> Result<Vec<Op>> {
    let mut drops = SettingsDrops::default();
    drops.add(application, charm_url);
    drops.into_ops(store, attempt)
}

/// Settings references released together in one transaction
///
/// Releases of the same counter are merged into one decrement. The last
/// reference of a settings document removes it and drops its charm usage;
/// the last usage of a charm queues a charm cleanup.
#[derive(Debug, Default)]
pub struct SettingsDrops {
    refs: BTreeMap<(String, String), u64>,
}

impl SettingsDrops {
    pub fn add(&mut self, application: &str, charm_url: &str) {
        *self
            .refs
            .entry((application.to_string(), charm_url.to_string()))
            .or_insert(0) += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// # Errors
    ///
    /// Propagates `NotFound` or `ReferenceRace` from the refcount decrements.
    pub fn into_ops(self, store: &dyn Store, attempt: u32) -> Result<Vec<Op>> {
        let mut ops = Vec::new();
        let mut unused: BTreeMap<String, u64> = BTreeMap::new();
        for ((application, charm_url), n) in self.refs {
            let (op, last) = refcount::decrement_by_op(
                store,
                &application,
                &settings_ref_key(&charm_url),
                n,
                attempt,
            )?;
            ops.push(op);
            if last {
                ops.push(Op::remove(DocKey::settings(&application, &charm_url)));
                *unused.entry(charm_url).or_insert(0) += 1;
            }
        }
        for (charm_url, n) in unused {
            let (op, last) =
                refcount::decrement_by_op(store, CHARM_USAGE_OWNER, &charm_url, n, attempt)?;
            ops.push(op);
            if last {
                ops.push(cleanup::queue_op(CleanupKind::Charm { url: charm_url }));
            }
        }
        Ok(ops)
    }
}

/// Stored values of `(application, charm_url)`
///
/// # Errors
///
/// Returns `NotFound` when no settings document exists.
pub fn read_settings(store: &dyn Store, application: &str, charm_url: &str) -> Result<Settings> {
    read_settings_record(store, application, charm_url).map(|(values, _)| values)
}

/// Stored values of `(application, charm_url)` with the revno they were read at
///
/// # Errors
///
/// Returns `NotFound` when no settings document exists.
pub fn read_settings_record(
    store: &dyn Store,
    application: &str,
    charm_url: &str,
) -> Result<(Settings, u64)> {
    store
        .get(&DocKey::settings(application, charm_url))
        .and_then(|rec| {
            rec.doc
                .as_settings()
                .map(|s| (s.values.clone(), rec.revno))
        })
        .ok_or_else(|| {
            StateError::not_found(format!(
                "settings for application {:?} charm {:?}",
                application, charm_url
            ))
        })
}

/// Merge `changes` into `base`; a `null` change removes the key
pub fn apply_changes(base: &Settings, changes: &Settings) -> Settings {
    let mut merged = base.clone();
    for (key, value) in changes {
        if value.is_null() {
            merged.remove(key);
        } else {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Keep only keys the schema still declares
pub fn filter_to_schema(values: &Settings, schema: &ConfigSchema) -> Settings {
    values
        .iter()
        .filter(|(key, _)| schema.options.contains_key(*key))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Schema defaults overlaid with stored values
pub fn effective_config(schema: &ConfigSchema, values: &Settings) -> Settings {
    let mut config = schema.defaults();
    config.extend(values.iter().map(|(k, v)| (k.clone(), v.clone())));
    config
}

/// Hex SHA-256 of the canonical JSON encoding
///
/// # Errors
///
/// Returns `Serialization` if a value cannot be encoded.
pub fn config_hash(config: &Settings) -> Result<String> {
    let encoded = serde_json::to_vec(config)?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}
