use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::errors::{Result, StateError};

/// Role an endpoint plays in a relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationRole {
    Provider,
    Requirer,
    Peer,
}

impl RelationRole {
    /// Role an endpoint must have to be related to this one
    pub fn counterpart(self) -> RelationRole {
        match self {
            RelationRole::Provider => RelationRole::Requirer,
            RelationRole::Requirer => RelationRole::Provider,
            RelationRole::Peer => RelationRole::Peer,
        }
    }
}

impl fmt::Display for RelationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelationRole::Provider => "provider",
            RelationRole::Requirer => "requirer",
            RelationRole::Peer => "peer",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RelationScope {
    #[default]
    Global,
    Container,
}

/// Endpoint declared by a charm
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharmRelation {
    pub name: String,
    pub role: RelationRole,
    pub interface: String,
    pub optional: bool,
    /// Maximum number of relations on this endpoint; 0 means unlimited
    pub limit: u32,
    pub scope: RelationScope,
}

impl CharmRelation {
    pub fn new(name: impl Into<String>, role: RelationRole, interface: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role,
            interface: interface.into(),
            optional: false,
            limit: 0,
            scope: RelationScope::Global,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_scope(mut self, scope: RelationScope) -> Self {
        self.scope = scope;
        self
    }
}

/// Operating system base, written `os@channel`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Base {
    pub os: String,
    pub channel: String,
}

impl Base {
    pub fn new(os: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            channel: channel.into(),
        }
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` unless `s` looks like `os@channel`.
    pub fn parse(s: &str) -> Result<Self> {
        match s.split_once('@') {
            Some((os, channel)) if !os.is_empty() && !channel.is_empty() => {
                Ok(Self::new(os, channel))
            }
            _ => Err(StateError::invalid(format!("invalid base {:?}", s))),
        }
    }
}

impl fmt::Display for Base {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.os, self.channel)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Block,
    Filesystem,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Block => f.write_str("block"),
            StorageKind::Filesystem => f.write_str("filesystem"),
        }
    }
}

/// Storage declared by a charm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageMeta {
    pub name: String,
    pub kind: StorageKind,
    pub shared: bool,
    pub read_only: bool,
    pub location: Option<String>,
    pub count_min: u64,
    /// `None` means unbounded
    pub count_max: Option<u64>,
    pub minimum_size_mib: u64,
}

impl StorageMeta {
    pub fn new(name: impl Into<String>, kind: StorageKind) -> Self {
        Self {
            name: name.into(),
            kind,
            shared: false,
            read_only: false,
            location: None,
            count_min: 1,
            count_max: Some(1),
            minimum_size_mib: 0,
        }
    }

    pub fn with_range(mut self, min: u64, max: Option<u64>) -> Self {
        self.count_min = min;
        self.count_max = max;
        self
    }

    pub fn is_required(&self) -> bool {
        self.count_min > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    String,
    Int,
    Float,
    Boolean,
}

impl OptionType {
    fn accepts(self, value: &serde_json::Value) -> bool {
        match self {
            OptionType::String => value.is_string(),
            OptionType::Int => value.is_i64() || value.is_u64(),
            OptionType::Float => value.is_number(),
            OptionType::Boolean => value.is_boolean(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigOption {
    pub kind: OptionType,
    pub default: Option<serde_json::Value>,
    pub description: String,
}

/// Config values; a `null` value unsets the key
pub type Settings = BTreeMap<String, serde_json::Value>;

/// Config schema declared by a charm
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConfigSchema {
    pub options: BTreeMap<String, ConfigOption>,
}

impl ConfigSchema {
    pub fn with_option(
        mut self,
        name: impl Into<String>,
        kind: OptionType,
        default: Option<serde_json::Value>,
    ) -> Self {
        self.options.insert(
            name.into(),
            ConfigOption {
                kind,
                default,
                description: String::new(),
            },
        );
        self
    }

    /// Check that every key is declared and every non-null value has the
    /// declared type
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending key.
    pub fn validate(&self, settings: &Settings) -> Result<()> {
        for (key, value) in settings {
            let option = self.options.get(key).ok_or_else(|| StateError::InvalidConfig {
                message: format!("unknown option {:?}", key),
            })?;
            if !value.is_null() && !option.kind.accepts(value) {
                return Err(StateError::InvalidConfig {
                    message: format!(
                        "option {:?} expected {:?}, got {}",
                        key, option.kind, value
                    ),
                });
            }
        }
        Ok(())
    }

    /// Declared defaults, skipping options without one
    pub fn defaults(&self) -> Settings {
        self.options
            .iter()
            .filter_map(|(k, o)| o.default.clone().map(|d| (k.clone(), d)))
            .collect()
    }
}

/// LXD profile shipped with a charm
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LxdProfile {
    pub config: BTreeMap<String, String>,
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
}

const FORBIDDEN_PROFILE_PREFIXES: [&str; 3] = ["boot", "limits", "migration"];

impl LxdProfile {
    /// # Errors
    ///
    /// Returns `InvalidArgument` for config keys outside the allowed set or
    /// devices of the `unix-disk` type.
    pub fn validate(&self) -> Result<()> {
        for key in self.config.keys() {
            let prefix = key.split('.').next().unwrap_or_default();
            if FORBIDDEN_PROFILE_PREFIXES.contains(&prefix) {
                return Err(StateError::invalid(format!(
                    "invalid lxd-profile: contains config value {:?}",
                    key
                )));
            }
        }
        for (name, device) in &self.devices {
            if device.get("type").map(String::as_str) == Some("unix-disk") {
                return Err(StateError::invalid(format!(
                    "invalid lxd-profile: contains device {:?} of type \"unix-disk\"",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Charm metadata, as extracted by the external charm parser
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharmMeta {
    pub name: String,
    pub subordinate: bool,
    pub provides: BTreeMap<String, CharmRelation>,
    pub requires: BTreeMap<String, CharmRelation>,
    pub peers: BTreeMap<String, CharmRelation>,
    pub extra_bindings: BTreeSet<String>,
    pub storage: BTreeMap<String, StorageMeta>,
    pub bases: Vec<Base>,
    pub lxd_profile: Option<LxdProfile>,
}

impl CharmMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subordinate: false,
            provides: BTreeMap::new(),
            requires: BTreeMap::new(),
            peers: BTreeMap::new(),
            extra_bindings: BTreeSet::new(),
            storage: BTreeMap::new(),
            bases: vec![Base::new("ubuntu", "22.04")],
            lxd_profile: None,
        }
    }

    pub fn subordinate(mut self) -> Self {
        self.subordinate = true;
        self
    }

    pub fn provides(mut self, name: &str, interface: &str) -> Self {
        self.provides.insert(
            name.to_string(),
            CharmRelation::new(name, RelationRole::Provider, interface),
        );
        self
    }

    pub fn requires(mut self, name: &str, interface: &str) -> Self {
        self.requires.insert(
            name.to_string(),
            CharmRelation::new(name, RelationRole::Requirer, interface),
        );
        self
    }

    pub fn peer(mut self, name: &str, interface: &str) -> Self {
        self.peers.insert(
            name.to_string(),
            CharmRelation::new(name, RelationRole::Peer, interface),
        );
        self
    }

    /// Add or replace an endpoint, filed under its role
    pub fn with_relation(mut self, relation: CharmRelation) -> Self {
        let map = match relation.role {
            RelationRole::Provider => &mut self.provides,
            RelationRole::Requirer => &mut self.requires,
            RelationRole::Peer => &mut self.peers,
        };
        map.insert(relation.name.clone(), relation);
        self
    }

    pub fn with_storage(mut self, storage: StorageMeta) -> Self {
        self.storage.insert(storage.name.clone(), storage);
        self
    }

    pub fn with_bases(mut self, bases: Vec<Base>) -> Self {
        self.bases = bases;
        self
    }

    /// All declared relation endpoints
    pub fn relations(&self) -> impl Iterator<Item = &CharmRelation> {
        self.provides
            .values()
            .chain(self.requires.values())
            .chain(self.peers.values())
    }

    pub fn relation(&self, name: &str) -> Option<&CharmRelation> {
        self.relations().find(|r| r.name == name)
    }

    /// Names that can carry a space binding (relations plus extra bindings)
    pub fn binding_endpoints(&self) -> BTreeSet<String> {
        self.relations()
            .map(|r| r.name.clone())
            .chain(self.extra_bindings.iter().cloned())
            .collect()
    }

    pub fn supports_base(&self, base: &Base) -> bool {
        self.bases.iter().any(|b| b == base)
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` for duplicate endpoint names or endpoints
    /// filed under the wrong role.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for (role, map) in [
            (RelationRole::Provider, &self.provides),
            (RelationRole::Requirer, &self.requires),
            (RelationRole::Peer, &self.peers),
        ] {
            for (name, relation) in map {
                if relation.name != *name || relation.role != role {
                    return Err(StateError::invalid(format!(
                        "charm {:?} endpoint {:?} declared inconsistently",
                        self.name, name
                    )));
                }
                if !seen.insert(name.as_str()) {
                    return Err(StateError::invalid(format!(
                        "charm {:?} declares endpoint {:?} more than once",
                        self.name, name
                    )));
                }
            }
        }
        for name in &self.extra_bindings {
            if seen.contains(name.as_str()) {
                return Err(StateError::invalid(format!(
                    "charm {:?} extra binding {:?} clashes with a relation",
                    self.name, name
                )));
            }
        }
        if self.subordinate
            && !self
                .requires
                .values()
                .any(|r| r.scope == RelationScope::Container)
        {
            return Err(StateError::invalid(format!(
                "subordinate charm {:?} lacks a container-scoped requirer",
                self.name
            )));
        }
        Ok(())
    }
}

/// Opaque charm artifact: URL plus the metadata the core needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Charm {
    pub url: String,
    pub meta: CharmMeta,
    pub config: ConfigSchema,
}

impl Charm {
    pub fn new(url: impl Into<String>, meta: CharmMeta) -> Self {
        Self {
            url: url.into(),
            meta,
            config: ConfigSchema::default(),
        }
    }

    pub fn with_config(mut self, config: ConfigSchema) -> Self {
        self.config = config;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CharmSource {
    #[default]
    CharmHub,
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    pub channel: String,
}

/// Where a charm came from and what it was resolved against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CharmOrigin {
    pub source: CharmSource,
    pub revision: Option<u32>,
    pub channel: Option<String>,
    pub platform: Platform,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_base_parse_and_display() {
        let base = Base::parse("ubuntu@22.04").unwrap();
        assert_eq!(base, Base::new("ubuntu", "22.04"));
        assert_eq!(base.to_string(), "ubuntu@22.04");
        assert!(Base::parse("ubuntu").is_err());
    }

    #[test]
    fn test_config_schema_rejects_wrong_type() {
        let schema = ConfigSchema::default().with_option("port", OptionType::Int, None);
        let mut settings = Settings::new();
        settings.insert("port".into(), json!("eighty"));
        let err = schema.validate(&settings).unwrap_err();
        assert!(matches!(err, StateError::InvalidConfig { .. }));
    }

    #[test]
    fn test_config_schema_rejects_unknown_key() {
        let schema = ConfigSchema::default();
        let mut settings = Settings::new();
        settings.insert("nope".into(), json!(1));
        assert!(schema.validate(&settings).is_err());
    }

    #[test]
    fn test_config_schema_null_unsets() {
        let schema = ConfigSchema::default().with_option("port", OptionType::Int, None);
        let mut settings = Settings::new();
        settings.insert("port".into(), serde_json::Value::Null);
        assert!(schema.validate(&settings).is_ok());
    }

    #[test]
    fn test_lxd_profile_validation() {
        let mut profile = LxdProfile::default();
        profile
            .config
            .insert("security.nesting".into(), "true".into());
        assert!(profile.validate().is_ok());

        profile.config.insert("boot.autostart".into(), "true".into());
        assert!(profile.validate().is_err());
    }

    #[test]
    fn test_meta_duplicate_endpoint_rejected() {
        let mut meta = CharmMeta::new("mysql").provides("db", "mysql");
        meta.requires.insert(
            "db".into(),
            CharmRelation::new("db", RelationRole::Requirer, "mysql"),
        );
        assert!(meta.validate().is_err());
    }

    #[test]
    fn test_binding_endpoints_include_extra_bindings() {
        let mut meta = CharmMeta::new("mysql").provides("server", "mysql").peer("cluster", "mysql-ha");
        meta.extra_bindings.insert("admin".into());
        let eps: Vec<_> = meta.binding_endpoints().into_iter().collect();
        assert_eq!(eps, vec!["admin", "cluster", "server"]);
    }

    #[test]
    fn test_subordinate_requires_container_scope() {
        let meta = CharmMeta::new("logging").subordinate().requires("info", "juju-info");
        assert!(meta.validate().is_err());

        let meta = CharmMeta::new("logging").subordinate().with_relation(
            CharmRelation::new("info", RelationRole::Requirer, "juju-info")
                .with_scope(RelationScope::Container),
        );
        assert!(meta.validate().is_ok());
    }
}
