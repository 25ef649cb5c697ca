//! Collaborators the core consumes but does not own
//!
//! Network spaces, storage pools and cloud resource release live outside
//! the consistency core. The static implementations here back tests and
//! embedders that configure them up front.

use std::collections::{BTreeMap, BTreeSet};

use parking_lot::Mutex;

use crate::errors::Result;
use crate::model::StorageKind;

/// Network spaces known to the model
pub trait SpaceCatalog: Send + Sync {
    fn space_exists(&self, space_id: &str) -> bool;
}

/// Storage pools known to the model
pub trait StoragePoolRegistry: Send + Sync {
    fn pool_exists(&self, pool: &str) -> bool;

    /// Pool used when a caller gives no constraint for a store
    fn default_pool(&self, kind: StorageKind) -> Option<String>;
}

/// Releases cluster resources of a CAAS application being destroyed
pub trait ResourceReleaser: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the release request could not be issued.
    fn release(&self, application: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticSpaces {
    spaces: BTreeSet<String>,
}

impl StaticSpaces {
    pub fn new<I, S>(spaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            spaces: spaces.into_iter().map(Into::into).collect(),
        }
    }
}

impl SpaceCatalog for StaticSpaces {
    fn space_exists(&self, space_id: &str) -> bool {
        self.spaces.contains(space_id)
    }
}

#[derive(Debug, Clone)]
pub struct StaticPools {
    pools: BTreeSet<String>,
    defaults: BTreeMap<StorageKind, String>,
}

impl StaticPools {
    pub fn new() -> Self {
        Self {
            pools: BTreeSet::new(),
            defaults: BTreeMap::new(),
        }
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pools.insert(pool.into());
        self
    }

    pub fn with_default(mut self, kind: StorageKind, pool: impl Into<String>) -> Self {
        let pool = pool.into();
        self.pools.insert(pool.clone());
        self.defaults.insert(kind, pool);
        self
    }
}

impl Default for StaticPools {
    /// `loop` for block stores and `rootfs` for filesystems
    fn default() -> Self {
        Self::new()
            .with_default(StorageKind::Block, "loop")
            .with_default(StorageKind::Filesystem, "rootfs")
    }
}

impl StoragePoolRegistry for StaticPools {
    fn pool_exists(&self, pool: &str) -> bool {
        self.pools.contains(pool)
    }

    fn default_pool(&self, kind: StorageKind) -> Option<String> {
        self.defaults.get(&kind).cloned()
    }
}

/// Releaser that only records which applications it was asked about
#[derive(Debug, Default)]
pub struct RecordingReleaser {
    released: Mutex<Vec<String>>,
}

impl RecordingReleaser {
    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }
}

impl ResourceReleaser for RecordingReleaser {
    fn release(&self, application: &str) -> Result<()> {
        self.released.lock().push(application.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_spaces() {
        let spaces = StaticSpaces::new(["0", "db"]);
        assert!(spaces.space_exists("db"));
        assert!(!spaces.space_exists("public"));
    }

    #[test]
    fn test_default_pools() {
        let pools = StaticPools::default();
        assert_eq!(pools.default_pool(StorageKind::Block).as_deref(), Some("loop"));
        assert!(pools.pool_exists("rootfs"));
        assert!(!pools.pool_exists("ebs"));
    }

    #[test]
    fn test_recording_releaser() {
        let releaser = RecordingReleaser::default();
        releaser.release("gitlab").unwrap();
        assert_eq!(releaser.released(), vec!["gitlab".to_string()]);
    }
}
