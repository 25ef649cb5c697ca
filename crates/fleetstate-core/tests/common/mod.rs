use std::sync::Arc;

use fleetstate_core::catalog::{StaticPools, StaticSpaces};
use fleetstate_core::model::{Charm, CharmMeta, CharmRelation, RelationRole};
use fleetstate_core::settings::{charm_usage, settings_refcount};
use fleetstate_core::{AddApplicationArgs, Application, MemoryStore, State, StateConfig};

/// State over a store the test keeps a handle to, for before-hooks
pub struct Fixture {
    pub st: State,
    pub store: Arc<MemoryStore>,
}

#[allow(dead_code)]
impl Fixture {
    pub fn new() -> Self {
        Self::with_config(StateConfig::default())
    }

    pub fn caas() -> Self {
        Self::with_config(StateConfig::caas())
    }

    pub fn with_config(config: StateConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let st = State::new(
            store.clone(),
            config,
            Arc::new(StaticSpaces::new(["0", "db", "public", "internal"])),
            Arc::new(StaticPools::default()),
        )
        .expect("fixture state");
        Self { st, store }
    }

    /// Register `charm` and deploy it as `name` with default arguments
    pub fn deploy(&self, name: &str, charm: &Charm) -> Application {
        self.st.add_charm(charm.clone()).expect("add charm");
        self.st
            .add_application(AddApplicationArgs::new(name, charm.clone()))
            .expect("add application")
    }

    pub fn register(&self, charm: &Charm) {
        self.st.add_charm(charm.clone()).expect("add charm");
    }

    pub fn settings_refs(&self, application: &str, url: &str) -> u64 {
        settings_refcount(self.st.store(), application, url)
    }

    pub fn charm_usage(&self, url: &str) -> u64 {
        charm_usage(self.st.store(), url)
    }

    /// Run `f` immediately before the next store commit
    pub fn before_next_commit(&self, f: impl FnOnce() + Send + 'static) {
        self.store.set_before_hooks(vec![Box::new(f)]);
    }
}

/// mysql: provides `server`, peer `cluster`
#[allow(dead_code)]
pub fn mysql_meta() -> CharmMeta {
    CharmMeta::new("mysql")
        .provides("server", "mysql")
        .peer("cluster", "mysql-ha")
}

#[allow(dead_code)]
pub fn mysql_charm(revision: u32) -> Charm {
    Charm::new(format!("ch:mysql-{}", revision), mysql_meta())
}

/// A charm with no relations at all
#[allow(dead_code)]
pub fn plain_charm(name: &str, revision: u32) -> Charm {
    Charm::new(format!("ch:{}-{}", name, revision), CharmMeta::new(name))
}

/// wordpress-like client requiring `db` over the mysql interface
#[allow(dead_code)]
pub fn client_charm(name: &str) -> Charm {
    Charm::new(
        format!("ch:{}-1", name),
        CharmMeta::new(name).requires("db", "mysql"),
    )
}

#[allow(dead_code)]
pub fn peer(name: &str, interface: &str) -> CharmRelation {
    CharmRelation::new(name, RelationRole::Peer, interface)
}
