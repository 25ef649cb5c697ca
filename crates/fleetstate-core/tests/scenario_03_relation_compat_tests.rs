//! Scenario 3: relation compatibility on upgrade
//!
//! Non-peer relations must survive an upgrade unchanged; peer relations
//! follow the new charm's peer endpoints.
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{client_charm, mysql_charm, peer, Fixture};
use fleetstate_core::model::{Charm, CharmMeta, CharmRelation, RelationRole};
use fleetstate_core::{AddUnitParams, Application, ExErrorKind, SetCharmConfig};

/// mysql related to wordpress and blog over `server`
fn related_mysql(f: &Fixture) -> Application {
    let mysql = f.deploy("mysql", &mysql_charm(1));
    for client in ["wordpress", "blog"] {
        f.deploy(client, &client_charm(client));
        let server = f.st.endpoint("mysql", "server").unwrap();
        let db = f.st.endpoint(client, "db").unwrap();
        f.st.add_relation(&server, &db).unwrap();
    }
    mysql
}

fn peer_keys(app: &Application) -> Vec<String> {
    app.relations()
        .into_iter()
        .filter(|r| r.doc().is_peer())
        .map(|r| r.key().to_string())
        .collect()
}

#[test]
fn test_scenario_03_dropping_related_endpoint_would_break_relation() {
    // GIVEN mysql with two relations on `server`
    let f = Fixture::new();
    let mysql = related_mysql(&f);
    assert_eq!(f.st.application("mysql").unwrap().relation_count(), 3);

    // WHEN upgrading to a charm without `server`
    let target = Charm::new(
        "ch:mysql-2",
        CharmMeta::new("mysql").peer("cluster", "mysql-ha"),
    );
    f.register(&target);
    let err = mysql.set_charm(SetCharmConfig::new(target)).unwrap_err();

    // THEN the upgrade is refused and nothing moved
    assert_eq!(err.kind(), ExErrorKind::WouldBreakRelation);
    assert!(err.to_string().contains("would break relation"));
    assert_eq!(f.st.application("mysql").unwrap().charm_url(), "ch:mysql-1");
}

#[test]
fn test_scenario_03_changed_interface_would_break_relation() {
    // GIVEN mysql related over the mysql interface
    let f = Fixture::new();
    let mysql = related_mysql(&f);

    // WHEN the new charm keeps the endpoint name but changes its interface
    let target = Charm::new(
        "ch:mysql-2",
        CharmMeta::new("mysql")
            .provides("server", "pgsql")
            .peer("cluster", "mysql-ha"),
    );
    f.register(&target);
    let err = mysql.set_charm(SetCharmConfig::new(target)).unwrap_err();

    // THEN the upgrade is refused
    assert_eq!(err.kind(), ExErrorKind::WouldBreakRelation);
}

#[test]
fn test_scenario_03_renamed_peer_replaces_relation() {
    // GIVEN related mysql with its `cluster` peer relation
    let f = Fixture::new();
    let mysql = related_mysql(&f);
    assert_eq!(peer_keys(&mysql), vec!["mysql:cluster"]);

    // WHEN upgrading to a charm that renames the peer endpoint
    let target = Charm::new(
        "ch:mysql-2",
        CharmMeta::new("mysql")
            .provides("server", "mysql")
            .peer("ring", "mysql-ha"),
    );
    f.register(&target);
    mysql.set_charm(SetCharmConfig::new(target)).unwrap();

    // THEN exactly one peer relation exists, under the new name
    assert_eq!(peer_keys(&mysql), vec!["mysql:ring"]);
    assert!(f.st.relation("mysql:cluster").unwrap_err().is_not_found());

    // AND the non-peer relations and relation count are intact
    let app = f.st.application("mysql").unwrap();
    assert_eq!(app.charm_url(), "ch:mysql-2");
    assert_eq!(app.relation_count(), 3);
    assert!(f.st.relation("blog:db mysql:server").is_ok());
    assert!(f.st.relation("mysql:server wordpress:db").is_ok());
}

#[test]
fn test_scenario_03_busy_peer_relation_needs_force() {
    // GIVEN two mysql units in the `cluster` peer scope
    let f = Fixture::new();
    let mysql = f.deploy("mysql", &mysql_charm(1));
    let cluster = f.st.relation("mysql:cluster").unwrap();
    for _ in 0..2 {
        let unit = mysql.add_unit(AddUnitParams::default()).unwrap();
        cluster.enter_scope(&unit).unwrap();
    }
    let target = Charm::new(
        "ch:mysql-2",
        CharmMeta::new("mysql")
            .provides("server", "mysql")
            .with_relation(peer("ring", "mysql-ha")),
    );
    f.register(&target);

    // WHEN upgrading without force
    let err = mysql.set_charm(SetCharmConfig::new(target.clone())).unwrap_err();

    // THEN the busy peer relation blocks it
    assert_eq!(err.kind(), ExErrorKind::InUse);
    assert!(f.st.relation("mysql:cluster").is_ok());

    // WHEN forced
    let mut cfg = SetCharmConfig::new(target);
    cfg.force = true;
    mysql.set_charm(cfg).unwrap();

    // THEN the old relation and its scopes are gone and the new one is empty
    assert!(f.st.relation("mysql:cluster").unwrap_err().is_not_found());
    let ring = f.st.relation("mysql:ring").unwrap();
    assert_eq!(ring.unit_count(), 0);
    assert!(ring.units_in_scope().is_empty());

    // AND the units can die now that they are out of scope
    for unit in mysql.units() {
        unit.destroy().unwrap();
    }
    assert!(mysql.units().is_empty());
}

#[test]
fn test_scenario_03_lower_limit_than_established_is_rejected() {
    // GIVEN mysql with two relations on `server`
    let f = Fixture::new();
    let mysql = related_mysql(&f);

    // WHEN the new charm limits `server` to one relation
    let target = Charm::new(
        "ch:mysql-2",
        CharmMeta::new("mysql")
            .with_relation(CharmRelation::new("server", RelationRole::Provider, "mysql").with_limit(1))
            .peer("cluster", "mysql-ha"),
    );
    f.register(&target);
    let err = mysql.set_charm(SetCharmConfig::new(target)).unwrap_err();

    // THEN the quota error names the limit
    assert_eq!(err.kind(), ExErrorKind::QuotaLimitExceeded);
    assert!(err
        .to_string()
        .contains("new charm version imposes a maximum relation limit of 1"));
}
