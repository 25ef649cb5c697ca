//! Settings and charm reference counts under concurrent writers
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{mysql_charm, plain_charm, Fixture};
use fleetstate_core::settings::drop_ref_ops;
use fleetstate_core::{
    AddApplicationArgs, AddUnitParams, ExErrorKind, SetCharmConfig, StateError,
};

#[test]
fn test_destroy_racing_upgrade_leaves_no_references() {
    // GIVEN mysql on revision 1 with nothing holding it
    let f = Fixture::new();
    let app = f.deploy("mysql", &plain_charm("mysql", 1));
    let v2 = plain_charm("mysql", 2);
    f.register(&v2);

    // WHEN an upgrade commits between the destroy's read and its commit
    let competitor = f.st.application("mysql").unwrap();
    f.before_next_commit(move || {
        competitor.set_charm(SetCharmConfig::new(v2)).unwrap();
    });
    app.destroy().unwrap();

    // THEN the destroy retried against revision 2 and released it
    assert!(f.st.application("mysql").unwrap_err().is_not_found());
    assert_eq!(f.settings_refs("mysql", "ch:mysql-1"), 0);
    assert_eq!(f.settings_refs("mysql", "ch:mysql-2"), 0);
    assert_eq!(f.charm_usage("ch:mysql-1"), 0);
    assert_eq!(f.charm_usage("ch:mysql-2"), 0);

    // AND both charms are collected
    f.st.cleanup().unwrap();
    assert!(f.st.charm("ch:mysql-1").unwrap_err().is_not_found());
    assert!(f.st.charm("ch:mysql-2").unwrap_err().is_not_found());
}

#[test]
fn test_dropping_absent_reference_depends_on_attempt() {
    let f = Fixture::new();
    f.deploy("mysql", &mysql_charm(1));

    // First attempt: the caller asked for something that never existed
    let err = drop_ref_ops(f.st.store(), "mysql", "ch:mysql-9", 0).unwrap_err();
    assert_eq!(err.kind(), ExErrorKind::NotFound);

    // Retry: a concurrent writer took the last reference first
    let err = drop_ref_ops(f.st.store(), "mysql", "ch:mysql-9", 1).unwrap_err();
    assert_eq!(err.kind(), ExErrorKind::ReferenceRace);
}

#[test]
fn test_unit_claiming_settings_dropped_mid_call_is_a_race() {
    // GIVEN a unit on revision 1 and its application on revision 2
    let f = Fixture::new();
    let app = f.deploy("mysql", &mysql_charm(1));
    let unit = app.add_unit(AddUnitParams::default()).unwrap();
    let (v2, v3) = (mysql_charm(2), mysql_charm(3));
    f.register(&v2);
    f.register(&v3);
    app.set_charm(SetCharmConfig::new(v2)).unwrap();

    // WHEN the application moves to revision 3 while the unit claims 2
    let competitor = f.st.application("mysql").unwrap();
    f.before_next_commit(move || {
        competitor.set_charm(SetCharmConfig::new(v3)).unwrap();
    });
    let err = unit.set_charm_url("ch:mysql-2").unwrap_err();

    // THEN the retry reports the lost reference as a race
    assert_eq!(err.kind(), ExErrorKind::ReferenceRace);
    assert!(matches!(
        err.root(),
        StateError::ReferenceRace { owner, key }
            if owner == "mysql" && key == "settings/ch:mysql-2"
    ));

    // AND the unit keeps its old reference
    let unit = f.st.unit("mysql/0").unwrap();
    assert_eq!(unit.charm_url(), Some("ch:mysql-1"));
    assert_eq!(f.settings_refs("mysql", "ch:mysql-1"), 1);
    assert_eq!(f.settings_refs("mysql", "ch:mysql-2"), 0);
}

#[test]
fn test_unit_charm_url_moves_its_reference() {
    // GIVEN a unit left on revision 1 after its application moved on
    let f = Fixture::new();
    let app = f.deploy("mysql", &mysql_charm(1));
    let unit = app.add_unit(AddUnitParams::default()).unwrap();
    let v2 = mysql_charm(2);
    f.register(&v2);
    app.set_charm(SetCharmConfig::new(v2)).unwrap();
    assert_eq!(unit.charm_url(), Some("ch:mysql-1"));
    assert_eq!(f.settings_refs("mysql", "ch:mysql-1"), 1);
    assert_eq!(f.settings_refs("mysql", "ch:mysql-2"), 1);

    // WHEN the unit reports running revision 2
    unit.set_charm_url("ch:mysql-2").unwrap();

    // THEN its reference moved and revision 1 is unused
    assert_eq!(f.settings_refs("mysql", "ch:mysql-1"), 0);
    assert_eq!(f.settings_refs("mysql", "ch:mysql-2"), 2);
    assert_eq!(f.charm_usage("ch:mysql-1"), 0);
    assert_eq!(
        f.st.unit("mysql/0").unwrap().charm_url(),
        Some("ch:mysql-2")
    );
}

#[test]
fn test_unit_charm_url_requires_settings() {
    let f = Fixture::new();
    let app = f.deploy("mysql", &mysql_charm(1));
    let unit = app.add_unit(AddUnitParams::default()).unwrap();

    let err = unit.set_charm_url("ch:mysql-7").unwrap_err();

    assert_eq!(err.kind(), ExErrorKind::NotFound);
    assert_eq!(unit.charm_url(), Some("ch:mysql-1"));
}

#[test]
fn test_two_applications_share_charm_usage() {
    // GIVEN the same charm deployed twice
    let f = Fixture::new();
    let charm = mysql_charm(1);
    let a = f.deploy("mysql-a", &charm);
    f.st.add_application(AddApplicationArgs::new("mysql-b", charm))
        .unwrap();
    assert_eq!(f.charm_usage("ch:mysql-1"), 2);

    // WHEN one is destroyed
    a.destroy().unwrap();
    f.st.cleanup().unwrap();

    // THEN the charm is still in use and kept
    assert_eq!(f.charm_usage("ch:mysql-1"), 1);
    assert!(f.st.charm("ch:mysql-1").is_ok());
}
