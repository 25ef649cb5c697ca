//! Application settings, scaling, expose and unit bookkeeping
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::collections::BTreeMap;

use common::{mysql_charm, plain_charm, Fixture};
use fleetstate_core::model::{
    Charm, CharmMeta, ConfigSchema, Constraints, ExposedEndpoint, OptionType, Settings,
    WorkloadStatus,
};
use fleetstate_core::{AddApplicationArgs, AddUnitParams, ExErrorKind, SetCharmConfig};
use serde_json::{json, Value};

fn settings(pairs: &[(&str, Value)]) -> Settings {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn configured(url: &str, schema: ConfigSchema) -> Charm {
    Charm::new(url, CharmMeta::new("mysql").provides("server", "mysql")).with_config(schema)
}

fn schema_v1() -> ConfigSchema {
    ConfigSchema::default()
        .with_option("port", OptionType::Int, Some(json!(3306)))
        .with_option("name", OptionType::String, None)
}

// ===== Config =====

#[test]
fn test_config_overlays_defaults_and_resets_on_null() {
    // GIVEN mysql deployed with name set
    let f = Fixture::new();
    let charm = configured("ch:mysql-1", schema_v1());
    f.register(&charm);
    let mut args = AddApplicationArgs::new("mysql", charm);
    args.settings = settings(&[("name", json!("db"))]);
    let app = f.st.add_application(args).unwrap();
    assert_eq!(
        app.charm_config().unwrap(),
        settings(&[("name", json!("db")), ("port", json!(3306))])
    );

    // WHEN port is changed and name reset
    app.update_charm_config(&settings(&[("port", json!(3307)), ("name", Value::Null)]))
        .unwrap();

    // THEN only the defaulted port remains, with its new value
    assert_eq!(app.charm_config().unwrap(), settings(&[("port", json!(3307))]));
}

#[test]
fn test_config_rejects_unknown_and_mistyped_values() {
    let f = Fixture::new();
    let app = f.deploy("mysql", &configured("ch:mysql-1", schema_v1()));

    let err = app
        .update_charm_config(&settings(&[("port", json!("high"))]))
        .unwrap_err();
    assert_eq!(err.kind(), ExErrorKind::InvalidConfig);

    let err = app
        .update_charm_config(&settings(&[("bogus", json!(1))]))
        .unwrap_err();
    assert_eq!(err.kind(), ExErrorKind::InvalidConfig);
    assert_eq!(app.charm_config().unwrap(), settings(&[("port", json!(3306))]));
}

#[test]
fn test_upgrade_carries_settings_the_new_schema_knows() {
    // GIVEN both options set on revision 1
    let f = Fixture::new();
    let app = f.deploy("mysql", &configured("ch:mysql-1", schema_v1()));
    app.update_charm_config(&settings(&[("port", json!(3307)), ("name", json!("db"))]))
        .unwrap();

    // WHEN revision 2 drops `name`
    let v2 = configured(
        "ch:mysql-2",
        ConfigSchema::default().with_option("port", OptionType::Int, Some(json!(3306))),
    );
    f.register(&v2);
    app.set_charm(SetCharmConfig::new(v2)).unwrap();

    // THEN port is carried over and name is gone
    assert_eq!(app.charm_config().unwrap(), settings(&[("port", json!(3307))]));
}

#[test]
fn test_upgrade_applies_config_overrides() {
    let f = Fixture::new();
    let app = f.deploy("mysql", &configured("ch:mysql-1", schema_v1()));
    let v2 = configured("ch:mysql-2", schema_v1());
    f.register(&v2);

    let mut cfg = SetCharmConfig::new(v2);
    cfg.config_settings = settings(&[("name", json!("primary"))]);
    app.set_charm(cfg).unwrap();

    assert_eq!(
        app.charm_config().unwrap(),
        settings(&[("name", json!("primary")), ("port", json!(3306))])
    );
}

// ===== Constraints and expose =====

#[test]
fn test_constraints_round_trip_and_validation() {
    let f = Fixture::new();
    let app = f.deploy("mysql", &mysql_charm(1));
    let cons = Constraints {
        arch: Some("arm64".into()),
        mem_mib: Some(4096),
        ..Constraints::default()
    };

    app.set_constraints(cons.clone()).unwrap();
    assert_eq!(app.constraints().unwrap(), cons);

    let err = app
        .set_constraints(Constraints {
            cores: Some(0),
            ..Constraints::default()
        })
        .unwrap_err();
    assert_eq!(err.kind(), ExErrorKind::InvalidInput);
    assert_eq!(app.constraints().unwrap(), cons);
}

#[test]
fn test_expose_merge_and_unset() {
    // GIVEN mysql exposed on server to a space and on everything by default
    let f = Fixture::new();
    let app = f.deploy("mysql", &mysql_charm(1));
    let mut exposed = BTreeMap::new();
    exposed.insert(
        "server".to_string(),
        ExposedEndpoint {
            to_spaces: vec!["public".into()],
            to_cidrs: vec![],
        },
    );
    exposed.insert(String::new(), ExposedEndpoint::default());
    app.merge_expose_settings(exposed).unwrap();

    // THEN an empty entry opens to all addresses
    let app = f.st.application("mysql").unwrap();
    assert!(app.is_exposed());
    assert_eq!(
        app.exposed_endpoints()[""].to_cidrs,
        vec!["0.0.0.0/0", "::/0"]
    );

    // WHEN both entries are unset
    app.unset_expose_settings(&["server".to_string()]).unwrap();
    assert!(f.st.application("mysql").unwrap().is_exposed());
    app.unset_expose_settings(&[String::new()]).unwrap();

    // THEN the application is no longer exposed
    assert!(!f.st.application("mysql").unwrap().is_exposed());
}

#[test]
fn test_clear_exposed_drops_every_entry() {
    let f = Fixture::new();
    let app = f.deploy("mysql", &mysql_charm(1));
    let mut exposed = BTreeMap::new();
    exposed.insert("server".to_string(), ExposedEndpoint::default());
    app.merge_expose_settings(exposed).unwrap();

    app.clear_exposed().unwrap();

    let app = f.st.application("mysql").unwrap();
    assert!(!app.is_exposed());
    assert!(app.exposed_endpoints().is_empty());
}

#[test]
fn test_expose_rejects_unknown_endpoint_space_and_cidr() {
    let f = Fixture::new();
    let app = f.deploy("mysql", &mysql_charm(1));
    let one = |ep: &str, spaces: &[&str], cidrs: &[&str]| {
        let mut m = BTreeMap::new();
        m.insert(
            ep.to_string(),
            ExposedEndpoint {
                to_spaces: spaces.iter().map(|s| s.to_string()).collect(),
                to_cidrs: cidrs.iter().map(|s| s.to_string()).collect(),
            },
        );
        m
    };

    for bad in [
        one("admin", &[], &[]),
        one("server", &["nowhere"], &[]),
        one("server", &[], &["10.0.0.0/40"]),
    ] {
        let err = app.merge_expose_settings(bad).unwrap_err();
        assert_eq!(err.kind(), ExErrorKind::InvalidInput);
    }
    let err = app.unset_expose_settings(&["server".to_string()]).unwrap_err();
    assert_eq!(err.kind(), ExErrorKind::InvalidInput);
    assert!(!f.st.application("mysql").unwrap().is_exposed());
}

// ===== Scaling =====

#[test]
fn test_ensure_min_units_tops_up_alive_units() {
    let f = Fixture::new();
    let app = f.deploy("mysql", &mysql_charm(1));
    app.add_unit(AddUnitParams::default()).unwrap();
    app.set_min_units(3).unwrap();

    app.ensure_min_units().unwrap();
    app.ensure_min_units().unwrap();

    let app = f.st.application("mysql").unwrap();
    assert_eq!(app.min_units(), 3);
    assert_eq!(app.unit_count(), 3);
}

#[test]
fn test_set_scale_tracks_generation() {
    // GIVEN a CAAS application
    let f = Fixture::caas();
    let app = f.deploy("mariadb", &plain_charm("mariadb", 1));

    // WHEN scaled at generation 1
    app.set_scale(3, 1, false).unwrap();
    let caas = f.st.application("mariadb").unwrap().caas_state().cloned().unwrap();
    assert_eq!((caas.desired_scale, caas.scale_generation), (3, 1));

    // THEN an older generation is refused unless forced
    let err = app.set_scale(2, 0, false).unwrap_err();
    assert_eq!(err.kind(), ExErrorKind::Forbidden);
    app.set_scale(2, 0, true).unwrap();
    let caas = f.st.application("mariadb").unwrap().caas_state().cloned().unwrap();
    assert_eq!((caas.desired_scale, caas.scale_generation), (2, 2));
}

#[test]
fn test_change_scale_never_goes_negative() {
    let f = Fixture::caas();
    let app = f.deploy("mariadb", &plain_charm("mariadb", 1));
    app.set_scale(2, 0, false).unwrap();

    assert_eq!(app.change_scale(-1).unwrap(), 1);
    let err = app.change_scale(-5).unwrap_err();

    assert_eq!(err.kind(), ExErrorKind::InvalidInput);
    let caas = f.st.application("mariadb").unwrap().caas_state().cloned().unwrap();
    assert_eq!(caas.desired_scale, 1);
}

#[test]
fn test_scale_is_caas_only() {
    let f = Fixture::new();
    let app = f.deploy("mysql", &mysql_charm(1));
    assert_eq!(
        app.set_scale(1, 0, false).unwrap_err().kind(),
        ExErrorKind::InvalidInput
    );
    assert_eq!(app.change_scale(1).unwrap_err().kind(), ExErrorKind::InvalidInput);
}

// ===== Units =====

#[test]
fn test_unit_in_error_blocks_upgrade_unless_forced() {
    // GIVEN a unit reporting an error
    let f = Fixture::new();
    let app = f.deploy("mysql", &mysql_charm(1));
    let unit = app.add_unit(AddUnitParams::default()).unwrap();
    unit.set_status(WorkloadStatus::Error, "hook failed").unwrap();
    let v2 = mysql_charm(2);
    f.register(&v2);

    // WHEN upgrading without force_units
    let err = app.set_charm(SetCharmConfig::new(v2.clone())).unwrap_err();

    // THEN the unit is named
    assert_eq!(err.kind(), ExErrorKind::UnitInError);
    assert!(err.to_string().ends_with("unit \"mysql/0\" is in an error state"));

    // AND force_units lets it through and is recorded
    let mut cfg = SetCharmConfig::new(v2);
    cfg.force_units = true;
    app.set_charm(cfg).unwrap();
    let app = f.st.application("mysql").unwrap();
    assert!(app.force_charm());
    assert_eq!(app.charm_url(), "ch:mysql-2");
}

#[test]
fn test_assign_to_machine_is_sticky() {
    let f = Fixture::new();
    let app = f.deploy("mysql", &mysql_charm(1));
    let unit = app.add_unit(AddUnitParams::default()).unwrap();

    unit.assign_to_machine("3").unwrap();
    unit.assign_to_machine("3").unwrap();
    let err = unit.assign_to_machine("4").unwrap_err();

    assert_eq!(err.kind(), ExErrorKind::InvalidInput);
    assert_eq!(f.st.unit("mysql/0").unwrap().machine_id(), Some("3"));
}

#[test]
fn test_unit_params_are_recorded() {
    let f = Fixture::caas();
    let app = f.deploy("mariadb", &plain_charm("mariadb", 1));

    let unit = app
        .add_unit(AddUnitParams {
            provider_id: Some("mariadb-0".into()),
            address: Some("10.1.0.7".into()),
            ports: vec![3306],
            unit_name: None,
        })
        .unwrap();

    assert_eq!(unit.provider_id(), Some("mariadb-0"));
    assert_eq!(unit.address(), Some("10.1.0.7"));
    assert_eq!(unit.ports(), &[3306]);
}

#[test]
fn test_relation_suspension_toggles() {
    let f = Fixture::new();
    f.deploy("mysql", &mysql_charm(1));
    let rel = f.st.relation("mysql:cluster").unwrap();

    rel.set_suspended(true).unwrap();
    assert!(f.st.relation("mysql:cluster").unwrap().is_suspended());
    rel.set_suspended(false).unwrap();
    assert!(!f.st.relation("mysql:cluster").unwrap().is_suspended());
}
