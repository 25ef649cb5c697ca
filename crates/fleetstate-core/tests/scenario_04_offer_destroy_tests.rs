//! Scenario 4: offers block application destroy
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{plain_charm, Fixture};
use fleetstate_core::application::OFFERS_REF_KEY;
use fleetstate_core::refcount;
use fleetstate_core::ExErrorKind;

#[test]
fn test_scenario_04_offer_blocks_destroy_until_removed_with_it() {
    // GIVEN an application with one offer
    let f = Fixture::new();
    let app = f.deploy("mysql", &plain_charm("mysql", 1));
    f.st.add_offer("hosted-mysql", "mysql").unwrap();
    assert_eq!(refcount::read(f.st.store(), "mysql", OFFERS_REF_KEY).unwrap(), 1);

    // WHEN destroying without removing offers
    let err = app.destroy().unwrap_err();

    // THEN the destroy is refused and the application stays alive
    assert_eq!(
        err.to_string(),
        "cannot destroy application \"mysql\": application is used by 1 offer"
    );
    assert_eq!(err.kind(), ExErrorKind::InUse);
    assert!(f.st.application("mysql").unwrap().life().is_alive());

    // WHEN destroying with offer removal
    app.destroy_operation().with_remove_offers(true).run().unwrap();

    // THEN both the offer and the application are gone
    assert!(f.st.offers_for("mysql").is_empty());
    assert!(f.st.application("mysql").unwrap_err().is_not_found());
    assert!(refcount::read(f.st.store(), "mysql", OFFERS_REF_KEY)
        .unwrap_err()
        .is_not_found());
    assert_eq!(f.settings_refs("mysql", "ch:mysql-1"), 0);
}

#[test]
fn test_scenario_04_message_counts_offers() {
    // GIVEN two offers
    let f = Fixture::new();
    let app = f.deploy("mysql", &plain_charm("mysql", 1));
    f.st.add_offer("a", "mysql").unwrap();
    f.st.add_offer("b", "mysql").unwrap();

    // WHEN destroying
    let err = app.destroy().unwrap_err();

    // THEN the message uses the plural
    assert!(err.to_string().ends_with("application is used by 2 offers"));

    // AND removing the offers one by one unblocks it
    f.st.remove_offer("a").unwrap();
    f.st.remove_offer("b").unwrap();
    app.destroy().unwrap();
    assert!(f.st.application("mysql").unwrap_err().is_not_found());
}

#[test]
fn test_scenario_04_removed_application_queues_charm_cleanup() {
    // GIVEN an application removed outright
    let f = Fixture::new();
    let app = f.deploy("mysql", &plain_charm("mysql", 1));
    app.destroy().unwrap();

    // THEN its charm is unused and a cleanup is pending
    assert_eq!(f.charm_usage("ch:mysql-1"), 0);
    assert!(f.st.needs_cleanup());

    // WHEN cleanups run
    f.st.cleanup().unwrap();

    // THEN the charm is removed and nothing is left to do
    assert!(f.st.charm("ch:mysql-1").unwrap_err().is_not_found());
    assert!(!f.st.needs_cleanup());
}
