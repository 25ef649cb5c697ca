#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{mysql_charm, plain_charm, Fixture};
use fleetstate_core::errors::{ExError, ExErrorKind, StateError};
use fleetstate_core::logging_facility::test_capture::init_test_capture;
use fleetstate_core::{log_op_end, log_op_error, log_op_start, logged_op};
use fleetstate_core_types::schema::{EVENT_END, EVENT_END_ERROR, EVENT_START};

#[test]
fn test_log_op_start_macro() {
    let capture = init_test_capture();
    let op_name = "test_log_op_start_unique_1";

    log_op_start!(op_name);

    capture.assert_event_exists(op_name, EVENT_START);
}

#[test]
fn test_log_op_end_macro() {
    let capture = init_test_capture();
    let op_name = "test_log_op_end_unique_2";

    log_op_end!(op_name, duration_ms = 42);

    let end_events: Vec<_> = capture
        .events_for_op(op_name)
        .into_iter()
        .filter(|e| e.event.as_deref() == Some(EVENT_END))
        .collect();
    assert_eq!(end_events.len(), 1, "Should have exactly one end event");
    assert_eq!(
        end_events[0].fields.get("duration_ms"),
        Some(&"42".to_string())
    );
}

#[test]
fn test_log_op_error_includes_code_and_kind() {
    let capture = init_test_capture();
    let op_name = "test_log_op_error_unique_3";

    let err = StateError::not_found("application \"mysql\"");
    log_op_error!(op_name, err, duration_ms = 10);

    let events = capture.events_for_op(op_name);
    assert_eq!(events.len(), 1, "Should have exactly one error event");
    let event = &events[0];
    assert_eq!(event.event.as_deref(), Some(EVENT_END_ERROR));
    assert_eq!(event.fields.get("err_code"), Some(&"ERR_NOT_FOUND".to_string()));
    assert_eq!(event.fields.get("err_kind"), Some(&"NotFound".to_string()));
}

#[test]
fn test_log_macros_with_extra_fields() {
    let capture = init_test_capture();
    let op_name = "test_log_macros_fields_unique_4";

    log_op_start!(op_name, application = "mysql", unit = "mysql/0");

    let event = capture
        .events_for_op(op_name)
        .into_iter()
        .next()
        .expect("Should have start event");
    assert_eq!(event.fields.get("application"), Some(&"mysql".to_string()));
    assert_eq!(event.fields.get("unit"), Some(&"mysql/0".to_string()));
}

#[test]
#[should_panic(expected = "Expected event")]
fn test_test_capture_assert_event_exists_fails() {
    let capture = init_test_capture();

    capture.assert_event_exists("nonexistent_op_truly_unique_999", EVENT_START);
}

#[test]
fn test_logged_op_returns_body_result_and_logs_outcome() {
    let capture = init_test_capture();
    let op_name = "test_logged_op_unique_6";

    let ok: Result<u32, StateError> = logged_op!(op_name, "ok-entity", { Ok::<u32, StateError>(7) });
    let err: Result<u32, StateError> = logged_op!(op_name, "err-entity", {
        Err(StateError::not_found("unit \"mysql/9\""))
    });

    assert_eq!(ok.unwrap(), 7);
    assert_eq!(err.unwrap_err().kind(), ExErrorKind::NotFound);
    let outcome = |entity: &str, event: &str| {
        capture.count_events(|e| {
            e.op.as_deref() == Some(op_name)
                && e.event.as_deref() == Some(event)
                && e.fields.get("entity").map(String::as_str) == Some(entity)
        })
    };
    assert_eq!(outcome("ok-entity", EVENT_END), 1);
    assert_eq!(outcome("err-entity", EVENT_END_ERROR), 1);
    assert_eq!(outcome("err-entity", EVENT_END), 0);
}

#[test]
fn test_successful_operation_logs_one_start_and_end() {
    // GIVEN capture mode
    let capture = init_test_capture();
    let f = Fixture::new();

    // WHEN an application is added under a name no other test uses
    f.deploy("logged-start-end", &plain_charm("logged", 1));

    // THEN exactly one start and one end carry its name
    let mine = |event: &str| {
        capture.count_events(|e| {
            e.op.as_deref() == Some("add_application")
                && e.event.as_deref() == Some(event)
                && e.fields.get("entity").map(String::as_str) == Some("logged-start-end")
        })
    };
    assert_eq!(mine(EVENT_START), 1);
    assert_eq!(mine(EVENT_END), 1);
    assert_eq!(mine(EVENT_END_ERROR), 0);
}

#[test]
fn test_failed_operation_logs_error_code() {
    // GIVEN a dying application
    let capture = init_test_capture();
    let f = Fixture::new();
    let app = f.deploy("logged-failure", &mysql_charm(1));
    app.add_unit(fleetstate_core::AddUnitParams::default())
        .unwrap();
    app.destroy().unwrap();

    // WHEN adding a unit fails
    let err = app
        .add_unit(fleetstate_core::AddUnitParams::default())
        .unwrap_err();
    assert_eq!(err.kind(), ExErrorKind::NotAlive);

    // THEN the error boundary names the failure
    let failures: Vec<_> = capture
        .events_for_op("add_unit")
        .into_iter()
        .filter(|e| {
            e.event.as_deref() == Some(EVENT_END_ERROR)
                && e.fields.get("entity").map(String::as_str) == Some("logged-failure")
        })
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(
        failures[0].fields.get("err_code"),
        Some(&"ERR_NOT_ALIVE".to_string())
    );
}

#[test]
fn test_error_conversion_matches_logged_code() {
    let capture = init_test_capture();
    let op_name = "test_error_conversion_unique_5";

    let err = StateError::InUse {
        message: "application is used by 1 offer".into(),
    }
    .annotate("destroy application \"mysql\"");
    log_op_error!(op_name, err, duration_ms = 5);

    let ex: ExError = err.into();
    assert_eq!(ex.kind(), ExErrorKind::InUse);
    let event = capture
        .events_for_op(op_name)
        .into_iter()
        .next()
        .expect("Should have error event");
    assert_eq!(event.fields.get("err_code"), Some(&ex.code().to_string()));
}
