//! Canonical logging macros
//!
//! These macros provide a structured, consistent way to log operation
//! boundaries.

/// Log the start of an operation
///
/// # Example
///
/// ```
/// # use fleetstate_core::log_op_start;
/// log_op_start!("add_unit");
/// log_op_start!("add_unit", application = "mysql");
/// ```
#[macro_export]
macro_rules! log_op_start {
    ($op:expr) => {
        tracing::info!(
            component = module_path!(),
            op = $op,
            event = $crate::core_types::schema::EVENT_START,
        );
    };
    ($op:expr, $($field:tt)*) => {
        tracing::info!(
            component = module_path!(),
            op = $op,
            event = $crate::core_types::schema::EVENT_START,
            $($field)*
        );
    };
}

/// Log the successful end of an operation
///
/// # Example
///
/// ```
/// # use fleetstate_core::log_op_end;
/// log_op_end!("add_unit", duration_ms = 3);
/// ```
#[macro_export]
macro_rules! log_op_end {
    ($op:expr, duration_ms = $duration:expr) => {
        tracing::info!(
            component = module_path!(),
            op = $op,
            event = $crate::core_types::schema::EVENT_END,
            duration_ms = $duration,
        );
    };
    ($op:expr, duration_ms = $duration:expr, $($field:tt)*) => {
        tracing::info!(
            component = module_path!(),
            op = $op,
            event = $crate::core_types::schema::EVENT_END,
            duration_ms = $duration,
            $($field)*
        );
    };
}

/// Log an operation error
///
/// The error is borrowed, so the caller can still return it.
///
/// # Example
///
/// ```
/// # use fleetstate_core::{log_op_error, errors::StateError};
/// let err = StateError::not_found("application \"mysql\"");
/// log_op_error!("destroy_application", err, duration_ms = 10);
/// ```
#[macro_export]
macro_rules! log_op_error {
    ($op:expr, $err:expr, duration_ms = $duration:expr) => {{
        let ex_err: $crate::errors::ExError = (&$err).into();
        tracing::error!(
            component = module_path!(),
            op = $op,
            event = $crate::core_types::schema::EVENT_END_ERROR,
            duration_ms = $duration,
            err_kind = ?ex_err.kind(),
            err_code = ex_err.code(),
        );
    }};
    ($op:expr, $err:expr, duration_ms = $duration:expr, $($field:tt)*) => {{
        let ex_err: $crate::errors::ExError = (&$err).into();
        tracing::error!(
            component = module_path!(),
            op = $op,
            event = $crate::core_types::schema::EVENT_END_ERROR,
            duration_ms = $duration,
            err_kind = ?ex_err.kind(),
            err_code = ex_err.code(),
            $($field)*
        );
    }};
}

/// Run `$body` between start/end boundary events, logging failures
///
/// `$body` must evaluate to a `Result`; it is returned unchanged.
#[macro_export]
macro_rules! logged_op {
    ($op:expr, $entity:expr, $body:expr) => {{
        let started = std::time::Instant::now();
        $crate::log_op_start!($op, entity = %$entity);
        let result = $body;
        let elapsed = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                $crate::log_op_end!($op, duration_ms = elapsed, entity = %$entity);
            }
            Err(err) => {
                $crate::log_op_error!($op, *err, duration_ms = elapsed, entity = %$entity);
            }
        }
        result
    }};
}
