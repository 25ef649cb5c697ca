//! Canonical schema constants for structured logging and events
//!
//! These constants ensure consistency across all logging and error reporting.

// Canonical field keys for structured logging
pub const FIELD_COMPONENT: &str = "component";
pub const FIELD_OP: &str = "op";
pub const FIELD_EVENT: &str = "event";
pub const FIELD_DURATION_MS: &str = "duration_ms";

// Entity identifiers
pub const FIELD_APPLICATION: &str = "application";
pub const FIELD_UNIT: &str = "unit";
pub const FIELD_RELATION: &str = "relation";
pub const FIELD_CHARM_URL: &str = "charm_url";

// Transaction bookkeeping
pub const FIELD_ATTEMPT: &str = "attempt";
pub const FIELD_REVNO: &str = "revno";
pub const FIELD_OPS_LEN: &str = "ops_len";

// Error fields
pub const FIELD_ERR_KIND: &str = "err_kind";
pub const FIELD_ERR_CODE: &str = "err_code";

// Canonical event names
pub const EVENT_START: &str = "start";
pub const EVENT_END: &str = "end";
pub const EVENT_END_ERROR: &str = "end_error";
pub const EVENT_TXN_ABORTED: &str = "txn_aborted";
