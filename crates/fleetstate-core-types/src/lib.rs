//! Core types shared across fleetstate facilities
//!
//! This crate provides foundational types used by the error, logging and
//! state layers:
//!
//! - **Schema constants**: Canonical field keys and event names
//! - **Names**: Application and unit naming rules

pub mod names;
pub mod schema;

pub use names::{is_valid_application_name, unit_application, UnitName};
