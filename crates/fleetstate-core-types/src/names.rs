//! Entity naming rules
//!
//! Application names are lowercase, start with a letter, may contain digits
//! and single hyphens, and never end in a hyphen-number group that could be
//! confused with a unit suffix. Unit names are `<application>/<index>`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Check whether `name` is a valid application name
pub fn is_valid_application_name(name: &str) -> bool {
    if name.is_empty() || !name.starts_with(|c: char| c.is_ascii_lowercase()) {
        return false;
    }
    if name.ends_with('-') || name.contains("--") {
        return false;
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return false;
    }
    // Every hyphen-separated group must contain at least one letter.
    name.split('-')
        .all(|part| part.chars().any(|c| c.is_ascii_lowercase()))
}

/// Parsed unit name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitName {
    application: String,
    index: u64,
}

impl UnitName {
    /// Build a unit name from its parts
    pub fn new(application: impl Into<String>, index: u64) -> Self {
        Self {
            application: application.into(),
            index,
        }
    }

    /// Parse `app/N`; returns `None` for anything else
    pub fn parse(s: &str) -> Option<Self> {
        let (app, idx) = s.split_once('/')?;
        if !is_valid_application_name(app) {
            return None;
        }
        if idx.is_empty() || (idx.len() > 1 && idx.starts_with('0')) {
            return None;
        }
        let index = idx.parse().ok()?;
        Some(Self::new(app, index))
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn index(&self) -> u64 {
        self.index
    }
}

impl fmt::Display for UnitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.application, self.index)
    }
}

/// Application part of a unit name, without validating the index
pub fn unit_application(unit: &str) -> &str {
    unit.split_once('/').map(|(app, _)| app).unwrap_or(unit)
}
