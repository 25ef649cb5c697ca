//! Entity lifecycle
//!
//! Life only moves forward: Alive -> Dying -> Dead. Removal is the absence
//! of the record and is not represented here.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Life {
    Alive,
    Dying,
    Dead,
}

impl Life {
    /// Single legal-transition check for every entity kind.
    ///
    /// Staying in the same state is allowed (it is a no-op); skipping Dying
    /// is allowed because an entity without dependents may die directly.
    pub fn can_transition(from: Life, to: Life) -> bool {
        from <= to
    }

    pub fn is_alive(self) -> bool {
        self == Life::Alive
    }

    pub fn is_dead(self) -> bool {
        self == Life::Dead
    }
}

impl fmt::Display for Life {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Life::Alive => "alive",
            Life::Dying => "dying",
            Life::Dead => "dead",
        };
        f.write_str(s)
    }
}
