use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::{Result, StateError};

/// Hardware and placement constraints for an application's units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Constraints {
    pub arch: Option<String>,
    pub cores: Option<u64>,
    pub mem_mib: Option<u64>,
    pub root_disk_mib: Option<u64>,
    /// Positive and `^`-negated space names
    pub spaces: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
}

const KNOWN_ARCHES: [&str; 5] = ["amd64", "arm64", "ppc64el", "s390x", "riscv64"];

impl Constraints {
    pub fn is_empty(&self) -> bool {
        *self == Constraints::default()
    }

    /// Spaces named positively
    pub fn included_spaces(&self) -> Vec<&str> {
        self.spaces
            .iter()
            .flatten()
            .filter(|s| !s.starts_with('^'))
            .map(String::as_str)
            .collect()
    }

    /// # Errors
    ///
    /// Returns `InvalidArgument` for unknown architectures, zero-valued
    /// resources, or a space both included and excluded.
    pub fn validate(&self) -> Result<()> {
        if let Some(arch) = &self.arch {
            if !KNOWN_ARCHES.contains(&arch.as_str()) {
                return Err(StateError::invalid(format!(
                    "invalid constraint arch {:?}",
                    arch
                )));
            }
        }
        for (name, value) in [
            ("cores", self.cores),
            ("mem", self.mem_mib),
            ("root-disk", self.root_disk_mib),
        ] {
            if value == Some(0) {
                return Err(StateError::invalid(format!(
                    "invalid constraint {}: must be positive",
                    name
                )));
            }
        }
        let included = self.included_spaces();
        for space in self.spaces.iter().flatten() {
            if let Some(excluded) = space.strip_prefix('^') {
                if included.contains(&excluded) {
                    return Err(StateError::invalid(format!(
                        "invalid constraint spaces: {:?} both included and excluded",
                        excluded
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Constraints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(arch) = &self.arch {
            parts.push(format!("arch={}", arch));
        }
        if let Some(cores) = self.cores {
            parts.push(format!("cores={}", cores));
        }
        if let Some(mem) = self.mem_mib {
            parts.push(format!("mem={}M", mem));
        }
        if let Some(disk) = self.root_disk_mib {
            parts.push(format!("root-disk={}M", disk));
        }
        if let Some(spaces) = &self.spaces {
            parts.push(format!("spaces={}", spaces.join(",")));
        }
        if let Some(tags) = &self.tags {
            parts.push(format!("tags={}", tags.join(",")));
        }
        f.write_str(&parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let cons = Constraints {
            arch: Some("amd64".into()),
            mem_mib: Some(4096),
            spaces: Some(vec!["db".into(), "^public".into()]),
            ..Default::default()
        };
        assert_eq!(cons.to_string(), "arch=amd64 mem=4096M spaces=db,^public");
        assert_eq!(cons.included_spaces(), vec!["db"]);
    }

    #[test]
    fn test_validate_rejects_contradictory_spaces() {
        let cons = Constraints {
            spaces: Some(vec!["db".into(), "^db".into()]),
            ..Default::default()
        };
        assert!(cons.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_arch_and_zero_mem() {
        let cons = Constraints {
            arch: Some("vax".into()),
            ..Default::default()
        };
        assert!(cons.validate().is_err());

        let cons = Constraints {
            mem_mib: Some(0),
            ..Default::default()
        };
        assert!(cons.validate().is_err());
    }
}
