//! Endpoint to space binding resolution
//!
//! Bindings map every endpoint a charm declares, plus the application
//! default key `""`, to a space id. Resolution precedence:
//!
//! - `""`: caller override, then the prior default, then the model default
//! - endpoint: caller override, then the prior binding when the endpoint
//!   existed before, then the resolved `""`

use std::collections::BTreeSet;

use crate::catalog::SpaceCatalog;
use crate::errors::{Result, StateError};
use crate::model::Bindings;

/// Key holding the application's default space
pub const DEFAULT_BINDING: &str = "";

fn check_spaces(bindings: &Bindings, spaces: &dyn SpaceCatalog) -> Result<()> {
    for (endpoint, space) in bindings {
        if !spaces.space_exists(space) {
            let target = if endpoint.is_empty() {
                "default binding".to_string()
            } else {
                format!("endpoint {:?}", endpoint)
            };
            return Err(StateError::InvalidBindings {
                message: format!("{} bound to unknown space {:?}", target, space),
            });
        }
    }
    Ok(())
}

fn check_known_endpoints(endpoints: &BTreeSet<String>, overrides: &Bindings) -> Result<()> {
    for endpoint in overrides.keys() {
        if endpoint != DEFAULT_BINDING && !endpoints.contains(endpoint) {
            return Err(StateError::InvalidBindings {
                message: format!("endpoint {:?} not found", endpoint),
            });
        }
    }
    Ok(())
}

/// Resolve the full binding set for `endpoints`
///
/// `prior` is the binding set in force before an upgrade; entries for
/// endpoints the new charm no longer declares are dropped.
///
/// # Errors
///
/// Returns `InvalidBindings` when an override names an unknown endpoint or
/// any resolved space is not in the catalog.
pub fn resolve_bindings(
    endpoints: &BTreeSet<String>,
    overrides: &Bindings,
    prior: Option<&Bindings>,
    default_space: &str,
    spaces: &dyn SpaceCatalog,
) -> Result<Bindings> {
    check_known_endpoints(endpoints, overrides)?;

    let default = overrides
        .get(DEFAULT_BINDING)
        .or_else(|| prior.and_then(|p| p.get(DEFAULT_BINDING)))
        .cloned()
        .unwrap_or_else(|| default_space.to_string());

    let mut resolved = Bindings::new();
    for endpoint in endpoints {
        let space = overrides
            .get(endpoint)
            .or_else(|| prior.and_then(|p| p.get(endpoint)))
            .cloned()
            .unwrap_or_else(|| default.clone());
        resolved.insert(endpoint.clone(), space);
    }
    resolved.insert(DEFAULT_BINDING.to_string(), default);

    check_spaces(&resolved, spaces)?;
    Ok(resolved)
}

/// Apply explicit changes to an existing binding set
///
/// Changing `""` moves every endpoint that followed the old default and is
/// not itself named in `changes`.
///
/// # Errors
///
/// Returns `InvalidBindings` for unknown endpoints or spaces.
pub fn merge_bindings(
    current: &Bindings,
    changes: &Bindings,
    endpoints: &BTreeSet<String>,
    spaces: &dyn SpaceCatalog,
) -> Result<Bindings> {
    check_known_endpoints(endpoints, changes)?;

    let mut merged = current.clone();
    if let Some(new_default) = changes.get(DEFAULT_BINDING) {
        let old_default = current.get(DEFAULT_BINDING);
        for (endpoint, space) in merged.iter_mut() {
            if Some(&*space) == old_default && !changes.contains_key(endpoint) {
                *space = new_default.clone();
            }
        }
        merged.insert(DEFAULT_BINDING.to_string(), new_default.clone());
    }
    for (endpoint, space) in changes {
        merged.insert(endpoint.clone(), space.clone());
    }

    check_spaces(&merged, spaces)?;
    Ok(merged)
}

/// Endpoints (not `""`) bound to a different space in `after`
pub fn changed_endpoints(before: &Bindings, after: &Bindings) -> Vec<String> {
    after
        .iter()
        .filter(|(ep, space)| !ep.is_empty() && before.get(*ep) != Some(*space))
        .map(|(ep, _)| ep.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::StaticSpaces;
    use proptest::prelude::*;

    fn spaces() -> StaticSpaces {
        StaticSpaces::new(["0", "db", "public", "internal"])
    }

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn bindings(pairs: &[(&str, &str)]) -> Bindings {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_to_model_space() {
        let got = resolve_bindings(&set(&["db", "admin"]), &Bindings::new(), None, "0", &spaces())
            .unwrap();
        assert_eq!(got, bindings(&[("", "0"), ("admin", "0"), ("db", "0")]));
    }

    #[test]
    fn test_override_default_applies_to_unbound_endpoints() {
        let got = resolve_bindings(
            &set(&["db", "admin"]),
            &bindings(&[("", "internal"), ("db", "db")]),
            None,
            "0",
            &spaces(),
        )
        .unwrap();
        assert_eq!(got, bindings(&[("", "internal"), ("admin", "internal"), ("db", "db")]));
    }

    #[test]
    fn test_prior_kept_for_surviving_endpoints_only() {
        let prior = bindings(&[("", "internal"), ("db", "db"), ("old", "public")]);
        let got = resolve_bindings(&set(&["db", "new"]), &Bindings::new(), Some(&prior), "0", &spaces())
            .unwrap();
        assert_eq!(got, bindings(&[("", "internal"), ("db", "db"), ("new", "internal")]));
    }

    #[test]
    fn test_unknown_endpoint_rejected() {
        let err = resolve_bindings(
            &set(&["db"]),
            &bindings(&[("nope", "db")]),
            None,
            "0",
            &spaces(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "invalid bindings: endpoint \"nope\" not found");
    }

    #[test]
    fn test_unknown_space_rejected() {
        let err = resolve_bindings(&set(&["db"]), &bindings(&[("db", "mars")]), None, "0", &spaces())
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidBindings { .. }));
    }

    #[test]
    fn test_merge_moves_followers_of_default() {
        let current = bindings(&[("", "0"), ("admin", "0"), ("db", "db")]);
        let merged = merge_bindings(
            &current,
            &bindings(&[("", "internal")]),
            &set(&["admin", "db"]),
            &spaces(),
        )
        .unwrap();
        assert_eq!(merged, bindings(&[("", "internal"), ("admin", "internal"), ("db", "db")]));
        assert_eq!(changed_endpoints(&current, &merged), vec!["admin".to_string()]);
    }

    proptest! {
        #[test]
        fn prop_resolved_covers_exactly_endpoints(
            endpoints in proptest::collection::btree_set("[a-z]{1,6}", 0..6),
            pick_override in any::<bool>(),
        ) {
            let mut overrides = Bindings::new();
            if pick_override {
                if let Some(first) = endpoints.iter().next() {
                    overrides.insert(first.clone(), "db".to_string());
                }
            }
            let got = resolve_bindings(&endpoints, &overrides, None, "0", &spaces()).unwrap();

            let mut expected_keys = endpoints.clone();
            expected_keys.insert(String::new());
            let keys: BTreeSet<String> = got.keys().cloned().collect();
            prop_assert_eq!(keys, expected_keys);
            for (ep, space) in &overrides {
                prop_assert_eq!(got.get(ep), Some(space));
            }
        }
    }
}
