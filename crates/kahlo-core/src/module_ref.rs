// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! `"{name}@{version}"` module reference (§3 Module bundle).

use std::fmt;
use std::str::FromStr;

use semver::Version;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModuleRefError {
    #[error("module ref {0:?} is missing an '@version' suffix")]
    MissingVersion(String),
    #[error("module ref {0:?} has an invalid semver version: {1}")]
    InvalidVersion(String, String),
    #[error("module ref {0:?} has an empty name")]
    EmptyName(String),
}

/// A parsed `"{name}@{version}"` reference into the module store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    pub name: String,
    pub version: Version,
}

impl ModuleRef {
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self { name: name.into(), version }
    }
}

impl fmt::Display for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

impl FromStr for ModuleRef {
    type Err = ModuleRefError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, version) =
            s.rsplit_once('@').ok_or_else(|| ModuleRefError::MissingVersion(s.to_string()))?;
        if name.is_empty() {
            return Err(ModuleRefError::EmptyName(s.to_string()));
        }
        let version = Version::parse(version)
            .map_err(|e| ModuleRefError::InvalidVersion(s.to_string(), e.to_string()))?;
        Ok(ModuleRef { name: name.to_string(), version })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_version() {
        let r: ModuleRef = "hook-lib@1.2.3".parse().unwrap();
        assert_eq!(r.name, "hook-lib");
        assert_eq!(r.version, Version::new(1, 2, 3));
    }

    #[test]
    fn display_round_trips() {
        let r = ModuleRef::new("hook-lib", Version::new(1, 2, 3));
        assert_eq!(r.to_string(), "hook-lib@1.2.3");
        assert_eq!(r.to_string().parse::<ModuleRef>().unwrap(), r);
    }

    #[test]
    fn rejects_missing_version() {
        assert!(matches!("hook-lib".parse::<ModuleRef>(), Err(ModuleRefError::MissingVersion(_))));
    }

    #[test]
    fn rejects_invalid_version() {
        assert!(matches!(
            "hook-lib@not-semver".parse::<ModuleRef>(),
            Err(ModuleRefError::InvalidVersion(_, _))
        ));
    }

    #[test]
    fn rejects_empty_name() {
        assert!(matches!("@1.0.0".parse::<ModuleRef>(), Err(ModuleRefError::EmptyName(_))));
    }
}
