// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Kahlo Contributors

//! Event-stream cursor codec (§4.2): `v1:<t|j>:<id>:<seq>`.

use thiserror::Error;

/// Which kind of stream a cursor addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Target,
    Job,
}

impl Scope {
    fn tag(self) -> &'static str {
        match self {
            Scope::Target => "t",
            Scope::Job => "j",
        }
    }

    fn parse_tag(s: &str) -> Option<Self> {
        match s {
            "t" => Some(Scope::Target),
            "j" => Some(Scope::Job),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("malformed cursor: {0:?}")]
    Malformed(String),
}

/// A position within one event stream. Opaque to callers as a string, but
/// strongly typed internally so the pipeline never has to re-parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub scope: Scope,
    pub id: String,
    pub seq: u64,
}

impl Cursor {
    pub fn new(scope: Scope, id: impl Into<String>, seq: u64) -> Self {
        Self { scope, id: id.into(), seq }
    }

    /// Parse a cursor string produced by [`Cursor::encode`] or [`ToString`].
    pub fn parse(s: &str) -> Result<Self, CursorError> {
        // v1:<t|j>:<id>:<seq> — id itself may not contain ':' (nanoid-based IDs don't).
        let mut parts = s.splitn(4, ':');
        let version = parts.next().ok_or_else(|| CursorError::Malformed(s.to_string()))?;
        if version != "v1" {
            return Err(CursorError::Malformed(s.to_string()));
        }
        let tag = parts.next().ok_or_else(|| CursorError::Malformed(s.to_string()))?;
        let scope = Scope::parse_tag(tag).ok_or_else(|| CursorError::Malformed(s.to_string()))?;
        let id = parts.next().ok_or_else(|| CursorError::Malformed(s.to_string()))?;
        let seq_str = parts.next().ok_or_else(|| CursorError::Malformed(s.to_string()))?;
        let seq: u64 = seq_str.parse().map_err(|_| CursorError::Malformed(s.to_string()))?;
        if id.is_empty() {
            return Err(CursorError::Malformed(s.to_string()));
        }
        Ok(Cursor { scope, id: id.to_string(), seq })
    }

    pub fn encode(&self) -> String {
        format!("v1:{}:{}:{}", self.scope.tag(), self.id, self.seq)
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_target_scope() {
        let c = Cursor::new(Scope::Target, "targABC", 42);
        let encoded = c.encode();
        assert_eq!(encoded, "v1:t:targABC:42");
        assert_eq!(Cursor::parse(&encoded).unwrap(), c);
    }

    #[test]
    fn round_trips_job_scope() {
        let c = Cursor::new(Scope::Job, "job-XYZ", 0);
        assert_eq!(Cursor::parse(&c.encode()).unwrap(), c);
    }

    #[test]
    fn rejects_bad_version() {
        assert!(Cursor::parse("v2:t:id:1").is_err());
    }

    #[test]
    fn rejects_bad_scope_tag() {
        assert!(Cursor::parse("v1:x:id:1").is_err());
    }

    #[test]
    fn rejects_non_numeric_seq() {
        assert!(Cursor::parse("v1:t:id:notanumber").is_err());
    }

    #[test]
    fn rejects_empty_id() {
        assert!(Cursor::parse("v1:t::1").is_err());
    }

    #[test]
    fn rejects_missing_parts() {
        assert!(Cursor::parse("v1:t:id").is_err());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_scope() -> impl Strategy<Value = Scope> {
            prop_oneof![Just(Scope::Target), Just(Scope::Job)]
        }

        // §8 "Round-trip/idempotence laws": parse(makeCursor(scope, id, seq))
        // == (scope, id, seq) for every valid (scope, id, seq).
        proptest! {
            #[test]
            fn encode_parse_round_trips(
                scope in arb_scope(),
                id in "[a-zA-Z0-9_-]{1,40}",
                seq in any::<u64>(),
            ) {
                let cursor = Cursor::new(scope, id, seq);
                let parsed = Cursor::parse(&cursor.encode()).expect("encoded cursor always parses");
                prop_assert_eq!(parsed, cursor);
            }
        }
    }
}
