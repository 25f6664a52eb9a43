//! Work item identifier.
//!
//! ULID-backed so ids sort by creation time and can be generated without
//! coordination. The id exists for correlation in logs and metric sinks; the
//! engine itself never branches on it.

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkId(Ulid);

impl WorkId {
    /// Mint a fresh id.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "work-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_prefix() {
        let id = WorkId::new();
        assert!(id.to_string().starts_with("work-"));
    }

    #[test]
    fn ids_sort_by_creation_time() {
        let a = WorkId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = WorkId::new();
        assert!(a < b);
    }

    #[test]
    fn serde_roundtrip() {
        let id = WorkId::new();
        let s = serde_json::to_string(&id).unwrap();
        let back: WorkId = serde_json::from_str(&s).unwrap();
        assert_eq!(id, back);
    }
}
