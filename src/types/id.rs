//! Identifier types for scheduler entities.
//!
//! Every identifier is scoped to the domain that allocated it: two domains
//! may legally hand out the same numeric value. `TaskId` pairs the owning
//! domain with the per-domain uid and is therefore globally unique.

use core::fmt;
use serde::{Deserialize, Serialize};

/// A parallel execution context backed by one OS thread.
///
/// Domain 0 is the domain that called [`run`](crate::run); worker domains
/// are numbered from 1.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DomainId(pub(crate) u32);

impl DomainId {
    /// The main domain, i.e. the one that called `run`.
    pub const MAIN: Self = Self(0);

    /// Returns true for the main domain.
    #[inline]
    #[must_use]
    pub const fn is_main(self) -> bool {
        self.0 == 0
    }

    /// Returns the numeric index of this domain.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DomainId({})", self.0)
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d{}", self.0)
    }
}

/// A per-domain monotonic task counter value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskUid(pub(crate) u64);

impl TaskUid {
    /// Returns the raw counter value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TaskUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskUid({})", self.0)
    }
}

impl fmt::Display for TaskUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// The globally unique identity of a task: owning domain plus domain-local uid.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    /// The domain whose executor owns the task's record.
    pub domain: DomainId,
    /// The uid allocated from that domain's counter.
    pub uid: TaskUid,
}

impl TaskId {
    #[inline]
    #[must_use]
    pub(crate) const fn new(domain: DomainId, uid: TaskUid) -> Self {
        Self { domain, uid }
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({}:{})", self.domain.0, self.uid.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}:{}]", self.domain.0, self.uid.0)
    }
}

/// Identifier of a user-defined suspension point.
///
/// Only valid on the domain that created it; the numeric value may repeat
/// on other domains.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyscallUid(pub(crate) u64);

impl SyscallUid {
    /// Returns the raw counter value.
    #[inline]
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for SyscallUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyscallUid({})", self.0)
    }
}

impl fmt::Display for SyscallUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// Identifier of an owned resource registered with [`own`](crate::own).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceUid(pub(crate) u64);

impl fmt::Debug for ResourceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResourceUid({})", self.0)
    }
}

impl fmt::Display for ResourceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_id_main() {
        assert!(DomainId::MAIN.is_main());
        assert!(!DomainId(1).is_main());
        assert_eq!(DomainId::MAIN.index(), 0);
    }

    #[test]
    fn display_formats() {
        assert_eq!(format!("{}", DomainId(2)), "d2");
        assert_eq!(format!("{}", TaskUid(7)), "t7");
        assert_eq!(format!("{}", SyscallUid(3)), "s3");
        assert_eq!(format!("{}", ResourceUid(9)), "r9");
        assert_eq!(format!("{}", TaskId::new(DomainId(1), TaskUid(4))), "[1:4]");
    }

    #[test]
    fn task_id_ordering_and_equality() {
        let a = TaskId::new(DomainId(0), TaskUid(1));
        let b = TaskId::new(DomainId(0), TaskUid(2));
        let c = TaskId::new(DomainId(1), TaskUid(1));
        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, TaskId::new(DomainId(0), TaskUid(1)));
    }

    #[test]
    fn serde_roundtrip() {
        let id = TaskId::new(DomainId(3), TaskUid(11));
        let json = serde_json::to_string(&id).expect("serialize");
        let back: TaskId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, back);
    }
}
