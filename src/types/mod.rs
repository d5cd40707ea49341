//! Core identifier types used throughout the scheduler.

pub mod id;

pub use id::{DomainId, ResourceUid, SyscallUid, TaskId, TaskUid};
