//! Ballast Core - Strongly-typed identifiers and token math for Ballast.
//!
//! This crate provides the identifier types shared by every Ballast crate:
//! node identities, placement-table versions, migration-session identifiers,
//! and the object-id / token arithmetic that partitions the content-addressed
//! object space.
//!
//! # Design Principles (TigerStyle)
//!
//! - **Strongly-typed IDs**: Prevent mixing up NodeId with DltVersion
//! - **Explicit limits**: Every resource has a bounded maximum
//! - **Explicit types**: Use u32/u64, not usize
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod limits;
mod tokens;
mod types;

pub use limits::{Limits, LimitsError};
pub use tokens::{sm_token_of, DltToken, ObjectId, SmToken, OBJECT_ID_LEN};
pub use types::{DltVersion, ExecutorId, NodeId};
