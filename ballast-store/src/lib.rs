//! Ballast Store - object-metadata storage seams.
//!
//! The migration engine never touches disk itself; it talks to two narrow
//! traits defined here:
//!
//! - [`MetadataStore`]: the commit path for object existence metadata
//!   (used when applying rebalance delta sets and live writes).
//! - [`SnapshotSource`]: produces a consistent point-in-time view of one
//!   SM token's object-metadata entries.
//!
//! [`MemoryStore`] is the in-tree reference implementation, suitable for
//! embedding and for tests. A production deployment backs these traits
//! with its ordered key-value engine.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod memory;
mod store;

pub use memory::MemoryStore;
pub use store::{MetadataStore, ObjectInfo, SnapshotSource, StoreError, StoreResult, TokenSnapshot};
