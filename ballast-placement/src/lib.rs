//! Ballast Placement - the data-placement table (DLT).
//!
//! The DLT maps every fine-grained placement token to an ordered list of
//! owning storage nodes at a given table version. The migration engine
//! consumes it read-only: to group resync work by source node and to
//! resolve the deterministic source-responsibility tie-break.
//!
//! # Design (`TigerStyle`)
//!
//! - **Deterministic lookups**: Owner order is fixed by the table, never
//!   by message arrival order
//! - **Explicit limits**: Token space is bounded by the table's bit width
//! - **Read-only input**: The engine never mutates a published table

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod table;

pub use table::{accept_source_responsibility, Dlt, PlacementError};
