//! Ballast Tests - integration tests for the migration engine.
//!
//! Tests are organized by scenario:
//!
//! - `migration_tests`: ordinary migrations driven by a placement change
//! - `resync_tests`: resync-on-restart, tie-breaks, and delivery-order
//!   permutations
//! - `retry_tests`: transient source failures and the retry timer
//!
//! **Support modules**:
//! - `harness`: an in-memory cluster shuttling engine outputs between
//!   nodes, with step-wise or run-to-quiescence delivery
//!
//! Unit tests live inline in each crate under `#[cfg(test)]`.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod harness;

#[cfg(test)]
mod migration_tests;
#[cfg(test)]
mod resync_tests;
