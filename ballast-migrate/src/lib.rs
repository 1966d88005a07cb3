//! Ballast Migrate - the SM token migration / resync engine.
//!
//! This crate coordinates the transfer and reconciliation of
//! content-addressed object ownership between storage nodes when the
//! cluster's data-placement table (DLT) changes: node addition, removal,
//! or resync after a node restart.
//!
//! # Protocol
//!
//! Migration toward one target DLT version proceeds one SM token at a time:
//!
//! 1. **Snapshot**: the destination snapshots its own view of the token.
//! 2. **Round 1**: the destination sends each source a filter set of what
//!    it already has; the source answers with delta sets of everything the
//!    destination is missing, computed against the source's own snapshot.
//! 3. **Round 2**: the destination pulls a second delta covering writes
//!    that landed on the source after its round-1 snapshot; the source
//!    starts mirroring live writes to the destination before answering,
//!    closing the race window.
//! 4. Tokens are marked ready and, once every SM token has finished both
//!    rounds, the one-shot completion handler fires.
//!
//! # Design
//!
//! The engine is sans-IO in the manner of a transfer coordinator: every
//! operation returns [`MigrationOutput`]s for the host transport to
//! deliver, and a host-driven [`MigrationManager::tick`] supplies the
//! retry timer. All engine state lives in one [`MigrationManager`] owned
//! by the storage-node process.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod client;
mod error;
mod executor;
mod inflight;
mod manager;
mod messages;
mod readiness;

pub use client::MigrationClient;
pub use error::{MigrationError, MigrationResult};
pub use executor::{ExecutorState, MigrationExecutor};
pub use manager::{
    CompletionHandler, MigrState, MigrationConfig, MigrationManager, SourceRebalanceStatus,
};
pub use messages::{
    ClientDone, DeltaEntry, FilterEntry, MigrationMessage, MigrationOutput, RebalanceDecline,
    RebalanceDeltaSet, RebalanceFilterSet, SecondRebalanceRequest, SourceNotReady, TokenFilter,
};
pub use readiness::ReadinessVector;
