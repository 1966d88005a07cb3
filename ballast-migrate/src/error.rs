//! Migration engine error types.

use ballast_core::{DltToken, DltVersion, ExecutorId, SmToken};
use ballast_store::StoreError;
use thiserror::Error;

/// Result type for migration operations.
pub type MigrationResult<T> = Result<T, MigrationError>;

/// Errors that can occur during migration operations.
///
/// The taxonomy matters: [`MigrationError::SourceNotReady`] is transient
/// and feeds the retry timer, [`MigrationError::SourceDeclined`] is benign
/// and expected during resync, and everything else aborts the whole
/// migration run (never the process).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MigrationError {
    /// A migration toward a different target version is already running.
    #[error("migration already in progress toward {current}, rejected {requested}")]
    AlreadyInProgress {
        /// The in-progress target version.
        current: DltVersion,
        /// The rejected target version.
        requested: DltVersion,
    },

    /// `start_migration` was called with no work to do.
    #[error("no token groups to migrate")]
    NothingToMigrate,

    /// The token bit widths are unusable.
    #[error("invalid token bits: dlt={dlt_bits} sm={sm_bits}")]
    InvalidTokenBits {
        /// Bits per DLT token from the start command.
        dlt_bits: u32,
        /// Configured bits per SM token.
        sm_bits: u32,
    },

    /// The source declined serving a DLT token (resync tie-break).
    ///
    /// Benign: the declining side had lower ownership priority; the
    /// destination marks the token ready without data movement.
    #[error("source declined {token} for {executor_id}")]
    SourceDeclined {
        /// The migration session.
        executor_id: ExecutorId,
        /// The declined token.
        token: DltToken,
    },

    /// The source cannot serve an SM token yet.
    ///
    /// Transient: the token enters the retry set and is attempted again on
    /// the next timer tick.
    #[error("source not ready to serve {token}")]
    SourceNotReady {
        /// The SM token the source could not snapshot yet.
        token: SmToken,
    },

    /// A store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A "should never happen" condition was detected.
    ///
    /// Aborts only the current migration run, never the process.
    #[error("internal protocol error: {detail}")]
    InternalProtocol {
        /// What went wrong.
        detail: String,
    },

    /// The migration run was aborted.
    #[error("migration aborted: {reason}")]
    Aborted {
        /// Why the run was aborted.
        reason: String,
    },
}

impl MigrationError {
    /// Returns true if this error should enter the retry path rather than
    /// abort the migration.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::SourceNotReady { .. })
    }

    /// Returns true if this error is expected protocol flow, not a failure.
    #[must_use]
    pub const fn is_benign(&self) -> bool {
        matches!(self, Self::SourceDeclined { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_core::NodeId;

    #[test]
    fn test_error_taxonomy() {
        let transient = MigrationError::SourceNotReady {
            token: SmToken::new(3),
        };
        assert!(transient.is_transient());
        assert!(!transient.is_benign());

        let benign = MigrationError::SourceDeclined {
            executor_id: ExecutorId::compose(NodeId::new(1), 1),
            token: DltToken::new(0),
        };
        assert!(benign.is_benign());
        assert!(!benign.is_transient());

        let fatal = MigrationError::InternalProtocol {
            detail: "missing response entry".to_string(),
        };
        assert!(!fatal.is_transient());
        assert!(!fatal.is_benign());
    }

    #[test]
    fn test_store_error_conversion() {
        let err: MigrationError = StoreError::SnapshotUnavailable {
            token: SmToken::new(1),
        }
        .into();
        assert!(matches!(err, MigrationError::Store(_)));
    }
}
