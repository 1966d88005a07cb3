//! Storage traits and the snapshot view type.
//!
//! # Design
//!
//! The traits are synchronous and `Send + Sync`: the engine calls them from
//! whatever thread handles the triggering message, and implementations are
//! expected to be internally synchronized. Isolation during migration comes
//! from snapshot-then-diff, never from locking the whole store.

use std::fmt;

use ballast_core::{DltToken, ObjectId, SmToken};
use bytes::Bytes;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors from store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// An I/O error occurred.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// The operation that failed.
        operation: &'static str,
        /// Error description.
        message: String,
    },

    /// Data corruption was detected.
    #[error("corruption detected: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// The store cannot serve a snapshot for this token yet.
    ///
    /// Transient: the caller should retry later rather than abort.
    #[error("snapshot unavailable for {token}")]
    SnapshotUnavailable {
        /// The SM token whose snapshot was requested.
        token: SmToken,
    },
}

/// Existence metadata (and optionally payload) for one object.
///
/// A refcount of zero means the object is logically absent even if an
/// entry is still present; both sides of the migration protocol treat
/// zero-refcount entries as missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Number of live references to the object.
    pub refcount: u64,
    /// Object payload. May be empty for metadata-only entries.
    pub data: Bytes,
}

impl ObjectInfo {
    /// Creates object info with a payload.
    #[must_use]
    pub const fn new(refcount: u64, data: Bytes) -> Self {
        Self { refcount, data }
    }

    /// Creates metadata-only info with an empty payload.
    #[must_use]
    pub const fn metadata_only(refcount: u64) -> Self {
        Self {
            refcount,
            data: Bytes::new(),
        }
    }

    /// Returns true if the object is logically present.
    #[must_use]
    pub const fn exists(&self) -> bool {
        self.refcount > 0
    }
}

/// The commit path for object existence metadata.
pub trait MetadataStore: Send + Sync {
    /// Inserts or overwrites one object's metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store rejects the write.
    fn apply_object(&self, id: ObjectId, info: ObjectInfo) -> StoreResult<()>;

    /// Looks up one object's metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store fails; a missing object is
    /// `Ok(None)`.
    fn get_object(&self, id: ObjectId) -> StoreResult<Option<ObjectInfo>>;
}

/// Produces consistent point-in-time views of one SM token's entries.
pub trait SnapshotSource: Send + Sync {
    /// Takes a snapshot of all entries in `token`.
    ///
    /// The view is consistent: writes landing after the call do not appear
    /// in it. Release is dropping the returned value and must not block
    /// pending iteration elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SnapshotUnavailable`] if the token cannot be
    /// served yet (transient) or another error on hard failure.
    fn take_snapshot(&self, token: SmToken) -> StoreResult<TokenSnapshot>;
}

/// A consistent point-in-time view of one SM token's object entries.
///
/// Entries are sorted by object id. The snapshot owns its data; dropping
/// it releases the view.
#[derive(Debug, Clone)]
pub struct TokenSnapshot {
    sm_token: SmToken,
    entries: Vec<(ObjectId, ObjectInfo)>,
}

impl TokenSnapshot {
    /// Builds a snapshot from (already consistent) entries.
    ///
    /// Entries are sorted here so providers need not pre-sort.
    #[must_use]
    pub fn new(sm_token: SmToken, mut entries: Vec<(ObjectId, ObjectInfo)>) -> Self {
        entries.sort_by_key(|(id, _)| *id);
        Self { sm_token, entries }
    }

    /// Returns the SM token this snapshot covers.
    #[must_use]
    pub const fn sm_token(&self) -> SmToken {
        self.sm_token
    }

    /// Returns the number of entries in the view.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the view is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates all entries in object-id order.
    pub fn iter(&self) -> impl Iterator<Item = &(ObjectId, ObjectInfo)> {
        self.entries.iter()
    }

    /// Iterates the entries belonging to one DLT token.
    pub fn entries_for_token(
        &self,
        token: DltToken,
        dlt_bits: u32,
    ) -> impl Iterator<Item = &(ObjectId, ObjectInfo)> {
        self.entries
            .iter()
            .filter(move |(id, _)| id.dlt_token(dlt_bits) == token)
    }

    /// Looks up one object in the view.
    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<&ObjectInfo> {
        self.entries
            .binary_search_by_key(&id, |(entry_id, _)| *entry_id)
            .ok()
            .map(|index| &self.entries[index].1)
    }
}

impl fmt::Display for TokenSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "snapshot({}, {} entries)", self.sm_token, self.entries.len())
    }
}
