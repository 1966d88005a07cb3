//! In-memory reference implementation of the store seams.

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use ballast_core::{Limits, ObjectId, SmToken};

use crate::store::{MetadataStore, ObjectInfo, SnapshotSource, StoreResult, TokenSnapshot};

/// An in-memory object-metadata store.
///
/// Backed by a `BTreeMap` under a reader/writer lock. Snapshots are taken
/// by copying the token's entries under the read lock, which gives the
/// consistent point-in-time view without blocking writers afterwards.
///
/// Used as the reference implementation in embedded deployments and as the
/// store in tests.
#[derive(Debug)]
pub struct MemoryStore {
    limits: Limits,
    objects: RwLock<BTreeMap<ObjectId, ObjectInfo>>,
}

impl MemoryStore {
    /// Creates an empty store.
    ///
    /// # Panics
    ///
    /// Panics if `limits` fail validation.
    #[must_use]
    pub fn new(limits: Limits) -> Self {
        assert!(limits.validate().is_ok(), "invalid limits");
        Self {
            limits,
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// Returns the configured limits.
    #[must_use]
    pub const fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Returns the number of stored entries, including zero-refcount ones.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.read_guard().len()
    }

    /// Returns true if the object exists with a live refcount.
    #[must_use]
    pub fn contains_live(&self, id: ObjectId) -> bool {
        self.read_guard().get(&id).is_some_and(ObjectInfo::exists)
    }

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<ObjectId, ObjectInfo>> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<ObjectId, ObjectInfo>> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MetadataStore for MemoryStore {
    fn apply_object(&self, id: ObjectId, info: ObjectInfo) -> StoreResult<()> {
        self.write_guard().insert(id, info);
        Ok(())
    }

    fn get_object(&self, id: ObjectId) -> StoreResult<Option<ObjectInfo>> {
        Ok(self.read_guard().get(&id).cloned())
    }
}

impl SnapshotSource for MemoryStore {
    fn take_snapshot(&self, token: SmToken) -> StoreResult<TokenSnapshot> {
        let dlt_bits = self.limits.dlt_token_bits;
        let sm_bits = self.limits.sm_token_bits;
        let entries: Vec<(ObjectId, ObjectInfo)> = self
            .read_guard()
            .iter()
            .filter(|(id, _)| id.sm_token(dlt_bits, sm_bits) == token)
            .map(|(id, info)| (*id, info.clone()))
            .collect();
        Ok(TokenSnapshot::new(token, entries))
    }
}
