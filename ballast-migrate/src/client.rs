//! Source-side migration session driver.
//!
//! One `MigrationClient` exists per destination executor ID. It collects
//! the destination's filter sets, answers each round with delta sets
//! computed against its own snapshots, and gates live-write forwarding
//! during round 2.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use ballast_core::{DltToken, DltVersion, ExecutorId, NodeId, ObjectId, SmToken};
use ballast_store::TokenSnapshot;
use tracing::{debug, warn};

use crate::error::{MigrationError, MigrationResult};
use crate::inflight::Inflight;
use crate::messages::{DeltaEntry, RebalanceDeltaSet, RebalanceFilterSet};

/// Source-side per-executor migration session.
#[derive(Debug)]
pub struct MigrationClient {
    executor_id: ExecutorId,
    dest: NodeId,
    sm_token: SmToken,
    target_version: DltVersion,
    for_resync: bool,
    accepted: BTreeSet<DltToken>,
    declined: BTreeSet<DltToken>,
    /// The destination's existence view, merged across filter-set parts.
    filter: BTreeMap<ObjectId, u64>,
    got_last_filter: bool,
    /// Round-2 cut point: the snapshot round 1 was answered from.
    first_snapshot: Option<TokenSnapshot>,
    /// Set before the round-2 diff is computed so no write can land
    /// between the diff and the first mirrored write.
    forwarding: AtomicBool,
    inflight: Inflight,
}

impl MigrationClient {
    /// Creates a session from the first filter set's header fields.
    #[must_use]
    pub fn new(
        executor_id: ExecutorId,
        dest: NodeId,
        sm_token: SmToken,
        target_version: DltVersion,
        for_resync: bool,
    ) -> Self {
        Self {
            executor_id,
            dest,
            sm_token,
            target_version,
            for_resync,
            accepted: BTreeSet::new(),
            declined: BTreeSet::new(),
            filter: BTreeMap::new(),
            got_last_filter: false,
            first_snapshot: None,
            forwarding: AtomicBool::new(false),
            inflight: Inflight::new(),
        }
    }

    /// Returns the session identifier.
    #[must_use]
    pub const fn executor_id(&self) -> ExecutorId {
        self.executor_id
    }

    /// Returns the destination node of this session.
    #[must_use]
    pub const fn dest(&self) -> NodeId {
        self.dest
    }

    /// Returns the SM token this session covers.
    #[must_use]
    pub const fn sm_token(&self) -> SmToken {
        self.sm_token
    }

    /// Returns the target DLT version of the migration run.
    #[must_use]
    pub const fn target_version(&self) -> DltVersion {
        self.target_version
    }

    /// Returns whether this session belongs to a resync run.
    #[must_use]
    pub const fn for_resync(&self) -> bool {
        self.for_resync
    }

    /// Returns the tokens this source accepted to serve.
    #[must_use]
    pub const fn accepted_tokens(&self) -> &BTreeSet<DltToken> {
        &self.accepted
    }

    /// Returns the tokens this source declined.
    #[must_use]
    pub const fn declined_tokens(&self) -> &BTreeSet<DltToken> {
        &self.declined
    }

    /// Ingests one filter-set part from the destination.
    ///
    /// `accept` decides, once per newly seen DLT token, whether this
    /// source serves it; a refusal is final for the session. Returns the
    /// tokens newly declined by this part, for the decline answer.
    pub fn ingest_filter(
        &mut self,
        msg: &RebalanceFilterSet,
        mut accept: impl FnMut(DltToken) -> bool,
    ) -> Vec<DltToken> {
        let mut newly_declined = Vec::new();
        for token_filter in &msg.tokens {
            let token = token_filter.token;
            if !self.accepted.contains(&token) && !self.declined.contains(&token) {
                if accept(token) {
                    self.accepted.insert(token);
                } else {
                    debug!(executor = %self.executor_id, %token, "Declining token");
                    self.declined.insert(token);
                    newly_declined.push(token);
                }
            }
            if self.accepted.contains(&token) {
                for entry in &token_filter.objects {
                    self.filter.insert(entry.object, entry.refcount);
                }
            }
        }
        if msg.last {
            self.got_last_filter = true;
        }
        newly_declined
    }

    /// Returns true once the full filter arrived and every token of the
    /// session was declined.
    #[must_use]
    pub fn all_declined(&self) -> bool {
        self.got_last_filter && self.accepted.is_empty()
    }

    /// Returns true once the full filter arrived.
    #[must_use]
    pub const fn filter_complete(&self) -> bool {
        self.got_last_filter
    }

    /// Answers round 1: diffs the source snapshot against the
    /// destination's filter and keeps the snapshot as the round-2 cut
    /// point.
    ///
    /// # Errors
    ///
    /// Returns an internal protocol error if the filter is incomplete.
    pub fn finish_first_phase(
        &mut self,
        snapshot: TokenSnapshot,
        dlt_bits: u32,
        max_entries: u32,
    ) -> MigrationResult<Vec<RebalanceDeltaSet>> {
        if !self.got_last_filter {
            return Err(MigrationError::InternalProtocol {
                detail: format!("{}: round 1 answered before full filter", self.executor_id),
            });
        }
        let entries: Vec<DeltaEntry> = snapshot
            .iter()
            .filter(|(id, info)| {
                info.exists()
                    && self.accepted.contains(&id.dlt_token(dlt_bits))
                    && self.filter.get(id) != Some(&info.refcount)
            })
            .map(|(id, info)| DeltaEntry {
                object: *id,
                info: info.clone(),
            })
            .collect();
        debug!(
            executor = %self.executor_id,
            sm_token = %self.sm_token,
            entries = entries.len(),
            "Answering round 1"
        );
        self.first_snapshot = Some(snapshot);
        Ok(self.batch_deltas(1, entries, max_entries))
    }

    /// Answers round 2: enables live-write forwarding, then diffs a fresh
    /// snapshot against the round-1 cut point.
    ///
    /// # Errors
    ///
    /// Returns an internal protocol error if round 1 was never answered.
    pub fn start_rebalance_second_phase(
        &mut self,
        fresh: &TokenSnapshot,
        dlt_bits: u32,
        max_entries: u32,
    ) -> MigrationResult<Vec<RebalanceDeltaSet>> {
        let Some(cut) = self.first_snapshot.as_ref() else {
            return Err(MigrationError::InternalProtocol {
                detail: format!("{}: round 2 before round 1", self.executor_id),
            });
        };

        // Forwarding must be live before the diff is taken: a write landing
        // after the fresh snapshot is then guaranteed to be mirrored.
        self.forwarding.store(true, Ordering::Release);

        let entries: Vec<DeltaEntry> = fresh
            .iter()
            .filter(|(id, info)| {
                info.exists()
                    && self.accepted.contains(&id.dlt_token(dlt_bits))
                    && cut.get(*id) != Some(info)
            })
            .map(|(id, info)| DeltaEntry {
                object: *id,
                info: info.clone(),
            })
            .collect();
        debug!(
            executor = %self.executor_id,
            sm_token = %self.sm_token,
            entries = entries.len(),
            "Answering round 2"
        );
        Ok(self.batch_deltas(2, entries, max_entries))
    }

    /// Hot-path gate for mirroring a live write.
    ///
    /// Returns true if the write to `token` must be forwarded to the
    /// destination, recording it as in flight. The host must report the
    /// mirrored write's completion back.
    #[must_use]
    pub fn try_forward(&self, token: DltToken) -> bool {
        if !self.forwarding.load(Ordering::Acquire) {
            return false;
        }
        if !self.accepted.contains(&token) {
            return false;
        }
        self.inflight.begin();
        true
    }

    /// Records the completion of one mirrored request.
    pub fn forward_completed(&self) {
        self.inflight.complete();
    }

    /// Returns true if no mirrored request is still outstanding. The
    /// session must not be freed before this holds.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.inflight.is_idle()
    }

    fn batch_deltas(
        &self,
        round: u32,
        entries: Vec<DeltaEntry>,
        max_entries: u32,
    ) -> Vec<RebalanceDeltaSet> {
        let max = max_entries.max(1) as usize;
        let mut batches: Vec<Vec<DeltaEntry>> = if entries.is_empty() {
            // A round with nothing to send still carries one final batch.
            vec![Vec::new()]
        } else {
            entries.chunks(max).map(<[DeltaEntry]>::to_vec).collect()
        };
        let count = batches.len() as u64;
        if count > 1 {
            warn!(
                executor = %self.executor_id,
                round,
                batches = count,
                "Splitting delta set"
            );
        }
        batches
            .drain(..)
            .enumerate()
            .map(|(index, objects)| RebalanceDeltaSet {
                executor_id: self.executor_id,
                sm_token: self.sm_token,
                round,
                seq: index as u64 + 1,
                last: index as u64 + 1 == count,
                objects,
            })
            .collect()
    }
}
