//! Destination-side migration session driver.
//!
//! One `MigrationExecutor` exists per (SM token, source node) pair. It
//! accumulates the DLT tokens assigned to that pair, drives the two-round
//! rebalance protocol against the source, and reports round completion to
//! the manager.

use std::collections::BTreeSet;

use ballast_core::{DltToken, DltVersion, ExecutorId, NodeId, SmToken};
use ballast_store::{MetadataStore, TokenSnapshot};
use tracing::{debug, warn};

use crate::error::{MigrationError, MigrationResult};
use crate::messages::{
    FilterEntry, RebalanceDeltaSet, RebalanceFilterSet, SecondRebalanceRequest, TokenFilter,
};

/// State of a destination-side migration session.
///
/// `Round1Active` is re-enterable through the timer-driven retry path;
/// every other transition is one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Accumulating DLT tokens; no round started.
    Created,
    /// Round-1 filter sets sent, awaiting delta sets.
    Round1Active,
    /// Round 1 complete, waiting for round 2 to be scheduled.
    Round1Done,
    /// Round-2 delta request sent, awaiting delta sets.
    Round2Active,
    /// Both rounds complete (or the whole session was declined).
    Round2Done,
}

/// Destination-side per-(SM-token, source) migration session.
#[derive(Debug)]
pub struct MigrationExecutor {
    id: ExecutorId,
    source: NodeId,
    sm_token: SmToken,
    target_version: DltVersion,
    for_resync: bool,
    dlt_tokens: BTreeSet<DltToken>,
    declined: BTreeSet<DltToken>,
    state: ExecutorState,
    /// Next delta-set sequence number expected from the source.
    expected_delta_seq: u64,
}

impl MigrationExecutor {
    /// Creates a session in the `Created` state.
    #[must_use]
    pub fn new(
        id: ExecutorId,
        source: NodeId,
        sm_token: SmToken,
        target_version: DltVersion,
        for_resync: bool,
    ) -> Self {
        Self {
            id,
            source,
            sm_token,
            target_version,
            for_resync,
            dlt_tokens: BTreeSet::new(),
            declined: BTreeSet::new(),
            state: ExecutorState::Created,
            expected_delta_seq: 1,
        }
    }

    /// Returns the session identifier.
    #[must_use]
    pub const fn id(&self) -> ExecutorId {
        self.id
    }

    /// Returns the source node this session pulls from.
    #[must_use]
    pub const fn source(&self) -> NodeId {
        self.source
    }

    /// Returns the SM token this session covers.
    #[must_use]
    pub const fn sm_token(&self) -> SmToken {
        self.sm_token
    }

    /// Returns the current state.
    #[must_use]
    pub const fn state(&self) -> ExecutorState {
        self.state
    }

    /// Returns the DLT tokens this session is responsible for.
    #[must_use]
    pub const fn dlt_tokens(&self) -> &BTreeSet<DltToken> {
        &self.dlt_tokens
    }

    /// Returns true if this session covers `token`.
    #[must_use]
    pub fn responsible_for_dlt_token(&self, token: DltToken) -> bool {
        self.dlt_tokens.contains(&token)
    }

    /// Adds a DLT token to this session's responsibility.
    ///
    /// Idempotent for duplicates. All tokens must be accumulated before
    /// the first round starts.
    ///
    /// # Errors
    ///
    /// Returns an internal protocol error if a round already started.
    pub fn add_dlt_token(&mut self, token: DltToken) -> MigrationResult<()> {
        if self.state != ExecutorState::Created {
            return Err(MigrationError::InternalProtocol {
                detail: format!("{}: token added after round start", self.id),
            });
        }
        self.dlt_tokens.insert(token);
        Ok(())
    }

    /// Starts round 1: builds the filter-set messages for the source from
    /// the destination's own snapshot.
    ///
    /// # Errors
    ///
    /// Returns an internal protocol error if called out of the `Created`
    /// state; use [`Self::start_object_rebalance_again`] for retries.
    pub fn start_object_rebalance(
        &mut self,
        snapshot: &TokenSnapshot,
        dlt_bits: u32,
        max_entries: u32,
    ) -> MigrationResult<Vec<RebalanceFilterSet>> {
        if self.state != ExecutorState::Created {
            return Err(MigrationError::InternalProtocol {
                detail: format!("{}: round 1 started twice", self.id),
            });
        }
        self.state = ExecutorState::Round1Active;
        self.expected_delta_seq = 1;
        debug!(executor = %self.id, sm_token = %self.sm_token, "Starting round 1");
        Ok(self.build_filter_sets(snapshot, dlt_bits, max_entries))
    }

    /// Restarts round 1 after a transient source failure (retry path).
    ///
    /// Same semantics as [`Self::start_object_rebalance`] against a
    /// re-derived snapshot.
    ///
    /// # Errors
    ///
    /// Returns an internal protocol error unless round 1 is active.
    pub fn start_object_rebalance_again(
        &mut self,
        snapshot: &TokenSnapshot,
        dlt_bits: u32,
        max_entries: u32,
    ) -> MigrationResult<Vec<RebalanceFilterSet>> {
        if self.state != ExecutorState::Round1Active {
            return Err(MigrationError::InternalProtocol {
                detail: format!("{}: retry outside round 1", self.id),
            });
        }
        self.expected_delta_seq = 1;
        debug!(executor = %self.id, sm_token = %self.sm_token, "Retrying round 1");
        Ok(self.build_filter_sets(snapshot, dlt_bits, max_entries))
    }

    /// Records a source decline for the given tokens.
    ///
    /// Returns true if the decline now covers the whole session, in which
    /// case the session completes without any data movement.
    pub fn handle_decline(&mut self, tokens: &[DltToken]) -> bool {
        for &token in tokens {
            if self.dlt_tokens.contains(&token) {
                self.declined.insert(token);
            } else {
                warn!(executor = %self.id, %token, "Decline for token outside responsibility");
            }
        }
        if self.declined.len() == self.dlt_tokens.len() && !self.dlt_tokens.is_empty() {
            debug!(executor = %self.id, "All tokens declined; session complete");
            self.state = ExecutorState::Round2Done;
            return true;
        }
        false
    }

    /// Applies one delta-set batch from the source.
    ///
    /// Returns true when the batch was the final one of the current round.
    /// Batches for the wrong round or out of sequence are dropped with a
    /// warning: they can only be late or duplicated messages from a
    /// previous attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if committing an entry to the store fails.
    pub fn apply_rebalance_delta_set<S: MetadataStore>(
        &mut self,
        store: &S,
        msg: &RebalanceDeltaSet,
    ) -> MigrationResult<bool> {
        let expected_state = match msg.round {
            1 => ExecutorState::Round1Active,
            2 => ExecutorState::Round2Active,
            _ => {
                warn!(executor = %self.id, round = msg.round, "Delta set with unknown round");
                return Ok(false);
            }
        };
        if self.state != expected_state {
            warn!(
                executor = %self.id,
                state = ?self.state,
                round = msg.round,
                "Dropping delta set for inactive round"
            );
            return Ok(false);
        }
        if msg.seq != self.expected_delta_seq {
            warn!(
                executor = %self.id,
                seq = msg.seq,
                expected = self.expected_delta_seq,
                "Dropping out-of-sequence delta set"
            );
            return Ok(false);
        }

        for entry in &msg.objects {
            // Zero-refcount entries are logically absent; nothing to commit.
            if entry.info.exists() {
                store.apply_object(entry.object, entry.info.clone())?;
            }
        }

        if msg.last {
            self.state = match msg.round {
                1 => ExecutorState::Round1Done,
                _ => ExecutorState::Round2Done,
            };
            self.expected_delta_seq = 1;
            debug!(executor = %self.id, round = msg.round, "Round complete");
            return Ok(true);
        }
        self.expected_delta_seq += 1;
        Ok(false)
    }

    /// Starts round 2: requests the post-snapshot delta from the source.
    ///
    /// # Errors
    ///
    /// Returns an internal protocol error unless round 1 is done.
    pub fn start_second_rebalance_round(&mut self) -> MigrationResult<SecondRebalanceRequest> {
        if self.state != ExecutorState::Round1Done {
            return Err(MigrationError::InternalProtocol {
                detail: format!("{}: round 2 before round 1 done", self.id),
            });
        }
        self.state = ExecutorState::Round2Active;
        self.expected_delta_seq = 1;
        debug!(executor = %self.id, sm_token = %self.sm_token, "Starting round 2");
        Ok(SecondRebalanceRequest {
            executor_id: self.id,
            sm_token: self.sm_token,
            target_version: self.target_version,
        })
    }

    /// Returns whether the given round has completed for this session.
    #[must_use]
    pub const fn is_round_done(&self, first_round: bool) -> bool {
        if first_round {
            matches!(
                self.state,
                ExecutorState::Round1Done | ExecutorState::Round2Active | ExecutorState::Round2Done
            )
        } else {
            matches!(self.state, ExecutorState::Round2Done)
        }
    }

    fn build_filter_sets(
        &self,
        snapshot: &TokenSnapshot,
        dlt_bits: u32,
        max_entries: u32,
    ) -> Vec<RebalanceFilterSet> {
        let max = max_entries.max(1) as usize;

        // Every responsible token appears at least once, even with an
        // empty filter, so the source knows the full requested set.
        let mut pieces: Vec<TokenFilter> = Vec::new();
        for &token in &self.dlt_tokens {
            let entries: Vec<FilterEntry> = snapshot
                .entries_for_token(token, dlt_bits)
                .filter(|(_, info)| info.exists())
                .map(|(object, info)| FilterEntry {
                    object: *object,
                    refcount: info.refcount,
                })
                .collect();
            if entries.is_empty() {
                pieces.push(TokenFilter {
                    token,
                    objects: Vec::new(),
                });
            } else {
                for chunk in entries.chunks(max) {
                    pieces.push(TokenFilter {
                        token,
                        objects: chunk.to_vec(),
                    });
                }
            }
        }

        // Pack pieces into messages of at most `max` entries each.
        let mut messages: Vec<RebalanceFilterSet> = Vec::new();
        let mut current: Vec<TokenFilter> = Vec::new();
        let mut current_entries = 0usize;
        for piece in pieces {
            if !current.is_empty() && current_entries + piece.objects.len() > max {
                messages.push(self.filter_message(std::mem::take(&mut current)));
                current_entries = 0;
            }
            current_entries += piece.objects.len();
            current.push(piece);
        }
        messages.push(self.filter_message(current));

        let count = messages.len() as u64;
        for (index, message) in messages.iter_mut().enumerate() {
            message.seq = index as u64 + 1;
            message.last = index as u64 + 1 == count;
        }
        messages
    }

    const fn filter_message(&self, tokens: Vec<TokenFilter>) -> RebalanceFilterSet {
        RebalanceFilterSet {
            executor_id: self.id,
            sm_token: self.sm_token,
            target_version: self.target_version,
            for_resync: self.for_resync,
            seq: 0,
            last: false,
            tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_core::{ObjectId, OBJECT_ID_LEN};
    use ballast_store::{MemoryStore, ObjectInfo};

    fn object(head: u8) -> ObjectId {
        let mut digest = [0u8; OBJECT_ID_LEN];
        digest[0] = head;
        ObjectId::new(digest)
    }

    fn executor() -> MigrationExecutor {
        let mut executor = MigrationExecutor::new(
            ExecutorId::compose(NodeId::new(2), 1),
            NodeId::new(1),
            SmToken::new(0),
            DltVersion::new(2),
            false,
        );
        // 8 DLT bits: tokens 0x00 and 0x01 both map to SM token 0.
        executor.add_dlt_token(DltToken::new(0)).unwrap();
        executor.add_dlt_token(DltToken::new(1)).unwrap();
        executor
    }

    fn store() -> MemoryStore {
        let mut limits = ballast_core::Limits::new();
        limits.dlt_token_bits = 8;
        limits.sm_token_bits = 4;
        MemoryStore::new(limits)
    }

    fn delta(executor_id: ExecutorId, round: u32, seq: u64, last: bool) -> RebalanceDeltaSet {
        RebalanceDeltaSet {
            executor_id,
            sm_token: SmToken::new(0),
            round,
            seq,
            last,
            objects: vec![crate::messages::DeltaEntry {
                object: object(0x01),
                info: ObjectInfo::metadata_only(1),
            }],
        }
    }

    #[test]
    fn test_add_token_after_start_fails() {
        let mut executor = executor();
        let snapshot = TokenSnapshot::new(SmToken::new(0), vec![]);
        executor.start_object_rebalance(&snapshot, 8, 100).unwrap();

        assert!(executor.add_dlt_token(DltToken::new(2)).is_err());
    }

    #[test]
    fn test_filter_sets_cover_empty_tokens() {
        let mut executor = executor();
        let snapshot = TokenSnapshot::new(
            SmToken::new(0),
            vec![(object(0x01), ObjectInfo::metadata_only(2))],
        );

        let messages = executor.start_object_rebalance(&snapshot, 8, 100).unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].last);
        assert_eq!(messages[0].seq, 1);

        // Token 0 has no entries but still appears; token 1 has one entry.
        let tokens: Vec<DltToken> = messages[0].tokens.iter().map(|t| t.token).collect();
        assert_eq!(tokens, vec![DltToken::new(0), DltToken::new(1)]);
        assert!(messages[0].tokens[0].objects.is_empty());
        assert_eq!(messages[0].tokens[1].objects.len(), 1);
    }

    #[test]
    fn test_filter_sets_split_by_max_entries() {
        let mut executor = executor();
        let entries: Vec<_> = (0..10u8)
            .map(|low| {
                let mut digest = [0u8; OBJECT_ID_LEN];
                digest[0] = 0x01;
                digest[19] = low;
                (ObjectId::new(digest), ObjectInfo::metadata_only(1))
            })
            .collect();
        let snapshot = TokenSnapshot::new(SmToken::new(0), entries);

        let messages = executor.start_object_rebalance(&snapshot, 8, 4).unwrap();
        assert!(messages.len() >= 3, "10 entries at 4 per message");
        assert!(messages.last().unwrap().last);
        assert!(!messages[0].last);
        let seqs: Vec<u64> = messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, (1..=messages.len() as u64).collect::<Vec<_>>());
    }

    #[test]
    fn test_round_lifecycle() {
        let mut executor = executor();
        let store = store();
        let snapshot = TokenSnapshot::new(SmToken::new(0), vec![]);
        executor.start_object_rebalance(&snapshot, 8, 100).unwrap();
        assert_eq!(executor.state(), ExecutorState::Round1Active);
        assert!(!executor.is_round_done(true));

        let done = executor
            .apply_rebalance_delta_set(&store, &delta(executor.id(), 1, 1, true))
            .unwrap();
        assert!(done);
        assert_eq!(executor.state(), ExecutorState::Round1Done);
        assert!(executor.is_round_done(true));
        assert!(!executor.is_round_done(false));
        assert!(store.contains_live(object(0x01)));

        let request = executor.start_second_rebalance_round().unwrap();
        assert_eq!(request.sm_token, SmToken::new(0));
        assert_eq!(executor.state(), ExecutorState::Round2Active);

        let done = executor
            .apply_rebalance_delta_set(&store, &delta(executor.id(), 2, 1, true))
            .unwrap();
        assert!(done);
        assert!(executor.is_round_done(false));
    }

    #[test]
    fn test_out_of_sequence_delta_dropped() {
        let mut executor = executor();
        let store = store();
        let snapshot = TokenSnapshot::new(SmToken::new(0), vec![]);
        executor.start_object_rebalance(&snapshot, 8, 100).unwrap();

        // seq 2 before seq 1: dropped, round still active.
        let done = executor
            .apply_rebalance_delta_set(&store, &delta(executor.id(), 1, 2, true))
            .unwrap();
        assert!(!done);
        assert_eq!(executor.state(), ExecutorState::Round1Active);
    }

    #[test]
    fn test_wrong_round_delta_dropped() {
        let mut executor = executor();
        let store = store();
        let snapshot = TokenSnapshot::new(SmToken::new(0), vec![]);
        executor.start_object_rebalance(&snapshot, 8, 100).unwrap();

        let done = executor
            .apply_rebalance_delta_set(&store, &delta(executor.id(), 2, 1, true))
            .unwrap();
        assert!(!done);
        assert_eq!(executor.state(), ExecutorState::Round1Active);
    }

    #[test]
    fn test_full_decline_completes_session() {
        let mut executor = executor();
        let snapshot = TokenSnapshot::new(SmToken::new(0), vec![]);
        executor.start_object_rebalance(&snapshot, 8, 100).unwrap();

        assert!(!executor.handle_decline(&[DltToken::new(0)]));
        assert!(executor.handle_decline(&[DltToken::new(1)]));
        assert!(executor.is_round_done(true));
        assert!(executor.is_round_done(false));
    }

    #[test]
    fn test_retry_resets_sequence() {
        let mut executor = executor();
        let store = store();
        let snapshot = TokenSnapshot::new(SmToken::new(0), vec![]);
        executor.start_object_rebalance(&snapshot, 8, 100).unwrap();

        // Partial progress, then retry restarts the sequence.
        executor
            .apply_rebalance_delta_set(&store, &delta(executor.id(), 1, 1, false))
            .unwrap();
        let messages = executor
            .start_object_rebalance_again(&snapshot, 8, 100)
            .unwrap();
        assert_eq!(messages[0].seq, 1);

        let done = executor
            .apply_rebalance_delta_set(&store, &delta(executor.id(), 1, 1, false))
            .unwrap();
        assert!(!done);
    }
}
