//! Messages and outputs of the migration protocol.
//!
//! Every message carries the destination-allocated [`ExecutorId`] that
//! correlates request/response pairs across the network. Multi-part
//! payloads (filter sets, delta sets) carry a per-round sequence number
//! and a last-message flag so either side can detect the end of a round
//! even when a set is split across messages.
//!
//! The engine never performs IO; it returns [`MigrationOutput`]s for the
//! host transport layer to deliver.

use ballast_core::{DltToken, DltVersion, ExecutorId, NodeId, ObjectId, SmToken};
use ballast_store::ObjectInfo;

/// A message of the migration protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationMessage {
    /// Destination → source: what the destination already has (round 1).
    RebalanceFilterSet(RebalanceFilterSet),
    /// Source → destination: tokens the source refuses to serve.
    RebalanceDecline(RebalanceDecline),
    /// Source → destination: objects the destination is missing.
    RebalanceDeltaSet(RebalanceDeltaSet),
    /// Destination → source: request the post-snapshot delta (round 2).
    SecondRebalanceRequest(SecondRebalanceRequest),
    /// Source → destination: the source cannot snapshot this token yet.
    SourceNotReady(SourceNotReady),
    /// Destination → source: the session is over, drop its client.
    ClientDone(ClientDone),
}

impl MigrationMessage {
    /// Returns the executor ID this message belongs to.
    #[must_use]
    pub const fn executor_id(&self) -> ExecutorId {
        match self {
            Self::RebalanceFilterSet(msg) => msg.executor_id,
            Self::RebalanceDecline(msg) => msg.executor_id,
            Self::RebalanceDeltaSet(msg) => msg.executor_id,
            Self::SecondRebalanceRequest(msg) => msg.executor_id,
            Self::SourceNotReady(msg) => msg.executor_id,
            Self::ClientDone(msg) => msg.executor_id,
        }
    }
}

/// One object the destination already knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterEntry {
    /// The object identifier.
    pub object: ObjectId,
    /// The destination's refcount for it.
    pub refcount: u64,
}

/// The filter entries for one DLT token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenFilter {
    /// The DLT token.
    pub token: DltToken,
    /// Objects the destination already holds in this token.
    pub objects: Vec<FilterEntry>,
}

/// Round-1 request: the destination's object-existence view.
///
/// A large view is split across several messages sharing one `executor_id`;
/// `seq` starts at 1 per round attempt and `last` marks the final part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceFilterSet {
    /// The requesting destination session.
    pub executor_id: ExecutorId,
    /// The SM token being rebalanced.
    pub sm_token: SmToken,
    /// The target DLT version of the migration.
    pub target_version: DltVersion,
    /// Whether this is a resync-on-restart run.
    pub for_resync: bool,
    /// Sequence number within this round attempt (starts at 1).
    pub seq: u64,
    /// True on the final message of the set.
    pub last: bool,
    /// Per-token filter entries in this part.
    pub tokens: Vec<TokenFilter>,
}

/// Source refusal to serve specific DLT tokens (resync tie-break).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceDecline {
    /// The destination session being answered.
    pub executor_id: ExecutorId,
    /// The SM token of the session.
    pub sm_token: SmToken,
    /// The declined tokens.
    pub tokens: Vec<DltToken>,
    /// True if every token of the session was declined.
    pub all_declined: bool,
}

/// One object pushed by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaEntry {
    /// The object identifier.
    pub object: ObjectId,
    /// Its metadata and payload.
    pub info: ObjectInfo,
}

/// A batch of objects the destination is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceDeltaSet {
    /// The destination session being answered.
    pub executor_id: ExecutorId,
    /// The SM token of the session.
    pub sm_token: SmToken,
    /// Rebalance round this batch belongs to (1 or 2).
    pub round: u32,
    /// Sequence number within the round (starts at 1).
    pub seq: u64,
    /// True on the final batch of the round. A round with nothing to send
    /// still carries one empty final batch.
    pub last: bool,
    /// The objects in this batch.
    pub objects: Vec<DeltaEntry>,
}

/// Round-2 request: everything changed since the round-1 snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecondRebalanceRequest {
    /// The requesting destination session.
    pub executor_id: ExecutorId,
    /// The SM token being rebalanced.
    pub sm_token: SmToken,
    /// The target DLT version of the migration.
    pub target_version: DltVersion,
}

/// The source's snapshot for this token is not available yet.
///
/// Transient: the destination queues the token for a timer-driven retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceNotReady {
    /// The destination session being answered.
    pub executor_id: ExecutorId,
    /// The SM token that could not be served.
    pub sm_token: SmToken,
}

/// The destination no longer needs the source-side client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientDone {
    /// The finished session.
    pub executor_id: ExecutorId,
}

/// Output actions for the host transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutput {
    /// Deliver a protocol message to a peer node.
    SendMessage {
        /// The peer to deliver to.
        to: NodeId,
        /// The message.
        message: MigrationMessage,
    },
    /// Mirror a live write to a migration destination.
    ///
    /// The host must apply the write at `to` through its normal write path
    /// and report completion via `MigrationManager::forward_completed`.
    ForwardWrite {
        /// The destination node.
        to: NodeId,
        /// The session on whose behalf the write is mirrored.
        executor_id: ExecutorId,
        /// The written object.
        object: ObjectId,
        /// Its metadata and payload.
        info: ObjectInfo,
    },
    /// Mirror a live add-reference request to a migration destination.
    ForwardAddRef {
        /// The destination node.
        to: NodeId,
        /// The session on whose behalf the request is mirrored.
        executor_id: ExecutorId,
        /// The DLT token the batch belongs to.
        token: DltToken,
        /// The referenced objects.
        objects: Vec<ObjectId>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use ballast_core::OBJECT_ID_LEN;

    fn executor() -> ExecutorId {
        ExecutorId::compose(NodeId::new(2), 7)
    }

    #[test]
    fn test_message_executor_id() {
        let msg = MigrationMessage::SecondRebalanceRequest(SecondRebalanceRequest {
            executor_id: executor(),
            sm_token: SmToken::new(0),
            target_version: DltVersion::new(2),
        });
        assert_eq!(msg.executor_id(), executor());

        let msg = MigrationMessage::ClientDone(ClientDone {
            executor_id: executor(),
        });
        assert_eq!(msg.executor_id(), executor());
    }

    #[test]
    fn test_delta_set_last_flag() {
        let batch = RebalanceDeltaSet {
            executor_id: executor(),
            sm_token: SmToken::new(1),
            round: 1,
            seq: 1,
            last: true,
            objects: vec![DeltaEntry {
                object: ObjectId::new([0u8; OBJECT_ID_LEN]),
                info: ObjectInfo::metadata_only(1),
            }],
        };
        assert!(batch.last);
        assert_eq!(batch.objects.len(), 1);
    }
}
