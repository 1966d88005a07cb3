//! The DLT: placement tokens mapped to ordered owner lists.
//!
//! A node's position in a token's owner list is its ownership priority:
//! position 0 is the primary. The order is part of the published table and
//! identical on every node, which is what makes the source-responsibility
//! tie-break convergent.

use std::collections::{BTreeMap, BTreeSet};

use ballast_core::{DltToken, DltVersion, NodeId};

/// A published data-placement table at one version.
///
/// Maps each DLT token to the ordered list of nodes that own it. The table
/// is immutable once published; the cluster controller builds a new table
/// (with a higher version) for every placement change.
#[derive(Debug, Clone)]
pub struct Dlt {
    /// Table version, monotonically increasing across publications.
    version: DltVersion,
    /// Number of object-id bits per token; token space is `2^bits`.
    num_bits_per_token: u32,
    /// Owner lists keyed by token index. Tokens absent here are unowned.
    owners: BTreeMap<u32, Vec<NodeId>>,
}

impl Dlt {
    /// Creates an empty table.
    #[must_use]
    pub const fn new(version: DltVersion, num_bits_per_token: u32) -> Self {
        Self {
            version,
            num_bits_per_token,
            owners: BTreeMap::new(),
        }
    }

    /// Creates a table spreading tokens across `nodes` round-robin.
    ///
    /// Token `t` gets an owner list of up to `replicas` nodes starting at
    /// `nodes[t % nodes.len()]` and wrapping. Useful for tests and small
    /// deployments.
    ///
    /// # Panics
    ///
    /// Panics if `nodes` is empty or `replicas` is zero.
    #[must_use]
    pub fn round_robin(
        version: DltVersion,
        num_bits_per_token: u32,
        nodes: &[NodeId],
        replicas: usize,
    ) -> Self {
        assert!(!nodes.is_empty(), "nodes cannot be empty");
        assert!(replicas > 0, "replicas must be positive");

        let mut table = Self::new(version, num_bits_per_token);
        let depth = replicas.min(nodes.len());
        for token in 0..table.token_count() {
            let start = token as usize % nodes.len();
            let list: Vec<NodeId> = (0..depth)
                .map(|i| nodes[(start + i) % nodes.len()])
                .collect();
            table.owners.insert(token, list);
        }
        table
    }

    /// Returns the table version.
    #[must_use]
    pub const fn version(&self) -> DltVersion {
        self.version
    }

    /// Returns the number of object-id bits per token.
    #[must_use]
    pub const fn num_bits_per_token(&self) -> u32 {
        self.num_bits_per_token
    }

    /// Returns the size of the token space (`2^bits`).
    #[must_use]
    pub const fn token_count(&self) -> u32 {
        1 << self.num_bits_per_token
    }

    /// Assigns the ordered owner list for a token.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is out of range, the list is empty,
    /// or a node appears twice.
    pub fn set_owners(&mut self, token: DltToken, nodes: Vec<NodeId>) -> Result<(), PlacementError> {
        if token.get() >= self.token_count() {
            return Err(PlacementError::TokenOutOfRange {
                token,
                count: self.token_count(),
            });
        }
        if nodes.is_empty() {
            return Err(PlacementError::NoOwners { token });
        }
        let unique: BTreeSet<NodeId> = nodes.iter().copied().collect();
        if unique.len() != nodes.len() {
            return Err(PlacementError::DuplicateOwner { token });
        }

        self.owners.insert(token.get(), nodes);
        Ok(())
    }

    /// Returns the ordered owner list for a token (empty if unowned).
    #[must_use]
    pub fn owners_for_token(&self, token: DltToken) -> &[NodeId] {
        self.owners.get(&token.get()).map_or(&[], Vec::as_slice)
    }

    /// Returns the ownership priority of `node` for `token`.
    ///
    /// Position 0 is the primary. `None` if the node does not own the token.
    #[must_use]
    pub fn owner_position(&self, token: DltToken, node: NodeId) -> Option<u32> {
        self.owners_for_token(token)
            .iter()
            .position(|&owner| owner == node)
            .map(|pos| {
                #[allow(clippy::cast_possible_truncation)]
                {
                    pos as u32
                }
            })
    }

    /// Returns all tokens owned by `node`.
    #[must_use]
    pub fn tokens_owned_by(&self, node: NodeId) -> BTreeSet<DltToken> {
        self.owners
            .iter()
            .filter(|(_, list)| list.contains(&node))
            .map(|(&token, _)| DltToken::new(token))
            .collect()
    }

    /// Derives the resync source map for `node`: for every token the node
    /// owns alongside at least one other node, the best-positioned other
    /// owner is chosen as the sync source.
    ///
    /// Tokens solely owned by `node` have no source and are omitted. Both
    /// primaries and replicas get a source; two nodes may therefore each
    /// select the other for the same token, which the source-responsibility
    /// tie-break resolves.
    #[must_use]
    pub fn source_candidates_for(&self, node: NodeId) -> BTreeMap<NodeId, BTreeSet<DltToken>> {
        let mut groups: BTreeMap<NodeId, BTreeSet<DltToken>> = BTreeMap::new();
        for (&token, list) in &self.owners {
            if !list.contains(&node) {
                continue;
            }
            if let Some(&source) = list.iter().find(|&&owner| owner != node) {
                groups.entry(source).or_default().insert(DltToken::new(token));
            }
        }
        groups
    }
}

/// Decides whether `source` should accept serving `token` data to `dest`.
///
/// Used during resync when two nodes can each believe they need data from
/// the other for the same token. The rule is a pure function of the
/// table's fixed owner order: the node with the better (smaller) position
/// keeps source responsibility; the other must decline. Exactly one of the
/// two directions accepts, regardless of message arrival order.
///
/// A node missing from the owner list has no ownership claim to weigh, so
/// the source accepts by default.
#[must_use]
pub fn accept_source_responsibility(
    table: &Dlt,
    token: DltToken,
    source: NodeId,
    dest: NodeId,
) -> bool {
    match (
        table.owner_position(token, source),
        table.owner_position(token, dest),
    ) {
        (Some(source_pos), Some(dest_pos)) => source_pos < dest_pos,
        // No tie to break unless both sides own the token.
        _ => true,
    }
}

/// Errors from placement-table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementError {
    /// Token index is outside the table's token space.
    TokenOutOfRange {
        /// The offending token.
        token: DltToken,
        /// The table's token count.
        count: u32,
    },
    /// An owner list must name at least one node.
    NoOwners {
        /// The token with an empty list.
        token: DltToken,
    },
    /// A node may appear at most once in an owner list.
    DuplicateOwner {
        /// The token with a duplicated owner.
        token: DltToken,
    },
}

impl std::fmt::Display for PlacementError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TokenOutOfRange { token, count } => {
                write!(f, "token {token} out of range (token count {count})")
            }
            Self::NoOwners { token } => write!(f, "empty owner list for token {token}"),
            Self::DuplicateOwner { token } => {
                write!(f, "duplicate owner in list for token {token}")
            }
        }
    }
}

impl std::error::Error for PlacementError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[u64]) -> Vec<NodeId> {
        ids.iter().copied().map(NodeId::new).collect()
    }

    #[test]
    fn test_set_and_lookup_owners() {
        let mut table = Dlt::new(DltVersion::new(1), 4);
        table
            .set_owners(DltToken::new(3), nodes(&[10, 20, 30]))
            .unwrap();

        assert_eq!(table.owners_for_token(DltToken::new(3)), nodes(&[10, 20, 30]));
        assert!(table.owners_for_token(DltToken::new(4)).is_empty());
    }

    #[test]
    fn test_owner_position() {
        let mut table = Dlt::new(DltVersion::new(1), 4);
        table
            .set_owners(DltToken::new(0), nodes(&[10, 20]))
            .unwrap();

        assert_eq!(table.owner_position(DltToken::new(0), NodeId::new(10)), Some(0));
        assert_eq!(table.owner_position(DltToken::new(0), NodeId::new(20)), Some(1));
        assert_eq!(table.owner_position(DltToken::new(0), NodeId::new(30)), None);
    }

    #[test]
    fn test_invalid_owner_lists() {
        let mut table = Dlt::new(DltVersion::new(1), 2);

        assert!(matches!(
            table.set_owners(DltToken::new(4), nodes(&[1])),
            Err(PlacementError::TokenOutOfRange { .. })
        ));
        assert!(matches!(
            table.set_owners(DltToken::new(0), vec![]),
            Err(PlacementError::NoOwners { .. })
        ));
        assert!(matches!(
            table.set_owners(DltToken::new(0), nodes(&[1, 1])),
            Err(PlacementError::DuplicateOwner { .. })
        ));
    }

    #[test]
    fn test_round_robin_covers_all_tokens() {
        let table = Dlt::round_robin(DltVersion::new(2), 4, &nodes(&[1, 2, 3]), 2);

        assert_eq!(table.token_count(), 16);
        for token in 0..16 {
            let list = table.owners_for_token(DltToken::new(token));
            assert_eq!(list.len(), 2, "token {token} owner depth");
        }
    }

    #[test]
    fn test_source_candidates_skip_solo_tokens() {
        let mut table = Dlt::new(DltVersion::new(1), 2);
        table.set_owners(DltToken::new(0), nodes(&[1])).unwrap();
        table.set_owners(DltToken::new(1), nodes(&[1, 2])).unwrap();
        table.set_owners(DltToken::new(2), nodes(&[2, 1])).unwrap();
        table.set_owners(DltToken::new(3), nodes(&[2, 3])).unwrap();

        let groups = table.source_candidates_for(NodeId::new(1));

        // Token 0 is solo; token 3 is not owned by node 1.
        let expected: BTreeSet<DltToken> =
            [DltToken::new(1), DltToken::new(2)].into_iter().collect();
        assert_eq!(
            groups.get(&NodeId::new(2)),
            Some(&expected),
            "both shared tokens source from node 2"
        );
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn test_tie_break_exactly_one_accepts() {
        let mut table = Dlt::new(DltVersion::new(1), 2);
        table.set_owners(DltToken::new(0), nodes(&[1, 2])).unwrap();

        let token = DltToken::new(0);
        let a = NodeId::new(1);
        let b = NodeId::new(2);

        let a_serves_b = accept_source_responsibility(&table, token, a, b);
        let b_serves_a = accept_source_responsibility(&table, token, b, a);

        assert!(a_serves_b);
        assert!(!b_serves_a);
    }

    #[test]
    fn test_tie_break_converges_for_all_owner_orderings() {
        // For every ordering of a three-node owner list and every pair of
        // owners, exactly one direction accepts source responsibility.
        let orderings: [[u64; 3]; 6] = [
            [1, 2, 3],
            [1, 3, 2],
            [2, 1, 3],
            [2, 3, 1],
            [3, 1, 2],
            [3, 2, 1],
        ];
        for ordering in orderings {
            let mut table = Dlt::new(DltVersion::new(1), 2);
            table.set_owners(DltToken::new(0), nodes(&ordering)).unwrap();

            for &a in &ordering {
                for &b in &ordering {
                    if a == b {
                        continue;
                    }
                    let a_serves = accept_source_responsibility(
                        &table,
                        DltToken::new(0),
                        NodeId::new(a),
                        NodeId::new(b),
                    );
                    let b_serves = accept_source_responsibility(
                        &table,
                        DltToken::new(0),
                        NodeId::new(b),
                        NodeId::new(a),
                    );
                    assert_ne!(
                        a_serves, b_serves,
                        "order {ordering:?}: exactly one of {a},{b} must serve"
                    );
                }
            }
        }
    }

    #[test]
    fn test_tie_break_without_shared_ownership_accepts() {
        let mut table = Dlt::new(DltVersion::new(1), 2);
        table.set_owners(DltToken::new(0), nodes(&[1])).unwrap();

        // Destination is not an owner: nothing to decline.
        assert!(accept_source_responsibility(
            &table,
            DltToken::new(0),
            NodeId::new(1),
            NodeId::new(9)
        ));
    }
}
