//! In-memory cluster harness for migration integration tests.
//!
//! Each node is a [`MigrationManager`] over a [`MemoryStore`]. Engine
//! outputs are queued as envelopes and delivered either in FIFO order
//! (`run_until_quiet`), one at a time (`step`), or in a randomized
//! interleaving that preserves per-channel FIFO order (`run_randomized`),
//! matching the ordered-transport assumption of the protocol.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use ballast_core::{DltToken, DltVersion, NodeId, ObjectId};
use ballast_migrate::{CompletionHandler, MigrationConfig, MigrationManager, MigrationOutput};
use ballast_placement::Dlt;
use ballast_store::{MemoryStore, MetadataStore, ObjectInfo, SnapshotSource, StoreError, StoreResult, TokenSnapshot};

/// Deterministic xorshift PRNG for randomized delivery orders.
pub struct XorShift {
    state: u64,
}

impl XorShift {
    /// Creates a generator from a nonzero seed.
    #[must_use]
    pub const fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9E37_79B9 } else { seed },
        }
    }

    /// Returns the next pseudo-random u64.
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Returns a value in `0..bound`.
    ///
    /// # Panics
    ///
    /// Panics if `bound` is zero.
    pub fn next_below(&mut self, bound: usize) -> usize {
        assert!(bound > 0, "bound must be positive");
        (self.next_u64() % bound as u64) as usize
    }
}

/// Resolution state of a completion handler: 0 pending, 1 ok, -1 error.
pub type CompletionFlag = Arc<AtomicI32>;

/// Builds a completion handler and the flag it resolves.
#[must_use]
pub fn completion_flag() -> (CompletionHandler, CompletionFlag) {
    let flag: CompletionFlag = Arc::new(AtomicI32::new(0));
    let handle = Arc::clone(&flag);
    let handler: CompletionHandler = Box::new(move |result| {
        handle.store(if result.is_ok() { 1 } else { -1 }, Ordering::SeqCst);
    });
    (handler, flag)
}

/// A snapshot source that fails transiently before recovering.
///
/// The first `failures` snapshot calls answer "unavailable"; everything
/// else delegates to the wrapped store.
pub struct FlakySnapshotStore {
    inner: MemoryStore,
    remaining_failures: AtomicI32,
}

impl FlakySnapshotStore {
    /// Wraps `inner`, failing the first `failures` snapshot calls.
    #[must_use]
    pub const fn new(inner: MemoryStore, failures: i32) -> Self {
        Self {
            inner,
            remaining_failures: AtomicI32::new(failures),
        }
    }

    /// Returns the wrapped store.
    #[must_use]
    pub const fn inner(&self) -> &MemoryStore {
        &self.inner
    }
}

impl MetadataStore for FlakySnapshotStore {
    fn apply_object(&self, id: ObjectId, info: ObjectInfo) -> StoreResult<()> {
        self.inner.apply_object(id, info)
    }

    fn get_object(&self, id: ObjectId) -> StoreResult<Option<ObjectInfo>> {
        self.inner.get_object(id)
    }
}

impl SnapshotSource for FlakySnapshotStore {
    fn take_snapshot(&self, token: ballast_core::SmToken) -> StoreResult<TokenSnapshot> {
        if self.remaining_failures.fetch_sub(1, Ordering::SeqCst) > 0 {
            return Err(StoreError::SnapshotUnavailable { token });
        }
        self.inner.take_snapshot(token)
    }
}

/// One queued engine output awaiting delivery.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// The node that emitted the output.
    pub from: NodeId,
    /// The output to deliver.
    pub output: MigrationOutput,
}

impl Envelope {
    fn destination(&self) -> NodeId {
        match &self.output {
            MigrationOutput::SendMessage { to, .. }
            | MigrationOutput::ForwardWrite { to, .. }
            | MigrationOutput::ForwardAddRef { to, .. } => *to,
        }
    }
}

struct Node {
    manager: MigrationManager<MemoryStore>,
    store: Arc<MemoryStore>,
}

/// An in-memory cluster of migration managers sharing one table.
pub struct Cluster {
    table: Dlt,
    nodes: BTreeMap<NodeId, Node>,
    queue: VecDeque<Envelope>,
}

impl Cluster {
    /// Builds a cluster with one manager per node over `table`.
    #[must_use]
    pub fn new(table: Dlt, node_ids: &[u64]) -> Self {
        let config = MigrationConfig::for_testing();
        let nodes = node_ids
            .iter()
            .map(|&id| {
                let store = Arc::new(MemoryStore::new(config.limits));
                let manager =
                    MigrationManager::new(NodeId::new(id), config, Arc::clone(&store));
                (NodeId::new(id), Node { manager, store })
            })
            .collect();
        Self {
            table,
            nodes,
            queue: VecDeque::new(),
        }
    }

    /// Returns the shared placement table.
    #[must_use]
    pub const fn table(&self) -> &Dlt {
        &self.table
    }

    /// Returns a node's manager.
    ///
    /// # Panics
    ///
    /// Panics if the node does not exist.
    #[must_use]
    pub fn manager(&self, node: u64) -> &MigrationManager<MemoryStore> {
        &self.nodes[&NodeId::new(node)].manager
    }

    /// Returns a node's store.
    ///
    /// # Panics
    ///
    /// Panics if the node does not exist.
    #[must_use]
    pub fn store(&self, node: u64) -> &MemoryStore {
        &self.nodes[&NodeId::new(node)].store
    }

    /// Writes a metadata-only object directly into a node's store.
    ///
    /// # Panics
    ///
    /// Panics if the node does not exist or the write fails.
    pub fn put_object(&self, node: u64, object: ObjectId, refcount: u64) {
        self.store(node)
            .apply_object(object, ObjectInfo::metadata_only(refcount))
            .unwrap();
    }

    /// Queues engine outputs emitted by `from`.
    pub fn submit(&mut self, from: u64, outputs: Vec<MigrationOutput>) {
        for output in outputs {
            self.queue.push_back(Envelope {
                from: NodeId::new(from),
                output,
            });
        }
    }

    /// Starts an ordinary migration on `dest`, pulling `tokens` from
    /// `source`, and returns its completion flag.
    ///
    /// # Panics
    ///
    /// Panics if the start is rejected.
    pub fn start_migration(
        &mut self,
        dest: u64,
        source: u64,
        tokens: &[u32],
        target_version: DltVersion,
    ) -> CompletionFlag {
        let set: BTreeSet<DltToken> = tokens.iter().copied().map(DltToken::new).collect();
        let groups: BTreeMap<NodeId, BTreeSet<DltToken>> =
            [(NodeId::new(source), set)].into_iter().collect();
        let (handler, flag) = completion_flag();
        let outputs = self
            .manager(dest)
            .start_migration(
                &groups,
                target_version,
                self.table.num_bits_per_token(),
                false,
                handler,
            )
            .unwrap();
        self.submit(dest, outputs);
        flag
    }

    /// Starts resync-on-restart on `node` and returns its completion flag.
    ///
    /// # Panics
    ///
    /// Panics if the start is rejected.
    pub fn start_resync(&mut self, node: u64) -> CompletionFlag {
        let (handler, flag) = completion_flag();
        let table = self.table.clone();
        let outputs = self.manager(node).start_resync(&table, handler).unwrap();
        self.submit(node, outputs);
        flag
    }

    /// Delivers one queued envelope in FIFO order.
    ///
    /// Returns the envelope that was delivered, or `None` if the queue was
    /// empty.
    ///
    /// # Panics
    ///
    /// Panics if the receiving engine reports an error.
    pub fn step(&mut self) -> Option<Envelope> {
        let envelope = self.queue.pop_front()?;
        self.deliver(&envelope);
        Some(envelope)
    }

    /// Delivers queued envelopes in FIFO order until the queue is empty,
    /// ticking all managers at each quiescence point.
    ///
    /// # Panics
    ///
    /// Panics if `max_steps` deliveries do not reach quiescence.
    pub fn run_until_quiet(&mut self, max_steps: usize) {
        for _ in 0..max_steps {
            if self.step().is_none() {
                self.tick_all();
                if self.queue.is_empty() {
                    return;
                }
            }
        }
        panic!("cluster did not quiesce within {max_steps} steps");
    }

    /// Like [`Self::run_until_quiet`] but picks among channels at random,
    /// preserving per-(from, to) FIFO order.
    ///
    /// # Panics
    ///
    /// Panics if `max_steps` deliveries do not reach quiescence.
    pub fn run_randomized(&mut self, rng: &mut XorShift, max_steps: usize) {
        for _ in 0..max_steps {
            if self.queue.is_empty() {
                self.tick_all();
                if self.queue.is_empty() {
                    return;
                }
            }
            // First envelope of each (from, to) channel is eligible.
            let mut heads: Vec<usize> = Vec::new();
            let mut seen: BTreeSet<(NodeId, NodeId)> = BTreeSet::new();
            for (index, envelope) in self.queue.iter().enumerate() {
                if seen.insert((envelope.from, envelope.destination())) {
                    heads.push(index);
                }
            }
            let pick = heads[rng.next_below(heads.len())];
            let envelope = self.queue.remove(pick).unwrap();
            self.deliver(&envelope);
        }
        panic!("cluster did not quiesce within {max_steps} steps");
    }

    /// Ticks every manager, queuing whatever the timers emit.
    ///
    /// # Panics
    ///
    /// Panics if a tick reports an error.
    pub fn tick_all(&mut self) {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in ids {
            let outputs = self.nodes[&id].manager.tick().unwrap();
            for output in outputs {
                self.queue.push_back(Envelope { from: id, output });
            }
        }
    }

    /// Returns the number of undelivered envelopes.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn deliver(&mut self, envelope: &Envelope) {
        let from = envelope.from;
        match &envelope.output {
            MigrationOutput::SendMessage { to, message } => {
                let outputs = self.nodes[to]
                    .manager
                    .handle_message(&self.table, from, message)
                    .unwrap();
                let to = *to;
                for output in outputs {
                    self.queue.push_back(Envelope { from: to, output });
                }
            }
            MigrationOutput::ForwardWrite {
                to,
                executor_id,
                object,
                info,
            } => {
                self.nodes[to]
                    .store
                    .apply_object(*object, info.clone())
                    .unwrap();
                self.nodes[&from].manager.forward_completed(*executor_id);
            }
            MigrationOutput::ForwardAddRef {
                to,
                executor_id,
                objects,
                ..
            } => {
                for &object in objects {
                    let store = &self.nodes[to].store;
                    let refcount = store
                        .get_object(object)
                        .unwrap()
                        .map_or(0, |info| info.refcount);
                    store
                        .apply_object(object, ObjectInfo::metadata_only(refcount + 1))
                        .unwrap();
                }
                self.nodes[&from].manager.forward_completed(*executor_id);
            }
        }
    }
}
