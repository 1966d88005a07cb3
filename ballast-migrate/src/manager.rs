//! The migration manager: one per storage node.
//!
//! Owns both sides of the protocol. As a destination it schedules
//! [`MigrationExecutor`]s one SM token at a time toward a single target
//! DLT version; as a source it serves [`MigrationClient`]s for any peer
//! that asks. The two roles are active simultaneously during resync.
//!
//! # Locking
//!
//! `inner` (executors, scheduling) is always taken before `clients`; the
//! hot forwarding path takes only the `clients` read lock plus atomics.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use ballast_core::{sm_token_of, DltToken, DltVersion, ExecutorId, Limits, NodeId, ObjectId, SmToken};
use ballast_placement::{accept_source_responsibility, Dlt};
use ballast_store::{MetadataStore, ObjectInfo, SnapshotSource, StoreError};
use tracing::{debug, info, warn};

use crate::client::MigrationClient;
use crate::error::{MigrationError, MigrationResult};
use crate::executor::{ExecutorState, MigrationExecutor};
use crate::messages::{
    ClientDone, MigrationMessage, MigrationOutput, RebalanceDecline, RebalanceDeltaSet,
    RebalanceFilterSet, SecondRebalanceRequest, SourceNotReady,
};
use crate::readiness::ReadinessVector;

/// One-shot callback fired when a migration run resolves.
pub type CompletionHandler = Box<dyn FnOnce(MigrationResult<()>) + Send>;

/// Global migration state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MigrState {
    /// No migration running.
    Idle = 0,
    /// A migration toward one target DLT version is running.
    InProgress = 1,
    /// The last run was aborted; latched until the next start.
    Aborted = 2,
}

impl MigrState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::InProgress,
            2 => Self::Aborted,
            _ => Self::Idle,
        }
    }
}

/// How the source answered a filter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceRebalanceStatus {
    /// At least one token was accepted; delta sets follow.
    Accepted,
    /// Every token of the session was declined; the session is over.
    AllDeclined,
}

/// Migration engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct MigrationConfig {
    /// Master switch. Disabled managers resolve every start immediately.
    pub enabled: bool,
    /// System limits (token bits, batch sizes, retry bounds).
    pub limits: Limits,
    /// Ticks between retry attempts for not-ready tokens.
    pub retry_interval_ticks: u64,
}

impl MigrationConfig {
    /// Creates the default production configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            enabled: true,
            limits: Limits::new(),
            retry_interval_ticks: 10,
        }
    }

    /// Creates a configuration suited to tests: enabled, default limits,
    /// retries every tick.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            enabled: true,
            limits: Limits::new(),
            retry_interval_ticks: 1,
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Destination-side scheduling state. Guarded by one mutex.
struct Inner {
    /// Sessions keyed by (SM token, source node).
    executors: BTreeMap<(SmToken, NodeId), MigrationExecutor>,
    /// The SM token currently transferring, if any.
    in_progress: Option<SmToken>,
    /// Ordinary runs do round 1 for every token before any round 2.
    first_round: bool,
    /// One handler per pending start; all fire with the run's outcome.
    completions: Vec<CompletionHandler>,
}

impl Inner {
    const fn new() -> Self {
        Self {
            executors: BTreeMap::new(),
            in_progress: None,
            first_round: true,
            completions: Vec::new(),
        }
    }
}

/// SM tokens awaiting a timer-driven retry after a transient failure.
struct RetrySet {
    pending: VecDeque<SmToken>,
}

impl RetrySet {
    const fn new() -> Self {
        Self {
            pending: VecDeque::new(),
        }
    }

    fn enqueue(&mut self, token: SmToken, max: u32) {
        if self.pending.contains(&token) {
            return;
        }
        if self.pending.len() >= max as usize {
            warn!(%token, "Retry queue full, dropping retry");
            return;
        }
        self.pending.push_back(token);
    }
}

/// Source sessions kept alive until their mirrored requests drain.
///
/// Executors need no drain: everything they do is synchronous within a
/// message handler, so dropping one cannot race a completion callback.
#[derive(Default)]
struct DrainBin {
    clients: Vec<MigrationClient>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The per-node migration engine.
///
/// All methods are callable concurrently; the engine never performs IO
/// and returns [`MigrationOutput`]s for the host transport.
pub struct MigrationManager<S> {
    node_id: NodeId,
    config: MigrationConfig,
    store: Arc<S>,

    state: AtomicU8,
    next_executor_seq: AtomicU32,
    tick_count: AtomicU64,

    // Hot-path copies of the run parameters, valid while InProgress.
    target_version: AtomicU64,
    dlt_bits: AtomicU32,
    resync: AtomicBool,

    inner: Mutex<Inner>,
    clients: RwLock<HashMap<ExecutorId, MigrationClient>>,
    retry: Mutex<RetrySet>,
    readiness: Mutex<ReadinessVector>,
    draining: Mutex<DrainBin>,
}

impl<S: MetadataStore + SnapshotSource> MigrationManager<S> {
    /// Creates an idle manager for `node_id` over `store`.
    #[must_use]
    pub fn new(node_id: NodeId, config: MigrationConfig, store: Arc<S>) -> Self {
        Self {
            node_id,
            config,
            store,
            state: AtomicU8::new(MigrState::Idle as u8),
            next_executor_seq: AtomicU32::new(1),
            tick_count: AtomicU64::new(0),
            target_version: AtomicU64::new(DltVersion::UNSET.get()),
            dlt_bits: AtomicU32::new(0),
            resync: AtomicBool::new(false),
            inner: Mutex::new(Inner::new()),
            clients: RwLock::new(HashMap::new()),
            retry: Mutex::new(RetrySet::new()),
            readiness: Mutex::new(ReadinessVector::new()),
            draining: Mutex::new(DrainBin::default()),
        }
    }

    /// Returns this node's identity.
    #[must_use]
    pub const fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Returns the current global migration state.
    #[must_use]
    pub fn state(&self) -> MigrState {
        MigrState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns the target version of the running migration, unset if idle.
    #[must_use]
    pub fn target_version(&self) -> DltVersion {
        DltVersion::new(self.target_version.load(Ordering::Acquire))
    }

    /// Returns whether `token`'s data is fully synced on this node.
    ///
    /// Pending only for tokens under an unfinished resync.
    #[must_use]
    pub fn dlt_token_ready(&self, token: DltToken) -> bool {
        lock(&self.readiness).is_ready(token)
    }

    /// Returns true once every torn-down session has finished draining
    /// its in-flight requests.
    #[must_use]
    pub fn drained(&self) -> bool {
        lock(&self.draining).clients.is_empty()
    }

    // ---------------------------------------------------------------
    // Destination side: starting a run.
    // ---------------------------------------------------------------

    /// Starts a migration toward `target_version`.
    ///
    /// `groups` maps each source node to the DLT tokens to pull from it.
    /// Idempotent for the same target version: a second call adds any
    /// unseen (token, source) pairs and its handler fires with the same
    /// run's outcome.
    ///
    /// # Errors
    ///
    /// [`MigrationError::AlreadyInProgress`] if a run toward a different
    /// version is active, [`MigrationError::NothingToMigrate`] for empty
    /// groups, [`MigrationError::InvalidTokenBits`] for unusable bit
    /// widths; the handler is not invoked for those. A hard failure while
    /// scheduling the first token aborts the run, which does fire the
    /// handler, before the error is returned.
    pub fn start_migration(
        &self,
        groups: &BTreeMap<NodeId, BTreeSet<DltToken>>,
        target_version: DltVersion,
        dlt_bits: u32,
        for_resync: bool,
        on_complete: CompletionHandler,
    ) -> MigrationResult<Vec<MigrationOutput>> {
        if !self.config.enabled {
            info!("Migration disabled, resolving start immediately");
            on_complete(Ok(()));
            return Ok(Vec::new());
        }

        let sm_bits = self.config.limits.sm_token_bits;
        if dlt_bits == 0 || dlt_bits > Limits::DLT_TOKEN_BITS_MAX || sm_bits > dlt_bits {
            return Err(MigrationError::InvalidTokenBits { dlt_bits, sm_bits });
        }
        if groups.values().all(BTreeSet::is_empty) {
            return Err(MigrationError::NothingToMigrate);
        }

        let reentrant = match self.state.compare_exchange(
            MigrState::Idle as u8,
            MigrState::InProgress as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => false,
            Err(current) if current == MigrState::Aborted as u8 => {
                self.state
                    .compare_exchange(
                        MigrState::Aborted as u8,
                        MigrState::InProgress as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .map_err(|_| MigrationError::AlreadyInProgress {
                        current: self.target_version(),
                        requested: target_version,
                    })?;
                false
            }
            Err(_) => {
                let current = self.target_version();
                if current != target_version {
                    return Err(MigrationError::AlreadyInProgress {
                        current,
                        requested: target_version,
                    });
                }
                true
            }
        };

        if !reentrant {
            self.target_version
                .store(target_version.get(), Ordering::Release);
            self.dlt_bits.store(dlt_bits, Ordering::Release);
            self.resync.store(for_resync, Ordering::Release);

            let mut readiness = lock(&self.readiness);
            readiness.ensure_sized(1 << dlt_bits);
            if for_resync {
                for tokens in groups.values() {
                    for &token in tokens {
                        readiness.mark_pending(token);
                    }
                }
            }
        }

        info!(
            target = %target_version,
            sources = groups.len(),
            for_resync,
            reentrant,
            "Starting migration"
        );

        let mut inner = lock(&self.inner);
        for (&source, tokens) in groups {
            for &token in tokens {
                let sm = sm_token_of(token, dlt_bits, sm_bits);
                let executor = inner.executors.entry((sm, source)).or_insert_with(|| {
                    let seq = self.next_executor_seq.fetch_add(1, Ordering::AcqRel);
                    MigrationExecutor::new(
                        ExecutorId::compose(self.node_id, seq),
                        source,
                        sm,
                        target_version,
                        for_resync,
                    )
                });
                if executor.state() == ExecutorState::Created {
                    executor.add_dlt_token(token)?;
                } else if !executor.responsible_for_dlt_token(token) {
                    warn!(%sm, %source, %token, "Token arrived after session start, ignored");
                }
            }
        }

        inner.completions.push(on_complete);

        if inner.in_progress.is_some() {
            return Ok(Vec::new());
        }
        match self.start_next_token(&mut inner) {
            Ok(outputs) => Ok(outputs),
            Err(error) => {
                drop(inner);
                let _ = self.abort_migration("hard failure while starting a token round");
                Err(error)
            }
        }
    }

    /// Starts resync-on-restart against the published table.
    ///
    /// Every token this node owns alongside another node is pulled from
    /// the best-positioned other owner; mutual claims are resolved by the
    /// source-responsibility tie-break during round 1.
    ///
    /// # Errors
    ///
    /// Same as [`Self::start_migration`].
    pub fn start_resync(
        &self,
        table: &Dlt,
        on_complete: CompletionHandler,
    ) -> MigrationResult<Vec<MigrationOutput>> {
        let groups = table.source_candidates_for(self.node_id);
        if groups.is_empty() {
            debug!("No shared tokens to resync");
            on_complete(Ok(()));
            return Ok(Vec::new());
        }
        self.start_migration(
            &groups,
            table.version(),
            table.num_bits_per_token(),
            true,
            on_complete,
        )
    }

    // ---------------------------------------------------------------
    // Destination side: protocol receives.
    // ---------------------------------------------------------------

    /// Handles a source's decline of one or more DLT tokens.
    ///
    /// Declined tokens are marked ready without data movement. A decline
    /// covering the whole session completes it for both rounds.
    ///
    /// # Errors
    ///
    /// Returns an error if completing the run fails downstream.
    pub fn recv_rebalance_decline(
        &self,
        msg: &RebalanceDecline,
    ) -> MigrationResult<Vec<MigrationOutput>> {
        let mut inner = lock(&self.inner);
        let Some((&key, executor)) = inner
            .executors
            .iter_mut()
            .find(|(_, executor)| executor.id() == msg.executor_id)
        else {
            warn!(executor = %msg.executor_id, "Decline for unknown session, dropped");
            return Ok(Vec::new());
        };

        {
            let mut readiness = lock(&self.readiness);
            for &token in &msg.tokens {
                readiness.mark_ready(token);
            }
        }

        if executor.handle_decline(&msg.tokens) {
            debug!(executor = %msg.executor_id, "Session fully declined");
            return self.advance_after(inner, key);
        }
        Ok(Vec::new())
    }

    /// Handles one delta-set batch from a source.
    ///
    /// Batches arriving outside a run, for an unknown session, or for a
    /// mismatched SM token are dropped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if committing to the store fails; the run is
    /// aborted first.
    pub fn recv_rebalance_delta_set(
        &self,
        msg: &RebalanceDeltaSet,
    ) -> MigrationResult<Vec<MigrationOutput>> {
        if self.state() != MigrState::InProgress {
            warn!(executor = %msg.executor_id, "Delta set outside a run, dropped");
            return Ok(Vec::new());
        }
        let mut inner = lock(&self.inner);
        let Some((&key, executor)) = inner
            .executors
            .iter_mut()
            .find(|(_, executor)| executor.id() == msg.executor_id)
        else {
            warn!(executor = %msg.executor_id, "Delta set for unknown session, dropped");
            return Ok(Vec::new());
        };
        if executor.sm_token() != msg.sm_token {
            warn!(
                executor = %msg.executor_id,
                got = %msg.sm_token,
                expected = %executor.sm_token(),
                "Delta set for mismatched token, dropped"
            );
            return Ok(Vec::new());
        }

        let round_complete = match executor.apply_rebalance_delta_set(self.store.as_ref(), msg) {
            Ok(done) => done,
            Err(error) => {
                drop(inner);
                let _ = self.abort_migration("store failure while applying delta set");
                return Err(error);
            }
        };
        if round_complete {
            return self.advance_after(inner, key);
        }
        Ok(Vec::new())
    }

    /// Handles a source's not-ready answer: queues the SM token for a
    /// timer-driven retry.
    pub fn recv_source_not_ready(&self, msg: &SourceNotReady) {
        let inner = lock(&self.inner);
        let known = inner
            .executors
            .values()
            .any(|executor| executor.id() == msg.executor_id);
        drop(inner);
        if !known {
            warn!(executor = %msg.executor_id, "Not-ready for unknown session, dropped");
            return;
        }
        debug!(executor = %msg.executor_id, token = %msg.sm_token, "Source not ready, queuing retry");
        lock(&self.retry).enqueue(msg.sm_token, self.config.limits.max_pending_retries);
    }

    // ---------------------------------------------------------------
    // Source side.
    // ---------------------------------------------------------------

    /// Handles a destination's filter set (round-1 request).
    ///
    /// Lazily creates the source-side session. During resync, tokens this
    /// node is itself resyncing are declined when the tie-break says the
    /// asking node has the better ownership position.
    ///
    /// # Errors
    ///
    /// Returns an error on a non-transient snapshot failure; a transient
    /// one answers with a not-ready message instead.
    pub fn start_object_rebalance(
        &self,
        table: &Dlt,
        from: NodeId,
        msg: &RebalanceFilterSet,
    ) -> MigrationResult<(SourceRebalanceStatus, Vec<MigrationOutput>)> {
        // Tokens this node is itself still pulling from `from`.
        let own_pending: BTreeSet<DltToken> = if msg.for_resync {
            let inner = lock(&self.inner);
            inner
                .executors
                .values()
                .filter(|executor| {
                    executor.source() == from && executor.state() != ExecutorState::Round2Done
                })
                .flat_map(|executor| executor.dlt_tokens().iter().copied())
                .collect()
        } else {
            BTreeSet::new()
        };

        let mut clients = self
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let client = clients.entry(msg.executor_id).or_insert_with(|| {
            debug!(executor = %msg.executor_id, dest = %from, "New source session");
            MigrationClient::new(
                msg.executor_id,
                from,
                msg.sm_token,
                msg.target_version,
                msg.for_resync,
            )
        });

        let node_id = self.node_id;
        client.ingest_filter(msg, |token| {
            !(own_pending.contains(&token)
                && !accept_source_responsibility(table, token, node_id, from))
        });

        if !msg.last {
            return Ok((SourceRebalanceStatus::Accepted, Vec::new()));
        }

        let mut outputs = Vec::new();
        let declined: Vec<DltToken> = client.declined_tokens().iter().copied().collect();

        if client.all_declined() {
            outputs.push(MigrationOutput::SendMessage {
                to: from,
                message: MigrationMessage::RebalanceDecline(RebalanceDecline {
                    executor_id: msg.executor_id,
                    sm_token: msg.sm_token,
                    tokens: declined,
                    all_declined: true,
                }),
            });
            clients.remove(&msg.executor_id);
            return Ok((SourceRebalanceStatus::AllDeclined, outputs));
        }

        if !declined.is_empty() {
            outputs.push(MigrationOutput::SendMessage {
                to: from,
                message: MigrationMessage::RebalanceDecline(RebalanceDecline {
                    executor_id: msg.executor_id,
                    sm_token: msg.sm_token,
                    tokens: declined,
                    all_declined: false,
                }),
            });
        }

        let snapshot = match self.store.take_snapshot(msg.sm_token) {
            Ok(snapshot) => snapshot,
            Err(StoreError::SnapshotUnavailable { token }) => {
                debug!(executor = %msg.executor_id, %token, "Snapshot unavailable, answering not ready");
                clients.remove(&msg.executor_id);
                outputs.push(MigrationOutput::SendMessage {
                    to: from,
                    message: MigrationMessage::SourceNotReady(SourceNotReady {
                        executor_id: msg.executor_id,
                        sm_token: msg.sm_token,
                    }),
                });
                return Ok((SourceRebalanceStatus::Accepted, outputs));
            }
            Err(error) => return Err(error.into()),
        };

        let deltas = client.finish_first_phase(
            snapshot,
            self.config.limits.dlt_token_bits,
            self.config.limits.max_entries_per_delta_set,
        )?;
        for delta in deltas {
            outputs.push(MigrationOutput::SendMessage {
                to: from,
                message: MigrationMessage::RebalanceDeltaSet(delta),
            });
        }
        Ok((SourceRebalanceStatus::Accepted, outputs))
    }

    /// Handles a destination's round-2 request.
    ///
    /// Enables live-write forwarding before computing the delta, then
    /// answers with everything changed since the round-1 snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error on a non-transient snapshot failure.
    pub fn recv_second_rebalance_request(
        &self,
        msg: &SecondRebalanceRequest,
    ) -> MigrationResult<Vec<MigrationOutput>> {
        let mut clients = self
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(client) = clients.get_mut(&msg.executor_id) else {
            warn!(executor = %msg.executor_id, "Round-2 request for unknown session, dropped");
            return Ok(Vec::new());
        };
        let dest = client.dest();

        let snapshot = match self.store.take_snapshot(msg.sm_token) {
            Ok(snapshot) => snapshot,
            Err(StoreError::SnapshotUnavailable { .. }) => {
                return Ok(vec![MigrationOutput::SendMessage {
                    to: dest,
                    message: MigrationMessage::SourceNotReady(SourceNotReady {
                        executor_id: msg.executor_id,
                        sm_token: msg.sm_token,
                    }),
                }]);
            }
            Err(error) => return Err(error.into()),
        };

        let deltas = client.start_rebalance_second_phase(
            &snapshot,
            self.config.limits.dlt_token_bits,
            self.config.limits.max_entries_per_delta_set,
        )?;
        Ok(deltas
            .into_iter()
            .map(|delta| MigrationOutput::SendMessage {
                to: dest,
                message: MigrationMessage::RebalanceDeltaSet(delta),
            })
            .collect())
    }

    /// Handles a destination's notice that a session is over.
    ///
    /// The session drains its in-flight mirrored requests before being
    /// freed.
    pub fn recv_client_done(&self, msg: &ClientDone) {
        let mut clients = self
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.remove(&msg.executor_id) {
            if !client.is_idle() {
                lock(&self.draining).clients.push(client);
            }
        }
    }

    // ---------------------------------------------------------------
    // Source side: live-write forwarding (hot path).
    // ---------------------------------------------------------------

    /// Gates a live object write against active migrations.
    ///
    /// Returns the mirror actions the host must dispatch alongside the
    /// local write. A write is mirrored to every session in its round-2
    /// window, except that a request already routed with a session's
    /// target table is skipped: the new owners got it directly.
    #[must_use]
    pub fn forward_request(
        &self,
        object: ObjectId,
        request_version: DltVersion,
        info: &ObjectInfo,
    ) -> Vec<MigrationOutput> {
        let token = object.dlt_token(self.config.limits.dlt_token_bits);

        let clients = self.clients.read().unwrap_or_else(PoisonError::into_inner);
        clients
            .values()
            .filter(|client| {
                (client.for_resync() || request_version != client.target_version())
                    && client.try_forward(token)
            })
            .map(|client| MigrationOutput::ForwardWrite {
                to: client.dest(),
                executor_id: client.executor_id(),
                object,
                info: info.clone(),
            })
            .collect()
    }

    /// Gates a live add-reference batch against active migrations.
    ///
    /// Objects are partitioned per DLT token; each (session, token) group
    /// becomes one mirror action.
    #[must_use]
    pub fn forward_add_ref(
        &self,
        request_version: DltVersion,
        objects: &[ObjectId],
    ) -> Vec<MigrationOutput> {
        let bits = self.config.limits.dlt_token_bits;
        let mut by_token: BTreeMap<DltToken, Vec<ObjectId>> = BTreeMap::new();
        for &object in objects {
            by_token.entry(object.dlt_token(bits)).or_default().push(object);
        }

        let clients = self.clients.read().unwrap_or_else(PoisonError::into_inner);
        let mut outputs = Vec::new();
        for client in clients.values() {
            if !client.for_resync() && request_version == client.target_version() {
                continue;
            }
            for (&token, group) in &by_token {
                if client.try_forward(token) {
                    outputs.push(MigrationOutput::ForwardAddRef {
                        to: client.dest(),
                        executor_id: client.executor_id(),
                        token,
                        objects: group.clone(),
                    });
                }
            }
        }
        outputs
    }

    /// Reports the completion of one mirrored request.
    pub fn forward_completed(&self, executor_id: ExecutorId) {
        {
            let clients = self.clients.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(client) = clients.get(&executor_id) {
                client.forward_completed();
                return;
            }
        }
        let bin = lock(&self.draining);
        if let Some(client) = bin
            .clients
            .iter()
            .find(|client| client.executor_id() == executor_id)
        {
            client.forward_completed();
        }
    }

    // ---------------------------------------------------------------
    // Lifecycle.
    // ---------------------------------------------------------------

    /// Handles the controller closing the placement-table transition.
    ///
    /// Tears down the destination side of an ordinary migration; sources
    /// drop their sessions when the ClientDone notices this emits arrive.
    /// Ignored (with a warning) while a resync is running: resync does
    /// not belong to a table transition and completes on its own.
    #[must_use]
    pub fn handle_dlt_close(&self, version: DltVersion) -> Vec<MigrationOutput> {
        if self.resync.load(Ordering::Acquire) && self.state() == MigrState::InProgress {
            warn!(%version, "Table close during resync, ignored");
            return Vec::new();
        }
        // An aborted run stays latched until the next start; an idle node
        // has nothing to tear down.
        if self
            .state
            .compare_exchange(
                MigrState::InProgress as u8,
                MigrState::Idle as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Vec::new();
        }
        info!(%version, "Placement table closed, tearing down migration");
        self.teardown("placement table closed before completion")
    }

    /// Aborts the running migration.
    ///
    /// Pending completion handlers fire with [`MigrationError::Aborted`]; the
    /// state latches `Aborted` until the next start.
    #[must_use]
    pub fn abort_migration(&self, reason: &str) -> Vec<MigrationOutput> {
        if self
            .state
            .compare_exchange(
                MigrState::InProgress as u8,
                MigrState::Aborted as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Vec::new();
        }
        warn!(reason, "Aborting migration");
        self.teardown(reason)
    }

    fn teardown(&self, reason: &str) -> Vec<MigrationOutput> {
        let mut outputs = Vec::new();
        {
            let mut inner = lock(&self.inner);
            for handler in inner.completions.drain(..) {
                handler(Err(MigrationError::Aborted {
                    reason: reason.to_string(),
                }));
            }
            let executors = std::mem::take(&mut inner.executors);
            inner.in_progress = None;
            inner.first_round = true;
            drop(inner);

            for ((_, source), executor) in executors {
                outputs.push(MigrationOutput::SendMessage {
                    to: source,
                    message: MigrationMessage::ClientDone(ClientDone {
                        executor_id: executor.id(),
                    }),
                });
            }
        }
        {
            let mut clients = self
                .clients
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let drained = std::mem::take(&mut *clients);
            drop(clients);
            let mut bin = lock(&self.draining);
            for (_, client) in drained {
                if !client.is_idle() {
                    bin.clients.push(client);
                }
            }
        }
        lock(&self.retry).pending.clear();
        *lock(&self.readiness) = ReadinessVector::new();
        self.target_version
            .store(DltVersion::UNSET.get(), Ordering::Release);
        self.dlt_bits.store(0, Ordering::Release);
        self.resync.store(false, Ordering::Release);
        outputs
    }

    /// Advances timers: frees drained sessions and retries one queued
    /// SM token per interval.
    ///
    /// # Errors
    ///
    /// Returns an error if a retry fails non-transiently.
    pub fn tick(&self) -> MigrationResult<Vec<MigrationOutput>> {
        lock(&self.draining)
            .clients
            .retain(|client| !client.is_idle());

        let count = self.tick_count.fetch_add(1, Ordering::AcqRel) + 1;
        if count % self.config.retry_interval_ticks.max(1) != 0 {
            return Ok(Vec::new());
        }
        if self.state() != MigrState::InProgress {
            return Ok(Vec::new());
        }

        let Some(token) = lock(&self.retry).pending.pop_front() else {
            return Ok(Vec::new());
        };
        debug!(%token, "Retrying migration for token");
        let mut inner = lock(&self.inner);
        match self.start_token_round(&mut inner, token, true) {
            Ok(outputs) => Ok(outputs),
            Err(error) => {
                drop(inner);
                let _ = self.abort_migration("hard failure while retrying a token");
                Err(error)
            }
        }
    }

    /// Dispatches one received protocol message.
    ///
    /// Convenience for hosts that funnel all migration traffic through a
    /// single handler.
    ///
    /// # Errors
    ///
    /// Propagates the error of the specific receive path.
    pub fn handle_message(
        &self,
        table: &Dlt,
        from: NodeId,
        msg: &MigrationMessage,
    ) -> MigrationResult<Vec<MigrationOutput>> {
        match msg {
            MigrationMessage::RebalanceFilterSet(msg) => self
                .start_object_rebalance(table, from, msg)
                .map(|(_, outputs)| outputs),
            MigrationMessage::RebalanceDecline(msg) => self.recv_rebalance_decline(msg),
            MigrationMessage::RebalanceDeltaSet(msg) => self.recv_rebalance_delta_set(msg),
            MigrationMessage::SecondRebalanceRequest(msg) => {
                self.recv_second_rebalance_request(msg)
            }
            MigrationMessage::SourceNotReady(msg) => {
                self.recv_source_not_ready(msg);
                Ok(Vec::new())
            }
            MigrationMessage::ClientDone(msg) => {
                self.recv_client_done(msg);
                Ok(Vec::new())
            }
        }
    }

    // ---------------------------------------------------------------
    // Scheduling.
    // ---------------------------------------------------------------

    /// Runs the post-round scheduling step. A hard scheduling error
    /// aborts the whole run, firing every pending start handler, before
    /// the error propagates.
    fn advance_after(
        &self,
        mut inner: MutexGuard<'_, Inner>,
        key: (SmToken, NodeId),
    ) -> MigrationResult<Vec<MigrationOutput>> {
        match self.migration_executor_done(&mut inner, key) {
            Ok(outputs) => Ok(outputs),
            Err(error) => {
                drop(inner);
                let _ = self.abort_migration("hard failure while advancing the run");
                Err(error)
            }
        }
    }

    /// Reacts to one session finishing a round (or being fully declined).
    fn migration_executor_done(
        &self,
        inner: &mut Inner,
        key: (SmToken, NodeId),
    ) -> MigrationResult<Vec<MigrationOutput>> {
        let resync = self.resync.load(Ordering::Acquire);
        let first_round = inner.first_round;
        let (sm, source) = key;
        let mut outputs = Vec::new();

        if let Some(executor) = inner.executors.get_mut(&key) {
            match executor.state() {
                // Resync, and sessions joining after the global flip, run
                // both rounds back to back.
                ExecutorState::Round1Done if resync || !first_round => {
                    let request = executor.start_second_rebalance_round()?;
                    outputs.push(MigrationOutput::SendMessage {
                        to: source,
                        message: MigrationMessage::SecondRebalanceRequest(request),
                    });
                    return Ok(outputs);
                }
                ExecutorState::Round2Done => {
                    let mut readiness = lock(&self.readiness);
                    for &token in executor.dlt_tokens() {
                        readiness.mark_ready(token);
                    }
                    drop(readiness);
                    if resync {
                        outputs.push(MigrationOutput::SendMessage {
                            to: source,
                            message: MigrationMessage::ClientDone(ClientDone {
                                executor_id: executor.id(),
                            }),
                        });
                    }
                }
                _ => {}
            }
        }

        // Advance only when every session of the current token is done
        // with the current round.
        let first = !resync && first_round;
        let token_done = inner
            .executors
            .iter()
            .filter(|((token, _), _)| *token == sm)
            .all(|(_, executor)| executor.is_round_done(first));
        if !token_done {
            // A re-entrant start may have added sessions for this token
            // after its round began; kick them once nothing is in flight.
            let active = inner
                .executors
                .iter()
                .filter(|((token, _), _)| *token == sm)
                .any(|(_, executor)| {
                    matches!(
                        executor.state(),
                        ExecutorState::Round1Active | ExecutorState::Round2Active
                    )
                });
            if !active {
                let unstarted = inner
                    .executors
                    .iter()
                    .filter(|((token, _), _)| *token == sm)
                    .any(|(_, executor)| executor.state() == ExecutorState::Created);
                if unstarted {
                    outputs.extend(self.start_token_round(inner, sm, true)?);
                } else if !first_round {
                    outputs.extend(self.start_token_round(inner, sm, false)?);
                }
            }
            return Ok(outputs);
        }
        inner.in_progress = None;
        outputs.extend(self.start_next_token(inner)?);
        Ok(outputs)
    }

    /// Picks and starts the next SM token, flipping to round 2 or
    /// completing the run when nothing is left.
    fn start_next_token(&self, inner: &mut Inner) -> MigrationResult<Vec<MigrationOutput>> {
        loop {
            // Sessions added by a re-entrant start after the global flip
            // still owe round 1; they go first.
            let candidate = inner
                .executors
                .iter()
                .find(|(_, executor)| executor.state() == ExecutorState::Created)
                .map(|((token, _), _)| (*token, true))
                .or_else(|| {
                    if inner.first_round {
                        None
                    } else {
                        inner
                            .executors
                            .iter()
                            .find(|(_, executor)| executor.state() == ExecutorState::Round1Done)
                            .map(|((token, _), _)| (*token, false))
                    }
                });

            if let Some((token, first_round)) = candidate {
                return self.start_token_round(inner, token, first_round);
            }

            let in_flight = if inner.first_round {
                ExecutorState::Round1Active
            } else {
                ExecutorState::Round2Active
            };
            if inner
                .executors
                .values()
                .any(|executor| executor.state() == in_flight)
            {
                return Ok(Vec::new());
            }

            // Resync sessions flip to round 2 individually; a global flip
            // applies to ordinary runs only.
            if inner.first_round && !self.resync.load(Ordering::Acquire) {
                let all_past_round1 = inner
                    .executors
                    .values()
                    .all(|executor| executor.is_round_done(true));
                if all_past_round1 && !inner.executors.is_empty() {
                    debug!("Round 1 complete for all tokens, starting round 2");
                    inner.first_round = false;
                    continue;
                }
            }

            let all_done = inner
                .executors
                .values()
                .all(|executor| executor.state() == ExecutorState::Round2Done);
            if all_done && !inner.executors.is_empty() {
                return Ok(self.complete_migration(inner));
            }
            return Ok(Vec::new());
        }
    }

    /// Starts (or retries) the given round for every eligible session of
    /// one SM token.
    fn start_token_round(
        &self,
        inner: &mut Inner,
        token: SmToken,
        first_round: bool,
    ) -> MigrationResult<Vec<MigrationOutput>> {
        let mut outputs = Vec::new();

        if first_round {
            let snapshot = match self.store.take_snapshot(token) {
                Ok(snapshot) => snapshot,
                Err(StoreError::SnapshotUnavailable { .. }) => {
                    debug!(%token, "Own snapshot unavailable, queuing retry");
                    lock(&self.retry).enqueue(token, self.config.limits.max_pending_retries);
                    inner.in_progress = Some(token);
                    return Ok(outputs);
                }
                Err(error) => return Err(error.into()),
            };
            let bits = self.dlt_bits.load(Ordering::Acquire);
            let max = self.config.limits.max_entries_per_filter_set;
            for ((sm, source), executor) in inner.executors.iter_mut() {
                if *sm != token {
                    continue;
                }
                let filters = match executor.state() {
                    ExecutorState::Created => {
                        executor.start_object_rebalance(&snapshot, bits, max)?
                    }
                    ExecutorState::Round1Active => {
                        executor.start_object_rebalance_again(&snapshot, bits, max)?
                    }
                    ExecutorState::Round2Active => {
                        // Retried while waiting on the round-2 answer.
                        outputs.push(MigrationOutput::SendMessage {
                            to: *source,
                            message: MigrationMessage::SecondRebalanceRequest(
                                SecondRebalanceRequest {
                                    executor_id: executor.id(),
                                    sm_token: token,
                                    target_version: DltVersion::new(
                                        self.target_version.load(Ordering::Acquire),
                                    ),
                                },
                            ),
                        });
                        continue;
                    }
                    _ => continue,
                };
                for filter in filters {
                    outputs.push(MigrationOutput::SendMessage {
                        to: *source,
                        message: MigrationMessage::RebalanceFilterSet(filter),
                    });
                }
            }
        } else {
            for ((sm, source), executor) in inner.executors.iter_mut() {
                if *sm != token || executor.state() != ExecutorState::Round1Done {
                    continue;
                }
                let request = executor.start_second_rebalance_round()?;
                outputs.push(MigrationOutput::SendMessage {
                    to: *source,
                    message: MigrationMessage::SecondRebalanceRequest(request),
                });
            }
        }

        inner.in_progress = Some(token);
        Ok(outputs)
    }

    /// Resolves a fully finished run.
    fn complete_migration(&self, inner: &mut Inner) -> Vec<MigrationOutput> {
        let resync = self.resync.load(Ordering::Acquire);
        info!(target = %self.target_version(), resync, "Migration complete");

        for handler in inner.completions.drain(..) {
            handler(Ok(()));
        }
        inner.in_progress = None;

        if resync {
            // Resync ends on its own; ordinary runs wait for the table
            // close to tear down forwarding on the sources.
            inner.executors.clear();
            self.state.store(MigrState::Idle as u8, Ordering::Release);
            self.target_version
                .store(DltVersion::UNSET.get(), Ordering::Release);
            self.dlt_bits.store(0, Ordering::Release);
            self.resync.store(false, Ordering::Release);
            lock(&self.retry).pending.clear();
        }
        Vec::new()
    }
}
