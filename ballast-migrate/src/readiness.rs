//! DLT-token readiness tracking.
//!
//! One bit per DLT token, `true` meaning the token's data is fully synced
//! and may serve reads/writes without forwarding concerns. Readiness is
//! monotonic within a migration run: once a token is ready it never flips
//! back.

use ballast_core::DltToken;
use roaring::RoaringBitmap;

/// A boolean-per-DLT-token readiness vector.
///
/// Sized to the token space (`2^bits_per_token`) when a migration starts.
/// Ordinary migrations initialize every token ready; resync-on-restart
/// marks the tokens under resync pending until each is explicitly proven
/// synced.
#[derive(Debug, Clone, Default)]
pub struct ReadinessVector {
    /// Size of the token space; zero until sized.
    total: u32,
    /// Set bits are ready tokens.
    ready: RoaringBitmap,
}

impl ReadinessVector {
    /// Creates an unsized vector (every query reports ready).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sizes the vector to `total` tokens, all ready.
    ///
    /// Already-sized vectors are left alone: a second `start_migration`
    /// toward the same target must not disturb earlier readiness.
    pub fn ensure_sized(&mut self, total: u32) {
        if self.total != 0 {
            return;
        }
        self.total = total;
        self.ready.insert_range(0..total);
    }

    /// Returns the size of the token space (zero if unsized).
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.total
    }

    /// Marks a token as pending sync.
    ///
    /// Only used while initializing a resync run, before any token has
    /// been proven ready; readiness is monotonic afterwards.
    pub fn mark_pending(&mut self, token: DltToken) {
        self.ready.remove(token.get());
    }

    /// Marks a token ready. Monotonic and idempotent.
    pub fn mark_ready(&mut self, token: DltToken) {
        if token.get() < self.total {
            self.ready.insert(token.get());
        }
    }

    /// Returns whether a token is ready.
    ///
    /// An unsized vector reports every token ready (no migration has ever
    /// constrained it).
    #[must_use]
    pub fn is_ready(&self, token: DltToken) -> bool {
        self.total == 0 || self.ready.contains(token.get())
    }

    /// Returns true if every token in the space is ready.
    #[must_use]
    pub fn all_ready(&self) -> bool {
        u64::from(self.total) == self.ready.len()
    }

    /// Returns the number of pending tokens.
    #[must_use]
    pub fn pending_count(&self) -> u64 {
        u64::from(self.total) - self.ready.len()
    }
}
