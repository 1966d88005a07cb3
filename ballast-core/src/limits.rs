//! System limits and configuration bounds.
//!
//! Following TigerStyle: put limits on everything.
//! Every queue, buffer, and resource has an explicit maximum size.
//! This prevents unbounded growth and makes the system predictable.

use std::fmt;

/// System-wide limits for Ballast.
///
/// All limits are explicit and configurable. Default values are chosen
/// to be safe for most deployments while allowing customization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    // Token-space limits.
    /// Number of bits used to derive a DLT token from an object id.
    pub dlt_token_bits: u32,
    /// Number of bits used to derive an SM token from a DLT token.
    pub sm_token_bits: u32,

    // Migration batch limits.
    /// Maximum object entries in one rebalance filter-set message.
    pub max_entries_per_filter_set: u32,
    /// Maximum object entries in one rebalance delta-set message.
    pub max_entries_per_delta_set: u32,

    // Retry limits.
    /// Maximum SM tokens queued for retry at once.
    pub max_pending_retries: u32,
}

impl Limits {
    /// Widest supported DLT token derivation (tokens fit in 16 bits).
    pub const DLT_TOKEN_BITS_MAX: u32 = 16;

    /// Creates limits with safe defaults.
    ///
    /// These defaults are chosen to be conservative and safe for most
    /// deployments. Production systems should tune these based on their
    /// hardware and workload characteristics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // Token space: 256 DLT tokens batched into 16 SM tokens.
            dlt_token_bits: 8,
            sm_token_bits: 4,

            // Batches: 10k entries per filter set, 1k per delta set.
            max_entries_per_filter_set: 10_000,
            max_entries_per_delta_set: 1_000,

            // Retries: at most one per SM token.
            max_pending_retries: 1 << Self::DLT_TOKEN_BITS_MAX,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limits are invalid or inconsistent.
    pub const fn validate(&self) -> Result<(), LimitsError> {
        if self.dlt_token_bits == 0 || self.dlt_token_bits > Self::DLT_TOKEN_BITS_MAX {
            return Err(LimitsError {
                name: "dlt_token_bits",
                reason: "must be in 1..=DLT_TOKEN_BITS_MAX",
            });
        }

        // SM tokens are coarser than DLT tokens.
        if self.sm_token_bits == 0 || self.sm_token_bits > self.dlt_token_bits {
            return Err(LimitsError {
                name: "sm_token_bits",
                reason: "must be in 1..=dlt_token_bits",
            });
        }

        if self.max_entries_per_filter_set == 0 {
            return Err(LimitsError {
                name: "max_entries_per_filter_set",
                reason: "must be positive",
            });
        }

        if self.max_entries_per_delta_set == 0 {
            return Err(LimitsError {
                name: "max_entries_per_delta_set",
                reason: "must be positive",
            });
        }

        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

/// An invalid or inconsistent limit value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitsError {
    /// The name of the offending limit.
    pub name: &'static str,
    /// Why it was invalid.
    pub reason: &'static str,
}

impl fmt::Display for LimitsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid limit '{}': {}", self.name, self.reason)
    }
}

impl std::error::Error for LimitsError {}
