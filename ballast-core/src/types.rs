//! Strongly-typed identifiers for Ballast entities.
//!
//! Following `TigerStyle`: explicit types prevent bugs from mixing up IDs.
//! All IDs are 64-bit to handle large-scale deployments.

use std::fmt;

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `NodeId` with `DltVersion`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

// Node identification.
define_id!(NodeId, "node", "Unique identifier for a Ballast storage node in the cluster.");

// Placement-table versioning.
define_id!(
    DltVersion,
    "dlt",
    "Monotonically increasing version of the data-placement table (DLT)."
);

impl DltVersion {
    /// The sentinel version meaning "no migration target set".
    pub const UNSET: Self = Self(0);

    /// Returns true if this version is the unset sentinel.
    #[must_use]
    pub const fn is_unset(self) -> bool {
        self.0 == 0
    }
}

/// Globally-unique identifier for a destination-side migration session.
///
/// The low 32 bits are a monotonically increasing counter local to the
/// owning node; the high 32 bits are the owning node's identity. The
/// composite is unique cluster-wide and correlates request/response pairs
/// across the network.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct ExecutorId(u64);

impl ExecutorId {
    /// Composes an executor ID from the owning node and a local counter.
    ///
    /// Only the low 32 bits of the node identity participate; nodes with
    /// wider identities must be assigned distinct low halves by the
    /// deployment layer.
    #[inline]
    #[must_use]
    pub const fn compose(node: NodeId, local_seq: u32) -> Self {
        let high = (node.get() & 0xFFFF_FFFF) << 32;
        Self(high | local_seq as u64)
    }

    /// Creates an executor ID from its raw u64 form (e.g. off the wire).
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the low-32-bit identity of the node that allocated this ID.
    #[inline]
    #[must_use]
    pub const fn owner_node_low(self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        {
            (self.0 >> 32) as u32
        }
    }

    /// Returns the local counter component.
    #[inline]
    #[must_use]
    pub const fn local_seq(self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        {
            (self.0 & 0xFFFF_FFFF) as u32
        }
    }
}

impl fmt::Debug for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "executor({}/{})", self.owner_node_low(), self.local_seq())
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "executor-{:#x}", self.0)
    }
}
