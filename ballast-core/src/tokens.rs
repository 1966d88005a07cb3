//! Object identifiers and token partitioning.
//!
//! The content-addressed object-id space is partitioned twice:
//!
//! - **DLT tokens**: the fine-grained unit the placement table assigns to
//!   ordered node lists, derived from the leading bits of the object id.
//! - **SM tokens**: a coarser partition used to batch metadata snapshots.
//!   Many DLT tokens map to one SM token at a fixed ratio.
//!
//! The DLT→SM mapping must be identical on every node; both sides of the
//! migration protocol derive it from the same bit counts.

use std::fmt;

use crate::limits::Limits;

/// Length in bytes of a content-addressed object identifier.
pub const OBJECT_ID_LEN: usize = 20;

/// A content-addressed object identifier (digest of the object payload).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    /// Creates an object ID from a raw digest.
    #[must_use]
    pub const fn new(digest: [u8; OBJECT_ID_LEN]) -> Self {
        Self(digest)
    }

    /// Returns the raw digest bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; OBJECT_ID_LEN] {
        &self.0
    }

    /// Derives the DLT token for this object.
    ///
    /// The token is taken from the leading `bits_per_token` bits of the
    /// digest, so objects are spread uniformly across tokens.
    ///
    /// # Panics
    ///
    /// Panics if `bits_per_token` is zero or exceeds
    /// [`Limits::DLT_TOKEN_BITS_MAX`].
    #[must_use]
    pub fn dlt_token(&self, bits_per_token: u32) -> DltToken {
        assert!(
            bits_per_token > 0 && bits_per_token <= Limits::DLT_TOKEN_BITS_MAX,
            "bits_per_token out of range"
        );
        let head = u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        DltToken::new(head >> (32 - bits_per_token))
    }

    /// Derives the SM token for this object given both bit widths.
    #[must_use]
    pub fn sm_token(&self, dlt_bits: u32, sm_bits: u32) -> SmToken {
        sm_token_of(self.dlt_token(dlt_bits), dlt_bits, sm_bits)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj(")?;
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Macro for the two token index types (u32-backed, unlike the u64 IDs).
macro_rules! define_token {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            /// Creates a token from a raw index.
            #[inline]
            #[must_use]
            pub const fn new(index: u32) -> Self {
                Self(index)
            }

            /// Returns the raw index.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u32 {
                self.0
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

        impl From<u32> for $name {
            fn from(index: u32) -> Self {
                Self::new(index)
            }
        }
    };
}

define_token!(
    DltToken,
    "tok",
    "Fine-grained placement token: the unit the DLT assigns to node lists."
);
define_token!(
    SmToken,
    "sm",
    "Coarse storage token: the unit metadata snapshots are batched by."
);

/// Maps a DLT token to its SM token.
///
/// The mapping is integer truncation of the DLT-token index:
/// `sm = dlt >> (dlt_bits - sm_bits)`. It must be used consistently by
/// both the migration executor and client.
///
/// # Panics
///
/// Panics if `sm_bits > dlt_bits` or either width is out of range.
#[must_use]
pub fn sm_token_of(token: DltToken, dlt_bits: u32, sm_bits: u32) -> SmToken {
    assert!(
        dlt_bits > 0 && dlt_bits <= Limits::DLT_TOKEN_BITS_MAX,
        "dlt_bits out of range"
    );
    assert!(sm_bits > 0 && sm_bits <= dlt_bits, "sm_bits out of range");
    SmToken::new(token.get() >> (dlt_bits - sm_bits))
}
