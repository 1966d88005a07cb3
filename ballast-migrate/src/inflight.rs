//! In-flight request tracking for teardown drains.
//!
//! A source session must not be freed while a mirrored write dispatched
//! on its behalf is still outstanding; a late completion callback would
//! otherwise touch freed state. The tracker is atomic so the hot
//! forwarding path can update it under the shared client read lock.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counts requests dispatched but not yet completed.
#[derive(Debug, Default)]
pub(crate) struct Inflight {
    outstanding: AtomicU64,
}

impl Inflight {
    /// Creates an idle tracker.
    pub(crate) const fn new() -> Self {
        Self {
            outstanding: AtomicU64::new(0),
        }
    }

    /// Records one dispatched request.
    pub(crate) fn begin(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    /// Records one completed request.
    ///
    /// Completions without a matching begin are clamped at zero; they can
    /// only come from a host double-reporting.
    pub(crate) fn complete(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
    }

    /// Returns true if nothing is outstanding.
    pub(crate) fn is_idle(&self) -> bool {
        self.outstanding.load(Ordering::Acquire) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_complete() {
        let tracker = Inflight::new();
        assert!(tracker.is_idle());

        tracker.begin();
        tracker.begin();
        assert!(!tracker.is_idle());

        tracker.complete();
        assert!(!tracker.is_idle());
        tracker.complete();
        assert!(tracker.is_idle());
    }

    #[test]
    fn test_complete_clamps_at_zero() {
        let tracker = Inflight::new();
        tracker.complete();
        assert!(tracker.is_idle());
        tracker.begin();
        assert!(!tracker.is_idle());
    }
}
