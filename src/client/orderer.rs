//! RFC 7641 §3.4 notification reordering detection.

use std::time::{Duration, Instant};

use crate::client::u24::u24;

/// After this long without a fresher notification, any incoming sequence number is accepted
/// regardless of its relation to the last one seen (RFC 7641 §3.4).
const REORDER_FORGET_AFTER: Duration = Duration::from_secs(128);

/// Half the Observe sequence space; the boundary for the wraparound comparison.
const SEQUENCE_HALF_SPACE: u32 = 1 << 23;

/// Tracks the most recently delivered Observe sequence number for one relation and decides
/// whether each incoming notification is fresher than it.
#[derive(Debug, Default)]
pub(crate) struct ObserveOrderer {
    last: Option<(u24, Instant)>,
}

impl ObserveOrderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the RFC 7641 freshness test to an incoming sequence number.  Returns true and
    /// advances the state iff the notification must be delivered; stale notifications leave
    /// the state untouched.
    pub fn accept(&mut self, incoming: u24, now: Instant) -> bool {
        let fresh = match self.last {
            None => true,
            Some((last, last_at)) => {
                let v1 = u32::from(last);
                let v2 = u32::from(incoming);
                (v1 < v2 && v2 - v1 < SEQUENCE_HALF_SPACE)
                    || (v1 > v2 && v1 - v2 > SEQUENCE_HALF_SPACE)
                    || now > last_at + REORDER_FORGET_AFTER
            }
        };
        if fresh {
            self.last = Some((incoming, now));
        }
        fresh
    }
}
