//! Hybrid Logical Clock generation, parsing and merging.
//!
//! Wire format: `<millis:15 digits>:<counter:5 digits>:<nodeId>`, zero-padded
//! so the string form sorts lexicographically the same way the tuple
//! `(millis, counter, node_id)` does.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{DbError, DbResult};

/// A single hybrid logical timestamp.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hlc {
    pub millis: i64,
    pub counter: u32,
    pub node_id: String,
}

impl Hlc {
    pub fn new(millis: i64, counter: u32, node_id: impl Into<String>) -> Self {
        Self { millis, counter, node_id: node_id.into() }
    }

    /// Parse the `ms:counter:node` wire format.
    pub fn parse(s: &str) -> DbResult<Self> {
        let mut parts = s.splitn(3, ':');
        let ms = parts
            .next()
            .ok_or_else(|| DbError::InvalidValue(format!("malformed hlc: {s}")))?;
        let ctr = parts
            .next()
            .ok_or_else(|| DbError::InvalidValue(format!("malformed hlc: {s}")))?;
        let node = parts
            .next()
            .ok_or_else(|| DbError::InvalidValue(format!("malformed hlc: {s}")))?;
        let millis = ms
            .parse::<i64>()
            .map_err(|_| DbError::InvalidValue(format!("malformed hlc millis: {s}")))?;
        let counter = ctr
            .parse::<u32>()
            .map_err(|_| DbError::InvalidValue(format!("malformed hlc counter: {s}")))?;
        Ok(Hlc::new(millis, counter, node.to_string()))
    }
}

impl std::fmt::Display for Hlc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:015}:{:05}:{}", self.millis, self.counter, self.node_id)
    }
}

/// Process-wide, guarded HLC generator. A single instance is shared by every
/// write path operation so that `(last_millis, last_counter)` advances
/// monotonically under concurrent callers.
pub struct HlcClock {
    node_id: String,
    state: Mutex<(i64, u32)>,
}

impl HlcClock {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self { node_id: node_id.into(), state: Mutex::new((0, 0)) }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn wall_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }

    /// Generate the next timestamp for this clock.
    ///
    /// - if `wall > last_millis`: advance millis, reset counter to 0
    /// - else: bump the counter
    pub fn now(&self) -> Hlc {
        let wall = Self::wall_millis();
        let mut state = self.state.lock().expect("hlc clock mutex poisoned");
        let (last_ms, last_ctr) = *state;
        let (ms, ctr) = if wall > last_ms { (wall, 0) } else { (last_ms, last_ctr + 1) };
        *state = (ms, ctr);
        tracing::trace!(millis = ms, counter = ctr, "hlc now()");
        Hlc::new(ms, ctr, self.node_id.clone())
    }

    /// Merge in a timestamp received from a remote peer, following the
    /// standard four-case HLC receive rule.
    pub fn update(&self, received: &Hlc) -> Hlc {
        let wall = Self::wall_millis();
        let mut state = self.state.lock().expect("hlc clock mutex poisoned");
        let (last_ms, last_ctr) = *state;
        let (ms, ctr) = if wall > last_ms && wall > received.millis {
            (wall, 0)
        } else if last_ms == received.millis {
            (last_ms, last_ctr.max(received.counter) + 1)
        } else if last_ms > received.millis {
            (last_ms, last_ctr + 1)
        } else {
            (received.millis, received.counter + 1)
        };
        *state = (ms, ctr);
        tracing::trace!(millis = ms, counter = ctr, "hlc update()");
        Hlc::new(ms, ctr, self.node_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic_lexically() {
        let clock = HlcClock::new("n1");
        let a = clock.now();
        let b = clock.now();
        assert!(a.to_string() < b.to_string());
        assert!(a < b);
    }

    #[test]
    fn parse_round_trips_display() {
        let h = Hlc::new(123, 4, "n1");
        let s = h.to_string();
        let parsed = Hlc::parse(&s).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn update_merges_equal_millis_by_counter() {
        let clock = HlcClock::new("n1");
        let first = clock.now();
        let received = Hlc::new(first.millis, first.counter + 5, "n2");
        let merged = clock.update(&received);
        assert_eq!(merged.millis, first.millis);
        assert_eq!(merged.counter, first.counter + 6);
    }

    #[test]
    fn subsequent_now_exceeds_merged_remote() {
        let clock = HlcClock::new("n1");
        let remote = Hlc::new(9_999_999_999_999, 3, "remote");
        let merged = clock.update(&remote);
        let next = clock.now();
        assert!(next > merged);
    }

    #[test]
    fn lexical_string_order_matches_struct_order() {
        let a = Hlc::new(5, 1, "a");
        let b = Hlc::new(5, 2, "a");
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }
}
