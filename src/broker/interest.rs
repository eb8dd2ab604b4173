//! Subscription interest ledger.
//!
//! Interest in a named stream is never stored authoritatively anywhere. Every peer derives it by
//! replaying the subscribe/unsubscribe broadcasts it has observed, keyed per requester so repeats
//! from one requester increment and decrement a counter rather than double-counting. The ledger
//! keeps the observed broadcasts as an append-only log of entries alongside the derived counts,
//! which is the snapshot a freshly promoted leader replays to resume production.

use std::collections::HashMap;

/// One observed subscribe (+1) or unsubscribe (-1) broadcast.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterestEntry {
    /// The requester which broadcast the change.
    pub requester_id: String,
    /// The stream the change applies to.
    pub stream_name: String,
    /// The interest delta, `+1` or `-1`.
    pub delta: i64,
}

/// The replay-reconstructed interest state of all named streams, as observed by one peer.
#[derive(Default)]
pub struct InterestLedger {
    /// The append-only log of observed interest changes.
    entries: Vec<InterestEntry>,
    /// Derived interest counts, stream → requester → count.
    counts: HashMap<String, HashMap<String, u64>>,
}

impl InterestLedger {
    /// Create a new instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observed interest change, returning the stream's new total interest.
    ///
    /// Per-requester counts are floored at zero: an unsubscribe from a requester with no
    /// recorded interest is appended to the log but changes no count.
    pub fn apply(&mut self, requester_id: &str, stream_name: &str, delta: i64) -> u64 {
        self.entries.push(InterestEntry {
            requester_id: requester_id.to_string(),
            stream_name: stream_name.to_string(),
            delta,
        });
        let requesters = self.counts.entry(stream_name.to_string()).or_default();
        let count = requesters.entry(requester_id.to_string()).or_insert(0);
        if delta > 0 {
            *count = count.saturating_add(delta as u64);
        } else {
            *count = count.saturating_sub(delta.unsigned_abs());
        }
        if *count == 0 {
            requesters.remove(requester_id);
        }
        self.count(stream_name)
    }

    /// The total derived interest in the given stream across all requesters.
    pub fn count(&self, stream_name: &str) -> u64 {
        self.counts.get(stream_name).map(|requesters| requesters.values().sum()).unwrap_or(0)
    }

    /// The interest of one requester in the given stream.
    pub fn requester_count(&self, stream_name: &str, requester_id: &str) -> u64 {
        self.counts
            .get(stream_name)
            .and_then(|requesters| requesters.get(requester_id))
            .copied()
            .unwrap_or(0)
    }

    /// All stream names with interest greater than zero, the snapshot replayed on handover.
    pub fn interested_streams(&self) -> Vec<String> {
        self.counts
            .iter()
            .filter(|(_, requesters)| requesters.values().sum::<u64>() > 0)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The append-only log of every observed interest change.
    pub fn history(&self) -> &[InterestEntry] {
        &self.entries
    }
}
