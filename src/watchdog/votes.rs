//! Bounded vote memory.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use jiff::{SignedDuration, Timestamp};

/// Number of votes remembered per target.
pub const VOTE_CAPACITY: usize = 20;

/// A vote to evict `pod_name`, cast at `time`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vote {
    pub pod_name: String,
    pub time: Timestamp,
}

/// Fixed-capacity ring of votes. Each new vote overwrites the next slot,
/// so at most [`VOTE_CAPACITY`] votes are ever live.
#[derive(Clone, Debug, Default)]
pub struct VoteRing {
    slots: [Option<Vote>; VOTE_CAPACITY],
    cursor: usize,
}

impl VoteRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cast(&mut self, vote: Vote) {
        self.cursor = (self.cursor + 1) % VOTE_CAPACITY;
        if let Some(slot) = self.slots.get_mut(self.cursor) {
            *slot = Some(vote);
        }
    }

    /// Occupied slots, in no particular order.
    pub fn votes(&self) -> impl Iterator<Item = &Vote> {
        self.slots.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.votes().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live votes per pod. A vote is live when its pod is in `candidates`
    /// and it is no older than `ttl`.
    pub fn tally(
        &self,
        now: Timestamp,
        ttl: Duration,
        candidates: &BTreeSet<String>,
    ) -> BTreeMap<String, usize> {
        let mut tally = BTreeMap::new();
        for vote in self.votes() {
            if candidates.contains(&vote.pod_name) && within(now, vote.time, ttl) {
                *tally.entry(vote.pod_name.clone()).or_insert(0) += 1;
            }
        }
        tally
    }
}

/// Whether `then` is no more than `limit` before `now`.
pub(crate) fn within(now: Timestamp, then: Timestamp, limit: Duration) -> bool {
    let limit = SignedDuration::try_from(limit).unwrap_or(SignedDuration::MAX);
    now.duration_since(then) <= limit
}
