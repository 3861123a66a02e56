use std::cmp::Ordering;
use tokio::time::Instant;

/// Identifies a pending entry in a [`DeadlineQueue`](crate::DeadlineQueue).
///
/// A key is returned by `add` and is required to later remove the entry. It is
/// distinct from the entry's value: two entries holding equal values are still
/// independent. A key is invalidated the moment its entry is removed,
/// delivered, drained or purged.
///
/// Keys order by deadline first and by insertion sequence second, so entries
/// that share a deadline pop in the order they were added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryKey {
    deadline: Instant,
    sequence: u64,
}

impl EntryKey {
    pub(crate) fn new(deadline: Instant, sequence: u64) -> Self {
        EntryKey { deadline, sequence }
    }

    /// The instant at which this entry becomes due.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Ord for EntryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for EntryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
