//! Stable bucket identifiers for Passenger worker processes.

use std::collections::HashMap;

/// Mapping from process PIDs to small, dense bucket indices that survive process restarts.
///
/// Passenger restarts worker processes on a rolling schedule, so labeling metrics by PID would make
/// label cardinality grow without bound. Instead, each PID is assigned a bucket index, and
/// [`Self::update()`] carries these indices over from one status snapshot to the next:
///
/// - A process present in both snapshots keeps its bucket.
/// - Buckets of retired processes are reused by new processes, lowest index first.
/// - New buckets are allocated only when the number of processes grows.
///
/// # Ordering assumption
///
/// Slot reuse relies on `passenger-status` listing processes in ascending birth order (i.e., with
/// restarted processes appended at the end). If this assumption is violated, surviving processes
/// still keep their buckets, but a new process may take over the "wrong" retired bucket; the
/// monitoring system then observes a counter reset for that bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessBuckets {
    by_pid: HashMap<String, usize>,
}

impl ProcessBuckets {
    /// Creates an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the bucket index assigned to `pid`, if any.
    pub fn get(&self, pid: &str) -> Option<usize> {
        self.by_pid.get(pid).copied()
    }

    /// Returns the number of tracked processes.
    pub fn len(&self) -> usize {
        self.by_pid.len()
    }

    /// Checks whether this mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.by_pid.is_empty()
    }

    /// Iterates over `(pid, bucket)` pairs in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, usize)> + '_ {
        self.by_pid.iter().map(|(pid, &bucket)| (pid.as_str(), bucket))
    }

    /// Computes the mapping for the next snapshot with `pids` listed in wire order.
    ///
    /// Duplicate PIDs are expected to be rejected before calling this method; if present, only
    /// the first occurrence is assigned a bucket.
    #[must_use]
    pub fn update<'a, I>(&self, pids: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        // `found[idx]` holds the surviving PID for bucket `idx`; `None` marks a reclaimable bucket.
        let mut found: Vec<Option<&str>> = vec![None; self.slot_count()];
        let mut missing = vec![];
        for pid in pids {
            match self.by_pid.get(pid) {
                Some(&idx) => found[idx] = Some(pid),
                None if !missing.contains(&pid) => missing.push(pid),
                None => { /* duplicate of a new PID */ }
            }
        }

        let slot_count = found.len();
        let mut by_pid = HashMap::with_capacity(slot_count.max(missing.len()));
        let mut missing = missing.into_iter();
        for (idx, pid) in found.into_iter().enumerate() {
            if let Some(pid) = pid.or_else(|| missing.next()) {
                by_pid.insert(pid.to_owned(), idx);
            }
        }
        // Remaining new processes extend the bucket space.
        for (offset, pid) in missing.enumerate() {
            by_pid.insert(pid.to_owned(), slot_count + offset);
        }
        Self { by_pid }
    }

    /// Size of the bucket space, i.e. one more than the highest index in use. Equals [`Self::len()`]
    /// unless the mapping has shrunk while keeping a survivor in a high bucket.
    fn slot_count(&self) -> usize {
        self.by_pid
            .values()
            .max()
            .map_or(0, |&max_idx| (max_idx + 1).max(self.by_pid.len()))
    }
}

impl<P: Into<String>> FromIterator<(P, usize)> for ProcessBuckets {
    fn from_iter<T: IntoIterator<Item = (P, usize)>>(iter: T) -> Self {
        Self {
            by_pid: iter.into_iter().map(|(pid, idx)| (pid.into(), idx)).collect(),
        }
    }
}
