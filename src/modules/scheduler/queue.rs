//! Pending job queue.
//!
//! A max-heap whose entries compare by priority (higher first), then by
//! scheduled time (earlier first), then by insertion sequence.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tokio::time::Instant;

use super::job::{Priority, ScrapingJob};

#[derive(Debug)]
struct QueueEntry {
    priority: Priority,
    scheduled_at: Instant,
    seq: u64,
    job: ScrapingJob,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.scheduled_at.cmp(&self.scheduled_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Default)]
pub(crate) struct JobQueue {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

impl JobQueue {
    pub fn push(&mut self, job: ScrapingJob) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueEntry {
            priority: job.priority,
            scheduled_at: job.scheduled_at,
            seq,
            job,
        });
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn contains_source(&self, source_id: &str) -> bool {
        self.heap.iter().any(|entry| entry.job.source_id == source_id)
    }

    /// Removes and returns the job queued for `source_id`, if any.
    pub fn take_source(&mut self, source_id: &str) -> Option<ScrapingJob> {
        let mut taken = None;
        let entries = std::mem::take(&mut self.heap).into_vec();
        for entry in entries {
            if taken.is_none() && entry.job.source_id == source_id {
                taken = Some(entry.job);
            } else {
                self.heap.push(entry);
            }
        }
        taken
    }

    /// Pops up to `limit` jobs due at `now`, best first.
    ///
    /// Jobs that are not due yet go back with their original sequence, so a
    /// high priority job waiting for its slot never hides due work behind it.
    pub fn pop_due(&mut self, now: Instant, limit: usize) -> Vec<ScrapingJob> {
        let mut due = Vec::new();
        let mut deferred = Vec::new();
        while due.len() < limit {
            let Some(entry) = self.heap.pop() else { break };
            if entry.scheduled_at <= now {
                due.push(entry.job);
            } else {
                deferred.push(entry);
            }
        }
        self.heap.extend(deferred);
        due
    }

    /// Due jobs in dispatch order, without removing them.
    pub fn peek_due(&self, now: Instant, limit: usize) -> Vec<&ScrapingJob> {
        let mut entries: Vec<&QueueEntry> = self
            .heap
            .iter()
            .filter(|entry| entry.scheduled_at <= now)
            .collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().take(limit).map(|entry| &entry.job).collect()
    }
}
