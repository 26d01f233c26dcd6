//! The job queue hierarchy.
//!
//! One FIFO main queue accepts every rendering request; each interactive
//! session additionally owns a child queue that serializes and coalesces
//! the option-driven re-renders for its widget. Both share [`JobQueue`],
//! which holds the storage and the allocation protocol; they differ only
//! in their [`FlushPolicy`].
//!
//! Entries are never removed eagerly by `purge` or by coalescing: they
//! are marked aborted in place and dropped when flushing reaches them.
//! Deferred compaction avoids index-shifting races with concurrent
//! invalidation.

use std::collections::VecDeque;

use depict_core::{JobRequest, WidgetId, fingerprint};
use tokio::sync::oneshot;

use crate::scheduler::{Scheduler, Token};

/// Identifier of one queued job, minted by the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

impl JobId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job_{}", self.0)
    }
}

/// Which queue admitted a job. Completion handling needs this to know
/// whether a finished job has a child-queue entry to retire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOrigin {
    Main,
    Child,
}

/// One unit of work travelling from a queue to a worker.
#[derive(Debug, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub widget: WidgetId,
    pub origin: JobOrigin,
    pub request: JobRequest,
}

/// Value delivered on a job's allocation channel: the granted token plus
/// the job payload, or `None` when the job was aborted before a worker
/// became available.
pub(crate) type AllocGrant = Option<(Token, Job)>;

/// A queued job together with its allocation channel.
///
/// The job payload and the allocation sender are taken together when a
/// token is granted; an entry with neither, but not aborted, is in
/// flight on a worker (child queues only — the main queue pops entries
/// at allocation).
pub(crate) struct QueueEntry {
    job_id: JobId,
    widget: WidgetId,
    /// Dedup fingerprint; only child-queue entries carry one.
    fingerprint: Option<String>,
    job: Option<Job>,
    alloc: Option<oneshot::Sender<AllocGrant>>,
    aborted: bool,
}

impl QueueEntry {
    /// Entry for the main queue (no dedup fingerprint).
    pub(crate) fn main(job: Job, alloc: oneshot::Sender<AllocGrant>) -> Self {
        Self {
            job_id: job.id,
            widget: job.widget,
            fingerprint: None,
            job: Some(job),
            alloc: Some(alloc),
            aborted: false,
        }
    }

    /// Entry for a child queue, fingerprinted for coalescing.
    pub(crate) fn child(job: Job, alloc: oneshot::Sender<AllocGrant>) -> Self {
        let print = fingerprint(job.widget, &job.request);
        Self {
            job_id: job.id,
            widget: job.widget,
            fingerprint: Some(print),
            job: Some(job),
            alloc: Some(alloc),
            aborted: false,
        }
    }

    /// Live entries are waiting for a worker: not aborted, allocation
    /// channel still held.
    fn is_live(&self) -> bool {
        !self.aborted && self.alloc.is_some()
    }

    /// Abort the entry, delivering the abort notice on its allocation
    /// channel. The submitter's deferred result resolves to `None`.
    fn abort(&mut self) {
        if let Some(alloc) = self.alloc.take() {
            let _ = alloc.send(None);
        }
        self.job = None;
        self.aborted = true;
    }
}

/// How a queue drains once an entry has been granted a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlushPolicy {
    /// Main queue: hand the entry off and keep draining while tokens
    /// are available.
    DrainAll,
    /// Child queue: at most one entry in flight; the entry stays queued
    /// until completion handling retires it.
    OneInFlight,
}

/// FIFO storage and the allocation protocol shared by both queue kinds.
pub(crate) struct JobQueue {
    entries: VecDeque<QueueEntry>,
    policy: FlushPolicy,
}

impl JobQueue {
    pub(crate) fn new(policy: FlushPolicy) -> Self {
        Self {
            entries: VecDeque::new(),
            policy,
        }
    }

    /// True when no non-aborted entries remain. In-flight entries count
    /// as present: a child queue with a running job is not empty.
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.aborted)
    }

    pub(crate) fn push(&mut self, entry: QueueEntry) {
        self.entries.push_back(entry);
    }

    /// Abort every live entry belonging to `widget`.
    ///
    /// In-flight entries are left alone: a job already on a worker is
    /// not preemptible, and its completion handling retires it.
    pub(crate) fn purge(&mut self, widget: WidgetId) {
        let mut purged = 0usize;
        for entry in &mut self.entries {
            if entry.widget == widget && entry.is_live() {
                entry.abort();
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::debug!("purged {} queued jobs for {}", purged, widget);
        }
    }

    /// Physically remove an entry, used by completion handling to
    /// retire a finished child-queue job.
    pub(crate) fn remove(&mut self, job_id: JobId) {
        self.entries.retain(|e| e.job_id != job_id);
    }

    /// Drain the queue as far as worker availability allows.
    ///
    /// Returns `true` when nothing remains that is blocked only on
    /// worker availability (the queue drained, or its front entry is in
    /// flight and later entries wait on that completion), `false` when
    /// the scheduler ran out of free workers.
    pub(crate) fn flush(&mut self, scheduler: &mut Scheduler) -> bool {
        loop {
            // Lazily compact entries invalidated since the last flush.
            while self.entries.front().is_some_and(|e| e.aborted) {
                self.entries.pop_front();
            }
            let Some(front) = self.entries.front_mut() else {
                return true;
            };
            if front.alloc.is_none() {
                // In flight; blocked on completion, not on workers.
                return true;
            }

            let Some(token) = scheduler.acquire() else {
                return false;
            };
            let job = front.job.take().expect("live entry holds its job");
            let alloc = front.alloc.take().expect("live entry holds its channel");
            if alloc.send(Some((token, job))).is_err() {
                // Submitter vanished before the grant arrived; reclaim
                // the slot and drop the entry.
                scheduler.release(token);
                front.aborted = true;
                continue;
            }

            match self.policy {
                FlushPolicy::DrainAll => {
                    self.entries.pop_front();
                }
                FlushPolicy::OneInFlight => return true,
            }
        }
    }
}

/// The single FIFO queue for ordinary rendering requests, plus the
/// registry of per-session child queues.
pub(crate) struct MainQueue {
    base: JobQueue,
    pub(crate) children: Vec<ChildQueue>,
}

impl MainQueue {
    pub(crate) fn new() -> Self {
        Self {
            base: JobQueue::new(FlushPolicy::DrainAll),
            children: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, entry: QueueEntry) {
        self.base.push(entry);
    }

    pub(crate) fn flush(&mut self, scheduler: &mut Scheduler) -> bool {
        self.base.flush(scheduler)
    }

    /// Register a child queue for `widget`. A no-op when one exists.
    pub(crate) fn add_child(&mut self, widget: WidgetId) {
        if self.child_mut(widget).is_none() {
            self.children.push(ChildQueue::new(widget));
        }
    }

    pub(crate) fn remove_child(&mut self, widget: WidgetId) -> Option<ChildQueue> {
        let index = self.children.iter().position(|c| c.widget == widget)?;
        Some(self.children.remove(index))
    }

    pub(crate) fn child_mut(&mut self, widget: WidgetId) -> Option<&mut ChildQueue> {
        self.children.iter_mut().find(|c| c.widget == widget)
    }

    /// Remove every drained child queue, returning them so the caller
    /// can run the session cleanup hook. Scans the whole registry.
    pub(crate) fn take_empty_children(&mut self) -> Vec<ChildQueue> {
        let mut removed = Vec::new();
        let mut index = 0;
        while index < self.children.len() {
            if self.children[index].is_empty() {
                removed.push(self.children.remove(index));
            } else {
                index += 1;
            }
        }
        removed
    }

    /// Abort every queued job for `widget`, in the main queue and in
    /// every child queue.
    pub(crate) fn purge_all(&mut self, widget: WidgetId) {
        self.base.purge(widget);
        for child in &mut self.children {
            child.purge(widget);
        }
    }
}

/// Per-session queue that serializes one widget's option-driven
/// re-renders and supersedes redundant ones.
pub(crate) struct ChildQueue {
    widget: WidgetId,
    base: JobQueue,
}

impl ChildQueue {
    pub(crate) fn new(widget: WidgetId) -> Self {
        Self {
            widget,
            base: JobQueue::new(FlushPolicy::OneInFlight),
        }
    }

    pub(crate) fn widget(&self) -> WidgetId {
        self.widget
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.base.is_empty()
    }

    pub(crate) fn flush(&mut self, scheduler: &mut Scheduler) -> bool {
        self.base.flush(scheduler)
    }

    pub(crate) fn purge(&mut self, widget: WidgetId) {
        self.base.purge(widget);
    }

    pub(crate) fn remove(&mut self, job_id: JobId) {
        self.base.remove(job_id);
    }

    /// Append an entry, superseding redundant ones.
    ///
    /// Once an older live entry with the new entry's fingerprint is
    /// found, every live entry from that point to the tail except the
    /// newest is aborted: for any fingerprint at most one live entry
    /// survives, always the most recently submitted.
    ///
    /// Returns whether the caller should flush immediately: only when
    /// the queue was empty before the append and nothing was
    /// superseded. Otherwise the entry is driven by the completion of
    /// the in-flight job.
    pub(crate) fn push_coalescing(&mut self, entry: QueueEntry) -> bool {
        let was_empty = self.base.is_empty();
        let newest = entry.job_id;
        let print = entry
            .fingerprint
            .clone()
            .expect("child entries carry a fingerprint");
        self.base.push(entry);

        let mut superseding = false;
        let mut superseded = 0usize;
        for e in &mut self.base.entries {
            if e.job_id == newest {
                continue;
            }
            if !superseding && e.is_live() && e.fingerprint.as_deref() == Some(print.as_str()) {
                superseding = true;
            }
            if superseding && e.is_live() {
                e.abort();
                superseded += 1;
            }
        }
        if superseded > 0 {
            tracing::debug!("{} superseded {} stale jobs for {}", newest, superseded, self.widget);
        }

        was_empty && superseded == 0
    }
}
