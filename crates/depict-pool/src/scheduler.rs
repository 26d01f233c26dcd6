//! Worker slot allocation via single-use tokens.

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::mpsc;

use crate::worker::{EngineFactory, WorkerEvent, WorkerHandle};

/// An opaque, single-use claim on one worker slot.
///
/// Valid for exactly one submission; consumed tokens are never reused.
/// The underlying counter wraps at `u64::MAX`, which cannot collide in
/// practice because the token→worker map is drained as each token is
/// consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

impl Token {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "token_{}", self.0)
    }
}

/// Allocates worker slots and tracks which token claims which worker.
///
/// Handles are created eagerly (they are cheap); the engine-hosting
/// threads behind them spawn lazily on first post.
pub struct Scheduler {
    workers: Vec<Arc<WorkerHandle>>,
    next_token: u64,
    bound: FxHashMap<Token, usize>,
}

impl Scheduler {
    pub(crate) fn new(
        workers: usize,
        handshake_interval: Duration,
        factory: EngineFactory,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        let workers = (0..workers)
            .map(|index| {
                Arc::new(WorkerHandle::new(
                    index,
                    handshake_interval,
                    factory.clone(),
                    events.clone(),
                ))
            })
            .collect();
        Self {
            workers,
            next_token: 0,
            bound: FxHashMap::default(),
        }
    }

    /// Reserve a free worker, minting a fresh token bound to it.
    /// Returns `None` when every worker is allocated.
    pub fn acquire(&mut self) -> Option<Token> {
        let index = self.workers.iter().position(|w| !w.is_allocated())?;
        self.workers[index].set_allocated(true);

        let token = Token(self.next_token);
        self.next_token = self.next_token.wrapping_add(1);
        self.bound.insert(token, index);
        tracing::debug!("{} bound to worker {}", token, index);
        Some(token)
    }

    /// Consume a token, yielding the worker it claims.
    ///
    /// # Panics
    ///
    /// Panics on an unknown or already-consumed token: that is a
    /// scheduler bug, not a recoverable condition.
    pub fn bind(&mut self, token: Token) -> (usize, Arc<WorkerHandle>) {
        let index = self
            .bound
            .remove(&token)
            .unwrap_or_else(|| panic!("unknown worker {token}"));
        (index, self.workers[index].clone())
    }

    /// Reclaim a token whose submitter went away before using it.
    pub fn release(&mut self, token: Token) {
        if let Some(index) = self.bound.remove(&token) {
            self.workers[index].set_allocated(false);
        }
    }

    /// Free a worker after its job completed.
    pub fn finish(&mut self, worker: usize) {
        let handle = &self.workers[worker];
        handle.set_busy(false);
        handle.set_allocated(false);
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    #[cfg(test)]
    pub(crate) fn worker(&self, index: usize) -> &WorkerHandle {
        &self.workers[index]
    }
}
