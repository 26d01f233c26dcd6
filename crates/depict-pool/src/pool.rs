//! The rendering pool.
//!
//! [`RenderPool`] is the single entry point: callers submit rendering
//! requests and await their outputs, open and close per-widget
//! sessions, and invalidate queued work. All bookkeeping lives in one
//! [`PoolState`] behind a mutex; the lock is never held across an
//! await, so queue transitions are atomic with respect to each other.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use depict_core::{JobOutput, JobRequest, WidgetId};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};

use crate::error::{PoolError, PoolResult};
use crate::queue::{Job, JobId, JobOrigin, MainQueue, QueueEntry};
use crate::scheduler::{Scheduler, Token};
use crate::worker::{EngineFactory, WorkerEvent, WorkerHandle};

/// Pool sizing and startup tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker slots. Worker threads spawn lazily on first
    /// use, so a larger pool costs nothing until it is exercised.
    pub workers: usize,
    /// Interval between readiness pings while a worker thread starts.
    pub handshake_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            handshake_interval: Duration::from_millis(50),
        }
    }
}

/// Callback fired when a session's child queue is removed, either
/// explicitly or because it drained. Runs under the pool lock and must
/// not call back into the pool.
pub type SessionHook = Box<dyn Fn(WidgetId) + Send>;

/// A job that has been handed to a worker and awaits its completion
/// event, keyed by worker index.
struct PendingJob {
    job_id: JobId,
    widget: WidgetId,
    origin: JobOrigin,
    result: oneshot::Sender<Option<JobOutput>>,
}

struct PoolState {
    scheduler: Scheduler,
    queue: MainQueue,
    pending: FxHashMap<usize, PendingJob>,
    next_job: u64,
    on_session_closed: Option<SessionHook>,
}

impl PoolState {
    fn mint_job_id(&mut self) -> JobId {
        let id = JobId::new(self.next_job);
        self.next_job = self.next_job.wrapping_add(1);
        id
    }

    /// Drain child queues first, then the main queue once no child is
    /// blocked on worker availability. Sessions keep their interactive
    /// latency ahead of the batch backlog.
    fn flush(&mut self) {
        let mut all_drained = true;
        for child in &mut self.queue.children {
            all_drained &= child.flush(&mut self.scheduler);
        }
        if all_drained {
            self.queue.flush(&mut self.scheduler);
        }
    }

    /// Record the handoff of `job` to the worker bound to `token` and
    /// return the handle to post it on.
    fn begin_execution(
        &mut self,
        token: Token,
        job: &Job,
        result: oneshot::Sender<Option<JobOutput>>,
    ) -> Arc<WorkerHandle> {
        let (worker, handle) = self.scheduler.bind(token);
        self.pending.insert(
            worker,
            PendingJob {
                job_id: job.id,
                widget: job.widget,
                origin: job.origin,
                result,
            },
        );
        handle
    }

    fn complete(&mut self, event: WorkerEvent) {
        let WorkerEvent::Done {
            worker,
            job_id,
            output,
        } = event;
        self.scheduler.finish(worker);

        let Some(pending) = self.pending.remove(&worker) else {
            tracing::warn!("completion from worker {} with no pending job", worker);
            return;
        };
        if pending.job_id != job_id {
            tracing::warn!(
                "worker {} completed {} while {} was pending",
                worker,
                job_id,
                pending.job_id
            );
        }
        tracing::debug!("{} completed on worker {}", job_id, worker);

        // A child-queue job stays queued while it runs; retire it now.
        if pending.origin == JobOrigin::Child {
            if let Some(child) = self.queue.child_mut(pending.widget) {
                child.remove(job_id);
            }
        }

        self.flush();
        self.remove_drained_sessions();

        // Deliver last: the waiter may already have gone away.
        let _ = pending.result.send(Some(output));
    }

    fn remove_drained_sessions(&mut self) {
        for child in self.queue.take_empty_children() {
            tracing::debug!("session for {} drained, removing child queue", child.widget());
            if let Some(hook) = &self.on_session_closed {
                hook(child.widget());
            }
        }
    }
}

/// Shared pool of rendering workers with a main queue and per-session
/// child queues.
pub struct RenderPool {
    state: Arc<Mutex<PoolState>>,
}

impl RenderPool {
    /// Create a pool with `config.workers` slots. Worker threads are
    /// not spawned until a job first reaches each slot.
    pub fn new(config: PoolConfig, factory: EngineFactory) -> PoolResult<Self> {
        if config.workers == 0 {
            return Err(PoolError::NoWorkers);
        }
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let scheduler = Scheduler::new(
            config.workers,
            config.handshake_interval,
            factory,
            events_tx,
        );
        let state = Arc::new(Mutex::new(PoolState {
            scheduler,
            queue: MainQueue::new(),
            pending: FxHashMap::default(),
            next_job: 0,
            on_session_closed: None,
        }));
        tokio::spawn(completion_loop(Arc::downgrade(&state), events_rx));
        tracing::info!("render pool started with {} worker slots", config.workers);
        Ok(Self { state })
    }

    /// Install the session cleanup callback.
    pub fn on_session_closed(&self, hook: SessionHook) {
        self.state.lock().unwrap().on_session_closed = Some(hook);
    }

    /// Submit a rendering request for `widget` and await its output.
    ///
    /// Requests for widgets with an active session route through that
    /// session's child queue, where redundant requests coalesce;
    /// everything else queues FIFO on the main queue. Resolves to
    /// `None` when the job is aborted before or during execution.
    ///
    /// Once a worker has been granted, the returned future must be
    /// polled to completion or the worker slot is reclaimed and the
    /// job dropped.
    pub async fn submit(&self, widget: WidgetId, request: JobRequest) -> Option<JobOutput> {
        let (alloc_tx, alloc_rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            let id = state.mint_job_id();
            let sessioned = state.queue.child_mut(widget).is_some();
            let origin = if sessioned {
                JobOrigin::Child
            } else {
                JobOrigin::Main
            };
            let job = Job {
                id,
                widget,
                origin,
                request,
            };
            tracing::debug!("{} queued for {} ({:?})", id, widget, origin);
            if sessioned {
                let entry = QueueEntry::child(job, alloc_tx);
                let child = state
                    .queue
                    .child_mut(widget)
                    .expect("session checked above");
                if child.push_coalescing(entry) {
                    let PoolState {
                        scheduler, queue, ..
                    } = &mut *state;
                    if let Some(child) = queue.child_mut(widget) {
                        child.flush(scheduler);
                    }
                }
            } else {
                state.queue.push(QueueEntry::main(job, alloc_tx));
                state.flush();
            }
        }

        let (token, job) = match alloc_rx.await {
            Ok(Some(grant)) => grant,
            // Aborted while queued, or the pool state was dropped.
            _ => return None,
        };

        let (result_tx, result_rx) = oneshot::channel();
        let handle = {
            let mut state = self.state.lock().unwrap();
            state.begin_execution(token, &job, result_tx)
        };
        handle.post(job).await;

        result_rx.await.ok().flatten()
    }

    /// Open a session for `widget`, creating its child queue. A no-op
    /// when a session already exists.
    pub fn begin_session(&self, widget: WidgetId) {
        let mut state = self.state.lock().unwrap();
        tracing::debug!("session opened for {}", widget);
        state.queue.add_child(widget);
    }

    /// Close `widget`'s session. Queued jobs in its child queue are
    /// aborted; an in-flight job runs to completion.
    pub fn end_session(&self, widget: WidgetId) {
        let mut state = self.state.lock().unwrap();
        let Some(mut child) = state.queue.remove_child(widget) else {
            return;
        };
        child.purge(widget);
        tracing::debug!("session closed for {}", widget);
        if let Some(hook) = &state.on_session_closed {
            hook(widget);
        }
    }

    /// Abort every queued job for `widget` across all queues. In-flight
    /// jobs are not interrupted.
    pub fn abort_jobs(&self, widget: WidgetId) {
        let mut state = self.state.lock().unwrap();
        state.queue.purge_all(widget);
        state.remove_drained_sessions();
    }

    pub fn session_active(&self, widget: WidgetId) -> bool {
        self.state.lock().unwrap().queue.child_mut(widget).is_some()
    }

    pub fn worker_count(&self) -> usize {
        self.state.lock().unwrap().scheduler.worker_count()
    }
}

/// Pump completion events from worker threads back into the pool
/// state. Holds only a weak reference so dropping the pool shuts the
/// loop down once the workers hang up.
async fn completion_loop(
    state: Weak<Mutex<PoolState>>,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(state) = state.upgrade() else {
            break;
        };
        state.lock().unwrap().complete(event);
    }
    tracing::debug!("completion loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use depict_core::{
        EngineResult, LayoutOptions, MatchResult, NativeLayout, StructureEngine,
    };

    struct EchoEngine;

    impl StructureEngine for EchoEngine {
        fn layout_native(
            &mut self,
            molecule: &str,
            _options: &LayoutOptions,
        ) -> EngineResult<NativeLayout> {
            Ok(NativeLayout {
                structure: molecule.to_string(),
                has_own_coordinates: false,
            })
        }

        fn layout_aligned(
            &mut self,
            molecule: &str,
            _scaffolds: &[String],
            _options: &LayoutOptions,
        ) -> EngineResult<depict_core::AlignedLayout> {
            Ok(depict_core::AlignedLayout {
                structure: molecule.to_string(),
                match_result: None,
                has_own_coordinates: false,
            })
        }

        fn layout_rebuild(
            &mut self,
            molecule: &str,
            _options: &LayoutOptions,
        ) -> EngineResult<String> {
            Ok(molecule.to_string())
        }

        fn render_image(
            &mut self,
            structure: &str,
            _options: &depict_core::DrawOptions,
        ) -> EngineResult<String> {
            Ok(format!("<svg>{structure}</svg>"))
        }

        fn compute_overlap(
            &mut self,
            _molecule: &str,
            _scaffolds: &[String],
            _options: &LayoutOptions,
        ) -> EngineResult<Option<MatchResult>> {
            Ok(None)
        }
    }

    fn echo_factory() -> EngineFactory {
        Arc::new(|| Box::new(EchoEngine))
    }

    fn layout_request(molecule: &str) -> JobRequest {
        JobRequest::LayoutNative {
            molecule: molecule.to_string(),
            options: LayoutOptions::default(),
        }
    }

    #[test]
    fn test_zero_workers_rejected() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let _guard = runtime.enter();
        let result = RenderPool::new(
            PoolConfig {
                workers: 0,
                ..PoolConfig::default()
            },
            echo_factory(),
        );
        assert!(matches!(result, Err(PoolError::NoWorkers)));
    }

    #[tokio::test]
    async fn test_submit_resolves_with_output() {
        let pool = RenderPool::new(PoolConfig::default(), echo_factory()).unwrap();
        let output = pool
            .submit(WidgetId::new(1), layout_request("c1ccccc1"))
            .await;
        match output {
            Some(JobOutput::Layout { structure, .. }) => {
                assert_eq!(structure.as_deref(), Some("c1ccccc1"));
            }
            other => panic!("unexpected output: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let pool = RenderPool::new(PoolConfig::default(), echo_factory()).unwrap();
        let widget = WidgetId::new(3);

        assert!(!pool.session_active(widget));
        pool.begin_session(widget);
        assert!(pool.session_active(widget));
        // Reopening is a no-op.
        pool.begin_session(widget);
        pool.end_session(widget);
        assert!(!pool.session_active(widget));
        // Closing an absent session is a no-op.
        pool.end_session(widget);
    }

    #[tokio::test]
    async fn test_end_session_fires_hook() {
        let pool = RenderPool::new(PoolConfig::default(), echo_factory()).unwrap();
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        pool.on_session_closed(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        pool.begin_session(WidgetId::new(9));
        pool.end_session(WidgetId::new(9));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }
}
