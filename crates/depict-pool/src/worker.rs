//! Worker handles for engine-hosting background threads.
//!
//! Each `WorkerHandle` is the orchestrator-side proxy for one long-lived
//! thread hosting a heavyweight `StructureEngine` instance. The thread is
//! spawned lazily on first use and answers a one-time ping/pong readiness
//! handshake before accepting real work, since engine construction can
//! take arbitrarily long.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use depict_core::{StructureEngine, run_request};
use tokio::sync::{mpsc, oneshot};

use crate::queue::{Job, JobId};

/// Factory producing one engine instance per worker thread.
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn StructureEngine> + Send + Sync>;

/// Request sent from the orchestrator to a worker thread.
pub(crate) enum WorkerRequest {
    /// Readiness probe; the worker answers as soon as its engine is up.
    Ping(oneshot::Sender<()>),
    /// Execute one job.
    Run(Job),
}

/// Completion event sent from a worker thread back to the pool.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// A job finished; the worker is idle again.
    Done {
        worker: usize,
        job_id: JobId,
        output: depict_core::JobOutput,
    },
}

/// Orchestrator-side proxy for one engine-hosting worker thread.
///
/// State transitions per job: unallocated → allocated (reserved by the
/// scheduler) → busy (executing) → freed. `ready` is set once after the
/// handshake and never reset for the lifetime of the handle.
pub struct WorkerHandle {
    index: usize,
    allocated: AtomicBool,
    busy: AtomicBool,
    ready: AtomicBool,
    handshake_interval: Duration,
    factory: EngineFactory,
    events: mpsc::UnboundedSender<WorkerEvent>,
    /// Sender side of the worker thread's request channel, created on
    /// first use. The async mutex serializes lazy spawn and handshake.
    link: tokio::sync::Mutex<Option<mpsc::UnboundedSender<WorkerRequest>>>,
}

impl WorkerHandle {
    pub(crate) fn new(
        index: usize,
        handshake_interval: Duration,
        factory: EngineFactory,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            index,
            allocated: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            handshake_interval,
            factory,
            events,
            link: tokio::sync::Mutex::new(None),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether the scheduler has reserved this worker for a token.
    pub fn is_allocated(&self) -> bool {
        self.allocated.load(Ordering::SeqCst)
    }

    pub(crate) fn set_allocated(&self, allocated: bool) {
        self.allocated.store(allocated, Ordering::SeqCst);
    }

    /// Whether a job is currently executing on this worker.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    /// Whether the readiness handshake has completed.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Forward a job to the worker thread, spawning it and performing
    /// the readiness handshake on first use.
    ///
    /// # Panics
    ///
    /// Panics if the worker is not allocated or is already busy (both
    /// are protocol violations in the scheduler, not runtime
    /// conditions), if the worker thread cannot be spawned, or if the
    /// thread has terminated.
    pub async fn post(&self, job: Job) {
        if !self.is_allocated() {
            panic!("worker {} must be acquired before posting a job", self.index);
        }
        if self.is_busy() {
            panic!("worker {} is already executing a job", self.index);
        }
        self.set_busy(true);

        let mut link = self.link.lock().await;
        let sender = match link.as_ref() {
            Some(sender) => sender.clone(),
            None => {
                let sender = self.spawn_thread();
                *link = Some(sender.clone());
                sender
            }
        };

        if !self.is_ready() {
            self.handshake(&sender).await;
            self.ready.store(true, Ordering::SeqCst);
            tracing::info!("worker {} ready", self.index);
        }

        tracing::debug!("worker {} running {}", self.index, job.id);
        if sender.send(WorkerRequest::Run(job)).is_err() {
            panic!("worker thread {} terminated unexpectedly", self.index);
        }
    }

    /// Spawn the engine-hosting thread.
    fn spawn_thread(&self) -> mpsc::UnboundedSender<WorkerRequest> {
        let (tx, rx) = mpsc::unbounded_channel();
        let index = self.index;
        let factory = self.factory.clone();
        let events = self.events.clone();

        tracing::debug!("spawning worker thread {}", index);
        std::thread::Builder::new()
            .name(format!("depict-worker-{index}"))
            .spawn(move || worker_main(index, rx, events, factory))
            .unwrap_or_else(|e| panic!("failed to spawn worker thread {index}: {e}"));

        tx
    }

    /// Ping the worker on a fixed interval until it answers.
    ///
    /// Engine construction dominates worker startup, so the first pings
    /// routinely go unanswered. Retries indefinitely: a worker that
    /// never comes up is a fatal environment condition, not a per-job
    /// error.
    async fn handshake(&self, sender: &mpsc::UnboundedSender<WorkerRequest>) {
        loop {
            let (pong_tx, pong_rx) = oneshot::channel();
            if sender.send(WorkerRequest::Ping(pong_tx)).is_err() {
                panic!("worker thread {} terminated during startup", self.index);
            }
            match tokio::time::timeout(self.handshake_interval, pong_rx).await {
                Ok(Ok(())) => return,
                _ => {
                    tracing::trace!("worker {} not ready yet, retrying ping", self.index);
                }
            }
        }
    }
}

/// Worker thread entry point: build the engine, then serve requests
/// until the orchestrator drops the link.
fn worker_main(
    index: usize,
    mut requests: mpsc::UnboundedReceiver<WorkerRequest>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    factory: EngineFactory,
) {
    let mut engine = factory();
    tracing::debug!("worker {} engine initialized", index);

    while let Some(request) = requests.blocking_recv() {
        match request {
            WorkerRequest::Ping(reply) => {
                // The handshake may have given up on this ping already.
                let _ = reply.send(());
            }
            WorkerRequest::Run(job) => {
                let job_id = job.id;
                let output = run_request(engine.as_mut(), job.request);
                if events
                    .send(WorkerEvent::Done {
                        worker: index,
                        job_id,
                        output,
                    })
                    .is_err()
                {
                    // Pool is gone; nothing left to report to.
                    break;
                }
            }
        }
    }
    tracing::debug!("worker {} shutting down", index);
}
