//! End-to-end scheduling behavior: queue ordering, session queues,
//! coalescing, and invalidation, driven through real worker threads.

use std::collections::HashMap;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use depict_core::{
    AlignedLayout, DrawOptions, EngineResult, JobOutput, JobRequest, LayoutOptions, MatchResult,
    NativeLayout, StructureEngine, WidgetId,
};
use depict_pool::{EngineFactory, PoolConfig, RenderPool};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Shared control for [`GatedEngine`]: layout jobs announce their
/// molecule when they start, then block until the test releases them.
/// Gating only layout keeps the other engine calls free-running.
struct GateControl {
    started: mpsc::UnboundedSender<String>,
    gates: Mutex<HashMap<String, (std_mpsc::Sender<()>, Option<std_mpsc::Receiver<()>>)>>,
}

impl GateControl {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (started, started_rx) = mpsc::unbounded_channel();
        let control = Arc::new(Self {
            started,
            gates: Mutex::new(HashMap::new()),
        });
        (control, started_rx)
    }

    /// Unblock the layout job for `molecule`. May be called before the
    /// job starts; the release is buffered.
    fn release(&self, molecule: &str) {
        let mut gates = self.gates.lock().unwrap();
        let (tx, _) = gates
            .entry(molecule.to_string())
            .or_insert_with(|| {
                let (tx, rx) = std_mpsc::channel();
                (tx, Some(rx))
            });
        let _ = tx.send(());
    }

    /// Called from the worker thread: announce the start and block
    /// until released.
    fn wait(&self, molecule: &str) {
        let _ = self.started.send(molecule.to_string());
        let rx = {
            let mut gates = self.gates.lock().unwrap();
            let (_, rx) = gates
                .entry(molecule.to_string())
                .or_insert_with(|| {
                    let (tx, rx) = std_mpsc::channel();
                    (tx, Some(rx))
                });
            rx.take()
        };
        if let Some(rx) = rx {
            let _ = rx.recv();
        }
    }
}

struct GatedEngine {
    control: Arc<GateControl>,
}

impl StructureEngine for GatedEngine {
    fn layout_native(
        &mut self,
        molecule: &str,
        _options: &LayoutOptions,
    ) -> EngineResult<NativeLayout> {
        self.control.wait(molecule);
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
    ) -> EngineResult<AlignedLayout> {
        Ok(AlignedLayout {
            structure: molecule.to_string(),
            match_result: None,
            has_own_coordinates: false,
        })
    }

    fn layout_rebuild(&mut self, molecule: &str, _options: &LayoutOptions) -> EngineResult<String> {
        Ok(molecule.to_string())
    }

    fn render_image(&mut self, structure: &str, _options: &DrawOptions) -> EngineResult<String> {
        Ok(format!("<svg>{structure}</svg>"))
    }

    fn compute_overlap(
        &mut self,
        _molecule: &str,
        _scaffolds: &[String],
        _options: &LayoutOptions,
    ) -> EngineResult<Option<MatchResult>> {
        Ok(Some(MatchResult {
            scaffold_index: 0,
            atom_map: vec![(0, 0)],
        }))
    }
}

fn gated_factory(control: Arc<GateControl>) -> EngineFactory {
    Arc::new(move || {
        Box::new(GatedEngine {
            control: Arc::clone(&control),
        })
    })
}

fn layout(molecule: &str) -> JobRequest {
    JobRequest::LayoutNative {
        molecule: molecule.to_string(),
        options: LayoutOptions::default(),
    }
}

fn pool(workers: usize, control: &Arc<GateControl>) -> Arc<RenderPool> {
    let config = PoolConfig {
        workers,
        ..PoolConfig::default()
    };
    Arc::new(RenderPool::new(config, gated_factory(Arc::clone(control))).unwrap())
}

async fn next_started(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a job to start")
        .expect("start channel closed")
}

async fn assert_idle(rx: &mut mpsc::UnboundedReceiver<String>) {
    assert!(
        timeout(Duration::from_millis(100), rx.recv()).await.is_err(),
        "a job started that should still be queued"
    );
}

fn structure_of(output: Option<JobOutput>) -> Option<String> {
    match output {
        Some(JobOutput::Layout { structure, .. }) => structure,
        other => panic!("unexpected output: {other:?}"),
    }
}

#[tokio::test]
async fn test_engine_calls_round_trip() -> Result<()> {
    init_tracing();
    let (control, _started) = GateControl::new();
    let pool = pool(1, &control);
    let widget = WidgetId::new(1);

    let image = pool
        .submit(
            widget,
            JobRequest::RenderImage {
                structure: "CCO".to_string(),
                options: DrawOptions::default(),
            },
        )
        .await;
    match image {
        Some(JobOutput::Image { svg }) => assert_eq!(svg.as_deref(), Some("<svg>CCO</svg>")),
        other => panic!("unexpected output: {other:?}"),
    }

    let overlap = pool
        .submit(
            widget,
            JobRequest::ComputeOverlap {
                molecule: "CCO".to_string(),
                scaffolds: vec!["CC".to_string()],
                options: LayoutOptions::default(),
            },
        )
        .await;
    match overlap {
        Some(JobOutput::Overlap { match_result }) => {
            assert_eq!(match_result.map(|m| m.scaffold_index), Some(0));
        }
        other => panic!("unexpected output: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_main_queue_runs_fifo_on_one_worker() {
    init_tracing();
    let (control, mut started) = GateControl::new();
    let pool = pool(1, &control);

    let first = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(WidgetId::new(1), layout("first")).await })
    };
    assert_eq!(next_started(&mut started).await, "first");

    let second = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(WidgetId::new(2), layout("second")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let third = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(WidgetId::new(3), layout("third")).await })
    };

    // One worker: nothing else starts while the first job runs.
    assert_idle(&mut started).await;

    control.release("first");
    assert_eq!(next_started(&mut started).await, "second");
    control.release("second");
    assert_eq!(next_started(&mut started).await, "third");
    control.release("third");

    assert_eq!(structure_of(first.await.unwrap()).as_deref(), Some("first"));
    assert_eq!(structure_of(second.await.unwrap()).as_deref(), Some("second"));
    assert_eq!(structure_of(third.await.unwrap()).as_deref(), Some("third"));
}

#[tokio::test]
async fn test_two_workers_run_in_parallel() {
    init_tracing();
    let (control, mut started) = GateControl::new();
    let pool = pool(2, &control);

    let first = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(WidgetId::new(1), layout("first")).await })
    };
    let second = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(WidgetId::new(2), layout("second")).await })
    };

    // Both start without either being released.
    let mut seen = vec![
        next_started(&mut started).await,
        next_started(&mut started).await,
    ];
    seen.sort();
    assert_eq!(seen, vec!["first".to_string(), "second".to_string()]);

    control.release("first");
    control.release("second");
    assert!(first.await.unwrap().is_some());
    assert!(second.await.unwrap().is_some());
}

#[tokio::test]
async fn test_session_queue_runs_one_job_at_a_time() {
    init_tracing();
    let (control, mut started) = GateControl::new();
    let pool = pool(2, &control);
    let widget = WidgetId::new(1);
    pool.begin_session(widget);

    let first = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(widget, layout("first")).await })
    };
    assert_eq!(next_started(&mut started).await, "first");

    let second = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(widget, layout("second")).await })
    };

    // A second worker is free, but the session serializes its jobs.
    assert_idle(&mut started).await;

    control.release("first");
    assert_eq!(next_started(&mut started).await, "second");
    control.release("second");

    assert!(first.await.unwrap().is_some());
    assert!(second.await.unwrap().is_some());
}

#[tokio::test]
async fn test_session_coalesces_duplicate_requests() {
    init_tracing();
    let (control, mut started) = GateControl::new();
    let pool = pool(1, &control);
    let widget = WidgetId::new(1);
    pool.begin_session(widget);

    let running = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(widget, layout("running")).await })
    };
    assert_eq!(next_started(&mut started).await, "running");

    let stale = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(widget, layout("duplicate")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let fresh = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(widget, layout("duplicate")).await })
    };

    // The older duplicate is superseded before it ever runs.
    assert_eq!(stale.await.unwrap(), None);

    control.release("running");
    assert_eq!(next_started(&mut started).await, "duplicate");
    control.release("duplicate");
    assert_eq!(
        structure_of(fresh.await.unwrap()).as_deref(),
        Some("duplicate")
    );
    assert!(running.await.unwrap().is_some());
}

#[tokio::test]
async fn test_session_jobs_run_ahead_of_main_queue() {
    init_tracing();
    let (control, mut started) = GateControl::new();
    let pool = pool(1, &control);
    let session = WidgetId::new(1);
    pool.begin_session(session);

    let blocker = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(WidgetId::new(9), layout("blocker")).await })
    };
    assert_eq!(next_started(&mut started).await, "blocker");

    let main_job = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(WidgetId::new(9), layout("batch")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let session_job = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(session, layout("interactive")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The session job was submitted later but is dispatched first.
    control.release("blocker");
    assert_eq!(next_started(&mut started).await, "interactive");
    control.release("interactive");
    assert_eq!(next_started(&mut started).await, "batch");
    control.release("batch");

    assert!(blocker.await.unwrap().is_some());
    assert!(session_job.await.unwrap().is_some());
    assert!(main_job.await.unwrap().is_some());
}

#[tokio::test]
async fn test_abort_jobs_resolves_queued_futures_to_none() {
    init_tracing();
    let (control, mut started) = GateControl::new();
    let pool = pool(1, &control);

    let running = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(WidgetId::new(1), layout("running")).await })
    };
    assert_eq!(next_started(&mut started).await, "running");

    let doomed = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(WidgetId::new(1), layout("doomed")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let survivor = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(WidgetId::new(2), layout("survivor")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.abort_jobs(WidgetId::new(1));
    // The aborted job resolves immediately; the running one is not
    // interrupted.
    assert_eq!(doomed.await.unwrap(), None);

    control.release("running");
    assert!(running.await.unwrap().is_some());
    assert_eq!(next_started(&mut started).await, "survivor");
    control.release("survivor");
    assert!(survivor.await.unwrap().is_some());
}

#[tokio::test]
async fn test_end_session_aborts_queued_but_not_running() {
    init_tracing();
    let (control, mut started) = GateControl::new();
    let pool = pool(1, &control);
    let widget = WidgetId::new(1);
    pool.begin_session(widget);

    let running = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(widget, layout("running")).await })
    };
    assert_eq!(next_started(&mut started).await, "running");

    let queued = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(widget, layout("queued")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.end_session(widget);
    assert!(!pool.session_active(widget));
    assert_eq!(queued.await.unwrap(), None);

    control.release("running");
    assert!(running.await.unwrap().is_some());
}

#[tokio::test]
async fn test_session_closes_when_its_queue_drains() {
    init_tracing();
    let (control, _started) = GateControl::new();
    let pool = pool(1, &control);
    let widget = WidgetId::new(1);

    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    pool.on_session_closed(Box::new(move |w| {
        let _ = closed_tx.send(w);
    }));

    pool.begin_session(widget);
    control.release("only");
    assert!(pool.submit(widget, layout("only")).await.is_some());

    let closed = timeout(Duration::from_secs(5), closed_rx.recv())
        .await
        .expect("timed out waiting for session close")
        .expect("close channel dropped");
    assert_eq!(closed, widget);
    assert!(!pool.session_active(widget));
}

#[tokio::test]
async fn test_submissions_without_session_use_main_queue_rules() {
    init_tracing();
    let (control, mut started) = GateControl::new();
    let pool = pool(1, &control);
    let widget = WidgetId::new(1);

    // Identical requests without a session are not coalesced.
    let first = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(widget, layout("same")).await })
    };
    assert_eq!(next_started(&mut started).await, "same");
    let second = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.submit(widget, layout("same")).await })
    };
    assert_idle(&mut started).await;

    control.release("same");
    // The release is buffered, so the second run passes straight
    // through its gate.
    assert_eq!(next_started(&mut started).await, "same");
    assert!(first.await.unwrap().is_some());
    assert!(second.await.unwrap().is_some());
}
