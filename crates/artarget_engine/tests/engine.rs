mod common;

use std::sync::Arc;
use std::time::Duration;

use artarget_core::{FailureKind, JobError, JobPhase, Notice, RetryPolicy};
use artarget_engine::{
    artifact_object_path, CancellationTokenManager, CompileEngine, ComputeModule, EngineEvent,
    EngineParts, ExecutorSettings, InMemoryMetadataStore, JobMetadataStore, NetworkAwareExecutor,
    NetworkMonitor, NetworkSettings, ObjectStore, PreloadedModule, ProcessingStatus, SourceImage,
    UploadPipeline, UploadSettings, ValidationSettings,
};
use common::{artifact_for, events_until_terminal, notices, source, FakeCompute, FlakyStore};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

struct Harness {
    engine: CompileEngine,
    events: UnboundedReceiver<EngineEvent>,
    tokens: CancellationTokenManager,
    metadata: InMemoryMetadataStore,
}

fn harness(store: Arc<dyn ObjectStore>, compute: Arc<dyn ComputeModule>) -> Harness {
    let tokens = CancellationTokenManager::new();
    let monitor = NetworkMonitor::new(NetworkSettings::default());
    // One transport attempt per stage, so every store failure reaches the job.
    let executor = NetworkAwareExecutor::new(
        monitor,
        ExecutorSettings {
            max_retries: 1,
            ..ExecutorSettings::default()
        },
    );
    let uploads = Arc::new(UploadPipeline::new(
        store,
        executor,
        tokens.clone(),
        UploadSettings::default(),
        ValidationSettings::default(),
    ));
    let metadata = InMemoryMetadataStore::new();
    let (engine, events) = CompileEngine::new(EngineParts {
        loader: Arc::new(PreloadedModule(compute)),
        uploads,
        metadata: Some(Arc::new(metadata.clone()) as Arc<dyn JobMetadataStore>),
        tokens: tokens.clone(),
        policy: RetryPolicy::default(),
        validation: ValidationSettings::default(),
    });
    Harness {
        engine,
        events,
        tokens,
        metadata,
    }
}

async fn wait_for_phase(engine: &CompileEngine, job_id: &str, phase: JobPhase) {
    for _ in 0..1000 {
        if engine.phase(job_id) == phase {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{job_id} never reached {phase:?}");
}

fn expected_url(image: &SourceImage, job_id: &str) -> String {
    format!(
        "https://cdn.test/{}",
        artifact_object_path("targets", job_id, &artifact_for(image))
    )
}

#[tokio::test(start_paused = true)]
async fn flaky_network_completes_on_third_attempt() {
    let store = FlakyStore::new(2);
    let compute = FakeCompute::new(Duration::ZERO);
    let mut h = harness(store.clone(), compute.clone());
    let image = source("pc-1");

    let started = Instant::now();
    h.engine.trigger("pc-1", image.clone());
    let events = events_until_terminal(&mut h.events, "pc-1").await;
    let elapsed = started.elapsed();

    assert_eq!(
        notices(&events),
        vec![
            Notice::Retrying {
                job_id: "pc-1".to_string(),
                next_attempt: 2,
                delay: Duration::from_secs(2),
                error: JobError::network("connection reset"),
            },
            Notice::Retrying {
                job_id: "pc-1".to_string(),
                next_attempt: 3,
                delay: Duration::from_secs(4),
                error: JobError::network("connection reset"),
            },
            Notice::Completed {
                job_id: "pc-1".to_string(),
                url: expected_url(&image, "pc-1"),
                attempt: 3,
            },
        ]
    );
    assert!(elapsed >= Duration::from_secs(6) && elapsed < Duration::from_secs(7));

    let view = h.engine.snapshot();
    let job = view.job("pc-1").unwrap();
    assert_eq!(job.phase, JobPhase::Completed);
    assert_eq!(job.attempt, 3);
    assert_eq!(job.percent(), 100);
    assert_eq!(compute.calls(), 3);
    assert_eq!(store.uploaded().len(), 1);
    assert!(h.tokens.is_empty());

    tokio::time::sleep(Duration::from_millis(10)).await;
    let record = h.metadata.record("pc-1").unwrap();
    assert_eq!(record.status, ProcessingStatus::Ready);
    assert_eq!(record.target_url, Some(expected_url(&image, "pc-1")));
}

#[tokio::test(start_paused = true)]
async fn progress_never_decreases_within_an_attempt() {
    let mut h = harness(FlakyStore::new(0), FakeCompute::new(Duration::ZERO));
    h.engine.trigger("p", source("p"));
    let events = events_until_terminal(&mut h.events, "p").await;

    let progress: Vec<f32> = events
        .iter()
        .filter_map(|event| match event {
            EngineEvent::Progress { progress, .. } => Some(*progress),
            EngineEvent::Notice(_) => None,
        })
        .collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");
    assert_eq!(progress.last().copied(), Some(1.0));
}

#[tokio::test(start_paused = true)]
async fn duplicate_trigger_runs_one_job() {
    let compute = FakeCompute::new(Duration::from_secs(1));
    let mut h = harness(FlakyStore::new(0), compute.clone());

    h.engine.trigger("a", source("a"));
    h.engine.trigger("a", source("a"));
    events_until_terminal(&mut h.events, "a").await;
    h.engine.trigger("a", source("a"));
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(compute.calls(), 1);
    assert_eq!(h.engine.snapshot().active, 0);
}

#[tokio::test(start_paused = true)]
async fn switching_artifacts_drops_the_old_job() {
    let store = FlakyStore::new(0);
    let compute = FakeCompute::new(Duration::from_secs(5));
    let mut h = harness(store.clone(), compute.clone());

    h.engine.trigger("a", source("a"));
    wait_for_phase(&h.engine, "a", JobPhase::Compiling).await;
    h.engine.change_artifact("a", "b");
    h.engine.trigger("b", source("b"));

    let events = events_until_terminal(&mut h.events, "b").await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    while let Ok(event) = h.events.try_recv() {
        if let EngineEvent::Notice(notice) = event {
            assert_ne!(notice.job_id(), "a", "late notice for superseded job");
        }
    }

    assert!(notices(&events).iter().all(|n| n.job_id() == "b"));
    assert_eq!(store.uploaded(), vec![artifact_object_path("targets", "b", &artifact_for(&source("b")))]);
    assert_eq!(h.engine.phase("a"), JobPhase::Idle);
    assert!(h.engine.snapshot().job("a").is_none());
}

#[tokio::test(start_paused = true)]
async fn cancel_returns_job_to_idle_without_a_failure() {
    let compute = FakeCompute::new(Duration::from_secs(5));
    let mut h = harness(FlakyStore::new(0), compute.clone());

    h.engine.trigger("a", source("a"));
    wait_for_phase(&h.engine, "a", JobPhase::Compiling).await;
    h.engine.cancel("a");
    assert_eq!(h.engine.phase("a"), JobPhase::Idle);
    assert!(h.tokens.get("a").is_none());

    tokio::time::sleep(Duration::from_secs(10)).await;
    while let Ok(event) = h.events.try_recv() {
        assert!(!matches!(event, EngineEvent::Notice(_)), "{event:?}");
    }

    // The latch was cleared, so the job can run again.
    h.engine.trigger("a", source("a"));
    let events = events_until_terminal(&mut h.events, "a").await;
    assert!(matches!(
        notices(&events).last(),
        Some(Notice::Completed { attempt: 1, .. })
    ));
    assert_eq!(compute.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn invalid_image_fails_on_first_attempt() {
    let compute = FakeCompute::new(Duration::ZERO);
    let mut h = harness(FlakyStore::new(0), compute.clone());

    h.engine
        .trigger("bad", SourceImage::new("bad.png", b"definitely not an image".to_vec()));
    let events = events_until_terminal(&mut h.events, "bad").await;

    match notices(&events).as_slice() {
        [Notice::Failed { error, attempt, .. }] => {
            assert_eq!(error.kind, FailureKind::Validation);
            assert_eq!(*attempt, 1);
        }
        other => panic!("unexpected notices {other:?}"),
    }
    assert_eq!(compute.calls(), 0);
    assert_eq!(h.engine.phase("bad"), JobPhase::Error);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let record = h.metadata.record("bad").unwrap();
    assert_eq!(record.status, ProcessingStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn manual_retry_after_exhausted_attempts() {
    let store = FlakyStore::new(3);
    let compute = FakeCompute::new(Duration::ZERO);
    let mut h = harness(store.clone(), compute.clone());

    h.engine.trigger("r", source("r"));
    let events = events_until_terminal(&mut h.events, "r").await;
    assert!(matches!(
        notices(&events).last(),
        Some(Notice::Failed { attempt: 3, .. })
    ));
    assert_eq!(compute.calls(), 3);

    h.engine.retry("r");
    let events = events_until_terminal(&mut h.events, "r").await;
    assert!(matches!(
        notices(&events).last(),
        Some(Notice::Completed { attempt: 1, .. })
    ));
    assert_eq!(h.engine.phase("r"), JobPhase::Completed);
}

#[tokio::test(start_paused = true)]
async fn shutdown_aborts_everything_in_flight() {
    let compute = FakeCompute::new(Duration::from_secs(5));
    let mut h = harness(FlakyStore::new(0), compute.clone());

    h.engine.trigger("a", source("a"));
    h.engine.trigger("b", source("b"));
    wait_for_phase(&h.engine, "a", JobPhase::Compiling).await;
    wait_for_phase(&h.engine, "b", JobPhase::Compiling).await;
    h.engine.shutdown();

    assert!(h.tokens.is_empty());
    assert_eq!(h.engine.snapshot().active, 0);
    tokio::time::sleep(Duration::from_secs(10)).await;
    while let Ok(event) = h.events.try_recv() {
        assert!(!matches!(event, EngineEvent::Notice(_)), "{event:?}");
    }
}
