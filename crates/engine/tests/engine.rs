use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use podflow_core::error::{CoreError, ErrorKind, ServiceError};
use podflow_core::job::{Job, JobStatus, Priority, Stage};
use podflow_core::request::{PipelineOptions, PipelineRequest};
use podflow_core::types::JobId;
use podflow_engine::{Engine, EngineConfig, JobFilter};
use podflow_events::EventKind;
use podflow_pipeline::circuit_breaker::BreakerConfig;
use podflow_pipeline::collaborators::Collaborators;
use podflow_pipeline::memory::{
    MemoryAssetStore, MemoryImageGenerator, MemoryPromptGenerator, MemoryPublisher,
};
use tokio::time::Instant;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    engine: Arc<Engine>,
    prompts: Arc<MemoryPromptGenerator>,
    images: Arc<MemoryImageGenerator>,
    assets: Arc<MemoryAssetStore>,
    shop_a: Arc<MemoryPublisher>,
    shop_b: Arc<MemoryPublisher>,
}

fn config(workers: usize) -> EngineConfig {
    EngineConfig {
        max_concurrent_jobs: workers,
        job_timeout: Duration::from_secs(60),
        breaker: BreakerConfig {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            window: Duration::from_secs(60),
        },
        retry_max_attempts: 4,
        retry_initial_delay: Duration::from_millis(100),
        retry_max_delay: Duration::from_secs(5),
        retry_multiplier: 2.0,
        retry_jitter: false,
        call_timeout: Duration::from_secs(30),
        ..EngineConfig::default()
    }
}

fn harness(config: EngineConfig) -> Harness {
    let prompts = Arc::new(MemoryPromptGenerator::new());
    let images = Arc::new(MemoryImageGenerator::new());
    let assets = Arc::new(MemoryAssetStore::new());
    let shop_a = Arc::new(MemoryPublisher::new("shop_a"));
    let shop_b = Arc::new(MemoryPublisher::new("shop_b"));
    let collaborators = Collaborators::new(prompts.clone(), images.clone(), assets.clone())
        .with_publisher(shop_a.clone())
        .with_publisher(shop_b.clone());

    Harness {
        engine: Arc::new(Engine::new(config, collaborators)),
        prompts,
        images,
        assets,
        shop_a,
        shop_b,
    }
}

fn theme(text: &str, platforms: &[&str]) -> PipelineRequest {
    PipelineRequest::theme(
        text,
        PipelineOptions {
            platforms: platforms.iter().map(|p| p.to_string()).collect(),
            ..PipelineOptions::default()
        },
    )
}

/// Poll until the job reaches a terminal status.
async fn wait_terminal(engine: &Engine, id: JobId) -> Job {
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            let job = engine.get(id).unwrap();
            if job.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not finish")
}

async fn wait_stage(engine: &Engine, id: JobId, stage: Stage) {
    tokio::time::timeout(Duration::from_secs(60), async {
        while engine.get(id).unwrap().current_stage != Some(stage) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("stage never reached");
}

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn single_worker_dispatches_by_priority() {
    let h = harness(config(1));
    let mut events = h.engine.subscribe();

    let low = h.engine.submit(theme("low", &[]), Priority::Low).unwrap();
    let normal = h.engine.submit(theme("normal", &[]), Priority::Normal).unwrap();
    let high = h.engine.submit(theme("high", &[]), Priority::High).unwrap();
    h.engine.start();

    let mut started = Vec::new();
    while started.len() < 3 {
        if let EventKind::JobStarted { job_id, .. } = events.recv().await.unwrap().kind {
            started.push(job_id);
        }
    }
    assert_eq!(started, vec![high, normal, low]);

    for id in started {
        assert_eq!(wait_terminal(&h.engine, id).await.status, JobStatus::Completed);
    }
    h.engine.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn running_jobs_never_exceed_worker_count() {
    let h = harness(config(2));
    h.images.faults().set_latency(Duration::from_millis(200));
    let ids: Vec<JobId> = (0..6)
        .map(|i| h.engine.submit(theme(&format!("theme {i}"), &[]), Priority::Normal).unwrap())
        .collect();
    h.engine.start();

    let mut peak = 0;
    while h.engine.list(&JobFilter::default()).iter().any(|j| !j.is_terminal()) {
        let running = h.engine.metrics().await.queue.running;
        assert!(running <= 2, "{running} jobs running at once");
        peak = peak.max(running);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(peak, 2);
    for id in ids {
        assert_eq!(h.engine.get(id).unwrap().status, JobStatus::Completed);
    }
    h.engine.shutdown(Duration::from_secs(5)).await;
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn image_retries_then_job_completes() {
    let h = harness(config(2));
    h.images
        .faults()
        .fail_times(2, ServiceError::transient("GPU busy"));
    h.engine.start();

    let started = Instant::now();
    let id = h
        .engine
        .submit(theme("abstract", &["shop_a"]), Priority::High)
        .unwrap();
    let job = wait_terminal(&h.engine, id).await;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    let result = job.result.unwrap();
    assert_eq!(result.stage(Stage::Image).unwrap().attempts, 3);
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(result.published_count(), 1);
    assert_eq!(h.images.faults().calls(), 3);
    assert_eq!(h.shop_a.published().len(), 1);
    h.engine.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn one_failing_platform_is_partial_success() {
    let h = harness(config(1));
    h.shop_b
        .faults()
        .fail_always(ServiceError::from_status(403, "shop closed", None));
    let mut events = h.engine.subscribe();
    h.engine.start();

    let id = h
        .engine
        .submit(theme("ocean", &["shop_a", "shop_b"]), Priority::Normal)
        .unwrap();
    let job = wait_terminal(&h.engine, id).await;

    assert_eq!(job.status, JobStatus::Completed);
    let result = job.result.unwrap();
    assert!(result.is_partial());
    let failed = result.publish.iter().find(|o| o.platform == "shop_b").unwrap();
    assert_eq!(failed.error, Some(ErrorKind::ExternalServiceError));

    loop {
        if let EventKind::JobCompleted {
            failed_platforms, ..
        } = events.recv().await.unwrap().kind
        {
            assert_eq!(failed_platforms, vec!["shop_b".to_string()]);
            break;
        }
    }
    let metrics = h.engine.metrics().await;
    assert_eq!(metrics.jobs.partially_completed, 1);
    assert_eq!(metrics.platforms["shop_a"].published, 1);
    assert_eq!(metrics.platforms["shop_b"].failed, 1);
    h.engine.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn every_platform_failing_fails_the_job() {
    let h = harness(config(1));
    let denied = ServiceError::from_status(401, "bad token", None);
    h.shop_a.faults().fail_always(denied.clone());
    h.shop_b.faults().fail_always(denied);
    h.engine.start();

    let id = h
        .engine
        .submit(theme("forest", &["shop_a", "shop_b"]), Priority::Normal)
        .unwrap();
    let job = wait_terminal(&h.engine, id).await;

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::ExternalServiceError);
    assert_eq!(error.stage, Some(Stage::Publish));
    assert_eq!(job.result.unwrap().publish.len(), 2);
    h.engine.shutdown(Duration::from_secs(5)).await;
}

// ---------------------------------------------------------------------------
// Cancel / retry / timeout
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancelling_pending_job_is_immediate_and_never_runs() {
    let h = harness(config(1));
    let id = h.engine.submit(theme("skip me", &[]), Priority::Normal).unwrap();

    let job = h.engine.cancel(id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_matches!(h.engine.cancel(id), Err(CoreError::Conflict(_)));

    h.engine.start();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.prompts.faults().calls(), 0);
    assert_eq!(h.engine.get(id).unwrap().status, JobStatus::Cancelled);
    assert_eq!(h.engine.metrics().await.jobs.cancelled, 1);
    h.engine.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn cancelling_running_job_stops_at_next_stage_boundary() {
    let h = harness(config(1));
    h.images.faults().set_latency(Duration::from_secs(2));
    h.engine.start();

    let id = h.engine.submit(theme("slow", &["shop_a"]), Priority::Normal).unwrap();
    wait_stage(&h.engine, id, Stage::Image).await;

    let job = h.engine.cancel(id).unwrap();
    assert_eq!(job.status, JobStatus::Running);

    let job = wait_terminal(&h.engine, id).await;
    assert_eq!(job.status, JobStatus::Cancelled);
    // The in-flight image call finished; storage never started.
    assert_eq!(h.images.faults().calls(), 1);
    assert!(h.assets.saved().is_empty());
    assert_eq!(job.result.unwrap().images.len(), 1);
    h.engine.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn failed_job_can_be_retried_as_fresh_run() {
    let h = harness(config(1));
    h.images
        .faults()
        .fail_always(ServiceError::from_status(400, "bad prompt", None));
    h.engine.start();

    let id = h.engine.submit(theme("retry me", &[]), Priority::Normal).unwrap();
    let job = wait_terminal(&h.engine, id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_ref().unwrap().stage, Some(Stage::Image));
    assert_matches!(h.engine.retry(new_id()), Err(CoreError::NotFound { .. }));

    h.images.faults().heal();
    let job = h.engine.retry(id).unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(job.status, JobStatus::Pending);

    let job = wait_terminal(&h.engine, id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 1);
    assert_matches!(h.engine.retry(id), Err(CoreError::Conflict(_)));

    let metrics = h.engine.metrics().await;
    assert_eq!(metrics.jobs.failed, 1);
    assert_eq!(metrics.jobs.completed, 1);
    assert_eq!(metrics.jobs.retried, 1);
    h.engine.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn job_deadline_fails_with_timeout() {
    let h = harness(EngineConfig {
        job_timeout: Duration::from_secs(1),
        ..config(1)
    });
    h.images.faults().set_latency(Duration::from_secs(10));
    h.engine.start();

    let id = h.engine.submit(theme("never", &[]), Priority::Urgent).unwrap();
    let job = wait_terminal(&h.engine, id).await;

    assert_eq!(job.status, JobStatus::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::TimeoutError);
    assert_eq!(error.stage, Some(Stage::Image));
    h.engine.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_running_jobs_and_keeps_pending_ones() {
    let h = harness(config(1));
    h.images.faults().set_latency(Duration::from_secs(2));
    h.engine.start();

    let running = h.engine.submit(theme("running", &[]), Priority::Normal).unwrap();
    let waiting = h.engine.submit(theme("waiting", &[]), Priority::Normal).unwrap();
    wait_stage(&h.engine, running, Stage::Image).await;

    h.engine.shutdown(Duration::from_secs(10)).await;
    assert_eq!(h.engine.get(running).unwrap().status, JobStatus::Cancelled);
    assert_eq!(h.engine.get(waiting).unwrap().status, JobStatus::Pending);
}

// ---------------------------------------------------------------------------
// Submission and bookkeeping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_platform_is_rejected() {
    let h = harness(config(1));
    let err = h
        .engine
        .submit(theme("abstract", &["nowhere"]), Priority::Normal)
        .unwrap_err();
    assert_matches!(err, CoreError::Validation(msg) if msg.contains("nowhere"));
    assert!(h.engine.list(&JobFilter::default()).is_empty());
}

#[tokio::test]
async fn batch_is_all_or_nothing() {
    let h = harness(config(1));
    let err = h
        .engine
        .submit_batch(vec![
            (theme("fine", &[]), Priority::Normal),
            (theme("   ", &[]), Priority::High),
        ])
        .unwrap_err();
    assert_matches!(err, CoreError::Validation(msg) if msg.starts_with("items[1]"));
    assert!(h.engine.list(&JobFilter::default()).is_empty());

    let ids = h
        .engine
        .submit_batch(vec![
            (theme("one", &[]), Priority::Normal),
            (theme("two", &["shop_a"]), Priority::Low),
        ])
        .unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(h.engine.get(ids[1]).unwrap().priority, Priority::Low);
    assert_eq!(h.engine.metrics().await.jobs.submitted, 2);
    assert_matches!(h.engine.submit_batch(Vec::new()), Err(CoreError::Validation(_)));
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let h = harness(config(1));
    assert_matches!(h.engine.get(new_id()), Err(CoreError::NotFound { entity: "job", .. }));
    assert_matches!(h.engine.cancel(new_id()), Err(CoreError::NotFound { .. }));
}

#[tokio::test]
async fn purge_finished_drops_old_terminal_jobs() {
    let h = harness(config(1));
    let done = h.engine.submit(theme("done", &[]), Priority::Normal).unwrap();
    let pending = h.engine.submit(theme("pending", &[]), Priority::Normal).unwrap();
    h.engine.cancel(done).unwrap();

    let purged = h.engine.purge_finished(chrono::Utc::now() + chrono::Duration::seconds(1));
    assert_eq!(purged, 1);
    assert!(h.engine.get(done).is_err());
    assert!(h.engine.get(pending).is_ok());
}

#[tokio::test]
async fn platforms_lists_registered_publishers() {
    let h = harness(config(1));
    assert_eq!(h.engine.platforms(), vec!["shop_a".to_string(), "shop_b".to_string()]);
}

fn new_id() -> JobId {
    podflow_core::types::new_job_id()
}
