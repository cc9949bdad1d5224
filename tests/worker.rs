use leasemq::{
    async_trait, from_fn, BackoffStrategy, ExecutionError, JobContext, JobId, JobState, JsonExecutor,
    JsonJob, MemoryBackend, Producer, RetryPolicy, WorkerBuilder,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const QUEUE: &str = "sql-execution-queue";

fn fast_retries() -> RetryPolicy {
    RetryPolicy::new(BackoffStrategy::Fixed { millis: 10 })
}

fn builder(backend: Arc<MemoryBackend>, executor: impl leasemq::Executor) -> WorkerBuilder {
    WorkerBuilder::new(backend, executor)
        .with_queue_name(QUEUE)
        .with_poll_interval(Duration::from_millis(10))
        .with_reap_interval(Duration::from_millis(50))
        .with_retry_policy(fast_retries())
}

async fn wait_for_state(producer: &Producer, id: &JobId, state: JobState) -> leasemq::Job {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let job = producer.status(id).await.unwrap();
        if job.state == state {
            return job;
        }
        assert!(
            Instant::now() < deadline,
            "job {} stuck in {} waiting for {}",
            id,
            job.state,
            state
        );
        sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_drains_queue_and_stores_results() {
    let backend = MemoryBackend::arc();
    let producer = Producer::new(backend.clone(), QUEUE);
    let executions = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&executions);
    let mut worker = builder(
        backend.clone(),
        from_fn(move |payload: Vec<u8>, _ctx: JobContext| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut out = b"echo:".to_vec();
                out.extend_from_slice(&payload);
                Ok(out)
            }
        }),
    )
    .with_concurrency(3)
    .spawn()
    .await
    .unwrap();
    worker.start().await.unwrap();

    let mut ids = Vec::new();
    for n in 0..10 {
        ids.push(producer.create(format!("{}", n), 3).await.unwrap());
    }
    for (n, id) in ids.iter().enumerate() {
        let job = wait_for_state(&producer, id, JobState::Completed).await;
        assert_eq!(job.attempts, 1);
        assert_eq!(job.result, Some(format!("echo:{}", n).into_bytes()));
    }

    worker.stop().await;
    assert_eq!(executions.load(Ordering::SeqCst), 10);
    let stats = worker.stats();
    assert_eq!(stats.succeeded, 10);
    assert_eq!(stats.active_jobs, 0);
    assert!(stats.is_shutting_down);
}

#[tokio::test]
async fn flaky_job_is_retried_until_it_succeeds() {
    let backend = MemoryBackend::arc();
    let producer = Producer::new(backend.clone(), QUEUE);

    let mut worker = builder(
        backend.clone(),
        from_fn(|_payload: Vec<u8>, ctx: JobContext| async move {
            if ctx.attempt < 2 {
                Err(ExecutionError::retryable("warming up"))
            } else {
                Ok(b"ok".to_vec())
            }
        }),
    )
    .spawn()
    .await
    .unwrap();
    worker.start().await.unwrap();

    let id = producer.create(b"{}".to_vec(), 3).await.unwrap();
    let job = wait_for_state(&producer, &id, JobState::Completed).await;
    worker.stop().await;

    assert_eq!(job.attempts, 2);
    assert_eq!(job.last_error.as_deref(), Some("warming up"));
    let stats = worker.stats();
    assert_eq!((stats.retried, stats.succeeded), (1, 1));
}

#[tokio::test]
async fn always_failing_job_ends_dead() {
    let backend = MemoryBackend::arc();
    let producer = Producer::new(backend.clone(), QUEUE);

    let mut worker = builder(
        backend.clone(),
        from_fn(|_payload: Vec<u8>, ctx: JobContext| async move {
            Err(ExecutionError::retryable(format!("attempt {} failed", ctx.attempt)))
        }),
    )
    .spawn()
    .await
    .unwrap();
    worker.start().await.unwrap();

    let id = producer.create(b"{}".to_vec(), 3).await.unwrap();
    let job = wait_for_state(&producer, &id, JobState::Dead).await;
    worker.stop().await;

    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error.as_deref(), Some("attempt 3 failed"));
    assert_eq!(worker.stats().dead, 1);
}

#[derive(Debug, Serialize, Deserialize)]
struct QueryBatch {
    queries: Vec<String>,
}

#[async_trait]
impl JsonJob for QueryBatch {
    type Output = usize;

    async fn perform(&self, _ctx: &JobContext) -> Result<usize, ExecutionError> {
        Ok(self.queries.len())
    }
}

#[tokio::test]
async fn json_jobs_decode_payloads_and_reject_garbage() {
    let backend = MemoryBackend::arc();
    let producer = Producer::new(backend.clone(), QUEUE);

    let mut worker = builder(backend.clone(), JsonExecutor::<QueryBatch>::new())
        .spawn()
        .await
        .unwrap();
    worker.start().await.unwrap();

    let good = producer
        .submit_json(
            &QueryBatch {
                queries: vec!["select 1".into(), "select 2".into()],
            },
            leasemq::JobOptions::default(),
        )
        .await
        .unwrap();
    let bad = producer.create(b"not json".to_vec(), 5).await.unwrap();

    let done = wait_for_state(&producer, &good, JobState::Completed).await;
    assert_eq!(done.result.as_deref(), Some(&b"2"[..]));

    let dead = wait_for_state(&producer, &bad, JobState::Dead).await;
    assert_eq!(dead.attempts, 1);
    assert!(dead.last_error.unwrap().starts_with("malformed payload"));

    worker.stop().await;
}

#[tokio::test]
async fn crashed_worker_job_is_finished_by_another_worker() {
    let backend = MemoryBackend::arc();
    let producer = Producer::new(backend.clone(), QUEUE);

    // Hangs forever and never renews, like a wedged process
    let mut stuck = builder(
        backend.clone(),
        from_fn(|_payload: Vec<u8>, _ctx: JobContext| async move {
            std::future::pending::<()>().await;
            Ok(Vec::new())
        }),
    )
    .with_worker_id("stuck")
    .with_lease_duration(Duration::from_millis(200))
    .with_renew_interval(None)
    .spawn()
    .await
    .unwrap();
    stuck.start().await.unwrap();

    let id = producer.create(b"{}".to_vec(), 3).await.unwrap();
    let leased = wait_for_state(&producer, &id, JobState::Leased).await;
    assert_eq!(leased.lease_owner.as_deref(), Some("stuck"));
    stuck.force_stop();

    let mut healthy = builder(
        backend.clone(),
        from_fn(|_payload: Vec<u8>, _ctx: JobContext| async move { Ok(b"recovered".to_vec()) }),
    )
    .with_worker_id("healthy")
    .spawn()
    .await
    .unwrap();
    healthy.start().await.unwrap();

    let job = wait_for_state(&producer, &id, JobState::Completed).await;
    healthy.stop().await;

    assert_eq!(job.attempts, 2);
    assert_eq!(job.result.as_deref(), Some(&b"recovered"[..]));
}

#[tokio::test]
async fn renewal_keeps_long_jobs_leased() {
    let backend = MemoryBackend::arc();
    let producer = Producer::new(backend.clone(), QUEUE);

    // Runs for several lease periods; renewals must keep the reaper away
    let mut worker = builder(
        backend.clone(),
        from_fn(|_payload: Vec<u8>, _ctx: JobContext| async move {
            sleep(Duration::from_millis(500)).await;
            Ok(Vec::new())
        }),
    )
    .with_lease_duration(Duration::from_millis(150))
    .spawn()
    .await
    .unwrap();
    worker.start().await.unwrap();

    let id = producer.create(b"{}".to_vec(), 3).await.unwrap();
    let job = wait_for_state(&producer, &id, JobState::Completed).await;
    worker.stop().await;

    assert_eq!(job.attempts, 1);
    assert_eq!(worker.stats().lost_leases, 0);
}

#[tokio::test]
async fn graceful_stop_waits_for_running_jobs() {
    let backend = MemoryBackend::arc();
    let producer = Producer::new(backend.clone(), QUEUE);

    let mut worker = builder(
        backend.clone(),
        from_fn(|_payload: Vec<u8>, _ctx: JobContext| async move {
            sleep(Duration::from_millis(200)).await;
            Ok(Vec::new())
        }),
    )
    .spawn()
    .await
    .unwrap();
    worker.start().await.unwrap();

    let id = producer.create(b"{}".to_vec(), 3).await.unwrap();
    wait_for_state(&producer, &id, JobState::Leased).await;
    worker.stop().await;

    assert_eq!(producer.status(&id).await.unwrap().state, JobState::Completed);
    assert!(worker.start().await.is_err());
}

#[tokio::test]
async fn force_stop_aborts_running_executions() {
    let backend = MemoryBackend::arc();
    let producer = Producer::new(backend.clone(), QUEUE);
    let finished = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&finished);
    let mut worker = builder(
        backend.clone(),
        from_fn(move |_payload: Vec<u8>, _ctx: JobContext| {
            let counter = Arc::clone(&counter);
            async move {
                sleep(Duration::from_millis(300)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Vec::new())
            }
        }),
    )
    .spawn()
    .await
    .unwrap();
    worker.start().await.unwrap();

    let id = producer.create(b"{}".to_vec(), 3).await.unwrap();
    wait_for_state(&producer, &id, JobState::Leased).await;
    worker.force_stop();
    sleep(Duration::from_millis(500)).await;

    assert_eq!(finished.load(Ordering::SeqCst), 0);
    let job = producer.status(&id).await.unwrap();
    assert_eq!(job.state, JobState::Leased);
    assert_eq!(worker.stats().active_jobs, 0);
}

#[tokio::test]
async fn spawn_rejects_bad_settings_and_unreachable_store() {
    let backend = MemoryBackend::arc();
    let noop = || from_fn(|_payload: Vec<u8>, _ctx: JobContext| async move { Ok(Vec::new()) });

    assert!(builder(backend.clone(), noop())
        .with_concurrency(0)
        .spawn()
        .await
        .is_err());

    backend.set_offline(true);
    let err = builder(backend.clone(), noop()).spawn().await.err().unwrap();
    assert!(err.is_store_unavailable());
}

#[tokio::test]
async fn worker_survives_a_store_outage() {
    let backend = MemoryBackend::arc();
    let producer = Producer::new(backend.clone(), QUEUE);

    let mut worker = builder(
        backend.clone(),
        from_fn(|_payload: Vec<u8>, _ctx: JobContext| async move { Ok(Vec::new()) }),
    )
    .spawn()
    .await
    .unwrap();
    worker.start().await.unwrap();

    backend.set_offline(true);
    sleep(Duration::from_millis(100)).await;
    backend.set_offline(false);

    let id = producer.create(b"{}".to_vec(), 3).await.unwrap();
    wait_for_state(&producer, &id, JobState::Completed).await;
    worker.stop().await;
}
