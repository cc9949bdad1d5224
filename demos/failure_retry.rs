//! In-process walkthrough of retries, backoff and dead jobs. No Redis needed.

use leasemq::{
    from_fn, BackoffStrategy, EventKind, ExecutionError, JobContext, JobOptions, JobState,
    MemoryBackend, Producer, RetryPolicy, WorkerBuilder,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let backend = MemoryBackend::arc();
    let retry = RetryPolicy::new(BackoffStrategy::Exponential {
        base_ms: 100,
        cap_ms: 2_000,
        jitter: 0.2,
    });

    // Payload "flaky:N" fails N times before succeeding; anything else always fails
    let mut worker = WorkerBuilder::new(
        backend.clone(),
        from_fn(|payload: Vec<u8>, ctx: JobContext| async move {
            let text = String::from_utf8_lossy(&payload).into_owned();
            match text.strip_prefix("flaky:").and_then(|n| n.parse::<u32>().ok()) {
                Some(failures) if ctx.attempt <= failures => Err(ExecutionError::retryable(
                    format!("simulated failure on attempt {}", ctx.attempt),
                )),
                Some(_) => Ok(format!("succeeded on attempt {}", ctx.attempt).into_bytes()),
                None => Err(anyhow::anyhow!("cannot process '{}'", text).into()),
            }
        }),
    )
    .with_concurrency(2)
    .with_poll_interval(Duration::from_millis(20))
    .with_retry_policy(retry)
    .spawn()
    .await?;

    let producer = Producer::new(backend, "default").with_events(worker.events().clone());
    let mut events = worker.events().subscribe();
    worker.start().await?;

    let flaky = producer.create("flaky:2", 3).await?;
    let doomed = producer
        .submit("broken", JobOptions::default().with_max_attempts(3))
        .await?;

    let mut settled = 0;
    while settled < 2 {
        let event = events.recv().await?;
        println!("[event] {} job={} attempts={}", event.kind.name(), event.job_id, event.attempts);
        if matches!(event.kind, EventKind::Completed | EventKind::Dead { .. }) {
            settled += 1;
        }
    }

    for id in [flaky, doomed] {
        let job = producer.status(&id).await?;
        match job.state {
            JobState::Completed => println!(
                "{} completed: {}",
                id,
                String::from_utf8_lossy(job.result.as_deref().unwrap_or_default())
            ),
            state => println!("{} {}: {}", id, state, job.last_error.unwrap_or_default()),
        }
    }

    worker.stop().await;
    println!("{:#?}", worker.stats());
    Ok(())
}
