//! Worker for the `sql-execution-queue`.
//!
//! Each job names a query file by its object key. The file is read from the
//! directory in `LEASEMQ_OBJECT_DIR` (default `./objects`), a local stand-in
//! for object storage, and every query in it is "executed" with a simulated
//! delay.
//!
//! Run with `cargo run --example sql_worker`, then submit with
//! `cargo run --example submit -- queries/batch-1.json`.

use anyhow::Context;
use leasemq::{
    async_trait, Config, EventKind, ExecutionError, JobContext, JsonExecutor, JsonJob,
    RedisBackend, WorkerBuilder,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const QUERY_DELAY: Duration = Duration::from_millis(750);

#[derive(Debug, Deserialize)]
struct SqlFileJob {
    #[serde(rename = "s3Key")]
    s3_key: String,
}

#[derive(Debug, Deserialize)]
struct QueryRecord {
    id: serde_json::Value,
    query: String,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    status: &'static str,
    message: String,
}

fn object_dir() -> PathBuf {
    std::env::var("LEASEMQ_OBJECT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./objects"))
}

impl SqlFileJob {
    async fn load_queries(&self) -> anyhow::Result<Vec<QueryRecord>> {
        let path = object_dir().join(&self.s3_key);
        let raw = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading query file {}", path.display()))?;
        serde_json::from_slice(&raw).with_context(|| format!("parsing query file {}", self.s3_key))
    }
}

#[async_trait]
impl JsonJob for SqlFileJob {
    type Output = RunSummary;

    async fn perform(&self, ctx: &JobContext) -> Result<RunSummary, ExecutionError> {
        if self.s3_key.trim().is_empty() {
            return Err(ExecutionError::permanent("payload has an empty s3Key"));
        }

        let queries = self.load_queries().await?;
        info!(
            "Loaded {} queries from {} (attempt {}/{})",
            queries.len(),
            self.s3_key,
            ctx.attempt,
            ctx.max_attempts
        );

        for record in &queries {
            let preview: String = record.query.chars().take(50).collect();
            info!("Executing query {}: \"{}...\"", record.id, preview);
            tokio::time::sleep(QUERY_DELAY).await;
        }

        Ok(RunSummary {
            status: "Completed",
            message: format!(
                "Successfully executed all {} queries from file {}.",
                queries.len(),
                self.s3_key
            ),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut config = Config::from_env()?;
    if std::env::var("LEASEMQ_QUEUE").is_err() {
        config.queue = "sql-execution-queue".to_string();
    }

    let backend = Arc::new(RedisBackend::new(config.redis_options()).await?);
    let mut worker = WorkerBuilder::new(backend, JsonExecutor::<SqlFileJob>::new())
        .with_config(config.worker_config())
        .spawn()
        .await?;

    let mut events = worker.events().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event.kind {
                EventKind::Completed => info!("Job {} completed", event.job_id),
                EventKind::Retrying { delay, error } => warn!(
                    "Job {} failed on attempt {}, retrying in {:?}: {}",
                    event.job_id, event.attempts, delay, error
                ),
                EventKind::Dead { error } => error!("Job {} failed for good: {}", event.job_id, error),
                _ => {}
            }
        }
    });

    info!(
        "Worker {} waiting for jobs on '{}'",
        worker.worker_id(),
        config.queue
    );
    worker.run_until_signal().await?;
    Ok(())
}
