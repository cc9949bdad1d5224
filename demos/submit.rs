//! Schedule a query file for execution.
//!
//! Accepts either a bare object key or a JSON body such as
//! `{"s3Key": "queries/batch-1.json"}`, then polls until the job settles.

use anyhow::{bail, Context};
use leasemq::{Config, JobState, Producer, RedisBackend};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct ScheduleRequest {
    #[serde(rename = "s3Key")]
    s3_key: Option<String>,
}

fn parse_request(arg: &str) -> anyhow::Result<String> {
    let request = if arg.trim_start().starts_with('{') {
        serde_json::from_str::<ScheduleRequest>(arg).context("request body is not valid JSON")?
    } else {
        ScheduleRequest {
            s3_key: Some(arg.to_string()),
        }
    };

    match request.s3_key {
        Some(key) if !key.trim().is_empty() => Ok(key),
        _ => bail!("s3Key is required in the request body"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let arg = std::env::args()
        .nth(1)
        .context("usage: submit <s3Key | '{\"s3Key\": ...}'>")?;
    let s3_key = parse_request(&arg)?;

    let mut config = Config::from_env()?;
    if std::env::var("LEASEMQ_QUEUE").is_err() {
        config.queue = "sql-execution-queue".to_string();
    }

    let backend = Arc::new(RedisBackend::new(config.redis_options()).await?);
    let producer = Producer::new(backend, config.queue.clone());
    producer.ping().await.context("store is not reachable")?;

    let id = producer
        .submit_json(
            &ScheduleRequest {
                s3_key: Some(s3_key),
            },
            config.job_options(),
        )
        .await?;
    println!("Job scheduled with id {}", id);

    loop {
        let job = producer.status(&id).await?;
        match job.state {
            JobState::Completed => {
                let result = job
                    .result
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .unwrap_or_default();
                println!("Completed after {} attempt(s): {}", job.attempts, result);
                return Ok(());
            }
            JobState::Dead => {
                println!(
                    "Dead after {} attempt(s): {}",
                    job.attempts,
                    job.last_error.unwrap_or_default()
                );
                return Ok(());
            }
            state => println!("Job {} is {} (attempts {})", id, state, job.attempts),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_bare_key_and_json_body() {
        assert_eq!(parse_request("a.json").unwrap(), "a.json");
        assert_eq!(parse_request(r#"{"s3Key": "b.json"}"#).unwrap(), "b.json");
    }

    #[test]
    fn rejects_missing_key() {
        assert!(parse_request("{}").is_err());
        assert!(parse_request(r#"{"s3Key": ""}"#).is_err());
    }
}
