// src/store/redis.rs
use super::{JobQueue, JobStore, LeaseGuard, QueueStats, Transition};
use crate::{lua::LuaScripts, BackoffStrategy, Job, JobId, JobState, LeaseMqError, Result};
use ::redis::{aio::MultiplexedConnection, AsyncCommands, Client as RedisClient};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use tracing::debug;

/// Options for the Redis backend
#[derive(Debug, Clone)]
pub struct RedisOptions {
    pub redis_url: String,
    pub key_prefix: String,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "lmq".to_string(),
        }
    }
}

/// Redis-backed job store and queue.
///
/// Each job is a hash at `{prefix}:job:{id}`. Per queue, a sorted set of ready
/// ids scored by `not_before` and a sorted set of in-flight ids scored by lease
/// expiry. All conditional updates run as Lua scripts.
pub struct RedisBackend {
    connection: MultiplexedConnection,
    options: RedisOptions,
    scripts: LuaScripts,
}

impl RedisBackend {
    pub async fn new(options: RedisOptions) -> Result<Self> {
        let client = RedisClient::open(options.redis_url.as_str())?;
        Self::with_client(client, options).await
    }

    pub async fn with_client(client: RedisClient, options: RedisOptions) -> Result<Self> {
        let connection = client.get_multiplexed_async_connection().await?;
        debug!(prefix = %options.key_prefix, "connected to redis");

        Ok(Self {
            connection,
            options,
            scripts: LuaScripts::new(),
        })
    }

    // Redis key helpers
    fn job_key(&self, job_id: &JobId) -> String {
        format!("{}:job:{}", self.options.key_prefix, job_id)
    }

    fn ready_key(&self, queue_name: &str) -> String {
        format!("{}:queue:{}:ready", self.options.key_prefix, queue_name)
    }

    fn in_flight_key(&self, queue_name: &str) -> String {
        format!("{}:queue:{}:inflight", self.options.key_prefix, queue_name)
    }
}

#[async_trait]
impl JobStore for RedisBackend {
    async fn create(&self, job: Job) -> Result<JobId> {
        let mut con = self.connection.clone();
        let job_key = self.job_key(&job.id);
        let fields = encode_job(&job)?;

        let _: () = ::redis::pipe()
            .atomic()
            .hset_multiple(&job_key, &fields)
            .ignore()
            .zadd(
                self.ready_key(&job.queue),
                job.id.to_string(),
                job.not_before.timestamp_millis(),
            )
            .ignore()
            .query_async(&mut con)
            .await?;

        Ok(job.id)
    }

    async fn get(&self, id: &JobId) -> Result<Job> {
        let mut con = self.connection.clone();
        let fields: HashMap<String, Vec<u8>> = con.hgetall(self.job_key(id)).await?;
        if fields.is_empty() {
            return Err(LeaseMqError::NotFound(*id));
        }
        decode_job(*id, &fields)
    }

    async fn transition(
        &self,
        queue: &str,
        id: &JobId,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        if transition.from.is_terminal() {
            return Err(LeaseMqError::InvalidInput(format!(
                "cannot transition out of terminal state {}",
                transition.from
            )));
        }

        let (guard_kind, guard_arg) = match &transition.guard {
            LeaseGuard::None => ("none", String::new()),
            LeaseGuard::Owner { worker, live: true } => ("owner_live", worker.clone()),
            LeaseGuard::Owner { worker, live: false } => ("owner", worker.clone()),
            LeaseGuard::ExpiredBefore(at) => ("expired_before", at.timestamp_millis().to_string()),
        };
        let requeue_at = transition
            .requeue_at
            .map(|at| at.timestamp_millis().to_string())
            .unwrap_or_default();

        let patch = &transition.patch;
        let mut deletions: Vec<&str> = Vec::new();
        let mut sets: Vec<(&str, Vec<u8>)> = Vec::new();
        match &patch.lease_owner {
            Some(Some(owner)) => sets.push(("lease_owner", owner.clone().into_bytes())),
            Some(None) => deletions.push("lease_owner"),
            None => {}
        }
        match patch.lease_expiry {
            Some(Some(expiry)) => sets.push((
                "lease_expiry",
                expiry.timestamp_millis().to_string().into_bytes(),
            )),
            Some(None) => deletions.push("lease_expiry"),
            None => {}
        }
        if let Some(result) = &patch.result {
            sets.push(("result", result.clone()));
        }
        if let Some(error) = &patch.last_error {
            sets.push(("last_error", error.clone().into_bytes()));
        }
        if let Some(at) = patch.not_before {
            sets.push(("not_before", millis(at)));
        }

        let mut invocation = self.scripts.transition.prepare_invoke();
        invocation
            .key(self.job_key(id))
            .key(self.ready_key(queue))
            .key(self.in_flight_key(queue))
            .arg(transition.from.as_str())
            .arg(transition.to.as_str())
            .arg(now.timestamp_millis())
            .arg(guard_kind)
            .arg(guard_arg)
            .arg(requeue_at)
            .arg(if patch.increment_attempts { "1" } else { "0" })
            .arg(id.to_string())
            .arg(queue)
            .arg(deletions.len());
        for field in &deletions {
            invocation.arg(*field);
        }
        for (field, value) in &sets {
            invocation.arg(*field).arg(value.as_slice());
        }

        let mut con = self.connection.clone();
        let (code, flat): (i64, Vec<Vec<u8>>) = invocation.invoke_async(&mut con).await?;

        match code {
            0 => decode_job(*id, &pairs(flat)),
            1 => Err(LeaseMqError::NotFound(*id)),
            2 => Err(LeaseMqError::Conflict(*id)),
            3 => Err(LeaseMqError::NotOwner {
                job_id: *id,
                worker: match transition.guard {
                    LeaseGuard::Owner { worker, .. } => worker,
                    _ => String::new(),
                },
            }),
            4 => Err(LeaseMqError::Expired(*id)),
            other => Err(LeaseMqError::Corrupt(
                self.job_key(id),
                format!("unexpected transition reply code {}", other),
            )),
        }
    }

    async fn ping(&self) -> Result<()> {
        let mut con = self.connection.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut con).await?;
        Ok(())
    }
}

#[async_trait]
impl JobQueue for RedisBackend {
    async fn enqueue(&self, queue: &str, id: &JobId, not_before: DateTime<Utc>) -> Result<()> {
        let mut con = self.connection.clone();
        let code: i64 = self
            .scripts
            .enqueue
            .key(self.job_key(id))
            .key(self.ready_key(queue))
            .key(self.in_flight_key(queue))
            .arg(not_before.timestamp_millis())
            .arg(id.to_string())
            .arg(queue)
            .invoke_async(&mut con)
            .await?;

        match code {
            1 => Ok(()),
            2 => Err(LeaseMqError::Conflict(*id)),
            _ => Err(LeaseMqError::NotFound(*id)),
        }
    }

    async fn dequeue_next(&self, queue: &str, now: DateTime<Utc>) -> Result<Option<JobId>> {
        let mut con = self.connection.clone();
        let popped: Option<String> = self
            .scripts
            .dequeue
            .key(self.ready_key(queue))
            .key(self.in_flight_key(queue))
            .arg(now.timestamp_millis())
            .invoke_async(&mut con)
            .await?;

        popped.map(|raw| raw.parse()).transpose()
    }

    async fn in_flight(
        &self,
        queue: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<(JobId, DateTime<Utc>)>> {
        let mut con = self.connection.clone();
        let raw: Vec<(String, f64)> = con
            .zrangebyscore_withscores(
                self.in_flight_key(queue),
                "-inf",
                format!("({}", before.timestamp_millis()),
            )
            .await?;

        raw.into_iter()
            .map(|(id, score)| -> Result<(JobId, DateTime<Utc>)> {
                Ok((id.parse::<JobId>()?, millis_to_datetime(&id, score as i64)?))
            })
            .collect()
    }

    async fn discard_in_flight(&self, queue: &str, id: &JobId) -> Result<()> {
        let mut con = self.connection.clone();
        let _: i64 = con.zrem(self.in_flight_key(queue), id.to_string()).await?;
        Ok(())
    }

    async fn stats(&self, queue: &str, now: DateTime<Utc>) -> Result<QueueStats> {
        let mut con = self.connection.clone();
        let now_ms = now.timestamp_millis();
        let ready_key = self.ready_key(queue);

        let ready: usize = con.zcount(&ready_key, "-inf", now_ms).await?;
        let delayed: usize = con.zcount(&ready_key, format!("({}", now_ms), "+inf").await?;
        let in_flight: usize = con.zcard(self.in_flight_key(queue)).await?;

        Ok(QueueStats {
            ready,
            delayed,
            in_flight,
        })
    }
}

fn encode_job(job: &Job) -> Result<Vec<(&'static str, Vec<u8>)>> {
    let mut fields: Vec<(&'static str, Vec<u8>)> = vec![
        ("queue", job.queue.clone().into_bytes()),
        ("payload", job.payload.clone()),
        ("state", job.state.as_str().as_bytes().to_vec()),
        ("attempts", job.attempts.to_string().into_bytes()),
        ("max_attempts", job.max_attempts.to_string().into_bytes()),
        ("not_before", millis(job.not_before)),
        ("created_at", millis(job.created_at)),
        ("updated_at", millis(job.updated_at)),
    ];
    if let Some(backoff) = &job.backoff {
        fields.push(("backoff", serde_json::to_vec(backoff)?));
    }
    if let Some(owner) = &job.lease_owner {
        fields.push(("lease_owner", owner.clone().into_bytes()));
    }
    if let Some(expiry) = job.lease_expiry {
        fields.push(("lease_expiry", millis(expiry)));
    }
    if let Some(result) = &job.result {
        fields.push(("result", result.clone()));
    }
    if let Some(error) = &job.last_error {
        fields.push(("last_error", error.clone().into_bytes()));
    }
    Ok(fields)
}

fn decode_job(id: JobId, fields: &HashMap<String, Vec<u8>>) -> Result<Job> {
    let text = |name: &str| -> Result<Option<String>> {
        fields
            .get(name)
            .map(|raw| {
                String::from_utf8(raw.clone()).map_err(|_| {
                    LeaseMqError::Corrupt(id.to_string(), format!("field {} is not utf-8", name))
                })
            })
            .transpose()
    };
    let required = |name: &str| -> Result<String> {
        text(name)?.ok_or_else(|| {
            LeaseMqError::Corrupt(id.to_string(), format!("missing field {}", name))
        })
    };
    let number = |name: &str| -> Result<i64> {
        required(name)?.parse::<i64>().map_err(|_| {
            LeaseMqError::Corrupt(id.to_string(), format!("field {} is not a number", name))
        })
    };
    let timestamp = |name: &str| -> Result<DateTime<Utc>> {
        millis_to_datetime(&id.to_string(), number(name)?)
    };

    let lease_expiry = match text("lease_expiry")? {
        Some(raw) => {
            let ms = raw.parse::<i64>().map_err(|_| {
                LeaseMqError::Corrupt(id.to_string(), "lease_expiry is not a number".into())
            })?;
            Some(millis_to_datetime(&id.to_string(), ms)?)
        }
        None => None,
    };
    let backoff: Option<BackoffStrategy> = fields
        .get("backoff")
        .map(|raw| serde_json::from_slice(raw))
        .transpose()?;

    Ok(Job {
        id,
        queue: required("queue")?,
        payload: fields.get("payload").cloned().unwrap_or_default(),
        state: required("state")?.parse::<JobState>()?,
        attempts: number("attempts")? as u32,
        max_attempts: number("max_attempts")? as u32,
        backoff,
        lease_owner: text("lease_owner")?,
        lease_expiry,
        not_before: timestamp("not_before")?,
        result: fields.get("result").cloned(),
        last_error: text("last_error")?,
        created_at: timestamp("created_at")?,
        updated_at: timestamp("updated_at")?,
    })
}

fn pairs(flat: Vec<Vec<u8>>) -> HashMap<String, Vec<u8>> {
    let mut map = HashMap::with_capacity(flat.len() / 2);
    let mut iter = flat.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        map.insert(String::from_utf8_lossy(&key).into_owned(), value);
    }
    map
}

fn millis(at: DateTime<Utc>) -> Vec<u8> {
    at.timestamp_millis().to_string().into_bytes()
}

fn millis_to_datetime(context: &str, ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
        LeaseMqError::Corrupt(context.to_string(), format!("timestamp {} out of range", ms))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::JobOptions;

    #[test]
    fn encode_then_decode_preserves_optional_fields() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        let opts = JobOptions::default().with_backoff(BackoffStrategy::Fixed { millis: 5 });
        let mut job = Job::new("sql", b"{\"s3Key\":\"a.json\"}".to_vec(), &opts, now).unwrap();
        job.state = JobState::Leased;
        job.attempts = 2;
        job.lease_owner = Some("worker-1".into());
        job.lease_expiry = Some(now + chrono::Duration::seconds(30));
        job.last_error = Some("timeout".into());

        let fields: HashMap<String, Vec<u8>> = encode_job(&job)
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(decode_job(job.id, &fields).unwrap(), job);
    }

    #[test]
    fn decode_reports_missing_fields_as_corrupt() {
        let mut fields = HashMap::new();
        fields.insert("queue".to_string(), b"sql".to_vec());
        let err = decode_job(JobId::new(), &fields).unwrap_err();
        assert!(matches!(err, LeaseMqError::Corrupt(_, _)));
    }

    #[test]
    fn pairs_folds_flat_hgetall_reply() {
        let flat = vec![b"state".to_vec(), b"pending".to_vec(), b"attempts".to_vec(), b"0".to_vec()];
        let map = pairs(flat);
        assert_eq!(map.get("state").map(Vec::as_slice), Some(&b"pending"[..]));
        assert_eq!(map.len(), 2);
    }

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    async fn backend() -> RedisBackend {
        RedisBackend::new(RedisOptions {
            redis_url: redis_url(),
            key_prefix: format!("lmq-test-{}", uuid::Uuid::new_v4()),
        })
        .await
        .expect("redis available")
    }

    #[tokio::test]
    #[ignore = "requires a running redis server"]
    async fn claim_cycle_against_live_redis() {
        let store = backend().await;
        let now = Utc::now();
        let job = Job::new("q", b"payload".to_vec(), &JobOptions::default(), now).unwrap();
        let id = store.create(job).await.unwrap();

        assert_eq!(store.dequeue_next("q", now).await.unwrap(), Some(id));
        assert_eq!(store.dequeue_next("q", now).await.unwrap(), None);

        let patch = crate::store::JobPatch {
            lease_owner: Some(Some("w1".into())),
            lease_expiry: Some(Some(now + chrono::Duration::seconds(5))),
            increment_attempts: true,
            ..Default::default()
        };
        let leased = store
            .transition("q", &id, Transition::new(JobState::Pending, JobState::Leased).patch(patch.clone()), now)
            .await
            .unwrap();
        assert_eq!(leased.attempts, 1);

        let again = store
            .transition("q", &id, Transition::new(JobState::Pending, JobState::Leased).patch(patch), now)
            .await
            .unwrap_err();
        assert!(matches!(again, LeaseMqError::Conflict(_)));

        let stranger = store
            .transition(
                "q",
                &id,
                Transition::new(JobState::Leased, JobState::Leased).guard(LeaseGuard::Owner {
                    worker: "w2".into(),
                    live: true,
                }),
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(stranger, LeaseMqError::NotOwner { .. }));

        let later = now + chrono::Duration::seconds(6);
        let overdue = store.in_flight("q", later).await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].0, id);
    }
}
