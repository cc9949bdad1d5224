// src/executor.rs
//! The execution boundary.
//!
//! The engine treats execution as opaque: bytes in, bytes or an
//! [`ExecutionError`] out. Executions may run more than once for the same job
//! (a worker can finish and crash before its report lands), so implementations
//! must tolerate re-invocation.

use crate::{ExecutionError, JobContext};
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::marker::PhantomData;

pub type ExecutionResult = std::result::Result<Vec<u8>, ExecutionError>;

#[async_trait::async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(&self, payload: &[u8], ctx: &JobContext) -> ExecutionResult;
}

/// Executor backed by an async closure
pub struct FnExecutor<F> {
    f: F,
}

/// Wrap an async closure taking the payload and an owned context.
pub fn from_fn<F, Fut>(f: F) -> FnExecutor<F>
where
    F: Fn(Vec<u8>, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecutionResult> + Send + 'static,
{
    FnExecutor { f }
}

#[async_trait::async_trait]
impl<F, Fut> Executor for FnExecutor<F>
where
    F: Fn(Vec<u8>, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ExecutionResult> + Send + 'static,
{
    async fn execute(&self, payload: &[u8], ctx: &JobContext) -> ExecutionResult {
        (self.f)(payload.to_vec(), ctx.clone()).await
    }
}

/// A job whose payload is a JSON document
#[async_trait::async_trait]
pub trait JsonJob: DeserializeOwned + Send + Sync + 'static {
    type Output: Serialize + Send;

    async fn perform(&self, ctx: &JobContext) -> std::result::Result<Self::Output, ExecutionError>;
}

/// Executor that decodes the payload as `T` and encodes its output as JSON.
///
/// A payload that does not decode can never succeed, so it fails permanently.
pub struct JsonExecutor<T: JsonJob> {
    _phantom: PhantomData<fn() -> T>,
}

impl<T: JsonJob> JsonExecutor<T> {
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T: JsonJob> Default for JsonExecutor<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl<T: JsonJob> Executor for JsonExecutor<T> {
    async fn execute(&self, payload: &[u8], ctx: &JobContext) -> ExecutionResult {
        let job: T = serde_json::from_slice(payload)
            .map_err(|e| ExecutionError::permanent(format!("malformed payload: {}", e)))?;
        let output = job.perform(ctx).await?;
        serde_json::to_vec(&output)
            .map_err(|e| ExecutionError::permanent(format!("unserializable output: {}", e)))
    }
}
