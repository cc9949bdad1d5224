// src/worker.rs
use crate::clock::Clock;
use crate::events::EventBus;
use crate::lease::{Claim, LeaseManager};
use crate::store::Backend;
use crate::{Executor, Job, JobContext, JobId, JobState, LeaseMqError, Outcome, Result, RetryPolicy};
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use std::time::Instant;
use tokio::{
    sync::{broadcast, Semaphore},
    task::{AbortHandle, JoinHandle},
    time::{interval, sleep, timeout, Duration, MissedTickBehavior},
};
use tracing::{debug, error, info, warn, Instrument};

/// How many times a report is retried while the store is unreachable.
const REPORT_ATTEMPTS: u32 = 5;

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queue: String,
    pub concurrency: usize,
    /// Sleep between polls that found nothing.
    pub poll_interval: Duration,
    pub lease_duration: Duration,
    /// Lease renewal period while executing; `None` disables renewal.
    pub renew_interval: Option<Duration>,
    pub reap_interval: Duration,
    pub worker_id: String,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let lease_duration = Duration::from_secs(30);
        Self {
            queue: "default".to_string(),
            concurrency: 10,
            poll_interval: Duration::from_millis(100),
            lease_duration,
            renew_interval: Some(lease_duration / 3),
            reap_interval: Duration::from_secs(5),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Worker builder for fluent configuration
pub struct WorkerBuilder {
    config: WorkerConfig,
    backend: Arc<dyn Backend>,
    executor: Arc<dyn Executor>,
    retry: RetryPolicy,
    events: EventBus,
    clock: Option<Arc<dyn Clock>>,
}

impl WorkerBuilder {
    pub fn new(backend: Arc<dyn Backend>, executor: impl Executor) -> Self {
        Self {
            config: WorkerConfig::default(),
            backend,
            executor: Arc::new(executor),
            retry: RetryPolicy::default(),
            events: EventBus::default(),
            clock: None,
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.config.queue = name.into();
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.config.worker_id = worker_id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Also resets the renewal period to a third of the lease.
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.config.lease_duration = lease_duration;
        self.config.renew_interval = Some(lease_duration / 3);
        self
    }

    pub fn with_renew_interval(mut self, renew_interval: Option<Duration>) -> Self {
        self.config.renew_interval = renew_interval;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.config.reap_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration, check the store answers, and build the worker.
    pub async fn spawn(self) -> Result<Worker> {
        if self.config.concurrency == 0 {
            return Err(LeaseMqError::InvalidInput(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.config.lease_duration.is_zero() {
            return Err(LeaseMqError::InvalidInput(
                "lease duration must be positive".to_string(),
            ));
        }
        if let Some(renew) = self.config.renew_interval {
            if renew.is_zero() {
                return Err(LeaseMqError::InvalidInput(
                    "renew interval must be positive".to_string(),
                ));
            }
            if renew >= self.config.lease_duration {
                warn!(
                    ?renew,
                    lease = ?self.config.lease_duration,
                    "renew interval is not shorter than the lease; leases may lapse mid-execution"
                );
            }
        }

        self.backend.ping().await?;

        let mut lease = LeaseManager::new(self.backend, self.config.queue.clone())
            .with_retry_policy(self.retry)
            .with_events(self.events);
        if let Some(clock) = self.clock {
            lease = lease.with_clock(clock);
        }

        Ok(Worker::new(self.config, Arc::new(lease), self.executor))
    }
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead: AtomicU64,
    lost_leases: AtomicU64,
    lost_races: AtomicU64,
}

/// State shared between the poll loop and execution tasks
struct Shared {
    config: WorkerConfig,
    lease: Arc<LeaseManager>,
    executor: Arc<dyn Executor>,
    semaphore: Arc<Semaphore>,
    is_shutting_down: AtomicBool,
    counters: Counters,
    /// Execution tasks still running, by job.
    running: Mutex<HashMap<JobId, AbortHandle>>,
}

/// Job worker that claims and executes queued jobs
pub struct Worker {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Worker {
    fn new(config: WorkerConfig, lease: Arc<LeaseManager>, executor: Arc<dyn Executor>) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shared: Arc::new(Shared {
                config,
                lease,
                executor,
                semaphore,
                is_shutting_down: AtomicBool::new(false),
                counters: Counters::default(),
                running: Mutex::new(HashMap::new()),
            }),
            handles: Vec::new(),
            shutdown_tx,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.shared.config.worker_id
    }

    pub fn lease_manager(&self) -> Arc<LeaseManager> {
        Arc::clone(&self.shared.lease)
    }

    pub fn events(&self) -> &EventBus {
        self.shared.lease.events()
    }

    /// Spawn the poll loop and the reaper. Returns once both are running.
    pub async fn start(&mut self) -> Result<()> {
        if !self.handles.is_empty() {
            return Err(LeaseMqError::Worker(format!(
                "worker {} already started",
                self.worker_id()
            )));
        }
        if self.shared.is_shutting_down.load(Ordering::SeqCst) {
            return Err(LeaseMqError::Worker(format!(
                "worker {} has been stopped",
                self.worker_id()
            )));
        }

        info!(
            "Starting worker {} on queue '{}' with concurrency {}",
            self.worker_id(),
            self.shared.config.queue,
            self.shared.config.concurrency
        );

        let poll = tokio::spawn(Self::poll_loop(
            Arc::clone(&self.shared),
            self.shutdown_tx.subscribe(),
        ));
        let reaper = tokio::spawn(Self::reap_loop(
            Arc::clone(&self.shared),
            self.shutdown_tx.subscribe(),
        ));
        self.handles.push(poll);
        self.handles.push(reaper);

        Ok(())
    }

    /// Stop polling, then give in-flight jobs up to the shutdown timeout to
    /// report. Jobs still running after that keep their leases until expiry.
    pub async fn stop(&mut self) {
        info!("Stop requested for worker {}", self.worker_id());
        self.shared.is_shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Worker task ended abnormally: {}", e);
                }
            }
        }

        let active = self.active_jobs();
        if active > 0 {
            info!("Waiting for {} active jobs to complete...", active);
            match timeout(self.shared.config.shutdown_timeout, self.wait_for_jobs_completion()).await {
                Ok(()) => info!("All jobs completed during shutdown"),
                Err(_) => warn!(
                    "Shutdown timeout reached. {} jobs may still be running; their leases will lapse",
                    self.active_jobs()
                ),
            }
        }

        info!("Worker {} shutdown complete", self.worker_id());
    }

    /// Abort polling, reaping and every running execution immediately.
    /// Aborted jobs keep their leases until expiry and are recovered by `reap`.
    pub fn force_stop(&mut self) {
        self.shared.is_shutting_down.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            handle.abort();
        }

        let running: Vec<(JobId, AbortHandle)> = self.shared.running().drain().collect();
        for (job_id, handle) in running {
            warn!(%job_id, "aborting execution");
            handle.abort();
        }
    }

    /// Start, block until SIGINT/SIGTERM, then stop gracefully.
    pub async fn run_until_signal(mut self) -> Result<()> {
        self.start().await?;
        wait_for_shutdown_signal().await;
        self.stop().await;
        Ok(())
    }

    async fn wait_for_jobs_completion(&self) {
        let permits = self.shared.config.concurrency as u32;
        // Every permit free means no job is running
        if let Ok(all) = Arc::clone(&self.shared.semaphore).acquire_many_owned(permits).await {
            drop(all);
        }
    }

    fn active_jobs(&self) -> usize {
        self.shared.config.concurrency - self.shared.semaphore.available_permits()
    }

    pub fn stats(&self) -> WorkerStats {
        let c = &self.shared.counters;
        WorkerStats {
            worker_id: self.shared.config.worker_id.clone(),
            queue_name: self.shared.config.queue.clone(),
            concurrency: self.shared.config.concurrency,
            active_jobs: self.active_jobs(),
            is_shutting_down: self.shared.is_shutting_down.load(Ordering::SeqCst),
            processed: c.processed.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            dead: c.dead.load(Ordering::Relaxed),
            lost_leases: c.lost_leases.load(Ordering::Relaxed),
            lost_races: c.lost_races.load(Ordering::Relaxed),
        }
    }

    async fn poll_loop(shared: Arc<Shared>, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            if shared.is_shutting_down.load(Ordering::SeqCst) {
                break;
            }

            // Idle: wait for a free execution slot
            let permit = tokio::select! {
                _ = shutdown_rx.recv() => break,
                permit = Arc::clone(&shared.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        error!("Execution semaphore closed");
                        break;
                    }
                },
            };

            match shared.poll().await {
                Ok(Some(job)) => {
                    let job_id = job.id;
                    let task = Arc::clone(&shared);
                    // Hold the lock across spawn so the task cannot deregister first
                    let mut running = shared.running();
                    let handle = tokio::spawn(async move {
                        let _permit = permit;
                        task.execute(job).await;
                        task.running().remove(&job_id);
                    });
                    running.insert(job_id, handle.abort_handle());
                }
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = sleep(shared.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    drop(permit);
                    error!("Failed to poll queue '{}': {}", shared.config.queue, e);
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        _ = sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!("Worker loop terminated");
    }

    async fn reap_loop(shared: Arc<Shared>, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval(shared.config.reap_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {}
            }

            match shared.lease.reap().await {
                Ok(0) => {}
                Ok(n) => info!("Reaper recovered {} jobs", n),
                Err(e) => error!("Failed to reap expired leases: {}", e),
            }
        }

        debug!("Reaper stopped");
    }
}

impl Shared {
    fn running(&self) -> MutexGuard<'_, HashMap<JobId, AbortHandle>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Polling: dequeue and claim until a lease is won or the queue is empty.
    async fn poll(&self) -> Result<Option<Job>> {
        loop {
            let Some(id) = self.lease.dequeue_next().await? else {
                return Ok(None);
            };

            match self
                .lease
                .claim(&id, &self.config.worker_id, self.config.lease_duration)
                .await?
            {
                Claim::Acquired(job) => return Ok(Some(job)),
                Claim::LostRace => {
                    self.counters.lost_races.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Executing, then Reporting.
    async fn execute(&self, job: Job) {
        let ctx = JobContext::new(
            &job,
            self.config.worker_id.clone(),
            Arc::clone(&self.lease),
            self.config.lease_duration,
        );
        let span = ctx.span.clone();

        async move {
            let started = Instant::now();
            debug!("executing");

            let outcome = tokio::select! {
                result = self.executor.execute(&job.payload, &ctx) => Outcome::from(result),
                lost = self.keep_alive(&job.id) => {
                    warn!("Lease lost mid-execution, abandoning job: {}", lost);
                    self.counters.lost_leases.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            };

            self.counters.processed.fetch_add(1, Ordering::Relaxed);
            debug!(elapsed_ms = started.elapsed().as_millis() as u64, "execution finished");
            self.report(&job.id, outcome).await;
        }
        .instrument(span)
        .await
    }

    /// Renew the lease periodically. Resolves only when the lease is lost.
    async fn keep_alive(&self, id: &JobId) -> LeaseMqError {
        let Some(period) = self.config.renew_interval else {
            return std::future::pending().await;
        };

        loop {
            sleep(period).await;
            match self
                .lease
                .renew(id, &self.config.worker_id, self.config.lease_duration)
                .await
            {
                Ok(_) => debug!("lease renewed"),
                Err(e) if e.is_lease_lost() => return e,
                Err(e) => warn!("Lease renewal failed, will retry: {}", e),
            }
        }
    }

    /// Report exactly once, retrying only while the store is unreachable.
    async fn report(&self, id: &JobId, outcome: Outcome) {
        let mut delay = Duration::from_millis(200);

        for attempt in 1..=REPORT_ATTEMPTS {
            match self
                .lease
                .release(id, &self.config.worker_id, outcome.clone())
                .await
            {
                Ok(job) => {
                    let counter = match job.state {
                        JobState::Completed => &self.counters.succeeded,
                        JobState::Dead => &self.counters.dead,
                        _ => &self.counters.retried,
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) if e.is_store_unavailable() && attempt < REPORT_ATTEMPTS => {
                    warn!("Report attempt {} failed, retrying in {:?}: {}", attempt, delay, e);
                    sleep(delay).await;
                    delay *= 2;
                }
                Err(e) if e.is_lease_lost() => {
                    warn!("Report rejected, lease no longer held: {}", e);
                    self.counters.lost_leases.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    error!("Failed to report outcome; the reaper will recover the job: {}", e);
                    return;
                }
            }
        }
    }
}

async fn wait_for_shutdown_signal() {
    use tokio::signal;

    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("SIGTERM received"),
                    _ = sigint.recv() => info!("SIGINT received"),
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers, falling back to ctrl-c: {}", e);
            }
        }
    }

    match signal::ctrl_c().await {
        Ok(()) => info!("CTRL+C received"),
        Err(e) => error!("Failed to listen for CTRL+C: {}", e),
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub worker_id: String,
    pub queue_name: String,
    pub concurrency: usize,
    pub active_jobs: usize,
    pub is_shutting_down: bool,
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead: u64,
    pub lost_leases: u64,
    pub lost_races: u64,
}
