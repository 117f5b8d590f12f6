//! The processor: a per-process singleton that accepts requests from worker
//! threads, executes them on one dedicated cooperative reactor thread, and
//! hands results back to the job queue as callback jobs.
//!
//! Worker threads only ever touch synchronous, non-blocking state here: the
//! state check, the capacity check, a map insert, and an unbounded channel
//! send. Everything that awaits (registry writes, HTTP, queue pushes) runs
//! on the reactor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{BackpressureStrategy, Config};
use crate::errors::{Error, Result};
use crate::executor::{Execution, HttpExecutor};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::monitor::{self, MonitorContext};
use crate::payload;
use crate::queue::{callback_job_envelope, request_job_envelope, JobEnvelope};
use crate::registry::{InflightEntry, InflightStore, MemoryInflightStore, RedisInflightStore};
use crate::types::{ErrorValue, PayloadBody, Request};
use crate::{INTAKE_POLL_INTERVAL, LOCAL_HEARTBEAT_INTERVAL};

/// Lifecycle states. Transitions only ever move forward:
/// stopped → starting → running → draining → stopping → stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Stopped,
    Starting,
    Running,
    Draining,
    Stopping,
}

impl ProcessorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorState::Stopped => "stopped",
            ProcessorState::Starting => "starting",
            ProcessorState::Running => "running",
            ProcessorState::Draining => "draining",
            ProcessorState::Stopping => "stopping",
        }
    }
}

impl std::fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
struct TaskEntry {
    request: Arc<Request>,
    cancel: CancellationToken,
    enqueued_at: DateTime<Utc>,
    seq: u64,
    started: bool,
    evicted: bool,
}

enum IntakeMsg {
    Run(Uuid),
}

struct RunHandles {
    stop: CancellationToken,
    thread: std::thread::JoinHandle<()>,
}

struct Inner {
    config: Arc<Config>,
    state: Mutex<ProcessorState>,
    tasks: Mutex<HashMap<Uuid, TaskEntry>>,
    slot_freed: Condvar,
    intake: Mutex<Option<mpsc::UnboundedSender<IntakeMsg>>>,
    seq: AtomicU64,
    metrics: Arc<Metrics>,
    owner_pid: String,
    stop_deadline: Mutex<Option<Instant>>,
    run: Mutex<Option<RunHandles>>,
}

impl Inner {
    fn state(&self) -> ProcessorState {
        *self.state.lock().expect("state lock poisoned")
    }

    fn set_state(&self, next: ProcessorState) {
        *self.state.lock().expect("state lock poisoned") = next;
    }

    /// Removes the entry; whichever caller gets it owns the terminal action.
    fn take_task(&self, id: Uuid) -> Option<TaskEntry> {
        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");
        let entry = tasks.remove(&id);
        if entry.is_some() {
            self.metrics.task_finished();
            self.slot_freed.notify_all();
        }
        entry
    }

    fn started_ids(&self) -> Vec<Uuid> {
        self.tasks
            .lock()
            .expect("tasks lock poisoned")
            .iter()
            .filter(|(_, entry)| entry.started && !entry.evicted)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// The async HTTP processor. Cheap to clone; all clones share one reactor.
#[derive(Clone)]
pub struct Processor {
    inner: Arc<Inner>,
}

impl Processor {
    /// Builds a processor from a validated configuration. Nothing runs until
    /// [`start`](Self::start).
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".to_string());
        let owner_pid = format!("{host}:{}", std::process::id());
        Ok(Self {
            inner: Arc::new(Inner {
                config: Arc::new(config),
                state: Mutex::new(ProcessorState::Stopped),
                tasks: Mutex::new(HashMap::new()),
                slot_freed: Condvar::new(),
                intake: Mutex::new(None),
                seq: AtomicU64::new(0),
                metrics: Arc::new(Metrics::new()),
                owner_pid,
                stop_deadline: Mutex::new(None),
                run: Mutex::new(None),
            }),
        })
    }

    pub fn state(&self) -> ProcessorState {
        self.inner.state()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Number of locally in-flight requests (queued or executing).
    pub fn in_flight(&self) -> usize {
        self.inner.tasks.lock().expect("tasks lock poisoned").len()
    }

    /// Spawns the reactor thread and the monitor, then opens intake. Returns
    /// once the reactor loop is live (or failed to come up).
    pub fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("state lock poisoned");
            if *state != ProcessorState::Stopped {
                return Err(Error::Config(format!(
                    "processor already started (state: {state})",
                    state = state.as_str()
                )));
            }
            *state = ProcessorState::Starting;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.intake.lock().expect("intake lock poisoned") = Some(tx);

        let stop = CancellationToken::new();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let inner = self.inner.clone();
        let stop_for_thread = stop.clone();

        let thread = std::thread::Builder::new()
            .name("offramp-reactor".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = ready_tx.send(Err(Error::Config(format!(
                            "failed to build reactor runtime: {err}"
                        ))));
                        return;
                    }
                };
                runtime.block_on(reactor_main(inner, rx, ready_tx, stop_for_thread));
            })
            .map_err(|err| Error::Config(format!("failed to spawn reactor thread: {err}")))?;

        *self.inner.run.lock().expect("run lock poisoned") = Some(RunHandles { stop, thread });

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(owner = %self.inner.owner_pid, "processor started");
                Ok(())
            }
            Ok(Err(err)) => {
                self.teardown_failed_start();
                Err(err)
            }
            Err(_) => {
                self.teardown_failed_start();
                Err(Error::Config("reactor thread exited during startup".into()))
            }
        }
    }

    fn teardown_failed_start(&self) {
        *self.inner.intake.lock().expect("intake lock poisoned") = None;
        if let Some(run) = self.inner.run.lock().expect("run lock poisoned").take() {
            run.stop.cancel();
            let _ = run.thread.join();
        }
        self.inner.set_state(ProcessorState::Stopped);
    }

    /// Accepts a request for execution. Non-blocking beyond the intake send
    /// and local bookkeeping (the `Block` backpressure strategy is the one
    /// bounded exception). Guarantees at-most-once execution per accepted
    /// request within this process.
    pub fn enqueue(&self, request: Request) -> Result<Uuid> {
        request.validate()?;

        let state = self.state();
        if state != ProcessorState::Running {
            return Err(Error::NotRunning {
                state: state.as_str(),
            });
        }

        let sender = self
            .inner
            .intake
            .lock()
            .expect("intake lock poisoned")
            .clone()
            .ok_or(Error::NotRunning { state: "stopping" })?;

        let id = request.id;
        let request = Arc::new(request);
        let limit = self.inner.config.max_connections;

        let mut tasks = self.inner.tasks.lock().expect("tasks lock poisoned");
        if active_count(&tasks) >= limit {
            match self.inner.config.backpressure_strategy {
                BackpressureStrategy::Raise => return Err(Error::MaxCapacity { limit }),
                BackpressureStrategy::Block { wait } => {
                    let deadline = Instant::now() + wait;
                    while active_count(&tasks) >= limit {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            return Err(Error::MaxCapacity { limit });
                        }
                        let (guard, _) = self
                            .inner
                            .slot_freed
                            .wait_timeout(tasks, remaining)
                            .expect("tasks lock poisoned");
                        tasks = guard;
                        if self.state() != ProcessorState::Running {
                            let state = self.state();
                            return Err(Error::NotRunning {
                                state: state.as_str(),
                            });
                        }
                    }
                }
                BackpressureStrategy::DropOldest => {
                    // Evict the longest-queued request that has not started.
                    // The reactor re-enqueues its job envelope when it pops
                    // the stale intake message.
                    match select_eviction_victim(&tasks) {
                        Some(victim_id) => {
                            if let Some(entry) = tasks.get_mut(&victim_id) {
                                entry.evicted = true;
                            }
                            debug!(request_id = %victim_id, "evicted oldest pending request");
                        }
                        None => return Err(Error::MaxCapacity { limit }),
                    }
                }
            }
        }

        let entry = TaskEntry {
            request: request.clone(),
            cancel: CancellationToken::new(),
            enqueued_at: Utc::now(),
            seq: self.inner.seq.fetch_add(1, Ordering::SeqCst),
            started: false,
            evicted: false,
        };
        tasks.insert(id, entry);
        self.inner.metrics.task_started();
        drop(tasks);

        if sender.send(IntakeMsg::Run(id)).is_err() {
            self.inner.take_task(id);
            return Err(Error::NotRunning { state: "stopping" });
        }

        debug!(request_id = %id, url = %request.url, method = %request.method, "request accepted");
        Ok(id)
    }

    /// Stops accepting new work; in-flight requests run to completion.
    pub fn quiet(&self) {
        let mut state = self.inner.state.lock().expect("state lock poisoned");
        if *state == ProcessorState::Running {
            *state = ProcessorState::Draining;
            info!("processor draining");
        }
    }

    /// Bounded shutdown: waits up to `timeout` for in-flight requests, then
    /// cancels the rest and re-enqueues their job envelopes. Always reaches
    /// `stopped`.
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        {
            let mut state = self.inner.state.lock().expect("state lock poisoned");
            match *state {
                ProcessorState::Running | ProcessorState::Draining => {
                    *state = ProcessorState::Stopping;
                }
                ProcessorState::Stopped => return Ok(()),
                ProcessorState::Stopping => {}
                ProcessorState::Starting => {
                    return Err(Error::Config("cannot stop while starting".into()))
                }
            }
        }
        info!(timeout_secs = timeout.as_secs_f64(), "processor stopping");

        *self
            .inner
            .stop_deadline
            .lock()
            .expect("deadline lock poisoned") = Some(Instant::now() + timeout);
        *self.inner.intake.lock().expect("intake lock poisoned") = None;
        self.inner.slot_freed.notify_all();

        if let Some(run) = self.inner.run.lock().expect("run lock poisoned").take() {
            run.stop.cancel();
            let _ = run.thread.join();
        }
        Ok(())
    }

    /// Test helper: tears down the reactor and monitor synchronously from
    /// any state.
    pub fn reset(&self) {
        if self.state() == ProcessorState::Stopped {
            return;
        }
        let _ = self.stop(Duration::ZERO);
    }
}

fn active_count(tasks: &HashMap<Uuid, TaskEntry>) -> usize {
    tasks.values().filter(|entry| !entry.evicted).count()
}

/// The longest-queued request that has not begun executing, if any.
fn select_eviction_victim(tasks: &HashMap<Uuid, TaskEntry>) -> Option<Uuid> {
    tasks
        .values()
        .filter(|entry| !entry.started && !entry.evicted)
        .min_by_key(|entry| entry.seq)
        .map(|entry| entry.request.id)
}

async fn reactor_main(
    inner: Arc<Inner>,
    mut rx: mpsc::UnboundedReceiver<IntakeMsg>,
    ready_tx: std::sync::mpsc::Sender<Result<()>>,
    stop: CancellationToken,
) {
    let executor = match HttpExecutor::new(&inner.config) {
        Ok(executor) => Arc::new(executor),
        Err(err) => {
            let _ = ready_tx.send(Err(err));
            return;
        }
    };

    let store: Arc<dyn InflightStore> = if let Some(store) = inner.config.inflight_store() {
        store.clone()
    } else if let Some(url) = &inner.config.redis_url {
        match RedisInflightStore::connect(url, inner.config.registry_prefix.clone()).await {
            Ok(store) => Arc::new(store),
            Err(err) => {
                let _ = ready_tx.send(Err(err));
                return;
            }
        }
    } else {
        Arc::new(MemoryInflightStore::new())
    };

    inner.set_state(ProcessorState::Running);
    let _ = ready_tx.send(Ok(()));

    let monitor_cancel = CancellationToken::new();
    let monitor = tokio::spawn(monitor::run(
        MonitorContext {
            store: store.clone(),
            queue: inner.config.queue().clone(),
            owner: inner.owner_pid.clone(),
            heartbeat_interval: inner.config.heartbeat_interval,
            orphan_threshold: inner.config.orphan_threshold,
            gc_lock_ttl: inner.config.gc_lock_ttl,
            raise_errors: inner.config.raise_monitor_errors,
            inflight_ids: {
                let inner = inner.clone();
                Arc::new(move || inner.started_ids())
            },
        },
        monitor_cancel.clone(),
    ));

    let mut heartbeat = tokio::time::interval(LOCAL_HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = heartbeat.tick() => {
                let ids = inner.started_ids();
                if !ids.is_empty() {
                    if let Err(err) = store.heartbeat(&ids, Utc::now()).await {
                        warn!(error = %err, "local heartbeat refresh failed");
                    }
                }
            }
            msg = tokio::time::timeout(INTAKE_POLL_INTERVAL, rx.recv()) => match msg {
                Ok(Some(IntakeMsg::Run(id))) => {
                    handle_run(&inner, &store, &executor, id).await;
                }
                Ok(None) => break,
                Err(_) => {} // dequeue timeout: loop for housekeeping
            }
        }
    }

    shutdown_sequence(&inner, &store, &mut rx).await;

    monitor_cancel.cancel();
    let _ = monitor.await;

    inner.set_state(ProcessorState::Stopped);
    info!(owner = %inner.owner_pid, "processor stopped");
}

async fn handle_run(
    inner: &Arc<Inner>,
    store: &Arc<dyn InflightStore>,
    executor: &Arc<HttpExecutor>,
    id: Uuid,
) {
    let (request, cancel, enqueued_at) = {
        let mut tasks = inner.tasks.lock().expect("tasks lock poisoned");
        match tasks.get_mut(&id) {
            None => return,
            Some(entry) if entry.evicted => {
                drop(tasks);
                if let Some(entry) = inner.take_task(id) {
                    requeue_request(inner, &entry.request).await;
                }
                return;
            }
            Some(entry) => {
                entry.started = true;
                (entry.request.clone(), entry.cancel.clone(), entry.enqueued_at)
            }
        }
    };

    let inner = inner.clone();
    let store = store.clone();
    let executor = executor.clone();

    tokio::spawn(async move {
        let envelope = match reenqueue_envelope(&request) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(request_id = %request.id, error = %err, "could not build re-enqueue envelope");
                JobEnvelope::new(crate::REQUEST_JOB_CLASS, Vec::new())
            }
        };
        let registry_entry = InflightEntry {
            request_id: request.id,
            enqueued_at,
            owner_pid: inner.owner_pid.clone(),
            retry_count: envelope.retry_count,
            job_envelope: Some(envelope),
        };
        if let Err(err) = store.register(&registry_entry).await {
            // Execution proceeds; only crash recovery coverage is lost.
            warn!(request_id = %request.id, error = %err, "inflight registry write failed");
        }

        let execution = match resolve_request_body(&request, &inner.config).await {
            Ok(resolved) => executor.execute(&resolved, &cancel).await,
            Err(err) => Execution::Failed(ErrorValue::Transport(crate::types::TransportError {
                kind: crate::types::ErrorKind::Unknown,
                message: format!("request body could not be loaded: {err}"),
                cause: None,
                duration: Duration::ZERO,
                request_id: request.id,
                url: request.url.clone(),
                method: request.method,
                callback_args: request.callback_args.clone(),
            })),
        };

        let Some(_entry) = inner.take_task(request.id) else {
            // Shutdown already claimed this task and re-enqueued it.
            return;
        };
        finish(&inner, &store, &request, execution).await;
    });
}

/// Requests re-hydrated from job blobs can carry a stored body; fetch it
/// before hitting the wire.
async fn resolve_request_body(request: &Arc<Request>, config: &Config) -> Result<Arc<Request>> {
    match &request.body {
        Some(PayloadBody::Stored { store, key }) => {
            let adapter = config
                .payload_store(store)
                .ok_or_else(|| Error::UnknownStore(store.clone()))?;
            let payload = adapter
                .fetch(key)
                .await?
                .ok_or_else(|| Error::MissingPayload {
                    store: store.clone(),
                    key: key.clone(),
                })?;
            let body = payload
                .get("body")
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| Error::Storage(format!("payload {key:?} has no body field")))?;
            let mut resolved = (**request).clone();
            resolved.body = Some(PayloadBody::inline(body));
            Ok(Arc::new(resolved))
        }
        _ => Ok(request.clone()),
    }
}

async fn finish(
    inner: &Arc<Inner>,
    store: &Arc<dyn InflightStore>,
    request: &Arc<Request>,
    execution: Execution,
) {
    match execution {
        Execution::Completed(response) => {
            let duration = response.duration;
            let status = response.status;
            dispatch_result(inner, request, response.as_hash(), "response").await;
            inner.metrics.record_response(duration);
            debug!(
                request_id = %request.id,
                status,
                duration_ms = duration.as_millis() as u64,
                "request completed"
            );
        }
        Execution::Failed(error_value) => {
            let duration = error_value.duration();
            inner.metrics.record_error(&error_value, duration);
            debug!(
                request_id = %request.id,
                error_class = error_value.error_class(),
                error = %error_value,
                "request failed"
            );
            dispatch_result(inner, request, error_value.as_hash(), "error").await;
        }
        Execution::Cancelled => {
            requeue_request(inner, request).await;
        }
    }

    if let Err(err) = store.remove(request.id).await {
        warn!(request_id = %request.id, error = %err, "failed to remove inflight entry");
    }
}

async fn dispatch_result(
    inner: &Arc<Inner>,
    request: &Arc<Request>,
    blob: Result<serde_json::Value>,
    kind: &str,
) {
    let mut blob = match blob {
        Ok(blob) => blob,
        Err(err) => {
            error!(request_id = %request.id, error = %err, "failed to serialize result; re-enqueueing request");
            requeue_request(inner, request).await;
            return;
        }
    };

    if let Err(err) = payload::offload_body(&mut blob, &inner.config).await {
        warn!(request_id = %request.id, error = %err, "payload offload failed; sending body inline");
    }

    let envelope = callback_job_envelope(blob, kind, &request.callback_class);
    if let Err(err) = inner.config.queue().push(envelope).await {
        error!(request_id = %request.id, error = %err, "callback push failed; re-enqueueing request");
        requeue_request(inner, request).await;
    }
}

fn reenqueue_envelope(request: &Request) -> Result<JobEnvelope> {
    match &request.job_envelope {
        Some(envelope) => Ok(envelope.clone()),
        None => request_job_envelope(request),
    }
}

/// Pushes the request's originating job back onto the queue with a bumped
/// retry count. Returns whether the push succeeded.
async fn requeue_request(inner: &Arc<Inner>, request: &Arc<Request>) -> bool {
    let mut envelope = match reenqueue_envelope(request) {
        Ok(envelope) => envelope,
        Err(err) => {
            error!(request_id = %request.id, error = %err, "cannot re-enqueue request");
            return false;
        }
    };
    envelope.retry_count = envelope.retry_count.saturating_add(1);

    match inner.config.queue().push(envelope).await {
        Ok(()) => {
            inner.metrics.record_requeued();
            info!(request_id = %request.id, "request re-enqueued");
            true
        }
        Err(err) => {
            error!(request_id = %request.id, error = %err, "re-enqueue failed");
            false
        }
    }
}

async fn shutdown_sequence(
    inner: &Arc<Inner>,
    store: &Arc<dyn InflightStore>,
    rx: &mut mpsc::UnboundedReceiver<IntakeMsg>,
) {
    rx.close();
    while rx.try_recv().is_ok() {}

    let deadline = inner
        .stop_deadline
        .lock()
        .expect("deadline lock poisoned")
        .take()
        .unwrap_or_else(Instant::now);

    // Let in-flight work finish until the deadline.
    while Instant::now() < deadline {
        if inner.tasks.lock().expect("tasks lock poisoned").is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Split the stragglers: requests that never started have no task to
    // cancel, so they are re-enqueued directly; started ones get the
    // cooperative cancel and re-enqueue themselves.
    let (pending, started): (Vec<_>, Vec<_>) = {
        let tasks = inner.tasks.lock().expect("tasks lock poisoned");
        let snapshot: Vec<TaskEntry> = tasks.values().cloned().collect();
        snapshot.into_iter().partition(|entry| !entry.started)
    };

    let mut failed = 0usize;
    for entry in pending {
        let Some(entry) = inner.take_task(entry.request.id) else {
            continue;
        };
        if !requeue_request(inner, &entry.request).await {
            failed += 1;
        }
        if let Err(err) = store.remove(entry.request.id).await {
            warn!(request_id = %entry.request.id, error = %err, "failed to remove inflight entry");
        }
    }

    for entry in &started {
        entry.cancel.cancel();
    }

    if !started.is_empty() {
        // Cancelled tasks unwind on their next poll; give them a moment.
        let grace = Instant::now() + Duration::from_secs(1);
        while Instant::now() < grace {
            if inner.tasks.lock().expect("tasks lock poisoned").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    // Anything still present is wedged; claim and re-enqueue it here.
    let leftovers: Vec<Uuid> = inner
        .tasks
        .lock()
        .expect("tasks lock poisoned")
        .keys()
        .copied()
        .collect();
    for id in leftovers {
        let Some(entry) = inner.take_task(id) else {
            continue;
        };
        if !requeue_request(inner, &entry.request).await {
            failed += 1;
        }
        if let Err(err) = store.remove(id).await {
            warn!(request_id = %id, error = %err, "failed to remove inflight entry");
        }
    }

    if failed > 0 {
        error!(
            count = failed,
            "shutdown re-enqueue failed for some requests; their jobs may be lost"
        );
    }

    if let Err(err) = store.drain_owner(&inner.owner_pid).await {
        warn!(error = %err, "failed to drain owned registry entries");
    }
}

// ---------------------------------------------------------------------------
// Managed global instance

static GLOBAL: Mutex<Option<Processor>> = Mutex::new(None);

/// Installs a processor built from `config` as the process-global instance.
pub fn install(config: Config) -> Result<Processor> {
    let mut slot = GLOBAL.lock().expect("global lock poisoned");
    if let Some(existing) = &*slot {
        if existing.state() != ProcessorState::Stopped {
            return Err(Error::Config(
                "a processor is already installed and running".into(),
            ));
        }
    }
    let processor = Processor::new(config)?;
    *slot = Some(processor.clone());
    Ok(processor)
}

/// The installed processor.
pub fn global() -> Result<Processor> {
    GLOBAL
        .lock()
        .expect("global lock poisoned")
        .clone()
        .ok_or_else(|| Error::Config("offramp is not configured; call configure first".into()))
}

/// Tears down and forgets the global processor (tests).
pub fn reset_global() {
    if let Some(processor) = GLOBAL.lock().expect("global lock poisoned").take() {
        processor.reset();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::queue::InMemoryQueue;
    use crate::registry::MemoryInflightStore;
    use crate::types::Method;

    fn test_config() -> Config {
        let mut config = Config::new(Arc::new(InMemoryQueue::new()));
        config.set_inflight_store(Arc::new(MemoryInflightStore::new()));
        config
    }

    fn request() -> Request {
        Request::builder(Method::Get, "https://example.com/")
            .callback("Handler")
            .build()
            .expect("request should build")
    }

    #[test]
    fn enqueue_requires_running_state() {
        let processor = Processor::new(test_config()).expect("processor");
        assert_eq!(processor.state(), ProcessorState::Stopped);

        let err = processor.enqueue(request()).expect_err("not running");
        assert!(matches!(err, Error::NotRunning { state: "stopped" }));
    }

    #[test]
    fn start_transitions_to_running_and_stop_returns_to_stopped() {
        let processor = Processor::new(test_config()).expect("processor");
        processor.start().expect("start");
        assert_eq!(processor.state(), ProcessorState::Running);

        processor.quiet();
        assert_eq!(processor.state(), ProcessorState::Draining);

        let err = processor.enqueue(request()).expect_err("draining refuses");
        assert!(matches!(err, Error::NotRunning { state: "draining" }));

        processor.stop(Duration::from_millis(100)).expect("stop");
        assert_eq!(processor.state(), ProcessorState::Stopped);
    }

    #[test]
    fn double_start_is_rejected() {
        let processor = Processor::new(test_config()).expect("processor");
        processor.start().expect("start");
        assert!(processor.start().is_err());
        processor.reset();
    }

    #[test]
    fn stop_when_already_stopped_is_a_no_op() {
        let processor = Processor::new(test_config()).expect("processor");
        processor.stop(Duration::from_millis(10)).expect("stop");
        assert_eq!(processor.state(), ProcessorState::Stopped);
    }

    #[test]
    fn invalid_config_is_rejected_at_construction() {
        let mut config = test_config();
        config.max_connections = 0;
        assert!(Processor::new(config).is_err());
    }

    #[test]
    fn eviction_prefers_the_longest_queued_pending_task() {
        let mut tasks = HashMap::new();
        let mut insert = |seq: u64, started: bool| {
            let request = Arc::new(request());
            let id = request.id;
            tasks.insert(
                id,
                TaskEntry {
                    request,
                    cancel: CancellationToken::new(),
                    enqueued_at: Utc::now(),
                    seq,
                    started,
                    evicted: false,
                },
            );
            id
        };

        let _running = insert(0, true);
        let oldest_pending = insert(1, false);
        let _newer_pending = insert(2, false);

        assert_eq!(select_eviction_victim(&tasks), Some(oldest_pending));

        // Started tasks are never evicted.
        tasks.retain(|_, entry| entry.started);
        assert_eq!(select_eviction_victim(&tasks), None);
    }
}
