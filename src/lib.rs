//! Offload long-running outbound HTTP requests from job workers.
//!
//! Worker threads hand a [`Request`] to the [`Processor`] and return
//! immediately; a dedicated reactor thread runs the HTTP exchange and, when
//! it terminates, pushes a callback job back onto the host queue carrying
//! either a [`Response`] or an [`ErrorValue`]. In-flight work is mirrored
//! into a shared registry with heartbeats, so requests owned by a crashed
//! process are re-enqueued by whichever survivor wins the GC lock.
//!
//! ```no_run
//! use std::sync::Arc;
//! use offramp::{Callback, RequestOptions, Response};
//!
//! struct Notify;
//!
//! impl Callback for Notify {
//!     fn on_complete(&self, response: Response) {
//!         println!("{} finished with {}", response.url, response.status);
//!     }
//! }
//!
//! # fn main() -> offramp::Result<()> {
//! # let queue: Arc<dyn offramp::JobQueue> = Arc::new(offramp::InMemoryQueue::new());
//! offramp::configure(queue, |config| {
//!     config.max_connections = 100;
//!     config.register_callback("Notify", || Box::new(Notify));
//! })?;
//! offramp::start()?;
//!
//! offramp::get("https://api.example.com/slow", RequestOptions::callback("Notify"))?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

/// Default overall request timeout (60 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Default TCP/TLS handshake timeout (5 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on locally in-flight requests.
pub const DEFAULT_MAX_CONNECTIONS: usize = 50;

/// Default redirect-hop limit.
pub const DEFAULT_MAX_REDIRECTS: u32 = 10;

/// Default response body cap (10 MiB).
pub const DEFAULT_MAX_RESPONSE_SIZE: usize = 10 * 1024 * 1024;

/// Default pooled connections kept per host.
pub const DEFAULT_MAX_HOST_CLIENTS: usize = 10;

/// Default idle-connection lifetime in the pool.
pub const DEFAULT_IDLE_CONNECTION_TIMEOUT: Duration = Duration::from_secs(90);

/// Default registry heartbeat cadence.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Entries without a heartbeat for this long are orphans.
pub const DEFAULT_ORPHAN_THRESHOLD: Duration = Duration::from_secs(300);

/// Default TTL on the distributed GC lock.
pub const DEFAULT_GC_LOCK_TTL: Duration = Duration::from_secs(30);

/// Serialized results above this size move their body to a payload store.
pub const DEFAULT_PAYLOAD_STORE_THRESHOLD: usize = 64 * 1024;

/// Default deadline handed to `stop` by the lifecycle wiring.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(25);

/// Default bounded wait of the `Block` backpressure strategy.
pub const DEFAULT_BLOCK_WAIT: Duration = Duration::from_millis(100);

/// Default key prefix for shared registry entries.
pub const DEFAULT_REGISTRY_PREFIX: &str = "offramp";

/// Job class the host queue routes to [`run_callback_job`].
pub const CALLBACK_JOB_CLASS: &str = "offramp::CallbackJob";

/// Job class the host queue routes to [`run_request_job`].
pub const REQUEST_JOB_CLASS: &str = "offramp::RequestJob";

/// Reactor dequeue timeout; bounds how long housekeeping can be deferred.
pub(crate) const INTAKE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Cadence of the reactor's own heartbeat refresh for local in-flight ids.
pub(crate) const LOCAL_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

mod callback;
mod config;
mod context;
mod convenience;
mod errors;
mod executor;
mod metrics;
mod monitor;
mod payload;
mod processor;
mod queue;
mod registry;
mod types;

pub use callback::{Callback, CallbackRegistry};
pub use config::{BackpressureStrategy, Config, Hooks};
pub use context::{
    current_job, set_current_job, with_current_job, JobContext, JobContextGuard,
};
pub use convenience::{
    delete, get, head, options, patch, post, put, request, RequestOptions,
};
pub use errors::{Error, Result, ValidationError};
pub use metrics::{Metrics, MetricsSnapshot};
pub use payload::{
    FilePayloadStore, MemoryPayloadStore, PayloadStore, RedisPayloadStore,
};
pub use processor::{Processor, ProcessorState};
pub use queue::{
    callback_job_envelope, cleanup_callback_payload, request_job_envelope, run_callback_job,
    run_registered_job, run_request_job, InMemoryQueue, JobEnvelope, JobQueue,
};
pub use registry::{
    cleanup_orphaned, InflightEntry, InflightStore, MemoryInflightStore, RedisInflightStore,
};
pub use types::{
    CallbackArgs, ErrorKind, ErrorValue, HttpError, HttpHeaders, Method, PayloadBody,
    RedirectDetails, RedirectError, Request, RequestBuilder, Response, TransportError,
};

/// Builds a [`Config`] around the host job queue, applies `f`, and installs
/// the resulting processor as the process-global instance.
pub fn configure<F>(queue: Arc<dyn JobQueue>, f: F) -> Result<Processor>
where
    F: FnOnce(&mut Config),
{
    let mut config = Config::new(queue);
    f(&mut config);
    processor::install(config)
}

/// Starts the global processor. Wire this to the host job system's startup
/// event.
pub fn start() -> Result<()> {
    processor::global()?.start()
}

/// Drains the global processor: no new work, in-flight requests finish.
/// Wire this to the host's quiet signal (TSTP or equivalent).
pub fn quiet() -> Result<()> {
    processor::global()?.quiet();
    Ok(())
}

/// Stops the global processor within `timeout` (the configured
/// `shutdown_timeout` when `None`), re-enqueueing whatever cannot finish in
/// time. Wire this to the host's shutdown event.
pub fn shutdown(timeout: Option<Duration>) -> Result<()> {
    let processor = processor::global()?;
    let timeout = timeout.unwrap_or(processor.config().shutdown_timeout);
    processor.stop(timeout)
}

/// Snapshot of the global processor's counters.
pub fn metrics() -> Result<MetricsSnapshot> {
    Ok(processor::global()?.metrics())
}

/// Test helper: tears down and forgets the global processor.
pub fn reset() {
    processor::reset_global();
}
