//! Job-queue collaborator contract and the two job classes the crate
//! registers with the host system.
//!
//! The queue itself is external: anything that can push an envelope and
//! re-run it later (at least once) satisfies [`JobQueue`]. The crate pushes
//! callback jobs when requests finish and re-pushes original envelopes when
//! work must survive a shutdown or crash.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::config::Config;
use crate::errors::{Error, Result, ValidationError};
use crate::payload;
use crate::types::{ErrorValue, Request, Response};
use crate::{CALLBACK_JOB_CLASS, REQUEST_JOB_CLASS};

/// A job as the host queue sees it: a class name, positional args, and
/// enough metadata to count redeliveries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub class: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, Value>,
}

impl JobEnvelope {
    pub fn new(class: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            class: class.into(),
            args,
            retry_count: 0,
            metadata: serde_json::Map::new(),
        }
    }
}

/// The narrow surface this crate needs from the host job system.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn push(&self, envelope: JobEnvelope) -> Result<()>;
}

/// Test queue collecting pushed envelopes in memory.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    pushed: Mutex<Vec<JobEnvelope>>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pushed(&self) -> Vec<JobEnvelope> {
        self.pushed.lock().expect("queue lock poisoned").clone()
    }

    pub fn take_all(&self) -> Vec<JobEnvelope> {
        std::mem::take(&mut *self.pushed.lock().expect("queue lock poisoned"))
    }

    pub fn len(&self) -> usize {
        self.pushed.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn push(&self, envelope: JobEnvelope) -> Result<()> {
        self.pushed.lock().expect("queue lock poisoned").push(envelope);
        Ok(())
    }
}

/// Builds the callback-job envelope pushed after a request terminates.
pub fn callback_job_envelope(
    result_blob: Value,
    result_kind: &str,
    callback_class: &str,
) -> JobEnvelope {
    JobEnvelope::new(
        CALLBACK_JOB_CLASS,
        vec![
            result_blob,
            Value::String(result_kind.to_string()),
            Value::String(callback_class.to_string()),
        ],
    )
}

/// Builds a request-job envelope so a request accepted outside any job can
/// still be re-enqueued on crash or shutdown.
pub fn request_job_envelope(request: &Request) -> Result<JobEnvelope> {
    Ok(JobEnvelope::new(
        REQUEST_JOB_CLASS,
        vec![request.as_hash()?],
    ))
}

fn arg<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a Value> {
    args.get(index).ok_or_else(|| {
        Error::Validation(ValidationError::for_field(
            name.to_string(),
            format!("callback job is missing argument {index}"),
        ))
    })
}

/// Runs a callback job on behalf of the host queue.
///
/// Resolves the callback class, loads the result blob (fetching any
/// externally stored body), fires the matching global hook, and invokes
/// `on_complete` / `on_error`. The stored payload is deleted afterwards even
/// when loading or the callback itself fails.
pub async fn run_callback_job(args: &[Value], config: &Config) -> Result<()> {
    let blob = arg(args, 0, "result_blob")?.clone();
    let kind = arg(args, 1, "result_kind")?
        .as_str()
        .ok_or_else(|| {
            Error::Validation(ValidationError::for_field(
                "result_kind",
                "must be a string",
            ))
        })?
        .to_string();
    let class_name = arg(args, 2, "callback_class")?
        .as_str()
        .ok_or_else(|| {
            Error::Validation(ValidationError::for_field(
                "callback_class",
                "must be a string",
            ))
        })?
        .to_string();

    let callback = config
        .callbacks()
        .resolve(&class_name)
        .ok_or_else(|| Error::UnknownCallback(class_name.clone()))?;

    // Capture the reference before resolution so cleanup still runs when the
    // fetch or the callback fails.
    let stored = payload::body_ref(&blob);

    let outcome = invoke_callback(blob, &kind, callback.as_ref(), config).await;

    if let Some((store, key)) = stored {
        payload::unstore(&store, &key, config).await;
    }

    outcome
}

async fn invoke_callback(
    mut blob: Value,
    kind: &str,
    callback: &dyn crate::callback::Callback,
    config: &Config,
) -> Result<()> {
    payload::resolve_body_ref(&mut blob, config).await?;

    match kind {
        "response" => {
            let response = Response::load(blob)?;
            if let Some(hook) = &config.hooks().after_completion {
                hook(&response);
            }
            callback.on_complete(response);
            Ok(())
        }
        "error" => {
            let error = ErrorValue::load(blob)?;
            if let Some(hook) = &config.hooks().after_error {
                hook(&error);
            }
            callback.on_error(error);
            Ok(())
        }
        other => Err(Error::Validation(ValidationError::for_field(
            "result_kind",
            format!("unknown result kind {other:?}"),
        ))),
    }
}

/// Final-retry hook: when the host queue exhausts a callback job's retries,
/// this still deletes the stored payload so blobs do not leak.
pub async fn cleanup_callback_payload(args: &[Value], config: &Config) {
    let Some(blob) = args.first() else { return };
    if let Some((store, key)) = payload::body_ref(blob) {
        payload::unstore(&store, &key, config).await;
    }
}

/// Runs a request job: the fallback path that lets code outside a worker
/// enqueue requests. The job simply reconstructs the request and hands it to
/// the processor.
pub fn run_request_job(args: &[Value], processor: &crate::processor::Processor) -> Result<()> {
    let blob = arg(args, 0, "request_blob")?.clone();
    let mut request = Request::load(blob)?;

    if let Some(class_name) = args.get(1).and_then(Value::as_str) {
        if !class_name.trim().is_empty() {
            request.callback_class = class_name.to_string();
        }
    }
    if let Some(raise) = args.get(2).and_then(Value::as_bool) {
        request.raise_error_responses = raise;
    }

    match processor.enqueue(request) {
        Ok(_) => Ok(()),
        Err(err @ (Error::NotRunning { .. } | Error::MaxCapacity { .. })) => {
            // Raising lets the host queue retry the job later.
            warn!(error = %err, "request job deferred; processor unavailable");
            Err(err)
        }
        Err(err) => Err(err),
    }
}

/// Routes an envelope to the job class this crate registers with the host
/// queue. Returns `None` for classes the crate does not own, so host
/// middleware can fall through to its normal dispatch.
pub async fn run_registered_job(
    envelope: &JobEnvelope,
    processor: &crate::processor::Processor,
) -> Option<Result<()>> {
    match envelope.class.as_str() {
        CALLBACK_JOB_CLASS => Some(run_callback_job(&envelope.args, processor.config()).await),
        REQUEST_JOB_CLASS => Some(run_request_job(&envelope.args, processor)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn envelope_round_trips() {
        let mut envelope = JobEnvelope::new("jobs::Deliver", vec![json!(1), json!("a")]);
        envelope.retry_count = 2;
        envelope
            .metadata
            .insert("queue".to_string(), json!("critical"));

        let value = serde_json::to_value(&envelope).unwrap();
        let loaded: JobEnvelope = serde_json::from_value(value).unwrap();
        assert_eq!(loaded, envelope);
    }

    #[test]
    fn callback_envelope_carries_blob_kind_and_class() {
        let envelope = callback_job_envelope(json!({"status": 200}), "response", "Handler");
        assert_eq!(envelope.class, CALLBACK_JOB_CLASS);
        assert_eq!(envelope.args.len(), 3);
        assert_eq!(envelope.args[1], json!("response"));
        assert_eq!(envelope.args[2], json!("Handler"));
    }

    #[tokio::test]
    async fn in_memory_queue_collects_pushes() {
        let queue = InMemoryQueue::new();
        queue
            .push(JobEnvelope::new("a", vec![]))
            .await
            .expect("push");
        queue
            .push(JobEnvelope::new("b", vec![]))
            .await
            .expect("push");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.take_all().len(), 2);
        assert!(queue.is_empty());
    }
}
