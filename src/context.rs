//! Explicit current-job context.
//!
//! Host job systems install a middleware that scopes the executing job's
//! envelope around the job body. Requests built inside that scope pick up
//! the envelope automatically, which is what makes crash re-enqueue able to
//! replay the *originating job* rather than a bare request.

use std::cell::RefCell;

use crate::queue::JobEnvelope;

thread_local! {
    static CURRENT_JOB: RefCell<Option<JobContext>> = const { RefCell::new(None) };
}

/// The job currently executing on this worker thread.
#[derive(Debug, Clone, PartialEq)]
pub struct JobContext {
    pub class: String,
    pub envelope: JobEnvelope,
}

impl JobContext {
    pub fn new(class: impl Into<String>, envelope: JobEnvelope) -> Self {
        Self {
            class: class.into(),
            envelope,
        }
    }
}

/// Scopes `context` as the current job until the guard drops; the previous
/// context (if any) is restored.
#[must_use = "the context is cleared when the guard drops"]
pub struct JobContextGuard {
    previous: Option<JobContext>,
}

impl Drop for JobContextGuard {
    fn drop(&mut self) {
        CURRENT_JOB.with(|slot| {
            *slot.borrow_mut() = self.previous.take();
        });
    }
}

/// Installs `context` for the current thread, returning a guard that
/// restores the previous context on drop. This is the middleware primitive:
///
/// ```ignore
/// let _guard = offramp::set_current_job(JobContext::new(class, envelope));
/// job.perform(args);
/// ```
pub fn set_current_job(context: JobContext) -> JobContextGuard {
    let previous = CURRENT_JOB.with(|slot| slot.borrow_mut().replace(context));
    JobContextGuard { previous }
}

/// Runs `f` with `context` installed.
pub fn with_current_job<R>(context: JobContext, f: impl FnOnce() -> R) -> R {
    let _guard = set_current_job(context);
    f()
}

/// The job context installed on this thread, if any.
pub fn current_job() -> Option<JobContext> {
    CURRENT_JOB.with(|slot| slot.borrow().clone())
}
