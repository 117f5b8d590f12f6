//! Background maintenance: periodic heartbeat refresh for the local
//! in-flight set and orphan recovery under the distributed GC lock.
//!
//! One monitor runs per processor, on the reactor runtime. Its sleeps are
//! interruptible; cancelling the token unblocks it immediately.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::queue::JobQueue;
use crate::registry::{cleanup_orphaned, InflightStore};

pub(crate) struct MonitorContext {
    pub store: Arc<dyn InflightStore>,
    pub queue: Arc<dyn JobQueue>,
    pub owner: String,
    pub heartbeat_interval: Duration,
    pub orphan_threshold: Duration,
    pub gc_lock_ttl: Duration,
    /// Test mode: panic on errors instead of logging them.
    pub raise_errors: bool,
    pub inflight_ids: Arc<dyn Fn() -> Vec<Uuid> + Send + Sync>,
}

impl MonitorContext {
    fn report(&self, what: &str, err: crate::errors::Error) {
        if self.raise_errors {
            panic!("monitor {what} failed: {err}");
        }
        warn!(error = %err, "monitor {what} failed");
    }
}

pub(crate) async fn run(ctx: MonitorContext, cancel: CancellationToken) {
    let mut heartbeat = tokio::time::interval(ctx.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    // GC runs on the same cadence, staggered by half an interval so the two
    // passes never coincide.
    let mut gc = tokio::time::interval_at(
        tokio::time::Instant::now() + ctx.heartbeat_interval / 2,
        ctx.heartbeat_interval,
    );
    gc.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = heartbeat.tick() => heartbeat_pass(&ctx).await,
            _ = gc.tick() => gc_pass(&ctx).await,
        }
    }
    debug!(owner = %ctx.owner, "monitor stopped");
}

async fn heartbeat_pass(ctx: &MonitorContext) {
    let ids = (ctx.inflight_ids)();
    if ids.is_empty() {
        return;
    }
    if let Err(err) = ctx.store.heartbeat(&ids, Utc::now()).await {
        ctx.report("heartbeat", err);
    }
}

async fn gc_pass(ctx: &MonitorContext) {
    let held = match ctx.store.acquire_gc_lock(&ctx.owner, ctx.gc_lock_ttl).await {
        Ok(held) => held,
        Err(err) => {
            ctx.report("gc lock acquisition", err);
            return;
        }
    };
    if !held {
        return;
    }

    match cleanup_orphaned(ctx.store.as_ref(), ctx.queue.as_ref(), ctx.orphan_threshold).await {
        Ok(recovered) if recovered > 0 => {
            debug!(owner = %ctx.owner, recovered, "orphan gc recovered entries");
        }
        Ok(_) => {}
        Err(err) => ctx.report("orphan gc", err),
    }

    if let Err(err) = ctx.store.release_gc_lock(&ctx.owner).await {
        ctx.report("gc lock release", err);
    }
}
