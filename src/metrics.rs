//! In-process counters for the processor. Plain atomics, no exporter; read
//! them through [`Metrics::snapshot`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::types::{ErrorKind, ErrorValue};

/// Atomic counters shared by the processor, its tasks, and callers.
#[derive(Debug, Default)]
pub struct Metrics {
    in_flight: AtomicU64,
    total: AtomicU64,
    responses: AtomicU64,
    requeued: AtomicU64,
    errors_by_kind: [AtomicU64; ErrorKind::ALL.len()],
    client_errors: AtomicU64,
    server_errors: AtomicU64,
    /// f64 seconds stored as bits; updated with a compare-and-swap loop.
    total_duration_bits: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn task_started(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn task_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn record_response(&self, duration: Duration) {
        self.total.fetch_add(1, Ordering::SeqCst);
        self.responses.fetch_add(1, Ordering::SeqCst);
        self.add_duration(duration);
    }

    pub(crate) fn record_error(&self, error: &ErrorValue, duration: Duration) {
        self.total.fetch_add(1, Ordering::SeqCst);
        match error {
            ErrorValue::Transport(transport) => self.bump_kind(transport.kind),
            ErrorValue::Redirect(_) => self.bump_kind(ErrorKind::Redirect),
            ErrorValue::Http(http) => {
                if http.response().is_client_error() {
                    self.client_errors.fetch_add(1, Ordering::SeqCst);
                } else {
                    self.server_errors.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
        self.add_duration(duration);
    }

    pub(crate) fn record_requeued(&self) {
        self.requeued.fetch_add(1, Ordering::SeqCst);
    }

    fn bump_kind(&self, kind: ErrorKind) {
        let idx = ErrorKind::ALL
            .iter()
            .position(|candidate| *candidate == kind)
            .unwrap_or(ErrorKind::ALL.len() - 1);
        self.errors_by_kind[idx].fetch_add(1, Ordering::SeqCst);
    }

    fn add_duration(&self, duration: Duration) {
        let add = duration.as_secs_f64();
        let mut current = self.total_duration_bits.load(Ordering::SeqCst);
        loop {
            let next = (f64::from_bits(current) + add).to_bits();
            match self.total_duration_bits.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut errors = BTreeMap::new();
        for (idx, kind) in ErrorKind::ALL.iter().enumerate() {
            let count = self.errors_by_kind[idx].load(Ordering::SeqCst);
            if count > 0 {
                errors.insert(kind.as_str().to_string(), count);
            }
        }
        let client_errors = self.client_errors.load(Ordering::SeqCst);
        if client_errors > 0 {
            errors.insert("client_error".to_string(), client_errors);
        }
        let server_errors = self.server_errors.load(Ordering::SeqCst);
        if server_errors > 0 {
            errors.insert("server_error".to_string(), server_errors);
        }

        MetricsSnapshot {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            total: self.total.load(Ordering::SeqCst),
            responses: self.responses.load(Ordering::SeqCst),
            requeued: self.requeued.load(Ordering::SeqCst),
            errors,
            total_duration: f64::from_bits(self.total_duration_bits.load(Ordering::SeqCst)),
        }
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub in_flight: u64,
    pub total: u64,
    pub responses: u64,
    pub requeued: u64,
    /// Error counts keyed by kind (or `client_error` / `server_error`).
    pub errors: BTreeMap<String, u64>,
    /// Accumulated request duration in seconds.
    pub total_duration: f64,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::types::{CallbackArgs, Method, TransportError};

    fn transport_error(kind: ErrorKind) -> ErrorValue {
        ErrorValue::Transport(TransportError {
            kind,
            message: "boom".to_string(),
            cause: None,
            duration: Duration::from_millis(10),
            request_id: Uuid::new_v4(),
            url: "http://example.com/".to_string(),
            method: Method::Get,
            callback_args: CallbackArgs::new(),
        })
    }

    #[test]
    fn gauge_tracks_in_flight_tasks() {
        let metrics = Metrics::new();
        metrics.task_started();
        metrics.task_started();
        metrics.task_finished();
        assert_eq!(metrics.snapshot().in_flight, 1);
    }

    #[test]
    fn errors_count_by_kind() {
        let metrics = Metrics::new();
        metrics.record_error(&transport_error(ErrorKind::Timeout), Duration::from_millis(5));
        metrics.record_error(&transport_error(ErrorKind::Timeout), Duration::from_millis(5));
        metrics.record_error(
            &transport_error(ErrorKind::Connection),
            Duration::from_millis(5),
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.errors.get("timeout"), Some(&2));
        assert_eq!(snapshot.errors.get("connection"), Some(&1));
        assert_eq!(snapshot.errors.get("ssl"), None);
    }

    #[test]
    fn duration_accumulates_under_concurrency() {
        let metrics = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        metrics.record_response(Duration::from_millis(10));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread should finish");
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.responses, 800);
        assert!((snapshot.total_duration - 8.0).abs() < 1e-6);
    }
}
