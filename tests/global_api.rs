//! The process-global configure/start/shutdown surface.
//!
//! These tests share one global processor, so they run as a single test.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use offramp::{Callback, InMemoryQueue, JobQueue, RequestOptions, Response};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Collect(Arc<Mutex<Vec<u16>>>);

impl Callback for Collect {
    fn on_complete(&self, response: Response) {
        self.0.lock().expect("lock").push(response.status);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn configure_start_request_shutdown_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .and(query_param("source", "worker"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let queue = Arc::new(InMemoryQueue::new());
    let statuses = Arc::new(Mutex::new(Vec::new()));

    let queue_handle: Arc<dyn JobQueue> = queue.clone();
    let collected = statuses.clone();
    let processor = offramp::configure(queue_handle, |config| {
        config.max_connections = 4;
        config.register_callback("Collect", move || Box::new(Collect(collected.clone())));
    })
    .expect("configure");

    // Lifecycle preconditions hold before start.
    let err = offramp::get(&format!("{}/ping", server.uri()), RequestOptions::callback("Collect"))
        .expect_err("not running yet");
    assert!(matches!(err, offramp::Error::NotRunning { .. }));

    offramp::start().expect("start");

    let options = RequestOptions {
        params: vec![("source".to_string(), "worker".to_string())],
        ..RequestOptions::callback("Collect")
    };
    offramp::get(&format!("{}/ping", server.uri()), options).expect("request accepted");

    let deadline = Instant::now() + Duration::from_secs(5);
    while queue.len() < 1 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let envelopes = queue.take_all();
    assert_eq!(envelopes.len(), 1);

    // Run the callback job the way a worker would.
    for envelope in &envelopes {
        assert_eq!(envelope.class, offramp::CALLBACK_JOB_CLASS);
        offramp::run_callback_job(&envelope.args, processor.config())
            .await
            .expect("callback job");
    }
    assert_eq!(statuses.lock().expect("lock").as_slice(), [200]);

    let snapshot = offramp::metrics().expect("metrics");
    assert_eq!(snapshot.responses, 1);

    offramp::quiet().expect("quiet");
    offramp::shutdown(Some(Duration::from_millis(500))).expect("shutdown");
    offramp::reset();
}
