//! Remote fetch behaviour against a mock HTTP server.

mod common;

use std::time::{Duration, Instant};

use common::{clean_csv, HEADER};
use medallion_core::{
    AbortReason, FetchError, Layer, Pipeline, PipelineConfig, RetryPolicy, RunOutcome,
    SourceFetcher, SourceLocator,
};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 1,
        multiplier: 2,
    }
}

fn fetcher(timeout: Duration) -> SourceFetcher {
    SourceFetcher::new(fast_retry(), timeout).unwrap()
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.unwrap_or_default().len()
}

fn cancel_after(delay: Duration) -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        trigger.cancel();
    });
    cancel
}

#[tokio::test]
async fn succeeds_after_transient_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data.csv"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data.csv"))
        .respond_with(ResponseTemplate::new(200).set_body_string(clean_csv()))
        .mount(&server)
        .await;

    let locator = SourceLocator::Url(format!("{}/data.csv", server.uri()));
    let table = fetcher(Duration::from_secs(5))
        .fetch(&locator, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(table.num_rows(), 36);
    assert_eq!(request_count(&server).await, 3);
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let locator = SourceLocator::Url(format!("{}/data.csv", server.uri()));
    let err = fetcher(Duration::from_secs(5))
        .fetch(&locator, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        FetchError::Exhausted { attempts, last } => {
            assert_eq!(attempts, 3);
            assert!(matches!(*last, FetchError::Status { status: 503, .. }));
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
    assert_eq!(request_count(&server).await, 3);
}

#[tokio::test]
async fn slow_responses_time_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(clean_csv())
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let locator = SourceLocator::Url(format!("{}/data.csv", server.uri()));
    let err = fetcher(Duration::from_millis(50))
        .fetch(&locator, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        FetchError::Exhausted { last, .. } => {
            assert!(matches!(*last, FetchError::Timeout { .. }))
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_payload_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Date,Country\n2020-01-01,A\n"))
        .mount(&server)
        .await;

    let locator = SourceLocator::Url(format!("{}/data.csv", server.uri()));
    let err = fetcher(Duration::from_secs(5))
        .fetch(&locator, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::MissingColumn(_)));
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn header_only_payload_yields_empty_table() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!("{HEADER}\n")))
        .mount(&server)
        .await;

    let locator = SourceLocator::Url(format!("{}/data.csv", server.uri()));
    let table = fetcher(Duration::from_secs(5))
        .fetch(&locator, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(table.num_rows(), 0);
    assert_eq!(table.num_columns(), 5);
}

#[tokio::test]
async fn pipeline_runs_against_remote_source() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/countries-aggregated.csv"))
        .respond_with(ResponseTemplate::new(200).set_body_string(clean_csv()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default()
        .with_source(SourceLocator::parse(&format!(
            "{}/countries-aggregated.csv",
            server.uri()
        )))
        .with_storage_root(dir.path())
        .with_retry(fast_retry());

    let pipeline = Pipeline::new(config).unwrap();
    let report = pipeline.run().await.unwrap();
    assert!(report.is_success(), "{}", report.outcome);
    assert_eq!(pipeline.store().read(Layer::Gold).unwrap().num_rows(), 10);
}

#[tokio::test]
async fn cancellation_interrupts_in_flight_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(clean_csv())
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let locator = SourceLocator::Url(format!("{}/data.csv", server.uri()));
    let started = Instant::now();
    let err = fetcher(Duration::from_secs(30))
        .fetch(&locator, &cancel_after(Duration::from_millis(100)))
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Cancelled), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn cancellation_interrupts_backoff_wait() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let slow_retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff_ms: 30_000,
        multiplier: 2,
    };
    let locator = SourceLocator::Url(format!("{}/data.csv", server.uri()));
    let started = Instant::now();
    let err = SourceFetcher::new(slow_retry, Duration::from_secs(5))
        .unwrap()
        .fetch(&locator, &cancel_after(Duration::from_millis(200)))
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Cancelled), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(request_count(&server).await, 1);
}

#[tokio::test]
async fn cancelled_download_writes_no_bronze() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(clean_csv())
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default()
        .with_source(SourceLocator::parse(&format!("{}/data.csv", server.uri())))
        .with_storage_root(dir.path())
        .with_retry(fast_retry());
    let pipeline = Pipeline::new(config).unwrap();

    let started = Instant::now();
    let report = pipeline
        .run_with_cancel(&cancel_after(Duration::from_millis(100)))
        .await
        .unwrap();

    assert_eq!(
        report.outcome,
        RunOutcome::Aborted {
            reason: AbortReason::Cancelled
        }
    );
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(report.layers.is_empty());
    assert!(!pipeline.store().exists(Layer::Bronze));
}
