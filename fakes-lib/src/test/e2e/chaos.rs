use rama::http::{
    BodyExtractExt as _, StatusCode,
    service::{client::HttpClientExt as _, web::response::Json},
};
use serde_json::json;

use crate::{
    Endpoint, FakeService, SequenceSource,
    test::e2e::client::{client, retry_client},
};

fn flaky_endpoint(failure_rate_percent: i32) -> Endpoint {
    Endpoint::new("/")
        .with_response(r#"{"ok":true}"#)
        .with_failure_rate(failure_rate_percent)
        .with_failure_handler(|_| {
            (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "something bad happened"})),
            )
        })
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_always_failing_endpoint_recovers_after_default_budget() {
    let fake = FakeService::new()
        .with_endpoint(flaky_endpoint(100))
        .run()
        .await
        .unwrap();

    let client = client();
    let mut statuses = Vec::new();
    for _ in 0..5 {
        let resp = client.get(fake.url("/")).send().await.unwrap();
        statuses.push(resp.status());
    }

    assert_eq!(
        vec![
            StatusCode::BAD_REQUEST,
            StatusCode::BAD_REQUEST,
            StatusCode::BAD_REQUEST,
            StatusCode::OK,
            StatusCode::OK,
        ],
        statuses
    );
    assert_eq!(Some(5), fake.calls("/"));

    fake.tidy_up().await;
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_failure_response_comes_from_failure_handler() {
    let fake = FakeService::new()
        .with_endpoint(flaky_endpoint(100).with_header("x-fake", "1"))
        .run()
        .await
        .unwrap();

    let resp = client().get(fake.url("/")).send().await.unwrap();
    assert_eq!(StatusCode::BAD_REQUEST, resp.status());
    assert!(resp.headers().get("x-fake").is_none());
    assert_eq!(
        json!({"error": "something bad happened"}),
        resp.try_into_json::<serde_json::Value>().await.unwrap()
    );

    fake.tidy_up().await;
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_zero_failure_rate_never_fails() {
    let fake = FakeService::new()
        .with_endpoint(flaky_endpoint(0))
        .run()
        .await
        .unwrap();

    let client = client();
    for _ in 0..10 {
        let resp = client.get(fake.url("/")).send().await.unwrap();
        assert_eq!(StatusCode::OK, resp.status());
    }

    fake.tidy_up().await;
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_half_failure_rate_follows_draws() {
    let fake = FakeService::new()
        .with_chaos_source(SequenceSource::new([10, 90]))
        .with_endpoint(flaky_endpoint(50).with_max_failure_count(10))
        .run()
        .await
        .unwrap();

    let client = client();
    let mut failures = 0;
    let mut successes = 0;
    for _ in 0..6 {
        let resp = client.get(fake.url("/")).send().await.unwrap();
        match resp.status() {
            StatusCode::BAD_REQUEST => failures += 1,
            StatusCode::OK => successes += 1,
            status => panic!("unexpected status: {status}"),
        }
    }
    assert_eq!(3, failures);
    assert_eq!(3, successes);

    fake.tidy_up().await;
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_half_failure_rate_with_seed_sees_both_paths() {
    let fake = FakeService::new()
        .with_chaos_seed(42)
        .with_endpoint(flaky_endpoint(50).with_max_failure_count(u32::MAX))
        .run()
        .await
        .unwrap();

    let client = client();
    let mut failures = 0;
    for _ in 0..50 {
        let resp = client.get(fake.url("/")).send().await.unwrap();
        if resp.status() == StatusCode::BAD_REQUEST {
            failures += 1;
        }
    }
    assert!(failures > 0, "expected at least one induced failure");
    assert!(failures < 50, "expected at least one normal response");

    fake.tidy_up().await;
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_max_failure_count() {
    let fake = FakeService::new()
        .with_endpoint(flaky_endpoint(100).with_max_failure_count(1))
        .run()
        .await
        .unwrap();

    let client = client();

    let resp = client.get(fake.url("/")).send().await.unwrap();
    assert_eq!(StatusCode::BAD_REQUEST, resp.status());

    for _ in 0..3 {
        let resp = client.get(fake.url("/")).send().await.unwrap();
        assert_eq!(StatusCode::OK, resp.status());
    }

    fake.tidy_up().await;
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_retrying_client_reaches_eventual_success() {
    let fake = FakeService::new()
        .with_endpoint(
            Endpoint::new("/resource")
                .with_response(r#"{"ok":true}"#)
                .with_failure_rate(100)
                .with_failure_handler(|_| StatusCode::SERVICE_UNAVAILABLE),
        )
        .run()
        .await
        .unwrap();

    let resp = retry_client()
        .get(fake.url("/resource"))
        .send()
        .await
        .unwrap();
    assert_eq!(StatusCode::OK, resp.status());
    assert_eq!(r#"{"ok":true}"#, resp.try_into_string().await.unwrap());

    // three induced failures, followed by the successful attempt
    assert_eq!(Some(4), fake.calls("/resource"));

    fake.tidy_up().await;
}
