use std::{net::Ipv4Addr, time::Duration};

use rama::http::{StatusCode, service::client::HttpClientExt as _};

use crate::{Endpoint, FakeService, test::e2e::client::client};

async fn is_accepting(port: u16) -> bool {
    tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .is_ok()
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_tidy_up_reports_uncalled_endpoint_and_releases_socket() {
    let fake = FakeService::new()
        .with_endpoint(Endpoint::new("/called"))
        .with_endpoint(Endpoint::new("/forgotten"))
        .run()
        .await
        .unwrap();
    let port = fake.socket_addr().port;

    let resp = client().get(fake.url("/called")).send().await.unwrap();
    assert_eq!(StatusCode::OK, resp.status());

    let report = fake.try_tidy_up().await.unwrap_err();
    assert_eq!(1, report.uncalled.len());
    assert_eq!("/forgotten", report.uncalled[0].path);
    assert!(report.failed_expectations.is_empty());
    assert!(report.to_string().contains("/forgotten"));

    assert!(!is_accepting(port).await);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_tidy_up_reports_failed_expectation() {
    let fake = FakeService::new()
        .with_endpoint(
            Endpoint::new("/secure")
                .with_expectation(|req| assert_eq!(Some("Bearer token"), req.header("authorization"))),
        )
        .run()
        .await
        .unwrap();

    // the request still takes the normal path
    let resp = client().get(fake.url("/secure")).send().await.unwrap();
    assert_eq!(StatusCode::OK, resp.status());

    let report = fake.try_tidy_up().await.unwrap_err();
    assert!(report.uncalled.is_empty());
    assert_eq!(1, report.failed_expectations.len());
    assert!(
        report.failed_expectations[0].contains("/secure"),
        "{report}"
    );
}

#[tokio::test]
#[tracing_test::traced_test]
#[should_panic(expected = "was never called")]
async fn test_tidy_up_panics_for_uncalled_endpoint() {
    let fake = FakeService::new()
        .with_endpoint(Endpoint::new("/never"))
        .run()
        .await
        .unwrap();
    fake.tidy_up().await;
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_drop_stops_service() {
    let fake = FakeService::new()
        .with_endpoint(Endpoint::new("/"))
        .run()
        .await
        .unwrap();
    let port = fake.socket_addr().port;
    assert!(is_accepting(port).await);

    drop(fake);

    let mut stopped = false;
    for _ in 0..50 {
        if !is_accepting(port).await {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(stopped, "fake service still accepting connections after drop");
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_bind_all_interfaces_reports_loopback() {
    let fake = FakeService::new()
        .with_bind_ip(Ipv4Addr::UNSPECIFIED)
        .with_endpoint(Endpoint::new("/"))
        .run()
        .await
        .unwrap();

    assert!(fake.socket_addr().ip_addr.is_unspecified());
    assert!(fake.base_url().starts_with("http://127.0.0.1:"));

    let resp = client().get(fake.url("/")).send().await.unwrap();
    assert_eq!(StatusCode::OK, resp.status());

    fake.tidy_up().await;
}

#[tokio::test]
#[tracing_test::traced_test]
async fn test_bind_port_in_use_fails() {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();

    let result = FakeService::new().with_port(port).run().await;
    assert!(result.is_err());

    drop(listener);
}
