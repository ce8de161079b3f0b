//! Retry and block handling against a live local server.

mod common;

use std::time::Duration;

use common::{Reply, TestServer, fast_fetcher};
use ferc_scraper::error::AppError;
use ferc_scraper::utils::http::{RetryPolicy, build_client, retrying_fetch};

#[tokio::test]
async fn test_throttled_twice_then_ok() {
    let server = TestServer::start(vec![(
        "/news",
        vec![Reply::status(429), Reply::status(429), Reply::ok("listing")],
    )])
    .await;

    let client = build_client(None, None).unwrap();
    let response = retrying_fetch(
        &client,
        &server.url("/news"),
        Duration::from_secs(5),
        &RetryPolicy::immediate(6),
    )
    .await
    .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "listing");
    assert_eq!(server.hits("/news"), 3);
}

#[tokio::test]
async fn test_exhaustion_returns_last_block() {
    let server = TestServer::start(vec![("/news", vec![Reply::status(503)])]).await;

    let client = build_client(None, None).unwrap();
    let err = retrying_fetch(
        &client,
        &server.url("/news"),
        Duration::from_secs(5),
        &RetryPolicy::immediate(3),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, AppError::BlockedStatus { status: 503, .. }));
    assert_eq!(server.hits("/news"), 3);
}

#[tokio::test]
async fn test_captcha_body_is_retried() {
    let server = TestServer::start(vec![(
        "/news",
        vec![
            Reply::ok("<html>Please solve the CAPTCHA to continue</html>"),
            Reply::ok("<html>real page</html>"),
        ],
    )])
    .await;

    let body = fast_fetcher(4).fetch_text(&server.url("/news")).await.unwrap();
    assert!(body.contains("real page"));
    assert_eq!(server.hits("/news"), 2);
}

#[tokio::test]
async fn test_non_block_status_is_not_retried() {
    let server = TestServer::start(vec![]).await;

    let err = fast_fetcher(5)
        .fetch_text(&server.url("/gone"))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::HttpStatus { status: 410, .. }));
    assert_eq!(server.hits("/gone"), 1);
}
