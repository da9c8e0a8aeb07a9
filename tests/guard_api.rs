//! HTTP tests for the per-IP request budget and blacklist.

mod common;

use axum::http::StatusCode;
use common::{from_peer, request, spawn_app_with, test_config};
use harvest_api::config::Config;

fn strict_config() -> Config {
    Config {
        rate_limit_requests: 3,
        ..test_config()
    }
}

fn health_from(peer: &str, forwarded_for: Option<&str>) -> axum::http::Request<axum::body::Body> {
    let mut request = from_peer(request("GET", "/api/health", None, None), peer);
    if let Some(forwarded_for) = forwarded_for {
        request
            .headers_mut()
            .insert("x-forwarded-for", forwarded_for.parse().expect("header"));
    }
    request
}

#[tokio::test]
async fn client_over_budget_is_blacklisted() {
    let app = spawn_app_with(strict_config()).await;

    for n in 0..3 {
        let forwarded = format!("192.0.2.{n}");
        let (status, _) = app
            .send(health_from("203.0.113.5:40000", Some(&forwarded)))
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = app
        .send(health_from("203.0.113.5:40001", Some("192.0.2.99")))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["detail"], "Access denied");

    let (status, _) = app.send(health_from("203.0.113.5:40002", None)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app.send(health_from("203.0.113.6:40000", None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn forwarded_header_cannot_blacklist_someone_else() {
    let app = spawn_app_with(strict_config()).await;

    for _ in 0..4 {
        app.send(health_from("203.0.113.5:40000", Some("198.51.100.77")))
            .await;
    }

    let (status, _) = app.send(health_from("198.51.100.77:50000", None)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn trusted_proxy_headers_key_each_client() {
    let app = spawn_app_with(Config {
        trust_proxy_headers: true,
        ..strict_config()
    })
    .await;

    for _ in 0..3 {
        let (status, _) = app
            .send(health_from("10.0.0.2:8080", Some("198.51.100.10, 10.0.0.2")))
            .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = app
        .send(health_from("10.0.0.2:8080", Some("198.51.100.10, 10.0.0.2")))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .send(health_from("10.0.0.2:8080", Some("198.51.100.11")))
        .await;
    assert_eq!(status, StatusCode::OK);
}
