//! End-to-end proxy tests over real sockets.
//!
//! Each test publishes a router, serves the proxy on an ephemeral port and
//! drives it with a real client against wiremock backends.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use balto::{HttpServer, PoolConfig, Proxy, Router};
use url::Url;
use wiremock::matchers::{header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn serve(proxy: Arc<Proxy>) -> SocketAddr {
    let app = HttpServer::app(proxy);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

fn service_of(mock: &MockServer) -> Vec<Url> {
    vec![Url::parse(&mock.uri()).unwrap()]
}

async fn wait_until(cond: impl Fn() -> bool, deadline: Duration) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    cond()
}

#[tokio::test]
async fn test_wildcard_prefix_strip() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/123"))
        .respond_with(ResponseTemplate::new(200).set_body_string("from-upstream"))
        .expect(1)
        .mount(&upstream)
        .await;

    let router = Arc::new(Router::new().add("strip.com", "/api/v1/*", &service_of(&upstream)));
    let (route, _) = router.lookup("strip.com", "/api/v1/users/123").unwrap();
    let backend = route.pool.list()[0].clone();

    let addr = serve(Arc::new(Proxy::new(Some(router)))).await;

    let resp = reqwest::Client::new()
        .get(format!("http://{}/api/v1/users/123", addr))
        .header("host", "strip.com")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "from-upstream");

    // The active-connection counter returns to zero once the body is done.
    assert!(wait_until(|| backend.meta.active() == 0, Duration::from_secs(2)).await);
    assert_eq!(backend.meta.total_requests.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_query_string_is_preserved() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("q", "rust"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstream)
        .await;

    let router = Arc::new(Router::new().add("ex.com", "/api/*", &service_of(&upstream)));
    let addr = serve(Arc::new(Proxy::new(Some(router)))).await;

    let resp = reqwest::Client::new()
        .get(format!("http://{}/api/search?q=rust", addr))
        .header("host", "ex.com")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_path_parameter_header() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/789"))
        .and(header("x-param-id", "789"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstream)
        .await;

    let router = Arc::new(Router::new().add("params.com", "/users/:id", &service_of(&upstream)));
    let addr = serve(Arc::new(Proxy::new(Some(router)))).await;

    let resp = reqwest::Client::new()
        .get(format!("http://{}/users/789", addr))
        .header("host", "params.com")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_forwarded_headers() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("x-forwarded-host", "fwd.com"))
        .and(header("x-forwarded-proto", "http"))
        .and(header_exists("x-forwarded-for"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstream)
        .await;

    let router = Arc::new(Router::new().add("fwd.com", "/", &service_of(&upstream)));
    let addr = serve(Arc::new(Proxy::new(Some(router)))).await;

    let resp = reqwest::Client::new()
        .get(format!("http://{}/", addr))
        .header("host", "fwd.com")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_hop_by_hop_headers_are_stripped() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstream)
        .await;

    let router = Arc::new(Router::new().add("hop.com", "/", &service_of(&upstream)));
    let addr = serve(Arc::new(Proxy::new(Some(router)))).await;

    let resp = reqwest::Client::new()
        .get(format!("http://{}/", addr))
        .header("host", "hop.com")
        .header("proxy-authorization", "Basic secret")
        .header("te", "trailers")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert!(!received[0].headers.contains_key("proxy-authorization"));
    assert!(!received[0].headers.contains_key("te"));
}

#[tokio::test]
async fn test_unmatched_path_is_404_without_ancestor_fallback() {
    let upstream = MockServer::start().await;

    let router = Arc::new(Router::new().add("www.ex.com", "/api", &service_of(&upstream)));
    let addr = serve(Arc::new(Proxy::new(Some(router)))).await;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{}/api/v1", addr))
        .header("host", "www.ex.com")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client
        .get(format!("http://{}/api", addr))
        .header("host", "unknown.com")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_missing_router_is_503() {
    let addr = serve(Arc::new(Proxy::new(None))).await;

    let resp = reqwest::Client::new()
        .get(format!("http://{}/anything", addr))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 503);
    assert_eq!(resp.text().await.unwrap(), "router not initialised");
}

#[tokio::test]
async fn test_no_eligible_backend_is_503() {
    let upstream = MockServer::start().await;

    let router = Arc::new(Router::new().add("empty.com", "/", &service_of(&upstream)));
    let (route, _) = router.lookup("empty.com", "/").unwrap();
    route.pool.list()[0].set_healthy(false);

    let addr = serve(Arc::new(Proxy::new(Some(router)))).await;

    let resp = reqwest::Client::new()
        .get(format!("http://{}/", addr))
        .header("host", "empty.com")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 503);
    assert_eq!(resp.text().await.unwrap(), "no backend available");
}

#[tokio::test]
async fn test_upstream_error_status_is_forwarded() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(418).set_body_string("teapot"))
        .mount(&upstream)
        .await;

    let router = Arc::new(Router::new().add("tea.com", "/", &service_of(&upstream)));
    let (route, _) = router.lookup("tea.com", "/").unwrap();
    let backend = route.pool.list()[0].clone();

    let addr = serve(Arc::new(Proxy::new(Some(router)))).await;

    let resp = reqwest::Client::new()
        .get(format!("http://{}/", addr))
        .header("host", "tea.com")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 418);
    assert_eq!(resp.text().await.unwrap(), "teapot");
    assert_eq!(backend.meta.passive_fail_count.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_hot_swap_routes_next_request_to_new_backend() {
    let up1 = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("one"))
        .mount(&up1)
        .await;

    let up2 = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("two"))
        .mount(&up2)
        .await;

    let r1 = Arc::new(Router::new().add("swap.com", "/v1", &service_of(&up1)));
    let proxy = Arc::new(Proxy::new(Some(r1)));
    let addr = serve(proxy.clone()).await;

    let client = reqwest::Client::new();
    let body = client
        .get(format!("http://{}/v1", addr))
        .header("host", "swap.com")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "one");

    let r2 = Arc::new(Router::new().add("swap.com", "/v1", &service_of(&up2)));
    proxy.update_router(r2);

    let body = client
        .get(format!("http://{}/v1", addr))
        .header("host", "swap.com")
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "two");
}

#[tokio::test]
async fn test_dead_upstream_is_502_and_flips_unhealthy() {
    // Reserve a port, then close it so connections are refused.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let dead = vec![Url::parse(&format!("http://127.0.0.1:{}", port)).unwrap()];

    let router = Arc::new(Router::new().add("down.com", "/", &dead));
    let (route, _) = router.lookup("down.com", "/").unwrap();
    route.pool.set_config(PoolConfig {
        health_threshold: 2,
        ..PoolConfig::default()
    });
    let backend = route.pool.list()[0].clone();

    let addr = serve(Arc::new(Proxy::new(Some(router)))).await;

    let client = reqwest::Client::new();
    for _ in 0..2 {
        let resp = client
            .get(format!("http://{}/", addr))
            .header("host", "down.com")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 502);
    }

    assert!(!backend.is_healthy());

    // With the only backend unhealthy, selection now comes up empty.
    let resp = client
        .get(format!("http://{}/", addr))
        .header("host", "down.com")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
}

#[tokio::test]
async fn test_client_cancel_releases_backend() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&upstream)
        .await;

    let router = Arc::new(Router::new().add("slow.com", "/", &service_of(&upstream)));
    let (route, _) = router.lookup("slow.com", "/slow").unwrap();
    let backend = route.pool.list()[0].clone();

    let addr = serve(Arc::new(Proxy::new(Some(router)))).await;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(100))
        .build()
        .unwrap();
    let result = client
        .get(format!("http://{}/slow", addr))
        .header("host", "slow.com")
        .send()
        .await;
    assert!(result.is_err());

    // The upstream dispatch is abandoned and the connection released.
    assert!(wait_until(|| backend.meta.active() == 0, Duration::from_secs(2)).await);
    // Cancellation is not a backend failure.
    assert_eq!(backend.meta.passive_fail_count.load(Ordering::Relaxed), 0);
}
