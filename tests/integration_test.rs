use assert_json_diff::assert_json_include;
use axum::body::Body;
use axum::Router;
use futures::future::join_all;
use http::{Request, StatusCode};
use jsonwebtoken::{encode, EncodingKey, Header};
use microgate::{build_app, config::GatewayConfig, proxy::GatewayState};
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

const SECRET: &str = "integration-test-secret";

fn gateway(yaml: &str) -> Router {
    let config = GatewayConfig::from_yaml(yaml).unwrap();
    let state = GatewayState::from_config(&config, None).unwrap();
    build_app(state, &config)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, http::HeaderMap, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
    (status, headers, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn token(sub: &str, roles: &[&str], exp_offset_secs: i64) -> String {
    let exp = chrono::Utc::now().timestamp() + exp_offset_secs;
    encode(
        &Header::default(),
        &json!({ "sub": sub, "roles": roles, "exp": exp }),
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn authed(uri: &str, token: &str) -> Request<Body> {
    Request::get(uri)
        .header("authorization", format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_longest_prefix_wins() {
    let general = MockServer::start().await;
    let users = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/users/7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "from": "users" })))
        .expect(1)
        .mount(&users)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "from": "general" })))
        .expect(1)
        .mount(&general)
        .await;

    let app = gateway(&format!(
        r#"
backends:
  - id: general
    address: "{}"
  - id: users
    address: "{}"
routes:
  - prefix: "/api"
    backends: ["general"]
  - prefix: "/api/users"
    backends: ["users"]
"#,
        general.uri(),
        users.uri()
    ));

    let (status, _, body) = send(&app, get("/api/users/7")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["from"], "users");

    let (status, _, body) = send(&app, get("/api/orders")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["from"], "general");

    let (status, _, body) = send(&app, get("/apix")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "RouteNotFound");
}

#[tokio::test]
async fn test_strip_prefix_and_query_are_forwarded() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/items"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&backend)
        .await;

    let app = gateway(&format!(
        r#"
backends:
  - id: b
    address: "{}"
routes:
  - prefix: "/shop"
    backends: ["b"]
    strip_prefix: true
"#,
        backend.uri()
    ));

    let (status, _, _) = send(&app, get("/shop/items?page=2")).await;
    assert_eq!(status, StatusCode::OK);

    let received = backend.received_requests().await.unwrap();
    assert_eq!(received[0].url.query(), Some("page=2"));
}

#[tokio::test]
async fn test_sixth_request_in_window_is_rate_limited() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(5)
        .mount(&backend)
        .await;

    let app = gateway(&format!(
        r#"
backends:
  - id: auth-1
    address: "{0}"
  - id: auth-2
    address: "{0}"
routes:
  - prefix: "/auth/*"
    backends: ["auth-1", "auth-2"]
    rate_limit:
      capacity: 5
      window_secs: 10
"#,
        backend.uri()
    ));

    for i in 0..5 {
        let (status, headers, _) = send(&app, get("/auth/login")).await;
        assert_eq!(status, StatusCode::OK, "request {} should pass", i + 1);
        assert_eq!(
            headers.get("x-ratelimit-remaining").unwrap(),
            &(4 - i).to_string()
        );
    }

    let (status, headers, body) = send(&app, get("/auth/login")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "RateLimited");

    let retry_after: u64 = headers
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=10).contains(&retry_after));
    assert_eq!(body["error"]["retry_after"], retry_after);
}

#[tokio::test]
async fn test_concurrent_burst_admits_exactly_capacity() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(5)
        .mount(&backend)
        .await;

    let app = gateway(&format!(
        r#"
backends:
  - id: b
    address: "{}"
routes:
  - prefix: "/burst"
    backends: ["b"]
    rate_limit:
      capacity: 5
      window_secs: 60
"#,
        backend.uri()
    ));

    let statuses = join_all((0..20).map(|_| send(&app, get("/burst")))).await;
    let admitted = statuses
        .iter()
        .filter(|(status, _, _)| *status == StatusCode::OK)
        .count();
    let limited = statuses
        .iter()
        .filter(|(status, _, _)| *status == StatusCode::TOO_MANY_REQUESTS)
        .count();

    assert_eq!(admitted, 5);
    assert_eq!(limited, 15);
}

#[tokio::test]
async fn test_quota_is_per_caller() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;

    let app = gateway(&format!(
        r#"
auth:
  jwt:
    secret: "{}"
backends:
  - id: b
    address: "{}"
routes:
  - prefix: "/api"
    backends: ["b"]
    auth_required: true
    rate_limit:
      capacity: 1
      window_secs: 60
"#,
        SECRET,
        backend.uri()
    ));

    let alice = token("alice", &[], 3600);
    let bob = token("bob", &[], 3600);

    assert_eq!(send(&app, authed("/api", &alice)).await.0, StatusCode::OK);
    assert_eq!(
        send(&app, authed("/api", &alice)).await.0,
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(send(&app, authed("/api", &bob)).await.0, StatusCode::OK);
}

#[tokio::test]
async fn test_expired_token_never_reaches_backend() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&backend)
        .await;

    let app = gateway(&format!(
        r#"
auth:
  jwt:
    secret: "{}"
backends:
  - id: b
    address: "{}"
routes:
  - prefix: "/secure"
    backends: ["b"]
    auth_required: true
"#,
        SECRET,
        backend.uri()
    ));

    let (status, _, body) = send(&app, authed("/secure", &token("alice", &[], -3600))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "ExpiredToken");

    let (status, _, body) = send(&app, get("/secure")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "MissingToken");

    let (status, _, body) = send(&app, authed("/secure", "not-a-jwt")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "MalformedToken");
}

#[tokio::test]
async fn test_roles_and_identity_forwarding() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&backend)
        .await;

    let app = gateway(&format!(
        r#"
auth:
  jwt:
    secret: "{}"
backends:
  - id: b
    address: "{}"
routes:
  - prefix: "/admin"
    backends: ["b"]
    auth_required: true
    required_roles: ["admin"]
"#,
        SECRET,
        backend.uri()
    ));

    let (status, _, body) = send(&app, authed("/admin", &token("bob", &["viewer"], 3600))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "Forbidden");

    let mut request = authed("/admin", &token("alice", &["admin", "viewer"], 3600));
    request
        .headers_mut()
        .insert("x-caller-subject", "mallory".parse().unwrap());
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);

    let received = backend.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].headers.get("x-caller-subject").unwrap(), "alice");
    assert_eq!(
        received[0].headers.get("x-caller-roles").unwrap(),
        "admin,viewer"
    );
}

#[tokio::test]
async fn test_forwarded_headers() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).insert_header("x-backend", "b"))
        .mount(&backend)
        .await;

    let app = gateway(&format!(
        r#"
backends:
  - id: b
    address: "{}"
routes:
  - prefix: "/"
    backends: ["b"]
"#,
        backend.uri()
    ));

    let request = Request::get("/anything")
        .header("x-request-id", "req-42")
        .header("connection", "x-hop-secret")
        .header("x-hop-secret", "1")
        .header("x-app", "kept")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-request-id").unwrap(), "req-42");
    assert_eq!(headers.get("x-backend").unwrap(), "b");

    let received = backend.received_requests().await.unwrap();
    let forwarded = &received[0].headers;
    assert_eq!(forwarded.get("x-request-id").unwrap(), "req-42");
    assert_eq!(forwarded.get("x-forwarded-for").unwrap(), "127.0.0.1");
    assert_eq!(forwarded.get("x-app").unwrap(), "kept");
    assert!(forwarded.get("x-hop-secret").is_none());
}

#[tokio::test]
async fn test_backend_5xx_becomes_bad_gateway() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("stack trace from backend"))
        .mount(&backend)
        .await;

    let app = gateway(&format!(
        r#"
backends:
  - id: b
    address: "{}"
routes:
  - prefix: "/api"
    backends: ["b"]
"#,
        backend.uri()
    ));

    let (status, _, body) = send(&app, get("/api")).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"]["code"], "BackendError");
    assert!(!body.to_string().contains("stack trace"));
    assert!(!body.to_string().contains(&backend.uri()));
}

#[tokio::test]
async fn test_slow_backend_times_out() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&backend)
        .await;

    let app = gateway(&format!(
        r#"
backends:
  - id: b
    address: "{}"
routes:
  - prefix: "/slow"
    backends: ["b"]
    timeout_ms: 100
"#,
        backend.uri()
    ));

    let (status, _, body) = send(&app, get("/slow")).await;
    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["error"]["code"], "BackendTimeout");
}

#[tokio::test]
async fn test_open_circuit_rejects_without_calling_backend() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&backend)
        .await;

    let app = gateway(&format!(
        r#"
circuit_breaker:
  failure_threshold: 1
  cooldown_ms: 60000
backends:
  - id: b
    address: "{}"
routes:
  - prefix: "/api"
    backends: ["b"]
"#,
        backend.uri()
    ));

    assert_eq!(send(&app, get("/api")).await.0, StatusCode::BAD_GATEWAY);

    let (status, _, body) = send(&app, get("/api")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "CircuitOpen");

    let (_, _, health) = send(&app, get("/health")).await;
    assert_json_include!(
        actual: health,
        expected: json!({
            "status": "ok",
            "backends": { "b": { "state": "unhealthy", "failed_requests": 1, "circuit_opened_count": 1 } }
        })
    );
}

#[tokio::test]
async fn test_failing_backend_is_skipped_then_recovers() {
    let good = MockServer::start().await;
    let bad = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&good)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&bad)
        .await;

    let app = gateway(&format!(
        r#"
circuit_breaker:
  failure_threshold: 2
  cooldown_ms: 200
backends:
  - id: good
    address: "{}"
  - id: bad
    address: "{}"
routes:
  - prefix: "/api"
    backends: ["good", "bad"]
"#,
        good.uri(),
        bad.uri()
    ));

    let mut failures = 0;
    for _ in 0..10 {
        if send(&app, get("/api")).await.0 == StatusCode::BAD_GATEWAY {
            failures += 1;
        }
    }
    assert_eq!(failures, 2);
    assert_eq!(bad.received_requests().await.unwrap().len(), 2);

    let (_, _, health) = send(&app, get("/health")).await;
    assert_eq!(health["backends"]["good"]["state"], "healthy");
    assert_eq!(health["backends"]["bad"]["state"], "unhealthy");

    // Backend comes back; the first call after the cooldown is a probe
    bad.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&bad)
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    for _ in 0..4 {
        assert_eq!(send(&app, get("/api")).await.0, StatusCode::OK);
    }

    let (_, _, health) = send(&app, get("/health")).await;
    assert_eq!(health["backends"]["bad"]["state"], "healthy");
    assert_eq!(health["backends"]["bad"]["circuit_closed_count"], 1);
    assert!(!bad.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_metrics_record_outcomes() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&backend)
        .await;

    let app = gateway(&format!(
        r#"
backends:
  - id: b
    address: "{}"
routes:
  - prefix: "/api"
    backends: ["b"]
"#,
        backend.uri()
    ));

    send(&app, get("/api/one")).await;
    send(&app, get("/missing")).await;

    let response = app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(text.contains(r#"gateway_requests_total{route="/api",backend="b",outcome="success"} 1"#));
    assert!(text.contains(r#"outcome="route_not_found"} 1"#));
    assert!(text.contains("gateway_request_duration_seconds"));
}

#[tokio::test]
async fn test_rejected_token_does_not_spend_quota() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&backend)
        .await;

    let app = gateway(&format!(
        r#"
auth:
  jwt:
    secret: "{}"
backends:
  - id: b
    address: "{}"
routes:
  - prefix: "/api"
    backends: ["b"]
    auth_required: true
    rate_limit:
      capacity: 1
      window_secs: 60
"#,
        SECRET,
        backend.uri()
    ));

    let (status, _, _) = send(&app, authed("/api", &token("alice", &[], -3600))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, headers, _) = send(&app, authed("/api", &token("alice", &[], 3600))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "0");
}

fn failing_backend_config(uri: &str, consume_on: &str) -> String {
    format!(
        r#"
rate_limiting:
  consume_on: {}
backends:
  - id: b
    address: "{}"
routes:
  - prefix: "/api"
    backends: ["b"]
    rate_limit:
      capacity: 1
      window_secs: 60
"#,
        consume_on, uri
    )
}

#[tokio::test]
async fn test_backend_failure_refunds_quota_when_consuming_on_completion() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&backend)
        .await;

    let app = gateway(&failing_backend_config(&backend.uri(), "completion"));

    assert_eq!(send(&app, get("/api")).await.0, StatusCode::BAD_GATEWAY);
    assert_eq!(send(&app, get("/api")).await.0, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn test_backend_failure_spends_quota_when_consuming_on_admission() {
    let backend = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&backend)
        .await;

    let app = gateway(&failing_backend_config(&backend.uri(), "admission"));

    assert_eq!(send(&app, get("/api")).await.0, StatusCode::BAD_GATEWAY);
    let (status, _, body) = send(&app, get("/api")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "RateLimited");
}

#[tokio::test]
async fn test_oversized_body_is_malformed_request() {
    let backend = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&backend)
        .await;

    let app = gateway(&format!(
        r#"
server:
  max_body_bytes: 16
backends:
  - id: b
    address: "{}"
routes:
  - prefix: "/upload"
    backends: ["b"]
"#,
        backend.uri()
    ));

    let request = Request::post("/upload")
        .body(Body::from(vec![b'x'; 64]))
        .unwrap();
    let (status, _, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "MalformedRequest");

    let request = Request::post("/upload")
        .body(Body::from(vec![b'x'; 16]))
        .unwrap();
    assert_eq!(send(&app, request).await.0, StatusCode::OK);
}

/// Serves one response whose body arrives in two parts, `pause` apart
async fn slow_body_backend(pause: Duration) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                return;
            }
            head.extend_from_slice(&buf[..n]);
        }
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\nhello")
            .await
            .unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(pause).await;
        socket.write_all(b"world").await.unwrap();
        socket.flush().await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_timeout_does_not_cut_off_streaming_body() {
    let uri = slow_body_backend(Duration::from_millis(400)).await;

    let app = gateway(&format!(
        r#"
backends:
  - id: b
    address: "{}"
routes:
  - prefix: "/stream"
    backends: ["b"]
    timeout_ms: 200
"#,
        uri
    ));

    let response = app.clone().oneshot(get("/stream")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"helloworld");

    let (_, _, health) = send(&app, get("/health")).await;
    assert_eq!(health["backends"]["b"]["successful_requests"], 1);
    assert_eq!(health["backends"]["b"]["failed_requests"], 0);
}
