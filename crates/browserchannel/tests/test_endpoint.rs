use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use futures_util::StreamExt;
use tower::util::ServiceExt;

use browserchannel::{ChannelServer, CrossDomainInfo, ServerConfig};

fn plain_server() -> ChannelServer {
    ChannelServer::new(|_channel| async {})
}

fn cross_domain_server() -> ChannelServer {
    let config = ServerConfig {
        cross_domain: Some(
            CrossDomainInfo::new(
                r"^https?://([a-z0-9]+\.)?example\.com$",
                vec!["b1".into(), "b2".into(), "b3".into()],
            )
            .unwrap(),
        ),
        ..ServerConfig::default()
    };
    ChannelServer::with_config(config, |_channel| async {})
}

async fn send(server: &ChannelServer, request: Request<Body>) -> Response {
    server.router().oneshot(request).await.unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn wrong_protocol_version_is_rejected() {
    let server = plain_server();
    let response = send(&server, get("/test?VER=7&MODE=init")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_string(response).await, "Unsupported protocol version.");
}

#[tokio::test]
async fn init_mode_reports_the_empty_prefix_without_cross_domain_config() {
    let server = plain_server();
    let response = send(&server, get("/test?VER=8&MODE=init")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, r#"["",""]"#);
}

#[tokio::test]
async fn init_mode_draws_a_prefix_from_the_configured_pool() {
    let server = cross_domain_server();
    for _ in 0..8 {
        let response = send(&server, get("/test?VER=8&MODE=init")).await;
        let body = body_string(response).await;
        let parsed: Vec<String> = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(["b1", "b2", "b3"].contains(&parsed[0].as_str()));
        assert_eq!(parsed[1], "");
    }
}

#[tokio::test]
async fn chunking_probe_sends_two_phases() {
    let server = plain_server();
    let response = send(&server, get("/test?VER=8&TYPE=xmlhttp")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/plain"
    );
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "no-cache, no-store, max-age=0, must-revalidate"
    );

    let mut stream = response.into_body().into_data_stream();
    let first = stream.next().await.unwrap().unwrap();
    assert_eq!(String::from_utf8(first.to_vec()).unwrap(), "11111");

    // The second token lands two seconds later, once the client has had a
    // chance to observe the intermediate flush.
    let second = stream.next().await.unwrap().unwrap();
    assert_eq!(String::from_utf8(second.to_vec()).unwrap(), "2");
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn html_probe_wraps_tokens_in_script_blocks() {
    let server = plain_server();
    let response = send(&server, get("/test?VER=8&TYPE=html&DOMAIN=example.com")).await;
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/html"
    );

    let mut stream = response.into_body().into_data_stream();
    let first = stream.next().await.unwrap().unwrap();
    let first = String::from_utf8(first.to_vec()).unwrap();
    assert!(first.starts_with("<html><body>"));
    assert!(first.contains(r#"document.domain="example.com""#));
    assert!(first.contains(r#"parent.m("11111")"#));
    assert!(first.contains(&" ".repeat(1024)));

    let second = stream.next().await.unwrap().unwrap();
    let second = String::from_utf8(second.to_vec()).unwrap();
    assert!(second.contains(r#"parent.m("2")"#));
    assert!(second.ends_with("<script>try{parent.d()}catch(e){}</script>"));
}

#[tokio::test]
async fn matching_origins_are_echoed_in_cors_headers() {
    let server = cross_domain_server();
    let request = Request::builder()
        .method("GET")
        .uri("/test?VER=8&MODE=init")
        .header("origin", "http://a.example.com")
        .body(Body::empty())
        .unwrap();
    let response = send(&server, request).await;
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "http://a.example.com"
    );
    assert_eq!(
        response
            .headers()
            .get("access-control-allow-credentials")
            .unwrap(),
        "true"
    );
}

#[tokio::test]
async fn non_matching_origins_get_no_cors_headers() {
    let server = cross_domain_server();
    let request = Request::builder()
        .method("GET")
        .uri("/test?VER=8&MODE=init")
        .header("origin", "http://evil.test")
        .body(Body::empty())
        .unwrap();
    let response = send(&server, request).await;
    assert!(response
        .headers()
        .get("access-control-allow-origin")
        .is_none());
}
