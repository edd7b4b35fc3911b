use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use chat_gateway::router::{build_router, AppState};
use chat_gateway_authorization::{CibaClient, CibaConfig};
use chat_gateway_remote::{RemoteGateway, RemoteGatewayConfig};

pub const SSE_HI: &str =
    "data: {\"messages\":[{\"role\":\"assistant\",\"content\":\"hi\"}]}\n\ndata: [DONE]\n\n";

async fn create_thread() -> Json<Value> {
    Json(json!({ "thread_id": "thread-1" }))
}

async fn run_stream(body: &'static str) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/event-stream")], body)
}

/// Ephemeral-port stand-in for the remote execution service.
pub async fn spawn_mock_remote(sse_body: &'static str) -> String {
    let app = Router::new()
        .route("/threads", post(create_thread))
        .route(
            "/threads/:thread_id/runs/stream",
            post(move || run_stream(sse_body)),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock remote");
    let addr = listener.local_addr().expect("mock remote addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

async fn bc_authorize() -> Json<Value> {
    Json(json!({"auth_req_id": "req-1", "expires_in": 300, "interval": 0}))
}

async fn token() -> Json<Value> {
    Json(json!({"access_token": "tok-1", "token_type": "Bearer"}))
}

/// Identity provider that approves every backchannel request on first poll.
pub async fn spawn_mock_idp() -> String {
    let app = Router::new()
        .route("/bc-authorize", post(bc_authorize))
        .route("/oauth/token", post(token));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock idp");
    let addr = listener.local_addr().expect("mock idp addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

pub struct TestApp {
    pub app: Router,
}

impl TestApp {
    pub async fn new(sse_body: &'static str) -> Self {
        let base_url = spawn_mock_remote(sse_body).await;
        let state = AppState::new(RemoteGateway::new(fast_config(base_url)), None);
        Self {
            app: build_router(state),
        }
    }

    pub async fn with_authorization(sse_body: &'static str) -> Self {
        let base_url = spawn_mock_remote(sse_body).await;
        let issuer = spawn_mock_idp().await;
        let ciba = CibaClient::new(CibaConfig::new(&issuer, "client-1", "secret-1"));
        let state = AppState::new(RemoteGateway::new(fast_config(base_url)), Some(ciba));
        Self {
            app: build_router(state),
        }
    }

    pub async fn send_json(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> (StatusCode, axum::http::HeaderMap, Vec<u8>) {
        let builder = Request::builder().method(method).uri(path);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("build request");

        let response = self
            .app
            .clone()
            .oneshot(request)
            .await
            .expect("router response");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes()
            .to_vec();
        (status, headers, bytes)
    }
}

fn fast_config(base_url: String) -> RemoteGatewayConfig {
    let mut config = RemoteGatewayConfig::new(base_url);
    config.retry_base_delay = Duration::from_millis(1);
    config
}

pub fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json body")
}
