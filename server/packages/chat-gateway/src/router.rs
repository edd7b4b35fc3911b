use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};

use chat_gateway_authorization::{
    AuthorizationCoordinator, AuthorizationStatus, CibaClient, SharedAuthorizationState,
    StatusNotice,
};
use chat_gateway_error::{ErrorType, GatewayError, ProblemDetails};
use chat_gateway_remote::sse::SsePayload;
use chat_gateway_remote::RemoteGateway;
use chat_gateway_stream::{ClassifierConfig, RawChunk, Reclassifier, StreamEvent};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Gateway(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

pub struct AppState {
    gateway: RemoteGateway,
    coordinator: Option<AuthorizationCoordinator>,
    auth_state: SharedAuthorizationState,
    classifier: ClassifierConfig,
    notices: std::sync::Mutex<mpsc::UnboundedReceiver<StatusNotice>>,
    latest_notice: std::sync::Mutex<Option<StatusNotice>>,
}

impl AppState {
    pub fn new(gateway: RemoteGateway, ciba: Option<CibaClient>) -> Self {
        let auth_state = SharedAuthorizationState::new();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let coordinator = ciba.map({
            let auth_state = auth_state.clone();
            move |client| {
                AuthorizationCoordinator::new(auth_state, client).with_notices(notices_tx)
            }
        });
        Self {
            gateway,
            coordinator,
            auth_state,
            classifier: ClassifierConfig::default(),
            notices: std::sync::Mutex::new(notices_rx),
            latest_notice: std::sync::Mutex::new(None),
        }
    }

    pub fn with_classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.classifier = classifier;
        self
    }

    /// Drain queued phase notices and keep the most recent one for the
    /// status surface. The notices are advisory; expiry is the client's job.
    fn latest_notice(&self) -> Option<StatusNotice> {
        let mut receiver = match self.notices.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut latest = match self.latest_notice.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while let Ok(notice) = receiver.try_recv() {
            *latest = Some(notice);
        }
        latest.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let v1_router = Router::new()
        .route("/chat", post(post_chat))
        .route("/chat/stream", post(post_chat_stream))
        .route("/purchase", post(post_purchase))
        .route("/authorization/status", get(get_authorization_status));

    let router = Router::new()
        .route("/health", get(get_health))
        .nest("/v1", v1_router)
        .layer(TraceLayer::new_for_http())
        .with_state(shared.clone());
    (router, shared)
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ChatRequest {
    pub agent_id: String,
    pub message: String,
    pub user_id: String,
    pub conversation_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ChatResponse {
    pub events: Vec<StreamEvent>,
    pub content: String,
    pub degraded: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PurchaseRequest {
    /// Shape-inspected to derive the approving user and the binding message.
    pub payload: Value,
    pub agent_id: String,
    pub message: String,
    pub conversation_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuthorizationStatusResponse {
    pub status: AuthorizationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Most recent phase notice, if any; expires client-side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<AuthorizationNotice>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuthorizationNotice {
    pub text: String,
    pub auto_remove_ms: u64,
}

impl From<StatusNotice> for AuthorizationNotice {
    fn from(notice: StatusNotice) -> Self {
        Self {
            text: notice.text,
            auto_remove_ms: notice.auto_remove_ms,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(OpenApi)]
#[openapi(
    paths(get_health, post_chat, post_purchase, get_authorization_status),
    components(schemas(
        ChatRequest,
        ChatResponse,
        PurchaseRequest,
        AuthorizationStatusResponse,
        AuthorizationNotice,
        HealthResponse,
        StreamEvent,
        AuthorizationStatus,
        ProblemDetails,
        ErrorType
    )),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "chat", description = "Conversation turns against the remote execution service"),
        (name = "authorization", description = "Backchannel approval flow")
    )
)]
pub struct ApiDoc;

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

#[utoipa::path(
    post,
    path = "/v1/chat",
    request_body = ChatRequest,
    responses((status = 200, body = ChatResponse)),
    tag = "chat"
)]
async fn post_chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let outcome = state
        .gateway
        .invoke(
            &request.agent_id,
            &request.message,
            &request.user_id,
            &request.conversation_id,
        )
        .await;

    let mut reclassifier = Reclassifier::new(state.classifier.clone());
    let events = reclassifier.reclassify(RawChunk::Text(outcome.content.clone()));
    Ok(Json(ChatResponse {
        events,
        content: outcome.content,
        degraded: outcome.degraded,
    }))
}

/// Live turn. NDJSON by default, SSE when the caller accepts
/// `text/event-stream`; both end with the `done` sentinel.
async fn post_chat_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let raw = state
        .gateway
        .open_stream(
            &request.agent_id,
            &request.message,
            &request.user_id,
            &request.conversation_id,
        )
        .await?;

    let reclassifier = Reclassifier::new(state.classifier.clone());
    let events = raw
        .scan(reclassifier, |reclassifier, payload| {
            let events = match payload {
                SsePayload::Json(value) => reclassifier.reclassify(RawChunk::Json(value)),
                SsePayload::Text(text) => reclassifier.reclassify(RawChunk::Text(text)),
                SsePayload::Done => Vec::new(),
            };
            futures::future::ready(Some(futures::stream::iter(events)))
        })
        .flatten()
        .chain(futures::stream::once(futures::future::ready(
            StreamEvent::Done,
        )));

    let wants_sse = headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"));

    if wants_sse {
        let sse_stream = events.map(|event| Event::default().json_data(&event));
        return Ok(Sse::new(sse_stream)
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    let body_stream = events.map(|event| {
        let line = serde_json::to_string(&event)
            .unwrap_or_else(|_| "{\"type\":\"error\",\"message\":\"serialization failed\"}".to_string());
        Ok::<_, Infallible>(Bytes::from(format!("{line}\n")))
    });
    let mut response = Response::new(Body::from_stream(body_stream));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-ndjson"),
    );
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/v1/purchase",
    request_body = PurchaseRequest,
    responses(
        (status = 200, body = ChatResponse),
        (status = 403, body = ProblemDetails)
    ),
    tag = "authorization"
)]
async fn post_purchase(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PurchaseRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Some(coordinator) = state.coordinator.as_ref() else {
        return Err(ApiError::Gateway(GatewayError::InvalidRequest {
            message: "backchannel authorization is not configured".to_string(),
        }));
    };

    let gateway = state.gateway.clone();
    let agent_id = request.agent_id.clone();
    let message = request.message.clone();
    let conversation_id = request.conversation_id.clone();
    let outcome = coordinator
        .with_backchannel_authorization(
            request.user_id.as_deref(),
            &request.payload,
            |user_id| async move {
                Ok(gateway
                    .invoke(&agent_id, &message, &user_id, &conversation_id)
                    .await)
            },
        )
        .await?;

    let mut reclassifier = Reclassifier::new(state.classifier.clone());
    let events = reclassifier.reclassify(RawChunk::Text(outcome.content.clone()));
    Ok(Json(ChatResponse {
        events,
        content: outcome.content,
        degraded: outcome.degraded,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/authorization/status",
    responses((status = 200, body = AuthorizationStatusResponse)),
    tag = "authorization"
)]
async fn get_authorization_status(State(state): State<Arc<AppState>>) -> Response {
    let snapshot = state.auth_state.get();
    let notice = state.latest_notice().map(AuthorizationNotice::from);
    // Pollers must always observe the latest write.
    (
        [(header::CACHE_CONTROL, "no-store")],
        Json(AuthorizationStatusResponse {
            status: snapshot.status,
            message: snapshot.message,
            notice,
        }),
    )
        .into_response()
}
