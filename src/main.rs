mod fallback;
mod http;
mod idempotency;
mod inference;
mod jobs;
mod metrics;
mod models;
mod parser;
mod prompts;
mod security;
mod text;
mod workflow;

use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use eyre::{Result, eyre};
use idempotency::{IdempotencyStore, Reservation};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, EnhanceRequest, EnhanceResponse, ProductDraft, TrendAssessment};
use security::{AuthContext, AuthState, require_api_auth};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{any::Any, net::SocketAddr, sync::Arc};
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{self, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use workflow::{Workflow, WorkflowError, WorkflowErrorKind, stages};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    if let Err(err) = run().await {
        error!(target = "artisan.api", "server crashed: {err:?}");
    }
}

async fn run() -> Result<()> {
    init_tracing();

    let workflow = Workflow::from_env();
    let (queue, _worker) = jobs::JobQueue::spawn(workflow.clone());
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|err| eyre!("prometheus recorder: {err}"))?;
    let state = AppState {
        workflow,
        queue,
        openapi: Arc::new(load_openapi()),
        idempotency: IdempotencyStore::from_env(),
        prometheus_handle,
    };

    let app = build_router(state, AuthState::from_env())
        .layer(
            CorsLayer::new()
                .allow_headers(cors::Any)
                .allow_methods(cors::Any)
                .allow_origin(cors::Any),
        )
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "artisan.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    workflow: Workflow,
    queue: jobs::JobQueue,
    openapi: Arc<Value>,
    idempotency: IdempotencyStore,
    prometheus_handle: PrometheusHandle,
}

fn build_router(state: AppState, auth: AuthState) -> Router {
    let protected = Router::new()
        .route("/enhance", post(enhance))
        .nest(
            "/stages",
            Router::new()
                .route("/story", post(stage_story))
                .route("/trend", post(stage_trend))
                .route("/price", post(stage_price))
                .route("/recommendations", post(stage_recommendations)),
        )
        .nest(
            "/jobs",
            Router::new()
                .route("/enhance", post(enqueue_enhance_job))
                .route("/{id}", get(get_job_status)),
        )
        .route_layer(middleware::from_fn_with_state(auth, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .merge(protected)
        .with_state(state)
        .layer(CatchPanicLayer::custom(panic_response))
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_default();
    error!(target = "artisan.api", panic = %detail, "request_panicked");
    crate::metrics::request_panicked();
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError {
            error: "internal".into(),
            detail: Some(workflow::GENERIC_FAILURE.into()),
        }),
    )
        .into_response()
}

fn load_openapi() -> Value {
    serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
        .unwrap_or_else(|_| json!({"openapi": "3.0.3"}))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "artisan-enhance-api",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY")
        && header_str(&headers, "X-Docs-Key") != key
    {
        return Err(AppError::Unauthorized);
    }
    Ok(Json((*state.openapi).clone()))
}

async fn swagger_ui() -> Response {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Artisan Enhance API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    (
        [(axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8")],
        html,
    )
        .into_response()
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY")
        && header_str(&headers, "X-Metrics-Key") != secret
    {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

/// Run the full enhancement workflow for one product draft.
///
/// - Method: `POST`
/// - Path: `/enhance`
/// - Auth: `Authorization: Bearer <key>` or `X-Artisan-Key: <key>`
/// - Body: `EnhanceRequest`
/// - Response: `EnhanceResponse` (run id, result, per-stage transcript)
///
/// A repeated `Idempotency-Key` from the same seller replays the first
/// response instead of running again, or gets `409` while that first run
/// is still in progress.
async fn enhance(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    headers: HeaderMap,
    Json(payload): Json<EnhanceRequest>,
) -> Result<Json<EnhanceResponse>, AppError> {
    crate::metrics::inc_requests("/enhance");
    info!(
        target = "artisan.api",
        owner = %context.owner_id,
        api_key = %context.api_key_id,
        "enhance_invoked",
    );

    let idempotency_key = Some(header_str(&headers, "Idempotency-Key").trim())
        .filter(|key| !key.is_empty())
        .map(str::to_string);

    let pending = match &idempotency_key {
        Some(key) => match state.idempotency.reserve(&context.owner_id, key).await {
            Reservation::Acquired(pending) => Some(pending),
            Reservation::InFlight => return Err(AppError::Conflict),
            Reservation::Replay(existing) => return Ok(Json(existing)),
        },
        None => None,
    };

    let response = state.workflow.run(payload.draft, payload.image).await?;

    if let Some(pending) = pending {
        pending.complete(&response).await;
    }
    Ok(Json(response))
}

#[derive(Debug, Serialize)]
struct StageResponse<T> {
    value: T,
    used_fallback: bool,
    output: Value,
}

impl<T> From<workflow::StageOutcome<T>> for StageResponse<T> {
    fn from(outcome: workflow::StageOutcome<T>) -> Self {
        Self {
            value: outcome.value,
            used_fallback: outcome.used_fallback,
            output: outcome.output,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DraftRequest {
    #[serde(flatten)]
    draft: ProductDraft,
}

async fn stage_story(
    State(state): State<AppState>,
    Json(req): Json<DraftRequest>,
) -> Result<Json<StageResponse<String>>, AppError> {
    crate::metrics::inc_requests("/stages/story");
    let (draft, _) = state.workflow.prepare(&req.draft, None)?;
    let wf = &state.workflow;
    let out = stages::story(wf.inference.as_ref(), &draft, wf.config.stage_timeout).await;
    Ok(Json(out.into()))
}

async fn stage_trend(
    State(state): State<AppState>,
    Json(req): Json<DraftRequest>,
) -> Result<Json<StageResponse<TrendAssessment>>, AppError> {
    crate::metrics::inc_requests("/stages/trend");
    let (draft, _) = state.workflow.prepare(&req.draft, None)?;
    let wf = &state.workflow;
    let out = stages::trend(wf.inference.as_ref(), &draft, wf.config.stage_timeout).await;
    Ok(Json(out.into()))
}

#[derive(Debug, Deserialize)]
struct PriceStageRequest {
    #[serde(flatten)]
    draft: ProductDraft,
    #[serde(default)]
    trend_score: Option<f64>,
}

async fn stage_price(
    State(state): State<AppState>,
    Json(req): Json<PriceStageRequest>,
) -> Result<Json<StageResponse<f64>>, AppError> {
    crate::metrics::inc_requests("/stages/price");
    let (draft, _) = state.workflow.prepare(&req.draft, None)?;
    let trend_score = resolve_trend_score(req.trend_score, &draft)?;
    let wf = &state.workflow;
    let out = stages::price(
        wf.inference.as_ref(),
        &draft,
        trend_score,
        wf.config.stage_timeout,
    )
    .await;
    Ok(Json(out.into()))
}

#[derive(Debug, Deserialize)]
struct RecommendationsStageRequest {
    #[serde(flatten)]
    draft: ProductDraft,
    #[serde(default)]
    story: Option<String>,
    #[serde(default)]
    trend_score: Option<f64>,
    #[serde(default)]
    recommended_price: Option<f64>,
    #[serde(default)]
    marketing_recommendations: Vec<String>,
}

async fn stage_recommendations(
    State(state): State<AppState>,
    Json(req): Json<RecommendationsStageRequest>,
) -> Result<Json<StageResponse<Vec<String>>>, AppError> {
    crate::metrics::inc_requests("/stages/recommendations");
    let (draft, _) = state.workflow.prepare(&req.draft, None)?;
    let trend = TrendAssessment {
        score: resolve_trend_score(req.trend_score, &draft)?,
        recommendations: req
            .marketing_recommendations
            .iter()
            .map(|rec| text::sanitize_input(rec))
            .filter(|rec| !rec.is_empty())
            .take(workflow::MAX_LIST_ITEMS)
            .collect(),
    };
    let recommended_price = match req.recommended_price {
        Some(price) if price.is_finite() && price > 0.0 => price,
        Some(_) => {
            return Err(WorkflowError::invalid_input("validate", "invalid_recommended_price").into());
        }
        None => draft.price,
    };
    let story = req
        .story
        .map(|story| text::sanitize_input(&story))
        .filter(|story| !story.is_empty())
        .unwrap_or_else(|| fallback::story(&draft));

    let wf = &state.workflow;
    let out = stages::recommendations(
        wf.inference.as_ref(),
        &draft,
        &story,
        &trend,
        recommended_price,
        wf.config.stage_timeout,
    )
    .await;
    Ok(Json(out.into()))
}

fn resolve_trend_score(score: Option<f64>, draft: &ProductDraft) -> Result<f64, AppError> {
    match score {
        Some(value) if value.is_finite() => Ok(value.clamp(0.0, 1.0)),
        Some(_) => Err(WorkflowError::invalid_input("validate", "invalid_trend_score").into()),
        None => Ok(fallback::trend_score_for_category(&draft.category)),
    }
}

#[derive(Debug, Serialize)]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_enhance_job(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Json(payload): Json<EnhanceRequest>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/enhance");
    let id = state
        .queue
        .enqueue(payload, context)
        .await
        .map_err(|err| AppError::Workflow(WorkflowError::internal("enqueue", err.error)))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<jobs::JobInfo>, AppError> {
    let Ok(uuid) = uuid::Uuid::parse_str(&id) else {
        return Err(WorkflowError::invalid_input("jobs", "invalid_job_id").into());
    };
    state
        .queue
        .get(uuid)
        .await
        .map(Json)
        .ok_or(AppError::NotFound("job"))
}

#[derive(Debug)]
enum AppError {
    Workflow(WorkflowError),
    NotFound(&'static str),
    Unauthorized,
    Conflict,
}

impl From<WorkflowError> for AppError {
    fn from(value: WorkflowError) -> Self {
        Self::Workflow(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, payload) = match self {
            AppError::Workflow(err) => {
                let status = match err.kind() {
                    WorkflowErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
                    WorkflowErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let detail = match err.kind() {
                    WorkflowErrorKind::InvalidInput => err.detail().to_string(),
                    WorkflowErrorKind::Internal => workflow::GENERIC_FAILURE.to_string(),
                };
                (
                    status,
                    ApiError {
                        error: err.stage().to_string(),
                        detail: Some(detail),
                    },
                )
            }
            AppError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                ApiError {
                    error: "not_found".into(),
                    detail: Some(what.into()),
                },
            ),
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                ApiError {
                    error: "unauthorized".into(),
                    detail: None,
                },
            ),
            AppError::Conflict => (
                StatusCode::CONFLICT,
                ApiError {
                    error: "duplicate_in_flight".into(),
                    detail: Some("a request with this Idempotency-Key is still running".into()),
                },
            ),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use crate::inference::{InferenceError, TextGeneration};
    use crate::prompts::{Prompt, Task};
    use crate::security::RateLimiter;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tower::ServiceExt;
    use workflow::WorkflowConfig;

    fn app() -> Router {
        app_with(Workflow::offline())
    }

    fn app_with(workflow: Workflow) -> Router {
        let (queue, _worker) = jobs::JobQueue::spawn(workflow.clone());
        let state = AppState {
            workflow,
            queue,
            openapi: Arc::new(load_openapi()),
            idempotency: IdempotencyStore::memory(Duration::from_secs(60)),
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
        };
        build_router(state, AuthState::new("potter:secret", RateLimiter::new(100.0, 100.0)))
    }

    /// Answers nothing after a delay, counting calls.
    struct SlowModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TextGeneration for SlowModel {
        async fn infer(
            &self,
            _task: Task,
            _prompt: &Prompt,
            _timeout: Duration,
        ) -> Result<Option<String>, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(None)
        }
    }

    struct BrokenModel;

    #[async_trait]
    impl TextGeneration for BrokenModel {
        async fn infer(
            &self,
            _task: Task,
            _prompt: &Prompt,
            _timeout: Duration,
        ) -> Result<Option<String>, InferenceError> {
            panic!("model adapter bug");
        }
    }

    fn vase() -> Value {
        json!({
            "name": "Ceramic Vase",
            "category": "Pottery & Ceramics",
            "description": "hand-thrown",
            "tags": ["handmade"],
            "price": 45.99
        })
    }

    fn post_json(uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("X-Artisan-Key", "secret")
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn health_is_public() {
        let resp = app()
            .oneshot(Request::get("/health").body(Body::empty()).expect("req"))
            .await
            .expect("resp");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["service"], json!("artisan-enhance-api"));
    }

    #[tokio::test]
    async fn enhance_requires_key() {
        let req = Request::post("/enhance")
            .header("content-type", "application/json")
            .body(Body::from(vase().to_string()))
            .expect("req");
        let resp = app().oneshot(req).await.expect("resp");
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["error"], json!("missing_api_key"));
    }

    #[tokio::test]
    async fn enhance_returns_complete_result() {
        let body = vase();
        let req = post_json("/enhance")
            .body(Body::from(body.to_string()))
            .expect("req");
        let resp = app().oneshot(req).await.expect("resp");
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("X-RateLimit-Limit"));
        let json = body_json(resp).await;
        assert_eq!(json["result"]["trend"]["score"], json!(0.7));
        assert_eq!(json["result"]["final_price"], json!(47.83));
        assert_eq!(json["result"]["actionable_tips"].as_array().map(Vec::len), Some(5));
        assert_eq!(json["stages"].as_array().map(Vec::len), Some(5));
    }

    #[tokio::test]
    async fn enhance_rejects_missing_fields() {
        let mut body = vase();
        body["description"] = json!("  ");
        let req = post_json("/enhance")
            .body(Body::from(body.to_string()))
            .expect("req");
        let resp = app().oneshot(req).await.expect("resp");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let json = body_json(resp).await;
        assert_eq!(json["error"], json!("validate"));
        assert_eq!(json["detail"], json!("missing_description"));
    }

    #[tokio::test]
    async fn idempotency_key_replays_first_run() {
        let app = app();
        let body = vase();
        let mut run_ids = Vec::new();
        for _ in 0..2 {
            let req = post_json("/enhance")
                .header("Idempotency-Key", "form-42")
                .body(Body::from(body.to_string()))
                .expect("req");
            let resp = app.clone().oneshot(req).await.expect("resp");
            run_ids.push(body_json(resp).await["run_id"].clone());
        }
        assert_eq!(run_ids[0], run_ids[1]);
    }

    #[tokio::test]
    async fn concurrent_duplicate_runs_once() {
        let model = Arc::new(SlowModel {
            calls: AtomicUsize::new(0),
        });
        let app = app_with(Workflow::new(WorkflowConfig::default(), model.clone()));
        let submit = || {
            post_json("/enhance")
                .header("Idempotency-Key", "double-click")
                .body(Body::from(vase().to_string()))
                .expect("req")
        };

        let (first, second) = tokio::join!(
            app.clone().oneshot(submit()),
            app.clone().oneshot(submit())
        );
        let mut statuses = vec![
            first.expect("resp").status(),
            second.expect("resp").status(),
        ];
        statuses.sort();
        assert_eq!(statuses, vec![StatusCode::OK, StatusCode::CONFLICT]);
        // story, trend, price and recommendations for a single run
        assert_eq!(model.calls.load(Ordering::SeqCst), 4);

        let replay = app.oneshot(submit()).await.expect("resp");
        assert_eq!(replay.status(), StatusCode::OK);
        assert_eq!(model.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn failed_run_frees_idempotency_key() {
        let app = app();
        let mut body = vase();
        body["name"] = json!("");
        let req = post_json("/enhance")
            .header("Idempotency-Key", "retry-me")
            .body(Body::from(body.to_string()))
            .expect("req");
        let resp = app.clone().oneshot(req).await.expect("resp");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let req = post_json("/enhance")
            .header("Idempotency-Key", "retry-me")
            .body(Body::from(vase().to_string()))
            .expect("req");
        let resp = app.oneshot(req).await.expect("resp");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn panicking_run_returns_generic_failure() {
        let app = app_with(Workflow::new(WorkflowConfig::default(), Arc::new(BrokenModel)));
        let req = post_json("/enhance")
            .body(Body::from(vase().to_string()))
            .expect("req");
        let resp = app.oneshot(req).await.expect("resp");
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(resp).await;
        assert_eq!(json["error"], json!("internal"));
        assert_eq!(json["detail"], json!("unknown error"));
    }

    #[tokio::test]
    async fn price_stage_uses_supplied_trend_score() {
        let mut body = vase();
        body["price"] = json!(100.0);
        body["trend_score"] = json!(1.0);
        let req = post_json("/stages/price")
            .body(Body::from(body.to_string()))
            .expect("req");
        let resp = app().oneshot(req).await.expect("resp");
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["value"], json!(110.0));
        assert_eq!(json["used_fallback"], json!(true));
    }

    #[tokio::test]
    async fn recommendations_stage_does_not_pad() {
        let mut body = vase();
        body["marketing_recommendations"] = json!(["Sell at weekend markets"]);
        body["recommended_price"] = json!(47.83);
        let req = post_json("/stages/recommendations")
            .body(Body::from(body.to_string()))
            .expect("req");
        let resp = app().oneshot(req).await.expect("resp");
        let json = body_json(resp).await;
        assert_eq!(json["value"].as_array().map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn job_lookup_errors() {
        let app = app();
        let missing = Request::get(format!("/jobs/{}", uuid::Uuid::new_v4()))
            .header("X-Artisan-Key", "secret")
            .body(Body::empty())
            .expect("req");
        let resp = app.clone().oneshot(missing).await.expect("resp");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let malformed = Request::get("/jobs/not-a-uuid")
            .header("X-Artisan-Key", "secret")
            .body(Body::empty())
            .expect("req");
        let resp = app.oneshot(malformed).await.expect("resp");
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
