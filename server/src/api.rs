use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{Json, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use guidance_core::{Error, TemplateStream};
use serde_json::{json, Value};
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::types::*;
use crate::Processor;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub type ApiError = (StatusCode, Json<Value>);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

/// HTTP status for an engine error.
pub fn error_status(e: &Error) -> StatusCode {
    match e {
        Error::Template(_)
        | Error::InvalidDirective(_)
        | Error::MissingVariable(_)
        | Error::NotAList(_)
        | Error::NoOptions(_)
        | Error::Tokenizer(_) => StatusCode::BAD_REQUEST,
        Error::NoMatchingCandidate(_) => StatusCode::UNPROCESSABLE_ENTITY,
        Error::Backend { .. } | Error::Http(_) => StatusCode::BAD_GATEWAY,
        Error::Json(_) | Error::Io(_) | Error::Config(_) | Error::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn lookup<'a>(ctx: &'a AppContext, model: &str) -> Result<&'a Arc<Processor>, ApiError> {
    ctx.models
        .get(model)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("Unknown model '{model}'")))
}

/// One JSON object per line; a failed run ends with an `{"error": ..}` line.
/// The body owns the run, so a client hanging up cancels it.
fn ndjson_body(stream: TemplateStream, request_id: String) -> Body {
    let (rx, guard) = stream.into_parts();
    let lines = ReceiverStream::new(rx).map(move |item| {
        let _run = &guard;
        let line = match item {
            Ok(results) => json!(results),
            Err(e) => {
                warn!(request_id = request_id.as_str(), error = %e, "Guidance stream failed");
                json!({ "error": e.to_string() })
            }
        };
        Ok::<_, Infallible>(format!("{line}\n"))
    });
    Body::from_stream(lines)
}

// ---------------------------------------------------------------------------
// Status endpoints
// ---------------------------------------------------------------------------

pub async fn api_health(State(ctx): State<AppContext>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        models: ctx.models.keys().cloned().collect(),
        uptime_secs: ctx.start_time.elapsed().as_secs(),
    })
}

pub async fn api_models(State(ctx): State<AppContext>) -> Json<ModelsResponse> {
    let models = ctx
        .models
        .iter()
        .map(|(name, processor)| ModelInfo {
            name: name.clone(),
            tokenizer: processor.tokenizer().name().to_string(),
            walk: processor.walk().name().to_string(),
            backend_model: processor.generator().config().model.clone(),
        })
        .collect();
    Json(ModelsResponse { models })
}

// ---------------------------------------------------------------------------
// Guidance
// ---------------------------------------------------------------------------

pub async fn api_guidance(State(ctx): State<AppContext>, Json(req): Json<GuidanceRequest>) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let mut response = run_guidance(&ctx, req, &request_id).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn run_guidance(ctx: &AppContext, req: GuidanceRequest, request_id: &str) -> Response {
    let processor = match lookup(ctx, &req.model) {
        Ok(processor) => Arc::clone(processor),
        Err(e) => return e.into_response(),
    };
    if req.template.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "template must not be empty").into_response();
    }
    info!(
        request_id,
        model = req.model.as_str(),
        stream = req.stream,
        template_len = req.template.len(),
        "Guidance request"
    );

    if req.stream {
        let stream = processor.process_template_stream(&req.template, &req.variables);
        let body = ndjson_body(stream, request_id.to_string());
        return ([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response();
    }

    let start = Instant::now();
    match processor.process_template(&req.template, &req.variables).await {
        Ok(results) => {
            info!(
                request_id,
                results = results.len(),
                time_ms = start.elapsed().as_millis() as u64,
                "Guidance complete"
            );
            Json(results).into_response()
        }
        Err(e) => {
            warn!(request_id, error = %e, "Guidance failed");
            api_error(error_status(&e), e).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Tokenize
// ---------------------------------------------------------------------------

pub async fn api_tokenize(
    State(ctx): State<AppContext>,
    Json(req): Json<TokenizeRequest>,
) -> Result<Json<TokenizeResponse>, ApiError> {
    let processor = lookup(&ctx, &req.model)?;
    let tokens = processor.tokenizer().encode(&req.text).map_err(|e| api_error(error_status(&e), e))?;
    Ok(Json(TokenizeResponse { count: tokens.len(), tokens }))
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/health", get(api_health))
        .route("/v1/models", get(api_models))
        .route("/v1/guidance", post(api_guidance))
        .route("/v1/tokenize", post(api_tokenize))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
