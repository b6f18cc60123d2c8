use crate::metrics::{ORACLE_FAILURES_TOTAL, QUERIES_TOTAL, QUERY_DURATION_SEC, QUERY_FAILURES_TOTAL};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use medquery_core::{parse_oracle_response, Analysis};
use medquery_storage::QueryService;
use prometheus::{Encoder, TextEncoder};
use serde_json::{json, Map, Value};
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub service: QueryService,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/v1/schemas", get(list_schemas))
        .route("/v1/:collection/compile", post(compile_intent))
        .route("/v1/:collection/query", post(run_query))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mf = prometheus::gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&mf, &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }
    (StatusCode::OK, String::from_utf8(buf).unwrap_or_default())
}

async fn list_schemas(State(st): State<AppState>) -> impl IntoResponse {
    let mut out = Map::new();
    for schema in st.service.engine().schemas().iter() {
        out.insert(schema.collection().to_string(), json!(&**schema));
    }
    (StatusCode::OK, Json(Value::Object(out)))
}

/// Reads a request body: either the oracle's JSON object itself or
/// `{"raw": "<oracle text>"}`. An optional `question` is carried through
/// to the narrator.
fn read_body(body: Value) -> (String, Analysis) {
    let question = body
        .get("question")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let analysis = match body {
        Value::Object(mut m) => match m.remove("raw") {
            Some(Value::String(raw)) => parse_oracle_response(&raw),
            Some(other) => {
                m.insert("raw".into(), other);
                m.remove("question");
                Analysis::from_value(Value::Object(m))
            }
            None => {
                m.remove("question");
                Analysis::from_value(Value::Object(m))
            }
        },
        other => Analysis::from_value(other),
    };
    (question, analysis)
}

fn not_found(e: impl ToString) -> axum::response::Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": e.to_string() }))).into_response()
}

async fn compile_intent(
    State(st): State<AppState>,
    Path(collection): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let schema = match st.service.schema(&collection) {
        Ok(s) => s,
        Err(e) => return not_found(e),
    };
    match read_body(body).1 {
        Analysis::Intent { intent, .. } => {
            let compiled = st.service.engine().compile(&schema, &intent);
            (StatusCode::OK, Json(compiled.to_json())).into_response()
        }
        Analysis::Partial { error, intent, .. } => {
            ORACLE_FAILURES_TOTAL.inc();
            let mut out = st.service.engine().compile(&schema, &intent).to_json();
            if let Value::Object(m) = &mut out {
                m.insert("oracle_error".into(), Value::String(error));
            }
            (StatusCode::OK, Json(out)).into_response()
        }
        Analysis::Failed { error, raw } => {
            ORACLE_FAILURES_TOTAL.inc();
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": error, "raw": raw })),
            )
                .into_response()
        }
    }
}

async fn run_query(
    State(st): State<AppState>,
    Path(collection): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let request_id = ulid::Ulid::new().to_string();
    let schema = match st.service.schema(&collection) {
        Ok(s) => s,
        Err(e) => return not_found(e),
    };
    let started = Instant::now();
    let (question, analysis) = read_body(body);
    if analysis.error().is_some() {
        ORACLE_FAILURES_TOTAL.inc();
    }
    let resp = st.service.respond(&schema, &question, analysis).await;
    if let Some(shape) = resp.shape.as_deref() {
        QUERIES_TOTAL.with_label_values(&[shape]).inc();
        QUERY_DURATION_SEC
            .with_label_values(&[shape])
            .observe(started.elapsed().as_secs_f64());
        if resp.failed {
            QUERY_FAILURES_TOTAL.with_label_values(&[shape]).inc();
        }
    }
    if resp.failed {
        warn!(%request_id, collection = schema.collection(), status = resp.status, "query answered with an error");
    } else {
        info!(%request_id, collection = schema.collection(), status = resp.status, "query answered");
    }
    (StatusCode::OK, [("x-request-id", request_id)], Json(resp)).into_response()
}
