use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};

use crate::core::metrics;
use crate::core::state::AppState;
use crate::schemas::{HealthResponse, RootResponse};

const BATCH_ENDPOINT: &str = "/evaluar-lote";
const DIRECT_ENDPOINT: &str = "/evaluar-directo";
const SERVICE_DESCRIPTION: &str =
    "Evaluación automática de pruebas: OCR y calificación por rúbrica";

pub(crate) async fn root(State(state): State<AppState>) -> Json<RootResponse> {
    let api = state.settings().api();

    Json(RootResponse {
        message: api.project_name.clone(),
        description: SERVICE_DESCRIPTION.to_string(),
        version: api.version.clone(),
        main_endpoint: DIRECT_ENDPOINT.to_string(),
        batch_endpoint: BATCH_ENDPOINT.to_string(),
    })
}

pub(crate) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: state.settings().api().version.clone(),
        google_api_configured: !state.settings().ai().google_api_key.is_empty(),
        endpoints: vec![
            BATCH_ENDPOINT.to_string(),
            DIRECT_ENDPOINT.to_string(),
            "/health".to_string(),
        ],
    })
}

pub(crate) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    if !state.settings().telemetry().prometheus_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }

    match metrics::render() {
        Some(body) => ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
            .into_response(),
        None => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}
