use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::api::errors::ApiError;
use crate::core::state::AppState;
use crate::schemas::evaluation::{
    BatchEvaluationRequest, BatchEvaluationResponse, DirectEvaluationRequest, EvaluationResult,
};
use crate::tasks::evaluation::{EvaluationContext, SubmissionJob, SubmissionSource};

pub(crate) fn router() -> Router<AppState> {
    Router::new()
        .route("/evaluar-lote", post(evaluate_batch))
        .route("/evaluar-directo", post(evaluate_direct))
}

async fn evaluate_batch(
    State(state): State<AppState>,
    payload: Result<Json<BatchEvaluationRequest>, JsonRejection>,
) -> Result<Json<BatchEvaluationResponse>, ApiError> {
    let Json(payload) = payload?;
    payload.validate()?;

    let max_batch_size = state.settings().evaluation().max_batch_size;
    if payload.submissions.len() > max_batch_size {
        return Err(ApiError::BadRequest(format!(
            "Batch exceeds the limit of {max_batch_size} submissions"
        )));
    }

    let rubric = payload.rubric_data.into_rubric()?;
    let batch_id = Uuid::new_v4().to_string();
    let jobs: Vec<SubmissionJob> =
        payload.submissions.iter().map(SubmissionJob::from_request).collect();
    let total = jobs.len();

    tracing::info!(
        batch_id = %batch_id,
        graded_by = %payload.graded_by,
        submissions = total,
        rubric_mode = rubric.mode().as_str(),
        "Batch evaluation requested"
    );

    let context = EvaluationContext { batch_id: batch_id.clone(), rubric, test: payload.test_data };
    let results = state.evaluator().evaluate(jobs, context).await;

    Ok(Json(BatchEvaluationResponse {
        message: format!("Batch evaluation completed for {total} submissions."),
        graded_by: payload.graded_by,
        batch_id,
        results,
    }))
}

async fn evaluate_direct(
    State(state): State<AppState>,
    payload: Result<Json<DirectEvaluationRequest>, JsonRejection>,
) -> Result<Json<EvaluationResult>, ApiError> {
    let Json(payload) = payload?;
    payload.validate()?;

    let source =
        SubmissionSource::resolve(payload.test_key.as_deref(), payload.test_url.as_deref())
            .ok_or_else(|| {
                ApiError::BadRequest("Either test_key or test_url is required".to_string())
            })?;
    let rubric = payload.rubric_data.into_rubric()?;
    let batch_id = Uuid::new_v4().to_string();

    tracing::info!(
        batch_id = %batch_id,
        rubric_mode = rubric.mode().as_str(),
        "Direct evaluation requested"
    );

    let job = SubmissionJob { submission_id: payload.submission_id, source: Some(source) };
    let context = EvaluationContext { batch_id, rubric, test: payload.test_data };

    state
        .evaluator()
        .evaluate(vec![job], context)
        .await
        .into_iter()
        .next()
        .map(Json)
        .ok_or_else(|| ApiError::internal("empty result set", "Evaluation produced no result"))
}
