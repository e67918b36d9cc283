use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;

use crate::core::time::{now_rfc3339, round_seconds};
use crate::schemas::evaluation::{
    DetailedScore, EvaluationResult, EvaluationStatus, ExternalId, ResultMetadata,
    SubmissionRequest, SubmissionStage, TestMetadata,
};
use crate::schemas::rubric::Rubric;
use crate::services::file_fetcher::{DocumentFetcher, FetchError};
use crate::services::rubric_scoring::{RubricScorer, ScoreResult, ScoringError};
use crate::services::score_scale::{round_one_decimal, to_final_scale};
use crate::services::storage::{SignedUrlProvider, SigningError};
use crate::services::text_normalizer::normalize;
use crate::services::vision_ocr::{OcrError, TextExtractor};

/// Overall score reported for failed submissions, the bottom of the 1-7 scale.
const FAILED_OVERALL_SCORE: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SubmissionSource {
    Key(String),
    Url(String),
}

impl SubmissionSource {
    /// Storage keys win over direct URLs. Blank values count as absent.
    pub(crate) fn resolve(key: Option<&str>, url: Option<&str>) -> Option<Self> {
        let clean = |value: Option<&str>| {
            value.map(str::trim).filter(|value| !value.is_empty()).map(ToString::to_string)
        };

        clean(key).map(Self::Key).or_else(|| clean(url).map(Self::Url))
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SubmissionJob {
    pub(crate) submission_id: Option<ExternalId>,
    pub(crate) source: Option<SubmissionSource>,
}

impl SubmissionJob {
    pub(crate) fn from_request(request: &SubmissionRequest) -> Self {
        Self {
            submission_id: Some(request.submission_id.clone()),
            source: SubmissionSource::resolve(
                request.test_key.as_deref(),
                request.test_url.as_deref(),
            ),
        }
    }

    pub(crate) fn label(&self) -> String {
        self.submission_id.as_ref().map(ToString::to_string).unwrap_or_else(|| "direct".to_string())
    }
}

/// Read-only inputs shared by every submission of one batch.
#[derive(Debug, Clone)]
pub(crate) struct EvaluationContext {
    pub(crate) batch_id: String,
    pub(crate) rubric: Rubric,
    pub(crate) test: TestMetadata,
}

#[derive(Clone)]
pub(crate) struct Collaborators {
    pub(crate) signer: Arc<dyn SignedUrlProvider>,
    pub(crate) fetcher: Arc<dyn DocumentFetcher>,
    pub(crate) extractor: Arc<dyn TextExtractor>,
    pub(crate) scorer: Arc<dyn RubricScorer>,
}

#[derive(Debug, Error)]
pub(crate) enum FailureCause {
    #[error("submission has neither test_key nor test_url")]
    MissingSource,
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Ocr(#[from] OcrError),
    #[error(transparent)]
    Scoring(#[from] ScoringError),
    #[error("batch deadline exceeded")]
    TimedOut,
    #[error("evaluation task aborted: {0}")]
    Aborted(String),
}

#[derive(Debug, Error)]
#[error("{stage_name} stage failed: {cause}", stage_name = .stage.as_str())]
pub(crate) struct EvaluationError {
    pub(crate) stage: SubmissionStage,
    #[source]
    pub(crate) cause: FailureCause,
}

/// Current stage of one submission, readable after its task is cancelled.
#[derive(Debug)]
pub(crate) struct StageTracker(AtomicU8);

impl StageTracker {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(encode(SubmissionStage::Pending)))
    }

    pub(crate) fn current(&self) -> SubmissionStage {
        decode(self.0.load(Ordering::SeqCst))
    }

    fn advance(&self, stage: SubmissionStage) {
        self.0.store(encode(stage), Ordering::SeqCst);
        tracing::debug!(stage = stage.as_str(), "Stage entered");
    }

    pub(crate) fn fail(&self, cause: impl Into<FailureCause>) -> EvaluationError {
        EvaluationError { stage: self.current(), cause: cause.into() }
    }
}

fn encode(stage: SubmissionStage) -> u8 {
    match stage {
        SubmissionStage::Pending => 0,
        SubmissionStage::Fetching => 1,
        SubmissionStage::Extracting => 2,
        SubmissionStage::Scoring => 3,
        SubmissionStage::Completed => 4,
        SubmissionStage::Failed => 5,
    }
}

fn decode(value: u8) -> SubmissionStage {
    match value {
        1 => SubmissionStage::Fetching,
        2 => SubmissionStage::Extracting,
        3 => SubmissionStage::Scoring,
        4 => SubmissionStage::Completed,
        5 => SubmissionStage::Failed,
        _ => SubmissionStage::Pending,
    }
}

/// What a submission yields when every stage succeeds.
#[derive(Debug, Clone)]
pub(crate) struct ScoredSubmission {
    pub(crate) score: ScoreResult,
    pub(crate) text_length: usize,
    pub(crate) content_sha256: String,
    pub(crate) page_count: u32,
}

/// Drives one submission through fetch, OCR, normalization and scoring.
pub(crate) async fn run_submission(
    collaborators: &Collaborators,
    context: &EvaluationContext,
    job: &SubmissionJob,
    tracker: &StageTracker,
) -> Result<ScoredSubmission, EvaluationError> {
    tracker.advance(SubmissionStage::Fetching);
    let url = match &job.source {
        Some(SubmissionSource::Key(key)) => {
            collaborators.signer.signed_url(key).await.map_err(|err| tracker.fail(err))?
        }
        Some(SubmissionSource::Url(url)) => url.clone(),
        None => return Err(tracker.fail(FailureCause::MissingSource)),
    };

    let document =
        collaborators.fetcher.fetch(&url, &job.label()).await.map_err(|err| tracker.fail(err))?;
    tracing::debug!(
        size_bytes = document.size_bytes,
        extension = document.extension.as_deref().unwrap_or("-"),
        "Document fetched"
    );

    tracker.advance(SubmissionStage::Extracting);
    let extracted = collaborators.extractor.extract_text(document.path()).await;
    let content_sha256 = document.sha256.clone();
    document.close();
    let extracted = extracted.map_err(|err| tracker.fail(err))?;

    let text = normalize(&extracted.text);
    tracing::debug!(
        raw_length = extracted.text.len(),
        text_length = text.len(),
        page_count = extracted.page_count,
        "Text normalized"
    );

    tracker.advance(SubmissionStage::Scoring);
    let score =
        collaborators.scorer.score(&text, &context.rubric).await.map_err(|err| tracker.fail(err))?;

    tracker.advance(SubmissionStage::Completed);
    Ok(ScoredSubmission {
        score,
        text_length: text.chars().count(),
        content_sha256,
        page_count: extracted.page_count,
    })
}

fn base_metadata(context: &EvaluationContext, job: &SubmissionJob) -> ResultMetadata {
    let (original_key, original_url) = match &job.source {
        Some(SubmissionSource::Key(key)) => (Some(key.clone()), None),
        Some(SubmissionSource::Url(url)) => (None, Some(url.clone())),
        None => (None, None),
    };

    ResultMetadata {
        submission_id: job.submission_id.clone(),
        test_id: context.test.id.clone(),
        test_name: context.test.name.clone(),
        max_grade: context.test.max_grade,
        rubric_id: context.rubric.id().cloned(),
        rubric_name: context.rubric.name().map(ToString::to_string),
        original_key,
        original_url,
        evaluated_at: now_rfc3339(),
        ..ResultMetadata::default()
    }
}

pub(crate) fn completed_result(
    context: &EvaluationContext,
    job: &SubmissionJob,
    scored: ScoredSubmission,
    elapsed_seconds: f64,
) -> EvaluationResult {
    let ScoredSubmission { score, text_length, content_sha256, page_count } = scored;

    let detailed_scores: IndexMap<String, DetailedScore> = score
        .criteria
        .into_iter()
        .map(|criterion| {
            let detail = DetailedScore {
                student_answer: criterion.student_answer,
                correct_answer: criterion.correct_answer,
                evaluation: criterion.evaluation,
                feedback: criterion.feedback,
                score: round_one_decimal(to_final_scale(criterion.score)),
                original_score_0_10: criterion.score,
            };
            (criterion.key, detail)
        })
        .collect();

    let mut metadata = base_metadata(context, job);
    metadata.text_length = Some(text_length);
    metadata.content_sha256 = Some(content_sha256);
    metadata.page_count = Some(page_count);
    metadata.score_coerced = score.coerced;

    EvaluationResult {
        status: EvaluationStatus::Completed,
        submission_id: job.submission_id.clone(),
        general_feedback: score.feedback,
        overall_score: round_one_decimal(to_final_scale(score.overall_score)),
        confidence: score.confidence,
        detailed_scores,
        test_metadata: metadata,
        processing_time_seconds: round_seconds(elapsed_seconds),
        error: None,
        failed_stage: None,
    }
}

pub(crate) fn failed_result(
    context: &EvaluationContext,
    job: &SubmissionJob,
    error: &EvaluationError,
    elapsed_seconds: f64,
) -> EvaluationResult {
    let message = error.cause.to_string();

    EvaluationResult {
        status: EvaluationStatus::Failed,
        submission_id: job.submission_id.clone(),
        general_feedback: format!("Error al evaluar la prueba: {message}"),
        overall_score: FAILED_OVERALL_SCORE,
        confidence: 0.0,
        detailed_scores: IndexMap::new(),
        test_metadata: base_metadata(context, job),
        processing_time_seconds: round_seconds(elapsed_seconds),
        error: Some(message),
        failed_stage: Some(error.stage),
    }
}
