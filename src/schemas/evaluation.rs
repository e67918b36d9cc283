use std::fmt;

use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use validator::Validate;

use crate::schemas::rubric::RubricPayload;

/// Caller-assigned identifier, echoed back unchanged. Accepts JSON numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum ExternalId {
    Number(i64),
    Text(String),
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub(crate) struct SubmissionRequest {
    #[serde(rename = "submissionId", alias = "submission_id")]
    pub(crate) submission_id: ExternalId,
    #[serde(default)]
    pub(crate) test_key: Option<String>,
    #[serde(default)]
    pub(crate) test_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub(crate) struct TestMetadata {
    #[serde(default)]
    pub(crate) id: Option<ExternalId>,
    #[serde(default)]
    pub(crate) name: Option<String>,
    #[serde(default = "default_max_grade", alias = "maxGrade", deserialize_with = "lenient_f64")]
    #[validate(range(exclusive_min = 0.0, message = "max_grade must be positive"))]
    pub(crate) max_grade: f64,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct BatchEvaluationRequest {
    #[serde(rename = "gradedBy", alias = "graded_by")]
    #[validate(length(min = 1, message = "gradedBy must not be empty"))]
    pub(crate) graded_by: String,
    #[validate(nested)]
    pub(crate) submissions: Vec<SubmissionRequest>,
    pub(crate) rubric_data: RubricPayload,
    #[validate(nested)]
    pub(crate) test_data: TestMetadata,
}

#[derive(Debug, Deserialize, Validate)]
pub(crate) struct DirectEvaluationRequest {
    #[validate(nested)]
    pub(crate) test_data: TestMetadata,
    pub(crate) rubric_data: RubricPayload,
    #[serde(default)]
    pub(crate) test_url: Option<String>,
    #[serde(default)]
    pub(crate) test_key: Option<String>,
    #[serde(default, rename = "submissionId", alias = "submission_id")]
    pub(crate) submission_id: Option<ExternalId>,
}

/// Per-submission lifecycle. `Failed` can follow any non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum SubmissionStage {
    Pending,
    Fetching,
    Extracting,
    Scoring,
    Completed,
    Failed,
}

impl SubmissionStage {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Extracting => "extracting",
            Self::Scoring => "scoring",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum EvaluationStatus {
    Completed,
    Failed,
}

impl EvaluationStatus {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct DetailedScore {
    pub(crate) student_answer: Option<String>,
    pub(crate) correct_answer: Option<String>,
    pub(crate) evaluation: Option<String>,
    pub(crate) feedback: String,
    /// Final 1-7 scale.
    pub(crate) score: f64,
    pub(crate) original_score_0_10: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct ResultMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) submission_id: Option<ExternalId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) test_id: Option<ExternalId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) test_name: Option<String>,
    pub(crate) max_grade: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) rubric_id: Option<ExternalId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) rubric_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) original_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) original_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) text_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) content_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) page_count: Option<u32>,
    pub(crate) score_coerced: bool,
    pub(crate) evaluated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct EvaluationResult {
    pub(crate) status: EvaluationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) submission_id: Option<ExternalId>,
    pub(crate) general_feedback: String,
    pub(crate) overall_score: f64,
    pub(crate) confidence: f64,
    pub(crate) detailed_scores: IndexMap<String, DetailedScore>,
    pub(crate) test_metadata: ResultMetadata,
    pub(crate) processing_time_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) failed_stage: Option<SubmissionStage>,
}

#[derive(Debug, Serialize)]
pub(crate) struct BatchEvaluationResponse {
    pub(crate) message: String,
    #[serde(rename = "gradedBy")]
    pub(crate) graded_by: String,
    pub(crate) batch_id: String,
    pub(crate) results: Vec<EvaluationResult>,
}

fn default_max_grade() -> f64 {
    7.0
}

/// Grades often arrive as decimal strings ("7.00") from the caller's database.
fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(f64),
        Text(String),
    }

    match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(value) => Ok(value),
        NumberOrText::Text(raw) => raw
            .trim()
            .replace(',', ".")
            .parse::<f64>()
            .map_err(|_| D::Error::custom(format!("invalid number: {raw}"))),
    }
}
