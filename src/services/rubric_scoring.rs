use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::core::config::{MalformedScorePolicy, Settings};
use crate::schemas::rubric::{Criterion, Rubric};

const SCORE_MIN: f64 = 0.0;
const SCORE_MAX: f64 = 10.0;
const DEFAULT_CONFIDENCE: f64 = 0.8;
const NO_ANSWER_FEEDBACK: &str =
    "No se encontró una respuesta legible en el documento; no hay contenido que evaluar.";
const COERCED_FEEDBACK: &str =
    "La evaluación automática no produjo un resultado válido; se asignó el puntaje mínimo y requiere revisión manual.";

const SYSTEM_PROMPT: &str = r#"Eres un profesor experto en evaluación académica. Evalúa la prueba de un estudiante usando ESTRICTAMENTE la rúbrica entregada.

Reglas:
1. Asigna a cada criterio un puntaje de 0 a 10.
2. Calcula "overall_score" de 0 a 10 ponderando los criterios según sus puntos.
3. Entrega feedback específico por criterio y un feedback general.
4. Asigna "confidence" entre 0 y 1 según cuán seguro estás de tu evaluación.
5. Si el texto es ilegible o no contiene respuestas, evalúa con 0 y explica el motivo en el feedback.

Formato de respuesta (JSON estricto, sin texto adicional):
{
  "detailed_scores": {
    "<clave del criterio>": {
      "student_answer": "respuesta o evidencia del estudiante",
      "correct_answer": "respuesta esperada según la rúbrica",
      "evaluation": "análisis según la rúbrica",
      "feedback": "feedback para el estudiante",
      "score": 0
    }
  },
  "overall_score": 0,
  "general_feedback": "feedback general",
  "confidence": 0.0
}"#;

#[derive(Debug, Error, PartialEq)]
pub(crate) enum MalformedResponse {
    #[error("model response contains no text")]
    EmptyText,
    #[error("model output is not a JSON object")]
    NotJson,
    #[error("model output has neither an overall score nor criterion scores")]
    MissingScore,
    #[error("criterion {0} has no numeric score")]
    MissingCriterionScore(String),
    #[error("rubric criterion {0} is missing from the model output")]
    MissingCriterion(String),
    #[error("overall score {0} is outside 0-10")]
    OverallOutOfRange(f64),
    #[error("criterion {key} score {score} is outside 0-10")]
    CriterionOutOfRange { key: String, score: f64 },
    #[error("confidence {0} is outside 0-1")]
    ConfidenceOutOfRange(f64),
}

#[derive(Debug, Error)]
pub(crate) enum ScoringError {
    #[error("generative service request failed: {0}")]
    Service(String),
    #[error("generation stopped by the model service: {0}")]
    Blocked(String),
    #[error("model reported an error: {0}")]
    ModelError(String),
    #[error("malformed model response: {0}")]
    Malformed(#[from] MalformedResponse),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CriterionScore {
    pub(crate) key: String,
    pub(crate) student_answer: Option<String>,
    pub(crate) correct_answer: Option<String>,
    pub(crate) evaluation: Option<String>,
    pub(crate) feedback: String,
    /// 0-10.
    pub(crate) score: f64,
}

/// Scorer output on the 0-10 scale.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ScoreResult {
    pub(crate) overall_score: f64,
    pub(crate) criteria: Vec<CriterionScore>,
    pub(crate) feedback: String,
    pub(crate) confidence: f64,
    pub(crate) coerced: bool,
}

impl ScoreResult {
    pub(crate) fn no_answer() -> Self {
        Self {
            overall_score: SCORE_MIN,
            criteria: Vec::new(),
            feedback: NO_ANSWER_FEEDBACK.to_string(),
            confidence: 0.0,
            coerced: false,
        }
    }

    pub(crate) fn coerced_default() -> Self {
        Self {
            overall_score: SCORE_MIN,
            criteria: Vec::new(),
            feedback: COERCED_FEEDBACK.to_string(),
            confidence: 0.0,
            coerced: true,
        }
    }
}

#[async_trait]
pub(crate) trait RubricScorer: Send + Sync {
    async fn score(&self, text: &str, rubric: &Rubric) -> Result<ScoreResult, ScoringError>;
}

#[derive(Debug, Clone)]
pub(crate) struct GeminiScorer {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    max_output_tokens: u32,
    temperature: f64,
    max_retries: u32,
    policy: MalformedScorePolicy,
    backoff_base: Duration,
}

impl GeminiScorer {
    pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let ai = settings.ai();
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(ai.request_timeout))
            .build()
            .context("Failed to build Gemini HTTP client")?;

        Ok(Self {
            client,
            api_key: ai.google_api_key.clone(),
            base_url: ai.gemini_base_url.trim_end_matches('/').to_string(),
            model: ai.model.clone(),
            max_output_tokens: ai.max_output_tokens,
            temperature: ai.temperature,
            max_retries: ai.max_retries,
            policy: ai.malformed_policy,
            backoff_base: Duration::from_secs(1),
        })
    }

    async fn generate(&self, prompt: &str) -> Result<String, ScoringError> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let payload = json!({
            "systemInstruction": {"parts": [{"text": SYSTEM_PROMPT}]},
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": self.temperature,
                "maxOutputTokens": self.max_output_tokens,
                "responseMimeType": "application/json"
            }
        });

        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            let response = self
                .client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&payload)
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let body: Value = resp.json().await.unwrap_or(Value::Null);
                    if status.is_success() {
                        return response_text(&body);
                    }

                    let message = format!("status {status}: {}", api_error_message(&body));
                    if !is_retryable_status(status) {
                        return Err(ScoringError::Service(message));
                    }
                    last_error = message;
                }
                Err(err) => {
                    last_error = format!("transport error: {err}");
                }
            }

            tracing::warn!(model = %self.model, attempt, error = %last_error, "Gemini call failed");
            if attempt < self.max_retries {
                tokio::time::sleep(self.backoff_base * 2_u32.pow(attempt)).await;
            }
        }

        Err(ScoringError::Service(last_error))
    }

    fn apply_policy(&self, malformed: MalformedResponse) -> Result<ScoreResult, ScoringError> {
        match self.policy {
            MalformedScorePolicy::Default => {
                tracing::warn!(
                    error = %malformed,
                    policy = self.policy.as_str(),
                    "Malformed model response replaced by default result"
                );
                metrics::counter!("scorer_coerced_responses_total").increment(1);
                Ok(ScoreResult::coerced_default())
            }
            MalformedScorePolicy::Fail => Err(malformed.into()),
        }
    }
}

#[async_trait]
impl RubricScorer for GeminiScorer {
    async fn score(&self, text: &str, rubric: &Rubric) -> Result<ScoreResult, ScoringError> {
        if text.trim().is_empty() {
            tracing::info!("No extractable answer, skipping model call");
            return Ok(ScoreResult::no_answer());
        }

        let prompt = build_prompt(text, rubric);
        let raw = match self.generate(&prompt).await {
            Ok(raw) => raw,
            Err(ScoringError::Malformed(malformed)) => return self.apply_policy(malformed),
            Err(err) => return Err(err),
        };

        match interpret(&raw, rubric) {
            Ok(result) => {
                tracing::debug!(
                    model = %self.model,
                    overall_score = result.overall_score,
                    confidence = result.confidence,
                    criteria = result.criteria.len(),
                    "Model score accepted"
                );
                Ok(result)
            }
            Err(ScoringError::Malformed(malformed)) => self.apply_policy(malformed),
            Err(err) => Err(err),
        }
    }
}

pub(crate) fn build_prompt(text: &str, rubric: &Rubric) -> String {
    let mut prompt = String::new();

    match rubric {
        Rubric::Simple(simple) => {
            prompt.push_str(
                "MODO DE EVALUACIÓN: holístico. Usa un único criterio con la clave \"overall\" \
                 que califique la prueba completa.\n",
            );
            if let Some(instructions) = &simple.instructions {
                prompt.push_str(&format!("\nINSTRUCCIONES DE LA RÚBRICA:\n{instructions}\n"));
            }
            if !simple.questions.is_empty() {
                prompt.push_str("\nPREGUNTAS DE REFERENCIA:\n");
                push_criteria(&mut prompt, &simple.questions, false);
            }
        }
        Rubric::Advanced(advanced) => {
            prompt.push_str(
                "MODO DE EVALUACIÓN: por criterios ponderados. Devuelve en \"detailed_scores\" \
                 exactamente una entrada por cada clave listada.\n",
            );
            if let Some(instructions) = &advanced.instructions {
                prompt.push_str(&format!("\nINSTRUCCIONES DE LA RÚBRICA:\n{instructions}\n"));
            }
            prompt.push_str("\nCRITERIOS:\n");
            push_criteria(&mut prompt, &advanced.criteria, true);
        }
    }

    prompt.push_str(&format!("\nTEXTO DE LA PRUEBA DEL ESTUDIANTE:\n{text}\n"));
    prompt
}

fn push_criteria(prompt: &mut String, criteria: &[Criterion], with_points: bool) {
    for criterion in criteria {
        prompt.push_str(&format!("- [{}] {}", criterion.key, criterion.description));
        if with_points {
            prompt.push_str(&format!(" (puntos: {})", criterion.points));
        }
        if let Some(expected) = &criterion.expected_answer {
            prompt.push_str(&format!("\n  Respuesta esperada: {expected}"));
        }
        prompt.push('\n');
    }
}

fn response_text(body: &Value) -> Result<String, ScoringError> {
    if let Some(reason) = body
        .get("promptFeedback")
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str)
    {
        return Err(ScoringError::Blocked(format!("prompt blocked: {reason}")));
    }

    let candidate = body
        .get("candidates")
        .and_then(|items| items.get(0))
        .ok_or(MalformedResponse::EmptyText)?;

    if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
        if !matches!(reason, "STOP" | "MAX_TOKENS" | "FINISH_REASON_UNSPECIFIED") {
            return Err(ScoringError::Blocked(format!("finish reason {reason}")));
        }
    }

    let text: String = candidate
        .get("content")
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| parts.iter().filter_map(|part| part.get("text")?.as_str()).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(MalformedResponse::EmptyText.into());
    }

    Ok(text)
}

/// Finds the JSON object in model output: the whole text, a ```json fence, or the outermost braces.
pub(crate) fn extract_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + "```json".len()..];
        if let Some(end) = rest.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(rest[..end].trim()) {
                return Some(value);
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if start >= end {
        return None;
    }
    serde_json::from_str::<Value>(&trimmed[start..=end]).ok()
}

pub(crate) fn interpret(raw: &str, rubric: &Rubric) -> Result<ScoreResult, ScoringError> {
    let value = extract_json(raw).ok_or(MalformedResponse::NotJson)?;
    let object = value.as_object().ok_or(MalformedResponse::NotJson)?;

    if let Some(error) = object.get("error") {
        let reason = object.get("reason").unwrap_or(error);
        let message =
            reason.as_str().map(ToString::to_string).unwrap_or_else(|| reason.to_string());
        return Err(ScoringError::ModelError(message));
    }

    let criteria = order_by_rubric(parse_criteria(object.get("detailed_scores"))?, rubric)?;

    let overall_score = match object.get("overall_score") {
        Some(raw_overall) if !raw_overall.is_null() => {
            let overall = as_number(raw_overall).ok_or(MalformedResponse::MissingScore)?;
            if !(SCORE_MIN..=SCORE_MAX).contains(&overall) {
                return Err(MalformedResponse::OverallOutOfRange(overall).into());
            }
            overall
        }
        _ => weighted_mean(&criteria, rubric).ok_or(MalformedResponse::MissingScore)?,
    };

    let confidence = match object.get("confidence") {
        Some(raw_confidence) if !raw_confidence.is_null() => {
            let confidence = as_number(raw_confidence)
                .ok_or(MalformedResponse::ConfidenceOutOfRange(f64::NAN))?;
            if !(0.0..=1.0).contains(&confidence) {
                return Err(MalformedResponse::ConfidenceOutOfRange(confidence).into());
            }
            confidence
        }
        _ => DEFAULT_CONFIDENCE,
    };

    let feedback = object
        .get("general_feedback")
        .or_else(|| object.get("feedback"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();

    Ok(ScoreResult { overall_score, criteria, feedback, confidence, coerced: false })
}

fn parse_criteria(raw: Option<&Value>) -> Result<Vec<CriterionScore>, MalformedResponse> {
    let Some(entries) = raw.and_then(Value::as_object) else {
        return Ok(Vec::new());
    };

    entries.iter().map(|(key, entry)| parse_criterion(key, entry)).collect()
}

fn parse_criterion(key: &str, entry: &Value) -> Result<CriterionScore, MalformedResponse> {
    let empty = Map::new();
    let fields = entry.as_object().unwrap_or(&empty);
    let raw_score = fields.get("score").unwrap_or(entry);

    let score = as_number(raw_score)
        .ok_or_else(|| MalformedResponse::MissingCriterionScore(key.to_string()))?;
    if !(SCORE_MIN..=SCORE_MAX).contains(&score) {
        return Err(MalformedResponse::CriterionOutOfRange { key: key.to_string(), score });
    }

    let text = |name: &str| {
        fields
            .get(name)
            .and_then(Value::as_str)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    Ok(CriterionScore {
        key: key.to_string(),
        student_answer: text("student_answer"),
        correct_answer: text("correct_answer"),
        evaluation: text("evaluation"),
        feedback: text("feedback").unwrap_or_default(),
        score,
    })
}

/// Puts criteria in rubric order. Advanced rubrics must get a score for every criterion.
fn order_by_rubric(
    mut criteria: Vec<CriterionScore>,
    rubric: &Rubric,
) -> Result<Vec<CriterionScore>, MalformedResponse> {
    let Rubric::Advanced(advanced) = rubric else {
        return Ok(criteria);
    };

    let mut ordered = Vec::with_capacity(criteria.len());
    for expected in &advanced.criteria {
        let position = criteria
            .iter()
            .position(|criterion| criterion.key == expected.key)
            .ok_or_else(|| MalformedResponse::MissingCriterion(expected.key.clone()))?;
        ordered.push(criteria.remove(position));
    }
    ordered.extend(criteria);
    Ok(ordered)
}

fn weighted_mean(criteria: &[CriterionScore], rubric: &Rubric) -> Option<f64> {
    let (weighted_sum, total_weight) = match rubric {
        Rubric::Advanced(advanced) => {
            advanced.criteria.iter().try_fold((0.0, 0.0), |(sum, total), expected| {
                let score = criteria.iter().find(|criterion| criterion.key == expected.key)?.score;
                Some((sum + score * expected.points, total + expected.points))
            })?
        }
        Rubric::Simple(_) => criteria
            .iter()
            .fold((0.0, 0.0), |(sum, total), criterion| (sum + criterion.score, total + 1.0)),
    };

    (total_weight > 0.0).then(|| weighted_sum / total_weight)
}

fn as_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().replace(',', ".").parse::<f64>().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

fn api_error_message(body: &Value) -> String {
    body.get("error")
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("unknown_error")
        .to_string()
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}
