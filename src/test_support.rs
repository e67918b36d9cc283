use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::api;
use crate::core::{config::Settings, state::AppState};
use crate::schemas::evaluation::{ExternalId, TestMetadata};
use crate::schemas::rubric::{Rubric, SimpleRubric};
use crate::services::file_fetcher::{
    DocumentFetcher, DownloadError, FetchError, FetchedDocument,
};
use crate::services::rubric_scoring::{RubricScorer, ScoreResult, ScoringError};
use crate::services::storage::{SignedUrlProvider, SigningError};
use crate::services::vision_ocr::{ExtractedText, OcrError, TextExtractor};
use crate::tasks::evaluation::{BatchEvaluator, Collaborators, EvaluationContext};

pub(crate) const TEST_STORAGE_HOST: &str = "storage.test.local";

pub(crate) async fn env_lock() -> OwnedMutexGuard<()> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    let lock = LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone();
    lock.lock_owned().await
}

pub(crate) fn set_test_env() {
    std::env::set_var("INSIGHTGRADER_ENV", "test");
    std::env::set_var("GOOGLE_API_KEY", "test-google-key");
    std::env::set_var("S3_ENDPOINT", format!("https://{TEST_STORAGE_HOST}"));
    std::env::set_var("S3_ACCESS_KEY", "test-access-key");
    std::env::set_var("S3_SECRET_KEY", "test-secret-key");
    std::env::set_var("PROMETHEUS_ENABLED", "0");
    std::env::set_var("AWS_EC2_METADATA_DISABLED", "true");

    for key in [
        "ENVIRONMENT",
        "VISION_API_KEY",
        "GOOGLE_MODEL_NAME",
        "MALFORMED_SCORE_POLICY",
        "URL_R2",
        "ACCESS_KEY_ID",
        "SECRET_ACCESS_KEY",
        "S3_BUCKET",
        "BUCKET_NAME",
        "S3_REGION",
        "ALLOWED_DOWNLOAD_HOSTS",
        "BATCH_CONCURRENCY",
        "DOWNLOAD_MAX_SIZE_MB",
        "BATCH_TIMEOUT_SECONDS",
        "MAX_BATCH_SIZE",
        "BACKEND_CORS_ORIGINS",
        "PROJECT_NAME",
        "VERSION",
    ] {
        std::env::remove_var(key);
    }
}

/// Serves `app` on an ephemeral local port for the rest of the test.
pub(crate) async fn spawn_server(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("test server");
    });
    addr
}

pub(crate) fn evaluation_context() -> EvaluationContext {
    EvaluationContext {
        batch_id: "test-batch".to_string(),
        rubric: Rubric::Simple(SimpleRubric {
            id: Some(ExternalId::Number(1)),
            name: Some("Pauta".to_string()),
            instructions: None,
            questions: Vec::new(),
        }),
        test: TestMetadata {
            id: Some(ExternalId::Number(10)),
            name: Some("Prueba 1".to_string()),
            max_grade: 7.0,
        },
    }
}

#[derive(Debug, Clone)]
pub(crate) enum FakeScore {
    Fixed(ScoreResult),
    /// Overall 0-10 score with confidence 0.9 and one holistic criterion.
    Overall(f64),
    Coerced,
    Error,
}

/// In-memory pipeline collaborators with call counters.
#[derive(Clone)]
pub(crate) struct FakePipeline {
    pub(crate) signer_calls: Arc<AtomicUsize>,
    pub(crate) fetch_calls: Arc<AtomicUsize>,
    pub(crate) ocr_calls: Arc<AtomicUsize>,
    pub(crate) scorer_calls: Arc<AtomicUsize>,
    pub(crate) max_in_flight: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    score: FakeScore,
    ocr_text: String,
    failing_fetch: Option<String>,
    fetch_delay: Option<(String, Duration)>,
    last_fetch_path: Arc<StdMutex<Option<PathBuf>>>,
    last_scored_text: Arc<StdMutex<Option<String>>>,
}

impl FakePipeline {
    pub(crate) fn new(score: FakeScore) -> Self {
        Self {
            signer_calls: Arc::default(),
            fetch_calls: Arc::default(),
            ocr_calls: Arc::default(),
            scorer_calls: Arc::default(),
            max_in_flight: Arc::default(),
            in_flight: Arc::default(),
            score,
            ocr_text: "Respuesta 1: 4".to_string(),
            failing_fetch: None,
            fetch_delay: None,
            last_fetch_path: Arc::default(),
            last_scored_text: Arc::default(),
        }
    }

    pub(crate) fn with_ocr_text(mut self, text: &str) -> Self {
        self.ocr_text = text.to_string();
        self
    }

    /// Downloads whose URL contains `marker` fail with a 404.
    pub(crate) fn failing_fetch(mut self, marker: &str) -> Self {
        self.failing_fetch = Some(marker.to_string());
        self
    }

    /// Downloads whose URL contains `marker` take `delay`.
    pub(crate) fn with_fetch_delay(mut self, marker: &str, delay: Duration) -> Self {
        self.fetch_delay = Some((marker.to_string(), delay));
        self
    }

    pub(crate) fn collaborators(&self) -> Collaborators {
        let shared = Arc::new(self.clone());
        Collaborators {
            signer: shared.clone(),
            fetcher: shared.clone(),
            extractor: shared.clone(),
            scorer: shared,
        }
    }

    pub(crate) fn last_fetch_path_exists(&self) -> bool {
        self.last_fetch_path
            .lock()
            .expect("lock")
            .as_ref()
            .is_some_and(|path| path.exists())
    }

    pub(crate) fn last_scored_text(&self) -> Option<String> {
        self.last_scored_text.lock().expect("lock").clone()
    }
}

#[async_trait]
impl SignedUrlProvider for FakePipeline {
    async fn signed_url(&self, key: &str) -> Result<String, SigningError> {
        self.signer_calls.fetch_add(1, Ordering::SeqCst);
        if key.trim().is_empty() {
            return Err(SigningError::Rejected {
                key: key.to_string(),
                message: "empty object key".to_string(),
            });
        }
        Ok(format!("https://{TEST_STORAGE_HOST}/{key}?X-Amz-Expires=300"))
    }
}

#[async_trait]
impl DocumentFetcher for FakePipeline {
    async fn fetch(&self, url: &str, scope: &str) -> Result<FetchedDocument, FetchError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if let Some((marker, delay)) = &self.fetch_delay {
            if url.contains(marker.as_str()) {
                tokio::time::sleep(*delay).await;
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_fetch.as_deref().is_some_and(|marker| url.contains(marker)) {
            return Err(DownloadError::Status(StatusCode::NOT_FOUND).into());
        }

        let bytes = format!("document for {scope}").into_bytes();
        let mut file = tempfile::Builder::new()
            .prefix(&format!("insightgrader-{scope}-"))
            .suffix(".jpeg")
            .tempfile()
            .map_err(DownloadError::from)?;
        file.write_all(&bytes).map_err(DownloadError::from)?;
        *self.last_fetch_path.lock().expect("lock") = Some(file.path().to_path_buf());

        Ok(FetchedDocument::from_parts(
            file,
            hex::encode(Sha256::digest(&bytes)),
            bytes.len() as u64,
            Some("jpeg".to_string()),
        ))
    }
}

#[async_trait]
impl TextExtractor for FakePipeline {
    async fn extract_text(&self, path: &Path) -> Result<ExtractedText, OcrError> {
        self.ocr_calls.fetch_add(1, Ordering::SeqCst);
        if !path.exists() {
            return Err(OcrError::Io(std::io::Error::from(std::io::ErrorKind::NotFound)));
        }
        if self.ocr_text.trim().is_empty() {
            return Err(OcrError::Empty);
        }
        Ok(ExtractedText { text: self.ocr_text.clone(), page_count: 1 })
    }
}

#[async_trait]
impl RubricScorer for FakePipeline {
    async fn score(&self, text: &str, _rubric: &Rubric) -> Result<ScoreResult, ScoringError> {
        self.scorer_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_scored_text.lock().expect("lock") = Some(text.to_string());

        match &self.score {
            FakeScore::Fixed(result) => Ok(result.clone()),
            FakeScore::Overall(score) => Ok(ScoreResult {
                overall_score: *score,
                criteria: vec![crate::services::rubric_scoring::CriterionScore {
                    key: "overall".to_string(),
                    student_answer: Some(text.to_string()),
                    correct_answer: None,
                    evaluation: None,
                    feedback: "ok".to_string(),
                    score: *score,
                }],
                feedback: "Evaluación completada".to_string(),
                confidence: 0.9,
                coerced: false,
            }),
            FakeScore::Coerced => Ok(ScoreResult::coerced_default()),
            FakeScore::Error => Err(ScoringError::Service("status 503: overloaded".to_string())),
        }
    }
}

/// Router wired to fake collaborators, with settings from the test environment.
pub(crate) async fn test_app(fakes: &FakePipeline) -> (Router, OwnedMutexGuard<()>) {
    let guard = env_lock().await;
    set_test_env();
    let settings = Settings::load().expect("settings");
    (app_with_settings(settings, fakes), guard)
}

pub(crate) fn app_with_settings(settings: Settings, fakes: &FakePipeline) -> Router {
    let evaluator = BatchEvaluator::new(
        fakes.collaborators(),
        settings.evaluation().concurrency,
        Duration::from_secs(settings.evaluation().batch_timeout_seconds),
    );
    api::router::router(AppState::new(settings, evaluator))
}

pub(crate) fn json_request(
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);

    if let Some(body) = body {
        let bytes = serde_json::to_vec(&body).expect("serialize body");
        builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(bytes))
            .expect("request body")
    } else {
        builder.body(Body::empty()).expect("request body")
    }
}

pub(crate) async fn read_json(response: axum::response::Response<Body>) -> serde_json::Value {
    let body = to_bytes(response.into_body(), usize::MAX).await.expect("response body");
    serde_json::from_slice(&body).unwrap_or_else(|err| {
        let body_text = String::from_utf8_lossy(&body);
        panic!("json parse: {err}; body: {body_text}");
    })
}
