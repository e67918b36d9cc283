use std::io::Write;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reqwest::{redirect, Client, StatusCode, Url};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::core::config::Settings;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const MAX_JITTER_MS: u64 = 250;
const MAX_SUFFIX_LEN: usize = 5;
const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum InvalidUrlError {
    #[error("malformed download url: {0}")]
    Malformed(String),
    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),
    #[error("download url has no host")]
    MissingHost,
    #[error("download host is not allowed: {0}")]
    HostNotAllowed(String),
}

#[derive(Debug, Error)]
pub(crate) enum DownloadError {
    #[error("download failed with status {0}")]
    Status(StatusCode),
    #[error("download failed after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error("document exceeds the {limit_bytes} byte limit")]
    TooLarge { limit_bytes: u64 },
    #[error("downloaded document is empty")]
    Empty,
    #[error("redirect rejected: {0}")]
    RedirectRejected(String),
    #[error("failed to write temporary file: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub(crate) enum FetchError {
    #[error(transparent)]
    InvalidUrl(#[from] InvalidUrlError),
    #[error(transparent)]
    Download(#[from] DownloadError),
}

/// A downloaded document. The backing file is removed when this value is dropped.
#[derive(Debug)]
pub(crate) struct FetchedDocument {
    file: NamedTempFile,
    pub(crate) sha256: String,
    pub(crate) size_bytes: u64,
    pub(crate) extension: Option<String>,
}

impl FetchedDocument {
    pub(crate) fn from_parts(
        file: NamedTempFile,
        sha256: String,
        size_bytes: u64,
        extension: Option<String>,
    ) -> Self {
        Self { file, sha256, size_bytes, extension }
    }

    pub(crate) fn path(&self) -> &Path {
        self.file.path()
    }

    /// Removes the backing file now, logging instead of failing if that is not possible.
    pub(crate) fn close(self) {
        let path = self.file.path().display().to_string();
        if let Err(err) = self.file.close() {
            tracing::warn!(path = %path, error = %err, "Failed to remove temporary document");
        }
    }
}

#[async_trait]
pub(crate) trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, url: &str, scope: &str) -> Result<FetchedDocument, FetchError>;
}

#[derive(Debug, Clone)]
pub(crate) struct FileFetcher {
    client: Client,
    allowed_hosts: Vec<String>,
    max_retries: u32,
    max_size_bytes: u64,
    backoff_base: Duration,
}

impl FileFetcher {
    pub(crate) fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let mut allowed_hosts = settings.fetch().allowed_hosts.clone();
        if let Some(host) = settings.storage_host() {
            allowed_hosts.push(host);
        }

        Self::new(
            allowed_hosts,
            Duration::from_secs(settings.fetch().timeout_seconds),
            settings.fetch().max_retries,
            settings.fetch().max_size_mb * 1024 * 1024,
        )
    }

    pub(crate) fn new(
        allowed_hosts: Vec<String>,
        timeout: Duration,
        max_retries: u32,
        max_size_bytes: u64,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10).min(timeout))
            .timeout(timeout)
            .redirect(redirect_policy(allowed_hosts.clone()))
            .build()
            .map_err(|err| anyhow::anyhow!(err).context("Failed to build download HTTP client"))?;

        Ok(Self { client, allowed_hosts, max_retries, max_size_bytes, backoff_base: BACKOFF_BASE })
    }

    pub(crate) fn validate_download_url(&self, raw: &str) -> Result<Url, InvalidUrlError> {
        validate_download_url(raw, &self.allowed_hosts)
    }

    async fn download_once(
        &self,
        url: &Url,
        scope: &str,
    ) -> Result<FetchedDocument, AttemptError> {
        let mut response =
            self.client.get(url.clone()).send().await.map_err(AttemptError::from_transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(if is_retryable_status(status) {
                AttemptError::Transient(format!("status {status}"))
            } else {
                AttemptError::Fatal(DownloadError::Status(status))
            });
        }

        if response.content_length().is_some_and(|length| length > self.max_size_bytes) {
            return Err(AttemptError::Fatal(DownloadError::TooLarge {
                limit_bytes: self.max_size_bytes,
            }));
        }

        let extension = url_extension(url);
        let mut builder = tempfile::Builder::new();
        let prefix = format!("insightgrader-{}-", sanitize_scope(scope));
        let suffix = extension.as_ref().map(|ext| format!(".{ext}")).unwrap_or_default();
        builder.prefix(&prefix).suffix(&suffix);
        let mut file = builder.tempfile().map_err(|err| AttemptError::Fatal(err.into()))?;

        let mut hasher = Sha256::new();
        let mut size_bytes: u64 = 0;
        while let Some(chunk) = response.chunk().await.map_err(AttemptError::from_transport)? {
            size_bytes += chunk.len() as u64;
            if size_bytes > self.max_size_bytes {
                return Err(AttemptError::Fatal(DownloadError::TooLarge {
                    limit_bytes: self.max_size_bytes,
                }));
            }
            hasher.update(&chunk);
            file.write_all(&chunk).map_err(|err| AttemptError::Fatal(err.into()))?;
        }
        file.flush().map_err(|err| AttemptError::Fatal(err.into()))?;

        if size_bytes == 0 {
            return Err(AttemptError::Fatal(DownloadError::Empty));
        }

        Ok(FetchedDocument::from_parts(file, hex::encode(hasher.finalize()), size_bytes, extension))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0..=MAX_JITTER_MS);
        self.backoff_base * 2_u32.pow(attempt) + Duration::from_millis(jitter)
    }
}

#[async_trait]
impl DocumentFetcher for FileFetcher {
    async fn fetch(&self, raw_url: &str, scope: &str) -> Result<FetchedDocument, FetchError> {
        let url = self.validate_download_url(raw_url)?;
        let host = url.host_str().unwrap_or_default().to_string();

        let mut last_error = String::new();
        for attempt in 0..=self.max_retries {
            match self.download_once(&url, scope).await {
                Ok(document) => {
                    tracing::debug!(
                        scope = %scope,
                        host = %host,
                        size_bytes = document.size_bytes,
                        attempt,
                        "Document downloaded"
                    );
                    return Ok(document);
                }
                Err(AttemptError::Fatal(err)) => return Err(err.into()),
                Err(AttemptError::Transient(message)) => {
                    tracing::warn!(
                        scope = %scope,
                        host = %host,
                        attempt,
                        error = %message,
                        "Transient download failure"
                    );
                    last_error = message;
                }
            }

            if attempt < self.max_retries {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        Err(DownloadError::RetriesExhausted { attempts: self.max_retries + 1, last_error }.into())
    }
}

enum AttemptError {
    Transient(String),
    Fatal(DownloadError),
}

impl AttemptError {
    fn from_transport(err: reqwest::Error) -> Self {
        if err.is_redirect() {
            return Self::Fatal(DownloadError::RedirectRejected(err.to_string()));
        }
        Self::Transient(err.to_string())
    }
}

/// Every redirect hop must pass the same scheme and host policy as the first request.
fn redirect_policy(allowed_hosts: Vec<String>) -> redirect::Policy {
    redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error(format!("more than {MAX_REDIRECTS} redirects"));
        }
        match validate_download_url(attempt.url().as_str(), &allowed_hosts) {
            Ok(_) => attempt.follow(),
            Err(err) => attempt.error(err),
        }
    })
}

fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

/// Accepts `http`/`https` URLs whose host is an allowed host or a subdomain of one.
pub(crate) fn validate_download_url(
    raw: &str,
    allowed_hosts: &[String],
) -> Result<Url, InvalidUrlError> {
    let url = Url::parse(raw.trim()).map_err(|err| InvalidUrlError::Malformed(err.to_string()))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(InvalidUrlError::UnsupportedScheme(url.scheme().to_string()));
    }

    let host = url
        .host_str()
        .map(|host| host.trim_end_matches('.').to_ascii_lowercase())
        .filter(|host| !host.is_empty())
        .ok_or(InvalidUrlError::MissingHost)?;

    let allowed = allowed_hosts.iter().any(|allowed| {
        host == *allowed
            || host.strip_suffix(allowed.as_str()).is_some_and(|prefix| prefix.ends_with('.'))
    });
    if !allowed {
        return Err(InvalidUrlError::HostNotAllowed(host));
    }

    Ok(url)
}

fn url_extension(url: &Url) -> Option<String> {
    let name = url.path_segments()?.last()?;
    let (_, ext) = name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    let valid = !ext.is_empty()
        && ext.len() <= MAX_SUFFIX_LEN
        && ext.chars().all(|ch| ch.is_ascii_alphanumeric());
    valid.then_some(ext)
}

fn sanitize_scope(scope: &str) -> String {
    let cleaned: String = scope
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '-' || *ch == '_')
        .take(32)
        .collect();
    if cleaned.is_empty() {
        "doc".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{extract::State, http::StatusCode, response::Redirect, routing::get, Router};

    use super::*;
    use crate::test_support;

    fn fetcher(allowed: &[&str], max_retries: u32) -> FileFetcher {
        let mut fetcher = FileFetcher::new(
            allowed.iter().map(|host| host.to_string()).collect(),
            Duration::from_secs(5),
            max_retries,
            1024,
        )
        .expect("fetcher");
        fetcher.backoff_base = Duration::from_millis(1);
        fetcher
    }

    fn hosts(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn rejects_non_http_schemes() {
        let allowed = hosts(&["storage.test.local"]);
        let err = validate_download_url("ftp://storage.test.local/a.jpeg", &allowed)
            .expect_err("ftp");
        assert_eq!(err, InvalidUrlError::UnsupportedScheme("ftp".to_string()));

        let err = validate_download_url("file:///etc/passwd", &hosts(&["storage.test.local"]))
            .expect_err("file");
        assert_eq!(err, InvalidUrlError::UnsupportedScheme("file".to_string()));
    }

    #[test]
    fn host_policy_accepts_exact_and_subdomains_only() {
        let allowed = hosts(&["storage.test.local"]);

        assert!(validate_download_url("https://storage.test.local/a.pdf", &allowed).is_ok());
        assert!(validate_download_url("https://bucket.storage.test.local/a.pdf", &allowed).is_ok());
        assert!(validate_download_url("https://STORAGE.test.local./a.pdf", &allowed).is_ok());

        assert_eq!(
            validate_download_url("https://evilstorage.test.local/a.pdf", &allowed),
            Err(InvalidUrlError::HostNotAllowed("evilstorage.test.local".to_string()))
        );
        assert!(matches!(
            validate_download_url("https://storage.test.local.evil.com/a.pdf", &allowed),
            Err(InvalidUrlError::HostNotAllowed(_))
        ));
        assert!(matches!(
            validate_download_url("not a url", &allowed),
            Err(InvalidUrlError::Malformed(_))
        ));
    }

    #[test]
    fn extension_comes_from_last_path_segment() {
        let url = Url::parse("https://h/exams/exam1.JPEG?X-Amz-Expires=300").expect("url");
        assert_eq!(url_extension(&url).as_deref(), Some("jpeg"));

        let url = Url::parse("https://h/exams/noext").expect("url");
        assert_eq!(url_extension(&url), None);
    }

    #[tokio::test]
    async fn invalid_url_is_rejected_without_network_call() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/exam1.jpeg",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    "data"
                }),
            )
            .with_state(hits.clone());
        let addr = test_support::spawn_server(app).await;

        let fetcher = fetcher(&["127.0.0.1"], 0);
        let mismatched = format!("http://localhost:{}/exam1.jpeg", addr.port());
        let err = fetcher.fetch(&mismatched, "1").await.expect_err("host mismatch");
        assert!(matches!(err, FetchError::InvalidUrl(InvalidUrlError::HostNotAllowed(_))));

        let err = fetcher.fetch("ftp://127.0.0.1/exam1.jpeg", "1").await.expect_err("ftp");
        assert!(matches!(err, FetchError::InvalidUrl(InvalidUrlError::UnsupportedScheme(_))));

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn downloads_into_scoped_temp_file_removed_on_drop() {
        let app = Router::new().route("/exams/exam1.jpeg", get(|| async { "jpeg-bytes" }));
        let addr = test_support::spawn_server(app).await;

        let fetcher = fetcher(&["127.0.0.1"], 0);
        let url = format!("http://{addr}/exams/exam1.jpeg");
        let document = fetcher.fetch(&url, "sub-42").await.expect("download");

        let path = document.path().to_path_buf();
        let name = path.file_name().and_then(|name| name.to_str()).expect("file name");
        assert!(name.starts_with("insightgrader-sub-42-"));
        assert!(name.ends_with(".jpeg"));
        assert_eq!(std::fs::read(&path).expect("read"), b"jpeg-bytes");
        assert_eq!(document.size_bytes, 10);
        assert_eq!(document.sha256, hex::encode(Sha256::digest(b"jpeg-bytes")));

        drop(document);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/doc.pdf",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    if hits.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(StatusCode::SERVICE_UNAVAILABLE)
                    } else {
                        Ok("%PDF-1.4")
                    }
                }),
            )
            .with_state(hits.clone());
        let addr = test_support::spawn_server(app).await;

        let fetcher = fetcher(&["127.0.0.1"], 3);
        let document =
            fetcher.fetch(&format!("http://{addr}/doc.pdf"), "7").await.expect("download");
        assert_eq!(document.size_bytes, 8);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_and_client_errors_fail() {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/down.png",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    StatusCode::BAD_GATEWAY
                }),
            )
            .route("/missing.png", get(|| async { StatusCode::FORBIDDEN }))
            .route("/big.png", get(|| async { vec![0_u8; 4096] }))
            .with_state(hits.clone());
        let addr = test_support::spawn_server(app).await;
        let fetcher = fetcher(&["127.0.0.1"], 2);

        let err = fetcher.fetch(&format!("http://{addr}/down.png"), "1").await.expect_err("5xx");
        assert!(matches!(
            err,
            FetchError::Download(DownloadError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        let err =
            fetcher.fetch(&format!("http://{addr}/missing.png"), "1").await.expect_err("403");
        assert!(matches!(err, FetchError::Download(DownloadError::Status(StatusCode::FORBIDDEN))));

        let err = fetcher.fetch(&format!("http://{addr}/big.png"), "1").await.expect_err("size");
        assert!(matches!(err, FetchError::Download(DownloadError::TooLarge { limit_bytes: 1024 })));
    }

    #[tokio::test]
    async fn redirects_must_stay_on_allowed_hosts() {
        let hits = Arc::new(AtomicUsize::new(0));
        let target = Router::new()
            .route(
                "/secret.jpeg",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    "secret"
                }),
            )
            .route("/ok.jpeg", get(|| async { "jpeg-bytes" }))
            .with_state(hits.clone());
        let target_port = test_support::spawn_server(target).await.port();

        let origin = Router::new()
            .route(
                "/exam1.jpeg",
                get(move || async move {
                    Redirect::temporary(&format!("http://localhost:{target_port}/secret.jpeg"))
                }),
            )
            .route(
                "/exam2.jpeg",
                get(move || async move {
                    Redirect::temporary(&format!("http://127.0.0.1:{target_port}/ok.jpeg"))
                }),
            )
            .route("/loop.jpeg", get(|| async { Redirect::temporary("/loop.jpeg") }));
        let addr = test_support::spawn_server(origin).await;
        let fetcher = fetcher(&["127.0.0.1"], 2);

        let err = fetcher
            .fetch(&format!("http://{addr}/exam1.jpeg"), "1")
            .await
            .expect_err("off-list redirect");
        assert!(matches!(err, FetchError::Download(DownloadError::RedirectRejected(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let err = fetcher
            .fetch(&format!("http://{addr}/loop.jpeg"), "1")
            .await
            .expect_err("redirect loop");
        assert!(matches!(err, FetchError::Download(DownloadError::RedirectRejected(_))));

        let document =
            fetcher.fetch(&format!("http://{addr}/exam2.jpeg"), "1").await.expect("download");
        assert_eq!(document.size_bytes, 10);
    }
}
