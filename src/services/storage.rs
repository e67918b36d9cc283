use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client;
use std::time::Duration;
use thiserror::Error;

use crate::core::config::Settings;

/// Lifetime of every download URL handed to the fetcher.
pub(crate) const SIGNED_URL_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub(crate) enum SigningError {
    #[error("storage is not configured: {0}")]
    Configuration(String),
    #[error("storage rejected key {key:?}: {message}")]
    Rejected { key: String, message: String },
}

#[async_trait]
pub(crate) trait SignedUrlProvider: Send + Sync {
    async fn signed_url(&self, key: &str) -> Result<String, SigningError>;
}

#[derive(Debug, Clone)]
pub(crate) struct StorageService {
    client: Client,
    bucket: String,
}

impl StorageService {
    pub(crate) async fn from_settings(settings: &Settings) -> Result<Self, SigningError> {
        let s3 = settings.s3();
        if s3.access_key.is_empty() || s3.secret_key.is_empty() {
            return Err(SigningError::Configuration("missing access key or secret".to_string()));
        }
        if s3.bucket.is_empty() {
            return Err(SigningError::Configuration("missing bucket name".to_string()));
        }

        let creds = Credentials::new(
            s3.access_key.clone(),
            s3.secret_key.clone(),
            None,
            None,
            "insightgrader-static",
        );

        let config = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(s3.endpoint.clone())
            .region(aws_config::Region::new(s3.region.clone()))
            .credentials_provider(creds)
            .load()
            .await;

        let client = Client::new(&config);

        Ok(Self { client, bucket: s3.bucket.clone() })
    }

    pub(crate) async fn presign_get(
        &self,
        key: &str,
        expires_in: Duration,
    ) -> Result<String, SigningError> {
        let config = PresigningConfig::expires_in(expires_in)
            .map_err(|err| SigningError::Configuration(err.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|err| SigningError::Rejected {
                key: key.to_string(),
                message: err.to_string(),
            })?;

        Ok(presigned.uri().to_string())
    }
}

#[async_trait]
impl SignedUrlProvider for StorageService {
    async fn signed_url(&self, key: &str) -> Result<String, SigningError> {
        let key = key.trim().trim_start_matches('/');
        if key.is_empty() {
            return Err(SigningError::Rejected {
                key: key.to_string(),
                message: "empty object key".to_string(),
            });
        }

        let url = self.presign_get(key, SIGNED_URL_TTL).await?;
        tracing::debug!(key = %key, ttl_seconds = SIGNED_URL_TTL.as_secs(), "Issued signed URL");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::{SignedUrlProvider, SigningError, StorageService};
    use crate::core::config::Settings;
    use crate::test_support;

    #[tokio::test]
    async fn signed_url_points_at_key_and_expires_in_five_minutes() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();

        let settings = Settings::load().expect("settings");
        let storage = StorageService::from_settings(&settings).await.expect("storage");

        let url = storage.signed_url("exams/exam1.jpeg").await.expect("signed url");

        let parsed = reqwest::Url::parse(&url).expect("url");
        assert!(parsed.host_str().expect("host").ends_with("storage.test.local"));
        assert!(url.contains("exam1.jpeg"));
        assert!(url.contains("X-Amz-Expires=300"));
    }

    #[tokio::test]
    async fn empty_key_is_rejected_without_signing() {
        let _guard = test_support::env_lock().await;
        test_support::set_test_env();

        let settings = Settings::load().expect("settings");
        let storage = StorageService::from_settings(&settings).await.expect("storage");

        let err = storage.signed_url("  ").await.expect_err("empty key");
        assert!(matches!(err, SigningError::Rejected { .. }));
    }
}
