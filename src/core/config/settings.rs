use super::parsing::{
    env_first, env_optional, env_or_default, parse_bool, parse_cors_origins, parse_environment,
    parse_f64, parse_host_list, parse_malformed_policy, parse_u32, parse_u64, parse_usize,
};
use super::types::{
    AiSettings, ApiSettings, ConfigError, CorsSettings, EvaluationSettings, FetchSettings,
    OcrSettings, RuntimeSettings, S3Settings, ServerHost, ServerPort, ServerSettings, Settings,
    TelemetrySettings,
};

const MAX_RETRY_CEILING: u32 = 10;
const MAX_CONCURRENCY: usize = 256;
const MAX_DOWNLOAD_SIZE_MB: u64 = 1024;

impl Settings {
    pub(crate) fn load() -> Result<Self, ConfigError> {
        let host = env_or_default("INSIGHTGRADER_HOST", "0.0.0.0");
        let port = env_or_default("INSIGHTGRADER_PORT", "8000");

        let environment = parse_environment(env_first(&["INSIGHTGRADER_ENV", "ENVIRONMENT"]));

        let project_name = env_or_default("PROJECT_NAME", "InsightGrader API");
        let version = env_or_default("VERSION", env!("CARGO_PKG_VERSION"));

        let cors_origins = parse_cors_origins(env_optional("BACKEND_CORS_ORIGINS"))?;

        let google_api_key = env_or_default("GOOGLE_API_KEY", "");
        let gemini_base_url = env_or_default(
            "GEMINI_BASE_URL",
            "https://generativelanguage.googleapis.com/v1beta",
        );
        let model = env_or_default("GOOGLE_MODEL_NAME", "gemini-2.0-flash-lite");
        let max_output_tokens =
            parse_u32("AI_MAX_OUTPUT_TOKENS", env_or_default("AI_MAX_OUTPUT_TOKENS", "8192"))?;
        let temperature = parse_f64("AI_TEMPERATURE", env_or_default("AI_TEMPERATURE", "0.2"))?;
        let ai_request_timeout =
            parse_u64("AI_REQUEST_TIMEOUT", env_or_default("AI_REQUEST_TIMEOUT", "120"))?;
        let ai_max_retries = parse_u32("AI_MAX_RETRIES", env_or_default("AI_MAX_RETRIES", "2"))?;
        let malformed_policy = parse_malformed_policy(env_optional("MALFORMED_SCORE_POLICY"))?;

        let vision_api_key =
            env_optional("VISION_API_KEY").unwrap_or_else(|| google_api_key.clone());
        let vision_base_url = env_or_default("VISION_BASE_URL", "https://vision.googleapis.com/v1");
        let ocr_timeout_seconds =
            parse_u64("OCR_TIMEOUT_SECONDS", env_or_default("OCR_TIMEOUT_SECONDS", "60"))?;
        let ocr_max_pdf_pages =
            parse_u32("OCR_MAX_PDF_PAGES", env_or_default("OCR_MAX_PDF_PAGES", "20"))?;

        let s3_endpoint = env_first(&["S3_ENDPOINT", "URL_R2"]).unwrap_or_default();
        let s3_access_key = env_first(&["S3_ACCESS_KEY", "ACCESS_KEY_ID"]).unwrap_or_default();
        let s3_secret_key = env_first(&["S3_SECRET_KEY", "SECRET_ACCESS_KEY"]).unwrap_or_default();
        let s3_bucket =
            env_first(&["S3_BUCKET", "BUCKET_NAME"]).unwrap_or_else(|| "insightgradertests".into());
        let s3_region = env_or_default("S3_REGION", "auto");

        let allowed_hosts = parse_host_list(env_optional("ALLOWED_DOWNLOAD_HOSTS"));
        let download_timeout_seconds = parse_u64(
            "DOWNLOAD_TIMEOUT_SECONDS",
            env_or_default("DOWNLOAD_TIMEOUT_SECONDS", "30"),
        )?;
        let download_max_retries =
            parse_u32("DOWNLOAD_MAX_RETRIES", env_or_default("DOWNLOAD_MAX_RETRIES", "3"))?;
        let download_max_size_mb =
            parse_u64("DOWNLOAD_MAX_SIZE_MB", env_or_default("DOWNLOAD_MAX_SIZE_MB", "20"))?;

        let concurrency =
            parse_usize("BATCH_CONCURRENCY", env_or_default("BATCH_CONCURRENCY", "4"))?;
        let batch_timeout_seconds =
            parse_u64("BATCH_TIMEOUT_SECONDS", env_or_default("BATCH_TIMEOUT_SECONDS", "300"))?;
        let max_batch_size =
            parse_usize("MAX_BATCH_SIZE", env_or_default("MAX_BATCH_SIZE", "100"))?;

        let log_level = env_or_default("INSIGHTGRADER_LOG_LEVEL", "info");
        let json = env_optional("INSIGHTGRADER_LOG_JSON")
            .map(|value| parse_bool(&value))
            .unwrap_or(false);
        let prometheus_enabled =
            env_optional("PROMETHEUS_ENABLED").map(|value| parse_bool(&value)).unwrap_or(false);

        let settings = Self {
            server: ServerSettings {
                host: ServerHost::parse(host)?,
                port: ServerPort::parse(port)?,
            },
            runtime: RuntimeSettings { environment },
            api: ApiSettings { project_name, version },
            cors: CorsSettings { origins: cors_origins },
            ai: AiSettings {
                google_api_key,
                gemini_base_url,
                model,
                max_output_tokens,
                temperature,
                request_timeout: ai_request_timeout,
                max_retries: ai_max_retries,
                malformed_policy,
            },
            ocr: OcrSettings {
                api_key: vision_api_key,
                base_url: vision_base_url,
                timeout_seconds: ocr_timeout_seconds,
                max_pdf_pages: ocr_max_pdf_pages,
            },
            s3: S3Settings {
                endpoint: s3_endpoint,
                access_key: s3_access_key,
                secret_key: s3_secret_key,
                bucket: s3_bucket,
                region: s3_region,
            },
            fetch: FetchSettings {
                allowed_hosts,
                timeout_seconds: download_timeout_seconds,
                max_retries: download_max_retries,
                max_size_mb: download_max_size_mb,
            },
            evaluation: EvaluationSettings { concurrency, batch_timeout_seconds, max_batch_size },
            telemetry: TelemetrySettings { log_level, json, prometheus_enabled },
        };

        settings.validate()?;
        Ok(settings)
    }

    pub(crate) fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host.0, self.server.port.0)
    }

    pub(crate) fn server_host(&self) -> &str {
        &self.server.host.0
    }

    pub(crate) fn server_port(&self) -> u16 {
        self.server.port.0
    }

    pub(crate) fn api(&self) -> &ApiSettings {
        &self.api
    }

    pub(crate) fn cors(&self) -> &CorsSettings {
        &self.cors
    }

    pub(crate) fn ai(&self) -> &AiSettings {
        &self.ai
    }

    pub(crate) fn ocr(&self) -> &OcrSettings {
        &self.ocr
    }

    pub(crate) fn s3(&self) -> &S3Settings {
        &self.s3
    }

    pub(crate) fn fetch(&self) -> &FetchSettings {
        &self.fetch
    }

    pub(crate) fn evaluation(&self) -> &EvaluationSettings {
        &self.evaluation
    }

    pub(crate) fn telemetry(&self) -> &TelemetrySettings {
        &self.telemetry
    }

    pub(crate) fn runtime(&self) -> &RuntimeSettings {
        &self.runtime
    }

    /// Host of the object storage endpoint. Signed URLs point at it or at a subdomain of it.
    pub(crate) fn storage_host(&self) -> Option<String> {
        reqwest::Url::parse(&self.s3.endpoint)
            .ok()
            .and_then(|url| url.host_str().map(|host| host.to_ascii_lowercase()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ai.google_api_key.is_empty() {
            return Err(ConfigError::MissingSecret("GOOGLE_API_KEY"));
        }
        if self.ocr.api_key.is_empty() {
            return Err(ConfigError::MissingSecret("VISION_API_KEY"));
        }
        if self.s3.endpoint.is_empty() {
            return Err(ConfigError::MissingSecret("S3_ENDPOINT"));
        }
        if self.s3.access_key.is_empty() || self.s3.secret_key.is_empty() {
            return Err(ConfigError::MissingSecret("S3_ACCESS_KEY/S3_SECRET_KEY"));
        }

        let endpoint_ok = reqwest::Url::parse(&self.s3.endpoint)
            .map(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
            .unwrap_or(false);
        if !endpoint_ok {
            return Err(ConfigError::InvalidValue {
                field: "S3_ENDPOINT",
                value: self.s3.endpoint.clone(),
            });
        }

        for (field, value) in [
            ("GEMINI_BASE_URL", &self.ai.gemini_base_url),
            ("VISION_BASE_URL", &self.ocr.base_url),
        ] {
            if reqwest::Url::parse(value).is_err() {
                return Err(ConfigError::InvalidValue { field, value: value.clone() });
            }
        }

        if !(0.0..=2.0).contains(&self.ai.temperature) {
            return Err(ConfigError::InvalidValue {
                field: "AI_TEMPERATURE",
                value: self.ai.temperature.to_string(),
            });
        }

        if self.ai.max_retries > MAX_RETRY_CEILING {
            return Err(ConfigError::InvalidValue {
                field: "AI_MAX_RETRIES",
                value: self.ai.max_retries.to_string(),
            });
        }

        if self.fetch.max_retries > MAX_RETRY_CEILING {
            return Err(ConfigError::InvalidValue {
                field: "DOWNLOAD_MAX_RETRIES",
                value: self.fetch.max_retries.to_string(),
            });
        }

        for (field, value) in [
            ("AI_REQUEST_TIMEOUT", self.ai.request_timeout),
            ("OCR_TIMEOUT_SECONDS", self.ocr.timeout_seconds),
            ("DOWNLOAD_TIMEOUT_SECONDS", self.fetch.timeout_seconds),
            ("DOWNLOAD_MAX_SIZE_MB", self.fetch.max_size_mb),
            ("BATCH_TIMEOUT_SECONDS", self.evaluation.batch_timeout_seconds),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue { field, value: "0".to_string() });
            }
        }

        if self.fetch.max_size_mb > MAX_DOWNLOAD_SIZE_MB {
            return Err(ConfigError::InvalidValue {
                field: "DOWNLOAD_MAX_SIZE_MB",
                value: self.fetch.max_size_mb.to_string(),
            });
        }

        if self.ocr.max_pdf_pages == 0 {
            return Err(ConfigError::InvalidValue {
                field: "OCR_MAX_PDF_PAGES",
                value: "0".to_string(),
            });
        }

        if !(1..=MAX_CONCURRENCY).contains(&self.evaluation.concurrency) {
            return Err(ConfigError::InvalidValue {
                field: "BATCH_CONCURRENCY",
                value: self.evaluation.concurrency.to_string(),
            });
        }

        if self.evaluation.max_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "MAX_BATCH_SIZE",
                value: "0".to_string(),
            });
        }

        Ok(())
    }
}
