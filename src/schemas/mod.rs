use serde::Serialize;

pub(crate) mod evaluation;
pub(crate) mod rubric;

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: String,
    pub(crate) version: String,
    pub(crate) google_api_configured: bool,
    pub(crate) endpoints: Vec<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct RootResponse {
    pub(crate) message: String,
    pub(crate) description: String,
    pub(crate) version: String,
    pub(crate) main_endpoint: String,
    pub(crate) batch_endpoint: String,
}
