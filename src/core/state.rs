use std::sync::Arc;

use crate::core::config::Settings;
use crate::tasks::evaluation::BatchEvaluator;

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<InnerState>,
}

struct InnerState {
    settings: Settings,
    evaluator: BatchEvaluator,
}

impl AppState {
    pub(crate) fn new(settings: Settings, evaluator: BatchEvaluator) -> Self {
        Self { inner: Arc::new(InnerState { settings, evaluator }) }
    }

    pub(crate) fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub(crate) fn evaluator(&self) -> &BatchEvaluator {
        &self.inner.evaluator
    }
}
