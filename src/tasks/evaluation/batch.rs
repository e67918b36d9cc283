use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::Instrument;

use crate::core::config::Settings;
use crate::schemas::evaluation::{EvaluationResult, EvaluationStatus};
use crate::services::file_fetcher::FileFetcher;
use crate::services::rubric_scoring::GeminiScorer;
use crate::services::storage::StorageService;
use crate::services::vision_ocr::VisionOcrService;

use super::pipeline::{
    completed_result, failed_result, run_submission, Collaborators, EvaluationContext,
    EvaluationError, FailureCause, StageTracker, SubmissionJob,
};

/// Runs submissions through the pipeline concurrently and returns results in input order.
#[derive(Clone)]
pub(crate) struct BatchEvaluator {
    collaborators: Collaborators,
    concurrency: usize,
    batch_timeout: Duration,
}

impl BatchEvaluator {
    pub(crate) fn new(
        collaborators: Collaborators,
        concurrency: usize,
        batch_timeout: Duration,
    ) -> Self {
        Self { collaborators, concurrency: concurrency.max(1), batch_timeout }
    }

    pub(crate) async fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let storage = StorageService::from_settings(settings).await?;
        let fetcher = FileFetcher::from_settings(settings)?;
        let extractor = VisionOcrService::from_settings(settings)?;
        let scorer = GeminiScorer::from_settings(settings)?;

        let collaborators = Collaborators {
            signer: Arc::new(storage),
            fetcher: Arc::new(fetcher),
            extractor: Arc::new(extractor),
            scorer: Arc::new(scorer),
        };

        Ok(Self::new(
            collaborators,
            settings.evaluation().concurrency,
            Duration::from_secs(settings.evaluation().batch_timeout_seconds),
        ))
    }

    pub(crate) async fn evaluate(
        &self,
        jobs: Vec<SubmissionJob>,
        context: EvaluationContext,
    ) -> Vec<EvaluationResult> {
        let total = jobs.len();
        let started = Instant::now();
        let deadline = started + self.batch_timeout;
        let context = Arc::new(context);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));

        tracing::info!(
            batch_id = %context.batch_id,
            submissions = total,
            concurrency = self.concurrency,
            "Batch evaluation started"
        );

        let mut handles = Vec::with_capacity(total);
        for (index, job) in jobs.into_iter().enumerate() {
            let tracker = Arc::new(StageTracker::new());
            let span = tracing::info_span!(
                "submission",
                batch_id = %context.batch_id,
                index,
                submission_id = %job.label()
            );

            let task = {
                let collaborators = self.collaborators.clone();
                let context = context.clone();
                let semaphore = semaphore.clone();
                let tracker = tracker.clone();
                let job = job.clone();
                async move {
                    let mut processing_started = None;
                    let outcome = tokio::time::timeout_at(deadline, async {
                        let _permit = semaphore
                            .acquire_owned()
                            .await
                            .map_err(|err| tracker.fail(FailureCause::Aborted(err.to_string())))?;
                        processing_started = Some(Instant::now());
                        run_submission(&collaborators, &context, &job, &tracker).await
                    })
                    .await;

                    let elapsed = processing_started
                        .map(|instant| instant.elapsed().as_secs_f64())
                        .unwrap_or_default();
                    match outcome {
                        Ok(Ok(scored)) => completed_result(&context, &job, scored, elapsed),
                        Ok(Err(err)) => {
                            report_failure(&err);
                            failed_result(&context, &job, &err, elapsed)
                        }
                        Err(_) => {
                            let err = tracker.fail(FailureCause::TimedOut);
                            report_failure(&err);
                            failed_result(&context, &job, &err, elapsed)
                        }
                    }
                }
                .instrument(span.clone())
            };

            handles.push((job, tracker, span, tokio::spawn(task)));
        }

        let mut results = Vec::with_capacity(total);
        for (job, tracker, span, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) => {
                    let err = tracker.fail(FailureCause::Aborted(join_err.to_string()));
                    span.in_scope(|| report_failure(&err));
                    failed_result(&context, &job, &err, 0.0)
                }
            };

            record_metrics(&result);
            results.push(result);
        }

        let failed =
            results.iter().filter(|result| result.status == EvaluationStatus::Failed).count();
        tracing::info!(
            batch_id = %context.batch_id,
            submissions = total,
            completed = total - failed,
            failed,
            duration_seconds = started.elapsed().as_secs_f64(),
            "Batch evaluation finished"
        );

        results
    }
}

fn report_failure(err: &EvaluationError) {
    tracing::error!(stage = err.stage.as_str(), error = %err.cause, "Submission evaluation failed");
}

fn record_metrics(result: &EvaluationResult) {
    metrics::counter!("evaluations_total", "status" => result.status.as_str()).increment(1);
    if let Some(stage) = result.failed_stage {
        metrics::counter!("evaluation_failures_total", "stage" => stage.as_str()).increment(1);
    }
    metrics::histogram!("evaluation_duration_seconds").record(result.processing_time_seconds);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use super::*;
    use crate::schemas::evaluation::{ExternalId, SubmissionStage};
    use crate::tasks::evaluation::SubmissionSource;
    use crate::test_support::{self, FakePipeline, FakeScore};

    fn jobs(keys: &[&str]) -> Vec<SubmissionJob> {
        keys.iter()
            .enumerate()
            .map(|(index, key)| SubmissionJob {
                submission_id: Some(ExternalId::Number(index as i64 + 1)),
                source: Some(SubmissionSource::Key(key.to_string())),
            })
            .collect()
    }

    #[tokio::test]
    async fn one_failing_fetch_does_not_affect_the_rest() {
        let fakes = FakePipeline::new(FakeScore::Overall(8.5)).failing_fetch("missing");
        let evaluator = BatchEvaluator::new(fakes.collaborators(), 2, Duration::from_secs(30));

        let results = evaluator
            .evaluate(
                jobs(&["a.jpeg", "b.jpeg", "missing.jpeg", "d.jpeg", "e.jpeg"]),
                test_support::evaluation_context(),
            )
            .await;

        assert_eq!(results.len(), 5);
        for (index, result) in results.iter().enumerate() {
            assert_eq!(result.submission_id, Some(ExternalId::Number(index as i64 + 1)));
            if index == 2 {
                assert_eq!(result.status, EvaluationStatus::Failed);
                assert_eq!(result.failed_stage, Some(SubmissionStage::Fetching));
                assert_eq!(result.overall_score, 1.0);
            } else {
                assert_eq!(result.status, EvaluationStatus::Completed);
                assert_eq!(result.overall_score, 6.1);
            }
        }
        assert_eq!(fakes.ocr_calls.load(Ordering::SeqCst), 4);
        assert_eq!(fakes.scorer_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn order_is_kept_when_later_submissions_finish_first() {
        let fakes = FakePipeline::new(FakeScore::Overall(5.0))
            .with_fetch_delay("slow", Duration::from_millis(200));
        let evaluator = BatchEvaluator::new(fakes.collaborators(), 4, Duration::from_secs(30));

        let keys = ["slow.jpeg", "fast.jpeg", "fast2.jpeg"];
        let results = evaluator.evaluate(jobs(&keys), test_support::evaluation_context()).await;

        let ids: Vec<_> = results.iter().map(|result| result.submission_id.clone()).collect();
        assert_eq!(
            ids,
            vec![
                Some(ExternalId::Number(1)),
                Some(ExternalId::Number(2)),
                Some(ExternalId::Number(3))
            ]
        );
        assert!(results.iter().all(|result| result.status == EvaluationStatus::Completed));
    }

    #[tokio::test]
    async fn concurrency_limit_is_respected() {
        let fakes = FakePipeline::new(FakeScore::Overall(5.0))
            .with_fetch_delay("doc", Duration::from_millis(30));
        let evaluator = BatchEvaluator::new(fakes.collaborators(), 2, Duration::from_secs(30));

        let keys: Vec<String> = (0..6).map(|index| format!("doc{index}.pdf")).collect();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let results = evaluator.evaluate(jobs(&key_refs), test_support::evaluation_context()).await;

        assert_eq!(results.len(), 6);
        assert!(fakes.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(fakes.fetch_calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn deadline_fails_outstanding_submissions() {
        let fakes = FakePipeline::new(FakeScore::Overall(5.0))
            .with_fetch_delay("hang", Duration::from_secs(60));
        let evaluator = BatchEvaluator::new(fakes.collaborators(), 4, Duration::from_millis(200));

        let results = evaluator
            .evaluate(jobs(&["ok.jpeg", "hang.jpeg"]), test_support::evaluation_context())
            .await;

        assert_eq!(results[0].status, EvaluationStatus::Completed);
        assert_eq!(results[1].status, EvaluationStatus::Failed);
        assert_eq!(results[1].failed_stage, Some(SubmissionStage::Fetching));
        assert_eq!(results[1].error.as_deref(), Some("batch deadline exceeded"));
    }

    #[tokio::test]
    async fn coerced_scores_still_complete() {
        let fakes = FakePipeline::new(FakeScore::Coerced);
        let evaluator = BatchEvaluator::new(fakes.collaborators(), 1, Duration::from_secs(30));

        let results =
            evaluator.evaluate(jobs(&["exam1.jpeg"]), test_support::evaluation_context()).await;

        assert_eq!(results[0].status, EvaluationStatus::Completed);
        assert_eq!(results[0].overall_score, 1.0);
        assert_eq!(results[0].confidence, 0.0);
        assert!(results[0].test_metadata.score_coerced);
    }

    #[tokio::test]
    async fn scorer_failure_is_isolated() {
        let fakes = FakePipeline::new(FakeScore::Error);
        let evaluator = BatchEvaluator::new(fakes.collaborators(), 2, Duration::from_secs(30));

        let results = evaluator
            .evaluate(jobs(&["a.jpeg", "b.jpeg"]), test_support::evaluation_context())
            .await;

        assert!(results.iter().all(|result| result.status == EvaluationStatus::Failed));
        assert!(results
            .iter()
            .all(|result| result.failed_stage == Some(SubmissionStage::Scoring)));
    }

    #[tokio::test]
    async fn empty_batch_returns_no_results() {
        let fakes = FakePipeline::new(FakeScore::Overall(5.0));
        let evaluator = BatchEvaluator::new(fakes.collaborators(), 2, Duration::from_secs(30));

        let results = evaluator.evaluate(Vec::new(), test_support::evaluation_context()).await;
        assert!(results.is_empty());
    }
}
