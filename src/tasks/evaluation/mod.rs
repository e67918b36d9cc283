mod batch;
mod pipeline;

pub(crate) use batch::BatchEvaluator;
#[cfg(test)]
pub(crate) use pipeline::Collaborators;
pub(crate) use pipeline::{EvaluationContext, SubmissionJob, SubmissionSource};
