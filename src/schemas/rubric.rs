use std::collections::HashSet;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use thiserror::Error;

use crate::schemas::evaluation::ExternalId;

const DEFAULT_POINTS: f64 = 1.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum RubricMode {
    #[default]
    Simple,
    Advanced,
}

impl RubricMode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Advanced => "advanced",
        }
    }
}

/// Rubric as it arrives on the wire. Converted into a validated [`Rubric`] before use.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RubricPayload {
    #[serde(default)]
    pub(crate) id: Option<ExternalId>,
    #[serde(default)]
    pub(crate) name: Option<String>,
    #[serde(default)]
    pub(crate) mode: RubricMode,
    #[serde(default, alias = "criteria")]
    pub(crate) questions: Vec<QuestionPayload>,
    #[serde(default, alias = "description")]
    pub(crate) instructions: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct QuestionPayload {
    #[serde(default)]
    pub(crate) id: Option<ExternalId>,
    #[serde(default, alias = "question", alias = "text")]
    pub(crate) description: Option<String>,
    #[serde(
        default,
        alias = "weight",
        alias = "max_points",
        alias = "max_score",
        deserialize_with = "lenient_points"
    )]
    pub(crate) points: Option<f64>,
    #[serde(default, alias = "answer", alias = "correct_answer")]
    pub(crate) expected_answer: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Criterion {
    pub(crate) key: String,
    pub(crate) description: String,
    pub(crate) points: f64,
    pub(crate) expected_answer: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SimpleRubric {
    pub(crate) id: Option<ExternalId>,
    pub(crate) name: Option<String>,
    pub(crate) instructions: Option<String>,
    /// Questions are context for the holistic judgement, not scored one by one.
    pub(crate) questions: Vec<Criterion>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AdvancedRubric {
    pub(crate) id: Option<ExternalId>,
    pub(crate) name: Option<String>,
    pub(crate) instructions: Option<String>,
    pub(crate) criteria: Vec<Criterion>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Rubric {
    Simple(SimpleRubric),
    Advanced(AdvancedRubric),
}

#[derive(Debug, Error, PartialEq)]
pub(crate) enum RubricError {
    #[error("advanced rubric requires at least one question")]
    NoCriteria,
    #[error("question {0} has an empty description")]
    EmptyDescription(String),
    #[error("question {key} has non-positive points: {points}")]
    InvalidPoints { key: String, points: f64 },
    #[error("duplicate question id: {0}")]
    DuplicateKey(String),
}

impl RubricPayload {
    pub(crate) fn into_rubric(self) -> Result<Rubric, RubricError> {
        let instructions = self.instructions.filter(|value| !value.trim().is_empty());

        match self.mode {
            RubricMode::Simple => {
                let questions = self
                    .questions
                    .into_iter()
                    .enumerate()
                    .filter_map(|(index, question)| question.into_criterion(index).ok())
                    .collect();
                Ok(Rubric::Simple(SimpleRubric {
                    id: self.id,
                    name: self.name,
                    instructions,
                    questions,
                }))
            }
            RubricMode::Advanced => {
                if self.questions.is_empty() {
                    return Err(RubricError::NoCriteria);
                }

                let mut seen = HashSet::new();
                let mut criteria = Vec::with_capacity(self.questions.len());
                for (index, question) in self.questions.into_iter().enumerate() {
                    let criterion = question.into_criterion(index)?;
                    if !seen.insert(criterion.key.clone()) {
                        return Err(RubricError::DuplicateKey(criterion.key));
                    }
                    criteria.push(criterion);
                }

                Ok(Rubric::Advanced(AdvancedRubric {
                    id: self.id,
                    name: self.name,
                    instructions,
                    criteria,
                }))
            }
        }
    }
}

impl QuestionPayload {
    fn into_criterion(self, index: usize) -> Result<Criterion, RubricError> {
        let key = match self.id {
            Some(id) => id.to_string(),
            None => format!("Q{}", index + 1),
        };

        let description =
            self.description.map(|value| value.trim().to_string()).unwrap_or_default();
        if description.is_empty() {
            return Err(RubricError::EmptyDescription(key));
        }

        let points = self.points.unwrap_or(DEFAULT_POINTS);
        if !(points.is_finite() && points > 0.0) {
            return Err(RubricError::InvalidPoints { key, points });
        }

        Ok(Criterion {
            key,
            description,
            points,
            expected_answer: self.expected_answer.filter(|value| !value.trim().is_empty()),
        })
    }
}

impl Rubric {
    pub(crate) fn id(&self) -> Option<&ExternalId> {
        match self {
            Self::Simple(rubric) => rubric.id.as_ref(),
            Self::Advanced(rubric) => rubric.id.as_ref(),
        }
    }

    pub(crate) fn name(&self) -> Option<&str> {
        match self {
            Self::Simple(rubric) => rubric.name.as_deref(),
            Self::Advanced(rubric) => rubric.name.as_deref(),
        }
    }

    pub(crate) fn mode(&self) -> RubricMode {
        match self {
            Self::Simple(_) => RubricMode::Simple,
            Self::Advanced(_) => RubricMode::Advanced,
        }
    }
}

fn lenient_points<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(f64),
        Text(String),
    }

    match Option::<NumberOrText>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrText::Number(value)) => Ok(Some(value)),
        Some(NumberOrText::Text(raw)) if raw.trim().is_empty() => Ok(None),
        Some(NumberOrText::Text(raw)) => raw
            .trim()
            .replace(',', ".")
            .parse::<f64>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("invalid points: {raw}"))),
    }
}
