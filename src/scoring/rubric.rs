//! LLM-judged rubric scoring.
//!
//! Each criterion is judged independently against the task description
//! and the agent's diff. A criterion whose judge call fails is skipped, and
//! the rubric score is the weighted mean over the criteria that scored.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ScoringError;
use crate::llm::{GenerationRequest, LlmProvider, Message};
use crate::trial::types::{CriterionScore, RubricCriterion};

/// Upper bound of the judge's raw scale.
const VERDICT_SCALE: f64 = 10.0;

/// Characters of diff sent to the judge.
const MAX_DIFF_CHARS: usize = 60_000;

/// Characters of task description sent to the judge.
const MAX_DESCRIPTION_CHARS: usize = 8_000;

const JUDGE_SYSTEM_PROMPT: &str = r#"You are a strict senior code reviewer grading a coding agent's work on one criterion.

You receive the task the agent was given, one grading criterion, and the unified diff of everything the agent changed. Judge ONLY the given criterion, using only the evidence in the diff.

Scale:
- 0: criterion not addressed at all, or the diff is unrelated
- 1-3: attempted but mostly wrong or incomplete
- 4-6: partially meets the criterion, with clear gaps
- 7-9: meets the criterion with minor issues
- 10: fully and cleanly meets the criterion

Respond with a single JSON object and nothing else:
{"score": <integer 0-10>, "reasoning": "<one or two sentences>"}"#;

/// A normalized judge verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    /// Score in `[0, 1]`.
    pub score: f64,
    pub reasoning: String,
}

/// Grades one rubric criterion.
#[async_trait]
pub trait RubricJudge: Send + Sync {
    async fn judge(
        &self,
        criterion: &RubricCriterion,
        description: &str,
        diff: &str,
    ) -> Result<Verdict, ScoringError>;
}

/// [`RubricJudge`] backed by a chat-completion model.
pub struct LlmRubricJudge {
    llm: Arc<dyn LlmProvider>,
    model: String,
}

impl LlmRubricJudge {
    /// Creates a judge; an empty model uses the provider's default.
    pub fn new(llm: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }
}

/// Truncates on a char boundary, marking the cut.
fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}\n... [truncated {} bytes]", &s[..end], s.len() - end)
}

fn judge_prompt(criterion: &RubricCriterion, description: &str, diff: &str) -> String {
    format!(
        "## Task\n{description}\n\n## Criterion: {name}\n{criterion}\n\n## Diff\n```diff\n{diff}\n```",
        description = truncate(description, MAX_DESCRIPTION_CHARS),
        name = criterion.name,
        criterion = criterion.description,
        diff = truncate(diff, MAX_DIFF_CHARS),
    )
}

#[async_trait]
impl RubricJudge for LlmRubricJudge {
    async fn judge(
        &self,
        criterion: &RubricCriterion,
        description: &str,
        diff: &str,
    ) -> Result<Verdict, ScoringError> {
        let request = GenerationRequest::new(
            self.model.clone(),
            vec![
                Message::system(JUDGE_SYSTEM_PROMPT),
                Message::user(judge_prompt(criterion, description, diff)),
            ],
        )
        .with_temperature(0.0)
        .with_max_tokens(400);

        let response = self.llm.generate(request).await?;
        let content = response
            .first_content()
            .ok_or_else(|| ScoringError::Verdict("empty judge response".to_string()))?;

        parse_verdict(content)
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    score: f64,
    #[serde(default)]
    reasoning: String,
}

/// Finds the first balanced `{...}` object in `s`, skipping braces inside
/// string literals.
fn extract_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let body = &s[start..];
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in body.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&body[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parses a judge reply into a `[0, 1]` verdict.
///
/// Accepts bare JSON or JSON embedded in prose or a code fence. The raw
/// `0-10` score is divided by 10 and clamped.
pub fn parse_verdict(content: &str) -> Result<Verdict, ScoringError> {
    let raw: RawVerdict = match serde_json::from_str(content.trim()) {
        Ok(v) => v,
        Err(_) => {
            let json = extract_json_object(content).ok_or_else(|| {
                ScoringError::Verdict(truncate(content, 200))
            })?;
            serde_json::from_str(json).map_err(|e| ScoringError::Verdict(e.to_string()))?
        }
    };

    if !raw.score.is_finite() {
        return Err(ScoringError::Verdict(format!("non-finite score {}", raw.score)));
    }

    Ok(Verdict {
        score: (raw.score / VERDICT_SCALE).clamp(0.0, 1.0),
        reasoning: raw.reasoning,
    })
}

/// Judges every criterion once. Failed criteria are logged and left out.
///
/// An empty diff scores 0 on every criterion without calling the judge.
pub async fn run_rubric_judge(
    judge: &dyn RubricJudge,
    rubric: &[RubricCriterion],
    description: &str,
    diff: &str,
) -> Vec<CriterionScore> {
    let mut scores = Vec::with_capacity(rubric.len());

    for criterion in rubric {
        if diff.trim().is_empty() {
            scores.push(CriterionScore {
                name: criterion.name.clone(),
                weight: criterion.weight,
                score: 0.0,
                reasoning: "no changes were made".to_string(),
            });
            continue;
        }

        match judge.judge(criterion, description, diff).await {
            Ok(verdict) => {
                debug!(criterion = %criterion.name, score = verdict.score, "Rubric criterion judged");
                scores.push(CriterionScore {
                    name: criterion.name.clone(),
                    weight: criterion.weight,
                    score: verdict.score,
                    reasoning: verdict.reasoning,
                });
            }
            Err(e) => {
                warn!(criterion = %criterion.name, error = %e, "Rubric criterion skipped");
            }
        }
    }

    scores
}

/// Weighted mean of criterion scores, or `None` when no criterion with a
/// positive weight scored.
pub fn compute_rubric_score(scores: &[CriterionScore]) -> Option<f64> {
    let (weighted, total) = scores
        .iter()
        .filter(|s| s.weight > 0.0)
        .fold((0.0, 0.0), |(acc, w), s| (acc + s.weight * s.score, w + s.weight));

    (total > 0.0).then(|| weighted / total)
}
