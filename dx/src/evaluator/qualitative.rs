//! Qualitative evaluation through an external judge
//!
//! The judge is any async text-in/text-out collaborator. Judge errors and
//! unparseable replies become a failing result, never an error.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, LazyLock};
use taskstore::Task;
use tracing::{debug, warn};

use super::{EvaluationInput, MissingElement, StrategyKind, StrategyResult, clamp_score};

const DEFAULT_RUBRIC: &str = "Does the output fully accomplish the task as described?";

static SCORE_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"(?i)score\s*[:=]\s*([01](?:\.\d+)?)").ok());

/// Scores output against a rubric
#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(&self, prompt: &str) -> eyre::Result<String>;
}

/// Parsed judge reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub score: f64,
    #[serde(default)]
    pub reasoning: String,
}

fn truncate_chars(text: &str, max_chars: usize) -> (&str, bool) {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => (&text[..idx], true),
        None => (text, false),
    }
}

/// Build the judge prompt from task, rubric and output truncated to `max_output_chars`
pub fn build_judge_prompt(task: &Task, output: &str, max_output_chars: usize) -> String {
    let rubric = task
        .evaluation_rubric
        .as_deref()
        .filter(|r| !r.trim().is_empty())
        .unwrap_or(DEFAULT_RUBRIC);
    let (shown, truncated) = truncate_chars(output, max_output_chars);

    let mut prompt = String::new();
    prompt.push_str("You are evaluating the output of an automated task.\n\n");
    prompt.push_str(&format!("## Task\n{}\n", task.title));
    if !task.description.is_empty() {
        prompt.push_str(&format!("\n{}\n", task.description));
    }
    prompt.push_str(&format!("\n## Rubric\n{}\n", rubric));
    prompt.push_str("\n## Output\n");
    prompt.push_str(shown);
    if truncated {
        prompt.push_str("\n[output truncated]");
    }
    prompt.push_str(
        "\n\n## Reply format\nReply with JSON only: {\"score\": <number between 0 and 1>, \"reasoning\": \"<one paragraph>\"}\n",
    );
    prompt
}

fn parse_json(text: &str) -> Option<JudgeVerdict> {
    serde_json::from_str::<JudgeVerdict>(text.trim()).ok()
}

/// Parse a judge reply: whole JSON, then the outermost braces, then a `score:` token
pub fn parse_judge_reply(reply: &str) -> Option<JudgeVerdict> {
    if let Some(verdict) = parse_json(reply) {
        return Some(verdict);
    }

    if let (Some(start), Some(end)) = (reply.find('{'), reply.rfind('}'))
        && start < end
        && let Some(verdict) = parse_json(&reply[start..=end])
    {
        return Some(verdict);
    }

    let score = SCORE_RE.as_ref()?.captures(reply)?.get(1)?.as_str().parse::<f64>().ok()?;
    Some(JudgeVerdict {
        score,
        reasoning: reply.trim().to_string(),
    })
}

/// Runs the judge and turns its reply into a strategy result
#[derive(Clone)]
pub struct QualitativeEvaluator {
    judge: Option<Arc<dyn Judge>>,
    max_output_chars: usize,
}

impl QualitativeEvaluator {
    pub fn new(judge: Option<Arc<dyn Judge>>, max_output_chars: usize) -> Self {
        debug!(has_judge = judge.is_some(), max_output_chars, "QualitativeEvaluator::new: called");
        Self { judge, max_output_chars }
    }

    pub fn has_judge(&self) -> bool {
        self.judge.is_some()
    }

    /// Score the input; passes when the score reaches `min_score`
    pub async fn evaluate(&self, input: &EvaluationInput, min_score: f64) -> StrategyResult {
        debug!(task_id = %input.task.id, min_score, "QualitativeEvaluator::evaluate: called");
        let Some(judge) = &self.judge else {
            let mut result = StrategyResult::new(StrategyKind::Qualitative, false, 0.0);
            result.diagnostics.push("no judge configured".to_string());
            return result;
        };

        let prompt = build_judge_prompt(&input.task, input.content(), self.max_output_chars);
        let (score, note) = match judge.judge(&prompt).await {
            Ok(reply) => match parse_judge_reply(&reply) {
                Some(verdict) => (clamp_score(verdict.score), format!("judge: {}", verdict.reasoning)),
                None => {
                    warn!(task_id = %input.task.id, "Unparsable judge reply, scoring 0");
                    (0.0, "judge reply could not be parsed; scored 0".to_string())
                }
            },
            Err(e) => {
                warn!(task_id = %input.task.id, error = %e, "Judge call failed, scoring 0");
                (0.0, format!("judge call failed: {}; scored 0", e))
            }
        };

        let passed = score >= min_score;
        let mut result = StrategyResult::new(StrategyKind::Qualitative, passed, score);
        result.diagnostics.push(note);
        if !passed {
            result.missing.push(MissingElement::new(
                "rubric",
                format!("raise quality from {:.2} to at least {:.2} against the rubric", score, min_score),
            ));
        }
        result
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Judge returning scripted replies; the last one repeats
    pub struct MockJudge {
        replies: Vec<eyre::Result<String>>,
        call_count: AtomicUsize,
        prompts: Mutex<Vec<String>>,
    }

    impl MockJudge {
        pub fn new(replies: Vec<&str>) -> Self {
            Self {
                replies: replies.into_iter().map(|r| Ok(r.to_string())).collect(),
                call_count: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }

        /// Judge whose every call fails
        pub fn failing() -> Self {
            Self {
                replies: vec![Err(eyre::eyre!("judge unavailable"))],
                call_count: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }

        pub fn prompts(&self) -> Vec<String> {
            self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl Judge for MockJudge {
        async fn judge(&self, prompt: &str) -> eyre::Result<String> {
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut prompts) = self.prompts.lock() {
                prompts.push(prompt.to_string());
            }
            match self.replies.get(idx).or_else(|| self.replies.last()) {
                Some(Ok(reply)) => Ok(reply.clone()),
                Some(Err(e)) => Err(eyre::eyre!("{}", e)),
                None => Err(eyre::eyre!("No more mock replies")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockJudge;
    use super::*;

    #[test]
    fn test_parse_direct_json() {
        let v = parse_judge_reply(r#"{"score": 0.8, "reasoning": "solid"}"#).unwrap();
        assert!((v.score - 0.8).abs() < f64::EPSILON);
        assert_eq!(v.reasoning, "solid");
    }

    #[test]
    fn test_parse_embedded_json() {
        let v = parse_judge_reply("Sure! Here you go:\n```json\n{\"score\": 0.4, \"reasoning\": \"thin\"}\n```").unwrap();
        assert!((v.score - 0.4).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_score_token() {
        let v = parse_judge_reply("I'd say Score: 0.65 overall, mostly fine").unwrap();
        assert!((v.score - 0.65).abs() < f64::EPSILON);
        assert!(parse_judge_reply("score = 1").is_some());
    }

    #[test]
    fn test_score_pattern_compiles_once_and_is_reused() {
        assert!(SCORE_RE.is_some());
        for reply in ["score: 0.2", "SCORE=0.9", "final score : 1.0"] {
            assert!(parse_judge_reply(reply).is_some(), "{}", reply);
        }
        assert!(parse_judge_reply("score: 7").is_none());
    }

    #[test]
    fn test_parse_garbage_is_none() {
        assert!(parse_judge_reply("no idea").is_none());
        assert!(parse_judge_reply("{not json}").is_none());
    }

    #[test]
    fn test_prompt_truncates_output() {
        let task = Task::new("a", "Write a poem").with_rubric("Must rhyme");
        let prompt = build_judge_prompt(&task, &"x".repeat(50), 10);
        assert!(prompt.contains("Must rhyme"));
        assert!(prompt.contains(&"x".repeat(10)));
        assert!(!prompt.contains(&"x".repeat(11)));
        assert!(prompt.contains("[output truncated]"));
    }

    #[tokio::test]
    async fn test_scores_are_clamped() {
        let judge = Arc::new(MockJudge::new(vec![r#"{"score": 7, "reasoning": "wow"}"#]));
        let eval = QualitativeEvaluator::new(Some(judge), 100);
        let input = EvaluationInput::new(Task::new("a", "A").with_rubric("r"), "out", true);
        let result = eval.evaluate(&input, 0.7).await;
        assert!(result.passed);
        assert!((result.score - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_judge_failure_degrades_to_zero() {
        let eval = QualitativeEvaluator::new(Some(Arc::new(MockJudge::failing())), 100);
        let input = EvaluationInput::new(Task::new("a", "A").with_rubric("r"), "out", true);
        let result = eval.evaluate(&input, 0.5).await;
        assert!(!result.passed);
        assert_eq!(result.score, 0.0);
        assert!(result.diagnostics[0].contains("judge call failed"));
    }

    #[tokio::test]
    async fn test_unparsable_reply_degrades_to_zero() {
        let eval = QualitativeEvaluator::new(Some(Arc::new(MockJudge::new(vec!["meh"]))), 100);
        let input = EvaluationInput::new(Task::new("a", "A"), "out", true);
        let result = eval.evaluate(&input, 0.5).await;
        assert_eq!(result.score, 0.0);
        assert!(result.diagnostics[0].contains("could not be parsed"));
    }
}
