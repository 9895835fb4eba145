//! Binary checks
//!
//! Fixed vocabulary, deterministic:
//! - `file_exists:<path>`: a registered file artifact of the task has that path
//! - `artifact_exists:<id>`: an artifact with that id exists in the run
//! - `side_effect:<type>`: the task recorded a side effect of that type
//! - `contains:<substring>`: the evaluated content contains the substring

use tracing::debug;

use super::{EvaluationInput, MissingElement, StrategyKind, StrategyResult};

enum Check<'a> {
    FileExists(&'a str),
    ArtifactExists(&'a str),
    SideEffect(&'a str),
    Contains(&'a str),
    Unknown,
}

fn parse_check(check: &str) -> Check<'_> {
    match check.split_once(':') {
        Some(("file_exists", path)) => Check::FileExists(path.trim()),
        Some(("artifact_exists", id)) => Check::ArtifactExists(id.trim()),
        Some(("side_effect", kind)) => Check::SideEffect(kind.trim()),
        Some(("contains", needle)) => Check::Contains(needle),
        _ => Check::Unknown,
    }
}

/// Evaluate every binary check of the task; score is the satisfied fraction
pub fn evaluate_binary(input: &EvaluationInput) -> StrategyResult {
    let checks = &input.task.binary_checks;
    debug!(task_id = %input.task.id, checks = checks.len(), "evaluate_binary: called");

    if checks.is_empty() {
        let mut result = StrategyResult::new(StrategyKind::Binary, true, 1.0);
        result.diagnostics.push("no binary checks configured".to_string());
        return result;
    }

    let mut satisfied = 0usize;
    let mut missing = Vec::new();
    let mut diagnostics = Vec::new();

    for check in checks {
        let ok = match parse_check(check) {
            Check::FileExists(path) => {
                let found = input.task_files().any(|a| a.file_path.as_deref() == Some(path));
                if !found {
                    missing.push(MissingElement::new(
                        check.as_str(),
                        format!("produce {} and report it as an artifact", path),
                    ));
                }
                found
            }
            Check::ArtifactExists(id) => {
                let found = input.artifacts.iter().any(|a| a.id == id);
                if !found {
                    missing.push(MissingElement::new(
                        check.as_str(),
                        format!("register the artifact {} before finishing", id),
                    ));
                }
                found
            }
            Check::SideEffect(kind) => {
                let found = input.side_effects.iter().any(|s| s.effect_type == kind);
                if !found {
                    missing.push(MissingElement::new(
                        check.as_str(),
                        format!("perform the {} action and record it", kind),
                    ));
                }
                found
            }
            Check::Contains(needle) => {
                let found = input.content().contains(needle);
                if !found {
                    missing.push(MissingElement::new(
                        check.as_str(),
                        format!("include \"{}\" in the output", needle),
                    ));
                }
                found
            }
            Check::Unknown => {
                diagnostics.push(format!("unknown binary check '{}'", check));
                missing.push(MissingElement::new(
                    check.as_str(),
                    "fix the check; supported prefixes are file_exists, artifact_exists, side_effect, contains",
                ));
                false
            }
        };
        if ok {
            satisfied += 1;
        }
    }

    let passed = satisfied == checks.len();
    let mut result = StrategyResult::new(StrategyKind::Binary, passed, satisfied as f64 / checks.len() as f64);
    diagnostics.push(format!("{}/{} binary checks satisfied", satisfied, checks.len()));
    result.diagnostics = diagnostics;
    result.missing = missing;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use taskstore::{Artifact, ArtifactType, SideEffect, Task};

    fn artifact(id: &str, task_id: &str, path: Option<&str>) -> Artifact {
        Artifact {
            id: id.to_string(),
            task_id: task_id.to_string(),
            artifact_type: ArtifactType::File,
            file_path: path.map(str::to_string),
            blob_path: None,
            content_hash: None,
            metadata: Value::Null,
            iteration: 1,
            created_at: 0,
        }
    }

    fn side_effect(task_id: &str, kind: &str) -> SideEffect {
        SideEffect {
            task_id: task_id.to_string(),
            effect_type: kind.to_string(),
            idempotency_key: format!("{}-1", kind),
            details: Value::Null,
            iteration: 1,
            created_at: 0,
        }
    }

    #[test]
    fn test_file_exists_requires_task_owned_artifact() {
        let task = Task::new("a", "A").with_check("file_exists:out.md");
        let mut input = EvaluationInput::new(task, "", true);
        input.artifacts.push(artifact("x", "other", Some("out.md")));
        let result = evaluate_binary(&input);
        assert!(!result.passed);
        assert_eq!(result.missing.len(), 1);

        input.artifacts.push(artifact("y", "a", Some("out.md")));
        let result = evaluate_binary(&input);
        assert!(result.passed);
        assert!((result.score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_score_is_fraction_satisfied() {
        let task = Task::new("a", "A")
            .with_check("contains:hello")
            .with_check("side_effect:email")
            .with_check("artifact_exists:art-1")
            .with_check("contains:absent");
        let mut input = EvaluationInput::new(task, "hello world", true);
        input.side_effects.push(side_effect("a", "email"));
        let result = evaluate_binary(&input);
        assert!(!result.passed);
        assert!((result.score - 0.5).abs() < f64::EPSILON);
        let unmet: Vec<&str> = result.missing.iter().map(|m| m.check.as_str()).collect();
        assert_eq!(unmet, vec!["artifact_exists:art-1", "contains:absent"]);
    }

    #[test]
    fn test_unknown_check_is_unsatisfied_with_diagnostic() {
        let task = Task::new("a", "A").with_check("url_ok:http://x");
        let result = evaluate_binary(&EvaluationInput::new(task, "", true));
        assert!(!result.passed);
        assert_eq!(result.score, 0.0);
        assert!(result.diagnostics.iter().any(|d| d.contains("unknown binary check")));
    }

    #[test]
    fn test_contains_prefers_primary_content() {
        let task = Task::new("a", "A").with_check("contains:report");
        let mut input = EvaluationInput::new(task, "raw output with report", true);
        input.primary_content = Some("file body".to_string());
        assert!(!evaluate_binary(&input).passed);
    }

    #[test]
    fn test_deterministic() {
        let task = Task::new("a", "A").with_check("contains:x").with_check("file_exists:y");
        let input = EvaluationInput::new(task, "xyz", true);
        assert_eq!(evaluate_binary(&input), evaluate_binary(&input));
    }
}
