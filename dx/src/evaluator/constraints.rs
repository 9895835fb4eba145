//! Deterministic constraints on task output
//!
//! Evaluated against the primary file artifact content, falling back to raw
//! executor output.

use regex::Regex;
use taskstore::Constraint;
use tracing::debug;

use super::{EvaluationInput, MissingElement, StrategyKind, StrategyResult};

/// Check one constraint; `Err` carries a diagnostic for malformed constraints
fn check(constraint: &Constraint, content: &str) -> Result<bool, String> {
    let value = constraint.value.as_str();
    match constraint.kind.as_str() {
        "min_length" => value
            .trim()
            .parse::<usize>()
            .map(|min| content.chars().count() >= min)
            .map_err(|e| format!("min_length value '{}' is not a length: {}", value, e)),
        "max_length" => value
            .trim()
            .parse::<usize>()
            .map(|max| content.chars().count() <= max)
            .map_err(|e| format!("max_length value '{}' is not a length: {}", value, e)),
        "contains" => Ok(content.contains(value)),
        "regex" => Regex::new(value)
            .map(|re| re.is_match(content))
            .map_err(|e| format!("invalid regex '{}': {}", value, e)),
        other => Err(format!("unknown constraint type '{}'", other)),
    }
}

fn remediation(constraint: &Constraint) -> String {
    match constraint.kind.as_str() {
        "min_length" => format!("expand the output to at least {} characters", constraint.value),
        "max_length" => format!("shorten the output to at most {} characters", constraint.value),
        "contains" => format!("include \"{}\" in the output", constraint.value),
        "regex" => format!("make the output match /{}/", constraint.value),
        _ => "fix the constraint definition".to_string(),
    }
}

/// Evaluate every constraint of the task; score is the satisfied fraction
pub fn evaluate_constraints(input: &EvaluationInput) -> StrategyResult {
    let constraints = &input.task.constraints;
    debug!(task_id = %input.task.id, constraints = constraints.len(), "evaluate_constraints: called");

    if constraints.is_empty() {
        let mut result = StrategyResult::new(StrategyKind::Constraints, true, 1.0);
        result.diagnostics.push("no constraints configured".to_string());
        return result;
    }

    let content = input.content();
    let mut satisfied = 0usize;
    let mut diagnostics = Vec::new();
    let mut missing = Vec::new();

    for constraint in constraints {
        let label = format!("{}:{}", constraint.kind, constraint.value);
        match check(constraint, content) {
            Ok(true) => satisfied += 1,
            Ok(false) => missing.push(MissingElement::new(label, remediation(constraint))),
            Err(diagnostic) => {
                diagnostics.push(diagnostic);
                missing.push(MissingElement::new(label, remediation(constraint)));
            }
        }
    }

    let passed = satisfied == constraints.len();
    let mut result =
        StrategyResult::new(StrategyKind::Constraints, passed, satisfied as f64 / constraints.len() as f64);
    diagnostics.push(format!(
        "{}/{} constraints satisfied ({} chars evaluated)",
        satisfied,
        constraints.len(),
        content.chars().count()
    ));
    result.diagnostics = diagnostics;
    result.missing = missing;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskstore::Task;

    fn input(task: Task, output: &str) -> EvaluationInput {
        EvaluationInput::new(task, output, true)
    }

    #[test]
    fn test_all_kinds_pass() {
        let task = Task::new("a", "A")
            .with_constraint("min_length", "5")
            .with_constraint("max_length", "20")
            .with_constraint("contains", "Summary")
            .with_constraint("regex", r"^#\s+\w+");
        let result = evaluate_constraints(&input(task, "# Summary of it"));
        assert!(result.passed, "{:?}", result);
        assert!(result.missing.is_empty());
    }

    #[test]
    fn test_length_counts_characters() {
        let task = Task::new("a", "A").with_constraint("max_length", "3");
        assert!(evaluate_constraints(&input(task, "äöü")).passed);
    }

    #[test]
    fn test_invalid_constraints_fail_with_diagnostics() {
        let task = Task::new("a", "A")
            .with_constraint("regex", "(unclosed")
            .with_constraint("min_length", "ten")
            .with_constraint("word_count", "3")
            .with_constraint("contains", "ok");
        let result = evaluate_constraints(&input(task, "ok"));
        assert!(!result.passed);
        assert!((result.score - 0.25).abs() < f64::EPSILON);
        assert!(result.diagnostics.iter().any(|d| d.contains("invalid regex")));
        assert!(result.diagnostics.iter().any(|d| d.contains("unknown constraint type")));
        assert_eq!(result.missing.len(), 3);
    }

    #[test]
    fn test_falls_back_to_raw_output() {
        let task = Task::new("a", "A").with_constraint("contains", "raw");
        let mut with_file = input(task.clone(), "raw text");
        assert!(evaluate_constraints(&with_file).passed);
        with_file.primary_content = Some("file text".to_string());
        assert!(!evaluate_constraints(&with_file).passed);
    }
}
