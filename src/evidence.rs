//! Evidence accumulation and the summary view handed to the main model.

use crate::types::{EvidenceItem, EvidenceKind, ToolResult};

pub const MAX_EVIDENCE_FOR_MAIN: usize = 12;

/// Summarize evidence for the main model: insertion order, deduplicated by
/// `(kind, summary)`, capped at `MAX_EVIDENCE_FOR_MAIN` lines. Each line
/// stands alone, prefixed with its kind.
pub fn summarize_evidence_for_main(items: &[EvidenceItem]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let key = format!("{}:{}", item.kind.as_str(), item.summary);
        if !seen.insert(key) {
            continue;
        }
        out.push(format!("[{}] {}", item.kind.as_str(), item.summary));
        if out.len() >= MAX_EVIDENCE_FOR_MAIN {
            break;
        }
    }
    out
}

pub fn first_non_empty_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
}

/// Evidence entry for one sandboxed command outcome.
pub fn tool_result_evidence(result: &ToolResult) -> EvidenceItem {
    let summary = format!(
        "runner={} group={} cmd={} exit={} stdout={} stderr={}",
        result.runner.as_str(),
        result.workspace_group_id,
        result.cmd,
        result.exit_code,
        first_non_empty_line(&result.stdout),
        first_non_empty_line(&result.stderr),
    );
    let detail = format!(
        "cmd: {}\nexit: {}\nstdout:\n{}\nstderr:\n{}",
        result.cmd, result.exit_code, result.stdout, result.stderr
    );
    EvidenceItem {
        kind: EvidenceKind::ToolResult,
        summary,
        detail: Some(detail),
    }
}

pub fn user_answer_evidence(question: &str, answer: &str) -> EvidenceItem {
    EvidenceItem {
        kind: EvidenceKind::UserAnswer,
        summary: format!("Q: {question} / A: {answer}"),
        detail: None,
    }
}

pub fn main_guidance_evidence(summary: impl Into<String>) -> EvidenceItem {
    EvidenceItem {
        kind: EvidenceKind::MainGuidance,
        summary: summary.into(),
        detail: None,
    }
}
