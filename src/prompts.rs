//! Prompt builders for the planning, worker, decision, and final-report
//! phases, plus the deterministic fallback answer.

use crate::compaction::COMPACTION_MARKER;
use crate::evidence::summarize_evidence_for_main;
use crate::types::{ChatMessage, EvidenceItem, MainDecision, ToolResult};

pub const PLANNING_RECENT_MESSAGES: usize = 16;
pub const PLANNING_CLIP_CHARS: usize = 220;
pub const WORKER_EVIDENCE_WINDOW: usize = 12;

const PLANNING_SYSTEM_PROMPT: &str = "\
You route a fresh goal for a local evidence-gathering agent. Reply with \
exactly one JSON object: {\"next\": \"collect_evidence\"|\"main_decision\"|\"final_report\", \
\"reason\": \"...\", \"evidence_goals\": [\"...\"], \"guidance\": \"...\", \"answer_hint\": \"...\"}. \
Pick collect_evidence when facts must be gathered first, main_decision when \
existing history may already suffice, final_report only for trivial restatements. \
reason is mandatory; the other fields are optional.";

const DECISION_SYSTEM_PROMPT: &str = "\
You judge whether gathered evidence suffices to answer the goal. Reply with \
exactly one JSON object: {\"decision\": \"finalize\"|\"continue\", \"answer\": \"...\", \
\"guidance\": \"...\", \"summary_evidence\": [\"...\"], \"needed_evidence\": [\"...\"], \
\"forced_synthesis_enable_think\": true|false}. Use finalize with a draft answer \
when the evidence is sufficient; use continue with concrete guidance when it is not.";

const FORCED_DECISION_NOTE: &str = "\
The evidence budget is exhausted. You MUST reply with decision \"finalize\" and \
your best-effort answer from the evidence at hand, even if incomplete.";

const FINAL_REPORT_SYSTEM_PROMPT: &str = "\
Write the final report for the goal below as plain natural language for the \
operator. No JSON, no code blocks, no markdown fences. Ground every claim in \
the listed evidence and say so when evidence is thin.";

pub fn final_report_repair_message() -> ChatMessage {
    ChatMessage::user(
        "That reply was structured output. Rewrite the final report in plain \
         natural language only: no JSON, no code blocks, no fences.",
    )
}

fn strip_tag_prefix(content: &str) -> &str {
    if content.starts_with('[') {
        if let Some(end) = content.find("] ") {
            return &content[end + 2..];
        }
    }
    content
}

fn clip_chars(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let mut out: String = content.chars().take(max_chars).collect();
    out.push('…');
    out
}

/// Planning prompt: the goal plus a clipped role-prefixed digest of the most
/// recent non-compaction history.
pub fn planning_messages(goal: &str, session_messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let recent: Vec<&ChatMessage> = session_messages
        .iter()
        .filter(|m| !m.content.starts_with(COMPACTION_MARKER))
        .collect();
    let start = recent.len().saturating_sub(PLANNING_RECENT_MESSAGES);
    let mut history = String::new();
    for message in &recent[start..] {
        history.push_str(&format!(
            "{}: {}\n",
            message.role.as_str(),
            clip_chars(strip_tag_prefix(&message.content), PLANNING_CLIP_CHARS)
        ));
    }
    if history.is_empty() {
        history.push_str("(no prior history)\n");
    }
    vec![
        ChatMessage::system(PLANNING_SYSTEM_PROMPT),
        ChatMessage::user(format!("Goal: {goal}\n\nRecent history:\n{history}")),
    ]
}

/// Worker prompt: the protocol system prompt plus one user header carrying
/// everything the worker may react to this step.
pub fn worker_messages(
    system_prompt: &str,
    goal: &str,
    step: u32,
    guidance: &str,
    recent_user_answer: &str,
    evidence: &[EvidenceItem],
    last_tool: Option<&ToolResult>,
) -> Vec<ChatMessage> {
    let mut header = String::new();
    header.push_str(&format!("Goal: {goal}\n"));
    header.push_str(&format!("Step: {step}\n"));
    header.push_str(&format!(
        "Main guidance: {}\n",
        if guidance.is_empty() { "none" } else { guidance }
    ));
    header.push_str(&format!(
        "Latest user answer: {}\n",
        if recent_user_answer.is_empty() {
            "none"
        } else {
            recent_user_answer
        }
    ));

    header.push_str("\nEvidence so far:\n");
    let start = evidence.len().saturating_sub(WORKER_EVIDENCE_WINDOW);
    if evidence[start..].is_empty() {
        header.push_str("(none)\n");
    }
    for (idx, item) in evidence[start..].iter().enumerate() {
        header.push_str(&format!(
            "{}. [{}] {}\n",
            start + idx + 1,
            item.kind.as_str(),
            item.summary
        ));
    }

    header.push_str("\nTool context:\n");
    match last_tool {
        Some(tool) => {
            header.push_str(&format!("command: {}\n", tool.cmd));
            header.push_str(&format!("exit: {}\n", tool.exit_code));
            header.push_str(&format!("stdout:\n{}\n", tool.stdout));
            header.push_str(&format!("stderr:\n{}\n", tool.stderr));
        }
        None => header.push_str("No previous tool result.\n"),
    }

    vec![
        ChatMessage::system(system_prompt),
        ChatMessage::user(header),
    ]
}

pub fn decision_messages(
    goal: &str,
    evidence_lines: &[String],
    force_finalize: bool,
) -> Vec<ChatMessage> {
    let mut system = DECISION_SYSTEM_PROMPT.to_string();
    if force_finalize {
        system.push_str("\n\n");
        system.push_str(FORCED_DECISION_NOTE);
    }
    let mut body = format!("Goal: {goal}\n\nEvidence:\n");
    if evidence_lines.is_empty() {
        body.push_str("(no evidence was gathered)\n");
    }
    for line in evidence_lines {
        body.push_str(&format!("- {line}\n"));
    }
    vec![ChatMessage::system(system), ChatMessage::user(body)]
}

pub fn final_report_messages(
    goal: &str,
    draft: Option<&str>,
    decision_context: &str,
    evidence_lines: &[String],
) -> Vec<ChatMessage> {
    let mut body = format!("Goal: {goal}\n\nEvidence:\n");
    if evidence_lines.is_empty() {
        body.push_str("(no evidence was gathered)\n");
    }
    for line in evidence_lines {
        body.push_str(&format!("- {line}\n"));
    }
    if !decision_context.is_empty() {
        body.push_str(&format!("\nDecision context:\n{decision_context}\n"));
    }
    if let Some(draft) = draft {
        if !draft.trim().is_empty() {
            body.push_str(&format!("\nDraft answer to refine:\n{}\n", draft.trim()));
        }
    }
    vec![
        ChatMessage::system(FINAL_REPORT_SYSTEM_PROMPT),
        ChatMessage::user(body),
    ]
}

/// Flatten a decision into the context block the final-report prompt gets.
pub fn decision_context_summary(decision: &MainDecision) -> String {
    let mut out = String::new();
    if let Some(answer) = &decision.answer {
        out.push_str(&format!("answer: {answer}\n"));
    }
    if let Some(guidance) = &decision.guidance {
        out.push_str(&format!("guidance: {guidance}\n"));
    }
    if !decision.summary_evidence.is_empty() {
        out.push_str(&format!(
            "summary_evidence: {}\n",
            decision.summary_evidence.join("; ")
        ));
    }
    if !decision.needed_evidence.is_empty() {
        out.push_str(&format!(
            "needed_evidence: {}\n",
            decision.needed_evidence.join("; ")
        ));
    }
    if let Some(enable) = decision.forced_synthesis_enable_think {
        out.push_str(&format!("forced_synthesis_enable_think: {enable}\n"));
    }
    out.trim_end().to_string()
}

/// Deterministic last-resort answer: the goal restated over the evidence
/// lines, verbatim.
pub fn fallback_final_answer(goal: &str, evidence: &[EvidenceItem]) -> String {
    let lines = summarize_evidence_for_main(evidence);
    let mut out = format!(
        "I could not produce a model-written report for the goal: {goal}\n"
    );
    if lines.is_empty() {
        out.push_str("No evidence was collected during this run.");
    } else {
        out.push_str("Evidence collected during this run:\n");
        for line in &lines {
            out.push_str(&format!("- {line}\n"));
        }
        out.push_str("Please interpret the evidence above directly.");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{
        decision_context_summary, decision_messages, fallback_final_answer, planning_messages,
        worker_messages, PLANNING_RECENT_MESSAGES,
    };
    use crate::evidence::main_guidance_evidence;
    use crate::types::{
        ChatMessage, DecisionKind, MainDecision, Role, RunnerKind, ToolResult,
    };

    #[test]
    fn planning_prompt_clips_and_prefixes_history() {
        let mut messages = vec![ChatMessage::system("[SESSION_COMPACTION] old summary")];
        for i in 0..20 {
            messages.push(ChatMessage::user(format!("[WORKER_TOOL_{i}] echo {i}")));
        }
        messages.push(ChatMessage::assistant("x".repeat(500)));
        let prompt = planning_messages("the goal", &messages);
        assert_eq!(prompt.len(), 2);
        let body = &prompt[1].content;
        assert!(body.contains("Goal: the goal"));
        assert!(!body.contains("SESSION_COMPACTION"));
        // tag prefix stripped, role prefix added
        assert!(body.contains("user: echo 19"));
        assert!(!body.contains("[WORKER_TOOL_19]"));
        // long assistant reply clipped
        assert!(body.contains("assistant: "));
        assert!(!body.contains(&"x".repeat(300)));
        // only the window's worth of lines
        let history_lines = body.lines().filter(|l| l.starts_with("user: ")).count();
        assert!(history_lines < PLANNING_RECENT_MESSAGES);
    }

    #[test]
    fn worker_header_carries_guidance_and_tool_context() {
        let evidence = vec![main_guidance_evidence("look at src")];
        let tool = ToolResult {
            cmd: "ls".to_string(),
            exit_code: 0,
            stdout: "src".to_string(),
            stderr: String::new(),
            runner: RunnerKind::Local,
            workspace_group_id: "g".to_string(),
        };
        let messages = worker_messages("WORKER PROTOCOL", "goal", 3, "dig", "YES", &evidence, Some(&tool));
        assert!(matches!(messages[0].role, Role::System));
        let header = &messages[1].content;
        assert!(header.contains("Step: 3"));
        assert!(header.contains("Main guidance: dig"));
        assert!(header.contains("Latest user answer: YES"));
        assert!(header.contains("1. [main_guidance] look at src"));
        assert!(header.contains("command: ls"));

        let bare = worker_messages("P", "goal", 1, "", "", &[], None);
        assert!(bare[1].content.contains("Main guidance: none"));
        assert!(bare[1].content.contains("No previous tool result."));
    }

    #[test]
    fn forced_decision_prompt_demands_finalize() {
        let relaxed = decision_messages("g", &[], false);
        let forced = decision_messages("g", &["[tool_result] ls".to_string()], true);
        assert!(!relaxed[0].content.contains("MUST"));
        assert!(forced[0].content.contains("MUST"));
        assert!(forced[1].content.contains("- [tool_result] ls"));
    }

    #[test]
    fn decision_context_lists_present_fields_only() {
        let decision = MainDecision {
            decision: DecisionKind::Finalize,
            answer: Some("done".to_string()),
            guidance: None,
            summary_evidence: vec!["a".to_string()],
            needed_evidence: Vec::new(),
            forced_synthesis_enable_think: Some(true),
        };
        let ctx = decision_context_summary(&decision);
        assert!(ctx.contains("answer: done"));
        assert!(ctx.contains("summary_evidence: a"));
        assert!(ctx.contains("forced_synthesis_enable_think: true"));
        assert!(!ctx.contains("guidance:"));
        assert!(!ctx.contains("needed_evidence:"));
    }

    #[test]
    fn fallback_answer_is_deterministic_and_verbatim() {
        let evidence = vec![
            main_guidance_evidence("first hint"),
            main_guidance_evidence("second hint"),
        ];
        let a = fallback_final_answer("find the roots", &evidence);
        let b = fallback_final_answer("find the roots", &evidence);
        assert_eq!(a, b);
        assert!(a.contains("find the roots"));
        assert!(a.contains("[main_guidance] first hint"));
        assert!(a.contains("[main_guidance] second hint"));

        let empty = fallback_final_answer("g", &[]);
        assert!(empty.contains("No evidence was collected"));
    }
}
