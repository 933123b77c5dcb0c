//! Parsing and repair of structured model output.
//!
//! Local models routinely wrap JSON in prose, leak `<think>` blocks, or emit
//! malformed objects. Everything here is pure string work so the repair loop
//! in `llm` can quote precise failures back to the model.

use anyhow::anyhow;
use serde_json::Value;

use crate::types::{
    ChatMessage, DecisionKind, MainDecision, PlanNext, PlanningResult, WorkerAction,
};

pub const MAX_TOOL_REASON_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairKind {
    WorkerAction,
    MainDecision,
    Planning,
}

impl RepairKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepairKind::WorkerAction => "worker-action",
            RepairKind::MainDecision => "main-decision",
            RepairKind::Planning => "planning",
        }
    }
}

/// Substring from the first `{` to the last `}`, inclusive.
pub fn extract_json_object(text: &str) -> anyhow::Result<&str> {
    let start = text
        .find('{')
        .ok_or_else(|| anyhow!("no JSON object found in reply"))?;
    let end = text
        .rfind('}')
        .ok_or_else(|| anyhow!("no JSON object found in reply"))?;
    if end < start {
        return Err(anyhow!("no JSON object found in reply"));
    }
    Ok(&text[start..=end])
}

/// Remove every `<think>…</think>` pair, case-insensitive. An unterminated
/// open tag swallows the rest of the text.
pub fn strip_think_blocks(text: &str) -> String {
    let mut out = text.to_string();
    loop {
        let lower = out.to_ascii_lowercase();
        let Some(start) = lower.find("<think>") else {
            break;
        };
        match lower[start + "<think>".len()..].find("</think>") {
            Some(rel) => {
                let end = start + "<think>".len() + rel + "</think>".len();
                out.replace_range(start..end, "");
            }
            None => {
                out.truncate(start);
                break;
            }
        }
    }
    out
}

/// Rough token estimate used for reply budgets: one token per four chars.
pub fn approx_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

pub fn validate_worker_reply_token_limit(text: &str, max_tokens: u32) -> anyhow::Result<()> {
    let estimate = approx_tokens(&strip_think_blocks(text));
    if estimate > max_tokens as usize {
        return Err(anyhow!(
            "reply too long: about {estimate} tokens, limit is {max_tokens}"
        ));
    }
    Ok(())
}

pub fn parse_worker_action(text: &str) -> anyhow::Result<WorkerAction> {
    let value: Value = serde_json::from_str(extract_json_object(text)?)
        .map_err(|e| anyhow!("worker reply is not valid JSON: {e}"))?;
    let obj = value
        .as_object()
        .ok_or_else(|| anyhow!("worker reply must be a JSON object"))?;
    let action = obj
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("worker reply missing string field action"))?;
    match action {
        "call_tool" => {
            let tool = obj.get("tool").and_then(Value::as_str).unwrap_or("shell");
            if tool != "shell" {
                return Err(anyhow!("unknown tool '{tool}', only shell is available"));
            }
            let cmd = obj
                .get("args")
                .and_then(|a| a.get("cmd"))
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            if cmd.is_empty() {
                return Err(anyhow!("call_tool requires non-empty args.cmd"));
            }
            let reason = obj
                .get("reason")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            if reason.is_empty() {
                return Err(anyhow!("call_tool requires a non-empty reason"));
            }
            if reason.chars().count() > MAX_TOOL_REASON_CHARS {
                return Err(anyhow!(
                    "reason exceeds {MAX_TOOL_REASON_CHARS} chars, shorten it"
                ));
            }
            Ok(WorkerAction::CallTool {
                cmd: cmd.to_string(),
                reason: reason.to_string(),
            })
        }
        "ask" => {
            let question = obj
                .get("question")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            if question.is_empty() {
                return Err(anyhow!("ask requires a non-empty YES/NO question"));
            }
            Ok(WorkerAction::Ask {
                question: question.to_string(),
            })
        }
        "finalize" => Ok(WorkerAction::Finalize),
        other => Err(anyhow!(
            "unknown action '{other}' (expected call_tool|ask|finalize)"
        )),
    }
}

/// Wire encoding of a worker action; the exact inverse of
/// `parse_worker_action` for well-formed actions.
pub fn worker_action_to_json(action: &WorkerAction) -> Value {
    match action {
        WorkerAction::CallTool { cmd, reason } => serde_json::json!({
            "action": "call_tool",
            "tool": "shell",
            "args": {"cmd": cmd},
            "reason": reason,
        }),
        WorkerAction::Ask { question } => serde_json::json!({
            "action": "ask",
            "question": question,
        }),
        WorkerAction::Finalize => serde_json::json!({"action": "finalize"}),
    }
}

pub fn parse_main_decision(text: &str) -> anyhow::Result<MainDecision> {
    let value: Value = serde_json::from_str(extract_json_object(text)?)
        .map_err(|e| anyhow!("decision reply is not valid JSON: {e}"))?;
    let obj = value
        .as_object()
        .ok_or_else(|| anyhow!("decision reply must be a JSON object"))?;
    let decision = match obj.get("decision").and_then(Value::as_str) {
        Some("finalize") => DecisionKind::Finalize,
        Some("continue") => DecisionKind::Continue,
        Some(other) => {
            return Err(anyhow!(
                "unknown decision '{other}' (expected finalize|continue)"
            ))
        }
        None => return Err(anyhow!("decision reply missing string field decision")),
    };
    Ok(MainDecision {
        decision,
        answer: optional_string(obj, "answer"),
        guidance: optional_string(obj, "guidance"),
        summary_evidence: optional_string_array(obj, "summary_evidence")?,
        needed_evidence: optional_string_array(obj, "needed_evidence")?,
        forced_synthesis_enable_think: obj
            .get("forced_synthesis_enable_think")
            .and_then(Value::as_bool),
    })
}

pub fn parse_planning_result(text: &str) -> anyhow::Result<PlanningResult> {
    let value: Value = serde_json::from_str(extract_json_object(text)?)
        .map_err(|e| anyhow!("planning reply is not valid JSON: {e}"))?;
    let obj = value
        .as_object()
        .ok_or_else(|| anyhow!("planning reply must be a JSON object"))?;
    let next = match obj.get("next").and_then(Value::as_str) {
        Some("collect_evidence") => PlanNext::CollectEvidence,
        Some("main_decision") => PlanNext::MainDecision,
        Some("final_report") => PlanNext::FinalReport,
        Some(other) => {
            return Err(anyhow!(
                "unknown next '{other}' (expected collect_evidence|main_decision|final_report)"
            ))
        }
        None => return Err(anyhow!("planning reply missing string field next")),
    };
    let reason = obj
        .get("reason")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    if reason.is_empty() {
        return Err(anyhow!("planning reply requires a non-empty reason"));
    }
    Ok(PlanningResult {
        next,
        reason: reason.to_string(),
        evidence_goals: optional_string_array(obj, "evidence_goals")?,
        guidance: optional_string(obj, "guidance"),
        answer_hint: optional_string(obj, "answer_hint"),
    })
}

/// User-role message asking the model to re-emit a malformed structured reply.
pub fn build_structured_repair_prompt(kind: RepairKind, error: &str) -> ChatMessage {
    let mut text = format!(
        "Your previous reply was rejected: {error}\n\
         Re-output EXACTLY one valid JSON object of the specified shape. \
         No prose, no code fences, nothing before or after the object."
    );
    if matches!(kind, RepairKind::WorkerAction) {
        let lower = error.to_ascii_lowercase();
        if lower.contains("too long") || lower.contains("token") {
            text.push_str("\nKeep the reply short: one compact JSON object only.");
        }
        if lower.contains("pipe") || lower.contains("forbidden") || lower.contains("git push") {
            text.push_str(
                "\nPick a different, policy-safe read-only command (no destructive \
                 executables, no git push, respect the pipe limit).",
            );
        }
        if lower.contains("think") {
            text.push_str("\nDo not emit <think> tags or any hidden reasoning.");
        }
    }
    ChatMessage::user(text)
}

/// Heuristic for the final-report path: does this text still look like JSON
/// or a code block instead of prose?
pub fn looks_like_structured_output(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return true;
    }
    if trimmed.starts_with('[') && trimmed.ends_with(']') {
        return true;
    }
    trimmed.contains("```")
}

/// Salvage a natural-language answer from a JSON object the final-report
/// model emitted anyway.
pub fn try_extract_answer_field(text: &str) -> Option<String> {
    let candidate = extract_json_object(text).ok()?;
    let value: Value = serde_json::from_str(candidate).ok()?;
    let obj = value.as_object()?;
    for key in ["answer", "final_answer", "response", "final"] {
        if let Some(answer) = obj.get(key).and_then(Value::as_str) {
            let trimmed = answer.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

fn optional_string(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn optional_string_array(
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> anyhow::Result<Vec<String>> {
    let Some(value) = obj.get(key) else {
        return Ok(Vec::new());
    };
    if value.is_null() {
        return Ok(Vec::new());
    }
    let arr = value
        .as_array()
        .ok_or_else(|| anyhow!("field {key} must be an array of strings"))?;
    let mut out = Vec::with_capacity(arr.len());
    for item in arr {
        let s = item
            .as_str()
            .ok_or_else(|| anyhow!("field {key} must be an array of strings"))?;
        out.push(s.to_string());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{
        build_structured_repair_prompt, extract_json_object, looks_like_structured_output,
        parse_main_decision, parse_planning_result, parse_worker_action, strip_think_blocks,
        try_extract_answer_field, validate_worker_reply_token_limit, worker_action_to_json,
        RepairKind,
    };
    use crate::types::{DecisionKind, PlanNext, Role, WorkerAction};

    #[test]
    fn extracts_object_with_surrounding_prose() {
        let text = "Sure, here it is:\n{\"action\":\"finalize\"}\nDone.";
        assert_eq!(
            extract_json_object(text).expect("extract"),
            "{\"action\":\"finalize\"}"
        );
        assert!(extract_json_object("no json here").is_err());
    }

    #[test]
    fn strips_think_blocks_case_insensitive() {
        let text = "<THINK>secret</think>{\"action\":\"finalize\"}<think>more</think>";
        assert_eq!(strip_think_blocks(text), "{\"action\":\"finalize\"}");
        // unterminated open tag drops the tail
        assert_eq!(strip_think_blocks("ok<think>oops"), "ok");
    }

    #[test]
    fn worker_action_round_trip() {
        let actions = vec![
            WorkerAction::CallTool {
                cmd: "ls -1".to_string(),
                reason: "enumerate roots".to_string(),
            },
            WorkerAction::Ask {
                question: "Should I inspect node_modules? (YES/NO)".to_string(),
            },
            WorkerAction::Finalize,
        ];
        for action in actions {
            let wire = worker_action_to_json(&action).to_string();
            assert_eq!(parse_worker_action(&wire).expect("parse"), action);
        }
    }

    #[test]
    fn worker_action_rejects_bad_shapes() {
        assert!(parse_worker_action("{\"action\":\"fly\"}").is_err());
        assert!(parse_worker_action("{\"action\":\"call_tool\",\"args\":{\"cmd\":\"\"}}").is_err());
        assert!(
            parse_worker_action("{\"action\":\"call_tool\",\"args\":{\"cmd\":\"ls\"}}").is_err(),
            "missing reason"
        );
        assert!(parse_worker_action("{\"action\":\"ask\",\"question\":\"  \"}").is_err());
        let long_reason = "r".repeat(121);
        let wire = format!(
            "{{\"action\":\"call_tool\",\"args\":{{\"cmd\":\"ls\"}},\"reason\":\"{long_reason}\"}}"
        );
        assert!(parse_worker_action(&wire).is_err());
    }

    #[test]
    fn main_decision_parses_optional_fields() {
        let d = parse_main_decision(
            r#"{"decision":"finalize","answer":"done","summary_evidence":["a","b"]}"#,
        )
        .expect("parse");
        assert_eq!(d.decision, DecisionKind::Finalize);
        assert_eq!(d.answer.as_deref(), Some("done"));
        assert_eq!(d.summary_evidence, vec!["a", "b"]);
        assert!(d.forced_synthesis_enable_think.is_none());

        let d2 = parse_main_decision(
            r#"{"decision":"continue","guidance":"dig","forced_synthesis_enable_think":true}"#,
        )
        .expect("parse2");
        assert_eq!(d2.decision, DecisionKind::Continue);
        assert_eq!(d2.forced_synthesis_enable_think, Some(true));
        assert!(parse_main_decision(r#"{"decision":"maybe"}"#).is_err());
    }

    #[test]
    fn planning_result_requires_reason() {
        let p = parse_planning_result(
            r#"{"next":"collect_evidence","reason":"need filesystem check","evidence_goals":["list files"]}"#,
        )
        .expect("parse");
        assert_eq!(p.next, PlanNext::CollectEvidence);
        assert_eq!(p.evidence_goals, vec!["list files"]);
        assert!(parse_planning_result(r#"{"next":"final_report","reason":""}"#).is_err());
        assert!(parse_planning_result(r#"{"next":"guess","reason":"x"}"#).is_err());
    }

    #[test]
    fn token_limit_ignores_think_blocks() {
        let padded = format!("<think>{}</think>{{\"action\":\"finalize\"}}", "x".repeat(4000));
        assert!(validate_worker_reply_token_limit(&padded, 10).is_ok());
        assert!(validate_worker_reply_token_limit(&"y".repeat(100), 10).is_err());
    }

    #[test]
    fn repair_prompt_carries_conditional_hints() {
        let msg = build_structured_repair_prompt(RepairKind::WorkerAction, "forbidden executable: rm");
        assert!(matches!(msg.role, Role::User));
        assert!(msg.content.contains("forbidden executable: rm"));
        assert!(msg.content.contains("policy-safe"));

        let plain = build_structured_repair_prompt(RepairKind::MainDecision, "not valid JSON");
        assert!(!plain.content.contains("policy-safe"));
        assert!(plain.content.contains("EXACTLY one valid JSON object"));
    }

    #[test]
    fn structured_detection_and_salvage() {
        assert!(looks_like_structured_output("{\"answer\":\"x\"}"));
        assert!(looks_like_structured_output("```\ntext\n```"));
        assert!(!looks_like_structured_output("A plain answer."));
        assert_eq!(
            try_extract_answer_field("{\"final_answer\":\"Repo roots: src, docs\"}").as_deref(),
            Some("Repo roots: src, docs")
        );
        assert!(try_extract_answer_field("just words").is_none());
    }
}
