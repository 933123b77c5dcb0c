//! Context guard: token estimation and session compaction.
//!
//! When a session's estimated token count crosses the trigger ratio of the
//! routed context limit, the loop swaps the bulk of the history for a tagged
//! summary document plus a bounded recent window. A progress signature stops
//! the guard from re-entering when compaction cannot shrink the session any
//! further.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::registry::ResolvedAgentConfig;
use crate::session::ChatSession;
use crate::types::{ChatMessage, Role};

pub const DEFAULT_CONTEXT_LENGTH: u32 = 8192;
pub const TRIGGER_RATIO: f64 = 0.85;
pub const TARGET_RATIO: f64 = 0.55;
pub const MIN_MESSAGES: usize = 24;
pub const MAX_RECENT: usize = 24;
pub const MIN_RECENT: usize = 6;
pub const CLIP_CHARS: usize = 700;
pub const COMPACTION_MARKER: &str = "[SESSION_COMPACTION]";

const MAX_TAGGED_PER_GROUP: usize = 5;

pub fn estimate_message_tokens(message: &ChatMessage) -> usize {
    message.content.chars().count().div_ceil(4) + 6
}

pub fn estimate_session_tokens(messages: &[ChatMessage]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// The effective context budget is the tighter of the two routed models.
pub fn resolve_context_limit_tokens(routed: &ResolvedAgentConfig) -> u32 {
    match (routed.main.context_length, routed.worker.context_length) {
        (Some(main), Some(worker)) => main.min(worker),
        (Some(main), None) => main,
        (None, Some(worker)) => worker,
        (None, None) => DEFAULT_CONTEXT_LENGTH,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionPlan {
    pub should_compact: bool,
    pub estimated_tokens: usize,
    pub trigger_tokens: usize,
    pub target_tokens: usize,
    pub signature: String,
}

pub fn compute_compaction_plan(session: &ChatSession, limit_tokens: u32) -> CompactionPlan {
    let estimated_tokens = estimate_session_tokens(&session.messages);
    let trigger_tokens = (f64::from(limit_tokens) * TRIGGER_RATIO).floor() as usize;
    let target_tokens = (f64::from(limit_tokens) * TARGET_RATIO).floor() as usize;
    let should_compact =
        session.messages.len() >= MIN_MESSAGES && estimated_tokens >= trigger_tokens;
    let last_role = session
        .messages
        .last()
        .map(|m| m.role.as_str())
        .unwrap_or("none");
    let last_content_len = session
        .messages
        .last()
        .map(|m| m.content.chars().count())
        .unwrap_or(0);
    let signature = sha256_hex(
        format!(
            "{estimated_tokens}:{}:{last_role}:{last_content_len}",
            session.messages.len()
        )
        .as_bytes(),
    );
    CompactionPlan {
        should_compact,
        estimated_tokens,
        trigger_tokens,
        target_tokens,
        signature,
    }
}

fn is_loop_tagged(content: &str) -> bool {
    ["[AGENT_GOAL:", "[WORKER_", "[MAIN_", "[PLANNING_"]
        .iter()
        .any(|tag| content.starts_with(tag))
}

fn clip(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let mut out: String = content.chars().take(max_chars).collect();
    out.push('…');
    out
}

fn last_matching<'a>(
    messages: &'a [ChatMessage],
    matches: impl Fn(&str) -> bool,
) -> Vec<&'a str> {
    let mut hits: Vec<&str> = messages
        .iter()
        .map(|m| m.content.as_str())
        .filter(|c| matches(c))
        .collect();
    if hits.len() > MAX_TAGGED_PER_GROUP {
        hits.drain(..hits.len() - MAX_TAGGED_PER_GROUP);
    }
    hits
}

/// Human-readable digest of the history being compacted away. Tagged session
/// lines are grouped so the models can still see what was tried.
pub fn build_compaction_summary_document(
    goal: &str,
    step: u32,
    evidence_count: usize,
    messages: &[ChatMessage],
) -> String {
    let mut out = String::new();
    out.push_str(COMPACTION_MARKER);
    out.push_str(" earlier history was compacted\n");
    out.push_str(&format!("goal: {goal}\n"));
    out.push_str(&format!("step: {step}\n"));
    out.push_str(&format!("evidence items: {evidence_count}\n"));

    let groups: [(&str, Box<dyn Fn(&str) -> bool>); 7] = [
        ("goal entries", Box::new(|c: &str| c.starts_with("[AGENT_GOAL:"))),
        (
            "tool commands",
            Box::new(|c: &str| {
                c.starts_with("[WORKER_TOOL_") && !c.starts_with("[WORKER_TOOL_RESULT_")
            }),
        ),
        (
            "tool results",
            Box::new(|c: &str| c.starts_with("[WORKER_TOOL_RESULT_")),
        ),
        (
            "operator questions",
            Box::new(|c: &str| {
                c.starts_with("[WORKER_ASK_") && !c.starts_with("[WORKER_ASK_ANSWER_")
            }),
        ),
        (
            "operator answers",
            Box::new(|c: &str| c.starts_with("[WORKER_ASK_ANSWER_")),
        ),
        (
            "main guidance",
            Box::new(|c: &str| c.starts_with("[MAIN_GUIDANCE_")),
        ),
        (
            "failures",
            Box::new(|c: &str| c.starts_with('[') && c.contains("_FAIL")),
        ),
    ];
    for (label, matcher) in groups {
        let hits = last_matching(messages, matcher);
        if hits.is_empty() {
            continue;
        }
        out.push_str(&format!("{label}:\n"));
        for hit in hits {
            out.push_str(&format!("- {}\n", clip(hit, CLIP_CHARS)));
        }
    }

    let last_assistant = messages
        .iter()
        .rev()
        .find(|m| matches!(m.role, Role::Assistant) && !m.content.trim().is_empty());
    if let Some(reply) = last_assistant {
        out.push_str("latest assistant reply:\n");
        out.push_str(&format!("- {}\n", clip(&reply.content, CLIP_CHARS)));
    }
    out
}

/// Rebuild the session under the target budget: at most one base system
/// message, the new summary, then a recent window that shrinks head-first,
/// then gets clipped, then shrinks to a single message if it must.
pub fn build_compacted_session_messages(
    session: &ChatSession,
    summary_doc: &str,
    target_tokens: usize,
) -> Vec<ChatMessage> {
    let prior: Vec<&ChatMessage> = session
        .messages
        .iter()
        .filter(|m| !m.content.starts_with(COMPACTION_MARKER))
        .collect();
    let base_system = prior
        .iter()
        .find(|m| matches!(m.role, Role::System) && !is_loop_tagged(&m.content))
        .map(|m| (*m).clone());

    let recent_start = prior.len().saturating_sub(MAX_RECENT);
    let mut recent: Vec<ChatMessage> = prior[recent_start..].iter().map(|m| (*m).clone()).collect();

    let assemble = |recent: &[ChatMessage]| -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(recent.len() + 2);
        if let Some(base) = &base_system {
            out.push(base.clone());
        }
        out.push(ChatMessage::system(summary_doc));
        out.extend(recent.iter().cloned());
        dedup_messages(out)
    };

    let mut out = assemble(&recent);
    while estimate_session_tokens(&out) > target_tokens && recent.len() > MIN_RECENT {
        recent.remove(0);
        out = assemble(&recent);
    }
    if estimate_session_tokens(&out) > target_tokens {
        for message in &mut recent {
            message.content = clip(&message.content, CLIP_CHARS);
        }
        out = assemble(&recent);
    }
    while estimate_session_tokens(&out) > target_tokens && recent.len() > 1 {
        recent.remove(0);
        out = assemble(&recent);
    }
    out
}

fn dedup_messages(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        let key = (message.role.as_str(), message.content.clone());
        if seen.insert(key) {
            out.push(message);
        }
    }
    out
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::{
        build_compacted_session_messages, build_compaction_summary_document,
        compute_compaction_plan, estimate_session_tokens, resolve_context_limit_tokens,
        COMPACTION_MARKER, DEFAULT_CONTEXT_LENGTH, MIN_MESSAGES,
    };
    use crate::registry::{AgentMode, ResolvedAgentConfig, ResolvedModel};
    use crate::session::ChatSession;
    use crate::types::{ChatMessage, Role};

    fn model(context_length: Option<u32>) -> ResolvedModel {
        ResolvedModel {
            id: "m".to_string(),
            provider: "llamacpp".to_string(),
            endpoint: "http://127.0.0.1:8080/v1".to_string(),
            credential: None,
            model_name: "m".to_string(),
            context_length,
            temperature: None,
            max_tokens: None,
            extra_params: None,
        }
    }

    fn routed(main: Option<u32>, worker: Option<u32>) -> ResolvedAgentConfig {
        ResolvedAgentConfig {
            agent_id: "default".to_string(),
            mode: AgentMode::MainWorker,
            max_steps: 8,
            stream: false,
            main: model(main),
            worker: model(worker),
        }
    }

    fn session_with(messages: Vec<ChatMessage>) -> ChatSession {
        ChatSession {
            id: "s".to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            updated_at: "2026-01-01T00:00:00Z".to_string(),
            messages,
        }
    }

    #[test]
    fn limit_is_min_of_defined_context_lengths() {
        assert_eq!(resolve_context_limit_tokens(&routed(Some(32768), Some(16384))), 16384);
        assert_eq!(resolve_context_limit_tokens(&routed(Some(4096), None)), 4096);
        assert_eq!(resolve_context_limit_tokens(&routed(None, None)), DEFAULT_CONTEXT_LENGTH);
    }

    #[test]
    fn plan_requires_both_thresholds() {
        let small = session_with(vec![ChatMessage::user(&"x".repeat(100_000))]);
        let plan = compute_compaction_plan(&small, 8192);
        assert!(!plan.should_compact, "one huge message is not enough");

        let mut messages = Vec::new();
        for i in 0..MIN_MESSAGES {
            messages.push(ChatMessage::user(format!("message {i} {}", "y".repeat(1200))));
        }
        let big = session_with(messages);
        let plan = compute_compaction_plan(&big, 8192);
        assert!(plan.should_compact);
        assert_eq!(plan.trigger_tokens, 6963);
        assert_eq!(plan.target_tokens, 4505);
    }

    #[test]
    fn signature_tracks_session_shape() {
        let a = session_with(vec![ChatMessage::user("one")]);
        let b = session_with(vec![ChatMessage::user("one"), ChatMessage::user("two")]);
        let plan_a = compute_compaction_plan(&a, 8192);
        let plan_a2 = compute_compaction_plan(&a, 8192);
        let plan_b = compute_compaction_plan(&b, 8192);
        assert_eq!(plan_a.signature, plan_a2.signature);
        assert_ne!(plan_a.signature, plan_b.signature);
    }

    #[test]
    fn summary_document_groups_tagged_lines() {
        let messages = vec![
            ChatMessage::user("[AGENT_GOAL:default] list repo roots"),
            ChatMessage::system("[WORKER_TOOL_1] ls -1"),
            ChatMessage::system("[WORKER_TOOL_RESULT_1] exit=0"),
            ChatMessage::system("[WORKER_ASK_2] Inspect docs? (YES/NO)"),
            ChatMessage::system("[WORKER_ASK_ANSWER_2] NO"),
            ChatMessage::system("[MAIN_GUIDANCE_3] dig deeper"),
            ChatMessage::system("[MAIN_DECISION_FAIL_4] parse error"),
            ChatMessage::assistant("roots are src and docs"),
        ];
        let doc = build_compaction_summary_document("list repo roots", 5, 3, &messages);
        assert!(doc.starts_with(COMPACTION_MARKER));
        assert!(doc.contains("goal: list repo roots"));
        assert!(doc.contains("step: 5"));
        assert!(doc.contains("- [WORKER_TOOL_1] ls -1"));
        assert!(doc.contains("- [WORKER_TOOL_RESULT_1] exit=0"));
        assert!(doc.contains("- [WORKER_ASK_2] Inspect docs? (YES/NO)"));
        assert!(doc.contains("- [MAIN_DECISION_FAIL_4] parse error"));
        assert!(doc.contains("- roots are src and docs"));
        // ask answers must not be double-counted as questions
        let question_section = doc.split("operator questions:").nth(1).expect("section");
        let question_block = question_section.split("operator answers:").next().expect("block");
        assert!(!question_block.contains("[WORKER_ASK_ANSWER_2]"));
    }

    #[test]
    fn rebuild_keeps_base_system_and_drops_old_summaries() {
        let mut messages = vec![
            ChatMessage::system("base system prompt"),
            ChatMessage::system(format!("{COMPACTION_MARKER} stale summary")),
        ];
        for i in 0..30 {
            messages.push(ChatMessage::user(format!("msg {i}")));
        }
        let session = session_with(messages);
        let out = build_compacted_session_messages(&session, "fresh summary", 100_000);
        assert_eq!(out[0].content, "base system prompt");
        assert_eq!(out[1].content, "fresh summary");
        assert!(out.iter().all(|m| !m.content.contains("stale summary")));
        // recent window is bounded
        assert!(out.len() <= 2 + super::MAX_RECENT);
    }

    #[test]
    fn rebuild_shrinks_to_target_or_one_recent_message() {
        let mut messages = vec![ChatMessage::system("base")];
        for i in 0..40 {
            messages.push(ChatMessage::user(format!("{i} {}", "z".repeat(2000))));
        }
        let session = session_with(messages);
        let target = 800;
        let out = build_compacted_session_messages(&session, "summary", target);
        let recent_count = out
            .iter()
            .filter(|m| matches!(m.role, Role::User))
            .count();
        assert!(
            estimate_session_tokens(&out) <= target || recent_count == 1,
            "either under target or only one recent message left"
        );
    }

    #[test]
    fn rebuild_deduplicates_repeated_messages() {
        let mut messages = vec![ChatMessage::system("base")];
        for _ in 0..30 {
            messages.push(ChatMessage::user("same line"));
        }
        let session = session_with(messages);
        let out = build_compacted_session_messages(&session, "summary", 100_000);
        let dupes = out.iter().filter(|m| m.content == "same line").count();
        assert_eq!(dupes, 1);
    }
}
