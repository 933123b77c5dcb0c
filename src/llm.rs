//! One layer above the chat adapter: per-phase sampling profiles, the
//! stream-on-first-attempt rule, and the structured repair-retry loop.

use anyhow::anyhow;

use crate::config::RuntimeConfig;
use crate::gate;
use crate::prompts::{
    fallback_final_answer, final_report_messages, final_report_repair_message,
};
use crate::provider::{ChatApi, ChatRequest};
use crate::structured::{
    build_structured_repair_prompt, looks_like_structured_output, parse_main_decision,
    parse_planning_result, parse_worker_action, strip_think_blocks, try_extract_answer_field,
    validate_worker_reply_token_limit, RepairKind,
};
use crate::types::{ChatMessage, EvidenceItem, MainDecision, PlanningResult, WorkerAction};

pub const FINAL_ANSWER_REPAIR_ROUNDS: u32 = 2;

/// Structured phase ran out of repair retries.
#[derive(Debug)]
pub struct StructuredValidationError {
    pub kind: &'static str,
    pub reason: String,
}

impl std::fmt::Display for StructuredValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} validation failed: {}", self.kind, self.reason)
    }
}

impl std::error::Error for StructuredValidationError {}

/// Worker phase ran out of repair retries at a given step; the loop recovers
/// by forcing synthesis instead of aborting.
#[derive(Debug)]
pub struct WorkerValidationFailure {
    pub step: u32,
    pub reason: String,
}

impl std::fmt::Display for WorkerValidationFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "worker action invalid at step {}: {}",
            self.step, self.reason
        )
    }
}

impl std::error::Error for WorkerValidationFailure {}

/// Request-level sampling for one phase, independent of model defaults.
/// `debug_tag` names the phase in provider debug logging.
#[derive(Debug, Clone, Copy)]
pub struct SamplingProfile {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: Option<u32>,
    pub disable_thinking_hack: bool,
    pub debug_enabled: bool,
    pub debug_tag: &'static str,
}

pub fn worker_action_profile(cfg: &RuntimeConfig) -> SamplingProfile {
    SamplingProfile {
        temperature: 0.7,
        top_p: 1.0,
        max_tokens: Some(cfg.worker_max_response_tokens),
        disable_thinking_hack: cfg.worker_disable_thinking_hack,
        debug_enabled: cfg.llm_debug,
        debug_tag: "worker-action",
    }
}

pub fn main_planning_profile(cfg: &RuntimeConfig) -> SamplingProfile {
    SamplingProfile {
        temperature: 0.7,
        top_p: 1.0,
        max_tokens: None,
        disable_thinking_hack: cfg.main_disable_thinking_hack,
        debug_enabled: cfg.llm_debug,
        debug_tag: "main-planning",
    }
}

/// Same as planning, except a prior decision may have asked for thinking to
/// stay enabled during forced synthesis.
pub fn main_decision_profile(
    cfg: &RuntimeConfig,
    enable_think_override: Option<bool>,
) -> SamplingProfile {
    let disable_thinking_hack = match enable_think_override {
        Some(enable) => !enable,
        None => cfg.main_disable_thinking_hack,
    };
    SamplingProfile {
        temperature: 0.7,
        top_p: 1.0,
        max_tokens: None,
        disable_thinking_hack,
        debug_enabled: cfg.llm_debug,
        debug_tag: "main-decision",
    }
}

pub fn main_final_report_profile(cfg: &RuntimeConfig) -> SamplingProfile {
    SamplingProfile {
        temperature: 1.0,
        top_p: 0.95,
        max_tokens: None,
        disable_thinking_hack: cfg.main_disable_thinking_hack,
        debug_enabled: cfg.llm_debug,
        debug_tag: "final-report",
    }
}

fn request_for(messages: Vec<ChatMessage>, profile: &SamplingProfile) -> ChatRequest {
    ChatRequest {
        messages,
        temperature: Some(profile.temperature),
        top_p: Some(profile.top_p),
        max_tokens: profile.max_tokens,
        disable_thinking_hack: profile.disable_thinking_hack,
        debug_enabled: profile.debug_enabled,
        debug_tag: Some(profile.debug_tag.to_string()),
        ..ChatRequest::default()
    }
}

/// Issue one completion. Attempt 0 streams when allowed; repair retries are
/// always non-streaming so they stay deterministic.
pub async fn request_chat_reply(
    api: &dyn ChatApi,
    messages: Vec<ChatMessage>,
    attempt: u32,
    stream_on_first: bool,
    profile: &SamplingProfile,
    tokens: &mut Vec<String>,
) -> anyhow::Result<String> {
    let request = request_for(messages, profile);
    if attempt == 0 && stream_on_first {
        let mut on_token = |t: &str| tokens.push(t.to_string());
        let reply = api.stream(request, &mut on_token).await?;
        Ok(reply.content)
    } else {
        let reply = api.complete(request).await?;
        Ok(reply.content)
    }
}

/// Drive a structured phase to a parsed value or exhaustion. Parse failures
/// feed a repair prompt back; provider failures consume a retry silently; at
/// the cap the last error surfaces (`StructuredValidationError` for parse
/// failures, the provider error itself otherwise).
pub async fn request_structured_with_repair<T>(
    api: &dyn ChatApi,
    base_messages: &[ChatMessage],
    retry_limit: u32,
    stream_on_first: bool,
    profile: &SamplingProfile,
    parse: impl Fn(&str) -> anyhow::Result<T>,
    repair_kind: RepairKind,
    tokens: &mut Vec<String>,
) -> anyhow::Result<T> {
    let mut messages = base_messages.to_vec();
    let mut attempt = 0u32;
    loop {
        let content = match request_chat_reply(
            api,
            messages.clone(),
            attempt,
            stream_on_first,
            profile,
            tokens,
        )
        .await
        {
            Ok(content) => content,
            Err(e) => {
                if attempt >= retry_limit {
                    return Err(e);
                }
                attempt += 1;
                continue;
            }
        };
        match parse(&content) {
            Ok(value) => return Ok(value),
            Err(reason) => {
                if attempt >= retry_limit {
                    return Err(anyhow::Error::new(StructuredValidationError {
                        kind: repair_kind.as_str(),
                        reason: reason.to_string(),
                    }));
                }
                messages = base_messages.to_vec();
                messages.push(ChatMessage::assistant(content));
                messages.push(build_structured_repair_prompt(
                    repair_kind,
                    &reason.to_string(),
                ));
                attempt += 1;
            }
        }
    }
}

/// Worker phase: token budget, think stripping, action shape, and the
/// command safety gate, all inside the repair loop. Exhaustion becomes a
/// `WorkerValidationFailure` carrying the step.
pub async fn ask_worker_for_action(
    api: &dyn ChatApi,
    cfg: &RuntimeConfig,
    messages: &[ChatMessage],
    stream_on_first: bool,
    step: u32,
    tokens: &mut Vec<String>,
) -> anyhow::Result<WorkerAction> {
    let max_tokens = cfg.worker_max_response_tokens;
    let max_pipes = cfg.max_pipes;
    let parse = move |text: &str| -> anyhow::Result<WorkerAction> {
        validate_worker_reply_token_limit(text, max_tokens)?;
        let action = parse_worker_action(&strip_think_blocks(text))?;
        if let WorkerAction::CallTool { cmd, .. } = &action {
            gate::check_command(cmd, max_pipes).map_err(|reason| anyhow!(reason))?;
        }
        Ok(action)
    };
    let result = request_structured_with_repair(
        api,
        messages,
        cfg.structured_retry_limit,
        stream_on_first,
        &worker_action_profile(cfg),
        parse,
        RepairKind::WorkerAction,
        tokens,
    )
    .await;
    result.map_err(|e| match e.downcast::<StructuredValidationError>() {
        Ok(validation) => anyhow::Error::new(WorkerValidationFailure {
            step,
            reason: validation.reason,
        }),
        Err(other) => other,
    })
}

pub async fn ask_main_for_planning(
    api: &dyn ChatApi,
    cfg: &RuntimeConfig,
    messages: &[ChatMessage],
    stream_on_first: bool,
    tokens: &mut Vec<String>,
) -> anyhow::Result<PlanningResult> {
    request_structured_with_repair(
        api,
        messages,
        cfg.structured_retry_limit,
        stream_on_first,
        &main_planning_profile(cfg),
        |text| parse_planning_result(&strip_think_blocks(text)),
        RepairKind::Planning,
        tokens,
    )
    .await
}

pub async fn ask_main_for_decision(
    api: &dyn ChatApi,
    cfg: &RuntimeConfig,
    messages: &[ChatMessage],
    enable_think_override: Option<bool>,
    stream_on_first: bool,
    tokens: &mut Vec<String>,
) -> anyhow::Result<MainDecision> {
    request_structured_with_repair(
        api,
        messages,
        cfg.structured_retry_limit,
        stream_on_first,
        &main_decision_profile(cfg, enable_think_override),
        |text| parse_main_decision(&strip_think_blocks(text)),
        RepairKind::MainDecision,
        tokens,
    )
    .await
}

/// Final report: plain text, not structured. Up to two repair rounds remind
/// the model to drop JSON; after that the answer field is salvaged or the
/// deterministic fallback takes over. Provider failure is the only error.
pub async fn ask_main_for_final_answer(
    api: &dyn ChatApi,
    cfg: &RuntimeConfig,
    goal: &str,
    draft: Option<&str>,
    decision_context: &str,
    evidence: &[EvidenceItem],
    evidence_lines: &[String],
    stream_on_first: bool,
    tokens: &mut Vec<String>,
) -> anyhow::Result<String> {
    let profile = main_final_report_profile(cfg);
    let mut messages = final_report_messages(goal, draft, decision_context, evidence_lines);
    let mut last_content = String::new();
    for attempt in 0..=FINAL_ANSWER_REPAIR_ROUNDS {
        let content = request_chat_reply(
            api,
            messages.clone(),
            attempt,
            stream_on_first,
            &profile,
            tokens,
        )
        .await?;
        let cleaned = strip_think_blocks(&content).trim().to_string();
        if !cleaned.is_empty() && !looks_like_structured_output(&cleaned) {
            return Ok(cleaned);
        }
        last_content = cleaned;
        if attempt < FINAL_ANSWER_REPAIR_ROUNDS {
            messages.push(ChatMessage::assistant(content));
            messages.push(final_report_repair_message());
        }
    }
    if let Some(salvaged) = try_extract_answer_field(&last_content) {
        if !looks_like_structured_output(&salvaged) && !salvaged.is_empty() {
            return Ok(salvaged);
        }
    }
    Ok(fallback_final_answer(goal, evidence))
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{
        ask_main_for_final_answer, ask_worker_for_action, main_decision_profile,
        request_structured_with_repair, RepairKind, StructuredValidationError,
        WorkerValidationFailure,
    };
    use crate::config::RuntimeConfig;
    use crate::provider::{ChatApi, ChatReply, ChatRequest};
    use crate::structured::parse_worker_action;
    use crate::types::WorkerAction;

    struct ScriptedApi {
        replies: Mutex<std::collections::VecDeque<String>>,
        requests: Mutex<Vec<ChatRequest>>,
        stream_calls: Mutex<u32>,
    }

    impl ScriptedApi {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()),
                requests: Mutex::new(Vec::new()),
                stream_calls: Mutex::new(0),
            }
        }

        fn next_reply(&self) -> String {
            self.replies
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or_else(|| "{}".to_string())
        }
    }

    #[async_trait]
    impl ChatApi for ScriptedApi {
        async fn complete(&self, req: ChatRequest) -> anyhow::Result<ChatReply> {
            self.requests.lock().expect("lock").push(req);
            Ok(ChatReply {
                content: self.next_reply(),
                raw: serde_json::Value::Null,
            })
        }

        fn stream<'a>(
            &'a self,
            req: ChatRequest,
            on_token: &'a mut (dyn FnMut(&str) + Send),
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<ChatReply>> + Send + 'a>> {
            Box::pin(async move {
                *self.stream_calls.lock().expect("lock") += 1;
                self.requests.lock().expect("lock").push(req);
                let content = self.next_reply();
                for chunk in content.as_bytes().chunks(8) {
                    on_token(&String::from_utf8_lossy(chunk));
                }
                Ok(ChatReply {
                    content,
                    raw: serde_json::Value::Null,
                })
            })
        }

        fn model_name(&self) -> &str {
            "scripted"
        }
    }

    fn base_messages() -> Vec<crate::types::ChatMessage> {
        vec![crate::types::ChatMessage::user("go")]
    }

    #[tokio::test]
    async fn repair_loop_recovers_from_malformed_json() {
        let api = ScriptedApi::new(&["not json at all", "{\"action\":\"finalize\"}"]);
        let mut tokens = Vec::new();
        let action = request_structured_with_repair(
            &api,
            &base_messages(),
            2,
            true,
            &super::worker_action_profile(&RuntimeConfig::default()),
            |text| parse_worker_action(text),
            RepairKind::WorkerAction,
            &mut tokens,
        )
        .await
        .expect("recovers");
        assert_eq!(action, WorkerAction::Finalize);
        // first attempt streamed, the retry did not
        assert_eq!(*api.stream_calls.lock().expect("lock"), 1);
        assert!(!tokens.is_empty());
        // the retry carried the bad reply plus a repair prompt
        let requests = api.requests.lock().expect("lock");
        let retry = &requests[1];
        assert_eq!(retry.messages.len(), 3);
        assert!(retry.messages[2].content.contains("EXACTLY one valid JSON object"));
    }

    #[tokio::test]
    async fn repair_cap_yields_structured_validation_error() {
        let api = ScriptedApi::new(&["junk", "junk", "junk"]);
        let mut tokens = Vec::new();
        let err = request_structured_with_repair(
            &api,
            &base_messages(),
            2,
            false,
            &super::worker_action_profile(&RuntimeConfig::default()),
            |text| parse_worker_action(text),
            RepairKind::WorkerAction,
            &mut tokens,
        )
        .await
        .map(|_: WorkerAction| ())
        .expect_err("exhausts");
        assert!(err.downcast_ref::<StructuredValidationError>().is_some());
    }

    #[tokio::test]
    async fn worker_gate_violation_becomes_validation_failure() {
        let cmd_reply = r#"{"action":"call_tool","tool":"shell","args":{"cmd":"rm -rf /"},"reason":"cleanup"}"#;
        let api = ScriptedApi::new(&[cmd_reply, cmd_reply, cmd_reply]);
        let mut tokens = Vec::new();
        let err = ask_worker_for_action(
            &api,
            &RuntimeConfig::default(),
            &base_messages(),
            false,
            4,
            &mut tokens,
        )
        .await
        .expect_err("gated");
        let failure = err
            .downcast_ref::<WorkerValidationFailure>()
            .expect("worker failure kind");
        assert_eq!(failure.step, 4);
        assert!(failure.reason.contains("forbidden executable"));
        // the repair prompt carried the policy hint
        let requests = api.requests.lock().expect("lock");
        assert!(requests[1].messages.last().expect("repair").content.contains("policy-safe"));
    }

    #[tokio::test]
    async fn worker_strips_think_blocks_before_parsing() {
        let api = ScriptedApi::new(&["<think>hidden plan</think>{\"action\":\"finalize\"}"]);
        let mut tokens = Vec::new();
        let action = ask_worker_for_action(
            &api,
            &RuntimeConfig::default(),
            &base_messages(),
            false,
            1,
            &mut tokens,
        )
        .await
        .expect("parses");
        assert_eq!(action, WorkerAction::Finalize);
    }

    #[tokio::test]
    async fn final_answer_retries_then_accepts_prose() {
        let api = ScriptedApi::new(&["{\"answer\":\"json first\"}", "Repo roots: src, docs"]);
        let mut tokens = Vec::new();
        let answer = ask_main_for_final_answer(
            &api,
            &RuntimeConfig::default(),
            "list repo roots",
            None,
            "",
            &[],
            &[],
            false,
            &mut tokens,
        )
        .await
        .expect("answer");
        assert_eq!(answer, "Repo roots: src, docs");
    }

    #[tokio::test]
    async fn final_answer_salvages_answer_field() {
        let json = "{\"final_answer\":\"Salvaged text.\"}";
        let api = ScriptedApi::new(&[json, json, json]);
        let mut tokens = Vec::new();
        let answer = ask_main_for_final_answer(
            &api,
            &RuntimeConfig::default(),
            "g",
            None,
            "",
            &[],
            &[],
            false,
            &mut tokens,
        )
        .await
        .expect("answer");
        assert_eq!(answer, "Salvaged text.");
    }

    #[tokio::test]
    async fn final_answer_falls_back_to_template() {
        let api = ScriptedApi::new(&["```code```", "```code```", "```code```"]);
        let mut tokens = Vec::new();
        let evidence = vec![crate::evidence::main_guidance_evidence("hint")];
        let answer = ask_main_for_final_answer(
            &api,
            &RuntimeConfig::default(),
            "the goal",
            None,
            "",
            &evidence,
            &[],
            false,
            &mut tokens,
        )
        .await
        .expect("answer");
        assert!(answer.contains("the goal"));
        assert!(answer.contains("[main_guidance] hint"));
    }

    #[test]
    fn decision_profile_honors_think_override() {
        let cfg = RuntimeConfig {
            main_disable_thinking_hack: true,
            ..RuntimeConfig::default()
        };
        assert!(main_decision_profile(&cfg, None).disable_thinking_hack);
        assert!(!main_decision_profile(&cfg, Some(true)).disable_thinking_hack);
        assert!(main_decision_profile(&cfg, Some(false)).disable_thinking_hack);
    }

    #[test]
    fn profiles_carry_phase_debug_tags() {
        let cfg = RuntimeConfig {
            llm_debug: true,
            ..RuntimeConfig::default()
        };
        let worker = super::worker_action_profile(&cfg);
        assert!(worker.debug_enabled);
        assert_eq!(worker.debug_tag, "worker-action");
        assert_eq!(super::main_planning_profile(&cfg).debug_tag, "main-planning");
        assert_eq!(super::main_decision_profile(&cfg, None).debug_tag, "main-decision");
        assert_eq!(super::main_final_report_profile(&cfg).debug_tag, "final-report");
        assert!(!super::worker_action_profile(&RuntimeConfig::default()).debug_enabled);
    }
}
