//! The agent loop state machine.
//!
//! One `AgentLoop::run` call drives a goal through planning, evidence
//! acquisition, sufficiency assessment, and synthesis, with the context guard
//! allowed to pre-empt any stage. Every externally visible transition is
//! published as an event, and every session mutation goes through the
//! append+persist helper so nothing exists in memory that is not on disk.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::compaction::{
    build_compacted_session_messages, build_compaction_summary_document, compute_compaction_plan,
    resolve_context_limit_tokens,
};
use crate::config::RuntimeConfig;
use crate::evidence::{
    main_guidance_evidence, summarize_evidence_for_main, tool_result_evidence,
    user_answer_evidence,
};
use crate::events::{AgentEvent, EventSink};
use crate::llm::{
    ask_main_for_decision, ask_main_for_final_answer, ask_main_for_planning,
    ask_worker_for_action, StructuredValidationError, WorkerValidationFailure,
};
use crate::prompts::{
    decision_context_summary, decision_messages, fallback_final_answer, planning_messages,
    worker_messages,
};
use crate::provider::ChatApi;
use crate::registry::ResolvedAgentConfig;
use crate::sandbox::SandboxExec;
use crate::session::{ChatSession, SessionStore};
use crate::types::{
    ChatMessage, DecisionKind, LoopState, MainPhase, PlanNext, PlanningResult, Role, RunSummary,
    ToolResult, WorkerAction,
};

#[derive(Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "config error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug)]
pub struct StoreError(pub String);

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session store error: {}", self.0)
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug)]
pub struct CancelledError;

impl std::fmt::Display for CancelledError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run cancelled")
    }
}

impl std::error::Error for CancelledError {}

/// Answers worker questions on the operator's behalf.
#[async_trait]
pub trait UserPrompter: Send + Sync {
    async fn ask(&self, question: &str) -> anyhow::Result<String>;
}

/// Mutable bag for one run. Created per `run` call, discarded at the end;
/// only the final answer outlives it (as the session's assistant tail).
#[derive(Debug, Clone)]
pub struct LoopRuntime {
    pub planning: Option<PlanningResult>,
    pub evidence: Vec<crate::types::EvidenceItem>,
    pub guidance: String,
    pub recent_user_answer: String,
    pub last_tool: Option<ToolResult>,
    pub final_answer: String,
    pub step: u32,
    pub steps: u32,
    pub resume_state_after_compaction: LoopState,
    pub last_compaction_signature: Option<String>,
    pub forced_synthesis_enable_think: Option<bool>,
    pub forced_synthesis_reason: Option<String>,
}

impl LoopRuntime {
    pub fn new() -> Self {
        Self {
            planning: None,
            evidence: Vec::new(),
            guidance: String::new(),
            recent_user_answer: String::new(),
            last_tool: None,
            final_answer: String::new(),
            step: 1,
            steps: 0,
            resume_state_after_compaction: LoopState::PlanIntent,
            last_compaction_signature: None,
            forced_synthesis_enable_think: None,
            forced_synthesis_reason: None,
        }
    }
}

impl Default for LoopRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Load the worker wire-protocol prompt from its external text resource.
pub fn load_worker_system_prompt(path: &Path) -> anyhow::Result<String> {
    let prompt = std::fs::read_to_string(path).map_err(|e| {
        anyhow::Error::new(ConfigError(format!(
            "worker system prompt not readable at {}: {e}",
            path.display()
        )))
    })?;
    if prompt.trim().is_empty() {
        return Err(anyhow::Error::new(ConfigError(format!(
            "worker system prompt at {} is empty",
            path.display()
        ))));
    }
    Ok(prompt)
}

pub struct AgentLoop {
    pub cfg: RuntimeConfig,
    pub routed: ResolvedAgentConfig,
    pub worker_api: Arc<dyn ChatApi>,
    pub main_api: Arc<dyn ChatApi>,
    pub sandbox: Arc<dyn SandboxExec>,
    pub store: SessionStore,
    pub sink: Option<Box<dyn EventSink>>,
    pub prompter: Option<Box<dyn UserPrompter>>,
    pub cancel: CancellationToken,
    pub worker_system_prompt: String,
    pub workspace_group_override: Option<String>,
}

impl AgentLoop {
    fn emit(&mut self, event: AgentEvent) {
        if let Some(sink) = &mut self.sink {
            if let Err(e) = sink.emit(event) {
                eprintln!("WARN: failed to emit event: {e}");
            }
        }
    }

    fn append_and_persist(
        &self,
        session: &mut ChatSession,
        role: Role,
        content: String,
    ) -> anyhow::Result<()> {
        session.messages.push(ChatMessage { role, content });
        self.store
            .save(session)
            .map_err(|e| anyhow::Error::new(StoreError(e.to_string())))
    }

    async fn guarded<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> anyhow::Result<T> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(anyhow::Error::new(CancelledError)),
            out = fut => out,
        }
    }

    fn loop_state_event(&self, state: LoopState, rt: &LoopRuntime) -> AgentEvent {
        AgentEvent::LoopState {
            state: state.as_str().to_string(),
            step: rt.step,
            evidence_count: rt.evidence.len(),
            summary: rt
                .evidence
                .last()
                .map(|item| item.summary.clone())
                .unwrap_or_default(),
        }
    }

    fn evidence_summary_lines(&self, rt: &LoopRuntime) -> Vec<String> {
        let mut lines = Vec::new();
        if let Some(plan) = &rt.planning {
            lines.push(format!("plan: next={} reason={}", plan.next.as_str(), plan.reason));
            for goal in &plan.evidence_goals {
                lines.push(format!("plan goal: {goal}"));
            }
        }
        lines.extend(summarize_evidence_for_main(&rt.evidence));
        lines
    }

    /// Drive one goal to a final assistant message on the session.
    pub async fn run(
        &mut self,
        session: &mut ChatSession,
        goal: &str,
    ) -> anyhow::Result<RunSummary> {
        if self.worker_system_prompt.trim().is_empty() {
            return Err(anyhow::Error::new(ConfigError(
                "worker system prompt is empty".to_string(),
            )));
        }
        let workspace_group_id = self
            .workspace_group_override
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&session.id)
            .to_string();
        let context_limit = resolve_context_limit_tokens(&self.routed);
        let agent_id = self.routed.agent_id.clone();

        let mut rt = LoopRuntime::new();
        self.emit(AgentEvent::Start {
            agent_id: agent_id.clone(),
            mode: self.routed.mode.as_str().to_string(),
            goal: goal.to_string(),
        });
        self.append_and_persist(
            session,
            Role::User,
            format!("[AGENT_GOAL:{agent_id}] {goal}"),
        )?;

        let mut state = LoopState::PlanIntent;
        while state != LoopState::Done {
            if self.cancel.is_cancelled() {
                return Err(anyhow::Error::new(CancelledError));
            }
            let plan = compute_compaction_plan(session, context_limit);
            if state != LoopState::ContextGuard
                && plan.should_compact
                && rt.last_compaction_signature.as_deref() != Some(plan.signature.as_str())
            {
                rt.resume_state_after_compaction = state;
                state = LoopState::ContextGuard;
                continue;
            }
            state = match state {
                LoopState::PlanIntent => self.stage_plan_intent(&mut rt, session, goal).await?,
                LoopState::ContextGuard => {
                    self.stage_context_guard(&mut rt, session, goal, context_limit)
                        .await?
                }
                LoopState::AcquireEvidence => {
                    self.stage_acquire_evidence(&mut rt, session, goal, &workspace_group_id)
                        .await?
                }
                LoopState::AssessSufficiency => {
                    self.stage_assess_sufficiency(&mut rt, session, goal).await?
                }
                LoopState::ForcedSynthesis => {
                    self.stage_forced_synthesis(&mut rt, session, goal).await?
                }
                LoopState::Done => LoopState::Done,
            };
        }

        self.append_and_persist(session, Role::Assistant, rt.final_answer.clone())?;
        self.emit(AgentEvent::Complete {
            steps: rt.steps,
            evidence_count: rt.evidence.len(),
        });
        Ok(RunSummary {
            agent_id,
            mode: self.routed.mode.as_str().to_string(),
            max_steps: self.routed.max_steps,
            stream: self.routed.stream,
            summary: rt.final_answer.clone(),
            evidence: summarize_evidence_for_main(&rt.evidence),
            steps: rt.steps,
            worker_model: self.routed.worker.model_name.clone(),
            main_model: self.routed.main.model_name.clone(),
        })
    }

    async fn stage_plan_intent(
        &mut self,
        rt: &mut LoopRuntime,
        session: &mut ChatSession,
        goal: &str,
    ) -> anyhow::Result<LoopState> {
        self.emit(self.loop_state_event(LoopState::PlanIntent, rt));
        self.emit(AgentEvent::PlanningStart {
            goal: goal.to_string(),
        });
        self.emit(AgentEvent::MainStart {
            phase: MainPhase::Planning,
            evidence_count: rt.evidence.len(),
        });

        let messages = planning_messages(goal, &session.messages);
        let mut tokens = Vec::new();
        let stream = self.routed.stream;
        let result = self
            .guarded(ask_main_for_planning(
                self.main_api.as_ref(),
                &self.cfg,
                &messages,
                stream,
                &mut tokens,
            ))
            .await;
        for token in tokens {
            self.emit(AgentEvent::MainToken {
                phase: MainPhase::Planning,
                token,
            });
        }
        let plan = match result {
            Ok(plan) => plan,
            Err(e) if e.downcast_ref::<StructuredValidationError>().is_some() => {
                let msg = e.to_string();
                self.append_and_persist(
                    session,
                    Role::System,
                    format!("[PLANNING_FAIL] {msg}"),
                )?;
                PlanningResult {
                    next: PlanNext::CollectEvidence,
                    reason: format!("planning failed: {msg}"),
                    evidence_goals: Vec::new(),
                    guidance: Some(
                        "Collect concrete evidence with safe read-only commands before finalize."
                            .to_string(),
                    ),
                    answer_hint: None,
                }
            }
            Err(e) => return Err(e),
        };

        if let Some(guidance) = &plan.guidance {
            rt.guidance = guidance.clone();
        }
        if !plan.evidence_goals.is_empty() {
            rt.evidence.push(main_guidance_evidence(format!(
                "evidence goals: {}",
                plan.evidence_goals.join("; ")
            )));
        }
        self.append_and_persist(
            session,
            Role::System,
            format!(
                "[PLANNING_RESULT] next={} reason={}",
                plan.next.as_str(),
                plan.reason
            ),
        )?;
        self.emit(AgentEvent::PlanningResult {
            next: plan.next.as_str().to_string(),
            reason: plan.reason.clone(),
            evidence_goals: plan.evidence_goals.clone(),
            guidance: plan.guidance.clone(),
        });
        let next = plan.next;
        let answer_hint = plan.answer_hint.clone();
        rt.planning = Some(plan);

        match next {
            PlanNext::CollectEvidence => Ok(LoopState::AcquireEvidence),
            PlanNext::MainDecision => Ok(LoopState::AssessSufficiency),
            PlanNext::FinalReport => {
                self.produce_final_report(rt, session, goal, answer_hint.as_deref(), "", None)
                    .await?;
                Ok(LoopState::Done)
            }
        }
    }

    async fn stage_context_guard(
        &mut self,
        rt: &mut LoopRuntime,
        session: &mut ChatSession,
        goal: &str,
        context_limit: u32,
    ) -> anyhow::Result<LoopState> {
        let plan = compute_compaction_plan(session, context_limit);
        if !plan.should_compact {
            rt.last_compaction_signature = None;
            return Ok(rt.resume_state_after_compaction);
        }
        self.emit(AgentEvent::CompactionStart {
            estimated_tokens: plan.estimated_tokens,
            trigger_tokens: plan.trigger_tokens,
            target_tokens: plan.target_tokens,
            context_limit_tokens: context_limit,
            message_count: session.messages.len(),
        });
        let before_tokens = plan.estimated_tokens;
        let before_messages = session.messages.len();

        let summary_doc =
            build_compaction_summary_document(goal, rt.step, rt.evidence.len(), &session.messages);
        let rebuilt = build_compacted_session_messages(session, &summary_doc, plan.target_tokens);
        session.messages = rebuilt;
        self.store
            .save(session)
            .map_err(|e| anyhow::Error::new(StoreError(e.to_string())))?;

        let after = compute_compaction_plan(session, context_limit);
        rt.last_compaction_signature = Some(after.signature);
        self.emit(AgentEvent::CompactionComplete {
            before_tokens,
            after_tokens: after.estimated_tokens,
            before_messages,
            after_messages: session.messages.len(),
        });
        Ok(rt.resume_state_after_compaction)
    }

    async fn stage_acquire_evidence(
        &mut self,
        rt: &mut LoopRuntime,
        session: &mut ChatSession,
        goal: &str,
        workspace_group_id: &str,
    ) -> anyhow::Result<LoopState> {
        self.emit(self.loop_state_event(LoopState::AcquireEvidence, rt));
        if rt.step > self.routed.max_steps {
            rt.forced_synthesis_reason = Some(format!(
                "max step reached: step={}, maxSteps={}",
                rt.step, self.routed.max_steps
            ));
            return Ok(LoopState::ForcedSynthesis);
        }
        rt.steps = rt.step;
        self.emit(AgentEvent::WorkerStart { step: rt.step });

        let messages = worker_messages(
            &self.worker_system_prompt,
            goal,
            rt.step,
            &rt.guidance,
            &rt.recent_user_answer,
            &rt.evidence,
            rt.last_tool.as_ref(),
        );
        let mut tokens = Vec::new();
        let stream = self.routed.stream;
        let result = self
            .guarded(ask_worker_for_action(
                self.worker_api.as_ref(),
                &self.cfg,
                &messages,
                stream,
                rt.step,
                &mut tokens,
            ))
            .await;
        for token in tokens {
            self.emit(AgentEvent::WorkerToken {
                step: rt.step,
                token,
            });
        }
        let action = match result {
            Ok(action) => action,
            Err(e) => {
                let Some(failure) = e.downcast_ref::<WorkerValidationFailure>() else {
                    return Err(e);
                };
                let reason = failure.reason.clone();
                self.emit(AgentEvent::WorkerAction {
                    step: rt.step,
                    action: "finalize".to_string(),
                    detail: format!("worker validation failed: {reason}"),
                });
                rt.evidence.push(main_guidance_evidence(format!(
                    "worker output was invalid at step {}: {reason}",
                    rt.step
                )));
                rt.forced_synthesis_reason = Some(format!("worker validation failed: {reason}"));
                self.append_and_persist(
                    session,
                    Role::System,
                    format!("[WORKER_VALIDATION_FAIL_{}] {reason}", rt.step),
                )?;
                return Ok(LoopState::ForcedSynthesis);
            }
        };

        match action {
            WorkerAction::CallTool { cmd, reason } => {
                self.emit(AgentEvent::WorkerAction {
                    step: rt.step,
                    action: "call_tool".to_string(),
                    detail: reason,
                });
                self.emit(AgentEvent::ToolStart {
                    step: rt.step,
                    cmd: cmd.clone(),
                });
                let sandbox = self.sandbox.clone();
                let tool = self
                    .guarded(async { Ok(sandbox.run(&cmd, workspace_group_id).await) })
                    .await?;
                rt.last_tool = Some(tool.clone());
                rt.evidence.push(tool_result_evidence(&tool));
                self.append_and_persist(
                    session,
                    Role::System,
                    format!("[WORKER_TOOL_{}] {cmd}", rt.step),
                )?;
                self.append_and_persist(
                    session,
                    Role::System,
                    format!("[WORKER_TOOL_RESULT_{}] exit={}", rt.step, tool.exit_code),
                )?;
                self.emit(AgentEvent::ToolResult {
                    step: rt.step,
                    exit_code: tool.exit_code,
                    stdout: tool.stdout.clone(),
                    stderr: tool.stderr.clone(),
                    runner: tool.runner.as_str().to_string(),
                    workspace_group_id: tool.workspace_group_id.clone(),
                });
                rt.step += 1;
                Ok(LoopState::AcquireEvidence)
            }
            WorkerAction::Ask { question } => {
                self.emit(AgentEvent::WorkerAction {
                    step: rt.step,
                    action: "ask".to_string(),
                    detail: question.clone(),
                });
                self.emit(AgentEvent::Ask {
                    step: rt.step,
                    question: question.clone(),
                });
                let Some(prompter) = &self.prompter else {
                    return Err(anyhow::Error::new(ConfigError(
                        "worker asked a question but no askUser prompter is configured"
                            .to_string(),
                    )));
                };
                let answer = self.guarded(prompter.ask(&question)).await?;
                let answer = answer.trim().to_string();
                rt.recent_user_answer = answer.clone();
                rt.evidence.push(user_answer_evidence(&question, &answer));
                self.append_and_persist(
                    session,
                    Role::System,
                    format!("[WORKER_ASK_{}] {question}", rt.step),
                )?;
                self.append_and_persist(
                    session,
                    Role::System,
                    format!("[WORKER_ASK_ANSWER_{}] {answer}", rt.step),
                )?;
                self.emit(AgentEvent::AskAnswer {
                    step: rt.step,
                    answer,
                });
                rt.step += 1;
                Ok(LoopState::AcquireEvidence)
            }
            WorkerAction::Finalize => {
                self.emit(AgentEvent::WorkerAction {
                    step: rt.step,
                    action: "finalize".to_string(),
                    detail: "worker requested finalize".to_string(),
                });
                Ok(LoopState::AssessSufficiency)
            }
        }
    }

    async fn stage_assess_sufficiency(
        &mut self,
        rt: &mut LoopRuntime,
        session: &mut ChatSession,
        goal: &str,
    ) -> anyhow::Result<LoopState> {
        self.emit(self.loop_state_event(LoopState::AssessSufficiency, rt));
        self.emit(AgentEvent::MainStart {
            phase: MainPhase::AssessSufficiency,
            evidence_count: rt.evidence.len(),
        });

        let lines = self.evidence_summary_lines(rt);
        let messages = decision_messages(goal, &lines, false);
        let mut tokens = Vec::new();
        let stream = self.routed.stream;
        let result = self
            .guarded(ask_main_for_decision(
                self.main_api.as_ref(),
                &self.cfg,
                &messages,
                None,
                stream,
                &mut tokens,
            ))
            .await;
        for token in tokens {
            self.emit(AgentEvent::MainToken {
                phase: MainPhase::AssessSufficiency,
                token,
            });
        }
        let decision = match result {
            Ok(decision) => decision,
            Err(e) if e.downcast_ref::<StructuredValidationError>().is_some() => {
                let guidance = "Main decision was invalid; gather one more piece of concrete, \
                                safe evidence and retry finalize."
                    .to_string();
                rt.guidance = guidance.clone();
                rt.evidence.push(main_guidance_evidence(guidance.clone()));
                self.append_and_persist(
                    session,
                    Role::System,
                    format!("[MAIN_DECISION_FAIL_{}] {e}", rt.step),
                )?;
                self.emit(AgentEvent::MainDecision {
                    phase: MainPhase::AssessSufficiency,
                    decision: "continue".to_string(),
                    guidance: Some(guidance),
                });
                rt.step += 1;
                return Ok(LoopState::AcquireEvidence);
            }
            Err(e) => return Err(e),
        };

        if let Some(enable) = decision.forced_synthesis_enable_think {
            rt.forced_synthesis_enable_think = Some(enable);
        }
        match decision.decision {
            DecisionKind::Continue => {
                let guidance = decision.guidance.clone().unwrap_or_else(|| {
                    "Gather more concrete evidence and retry finalize.".to_string()
                });
                rt.guidance = guidance.clone();
                rt.evidence.push(main_guidance_evidence(guidance.clone()));
                self.append_and_persist(
                    session,
                    Role::System,
                    format!("[MAIN_GUIDANCE_{}] {guidance}", rt.step),
                )?;
                self.emit(AgentEvent::MainDecision {
                    phase: MainPhase::AssessSufficiency,
                    decision: "continue".to_string(),
                    guidance: Some(guidance),
                });
                rt.step += 1;
                Ok(LoopState::AcquireEvidence)
            }
            DecisionKind::Finalize => {
                self.emit(AgentEvent::MainDecision {
                    phase: MainPhase::AssessSufficiency,
                    decision: "finalize".to_string(),
                    guidance: decision.guidance.clone(),
                });
                let draft = decision
                    .answer
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                let context = decision_context_summary(&decision);
                let fail_tag = format!("MAIN_FINAL_ANSWER_FAIL_{}", rt.step);
                self.produce_final_report(
                    rt,
                    session,
                    goal,
                    draft.as_deref(),
                    &context,
                    Some(fail_tag),
                )
                .await?;
                Ok(LoopState::Done)
            }
        }
    }

    async fn stage_forced_synthesis(
        &mut self,
        rt: &mut LoopRuntime,
        session: &mut ChatSession,
        goal: &str,
    ) -> anyhow::Result<LoopState> {
        self.emit(self.loop_state_event(LoopState::ForcedSynthesis, rt));
        self.emit(AgentEvent::MainStart {
            phase: MainPhase::ForcedSynthesis,
            evidence_count: rt.evidence.len(),
        });

        let lines = self.evidence_summary_lines(rt);
        let messages = decision_messages(goal, &lines, true);
        let mut tokens = Vec::new();
        let stream = self.routed.stream;
        let enable_think = rt.forced_synthesis_enable_think;
        let result = self
            .guarded(ask_main_for_decision(
                self.main_api.as_ref(),
                &self.cfg,
                &messages,
                enable_think,
                stream,
                &mut tokens,
            ))
            .await;
        for token in tokens {
            self.emit(AgentEvent::MainToken {
                phase: MainPhase::ForcedSynthesis,
                token,
            });
        }
        match result {
            Ok(decision) => {
                self.emit(AgentEvent::MainDecision {
                    phase: MainPhase::ForcedSynthesis,
                    decision: "finalize".to_string(),
                    guidance: decision.guidance.clone(),
                });
                let draft = decision
                    .answer
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                let context = decision_context_summary(&decision);
                self.produce_final_report(
                    rt,
                    session,
                    goal,
                    draft.as_deref(),
                    &context,
                    Some("MAIN_FORCE_FINALIZE_FAIL".to_string()),
                )
                .await?;
            }
            Err(e) => {
                if e.downcast_ref::<CancelledError>().is_some()
                    || e.downcast_ref::<StoreError>().is_some()
                {
                    return Err(e);
                }
                rt.final_answer = fallback_final_answer(goal, &rt.evidence);
                self.append_and_persist(
                    session,
                    Role::System,
                    format!("[MAIN_FORCE_FINALIZE_FAIL] {e}"),
                )?;
                self.emit(AgentEvent::MainDecision {
                    phase: MainPhase::ForcedSynthesis,
                    decision: "finalize".to_string(),
                    guidance: Some(format!("fallback finalize: {e}")),
                });
                self.emit(AgentEvent::FinalAnswer {
                    answer: rt.final_answer.clone(),
                });
            }
        }
        Ok(LoopState::Done)
    }

    /// Shared tail of every finalize path: ask the main model for the plain
    /// report, fall back to the deterministic template on failure, publish
    /// `final-answer` either way.
    async fn produce_final_report(
        &mut self,
        rt: &mut LoopRuntime,
        session: &mut ChatSession,
        goal: &str,
        draft: Option<&str>,
        decision_context: &str,
        fail_tag: Option<String>,
    ) -> anyhow::Result<()> {
        self.emit(AgentEvent::MainStart {
            phase: MainPhase::FinalReport,
            evidence_count: rt.evidence.len(),
        });
        let lines = summarize_evidence_for_main(&rt.evidence);
        let mut tokens = Vec::new();
        let stream = self.routed.stream;
        let result = self
            .guarded(ask_main_for_final_answer(
                self.main_api.as_ref(),
                &self.cfg,
                goal,
                draft,
                decision_context,
                &rt.evidence,
                &lines,
                stream,
                &mut tokens,
            ))
            .await;
        for token in tokens {
            self.emit(AgentEvent::MainToken {
                phase: MainPhase::FinalReport,
                token,
            });
        }
        match result {
            Ok(answer) => rt.final_answer = answer,
            Err(e) => {
                if e.downcast_ref::<CancelledError>().is_some() {
                    return Err(e);
                }
                if let Some(tag) = fail_tag {
                    self.append_and_persist(session, Role::System, format!("[{tag}] {e}"))?;
                }
                rt.final_answer = fallback_final_answer(goal, &rt.evidence);
            }
        }
        self.emit(AgentEvent::FinalAnswer {
            answer: rt.final_answer.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{load_worker_system_prompt, ConfigError, LoopRuntime};
    use crate::types::LoopState;

    #[test]
    fn runtime_starts_at_step_one() {
        let rt = LoopRuntime::new();
        assert_eq!(rt.step, 1);
        assert_eq!(rt.steps, 0);
        assert!(rt.evidence.is_empty());
        assert_eq!(rt.resume_state_after_compaction, LoopState::PlanIntent);
        assert!(rt.last_compaction_signature.is_none());
    }

    #[test]
    fn missing_worker_prompt_is_a_config_error() {
        let err = load_worker_system_prompt(std::path::Path::new("/no/such/prompt.txt"))
            .expect_err("missing file");
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }

    #[test]
    fn empty_worker_prompt_is_a_config_error() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("empty.txt");
        std::fs::write(&path, "   \n").expect("write");
        let err = load_worker_system_prompt(&path).expect_err("empty file");
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }
}
