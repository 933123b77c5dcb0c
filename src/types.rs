use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One action proposed by the worker model. The wire shape is a single JSON
/// object; see `structured::parse_worker_action` for the accepted forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerAction {
    CallTool { cmd: String, reason: String },
    Ask { question: String },
    Finalize,
}

impl WorkerAction {
    pub fn label(&self) -> &'static str {
        match self {
            WorkerAction::CallTool { .. } => "call_tool",
            WorkerAction::Ask { .. } => "ask",
            WorkerAction::Finalize => "finalize",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionKind {
    Finalize,
    Continue,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Finalize => "finalize",
            DecisionKind::Continue => "continue",
        }
    }
}

/// Sufficiency verdict from the main model.
#[derive(Debug, Clone, PartialEq)]
pub struct MainDecision {
    pub decision: DecisionKind,
    pub answer: Option<String>,
    pub guidance: Option<String>,
    pub summary_evidence: Vec<String>,
    pub needed_evidence: Vec<String>,
    pub forced_synthesis_enable_think: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanNext {
    CollectEvidence,
    MainDecision,
    FinalReport,
}

impl PlanNext {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanNext::CollectEvidence => "collect_evidence",
            PlanNext::MainDecision => "main_decision",
            PlanNext::FinalReport => "final_report",
        }
    }
}

/// Up-front routing verdict from the main model for a fresh goal.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanningResult {
    pub next: PlanNext,
    pub reason: String,
    pub evidence_goals: Vec<String>,
    pub guidance: Option<String>,
    pub answer_hint: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    Local,
    Docker,
}

impl RunnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerKind::Local => "local",
            RunnerKind::Docker => "docker",
        }
    }
}

/// Outcome of one sandboxed shell command. Non-zero exit codes are data, not
/// errors; stdout/stderr arrive pre-normalized by the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub cmd: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub runner: RunnerKind,
    pub workspace_group_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    ToolResult,
    UserAnswer,
    MainGuidance,
}

impl EvidenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvidenceKind::ToolResult => "tool_result",
            EvidenceKind::UserAnswer => "user_answer",
            EvidenceKind::MainGuidance => "main_guidance",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub kind: EvidenceKind,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    PlanIntent,
    ContextGuard,
    AcquireEvidence,
    AssessSufficiency,
    ForcedSynthesis,
    Done,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::PlanIntent => "plan_intent",
            LoopState::ContextGuard => "context_guard",
            LoopState::AcquireEvidence => "acquire_evidence",
            LoopState::AssessSufficiency => "assess_sufficiency",
            LoopState::ForcedSynthesis => "forced_synthesis",
            LoopState::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum MainPhase {
    Planning,
    AssessSufficiency,
    ForcedSynthesis,
    FinalReport,
}

impl MainPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MainPhase::Planning => "planning",
            MainPhase::AssessSufficiency => "assess-sufficiency",
            MainPhase::ForcedSynthesis => "forced-synthesis",
            MainPhase::FinalReport => "final-report",
        }
    }
}

/// What `AgentLoop::run` hands back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub agent_id: String,
    pub mode: String,
    pub max_steps: u32,
    pub stream: bool,
    pub summary: String,
    pub evidence: Vec<String>,
    pub steps: u32,
    pub worker_model: String,
    pub main_model: String,
}

#[cfg(test)]
mod tests {
    use super::{ChatMessage, EvidenceKind, LoopState, Role, WorkerAction};

    #[test]
    fn role_serializes_lowercase() {
        let msg = ChatMessage::user("hi");
        let s = serde_json::to_string(&msg).expect("serialize");
        assert!(s.contains("\"user\""));
        assert!(matches!(msg.role, Role::User));
    }

    #[test]
    fn action_labels_are_wire_names() {
        assert_eq!(
            WorkerAction::CallTool {
                cmd: "ls".to_string(),
                reason: "peek".to_string()
            }
            .label(),
            "call_tool"
        );
        assert_eq!(WorkerAction::Finalize.label(), "finalize");
    }

    #[test]
    fn evidence_kind_round_trips() {
        let s = serde_json::to_string(&EvidenceKind::ToolResult).expect("serialize");
        assert_eq!(s, "\"tool_result\"");
        assert_eq!(LoopState::AcquireEvidence.as_str(), "acquire_evidence");
    }
}
