//! Run lifecycle events published to an optional observer.

use std::io::Write;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::types::MainPhase;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AgentEvent {
    Start {
        agent_id: String,
        mode: String,
        goal: String,
    },
    LoopState {
        state: String,
        step: u32,
        evidence_count: usize,
        summary: String,
    },
    PlanningStart {
        goal: String,
    },
    PlanningResult {
        next: String,
        reason: String,
        evidence_goals: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        guidance: Option<String>,
    },
    CompactionStart {
        estimated_tokens: usize,
        trigger_tokens: usize,
        target_tokens: usize,
        context_limit_tokens: u32,
        message_count: usize,
    },
    CompactionComplete {
        before_tokens: usize,
        after_tokens: usize,
        before_messages: usize,
        after_messages: usize,
    },
    WorkerStart {
        step: u32,
    },
    WorkerToken {
        step: u32,
        token: String,
    },
    WorkerAction {
        step: u32,
        action: String,
        detail: String,
    },
    ToolStart {
        step: u32,
        cmd: String,
    },
    ToolResult {
        step: u32,
        exit_code: i32,
        stdout: String,
        stderr: String,
        runner: String,
        workspace_group_id: String,
    },
    Ask {
        step: u32,
        question: String,
    },
    AskAnswer {
        step: u32,
        answer: String,
    },
    MainStart {
        phase: MainPhase,
        evidence_count: usize,
    },
    MainToken {
        phase: MainPhase,
        token: String,
    },
    MainDecision {
        phase: MainPhase,
        decision: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        guidance: Option<String>,
    },
    FinalAnswer {
        answer: String,
    },
    Complete {
        steps: u32,
        evidence_count: usize,
    },
}

pub trait EventSink: Send {
    fn emit(&mut self, event: AgentEvent) -> anyhow::Result<()>;
}

/// Prints streamed tokens to stdout as they arrive; everything else is
/// silent. The CLI default for interactive runs.
pub struct StdoutSink;

impl StdoutSink {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for StdoutSink {
    fn emit(&mut self, event: AgentEvent) -> anyhow::Result<()> {
        match event {
            AgentEvent::WorkerToken { token, .. } | AgentEvent::MainToken { token, .. } => {
                print!("{token}");
                std::io::stdout().flush().ok();
            }
            _ => {}
        }
        Ok(())
    }
}

pub struct JsonlFileSink {
    file: std::fs::File,
}

impl JsonlFileSink {
    pub fn new(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open events file {}", path.display()))?;
        Ok(Self { file })
    }
}

impl EventSink for JsonlFileSink {
    fn emit(&mut self, event: AgentEvent) -> anyhow::Result<()> {
        let line = serde_json::to_string(&event)?;
        writeln!(self.file, "{line}")?;
        Ok(())
    }
}

pub struct MultiSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl MultiSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn push(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Default for MultiSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for MultiSink {
    fn emit(&mut self, event: AgentEvent) -> anyhow::Result<()> {
        for sink in &mut self.sinks {
            sink.emit(event.clone())?;
        }
        Ok(())
    }
}

/// Test helper: collects every event in order.
pub struct VecSink {
    pub events: std::sync::Arc<std::sync::Mutex<Vec<AgentEvent>>>,
}

impl VecSink {
    pub fn new() -> (Self, std::sync::Arc<std::sync::Mutex<Vec<AgentEvent>>>) {
        let events = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        (
            Self {
                events: events.clone(),
            },
            events,
        )
    }
}

impl EventSink for VecSink {
    fn emit(&mut self, event: AgentEvent) -> anyhow::Result<()> {
        self.events.lock().expect("event lock").push(event);
        Ok(())
    }
}
