//! Model registry and agent routing.
//!
//! The registry is a JSON document listing model endpoints and named agents.
//! Routing resolves an agent id plus caller overrides into the concrete
//! worker/main pair the loop runs with.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AgentMode {
    MainWorker,
    SingleMain,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentMode::MainWorker => "main-worker",
            AgentMode::SingleMain => "single-main",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedModel {
    pub id: String,
    pub provider: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_params: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    pub mode: AgentMode,
    pub max_steps: u32,
    #[serde(default = "default_stream")]
    pub stream: bool,
    pub main: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRegistry {
    pub models: Vec<ResolvedModel>,
    pub agents: BTreeMap<String, AgentEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentOverrides {
    pub mode: Option<AgentMode>,
    pub max_steps: Option<u32>,
    pub stream: Option<bool>,
}

/// An agent fully resolved to concrete models. In `single-main` mode the
/// worker and main entries are the same model.
#[derive(Debug, Clone)]
pub struct ResolvedAgentConfig {
    pub agent_id: String,
    pub mode: AgentMode,
    pub max_steps: u32,
    pub stream: bool,
    pub main: ResolvedModel,
    pub worker: ResolvedModel,
}

pub fn load_registry(path: &Path) -> anyhow::Result<ModelRegistry> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading registry file {}", path.display()))?;
    let registry: ModelRegistry =
        serde_json::from_str(&raw).context("failed parsing registry JSON")?;
    if registry.models.is_empty() {
        return Err(anyhow!("registry lists no models"));
    }
    Ok(registry)
}

pub fn route_agent(
    registry: &ModelRegistry,
    agent_id: &str,
    overrides: &AgentOverrides,
) -> anyhow::Result<ResolvedAgentConfig> {
    let entry = registry
        .agents
        .get(agent_id)
        .ok_or_else(|| anyhow!("unknown agent id '{agent_id}'"))?;
    let mode = overrides.mode.unwrap_or(entry.mode);
    let max_steps = overrides.max_steps.unwrap_or(entry.max_steps);
    if max_steps < 1 {
        return Err(anyhow!("max_steps must be at least 1"));
    }
    let stream = overrides.stream.unwrap_or(entry.stream);
    let main = find_model(registry, &entry.main)?;
    let worker = match mode {
        AgentMode::SingleMain => main.clone(),
        AgentMode::MainWorker => {
            let worker_id = entry.worker.as_deref().ok_or_else(|| {
                anyhow!("agent '{agent_id}' is main-worker but names no worker model")
            })?;
            find_model(registry, worker_id)?
        }
    };
    Ok(ResolvedAgentConfig {
        agent_id: agent_id.to_string(),
        mode,
        max_steps,
        stream,
        main,
        worker,
    })
}

fn find_model(registry: &ModelRegistry, id: &str) -> anyhow::Result<ResolvedModel> {
    registry
        .models
        .iter()
        .find(|m| m.id == id)
        .cloned()
        .ok_or_else(|| anyhow!("registry has no model with id '{id}'"))
}
