//! Runtime configuration with serde defaults, loadable from a JSON file.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::sandbox::SandboxOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub session_dir: PathBuf,
    pub registry_path: PathBuf,
    pub worker_prompt_path: PathBuf,
    /// Reply budget for one worker action, in approximate tokens.
    pub worker_max_response_tokens: u32,
    pub worker_disable_thinking_hack: bool,
    pub main_disable_thinking_hack: bool,
    /// Repair retries per structured phase, on top of the first attempt.
    pub structured_retry_limit: u32,
    pub max_pipes: usize,
    /// Log every outgoing model request to stderr, tagged with its phase.
    pub llm_debug: bool,
    pub sandbox: SandboxOptions,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            session_dir: PathBuf::from(".localscout/sessions"),
            registry_path: PathBuf::from("registry.json"),
            worker_prompt_path: PathBuf::from("prompts/worker_system.txt"),
            worker_max_response_tokens: 400,
            worker_disable_thinking_hack: true,
            main_disable_thinking_hack: false,
            structured_retry_limit: 2,
            max_pipes: 1,
            llm_debug: false,
            sandbox: SandboxOptions::default(),
        }
    }
}

/// Load a config file; a missing path yields the defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<RuntimeConfig> {
    let Some(path) = path else {
        return Ok(RuntimeConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed reading config file {}", path.display()))?;
    serde_json::from_str(&raw).context("failed parsing config JSON")
}
