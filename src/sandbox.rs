//! Sandboxed shell execution for worker tool calls.
//!
//! Two runners: `local` spawns the configured shell directly, `docker` keeps
//! one long-lived container per workspace group and execs into it. Neither
//! runner raises for a failing command; everything surfaces as a
//! `ToolResult` with an exit code.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::types::{RunnerKind, ToolResult};

/// Cap applied to stdout/stderr before a result enters the loop.
pub const MAX_STREAM_CHARS: usize = 12_000;
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Exit code reported for a command the sandbox had to kill on timeout,
/// matching the timeout(1) convention.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    Local,
    Docker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxOptions {
    pub mode: SandboxMode,
    pub timeout_ms: u64,
    pub max_buffer_bytes: usize,
    pub shell_path: String,
    pub docker_shell_path: String,
    pub docker_image: String,
    pub docker_workspace_root: String,
    pub docker_container_prefix: String,
    pub docker_network: String,
    pub docker_memory: String,
    pub docker_cpus: String,
    pub docker_pids_limit: u32,
    pub docker_required_tools: Vec<String>,
    pub docker_workspace_init_command: Option<String>,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            mode: SandboxMode::Local,
            timeout_ms: 60_000,
            max_buffer_bytes: 1_000_000,
            shell_path: "/bin/sh".to_string(),
            docker_shell_path: "/bin/sh".to_string(),
            docker_image: "debian:bookworm-slim".to_string(),
            docker_workspace_root: "/workspace".to_string(),
            docker_container_prefix: "localscout-ws-".to_string(),
            docker_network: "none".to_string(),
            docker_memory: "512m".to_string(),
            docker_cpus: "1".to_string(),
            docker_pids_limit: 256,
            docker_required_tools: Vec::new(),
            docker_workspace_init_command: None,
        }
    }
}

#[async_trait]
pub trait SandboxExec: Send + Sync {
    async fn run(&self, cmd: &str, workspace_group_id: &str) -> ToolResult;
}

pub fn build_sandbox(opts: SandboxOptions) -> Box<dyn SandboxExec> {
    match opts.mode {
        SandboxMode::Local => Box::new(LocalSandbox { opts }),
        SandboxMode::Docker => Box::new(DockerSandbox { opts }),
    }
}

/// Normalize a captured stream: decode happened upstream, here we cap the
/// char count and mark the cut.
pub fn normalize_stream(raw: &str) -> String {
    if raw.chars().count() <= MAX_STREAM_CHARS {
        return raw.to_string();
    }
    let mut out: String = raw.chars().take(MAX_STREAM_CHARS).collect();
    out.push_str(TRUNCATION_MARKER);
    out
}

pub struct LocalSandbox {
    opts: SandboxOptions,
}

#[async_trait]
impl SandboxExec for LocalSandbox {
    async fn run(&self, cmd: &str, workspace_group_id: &str) -> ToolResult {
        let mut command = Command::new(&self.opts.shell_path);
        command.arg("-lc").arg(cmd);
        run_command(
            command,
            cmd,
            workspace_group_id,
            RunnerKind::Local,
            &self.opts,
        )
        .await
    }
}

pub struct DockerSandbox {
    opts: SandboxOptions,
}

impl DockerSandbox {
    fn container_name(&self, workspace_group_id: &str) -> String {
        let safe: String = workspace_group_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        format!("{}{safe}", self.opts.docker_container_prefix)
    }

    async fn ensure_container(&self, name: &str) -> Result<(), String> {
        let inspect = Command::new("docker")
            .args(["inspect", "-f", "{{.State.Running}}", name])
            .output()
            .await
            .map_err(|e| format!("docker not available: {e}"))?;
        if inspect.status.success() {
            let state = String::from_utf8_lossy(&inspect.stdout);
            if state.trim() == "true" {
                return Ok(());
            }
            let start = Command::new("docker")
                .args(["start", name])
                .output()
                .await
                .map_err(|e| format!("docker start failed: {e}"))?;
            if start.status.success() {
                return Ok(());
            }
        }
        let run = Command::new("docker")
            .args([
                "run",
                "-d",
                "--name",
                name,
                "--network",
                &self.opts.docker_network,
                "--memory",
                &self.opts.docker_memory,
                "--cpus",
                &self.opts.docker_cpus,
                "--pids-limit",
                &self.opts.docker_pids_limit.to_string(),
                "-w",
                &self.opts.docker_workspace_root,
                &self.opts.docker_image,
                "sleep",
                "infinity",
            ])
            .output()
            .await
            .map_err(|e| format!("docker run failed: {e}"))?;
        if !run.status.success() {
            return Err(format!(
                "docker run failed: {}",
                String::from_utf8_lossy(&run.stderr).trim()
            ));
        }
        for tool in &self.opts.docker_required_tools {
            let check = Command::new("docker")
                .args([
                    "exec",
                    name,
                    &self.opts.docker_shell_path,
                    "-lc",
                    &format!("command -v {tool}"),
                ])
                .output()
                .await
                .map_err(|e| format!("docker exec failed: {e}"))?;
            if !check.status.success() {
                return Err(format!("required tool missing in sandbox image: {tool}"));
            }
        }
        if let Some(init) = &self.opts.docker_workspace_init_command {
            let out = Command::new("docker")
                .args(["exec", name, &self.opts.docker_shell_path, "-lc", init])
                .output()
                .await
                .map_err(|e| format!("docker exec failed: {e}"))?;
            if !out.status.success() {
                return Err(format!(
                    "workspace init command failed: {}",
                    String::from_utf8_lossy(&out.stderr).trim()
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxExec for DockerSandbox {
    async fn run(&self, cmd: &str, workspace_group_id: &str) -> ToolResult {
        let name = self.container_name(workspace_group_id);
        if let Err(reason) = self.ensure_container(&name).await {
            return ToolResult {
                cmd: cmd.to_string(),
                exit_code: 127,
                stdout: String::new(),
                stderr: normalize_stream(&reason),
                runner: RunnerKind::Docker,
                workspace_group_id: workspace_group_id.to_string(),
            };
        }
        let mut command = Command::new("docker");
        command.args(["exec", &name, &self.opts.docker_shell_path, "-lc", cmd]);
        run_command(
            command,
            cmd,
            workspace_group_id,
            RunnerKind::Docker,
            &self.opts,
        )
        .await
    }
}

async fn run_command(
    mut command: Command,
    cmd: &str,
    workspace_group_id: &str,
    runner: RunnerKind,
    opts: &SandboxOptions,
) -> ToolResult {
    command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    let spawned = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ToolResult {
                cmd: cmd.to_string(),
                exit_code: 127,
                stdout: String::new(),
                stderr: normalize_stream(&format!("failed to spawn shell: {e}")),
                runner,
                workspace_group_id: workspace_group_id.to_string(),
            };
        }
    };

    let timeout = std::time::Duration::from_millis(opts.timeout_ms);
    match tokio::time::timeout(timeout, spawned.wait_with_output()).await {
        Ok(Ok(output)) => {
            let stdout = capped_lossy(&output.stdout, opts.max_buffer_bytes);
            let stderr = capped_lossy(&output.stderr, opts.max_buffer_bytes);
            ToolResult {
                cmd: cmd.to_string(),
                exit_code: output.status.code().unwrap_or(-1),
                stdout: normalize_stream(&stdout),
                stderr: normalize_stream(&stderr),
                runner,
                workspace_group_id: workspace_group_id.to_string(),
            }
        }
        Ok(Err(e)) => ToolResult {
            cmd: cmd.to_string(),
            exit_code: -1,
            stdout: String::new(),
            stderr: normalize_stream(&format!("failed to collect output: {e}")),
            runner,
            workspace_group_id: workspace_group_id.to_string(),
        },
        // kill_on_drop reaps the child when the future is dropped here
        Err(_) => ToolResult {
            cmd: cmd.to_string(),
            exit_code: TIMEOUT_EXIT_CODE,
            stdout: String::new(),
            stderr: normalize_stream(&format!("[timeout after {}ms]", opts.timeout_ms)),
            runner,
            workspace_group_id: workspace_group_id.to_string(),
        },
    }
}

fn capped_lossy(bytes: &[u8], max_bytes: usize) -> String {
    let slice = if bytes.len() > max_bytes {
        &bytes[..max_bytes]
    } else {
        bytes
    };
    String::from_utf8_lossy(slice).into_owned()
}
