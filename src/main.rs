use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use localscout::agent::{load_worker_system_prompt, AgentLoop, UserPrompter};
use localscout::config::{load_config, RuntimeConfig};
use localscout::events::{EventSink, JsonlFileSink, MultiSink, StdoutSink};
use localscout::provider::{HttpConfig, OpenAiCompatApi};
use localscout::registry::{load_registry, route_agent, AgentMode, AgentOverrides};
use localscout::sandbox::{build_sandbox, SandboxMode};
use localscout::session::SessionStore;

#[derive(Debug, Parser)]
#[command(name = "localscout", about = "Local-LLM agent host", version)]
struct Cli {
    /// Path to a JSON config file; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one goal through the agent loop.
    Run(RunArgs),
    /// List registry agents and models.
    Models,
    /// Inspect or reset stored sessions.
    Session(SessionArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// The natural-language goal.
    goal: String,

    #[arg(long, default_value = "default")]
    agent: String,

    #[arg(long, value_enum)]
    mode: Option<AgentMode>,

    #[arg(long)]
    max_steps: Option<u32>,

    /// Force token streaming on, overriding the registry entry.
    #[arg(long, overrides_with = "no_stream")]
    stream: bool,

    /// Force token streaming off, overriding the registry entry.
    #[arg(long, overrides_with = "stream")]
    no_stream: bool,

    /// Session id; a fresh one is generated when omitted.
    #[arg(long)]
    session: Option<String>,

    /// Workspace group pinning the sandbox filesystem; defaults to the
    /// session id.
    #[arg(long)]
    workspace_group: Option<String>,

    #[arg(long, value_enum)]
    sandbox: Option<SandboxMode>,

    /// Append every event as JSONL to this file.
    #[arg(long)]
    events_file: Option<PathBuf>,

    /// Answer every worker question with YES instead of prompting.
    #[arg(long, default_value_t = false)]
    yes: bool,

    /// Suppress token streaming on stdout.
    #[arg(long, default_value_t = false)]
    quiet: bool,
}

#[derive(Debug, Parser)]
struct SessionArgs {
    #[command(subcommand)]
    command: SessionCommand,
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    Show { id: String },
    Reset { id: String },
}

/// Reads one trimmed line from stdin per question.
struct StdinPrompter;

#[async_trait]
impl UserPrompter for StdinPrompter {
    async fn ask(&self, question: &str) -> anyhow::Result<String> {
        use tokio::io::{AsyncBufReadExt, BufReader};
        eprintln!("\n[question] {question}");
        eprint!("[answer] > ");
        let mut line = String::new();
        let mut reader = BufReader::new(tokio::io::stdin());
        reader
            .read_line(&mut line)
            .await
            .context("failed reading answer from stdin")?;
        Ok(line.trim().to_string())
    }
}

struct AlwaysYesPrompter;

#[async_trait]
impl UserPrompter for AlwaysYesPrompter {
    async fn ask(&self, question: &str) -> anyhow::Result<String> {
        eprintln!("\n[question] {question}\n[answer] > YES (auto)");
        Ok("YES".to_string())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Run(args) => run_goal(cfg, args).await,
        Commands::Models => list_models(cfg),
        Commands::Session(args) => session_command(cfg, args),
    }
}

async fn run_goal(mut cfg: RuntimeConfig, args: RunArgs) -> anyhow::Result<()> {
    if let Some(mode) = args.sandbox {
        cfg.sandbox.mode = mode;
    }
    let stream_override = if args.stream {
        Some(true)
    } else if args.no_stream {
        Some(false)
    } else {
        None
    };
    let registry = load_registry(&cfg.registry_path)?;
    let routed = route_agent(
        &registry,
        &args.agent,
        &AgentOverrides {
            mode: args.mode,
            max_steps: args.max_steps,
            stream: stream_override,
        },
    )?;
    let worker_system_prompt = load_worker_system_prompt(&cfg.worker_prompt_path)?;

    let http = HttpConfig::default();
    let worker_api = Arc::new(OpenAiCompatApi::new(routed.worker.clone(), http)?);
    let main_api = Arc::new(OpenAiCompatApi::new(routed.main.clone(), http)?);
    let sandbox: Arc<dyn localscout::sandbox::SandboxExec> =
        Arc::from(build_sandbox(cfg.sandbox.clone()));

    let store = SessionStore::new(cfg.session_dir.clone());
    let session_id = args
        .session
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let mut session = store.load_or_create(&session_id, None)?;

    let mut sinks = MultiSink::new();
    if !args.quiet {
        sinks.push(Box::new(StdoutSink::new()));
    }
    if let Some(path) = &args.events_file {
        sinks.push(Box::new(JsonlFileSink::new(path)?));
    }
    let sink: Option<Box<dyn EventSink>> = if sinks.is_empty() {
        None
    } else {
        Some(Box::new(sinks))
    };
    let prompter: Box<dyn UserPrompter> = if args.yes {
        Box::new(AlwaysYesPrompter)
    } else {
        Box::new(StdinPrompter)
    };

    let mut agent = AgentLoop {
        cfg,
        routed,
        worker_api,
        main_api,
        sandbox,
        store,
        sink,
        prompter: Some(prompter),
        cancel: CancellationToken::new(),
        worker_system_prompt,
        workspace_group_override: args.workspace_group.clone(),
    };
    let summary = agent.run(&mut session, &args.goal).await?;

    println!("\n\n=== final answer ===\n{}", summary.summary);
    eprintln!(
        "\n[run] session={session_id} agent={} mode={} steps={} evidence={}",
        summary.agent_id,
        summary.mode,
        summary.steps,
        summary.evidence.len()
    );
    Ok(())
}

fn list_models(cfg: RuntimeConfig) -> anyhow::Result<()> {
    let registry = load_registry(&cfg.registry_path)?;
    println!("models:");
    for model in &registry.models {
        println!(
            "  {}  provider={} model={} ctx={}",
            model.id,
            model.provider,
            model.model_name,
            model
                .context_length
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    println!("agents:");
    for (id, entry) in &registry.agents {
        println!(
            "  {id}  mode={} max_steps={} main={} worker={}",
            entry.mode.as_str(),
            entry.max_steps,
            entry.main,
            entry.worker.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn session_command(cfg: RuntimeConfig, args: SessionArgs) -> anyhow::Result<()> {
    let store = SessionStore::new(cfg.session_dir.clone());
    match args.command {
        SessionCommand::Show { id } => {
            let session = store.load_or_create(&id, None)?;
            println!(
                "session {} created={} updated={} messages={}",
                session.id,
                session.created_at,
                session.updated_at,
                session.messages.len()
            );
            for message in &session.messages {
                println!("[{}] {}", message.role.as_str(), message.content);
            }
        }
        SessionCommand::Reset { id } => {
            store.reset(&id, None)?;
            println!("session {id} reset");
        }
    }
    Ok(())
}
