// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use vigil_approval::ApprovalManager;
use vigil_config::Config;
use vigil_core::{
    prompts, task_state, Agent, AgentEvent, RunOutcome, Session, SessionManager,
    SubagentExecutor, TaskTool,
};
use vigil_memory::LessonStore;
use vigil_model::ModelRouter;
use vigil_scheduler::{CircuitsRunner, EventQueue, EventWatcher, PollHandler, CIRCUITS_SESSION};
use vigil_tools::{BashTool, TextEditorTool, ToolRegistry, WebFetchTool, WebSearchTool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = vigil_config::load(cli.config.as_deref())?;
    if let Some(model) = &cli.model {
        config.model = model.clone();
    }
    let config = Arc::new(config);

    match &cli.command {
        Some(Commands::ShowConfig) => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            return Ok(());
        }
        Some(Commands::Approvals { limit }) => {
            return show_approvals(&config, *limit);
        }
        Some(Commands::Lessons) => {
            return show_lessons(&config);
        }
        _ => {}
    }

    let runtime = Runtime::new(Arc::clone(&config))?;

    match cli.command {
        Some(Commands::Chat) => runtime.chat().await,
        Some(Commands::Circuits) => runtime.circuits().await,
        None => {
            let prompt = match cli.prompt {
                Some(p) => p,
                None => read_stdin()?,
            };
            runtime.one_shot(&prompt).await
        }
        _ => unreachable!("handled above"),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn read_stdin() -> anyhow::Result<String> {
    let mut input = String::new();
    std::io::Read::read_to_string(&mut std::io::stdin(), &mut input)
        .context("reading prompt from stdin")?;
    let trimmed = input.trim().to_string();
    anyhow::ensure!(!trimmed.is_empty(), "no prompt given (argument or stdin)");
    Ok(trimmed)
}

/// Long-lived runtime state: the agent plus its shared collaborators.
struct Runtime {
    config: Arc<Config>,
    agent: Arc<Agent>,
    sessions: Arc<SessionManager>,
    queue: Arc<EventQueue>,
    busy: Arc<AtomicBool>,
}

impl Runtime {
    fn new(config: Arc<Config>) -> anyhow::Result<Self> {
        let router = Arc::new(ModelRouter::new(Arc::clone(&config)));
        let approvals = Arc::new(ApprovalManager::new(
            config.approval.clone(),
            config.data_dir(),
        ));
        let lessons = Arc::new(LessonStore::open(config.data_dir().join("lessons.json")));
        if let Err(e) = lessons.decay() {
            tracing::warn!("lesson decay failed: {e:#}");
        }
        let sessions = Arc::new(SessionManager::new());

        let base_tools = |registry: &mut ToolRegistry| {
            registry.register(BashTool::default());
            registry.register(TextEditorTool);
            registry.register(WebFetchTool::default());
            registry.register(WebSearchTool::new(None));
        };

        // Subagents get the standard tools but no `task` tool — nesting is
        // bounded at one level.
        let mut sub_registry = ToolRegistry::new();
        if config.tools_enabled {
            base_tools(&mut sub_registry);
        }
        let sub_agent = Arc::new(Agent::new(
            Arc::clone(&router),
            Arc::new(sub_registry),
            Arc::clone(&approvals),
            Arc::clone(&config),
            String::new(),
        ));
        let executor = Arc::new(SubagentExecutor::new(
            sub_agent,
            Arc::clone(&sessions),
            config.subagent_pool_size,
        ));

        let mut registry = ToolRegistry::new();
        if config.tools_enabled {
            base_tools(&mut registry);
            registry.register(TaskTool::new(executor));
        }
        let registry = Arc::new(registry);

        let cwd = std::env::current_dir().unwrap_or_else(|_| ".".into());
        let system_prompt = prompts::compose_system_prompt(&cwd, &registry.names());

        let agent = Arc::new(
            Agent::new(
                router,
                registry,
                approvals,
                Arc::clone(&config),
                system_prompt,
            )
            .with_lessons(lessons),
        );

        Ok(Self {
            config,
            agent,
            sessions,
            queue: Arc::new(EventQueue::new()),
            busy: Arc::new(AtomicBool::new(false)),
        })
    }

    async fn one_shot(&self, prompt: &str) -> anyhow::Result<()> {
        let session = self.sessions.get_or_create("main");
        let mut session = session.lock().await;
        let response = self.drive(&mut session, prompt).await?;
        println!("{response}");
        Ok(())
    }

    async fn chat(&self) -> anyhow::Result<()> {
        if let Some(state) = task_state::load(&self.config.data_dir()) {
            println!(
                "[unfinished task from last session: {:?} ({} rounds) — say 'continue' to resume]",
                state.task, state.round_count
            );
        }
        let session = self.sessions.get_or_create("main");
        let stdin = std::io::stdin();
        loop {
            print!("> ");
            std::io::stdout().flush().ok();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                return Ok(());
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "exit" || line == "quit" {
                return Ok(());
            }
            let mut session = session.lock().await;
            match self.drive(&mut session, line).await {
                Ok(response) => println!("{response}"),
                Err(e) => eprintln!("error: {e:#}"),
            }
        }
    }

    /// Run one request on a session, rendering progress events to stderr.
    async fn drive(&self, session: &mut Session, prompt: &str) -> anyhow::Result<String> {
        self.busy.store(true, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
        let renderer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    AgentEvent::ToolCallStarted(call) => {
                        eprintln!("[tool] {} {}", call.name, call.arguments);
                    }
                    AgentEvent::ToolCallFinished {
                        tool_name, success, ..
                    } => {
                        eprintln!(
                            "[tool] {tool_name} {}",
                            if success { "ok" } else { "failed" }
                        );
                    }
                    AgentEvent::ContextCompacted {
                        tokens_before,
                        tokens_after,
                    } => {
                        eprintln!("[context compacted {tokens_before} -> {tokens_after} tokens]");
                    }
                    AgentEvent::PendingApproval {
                        tool_name, command, ..
                    } => {
                        eprintln!("[approval needed for {tool_name}: {command}]");
                    }
                    _ => {}
                }
            }
        });

        let outcome = self.agent.run(session, prompt, &tx).await;
        drop(tx);
        let _ = renderer.await;
        self.busy.store(false, Ordering::SeqCst);

        match outcome? {
            RunOutcome::Completed { response } => Ok(response),
            RunOutcome::Interrupted { acknowledgement } => Ok(acknowledgement),
            RunOutcome::PendingApproval { tool_name, .. } => Ok(format!(
                "Waiting on approval for {tool_name}. Decide from a front-end and resume."
            )),
            RunOutcome::Failed { message } => Ok(message),
        }
    }

    /// Background runtime: circuits poller + event watcher, until Ctrl-C.
    async fn circuits(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.config.circuits_enabled,
            "circuits are disabled; set circuits_enabled=true in the config"
        );
        std::fs::create_dir_all(self.config.events_dir()).ok();

        let handler = Arc::new(RuntimeHandler {
            agent: Arc::clone(&self.agent),
            sessions: Arc::clone(&self.sessions),
            busy: Arc::clone(&self.busy),
        });
        let active_hours = match (
            self.config.circuits_active_start,
            self.config.circuits_active_end,
        ) {
            (Some(start), Some(end)) => Some((start, end)),
            _ => None,
        };
        let runner = Arc::new(CircuitsRunner::new(
            Arc::clone(&self.queue),
            handler,
            Duration::from_secs(self.config.circuits_interval_seconds),
            active_hours,
        ));

        let wake_runner = Arc::clone(&runner);
        let watcher = Arc::new(EventWatcher::new(
            self.config.events_dir(),
            Arc::clone(&self.queue),
            Some(Arc::new(move || wake_runner.request_now())),
            Duration::from_secs(self.config.watcher_poll_seconds),
        ));

        let runner_task = tokio::spawn(Arc::clone(&runner).run());
        let watcher_task = tokio::spawn(watcher.run());

        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        runner_task.abort();
        watcher_task.abort();
        Ok(())
    }
}

/// Circuits glue: polls run through the main session; substantive output
/// goes to stdout.
struct RuntimeHandler {
    agent: Arc<Agent>,
    sessions: Arc<SessionManager>,
    busy: Arc<AtomicBool>,
}

#[async_trait]
impl PollHandler for RuntimeHandler {
    async fn handle_poll(&self, prompt: String) -> anyhow::Result<String> {
        let session = self.sessions.get_or_create(CIRCUITS_SESSION);
        let mut session = session.lock().await;
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let outcome = self.agent.run(&mut session, &prompt, &tx).await;
        drop(tx);
        let _ = drain.await;
        match outcome? {
            RunOutcome::Completed { response } => Ok(response),
            RunOutcome::Interrupted { .. } => Ok(String::new()),
            RunOutcome::PendingApproval { .. } => Ok(String::new()),
            RunOutcome::Failed { message } => Ok(message),
        }
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    async fn deliver(&self, text: String) {
        println!("{text}");
    }
}

fn show_approvals(config: &Config, limit: usize) -> anyhow::Result<()> {
    let manager = ApprovalManager::new(config.approval.clone(), config.data_dir());
    for entry in manager.recent(limit) {
        println!(
            "{}  {:<8}  {:<12}  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.result,
            entry.tool,
            entry.command
        );
    }
    let stats = manager.stats();
    println!(
        "\n{} requests — {}",
        stats.total_requests,
        stats
            .by_result
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}

fn show_lessons(config: &Config) -> anyhow::Result<()> {
    let store = LessonStore::open(config.data_dir().join("lessons.json"));
    if store.is_empty() {
        println!("no lessons recorded yet");
        return Ok(());
    }
    for lesson in store.all() {
        println!(
            "[{:.2}] ({}) {}\n    -> {}",
            lesson.relevance_score, lesson.kind, lesson.pattern, lesson.lesson
        );
    }
    Ok(())
}
