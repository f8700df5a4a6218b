// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

use crate::agent::{Agent, RunOutcome};
use crate::events::AgentEvent;
use crate::prompts::subagent_system_prompt;
use crate::session::SessionManager;

/// Result of one subagent task.
#[derive(Debug, Clone)]
pub struct SubagentResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub session_key: String,
}

/// Runs child agent loops against isolated sessions, bounded by a worker
/// pool.  The parent session is never touched; subagents share the tool
/// registry through the agent they are given.
pub struct SubagentExecutor {
    agent: Arc<Agent>,
    sessions: Arc<SessionManager>,
    pool: Arc<Semaphore>,
}

impl SubagentExecutor {
    pub fn new(agent: Arc<Agent>, sessions: Arc<SessionManager>, max_concurrent: usize) -> Self {
        Self {
            agent,
            sessions,
            pool: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Run `message` through a fresh isolated session under `name`.
    /// Blocks while the pool is saturated.
    pub async fn spawn(&self, name: &str, message: &str) -> SubagentResult {
        let _permit = self.pool.acquire().await;
        let (key, session) = self.sessions.create_isolated(&format!("subagent-{name}"));
        debug!(session = %key, "subagent starting");

        let prompt = subagent_system_prompt(name, &self.agent.tools().names());
        // Events are consumed quietly; only the final outcome is reported.
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(256);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let outcome = {
            let mut guard = session.lock().await;
            guard.push(vigil_model::Message::system(prompt));
            self.agent.run(&mut guard, message, &tx).await
        };
        drop(tx);
        let _ = drain.await;

        let result = match outcome {
            Ok(RunOutcome::Completed { response }) => SubagentResult {
                success: true,
                output: response,
                error: None,
                session_key: key.clone(),
            },
            Ok(RunOutcome::Interrupted { acknowledgement }) => SubagentResult {
                success: false,
                output: acknowledgement,
                error: Some("interrupted".into()),
                session_key: key.clone(),
            },
            Ok(RunOutcome::PendingApproval { tool_name, .. }) => SubagentResult {
                success: false,
                output: String::new(),
                error: Some(format!("blocked on approval for {tool_name}")),
                session_key: key.clone(),
            },
            Ok(RunOutcome::Failed { message }) => SubagentResult {
                success: false,
                output: String::new(),
                error: Some(message),
                session_key: key.clone(),
            },
            Err(e) => SubagentResult {
                success: false,
                output: String::new(),
                error: Some(format!("{e:#}")),
                session_key: key.clone(),
            },
        };
        debug!(session = %key, success = result.success, "subagent finished");
        result
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use vigil_approval::ApprovalManager;
    use vigil_config::Config;
    use vigil_model::{ModelRouter, ScriptedMockProvider};
    use vigil_tools::ToolRegistry;

    fn agent_with_mock(mock: ScriptedMockProvider, dir: &std::path::Path) -> Arc<Agent> {
        let mut config = Config::default();
        config.model = "mock-primary".into();
        config.data_dir = Some(dir.to_string_lossy().to_string());
        let config = Arc::new(config);
        let provider = Arc::new(mock);
        let router = Arc::new(ModelRouter::with_factory(
            Arc::clone(&config),
            Box::new(move |model| {
                if model == "mock-primary" {
                    Ok(Arc::clone(&provider) as Arc<dyn vigil_model::ModelProvider>)
                } else {
                    anyhow::bail!("model '{model}' not found")
                }
            }),
        ));
        let approvals = Arc::new(ApprovalManager::new(config.approval.clone(), dir));
        Arc::new(Agent::new(
            router,
            Arc::new(ToolRegistry::new()),
            approvals,
            config,
            "main prompt".into(),
        ))
    }

    #[tokio::test]
    async fn subagent_runs_in_isolated_session() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent_with_mock(ScriptedMockProvider::always_text("sub result"), dir.path());
        let sessions = Arc::new(SessionManager::new());
        let exec = SubagentExecutor::new(agent, Arc::clone(&sessions), 3);

        let result = exec.spawn("indexer", "index the repo").await;
        assert!(result.success);
        assert_eq!(result.output, "sub result");
        assert!(result.session_key.starts_with("subagent-indexer-"));
        assert_ne!(result.session_key, "main");
    }

    #[tokio::test]
    async fn parent_main_session_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let agent = agent_with_mock(ScriptedMockProvider::always_text("ok"), dir.path());
        let sessions = Arc::new(SessionManager::new());
        let exec = SubagentExecutor::new(agent, Arc::clone(&sessions), 3);

        exec.spawn("helper", "do a thing").await;

        let main = sessions.get_or_create("main");
        let guard = main.lock().await;
        assert!(guard.messages.is_empty(), "main session must be unaffected");
    }

    #[tokio::test]
    async fn subagent_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // Exhausts retries with a non-retryable auth error.
        let agent = agent_with_mock(
            ScriptedMockProvider::with_scripts(vec![Err("mock error 401: no".into())]),
            dir.path(),
        );
        let sessions = Arc::new(SessionManager::new());
        let exec = SubagentExecutor::new(agent, sessions, 3);

        let result = exec.spawn("doomed", "try anyway").await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }
}
