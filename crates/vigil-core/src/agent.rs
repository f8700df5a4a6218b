// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, warn};

use vigil_approval::{ApprovalManager, ApprovalOutcome};
use vigil_config::Config;
use vigil_memory::LessonStore;
use vigil_model::{failover::FailureKind, Message, ModelRouter, Role, ToolCall};
use vigil_tools::{shape_observation, ToolRegistry, ToolResult};

use crate::{
    compact::{compact, emergency_truncate, Summarizer},
    events::AgentEvent,
    lessons,
    session::{PendingGate, Session, ToolHistoryEntry},
    task_state::{self, TaskState},
};

/// Parallel read-only execution pool size.
const PARALLEL_TOOL_WORKERS: usize = 4;

/// Retry budgets for loop-level error recovery.
const MAX_OVERFLOW_RETRIES: u32 = 2;
const MAX_FORMAT_RETRIES: u32 = 2;
const MAX_EMPTY_TURN_RETRIES: u32 = 2;

/// Assistant phrasings that indicate a first-round refusal while tools sit
/// unused.
const REFUSAL_PATTERNS: &[&str] = &[
    "i can't",
    "i cannot",
    "i can not",
    "i don't have access",
    "i do not have access",
    "i'm unable",
    "i am unable",
    "as an ai",
];

/// How one run ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The model replied with a final text answer (or the wrap-up summary).
    Completed { response: String },
    /// A mutating tool call is waiting on an out-of-band approval decision;
    /// state is persisted and the session carries the resume point.
    PendingApproval {
        request_id: String,
        tool_name: String,
    },
    /// The interrupt flag was observed; state is persisted.
    Interrupted { acknowledgement: String },
    /// A terminal failure after recovery was exhausted.  The message is
    /// user-facing; raw provider errors stay in the logs.
    Failed { message: String },
}

enum ToolPhase {
    Completed { failures: Vec<(String, String)> },
    Suspended { request_id: String, tool_name: String },
    Interrupted,
}

enum GateDecision {
    Approved { by_user: bool },
    Denied(String),
    Suspend(String),
}

/// The agent: drives the bounded tool-calling loop for one session at a
/// time.  Holds shared handles only, so one agent value serves the main
/// session and every subagent.
pub struct Agent {
    router: Arc<ModelRouter>,
    tools: Arc<ToolRegistry>,
    approvals: Arc<ApprovalManager>,
    config: Arc<Config>,
    lessons: Option<Arc<LessonStore>>,
    system_prompt: String,
    data_dir: PathBuf,
}

impl Agent {
    pub fn new(
        router: Arc<ModelRouter>,
        tools: Arc<ToolRegistry>,
        approvals: Arc<ApprovalManager>,
        config: Arc<Config>,
        system_prompt: String,
    ) -> Self {
        let data_dir = config.data_dir();
        Self {
            router,
            tools,
            approvals,
            config,
            lessons: None,
            system_prompt,
            data_dir,
        }
    }

    pub fn with_lessons(mut self, store: Arc<LessonStore>) -> Self {
        self.lessons = Some(store);
        self
    }

    /// Override the system prompt (subagents get a minimal one).
    pub fn with_system_prompt(mut self, prompt: String) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.router
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Run one user request to completion.
    pub async fn run(
        &self,
        session: &mut Session,
        user_message: &str,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<RunOutcome> {
        session.clear_interrupt();
        if session.messages.is_empty() {
            session.push(Message::system(self.system_prompt.clone()));
        }
        session.current_task = Some(user_message.to_string());
        session.round_count = 0;
        session.push(Message::user(user_message));
        self.run_rounds(session, tx).await
    }

    /// Resume a run suspended on an approval decision.
    pub async fn resume(
        &self,
        session: &mut Session,
        approved: bool,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<RunOutcome> {
        let Some(gate) = session.pending_gate.take() else {
            anyhow::bail!("session has no pending approval to resume");
        };
        let mut failures: Vec<(String, String)> = Vec::new();

        let result = if approved {
            self.tools.execute(&gate.call).await
        } else {
            ToolResult::denied("denied by user")
        };
        self.record_result(session, &gate.call, &result, false, tx).await;
        if !result.success() {
            failures.push((
                gate.call.name.clone(),
                result.error.clone().unwrap_or_else(|| "error".into()),
            ));
        }

        match self
            .run_sequential(session, gate.remaining.into(), tx, &mut failures)
            .await
        {
            ToolPhase::Completed { .. } => {}
            ToolPhase::Suspended {
                request_id,
                tool_name,
            } => {
                self.save_state(session);
                return Ok(RunOutcome::PendingApproval {
                    request_id,
                    tool_name,
                });
            }
            ToolPhase::Interrupted => return self.interrupt_exit(session, tx).await,
        }
        self.push_failure_note(session, &failures);
        self.run_rounds(session, tx).await
    }

    // ── The round loop ───────────────────────────────────────────────────────

    async fn run_rounds(
        &self,
        session: &mut Session,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<RunOutcome> {
        let mut overflow_retries = 0u32;
        let mut format_retries = 0u32;
        let mut empty_turn_retries = 0u32;
        let mut clarification_sent = false;
        let schemas = if self.config.tools_enabled {
            self.tools.schemas()
        } else {
            Vec::new()
        };

        loop {
            if session.interrupted() {
                return self.interrupt_exit(session, tx).await;
            }
            if session.round_count >= self.config.max_rounds {
                return self.wrap_up(session, tx).await;
            }
            session.round_count += 1;
            let _ = tx
                .send(AgentEvent::RoundStarted {
                    round: session.round_count,
                })
                .await;

            // Proactive compaction before the call.
            let threshold = (self.config.context_window_tokens as f32
                * self.config.compaction_threshold) as usize;
            if session.token_estimate() > threshold {
                self.compact_session(session, self.config.context_window_tokens / 2, tx)
                    .await;
            }

            let resp = self
                .router
                .call(&session.messages, &schemas, &self.config.model)
                .await?;

            if let Some(kind) = resp.error {
                match kind {
                    FailureKind::ContextOverflow => {
                        overflow_retries += 1;
                        if overflow_retries > MAX_OVERFLOW_RETRIES {
                            return Ok(RunOutcome::Failed {
                                message: "The conversation no longer fits the model's \
                                          context window."
                                    .into(),
                            });
                        }
                        warn!(attempt = overflow_retries, "context overflow; force-compacting");
                        self.compact_session(session, self.config.context_window_tokens / 4, tx)
                            .await;
                        if session.token_estimate() > self.config.context_window_tokens / 2 {
                            let before = session.token_estimate();
                            session.messages = emergency_truncate(&session.messages);
                            let _ = tx
                                .send(AgentEvent::ContextCompacted {
                                    tokens_before: before,
                                    tokens_after: session.token_estimate(),
                                })
                                .await;
                        }
                        session.round_count -= 1;
                        continue;
                    }
                    FailureKind::FormatError => {
                        format_retries += 1;
                        if format_retries > MAX_FORMAT_RETRIES {
                            // Third occurrence: rebuild the context from
                            // scratch and let the model find a simpler path.
                            warn!("repeated format errors; rebuilding context from scratch");
                            self.rebuild_recovery_context(session);
                            format_retries = 0;
                            continue;
                        }
                        warn!(attempt = format_retries, "format error; dropping trailing turns");
                        while session
                            .messages
                            .last()
                            .map(|m| m.role == Role::Assistant)
                            .unwrap_or(false)
                        {
                            session.messages.pop();
                        }
                        session.push(Message::system(
                            "The previous response could not be processed. \
                             Reassess and take a simpler approach.",
                        ));
                        session.round_count -= 1;
                        continue;
                    }
                    FailureKind::ContentFilter => {
                        let message =
                            "The provider declined to answer that; try rephrasing the request."
                                .to_string();
                        session.push(Message::assistant(message.clone()));
                        let _ = tx.send(AgentEvent::TextComplete(message.clone())).await;
                        let _ = tx.send(AgentEvent::TurnComplete).await;
                        self.finish_task(session);
                        return Ok(RunOutcome::Completed { response: message });
                    }
                    other => {
                        warn!(kind = %other, attempts = resp.attempts.len(), "model call failed terminally");
                        let _ = tx
                            .send(AgentEvent::Error(format!("model call failed ({other})")))
                            .await;
                        return Ok(RunOutcome::Failed {
                            message: "The language model is currently unavailable. \
                                      Please try again shortly."
                                .into(),
                        });
                    }
                }
            }

            if let Some(thinking) = &resp.thinking {
                let _ = tx.send(AgentEvent::Thinking(thinking.clone())).await;
            }

            // ── No tool calls: final answer (with first-round refusal nudge)
            if resp.tool_calls.is_empty() {
                if resp.content.trim().is_empty() && empty_turn_retries < MAX_EMPTY_TURN_RETRIES {
                    empty_turn_retries += 1;
                    session.push(Message::user(
                        "You produced no response or tool call. Please continue with \
                         your next action.",
                    ));
                    session.round_count -= 1;
                    continue;
                }
                if session.round_count == 1
                    && !clarification_sent
                    && session.tool_history.is_empty()
                    && is_refusal(&resp.content)
                {
                    clarification_sent = true;
                    debug!("first-round refusal; injecting tool clarification");
                    session.push(Message::assistant(resp.content.clone()));
                    session.push(Message::user(format!(
                        "You DO have tools available to you: {}. Use them to fulfil \
                         the request instead of declining.",
                        self.tools.names().join(", ")
                    )));
                    session.round_count -= 1;
                    continue;
                }
                empty_turn_retries = 0;
                session.push(Message::assistant(resp.content.clone()));
                let _ = tx.send(AgentEvent::TextComplete(resp.content.clone())).await;
                let _ = tx.send(AgentEvent::TurnComplete).await;
                self.finish_task(session);
                return Ok(RunOutcome::Completed {
                    response: resp.content,
                });
            }

            // ── Tool calls: one assistant message carries the whole round.
            empty_turn_retries = 0;
            let mut assistant =
                Message::assistant_with_tool_calls(resp.content.clone(), resp.tool_calls.clone());
            assistant.raw_parts = resp.raw_parts.clone();
            session.push(assistant);
            for call in &resp.tool_calls {
                let _ = tx.send(AgentEvent::ToolCallStarted(call.clone())).await;
            }

            let all_readonly = resp.tool_calls.iter().all(|c| self.tools.is_readonly(c));
            let phase = if all_readonly && self.config.tools_auto_execute {
                self.run_parallel(session, resp.tool_calls, tx).await
            } else {
                let mut failures = Vec::new();
                let phase = self
                    .run_sequential(session, resp.tool_calls.into(), tx, &mut failures)
                    .await;
                match phase {
                    ToolPhase::Completed { .. } => ToolPhase::Completed { failures },
                    other => other,
                }
            };

            match phase {
                ToolPhase::Completed { failures } => {
                    self.push_failure_note(session, &failures);
                }
                ToolPhase::Suspended {
                    request_id,
                    tool_name,
                } => {
                    self.save_state(session);
                    return Ok(RunOutcome::PendingApproval {
                        request_id,
                        tool_name,
                    });
                }
                ToolPhase::Interrupted => return self.interrupt_exit(session, tx).await,
            }
        }
    }

    // ── Tool execution ───────────────────────────────────────────────────────

    /// Concurrent execution for an all-read-only round: worker pool of
    /// [`PARALLEL_TOOL_WORKERS`], results appended in original call order.
    async fn run_parallel(
        &self,
        session: &mut Session,
        calls: Vec<ToolCall>,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> ToolPhase {
        let semaphore = Arc::new(Semaphore::new(PARALLEL_TOOL_WORKERS));
        let mut tasks = Vec::with_capacity(calls.len());
        for call in calls.clone() {
            let registry = Arc::clone(&self.tools);
            let permit_sem = Arc::clone(&semaphore);
            tasks.push(tokio::spawn(async move {
                let _permit = permit_sem.acquire_owned().await;
                registry.execute(&call).await
            }));
        }

        let mut failures = Vec::new();
        for (call, task) in calls.iter().zip(tasks) {
            let result = match task.await {
                Ok(r) => r,
                Err(e) => ToolResult::err(format!("tool task panicked: {e}")),
            };
            self.record_result(session, call, &result, true, tx).await;
            if !result.success() {
                failures.push((
                    call.name.clone(),
                    result.error.clone().unwrap_or_else(|| "error".into()),
                ));
            }
        }
        ToolPhase::Completed { failures }
    }

    /// Sequential execution with approval gating and interrupt checks
    /// between calls.  May suspend on a pending approval.
    async fn run_sequential(
        &self,
        session: &mut Session,
        mut queue: VecDeque<ToolCall>,
        tx: &mpsc::Sender<AgentEvent>,
        failures: &mut Vec<(String, String)>,
    ) -> ToolPhase {
        while let Some(call) = queue.pop_front() {
            if session.interrupted() {
                return ToolPhase::Interrupted;
            }

            let (result, auto_executed) = if self.tools.is_readonly(&call) {
                (self.tools.execute(&call).await, true)
            } else {
                match self.gate(session, &call) {
                    GateDecision::Approved { by_user } => {
                        (self.tools.execute(&call).await, !by_user)
                    }
                    GateDecision::Denied(reason) => (ToolResult::denied(reason), true),
                    GateDecision::Suspend(request_id) => {
                        let _ = tx
                            .send(AgentEvent::PendingApproval {
                                request_id: request_id.clone(),
                                tool_name: call.name.clone(),
                                command: command_repr(&call),
                            })
                            .await;
                        session.pending_gate = Some(PendingGate {
                            request_id: request_id.clone(),
                            call: call.clone(),
                            remaining: queue.into_iter().collect(),
                        });
                        return ToolPhase::Suspended {
                            request_id,
                            tool_name: call.name,
                        };
                    }
                }
            };

            self.record_result(session, &call, &result, auto_executed, tx).await;
            if !result.success() {
                failures.push((
                    call.name.clone(),
                    result.error.clone().unwrap_or_else(|| "error".into()),
                ));
            }
        }
        ToolPhase::Completed {
            failures: Vec::new(),
        }
    }

    /// Approval gate for one mutating call.
    fn gate(&self, session: &Session, call: &ToolCall) -> GateDecision {
        let command = command_repr(call);
        let request = self.approvals.check(&command, &call.name, &session.key);
        match request.result {
            ApprovalOutcome::Denied => GateDecision::Denied(
                request
                    .reason
                    .unwrap_or_else(|| "denied by approval policy".into()),
            ),
            ApprovalOutcome::Pending => GateDecision::Suspend(request.id),
            ApprovalOutcome::Timeout => GateDecision::Denied("approval timed out".into()),
            ApprovalOutcome::Approved => {
                let by = request.approved_by.as_deref().unwrap_or("auto");
                if self.config.tools_auto_execute || by == "user" || by == "allowlist" {
                    GateDecision::Approved {
                        by_user: by == "user",
                    }
                } else {
                    // A bare default-policy approval does not satisfy
                    // non-auto-execute mode; the user decides out of band.
                    GateDecision::Suspend(request.id)
                }
            }
        }
    }

    /// Append the observation message, record history, emit the event.
    async fn record_result(
        &self,
        session: &mut Session,
        call: &ToolCall,
        result: &ToolResult,
        auto_executed: bool,
        tx: &mpsc::Sender<AgentEvent>,
    ) {
        let observation = shape_observation(&call.name, &call.arguments, result);
        session.push(Message::tool_result(&call.id, &call.name, &observation));
        session.tool_history.push(ToolHistoryEntry {
            tool: call.name.clone(),
            args: call.arguments.clone(),
            result: observation.chars().take(500).collect(),
            success: result.success(),
            auto_executed,
        });
        let _ = tx
            .send(AgentEvent::ToolCallFinished {
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                observation,
                success: result.success(),
            })
            .await;
    }

    fn push_failure_note(&self, session: &mut Session, failures: &[(String, String)]) {
        if failures.is_empty() {
            return;
        }
        let note = failures
            .iter()
            .map(|(tool, err)| {
                let short: String = err.chars().take(120).collect();
                format!("tool {tool}: {short}")
            })
            .collect::<Vec<_>>()
            .join("; ");
        session.push(Message::system(format!("Tool failures this round: {note}")));
    }

    // ── Termination paths ────────────────────────────────────────────────────

    /// Max rounds reached: one final tool-free wrap-up turn, with a
    /// deterministic summary if the model cannot provide one.
    async fn wrap_up(
        &self,
        session: &mut Session,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<RunOutcome> {
        session.push(Message::user(format!(
            "You have reached the maximum tool budget ({} rounds). Do not call any \
             more tools. Write a concise summary of: (1) what has been completed, \
             (2) what still remains, and (3) how to continue.",
            self.config.max_rounds
        )));
        let resp = self
            .router
            .call(&session.messages, &[], &self.config.model)
            .await?;
        let summary = if resp.ok() && !resp.content.trim().is_empty() {
            resp.content
        } else {
            self.fallback_summary(session)
        };
        session.push(Message::assistant(summary.clone()));
        self.save_state(session);
        let _ = tx.send(AgentEvent::TextComplete(summary.clone())).await;
        let _ = tx.send(AgentEvent::TurnComplete).await;
        Ok(RunOutcome::Completed { response: summary })
    }

    fn fallback_summary(&self, session: &Session) -> String {
        let done: Vec<String> = session
            .tool_history
            .iter()
            .rev()
            .take(5)
            .map(|e| {
                format!(
                    "- {} ({})",
                    e.tool,
                    if e.success { "ok" } else { "failed" }
                )
            })
            .collect();
        format!(
            "Stopped after {} rounds without finishing. Recent tool activity:\n{}\n\
             The task state is saved; say 'continue' to resume.",
            session.round_count,
            done.join("\n")
        )
    }

    async fn interrupt_exit(
        &self,
        session: &mut Session,
        tx: &mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<RunOutcome> {
        self.save_state(session);
        let acknowledgement = match session.last_tool() {
            Some(tool) => format!(
                "Paused — the last thing I ran was {tool}. Task state is saved; \
                 say 'continue' to pick it back up."
            ),
            None => "Paused before taking any action. Say 'continue' to resume.".to_string(),
        };
        let _ = tx
            .send(AgentEvent::Interrupted {
                last_tool: session.last_tool().map(|t| t.to_string()),
            })
            .await;
        Ok(RunOutcome::Interrupted { acknowledgement })
    }

    /// Natural completion: clear the snapshot and fire lesson extraction.
    fn finish_task(&self, session: &Session) {
        task_state::clear(&self.data_dir);
        if let (Some(store), Some(task)) = (&self.lessons, &session.current_task) {
            if session.tool_history.len() >= lessons::MIN_CALLS_FOR_EXTRACTION {
                lessons::spawn_extraction(
                    Arc::clone(store),
                    task.clone(),
                    session.tool_history.clone(),
                );
            }
        }
    }

    fn save_state(&self, session: &Session) {
        let state = TaskState {
            task: session.current_task.clone().unwrap_or_default(),
            tool_history: session.tool_history.clone(),
            round_count: session.round_count,
            model: self.config.model.clone(),
        };
        if let Err(e) = task_state::save(&self.data_dir, &state) {
            warn!("failed to persist task state: {e:#}");
        }
    }

    // ── Context management ───────────────────────────────────────────────────

    async fn compact_session(
        &self,
        session: &mut Session,
        max_tokens: usize,
        tx: &mpsc::Sender<AgentEvent>,
    ) {
        let tokens_before = session.token_estimate();
        let summarizer = RouterSummarizer {
            router: Arc::clone(&self.router),
            model: self.config.model.clone(),
        };
        let (messages, stats) = compact(
            &session.messages,
            max_tokens,
            self.config.compaction_preserve_recent,
            Some(&summarizer),
            self.config.context_window_tokens,
        )
        .await;
        if stats.dropped_count == 0 {
            return;
        }
        session.messages = messages;
        let _ = tx
            .send(AgentEvent::ContextCompacted {
                tokens_before,
                tokens_after: session.token_estimate(),
            })
            .await;
    }

    /// Third-strike format recovery: a fresh context containing only the
    /// original task, a compact log of prior tool calls, and the simpler-path
    /// instruction.
    fn rebuild_recovery_context(&self, session: &mut Session) {
        let system = session
            .messages
            .iter()
            .find(|m| m.role == Role::System)
            .cloned()
            .unwrap_or_else(|| Message::system(self.system_prompt.clone()));
        let task = session.current_task.clone().unwrap_or_default();
        let log: Vec<String> = session
            .tool_history
            .iter()
            .map(|e| {
                let short: String = e.result.chars().take(100).collect();
                format!(
                    "- {} {} → {}",
                    e.tool,
                    if e.success { "ok" } else { "FAILED" },
                    short
                )
            })
            .collect();
        let recovery = format!(
            "Original task: {task}\n\nEarlier attempts hit repeated response-format \
             errors. Tool activity so far:\n{}\n\nStart over and find a simpler way \
             to complete the task.",
            if log.is_empty() {
                "(none)".to_string()
            } else {
                log.join("\n")
            }
        );
        session.messages = vec![system, Message::user(recovery)];
    }
}

/// Command string handed to the approval gate: the bash command itself, or
/// the tool name plus serialised arguments for everything else.
fn command_repr(call: &ToolCall) -> String {
    if call.name == "bash" {
        if let Some(cmd) = call.arguments.get("command").and_then(|c| c.as_str()) {
            return cmd.to_string();
        }
    }
    format!("{} {}", call.name, call.arguments)
}

fn is_refusal(text: &str) -> bool {
    let lower = text.to_lowercase();
    REFUSAL_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Summarizer backed by the model router; used by the compactor.
struct RouterSummarizer {
    router: Arc<ModelRouter>,
    model: String,
}

#[async_trait]
impl Summarizer for RouterSummarizer {
    async fn summarize(
        &self,
        text: &str,
        instructions: Option<&str>,
        previous_summary: Option<&str>,
    ) -> anyhow::Result<Option<String>> {
        let mut prompt = String::new();
        if let Some(prev) = previous_summary {
            prompt.push_str(&format!("Summary of the conversation so far:\n{prev}\n\n"));
        }
        prompt.push_str(instructions.unwrap_or("Summarise the following."));
        prompt.push_str("\n\n---\n\n");
        prompt.push_str(text);

        let messages = [Message::user(prompt)];
        let resp = self.router.call(&messages, &[], &self.model).await?;
        if resp.ok() && !resp.content.trim().is_empty() {
            Ok(Some(resp.content))
        } else {
            Ok(None)
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
