// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end agent-loop scenarios against scripted mock providers.
//! Deterministic, no network access.
#[cfg(test)]
mod agent_tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    use vigil_approval::{ApprovalManager, ApprovalOutcome, ExecRequest};
    use vigil_config::{Config, DefaultPolicy};
    use vigil_model::{
        Message, ModelProvider, ModelRouter, ResponseEvent, Role, Script, ScriptedMockProvider,
    };
    use vigil_tools::{Tool, ToolCall, ToolRegistry, ToolResult};

    use crate::agent::{Agent, RunOutcome};
    use crate::events::AgentEvent;
    use crate::session::Session;
    use crate::task_state;

    // ── Harness ───────────────────────────────────────────────────────────────

    struct Harness {
        agent: Agent,
        session: Session,
        _dir: tempfile::TempDir,
        data_dir: std::path::PathBuf,
    }

    fn tool_call_script(id: &str, tool: &str, args: &str) -> Vec<ResponseEvent> {
        vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: id.into(),
                name: tool.into(),
                arguments: args.into(),
            },
            ResponseEvent::Done,
        ]
    }

    fn text_script(text: &str) -> Vec<ResponseEvent> {
        vec![ResponseEvent::TextDelta(text.into()), ResponseEvent::Done]
    }

    fn harness_with(
        scripts: Vec<Script>,
        registry: ToolRegistry,
        mutate: impl FnOnce(&mut Config),
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let mut config = Config::default();
        config.model = "mock-primary".into();
        config.data_dir = Some(data_dir.to_string_lossy().to_string());
        mutate(&mut config);
        let config = Arc::new(config);

        let provider = Arc::new(ScriptedMockProvider::with_scripts(scripts));
        let router = Arc::new(ModelRouter::with_factory(
            Arc::clone(&config),
            Box::new(move |model| {
                if model == "mock-primary" {
                    Ok(Arc::clone(&provider) as Arc<dyn ModelProvider>)
                } else {
                    anyhow::bail!("model '{model}' not found")
                }
            }),
        ));
        let approvals = Arc::new(ApprovalManager::new(config.approval.clone(), &data_dir));
        let agent = Agent::new(
            router,
            Arc::new(registry),
            approvals,
            Arc::clone(&config),
            "test system prompt".into(),
        );
        Harness {
            agent,
            session: Session::new("main"),
            _dir: dir,
            data_dir,
        }
    }

    fn harness(scripts: Vec<Vec<ResponseEvent>>, registry: ToolRegistry) -> Harness {
        harness_with(scripts.into_iter().map(Ok).collect(), registry, |_| {})
    }

    async fn run(h: &mut Harness, input: &str) -> (RunOutcome, Vec<AgentEvent>) {
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(1024);
        let outcome = h.agent.run(&mut h.session, input, &tx).await.unwrap();
        drop(tx);
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        (outcome, events)
    }

    /// A configurable probe tool: fixed reply, explicit read-only flag, an
    /// execution log shared with the test.
    struct ProbeTool {
        name: &'static str,
        readonly: bool,
        reply: String,
        delay_ms: u64,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ProbeTool {
        fn readonly(name: &'static str, reply: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                readonly: true,
                reply: reply.into(),
                delay_ms: 0,
                log,
            }
        }
    }

    #[async_trait]
    impl Tool for ProbeTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "test probe"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object", "properties": {} })
        }
        fn is_readonly(&self, _args: &Value) -> bool {
            self.readonly
        }
        async fn execute(&self, call: &ToolCall) -> ToolResult {
            if self.delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            }
            self.log.lock().unwrap().push(call.id.clone());
            ToolResult::ok(self.reply.clone())
        }
    }

    /// Mutating tool that sets the session interrupt flag when executed.
    struct InterruptingTool {
        flag: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Tool for InterruptingTool {
        fn name(&self) -> &str {
            "slowop"
        }
        fn description(&self) -> &str {
            "sets the interrupt flag mid-run"
        }
        fn input_schema(&self) -> Value {
            json!({ "type": "object", "properties": {} })
        }
        async fn execute(&self, _call: &ToolCall) -> ToolResult {
            self.flag.store(true, Ordering::SeqCst);
            ToolResult::ok("started")
        }
    }

    // ── Scenario 1: simple echo ───────────────────────────────────────────────

    #[tokio::test]
    async fn simple_echo_one_round_no_tools() {
        let mut h = harness(vec![text_script("hello back")], ToolRegistry::new());
        // Seed a stale snapshot to prove natural completion clears it.
        task_state::save(
            &h.data_dir,
            &crate::task_state::TaskState {
                task: "old".into(),
                tool_history: vec![],
                round_count: 3,
                model: "m".into(),
            },
        )
        .unwrap();

        let (outcome, events) = run(&mut h, "hello").await;

        match outcome {
            RunOutcome::Completed { response } => assert!(!response.is_empty()),
            other => panic!("expected Completed, got {other:?}"),
        }
        assert_eq!(h.session.round_count, 1);
        assert!(h.session.tool_history.is_empty());
        assert!(task_state::load(&h.data_dir).is_none(), "snapshot cleared");
        assert!(events.iter().any(|e| matches!(e, AgentEvent::TurnComplete)));
    }

    #[tokio::test]
    async fn system_prompt_injected_on_first_run() {
        let mut h = harness(vec![text_script("ok")], ToolRegistry::new());
        run(&mut h, "hi").await;
        assert_eq!(h.session.messages[0].role, Role::System);
        assert_eq!(h.session.messages[0].as_text(), Some("test system prompt"));
    }

    // ── Scenario 2: single tool call ──────────────────────────────────────────

    #[tokio::test]
    async fn single_tool_call_two_rounds() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ToolRegistry::new();
        reg.register(ProbeTool {
            name: "bash",
            readonly: false,
            reply: "a.txt  b.txt".into(),
            delay_ms: 0,
            log: Arc::clone(&log),
        });
        let mut h = harness(
            vec![
                tool_call_script("tc-1", "bash", r#"{"command":"ls /tmp"}"#),
                text_script("The directory contains a.txt and b.txt."),
            ],
            reg,
        );

        let (outcome, events) = run(&mut h, "list files in /tmp").await;

        match outcome {
            RunOutcome::Completed { response } => assert!(response.contains("a.txt")),
            other => panic!("expected Completed, got {other:?}"),
        }
        assert_eq!(h.session.round_count, 2);
        assert_eq!(h.session.tool_history.len(), 1);
        assert!(h.session.tool_history[0].auto_executed);
        assert_eq!(log.lock().unwrap().len(), 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ToolCallFinished { success: true, .. })));

        // The assistant tool-call message precedes exactly one tool message.
        let tc_index = h
            .session
            .messages
            .iter()
            .position(|m| !m.tool_calls.is_empty())
            .unwrap();
        assert_eq!(h.session.messages[tc_index + 1].role, Role::Tool);
        assert_eq!(
            h.session.messages[tc_index + 1].tool_call_id.as_deref(),
            Some("tc-1")
        );
    }

    // ── Scenario 3: parallel read-only ────────────────────────────────────────

    #[tokio::test]
    async fn parallel_readonly_results_in_call_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ToolRegistry::new();
        // The first call is slower; order of appended results must still
        // follow the original call order.
        reg.register(ProbeTool {
            name: "read_a",
            readonly: true,
            reply: "contents of A".into(),
            delay_ms: 50,
            log: Arc::clone(&log),
        });
        reg.register(ProbeTool::readonly("read_b", "contents of B", Arc::clone(&log)));

        let round1 = vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: "call-a".into(),
                name: "read_a".into(),
                arguments: "{}".into(),
            },
            ResponseEvent::ToolCall {
                index: 1,
                id: "call-b".into(),
                name: "read_b".into(),
                arguments: "{}".into(),
            },
            ResponseEvent::Done,
        ];
        let mut h = harness(
            vec![round1, text_script("A says one thing, B another.")],
            reg,
        );

        let (outcome, _) = run(&mut h, "read A.txt and B.txt and summarize").await;
        assert!(matches!(outcome, RunOutcome::Completed { .. }));

        // Both executed; results appended in original call order.
        let tool_msgs: Vec<&Message> = h
            .session
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(tool_msgs.len(), 2);
        assert_eq!(tool_msgs[0].tool_call_id.as_deref(), Some("call-a"));
        assert_eq!(tool_msgs[1].tool_call_id.as_deref(), Some("call-b"));
        assert_eq!(h.session.tool_history.len(), 2);
    }

    // ── Scenario 4: context overflow recovery ─────────────────────────────────

    #[tokio::test]
    async fn context_overflow_compacts_and_retries() {
        let mut h = harness_with(
            vec![
                Err("mock error 400: maximum context length exceeded".into()),
                // Staged summarization: two partials plus the merge call.
                Ok(text_script("partial summary one")),
                Ok(text_script("partial summary two")),
                Ok(text_script("merged summary of earlier history")),
                Ok(text_script("final answer after compaction")),
            ],
            ToolRegistry::new(),
            |c| {
                c.context_window_tokens = 800;
                c.compaction_preserve_recent = 4;
            },
        );
        // Preload history below the proactive threshold but large enough
        // that force-compaction has something to drop.
        for i in 0..30 {
            h.session.push(Message::user(format!("old message {i} with padding words")));
            h.session.push(Message::assistant(format!("old reply {i} with padding words")));
        }
        let count_before = h.session.messages.len();

        let (outcome, events) = run(&mut h, "anything").await;

        match outcome {
            RunOutcome::Completed { response } => {
                assert_eq!(response, "final answer after compaction")
            }
            other => panic!("expected Completed, got {other:?}"),
        }
        assert!(
            h.session.messages.len() < count_before,
            "message count must shrink: {} -> {}",
            count_before,
            h.session.messages.len()
        );
        assert!(
            h.session.messages.iter().any(|m| {
                m.role == Role::System
                    && m.as_text().map(|t| t.contains("summary")).unwrap_or(false)
            }),
            "synthetic summary system message expected"
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ContextCompacted { .. })));
    }

    // ── Scenario 5: format-error retry ────────────────────────────────────────

    #[tokio::test]
    async fn format_errors_drop_tail_then_rebuild_context() {
        let mut h = harness_with(
            vec![
                Err("mock error 400: invalid request body".into()),
                Err("mock error 400: invalid request body".into()),
                Err("mock error 400: invalid request body".into()),
                Ok(text_script("recovered with a simpler approach")),
            ],
            ToolRegistry::new(),
            |_| {},
        );

        let (outcome, _) = run(&mut h, "do the thing").await;

        match outcome {
            RunOutcome::Completed { response } => assert!(response.contains("recovered")),
            other => panic!("expected Completed, got {other:?}"),
        }
        // The third occurrence rebuilt the context: original task + failure
        // log + simpler-path instruction, then the recovery reply.
        let recovery = h
            .session
            .messages
            .iter()
            .find(|m| {
                m.role == Role::User
                    && m.as_text()
                        .map(|t| t.contains("Original task: do the thing"))
                        .unwrap_or(false)
            })
            .expect("recovery context user message expected");
        assert!(recovery.as_text().unwrap().contains("simpler"));
        // Rebuilt context is tiny: system + recovery + assistant reply.
        assert_eq!(h.session.messages.len(), 3);
    }

    #[tokio::test]
    async fn single_format_error_injects_reassess_note() {
        let mut h = harness_with(
            vec![
                Err("mock error 400: bad request".into()),
                Ok(text_script("second try worked")),
            ],
            ToolRegistry::new(),
            |_| {},
        );
        let (outcome, _) = run(&mut h, "task").await;
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert!(h.session.messages.iter().any(|m| {
            m.role == Role::System
                && m.as_text().map(|t| t.contains("simpler approach")).unwrap_or(false)
        }));
        assert_eq!(h.session.round_count, 1, "failed round must not count");
    }

    // ── Scenario 6: approval denial ───────────────────────────────────────────

    #[tokio::test]
    async fn denied_command_feeds_denial_back_to_model() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ToolRegistry::new();
        reg.register(ProbeTool {
            name: "bash",
            readonly: false,
            reply: "should never run".into(),
            delay_ms: 0,
            log: Arc::clone(&log),
        });
        let mut h = harness_with(
            vec![
                Ok(tool_call_script(
                    "tc-1",
                    "bash",
                    r#"{"command":"rm -rf /tmp/x"}"#,
                )),
                Ok(text_script("Understood — I won't delete that directory.")),
            ],
            reg,
            |c| c.approval.default_policy = DefaultPolicy::Ask,
        );
        h.agent = {
            // Re-wire the approval callback before running.
            let approvals = Arc::new(ApprovalManager::new(
                vigil_config::ApprovalSettings {
                    default_policy: DefaultPolicy::Ask,
                    ..Default::default()
                },
                &h.data_dir,
            ));
            approvals.set_callback(Box::new(|_req: &ExecRequest| ApprovalOutcome::Denied));
            rebuild_agent_with_approvals(&h, approvals)
        };

        let (outcome, _) = run(&mut h, "clean up /tmp/x").await;

        match outcome {
            RunOutcome::Completed { response } => assert!(response.contains("won't delete")),
            other => panic!("expected Completed, got {other:?}"),
        }
        assert!(log.lock().unwrap().is_empty(), "denied tool must not execute");

        // Observation carries the denied status.
        let tool_msg = h
            .session
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(tool_msg.as_text().unwrap().contains("status=denied"));

        // Exactly one DENIED audit entry; snapshot cleared on completion.
        let audit = std::fs::read_to_string(h.data_dir.join("exec_approvals.jsonl")).unwrap();
        let denied_lines = audit.lines().filter(|l| l.contains("\"denied\"")).count();
        assert_eq!(denied_lines, 1);
        assert!(task_state::load(&h.data_dir).is_none());
    }

    /// Rebuild the harness agent with a different approval manager but the
    /// same router / tools / config.
    fn rebuild_agent_with_approvals(h: &Harness, approvals: Arc<ApprovalManager>) -> Agent {
        Agent::new(
            Arc::clone(h.agent.router()),
            Arc::clone(h.agent.tools()),
            approvals,
            Arc::clone(h.agent.config()),
            "test system prompt".into(),
        )
    }

    // ── Boundary: max-rounds exhaustion ───────────────────────────────────────

    #[tokio::test]
    async fn max_rounds_produces_summary_and_snapshot() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ToolRegistry::new();
        reg.register(ProbeTool::readonly("look", "still looking", Arc::clone(&log)));

        let mut h = harness_with(
            vec![
                Ok(tool_call_script("t1", "look", "{}")),
                Ok(tool_call_script("t2", "look", "{}")),
                // Wrap-up turn.
                Ok(text_script("Did two lookups; more remain; continue by looking again.")),
            ],
            reg,
            |c| c.max_rounds = 2,
        );

        let (outcome, _) = run(&mut h, "investigate forever").await;

        match outcome {
            RunOutcome::Completed { response } => {
                assert!(!response.is_empty(), "fallback summary must be non-empty");
                assert!(response.contains("lookups"));
            }
            other => panic!("expected Completed, got {other:?}"),
        }
        let snapshot = task_state::load(&h.data_dir).expect("task snapshot expected");
        assert_eq!(snapshot.round_count, 2, "snapshot carries the configured max");
        assert_eq!(snapshot.task, "investigate forever");
    }

    #[tokio::test]
    async fn max_rounds_wrap_up_failure_uses_deterministic_summary() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ToolRegistry::new();
        reg.register(ProbeTool::readonly("look", "data", Arc::clone(&log)));
        let mut h = harness_with(
            vec![
                Ok(tool_call_script("t1", "look", "{}")),
                Err("mock error 401: wrap-up denied".into()),
            ],
            reg,
            |c| c.max_rounds = 1,
        );
        let (outcome, _) = run(&mut h, "task").await;
        match outcome {
            RunOutcome::Completed { response } => {
                assert!(response.contains("Stopped after"));
                assert!(response.contains("look"));
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    // ── Boundary: interrupt ───────────────────────────────────────────────────

    #[tokio::test]
    async fn interrupt_saves_state_and_references_last_tool() {
        let mut h = harness(
            vec![tool_call_script("t1", "slowop", "{}"), text_script("never reached")],
            ToolRegistry::new(),
        );
        // The tool trips the session's own interrupt flag when it runs.
        let flag = h.session.interrupt_flag();
        let mut reg = ToolRegistry::new();
        reg.register(InterruptingTool { flag });
        h.agent = Agent::new(
            Arc::clone(h.agent.router()),
            Arc::new(reg),
            Arc::new(ApprovalManager::new(Default::default(), &h.data_dir)),
            Arc::clone(h.agent.config()),
            "test system prompt".into(),
        );

        let (outcome, events) = run(&mut h, "start the long thing").await;

        match outcome {
            RunOutcome::Interrupted { acknowledgement } => {
                assert!(acknowledgement.contains("slowop"), "{acknowledgement}");
            }
            other => panic!("expected Interrupted, got {other:?}"),
        }
        let snapshot = task_state::load(&h.data_dir).unwrap();
        assert_eq!(snapshot.round_count, 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Interrupted { last_tool: Some(t) } if t == "slowop")));
    }

    // ── Pending approval + resume ─────────────────────────────────────────────

    #[tokio::test]
    async fn ask_without_callback_suspends_then_resumes() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ToolRegistry::new();
        reg.register(ProbeTool {
            name: "bash",
            readonly: false,
            reply: "deleted".into(),
            delay_ms: 0,
            log: Arc::clone(&log),
        });
        let mut h = harness_with(
            vec![
                Ok(tool_call_script("tc-1", "bash", r#"{"command":"rm /tmp/thing"}"#)),
                Ok(text_script("Done — the file is gone.")),
            ],
            reg,
            |c| c.approval.default_policy = DefaultPolicy::Ask,
        );

        let (outcome, events) = run(&mut h, "delete /tmp/thing").await;

        let request_id = match outcome {
            RunOutcome::PendingApproval { request_id, tool_name } => {
                assert_eq!(tool_name, "bash");
                request_id
            }
            other => panic!("expected PendingApproval, got {other:?}"),
        };
        assert!(h.session.pending_gate.is_some());
        assert!(task_state::load(&h.data_dir).is_some(), "state persisted while pending");
        assert!(events.iter().any(
            |e| matches!(e, AgentEvent::PendingApproval { request_id: r, .. } if *r == request_id)
        ));
        assert!(log.lock().unwrap().is_empty(), "tool must not run while pending");

        // Approve out of band and resume from exactly that point.
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(1024);
        let outcome = h.agent.resume(&mut h.session, true, &tx).await.unwrap();
        drop(tx);
        while rx.try_recv().is_ok() {}

        match outcome {
            RunOutcome::Completed { response } => assert!(response.contains("gone")),
            other => panic!("expected Completed after resume, got {other:?}"),
        }
        assert_eq!(log.lock().unwrap().len(), 1, "tool ran exactly once after approval");
        assert!(h.session.pending_gate.is_none());
    }

    #[tokio::test]
    async fn resume_with_denial_injects_denied_observation() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ToolRegistry::new();
        reg.register(ProbeTool {
            name: "bash",
            readonly: false,
            reply: "nope".into(),
            delay_ms: 0,
            log: Arc::clone(&log),
        });
        let mut h = harness_with(
            vec![
                Ok(tool_call_script("tc-1", "bash", r#"{"command":"rm /tmp/thing"}"#)),
                Ok(text_script("Okay, leaving it in place.")),
            ],
            reg,
            |c| c.approval.default_policy = DefaultPolicy::Ask,
        );

        let (outcome, _) = run(&mut h, "delete it").await;
        assert!(matches!(outcome, RunOutcome::PendingApproval { .. }));

        let (tx, _rx) = mpsc::channel::<AgentEvent>(1024);
        let outcome = h.agent.resume(&mut h.session, false, &tx).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert!(log.lock().unwrap().is_empty());
        let tool_msg = h.session.messages.iter().find(|m| m.role == Role::Tool).unwrap();
        assert!(tool_msg.as_text().unwrap().contains("status=denied"));
    }

    // ── Refusal clarification ─────────────────────────────────────────────────

    #[tokio::test]
    async fn first_round_refusal_gets_tool_clarification() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ToolRegistry::new();
        reg.register(ProbeTool::readonly("web_fetch", "page text", Arc::clone(&log)));
        let mut h = harness(
            vec![
                text_script("I don't have access to the internet."),
                tool_call_script("t1", "web_fetch", r#"{"url":"https://example.com"}"#),
                text_script("Fetched it — here is the summary."),
            ],
            reg,
        );

        let (outcome, _) = run(&mut h, "fetch example.com").await;

        match outcome {
            RunOutcome::Completed { response } => assert!(response.contains("summary")),
            other => panic!("expected Completed, got {other:?}"),
        }
        // The clarification enumerates the tools and the refused round did
        // not count.
        let clarification = h
            .session
            .messages
            .iter()
            .find(|m| {
                m.role == Role::User
                    && m.as_text().map(|t| t.contains("DO have tools")).unwrap_or(false)
            })
            .expect("clarification message expected");
        assert!(clarification.as_text().unwrap().contains("web_fetch"));
        assert_eq!(h.session.round_count, 2);
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    // ── Tool failure note ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn failed_tools_produce_compact_system_note() {
        let mut h = harness(
            vec![
                tool_call_script("t1", "nonexistent_tool", "{}"),
                text_script("let me try something else"),
            ],
            ToolRegistry::new(),
        );
        let (outcome, _) = run(&mut h, "go").await;
        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        let note = h
            .session
            .messages
            .iter()
            .find(|m| {
                m.role == Role::System
                    && m.as_text().map(|t| t.contains("Tool failures")).unwrap_or(false)
            })
            .expect("failure note expected");
        assert!(note.as_text().unwrap().contains("nonexistent_tool"));
    }

    // ── Invariants ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn every_tool_message_pairs_with_a_preceding_call_id() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ToolRegistry::new();
        reg.register(ProbeTool::readonly("read_a", "A", Arc::clone(&log)));
        reg.register(ProbeTool::readonly("read_b", "B", Arc::clone(&log)));
        let round1 = vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: "x1".into(),
                name: "read_a".into(),
                arguments: "{}".into(),
            },
            ResponseEvent::ToolCall {
                index: 1,
                id: "x2".into(),
                name: "read_b".into(),
                arguments: "{}".into(),
            },
            ResponseEvent::Done,
        ];
        let mut h = harness(
            vec![
                round1,
                tool_call_script("x3", "read_a", "{}"),
                text_script("done"),
            ],
            reg,
        );
        run(&mut h, "multi round").await;

        let mut seen_call_ids: Vec<String> = Vec::new();
        for m in &h.session.messages {
            for tc in &m.tool_calls {
                seen_call_ids.push(tc.id.clone());
            }
            if m.role == Role::Tool {
                let id = m.tool_call_id.clone().unwrap();
                assert!(
                    seen_call_ids.contains(&id),
                    "tool message {id} has no preceding assistant tool call"
                );
            }
        }
    }

    #[tokio::test]
    async fn k_calls_are_followed_by_k_tool_messages_before_next_assistant() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reg = ToolRegistry::new();
        reg.register(ProbeTool::readonly("read_a", "A", Arc::clone(&log)));
        let round1 = vec![
            ResponseEvent::ToolCall {
                index: 0,
                id: "k1".into(),
                name: "read_a".into(),
                arguments: "{}".into(),
            },
            ResponseEvent::ToolCall {
                index: 1,
                id: "k2".into(),
                name: "read_a".into(),
                arguments: "{}".into(),
            },
            ResponseEvent::Done,
        ];
        let mut h = harness(vec![round1, text_script("done")], reg);
        run(&mut h, "go").await;

        let msgs = &h.session.messages;
        let idx = msgs.iter().position(|m| !m.tool_calls.is_empty()).unwrap();
        let k = msgs[idx].tool_calls.len();
        assert_eq!(k, 2);
        for offset in 1..=k {
            assert_eq!(
                msgs[idx + offset].role,
                Role::Tool,
                "the K tool results must directly follow the assistant message"
            );
        }
        assert_eq!(msgs[idx + k + 1].role, Role::Assistant);
    }

    // ── Terminal provider failure ─────────────────────────────────────────────

    #[tokio::test]
    async fn exhausted_provider_surfaces_short_user_message() {
        let mut h = harness_with(
            vec![Err("mock error 401: key revoked".into())],
            ToolRegistry::new(),
            |_| {},
        );
        let (outcome, _) = run(&mut h, "hello").await;
        match outcome {
            RunOutcome::Failed { message } => {
                assert!(!message.contains("401"), "raw provider errors never reach the user");
                assert!(!message.contains("key revoked"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }
}
