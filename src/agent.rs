//! Agent loop - the per-task state machine
//!
//! Alternates model turns and tool turns until the model declares the task
//! done, the iteration budget runs out, a stall is detected, or the caller
//! cancels. One AgentState per invocation, never shared between loops.

use serde_json::json;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::client::ModelClient;
use crate::config::Options;
use crate::error::AgentError;
use crate::events::{EventKind, EventSender, ProgressEvent};
use crate::executor::{Executor, ToolResult};
use crate::parser::{self, ToolCall};
use crate::permissions::{Decision, Gate};
use crate::prompt::{self, Mode};
use crate::registry::Registry;
use crate::session::{Message, Role, Session};

/// Worker cap for parallel dispatch of read-only call batches.
const READ_WORKERS: usize = 5;

/// Fingerprint window length for convergence detection.
const CONVERGENCE_WINDOW: usize = 6;

/// Identical fingerprints within the window that flag a stall.
const CONVERGENCE_REPEATS: usize = 4;

/// Messages kept verbatim when old context is summarized.
const SUMMARY_KEEP_RECENT: usize = 4;

// ═══════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════

/// Why a loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalReason {
    Done,
    MaxIterations,
    Stall,
    Canceled,
    Error,
}

impl TerminalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalReason::Done => "done",
            TerminalReason::MaxIterations => "max-iterations",
            TerminalReason::Stall => "stall",
            TerminalReason::Canceled => "canceled",
            TerminalReason::Error => "error",
        }
    }
}

/// The full record of one loop invocation.
#[derive(Debug)]
pub struct AgentState {
    pub task: String,
    pub iteration: usize,
    pub messages: Vec<Message>,
    pub tool_log: Vec<(ToolCall, ToolResult)>,
    pub completed: bool,
    pub terminal: Option<TerminalReason>,
    pub final_output: String,
    /// Last error worth showing the user, if any.
    pub last_error: Option<String>,
}

impl AgentState {
    fn new(task: &str) -> Self {
        Self {
            task: task.to_string(),
            iteration: 0,
            messages: Vec::new(),
            tool_log: Vec::new(),
            completed: false,
            terminal: None,
            final_output: String::new(),
            last_error: None,
        }
    }

    pub fn terminal_reason(&self) -> TerminalReason {
        self.terminal.unwrap_or(TerminalReason::Error)
    }
}

// ═══════════════════════════════════════════════════════════════
// TASK COMPLEXITY
// ═══════════════════════════════════════════════════════════════

/// Rough task sizing that picks the iteration budget and whether a
/// planning turn is worth a model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskComplexity {
    Simple,
    Medium,
    Complex,
}

impl TaskComplexity {
    pub fn assess(task: &str) -> Self {
        let lower = task.to_lowercase();

        let vm_task = ["qemu", "docker", "vagrant", "virsh", " vm ", "virtual machine"]
            .iter()
            .any(|kw| lower.contains(kw));
        let enumerated = task
            .lines()
            .filter(|l| {
                let t = l.trim_start();
                t.starts_with('-') || t.starts_with('*') || t.chars().next().is_some_and(|c| c.is_ascii_digit())
            })
            .count()
            >= 2;
        let multi_step = lower.contains(" then ")
            || lower.contains(" after that ")
            || lower.matches(" and ").count() >= 2;

        if vm_task || (enumerated && multi_step) {
            TaskComplexity::Complex
        } else if enumerated || multi_step || task.split_whitespace().count() > 25 {
            TaskComplexity::Medium
        } else {
            TaskComplexity::Simple
        }
    }

    pub fn max_iterations(&self) -> usize {
        match self {
            TaskComplexity::Simple => 10,
            TaskComplexity::Medium => 15,
            TaskComplexity::Complex => 20,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// LOOP CONFIGURATION
// ═══════════════════════════════════════════════════════════════

/// Callback the loop consults when the gate answers Prompt. Returning
/// false (or having no resolver) denies the call.
pub type PermissionResolver = Arc<dyn Fn(&ToolCall, &str) -> bool + Send + Sync>;

/// Per-loop knobs beyond the shared Options record.
#[derive(Clone, Default)]
pub struct LoopConfig {
    pub mode: Mode,
    /// Overrides the complexity heuristic when set.
    pub max_iterations: Option<usize>,
    /// Dispatch runs of read-only calls in bounded parallel.
    pub parallel_reads: bool,
    /// Skip the planning turn even for non-trivial tasks.
    pub skip_planning: bool,
    pub on_permission: Option<PermissionResolver>,
}

/// One agent loop. Construct, then `run` exactly once.
pub struct AgentLoop {
    client: Arc<ModelClient>,
    executor: Arc<Executor>,
    gate: Gate,
    options: Options,
    config: LoopConfig,
    events: EventSender,
    session: Option<Session>,
}

impl AgentLoop {
    pub fn new(
        client: Arc<ModelClient>,
        executor: Arc<Executor>,
        gate: Gate,
        options: Options,
        config: LoopConfig,
        events: EventSender,
        session: Option<Session>,
    ) -> Self {
        Self {
            client,
            executor,
            gate,
            options,
            config,
            events,
            session,
        }
    }

    /// Drive the loop to a terminal state. Always returns an AgentState,
    /// partial if cancelled or errored.
    pub async fn run(mut self, task: &str, cancel: &CancelToken) -> AgentState {
        let mut state = AgentState::new(task);

        // init: one unified prompt builder, iteration budget from the task.
        let complexity = TaskComplexity::assess(task);
        let max_iterations = self
            .config
            .max_iterations
            .unwrap_or_else(|| complexity.max_iterations());

        self.push_message(
            &mut state,
            Message::new(Role::System, prompt::system_prompt(self.executor.workspace(), self.config.mode)),
        );
        self.push_message(&mut state, Message::new(Role::User, task));

        self.events.emit(ProgressEvent::run_state(format!(
            "started: {} (max {} iterations, {:?})",
            task, max_iterations, complexity
        )));

        // Optional one-shot planning turn for non-trivial tasks.
        if complexity > TaskComplexity::Simple && !self.config.skip_planning {
            match self.planning_turn(&state, task, cancel).await {
                Ok(plan) => {
                    self.events.emit(ProgressEvent::reasoning(plan.clone()));
                    self.push_message(&mut state, Message::new(Role::Assistant, plan));
                }
                Err(AgentError::Canceled) => {
                    return self.finish(state, TerminalReason::Canceled, String::new());
                }
                Err(e) => {
                    // Planning is best-effort; the main loop may still work.
                    self.events
                        .emit(ProgressEvent::system(format!("planning turn failed: {}", e)));
                }
            }
        }

        let mut window: VecDeque<Fingerprint> = VecDeque::new();
        let mut stalls = 0usize;
        let mut last_reply = String::new();

        while state.iteration < max_iterations {
            state.iteration += 1;

            if cancel.is_canceled() {
                return self.finish(state, TerminalReason::Canceled, last_reply);
            }

            self.maybe_summarize(&mut state);

            // turn-model
            let events = self.events.clone();
            let mut on_chunk = move |chunk: &str| {
                events.emit(ProgressEvent::reasoning(chunk.to_string()));
            };
            let outcome = match self
                .client
                .chat(cancel, &state.messages, Some(&mut on_chunk))
                .await
            {
                Ok(o) => o,
                Err(AgentError::Canceled) => {
                    return self.finish(state, TerminalReason::Canceled, last_reply);
                }
                Err(e) => {
                    state.last_error = Some(e.to_string());
                    self.log_session("error", json!({ "error": e.to_string() }));
                    return self.finish(state, TerminalReason::Error, last_reply);
                }
            };
            if outcome.retries > 0 {
                self.log_session("retry", json!({ "count": outcome.retries }));
            }

            let reply = outcome.text;
            last_reply = reply.clone();
            self.push_message(&mut state, Message::new(Role::Assistant, reply.clone()));

            // parse
            let parsed = parser::parse_reply(&reply);
            for diag in &parsed.diagnostics {
                self.events.emit(ProgressEvent::system(diag.clone()));
            }

            // Plain prose with no parseable call is the termination cue.
            if parsed.calls.is_empty() {
                return self.finish(state, TerminalReason::Done, reply);
            }

            // Parser ids restart per reply; the turn prefix keeps call-ids
            // unique across the whole AgentState.
            let mut calls = parsed.calls;
            for call in &mut calls {
                call.id = format!("t{}-{}", state.iteration, call.id);
            }

            // gate + exec-tool
            let batch = self.run_batch(&mut state, calls, cancel).await;
            if cancel.is_canceled() {
                return self.finish(state, TerminalReason::Canceled, last_reply);
            }

            // convergence check over the fingerprint window
            for fp in batch {
                push_window(&mut window, fp);
            }
            if state.iteration % self.options.convergence_check_interval.max(1) == 0 {
                if let Some(repeated) = detect_stall(&window) {
                    stalls += 1;
                    self.log_session("stall", json!({ "count": stalls, "repeated": repeated }));
                    if stalls >= self.options.max_stall_count {
                        return self.finish(state, TerminalReason::Stall, last_reply);
                    }
                    // First detection: redirect the model and start fresh.
                    self.events.emit(ProgressEvent::system(format!(
                        "stall detected, requesting a strategy change (repeated: {})",
                        repeated
                    )));
                    self.push_message(
                        &mut state,
                        Message::new(Role::System, prompt::strategy_change_prompt(&repeated)),
                    );
                    window.clear();
                }
            }
        }

        self.finish(state, TerminalReason::MaxIterations, last_reply)
    }

    /// Execute one batch of parsed calls: gate each, dispatch, append
    /// tool-role results. Read-only batches may fan out in bounded
    /// parallel; everything else runs sequentially in reply order.
    async fn run_batch(
        &mut self,
        state: &mut AgentState,
        calls: Vec<ToolCall>,
        cancel: &CancelToken,
    ) -> Vec<Fingerprint> {
        let mut fingerprints = Vec::with_capacity(calls.len());

        // Decide gating up front; a batch only parallelizes when every
        // call is read-only and allowed outright.
        let decisions: Vec<Decision> = calls.iter().map(|c| self.gate.evaluate(c)).collect();
        let all_parallel_ok = self.config.parallel_reads
            && calls.len() > 1
            && calls
                .iter()
                .zip(&decisions)
                .all(|(c, d)| Registry::global().is_read_only(&c.name) && *d == Decision::Allow);

        if all_parallel_ok {
            let results = self.dispatch_parallel(&calls, cancel).await;
            for (call, result) in calls.into_iter().zip(results) {
                fingerprints.push(self.record_result(state, &call, result));
            }
            return fingerprints;
        }

        for (call, decision) in calls.into_iter().zip(decisions) {
            if cancel.is_canceled() {
                break;
            }
            let result = match decision {
                Decision::Allow => self.dispatch_one(&call, cancel).await,
                Decision::Prompt(description) => {
                    self.events.emit(ProgressEvent::run_state(format!(
                        "awaiting-permission: {}",
                        description
                    )));
                    let approved = self
                        .config
                        .on_permission
                        .as_ref()
                        .map(|resolve| resolve(&call, &description))
                        .unwrap_or(false);
                    if approved {
                        self.dispatch_one(&call, cancel).await
                    } else {
                        self.denied_result(&call, &description)
                    }
                }
                Decision::Deny(reason) => self.denied_result(&call, &reason),
            };
            fingerprints.push(self.record_result(state, &call, result));
        }
        fingerprints
    }

    /// Bounded-parallel dispatch for an all-read-only batch, preserving
    /// reply order in the results.
    async fn dispatch_parallel(&self, calls: &[ToolCall], cancel: &CancelToken) -> Vec<ToolResult> {
        use futures::stream::{self, StreamExt};

        for call in calls {
            self.events.emit(ProgressEvent::tool_start(
                &call.name,
                &call.id,
                describe_args(call),
            ));
        }

        let mut indexed: Vec<(usize, ToolResult)> = stream::iter(calls.iter().cloned().enumerate())
            .map(|(i, call)| {
                let executor = self.executor.clone();
                let cancel = cancel.clone();
                async move { (i, executor.execute(&cancel, &call).await) }
            })
            .buffer_unordered(READ_WORKERS)
            .collect()
            .await;
        indexed.sort_by_key(|(i, _)| *i);
        indexed.into_iter().map(|(_, r)| r).collect()
    }

    async fn dispatch_one(&self, call: &ToolCall, cancel: &CancelToken) -> ToolResult {
        self.events.emit(ProgressEvent::tool_start(
            &call.name,
            &call.id,
            describe_args(call),
        ));
        self.executor.execute(cancel, call).await
    }

    /// A synthetic failed result for gate-denied calls; the model is told
    /// to try something else.
    fn denied_result(&self, call: &ToolCall, reason: &str) -> ToolResult {
        self.events.emit(ProgressEvent::system(format!(
            "permission denied: {}",
            reason
        )));
        ToolResult {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            success: false,
            output: String::new(),
            error: Some(format!(
                "permission denied ({}); try a different approach",
                reason
            )),
            duration: std::time::Duration::ZERO,
            file_change: None,
            command: None,
            cwd: None,
        }
    }

    /// Emit finish events, append the tool-role message, log, fingerprint.
    fn record_result(
        &mut self,
        state: &mut AgentState,
        call: &ToolCall,
        result: ToolResult,
    ) -> Fingerprint {
        self.events.emit(ProgressEvent::tool_finish(
            &call.name,
            &call.id,
            result.success,
            result
                .error
                .clone()
                .unwrap_or_else(|| summarize_output(&result.output)),
        ));

        if let Some(change) = &result.file_change {
            let mut ev = ProgressEvent::new(
                EventKind::FileChange,
                format!("{:?} {}", change.kind, change.path.display()),
            );
            ev.tool = Some(call.name.clone());
            ev.call_id = Some(call.id.clone());
            ev.path = Some(change.path.clone());
            ev.change = Some(change.kind);
            ev.old_content = change.old_content.clone();
            ev.new_content = change.new_content.clone();
            self.events.emit(ev);
        }

        self.log_session(
            "tool",
            json!({
                "call_id": call.id,
                "tool": call.name,
                "success": result.success,
                "duration_ms": result.duration.as_millis() as u64,
            }),
        );

        let fingerprint = Fingerprint {
            hash: fingerprint_hash(&call.name, &call.args, result.success),
            description: format!("{} {}", call.name, compact_args(call)),
            mutating_success: result.success && result.file_change.is_some(),
        };

        self.push_message(state, Message::tool(&call.id, result.render()));
        state.tool_log.push((call.clone(), result));
        fingerprint
    }

    async fn planning_turn(
        &self,
        state: &AgentState,
        task: &str,
        cancel: &CancelToken,
    ) -> Result<String, AgentError> {
        let mut messages = state.messages.clone();
        messages.pop(); // replace the raw task with the planning request
        messages.push(Message::new(Role::User, prompt::planning_prompt(task)));
        let outcome = self.client.chat(cancel, &messages, None).await?;
        Ok(outcome.text)
    }

    /// Compress the oldest non-system messages into a single summary once
    /// the payload crosses the threshold, every 3 iterations.
    fn maybe_summarize(&mut self, state: &mut AgentState) {
        if state.iteration % 3 != 0 {
            return;
        }
        let total: usize = state.messages.iter().map(|m| m.content.len()).sum();
        if total <= self.options.context_summarize_threshold {
            return;
        }

        let keep_from = state.messages.len().saturating_sub(SUMMARY_KEEP_RECENT);
        let (compress, keep): (Vec<Message>, Vec<Message>) = {
            let mut compress = Vec::new();
            let mut keep = Vec::new();
            for (i, msg) in state.messages.drain(..).enumerate() {
                if msg.role == Role::System || i >= keep_from {
                    keep.push(msg);
                } else {
                    compress.push(msg);
                }
            }
            (compress, keep)
        };

        if compress.is_empty() {
            state.messages = keep;
            return;
        }

        let summary = prompt::summarize_messages(&compress);
        self.events.emit(ProgressEvent::system(format!(
            "summarized {} messages into {} chars",
            compress.len(),
            summary.len()
        )));

        // System prompt first, then the summary, then the recent tail.
        let mut rebuilt = Vec::with_capacity(keep.len() + 1);
        let mut summary = Some(Message::new(Role::System, summary));
        for msg in keep {
            rebuilt.push(msg);
            if rebuilt.len() == 1 && rebuilt[0].role == Role::System {
                if let Some(s) = summary.take() {
                    rebuilt.push(s);
                }
            }
        }
        if let Some(s) = summary.take() {
            rebuilt.insert(0, s);
        }
        state.messages = rebuilt;
    }

    fn push_message(&mut self, state: &mut AgentState, message: Message) {
        if let Some(session) = self.session.as_mut() {
            let _ = session.append(&message);
        }
        state.messages.push(message);
    }

    fn log_session(&mut self, kind: &str, data: serde_json::Value) {
        if let Some(session) = self.session.as_mut() {
            let _ = session.log(kind, data);
        }
    }

    fn finish(
        mut self,
        mut state: AgentState,
        reason: TerminalReason,
        final_output: String,
    ) -> AgentState {
        state.completed = true;
        state.terminal = Some(reason);
        state.final_output = final_output;

        self.events.emit(ProgressEvent::run_state(format!(
            "terminal: {} after {} iterations",
            reason.as_str(),
            state.iteration
        )));
        self.log_session(
            "terminal",
            json!({ "reason": reason.as_str(), "iterations": state.iteration }),
        );
        if let Some(session) = self.session.as_mut() {
            let _ = session.save_meta();
        }
        state
    }
}

// ═══════════════════════════════════════════════════════════════
// CONVERGENCE
// ═══════════════════════════════════════════════════════════════

/// One executed call, reduced to what stall detection needs.
#[derive(Debug, Clone)]
struct Fingerprint {
    hash: u64,
    description: String,
    mutating_success: bool,
}

fn fingerprint_hash(tool: &str, args: &serde_json::Value, success: bool) -> u64 {
    let mut hasher = DefaultHasher::new();
    tool.hash(&mut hasher);
    // serde_json maps iterate in sorted key order, so this is canonical.
    args.to_string().hash(&mut hasher);
    success.hash(&mut hasher);
    hasher.finish()
}

fn push_window(window: &mut VecDeque<Fingerprint>, fp: Fingerprint) {
    window.push_back(fp);
    while window.len() > CONVERGENCE_WINDOW {
        window.pop_front();
    }
}

/// A stall is the same fingerprint appearing CONVERGENCE_REPEATS times in
/// the window with no file-mutating success in between. Returns the
/// repeated call's description.
fn detect_stall(window: &VecDeque<Fingerprint>) -> Option<String> {
    if window.iter().any(|fp| fp.mutating_success) {
        return None;
    }
    for fp in window {
        let count = window.iter().filter(|other| other.hash == fp.hash).count();
        if count >= CONVERGENCE_REPEATS {
            return Some(fp.description.clone());
        }
    }
    None
}

// ═══════════════════════════════════════════════════════════════
// SMALL HELPERS
// ═══════════════════════════════════════════════════════════════

fn describe_args(call: &ToolCall) -> String {
    compact_args(call)
}

fn compact_args(call: &ToolCall) -> String {
    let rendered = call.args.to_string();
    if rendered.len() > 120 {
        let mut end = 120;
        while !rendered.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &rendered[..end])
    } else {
        rendered
    }
}

fn summarize_output(output: &str) -> String {
    let first = output.lines().next().unwrap_or("");
    if first.len() > 160 {
        let mut end = 160;
        while !first.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &first[..end])
    } else {
        first.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FsCache;
    use crate::client::{ChatOptions, MockTransport};
    use crate::events;
    use crate::permissions::PermissionMode;
    use crate::process::ProcessManager;
    use std::time::Duration;

    fn harness(replies: Vec<Result<String, AgentError>>) -> (AgentLoop, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let cache = Arc::new(FsCache::new(
            Duration::from_secs(300),
            Duration::from_secs(60),
        ));
        let processes = Arc::new(ProcessManager::new(Duration::from_secs(300)));
        let executor = Arc::new(Executor::new(
            root.clone(),
            cache,
            processes,
            Options::default(),
            false,
        ));
        let client = Arc::new(ModelClient::new(
            Box::new(MockTransport::new(replies)),
            ChatOptions::default(),
        ));
        let gate = Gate::with_effective(
            PermissionMode::FullAccess,
            PermissionMode::FullAccess,
            root,
        );
        let (events, _rx) = events::channel(1024);
        let agent = AgentLoop::new(
            client,
            executor,
            gate,
            Options::default(),
            LoopConfig {
                skip_planning: true,
                ..Default::default()
            },
            events,
            None,
        );
        (agent, dir)
    }

    #[test]
    fn test_complexity_simple() {
        assert_eq!(
            TaskComplexity::assess("list .go files under ./cmd"),
            TaskComplexity::Simple
        );
    }

    #[test]
    fn test_complexity_medium_multi_step() {
        let c = TaskComplexity::assess("read config and fix the parser and update the docs");
        assert_eq!(c, TaskComplexity::Medium);
    }

    #[test]
    fn test_complexity_vm_is_complex() {
        let c = TaskComplexity::assess("boot the image with qemu and run the installer");
        assert_eq!(c, TaskComplexity::Complex);
        assert_eq!(c.max_iterations(), 20);
    }

    #[test]
    fn test_iteration_budgets() {
        assert_eq!(TaskComplexity::Simple.max_iterations(), 10);
        assert_eq!(TaskComplexity::Medium.max_iterations(), 15);
    }

    #[tokio::test]
    async fn test_prose_reply_terminates_done() {
        let (agent, _dir) = harness(vec![Ok("Task complete. Nothing to do.".into())]);
        let state = agent.run("do nothing", &CancelToken::new()).await;
        assert_eq!(state.terminal, Some(TerminalReason::Done));
        assert!(state.completed);
        assert_eq!(state.final_output, "Task complete. Nothing to do.");
        assert_eq!(state.iteration, 1);
    }

    #[tokio::test]
    async fn test_tool_then_done() {
        let (agent, dir) = harness(vec![
            Ok(r#"{"tool": "write_file", "args": {"path": "out.txt", "content": "hi"}}"#.into()),
            Ok("Task complete. Wrote out.txt.".into()),
        ]);
        let state = agent.run("write hi to out.txt", &CancelToken::new()).await;

        assert_eq!(state.terminal, Some(TerminalReason::Done));
        assert_eq!(state.tool_log.len(), 1);
        assert!(state.tool_log[0].1.success);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out.txt")).unwrap(),
            "hi"
        );
        // The tool result was fed back as a tool-role message.
        assert!(state
            .messages
            .iter()
            .any(|m| m.role == Role::Tool && m.tool_call_id.is_some()));
    }

    #[tokio::test]
    async fn test_repeated_failures_stall() {
        // 8 identical failing exec replies; stall message after 4, terminal
        // stall once the second window fills.
        let reply = r#"{"tool": "exec", "args": {"command": "false"}}"#;
        let replies: Vec<Result<String, AgentError>> =
            (0..10).map(|_| Ok(reply.to_string())).collect();
        let (agent, _dir) = harness(replies);
        let state = agent.run("run false forever", &CancelToken::new()).await;

        assert_eq!(state.terminal, Some(TerminalReason::Stall));
        // Strategy-change system message was injected exactly once.
        let strategy_msgs = state
            .messages
            .iter()
            .filter(|m| m.role == Role::System && m.content.contains("different approach"))
            .count();
        assert_eq!(strategy_msgs, 1);
        // 4 failures to first stall + 4 to the second.
        assert_eq!(state.iteration, 8);
    }

    #[tokio::test]
    async fn test_mutating_success_resets_stall() {
        // Alternate failing exec with successful writes: no stall.
        let fail = r#"{"tool": "exec", "args": {"command": "false"}}"#;
        let mut replies: Vec<Result<String, AgentError>> = Vec::new();
        for i in 0..4 {
            replies.push(Ok(fail.to_string()));
            replies.push(Ok(format!(
                r#"{{"tool": "write_file", "args": {{"path": "f{}.txt", "content": "x"}}}}"#,
                i
            )));
        }
        replies.push(Ok("Task complete.".into()));
        let (agent, _dir) = harness(replies);
        let state = agent.run("alternate", &CancelToken::new()).await;
        assert_eq!(state.terminal, Some(TerminalReason::Done));
    }

    #[tokio::test]
    async fn test_max_iterations() {
        let reply = r#"{"tool": "list_dir", "args": {"path": "."}}"#;
        let replies: Vec<Result<String, AgentError>> =
            (0..30).map(|_| Ok(reply.to_string())).collect();
        let (mut agent, _dir) = harness(replies);
        agent.config.max_iterations = Some(3);
        let state = agent.run("look around", &CancelToken::new()).await;
        assert_eq!(state.terminal, Some(TerminalReason::MaxIterations));
        assert_eq!(state.iteration, 3);
    }

    #[tokio::test]
    async fn test_cancel_terminates_canceled() {
        let (agent, _dir) = harness(vec![Ok("unused".into())]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let state = agent.run("anything", &cancel).await;
        assert_eq!(state.terminal, Some(TerminalReason::Canceled));
        assert!(state.completed);
    }

    #[tokio::test]
    async fn test_provider_error_terminates_error() {
        let (agent, _dir) = harness(vec![Err(AgentError::Provider {
            status: 401,
            message: "bad key".into(),
        })]);
        let state = agent.run("anything", &CancelToken::new()).await;
        assert_eq!(state.terminal, Some(TerminalReason::Error));
        assert!(state.last_error.as_deref().unwrap().contains("bad key"));
    }

    #[tokio::test]
    async fn test_denied_call_informs_model() {
        let (agent, _dir) = harness(vec![
            Ok(r#"{"tool": "exec", "args": {"command": "sudo rm -rf /"}}"#.into()),
            Ok("Understood, giving up. Task complete.".into()),
        ]);
        let state = agent.run("wreck the machine", &CancelToken::new()).await;
        assert_eq!(state.terminal, Some(TerminalReason::Done));
        assert!(!state.tool_log[0].1.success);
        let denial = state
            .messages
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(denial.content.contains("permission denied"));
    }

    #[tokio::test]
    async fn test_permission_resolver_approves() {
        let (mut agent, _dir) = harness(vec![
            Ok(r#"{"tool": "http_request", "args": {"method": "DELETE", "url": "http://127.0.0.1:1/x"}}"#
                .into()),
            Ok("Task complete.".into()),
        ]);
        agent.config.on_permission = Some(Arc::new(|_, _| true));
        let state = agent.run("call the api", &CancelToken::new()).await;
        // Approved and executed; the request itself fails (nothing listens
        // on port 1) but it was dispatched, not denied.
        let err = state.tool_log[0].1.error.as_deref().unwrap();
        assert!(!err.contains("permission denied"), "got: {}", err);
    }

    #[tokio::test]
    async fn test_parallel_reads_preserve_order() {
        let (mut agent, dir) = harness(vec![
            Ok(r#"{"tool_calls": [
                {"tool": "read_file", "args": {"path": "a.txt"}},
                {"tool": "read_file", "args": {"path": "b.txt"}},
                {"tool": "read_file", "args": {"path": "c.txt"}}
            ]}"#
            .into()),
            Ok("Task complete.".into()),
        ]);
        agent.config.parallel_reads = true;
        std::fs::write(dir.path().join("a.txt"), "A").unwrap();
        std::fs::write(dir.path().join("b.txt"), "B").unwrap();
        std::fs::write(dir.path().join("c.txt"), "C").unwrap();

        let state = agent.run("read all three", &CancelToken::new()).await;
        assert_eq!(state.tool_log.len(), 3);
        assert_eq!(state.tool_log[0].1.output, "A");
        assert_eq!(state.tool_log[1].1.output, "B");
        assert_eq!(state.tool_log[2].1.output, "C");
    }

    #[tokio::test]
    async fn test_summarization_compresses_old_messages() {
        let big = "x".repeat(9000);
        let (mut agent, _dir) = harness(vec![
            Ok(format!(r#"pad {b} {{"tool": "list_dir", "args": {{"path": "."}}}}"#, b = big)),
            Ok(format!(r#"pad {b} {{"tool": "list_dir", "args": {{"path": "."}}}}"#, b = big)),
            Ok(format!(r#"pad {b} {{"tool": "list_dir", "args": {{"path": "."}}}}"#, b = big)),
            Ok("Task complete.".into()),
        ]);
        agent.options.context_summarize_threshold = 10_000;
        let state = agent.run("poke around", &CancelToken::new()).await;
        assert_eq!(state.terminal, Some(TerminalReason::Done));
        assert!(state
            .messages
            .iter()
            .any(|m| m.content.starts_with("Summary of earlier conversation")));
    }

    #[test]
    fn test_fingerprint_same_call_same_hash() {
        let a = fingerprint_hash("exec", &serde_json::json!({"command": "false"}), false);
        let b = fingerprint_hash("exec", &serde_json::json!({"command": "false"}), false);
        let c = fingerprint_hash("exec", &serde_json::json!({"command": "true"}), false);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_detect_stall_needs_four_repeats() {
        let mut window = VecDeque::new();
        let fp = |hash| Fingerprint {
            hash,
            description: "exec".into(),
            mutating_success: false,
        };
        for _ in 0..3 {
            push_window(&mut window, fp(1));
        }
        assert!(detect_stall(&window).is_none());
        push_window(&mut window, fp(1));
        assert!(detect_stall(&window).is_some());
    }

    #[test]
    fn test_detect_stall_blocked_by_mutating_success() {
        let mut window = VecDeque::new();
        for _ in 0..4 {
            push_window(
                &mut window,
                Fingerprint {
                    hash: 1,
                    description: "exec".into(),
                    mutating_success: false,
                },
            );
        }
        push_window(
            &mut window,
            Fingerprint {
                hash: 2,
                description: "write".into(),
                mutating_success: true,
            },
        );
        assert!(detect_stall(&window).is_none());
    }
}
