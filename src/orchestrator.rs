//! Orchestrator - parallel agent loops across isolated panes
//!
//! Decomposes a task into independent shards, runs one agent loop per shard
//! in its own pane (bounded by max-parallel), then synthesizes the shard
//! outputs into one consolidated answer with a final model turn.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::agent::{AgentLoop, AgentState, LoopConfig, TerminalReason};
use crate::cache::FsCache;
use crate::cancel::CancelToken;
use crate::client::ModelClient;
use crate::config::Options;
use crate::events::{EventSender, ProgressEvent};
use crate::executor::Executor;
use crate::permissions::{Gate, PermissionMode};
use crate::process::ProcessManager;
use crate::prompt::{self, Mode};
use crate::session::{Message, Role};

/// Hard ceiling on max-parallel, whatever the caller asks for.
const MAX_PARALLEL_CEILING: usize = 50;

// ═══════════════════════════════════════════════════════════════
// PANES
// ═══════════════════════════════════════════════════════════════

/// Pane lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaneState {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl PaneState {
    fn from_terminal(reason: TerminalReason) -> Self {
        match reason {
            TerminalReason::Done => PaneState::Completed,
            TerminalReason::Canceled => PaneState::Canceled,
            TerminalReason::MaxIterations | TerminalReason::Stall | TerminalReason::Error => {
                PaneState::Failed
            }
        }
    }
}

/// One isolated execution context: its own workspace root and AgentState.
#[derive(Debug)]
pub struct Pane {
    pub id: String,
    pub workspace: PathBuf,
    pub shard: String,
    pub state: PaneState,
    pub agent: Option<AgentState>,
}

/// What an orchestrated run produced.
#[derive(Debug)]
pub struct OrchestratorResult {
    pub panes: Vec<Pane>,
    pub output: String,
    /// Whether a synthesis turn ran (it is skipped for single-shard runs).
    pub synthesized: bool,
}

// ═══════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Panes allowed to run at once (clamped to 1..=50).
    pub max_parallel: usize,
    /// Give each pane a fresh subdirectory instead of the shared workspace.
    pub isolate_workspaces: bool,
    /// Cancel everything as soon as one pane fails.
    pub fail_fast: bool,
    /// Ask the model for a decomposition when rules find fewer than 2 shards.
    pub model_decomposition: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel: 5,
            isolate_workspaces: true,
            fail_fast: false,
            model_decomposition: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// ORCHESTRATOR
// ═══════════════════════════════════════════════════════════════

pub struct Orchestrator {
    client: Arc<ModelClient>,
    workspace: PathBuf,
    cache: Arc<FsCache>,
    processes: Arc<ProcessManager>,
    options: Options,
    config: OrchestratorConfig,
    permission_mode: PermissionMode,
    events: EventSender,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<ModelClient>,
        workspace: PathBuf,
        cache: Arc<FsCache>,
        processes: Arc<ProcessManager>,
        options: Options,
        config: OrchestratorConfig,
        permission_mode: PermissionMode,
        events: EventSender,
    ) -> Self {
        Self {
            client,
            workspace,
            cache,
            processes,
            options,
            config,
            permission_mode,
            events,
        }
    }

    /// Decompose, schedule, aggregate. Cancelling the token stops every
    /// running pane; queued panes never start.
    pub async fn run(&self, task: &str, cancel: &CancelToken) -> Result<OrchestratorResult> {
        let shards = self.decompose(task, cancel).await;
        let max_parallel = self.config.max_parallel.clamp(1, MAX_PARALLEL_CEILING);

        self.events.emit(ProgressEvent::run_state(format!(
            "orchestrating {} shard(s), max {} parallel",
            shards.len(),
            max_parallel
        )));

        let mut panes = self.allocate_panes(&shards)?;

        // Scheduling: a semaphore keeps at most max_parallel loops running;
        // queued panes start as permits free up.
        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let mut set: JoinSet<(usize, AgentState)> = JoinSet::new();

        for (index, pane) in panes.iter().enumerate() {
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let agent = self.build_loop(&pane.workspace);
            let shard = pane.shard.clone();
            let pane_id = pane.id.clone();
            let events = self.events.clone();

            set.spawn(async move {
                // Queued until a permit frees up. An orchestrator-level
                // cancel lets the pane through; the loop then terminates
                // immediately as canceled.
                let _permit = tokio::select! {
                    p = semaphore.acquire_owned() => p.ok(),
                    _ = cancel.cancelled() => None,
                };
                events.emit(ProgressEvent::run_state(format!("{}: running", pane_id)));
                let state = agent.run(&shard, &cancel).await;
                (index, state)
            });
        }

        let mut failed = false;
        while let Some(joined) = set.join_next().await {
            let (index, state) = joined.context("pane task panicked")?;
            let pane = &mut panes[index];
            pane.state = PaneState::from_terminal(state.terminal_reason());
            self.events.emit(ProgressEvent::run_state(format!(
                "{}: {:?}",
                pane.id, pane.state
            )));
            if pane.state == PaneState::Failed {
                failed = true;
                if self.config.fail_fast {
                    cancel.cancel();
                }
            }
            pane.agent = Some(state);
        }

        // Aggregation: the synthesis turn strictly follows all terminations
        // and is skipped for a single shard.
        let output = if cancel.is_canceled() {
            panes
                .iter()
                .filter_map(|p| p.agent.as_ref())
                .map(|a| a.final_output.clone())
                .collect::<Vec<_>>()
                .join("\n")
        } else if panes.len() == 1 {
            panes[0]
                .agent
                .as_ref()
                .map(|a| a.final_output.clone())
                .unwrap_or_default()
        } else {
            self.synthesize(task, &panes, cancel).await?
        };

        let synthesized = panes.len() > 1 && !cancel.is_canceled();
        if failed && !self.config.fail_fast {
            self.events
                .emit(ProgressEvent::system("one or more panes failed".to_string()));
        }

        Ok(OrchestratorResult {
            panes,
            output,
            synthesized,
        })
    }

    // ───────────────────────────────────────────────────────────
    // Decomposition
    // ───────────────────────────────────────────────────────────

    /// Rule-based splitting first; a model turn only if that found nothing.
    async fn decompose(&self, task: &str, cancel: &CancelToken) -> Vec<String> {
        let rule_shards = rule_based_shards(task);
        if rule_shards.len() >= 2 {
            return rule_shards;
        }

        if self.config.model_decomposition && !cancel.is_canceled() {
            if let Some(shards) = self.model_decompose(task, cancel).await {
                if shards.len() >= 2 {
                    return shards;
                }
            }
        }

        vec![task.to_string()]
    }

    async fn model_decompose(&self, task: &str, cancel: &CancelToken) -> Option<Vec<String>> {
        let messages = vec![
            Message::new(Role::System, "You decompose tasks. Reply only with JSON."),
            Message::new(
                Role::User,
                prompt::decomposition_prompt(task, self.config.max_parallel.max(2)),
            ),
        ];
        let outcome = match self.client.chat(cancel, &messages, None).await {
            Ok(o) => o,
            Err(e) => {
                self.events
                    .emit(ProgressEvent::system(format!("decomposition turn failed: {}", e)));
                return None;
            }
        };
        parse_shard_list(&outcome.text)
    }

    // ───────────────────────────────────────────────────────────
    // Panes
    // ───────────────────────────────────────────────────────────

    fn allocate_panes(&self, shards: &[String]) -> Result<Vec<Pane>> {
        let mut panes = Vec::with_capacity(shards.len());
        for (i, shard) in shards.iter().enumerate() {
            let id = format!("pane-{}", i + 1);
            let workspace = if self.config.isolate_workspaces && shards.len() > 1 {
                let dir = self.workspace.join("panes").join(&id);
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("Failed to create pane workspace {}", dir.display()))?;
                dir
            } else {
                self.workspace.clone()
            };
            panes.push(Pane {
                id,
                workspace,
                shard: shard.clone(),
                state: PaneState::Queued,
                agent: None,
            });
        }
        Ok(panes)
    }

    fn build_loop(&self, workspace: &PathBuf) -> AgentLoop {
        let gate = Gate::new(self.permission_mode, workspace.clone());
        let allow_outside = gate.allows_outside_workspace();
        let executor = Arc::new(Executor::new(
            workspace.clone(),
            self.cache.clone(),
            self.processes.clone(),
            self.options.clone(),
            allow_outside,
        ));
        AgentLoop::new(
            self.client.clone(),
            executor,
            gate,
            self.options.clone(),
            LoopConfig {
                mode: Mode::Orchestrate,
                skip_planning: true,
                ..Default::default()
            },
            self.events.clone(),
            None,
        )
    }

    // ───────────────────────────────────────────────────────────
    // Synthesis
    // ───────────────────────────────────────────────────────────

    async fn synthesize(
        &self,
        task: &str,
        panes: &[Pane],
        cancel: &CancelToken,
    ) -> Result<String> {
        let outputs: Vec<(String, String)> = panes
            .iter()
            .map(|p| {
                let text = match (&p.agent, p.state) {
                    (Some(a), PaneState::Completed) => a.final_output.clone(),
                    (Some(a), _) => format!(
                        "(pane ended {}: {})",
                        a.terminal_reason().as_str(),
                        a.last_error.clone().unwrap_or_else(|| a.final_output.clone())
                    ),
                    (None, _) => "(pane never ran)".to_string(),
                };
                (p.shard.clone(), text)
            })
            .collect();

        let messages = vec![
            Message::new(Role::System, "You consolidate parallel work into one answer."),
            Message::new(Role::User, prompt::synthesis_prompt(task, &outputs)),
        ];
        let outcome = self
            .client
            .chat(cancel, &messages, None)
            .await
            .context("synthesis turn failed")?;
        Ok(outcome.text)
    }
}

// ═══════════════════════════════════════════════════════════════
// RULE-BASED SPLITTING
// ═══════════════════════════════════════════════════════════════

/// Split explicitly enumerated subtasks: numbered/bulleted lines, or an
/// inline comma list ("write files A, B, C").
pub fn rule_based_shards(task: &str) -> Vec<String> {
    let enumerated = enumerated_lines(task);
    if enumerated.len() >= 2 {
        return enumerated;
    }
    if let Some(inline) = split_inline_list(task) {
        return inline;
    }
    Vec::new()
}

fn enumerated_lines(task: &str) -> Vec<String> {
    let mut items = Vec::new();
    for line in task.lines() {
        let t = line.trim();
        let rest = t
            .strip_prefix("- ")
            .or_else(|| t.strip_prefix("* "))
            .or_else(|| strip_number_prefix(t));
        if let Some(rest) = rest {
            if !rest.trim().is_empty() {
                items.push(rest.trim().to_string());
            }
        }
    }
    items
}

fn strip_number_prefix(line: &str) -> Option<&str> {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let rest = &line[digits..];
    rest.strip_prefix('.').or_else(|| rest.strip_prefix(')'))
}

/// "write files A, B, and C" -> ["write files A", "write files B",
/// "write files C"]. Only fires on single-line tasks whose list elements
/// are short, so ordinary prose with commas stays whole.
fn split_inline_list(task: &str) -> Option<Vec<String>> {
    let task = task.trim();
    if task.lines().count() > 1 {
        return None;
    }
    let parts: Vec<&str> = task.split(',').map(str::trim).collect();
    if parts.len() < 3 {
        return None;
    }

    let first = parts[0];
    let split_at = first.rfind(' ')?;
    let (prefix, first_item) = first.split_at(split_at);
    let prefix = prefix.trim();

    let mut items = vec![first_item.trim().to_string()];
    for part in &parts[1..] {
        let cleaned = part
            .strip_prefix("and ")
            .unwrap_or(part)
            .trim()
            .trim_end_matches('.');
        if !cleaned.is_empty() {
            items.push(cleaned.to_string());
        }
    }

    // List elements are names, not clauses.
    if items.len() < 2 || items.iter().any(|i| i.split_whitespace().count() > 4) {
        return None;
    }

    Some(
        items
            .into_iter()
            .map(|item| format!("{} {}", prefix, item))
            .collect(),
    )
}

/// Extract a JSON array of shard strings from a decomposition reply.
fn parse_shard_list(reply: &str) -> Option<Vec<String>> {
    let start = reply.find('[')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    let bytes = reply.as_bytes();
    let mut end = None;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' => depth += 1,
            b']' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(start + offset);
                    break;
                }
            }
            _ => {}
        }
    }

    let span = &reply[start..=end?];
    let shards: Vec<String> = serde_json::from_str(span).ok()?;
    let shards: Vec<String> = shards
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if shards.is_empty() {
        None
    } else {
        Some(shards)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerated_lines_split() {
        let task = "do these:\n1. fix the parser\n2. add tests\n3. update docs";
        let shards = rule_based_shards(task);
        assert_eq!(shards, vec!["fix the parser", "add tests", "update docs"]);
    }

    #[test]
    fn test_bulleted_lines_split() {
        let task = "- build the cli\n- build the server";
        let shards = rule_based_shards(task);
        assert_eq!(shards.len(), 2);
    }

    #[test]
    fn test_inline_comma_list() {
        let shards = rule_based_shards("write files A, B, C");
        assert_eq!(shards, vec!["write files A", "write files B", "write files C"]);
    }

    #[test]
    fn test_inline_list_with_and() {
        let shards = rule_based_shards("create modules alpha, beta, and gamma");
        assert_eq!(
            shards,
            vec![
                "create modules alpha",
                "create modules beta",
                "create modules gamma"
            ]
        );
    }

    #[test]
    fn test_prose_with_commas_not_split() {
        let task = "refactor the parser, which is slow, into a cleaner design that handles every documented edge case";
        assert!(rule_based_shards(task).is_empty());
    }

    #[test]
    fn test_single_task_not_split() {
        assert!(rule_based_shards("fix the bug in src/main.rs").is_empty());
    }

    #[test]
    fn test_parse_shard_list_plain() {
        let shards = parse_shard_list(r#"["shard one", "shard two"]"#).unwrap();
        assert_eq!(shards.len(), 2);
    }

    #[test]
    fn test_parse_shard_list_with_prose_and_fence() {
        let reply = "Here you go:\n```json\n[\"a\", \"b\", \"c\"]\n```";
        let shards = parse_shard_list(reply).unwrap();
        assert_eq!(shards, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_parse_shard_list_rejects_non_strings() {
        assert!(parse_shard_list(r#"[1, 2, 3]"#).is_none());
        assert!(parse_shard_list("no json here").is_none());
    }

    #[test]
    fn test_pane_state_from_terminal() {
        assert_eq!(
            PaneState::from_terminal(TerminalReason::Done),
            PaneState::Completed
        );
        assert_eq!(
            PaneState::from_terminal(TerminalReason::Stall),
            PaneState::Failed
        );
        assert_eq!(
            PaneState::from_terminal(TerminalReason::Canceled),
            PaneState::Canceled
        );
    }
}
