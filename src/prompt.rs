//! Prompt builders
//!
//! One system-prompt builder, called from agent-loop init. Mode is an
//! advisory label woven into the prompt; it never changes which tools
//! exist or what they may do.

use std::path::Path;

use crate::registry::Registry;

/// Advisory agent mode, injected into the system prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    Plan,
    Code,
    #[default]
    Do,
    Orchestrate,
    Ask,
    Debug,
}

impl Mode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "plan" => Some(Mode::Plan),
            "code" => Some(Mode::Code),
            "do" => Some(Mode::Do),
            "orchestrate" => Some(Mode::Orchestrate),
            "ask" => Some(Mode::Ask),
            "debug" => Some(Mode::Debug),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Plan => "plan",
            Mode::Code => "code",
            Mode::Do => "do",
            Mode::Orchestrate => "orchestrate",
            Mode::Ask => "ask",
            Mode::Debug => "debug",
        }
    }

    fn guidance(&self) -> &'static str {
        match self {
            Mode::Plan => "Favor analysis and planning; describe intended changes before making them.",
            Mode::Code => "Favor direct implementation; write and verify code changes.",
            Mode::Do => "Complete the task end to end with whatever tools it takes.",
            Mode::Orchestrate => "You are working on one shard of a larger task; stay within your shard.",
            Mode::Ask => "Favor answering from inspection; avoid modifying files unless asked.",
            Mode::Debug => "Favor diagnosis: reproduce, isolate, then fix the root cause.",
        }
    }
}

/// Build the system prompt for an agent loop.
pub fn system_prompt(work_dir: &Path, mode: Mode) -> String {
    format!(
        r#"You are ergon, an autonomous terminal agent. You complete tasks independently by calling tools.

Working directory: {work_dir}
Mode: {mode} - {mode_guidance}

## Tools

{tools}
## Tool Usage

Call tools with a JSON block, one object per call:

```json
{{"tool": "read_file", "args": {{"path": "src/main.rs"}}}}
```

Rules:
- Read files before modifying them.
- Use edit_file for targeted changes, write_file for full rewrites, patch_file for unified diffs.
- If a tool fails, read the error and try a DIFFERENT approach; never repeat a failing call unchanged.
- Paths are relative to the working directory. Do not try to escape it.

## Completion

When the task is fully complete (not just started), reply with plain prose and no tool call,
starting with "Task complete", and summarize what was done. Only declare completion after
verifying the result.
"#,
        work_dir = work_dir.display(),
        mode = mode.as_str(),
        mode_guidance = mode.guidance(),
        tools = Registry::global().describe(),
    )
}

/// One-shot planning turn for non-trivial tasks; the reply seeds the
/// conversation before the first tool turn.
pub fn planning_prompt(task: &str) -> String {
    format!(
        "Before touching any tools, lay out a short numbered plan for this task \
         (3-6 steps, one line each). Reply with the plan only.\n\nTask: {}",
        task
    )
}

/// Injected after the first stall detection.
pub fn strategy_change_prompt(repeated: &str) -> String {
    format!(
        "Your last several attempts repeated the same call without progress: {}. \
         That approach is not working. Try a different approach: use a different tool, \
         different arguments, or inspect the state first to understand why it fails.",
        repeated
    )
}

/// Fixed decomposition request used by the orchestrator.
pub fn decomposition_prompt(task: &str, max_shards: usize) -> String {
    format!(
        "Split the following task into at most {} INDEPENDENT shards that can run in \
         parallel without coordinating. Reply with a JSON array of strings, one shard \
         description per element, and nothing else. If the task cannot be split, reply \
         with a single-element array.\n\nTask: {}",
        max_shards, task
    )
}

/// Final synthesis turn over completed shard outputs.
pub fn synthesis_prompt(task: &str, outputs: &[(String, String)]) -> String {
    let mut sections = String::new();
    for (shard, output) in outputs {
        sections.push_str(&format!("### Shard: {}\n{}\n\n", shard, output));
    }
    format!(
        "Here are the outputs of {} shards that together addressed this task:\n\n\
         Task: {}\n\n{}\
         Compose one consolidated answer covering every shard's result. \
         Reply with prose only, no tool calls.",
        outputs.len(),
        task,
        sections
    )
}

/// Compress old conversation into one summary message (mechanical, no
/// model call): first line of each message, attributed.
pub fn summarize_messages(messages: &[crate::session::Message]) -> String {
    let mut out = String::from("Summary of earlier conversation:\n");
    for msg in messages {
        let head: String = msg.content.chars().take(160).collect();
        let head = head.replace('\n', " ");
        out.push_str(&format!("- [{}] {}\n", msg.role, head));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Message, Role};
    use std::path::PathBuf;

    #[test]
    fn test_system_prompt_mentions_tools_and_dir() {
        let p = system_prompt(&PathBuf::from("/home/user/project"), Mode::Do);
        assert!(p.contains("/home/user/project"));
        assert!(p.contains("read_file"));
        assert!(p.contains("exec"));
        assert!(p.contains("Task complete"));
    }

    #[test]
    fn test_mode_is_advisory_label() {
        let do_prompt = system_prompt(&PathBuf::from("/w"), Mode::Do);
        let plan_prompt = system_prompt(&PathBuf::from("/w"), Mode::Plan);
        // Different guidance, identical tool catalog.
        assert_ne!(do_prompt, plan_prompt);
        assert!(plan_prompt.contains("patch_file"));
        assert!(do_prompt.contains("patch_file"));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(Mode::parse("plan"), Some(Mode::Plan));
        assert_eq!(Mode::parse("orchestrate"), Some(Mode::Orchestrate));
        assert_eq!(Mode::parse("turbo"), None);
    }

    #[test]
    fn test_decomposition_prompt_asks_for_json() {
        let p = decomposition_prompt("write files A and B", 5);
        assert!(p.contains("JSON array"));
        assert!(p.contains("write files A and B"));
    }

    #[test]
    fn test_summarize_messages_truncates() {
        let long = "x".repeat(500);
        let msgs = vec![
            Message::new(Role::User, "short one"),
            Message::new(Role::Assistant, long),
        ];
        let summary = summarize_messages(&msgs);
        assert!(summary.contains("short one"));
        assert!(summary.len() < 500);
    }
}
