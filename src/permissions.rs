//! Permission gate - classifies tool calls and decides allow / prompt / deny
//!
//! Two modes: full-access (workspace writes allowed, elevated operations
//! prompt) and dangerously-full-access (everything allowed, but only when the
//! process actually holds the privilege - the EFFECTIVE mode may be lower
//! than the desired one).

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;

use crate::parser::ToolCall;
use crate::registry::{Registry, ToolCategory};

// ═══════════════════════════════════════════════════════════════
// MODES
// ═══════════════════════════════════════════════════════════════

/// Desired permission level, from config / env / CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PermissionMode {
    #[default]
    FullAccess,
    DangerouslyFullAccess,
}

impl PermissionMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "full-access" | "full_access" | "full" => Some(Self::FullAccess),
            "dangerously-full-access" | "dangerously_full_access" | "dangerous" => {
                Some(Self::DangerouslyFullAccess)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FullAccess => "full-access",
            Self::DangerouslyFullAccess => "dangerously-full-access",
        }
    }
}

/// How risky one call is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolClass {
    /// Read-only, inside the workspace
    Safe,
    /// Modifies files inside the workspace
    Writing,
    /// Writes outside the workspace, destructive commands, network writes
    Elevated,
}

/// The gate's verdict on one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// The caller must confirm; carries a human-readable description.
    Prompt(String),
    Deny(String),
}

// ═══════════════════════════════════════════════════════════════
// ELEVATION PROBE
// ═══════════════════════════════════════════════════════════════

/// Cached process-privilege probe. Reset whenever the desired mode changes.
static ELEVATION: Mutex<Option<bool>> = Mutex::new(None);

/// Whether this process can actually act with full privileges: running as
/// root, or a sudo password was passed through the environment.
fn process_is_privileged() -> bool {
    if let Some(cached) = *ELEVATION.lock().unwrap() {
        return cached;
    }
    let privileged = probe_privilege();
    *ELEVATION.lock().unwrap() = Some(privileged);
    privileged
}

fn probe_privilege() -> bool {
    if std::env::var("ERGON_SUDO_PASSWORD").map(|v| !v.is_empty()).unwrap_or(false) {
        return true;
    }
    Command::new("id")
        .arg("-u")
        .output()
        .map(|o| String::from_utf8_lossy(&o.stdout).trim() == "0")
        .unwrap_or(false)
}

/// Drop the cached probe; the next check re-runs it.
pub fn reset_elevation_cache() {
    *ELEVATION.lock().unwrap() = None;
}

// ═══════════════════════════════════════════════════════════════
// THE GATE
// ═══════════════════════════════════════════════════════════════

/// Evaluates every tool call before dispatch.
#[derive(Debug, Clone)]
pub struct Gate {
    desired: PermissionMode,
    effective: PermissionMode,
    workspace: PathBuf,
}

impl Gate {
    pub fn new(desired: PermissionMode, workspace: PathBuf) -> Self {
        let effective = match desired {
            PermissionMode::FullAccess => PermissionMode::FullAccess,
            PermissionMode::DangerouslyFullAccess => {
                if process_is_privileged() {
                    PermissionMode::DangerouslyFullAccess
                } else {
                    PermissionMode::FullAccess
                }
            }
        };
        Self {
            desired,
            effective,
            workspace,
        }
    }

    /// Test constructor: force the effective mode regardless of process
    /// privilege.
    pub fn with_effective(desired: PermissionMode, effective: PermissionMode, workspace: PathBuf) -> Self {
        Self {
            desired,
            effective,
            workspace,
        }
    }

    pub fn desired(&self) -> PermissionMode {
        self.desired
    }

    pub fn effective(&self) -> PermissionMode {
        self.effective
    }

    /// Whether the effective mode permits leaving the workspace.
    pub fn allows_outside_workspace(&self) -> bool {
        self.effective == PermissionMode::DangerouslyFullAccess
    }

    /// Classify a call as safe / writing / elevated.
    pub fn classify(&self, call: &ToolCall) -> ToolClass {
        let spec = match Registry::global().schema(&call.name) {
            Some(s) => s,
            // Unknown tools never reach the gate (the parser drops them),
            // but classify conservatively anyway.
            None => return ToolClass::Elevated,
        };

        let path_escapes = self.path_arg_escapes(call);

        match spec.category {
            ToolCategory::Read => {
                if path_escapes {
                    ToolClass::Elevated
                } else {
                    ToolClass::Safe
                }
            }
            ToolCategory::Write => {
                if path_escapes {
                    ToolClass::Elevated
                } else {
                    ToolClass::Writing
                }
            }
            ToolCategory::Execute => self.classify_execute(call),
            ToolCategory::Network => self.classify_network(call),
        }
    }

    /// Decision table:
    ///
    /// | class    | full-access        | dangerously-full-access (effective) |
    /// |----------|--------------------|-------------------------------------|
    /// | safe     | allow              | allow                               |
    /// | writing  | allow              | allow                               |
    /// | elevated | prompt             | allow                               |
    pub fn evaluate(&self, call: &ToolCall) -> Decision {
        match self.classify(call) {
            ToolClass::Safe | ToolClass::Writing => Decision::Allow,
            ToolClass::Elevated => {
                if self.effective == PermissionMode::DangerouslyFullAccess {
                    Decision::Allow
                } else {
                    Decision::Prompt(describe_call(call))
                }
            }
        }
    }

    fn classify_execute(&self, call: &ToolCall) -> ToolClass {
        // wait_for_output only reads an existing buffer
        if call.name == "wait_for_output" {
            return ToolClass::Safe;
        }
        if call.name == "send_input" {
            return ToolClass::Writing;
        }

        let command = call.args.get("command").and_then(|v| v.as_str()).unwrap_or("");
        if is_destructive_command(command) {
            return ToolClass::Elevated;
        }
        if let Some(cwd) = call.args.get("cwd").and_then(|v| v.as_str()) {
            if self.escapes_workspace(cwd) {
                return ToolClass::Elevated;
            }
        }
        // Arbitrary commands can touch files, so they count as writing.
        ToolClass::Writing
    }

    fn classify_network(&self, call: &ToolCall) -> ToolClass {
        let method = call
            .args
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_ascii_uppercase();
        match method.as_str() {
            "GET" | "HEAD" | "OPTIONS" => ToolClass::Safe,
            _ => ToolClass::Elevated,
        }
    }

    /// Does any path argument point outside the workspace?
    fn path_arg_escapes(&self, call: &ToolCall) -> bool {
        call.args
            .get("path")
            .and_then(|v| v.as_str())
            .map(|p| self.escapes_workspace(p))
            .unwrap_or(false)
    }

    fn escapes_workspace(&self, raw: &str) -> bool {
        !path_stays_within(&self.workspace, Path::new(raw))
    }
}

/// Lexically resolve `candidate` against `root` and check containment.
/// `..` components are resolved without touching the filesystem, so a
/// traversal that escapes is caught even when the path doesn't exist.
pub fn path_stays_within(root: &Path, candidate: &Path) -> bool {
    let mut resolved = if candidate.is_absolute() {
        PathBuf::new()
    } else {
        root.to_path_buf()
    };

    for comp in candidate.components() {
        match comp {
            Component::ParentDir => {
                if !resolved.pop() {
                    return false;
                }
            }
            Component::CurDir => {}
            other => resolved.push(other),
        }
    }
    resolved.starts_with(root)
}

/// Destructive command patterns that always count as elevated.
fn is_destructive_command(command: &str) -> bool {
    let cmd = command.trim();
    let lower = cmd.to_lowercase();

    lower.starts_with("sudo ")
        || lower == "sudo"
        || lower.contains("rm -rf")
        || lower.contains("rm -fr")
        || lower.contains("mkfs")
        || lower.contains("dd of=/dev/")
        || lower.contains(":(){")
        || lower.starts_with("shutdown")
        || lower.starts_with("reboot")
        || lower.contains("> /dev/sd")
        || lower.contains("chmod -r 777 /")
}

fn describe_call(call: &ToolCall) -> String {
    if let Some(cmd) = call.args.get("command").and_then(|v| v.as_str()) {
        return format!("{}: {}", call.name, cmd);
    }
    if let Some(path) = call.args.get("path").and_then(|v| v.as_str()) {
        return format!("{}: {}", call.name, path);
    }
    if let Some(url) = call.args.get("url").and_then(|v| v.as_str()) {
        return format!("{}: {}", call.name, url);
    }
    call.name.clone()
}
