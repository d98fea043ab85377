//! Tool executor - sandboxed execution of one tool call
//!
//! `execute` always returns a ToolResult and never panics: argument
//! problems, I/O failures, timeouts and cancellation all become structured
//! results the loop can feed back to the model. Path-taking tools are
//! confined to the workspace unless the effective permission mode grants
//! full access.

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::process::Command;

use crate::cache::FsCache;
use crate::cancel::CancelToken;
use crate::config::Options;
use crate::events::ChangeKind;
use crate::parser::ToolCall;
use crate::process::ProcessManager;
use crate::registry::Registry;
use crate::tools;

/// Commands that get the long VM-class timeout.
const VM_COMMAND_MARKERS: &[&str] = &["qemu-", "docker run", "vagrant up", "virsh"];

/// Cap on search_files / grep result rows.
const MAX_SEARCH_RESULTS: usize = 500;

// ═══════════════════════════════════════════════════════════════
// RESULT TYPES
// ═══════════════════════════════════════════════════════════════

/// A file mutation performed by a writing tool.
#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub old_content: Option<String>,
    pub new_content: Option<String>,
}

/// The outcome of one tool call. Created here exclusively.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub call_id: String,
    pub tool: String,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub duration: Duration,
    pub file_change: Option<FileChange>,
    pub command: Option<String>,
    pub cwd: Option<PathBuf>,
}

impl ToolResult {
    /// Render for the tool-role message the model sees next turn.
    pub fn render(&self) -> String {
        if self.success {
            if self.output.is_empty() {
                "(no output)".to_string()
            } else {
                self.output.clone()
            }
        } else {
            format!(
                "ERROR: {}{}",
                self.error.as_deref().unwrap_or("unknown"),
                if self.output.is_empty() {
                    String::new()
                } else {
                    format!("\n{}", self.output)
                }
            )
        }
    }
}

/// Intermediate per-tool outcome before timing/ids are attached.
struct ToolOutput {
    output: String,
    file_change: Option<FileChange>,
    command: Option<String>,
    cwd: Option<PathBuf>,
}

impl ToolOutput {
    fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            file_change: None,
            command: None,
            cwd: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════
// EXECUTOR
// ═══════════════════════════════════════════════════════════════

/// Executes tool calls against one workspace. Holds the cache and process
/// manager as capabilities, not ownership.
pub struct Executor {
    workspace: PathBuf,
    cache: Arc<FsCache>,
    processes: Arc<ProcessManager>,
    options: Options,
    /// Effective dangerously-full-access: paths may leave the workspace.
    allow_outside: bool,
}

impl Executor {
    pub fn new(
        workspace: PathBuf,
        cache: Arc<FsCache>,
        processes: Arc<ProcessManager>,
        options: Options,
        allow_outside: bool,
    ) -> Self {
        Self {
            workspace,
            cache,
            processes,
            options,
            allow_outside,
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    /// Run one call. Always returns; cancellation, timeouts and tool
    /// failures are reported in the result, never panicked or thrown.
    pub async fn execute(&self, cancel: &CancelToken, call: &ToolCall) -> ToolResult {
        let started = Instant::now();

        let fail = |error: String, started: Instant| ToolResult {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            success: false,
            output: String::new(),
            error: Some(error),
            duration: started.elapsed(),
            file_change: None,
            command: None,
            cwd: None,
        };

        if cancel.is_canceled() {
            return fail("cancelled before start".into(), started);
        }

        let spec = match Registry::global().schema(&call.name) {
            Some(s) => s,
            None => return fail(format!("unknown tool: {}", call.name), started),
        };
        if let Err(e) = spec.validate(&call.args) {
            return fail(e, started);
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(anyhow!("cancelled")),
            r = self.dispatch(cancel, call) => r,
        };

        match outcome {
            Ok(out) => ToolResult {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                success: true,
                output: out.output,
                error: None,
                duration: started.elapsed(),
                file_change: out.file_change,
                command: out.command,
                cwd: out.cwd,
            },
            Err(e) => fail(format!("{:#}", e), started),
        }
    }

    async fn dispatch(&self, cancel: &CancelToken, call: &ToolCall) -> Result<ToolOutput> {
        let args = &call.args;
        match call.name.as_str() {
            "exec" => self.tool_exec(args).await,
            "read_file" => self.tool_read_file(args),
            "write_file" => self.tool_write_file(args),
            "edit_file" => self.tool_edit_file(args),
            "append_file" => self.tool_append_file(args),
            "patch_file" => self.tool_patch_file(args),
            "list_dir" => self.tool_list_dir(args),
            "search_files" => self.tool_search_files(cancel, args).await,
            "grep" => self.tool_grep(cancel, args).await,
            "exec_background" => self.tool_exec_background(args),
            "wait_for_output" => self.tool_wait_for_output(args).await,
            "send_input" => self.tool_send_input(args).await,
            "http_request" => self.tool_http_request(args).await,
            other => Err(anyhow!("unknown tool: {}", other)),
        }
    }

    // ───────────────────────────────────────────────────────────
    // Path safety
    // ───────────────────────────────────────────────────────────

    /// Resolve a path argument against the workspace. Traversal that
    /// escapes the workspace is rejected unless the effective mode grants
    /// full access. The check is lexical, so it also covers paths that
    /// don't exist yet.
    fn resolve_path(&self, raw: &str) -> Result<PathBuf> {
        let candidate = Path::new(raw);
        let mut resolved = if candidate.is_absolute() {
            PathBuf::new()
        } else {
            self.workspace.clone()
        };

        for comp in candidate.components() {
            match comp {
                Component::ParentDir => {
                    if !resolved.pop() {
                        return Err(anyhow!("path escapes filesystem root: {}", raw));
                    }
                }
                Component::CurDir => {}
                other => resolved.push(other),
            }
        }

        if !resolved.starts_with(&self.workspace) && !self.allow_outside {
            return Err(anyhow!(
                "path outside workspace rejected: {} (workspace: {})",
                raw,
                self.workspace.display()
            ));
        }
        Ok(resolved)
    }

    fn exec_cwd(&self, args: &Value) -> Result<PathBuf> {
        match args.get("cwd").and_then(|v| v.as_str()) {
            Some(dir) => self.resolve_path(dir),
            None => Ok(self.workspace.clone()),
        }
    }

    // ───────────────────────────────────────────────────────────
    // exec
    // ───────────────────────────────────────────────────────────

    async fn tool_exec(&self, args: &Value) -> Result<ToolOutput> {
        let command = required_str(args, "command")?;
        let cwd = self.exec_cwd(args)?;
        let timeout = match args.get("timeout_seconds").and_then(|v| v.as_u64()) {
            Some(secs) => Duration::from_secs(secs),
            None if is_vm_command(command) => self.options.vm_timeout(),
            None => self.options.default_timeout(),
        };

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future (timeout or cancellation) must not
            // leave an orphan behind.
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn: {}", command))?;

        let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;

        let output = match waited {
            Ok(result) => result.with_context(|| format!("Failed to run: {}", command))?,
            Err(_) => return Err(anyhow!("command timed out after {:?}", timeout)),
        };

        let mut merged = String::from_utf8_lossy(&output.stdout).into_owned();
        merged.push_str(&String::from_utf8_lossy(&output.stderr));

        let mut out = ToolOutput::text(merged);
        out.command = Some(command.to_string());
        out.cwd = Some(cwd);

        match output.status.code() {
            Some(0) => Ok(out),
            Some(n) => Err(anyhow!("command exited with status {}\n{}", n, out.output)),
            None => Err(anyhow!("command terminated by signal\n{}", out.output)),
        }
    }

    // ───────────────────────────────────────────────────────────
    // File tools
    // ───────────────────────────────────────────────────────────

    fn tool_read_file(&self, args: &Value) -> Result<ToolOutput> {
        let path = self.resolve_path(required_str(args, "path")?)?;
        let content = self.cache.read(&path)?;

        if tools::looks_binary(&content) {
            return Err(anyhow!(
                "{} looks binary ({} bytes); refusing to read it as text",
                path.display(),
                content.len()
            ));
        }

        let offset = args.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let limit = args.get("limit").and_then(|v| v.as_u64()).map(|n| n as usize);

        let start = offset.min(content.len());
        let end = match limit {
            Some(l) => (start + l).min(content.len()),
            None => content.len(),
        };

        Ok(ToolOutput::text(
            String::from_utf8_lossy(&content[start..end]).into_owned(),
        ))
    }

    fn tool_write_file(&self, args: &Value) -> Result<ToolOutput> {
        let path = self.resolve_path(required_str(args, "path")?)?;
        let content = required_str(args, "content")?;

        let existed = path.exists();
        let old = if existed {
            std::fs::read_to_string(&path).ok()
        } else {
            None
        };

        // Directory-and-base extraction, never string slicing.
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        self.cache.invalidate(&path);

        let kind = if existed {
            ChangeKind::Modify
        } else {
            ChangeKind::Create
        };
        let mut out = ToolOutput::text(format!("wrote {} bytes to {}", content.len(), path.display()));
        out.file_change = Some(FileChange {
            path,
            kind,
            old_content: old,
            new_content: Some(content.to_string()),
        });
        Ok(out)
    }

    fn tool_append_file(&self, args: &Value) -> Result<ToolOutput> {
        let path = self.resolve_path(required_str(args, "path")?)?;
        let content = required_str(args, "content")?;

        let old = std::fs::read_to_string(&path)
            .with_context(|| format!("Cannot append to missing file {}", path.display()))?;

        let mut new = old.clone();
        new.push_str(content);
        std::fs::write(&path, &new)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        self.cache.invalidate(&path);

        let mut out = ToolOutput::text(format!(
            "appended {} bytes to {}",
            content.len(),
            path.display()
        ));
        out.file_change = Some(FileChange {
            path,
            kind: ChangeKind::Modify,
            old_content: Some(old),
            new_content: Some(new),
        });
        Ok(out)
    }

    fn tool_edit_file(&self, args: &Value) -> Result<ToolOutput> {
        let path = self.resolve_path(required_str(args, "path")?)?;
        let old_text = required_str(args, "old_text")?;
        let new_text = required_str(args, "new_text")?;

        let old = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let new = tools::replace_exact(&old, old_text, new_text)?;
        std::fs::write(&path, &new)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        self.cache.invalidate(&path);

        let mut out = ToolOutput::text(format!("edited {}", path.display()));
        out.file_change = Some(FileChange {
            path,
            kind: ChangeKind::Modify,
            old_content: Some(old),
            new_content: Some(new),
        });
        Ok(out)
    }

    fn tool_patch_file(&self, args: &Value) -> Result<ToolOutput> {
        let path = self.resolve_path(required_str(args, "path")?)?;
        let patch = required_str(args, "patch")?;

        let old = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let new = tools::apply_unified_patch(&old, patch)?;
        std::fs::write(&path, &new)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        self.cache.invalidate(&path);

        let mut out = ToolOutput::text(format!("patched {}", path.display()));
        out.file_change = Some(FileChange {
            path,
            kind: ChangeKind::Modify,
            old_content: Some(old),
            new_content: Some(new),
        });
        Ok(out)
    }

    fn tool_list_dir(&self, args: &Value) -> Result<ToolOutput> {
        let path = self.resolve_path(required_str(args, "path")?)?;
        let lines = self.cache.read_dir(&path)?;
        if lines.is_empty() {
            return Ok(ToolOutput::text("(empty directory)"));
        }
        Ok(ToolOutput::text(lines.join("\n")))
    }

    // ───────────────────────────────────────────────────────────
    // Searchers
    // ───────────────────────────────────────────────────────────

    async fn tool_search_files(&self, cancel: &CancelToken, args: &Value) -> Result<ToolOutput> {
        if cancel.is_canceled() {
            return Err(anyhow!("cancelled"));
        }
        let pattern = required_str(args, "pattern")?.to_string();
        let root = self.resolve_path(required_str(args, "path")?)?;
        let workspace = self.workspace.clone();

        let matches = tokio::time::timeout(
            self.options.default_timeout(),
            tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
                let full = root.join(&pattern);
                let mut found = Vec::new();
                for entry in glob::glob(&full.to_string_lossy())
                    .with_context(|| format!("Invalid glob pattern: {}", pattern))?
                {
                    if let Ok(path) = entry {
                        let shown = path
                            .strip_prefix(&workspace)
                            .map(|p| p.to_path_buf())
                            .unwrap_or(path);
                        found.push(shown.display().to_string());
                        if found.len() >= MAX_SEARCH_RESULTS {
                            break;
                        }
                    }
                }
                found.sort();
                Ok(found)
            }),
        )
        .await
        .map_err(|_| anyhow!("search timed out"))?
        .map_err(|e| anyhow!("search task failed: {}", e))??;

        if matches.is_empty() {
            return Ok(ToolOutput::text("(no matches)"));
        }
        Ok(ToolOutput::text(matches.join("\n")))
    }

    async fn tool_grep(&self, cancel: &CancelToken, args: &Value) -> Result<ToolOutput> {
        if cancel.is_canceled() {
            return Err(anyhow!("cancelled"));
        }
        let pattern = required_str(args, "pattern")?.to_string();
        let root = self.resolve_path(required_str(args, "path")?)?;

        let matches = tokio::time::timeout(
            self.options.default_timeout(),
            tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
                let re = regex::Regex::new(&pattern)
                    .with_context(|| format!("Invalid regex: {}", pattern))?;
                let mut found = Vec::new();
                grep_path(&re, &root, &mut found)?;
                Ok(found)
            }),
        )
        .await
        .map_err(|_| anyhow!("grep timed out"))?
        .map_err(|e| anyhow!("grep task failed: {}", e))??;

        if matches.is_empty() {
            return Ok(ToolOutput::text("(no matches)"));
        }
        Ok(ToolOutput::text(matches.join("\n")))
    }

    // ───────────────────────────────────────────────────────────
    // Background processes
    // ───────────────────────────────────────────────────────────

    fn tool_exec_background(&self, args: &Value) -> Result<ToolOutput> {
        let command = required_str(args, "command")?;
        let cwd = self.exec_cwd(args)?;
        let pid = self.processes.spawn(command, &cwd)?;

        let mut out = ToolOutput::text(format!("started background process with pid {}", pid));
        out.command = Some(command.to_string());
        out.cwd = Some(cwd);
        Ok(out)
    }

    async fn tool_wait_for_output(&self, args: &Value) -> Result<ToolOutput> {
        let pid = required_u64(args, "pid")? as u32;
        let pattern = required_str(args, "pattern")?;
        let timeout = Duration::from_secs(required_u64(args, "timeout_seconds")?);

        let matched = self.processes.wait_for_output(pid, pattern, timeout).await?;
        Ok(ToolOutput::text(matched))
    }

    async fn tool_send_input(&self, args: &Value) -> Result<ToolOutput> {
        let pid = required_u64(args, "pid")? as u32;
        let input = required_str(args, "input")?;

        self.processes.send_input(pid, input).await?;
        Ok(ToolOutput::text(format!(
            "sent {} bytes to pid {}",
            input.len(),
            pid
        )))
    }

    // ───────────────────────────────────────────────────────────
    // HTTP
    // ───────────────────────────────────────────────────────────

    async fn tool_http_request(&self, args: &Value) -> Result<ToolOutput> {
        let method = required_str(args, "method")?.to_ascii_uppercase();
        let url = required_str(args, "url")?;

        let method: reqwest::Method = method
            .parse()
            .map_err(|_| anyhow!("unsupported HTTP method: {}", method))?;

        let mut req = http_client().request(method, url);
        if let Some(headers) = args.get("headers").and_then(|v| v.as_object()) {
            for (k, v) in headers {
                if let Some(val) = v.as_str() {
                    req = req.header(k, val);
                }
            }
        }
        if let Some(body) = args.get("body").and_then(|v| v.as_str()) {
            req = req.body(body.to_string());
        }

        let resp = req
            .timeout(self.options.default_timeout())
            .send()
            .await
            .with_context(|| format!("Request failed: {}", url))?;

        let status = resp.status();
        let body = read_capped(resp, self.options.max_http_body).await?;
        let text = format!("HTTP {}\n{}", status.as_u16(), body);

        if status.is_client_error() || status.is_server_error() {
            return Err(anyhow!("{}", text));
        }
        Ok(ToolOutput::text(text))
    }
}

// ═══════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("missing required argument '{}'", key))
}

fn required_u64(args: &Value, key: &str) -> Result<u64> {
    args.get(key)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| anyhow!("missing required argument '{}'", key))
}

fn is_vm_command(command: &str) -> bool {
    VM_COMMAND_MARKERS.iter().any(|m| command.contains(m))
}

/// Recursive grep, skipping hidden entries and binary files.
fn grep_path(re: &regex::Regex, path: &Path, found: &mut Vec<String>) -> Result<()> {
    if found.len() >= MAX_SEARCH_RESULTS {
        return Ok(());
    }
    let meta = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;

    if meta.is_dir() {
        let mut entries: Vec<_> = std::fs::read_dir(path)
            .with_context(|| format!("Failed to list {}", path.display()))?
            .flatten()
            .collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            grep_path(re, &entry.path(), found)?;
            if found.len() >= MAX_SEARCH_RESULTS {
                return Ok(());
            }
        }
        return Ok(());
    }

    let Ok(bytes) = std::fs::read(path) else {
        return Ok(());
    };
    if tools::looks_binary(&bytes) {
        return Ok(());
    }
    let text = String::from_utf8_lossy(&bytes);
    for (lineno, line) in text.lines().enumerate() {
        if re.is_match(line) {
            found.push(format!("{}:{}:{}", path.display(), lineno + 1, line));
            if found.len() >= MAX_SEARCH_RESULTS {
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Read a response body up to `cap` bytes, dropping the rest.
async fn read_capped(resp: reqwest::Response, cap: usize) -> Result<String> {
    use futures::StreamExt;
    let mut stream = resp.bytes_stream();
    let mut buf: Vec<u8> = Vec::new();
    let mut truncated = false;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Failed reading response body")?;
        if buf.len() + chunk.len() > cap {
            buf.extend_from_slice(&chunk[..cap - buf.len()]);
            truncated = true;
            break;
        }
        buf.extend_from_slice(&chunk);
    }

    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        text.push_str("\n[body truncated at cap]");
    }
    Ok(text)
}

/// Package-level pooled HTTP client, shared by every http_request call.
fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(reqwest::Client::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: "call-1".into(),
            name: name.into(),
            args,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        executor: Executor,
        cache: Arc<FsCache>,
        root: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let cache = Arc::new(FsCache::new(
            Duration::from_secs(300),
            Duration::from_secs(60),
        ));
        let processes = Arc::new(ProcessManager::new(Duration::from_secs(300)));
        let executor = Executor::new(
            root.clone(),
            cache.clone(),
            processes,
            Options::default(),
            false,
        );
        Fixture {
            _dir: dir,
            executor,
            cache,
            root,
        }
    }

    #[tokio::test]
    async fn test_exec_success_merges_output() {
        let f = fixture();
        let r = f
            .executor
            .execute(&CancelToken::new(), &call("exec", json!({"command": "echo out; echo err >&2"})))
            .await;
        assert!(r.success);
        assert!(r.output.contains("out"));
        assert!(r.output.contains("err"));
        assert_eq!(r.cwd.as_deref(), Some(f.root.as_path()));
    }

    #[tokio::test]
    async fn test_exec_nonzero_exit_reports_status() {
        let f = fixture();
        let r = f
            .executor
            .execute(&CancelToken::new(), &call("exec", json!({"command": "exit 3"})))
            .await;
        assert!(!r.success);
        assert!(r.error.as_deref().unwrap().contains("status 3"));
    }

    #[tokio::test]
    async fn test_exec_timeout() {
        let f = fixture();
        let r = f
            .executor
            .execute(
                &CancelToken::new(),
                &call("exec", json!({"command": "sleep 5", "timeout_seconds": 1})),
            )
            .await;
        assert!(!r.success);
        assert!(r.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let f = fixture();
        let token = CancelToken::new();
        token.cancel();
        let r = f
            .executor
            .execute(&token, &call("exec", json!({"command": "echo hi"})))
            .await;
        assert!(!r.success);
        assert!(r.error.as_deref().unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_cancel_mid_exec() {
        let f = fixture();
        let token = CancelToken::new();
        let t2 = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            t2.cancel();
        });
        let started = Instant::now();
        let r = f
            .executor
            .execute(&token, &call("exec", json!({"command": "sleep 30"})))
            .await;
        assert!(!r.success);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_write_then_read_file() {
        let f = fixture();
        let w = f
            .executor
            .execute(
                &CancelToken::new(),
                &call("write_file", json!({"path": "out.txt", "content": "hi"})),
            )
            .await;
        assert!(w.success);
        let change = w.file_change.unwrap();
        assert_eq!(change.kind, ChangeKind::Create);

        let r = f
            .executor
            .execute(&CancelToken::new(), &call("read_file", json!({"path": "out.txt"})))
            .await;
        assert!(r.success);
        assert_eq!(r.output, "hi");
    }

    #[tokio::test]
    async fn test_write_creates_parent_dirs_and_invalidates() {
        let f = fixture();
        // Prime the directory cache
        f.cache.read_dir(&f.root).unwrap();
        let misses = f.cache.miss_count();

        let w = f
            .executor
            .execute(
                &CancelToken::new(),
                &call("write_file", json!({"path": "a/b/c.txt", "content": "x"})),
            )
            .await;
        assert!(w.success);
        assert!(f.root.join("a/b/c.txt").exists());

        // Root listing was invalidated by the write under it
        f.cache.read_dir(&f.root).unwrap();
        assert_eq!(f.cache.miss_count(), misses + 1);
    }

    #[tokio::test]
    async fn test_overwrite_reports_modify_with_old_content() {
        let f = fixture();
        std::fs::write(f.root.join("x.txt"), "before").unwrap();
        let w = f
            .executor
            .execute(
                &CancelToken::new(),
                &call("write_file", json!({"path": "x.txt", "content": "after"})),
            )
            .await;
        let change = w.file_change.unwrap();
        assert_eq!(change.kind, ChangeKind::Modify);
        assert_eq!(change.old_content.as_deref(), Some("before"));
        assert_eq!(change.new_content.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn test_edit_file_exact_match() {
        let f = fixture();
        std::fs::write(f.root.join("e.txt"), "hello world").unwrap();
        let r = f
            .executor
            .execute(
                &CancelToken::new(),
                &call(
                    "edit_file",
                    json!({"path": "e.txt", "old_text": "world", "new_text": "there"}),
                ),
            )
            .await;
        assert!(r.success);
        assert_eq!(std::fs::read_to_string(f.root.join("e.txt")).unwrap(), "hello there");
    }

    #[tokio::test]
    async fn test_edit_file_ambiguous_reports_count() {
        let f = fixture();
        std::fs::write(f.root.join("e.txt"), "aa aa aa").unwrap();
        let r = f
            .executor
            .execute(
                &CancelToken::new(),
                &call("edit_file", json!({"path": "e.txt", "old_text": "aa", "new_text": "b"})),
            )
            .await;
        assert!(!r.success);
        assert!(r.error.as_deref().unwrap().contains("3 matches"));
    }

    #[tokio::test]
    async fn test_append_requires_existing_file() {
        let f = fixture();
        let r = f
            .executor
            .execute(
                &CancelToken::new(),
                &call("append_file", json!({"path": "missing.txt", "content": "x"})),
            )
            .await;
        assert!(!r.success);
    }

    #[tokio::test]
    async fn test_patch_file_applies_diff() {
        let f = fixture();
        std::fs::write(f.root.join("p.txt"), "one\ntwo\nthree\n").unwrap();
        let patch = "@@ -1,3 +1,3 @@\n one\n-two\n+TWO\n three\n";
        let r = f
            .executor
            .execute(
                &CancelToken::new(),
                &call("patch_file", json!({"path": "p.txt", "patch": patch})),
            )
            .await;
        assert!(r.success, "error: {:?}", r.error);
        assert_eq!(
            std::fs::read_to_string(f.root.join("p.txt")).unwrap(),
            "one\nTWO\nthree\n"
        );
    }

    #[tokio::test]
    async fn test_patch_mismatch_names_failing_hunk() {
        let f = fixture();
        std::fs::write(f.root.join("p.txt"), "unexpected\n").unwrap();
        let patch = "@@ -1,1 +1,1 @@\n-one\n+ONE\n";
        let r = f
            .executor
            .execute(
                &CancelToken::new(),
                &call("patch_file", json!({"path": "p.txt", "patch": patch})),
            )
            .await;
        assert!(!r.success);
        assert!(r.error.as_deref().unwrap().contains("hunk 1"));
    }

    #[tokio::test]
    async fn test_list_dir_sorted_typed() {
        let f = fixture();
        std::fs::write(f.root.join("b.txt"), "").unwrap();
        std::fs::create_dir(f.root.join("a")).unwrap();
        let r = f
            .executor
            .execute(&CancelToken::new(), &call("list_dir", json!({"path": "."})))
            .await;
        assert!(r.success);
        assert_eq!(r.output, "dir a\nfile b.txt");
    }

    #[tokio::test]
    async fn test_search_files_glob() {
        let f = fixture();
        std::fs::create_dir_all(f.root.join("cmd")).unwrap();
        std::fs::write(f.root.join("cmd/main.go"), "package main").unwrap();
        std::fs::write(f.root.join("cmd/util.go"), "package main").unwrap();
        std::fs::write(f.root.join("readme.md"), "").unwrap();

        let r = f
            .executor
            .execute(
                &CancelToken::new(),
                &call("search_files", json!({"pattern": "**/*.go", "path": "."})),
            )
            .await;
        assert!(r.success);
        assert!(r.output.contains("cmd/main.go"));
        assert!(r.output.contains("cmd/util.go"));
        assert!(!r.output.contains("readme.md"));
    }

    #[tokio::test]
    async fn test_grep_reports_line_numbers() {
        let f = fixture();
        std::fs::write(f.root.join("g.txt"), "alpha\nneedle here\nomega\n").unwrap();
        let r = f
            .executor
            .execute(
                &CancelToken::new(),
                &call("grep", json!({"pattern": "needle", "path": "."})),
            )
            .await;
        assert!(r.success);
        assert!(r.output.contains(":2:needle here"));
    }

    #[tokio::test]
    async fn test_binary_file_refused() {
        let f = fixture();
        std::fs::write(f.root.join("bin.dat"), b"abc\x00def").unwrap();
        let r = f
            .executor
            .execute(&CancelToken::new(), &call("read_file", json!({"path": "bin.dat"})))
            .await;
        assert!(!r.success);
        assert!(r.error.as_deref().unwrap().contains("binary"));
    }

    #[tokio::test]
    async fn test_read_offset_limit() {
        let f = fixture();
        std::fs::write(f.root.join("o.txt"), "0123456789").unwrap();
        let r = f
            .executor
            .execute(
                &CancelToken::new(),
                &call("read_file", json!({"path": "o.txt", "offset": 2, "limit": 3})),
            )
            .await;
        assert!(r.success);
        assert_eq!(r.output, "234");
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let f = fixture();
        let r = f
            .executor
            .execute(
                &CancelToken::new(),
                &call("read_file", json!({"path": "../../../etc/passwd"})),
            )
            .await;
        assert!(!r.success);
        assert!(r.error.as_deref().unwrap().contains("workspace"));
    }

    #[tokio::test]
    async fn test_outside_workspace_allowed_when_effective_dangerous() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("o.txt");
        std::fs::write(&target, "outside").unwrap();

        let cache = Arc::new(FsCache::new(
            Duration::from_secs(300),
            Duration::from_secs(60),
        ));
        let processes = Arc::new(ProcessManager::new(Duration::from_secs(300)));
        let executor = Executor::new(root, cache, processes, Options::default(), true);

        let r = executor
            .execute(
                &CancelToken::new(),
                &call("read_file", json!({"path": target.to_string_lossy()})),
            )
            .await;
        assert!(r.success);
        assert_eq!(r.output, "outside");
    }

    #[tokio::test]
    async fn test_unknown_tool_refused() {
        let f = fixture();
        let r = f
            .executor
            .execute(&CancelToken::new(), &call("teleport", json!({})))
            .await;
        assert!(!r.success);
    }

    #[tokio::test]
    async fn test_bad_args_refused_by_schema() {
        let f = fixture();
        let r = f
            .executor
            .execute(&CancelToken::new(), &call("exec", json!({})))
            .await;
        assert!(!r.success);
        assert!(r.error.as_deref().unwrap().contains("command"));
    }

    #[tokio::test]
    async fn test_exec_background_and_wait() {
        let f = fixture();
        let r = f
            .executor
            .execute(
                &CancelToken::new(),
                &call("exec_background", json!({"command": "echo bg-ready"})),
            )
            .await;
        assert!(r.success);
        let pid: u64 = r
            .output
            .split_whitespace()
            .last()
            .unwrap()
            .parse()
            .unwrap();

        let w = f
            .executor
            .execute(
                &CancelToken::new(),
                &call(
                    "wait_for_output",
                    json!({"pid": pid, "pattern": "bg-ready", "timeout_seconds": 5}),
                ),
            )
            .await;
        assert!(w.success, "error: {:?}", w.error);
        assert_eq!(w.output, "bg-ready");
    }

    #[tokio::test]
    async fn test_send_input_unknown_pid_rejected() {
        let f = fixture();
        let r = f
            .executor
            .execute(
                &CancelToken::new(),
                &call("send_input", json!({"pid": 424242, "input": "x\n"})),
            )
            .await;
        assert!(!r.success);
    }

    #[test]
    fn test_vm_command_detection() {
        assert!(is_vm_command("qemu-system-x86_64 -m 2G"));
        assert!(is_vm_command("docker run -it ubuntu"));
        assert!(is_vm_command("vagrant up"));
        assert!(is_vm_command("virsh start dom"));
        assert!(!is_vm_command("cargo build"));
    }

    #[test]
    fn test_render_success_and_error() {
        let mut r = ToolResult {
            call_id: "c".into(),
            tool: "exec".into(),
            success: true,
            output: "hi".into(),
            error: None,
            duration: Duration::ZERO,
            file_change: None,
            command: None,
            cwd: None,
        };
        assert_eq!(r.render(), "hi");
        r.success = false;
        r.error = Some("boom".into());
        assert!(r.render().starts_with("ERROR: boom"));
    }
}
