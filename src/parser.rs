//! Tool-call extraction from assistant replies
//!
//! Models emit tool calls in many shapes: fenced JSON, bare JSON objects,
//! OpenAI-style {"name": ..., "arguments": ...}, tool_calls arrays, a
//! single-key object named after the tool, marker-delimited argument objects,
//! a key-value flag syntax, or just a shell command. All of them normalize
//! to the same ToolCall here.
//!
//! The parser is pure: no I/O, no clock, same input -> same output.

use serde_json::Value;

use crate::registry::Registry;

/// A parsed tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Unique within one reply; synthesized (`call-N`) when the reply
    /// carries no id of its own.
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Everything extracted from one reply.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub calls: Vec<ToolCall>,
    /// Human-readable notes about dropped or malformed fragments.
    pub diagnostics: Vec<String>,
}

/// Parse an assistant reply into tool calls. Total: never fails, never
/// panics; an unparseable reply yields an empty list.
pub fn parse_reply(text: &str) -> ParseOutcome {
    let mut out = ParseOutcome::default();
    let mut counter = 0usize;

    // Marker-delimited forms first; their spans are blanked so the JSON
    // scan below doesn't see them twice.
    let mut remaining = extract_kv_blocks(text, &mut out, &mut counter);
    remaining = extract_marker_blocks(&remaining, &mut out, &mut counter);

    // Fence markers are noise for the brace scanner.
    let cleaned = strip_fence_lines(&remaining);
    scan_json_values(&cleaned, &mut out, &mut counter);

    // Last resort: the reply itself is a shell command.
    if out.calls.is_empty() {
        if let Some(command) = detect_shell_command(text) {
            out.calls.push(ToolCall {
                id: synth_id(&mut counter),
                name: "exec".into(),
                args: serde_json::json!({ "command": command }),
            });
        }
    }

    out
}

fn synth_id(counter: &mut usize) -> String {
    *counter += 1;
    format!("call-{}", counter)
}

// ═══════════════════════════════════════════════════════════════
// JSON FORMS
// ═══════════════════════════════════════════════════════════════

/// Replace ``` fence lines with blanks so fenced JSON parses like bare JSON.
fn strip_fence_lines(text: &str) -> String {
    text.lines()
        .map(|line| {
            if line.trim_start().starts_with("```") {
                ""
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Scan for balanced top-level JSON objects/arrays and convert each one.
fn scan_json_values(text: &str, out: &mut ParseOutcome, counter: &mut usize) {
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c == b'{' || c == b'[' {
            if let Some(end) = find_balanced_end(bytes, i) {
                let span = &text[i..=end];
                if let Ok(value) = serde_json::from_str::<Value>(span) {
                    convert_value(&value, out, counter);
                    i = end + 1;
                    continue;
                }
            }
        }
        i += 1;
    }
}

/// Find the index of the close matching the open at `start`, honoring
/// string literals and escapes. Returns None if unbalanced.
fn find_balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

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
            _ if b == open => depth += 1,
            _ if b == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Convert one JSON value into zero or more calls. Handles the object
/// forms, the tool_calls array key, and bare arrays of either.
fn convert_value(value: &Value, out: &mut ParseOutcome, counter: &mut usize) {
    match value {
        Value::Array(items) => {
            for item in items {
                convert_value(item, out, counter);
            }
        }
        Value::Object(obj) => {
            // {"tool_calls": [...]} wrapper
            if let Some(Value::Array(items)) = obj.get("tool_calls") {
                for item in items {
                    convert_value(item, out, counter);
                }
                return;
            }

            // {"tool": NAME, "args": {...}}
            if let Some(name) = obj.get("tool").and_then(|v| v.as_str()) {
                let args = obj.get("args").cloned().unwrap_or(Value::Object(Default::default()));
                push_call(name, args, obj.get("id"), out, counter);
                return;
            }

            // {"name": NAME, "arguments": {...}} (also accepts "args")
            if let Some(name) = obj.get("name").and_then(|v| v.as_str()) {
                let args = obj
                    .get("arguments")
                    .or_else(|| obj.get("args"))
                    .cloned()
                    .unwrap_or(Value::Object(Default::default()));
                let args = match args {
                    // OpenAI encodes arguments as a JSON string
                    Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
                    other => other,
                };
                push_call(name, args, obj.get("id"), out, counter);
                return;
            }

            // {NAME: {...args...}} with exactly one registered-tool key
            if obj.len() == 1 {
                let (key, val) = obj.iter().next().unwrap();
                if Registry::global().is_known(key) && val.is_object() {
                    push_call(key, val.clone(), None, out, counter);
                }
            }
        }
        _ => {}
    }
}

fn push_call(name: &str, args: Value, id: Option<&Value>, out: &mut ParseOutcome, counter: &mut usize) {
    if !Registry::global().is_known(name) {
        out.diagnostics
            .push(format!("dropped call to unknown tool '{}'", name));
        return;
    }
    let id = id
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| synth_id(counter));
    out.calls.push(ToolCall {
        id,
        name: name.to_string(),
        args,
    });
}

// ═══════════════════════════════════════════════════════════════
// MARKER FORMS
// ═══════════════════════════════════════════════════════════════

/// `[tool_calls] {...} [/tool_calls]`: a bare arguments object with no tool
/// name means exec. Objects that do carry a recognizable shape go through
/// the normal conversion. Matched spans are blanked out of the returned text.
fn extract_marker_blocks(text: &str, out: &mut ParseOutcome, counter: &mut usize) -> String {
    let re = marker_re();
    let mut result = String::with_capacity(text.len());
    let mut last = 0;

    for cap in re.captures_iter(text) {
        let whole = cap.get(0).unwrap();
        let body = cap.get(1).unwrap().as_str().trim();
        result.push_str(&text[last..whole.start()]);
        last = whole.end();

        match serde_json::from_str::<Value>(body) {
            Ok(value) => {
                let looks_named = value
                    .as_object()
                    .map(|o| {
                        o.contains_key("tool")
                            || o.contains_key("name")
                            || o.contains_key("tool_calls")
                            || (o.len() == 1
                                && Registry::global().is_known(o.keys().next().unwrap()))
                    })
                    .unwrap_or(false);
                if looks_named || value.is_array() {
                    convert_value(&value, out, counter);
                } else if value.is_object() {
                    // Bare arguments: assume exec
                    push_call("exec", value, None, out, counter);
                } else {
                    out.diagnostics
                        .push("tool_calls marker did not contain an object".into());
                }
            }
            Err(e) => {
                out.diagnostics
                    .push(format!("unparseable tool_calls block: {}", e));
            }
        }
    }
    result.push_str(&text[last..]);
    result
}

/// `[TOOL_CALL] name => --flag "value" ... [/TOOL_CALL]`: key-value syntax
/// mapped to JSON before validation. Digit-only and boolean values are
/// coerced so the form is equivalent to the JSON ones.
fn extract_kv_blocks(text: &str, out: &mut ParseOutcome, counter: &mut usize) -> String {
    let re = kv_block_re();
    let mut result = String::with_capacity(text.len());
    let mut last = 0;

    for cap in re.captures_iter(text) {
        let whole = cap.get(0).unwrap();
        let body = cap.get(1).unwrap().as_str().trim();
        result.push_str(&text[last..whole.start()]);
        last = whole.end();

        match parse_kv_body(body) {
            Some((name, args)) => push_call(&name, args, None, out, counter),
            None => out
                .diagnostics
                .push(format!("unparseable TOOL_CALL block: {}", first_line(body))),
        }
    }
    result.push_str(&text[last..]);
    result
}

/// Parse `name => --key "value" --key2 "value2"`.
fn parse_kv_body(body: &str) -> Option<(String, Value)> {
    let (name_part, flags_part) = body.split_once("=>")?;
    let name = name_part.trim().to_string();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }

    let mut args = serde_json::Map::new();
    for cap in kv_flag_re().captures_iter(flags_part) {
        let key = cap.get(1).unwrap().as_str().to_string();
        let raw = cap.get(2).unwrap().as_str().replace("\\\"", "\"");
        args.insert(key, coerce_scalar(&raw));
    }
    if args.is_empty() {
        return None;
    }
    Some((name, Value::Object(args)))
}

/// String -> JSON scalar: integers and booleans keep their natural type so
/// the kv form round-trips equal to the JSON forms.
fn coerce_scalar(raw: &str) -> Value {
    if let Ok(n) = raw.parse::<i64>() {
        return Value::from(n);
    }
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(raw.to_string()),
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}

// ═══════════════════════════════════════════════════════════════
// SHELL COMMAND HEURISTIC
// ═══════════════════════════════════════════════════════════════

/// Binaries a bare reply may legitimately start with.
const KNOWN_BINARIES: &[&str] = &[
    "ls", "cat", "pwd", "echo", "grep", "rg", "find", "git", "cargo", "make",
    "python", "python3", "node", "npm", "go", "rustc", "mkdir", "cp", "mv",
    "touch", "head", "tail", "wc", "sed", "awk", "curl", "which", "diff",
    "tar", "chmod",
];

/// A reply that IS a shell command (not prose about one): short, first
/// token is a known binary, and it doesn't read like a sentence.
fn detect_shell_command(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.lines().count() > 2 {
        return None;
    }
    let line = trimmed.lines().next().unwrap().trim();
    let line = line.strip_prefix("$ ").unwrap_or(line);

    if line.ends_with('.') || line.ends_with('?') || line.ends_with(':') {
        return None;
    }
    let first = line.split_whitespace().next()?;
    if KNOWN_BINARIES.contains(&first) {
        Some(line.to_string())
    } else {
        None
    }
}

// ═══════════════════════════════════════════════════════════════
// REGEXES (compiled once)
// ═══════════════════════════════════════════════════════════════

fn marker_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?s)\[tool_calls\](.*?)(?:\[/tool_calls\]|\z)").unwrap()
    })
}

fn kv_block_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?s)\[TOOL_CALL\](.*?)\[/TOOL_CALL\]").unwrap()
    })
}

fn kv_flag_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r#"--([A-Za-z0-9_]+)\s+"((?:[^"\\]|\\.)*)""#).unwrap()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_form_tool_args() {
        let out = parse_reply(r#"I'll list it. {"tool": "list_dir", "args": {"path": "/tmp"}}"#);
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].name, "list_dir");
        assert_eq!(out.calls[0].args, json!({"path": "/tmp"}));
    }

    #[test]
    fn test_form_name_arguments() {
        let out = parse_reply(r#"{"name": "exec", "arguments": {"command": "cargo test"}}"#);
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].name, "exec");
        assert_eq!(out.calls[0].args["command"], "cargo test");
    }

    #[test]
    fn test_form_name_with_string_arguments() {
        let out =
            parse_reply(r#"{"name": "exec", "arguments": "{\"command\": \"ls\"}"}"#);
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].args["command"], "ls");
    }

    #[test]
    fn test_form_tool_calls_array() {
        let reply = r#"{"tool_calls": [
            {"tool": "read_file", "args": {"path": "a.rs"}},
            {"name": "read_file", "arguments": {"path": "b.rs"}}
        ]}"#;
        let out = parse_reply(reply);
        assert_eq!(out.calls.len(), 2);
        assert_eq!(out.calls[0].args["path"], "a.rs");
        assert_eq!(out.calls[1].args["path"], "b.rs");
    }

    #[test]
    fn test_form_direct_tool_object() {
        let out = parse_reply(r#"{"list_dir": {"path": "/tmp"}}"#);
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].name, "list_dir");
        assert_eq!(out.calls[0].args["path"], "/tmp");
    }

    #[test]
    fn test_form_marker_bare_args_is_exec() {
        let out = parse_reply(
            "[tool_calls]\n{\"command\": \"make build\"}\n[/tool_calls]",
        );
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].name, "exec");
        assert_eq!(out.calls[0].args["command"], "make build");
    }

    #[test]
    fn test_form_kv_syntax() {
        let reply = r#"
[TOOL_CALL]
exec => --command "ls -la" --timeout_seconds "30"
[/TOOL_CALL]
"#;
        let out = parse_reply(reply);
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].name, "exec");
        assert_eq!(out.calls[0].args["command"], "ls -la");
        // Coerced to a number, same as the JSON forms
        assert_eq!(out.calls[0].args["timeout_seconds"], 30);
    }

    #[test]
    fn test_form_shell_command() {
        let out = parse_reply("ls -la ./cmd");
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].name, "exec");
        assert_eq!(out.calls[0].args["command"], "ls -la ./cmd");
    }

    #[test]
    fn test_shell_heuristic_skips_prose() {
        let out = parse_reply(
            "The task is complete. I used git to inspect history and everything checks out.",
        );
        assert!(out.calls.is_empty());
    }

    #[test]
    fn test_format_equivalence_modulo_id() {
        let a = parse_reply(r#"{"tool": "grep", "args": {"pattern": "fn main", "path": "src"}}"#);
        let b = parse_reply(r#"{"name": "grep", "arguments": {"pattern": "fn main", "path": "src"}}"#);
        let c = parse_reply(r#"{"grep": {"pattern": "fn main", "path": "src"}}"#);
        let d = parse_reply("[TOOL_CALL]grep => --pattern \"fn main\" --path \"src\"[/TOOL_CALL]");

        for out in [&a, &b, &c, &d] {
            assert_eq!(out.calls.len(), 1);
            assert_eq!(out.calls[0].name, "grep");
            assert_eq!(out.calls[0].args, a.calls[0].args);
        }
    }

    #[test]
    fn test_unknown_tool_dropped_with_diagnostic() {
        let out = parse_reply(r#"{"tool": "rm_everything", "args": {}}"#);
        assert!(out.calls.is_empty());
        assert_eq!(out.diagnostics.len(), 1);
        assert!(out.diagnostics[0].contains("rm_everything"));
    }

    #[test]
    fn test_fenced_json_with_prose() {
        let reply = r#"
Let me check the directory first.

```json
{"tool": "list_dir", "args": {"path": "src"}}
```

Then I'll read what matters.
"#;
        let out = parse_reply(reply);
        assert_eq!(out.calls.len(), 1);
        assert_eq!(out.calls[0].name, "list_dir");
    }

    #[test]
    fn test_multiple_calls_get_sequential_ids() {
        let reply = r#"
{"tool": "read_file", "args": {"path": "a.rs"}}
{"tool": "read_file", "args": {"path": "b.rs"}}
"#;
        let out = parse_reply(reply);
        assert_eq!(out.calls.len(), 2);
        assert_eq!(out.calls[0].id, "call-1");
        assert_eq!(out.calls[1].id, "call-2");
    }

    #[test]
    fn test_malformed_json_yields_nothing() {
        let out = parse_reply(r#"{"tool": "exec", "args": {"command": "ls"#);
        assert!(out.calls.is_empty());
    }

    #[test]
    fn test_parser_is_idempotent() {
        let reply = r#"{"tool": "exec", "args": {"command": "false"}}"#;
        let a = parse_reply(reply);
        let b = parse_reply(reply);
        assert_eq!(a.calls, b.calls);
    }

    #[test]
    fn test_prose_with_braces_does_not_panic() {
        let out = parse_reply("In Rust, a block looks like { let x = 1; } and that's fine.");
        assert!(out.calls.is_empty());
    }

    #[test]
    fn test_bare_array_of_calls() {
        let reply = r#"[
            {"tool": "read_file", "args": {"path": "a.rs"}},
            {"tool": "grep", "args": {"pattern": "x", "path": "."}}
        ]"#;
        let out = parse_reply(reply);
        assert_eq!(out.calls.len(), 2);
    }

    #[test]
    fn test_explicit_id_preserved() {
        let out = parse_reply(r#"{"tool": "exec", "id": "abc-1", "args": {"command": "ls"}}"#);
        assert_eq!(out.calls[0].id, "abc-1");
    }
}
