//! Tool registry - the immutable catalog of callable tools
//!
//! Built once at startup, read-only afterwards. The agent loop never matches
//! on tool identities; it asks the registry to validate arguments and the
//! executor to run the call.

use serde_json::Value;
use std::sync::OnceLock;

// ═══════════════════════════════════════════════════════════════
// SCHEMA TYPES
// ═══════════════════════════════════════════════════════════════

/// Primitive argument types recognized by tool schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    String,
    Integer,
    Float,
    Boolean,
    Object,
}

impl ArgKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArgKind::String => "string",
            ArgKind::Integer => "integer",
            ArgKind::Float => "number",
            ArgKind::Boolean => "boolean",
            ArgKind::Object => "object",
        }
    }

    /// Whether a JSON value is acceptable for this kind. Integer-valued
    /// floats pass as integers; numeric strings do not.
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ArgKind::String => value.is_string(),
            ArgKind::Integer => value.is_i64() || value.is_u64(),
            ArgKind::Float => value.is_number(),
            ArgKind::Boolean => value.is_boolean(),
            ArgKind::Object => value.is_object(),
        }
    }
}

/// One argument in a tool's schema.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub required: bool,
    pub description: &'static str,
}

/// How a tool interacts with the world. Drives permission classing and
/// the read-only parallel dispatch path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCategory {
    /// Reads files or listings; no side effects
    Read,
    /// Creates or modifies files in the workspace
    Write,
    /// Runs arbitrary commands or touches processes
    Execute,
    /// Talks to the network
    Network,
}

/// A registered tool.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub category: ToolCategory,
    pub args: &'static [ArgSpec],
}

impl ToolSpec {
    pub fn is_read_only(&self) -> bool {
        self.category == ToolCategory::Read
    }

    /// Validate an argument object against this schema. Returns the first
    /// problem found, or Ok.
    pub fn validate(&self, args: &Value) -> Result<(), String> {
        let obj = match args.as_object() {
            Some(o) => o,
            None => return Err(format!("{}: arguments must be a JSON object", self.name)),
        };

        for spec in self.args {
            match obj.get(spec.name) {
                None if spec.required => {
                    return Err(format!("{}: missing required argument '{}'", self.name, spec.name));
                }
                None => {}
                Some(v) if v.is_null() && !spec.required => {}
                Some(v) => {
                    if !spec.kind.accepts(v) {
                        return Err(format!(
                            "{}: argument '{}' must be a {}",
                            self.name,
                            spec.name,
                            spec.kind.as_str()
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
// THE CATALOG
// ═══════════════════════════════════════════════════════════════

macro_rules! arg {
    ($name:expr, $kind:ident, req, $desc:expr) => {
        ArgSpec { name: $name, kind: ArgKind::$kind, required: true, description: $desc }
    };
    ($name:expr, $kind:ident, opt, $desc:expr) => {
        ArgSpec { name: $name, kind: ArgKind::$kind, required: false, description: $desc }
    };
}

static CATALOG: &[ToolSpec] = &[
    ToolSpec {
        name: "exec",
        description: "Run a shell command with a timeout; stdout and stderr merged",
        category: ToolCategory::Execute,
        args: &[
            arg!("command", String, req, "shell command line"),
            arg!("cwd", String, opt, "working directory, defaults to workspace root"),
            arg!("timeout_seconds", Integer, opt, "override the default timeout"),
        ],
    },
    ToolSpec {
        name: "read_file",
        description: "Read a file; optional byte offset and limit",
        category: ToolCategory::Read,
        args: &[
            arg!("path", String, req, "file path"),
            arg!("offset", Integer, opt, "byte offset to start from"),
            arg!("limit", Integer, opt, "max bytes to return"),
        ],
    },
    ToolSpec {
        name: "write_file",
        description: "Create or overwrite a file, creating parent directories",
        category: ToolCategory::Write,
        args: &[
            arg!("path", String, req, "file path"),
            arg!("content", String, req, "full file content"),
        ],
    },
    ToolSpec {
        name: "edit_file",
        description: "Replace one exact occurrence of old_text with new_text",
        category: ToolCategory::Write,
        args: &[
            arg!("path", String, req, "file path"),
            arg!("old_text", String, req, "exact text to replace; must occur once"),
            arg!("new_text", String, req, "replacement text"),
        ],
    },
    ToolSpec {
        name: "append_file",
        description: "Append content to an existing file",
        category: ToolCategory::Write,
        args: &[
            arg!("path", String, req, "file path"),
            arg!("content", String, req, "content to append"),
        ],
    },
    ToolSpec {
        name: "patch_file",
        description: "Apply a unified-diff patch to a file",
        category: ToolCategory::Write,
        args: &[
            arg!("path", String, req, "file path"),
            arg!("patch", String, req, "unified diff"),
        ],
    },
    ToolSpec {
        name: "list_dir",
        description: "List a directory as sorted '<type> <name>' lines",
        category: ToolCategory::Read,
        args: &[arg!("path", String, req, "directory path")],
    },
    ToolSpec {
        name: "search_files",
        description: "Find files matching a glob pattern",
        category: ToolCategory::Read,
        args: &[
            arg!("pattern", String, req, "glob pattern, e.g. **/*.rs"),
            arg!("path", String, req, "directory to search under"),
        ],
    },
    ToolSpec {
        name: "grep",
        description: "Regex search inside files",
        category: ToolCategory::Read,
        args: &[
            arg!("pattern", String, req, "regular expression"),
            arg!("path", String, req, "file or directory to search"),
        ],
    },
    ToolSpec {
        name: "exec_background",
        description: "Start a long-lived process; returns its pid",
        category: ToolCategory::Execute,
        args: &[
            arg!("command", String, req, "shell command line"),
            arg!("cwd", String, opt, "working directory"),
        ],
    },
    ToolSpec {
        name: "wait_for_output",
        description: "Wait until a background process's output matches a regex",
        category: ToolCategory::Execute,
        args: &[
            arg!("pid", Integer, req, "pid returned by exec_background"),
            arg!("pattern", String, req, "regex to wait for"),
            arg!("timeout_seconds", Integer, req, "how long to wait"),
        ],
    },
    ToolSpec {
        name: "send_input",
        description: "Write to a background process's stdin",
        category: ToolCategory::Execute,
        args: &[
            arg!("pid", Integer, req, "pid returned by exec_background"),
            arg!("input", String, req, "bytes to write"),
        ],
    },
    ToolSpec {
        name: "http_request",
        description: "Make an HTTP(S) request; body capped at 1 MiB",
        category: ToolCategory::Network,
        args: &[
            arg!("method", String, req, "GET, POST, PUT, DELETE, ..."),
            arg!("url", String, req, "request URL"),
            arg!("body", String, opt, "request body"),
            arg!("headers", Object, opt, "header name -> value map"),
        ],
    },
];

// ═══════════════════════════════════════════════════════════════
// ACCESS
// ═══════════════════════════════════════════════════════════════

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Process-wide immutable tool catalog.
pub struct Registry {
    tools: &'static [ToolSpec],
}

impl Registry {
    /// The singleton. First call initializes it.
    pub fn global() -> &'static Registry {
        REGISTRY.get_or_init(|| Registry { tools: CATALOG })
    }

    /// The full catalog.
    pub fn list(&self) -> &'static [ToolSpec] {
        self.tools
    }

    /// A tool's argument shape, if registered.
    pub fn schema(&self, name: &str) -> Option<&'static ToolSpec> {
        self.tools.iter().find(|t| t.name == name)
    }

    pub fn is_known(&self, name: &str) -> bool {
        self.schema(name).is_some()
    }

    pub fn is_read_only(&self, name: &str) -> bool {
        self.schema(name).map(|t| t.is_read_only()).unwrap_or(false)
    }

    /// Render the catalog for the system prompt: one line per tool with
    /// its required and optional arguments.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for tool in self.tools {
            let mut args: Vec<String> = Vec::new();
            for a in tool.args {
                if a.required {
                    args.push(a.name.to_string());
                } else {
                    args.push(format!("{}?", a.name));
                }
            }
            out.push_str(&format!(
                "- {}({}): {}\n",
                tool.name,
                args.join(", "),
                tool.description
            ));
        }
        out
    }
}
