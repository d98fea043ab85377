//! Configuration management with XDG paths
//!
//! ~/.config/ergon/config.json - API key, preferences (0600)
//! ~/.local/state/ergon/       - Session logs
//!
//! Environment variables override the file; CLI flags override both.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use crate::permissions::PermissionMode;

const APP_NAME: &str = "ergon";

/// Fallback model when neither config nor environment names one.
pub const DEFAULT_MODEL: &str = "meta-llama/llama-3.3-70b-instruct";

/// Default chat completions endpoint.
pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

// ═══════════════════════════════════════════════════════════════
// RUNTIME OPTIONS
// ═══════════════════════════════════════════════════════════════

/// Tunables for the execution core. One record, recognized everywhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    /// Timeout for exec / search / grep / http_request
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Timeout for VM-class exec commands (qemu, docker run, vagrant up, virsh)
    #[serde(default = "vm_timeout_secs")]
    pub vm_timeout_secs: u64,

    /// Cap on http_request response bodies (bytes)
    #[serde(default = "max_http_body")]
    pub max_http_body: usize,

    /// Concatenated-message size above which old context is summarized (chars)
    #[serde(default = "context_summarize_threshold")]
    pub context_summarize_threshold: usize,

    /// Stall detections before the loop terminates
    #[serde(default = "max_stall_count")]
    pub max_stall_count: usize,

    /// File read-cache TTL (seconds); directory listings use a fifth of it
    #[serde(default = "cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Grace period before a finished background process is forgotten (seconds)
    #[serde(default = "process_cleanup_delay_secs")]
    pub process_cleanup_delay_secs: u64,

    /// Check the convergence window every N iterations
    #[serde(default = "convergence_check_interval")]
    pub convergence_check_interval: usize,

    /// Concurrent panes in the orchestrator
    #[serde(default = "max_parallel_panes")]
    pub max_parallel_panes: usize,
}

fn default_timeout_secs() -> u64 { 30 }
fn vm_timeout_secs() -> u64 { 300 }
fn max_http_body() -> usize { 1024 * 1024 }
fn context_summarize_threshold() -> usize { 20_000 }
fn max_stall_count() -> usize { 2 }
fn cache_ttl_secs() -> u64 { 300 }
fn process_cleanup_delay_secs() -> u64 { 300 }
fn convergence_check_interval() -> usize { 1 }
fn max_parallel_panes() -> usize { 5 }

impl Default for Options {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            vm_timeout_secs: vm_timeout_secs(),
            max_http_body: max_http_body(),
            context_summarize_threshold: context_summarize_threshold(),
            max_stall_count: max_stall_count(),
            cache_ttl_secs: cache_ttl_secs(),
            process_cleanup_delay_secs: process_cleanup_delay_secs(),
            convergence_check_interval: convergence_check_interval(),
            max_parallel_panes: max_parallel_panes(),
        }
    }
}

impl Options {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn vm_timeout(&self) -> Duration {
        Duration::from_secs(self.vm_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn dir_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs / 5)
    }

    pub fn process_cleanup_delay(&self) -> Duration {
        Duration::from_secs(self.process_cleanup_delay_secs)
    }
}

// ═══════════════════════════════════════════════════════════════
// XDG PATHS
// ═══════════════════════════════════════════════════════════════

/// Get config directory (~/.config/ergon/)
pub fn config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .context("Could not determine config directory")?;
    Ok(base.join(APP_NAME))
}

/// Get state directory (~/.local/state/ergon/)
pub fn state_dir() -> Result<PathBuf> {
    let base = dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local/state")))
        .context("Could not determine state directory")?;
    Ok(base.join(APP_NAME))
}

/// Get config file path
pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Ensure all directories exist
pub fn ensure_dirs() -> Result<()> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(state_dir()?)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
// CONFIG
// ═══════════════════════════════════════════════════════════════

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Chat API key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Chat completions endpoint override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Default model to use
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// Max output tokens per model turn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Desired permission mode
    #[serde(default)]
    pub permissions: PermissionMode,

    /// Execution core tunables
    #[serde(default)]
    pub options: Options,
}

impl Config {
    /// Load config from disk with environment overrides applied.
    pub fn load() -> Result<Self> {
        ensure_dirs()?;
        let path = config_path()?;

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Overlay ERGON_* environment variables.
    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("ERGON_API_KEY") {
            if !key.is_empty() {
                self.api_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("ERGON_BASE_URL") {
            if !url.is_empty() {
                self.base_url = Some(url);
            }
        }
        if let Ok(model) = std::env::var("ERGON_MODEL") {
            if !model.is_empty() {
                self.default_model = Some(model);
            }
        }
        if let Ok(tokens) = std::env::var("ERGON_MAX_TOKENS") {
            if let Ok(n) = tokens.parse() {
                self.max_tokens = Some(n);
            }
        }
        if let Ok(mode) = std::env::var("ERGON_PERMISSIONS") {
            if let Some(m) = PermissionMode::parse(&mode) {
                self.permissions = m;
            }
        }
    }

    /// Save config to disk with secure permissions (atomic write)
    pub fn save(&self) -> Result<()> {
        ensure_dirs()?;
        let path = config_path()?;
        let tmp_path = path.with_extension("json.tmp");

        let content = serde_json::to_string_pretty(self)?;

        // Create temp file with secure permissions from the start
        {
            #[cfg(unix)]
            use std::os::unix::fs::OpenOptionsExt;
            let mut opts = std::fs::OpenOptions::new();
            opts.write(true).create(true).truncate(true);
            #[cfg(unix)]
            opts.mode(0o600); // Secure from creation - no race window
            let mut file = opts
                .open(&tmp_path)
                .with_context(|| "Failed to create temp file".to_string())?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?; // Ensure data is on disk before rename
        }

        // Atomic rename (POSIX guarantees)
        fs::rename(&tmp_path, &path)
            .with_context(|| "Failed to rename config".to_string())?;

        Ok(())
    }

    pub fn model(&self) -> String {
        self.default_model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    pub fn endpoint(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
    }
}

/// Get API key from environment or config.
pub fn get_api_key() -> Result<String> {
    // Environment variable takes precedence
    if let Ok(key) = std::env::var("ERGON_API_KEY") {
        if !key.is_empty() {
            return Ok(key);
        }
    }

    let cfg = Config::load()?;
    cfg.api_key
        .context("No API key configured. Set ERGON_API_KEY or run: ergon config set key <your-key>")
}

/// Workspace root: flag > ERGON_WORKDIR > current directory.
pub fn resolve_workdir(flag: Option<PathBuf>) -> Result<PathBuf> {
    let dir = match flag {
        Some(d) => d,
        None => match std::env::var("ERGON_WORKDIR") {
            Ok(d) if !d.is_empty() => PathBuf::from(d),
            _ => std::env::current_dir()?,
        },
    };
    dir.canonicalize()
        .with_context(|| format!("Workspace does not exist: {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_defaults() {
        let opts = Options::default();
        assert_eq!(opts.default_timeout_secs, 30);
        assert_eq!(opts.vm_timeout_secs, 300);
        assert_eq!(opts.max_http_body, 1024 * 1024);
        assert_eq!(opts.max_parallel_panes, 5);
        assert_eq!(opts.max_stall_count, 2);
    }

    #[test]
    fn test_dir_ttl_is_fraction_of_file_ttl() {
        let opts = Options::default();
        assert_eq!(opts.dir_cache_ttl(), Duration::from_secs(60));
        assert_eq!(opts.cache_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let cfg = Config {
            api_key: Some("test-key".to_string()),
            default_model: Some("test/model".to_string()),
            max_tokens: Some(2048),
            ..Default::default()
        };

        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.api_key.as_deref(), Some("test-key"));
        assert_eq!(back.max_tokens, Some(2048));
    }

    #[test]
    fn test_config_parses_partial_json() {
        let cfg: Config = serde_json::from_str(r#"{"api_key":"k"}"#).unwrap();
        assert_eq!(cfg.options.default_timeout_secs, 30);
        assert_eq!(cfg.model(), DEFAULT_MODEL);
    }

    #[test]
    fn test_endpoint_default() {
        let cfg = Config::default();
        assert!(cfg.endpoint().starts_with("https://"));
    }
}
