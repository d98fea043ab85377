//! ergon - terminal agent execution core
//!
//! USAGE:
//!   ergon agent "task..."         # headless agent run
//!   ergon agent --mode orchestrate "task..."
//!   ergon doctor                  # check config, key, network
//!   ergon sessions --list         # list saved sessions
//!   ergon config set key <value>  # non-interactive config

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ergon::agent::{AgentLoop, LoopConfig, TerminalReason};
use ergon::cache::FsCache;
use ergon::cancel::CancelToken;
use ergon::client::{ChatOptions, ChatTransport, HttpTransport, MockTransport, ModelClient};
use ergon::config::{self, Config};
use ergon::events::{self, EventKind, ProgressEvent};
use ergon::executor::Executor;
use ergon::orchestrator::{Orchestrator, OrchestratorConfig, PaneState};
use ergon::permissions::{Gate, PermissionMode};
use ergon::process::ProcessManager;
use ergon::prompt::Mode;
use ergon::session::Session;

/// Exit codes: 0 success, 2 bad arguments, 3 model/auth error, 4 cancelled,
/// 5 stalled, 1 other.
mod exit_code {
    pub const OK: i32 = 0;
    pub const OTHER: i32 = 1;
    pub const BAD_ARGS: i32 = 2;
    pub const MODEL: i32 = 3;
    pub const CANCELED: i32 = 4;
    pub const STALLED: i32 = 5;
}

// ═══════════════════════════════════════════════════════════════
// CLI
// ═══════════════════════════════════════════════════════════════

#[derive(Debug)]
enum Command {
    Agent(AgentArgs),
    Doctor,
    Sessions { clean: bool },
    ConfigSet { key: String, value: String },
}

#[derive(Debug, Default)]
struct AgentArgs {
    task: String,
    max_loops: Option<usize>,
    mode: Mode,
    workdir: Option<PathBuf>,
    permissions: Option<PermissionMode>,
    mock: bool,
    max_parallel: Option<usize>,
    parallel_reads: bool,
}

enum ParseError {
    Bad(String),
    HelpWanted,
}

fn parse_args(args: &[String]) -> Result<Command, ParseError> {
    if args.is_empty() || args.iter().any(|a| a == "--help" || a == "-h") {
        return Err(ParseError::HelpWanted);
    }

    match args[0].as_str() {
        "doctor" => Ok(Command::Doctor),
        "sessions" => Ok(Command::Sessions {
            clean: args.iter().any(|a| a == "--clean"),
        }),
        "config" => {
            if args.get(1).map(|s| s.as_str()) != Some("set") {
                return Err(ParseError::Bad("usage: ergon config set <key> <value>".into()));
            }
            let key = args.get(2).cloned();
            let value = args.get(3).cloned();
            match (key, value) {
                (Some(key), Some(value)) => Ok(Command::ConfigSet { key, value }),
                _ => Err(ParseError::Bad("usage: ergon config set <key> <value>".into())),
            }
        }
        "agent" => parse_agent_args(&args[1..]).map(Command::Agent),
        other => Err(ParseError::Bad(format!("unknown command: {}", other))),
    }
}

fn parse_agent_args(args: &[String]) -> Result<AgentArgs, ParseError> {
    let mut parsed = AgentArgs::default();
    let mut task_parts: Vec<String> = Vec::new();
    let mut i = 0;

    while i < args.len() {
        match args[i].as_str() {
            "--max-loops" => {
                i += 1;
                let value = args.get(i).ok_or_else(|| ParseError::Bad("--max-loops needs a number".into()))?;
                parsed.max_loops = Some(
                    value
                        .parse()
                        .map_err(|_| ParseError::Bad(format!("bad --max-loops: {}", value)))?,
                );
            }
            "--mode" => {
                i += 1;
                let value = args.get(i).ok_or_else(|| ParseError::Bad("--mode needs a value".into()))?;
                parsed.mode = Mode::parse(value)
                    .ok_or_else(|| ParseError::Bad(format!("bad --mode: {}", value)))?;
            }
            "--workdir" => {
                i += 1;
                let value = args.get(i).ok_or_else(|| ParseError::Bad("--workdir needs a path".into()))?;
                parsed.workdir = Some(PathBuf::from(value));
            }
            "--permissions" => {
                i += 1;
                let value = args
                    .get(i)
                    .ok_or_else(|| ParseError::Bad("--permissions needs a mode".into()))?;
                parsed.permissions = Some(
                    PermissionMode::parse(value)
                        .ok_or_else(|| ParseError::Bad(format!("bad --permissions: {}", value)))?,
                );
            }
            "--max-parallel" => {
                i += 1;
                let value = args.get(i).ok_or_else(|| ParseError::Bad("--max-parallel needs a number".into()))?;
                parsed.max_parallel = Some(
                    value
                        .parse()
                        .map_err(|_| ParseError::Bad(format!("bad --max-parallel: {}", value)))?,
                );
            }
            "--mock" => parsed.mock = true,
            "--parallel-reads" => parsed.parallel_reads = true,
            flag if flag.starts_with("--") => {
                return Err(ParseError::Bad(format!("unknown flag: {}", flag)));
            }
            word => task_parts.push(word.to_string()),
        }
        i += 1;
    }

    if task_parts.is_empty() {
        return Err(ParseError::Bad("agent needs a task".into()));
    }
    parsed.task = task_parts.join(" ");
    Ok(parsed)
}

fn print_help() {
    println!(
        r#"ergon - terminal agent execution core

USAGE:
    ergon agent [FLAGS] "task..."   # headless agent run
    ergon doctor                    # check config, key, network
    ergon sessions [--clean]        # list or clean saved sessions
    ergon config set <key> <value>  # set config (key, model, base-url)

AGENT FLAGS:
    --max-loops <n>       Iteration budget (default: from task complexity)
    --mode <m>            plan|code|do|orchestrate|ask|debug (default: do)
    --workdir <path>      Workspace root (default: current directory)
    --permissions <p>     full-access|dangerously-full-access
    --max-parallel <n>    Concurrent panes in orchestrate mode (default 5, max 50)
    --parallel-reads      Dispatch read-only tool batches in parallel
    --mock                Run against the scripted mock model (no network)

CONFIG:
    ~/.config/ergon/config.json       API key, model, preferences
    ~/.local/state/ergon/sessions/    Session history

ENVIRONMENT:
    ERGON_API_KEY        API key (overrides config)
    ERGON_BASE_URL       Chat endpoint override
    ERGON_MODEL          Model override
    ERGON_MAX_TOKENS     Max output tokens per turn
    ERGON_PERMISSIONS    Permission mode override
    ERGON_WORKDIR        Workspace override
    ERGON_SUDO_PASSWORD  Elevation passthrough

EXIT CODES:
    0 success  2 bad arguments  3 model/auth error  4 cancelled  5 stalled  1 other
"#
    );
}

// ═══════════════════════════════════════════════════════════════
// MAIN
// ═══════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let command = match parse_args(&args) {
        Ok(c) => c,
        Err(ParseError::HelpWanted) => {
            print_help();
            std::process::exit(exit_code::OK);
        }
        Err(ParseError::Bad(msg)) => {
            eprintln!("ergon: {}", msg);
            eprintln!("try: ergon --help");
            std::process::exit(exit_code::BAD_ARGS);
        }
    };

    let code = match command {
        Command::Doctor => match run_doctor().await {
            Ok(()) => exit_code::OK,
            Err(e) => {
                eprintln!("ergon: {:#}", e);
                exit_code::OTHER
            }
        },
        Command::Sessions { clean } => match run_sessions(clean) {
            Ok(()) => exit_code::OK,
            Err(e) => {
                eprintln!("ergon: {:#}", e);
                exit_code::OTHER
            }
        },
        Command::ConfigSet { key, value } => match run_config_set(&key, &value) {
            Ok(()) => exit_code::OK,
            Err(e) => {
                eprintln!("ergon: {:#}", e);
                exit_code::BAD_ARGS
            }
        },
        Command::Agent(agent_args) => match run_agent(agent_args).await {
            Ok(code) => code,
            Err(e) => {
                eprintln!("ergon: {:#}", e);
                let msg = format!("{:#}", e).to_lowercase();
                if msg.contains("api key") || msg.contains("provider") || msg.contains("auth") {
                    exit_code::MODEL
                } else {
                    exit_code::OTHER
                }
            }
        },
    };
    std::process::exit(code);
}

// ═══════════════════════════════════════════════════════════════
// COMMANDS
// ═══════════════════════════════════════════════════════════════

async fn run_doctor() -> Result<()> {
    println!("ergon doctor\n");

    let cfg = Config::load()?;
    println!(
        "[{}] Config: {}",
        if cfg.api_key.is_some() { "ok" } else { "--" },
        config::config_path()?.display()
    );

    let has_key = cfg.api_key.is_some();
    println!(
        "[{}] API key: {}",
        if has_key { "ok" } else { "--" },
        if has_key { "configured" } else { "missing (set ERGON_API_KEY)" }
    );
    println!("[ok] Model: {}", cfg.model());
    println!("[ok] Endpoint: {}", cfg.endpoint());

    let workdir = std::env::current_dir()?;
    println!("[ok] Workspace: {}", workdir.display());

    print!("[..] Network: checking...");
    let client = reqwest::Client::new();
    match client
        .get(cfg.endpoint())
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        Ok(_) => println!("\r[ok] Network: reachable         "),
        Err(e) => println!("\r[--] Network: {}", e),
    }

    let sessions = ergon::session::list_sessions()?;
    println!("[ok] Sessions: {} saved", sessions.len());

    Ok(())
}

fn run_sessions(clean: bool) -> Result<()> {
    if clean {
        let removed = ergon::session::cleanup_sessions(10)?;
        println!("Cleaned up {} old sessions", removed);
        return Ok(());
    }

    let sessions = ergon::session::list_sessions()?;
    if sessions.is_empty() {
        println!("No sessions found");
        return Ok(());
    }

    println!("Sessions ({}):\n", sessions.len());
    for s in sessions.iter().take(10) {
        let age = chrono::Utc::now() - s.updated_at;
        let age_str = if age.num_hours() < 1 {
            format!("{}m ago", age.num_minutes())
        } else if age.num_days() < 1 {
            format!("{}h ago", age.num_hours())
        } else {
            format!("{}d ago", age.num_days())
        };
        println!(
            "  {} | {} | {} msgs | {}",
            s.id,
            truncate(&s.task, 40),
            s.message_count,
            age_str
        );
    }
    if sessions.len() > 10 {
        println!("  ... and {} more", sessions.len() - 10);
    }
    Ok(())
}

fn run_config_set(key: &str, value: &str) -> Result<()> {
    let mut cfg = Config::load()?;
    match key {
        "key" | "api_key" => {
            cfg.api_key = Some(value.to_string());
            cfg.save()?;
            println!("API key saved to {}", config::config_path()?.display());
        }
        "model" => {
            cfg.default_model = Some(value.to_string());
            cfg.save()?;
            println!("Default model set to: {}", value);
        }
        "base-url" | "base_url" => {
            cfg.base_url = Some(value.to_string());
            cfg.save()?;
            println!("Base URL set to: {}", value);
        }
        _ => anyhow::bail!("Unknown config key: {}. Valid keys: key, model, base-url", key),
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════
// AGENT RUN
// ═══════════════════════════════════════════════════════════════

async fn run_agent(args: AgentArgs) -> Result<i32> {
    let mut cfg = Config::load()?;
    if let Some(mode) = args.permissions {
        cfg.permissions = mode;
        ergon::permissions::reset_elevation_cache();
    }

    let workdir = config::resolve_workdir(args.workdir.clone())?;

    // Transport: real HTTP unless --mock.
    let transport: Box<dyn ChatTransport> = if args.mock {
        Box::new(mock_script())
    } else {
        let api_key = config::get_api_key()?;
        Box::new(HttpTransport::new(cfg.endpoint(), api_key))
    };
    let client = Arc::new(ModelClient::new(
        transport,
        ChatOptions {
            model: cfg.model(),
            temperature: Some(0.7),
            max_tokens: cfg.max_tokens.or(Some(4096)),
        },
    ));

    // Process-wide capabilities.
    let cache = Arc::new(FsCache::new(
        cfg.options.cache_ttl(),
        cfg.options.dir_cache_ttl(),
    ));
    let processes = Arc::new(ProcessManager::new(cfg.options.process_cleanup_delay()));

    // Cancellation: first SIGINT cancels gracefully, second one is fatal.
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        let mut armed = true;
        ctrlc::set_handler(move || {
            if armed {
                armed = false;
                eprintln!("\nergon: cancelling (Ctrl-C again to force quit)");
                cancel.cancel();
            } else {
                std::process::exit(exit_code::CANCELED);
            }
        })
        .context("Failed to install signal handler")?;
    }

    // Progress printer.
    let (events, mut rx) = events::channel(1024);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    println!("Task: {}", args.task);
    println!("Model: {}{}", client.model(), if args.mock { " (mock)" } else { "" });
    println!("Workspace: {}", workdir.display());
    println!("Mode: {}\n", args.mode.as_str());

    let code = if args.mode == Mode::Orchestrate {
        let orchestrator = Orchestrator::new(
            client,
            workdir.clone(),
            cache.clone(),
            processes.clone(),
            cfg.options.clone(),
            OrchestratorConfig {
                max_parallel: args.max_parallel.unwrap_or(cfg.options.max_parallel_panes),
                model_decomposition: !args.mock,
                ..Default::default()
            },
            cfg.permissions,
            events,
        );
        let result = orchestrator.run(&args.task, &cancel).await?;

        println!("\n── Panes ──");
        for pane in &result.panes {
            println!("  {} [{:?}] {}", pane.id, pane.state, truncate(&pane.shard, 60));
        }
        println!("\n{}", result.output);

        if cancel.is_canceled() {
            exit_code::CANCELED
        } else if result.panes.iter().all(|p| p.state == PaneState::Completed) {
            exit_code::OK
        } else {
            exit_code::OTHER
        }
    } else {
        let session = Session::create(client.model(), &args.task, &workdir.display().to_string()).ok();
        let gate = Gate::new(cfg.permissions, workdir.clone());
        let allow_outside = gate.allows_outside_workspace();
        let executor = Arc::new(Executor::new(
            workdir,
            cache.clone(),
            processes.clone(),
            cfg.options.clone(),
            allow_outside,
        ));
        let agent = AgentLoop::new(
            client,
            executor,
            gate,
            cfg.options.clone(),
            LoopConfig {
                mode: args.mode,
                max_iterations: args.max_loops,
                parallel_reads: args.parallel_reads,
                skip_planning: args.mock,
                on_permission: Some(Arc::new(ask_permission)),
            },
            events,
            session,
        );

        let state = agent.run(&args.task, &cancel).await;

        println!("\n{}", state.final_output);
        let reason = state.terminal_reason();
        println!(
            "\n[{} after {} iterations, {} tool calls]",
            reason.as_str(),
            state.iteration,
            state.tool_log.len()
        );
        if let Some(err) = &state.last_error {
            eprintln!("ergon: {}", err);
        }

        match reason {
            TerminalReason::Done => exit_code::OK,
            TerminalReason::Canceled => exit_code::CANCELED,
            TerminalReason::Stall => exit_code::STALLED,
            TerminalReason::Error => {
                let auth = state
                    .last_error
                    .as_deref()
                    .map(|e| e.contains("provider") || e.contains("401") || e.contains("403"))
                    .unwrap_or(false);
                if auth {
                    exit_code::MODEL
                } else {
                    exit_code::OTHER
                }
            }
            TerminalReason::MaxIterations => exit_code::OTHER,
        }
    };

    // Teardown: kill lingering children, drop caches, stop the printer.
    processes.shutdown().await;
    cache.clear();
    printer.abort();

    Ok(code)
}

/// Stdin confirmation for elevated calls; the loop suspends while we ask.
fn ask_permission(_call: &ergon::parser::ToolCall, description: &str) -> bool {
    eprint!("ergon: allow elevated operation? {} [y/N] ", description);
    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return false;
    }
    matches!(line.trim(), "y" | "Y" | "yes")
}

/// Scripted replies for --mock: enough identical completions for any pane
/// count, so a mock run terminates in one iteration everywhere.
fn mock_script() -> MockTransport {
    let replies: Vec<&str> = std::iter::repeat("Task complete. (mock run, no model calls made)")
        .take(64)
        .collect();
    MockTransport::with_replies(&replies)
}

fn print_event(event: &ProgressEvent) {
    match event.kind {
        EventKind::Reasoning => {
            // Streamed model text, kept terse in headless output.
            for line in event.text.lines().take(6) {
                println!("  . {}", line);
            }
        }
        EventKind::ToolStart => {
            println!(
                "  -> {} {}",
                event.tool.as_deref().unwrap_or("?"),
                truncate(&event.text, 100)
            );
        }
        EventKind::ToolFinish => {
            let ok = matches!(event.status, Some(ergon::events::ToolStatus::Completed));
            println!(
                "  {} {} {}",
                if ok { "ok" } else { "!!" },
                event.tool.as_deref().unwrap_or("?"),
                truncate(&event.text, 100)
            );
        }
        EventKind::FileChange => {
            println!("  ~ {}", event.text);
        }
        EventKind::RunState => {
            println!("[{}]", event.text);
        }
        EventKind::System => {
            println!("  # {}", event.text);
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
