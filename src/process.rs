//! Background process manager
//!
//! Long-lived children started by exec_background. Each process tees its
//! stdout and stderr into a bounded ring buffer (1 MiB; oldest half dropped
//! on overflow) that wait_for_output polls. Finished processes linger for a
//! grace period so trailing reads can still drain buffered output.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::Notify;

/// Cap on each process's combined output buffer.
pub const OUTPUT_BUFFER_CAP: usize = 1024 * 1024;

/// Grace given to a child between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Cadence for wait_for_output buffer scans.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

// ═══════════════════════════════════════════════════════════════
// RING BUFFER
// ═══════════════════════════════════════════════════════════════

/// Byte buffer bounded at `cap`; overflowing drops the oldest half.
#[derive(Debug)]
pub struct RingBuffer {
    data: Vec<u8>,
    cap: usize,
}

impl RingBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        if self.data.len() > self.cap {
            // Keep the newest half; one big drain beats byte-at-a-time eviction.
            let keep_from = self.data.len() - self.cap / 2;
            self.data.drain(..keep_from);
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

// ═══════════════════════════════════════════════════════════════
// PROCESS HANDLE
// ═══════════════════════════════════════════════════════════════

/// One tracked child. Owned by the manager; tools hold it only transiently.
pub struct BackgroundProcess {
    pub pid: u32,
    pub command: String,
    pub started_at: DateTime<Utc>,
    buffer: Mutex<RingBuffer>,
    done: AtomicBool,
    done_signal: Notify,
    exit_code: Mutex<Option<i32>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
}

impl BackgroundProcess {
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap()
    }

    /// Snapshot the combined output as text.
    pub fn output(&self) -> String {
        self.buffer.lock().unwrap().as_text()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    fn append_output(&self, bytes: &[u8]) {
        self.buffer.lock().unwrap().push(bytes);
    }

    fn mark_done(&self, code: Option<i32>) {
        *self.exit_code.lock().unwrap() = code;
        self.done.store(true, Ordering::SeqCst);
        self.done_signal.notify_waiters();
    }
}

// ═══════════════════════════════════════════════════════════════
// MANAGER
// ═══════════════════════════════════════════════════════════════

/// Process-wide table of background children.
pub struct ProcessManager {
    table: Mutex<HashMap<u32, Arc<BackgroundProcess>>>,
    cleanup_delay: Duration,
}

impl ProcessManager {
    pub fn new(cleanup_delay: Duration) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            cleanup_delay,
        }
    }

    /// Spawn a shell command as a background child. Returns its pid.
    pub fn spawn(self: &Arc<Self>, command: &str, cwd: &PathBuf) -> Result<u32> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn: {}", command))?;

        let pid = child
            .id()
            .ok_or_else(|| anyhow!("child exited before pid was known"))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdin = child.stdin.take();

        let proc = Arc::new(BackgroundProcess {
            pid,
            command: command.to_string(),
            started_at: Utc::now(),
            buffer: Mutex::new(RingBuffer::new(OUTPUT_BUFFER_CAP)),
            done: AtomicBool::new(false),
            done_signal: Notify::new(),
            exit_code: Mutex::new(None),
            stdin: tokio::sync::Mutex::new(stdin),
        });

        self.table.lock().unwrap().insert(pid, proc.clone());

        // Tee both pipes into the shared buffer.
        if let Some(mut out) = stdout {
            let p = proc.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                while let Ok(n) = out.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    p.append_output(&buf[..n]);
                }
            });
        }
        if let Some(mut err) = stderr {
            let p = proc.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                while let Ok(n) = err.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    p.append_output(&buf[..n]);
                }
            });
        }

        // Reap the child, then forget it after the grace period.
        let manager = Arc::clone(self);
        let p = proc.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(_) => None,
            };
            p.mark_done(code);

            tokio::time::sleep(manager.cleanup_delay).await;
            manager.table.lock().unwrap().remove(&p.pid);
        });

        Ok(pid)
    }

    pub fn get(&self, pid: u32) -> Option<Arc<BackgroundProcess>> {
        self.table.lock().unwrap().get(&pid).cloned()
    }

    pub fn pids(&self) -> Vec<u32> {
        self.table.lock().unwrap().keys().copied().collect()
    }

    /// Poll a process's buffer until `pattern` matches or the timeout lapses.
    /// Returns the matched text on success.
    pub async fn wait_for_output(
        &self,
        pid: u32,
        pattern: &str,
        timeout: Duration,
    ) -> Result<String> {
        let proc = self
            .get(pid)
            .ok_or_else(|| anyhow!("no background process with pid {}", pid))?;
        let re = regex::Regex::new(pattern)
            .with_context(|| format!("Invalid pattern: {}", pattern))?;

        let deadline = tokio::time::Instant::now() + timeout;
        let mut final_scan = false;
        loop {
            let text = proc.output();
            if let Some(m) = re.find(&text) {
                return Ok(m.as_str().to_string());
            }
            if proc.is_done() {
                // The pipe readers may still be draining the last bytes;
                // give them one poll interval, then scan once more.
                if final_scan {
                    return Err(anyhow!(
                        "process {} exited (status {:?}) without matching /{}/",
                        pid,
                        proc.exit_code(),
                        pattern
                    ));
                }
                final_scan = true;
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!(
                    "timed out after {:?} waiting for /{}/ from pid {}",
                    timeout,
                    pattern,
                    pid
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Write to a process's stdin. Unknown pids are rejected.
    pub async fn send_input(&self, pid: u32, input: &str) -> Result<()> {
        let proc = self
            .get(pid)
            .ok_or_else(|| anyhow!("no background process with pid {}", pid))?;

        let mut guard = proc.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| anyhow!("stdin for pid {} is closed", pid))?;
        stdin
            .write_all(input.as_bytes())
            .await
            .with_context(|| format!("Failed to write to pid {}", pid))?;
        stdin.flush().await?;
        Ok(())
    }

    /// Graceful signal, then SIGKILL after the grace period.
    pub async fn kill(&self, pid: u32) -> Result<()> {
        let proc = self
            .get(pid)
            .ok_or_else(|| anyhow!("no background process with pid {}", pid))?;
        if proc.is_done() {
            return Ok(());
        }

        signal(pid, "TERM");
        let grace = tokio::time::sleep(KILL_GRACE);
        tokio::pin!(grace);
        tokio::select! {
            _ = proc.done_signal.notified() => {}
            _ = &mut grace => {
                if !proc.is_done() {
                    signal(pid, "KILL");
                }
            }
        }
        Ok(())
    }

    /// Teardown: kill everything still running.
    pub async fn shutdown(&self) {
        let pids = self.pids();
        for pid in pids {
            let _ = self.kill(pid).await;
        }
    }
}

fn signal(pid: u32, sig: &str) {
    let _ = std::process::Command::new("kill")
        .arg(format!("-{}", sig))
        .arg(pid.to_string())
        .status();
}
