//! Child-process execution with timeout, output, and working-directory
//! bounds.
//!
//! Approved simple commands are spawned argv-style with no shell; approved
//! compound commands go through `sh -c` so operators and substitutions take
//! effect. Termination is two-stage: SIGTERM, then SIGKILL after a 5s
//! grace. Failures come back as structured results, never as errors.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;
pub const MIN_MAX_OUTPUT_BYTES: usize = 1024;
const KILL_GRACE: Duration = Duration::from_secs(5);
const TIMEOUT_WARN_THRESHOLD: Duration = Duration::from_secs(600);

/// How to spawn the approved command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnMode {
    /// Simple command: program + argv, no shell involved.
    Direct(Vec<String>),
    /// Policy-approved compound command: handed to `sh -c`.
    Shell(String),
}

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub mode: SpawnMode,
    /// Original command text, echoed into the result.
    pub command_text: String,
    pub cwd: PathBuf,
    pub timeout: Duration,
    /// Overlay on the parent environment.
    pub env: HashMap<String, String>,
    /// Per-stream accumulation cap.
    pub max_output_bytes: usize,
}

impl ExecRequest {
    pub fn new(mode: SpawnMode, command_text: impl Into<String>, cwd: PathBuf) -> Self {
        Self {
            mode,
            command_text: command_text.into(),
            cwd,
            timeout: DEFAULT_TIMEOUT,
            env: HashMap::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub command: String,
    pub duration: Duration,
    pub killed: bool,
    pub error_message: Option<String>,
}

impl ExecResult {
    fn failure(command: &str, duration: Duration, message: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            signal: None,
            command: command.to_string(),
            duration,
            killed: false,
            error_message: Some(message.into()),
        }
    }

    /// Conventional human-readable form: stdout, then a `--- STDERR ---`
    /// section, plus metadata lines when requested.
    pub fn render(&self, include_metadata: bool) -> String {
        let mut out = String::new();
        if include_metadata {
            out.push_str(&format!(
                "Command: {}\nExit code: {}\nDuration: {}ms\n\n",
                self.command,
                self.exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "none".to_string()),
                self.duration.as_millis()
            ));
        }
        out.push_str(&self.stdout);
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("--- STDERR ---\n");
            out.push_str(&self.stderr);
        }
        if let Some(message) = &self.error_message {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(message);
        }
        out
    }
}

enum WaitOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
    OutputExceeded,
    Cancelled,
}

/// Run an approved command. `allowed_roots` bounds the working directory;
/// the check is component-wise, so `/tmp` does not admit `/tmp-attack`.
pub async fn execute(
    request: ExecRequest,
    allowed_roots: &[PathBuf],
    cancel: &CancellationToken,
) -> ExecResult {
    let started = Instant::now();
    let command_text = request.command_text.clone();

    if request.timeout > TIMEOUT_WARN_THRESHOLD {
        warn!(
            timeout_ms = request.timeout.as_millis() as u64,
            "exec timeout exceeds 10 minutes"
        );
    }
    let max_output = request.max_output_bytes.max(MIN_MAX_OUTPUT_BYTES);

    if !request.cwd.is_dir() {
        return ExecResult::failure(
            &command_text,
            started.elapsed(),
            format!("working directory does not exist: {}", request.cwd.display()),
        );
    }
    if !is_within_allowed_roots(&request.cwd, allowed_roots) {
        return ExecResult::failure(
            &command_text,
            started.elapsed(),
            format!(
                "working directory is outside the allowed folders: {}",
                request.cwd.display()
            ),
        );
    }

    let mut command = match &request.mode {
        SpawnMode::Direct(argv) => {
            let Some(program) = argv.first() else {
                return ExecResult::failure(&command_text, started.elapsed(), "empty command");
            };
            let mut command = Command::new(program);
            command.args(&argv[1..]);
            command
        }
        SpawnMode::Shell(script) => {
            let mut command = Command::new("sh");
            command.arg("-c").arg(script);
            command
        }
    };
    command
        .current_dir(&request.cwd)
        .envs(&request.env)
        // No stdin: interactive readers would hang forever otherwise.
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            return ExecResult::failure(
                &command_text,
                started.elapsed(),
                format!("failed to spawn command: {error}"),
            );
        }
    };

    let overflow = std::sync::Arc::new(Notify::new());
    let stdout_handle = child.stdout.take().map(|reader| {
        tokio::spawn(read_capped(
            BufReader::new(reader),
            max_output,
            std::sync::Arc::clone(&overflow),
        ))
    });
    let stderr_handle = child.stderr.take().map(|reader| {
        tokio::spawn(read_capped(
            BufReader::new(reader),
            max_output,
            std::sync::Arc::clone(&overflow),
        ))
    });

    let outcome = tokio::select! {
        waited = tokio::time::timeout(request.timeout, child.wait()) => match waited {
            Ok(Ok(status)) => WaitOutcome::Exited(status),
            Ok(Err(error)) => {
                return ExecResult::failure(
                    &command_text,
                    started.elapsed(),
                    format!("failed to wait for command: {error}"),
                );
            }
            Err(_) => WaitOutcome::TimedOut,
        },
        _ = overflow.notified() => WaitOutcome::OutputExceeded,
        _ = cancel.cancelled() => WaitOutcome::Cancelled,
    };

    let (status, killed, error_message) = match outcome {
        WaitOutcome::Exited(status) => (Some(status), false, None),
        WaitOutcome::TimedOut => {
            terminate(&mut child).await;
            (
                None,
                true,
                Some(format!(
                    "Command timed out after {}ms",
                    request.timeout.as_millis()
                )),
            )
        }
        WaitOutcome::OutputExceeded => {
            terminate(&mut child).await;
            (
                None,
                true,
                Some(format!("Command output exceeded {max_output} bytes")),
            )
        }
        WaitOutcome::Cancelled => {
            terminate(&mut child).await;
            (None, true, Some("Command cancelled".to_string()))
        }
    };

    let stdout = collect_stream(stdout_handle).await;
    let stderr = collect_stream(stderr_handle).await;
    let duration = started.elapsed();

    let exit_code = status.and_then(|s| s.code());
    let signal = status.and_then(signal_name);
    let success = exit_code == Some(0) && !killed;

    ExecResult {
        success,
        stdout,
        stderr,
        exit_code,
        signal,
        command: command_text,
        duration,
        killed,
        error_message,
    }
}

/// Exact match, or a component-wise prefix. `Path::starts_with` only
/// matches whole components, which is precisely the "separator boundary"
/// rule: `/tmp-attack` is not inside `/tmp`.
pub fn is_within_allowed_roots(cwd: &Path, allowed_roots: &[PathBuf]) -> bool {
    if allowed_roots.is_empty() {
        return false;
    }
    allowed_roots
        .iter()
        .any(|root| cwd == root || cwd.starts_with(root))
}

async fn collect_stream(
    handle: Option<tokio::task::JoinHandle<std::io::Result<Vec<u8>>>>,
) -> String {
    let Some(handle) = handle else {
        return String::new();
    };
    match handle.await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => String::new(),
    }
}

/// SIGTERM first; SIGKILL if the child is still alive after the grace
/// period. On non-unix platforms there is no graceful half, so kill
/// directly.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
                return;
            }
        }
    }
    child.start_kill().ok();
    child.wait().await.ok();
}

#[cfg(unix)]
fn signal_name(status: std::process::ExitStatus) -> Option<String> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|n| match n {
        libc::SIGTERM => "SIGTERM".to_string(),
        libc::SIGKILL => "SIGKILL".to_string(),
        libc::SIGINT => "SIGINT".to_string(),
        other => format!("signal {other}"),
    })
}

#[cfg(not(unix))]
fn signal_name(_status: std::process::ExitStatus) -> Option<String> {
    None
}

/// Accumulate up to `cap` bytes, then trip the overflow notifier. Keeps
/// draining to EOF so the child is not blocked on a full pipe while the
/// caller shuts it down.
async fn read_capped<R: AsyncRead + Unpin>(
    mut reader: R,
    cap: usize,
    overflow: std::sync::Arc<Notify>,
) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(cap.min(8 * 1024));
    let mut tmp = [0u8; 8192];
    let mut total = 0usize;
    let mut notified = false;
    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        total += n;
        if buf.len() < cap {
            let take = n.min(cap - buf.len());
            buf.extend_from_slice(&tmp[..take]);
        }
        if total > cap && !notified {
            notified = true;
            overflow.notify_one();
        }
    }
    Ok(buf)
}
