/// Execution Engine - Process Sandbox
///
/// **Core Responsibility:**
/// Run one rendered harness in a fresh, isolated child and capture its raw
/// output streams.
///
/// **Architectural Boundary:**
/// - Engine knows HOW to execute (local process, Docker container)
/// - Engine does NOT decode results or judge correctness
/// - Engine returns raw stdout/stderr plus how the child ended
///
/// Lifecycle of a run: `NotStarted -> Running -> {Completed, TimedOut,
/// LimitExceeded}`; a child that cannot be started is `SandboxError::Launch`.

use crate::harness::HarnessUnit;
use async_trait::async_trait;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, instrument, warn};

pub const HARNESS_FILE: &str = "harness.py";

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const MAX_OPEN_FILES: u64 = 64;
const MAX_FILE_SIZE_BYTES: u64 = 16 * 1024 * 1024;

/// Limits applied to a single run.
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub memory_mb: u64,
    pub cpu_limit: f32,
    pub max_processes: u32,
    pub max_output_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            memory_mb: 256,
            cpu_limit: 0.5,
            max_processes: 32,
            max_output_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Memory,
    Cpu,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Memory => f.write_str("memory"),
            ResourceKind::Cpu => f.write_str("cpu"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxStatus {
    Completed { exit_code: Option<i32> },
    TimedOut,
    LimitExceeded(ResourceKind),
}

/// Raw output of one run
#[derive(Debug, Clone)]
pub struct SandboxOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: SandboxStatus,
    pub elapsed_ms: u64,
}

impl SandboxOutput {
    pub fn timed_out(&self) -> bool {
        self.status == SandboxStatus::TimedOut
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("Sandbox launch failed: {0}")]
    Launch(String),
}

#[async_trait]
pub trait Sandbox: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, unit: &HarnessUnit, limits: &SandboxLimits) -> Result<SandboxOutput, SandboxError>;
}

/// rlimits installed in the child between fork and exec.
#[derive(Debug, Clone, Copy)]
struct ChildLimits {
    address_space: u64,
    cpu_seconds: u64,
}

impl ChildLimits {
    fn from_limits(limits: &SandboxLimits) -> Self {
        // Wall clock is the primary deadline; the CPU ceiling only catches
        // runs that somehow outlive it.
        let cpu_seconds = limits.timeout.as_secs_f64().ceil() as u64 + 1;
        Self {
            address_space: limits.memory_mb * 1024 * 1024,
            cpu_seconds,
        }
    }

    fn apply(&self) -> std::io::Result<()> {
        setrlimit(Resource::RLIMIT_AS, self.address_space, self.address_space)?;
        setrlimit(Resource::RLIMIT_CPU, self.cpu_seconds, self.cpu_seconds + 1)?;
        setrlimit(Resource::RLIMIT_FSIZE, MAX_FILE_SIZE_BYTES, MAX_FILE_SIZE_BYTES)?;
        setrlimit(Resource::RLIMIT_NOFILE, MAX_OPEN_FILES, MAX_OPEN_FILES)?;
        setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
        Ok(())
    }
}

/// Keep only the last `cap` bytes of a stream. The result line is written
/// last, so the tail is what matters.
async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > cap.saturating_mul(2) {
                    let excess = buf.len() - cap;
                    buf.drain(..excess);
                }
            }
            Err(e) => {
                warn!(error = %e, "Error reading sandbox stream");
                break;
            }
        }
    }
    if buf.len() > cap {
        let excess = buf.len() - cap;
        buf.drain(..excess);
    }
    buf
}

fn kill_group(pgid: Pid) {
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pgid = pgid.as_raw(), error = %e, "Failed to kill sandbox process group"),
    }
}

/// The interpreter died on an uncaught `MemoryError`: the address-space
/// ceiling was hit, at module level or inside a fixture.
pub(crate) fn reports_memory_error(stderr: &str) -> bool {
    let last_line = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
    last_line.trim_start().starts_with("MemoryError")
}

fn classify_exit(status: std::process::ExitStatus, stderr: &str) -> SandboxStatus {
    match status.signal() {
        Some(sig) if sig == Signal::SIGXCPU as i32 => {
            return SandboxStatus::LimitExceeded(ResourceKind::Cpu);
        }
        // Nothing inside the sandbox can send SIGKILL to itself, so this is
        // the kernel (OOM killer or the hard CPU limit after SIGXCPU).
        Some(sig) if sig == Signal::SIGKILL as i32 => {
            return SandboxStatus::LimitExceeded(ResourceKind::Memory);
        }
        _ => {}
    }

    if reports_memory_error(stderr) {
        return SandboxStatus::LimitExceeded(ResourceKind::Memory);
    }

    SandboxStatus::Completed {
        exit_code: status.code(),
    }
}

/// Runs the harness as a local child process.
///
/// **Isolation applied:**
/// - Fresh scratch directory per run, removed on drop
/// - Cleared environment (PATH, HOME=scratch, locale, Python IO settings)
/// - stdin closed, own process group, SIGKILL to the whole group on exit
/// - rlimits: address space, CPU time, file size, open files, no core dumps
/// - Optional user + network namespace (`isolate_network`)
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    interpreter: String,
    interpreter_args: Vec<String>,
    isolate_network: bool,
}

impl ProcessEngine {
    pub fn new(interpreter: impl Into<String>, interpreter_args: Vec<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            interpreter_args,
            isolate_network: false,
        }
    }

    /// Python in isolated mode (`-I`: no user site, no PYTHON* env) without
    /// bytecode writes.
    pub fn python(interpreter: impl Into<String>) -> Self {
        Self::new(interpreter, vec!["-I".to_string(), "-B".to_string()])
    }

    pub fn with_network_isolation(mut self, isolate: bool) -> Self {
        self.isolate_network = isolate;
        self
    }

    fn command(&self, scratch: &std::path::Path, limits: &SandboxLimits) -> Command {
        let path_env = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());

        let mut cmd = Command::new(&self.interpreter);
        cmd.args(&self.interpreter_args)
            .arg(HARNESS_FILE)
            .current_dir(scratch)
            .env_clear()
            .env("PATH", path_env)
            .env("HOME", scratch)
            .env("LANG", "C.UTF-8")
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let child_limits = ChildLimits::from_limits(limits);
        let isolate_network = self.isolate_network;
        // SAFETY: the closure runs in the forked child before exec and only
        // issues setrlimit/unshare syscalls, which are async-signal-safe.
        unsafe {
            cmd.pre_exec(move || {
                child_limits.apply()?;
                if isolate_network {
                    use nix::sched::{unshare, CloneFlags};
                    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET)?;
                }
                Ok(())
            });
        }
        cmd
    }
}

#[async_trait]
impl Sandbox for ProcessEngine {
    fn name(&self) -> &'static str {
        "process"
    }

    #[instrument(skip(self, unit, limits), fields(engine = "process", fixtures = unit.fixture_count))]
    async fn run(&self, unit: &HarnessUnit, limits: &SandboxLimits) -> Result<SandboxOutput, SandboxError> {
        let launch = |what: &str, e: std::io::Error| SandboxError::Launch(format!("{}: {}", what, e));

        // Scratch directory lives exactly as long as this call.
        let scratch = tempfile::Builder::new()
            .prefix("codedrill-")
            .tempdir()
            .map_err(|e| launch("failed to create scratch directory", e))?;
        tokio::fs::write(scratch.path().join(HARNESS_FILE), &unit.program)
            .await
            .map_err(|e| launch("failed to write harness", e))?;

        let mut child = self
            .command(scratch.path(), limits)
            .spawn()
            .map_err(|e| launch(&format!("failed to start '{}'", self.interpreter), e))?;

        let pgid = child
            .id()
            .map(|id| Pid::from_raw(id as i32))
            .ok_or_else(|| SandboxError::Launch("child exited before it could be tracked".to_string()))?;
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            kill_group(pgid);
            return Err(SandboxError::Launch("child output pipes unavailable".to_string()));
        };

        debug!(pid = pgid.as_raw(), timeout_ms = limits.timeout.as_millis() as u64, "Sandbox child started");
        let start = Instant::now();
        let cap = limits.max_output_bytes;

        let execution = async {
            tokio::join!(read_tail(stdout, cap), read_tail(stderr, cap), child.wait())
        };
        let outcome = tokio::time::timeout(limits.timeout, execution).await;

        // Reap stray descendants in every case.
        kill_group(pgid);

        let output = match outcome {
            Ok((out, err, Ok(status))) => {
                let stdout = String::from_utf8_lossy(&out).into_owned();
                let stderr = String::from_utf8_lossy(&err).into_owned();
                let status = classify_exit(status, &stderr);
                SandboxOutput {
                    stdout,
                    stderr,
                    status,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                }
            }
            Ok((_, _, Err(e))) => {
                let _ = child.kill().await;
                return Err(launch("failed to wait for child", e));
            }
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to reap timed-out sandbox child");
                }
                warn!(
                    timeout_ms = limits.timeout.as_millis() as u64,
                    "Sandbox run timed out; process group killed"
                );
                SandboxOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    status: SandboxStatus::TimedOut,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                }
            }
        };

        debug!(
            status = ?output.status,
            elapsed_ms = output.elapsed_ms,
            stdout_bytes = output.stdout.len(),
            stderr_bytes = output.stderr.len(),
            "Sandbox run finished"
        );
        Ok(output)
    }
}
