/// Sandboxed Executor - Process Backend
///
/// **Core Responsibility:**
/// Execute one prepared invocation under a hard wall-clock deadline and a
/// hard memory ceiling, inside an ephemeral working directory that is
/// destroyed on every exit path.
///
/// **Critical Architectural Boundary:**
/// - The sandbox knows HOW to execute and bound a process
/// - The sandbox does NOT know scoring rules
/// - The sandbox does NOT evaluate correctness
/// - Raw outcomes are classified here; the grader turns them into verdicts
///
/// A `Sandbox` opens one `SandboxSession` per submission: the session keeps
/// the working directory (and any compiled artifact) alive across the
/// compile step and every test run, and tears it down on drop.
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::lang::Invocation;
use crate::store::CancelFlag;

/// Margin added to the problem's time limit before the process is forcibly
/// terminated. Covers interpreter startup and grading overhead.
pub const GRADING_GRACE_MS: u64 = 500;

/// How long a forced termination may take before the attempt escalates to
/// an internal error instead of hanging the worker.
pub const KILL_GRACE_MS: u64 = 2_000;

/// Extra address space granted on top of the memory ceiling so interpreters
/// can start; the sampled peak still decides the classification.
const MEMORY_ALLOWANCE_BYTES: u64 = 32 << 20;

/// stdout/stderr capture ceiling per attempt.
pub const MAX_CAPTURE_BYTES: usize = 64 * 1024;

/// Output file size ceiling enforced inside the child (RLIMIT_FSIZE).
const MAX_OUTPUT_FILE_BYTES: u64 = 32 << 20;

/// Per-attempt resource bounds, derived from the problem's limits.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub wall_time_ms: u64,
    pub memory_kb: u64,
}

impl ResourceLimits {
    pub fn from_problem(time_limit_ms: u64, memory_limit_mb: u64) -> Self {
        ResourceLimits {
            wall_time_ms: time_limit_ms,
            memory_kb: memory_limit_mb * 1024,
        }
    }
}

/// Classified outcome of a single execution attempt. When conditions race,
/// memory beats time beats a plain non-zero exit.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Success {
        stdout: String,
        stderr: String,
        wall_time_ms: u64,
        peak_memory_kb: u64,
    },
    NonZeroExit {
        exit_code: i32,
        stdout: String,
        stderr: String,
        wall_time_ms: u64,
        peak_memory_kb: u64,
    },
    TimeLimitExceeded {
        wall_time_ms: u64,
    },
    MemoryLimitExceeded {
        wall_time_ms: u64,
        peak_memory_kb: u64,
    },
    /// The submission was cancelled while this attempt was in flight; the
    /// process has been torn down.
    Cancelled {
        wall_time_ms: u64,
    },
    /// Sandbox or harness malfunction. The message is operator-facing; it is
    /// logged and never shown to end users verbatim.
    InternalError {
        message: String,
    },
}

/// Execution backend. One implementation per isolation mechanism; the
/// engine picks one at construction time.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Open an isolated session for one submission, with the source code
    /// already materialized under `source_file`.
    async fn open(&self, source_file: &str, source: &str) -> Result<Box<dyn SandboxSession>>;
}

/// One submission's isolation scope. Never shared between workers.
///
/// `cancel` is watched while the attempt runs: a cancelled flag tears the
/// attempt down immediately instead of waiting out the wall deadline.
#[async_trait]
pub trait SandboxSession: Send {
    async fn run(
        &mut self,
        invocation: &Invocation,
        stdin: &str,
        limits: &ResourceLimits,
        cancel: &CancelFlag,
    ) -> ExecutionOutcome;
}

/// Process-level backend: rlimits + network namespace + process-group kill
/// + ephemeral workdir.
///
/// Bounds time, memory, output size and file access scope, and detaches the
/// child from the network where the host permits unshare. Filesystem
/// isolation still needs the Docker backend; this one is the default because
/// it runs anywhere and keeps grading interactive.
pub struct ProcessSandbox {
    root: PathBuf,
}

impl ProcessSandbox {
    pub fn new() -> Self {
        ProcessSandbox {
            root: std::env::temp_dir(),
        }
    }

    pub fn with_root(root: PathBuf) -> Self {
        ProcessSandbox { root }
    }
}

impl Default for ProcessSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    async fn open(&self, source_file: &str, source: &str) -> Result<Box<dyn SandboxSession>> {
        let dir = self
            .root
            .join(format!("ctjudge-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir)
            .await
            .context("failed to create sandbox workdir")?;
        let workdir = Workdir { path: dir };

        tokio::fs::write(workdir.path.join(source_file), source)
            .await
            .context("failed to write source file")?;

        Ok(Box::new(ProcessSession { workdir }))
    }
}

/// Workdir cleanup guard - guarantees removal on drop, even when an attempt
/// times out, crashes, or the submission is cancelled mid-flight.
struct Workdir {
    path: PathBuf,
}

impl Drop for Workdir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove sandbox workdir");
        }
    }
}

struct ProcessSession {
    workdir: Workdir,
}

#[async_trait]
impl SandboxSession for ProcessSession {
    async fn run(
        &mut self,
        invocation: &Invocation,
        stdin: &str,
        limits: &ResourceLimits,
        cancel: &CancelFlag,
    ) -> ExecutionOutcome {
        match execute_process(&self.workdir.path, invocation, stdin, limits, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => ExecutionOutcome::InternalError {
                message: format!("{:#}", e),
            },
        }
    }
}

/// What ended the wait on the child, before the hard deadline.
enum WaitEvent {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
}

async fn execute_process(
    workdir: &Path,
    invocation: &Invocation,
    stdin: &str,
    limits: &ResourceLimits,
    cancel: &CancelFlag,
) -> Result<ExecutionOutcome> {
    let mut cmd = Command::new(&invocation.program);
    cmd.args(&invocation.args)
        .current_dir(workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .env_clear()
        .env("PATH", "/usr/local/bin:/usr/bin:/bin")
        .env("HOME", workdir)
        .kill_on_drop(true);

    let memory_bytes = limits.memory_kb * 1024 + MEMORY_ALLOWANCE_BYTES;
    let cpu_secs = limits.wall_time_ms / 1000 + 2;
    unsafe {
        cmd.pre_exec(move || {
            // New session so the whole process group can be killed on timeout.
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            unshare_network()?;
            set_rlimit(libc::RLIMIT_AS, memory_bytes)?;
            set_rlimit(libc::RLIMIT_CPU, cpu_secs)?;
            set_rlimit(libc::RLIMIT_FSIZE, MAX_OUTPUT_FILE_BYTES)?;
            set_rlimit(libc::RLIMIT_CORE, 0)?;
            Ok(())
        });
    }

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {}", invocation.program))?;
    let pid = child.id();

    // Feed stdin from a detached task so a full pipe can never deadlock the
    // wait loop; untrusted code may simply not read its input.
    if let Some(mut handle) = child.stdin.take() {
        let input = stdin.as_bytes().to_vec();
        tokio::spawn(async move {
            let _ = handle.write_all(&input).await;
            // handle drops here, closing the pipe
        });
    }

    let stdout_task = child
        .stdout
        .take()
        .map(|h| tokio::spawn(read_capped(h)));
    let stderr_task = child
        .stderr
        .take()
        .map(|h| tokio::spawn(read_capped(h)));

    let deadline = Duration::from_millis(limits.wall_time_ms + GRADING_GRACE_MS);
    let mut peak_memory_kb: u64 = 0;

    let wait_result = tokio::time::timeout(deadline, async {
        let mut ticker = tokio::time::interval(Duration::from_millis(10));
        loop {
            tokio::select! {
                status = child.wait() => break WaitEvent::Exited(status),
                _ = ticker.tick() => {
                    if cancel.is_cancelled() {
                        break WaitEvent::Cancelled;
                    }
                    if let Some(kb) = pid.and_then(read_peak_memory_kb) {
                        peak_memory_kb = peak_memory_kb.max(kb);
                    }
                }
            }
        }
    })
    .await;

    let status = match wait_result {
        Ok(WaitEvent::Exited(status)) => status.context("failed to wait for child")?,
        Ok(WaitEvent::Cancelled) => {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            let reaped =
                tokio::time::timeout(Duration::from_millis(KILL_GRACE_MS), child.wait()).await;
            return match reaped {
                Ok(_) => Ok(ExecutionOutcome::Cancelled {
                    wall_time_ms: start.elapsed().as_millis() as u64,
                }),
                Err(_) => Ok(ExecutionOutcome::InternalError {
                    message: format!(
                        "process {:?} survived forced termination for {}ms",
                        pid, KILL_GRACE_MS
                    ),
                }),
            };
        }
        Err(_elapsed) => {
            // Hard deadline hit: kill the whole process group, not just the
            // direct child, then wait a bounded grace period for the reap.
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            let reaped =
                tokio::time::timeout(Duration::from_millis(KILL_GRACE_MS), child.wait()).await;
            return match reaped {
                Ok(_) => Ok(ExecutionOutcome::TimeLimitExceeded {
                    wall_time_ms: start.elapsed().as_millis() as u64,
                }),
                Err(_) => Ok(ExecutionOutcome::InternalError {
                    message: format!(
                        "process {:?} survived forced termination for {}ms",
                        pid, KILL_GRACE_MS
                    ),
                }),
            };
        }
    };

    let wall_time_ms = start.elapsed().as_millis() as u64;
    let stdout = collect_capture(stdout_task).await;
    let stderr = collect_capture(stderr_task).await;

    debug!(
        program = %invocation.program,
        wall_time_ms,
        peak_memory_kb,
        code = ?status.code(),
        "attempt finished"
    );

    Ok(classify_exit(
        ExitFacts {
            exit_code: status.code(),
            signal: exit_signal(&status),
            wall_time_ms,
            peak_memory_kb,
        },
        limits,
        stdout,
        stderr,
    ))
}

/// Observable facts about a finished process, separated out so the
/// classification rules are testable without spawning anything.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ExitFacts {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub wall_time_ms: u64,
    pub peak_memory_kb: u64,
}

/// Priority when conditions race: memory ceiling > wall deadline > plain
/// failure. A SIGKILL with the peak at the ceiling reads as the kernel
/// enforcing the memory limit, same as the Docker 137 convention.
pub(crate) fn classify_exit(
    facts: ExitFacts,
    limits: &ResourceLimits,
    stdout: String,
    stderr: String,
) -> ExecutionOutcome {
    let over_memory = facts.peak_memory_kb >= limits.memory_kb;

    if let Some(signal) = facts.signal {
        if signal == libc::SIGKILL || over_memory {
            return ExecutionOutcome::MemoryLimitExceeded {
                wall_time_ms: facts.wall_time_ms,
                peak_memory_kb: facts.peak_memory_kb,
            };
        }
        if signal == libc::SIGXCPU {
            return ExecutionOutcome::TimeLimitExceeded {
                wall_time_ms: facts.wall_time_ms,
            };
        }
        return ExecutionOutcome::NonZeroExit {
            exit_code: -signal,
            stdout,
            stderr: append_line(stderr, &format!("[killed by signal {}]", signal)),
            wall_time_ms: facts.wall_time_ms,
            peak_memory_kb: facts.peak_memory_kb,
        };
    }

    match facts.exit_code {
        Some(0) => {
            // RLIMIT_AS carries an allowance above the ceiling, so a run can
            // breach the ceiling and still exit cleanly; the sampled peak
            // decides regardless of the exit code.
            if over_memory {
                ExecutionOutcome::MemoryLimitExceeded {
                    wall_time_ms: facts.wall_time_ms,
                    peak_memory_kb: facts.peak_memory_kb,
                }
            } else if facts.wall_time_ms > limits.wall_time_ms {
                ExecutionOutcome::TimeLimitExceeded {
                    wall_time_ms: facts.wall_time_ms,
                }
            } else {
                ExecutionOutcome::Success {
                    stdout,
                    stderr,
                    wall_time_ms: facts.wall_time_ms,
                    peak_memory_kb: facts.peak_memory_kb,
                }
            }
        }
        Some(code) => {
            if over_memory {
                ExecutionOutcome::MemoryLimitExceeded {
                    wall_time_ms: facts.wall_time_ms,
                    peak_memory_kb: facts.peak_memory_kb,
                }
            } else {
                ExecutionOutcome::NonZeroExit {
                    exit_code: code,
                    stdout,
                    stderr,
                    wall_time_ms: facts.wall_time_ms,
                    peak_memory_kb: facts.peak_memory_kb,
                }
            }
        }
        None => ExecutionOutcome::InternalError {
            message: "process finished with neither exit code nor signal".to_string(),
        },
    }
}

fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

/// Detach the child from the host network. Privileged hosts get a plain
/// network namespace; unprivileged ones need a user namespace first. When
/// the kernel forbids both the child still runs, network-visible - the
/// Docker backend is the hard guarantee.
fn unshare_network() -> std::io::Result<()> {
    if unsafe { libc::unshare(libc::CLONE_NEWNET) } == 0 {
        return Ok(());
    }
    if unsafe { libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNET) } == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EPERM) | Some(libc::EACCES) | Some(libc::EINVAL) => Ok(()),
        _ => Err(err),
    }
}

fn set_rlimit(resource: libc::__rlimit_resource_t, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn kill_process_group(pid: u32) {
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

/// VmHWM of a live process, in kilobytes.
fn read_peak_memory_kb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    let line = status.lines().find(|l| l.starts_with("VmHWM:"))?;
    line.split_whitespace().nth(1)?.parse().ok()
}

/// Read a stream up to the capture ceiling, then keep draining so the child
/// never blocks on a full pipe.
async fn read_capped<R: tokio::io::AsyncRead + Unpin>(mut reader: R) -> String {
    let mut captured = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if captured.len() < MAX_CAPTURE_BYTES {
                    let take = n.min(MAX_CAPTURE_BYTES - captured.len());
                    captured.extend_from_slice(&chunk[..take]);
                }
            }
        }
    }
    String::from_utf8_lossy(&captured).into_owned()
}

async fn collect_capture(task: Option<tokio::task::JoinHandle<String>>) -> String {
    match task {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}

fn append_line(mut text: String, line: &str) -> String {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(line);
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ResourceLimits {
        ResourceLimits {
            wall_time_ms: 1000,
            memory_kb: 262144,
        }
    }

    fn sh(script: &str) -> Invocation {
        Invocation::new("/bin/sh", &["-c", script])
    }

    async fn open_session() -> Box<dyn SandboxSession> {
        ProcessSandbox::new()
            .open("main.sh", "unused")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_captures_stdout() {
        let mut session = open_session().await;
        let outcome = session.run(&sh("echo hello"), "", &limits(), &CancelFlag::new()).await;
        match outcome {
            ExecutionOutcome::Success { stdout, .. } => assert_eq!(stdout, "hello\n"),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stdin_is_piped() {
        let mut session = open_session().await;
        let outcome = session.run(&sh("cat"), "40 2\n", &limits(), &CancelFlag::new()).await;
        match outcome {
            ExecutionOutcome::Success { stdout, .. } => assert_eq!(stdout, "40 2\n"),
            other => panic!("expected success, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_classified() {
        let mut session = open_session().await;
        let outcome = session
            .run(&sh("echo oops 1>&2; exit 3"), "", &limits(), &CancelFlag::new())
            .await;
        match outcome {
            ExecutionOutcome::NonZeroExit {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, 3);
                assert!(stderr.contains("oops"));
            }
            other => panic!("expected non-zero exit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_infinite_sleep_times_out_within_grace() {
        let tight = ResourceLimits {
            wall_time_ms: 200,
            memory_kb: 262144,
        };
        let started = Instant::now();
        let mut session = open_session().await;
        let outcome = session.run(&sh("sleep 30"), "", &tight, &CancelFlag::new()).await;
        match outcome {
            ExecutionOutcome::TimeLimitExceeded { wall_time_ms } => {
                assert!(wall_time_ms >= tight.wall_time_ms);
            }
            other => panic!("expected time limit exceeded, got {:?}", other),
        }
        // deadline + forced-termination grace, with scheduling slack
        assert!(started.elapsed() < Duration::from_millis(200 + GRADING_GRACE_MS + KILL_GRACE_MS + 1000));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_attempt() {
        let generous = ResourceLimits {
            wall_time_ms: 30_000,
            memory_kb: 262144,
        };
        let cancel = CancelFlag::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let mut session = open_session().await;
        let outcome = session.run(&sh("sleep 30"), "", &generous, &cancel).await;
        match outcome {
            ExecutionOutcome::Cancelled { .. } => {}
            other => panic!("expected cancelled, got {:?}", other),
        }
        // teardown must not wait out the wall deadline
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_workdir_removed_on_drop() {
        let sandbox = ProcessSandbox::new();
        let root = std::env::temp_dir();
        let before: Vec<_> = list_workdirs(&root);
        let session = sandbox.open("main.sh", "echo hi").await.unwrap();
        let created: Vec<_> = list_workdirs(&root)
            .into_iter()
            .filter(|p| !before.contains(p))
            .collect();
        assert_eq!(created.len(), 1);
        drop(session);
        assert!(!created[0].exists());
    }

    fn list_workdirs(root: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(root)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with("ctjudge-"))
                    .unwrap_or(false)
            })
            .collect()
    }

    #[test]
    fn test_classify_sigkill_as_memory_limit() {
        let outcome = classify_exit(
            ExitFacts {
                exit_code: None,
                signal: Some(libc::SIGKILL),
                wall_time_ms: 120,
                peak_memory_kb: 100,
            },
            &limits(),
            String::new(),
            String::new(),
        );
        assert!(matches!(
            outcome,
            ExecutionOutcome::MemoryLimitExceeded { .. }
        ));
    }

    #[test]
    fn test_classify_segfault_at_ceiling_as_memory_limit() {
        let outcome = classify_exit(
            ExitFacts {
                exit_code: None,
                signal: Some(libc::SIGSEGV),
                wall_time_ms: 120,
                peak_memory_kb: 262144,
            },
            &limits(),
            String::new(),
            String::new(),
        );
        assert!(matches!(
            outcome,
            ExecutionOutcome::MemoryLimitExceeded { .. }
        ));
    }

    #[test]
    fn test_classify_segfault_below_ceiling_as_runtime_error() {
        let outcome = classify_exit(
            ExitFacts {
                exit_code: None,
                signal: Some(libc::SIGSEGV),
                wall_time_ms: 120,
                peak_memory_kb: 5000,
            },
            &limits(),
            String::new(),
            "".to_string(),
        );
        match outcome {
            ExecutionOutcome::NonZeroExit {
                exit_code, stderr, ..
            } => {
                assert_eq!(exit_code, -libc::SIGSEGV);
                assert!(stderr.contains("signal"));
            }
            other => panic!("expected non-zero exit, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_sigxcpu_as_time_limit() {
        let outcome = classify_exit(
            ExitFacts {
                exit_code: None,
                signal: Some(libc::SIGXCPU),
                wall_time_ms: 900,
                peak_memory_kb: 1000,
            },
            &limits(),
            String::new(),
            String::new(),
        );
        assert!(matches!(outcome, ExecutionOutcome::TimeLimitExceeded { .. }));
    }

    #[test]
    fn test_classify_clean_exit_over_ceiling_as_memory_limit() {
        // the address-space allowance lets a run breach the ceiling and
        // still exit 0; the sampled peak must win over the clean exit
        let outcome = classify_exit(
            ExitFacts {
                exit_code: Some(0),
                signal: None,
                wall_time_ms: 120,
                peak_memory_kb: 300000,
            },
            &limits(),
            "42\n".to_string(),
            String::new(),
        );
        match outcome {
            ExecutionOutcome::MemoryLimitExceeded { peak_memory_kb, .. } => {
                assert_eq!(peak_memory_kb, 300000);
            }
            other => panic!("expected memory limit exceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_late_clean_exit_as_time_limit() {
        let outcome = classify_exit(
            ExitFacts {
                exit_code: Some(0),
                signal: None,
                wall_time_ms: 1300,
                peak_memory_kb: 1000,
            },
            &limits(),
            "42\n".to_string(),
            String::new(),
        );
        assert!(matches!(outcome, ExecutionOutcome::TimeLimitExceeded { .. }));
    }
}
