/// Sandboxed Executor - Docker Backend
///
/// Container-level isolation for deployments where untrusted code must be
/// cut off from the network and the host filesystem entirely. One container
/// is created per submission (network disabled, memory and CPU capped, kept
/// alive with a sleep), the source is written into it once, and every
/// compile/run step is a `docker exec` against that container.
///
/// Cleanup mirrors the process backend: a drop guard force-removes the
/// container on every exit path.
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, UpdateContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, warn};

use crate::lang::Invocation;
use crate::sandbox::{
    ExecutionOutcome, ResourceLimits, Sandbox, SandboxSession, GRADING_GRACE_MS, KILL_GRACE_MS,
    MAX_CAPTURE_BYTES,
};
use crate::store::CancelFlag;

/// Exit codes the Docker runtime reports for kernel-enforced kills.
const EXIT_OOM_KILLED: i64 = 137;
const EXIT_SEGFAULT: i64 = 139;

/// Docker-backed sandbox. All runtimes live in one judge image; per-language
/// commands come from the runtime plan, not from the image.
pub struct DockerSandbox {
    docker: Docker,
    image: String,
    /// Creation-time ceiling covering session setup; each attempt resizes
    /// the container to the problem's own memory limit before it runs.
    setup_memory_bytes: i64,
    nano_cpus: i64,
}

impl DockerSandbox {
    pub fn new(image: String) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("failed to connect to Docker daemon")?;
        Ok(DockerSandbox {
            docker,
            image,
            setup_memory_bytes: 512 * 1024 * 1024,
            nano_cpus: 1_000_000_000,
        })
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn open(&self, source_file: &str, source: &str) -> Result<Box<dyn SandboxSession>> {
        let name = format!("ctjudge-{}", uuid::Uuid::new_v4());

        let config = Config {
            image: Some(self.image.clone()),
            // Keep the container alive; every step runs as an exec.
            cmd: Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "sleep 600".to_string(),
            ]),
            entrypoint: Some(vec![]),
            network_disabled: Some(true),
            working_dir: Some("/judge".to_string()),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(self.setup_memory_bytes),
                nano_cpus: Some(self.nano_cpus),
                readonly_rootfs: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .context("failed to create judge container")?;

        let guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: container.id.clone(),
        };

        self.docker
            .start_container(&guard.container_id, None::<StartContainerOptions<String>>)
            .await
            .context("failed to start judge container")?;

        let session = DockerSession {
            docker: self.docker.clone(),
            guard,
            applied_memory_bytes: None,
            dead: false,
        };

        session
            .exec_shell(&format!(
                "mkdir -p /judge && echo '{}' | base64 -d > /judge/{}",
                general_purpose::STANDARD.encode(source),
                source_file
            ))
            .await
            .context("failed to write source into container")?;

        Ok(Box::new(session))
    }
}

/// Container cleanup guard - guarantees removal on drop, even if grading
/// panics or the submission is cancelled.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        tokio::spawn(async move {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                warn!(container = %container_id, error = %e, "failed to remove judge container");
            }
        });
    }
}

struct DockerSession {
    docker: Docker,
    guard: ContainerGuard,
    /// Memory ceiling currently applied to the container, so repeated
    /// attempts under the same limits skip the update call.
    applied_memory_bytes: Option<i64>,
    /// Set when the container could not be revived after a forced kill;
    /// later attempts fail fast instead of hanging.
    dead: bool,
}

impl DockerSession {
    /// Run a shell line to completion, without resource classification.
    /// Used for session setup only.
    async fn exec_shell(&self, script: &str) -> Result<()> {
        let exec = self
            .docker
            .create_exec(
                &self.guard.container_id,
                CreateExecOptions {
                    cmd: Some(vec!["/bin/sh", "-c", script]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, Some(StartExecOptions::default()))
            .await?
        {
            while output.next().await.is_some() {}
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        anyhow::ensure!(inspect.exit_code == Some(0), "setup command failed");
        Ok(())
    }

    /// Resize the container to the attempt's memory limit. The container is
    /// created with a setup-sized ceiling; each graded attempt must run under
    /// the problem's own limit instead.
    async fn apply_memory_limit(&mut self, limits: &ResourceLimits) -> Result<()> {
        let wanted = container_memory_bytes(limits);
        if self.applied_memory_bytes == Some(wanted) {
            return Ok(());
        }
        self.docker
            .update_container(
                &self.guard.container_id,
                UpdateContainerOptions::<String> {
                    memory: Some(wanted),
                    memory_swap: Some(wanted),
                    ..Default::default()
                },
            )
            .await?;
        self.applied_memory_bytes = Some(wanted);
        Ok(())
    }

    async fn exec_invocation(
        &mut self,
        invocation: &Invocation,
        stdin: &str,
        limits: &ResourceLimits,
        cancel: &CancelFlag,
    ) -> Result<ExecutionOutcome> {
        self.apply_memory_limit(limits).await?;

        // Pipe stdin through base64 so arbitrary test input survives the shell.
        let mut command = invocation.program.clone();
        for arg in &invocation.args {
            command.push(' ');
            command.push_str(&shell_quote(arg));
        }
        let script = format!(
            "cd /judge && echo '{}' | base64 -d | {}",
            general_purpose::STANDARD.encode(stdin),
            command
        );

        let exec = self
            .docker
            .create_exec(
                &self.guard.container_id,
                CreateExecOptions {
                    cmd: Some(vec!["/bin/sh", "-c", script.as_str()]),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await?;

        let start = Instant::now();
        let deadline = Duration::from_millis(limits.wall_time_ms + GRADING_GRACE_MS);

        let collect = async {
            let mut stdout = String::new();
            let mut stderr = String::new();

            if let StartExecResults::Attached { mut output, .. } = self
                .docker
                .start_exec(&exec.id, Some(StartExecOptions::default()))
                .await?
            {
                let mut ticker = tokio::time::interval(Duration::from_millis(50));
                loop {
                    tokio::select! {
                        msg = output.next() => match msg {
                            Some(Ok(LogOutput::StdOut { message })) => {
                                push_capped(&mut stdout, &message);
                            }
                            Some(Ok(LogOutput::StdErr { message })) => {
                                push_capped(&mut stderr, &message);
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "error reading exec output");
                                break;
                            }
                            None => break,
                        },
                        _ = ticker.tick() => {
                            if cancel.is_cancelled() {
                                return Ok(ExecEnd::Cancelled);
                            }
                        }
                    }
                }
            }

            let inspect = self.docker.inspect_exec(&exec.id).await?;
            Ok::<_, anyhow::Error>(ExecEnd::Finished {
                stdout,
                stderr,
                exit_code: inspect.exit_code,
            })
        };

        match tokio::time::timeout(deadline, collect).await {
            Ok(Ok(ExecEnd::Finished {
                stdout,
                stderr,
                exit_code,
            })) => {
                let wall_time_ms = start.elapsed().as_millis() as u64;
                Ok(match exit_code {
                    Some(0) => {
                        if wall_time_ms > limits.wall_time_ms {
                            ExecutionOutcome::TimeLimitExceeded { wall_time_ms }
                        } else {
                            ExecutionOutcome::Success {
                                stdout,
                                stderr,
                                wall_time_ms,
                                // exec API does not expose memory usage
                                peak_memory_kb: 0,
                            }
                        }
                    }
                    Some(EXIT_OOM_KILLED) => ExecutionOutcome::MemoryLimitExceeded {
                        wall_time_ms,
                        peak_memory_kb: 0,
                    },
                    Some(code) => ExecutionOutcome::NonZeroExit {
                        exit_code: code as i32,
                        stdout,
                        stderr: if code == EXIT_SEGFAULT {
                            format!("{}\n[segmentation fault]", stderr)
                        } else {
                            stderr
                        },
                        wall_time_ms,
                        peak_memory_kb: 0,
                    },
                    None => ExecutionOutcome::InternalError {
                        message: "exec finished without an exit code".to_string(),
                    },
                })
            }
            Ok(Ok(ExecEnd::Cancelled)) => {
                let wall_time_ms = start.elapsed().as_millis() as u64;
                // The exec cannot be aborted directly; tear the container down
                // the same way a timeout does.
                self.revive_after_kill().await;
                Ok(ExecutionOutcome::Cancelled { wall_time_ms })
            }
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => {
                let wall_time_ms = start.elapsed().as_millis() as u64;
                self.revive_after_kill().await;
                Ok(ExecutionOutcome::TimeLimitExceeded { wall_time_ms })
            }
        }
    }

    /// A timed-out exec can only be stopped by killing the container. The
    /// follow-up tests of the same submission still need it, so restart it;
    /// if that fails the session is marked dead.
    async fn revive_after_kill(&mut self) {
        let id = self.guard.container_id.clone();
        if let Err(e) = self
            .docker
            .kill_container(&id, None::<KillContainerOptions<String>>)
            .await
        {
            warn!(container = %id, error = %e, "failed to kill timed-out container");
        }

        let restart = tokio::time::timeout(
            Duration::from_millis(KILL_GRACE_MS),
            self.docker
                .start_container(&id, None::<StartContainerOptions<String>>),
        )
        .await;

        match restart {
            Ok(Ok(())) => debug!(container = %id, "container revived after timeout"),
            _ => {
                warn!(container = %id, "container could not be revived; session is dead");
                self.dead = true;
            }
        }
    }
}

/// How the log-streaming future ended: the exec ran to completion, or the
/// submission was cancelled while it was still producing output.
enum ExecEnd {
    Finished {
        stdout: String,
        stderr: String,
        exit_code: Option<i64>,
    },
    Cancelled,
}

/// Bytes to give the container for an attempt. The cgroup limit is what
/// actually enforces the problem's memory ceiling on this backend.
fn container_memory_bytes(limits: &ResourceLimits) -> i64 {
    limits.memory_kb as i64 * 1024
}

#[async_trait]
impl SandboxSession for DockerSession {
    async fn run(
        &mut self,
        invocation: &Invocation,
        stdin: &str,
        limits: &ResourceLimits,
        cancel: &CancelFlag,
    ) -> ExecutionOutcome {
        if self.dead {
            return ExecutionOutcome::InternalError {
                message: "judge container is no longer usable".to_string(),
            };
        }
        match self.exec_invocation(invocation, stdin, limits, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => ExecutionOutcome::InternalError {
                message: format!("{:#}", e),
            },
        }
    }
}

fn push_capped(buffer: &mut String, bytes: &[u8]) {
    if buffer.len() < MAX_CAPTURE_BYTES {
        let room = MAX_CAPTURE_BYTES - buffer.len();
        let chunk = String::from_utf8_lossy(bytes);
        if chunk.len() <= room {
            buffer.push_str(&chunk);
        } else {
            buffer.extend(chunk.chars().take(room));
        }
    }
}

fn shell_quote(arg: &str) -> String {
    if arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "./-_={}".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}
