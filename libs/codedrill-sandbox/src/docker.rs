//! Docker-backed sandbox.
//!
//! One throwaway container per run:
//! - Network disabled
//! - Memory (swap included), CPU and pid limits enforced by the daemon
//! - All capabilities dropped, `no-new-privileges`, unprivileged user
//! - Read-only root filesystem with a small tmpfs scratch at `/sandbox`
//! - Container removed by a drop guard even if the run is cancelled

use crate::engine::{reports_memory_error, ResourceKind, Sandbox, SandboxError, SandboxLimits, SandboxOutput, SandboxStatus};
use crate::harness::HarnessUnit;
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

const SCRATCH_DIR: &str = "/sandbox";
const SANDBOX_USER: &str = "65534:65534";
const BOOTSTRAP: &str =
    "echo \"$CODEDRILL_HARNESS\" | base64 -d > /sandbox/harness.py && exec python3 -I -B /sandbox/harness.py";

/// Container cleanup guard - guarantees container removal on drop
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        // Drop cannot be async; hand removal to the runtime.
        let container_id = self.container_id.clone();
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(remove_options)).await {
                warn!(container_id = %container_id, error = %e, "Failed to remove sandbox container");
            }
        });
    }
}

fn keep_tail(text: String, cap: usize) -> String {
    if text.len() <= cap {
        return text;
    }
    let mut start = text.len() - cap;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Append a log chunk, dropping the head once the buffer is twice the cap so
/// a print loop cannot grow it for the whole timeout window.
fn append_capped(buf: &mut String, chunk: &[u8], cap: usize) {
    buf.push_str(&String::from_utf8_lossy(chunk));
    if buf.len() > cap.saturating_mul(2) {
        *buf = keep_tail(std::mem::take(buf), cap);
    }
}

pub struct DockerEngine {
    docker: Docker,
    image: String,
}

impl DockerEngine {
    pub fn connect(image: impl Into<String>) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon")?;
        Ok(Self {
            docker,
            image: image.into(),
        })
    }

    /// Pull the image if it is not cached locally.
    async fn ensure_image(&self) -> Result<()> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            debug!(image = %self.image, "Image cache hit");
            return Ok(());
        }

        warn!(image = %self.image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: self.image.as_str(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            result.context("Failed to pull Docker image")?;
        }
        info!(image = %self.image, "Image pulled");
        Ok(())
    }

    fn container_config(&self, unit: &HarnessUnit, limits: &SandboxLimits) -> Config<String> {
        let memory = (limits.memory_mb as i64) * 1024 * 1024;
        let nano_cpus = (f64::from(limits.cpu_limit) * 1_000_000_000.0) as i64;
        let tmpfs = HashMap::from([(
            SCRATCH_DIR.to_string(),
            "rw,noexec,nosuid,size=16m,mode=1777".to_string(),
        )]);

        Config {
            image: Some(self.image.clone()),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), BOOTSTRAP.to_string()]),
            env: Some(vec![
                format!("CODEDRILL_HARNESS={}", general_purpose::STANDARD.encode(&unit.program)),
                format!("HOME={}", SCRATCH_DIR),
                "PYTHONIOENCODING=utf-8".to_string(),
            ]),
            user: Some(SANDBOX_USER.to_string()),
            working_dir: Some(SCRATCH_DIR.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(bollard::models::HostConfig {
                memory: Some(memory),
                memory_swap: Some(memory),
                nano_cpus: Some(nano_cpus),
                pids_limit: Some(i64::from(limits.max_processes)),
                readonly_rootfs: Some(true),
                network_mode: Some("none".to_string()),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                tmpfs: Some(tmpfs),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn oom_killed(&self, container_id: &str) -> bool {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info.state.and_then(|s| s.oom_killed).unwrap_or(false),
            Err(e) => {
                warn!(container_id = %container_id, error = %e, "Failed to inspect container");
                false
            }
        }
    }
}

#[async_trait]
impl Sandbox for DockerEngine {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[instrument(skip(self, unit, limits), fields(engine = "docker", image = %self.image, fixtures = unit.fixture_count))]
    async fn run(&self, unit: &HarnessUnit, limits: &SandboxLimits) -> Result<SandboxOutput, SandboxError> {
        let launch = |e: anyhow::Error| SandboxError::Launch(format!("{:#}", e));

        self.ensure_image()
            .await
            .with_context(|| format!("Failed to ensure Docker image '{}' is available", self.image))
            .map_err(launch)?;

        let container_name = format!("codedrill-{}", uuid::Uuid::new_v4());
        let create_options = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        let container = self
            .docker
            .create_container(Some(create_options), self.container_config(unit, limits))
            .await
            .context("Failed to create Docker container")
            .map_err(launch)?;

        let container_id = container.id.clone();
        let _guard = ContainerGuard {
            docker: self.docker.clone(),
            container_id: container_id.clone(),
        };

        let start = Instant::now();
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start Docker container")
            .map_err(launch)?;

        let execution = async {
            let mut stdout = String::new();
            let mut stderr = String::new();

            let logs_options = Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                follow: true,
                ..Default::default()
            });
            let mut logs = self.docker.logs(&container_id, logs_options);
            while let Some(chunk) = logs.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => append_capped(&mut stdout, &message, limits.max_output_bytes),
                    Ok(LogOutput::StdErr { message }) => append_capped(&mut stderr, &message, limits.max_output_bytes),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Error reading container logs");
                        break;
                    }
                }
            }

            let wait_options = WaitContainerOptions {
                condition: "not-running",
            };
            let mut wait = self.docker.wait_container(&container_id, Some(wait_options));
            let exit_code = match wait.next().await {
                Some(Ok(response)) => Some(response.status_code),
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Some(code),
                Some(Err(e)) => {
                    warn!(error = %e, "Failed to wait for container");
                    None
                }
                None => None,
            };

            (stdout, stderr, exit_code)
        };

        let output = match tokio::time::timeout(limits.timeout, execution).await {
            Ok((stdout, stderr, exit_code)) => {
                let stdout = keep_tail(stdout, limits.max_output_bytes);
                let stderr = keep_tail(stderr, limits.max_output_bytes);
                let status = if self.oom_killed(&container_id).await
                    || exit_code == Some(137)
                    || reports_memory_error(&stderr)
                {
                    SandboxStatus::LimitExceeded(ResourceKind::Memory)
                } else {
                    SandboxStatus::Completed {
                        exit_code: exit_code.map(|c| c as i32),
                    }
                };
                SandboxOutput {
                    stdout,
                    stderr,
                    status,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                }
            }
            Err(_) => {
                warn!(timeout_ms = limits.timeout.as_millis() as u64, "Container timed out, killing");
                if let Err(e) = self
                    .docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(container_id = %container_id, error = %e, "Failed to kill timed-out container");
                }
                SandboxOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    status: SandboxStatus::TimedOut,
                    elapsed_ms: start.elapsed().as_millis() as u64,
                }
            }
        };

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::HarnessGenerator;
    use codedrill_common::types::TestFixture;
    use std::time::Duration;

    #[test]
    fn test_keep_tail_respects_char_boundaries() {
        assert_eq!(keep_tail("short".to_string(), 10), "short");
        assert_eq!(keep_tail("abcdef".to_string(), 3), "def");
        // 'é' is two bytes; cutting inside it moves forward.
        assert_eq!(keep_tail("aé".to_string(), 1), "");
        assert_eq!(keep_tail("aéb".to_string(), 3), "éb");
    }

    #[test]
    fn test_append_capped_bounds_buffer_while_streaming() {
        let mut buf = String::new();
        for _ in 0..1000 {
            append_capped(&mut buf, b"0123456789", 64);
            assert!(buf.len() <= 128);
        }
        append_capped(&mut buf, b"\nlast line", 64);
        assert!(buf.ends_with("last line"));
        assert_eq!(keep_tail(buf, 64).len(), 64);
    }

    #[test]
    fn test_memory_error_in_stderr_is_recognised() {
        let stderr = "Traceback (most recent call last):\n  File \"harness.py\", line 9\nMemoryError\n\n";
        assert!(reports_memory_error(stderr));
        assert!(!reports_memory_error("ValueError: MemoryError in message\n"));
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_docker_engine_runs_harness() {
        let engine = DockerEngine::connect("python:3.12-slim").unwrap();
        let fixture = TestFixture {
            input: "add(2, 3)".to_string(),
            expected: "5".to_string(),
            is_hidden: false,
        };
        let unit = HarnessGenerator::new()
            .unwrap()
            .build("def add(a, b):\n    return a + b\n", &[&fixture])
            .unwrap();

        let output = engine
            .run(&unit, &SandboxLimits::default())
            .await
            .unwrap();
        assert!(output.stdout.contains(&unit.sentinel), "stderr: {}", output.stderr);
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_docker_engine_times_out() {
        let engine = DockerEngine::connect("python:3.12-slim").unwrap();
        let unit = HarnessGenerator::new()
            .unwrap()
            .build("while True:\n    pass\n", &[])
            .unwrap();
        let limits = SandboxLimits {
            timeout: Duration::from_secs(2),
            ..Default::default()
        };

        let output = engine.run(&unit, &limits).await.unwrap();
        assert!(output.timed_out());
    }
}
