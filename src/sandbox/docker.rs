//! Docker-backed sandbox environment using the bollard crate.
//!
//! One environment wraps one connection to the Docker daemon and is
//! constructed once, then injected wherever sandboxes are needed. An
//! admission semaphore bounds concurrently active contexts so parallel issue
//! runs cannot exhaust the daemon.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{Config, CreateContainerOptions, RemoveContainerOptions, LogOutput};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, PortBinding as DockerPortBinding};
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SandboxError;

use super::{RawExec, SandboxConfig, SandboxEnvironment, SandboxHandle};

/// Delay base between provisioning attempts.
const PROVISION_BACKOFF: Duration = Duration::from_millis(500);

/// Sandbox environment backed by the local Docker daemon.
pub struct DockerEnvironment {
    docker: Docker,
    admission: Arc<Semaphore>,
    /// Admission permits held by live handles, keyed by handle id. Dropping
    /// a permit on release frees one admission slot.
    permits: Mutex<HashMap<String, OwnedSemaphorePermit>>,
}

impl DockerEnvironment {
    /// Connects to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns [`SandboxError::Provisioning`] when the daemon is not
    /// reachable at all.
    pub fn new(max_active: usize) -> Result<Self, SandboxError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| SandboxError::Provisioning(format!("Failed to connect: {e}")))?;

        Ok(Self::from_docker(docker, max_active))
    }

    /// Wraps an existing bollard connection.
    pub fn from_docker(docker: Docker, max_active: usize) -> Self {
        Self {
            docker,
            admission: Arc::new(Semaphore::new(max_active.max(1))),
            permits: Mutex::new(HashMap::new()),
        }
    }

    /// One provisioning attempt: create and start the container.
    async fn provision_once(
        &self,
        name: &str,
        config: &SandboxConfig,
        bind: &str,
    ) -> Result<String, String> {
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<DockerPortBinding>>> = HashMap::new();
        for port in &config.ports {
            let key = format!("{}/tcp", port.container);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![DockerPortBinding {
                    host_ip: None,
                    host_port: Some(port.host.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            binds: Some(vec![bind.to_string()]),
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            network_mode: Some(config.network_mode.clone()),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(config.image.clone()),
            env: if config.env.is_empty() {
                None
            } else {
                Some(config.env.clone())
            },
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            // Keep the image's default entrypoint alive, as `docker run -it`
            // would.
            tty: Some(true),
            open_stdin: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };

        let created = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| format!("Failed to create container: {e}"))?;

        if let Err(e) = self
            .docker
            .start_container::<String>(&created.id, None)
            .await
        {
            // Partial provisioning: drop the created container before the
            // caller retries.
            let _ = self
                .docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(format!("Failed to start container: {e}"));
        }

        Ok(created.id)
    }
}

#[async_trait]
impl SandboxEnvironment for DockerEnvironment {
    async fn acquire(&self, config: &SandboxConfig) -> Result<SandboxHandle, SandboxError> {
        let permit = self
            .admission
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| SandboxError::Provisioning(format!("Admission gate closed: {e}")))?;

        let handle_id = format!("regress-forge-{}", Uuid::new_v4());
        let artifact_dir = config.artifact_root.join(&handle_id);
        tokio::fs::create_dir_all(&artifact_dir).await.map_err(|e| {
            SandboxError::Provisioning(format!(
                "Failed to create artifact dir {}: {e}",
                artifact_dir.display()
            ))
        })?;

        let bind = format!(
            "{}:{}:rw",
            artifact_dir.display(),
            config.container_artifact_dir
        );

        let attempts = config.provision_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.provision_once(&handle_id, config, &bind).await {
                Ok(container_id) => {
                    let handle = SandboxHandle {
                        id: handle_id.clone(),
                        container_id,
                        artifact_dir,
                        container_artifact_dir: config.container_artifact_dir.clone(),
                    };
                    self.permits.lock().await.insert(handle.id.clone(), permit);
                    info!(
                        handle = %handle.id,
                        image = %config.image,
                        attempt,
                        "Sandbox ready"
                    );
                    return Ok(handle);
                }
                Err(e) => {
                    warn!(handle = %handle_id, attempt, error = %e, "Provisioning attempt failed");
                    last_error = e;
                    if attempt < attempts {
                        tokio::time::sleep(PROVISION_BACKOFF * attempt).await;
                    }
                }
            }
        }

        let _ = tokio::fs::remove_dir_all(&artifact_dir).await;
        Err(SandboxError::Provisioning(format!(
            "{last_error} (after {attempts} attempts)"
        )))
    }

    async fn run(
        &self,
        handle: &SandboxHandle,
        command: &[String],
    ) -> Result<RawExec, SandboxError> {
        let exec_options = CreateExecOptions::<String> {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&handle.container_id, exec_options)
            .await
            .map_err(|e| SandboxError::Transport(format!("Failed to create exec: {e}")))?;

        let start_result = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| SandboxError::Transport(format!("Failed to start exec: {e}")))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = start_result {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        return Err(SandboxError::Transport(format!(
                            "Error reading exec output: {e}"
                        )));
                    }
                }
            }
        }

        let exec_info = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| SandboxError::Transport(format!("Failed to inspect exec: {e}")))?;

        let exit_status = exec_info.exit_code.unwrap_or(-1);

        debug!(handle = %handle.id, exit_status, "Sandbox command finished");

        Ok(RawExec {
            exit_status,
            stdout,
            stderr,
        })
    }

    async fn release(&self, handle: &SandboxHandle) -> Result<(), SandboxError> {
        // Drop the admission permit first so a slot frees even if teardown
        // below is degraded.
        self.permits.lock().await.remove(&handle.id);

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        if let Err(e) = self
            .docker
            .remove_container(&handle.container_id, Some(options))
            .await
        {
            let message = e.to_string();
            // Second release of the same handle lands here.
            if !message.contains("No such container") {
                warn!(handle = %handle.id, error = %message, "Container removal failed");
            }
        }

        match tokio::fs::remove_dir_all(&handle.artifact_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(handle = %handle.id, error = %e, "Artifact dir removal failed");
            }
        }

        debug!(handle = %handle.id, "Sandbox released");
        Ok(())
    }
}
