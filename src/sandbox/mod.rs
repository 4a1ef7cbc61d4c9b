//! Ephemeral, isolated execution environments.
//!
//! One [`SandboxHandle`] is one live execution context with a writable
//! artifact-exchange directory bound into it. The orchestrator owns exactly
//! one handle per run and guarantees release on every exit path. The
//! [`SandboxEnvironment`] trait is the seam for test doubles; the production
//! implementation is the Docker-backed [`DockerEnvironment`].

pub mod docker;

pub use docker::DockerEnvironment;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

/// A host-to-container port binding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PortBinding {
    /// Port published on the host.
    pub host: u16,
    /// Port inside the container.
    pub container: u16,
}

impl PortBinding {
    /// Binds the same port number on host and container.
    pub fn same(port: u16) -> Self {
        Self {
            host: port,
            container: port,
        }
    }
}

/// Configuration for acquiring a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Docker image to run.
    pub image: String,
    /// Host directory under which per-handle artifact directories are
    /// created.
    pub artifact_root: PathBuf,
    /// Mount point of the artifact directory inside the container.
    pub container_artifact_dir: String,
    /// Ports to publish, if the runtime under test exposes a service.
    pub ports: Vec<PortBinding>,
    /// Environment variables in `KEY=value` form.
    pub env: Vec<String>,
    /// Network mode ("none", "bridge", "host").
    pub network_mode: String,
    /// Provisioning attempts before surfacing a ProvisioningError.
    pub provision_attempts: u32,
}

impl SandboxConfig {
    /// Creates a configuration for the given image with YottaDB-shaped
    /// defaults: artifact exchange under the system temp root, mount point
    /// `/ydb_issues`, service ports 9080 and 1337.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            artifact_root: std::env::temp_dir().join("regress-forge"),
            container_artifact_dir: "/ydb_issues".to_string(),
            ports: vec![PortBinding::same(9080), PortBinding::same(1337)],
            env: Vec::new(),
            network_mode: "bridge".to_string(),
            provision_attempts: 3,
        }
    }

    /// Sets the host artifact root.
    pub fn with_artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifact_root = root.into();
        self
    }

    /// Sets the container-side artifact mount point.
    pub fn with_container_artifact_dir(mut self, dir: impl Into<String>) -> Self {
        self.container_artifact_dir = dir.into();
        self
    }

    /// Replaces the port bindings.
    pub fn with_ports(mut self, ports: Vec<PortBinding>) -> Self {
        self.ports = ports;
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, var: impl Into<String>) -> Self {
        self.env.push(var.into());
        self
    }

    /// Disables network access.
    pub fn without_network(mut self) -> Self {
        self.network_mode = "none".to_string();
        self
    }

    /// Sets the provisioning attempt count. Clamped to at least 1.
    pub fn with_provision_attempts(mut self, attempts: u32) -> Self {
        self.provision_attempts = attempts.max(1);
        self
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::new("download.yottadb.com/yottadb/yottadb-debian:latest")
    }
}

/// Opaque reference to one live execution context.
///
/// At most one handle is active per in-flight issue; it must be released
/// exactly once per run regardless of how the run ends (release itself is
/// idempotent, so a duplicate release is harmless).
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    /// Logical handle id.
    pub id: String,
    /// Backing container id.
    pub container_id: String,
    /// Host-side artifact exchange directory, exclusive to this handle.
    pub artifact_dir: PathBuf,
    /// Mount point of the artifact directory inside the container.
    pub container_artifact_dir: String,
}

/// Raw captured output of one command run inside a sandbox.
#[derive(Debug, Clone)]
pub struct RawExec {
    /// Guest command exit status. Non-zero is valid output, not an error.
    pub exit_status: i64,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// An environment that can provide isolated execution contexts.
#[async_trait]
pub trait SandboxEnvironment: Send + Sync {
    /// Starts an isolated execution context with the configured resource
    /// bindings. Transient failures are retried up to
    /// `config.provision_attempts` before surfacing
    /// [`SandboxError::Provisioning`].
    async fn acquire(&self, config: &SandboxConfig) -> Result<SandboxHandle, SandboxError>;

    /// Executes a command synchronously inside the context.
    ///
    /// Must not fail on a non-zero guest exit status;
    /// [`SandboxError::Transport`] is reserved for commands that could not
    /// be dispatched at all.
    async fn run(&self, handle: &SandboxHandle, command: &[String])
        -> Result<RawExec, SandboxError>;

    /// Tears down the context and releases its bound resources. Idempotent.
    async fn release(&self, handle: &SandboxHandle) -> Result<(), SandboxError>;
}
