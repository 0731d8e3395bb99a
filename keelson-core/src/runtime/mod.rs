//! Container Runtime Gateway.
//!
//! Imperative container, network, and volume effects. Implementations hold no
//! domain state and never retry; callers decide what a failure means.

pub mod command;
pub mod docker;

use async_trait::async_trait;
use keelson_model::ResourceLimits;
use thiserror::Error;

pub use docker::DockerCli;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("no such object: {0}")]
    NotFound(String),

    #[error("unexpected runtime output: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

/// Handle to a created container (the runtime's container id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerRef(pub String);

impl ContainerRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to a created network (the runtime's network id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkRef(pub String);

impl NetworkRef {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub volume: String,
    pub target: String,
}

/// Everything needed to create one container.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    /// Overrides the image command when set.
    pub command: Option<Vec<String>>,
    /// Container ports published on an ephemeral host port.
    pub published_ports: Vec<u16>,
    pub volumes: Vec<VolumeMount>,
    pub network: Option<String>,
    pub network_alias: Option<String>,
    pub limits: ResourceLimits,
    pub labels: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub id: String,
    pub status: String,
    pub running: bool,
    pub ports: Vec<PortBinding>,
}

impl ContainerState {
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.ports
            .iter()
            .find(|binding| binding.container_port == container_port)
            .map(|binding| binding.host_port)
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_usage_bytes: u64,
}

/// Result of a command executed inside a container. A non-zero exit code is
/// not an error at this layer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create_container(
        &self,
        spec: &ContainerSpec,
    ) -> Result<ContainerRef, RuntimeError>;
    async fn start_container(
        &self,
        container: &ContainerRef,
    ) -> Result<(), RuntimeError>;
    async fn stop_container(
        &self,
        container: &ContainerRef,
    ) -> Result<(), RuntimeError>;
    async fn restart_container(
        &self,
        container: &ContainerRef,
    ) -> Result<(), RuntimeError>;
    async fn remove_container(
        &self,
        container: &ContainerRef,
    ) -> Result<(), RuntimeError>;
    async fn exec(
        &self,
        container: &ContainerRef,
        argv: &[String],
    ) -> Result<ExecOutput, RuntimeError>;
    async fn inspect_container(
        &self,
        container: &ContainerRef,
    ) -> Result<ContainerState, RuntimeError>;
    async fn create_network(&self, name: &str)
    -> Result<NetworkRef, RuntimeError>;
    async fn remove_network(
        &self,
        network: &NetworkRef,
    ) -> Result<(), RuntimeError>;
    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError>;
    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError>;
    async fn container_stats(
        &self,
        container: &ContainerRef,
    ) -> Result<ContainerStats, RuntimeError>;
    async fn container_logs(
        &self,
        container: &ContainerRef,
        tail: usize,
    ) -> Result<Vec<String>, RuntimeError>;
}
