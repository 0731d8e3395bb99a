//! Docker CLI backed [`ContainerRuntime`].
//!
//! Every operation is rendered to a [`CommandSpec`] by a pure builder and then
//! executed through `tokio::process`. Secrets passed as container environment
//! travel through the CLI's own environment (`-e KEY` without a value) so they
//! never show up in argv.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::command::{CommandOutput, CommandSpec, run_spec_with_output};
use super::{
    ContainerRef, ContainerRuntime, ContainerSpec, ContainerState,
    ContainerStats, ExecOutput, NetworkRef, PortBinding, RuntimeError,
};

const STOP_TIMEOUT_SECS: u32 = 30;

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    /// `binary` may also point at a docker-compatible CLI such as `podman`.
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn base(&self) -> CommandSpec {
        CommandSpec::new(&self.binary)
    }

    pub fn create_container_spec(&self, spec: &ContainerSpec) -> CommandSpec {
        let mut cmd = self.base().args(["create", "--name", spec.name.as_str()]);
        if let Some(network) = &spec.network {
            cmd = cmd.args(["--network", network.as_str()]);
        }
        if let Some(alias) = &spec.network_alias {
            cmd = cmd.args(["--network-alias", alias.as_str()]);
        }
        for (key, value) in &spec.env {
            cmd = cmd.args(["-e", key.as_str()]);
            cmd.env.push((key.clone(), value.clone()));
        }
        for port in &spec.published_ports {
            cmd = cmd.args(["-p".to_string(), port.to_string()]);
        }
        for mount in &spec.volumes {
            cmd = cmd
                .args(["-v".to_string(), format!("{}:{}", mount.volume, mount.target)]);
        }
        if spec.limits.cpu_millis > 0 {
            let cpus = spec.limits.cpu_millis as f64 / 1000.0;
            cmd = cmd.args(["--cpus".to_string(), format!("{cpus:.3}")]);
        }
        if spec.limits.memory_bytes > 0 {
            cmd = cmd.args([
                "--memory".to_string(),
                format!("{}b", spec.limits.memory_bytes),
            ]);
        }
        for (key, value) in &spec.labels {
            cmd = cmd.args(["--label".to_string(), format!("{key}={value}")]);
        }
        cmd = cmd.arg(&spec.image);
        if let Some(command) = &spec.command {
            cmd = cmd.args(command.iter().cloned());
        }
        cmd
    }

    pub fn lifecycle_spec(&self, verb: &str, container: &ContainerRef) -> CommandSpec {
        match verb {
            "stop" | "restart" => self.base().args([
                verb.to_string(),
                "--time".to_string(),
                STOP_TIMEOUT_SECS.to_string(),
                container.0.clone(),
            ]),
            "rm" => self.base().args(["rm", "-f", container.as_str()]),
            _ => self.base().args([verb, container.as_str()]),
        }
    }

    pub fn exec_spec(&self, container: &ContainerRef, argv: &[String]) -> CommandSpec {
        self.base()
            .args(["exec", container.as_str()])
            .args(argv.iter().cloned())
    }

    pub fn inspect_spec(&self, container: &ContainerRef) -> CommandSpec {
        self.base().args([
            "inspect",
            "--type",
            "container",
            "--format",
            "{{json .}}",
            container.as_str(),
        ])
    }

    pub fn stats_spec(&self, container: &ContainerRef) -> CommandSpec {
        self.base().args([
            "stats",
            "--no-stream",
            "--format",
            "{{json .}}",
            container.as_str(),
        ])
    }

    pub fn logs_spec(&self, container: &ContainerRef, tail: usize) -> CommandSpec {
        self.base().args([
            "logs".to_string(),
            "--timestamps".to_string(),
            "--tail".to_string(),
            tail.to_string(),
            container.0.clone(),
        ])
    }

    pub fn create_network_spec(&self, name: &str) -> CommandSpec {
        self.base().args([
            "network",
            "create",
            "--driver",
            "bridge",
            "--label",
            "managed-by=keelson",
            name,
        ])
    }

    async fn run_checked(&self, spec: CommandSpec) -> Result<CommandOutput, RuntimeError> {
        let output = run_spec_with_output(&spec).await?;
        if output.success() {
            return Ok(output);
        }
        let stderr = output.stderr.trim().to_string();
        if stderr.contains("No such container")
            || stderr.contains("No such network")
            || stderr.contains("No such volume")
            || stderr.contains("No such object")
        {
            return Err(RuntimeError::NotFound(stderr));
        }
        Err(RuntimeError::CommandFailed {
            command: spec.redacted(),
            code: output.code,
            stderr,
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn create_container(
        &self,
        spec: &ContainerSpec,
    ) -> Result<ContainerRef, RuntimeError> {
        debug!(container = %spec.name, image = %spec.image, "creating container");
        let output = self.run_checked(self.create_container_spec(spec)).await?;
        let id = output.stdout.trim();
        if id.is_empty() {
            return Err(RuntimeError::Parse(
                "docker create printed no container id".into(),
            ));
        }
        Ok(ContainerRef(id.to_string()))
    }

    async fn start_container(
        &self,
        container: &ContainerRef,
    ) -> Result<(), RuntimeError> {
        self.run_checked(self.lifecycle_spec("start", container)).await?;
        Ok(())
    }

    async fn stop_container(
        &self,
        container: &ContainerRef,
    ) -> Result<(), RuntimeError> {
        self.run_checked(self.lifecycle_spec("stop", container)).await?;
        Ok(())
    }

    async fn restart_container(
        &self,
        container: &ContainerRef,
    ) -> Result<(), RuntimeError> {
        self.run_checked(self.lifecycle_spec("restart", container))
            .await?;
        Ok(())
    }

    async fn remove_container(
        &self,
        container: &ContainerRef,
    ) -> Result<(), RuntimeError> {
        self.run_checked(self.lifecycle_spec("rm", container)).await?;
        Ok(())
    }

    async fn exec(
        &self,
        container: &ContainerRef,
        argv: &[String],
    ) -> Result<ExecOutput, RuntimeError> {
        let output = run_spec_with_output(&self.exec_spec(container, argv)).await?;
        Ok(ExecOutput {
            exit_code: output.code.unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn inspect_container(
        &self,
        container: &ContainerRef,
    ) -> Result<ContainerState, RuntimeError> {
        let output = self.run_checked(self.inspect_spec(container)).await?;
        parse_inspect(&output.stdout)
    }

    async fn create_network(&self, name: &str) -> Result<NetworkRef, RuntimeError> {
        let output = self.run_checked(self.create_network_spec(name)).await?;
        Ok(NetworkRef(output.stdout.trim().to_string()))
    }

    async fn remove_network(&self, network: &NetworkRef) -> Result<(), RuntimeError> {
        self.run_checked(self.base().args(["network", "rm", network.as_str()]))
            .await?;
        Ok(())
    }

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.run_checked(self.base().args([
            "volume",
            "create",
            "--label",
            "managed-by=keelson",
            name,
        ]))
        .await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        self.run_checked(self.base().args(["volume", "rm", "-f", name]))
            .await?;
        Ok(())
    }

    async fn container_stats(
        &self,
        container: &ContainerRef,
    ) -> Result<ContainerStats, RuntimeError> {
        let output = self.run_checked(self.stats_spec(container)).await?;
        parse_stats(&output.stdout)
    }

    async fn container_logs(
        &self,
        container: &ContainerRef,
        tail: usize,
    ) -> Result<Vec<String>, RuntimeError> {
        let output = self.run_checked(self.logs_spec(container, tail)).await?;
        // PostgreSQL writes its log to stderr, which `docker logs` replays on
        // stderr as well.
        Ok(merge_log_streams(&output.stdout, &output.stderr))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectDoc {
    id: String,
    state: InspectState,
    #[serde(default)]
    network_settings: Option<InspectNetwork>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    running: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetwork {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<InspectPort>>>>,
}

#[derive(Debug, Deserialize)]
struct InspectPort {
    #[serde(rename = "HostPort")]
    host_port: String,
}

pub fn parse_inspect(raw: &str) -> Result<ContainerState, RuntimeError> {
    let doc: InspectDoc = serde_json::from_str(raw.trim())
        .map_err(|e| RuntimeError::Parse(format!("inspect output: {e}")))?;

    let mut ports = Vec::new();
    if let Some(map) = doc.network_settings.and_then(|n| n.ports) {
        for (key, bindings) in map {
            let Some(container_port) = key
                .split('/')
                .next()
                .and_then(|p| p.parse::<u16>().ok())
            else {
                continue;
            };
            if let Some(host_port) = bindings
                .unwrap_or_default()
                .iter()
                .find_map(|b| b.host_port.parse::<u16>().ok())
            {
                ports.push(PortBinding {
                    container_port,
                    host_port,
                });
            }
        }
    }
    ports.sort_by_key(|b| b.container_port);

    Ok(ContainerState {
        id: doc.id,
        status: doc.state.status,
        running: doc.state.running,
        ports,
    })
}

#[derive(Debug, Deserialize)]
struct StatsDoc {
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    #[serde(rename = "MemPerc")]
    mem_perc: String,
    #[serde(rename = "MemUsage")]
    mem_usage: String,
}

pub fn parse_stats(raw: &str) -> Result<ContainerStats, RuntimeError> {
    let line = raw
        .lines()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| RuntimeError::Parse("empty stats output".into()))?;
    let doc: StatsDoc = serde_json::from_str(line)
        .map_err(|e| RuntimeError::Parse(format!("stats output: {e}")))?;

    let usage = doc.mem_usage.split('/').next().unwrap_or_default();
    Ok(ContainerStats {
        cpu_percent: parse_percent(&doc.cpu_perc)?,
        memory_percent: parse_percent(&doc.mem_perc)?,
        memory_usage_bytes: parse_size(usage)?,
    })
}

fn parse_percent(value: &str) -> Result<f64, RuntimeError> {
    let trimmed = value.trim().trim_end_matches('%');
    if trimmed == "--" {
        return Ok(0.0);
    }
    trimmed
        .parse::<f64>()
        .map_err(|_| RuntimeError::Parse(format!("bad percentage {value:?}")))
}

/// Parses docker's human sizes such as `24.5MiB`, `1.2GB`, or `512B`.
fn parse_size(value: &str) -> Result<u64, RuntimeError> {
    let value = value.trim();
    let split = value
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .trim()
        .parse()
        .map_err(|_| RuntimeError::Parse(format!("bad size {value:?}")))?;
    let multiplier: f64 = match unit.trim() {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "KiB" => 1024.0,
        "MB" => 1e6,
        "MiB" => 1024.0 * 1024.0,
        "GB" => 1e9,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TB" => 1e12,
        "TiB" => 1024.0f64.powi(4),
        other => {
            return Err(RuntimeError::Parse(format!("unknown size unit {other:?}")));
        }
    };
    Ok((number * multiplier).round() as u64)
}

fn merge_log_streams(stdout: &str, stderr: &str) -> Vec<String> {
    let mut lines: Vec<String> = stdout
        .lines()
        .chain(stderr.lines())
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    // `--timestamps` prefixes RFC3339 stamps, so lexical order is time order.
    lines.sort();
    lines
}
