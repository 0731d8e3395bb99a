//! In-memory [`ContainerRuntime`] for driving the orchestrator without Docker.
//!
//! `RecordingRuntime` simulates containers, networks, and volumes, records
//! every call in order, and can be told to fail specific operations or to
//! answer specific exec commands.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::runtime::{
    ContainerRef, ContainerRuntime, ContainerSpec, ContainerState,
    ContainerStats, ExecOutput, NetworkRef, PortBinding, RuntimeError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeOp {
    CreateContainer,
    StartContainer,
    StopContainer,
    RestartContainer,
    RemoveContainer,
    Exec,
    Inspect,
    CreateNetwork,
    RemoveNetwork,
    CreateVolume,
    RemoveVolume,
    Stats,
    Logs,
}

/// One recorded runtime call. `target` is the container, network, or volume
/// name (not the id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCall {
    pub op: RuntimeOp,
    pub target: String,
    pub argv: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SimContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub running: bool,
    pub host_port: u16,
    /// Whether the simulated server answers `pg_is_in_recovery()` with `t`.
    /// Replicas start as standbys; `pg_promote()` clears it and touching
    /// `standby.signal` sets it.
    pub standby: bool,
}

#[derive(Debug, Clone)]
struct FailureRule {
    op: RuntimeOp,
    target: String,
    remaining: Option<usize>,
}

#[derive(Debug, Clone)]
struct ExecRule {
    container: String,
    contains: String,
    output: ExecOutput,
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<RuntimeCall>,
    containers: HashMap<String, SimContainer>,
    networks: HashMap<String, String>,
    volumes: HashSet<String>,
    failures: Vec<FailureRule>,
    exec_rules: Vec<ExecRule>,
    next_id: u64,
}

impl State {
    fn name_of(&self, id: &str) -> String {
        self.containers
            .get(id)
            .map(|c| c.spec.name.clone())
            .unwrap_or_else(|| id.to_string())
    }

    fn record(&mut self, op: RuntimeOp, target: &str, argv: &[String]) {
        self.calls.push(RuntimeCall {
            op,
            target: target.to_string(),
            argv: argv.to_vec(),
        });
    }

    fn injected(&mut self, op: RuntimeOp, target: &str) -> Result<(), RuntimeError> {
        let Some(rule) = self
            .failures
            .iter_mut()
            .find(|r| r.op == op && target.ends_with(&r.target) && r.remaining != Some(0))
        else {
            return Ok(());
        };
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        Err(RuntimeError::Other(format!("injected {op:?} failure for {target}")))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingRuntime {
    state: Arc<Mutex<State>>,
}

impl RecordingRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Every call to `op` whose target name ends with `target` fails. Node
    /// names end in `-<ordinal>`, so `"-0"` selects the first node of every
    /// cluster and `""` selects everything.
    pub fn fail_on(&self, op: RuntimeOp, target: &str) {
        self.lock().failures.push(FailureRule {
            op,
            target: target.to_string(),
            remaining: None,
        });
    }

    /// Like [`fail_on`](Self::fail_on) for the next `times` matching calls.
    pub fn fail_times(&self, op: RuntimeOp, target: &str, times: usize) {
        self.lock().failures.push(FailureRule {
            op,
            target: target.to_string(),
            remaining: Some(times),
        });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Exec calls inside a container whose name ends with `container` and
    /// whose joined argv contains `contains` return `output`. Later rules win.
    pub fn respond(&self, container: &str, contains: &str, output: ExecOutput) {
        self.lock().exec_rules.push(ExecRule {
            container: container.to_string(),
            contains: contains.to_string(),
            output,
        });
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, op: RuntimeOp) -> Vec<RuntimeCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    /// Targets of `op` calls in call order.
    pub fn targets(&self, op: RuntimeOp) -> Vec<String> {
        self.calls_for(op).into_iter().map(|c| c.target).collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn containers(&self) -> Vec<SimContainer> {
        let mut containers: Vec<SimContainer> =
            self.lock().containers.values().cloned().collect();
        containers.sort_by(|a, b| a.spec.name.cmp(&b.spec.name));
        containers
    }

    pub fn container_named(&self, name: &str) -> Option<SimContainer> {
        self.lock()
            .containers
            .values()
            .find(|c| c.spec.name == name)
            .cloned()
    }

    pub fn network_count(&self) -> usize {
        self.lock().networks.len()
    }

    pub fn volume_count(&self) -> usize {
        self.lock().volumes.len()
    }

    /// Flips the simulated running flag without recording a call.
    pub fn set_running(&self, name: &str, running: bool) {
        if let Some(container) = self
            .lock()
            .containers
            .values_mut()
            .find(|c| c.spec.name == name)
        {
            container.running = running;
        }
    }

    fn default_exec(container: &SimContainer, joined: &str) -> ExecOutput {
        if !container.running {
            return ExecOutput::failed(1, "container is not running");
        }
        if joined.contains("pg_is_in_recovery") {
            ExecOutput::ok(if container.standby { "t\n" } else { "f\n" })
        } else if joined.contains("pg_promote") {
            ExecOutput::ok("t\n")
        } else if joined.contains("pg_stat_activity") {
            ExecOutput::ok("3\n")
        } else if joined.contains("pg_isready") {
            ExecOutput::ok("localhost:5432 - accepting connections\n")
        } else {
            ExecOutput::ok("")
        }
    }
}

fn not_found(what: &str, id: &str) -> RuntimeError {
    RuntimeError::NotFound(format!("No such {what}: {id}"))
}

#[async_trait]
impl ContainerRuntime for RecordingRuntime {
    async fn create_container(
        &self,
        spec: &ContainerSpec,
    ) -> Result<ContainerRef, RuntimeError> {
        let mut state = self.lock();
        state.record(RuntimeOp::CreateContainer, &spec.name, &[]);
        state.injected(RuntimeOp::CreateContainer, &spec.name)?;
        if state.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(RuntimeError::CommandFailed {
                command: format!("create {}", spec.name),
                code: Some(125),
                stderr: format!("container name {} is already in use", spec.name),
            });
        }
        if let Some(network) = &spec.network
            && !state.networks.values().any(|n| n == network)
        {
            return Err(not_found("network", network));
        }
        state.next_id += 1;
        let id = format!("ctr{:04}", state.next_id);
        let host_port = 40_000 + state.next_id as u16;
        state.containers.insert(
            id.clone(),
            SimContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: false,
                host_port,
                standby: spec.command.is_some(),
            },
        );
        Ok(ContainerRef(id))
    }

    async fn start_container(
        &self,
        container: &ContainerRef,
    ) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        let name = state.name_of(container.as_str());
        state.record(RuntimeOp::StartContainer, &name, &[]);
        state.injected(RuntimeOp::StartContainer, &name)?;
        let sim = state
            .containers
            .get_mut(container.as_str())
            .ok_or_else(|| not_found("container", container.as_str()))?;
        sim.running = true;
        Ok(())
    }

    async fn stop_container(
        &self,
        container: &ContainerRef,
    ) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        let name = state.name_of(container.as_str());
        state.record(RuntimeOp::StopContainer, &name, &[]);
        state.injected(RuntimeOp::StopContainer, &name)?;
        let sim = state
            .containers
            .get_mut(container.as_str())
            .ok_or_else(|| not_found("container", container.as_str()))?;
        sim.running = false;
        Ok(())
    }

    async fn restart_container(
        &self,
        container: &ContainerRef,
    ) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        let name = state.name_of(container.as_str());
        state.record(RuntimeOp::RestartContainer, &name, &[]);
        state.injected(RuntimeOp::RestartContainer, &name)?;
        let sim = state
            .containers
            .get_mut(container.as_str())
            .ok_or_else(|| not_found("container", container.as_str()))?;
        sim.running = true;
        Ok(())
    }

    async fn remove_container(
        &self,
        container: &ContainerRef,
    ) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        let name = state.name_of(container.as_str());
        state.record(RuntimeOp::RemoveContainer, &name, &[]);
        state.injected(RuntimeOp::RemoveContainer, &name)?;
        state
            .containers
            .remove(container.as_str())
            .map(|_| ())
            .ok_or_else(|| not_found("container", container.as_str()))
    }

    async fn exec(
        &self,
        container: &ContainerRef,
        argv: &[String],
    ) -> Result<ExecOutput, RuntimeError> {
        let mut state = self.lock();
        let name = state.name_of(container.as_str());
        state.record(RuntimeOp::Exec, &name, argv);
        state.injected(RuntimeOp::Exec, &name)?;
        let joined = argv.join(" ");
        let scripted = state
            .exec_rules
            .iter()
            .rev()
            .find(|rule| name.ends_with(&rule.container) && joined.contains(&rule.contains))
            .map(|rule| rule.output.clone());
        let sim = state
            .containers
            .get_mut(container.as_str())
            .ok_or_else(|| not_found("container", container.as_str()))?;
        if let Some(output) = scripted {
            return Ok(output);
        }
        let output = Self::default_exec(sim, &joined);
        if output.success() {
            if joined.contains("pg_promote") {
                sim.standby = false;
            } else if joined.contains("standby.signal") {
                sim.standby = true;
            }
        }
        Ok(output)
    }

    async fn inspect_container(
        &self,
        container: &ContainerRef,
    ) -> Result<ContainerState, RuntimeError> {
        let mut state = self.lock();
        let name = state.name_of(container.as_str());
        state.record(RuntimeOp::Inspect, &name, &[]);
        state.injected(RuntimeOp::Inspect, &name)?;
        let sim = state
            .containers
            .get(container.as_str())
            .ok_or_else(|| not_found("container", container.as_str()))?;
        Ok(ContainerState {
            id: sim.id.clone(),
            status: if sim.running { "running" } else { "exited" }.to_string(),
            running: sim.running,
            ports: sim
                .spec
                .published_ports
                .iter()
                .map(|port| PortBinding {
                    container_port: *port,
                    host_port: sim.host_port,
                })
                .collect(),
        })
    }

    async fn create_network(&self, name: &str) -> Result<NetworkRef, RuntimeError> {
        let mut state = self.lock();
        state.record(RuntimeOp::CreateNetwork, name, &[]);
        state.injected(RuntimeOp::CreateNetwork, name)?;
        state.next_id += 1;
        let id = format!("net{:04}", state.next_id);
        state.networks.insert(id.clone(), name.to_string());
        Ok(NetworkRef(id))
    }

    async fn remove_network(&self, network: &NetworkRef) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        let name = state
            .networks
            .get(network.as_str())
            .cloned()
            .unwrap_or_else(|| network.as_str().to_string());
        state.record(RuntimeOp::RemoveNetwork, &name, &[]);
        state.injected(RuntimeOp::RemoveNetwork, &name)?;
        state
            .networks
            .remove(network.as_str())
            .map(|_| ())
            .ok_or_else(|| not_found("network", network.as_str()))
    }

    async fn create_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.record(RuntimeOp::CreateVolume, name, &[]);
        state.injected(RuntimeOp::CreateVolume, name)?;
        state.volumes.insert(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.lock();
        state.record(RuntimeOp::RemoveVolume, name, &[]);
        state.injected(RuntimeOp::RemoveVolume, name)?;
        state.volumes.remove(name);
        Ok(())
    }

    async fn container_stats(
        &self,
        container: &ContainerRef,
    ) -> Result<ContainerStats, RuntimeError> {
        let mut state = self.lock();
        let name = state.name_of(container.as_str());
        state.record(RuntimeOp::Stats, &name, &[]);
        state.injected(RuntimeOp::Stats, &name)?;
        let sim = state
            .containers
            .get(container.as_str())
            .ok_or_else(|| not_found("container", container.as_str()))?;
        Ok(if sim.running {
            ContainerStats {
                cpu_percent: 10.0,
                memory_percent: 5.0,
                memory_usage_bytes: 64 * 1024 * 1024,
            }
        } else {
            ContainerStats::default()
        })
    }

    async fn container_logs(
        &self,
        container: &ContainerRef,
        tail: usize,
    ) -> Result<Vec<String>, RuntimeError> {
        let mut state = self.lock();
        let name = state.name_of(container.as_str());
        state.record(RuntimeOp::Logs, &name, &[tail.to_string()]);
        state.injected(RuntimeOp::Logs, &name)?;
        if !state.containers.contains_key(container.as_str()) {
            return Err(not_found("container", container.as_str()));
        }
        let lines = vec![
            format!("{name} LOG:  database system is ready to accept connections"),
            format!("{name} LOG:  checkpoint complete"),
        ];
        let skip = lines.len().saturating_sub(tail);
        Ok(lines.into_iter().skip(skip).collect())
    }
}
