//! Process invocation helpers for CLI-backed runtimes.
//!
//! Commands are described as plain data first so the argument layout can be
//! asserted in tests without spawning anything.

use std::fmt::{self, Display};
use std::process::Stdio;

use tokio::process::Command;
use tracing::trace;

use super::RuntimeError;

/// Abstract command representation so we can test without spawning processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// Display raw command string
impl Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.program, self.args.join(" "))
    }
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Rendering safe for logs: values following `-e` flags are masked, and
    /// so is any argument carrying a password assignment or literal.
    pub fn redacted(&self) -> String {
        let mut out = Vec::with_capacity(self.args.len());
        let mut mask_next = false;
        for arg in &self.args {
            if mask_next {
                let key = arg.split_once('=').map(|(k, _)| k).unwrap_or(arg);
                out.push(format!("{key}=***"));
                mask_next = false;
                continue;
            }
            mask_next = arg == "-e" || arg == "--env";
            if carries_password(arg) {
                out.push("***".to_string());
            } else {
                out.push(arg.clone());
            }
        }
        format!("{} {}", self.program, out.join(" "))
    }
}

fn carries_password(arg: &str) -> bool {
    let lower = arg.to_ascii_lowercase();
    lower.contains("password=") || lower.contains("password '")
}

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

pub fn to_command(spec: &CommandSpec) -> Command {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);
    if !spec.env.is_empty() {
        cmd.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

pub async fn run_spec_with_output(
    spec: &CommandSpec,
) -> Result<CommandOutput, RuntimeError> {
    trace!(command = %spec.redacted(), "running runtime command");
    let output =
        to_command(spec)
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                program: spec.program.clone(),
                source,
            })?;
    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}
