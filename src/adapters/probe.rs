//! Environment probe: installed tool versions for the run summary.
//!
//! Read-only. A tool that cannot be queried is reported as not found;
//! probing never fails.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::domain::DiscoveredEnv;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Tools reported when a pipeline does not list its own
pub const DEFAULT_TOOLS: &[&str] = &["git", "docker", "node", "npm", "ruby", "python3", "go", "rustc"];

/// How to ask a tool for its version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolProbe {
    /// Display name
    pub name: String,

    /// Executable to run (defaults to `name`)
    #[serde(default)]
    pub command: Option<String>,

    /// Arguments (defaults to `--version`)
    #[serde(default = "default_args")]
    pub args: Vec<String>,
}

fn default_args() -> Vec<String> {
    vec!["--version".to_string()]
}

impl ToolProbe {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: None,
            args: default_args(),
        }
    }

    pub fn with_command(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.command = Some(command.into());
        self.args = args;
        self
    }

    fn program(&self) -> &str {
        self.command.as_deref().unwrap_or(&self.name)
    }
}

/// Version report for one tool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolVersion {
    pub name: String,

    /// First line of the tool's version output, or None if not found
    pub version: Option<String>,
}

impl fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{:<10} {}", self.name, version),
            None => write!(f, "{:<10} not found", self.name),
        }
    }
}

/// Queries a fixed set of tools
#[derive(Debug, Clone)]
pub struct EnvironmentProbe {
    tools: Vec<ToolProbe>,
}

impl Default for EnvironmentProbe {
    fn default() -> Self {
        Self::new(DEFAULT_TOOLS.iter().map(|name| ToolProbe::new(*name)).collect())
    }
}

impl EnvironmentProbe {
    pub fn new(tools: Vec<ToolProbe>) -> Self {
        Self { tools }
    }

    /// Probe a pipeline's tools, falling back to the defaults
    pub fn for_tools(tools: &[ToolProbe]) -> Self {
        if tools.is_empty() {
            Self::default()
        } else {
            Self::new(tools.to_vec())
        }
    }

    pub fn tools(&self) -> &[ToolProbe] {
        &self.tools
    }

    /// Query every tool, in order
    pub async fn probe(&self, env: &DiscoveredEnv) -> Vec<ToolVersion> {
        let mut versions = Vec::with_capacity(self.tools.len());
        for tool in &self.tools {
            versions.push(ToolVersion {
                name: tool.name.clone(),
                version: query_version(tool, env).await,
            });
        }
        versions
    }
}

async fn query_version(tool: &ToolProbe, env: &DiscoveredEnv) -> Option<String> {
    let mut cmd = Command::new(tool.program());
    cmd.args(&tool.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    env.apply(&mut cmd);

    let output = match timeout(PROBE_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            debug!(tool = %tool.name, error = %e, "Tool not runnable");
            return None;
        }
        Err(_) => {
            debug!(tool = %tool.name, "Version query timed out");
            return None;
        }
    };

    if !output.status.success() {
        debug!(tool = %tool.name, status = ?output.status.code(), "Version query failed");
        return None;
    }

    first_line(&output.stdout).or_else(|| first_line(&output.stderr))
}

/// First non-empty trimmed line
fn first_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_line() {
        assert_eq!(
            first_line(b"\n  ruby 3.3.0 (2023-12-25)\nextra\n"),
            Some("ruby 3.3.0 (2023-12-25)".to_string())
        );
        assert_eq!(first_line(b"   \n"), None);
    }

    #[tokio::test]
    async fn test_missing_tool_is_not_found() {
        let probe = EnvironmentProbe::new(vec![ToolProbe::new("vmsetup-no-such-tool")]);
        let versions = probe.probe(&DiscoveredEnv::default()).await;

        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version, None);
        assert!(versions[0].to_string().contains("not found"));
    }

    #[tokio::test]
    async fn test_version_from_stdout() {
        let probe = EnvironmentProbe::new(vec![ToolProbe::new("echo-tool")
            .with_command("sh", vec!["-c".to_string(), "echo 'tool 1.2.3'".to_string()])]);
        let versions = probe.probe(&DiscoveredEnv::default()).await;

        assert_eq!(versions[0].version, Some("tool 1.2.3".to_string()));
    }

    #[tokio::test]
    async fn test_version_from_stderr_when_stdout_empty() {
        let probe = EnvironmentProbe::new(vec![ToolProbe::new("java-like")
            .with_command("sh", vec!["-c".to_string(), "echo 'openjdk 21' >&2".to_string()])]);
        let versions = probe.probe(&DiscoveredEnv::default()).await;

        assert_eq!(versions[0].version, Some("openjdk 21".to_string()));
    }

    #[tokio::test]
    async fn test_failing_tool_is_not_found() {
        let probe = EnvironmentProbe::new(vec![ToolProbe::new("broken")
            .with_command("sh", vec!["-c".to_string(), "echo oops; exit 1".to_string()])]);
        let versions = probe.probe(&DiscoveredEnv::default()).await;

        assert_eq!(versions[0].version, None);
    }

    #[test]
    fn test_for_tools_defaults() {
        assert_eq!(EnvironmentProbe::for_tools(&[]).tools().len(), DEFAULT_TOOLS.len());
        assert_eq!(
            EnvironmentProbe::for_tools(&[ToolProbe::new("git")]).tools().len(),
            1
        );
    }
}
