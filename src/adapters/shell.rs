//! Shell script step actions.
//!
//! Runs `<shell> -c <script>` with the discovered environment applied.
//! Output is passed straight through to the terminal since installs can
//! run for a long time.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

use crate::core::StepAction;
use crate::domain::DiscoveredEnv;

/// Default interpreter for step scripts
pub const DEFAULT_SHELL: &str = "bash";

/// Step action executing a shell script
#[derive(Debug, Clone)]
pub struct ShellAction {
    /// Interpreter invoked with `-c`
    shell: String,

    /// Script body
    script: String,

    /// Optional limit; none by default
    timeout: Option<Duration>,

    /// Capture output instead of inheriting the terminal
    quiet: bool,
}

impl ShellAction {
    /// Create a shell action using the default interpreter
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            shell: DEFAULT_SHELL.to_string(),
            script: script.into(),
            timeout: None,
            quiet: false,
        }
    }

    /// Use a different interpreter
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Kill the script if it runs longer than `limit`
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// Capture output; stderr is included in the error on failure
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    fn command(&self, env: &DiscoveredEnv) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(&self.script).stdin(Stdio::null());
        if self.quiet {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
        cmd.kill_on_drop(true);
        // Own process group, so a timeout can reach everything the script started
        #[cfg(unix)]
        cmd.process_group(0);
        env.apply(&mut cmd);
        cmd
    }
}

/// SIGKILL every process in the group led by `pid`
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let killed = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) == 0 };
    if !killed {
        warn!(pid, error = %std::io::Error::last_os_error(), "Failed to kill script process group");
    }
}

#[async_trait]
impl StepAction for ShellAction {
    async fn execute(&self, env: &DiscoveredEnv) -> Result<()> {
        let child = self
            .command(env)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", self.shell))?;

        let pid = child.id();
        let wait = child.wait_with_output();
        let output = match self.timeout {
            Some(limit) => match timeout(limit, wait).await {
                Ok(output) => output,
                Err(_) => {
                    #[cfg(unix)]
                    if let Some(pid) = pid {
                        kill_process_group(pid);
                    }
                    anyhow::bail!("Script timed out after {:?}", limit);
                }
            },
            None => wait.await,
        }
        .context("Failed to wait for script")?;

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.trim().is_empty() {
                anyhow::bail!("Script failed with exit code {}", exit_code);
            }
            anyhow::bail!(
                "Script failed with exit code {}: {}",
                exit_code,
                stderr.trim()
            );
        }

        Ok(())
    }

    fn describe(&self) -> String {
        let first_line = self.script.lines().next().unwrap_or("").trim();
        format!("{} -c {}", self.shell, first_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_successful_script() {
        let action = ShellAction::new("true").with_shell("sh").quiet();
        assert!(action.execute(&DiscoveredEnv::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let action = ShellAction::new("echo boom >&2; exit 3")
            .with_shell("sh")
            .quiet();

        let err = action
            .execute(&DiscoveredEnv::default())
            .await
            .unwrap_err()
            .to_string();

        assert!(err.contains("exit code 3"), "{}", err);
        assert!(err.contains("boom"), "{}", err);
    }

    #[tokio::test]
    async fn test_discovered_env_is_visible() {
        let env = DiscoveredEnv::new().with_var("VMSETUP_TEST_VAR", "hello");
        let action = ShellAction::new("test \"$VMSETUP_TEST_VAR\" = hello")
            .with_shell("sh")
            .quiet();

        assert!(action.execute(&env).await.is_ok());
    }

    #[tokio::test]
    async fn test_discovered_path_is_searched_first() {
        let temp = tempfile::TempDir::new().unwrap();
        let tool = temp.path().join("vmsetup-fake-tool");
        std::fs::write(&tool, "#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let env = DiscoveredEnv::new().with_path(temp.path());
        let action = ShellAction::new("vmsetup-fake-tool").with_shell("sh").quiet();

        assert!(action.execute(&env).await.is_ok());
        assert!(action.execute(&DiscoveredEnv::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_timeout() {
        let action = ShellAction::new("sleep 5")
            .with_shell("sh")
            .with_timeout(Duration::from_millis(100))
            .quiet();

        let err = action.execute(&DiscoveredEnv::default()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_nested_processes() {
        let temp = tempfile::TempDir::new().unwrap();
        let marker = temp.path().join("late-write");
        let script = format!("sh -c 'sleep 1; touch {}'; true", marker.display());
        let action = ShellAction::new(script)
            .with_shell("sh")
            .with_timeout(Duration::from_millis(200))
            .quiet();

        let err = action.execute(&DiscoveredEnv::default()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));

        tokio::time::sleep(Duration::from_millis(1800)).await;
        assert!(!marker.exists(), "nested process kept running after the timeout");
    }

    #[test]
    fn test_describe_uses_first_line() {
        let action = ShellAction::new("apt-get update\napt-get install -y git");
        assert_eq!(action.describe(), "bash -c apt-get update");
    }
}
