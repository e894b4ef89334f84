//! Retrying remote command execution.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use stratus_core::{Error, Result};

use crate::{RemoteShell, SSH_CONNECT_FAILURE, ShellOutput};

/// How often a failing remote command is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 5,
            delay: Duration::from_secs(30),
        }
    }
}

/// Runs commands on cluster hosts over a [`RemoteShell`].
#[derive(Clone)]
pub struct RemoteExecutor {
    shell: Arc<dyn RemoteShell>,
    policy: RetryPolicy,
}

impl RemoteExecutor {
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            shell,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Run `command` with a forced pseudo-terminal, retrying on failure.
    ///
    /// When every attempt fails and the last one exited 255 the failure is
    /// reported as an authentication problem.
    pub async fn run(&self, host: &str, command: &str) -> Result<()> {
        let status = self
            .retry(host, command, || self.shell.exec(host, command, true))
            .await?;
        match status {
            None => Ok(()),
            Some(SSH_CONNECT_FAILURE) => Err(Error::RemoteAuth {
                host: host.to_string(),
            }),
            Some(code) => Err(Error::RemoteCommand {
                host: host.to_string(),
                code,
            }),
        }
    }

    /// Run `command` once and return its stdout.
    pub async fn run_capture(&self, host: &str, command: &str) -> Result<Vec<u8>> {
        debug!(%host, %command, "capturing remote output");
        let output = self.shell.exec(host, command, false).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(Error::RemoteCommand {
                host: host.to_string(),
                code: output.status,
            })
        }
    }

    /// Run `command` with `input` on its stdin, retrying on failure.
    pub async fn run_with_input(&self, host: &str, command: &str, input: &[u8]) -> Result<()> {
        let status = self
            .retry(host, command, || {
                self.shell.exec_with_input(host, command, input)
            })
            .await?;
        match status {
            None => Ok(()),
            Some(code) => Err(Error::RemoteCommand {
                host: host.to_string(),
                code,
            }),
        }
    }

    /// Whether `host` accepts a remote shell right now.
    pub async fn probe(&self, host: &str) -> bool {
        match self.shell.probe(host).await {
            Ok(reachable) => reachable,
            Err(err) => {
                debug!(%host, error = %err, "probe could not run");
                false
            }
        }
    }

    /// Interactive session on `host`, optionally with a SOCKS forward.
    pub async fn interactive(&self, host: &str, forward: Option<&str>) -> Result<()> {
        match self.shell.interactive(host, forward).await? {
            0 => Ok(()),
            code => Err(Error::RemoteCommand {
                host: host.to_string(),
                code,
            }),
        }
    }

    /// Attempt `attempt` up to `retries + 1` times. Returns `None` on
    /// success or the last exit status once retries are exhausted.
    async fn retry<F>(
        &self,
        host: &str,
        command: &str,
        mut attempt: impl FnMut() -> F,
    ) -> Result<Option<i32>>
    where
        F: std::future::Future<Output = std::io::Result<ShellOutput>>,
    {
        let mut tries = 0;
        loop {
            let output = attempt().await?;
            if output.success() {
                return Ok(None);
            }
            tries += 1;
            if tries > self.policy.retries {
                return Ok(Some(output.status));
            }
            warn!(
                %host,
                %command,
                status = output.status,
                attempt = tries,
                "remote command failed, retrying in {}s",
                self.policy.delay.as_secs()
            );
            tokio::time::sleep(self.policy.delay).await;
        }
    }
}
