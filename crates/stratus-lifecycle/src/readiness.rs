//! Polling instances until they reach a target condition.
//!
//! Waits are unbounded: the loop keeps going with a growing pause
//! (`3 * attempt` seconds) until the condition holds or the cancellation
//! receiver fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use stratus_core::{Error, Instance, InstanceId, InstanceState, Result};
use stratus_provider::CloudProvider;
use stratus_remote::RemoteExecutor;

/// Seconds added to the pause after every attempt.
const BACKOFF_STEP_SECS: u64 = 3;

/// Condition a set of instances is polled into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTarget {
    /// Every instance is in this provider state.
    State(InstanceState),
    /// Every instance is running and accepts a remote shell.
    RemoteShellReady,
}

impl std::fmt::Display for WaitTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaitTarget::State(state) => write!(f, "{state}"),
            WaitTarget::RemoteShellReady => f.write_str("ssh-ready"),
        }
    }
}

/// Polls the provider and probes hosts until a [`WaitTarget`] holds.
#[derive(Clone)]
pub struct ReadinessPoller {
    provider: Arc<dyn CloudProvider>,
    executor: RemoteExecutor,
}

impl ReadinessPoller {
    pub fn new(provider: Arc<dyn CloudProvider>, executor: RemoteExecutor) -> Self {
        Self { provider, executor }
    }

    /// Wait until every instance satisfies `target`.
    ///
    /// Returns the instances as last described, so addresses assigned
    /// while waiting are visible to the caller.
    pub async fn wait_for(
        &self,
        instances: &[Instance],
        target: WaitTarget,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<Vec<Instance>> {
        if instances.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<InstanceId> = instances.iter().map(|i| i.id.clone()).collect();
        info!(instances = ids.len(), "waiting for cluster to enter '{target}' state");

        let mut attempt: u64 = 0;
        loop {
            let pause = Duration::from_secs(BACKOFF_STEP_SECS * attempt);
            tokio::select! {
                () = tokio::time::sleep(pause) => {}
                () = cancelled(cancel) => return Err(Error::Cancelled),
            }

            let current = self.provider.describe_instances(&ids).await?;
            if self.satisfied(&current, target).await {
                info!(attempts = attempt + 1, "cluster is now in '{target}' state");
                return Ok(current);
            }
            debug!(attempt, "cluster not yet in '{target}' state");
            attempt += 1;
        }
    }

    async fn satisfied(&self, instances: &[Instance], target: WaitTarget) -> bool {
        match target {
            WaitTarget::State(state) => instances.iter().all(|i| i.state == state),
            WaitTarget::RemoteShellReady => {
                if !instances.iter().all(|i| i.state == InstanceState::Running) {
                    return false;
                }
                for instance in instances {
                    if !self.executor.probe(instance.address()).await {
                        debug!(host = %instance.address(), "remote shell not reachable yet");
                        return false;
                    }
                }
                true
            }
        }
    }
}

/// Resolves once the receiver reads `true`. A dropped sender can never
/// fire, so the future then stays pending.
pub async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// A receiver that never fires, for waits the operator cannot cancel.
pub fn never_cancelled() -> watch::Receiver<bool> {
    let (_tx, rx) = watch::channel(false);
    rx
}
