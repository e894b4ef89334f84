use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};

use stratus_core::{ClusterConfig, ClusterName};
use stratus_lifecycle::{Action, ActionOutcome, LifecycleController, ShellDeployer, cancelled};
use stratus_provider::{CloudProvider, Ec2Provider};
use stratus_remote::{RemoteExecutor, SshTransport};

use super::prompt::StdinPrompt;

/// How results printed to stdout are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}

fn render_coordinator(format: OutputFormat, cluster_name: &str, address: &str) -> String {
    match format {
        OutputFormat::Text => address.to_string(),
        OutputFormat::Json => serde_json::json!({
            "cluster": cluster_name,
            "coordinator": address,
        })
        .to_string(),
    }
}

/// Wire the EC2 provider, the ssh transport and the shell deployer into a
/// controller and run `action`.
pub async fn execute(
    action: Action,
    cluster_name: &str,
    config: ClusterConfig,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let provider: Arc<dyn CloudProvider> = Arc::new(Ec2Provider::connect(&config.cluster.region).await);
    let shell = Arc::new(SshTransport::new(
        config.access.user.clone(),
        config.access.identity_file.clone(),
    ));
    let executor = RemoteExecutor::new(shell);
    let deployer = Arc::new(ShellDeployer::new(
        executor.clone(),
        config.software.setup_command.clone(),
    ));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(forward_interrupts(cancel_tx));

    let controller = LifecycleController::new(
        config,
        ClusterName::new(cluster_name),
        provider,
        executor,
        deployer,
        Arc::new(StdinPrompt),
    )
    .with_cancel(cancel_rx.clone());

    let mut interrupt = cancel_rx;
    match controller
        .run(action, async move { cancelled(&mut interrupt).await })
        .await
    {
        Ok(ActionOutcome::Completed) => Ok(()),
        Ok(ActionOutcome::Declined) => {
            info!(cluster = %cluster_name, %action, "not confirmed, nothing done");
            Ok(())
        }
        Ok(ActionOutcome::Coordinator(address)) => {
            println!("{}", render_coordinator(format, cluster_name, &address));
            Ok(())
        }
        Err(err) if err.is_clean_abort() => {
            warn!(cluster = %cluster_name, "{err}");
            Ok(())
        }
        Err(err) => {
            let kind = err.kind();
            Err(err).with_context(|| format!("{action} {cluster_name} failed ({kind})"))
        }
    }
}

/// Exit status of a process stopped by SIGINT.
const INTERRUPTED_EXIT: i32 = 130;

/// The first Ctrl-C cancels the running action through `cancel`; a second
/// one exits immediately. Once tokio owns SIGINT the default handler is
/// gone, so this task keeps listening for the rest of the process.
async fn forward_interrupts(cancel: watch::Sender<bool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not listen for Ctrl-C");
        return;
    }
    warn!("interrupted, cancelling; press Ctrl-C again to exit immediately");
    cancel.send_replace(true);
    if tokio::signal::ctrl_c().await.is_ok() {
        std::process::exit(INTERRUPTED_EXIT);
    }
}
