use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use stratus_lifecycle::Action;

mod commands;

use commands::options::ClusterArgs;
use commands::run::OutputFormat;

#[derive(Parser)]
#[command(
    name = "stratus",
    about = "Stratus: launch and manage compute clusters on EC2",
    version,
    override_usage = "stratus [OPTIONS] <ACTION> <CLUSTER_NAME>"
)]
struct Cli {
    /// launch, destroy, login, stop, start, get-coordinator or reboot-workers
    action: String,

    /// Name of the cluster; its groups are <name>-coordinator and <name>-workers
    cluster_name: String,

    /// Resume installation on a previously launched cluster
    #[arg(long)]
    resume: bool,

    /// Log at debug level
    #[arg(long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Output format for get-coordinator: text or json
    #[arg(long, default_value = "text")]
    format: String,

    #[command(flatten)]
    cluster: ClusterArgs,
}

fn init_tracing(verbose: bool, json: bool) {
    let fallback = if verbose { "debug" } else { "info,stratus=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    let action: Action = cli.action.parse().map_err(anyhow::Error::msg)?;
    let action = match action {
        Action::Launch if cli.resume => Action::Resume,
        other => other,
    };
    let format: OutputFormat = cli.format.parse().map_err(anyhow::Error::msg)?;
    let config = cli.cluster.into_config()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    runtime.block_on(commands::run::execute(action, &cli.cluster_name, config, format))
}
