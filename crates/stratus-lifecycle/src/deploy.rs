//! Handing a ready cluster to the deployment collaborator.
//!
//! The orchestrator only decides *when* deployment happens (after every
//! host accepts a remote shell) and *what* it is told: the host lists,
//! the cluster URL and a flat map of template variables. What is done
//! with them is up to the [`Deployer`].

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use tracing::info;

use stratus_core::{ClusterConfig, Error, Instance, Result, catalog};
use stratus_remote::RemoteExecutor;

/// Port the coordinator's cluster manager listens on.
pub const CLUSTER_PORT: u16 = 7077;

/// File on the coordinator the template variables are written to.
pub const ENV_FILE: &str = "~/stratus-env.sh";

/// Generates the cluster key on the coordinator unless one exists.
const KEY_SETUP: &str = "[ -f ~/.ssh/id_rsa ] || \
    (ssh-keygen -q -t rsa -N '' -f ~/.ssh/id_rsa && \
     cat ~/.ssh/id_rsa.pub >> ~/.ssh/authorized_keys)";

/// Everything the deployment collaborator needs about a ready cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentPlan {
    pub coordinators: Vec<String>,
    pub workers: Vec<String>,
    pub cluster_url: String,
    pub variables: BTreeMap<String, String>,
    /// Create the cluster key on the coordinator and copy it to workers.
    pub generate_ssh_key: bool,
}

impl DeploymentPlan {
    /// Build the plan for `coordinators` and `workers`.
    ///
    /// The first coordinator is the active one.
    pub fn build(
        config: &ClusterConfig,
        coordinators: &[Instance],
        workers: &[Instance],
        generate_ssh_key: bool,
    ) -> Result<Self> {
        let coordinator_hosts: Vec<String> =
            coordinators.iter().map(|i| i.address().to_string()).collect();
        let worker_hosts: Vec<String> = workers.iter().map(|i| i.address().to_string()).collect();
        let active = coordinator_hosts
            .first()
            .cloned()
            .ok_or_else(|| Error::ClusterNotFound("no coordinator to deploy to".into()))?;
        let cluster_url = format!("{active}:{CLUSTER_PORT}");

        let disks = catalog::local_disk_count(&config.cluster.instance_type);
        let software = &config.software;

        let mut variables = BTreeMap::new();
        let mut set = |key: &str, value: String| {
            variables.insert(key.to_string(), value);
        };
        set("coordinator_list", coordinator_hosts.join("\n"));
        set("active_coordinator", active);
        set("worker_list", worker_hosts.join("\n"));
        set("cluster_url", cluster_url.clone());
        set("hdfs_data_dirs", mount_dirs(disks, "ephemeral-hdfs/data"));
        set("mapred_local_dirs", mount_dirs(disks, "hadoop/mrlocal"));
        set("spark_local_dirs", mount_dirs(disks, "spark"));
        set("swap", config.storage.swap.to_string());
        set("modules", modules(config).join("\n"));
        set("spark_version", software_version(config));
        set("hadoop_major_version", software.hadoop_major_version.clone());
        set("spark_worker_instances", software.worker_instances.to_string());
        set("coordinator_opts", software.coordinator_opts.clone());

        Ok(Self {
            coordinators: coordinator_hosts,
            workers: worker_hosts,
            cluster_url,
            variables,
            generate_ssh_key,
        })
    }

    pub fn active_coordinator(&self) -> &str {
        self.coordinators.first().map_or("", String::as_str)
    }

    /// Variables rendered as a sourceable `KEY=value` file.
    pub fn env_file(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.variables {
            out.push_str(&key.to_uppercase());
            out.push('=');
            out.push_str(&shell_quote(value));
            out.push('\n');
        }
        out
    }
}

/// `/mnt/<suffix>` followed by `/mnt<i>/<suffix>` for each further disk.
fn mount_dirs(disks: u32, suffix: &str) -> String {
    let mut dirs = vec![format!("/mnt/{suffix}")];
    dirs.extend((2..=disks).map(|i| format!("/mnt{i}/{suffix}")));
    dirs.join(",")
}

fn modules(config: &ClusterConfig) -> Vec<&'static str> {
    let mut modules = vec![
        "spark",
        "ephemeral-hdfs",
        "persistent-hdfs",
        "mapreduce",
        "spark-standalone",
        "tachyon",
    ];
    if config.software.hadoop_major_version == "1" {
        modules.retain(|m| *m != "mapreduce");
    }
    if config.software.monitoring {
        modules.push("ganglia");
    }
    modules
}

/// Release versions are used as given (without a `v` prefix); anything
/// else is a commit in the configured repository.
fn software_version(config: &ClusterConfig) -> String {
    let version = &config.software.spark_version;
    if config.is_release_version() {
        version.trim_start_matches('v').to_string()
    } else {
        format!("{}|{}", config.software.spark_git_repo, version)
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Boxed future returned by [`Deployer::deploy`].
pub type DeployFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// Deploys software onto a cluster whose hosts all accept a remote shell.
pub trait Deployer: Send + Sync {
    fn deploy<'a>(&'a self, plan: &'a DeploymentPlan) -> DeployFuture<'a>;
}

/// Default deployer: distributes the cluster key, writes the variables to
/// [`ENV_FILE`] on the coordinator, then runs the setup command there.
#[derive(Clone)]
pub struct ShellDeployer {
    executor: RemoteExecutor,
    setup_command: Option<String>,
}

impl ShellDeployer {
    pub fn new(executor: RemoteExecutor, setup_command: Option<String>) -> Self {
        Self {
            executor,
            setup_command,
        }
    }

    async fn distribute_key(&self, plan: &DeploymentPlan) -> Result<()> {
        let coordinator = plan.active_coordinator();
        info!(host = %coordinator, "generating cluster ssh key on coordinator");
        self.executor.run(coordinator, KEY_SETUP).await?;
        let archive = self.executor.run_capture(coordinator, "tar c .ssh").await?;
        info!(workers = plan.workers.len(), "transferring cluster ssh key to workers");
        for worker in &plan.workers {
            self.executor.run_with_input(worker, "tar x", &archive).await?;
        }
        Ok(())
    }
}

impl Deployer for ShellDeployer {
    fn deploy<'a>(&'a self, plan: &'a DeploymentPlan) -> DeployFuture<'a> {
        Box::pin(async move {
            if plan.generate_ssh_key {
                self.distribute_key(plan).await?;
            }
            let coordinator = plan.active_coordinator();
            info!(host = %coordinator, "deploying configuration to coordinator");
            self.executor
                .run_with_input(coordinator, &format!("cat > {ENV_FILE}"), plan.env_file().as_bytes())
                .await?;
            if let Some(command) = &self.setup_command {
                info!(host = %coordinator, "running setup on coordinator");
                self.executor.run(coordinator, command).await?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stratus_core::InstanceState;
    use stratus_remote::{ScriptedShell, ShellCall};

    fn host(address: &str) -> Instance {
        Instance {
            id: format!("i-{address}"),
            state: InstanceState::Running,
            instance_type: "m1.large".into(),
            public_address: address.into(),
            private_address: String::new(),
            zone: "a".into(),
            groups: vec![],
            spot_request_id: None,
        }
    }

    #[test]
    fn plan_derives_url_and_host_lists() {
        let config = ClusterConfig::default();
        let plan = DeploymentPlan::build(
            &config,
            &[host("c1")],
            &[host("w1"), host("w2")],
            true,
        )
        .unwrap();
        assert_eq!(plan.cluster_url, "c1:7077");
        assert_eq!(plan.variables["worker_list"], "w1\nw2");
        assert_eq!(plan.variables["active_coordinator"], "c1");
        assert_eq!(plan.variables["swap"], "1024");
    }

    #[test]
    fn local_dirs_follow_disk_count() {
        let mut config = ClusterConfig::default();
        config.cluster.instance_type = "m1.large".into();
        let plan = DeploymentPlan::build(&config, &[host("c1")], &[], false).unwrap();
        assert_eq!(plan.variables["spark_local_dirs"], "/mnt/spark,/mnt2/spark");
        assert_eq!(
            plan.variables["hdfs_data_dirs"],
            "/mnt/ephemeral-hdfs/data,/mnt2/ephemeral-hdfs/data"
        );
    }

    #[test]
    fn modules_depend_on_hadoop_version_and_monitoring() {
        let mut config = ClusterConfig::default();
        config.software.hadoop_major_version = "1".into();
        config.software.monitoring = false;
        let listed = modules(&config);
        assert!(!listed.contains(&"mapreduce"));
        assert!(!listed.contains(&"ganglia"));

        config.software.hadoop_major_version = "2".into();
        config.software.monitoring = true;
        let listed = modules(&config);
        assert!(listed.contains(&"mapreduce"));
        assert_eq!(listed.last(), Some(&"ganglia"));
    }

    #[test]
    fn commit_versions_name_the_repository() {
        let mut config = ClusterConfig::default();
        config.software.spark_version = "v1.2.0".into();
        assert_eq!(software_version(&config), "1.2.0");

        config.software.spark_version = "abc123".into();
        config.software.spark_git_repo = "https://example.com/spark".into();
        assert_eq!(software_version(&config), "https://example.com/spark|abc123");
    }

    #[test]
    fn env_file_quotes_values() {
        let config = ClusterConfig::default();
        let plan = DeploymentPlan::build(&config, &[host("c1")], &[host("w1")], false).unwrap();
        let env = plan.env_file();
        assert!(env.contains("CLUSTER_URL='c1:7077'\n"));
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[test]
    fn plan_without_coordinator_fails() {
        let config = ClusterConfig::default();
        assert!(DeploymentPlan::build(&config, &[], &[host("w1")], false).is_err());
    }

    #[tokio::test]
    async fn shell_deployer_copies_key_then_writes_env() {
        let shell = Arc::new(ScriptedShell::new());
        shell.set_stdout(b"ssh-archive".to_vec());
        let mut config = ClusterConfig::default();
        config.software.setup_command = Some("./setup.sh".into());
        let plan = DeploymentPlan::build(&config, &[host("c1")], &[host("w1"), host("w2")], true)
            .unwrap();
        let deployer = ShellDeployer::new(
            RemoteExecutor::new(shell.clone()),
            config.software.setup_command.clone(),
        );

        deployer.deploy(&plan).await.unwrap();

        let calls = shell.calls();
        let hosts: Vec<&str> = calls.iter().map(ShellCall::host).collect();
        assert_eq!(hosts, vec!["c1", "c1", "w1", "w2", "c1", "c1"]);
        assert!(matches!(
            &calls[2],
            ShellCall::ExecWithInput { command, input, .. }
                if command == "tar x" && input == b"ssh-archive"
        ));
        assert!(matches!(
            &calls[5],
            ShellCall::Exec { command, .. } if command == "./setup.sh"
        ));
    }

    #[tokio::test]
    async fn shell_deployer_skips_key_when_not_requested() {
        let shell = Arc::new(ScriptedShell::new());
        let plan = DeploymentPlan::build(&ClusterConfig::default(), &[host("c1")], &[host("w1")], false)
            .unwrap();
        ShellDeployer::new(RemoteExecutor::new(shell.clone()), None)
            .deploy(&plan)
            .await
            .unwrap();
        let calls = shell.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(
            &calls[0],
            ShellCall::ExecWithInput { command, .. } if command == "cat > ~/stratus-env.sh"
        ));
    }
}
