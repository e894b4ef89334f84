//! Cluster options: an optional TOML file overridden by flags.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

use stratus_core::ClusterConfig;

#[derive(Args, Debug, Default)]
pub struct ClusterArgs {
    /// TOML file with cluster settings; flags override it
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Number of workers to launch
    #[arg(short = 's', long)]
    pub workers: Option<u32>,

    /// Key pair to use on instances
    #[arg(short = 'k', long)]
    pub key_pair: Option<String>,

    /// SSH private key file for logging into instances
    #[arg(short = 'i', long)]
    pub identity_file: Option<PathBuf>,

    /// Worker instance type
    #[arg(short = 't', long)]
    pub instance_type: Option<String>,

    /// Coordinator instance type (defaults to the worker type)
    #[arg(short = 'm', long)]
    pub coordinator_instance_type: Option<String>,

    /// Provider region
    #[arg(short = 'r', long)]
    pub region: Option<String>,

    /// Availability zone, "all" to spread workers over every zone, or
    /// empty for a random one
    #[arg(short = 'z', long)]
    pub zone: Option<String>,

    /// Image id to launch
    #[arg(short = 'a', long)]
    pub image: Option<String>,

    /// Launch workers as spot instances with this maximum price
    #[arg(long)]
    pub spot_price: Option<f64>,

    /// File passed as user data to every instance
    #[arg(long)]
    pub user_data: Option<PathBuf>,

    /// Existing security group (name or id) every instance also joins
    #[arg(long)]
    pub additional_group: Option<String>,

    /// Delete the cluster's security groups on destroy
    #[arg(long)]
    pub delete_groups: bool,

    /// Launch workers around an existing coordinator
    #[arg(long)]
    pub use_existing_coordinator: bool,

    /// User to ssh in as
    #[arg(short = 'u', long)]
    pub user: Option<String>,

    /// Address range allowed to reach the cluster's ports
    #[arg(long)]
    pub authorized_address: Option<String>,

    /// Local SOCKS proxy ([addr:]port) opened by login
    #[arg(short = 'D')]
    pub proxy_port: Option<String>,

    /// Size in GiB of each durable volume; 0 attaches none
    #[arg(long)]
    pub volume_size: Option<u32>,

    /// Durable volume type
    #[arg(long)]
    pub volume_type: Option<String>,

    /// Durable volumes per instance (at most 8)
    #[arg(long)]
    pub volume_count: Option<u32>,

    /// Swap space to set up per node, in MB
    #[arg(long)]
    pub swap: Option<u32>,

    /// Software version (release) or commit hash
    #[arg(short = 'v', long)]
    pub spark_version: Option<String>,

    /// Repository to fetch commit versions from
    #[arg(long)]
    pub spark_git_repo: Option<String>,

    /// Major version of Hadoop
    #[arg(long)]
    pub hadoop_major_version: Option<String>,

    /// Worker processes per node
    #[arg(long)]
    pub worker_instances: Option<u32>,

    /// Extra options for the coordinator process
    #[arg(long)]
    pub coordinator_opts: Option<String>,

    /// Do not set up cluster monitoring
    #[arg(long)]
    pub no_monitoring: bool,

    /// Command run on the coordinator after configuration is deployed
    #[arg(long)]
    pub setup_command: Option<String>,
}

impl ClusterArgs {
    /// Load the config file if one was given, apply flags on top and
    /// validate the result.
    pub fn into_config(self) -> anyhow::Result<ClusterConfig> {
        let mut config = match &self.config {
            Some(path) => ClusterConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => ClusterConfig::default(),
        };
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn apply(self, config: &mut ClusterConfig) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *slot = value;
            }
        }

        let cluster = &mut config.cluster;
        set(&mut cluster.workers, self.workers);
        set(&mut cluster.instance_type, self.instance_type);
        if self.coordinator_instance_type.is_some() {
            cluster.coordinator_instance_type = self.coordinator_instance_type;
        }
        set(&mut cluster.region, self.region);
        set(&mut cluster.zone, self.zone);
        if self.image.is_some() {
            cluster.image = self.image;
        }
        if self.spot_price.is_some() {
            cluster.spot_price = self.spot_price;
        }
        if self.user_data.is_some() {
            cluster.user_data = self.user_data;
        }
        if self.additional_group.is_some() {
            cluster.additional_group = self.additional_group;
        }
        cluster.delete_groups |= self.delete_groups;
        cluster.reuse_coordinator |= self.use_existing_coordinator;

        let access = &mut config.access;
        if self.key_pair.is_some() {
            access.key_pair = self.key_pair;
        }
        if self.identity_file.is_some() {
            access.identity_file = self.identity_file;
        }
        set(&mut access.user, self.user);
        set(&mut access.authorized_address, self.authorized_address);
        if self.proxy_port.is_some() {
            access.proxy_port = self.proxy_port;
        }

        let storage = &mut config.storage;
        set(&mut storage.volume_size, self.volume_size);
        set(&mut storage.volume_type, self.volume_type);
        set(&mut storage.volume_count, self.volume_count);
        set(&mut storage.swap, self.swap);

        let software = &mut config.software;
        set(&mut software.spark_version, self.spark_version);
        set(&mut software.spark_git_repo, self.spark_git_repo);
        set(&mut software.hadoop_major_version, self.hadoop_major_version);
        set(&mut software.worker_instances, self.worker_instances);
        set(&mut software.coordinator_opts, self.coordinator_opts);
        if self.no_monitoring {
            software.monitoring = false;
        }
        if self.setup_command.is_some() {
            software.setup_command = self.setup_command;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn flags_override_defaults() {
        let args = ClusterArgs {
            workers: Some(5),
            zone: Some("all".into()),
            spot_price: Some(0.1),
            no_monitoring: true,
            delete_groups: true,
            ..ClusterArgs::default()
        };
        let config = args.into_config().unwrap();
        assert_eq!(config.cluster.workers, 5);
        assert_eq!(config.cluster.zone, "all");
        assert_eq!(config.cluster.spot_price, Some(0.1));
        assert!(!config.software.monitoring);
        assert!(config.cluster.delete_groups);
        assert_eq!(config.cluster.instance_type, "m1.large");
    }

    #[test]
    fn flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[cluster]\nworkers = 3\nregion = \"eu-west-1\"\n\n[access]\nkey_pair = \"ops\""
        )
        .unwrap();

        let args = ClusterArgs {
            config: Some(file.path().to_path_buf()),
            workers: Some(7),
            ..ClusterArgs::default()
        };
        let config = args.into_config().unwrap();
        assert_eq!(config.cluster.workers, 7);
        assert_eq!(config.cluster.region, "eu-west-1");
        assert_eq!(config.access.key_pair.as_deref(), Some("ops"));
    }

    #[test]
    fn invalid_volume_count_is_rejected() {
        let args = ClusterArgs {
            volume_count: Some(9),
            ..ClusterArgs::default()
        };
        assert!(args.into_config().is_err());
    }
}
