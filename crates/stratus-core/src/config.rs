//! stratus.toml configuration.
//!
//! One explicit structure enumerates every recognized option. It is loaded
//! once (file first, then command-line overrides) and passed by reference
//! into the lifecycle controller; nothing reads options ambiently.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Upper bound on durable volumes attached per instance.
pub const MAX_VOLUMES: u32 = 8;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub cluster: ClusterSection,
    pub access: AccessConfig,
    pub storage: StorageConfig,
    pub software: SoftwareConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    /// Number of workers to launch.
    pub workers: u32,
    pub instance_type: String,
    /// Coordinator instance type; empty means same as `instance_type`.
    pub coordinator_instance_type: Option<String>,
    pub region: String,
    /// Zone name, `all` to spread workers over every zone, or empty to
    /// pick one at random.
    pub zone: String,
    /// Machine image to launch.
    pub image: Option<String>,
    /// Launch workers as spot instances bidding at most this price.
    pub spot_price: Option<f64>,
    /// File whose contents are passed to every instance as user data.
    pub user_data: Option<PathBuf>,
    /// Extra pre-existing group (name or id) every instance joins.
    pub additional_group: Option<String>,
    /// Delete the cluster's groups on destroy.
    pub delete_groups: bool,
    /// Launch fresh workers but start an existing stopped coordinator.
    pub reuse_coordinator: bool,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            workers: 1,
            instance_type: "m1.large".to_string(),
            coordinator_instance_type: None,
            region: "us-east-1".to_string(),
            zone: String::new(),
            image: None,
            spot_price: None,
            user_data: None,
            additional_group: None,
            delete_groups: false,
            reuse_coordinator: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Provider key pair installed on instances.
    pub key_pair: Option<String>,
    /// Private key used for remote-shell connections.
    pub identity_file: Option<PathBuf>,
    /// Remote-shell login user.
    pub user: String,
    /// CIDR allowed through the default ingress rules.
    pub authorized_address: String,
    /// `[address:]port` for a SOCKS proxy on login.
    pub proxy_port: Option<String>,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            key_pair: None,
            identity_file: None,
            user: "root".to_string(),
            authorized_address: "0.0.0.0/0".to_string(),
            proxy_port: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Size of each durable volume in GiB; 0 attaches none.
    pub volume_size: u32,
    pub volume_type: String,
    pub volume_count: u32,
    /// Swap per node in MiB.
    pub swap: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            volume_size: 0,
            volume_type: "standard".to_string(),
            volume_count: 1,
            swap: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SoftwareConfig {
    /// Release `X.Y.Z` or a git commit hash.
    pub spark_version: String,
    pub spark_git_repo: String,
    pub hadoop_major_version: String,
    pub worker_instances: u32,
    pub coordinator_opts: String,
    /// Open the monitoring web port and deploy the monitoring module.
    pub monitoring: bool,
    /// Command run on the coordinator after files are in place.
    pub setup_command: Option<String>,
}

impl Default for SoftwareConfig {
    fn default() -> Self {
        Self {
            spark_version: "1.2.0".to_string(),
            spark_git_repo: "https://github.com/apache/spark".to_string(),
            hadoop_major_version: "1".to_string(),
            worker_instances: 1,
            coordinator_opts: String::new(),
            monitoring: true,
            setup_command: None,
        }
    }
}

/// Credentials required by actions that touch instances over the remote shell.
#[derive(Debug, Clone, Copy)]
pub struct Access<'a> {
    pub key_pair: &'a str,
    pub identity_file: &'a Path,
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ClusterConfig = toml::from_str(&content)
            .map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Checks that hold for every action.
    pub fn validate(&self) -> Result<()> {
        if self.storage.volume_count > MAX_VOLUMES {
            return Err(Error::Configuration(format!(
                "volume count cannot be greater than {MAX_VOLUMES}"
            )));
        }
        if let Some(price) = self.cluster.spot_price {
            if price.is_nan() || price <= 0.0 {
                return Err(Error::Configuration(format!(
                    "spot price must be positive, got {price}"
                )));
            }
        }
        Ok(())
    }

    /// Key pair and identity file, required to launch.
    pub fn require_access(&self) -> Result<Access<'_>> {
        let identity_file = self.access.identity_file.as_deref().ok_or_else(|| {
            Error::Configuration(
                "must provide an identity file (-i) for ssh connections".to_string(),
            )
        })?;
        let key_pair = self.access.key_pair.as_deref().ok_or_else(|| {
            Error::Configuration("must provide a key pair name (-k) to use on instances".to_string())
        })?;
        Ok(Access {
            key_pair,
            identity_file,
        })
    }

    /// Instance type for the coordinator.
    pub fn coordinator_instance_type(&self) -> &str {
        match self.cluster.coordinator_instance_type.as_deref() {
            Some(t) if !t.is_empty() => t,
            _ => &self.cluster.instance_type,
        }
    }

    /// Whether the software version names a release rather than a commit.
    pub fn is_release_version(&self) -> bool {
        self.software.spark_version.contains('.')
    }
}
