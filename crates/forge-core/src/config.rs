//! forge.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    pub cluster: ClusterConfig,
    pub cloud: CloudConfig,
    #[serde(default)]
    pub converge: ConvergeConfig,
    pub install: InstallConfig,
    #[serde(default)]
    pub attributes: AttributeConfig,
    #[serde(default)]
    pub timing: Timing,
    pub paths: PathConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Logical cluster name; prefixes the deployment name.
    pub name: String,
    /// Name of the orchestration stack owned by this deployment.
    pub stack_name: String,
    pub ssh_user: String,
    /// Existing cloud keypair. When unset a keypair is generated.
    pub key_name: Option<String>,
    /// Private key file matching `key_name`.
    pub existing_key_path: Option<PathBuf>,
    /// Domain suffix appended to node names, e.g. `.hdp.example.org`.
    pub fqdn_suffix: String,
    /// Node-group template (TOML).
    pub template: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    pub image: String,
    pub availability_zone: Option<String>,
    pub external_network_id: String,
    pub subnet_cidr: String,
    #[serde(default)]
    pub dns_nameservers: Vec<String>,
    /// CIDR allowed to reach SSH and the web UIs.
    #[serde(default = "default_expose_cidr")]
    pub expose_ui_ssh: String,
    #[serde(default)]
    pub try_existing_network: bool,
    /// Rebuild the servers of an existing stack instead of creating one.
    #[serde(default)]
    pub use_existing_cluster: bool,
    #[serde(default = "default_volume_device")]
    pub volume_device: String,
    /// Environment variable holding a pre-issued API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    pub endpoints: Endpoints,
}

/// Service endpoints of the provisioning API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoints {
    pub compute: String,
    pub network: String,
    pub orchestration: String,
    pub volume: String,
    pub image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergeConfig {
    /// Package URL of the configuration-management agent.
    pub agent_package_uri: String,
    /// Agent release pinned in the generated knife configuration.
    pub agent_version: String,
    /// Attempts per node before its failure becomes fatal.
    pub tries: u32,
    /// Echo the primary node's run output to the operator log.
    pub log_primary_output: bool,
    /// Cookbook that receives the generated runtime attributes.
    pub cookbook: String,
    pub mount_location: String,
    pub keepalive_interval_secs: u64,
}

impl Default for ConvergeConfig {
    fn default() -> Self {
        Self {
            agent_package_uri: String::new(),
            agent_version: "12.12.15".to_string(),
            tries: 3,
            log_primary_output: false,
            cookbook: "stackforge".to_string(),
            mount_location: "/grid/0".to_string(),
            keepalive_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    #[serde(default = "default_install_port")]
    pub port: u16,
    #[serde(default = "default_admin")]
    pub admin_user: String,
    /// Factory credential the service starts with.
    #[serde(default = "default_admin")]
    pub default_password: String,
    /// Credential the admin account is switched to after install.
    pub admin_password: String,
    /// Manager release injected into node attributes.
    pub manager_version: String,
    #[serde(default)]
    pub define_custom_repos: bool,
    #[serde(default = "default_stack_type")]
    pub stack_type: String,
    /// Major stack version, e.g. `2.6`.
    pub stack_version: String,
    /// Full stack build, e.g. `2.6.3.0`.
    pub stack_build: String,
    pub utils_version: String,
    #[serde(default = "default_os_type")]
    pub os_type: String,
    /// Progress above which an unrecognised terminal status counts as success.
    #[serde(default = "default_grace_percent")]
    pub grace_percent: f64,
    pub mysql_root_password: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeConfig {
    pub release: String,
    pub kerberos_realm: String,
    pub kerberos_password: String,
    pub db_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathConfig {
    /// Parent of every per-run deployment directory.
    pub deployment_base: PathBuf,
    /// Cookbook tree copied into the workspace by the staging step.
    pub cookbooks: Option<PathBuf>,
    /// Directory holding blueprint.json, hostmapping.json and repo files.
    pub payloads: PathBuf,
    /// Where the cluster snapshot is written after provisioning.
    pub snapshot: Option<PathBuf>,
}

/// Poll intervals, deadlines and retry budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Attempts for individual provisioning and install API calls.
    pub api_retries: u32,
    pub retry_delay_secs: u64,
    pub stack_poll_secs: u64,
    /// Absolute limit for a stack to leave `CREATE_IN_PROGRESS`.
    pub stack_create_timeout_secs: u64,
    /// Pause between leftover-resource checks, and after install calls.
    pub settle_delay_secs: u64,
    pub settle_checks: u32,
    pub stack_delete_attempts: u32,
    pub server_poll_secs: u64,
    pub rebuild_transition_timeout_secs: u64,
    pub ssh_probe_attempts: u32,
    pub ssh_probe_delay_secs: u64,
    pub ssh_connect_timeout_secs: u64,
    /// Limit for one remote shell command; 0 disables it.
    pub remote_command_timeout_secs: u64,
    pub converge_status_secs: u64,
    pub install_poll_secs: u64,
    pub install_start_delay_secs: u64,
    pub blueprint_attempts: u32,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            api_retries: 5,
            retry_delay_secs: 5,
            stack_poll_secs: 30,
            stack_create_timeout_secs: 3600,
            settle_delay_secs: 5,
            settle_checks: 5,
            stack_delete_attempts: 3,
            server_poll_secs: 5,
            rebuild_transition_timeout_secs: 480,
            ssh_probe_attempts: 50,
            ssh_probe_delay_secs: 5,
            ssh_connect_timeout_secs: 30,
            remote_command_timeout_secs: 1800,
            converge_status_secs: 10,
            install_poll_secs: 5,
            install_start_delay_secs: 20,
            blueprint_attempts: 40,
        }
    }
}

impl Timing {
    /// Same budgets with every wait collapsed to zero (for testing).
    pub fn immediate() -> Self {
        Self {
            retry_delay_secs: 0,
            stack_poll_secs: 0,
            settle_delay_secs: 0,
            server_poll_secs: 0,
            ssh_probe_delay_secs: 0,
            converge_status_secs: 0,
            install_poll_secs: 0,
            install_start_delay_secs: 0,
            ..Self::default()
        }
    }

    /// Policy for a single API call.
    pub fn api_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.api_retries, secs(self.retry_delay_secs))
    }

    pub fn stack_poll(&self) -> Duration {
        secs(self.stack_poll_secs)
    }

    pub fn stack_create_timeout(&self) -> Duration {
        secs(self.stack_create_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        secs(self.settle_delay_secs)
    }

    pub fn server_poll(&self) -> Duration {
        secs(self.server_poll_secs)
    }

    pub fn rebuild_transition_timeout(&self) -> Duration {
        secs(self.rebuild_transition_timeout_secs)
    }

    pub fn ssh_probe_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.ssh_probe_attempts, secs(self.ssh_probe_delay_secs))
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        secs(self.ssh_connect_timeout_secs)
    }

    pub fn remote_command_timeout(&self) -> Duration {
        secs(self.remote_command_timeout_secs)
    }

    pub fn converge_status(&self) -> Duration {
        secs(self.converge_status_secs)
    }

    pub fn install_poll(&self) -> Duration {
        secs(self.install_poll_secs)
    }

    pub fn install_start_delay(&self) -> Duration {
        secs(self.install_start_delay_secs)
    }
}

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn default_expose_cidr() -> String {
    "0.0.0.0/0".to_string()
}

fn default_volume_device() -> String {
    "/dev/vdb".to_string()
}

fn default_token_env() -> String {
    "OS_AUTH_TOKEN".to_string()
}

fn default_true() -> bool {
    true
}

fn default_install_port() -> u16 {
    8443
}

fn default_admin() -> String {
    "admin".to_string()
}

fn default_stack_type() -> String {
    "HDP".to_string()
}

fn default_os_type() -> String {
    "redhat7".to_string()
}

fn default_grace_percent() -> f64 {
    95.0
}

impl DeployConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { message, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let config: DeployConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject missing or contradictory settings.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.cluster.name.trim().is_empty() {
            return Err(ConfigError::Missing("cluster.name"));
        }
        if self.cluster.stack_name.trim().is_empty() {
            return Err(ConfigError::Missing("cluster.stack_name"));
        }
        if self.cluster.key_name.is_some() && self.cluster.existing_key_path.is_none() {
            return Err(ConfigError::Invalid(
                "cluster.key_name is set but cluster.existing_key_path is not".to_string(),
            ));
        }
        if self.cloud.use_existing_cluster && self.cluster.key_name.is_none() {
            return Err(ConfigError::Invalid(
                "rebuilding an existing cluster requires cluster.key_name and cluster.existing_key_path"
                    .to_string(),
            ));
        }
        if self.converge.tries == 0 {
            return Err(ConfigError::Invalid("converge.tries must be at least 1".to_string()));
        }
        if !(0.0..=100.0).contains(&self.install.grace_percent) {
            return Err(ConfigError::Invalid(format!(
                "install.grace_percent must be within 0..=100, got {}",
                self.install.grace_percent
            )));
        }
        Ok(())
    }

    /// Stack names are compared case-insensitively by the cloud.
    pub fn stack_name(&self) -> String {
        self.cluster.stack_name.to_lowercase()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const SAMPLE: &str = crate::testing::SAMPLE_CONFIG;

    #[test]
    fn parse_sample() {
        let config = DeployConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.cluster.name, "analytics");
        assert_eq!(config.install.port, 8443);
        assert_eq!(config.install.grace_percent, 95.0);
        assert_eq!(config.cloud.volume_device, "/dev/vdb");
        assert_eq!(config.timing.stack_poll_secs, 30);
        assert!(!config.cloud.use_existing_cluster);
    }

    #[test]
    fn rebuild_without_key_is_rejected() {
        let text = SAMPLE.replace(
            "subnet_cidr = \"10.10.0.0/24\"",
            "subnet_cidr = \"10.10.0.0/24\"\nuse_existing_cluster = true",
        );
        let err = DeployConfig::parse(&text).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn zero_tries_is_rejected() {
        let text = SAMPLE.replace("tries = 3", "tries = 0");
        assert!(DeployConfig::parse(&text).is_err());
    }

    #[test]
    fn timing_overrides_merge_with_defaults() {
        let text = format!("{SAMPLE}\n[timing]\nstack_poll_secs = 2\n");
        let config = DeployConfig::parse(&text).unwrap();
        assert_eq!(config.timing.stack_poll(), Duration::from_secs(2));
        assert_eq!(config.timing.api_retries, 5);
    }

    #[test]
    fn immediate_timing_has_no_waits() {
        let t = Timing::immediate();
        assert_eq!(t.api_policy().delay, Duration::ZERO);
        assert_eq!(t.rebuild_transition_timeout(), Duration::from_secs(480));
    }
}
