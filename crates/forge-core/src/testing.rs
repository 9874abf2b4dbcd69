//! Fixtures shared by the test suites of every StackForge crate.

use std::path::Path;

use crate::config::DeployConfig;
use crate::error::ConfigResult;
use crate::template::{ClusterTemplate, NodeGroup};

/// A complete `forge.toml` for a three-node cluster.
pub const SAMPLE_CONFIG: &str = r#"
[cluster]
name = "analytics"
stack_name = "analytics-stack"
ssh_user = "centos"
fqdn_suffix = ".analytics.example.org"
template = "templates/three-node.toml"

[cloud]
image = "centos-7"
external_network_id = "ext-net"
subnet_cidr = "10.10.0.0/24"
dns_nameservers = ["8.8.8.8"]

[cloud.endpoints]
compute = "https://cloud.example.org:8774/v2.1"
network = "https://cloud.example.org:9696"
orchestration = "https://cloud.example.org:8004/v1/project"
volume = "https://cloud.example.org:8776/v3/project"
image = "https://cloud.example.org:9292"

[converge]
agent_package_uri = "https://packages.example.org/chef-12.12.rpm"
tries = 3
log_primary_output = true
cookbook = "stackforge"
mount_location = "/grid/0"
keepalive_interval_secs = 30

[install]
admin_password = "s3cret"
manager_version = "2.5.1.0"
stack_version = "2.6"
stack_build = "2.6.3.0"
utils_version = "1.1.0.21"

[attributes]
release = "1.4"
kerberos_realm = "EXAMPLE.ORG"
kerberos_password = "kpass"
db_password = "dbpass"

[paths]
deployment_base = "/var/lib/stackforge/deployments"
payloads = "/etc/stackforge/payloads"
"#;

/// `SAMPLE_CONFIG` with every filesystem path rooted at `base`.
pub fn sample_config(base: &Path) -> ConfigResult<DeployConfig> {
    let mut config = DeployConfig::parse(SAMPLE_CONFIG)?;
    config.paths.deployment_base = base.join("deployments");
    config.paths.payloads = base.join("payloads");
    Ok(config)
}

/// One primary `master` plus `worker1` and `worker2`.
pub fn three_node_template() -> ClusterTemplate {
    let group = |name: &str, count, volume_size, flavor: &str, host_group: &str| NodeGroup {
        name: name.to_string(),
        count,
        runlist: name.to_string(),
        volume_size,
        flavor: flavor.to_string(),
        host_group: host_group.to_string(),
    };
    ClusterTemplate {
        primary: "master".to_string(),
        groups: vec![
            group("master", 1, 100, "m1.xlarge", "master"),
            group("worker", 2, 500, "m1.large", "workers"),
        ],
    }
}
