//! Node-group template: the shape of a fresh cluster.
//!
//! ```toml
//! primary = "master"
//!
//! [[groups]]
//! name = "master"
//! count = 1
//! runlist = "master"
//! volume_size = 100
//! flavor = "m1.xlarge"
//! host_group = "master"
//!
//! [[groups]]
//! name = "worker"
//! count = 2
//! ...
//! ```

use std::collections::HashSet;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cluster::Node;
use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterTemplate {
    /// Name of the node that hosts the management service.
    pub primary: String,
    pub groups: Vec<NodeGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGroup {
    pub name: String,
    pub count: u32,
    /// Role file applied during convergence (without the `.json` suffix).
    pub runlist: String,
    /// Attached volume size in GB.
    pub volume_size: u32,
    pub flavor: String,
    /// Blueprint host group the nodes are mapped into.
    pub host_group: String,
}

impl ClusterTemplate {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Expand groups into concrete nodes, in template order.
    ///
    /// A single-member group keeps the group name; larger groups are
    /// numbered from 1 (`worker1`, `worker2`, ...).
    pub fn expand(&self, fqdn_suffix: &str) -> ConfigResult<Vec<Node>> {
        // Node names become hostnames.
        let host_label = Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$")
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let mut nodes = Vec::new();
        let mut seen = HashSet::new();

        for group in &self.groups {
            for i in 1..=group.count {
                let name = if group.count == 1 {
                    group.name.clone()
                } else {
                    format!("{}{}", group.name, i)
                };
                if !host_label.is_match(&name) {
                    return Err(ConfigError::Invalid(format!(
                        "node name {name} is not a valid hostname label"
                    )));
                }
                if !seen.insert(name.clone()) {
                    return Err(ConfigError::Invalid(format!("duplicate node name {name}")));
                }
                nodes.push(Node {
                    fqdn: format!("{name}{fqdn_suffix}"),
                    primary: name == self.primary,
                    name,
                    internal_ip: None,
                    floating_ip: None,
                    server_id: None,
                    ram: None,
                    role: group.runlist.clone(),
                    volume_size: group.volume_size,
                    flavor: group.flavor.clone(),
                    host_group: group.host_group.clone(),
                });
            }
        }

        match nodes.iter().filter(|n| n.primary).count() {
            1 => Ok(nodes),
            0 => Err(ConfigError::Invalid(format!(
                "primary node {} is not produced by any group",
                self.primary
            ))),
            n => Err(ConfigError::Invalid(format!("{n} nodes marked primary"))),
        }
    }
}
