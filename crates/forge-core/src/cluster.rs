//! Cluster data model and its persisted snapshot.
//!
//! A `Cluster` owns its nodes. Provisioning, convergence and install all
//! borrow nodes mutably and write cloud-assigned identifiers in place, so
//! later phases read what earlier ones recorded.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Classify, ErrorKind};

/// One cluster member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub fqdn: String,
    pub internal_ip: Option<String>,
    pub floating_ip: Option<String>,
    #[serde(default)]
    pub server_id: Option<String>,
    /// Memory of the assigned flavor, in MB.
    pub ram: Option<u64>,
    pub role: String,
    pub volume_size: u32,
    pub flavor: String,
    #[serde(rename = "ambari_group")]
    pub host_group: String,
    pub primary: bool,
}

impl Node {
    pub fn is_populated(&self) -> bool {
        self.server_id.is_some() && self.internal_ip.is_some() && self.floating_ip.is_some()
    }
}

/// SSH identity shared by every node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SshCredentials {
    pub user: String,
    /// Private key file. Unset until a keypair is resolved or generated.
    pub private_key: Option<PathBuf>,
    /// Cloud keypair the servers were booted with.
    pub key_name: Option<String>,
}

/// Everything needed to open a remote session on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub node: String,
    pub address: String,
    pub user: String,
    pub key_path: PathBuf,
}

impl SshTarget {
    /// `None` while the node has no floating address or no key is known.
    pub fn for_node(node: &Node, credentials: &SshCredentials) -> Option<Self> {
        Some(Self {
            node: node.name.clone(),
            address: node.floating_ip.clone()?,
            user: credentials.user.clone(),
            key_path: credentials.private_key.clone()?,
        })
    }
}

/// Errors raised while building, loading or saving a cluster.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to access snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed snapshot: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cluster has no primary node")]
    NoPrimary,

    #[error("cluster has {0} primary nodes, expected exactly one")]
    MultiplePrimaries(usize),

    #[error("duplicate node name {0}")]
    DuplicateNode(String),

    #[error("snapshot master_node {found} does not match primary node {expected}")]
    MasterMismatch { expected: String, found: String },
}

impl Classify for SnapshotError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Config
    }
}

/// Ordered node roster plus shared credentials.
///
/// Exactly one node is primary; it is the master.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub name: String,
    pub credentials: SshCredentials,
    nodes: Vec<Node>,
    master: usize,
}

impl Cluster {
    pub fn new(
        name: impl Into<String>,
        credentials: SshCredentials,
        nodes: Vec<Node>,
    ) -> Result<Self, SnapshotError> {
        let mut seen = HashSet::new();
        for node in &nodes {
            if !seen.insert(node.name.as_str()) {
                return Err(SnapshotError::DuplicateNode(node.name.clone()));
            }
        }

        let primaries: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.primary)
            .map(|(i, _)| i)
            .collect();
        let master = match primaries.as_slice() {
            [i] => *i,
            [] => return Err(SnapshotError::NoPrimary),
            many => return Err(SnapshotError::MultiplePrimaries(many.len())),
        };

        Ok(Self {
            name: name.into(),
            credentials,
            nodes,
            master,
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Nodes for in-place mutation. The roster itself is fixed.
    pub fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.nodes
    }

    /// Credentials and nodes borrowed at once, for per-node tasks.
    pub fn split_mut(&mut self) -> (&SshCredentials, &mut [Node]) {
        (&self.credentials, &mut self.nodes)
    }

    pub fn master(&self) -> &Node {
        &self.nodes[self.master]
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.name == name)
    }

    pub fn ssh_target(&self, node: &Node) -> Option<SshTarget> {
        SshTarget::for_node(node, &self.credentials)
    }

    /// Host list injected into node attributes:
    /// `name -> {fqdn, internal_ip, external_ip}`.
    pub fn hosts(&self) -> serde_json::Value {
        let hosts: BTreeMap<&str, serde_json::Value> = self
            .nodes
            .iter()
            .map(|n| {
                (
                    n.name.as_str(),
                    serde_json::json!({
                        "fqdn": n.fqdn,
                        "internal_ip": n.internal_ip,
                        "external_ip": n.floating_ip,
                    }),
                )
            })
            .collect();
        serde_json::json!(hosts)
    }

    pub fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            ssh_user: self.credentials.user.clone(),
            private_key: self
                .credentials
                .private_key
                .as_ref()
                .map(|p| p.display().to_string()),
            key_name: self.credentials.key_name.clone(),
            cluster_name: self.name.clone(),
            nodes: self.nodes.clone(),
            master_node: self.master().clone(),
        }
    }
}

/// Flat, serializable form of a `Cluster`, used to resume a rebuild.
///
/// `private_key` holds the key file path, not the key material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub ssh_user: String,
    pub private_key: Option<String>,
    pub key_name: Option<String>,
    pub cluster_name: String,
    pub nodes: Vec<Node>,
    pub master_node: Node,
}

impl ClusterSnapshot {
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        let content = std::fs::read_to_string(path).map_err(|source| SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

impl TryFrom<ClusterSnapshot> for Cluster {
    type Error = SnapshotError;

    fn try_from(snapshot: ClusterSnapshot) -> Result<Self, Self::Error> {
        let credentials = SshCredentials {
            user: snapshot.ssh_user,
            private_key: snapshot.private_key.map(PathBuf::from),
            key_name: snapshot.key_name,
        };
        let cluster = Cluster::new(snapshot.cluster_name, credentials, snapshot.nodes)?;
        if cluster.master().name != snapshot.master_node.name {
            return Err(SnapshotError::MasterMismatch {
                expected: cluster.master().name.clone(),
                found: snapshot.master_node.name,
            });
        }
        Ok(cluster)
    }
}
