//! Orchestration template generation.
//!
//! The template describes the whole cluster footprint: networking (either
//! created by the stack or passed in as parameters), one security group,
//! and per node a port, floating IP, server, volume and attachment.

use std::path::Path;

use forge_core::{DeployConfig, Node, WorkspaceError};
use serde_json::{Map, Value, json};

const TEMPLATE_VERSION: &str = "2013-05-23";
const SECURITY_GROUP: &str = "sf_security_group";
const NETWORK: &str = "sf_network";
const SUBNET: &str = "sf_subnet";
const ROUTER: &str = "sf_router";
const ROUTER_INTERFACE: &str = "sf_router_interface";

/// Ports opened to the exposure CIDR: SSH and the service web UIs.
const EXPOSED_PORTS: &[u16] = &[22, 8088, 8188, 8480, 9995, 18080, 19888, 50070];

/// Inputs the template depends on.
#[derive(Debug, Clone)]
pub struct TemplateSettings {
    pub image: String,
    pub key_name: String,
    pub external_network_id: String,
    pub subnet_cidr: String,
    pub dns_nameservers: Vec<String>,
    pub expose_cidr: String,
    pub availability_zone: Option<String>,
    pub volume_device: String,
    /// Port of the management UI, also exposed.
    pub management_port: u16,
}

impl TemplateSettings {
    pub fn from_config(config: &DeployConfig, key_name: &str) -> Self {
        Self {
            image: config.cloud.image.clone(),
            key_name: key_name.to_string(),
            external_network_id: config.cloud.external_network_id.clone(),
            subnet_cidr: config.cloud.subnet_cidr.clone(),
            dns_nameservers: config.cloud.dns_nameservers.clone(),
            expose_cidr: config.cloud.expose_ui_ssh.clone(),
            availability_zone: config.cloud.availability_zone.clone(),
            volume_device: config.cloud.volume_device.clone(),
            management_port: config.install.port,
        }
    }
}

/// Network the nodes attach to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkPlan {
    /// Network, subnet, router and interface are created by the stack.
    SelfContained,
    /// Reuse a network and subnet that already exist in the project.
    Existing { network_id: String, subnet_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HeatTemplate {
    doc: Value,
}

impl HeatTemplate {
    pub fn generate(settings: &TemplateSettings, nodes: &[Node], plan: &NetworkPlan) -> Self {
        let mut parameters = Map::new();
        parameters.insert("image".into(), string_param(&settings.image));
        parameters.insert("key_name".into(), string_param(&settings.key_name));
        parameters.insert("public_network".into(), string_param(&settings.external_network_id));

        let mut resources = Map::new();
        match plan {
            NetworkPlan::SelfContained => {
                resources.insert(NETWORK.into(), json!({
                    "type": "OS::Neutron::Net",
                    "properties": { "name": NETWORK },
                }));
                resources.insert(SUBNET.into(), json!({
                    "type": "OS::Neutron::Subnet",
                    "properties": {
                        "network_id": { "get_resource": NETWORK },
                        "cidr": settings.subnet_cidr,
                        "enable_dhcp": true,
                        "dns_nameservers": settings.dns_nameservers,
                    },
                    "depends_on": NETWORK,
                }));
                resources.insert(ROUTER.into(), json!({
                    "type": "OS::Neutron::Router",
                    "properties": {
                        "external_gateway_info": { "network": { "get_param": "public_network" } },
                    },
                }));
                resources.insert(ROUTER_INTERFACE.into(), json!({
                    "type": "OS::Neutron::RouterInterface",
                    "properties": {
                        "router_id": { "get_resource": ROUTER },
                        "subnet_id": { "get_resource": SUBNET },
                    },
                    "depends_on": [ROUTER, SUBNET],
                }));
            }
            NetworkPlan::Existing {
                network_id,
                subnet_id,
            } => {
                parameters.insert("private_network".into(), string_param(network_id));
                parameters.insert("private_subnet".into(), string_param(subnet_id));
            }
        }

        resources.insert(SECURITY_GROUP.into(), security_group(settings));

        for node in nodes {
            let name = &node.name;
            let size_param = format!("{name}_node_volume_size");
            parameters.insert(size_param.clone(), json!({
                "type": "number",
                "default": node.volume_size,
                "description": format!("Size of volume to attach to {name}"),
            }));

            resources.insert(format!("public_port_{name}"), port(name, plan));
            resources.insert(format!("floating_ip_{name}"), json!({
                "type": "OS::Neutron::FloatingIP",
                "properties": {
                    "floating_network_id": { "get_param": "public_network" },
                    "port_id": { "get_resource": format!("public_port_{name}") },
                },
                "depends_on": format!("public_port_{name}"),
            }));

            let mut server = json!({
                "type": "OS::Nova::Server",
                "properties": {
                    "name": name,
                    "flavor": node.flavor,
                    "image": { "get_param": "image" },
                    "key_name": { "get_param": "key_name" },
                    "networks": [{ "port": { "get_resource": format!("public_port_{name}") } }],
                },
                "depends_on": format!("public_port_{name}"),
            });
            let mut volume = json!({
                "type": "OS::Cinder::Volume",
                "properties": {
                    "name": format!("volume_{name}"),
                    "size": { "get_param": size_param },
                },
            });
            if let Some(zone) = &settings.availability_zone {
                server["properties"]["availability_zone"] = json!(zone);
                volume["properties"]["availability_zone"] = json!(zone);
            }
            resources.insert(name.clone(), server);
            resources.insert(format!("volume_{name}"), volume);
            resources.insert(format!("volume_attachment_{name}"), json!({
                "type": "OS::Cinder::VolumeAttachment",
                "properties": {
                    "instance_uuid": { "get_resource": name },
                    "volume_id": { "get_resource": format!("volume_{name}") },
                    "mountpoint": settings.volume_device,
                },
                "depends_on": [name, format!("volume_{name}")],
            }));
        }

        Self {
            doc: json!({
                "heat_template_version": TEMPLATE_VERSION,
                "description": "StackForge cluster",
                "parameters": parameters,
                "resources": resources,
            }),
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.doc
    }

    /// Number of resources with the given type, e.g. `OS::Nova::Server`.
    pub fn count(&self, resource_type: &str) -> usize {
        self.resources()
            .filter(|(_, r)| r["type"] == resource_type)
            .count()
    }

    pub fn resources(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.doc["resources"].as_object().into_iter().flatten()
    }

    /// Write the template next to the deployment's other artifacts.
    pub fn write(&self, path: &Path) -> Result<(), WorkspaceError> {
        let body = serde_json::to_string_pretty(&self.doc).map_err(|source| WorkspaceError::Payload {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, body).map_err(|source| WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn string_param(default: &str) -> Value {
    json!({ "type": "string", "default": default })
}

fn port(name: &str, plan: &NetworkPlan) -> Value {
    let port_name = format!("public_port_{name}");
    match plan {
        NetworkPlan::SelfContained => json!({
            "type": "OS::Neutron::Port",
            "properties": {
                "name": port_name,
                "network_id": { "get_resource": NETWORK },
                "fixed_ips": [{ "subnet_id": { "get_resource": SUBNET } }],
                "security_groups": [{ "get_resource": SECURITY_GROUP }],
            },
            "depends_on": [SECURITY_GROUP, ROUTER_INTERFACE],
        }),
        NetworkPlan::Existing { .. } => json!({
            "type": "OS::Neutron::Port",
            "properties": {
                "name": port_name,
                "network_id": { "get_param": "private_network" },
                "fixed_ips": [{ "subnet_id": { "get_param": "private_subnet" } }],
                "security_groups": [{ "get_resource": SECURITY_GROUP }],
            },
            "depends_on": [SECURITY_GROUP],
        }),
    }
}

fn security_group(settings: &TemplateSettings) -> Value {
    let mut rules = vec![
        json!({ "direction": "ingress", "remote_ip_prefix": settings.subnet_cidr }),
        json!({ "direction": "egress", "remote_ip_prefix": "0.0.0.0/0" }),
    ];
    let mut ports: Vec<u16> = EXPOSED_PORTS.to_vec();
    ports.push(settings.management_port);
    ports.sort_unstable();
    ports.dedup();
    rules.extend(ports.into_iter().map(|p| {
        json!({
            "protocol": "tcp",
            "direction": "ingress",
            "remote_ip_prefix": settings.expose_cidr,
            "port_range_min": p,
            "port_range_max": p,
        })
    }));
    json!({
        "type": "OS::Neutron::SecurityGroup",
        "properties": {
            "name": SECURITY_GROUP,
            "description": "Cluster ingress for SSH and service UIs",
            "rules": rules,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TemplateSettings {
        TemplateSettings {
            image: "centos-7".to_string(),
            key_name: "analytics-1".to_string(),
            external_network_id: "ext-net".to_string(),
            subnet_cidr: "10.10.0.0/24".to_string(),
            dns_nameservers: vec!["8.8.8.8".to_string()],
            expose_cidr: "192.0.2.0/24".to_string(),
            availability_zone: None,
            volume_device: "/dev/vdb".to_string(),
            management_port: 8443,
        }
    }

    fn nodes() -> Vec<Node> {
        ["master", "worker1", "worker2"]
            .iter()
            .enumerate()
            .map(|(i, name)| Node {
                name: name.to_string(),
                fqdn: format!("{name}.example.org"),
                internal_ip: None,
                floating_ip: None,
                server_id: None,
                ram: None,
                role: "r".to_string(),
                volume_size: 100,
                flavor: "m1.large".to_string(),
                host_group: "g".to_string(),
                primary: i == 0,
            })
            .collect()
    }

    #[test]
    fn self_contained_template_has_one_network_triple() {
        let t = HeatTemplate::generate(&settings(), &nodes(), &NetworkPlan::SelfContained);
        assert_eq!(t.count("OS::Nova::Server"), 3);
        assert_eq!(t.count("OS::Neutron::FloatingIP"), 3);
        assert_eq!(t.count("OS::Cinder::Volume"), 3);
        assert_eq!(t.count("OS::Cinder::VolumeAttachment"), 3);
        assert_eq!(t.count("OS::Neutron::Net"), 1);
        assert_eq!(t.count("OS::Neutron::Subnet"), 1);
        assert_eq!(t.count("OS::Neutron::Router"), 1);
        assert_eq!(t.count("OS::Neutron::SecurityGroup"), 1);
    }

    #[test]
    fn existing_network_is_passed_as_parameters() {
        let plan = NetworkPlan::Existing {
            network_id: "net-1".to_string(),
            subnet_id: "sub-1".to_string(),
        };
        let t = HeatTemplate::generate(&settings(), &nodes(), &plan);
        assert_eq!(t.count("OS::Neutron::Net"), 0);
        assert_eq!(t.count("OS::Neutron::Router"), 0);
        let doc = t.as_value();
        assert_eq!(doc["parameters"]["private_subnet"]["default"], "sub-1");
        assert_eq!(
            doc["resources"]["public_port_worker1"]["properties"]["network_id"]["get_param"],
            "private_network"
        );
    }

    #[test]
    fn security_group_exposes_ssh_and_ui_ports() {
        let t = HeatTemplate::generate(&settings(), &nodes(), &NetworkPlan::SelfContained);
        let rules = t.as_value()["resources"][SECURITY_GROUP]["properties"]["rules"]
            .as_array()
            .unwrap()
            .clone();
        let exposed: Vec<u64> = rules
            .iter()
            .filter(|r| r["remote_ip_prefix"] == "192.0.2.0/24")
            .filter_map(|r| r["port_range_min"].as_u64())
            .collect();
        assert!(exposed.contains(&22));
        assert!(exposed.contains(&8443));
        assert_eq!(exposed.len(), EXPOSED_PORTS.len() + 1);
    }

    #[test]
    fn availability_zone_applies_to_servers_and_volumes() {
        let mut s = settings();
        s.availability_zone = Some("nova-az1".to_string());
        let t = HeatTemplate::generate(&s, &nodes(), &NetworkPlan::SelfContained);
        let doc = t.as_value();
        assert_eq!(doc["resources"]["master"]["properties"]["availability_zone"], "nova-az1");
        assert_eq!(doc["resources"]["volume_master"]["properties"]["availability_zone"], "nova-az1");
        assert_eq!(doc["parameters"]["worker2_node_volume_size"]["default"], 100);
    }
}
