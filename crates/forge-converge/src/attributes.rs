//! Runtime attributes injected into the converge run.
//!
//! The attribute tree is flattened into `(path, literal)` pairs and written
//! as `node.force_override<path> = <literal>` lines of a recipe in the
//! workspace cookbook.

use std::path::PathBuf;

use forge_core::{Deployment, WorkspaceError};
use serde_json::{Value, json};
use tracing::info;

/// Flatten nested objects into `['a']['b']` paths with quoted literals.
///
/// Only objects are descended into; any other value, arrays included,
/// becomes a single quoted literal.
pub fn flatten(tree: &Value) -> Vec<(String, String)> {
    let mut out = Vec::new();
    walk(tree, String::new(), &mut out);
    out
}

fn walk(value: &Value, prefix: String, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                walk(child, format!("{prefix}['{}']", escape(key)), out);
            }
        }
        Value::String(s) => out.push((prefix, quote(s))),
        Value::Null => out.push((prefix, quote(""))),
        other => out.push((prefix, quote(&other.to_string()))),
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn quote(s: &str) -> String {
    format!("'{}'", escape(s))
}

/// The attribute tree for a deployment.
pub fn runtime_attributes(deployment: &Deployment) -> Value {
    let config = &deployment.config;
    json!({
        "stackforge": {
            "version": config.attributes.release,
            "cluster": deployment.cluster.hosts(),
        },
        "ambari": {
            "repo_version": config.install.manager_version,
            "release_version": "1.0",
        },
        "repo_version": config.install.stack_build,
        "util_repo_version": config.install.utils_version,
        "kerberos_realm": config.attributes.kerberos_realm,
        "kerberos_password": config.attributes.kerberos_password,
        "domain": config.cluster.fqdn_suffix,
        "master_node": deployment.cluster.master().fqdn,
        "volume_device": config.cloud.volume_device,
        "mount_location": config.converge.mount_location,
        "ambari_mysql_password": config.attributes.db_password,
    })
}

/// Write the runtime recipe into the workspace cookbook.
pub fn write_runtime_recipe(deployment: &Deployment) -> Result<PathBuf, WorkspaceError> {
    let path = deployment.workspace.recipe_path(&deployment.config.converge.cookbook);
    let body: String = flatten(&runtime_attributes(deployment))
        .into_iter()
        .map(|(path, literal)| format!("node.force_override{path} = {literal}\n"))
        .collect();

    let io = |source| WorkspaceError::Io {
        path: path.clone(),
        source,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(io)?;
    }
    std::fs::write(&path, body).map_err(io)?;
    info!(recipe = %path.display(), "created runtime recipe");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::testing::{sample_config, three_node_template};
    use forge_core::{Payloads, Workspace};

    #[test]
    fn flattens_nested_objects() {
        let tree = json!({
            "a": { "b": "x", "c": { "d": 3 } },
            "e": true,
        });
        assert_eq!(
            flatten(&tree),
            vec![
                ("['a']['b']".to_string(), "'x'".to_string()),
                ("['a']['c']['d']".to_string(), "'3'".to_string()),
                ("['e']".to_string(), "'true'".to_string()),
            ]
        );
    }

    #[test]
    fn quotes_are_escaped() {
        let pairs = flatten(&json!({ "pw": "it's" }));
        assert_eq!(pairs[0].1, r"'it\'s'");
    }

    #[test]
    fn scalar_root_has_empty_path() {
        assert_eq!(flatten(&json!("v")), vec![(String::new(), "'v'".to_string())]);
        assert!(flatten(&json!({})).is_empty());
    }

    #[test]
    fn recipe_lists_hosts_and_master() {
        let dir = tempfile::tempdir().unwrap();
        let config = sample_config(dir.path()).unwrap();
        let mut cluster = forge_core::Deployment::fresh_cluster(&config, &three_node_template()).unwrap();
        cluster.node_mut("worker1").unwrap().internal_ip = Some("10.0.0.11".to_string());
        let workspace = Workspace::create(&config.paths.deployment_base, "analytics-1").unwrap();
        let deployment = Deployment::new(config, cluster, workspace, Payloads::default());

        let path = write_runtime_recipe(&deployment).unwrap();
        assert!(path.ends_with("cookbooks/stackforge/recipes/runtime.rb"));
        let recipe = std::fs::read_to_string(path).unwrap();
        assert!(recipe.contains("node.force_override['stackforge']['version'] = '1.4'\n"));
        assert!(recipe.contains(
            "node.force_override['stackforge']['cluster']['worker1']['internal_ip'] = '10.0.0.11'\n"
        ));
        assert!(recipe.contains("node.force_override['master_node'] = 'master.analytics.example.org'\n"));
        assert!(recipe.contains("node.force_override['ambari']['release_version'] = '1.0'\n"));
    }
}
