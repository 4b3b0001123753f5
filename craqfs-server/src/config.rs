use craqfs_core::{ChainSettings, CraqError, DEFAULT_PROPAGATION_TIMEOUT, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    pub local: LocalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: String,
    pub listen_address: String,
    /// Address peers use to reach this node, when it differs from the bind address.
    #[serde(default)]
    pub advertise_address: Option<String>,
}

impl NodeConfig {
    pub fn effective_address(&self) -> String {
        self.advertise_address
            .clone()
            .unwrap_or_else(|| self.listen_address.clone())
    }
}

/// Ordered chain membership, head first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub nodes: Vec<ClusterNodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNodeConfig {
    pub id: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_factor")]
    pub factor: usize,
    #[serde(default = "default_chain_length")]
    pub chain_length: usize,
    #[serde(default = "default_propagation_timeout_ms")]
    pub propagation_timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            factor: default_factor(),
            chain_length: default_chain_length(),
            propagation_timeout_ms: default_propagation_timeout_ms(),
        }
    }
}

fn default_factor() -> usize {
    1
}

fn default_chain_length() -> usize {
    1
}

fn default_propagation_timeout_ms() -> u64 {
    DEFAULT_PROPAGATION_TIMEOUT.as_millis() as u64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    pub data_path: PathBuf,
    pub max_space_gb: u64,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(
                ::config::Environment::with_prefix("CRAQFS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| CraqError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| CraqError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.id.trim().is_empty() {
            return Err(CraqError::Validation("node.id cannot be empty".to_string()));
        }
        if self.node.listen_address.trim().is_empty() {
            return Err(CraqError::Validation(
                "node.listen_address cannot be empty".to_string(),
            ));
        }
        if self.local.data_path.as_os_str().is_empty() {
            return Err(CraqError::Validation(
                "local.data_path cannot be empty".to_string(),
            ));
        }
        if self.local.max_space_gb == 0 {
            return Err(CraqError::Validation(
                "local.max_space_gb must be greater than zero".to_string(),
            ));
        }

        self.chain_settings().validate()?;

        let nodes = self.chain_nodes();
        if nodes.len() > self.replication.chain_length {
            return Err(CraqError::Validation(format!(
                "cluster lists {} nodes but chain_length is {}",
                nodes.len(),
                self.replication.chain_length
            )));
        }
        if nodes.len() < self.replication.factor {
            return Err(CraqError::Validation(format!(
                "replication factor {} needs at least as many cluster nodes, got {}",
                self.replication.factor,
                nodes.len()
            )));
        }

        let mut seen = HashSet::new();
        for node in &nodes {
            if !seen.insert(node.id.as_str()) {
                return Err(CraqError::Validation(format!(
                    "cluster node '{}' is listed twice",
                    node.id
                )));
            }
        }
        if !seen.contains(self.node.id.as_str()) {
            return Err(CraqError::Validation(format!(
                "node '{}' not found in cluster nodes",
                self.node.id
            )));
        }

        Ok(())
    }

    /// Chain members in order. An empty cluster list is a chain of just this node.
    pub fn chain_nodes(&self) -> Vec<ClusterNodeConfig> {
        if self.cluster.nodes.is_empty() {
            return vec![ClusterNodeConfig {
                id: self.node.id.clone(),
                address: self.node.effective_address(),
            }];
        }
        self.cluster.nodes.clone()
    }

    pub fn chain_settings(&self) -> ChainSettings {
        ChainSettings::new(self.replication.chain_length, self.replication.factor)
            .with_propagation_timeout(Duration::from_millis(
                self.replication.propagation_timeout_ms,
            ))
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.local.max_space_gb.saturating_mul(GIB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("craqfs.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path.to_string_lossy().to_string()
    }

    fn single_node() -> Config {
        Config {
            node: NodeConfig {
                id: "node-1".to_string(),
                listen_address: "127.0.0.1:7000".to_string(),
                advertise_address: None,
            },
            cluster: ClusterConfig::default(),
            replication: ReplicationConfig::default(),
            local: LocalConfig {
                data_path: PathBuf::from("/tmp/craqfs"),
                max_space_gb: 1,
            },
        }
    }

    #[test]
    fn test_load_three_node_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
node:
  id: node-2
  listen_address: 0.0.0.0:7002
  advertise_address: 10.0.0.2:7002
cluster:
  nodes:
    - id: node-1
      address: 10.0.0.1:7001
    - id: node-2
      address: 10.0.0.2:7002
    - id: node-3
      address: 10.0.0.3:7003
replication:
  factor: 3
  chain_length: 3
  propagation_timeout_ms: 1500
local:
  data_path: /var/lib/craqfs
  max_space_gb: 10
"#,
        );

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.node.effective_address(), "10.0.0.2:7002");
        assert_eq!(config.chain_nodes().len(), 3);
        assert_eq!(config.capacity_bytes(), 10 * GIB);

        let settings = config.chain_settings();
        assert_eq!(settings.chain_length, 3);
        assert_eq!(settings.replication_factor, 3);
        assert_eq!(settings.propagation_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_defaults_to_single_node_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
node:
  id: solo
  listen_address: 127.0.0.1:7000
local:
  data_path: ./data
  max_space_gb: 1
"#,
        );

        let config = Config::from_file(&path).unwrap();
        let nodes = config.chain_nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].id, "solo");
        assert_eq!(nodes[0].address, "127.0.0.1:7000");
        assert_eq!(
            config.chain_settings().propagation_timeout,
            DEFAULT_PROPAGATION_TIMEOUT
        );
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let result = Config::from_file("/definitely/not/here/craqfs.yaml");
        assert!(matches!(result, Err(CraqError::Config(_))));
    }

    #[test]
    fn test_validation_rules() {
        assert!(single_node().validate().is_ok());

        let mut config = single_node();
        config.replication.factor = 2;
        assert!(matches!(config.validate(), Err(CraqError::Validation(_))));

        let mut config = single_node();
        config.local.max_space_gb = 0;
        assert!(matches!(config.validate(), Err(CraqError::Validation(_))));

        let mut config = single_node();
        config.cluster.nodes = vec![ClusterNodeConfig {
            id: "someone-else".to_string(),
            address: "10.0.0.9:7000".to_string(),
        }];
        assert!(matches!(config.validate(), Err(CraqError::Validation(_))));

        let mut config = single_node();
        config.replication.chain_length = 2;
        config.cluster.nodes = vec![
            ClusterNodeConfig {
                id: "node-1".to_string(),
                address: "a".to_string(),
            },
            ClusterNodeConfig {
                id: "node-1".to_string(),
                address: "b".to_string(),
            },
        ];
        assert!(matches!(config.validate(), Err(CraqError::Validation(_))));

        let mut config = single_node();
        config.cluster.nodes = vec![
            ClusterNodeConfig {
                id: "node-1".to_string(),
                address: "a".to_string(),
            },
            ClusterNodeConfig {
                id: "node-2".to_string(),
                address: "b".to_string(),
            },
        ];
        assert!(matches!(config.validate(), Err(CraqError::Validation(_))));
    }
}
