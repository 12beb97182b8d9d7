//! Configuration management for the cluster client and reference node
//!
//! This module provides structured configuration using TOML/YAML files with
//! serde, plus `COLSTORE_*` environment overrides.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::TopologyError;
use crate::router::{ClusterTopology, NodeEndpoint};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ColstoreConfig {
    /// Cluster membership and request deadlines
    pub cluster: ClusterConfig,
    /// Key parsing
    pub keys: KeyConfig,
    /// Reference node settings
    pub node: NodeConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Cluster membership as seen by the client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Node endpoints (host:port); the first one coordinates repairs
    pub nodes: Vec<String>,
    /// Default per-call deadline in milliseconds
    pub request_timeout_ms: u64,
}

/// Key parsing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// Separator between components of a delimited key string
    pub delimiter: String,
}

/// Reference node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Bind address
    pub bind_address: String,
    /// HTTP port
    pub port: u16,
    /// Other nodes that receive full-repair snapshots
    pub peers: Vec<String>,
    /// How long tombstones are kept before a repair may purge them
    pub gc_grace_seconds: u64,
    /// Upper bound for one full-repair pass in milliseconds
    pub repair_timeout_ms: u64,
    /// Deadline for a single node-to-node request in milliseconds
    pub internal_request_timeout_ms: u64,
    /// Replicas that must apply a write before it is acknowledged
    pub write_consistency: Consistency,
    /// Replicas that must answer a read; above `One` the node read-repairs stale peers
    pub read_consistency: Consistency,
}

/// How many replicas, this node included, an operation waits for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// The receiving node alone
    #[default]
    One,
    /// A strict majority of the replica set
    Quorum,
    /// Every replica
    All,
}

impl Consistency {
    /// Replicas required out of `replicas`
    pub fn required(self, replicas: usize) -> usize {
        match self {
            Consistency::One => 1.min(replicas),
            Consistency::Quorum => replicas / 2 + 1,
            Consistency::All => replicas,
        }
    }
}

impl std::str::FromStr for Consistency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "one" => Ok(Consistency::One),
            "quorum" => Ok(Consistency::Quorum),
            "all" => Ok(Consistency::All),
            other => Err(format!("Unknown consistency level: {}", other)),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
    /// Log format
    pub format: LogFormat,
    /// Log file path (optional)
    pub file_path: Option<String>,
    /// Enable console output
    pub console: bool,
    /// File rotation interval
    pub rotation: LogRotationInterval,
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Log format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    /// Simple text format
    Simple,
    /// JSON format
    Json,
    /// Pretty multi-line format
    Pretty,
}

/// Log rotation interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRotationInterval {
    Daily,
    Hourly,
    Never,
}

impl ColstoreConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: ColstoreConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: ColstoreConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Load a file, picking the format from its extension
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_file(path),
            _ => Self::from_file(path),
        }
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Override settings from `COLSTORE_*` environment variables
    pub fn apply_env_overrides(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let vars: HashMap<String, String> = std::env::vars()
            .filter(|(key, _)| key.starts_with("COLSTORE_"))
            .collect();
        self.apply_overrides(&vars)
    }

    /// Override settings from a variable map
    pub fn apply_overrides(&mut self, vars: &HashMap<String, String>) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(nodes) = vars.get("COLSTORE_NODES") {
            self.cluster.nodes = nodes
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(timeout) = vars.get("COLSTORE_REQUEST_TIMEOUT_MS") {
            self.cluster.request_timeout_ms = timeout.parse()?;
        }
        if let Some(delimiter) = vars.get("COLSTORE_KEY_DELIMITER") {
            self.keys.delimiter = delimiter.clone();
        }
        if let Some(port) = vars.get("COLSTORE_NODE_PORT") {
            self.node.port = port.parse()?;
        }
        if let Some(timeout) = vars.get("COLSTORE_INTERNAL_TIMEOUT_MS") {
            self.node.internal_request_timeout_ms = timeout.parse()?;
        }
        if let Some(level) = vars.get("COLSTORE_WRITE_CONSISTENCY") {
            self.node.write_consistency = level.parse()?;
        }
        if let Some(level) = vars.get("COLSTORE_READ_CONSISTENCY") {
            self.node.read_consistency = level.parse()?;
        }
        if let Some(level) = vars.get("COLSTORE_LOG_LEVEL") {
            self.logging.level = match level.to_lowercase().as_str() {
                "error" => LogLevel::Error,
                "warn" => LogLevel::Warn,
                "info" => LogLevel::Info,
                "debug" => LogLevel::Debug,
                "trace" => LogLevel::Trace,
                other => return Err(format!("Unknown log level: {}", other).into()),
            };
        }
        Ok(())
    }

    /// Validate configuration, collecting every problem
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Validate cluster config
        if let Err(e) = self.topology() {
            errors.push(format!("Cluster nodes: {}", e));
        }
        if self.cluster.request_timeout_ms == 0 {
            errors.push("Request timeout cannot be 0".to_string());
        }

        // Validate key config
        if self.keys.delimiter.is_empty() {
            errors.push("Key delimiter cannot be empty".to_string());
        }

        // Validate node config
        if self.node.port == 0 {
            errors.push("Node port cannot be 0".to_string());
        }
        for peer in &self.node.peers {
            if NodeEndpoint::parse(peer).is_err() {
                errors.push(format!("Invalid peer endpoint: {}", peer));
            }
        }
        if self.node.internal_request_timeout_ms == 0 {
            errors.push("Internal request timeout cannot be 0".to_string());
        }

        // A read repair makes two node-to-node rounds inside one client call.
        let internal = self.node.internal_request_timeout_ms;
        let deadline = self.cluster.request_timeout_ms;
        if internal > 0 && deadline > 0 && internal.saturating_mul(2) >= deadline {
            errors.push(format!(
                "Internal request timeout ({} ms) must be less than half the request timeout ({} ms)",
                internal, deadline
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Parsed cluster topology
    pub fn topology(&self) -> Result<ClusterTopology, TopologyError> {
        ClusterTopology::parse(&self.cluster.nodes)
    }

    /// Get duration for the default request deadline
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.request_timeout_ms)
    }
}

impl NodeConfig {
    /// Get duration for tombstone retention
    pub fn gc_grace(&self) -> Duration {
        Duration::from_secs(self.gc_grace_seconds)
    }

    /// Get duration for a full-repair pass
    pub fn repair_timeout(&self) -> Duration {
        Duration::from_millis(self.repair_timeout_ms)
    }

    /// Get duration for one node-to-node request
    pub fn internal_request_timeout(&self) -> Duration {
        Duration::from_millis(self.internal_request_timeout_ms)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: (8000..8004).map(|port| format!("127.0.0.1:{}", port)).collect(),
            request_timeout_ms: 5000,
        }
    }
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            delimiter: ",".to_string(),
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 8000,
            peers: Vec::new(),
            gc_grace_seconds: 864_000, // 10 days
            repair_timeout_ms: 30_000,
            internal_request_timeout_ms: 2_000,
            write_consistency: Consistency::One,
            read_consistency: Consistency::One,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Simple,
            file_path: None,
            console: true,
            rotation: LogRotationInterval::Never,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ColstoreConfig::default();
        assert_eq!(config.cluster.nodes.len(), 4);
        assert_eq!(config.cluster.nodes[0], "127.0.0.1:8000");
        assert_eq!(config.keys.delimiter, ",");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ColstoreConfig::default();
        config.cluster.nodes.clear();
        config.cluster.request_timeout_ms = 0;
        config.keys.delimiter.clear();
        config.node.peers.push("nowhere".to_string());

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.contains(&"Request timeout cannot be 0".to_string()));
        assert!(errors.contains(&"Invalid peer endpoint: nowhere".to_string()));
    }

    #[test]
    fn test_internal_timeout_must_fit_in_deadline() {
        let mut config = ColstoreConfig::default();
        config.cluster.request_timeout_ms = 3000;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Internal request timeout (2000 ms)"));

        config.node.internal_request_timeout_ms = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_consistency_levels() {
        assert_eq!(Consistency::One.required(4), 1);
        assert_eq!(Consistency::Quorum.required(4), 3);
        assert_eq!(Consistency::Quorum.required(3), 2);
        assert_eq!(Consistency::All.required(4), 4);
        assert_eq!(Consistency::Quorum.required(1), 1);
        assert_eq!("QUORUM".parse::<Consistency>(), Ok(Consistency::Quorum));
        assert!("most".parse::<Consistency>().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = ColstoreConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: ColstoreConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.cluster.nodes, deserialized.cluster.nodes);
        assert_eq!(config.node.gc_grace_seconds, deserialized.node.gc_grace_seconds);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: ColstoreConfig = toml::from_str(
            r#"
            [cluster]
            nodes = ["10.0.0.1:9000"]
            "#,
        )
        .unwrap();
        assert_eq!(config.cluster.nodes, vec!["10.0.0.1:9000".to_string()]);
        assert_eq!(config.cluster.request_timeout_ms, 5000);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn test_overrides() {
        let mut config = ColstoreConfig::default();
        let mut vars = HashMap::new();
        vars.insert("COLSTORE_NODES".to_string(), "a:1, b:2,".to_string());
        vars.insert("COLSTORE_REQUEST_TIMEOUT_MS".to_string(), "250".to_string());
        vars.insert("COLSTORE_LOG_LEVEL".to_string(), "DEBUG".to_string());
        config.apply_overrides(&vars).unwrap();

        assert_eq!(config.cluster.nodes, vec!["a:1".to_string(), "b:2".to_string()]);
        assert_eq!(config.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.logging.level, LogLevel::Debug);

        vars.insert("COLSTORE_WRITE_CONSISTENCY".to_string(), "all".to_string());
        config.apply_overrides(&vars).unwrap();
        assert_eq!(config.node.write_consistency, Consistency::All);

        vars.insert("COLSTORE_REQUEST_TIMEOUT_MS".to_string(), "soon".to_string());
        assert!(config.apply_overrides(&vars).is_err());
    }

    #[test]
    fn test_duration_conversions() {
        let config = ColstoreConfig::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.node.gc_grace(), Duration::from_secs(864_000));
        assert_eq!(config.node.internal_request_timeout(), Duration::from_secs(2));
    }
}
