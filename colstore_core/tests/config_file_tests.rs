use colstore_core::config::{ColstoreConfig, Consistency, LogFormat, LogLevel};
use colstore_core::ClusterClient;
use std::io::Write;
use std::time::Duration;
use tempfile::{Builder, NamedTempFile};

#[test]
fn test_load_toml_file() {
    let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[cluster]
nodes = ["10.0.0.1:8000", "10.0.0.2:8000"]
request_timeout_ms = 750

[keys]
delimiter = "|"

[node]
port = 9100
peers = ["10.0.0.2:8000"]
gc_grace_seconds = 60
internal_request_timeout_ms = 300
write_consistency = "Quorum"

[logging]
level = "Debug"
format = "Json"
"#
    )
    .unwrap();

    let config = ColstoreConfig::load(file.path()).unwrap();
    assert_eq!(config.cluster.nodes.len(), 2);
    assert_eq!(config.request_timeout(), Duration::from_millis(750));
    assert_eq!(config.keys.delimiter, "|");
    assert_eq!(config.node.port, 9100);
    assert_eq!(config.node.gc_grace(), Duration::from_secs(60));
    assert_eq!(config.node.repair_timeout_ms, 30_000);
    assert_eq!(config.node.internal_request_timeout(), Duration::from_millis(300));
    assert_eq!(config.node.write_consistency, Consistency::Quorum);
    assert_eq!(config.node.read_consistency, Consistency::One);
    assert_eq!(config.logging.level, LogLevel::Debug);
    assert_eq!(config.logging.format, LogFormat::Json);
    assert!(config.validate().is_ok());
}

#[test]
fn test_load_yaml_file() {
    let mut file = Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(
        file,
        r#"
cluster:
  nodes:
    - "127.0.0.1:7000"
keys:
  delimiter: ";"
"#
    )
    .unwrap();

    let config = ColstoreConfig::load(file.path()).unwrap();
    assert_eq!(config.cluster.nodes, vec!["127.0.0.1:7000".to_string()]);
    assert_eq!(config.keys.delimiter, ";");
    assert_eq!(config.cluster.request_timeout_ms, 5000);
}

#[test]
fn test_save_and_reload() {
    let mut config = ColstoreConfig::default();
    config.cluster.nodes = vec!["db1:8000".to_string(), "db2:8000".to_string()];
    config.node.peers = vec!["db2:8000".to_string()];

    let file = NamedTempFile::new().unwrap();
    config.save_to_file(file.path()).unwrap();
    let reloaded = ColstoreConfig::from_file(file.path()).unwrap();

    assert_eq!(reloaded.cluster.nodes, config.cluster.nodes);
    assert_eq!(reloaded.node.peers, config.node.peers);
}

#[test]
fn test_invalid_file_is_an_error() {
    let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[cluster\nnodes = ").unwrap();
    assert!(ColstoreConfig::load(file.path()).is_err());
    assert!(ColstoreConfig::load("/definitely/not/here.toml").is_err());
}

#[tokio::test]
async fn test_client_from_config_uses_file_settings() {
    let mut config = ColstoreConfig::default();
    config.cluster.nodes = vec!["http://127.0.0.1:9001/".to_string(), "127.0.0.1:9002".to_string()];
    config.cluster.request_timeout_ms = 1200;

    let client = ClusterClient::from_config(&config).unwrap();
    assert_eq!(client.deadline(), Duration::from_millis(1200));

    let topology = client.router().snapshot().await;
    assert_eq!(topology.len(), 2);
    assert_eq!(topology.coordinator().as_str(), "127.0.0.1:9001");

    config.cluster.nodes.clear();
    assert!(ClusterClient::from_config(&config).is_err());
}
