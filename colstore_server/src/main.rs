use clap::{Args, Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;

use colstore_core::config::{ColstoreConfig, Consistency};
use colstore_core::key::{self, Cell};
use colstore_core::log::init_logging;
use colstore_core::metrics::install_prometheus_recorder;
use colstore_core::{ClusterClient, NodeServer};

mod client;

use client::Request;

/// colstore - wide-column cluster client and reference node
#[derive(Parser)]
#[command(name = "colstore_server", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a reference storage node
    Node {
        /// HTTP port
        #[arg(long)]
        port: Option<u16>,
        /// Bind address
        #[arg(long)]
        bind: Option<String>,
        /// Peer node (host:port) for replication and repair, repeatable
        #[arg(long = "peer")]
        peers: Vec<String>,
        /// Replicas that must apply a write: one, quorum or all
        #[arg(long)]
        write_consistency: Option<Consistency>,
        /// Replicas that must answer a read: one, quorum or all
        #[arg(long)]
        read_consistency: Option<Consistency>,
        /// Configuration file (TOML or YAML)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Create a table
    Create {
        table: String,
        /// Partition key names, joined with the key delimiter
        partition_key_names: String,
        /// Clustering key names, joined with the key delimiter
        clustering_key_names: String,
        #[command(flatten)]
        cluster: ClusterArgs,
    },
    /// Read every cell of a row
    Read {
        #[command(flatten)]
        row: RowArgs,
        #[command(flatten)]
        cluster: ClusterArgs,
    },
    /// Write cells into a row
    Insert {
        #[command(flatten)]
        row: RowArgs,
        /// Cell to write as name=value, repeatable; the value may hold any text
        #[arg(long = "cell", value_name = "NAME=VALUE", value_parser = client::parse_cell, required = true)]
        cells: Vec<Cell>,
        #[command(flatten)]
        cluster: ClusterArgs,
    },
    /// Delete a row
    Delete {
        #[command(flatten)]
        row: RowArgs,
        #[command(flatten)]
        cluster: ClusterArgs,
    },
    /// Ask the coordinator to purge expired tombstones
    Repair {
        #[command(flatten)]
        cluster: ClusterArgs,
    },
    /// Ask the coordinator for a cluster-wide anti-entropy pass
    FullRepair {
        #[command(flatten)]
        cluster: ClusterArgs,
    },
    /// Interactive shell
    Shell {
        #[command(flatten)]
        cluster: ClusterArgs,
    },
}

#[derive(Args)]
struct RowArgs {
    table: String,
    /// Partition key components, joined with the key delimiter
    partition_keys: String,
    /// Clustering key components, joined with the key delimiter
    clustering_keys: String,
}

#[derive(Args)]
struct ClusterArgs {
    /// Node endpoints (host:port), comma separated
    #[arg(long)]
    nodes: Option<String>,
    /// Configuration file (TOML or YAML)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Separator between key components
    #[arg(long)]
    delimiter: Option<String>,
    /// Per-call deadline in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

impl ClusterArgs {
    /// File, then environment, then flags
    fn load(&self) -> Result<ColstoreConfig, Box<dyn Error>> {
        let mut config = load_config(self.config.as_ref())?;
        if let Some(nodes) = &self.nodes {
            config.cluster.nodes = nodes
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(delimiter) = &self.delimiter {
            config.keys.delimiter = delimiter.clone();
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.cluster.request_timeout_ms = timeout_ms;
        }
        config.validate().map_err(|errors| errors.join("; "))?;
        Ok(config)
    }
}

impl RowArgs {
    fn split(&self, delimiter: &str) -> (String, Vec<String>, Vec<String>) {
        (
            self.table.clone(),
            key::split_components(&self.partition_keys, delimiter),
            key::split_components(&self.clustering_keys, delimiter),
        )
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ColstoreConfig, Box<dyn Error>> {
    let mut config = match path {
        Some(path) => ColstoreConfig::load(path)?,
        None => ColstoreConfig::default(),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let (config, request) = match cli.command {
        Command::Node {
            port,
            bind,
            peers,
            write_consistency,
            read_consistency,
            config,
        } => {
            let mut config = load_config(config.as_ref())?;
            if let Some(port) = port {
                config.node.port = port;
            }
            if let Some(bind) = bind {
                config.node.bind_address = bind;
            }
            if !peers.is_empty() {
                config.node.peers = peers;
            }
            if let Some(level) = write_consistency {
                config.node.write_consistency = level;
            }
            if let Some(level) = read_consistency {
                config.node.read_consistency = level;
            }
            return run_node(config).await;
        }
        Command::Shell { cluster } => {
            let config = cluster.load()?;
            init_logging(&config.logging)?;
            let client = ClusterClient::from_config(&config)?;
            return client::run_shell(client, config.keys.delimiter).await;
        }
        Command::Create {
            table,
            partition_key_names,
            clustering_key_names,
            cluster,
        } => {
            let config = cluster.load()?;
            let delimiter = &config.keys.delimiter;
            let request = Request::Create {
                table,
                partition_key_names: key::split_components(&partition_key_names, delimiter),
                clustering_key_names: key::split_components(&clustering_key_names, delimiter),
            };
            (config, request)
        }
        Command::Read { row, cluster } => {
            let config = cluster.load()?;
            let (table, partition_keys, clustering_keys) = row.split(&config.keys.delimiter);
            let request = Request::Read {
                table,
                partition_keys,
                clustering_keys,
            };
            (config, request)
        }
        Command::Insert { row, cells, cluster } => {
            let config = cluster.load()?;
            let (table, partition_keys, clustering_keys) = row.split(&config.keys.delimiter);
            let request = Request::Insert {
                table,
                partition_keys,
                clustering_keys,
                cells,
            };
            (config, request)
        }
        Command::Delete { row, cluster } => {
            let config = cluster.load()?;
            let (table, partition_keys, clustering_keys) = row.split(&config.keys.delimiter);
            let request = Request::Delete {
                table,
                partition_keys,
                clustering_keys,
            };
            (config, request)
        }
        Command::Repair { cluster } => (cluster.load()?, Request::Repair),
        Command::FullRepair { cluster } => (cluster.load()?, Request::FullRepair),
    };

    init_logging(&config.logging)?;
    let client = ClusterClient::from_config(&config)?;

    match client::execute(&client, &request).await {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("ERROR ({}): {}", e.kind(), e);
            std::process::exit(1);
        }
    }
}

async fn run_node(config: ColstoreConfig) -> Result<(), Box<dyn Error>> {
    config.validate().map_err(|errors| errors.join("; "))?;
    init_logging(&config.logging)?;
    tracing::info!(
        port = config.node.port,
        gc_grace_seconds = config.node.gc_grace_seconds,
        write_consistency = ?config.node.write_consistency,
        read_consistency = ?config.node.read_consistency,
        "Starting colstore node"
    );

    let metrics = install_prometheus_recorder()?;
    let server = NodeServer::new(config.node)?.with_metrics(metrics);
    server.start().await.map_err(|e| -> Box<dyn Error> { e })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_cells_keep_delimiters_and_spaces() {
        let cli = Cli::try_parse_from([
            "colstore_server",
            "insert",
            "visits",
            "h1,icu",
            "r2",
            "--cell",
            "count=1,000",
            "--cell",
            "note=room 7",
        ])
        .unwrap();
        match cli.command {
            Command::Insert { row, cells, .. } => {
                assert_eq!(row.partition_keys, "h1,icu");
                assert_eq!(cells, vec![Cell::new("count", "1,000"), Cell::new("note", "room 7")]);
            }
            _ => panic!("expected insert"),
        }
    }

    #[test]
    fn test_insert_requires_cells() {
        assert!(Cli::try_parse_from(["colstore_server", "insert", "visits", "h1", "r2"]).is_err());
        assert!(Cli::try_parse_from(["colstore_server", "insert", "visits", "h1", "r2", "--cell", "bare"]).is_err());
    }

    #[test]
    fn test_node_consistency_flags() {
        let cli = Cli::try_parse_from(["colstore_server", "node", "--write-consistency", "quorum"]).unwrap();
        match cli.command {
            Command::Node {
                write_consistency,
                read_consistency,
                ..
            } => {
                assert_eq!(write_consistency, Some(Consistency::Quorum));
                assert_eq!(read_consistency, None);
            }
            _ => panic!("expected node"),
        }
    }
}
