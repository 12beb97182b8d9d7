//! Client routing layer and reference node for a wide-column store cluster.
//!
//! [`ClusterClient`] validates and normalizes each operation, encodes it as
//! JSON, picks a node through the [`ReplicaRouter`] and performs exactly one
//! HTTP round trip. [`NodeServer`] is an in-memory node speaking the same
//! protocol, used for local clusters and tests.

pub mod client;
pub mod config;
pub mod error;
pub mod key;
pub mod log;
pub mod metrics;
pub mod protocol;
pub mod repair;
pub mod router;
pub mod server;
pub mod store;
pub mod transport;

pub use client::ClusterClient;
pub use config::ColstoreConfig;
pub use error::{ClientError, DecodeError, TopologyError, TransportError, ValidationError};
pub use key::{Cell, RowAddress};
pub use protocol::{Ack, Operation, OperationKind, Response};
pub use router::{ClusterTopology, NodeEndpoint, ReplicaRouter};
pub use server::NodeServer;
pub use store::TableStore;
pub use transport::{HttpTransport, Transport};
