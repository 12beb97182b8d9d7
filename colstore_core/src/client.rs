//! Cluster client: one async method per protocol verb
//!
//! Each call validates its input locally, encodes it, lets the router pick a
//! node and performs exactly one round trip under a deadline. Failures are
//! surfaced as [`ClientError`]; the client never retries and never fails
//! over to another node, since a blind retry of a randomly routed write can
//! duplicate side effects.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ColstoreConfig;
use crate::error::{ClientError, DecodeError, TopologyError, TransportError, ValidationError};
use crate::key::{self, Cell, RowAddress};
use crate::log::log_client_operation;
use crate::metrics::{ClientMetrics, MetricsSummary};
use crate::protocol::{self, Ack, Operation, OperationKind, Response};
use crate::router::{ClusterTopology, NodeEndpoint, ReplicaRouter};
use crate::transport::{HttpTransport, Transport};

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(5);

/// Client for a replica set of symmetric nodes
pub struct ClusterClient<T: Transport = HttpTransport> {
    router: ReplicaRouter,
    transport: Arc<T>,
    metrics: Arc<ClientMetrics>,
    deadline: Duration,
}

impl<T: Transport> Clone for ClusterClient<T> {
    fn clone(&self) -> Self {
        Self {
            router: self.router.clone(),
            transport: Arc::clone(&self.transport),
            metrics: Arc::clone(&self.metrics),
            deadline: self.deadline,
        }
    }
}

impl ClusterClient<HttpTransport> {
    /// HTTP client for the topology and default deadline in `config`
    pub fn from_config(config: &ColstoreConfig) -> Result<Self, TopologyError> {
        let topology = config.topology()?;
        Ok(Self::new(topology, HttpTransport::new()).with_deadline(config.request_timeout()))
    }
}

impl<T: Transport> ClusterClient<T> {
    pub fn new(topology: ClusterTopology, transport: T) -> Self {
        Self::with_router(ReplicaRouter::new(topology), Arc::new(transport))
    }

    /// Build on an existing router, e.g. one shared with other clients
    pub fn with_router(router: ReplicaRouter, transport: Arc<T>) -> Self {
        Self {
            router,
            transport,
            metrics: Arc::new(ClientMetrics::new()),
            deadline: DEFAULT_DEADLINE,
        }
    }

    /// A handle sharing this client's router and transport with a different deadline
    pub fn with_deadline(&self, deadline: Duration) -> Self {
        Self {
            deadline,
            ..self.clone()
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Router handle for runtime membership changes
    pub fn router(&self) -> &ReplicaRouter {
        &self.router
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.metrics.summary()
    }

    /// Define a table schema. Repeating an identical definition is accepted by nodes.
    pub async fn create<P, C>(
        &self,
        table: &str,
        partition_key_names: &[P],
        clustering_key_names: &[C],
    ) -> Result<Ack, ClientError>
    where
        P: AsRef<str>,
        C: AsRef<str>,
    {
        let operation = self.validated(Operation::create(table, partition_key_names, clustering_key_names))?;
        expect_ack(self.execute(&operation).await?)
    }

    /// Read one row from raw key components. An absent row is `Ok(vec![])`.
    pub async fn read<P, C>(&self, table: &str, partition_keys: &[P], clustering_keys: &[C]) -> Result<Vec<Cell>, ClientError>
    where
        P: AsRef<str>,
        C: AsRef<str>,
    {
        let address = self.validated(key::normalize(table, partition_keys, clustering_keys))?;
        self.read_row(&address).await
    }

    /// Read one row. An absent row is `Ok(vec![])`.
    pub async fn read_row(&self, address: &RowAddress) -> Result<Vec<Cell>, ClientError> {
        match self.execute(&Operation::Read(address.clone())).await? {
            Response::Cells(cells) => Ok(cells),
            Response::Ack(_) => Err(DecodeError::Malformed("expected cells in read response".to_string()).into()),
        }
    }

    /// Upsert cells into a row; at least one cell is required
    pub async fn insert(&self, address: &RowAddress, cells: &[Cell]) -> Result<Ack, ClientError> {
        let operation = self.validated(Operation::insert(address.clone(), cells.to_vec()))?;
        expect_ack(self.execute(&operation).await?)
    }

    /// Upsert positionally paired cell names and values
    pub async fn insert_pairs<N, V>(&self, address: &RowAddress, names: &[N], values: &[V]) -> Result<Ack, ClientError>
    where
        N: AsRef<str>,
        V: AsRef<str>,
    {
        let cells = self.validated(Cell::pair(names, values))?;
        self.insert(address, &cells).await
    }

    /// Delete a row; deleting an absent row succeeds
    pub async fn delete(&self, address: &RowAddress) -> Result<Ack, ClientError> {
        expect_ack(self.execute(&Operation::Delete(address.clone())).await?)
    }

    /// Trigger a coordinator-local repair. Returns once the trigger is accepted.
    pub async fn repair(&self) -> Result<Ack, ClientError> {
        expect_ack(self.execute(&Operation::Repair).await?)
    }

    /// Trigger a cluster-wide repair. Returns once the trigger is accepted.
    pub async fn full_repair(&self) -> Result<Ack, ClientError> {
        expect_ack(self.execute(&Operation::FullRepair).await?)
    }

    /// Send an already validated operation to one node
    pub async fn execute(&self, operation: &Operation) -> Result<Response, ClientError> {
        let request = self.validated(protocol::encode(operation))?;
        let kind = request.kind;
        let node = self.router.select(kind).await;
        self.metrics.record_routed(node.as_str());

        let started = Instant::now();
        let result = self.round_trip(&node, kind, request.path, request.body).await;
        let elapsed = started.elapsed();

        log_client_operation(
            kind.as_str(),
            node.as_str(),
            result.is_ok(),
            elapsed,
            result.as_ref().err().map(ClientError::kind),
        );
        self.metrics.record_latency(kind.as_str(), elapsed);
        match &result {
            Ok(_) => self.metrics.record_success(),
            Err(e) => self.metrics.record_failure(e),
        }
        result
    }

    async fn round_trip(
        &self,
        node: &NodeEndpoint,
        kind: OperationKind,
        path: &str,
        body: Vec<u8>,
    ) -> Result<Response, ClientError> {
        let call = self.transport.post(node, path, body, self.deadline);
        let response = match tokio::time::timeout(self.deadline, call).await {
            Ok(response) => response?,
            Err(_) => {
                return Err(TransportError::Timeout {
                    endpoint: node.to_string(),
                }
                .into())
            }
        };

        if !response.is_success() {
            return Err(ClientError::ServerRejected {
                endpoint: node.to_string(),
                status: response.status,
                body: response.body_text(),
            });
        }

        match protocol::decode_response(kind, &response.body) {
            Ok(decoded) => Ok(decoded),
            Err(DecodeError::Empty) if kind == OperationKind::Read => Ok(Response::Cells(Vec::new())),
            Err(e) => Err(e.into()),
        }
    }

    fn validated<V>(&self, result: Result<V, ValidationError>) -> Result<V, ClientError> {
        result.map_err(|e| {
            let err = ClientError::from(e);
            self.metrics.record_failure(&err);
            err
        })
    }
}

fn expect_ack(response: Response) -> Result<Ack, ClientError> {
    match response {
        Response::Ack(ack) => Ok(ack),
        Response::Cells(_) => Err(DecodeError::Malformed("unexpected cells in acknowledgment".to_string()).into()),
    }
}
