use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::{
    config::NodeConfig,
    error::TopologyError,
    key::RowAddress,
    log::log_node_request,
    metrics::record_node_request,
    protocol::{self, Operation, OperationKind},
    repair::{QuorumError, RepairCoordinator, RepairTrigger, ROW_PATH, SNAPSHOT_PATH, SYNC_PATH},
    router::NodeEndpoint,
    store::{self, CreateOutcome, MergeStats, StoreStats, TableSchema, TableSnapshot, TableStore},
};

type ServeError = Box<dyn std::error::Error + Send + Sync>;

/// Reference storage node speaking the cluster's JSON-over-HTTP protocol
pub struct NodeServer {
    config: NodeConfig,
    store: TableStore,
    repair: RepairCoordinator,
    metrics: Option<PrometheusHandle>,
}

impl NodeServer {
    /// Create a node with an empty store
    pub fn new(config: NodeConfig) -> Result<Self, TopologyError> {
        Self::with_store(config, TableStore::new())
    }

    pub fn with_store(config: NodeConfig, store: TableStore) -> Result<Self, TopologyError> {
        let peers = config
            .peers
            .iter()
            .map(|peer| NodeEndpoint::parse(peer))
            .collect::<Result<Vec<_>, _>>()?;
        let repair = RepairCoordinator::new(store.clone(), peers, &config);
        Ok(Self {
            config,
            store,
            repair,
            metrics: None,
        })
    }

    /// Serve `/metrics` from an installed Prometheus recorder
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn store(&self) -> &TableStore {
        &self.store
    }

    pub fn repair(&self) -> &RepairCoordinator {
        &self.repair
    }

    /// Bind the configured address and serve until the process exits
    pub async fn start(&self) -> Result<(), ServeError> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_address, self.config.port).parse()?;

        tracing::info!(peers = self.repair.peers().len(), "Node listening on {}", addr);

        axum::Server::try_bind(&addr)?
            .serve(self.create_router().into_make_service())
            .await?;

        Ok(())
    }

    /// Serve on an already bound listener
    pub async fn serve(&self, listener: std::net::TcpListener) -> Result<(), ServeError> {
        listener.set_nonblocking(true)?;
        tracing::info!("Node listening on {}", listener.local_addr()?);

        axum::Server::from_tcp(listener)?
            .serve(self.create_router().into_make_service())
            .await?;

        Ok(())
    }

    /// Create the router with all endpoints
    pub fn create_router(&self) -> Router {
        let state = Arc::new(NodeState {
            name: format!("{}:{}", self.config.bind_address, self.config.port),
            store: self.store.clone(),
            repair: self.repair.clone(),
            metrics: self.metrics.clone(),
        });

        let mut router = Router::new();
        for kind in OperationKind::ALL {
            router = router.route(kind.path(), post(operation_handler));
        }

        router
            // Node-to-node anti-entropy
            .route(SNAPSHOT_PATH, post(snapshot_handler))
            .route(SYNC_PATH, post(sync_handler))
            .route(ROW_PATH, post(row_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(state)
    }
}

struct NodeState {
    name: String,
    store: TableStore,
    repair: RepairCoordinator,
    metrics: Option<PrometheusHandle>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    node: String,
    peers: Vec<String>,
    repair_running: bool,
    #[serde(flatten)]
    stats: StoreStats,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// Every client verb goes through here; the path selects the body schema
async fn operation_handler(State(state): State<Arc<NodeState>>, uri: Uri, body: Bytes) -> Response {
    let start = Instant::now();
    let path = uri.path();

    let (operation, response) = match protocol::decode_request(path, &body) {
        Ok(operation) => (operation.kind().as_str(), apply(&state, operation).await),
        Err(e) => {
            let name = OperationKind::from_path(path).map(|k| k.as_str()).unwrap_or("UNKNOWN");
            (name, (StatusCode::BAD_REQUEST, e.to_string()).into_response())
        }
    };

    observe(operation, response.status(), start.elapsed());
    response
}

fn observe(operation: &str, status: StatusCode, elapsed: Duration) {
    log_node_request(operation, status.as_u16(), elapsed);
    record_node_request(operation, status.as_u16(), elapsed);
}

async fn apply(state: &NodeState, operation: Operation) -> Response {
    let now = store::now_nanos();

    match operation {
        Operation::Create {
            table,
            partition_key_names,
            clustering_key_names,
        } => {
            let schema = TableSchema {
                partition_key_names,
                clustering_key_names,
            };
            match state.store.create_table(&table, schema).await {
                Ok(CreateOutcome::Created) => {
                    let replicated = match state.store.schema_snapshot(&table).await {
                        Some(snapshot) => state.repair.replicate_write(snapshot).await.map(|_| ()),
                        None => Ok(()),
                    };
                    match replicated {
                        Ok(()) => (
                            StatusCode::CREATED,
                            format!("Table {} has been successfully created!", table),
                        )
                            .into_response(),
                        Err(e) => unconfirmed(&format!("Table {}", table), e),
                    }
                }
                Ok(CreateOutcome::AlreadyExists) => {
                    (StatusCode::OK, format!("Table {} already exists.", table)).into_response()
                }
                Err(e) => (StatusCode::CONFLICT, e.to_string()).into_response(),
            }
        }
        Operation::Read(address) => {
            if let Err(e) = state.repair.read_repair(&address).await {
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    format!("Read of row {} not confirmed: {}.", address, e),
                )
                    .into_response();
            }
            let cells = state.store.read(&address).await;
            match protocol::encode_read_response(&cells) {
                Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], body).into_response(),
                Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
            }
        }
        Operation::Insert { address, cells } => match state.store.insert(&address, &cells, now).await {
            Ok(()) => match replicate_row(state, &address).await {
                Ok(()) => (
                    StatusCode::OK,
                    format!("Row {} has been successfully written!", address),
                )
                    .into_response(),
                Err(e) => unconfirmed(&format!("Row {}", address), e),
            },
            Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        },
        Operation::Delete(address) => {
            let deleted = state.store.delete(&address, now).await;
            if let Err(e) = replicate_row(state, &address).await {
                return unconfirmed(&format!("Row {}", address), e);
            }
            let message = if deleted {
                format!("Row {} has been deleted.", address)
            } else {
                format!("Row {} does not exist.", address)
            };
            (StatusCode::OK, message).into_response()
        }
        Operation::Repair => repair_response("Repair", state.repair.trigger_local()),
        Operation::FullRepair => repair_response("Full repair", state.repair.trigger_full()),
    }
}

/// Nothing to replicate when the store recorded nothing
async fn replicate_row(state: &NodeState, address: &RowAddress) -> Result<(), QuorumError> {
    match state.store.row_snapshot(address).await {
        Some(snapshot) => state.repair.replicate_write(snapshot).await.map(|_| ()),
        None => Ok(()),
    }
}

/// The write is applied here but too few replicas confirmed it
fn unconfirmed(subject: &str, error: QuorumError) -> Response {
    tracing::warn!(error = %error, "{} not confirmed by enough replicas", subject);
    (
        StatusCode::SERVICE_UNAVAILABLE,
        format!("{} was written locally but not confirmed: {}.", subject, error),
    )
        .into_response()
}

fn repair_response(label: &str, trigger: RepairTrigger) -> Response {
    let message = match trigger {
        RepairTrigger::Started => format!("{} started.", label),
        RepairTrigger::AlreadyRunning => format!("{} already in progress.", label),
    };
    (StatusCode::ACCEPTED, message).into_response()
}

async fn snapshot_handler(State(state): State<Arc<NodeState>>) -> Json<Vec<TableSnapshot>> {
    let start = Instant::now();
    let snapshot = state.store.snapshot().await;
    observe("SNAPSHOT", StatusCode::OK, start.elapsed());
    Json(snapshot)
}

async fn sync_handler(
    State(state): State<Arc<NodeState>>,
    Json(snapshots): Json<Vec<TableSnapshot>>,
) -> Json<MergeStats> {
    let start = Instant::now();
    let stats = state.store.merge(snapshots).await;
    observe("SYNC", StatusCode::OK, start.elapsed());
    Json(stats)
}

async fn row_handler(
    State(state): State<Arc<NodeState>>,
    Json(address): Json<RowAddress>,
) -> Json<Option<TableSnapshot>> {
    let start = Instant::now();
    let row = state.store.row_snapshot(&address).await;
    observe("ROW", StatusCode::OK, start.elapsed());
    Json(row)
}

async fn metrics_handler(State(state): State<Arc<NodeState>>) -> (StatusCode, String) {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "Metrics recorder is not installed.".to_string()),
    }
}

async fn health_handler(State(state): State<Arc<NodeState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        node: state.name.clone(),
        peers: state.repair.peers().iter().map(ToString::to_string).collect(),
        repair_running: state.repair.is_running(),
        stats: state.store.stats().await,
        timestamp: chrono::Utc::now(),
    })
}
