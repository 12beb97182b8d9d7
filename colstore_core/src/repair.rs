//! Peer synchronization for a node: write propagation and repair passes
//!
//! Every accepted write is pushed to all peers at once as a one-row
//! snapshot, and the node's write consistency decides how many of them must
//! apply it. Reads above consistency `One` fetch the row from the peers,
//! merge the replies and push the result back to stale replicas. A local
//! repair purges tombstones older than the grace period. A full repair pulls
//! every peer's snapshot, merges it, pushes the merged state back and then
//! purges locally. Only one repair pass runs at a time; triggers that arrive
//! meanwhile are acknowledged and dropped.

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::{Consistency, NodeConfig};
use crate::key::RowAddress;
use crate::metrics::record_replication;
use crate::router::NodeEndpoint;
use crate::store::{self, MergeStats, TableSnapshot, TableStore};

pub const SNAPSHOT_PATH: &str = "/internal/snapshot";
pub const SYNC_PATH: &str = "/internal/sync";
pub const ROW_PATH: &str = "/internal/row";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairTrigger {
    Started,
    AlreadyRunning,
}

/// Too few replicas answered for the configured consistency
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{responded} of {replicas} replicas responded, {required} required")]
pub struct QuorumError {
    pub responded: usize,
    pub required: usize,
    pub replicas: usize,
}

/// Outcome of one full repair pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FullRepairReport {
    pub peers_pulled: usize,
    pub peers_pushed: usize,
    pub failed_exchanges: usize,
    pub rows_merged: usize,
    pub tombstones_purged: usize,
    pub timed_out: bool,
}

#[derive(Debug, Clone)]
pub struct RepairCoordinator {
    store: TableStore,
    peers: Vec<NodeEndpoint>,
    gc_grace: Duration,
    repair_timeout: Duration,
    internal_timeout: Duration,
    write_consistency: Consistency,
    read_consistency: Consistency,
    http: reqwest::Client,
    running: Arc<AtomicBool>,
}

struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl RepairCoordinator {
    pub fn new(store: TableStore, peers: Vec<NodeEndpoint>, config: &NodeConfig) -> Self {
        Self {
            store,
            peers,
            gc_grace: config.gc_grace(),
            repair_timeout: config.repair_timeout(),
            internal_timeout: config.internal_request_timeout(),
            write_consistency: config.write_consistency,
            read_consistency: config.read_consistency,
            http: reqwest::Client::new(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn peers(&self) -> &[NodeEndpoint] {
        &self.peers
    }

    /// Peers plus this node
    pub fn replica_count(&self) -> usize {
        self.peers.len() + 1
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start a tombstone purge in the background
    pub fn trigger_local(&self) -> RepairTrigger {
        let Some(guard) = self.try_begin() else {
            return RepairTrigger::AlreadyRunning;
        };
        let this = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let purged = this.run_local_pass().await;
            tracing::info!(tombstones_purged = purged, "Repair finished");
        });
        RepairTrigger::Started
    }

    /// Start a cluster-wide anti-entropy pass in the background
    pub fn trigger_full(&self) -> RepairTrigger {
        let Some(guard) = self.try_begin() else {
            return RepairTrigger::AlreadyRunning;
        };
        let this = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let report = this.run_full_pass().await;
            tracing::info!(
                peers_pulled = report.peers_pulled,
                peers_pushed = report.peers_pushed,
                failed_exchanges = report.failed_exchanges,
                rows_merged = report.rows_merged,
                tombstones_purged = report.tombstones_purged,
                timed_out = report.timed_out,
                "Full repair finished"
            );
        });
        RepairTrigger::Started
    }

    /// Purge tombstones older than the grace period
    pub async fn run_local_pass(&self) -> usize {
        let grace = i64::try_from(self.gc_grace.as_nanos()).unwrap_or(i64::MAX);
        let cutoff = store::now_nanos().saturating_sub(grace);
        self.store.purge_tombstones(cutoff).await
    }

    /// Exchange snapshots with every peer, bounded by the repair timeout, then purge
    pub async fn run_full_pass(&self) -> FullRepairReport {
        let mut report = FullRepairReport::default();
        if tokio::time::timeout(self.repair_timeout, self.exchange_with_peers(&mut report))
            .await
            .is_err()
        {
            tracing::warn!(timeout_ms = self.repair_timeout.as_millis() as u64, "Full repair timed out");
            report.timed_out = true;
        }
        report.tombstones_purged = self.run_local_pass().await;
        report
    }

    async fn exchange_with_peers(&self, report: &mut FullRepairReport) {
        let pulls = join_all(self.peers.iter().map(|peer| self.pull(peer))).await;
        for (peer, pulled) in self.peers.iter().zip(pulls) {
            match pulled {
                Ok(snapshot) => {
                    let stats = self.store.merge(snapshot).await;
                    report.rows_merged += stats.rows_updated;
                    report.peers_pulled += 1;
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "Failed to pull snapshot");
                    report.failed_exchanges += 1;
                }
            }
        }

        let merged = self.store.snapshot().await;
        let pushes = join_all(self.peers.iter().map(|peer| self.push(peer, &merged))).await;
        for (peer, pushed) in self.peers.iter().zip(pushes) {
            match pushed {
                Ok(stats) => {
                    tracing::debug!(peer = %peer, rows_updated = stats.rows_updated, "Pushed snapshot");
                    report.peers_pushed += 1;
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "Failed to push snapshot");
                    report.failed_exchanges += 1;
                }
            }
        }
    }

    /// Push one mutation to every peer concurrently. Returns how many peers
    /// applied it; the rest catch up on the next full repair.
    pub async fn replicate(&self, snapshot: TableSnapshot) -> usize {
        if self.peers.is_empty() {
            return 0;
        }

        let batch = [snapshot];
        let results = join_all(self.peers.iter().map(|peer| self.push(peer, &batch))).await;
        let mut acknowledged = 0;
        for (peer, result) in self.peers.iter().zip(results) {
            match result {
                Ok(_) => acknowledged += 1,
                Err(e) => tracing::warn!(peer = %peer, error = %e, "Failed to replicate write"),
            }
        }
        record_replication("write", acknowledged, self.peers.len());
        acknowledged
    }

    /// Replicate a local write and check it reached enough replicas
    pub async fn replicate_write(&self, snapshot: TableSnapshot) -> Result<usize, QuorumError> {
        let acknowledged = self.replicate(snapshot).await;
        self.check(self.write_consistency, acknowledged)?;
        Ok(acknowledged)
    }

    /// Reconcile one row with the peers before it is read locally.
    ///
    /// Returns how many stale peers were repaired. At consistency `One` this
    /// is a no-op.
    pub async fn read_repair(&self, address: &RowAddress) -> Result<usize, QuorumError> {
        if self.read_consistency == Consistency::One || self.peers.is_empty() {
            return Ok(0);
        }

        let fetches = join_all(self.peers.iter().map(|peer| self.fetch_row(peer, address))).await;
        let mut answered = Vec::new();
        for (peer, fetched) in self.peers.iter().zip(fetches) {
            match fetched {
                Ok(snapshot) => answered.push((peer, snapshot)),
                Err(e) => tracing::warn!(peer = %peer, row = %address, error = %e, "Failed to fetch row"),
            }
        }
        record_replication("read", answered.len(), self.peers.len());
        self.check(self.read_consistency, answered.len())?;

        let remote: Vec<TableSnapshot> = answered.iter().filter_map(|(_, snapshot)| snapshot.clone()).collect();
        if !remote.is_empty() {
            self.store.merge(remote).await;
        }
        let Some(merged) = self.store.row_snapshot(address).await else {
            return Ok(0);
        };

        let stale: Vec<&NodeEndpoint> = answered
            .iter()
            .filter(|(_, snapshot)| snapshot.as_ref() != Some(&merged))
            .map(|(peer, _)| *peer)
            .collect();
        let batch = [merged];
        let repaired = join_all(stale.iter().map(|peer| self.push(peer, &batch)))
            .await
            .into_iter()
            .filter(Result::is_ok)
            .count();
        if repaired > 0 {
            tracing::debug!(row = %address, repaired, "Read repaired stale replicas");
        }
        Ok(repaired)
    }

    fn check(&self, consistency: Consistency, peers_answered: usize) -> Result<(), QuorumError> {
        let replicas = self.replica_count();
        let responded = peers_answered + 1;
        let required = consistency.required(replicas);
        if responded >= required {
            Ok(())
        } else {
            Err(QuorumError {
                responded,
                required,
                replicas,
            })
        }
    }

    async fn pull(&self, peer: &NodeEndpoint) -> Result<Vec<TableSnapshot>, reqwest::Error> {
        self.http
            .post(peer.url(SNAPSHOT_PATH))
            .timeout(self.internal_timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    async fn push(&self, peer: &NodeEndpoint, snapshot: &[TableSnapshot]) -> Result<MergeStats, reqwest::Error> {
        self.http
            .post(peer.url(SYNC_PATH))
            .timeout(self.internal_timeout)
            .json(snapshot)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    async fn fetch_row(&self, peer: &NodeEndpoint, address: &RowAddress) -> Result<Option<TableSnapshot>, reqwest::Error> {
        self.http
            .post(peer.url(ROW_PATH))
            .timeout(self.internal_timeout)
            .json(address)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
    }

    fn try_begin(&self) -> Option<RunningGuard> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunningGuard(self.running.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{Cell, RowAddress};
    use crate::store::TableSchema;

    /// Accepts connections but never answers
    fn silent_peer() -> (std::net::TcpListener, NodeEndpoint) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = NodeEndpoint::parse(&listener.local_addr().unwrap().to_string()).unwrap();
        (listener, endpoint)
    }

    fn closed_peer() -> NodeEndpoint {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        NodeEndpoint::parse(&addr.to_string()).unwrap()
    }

    fn schema_snapshot() -> TableSnapshot {
        TableSnapshot {
            table_name: "patients".to_string(),
            schema: TableSchema {
                partition_key_names: vec!["HOSPITAL_ID".to_string()],
                clustering_key_names: vec!["ROOM".to_string()],
            },
            rows: Vec::new(),
        }
    }

    async fn store_with_tombstone(deleted_at: i64) -> TableStore {
        let store = TableStore::new();
        store
            .create_table(
                "patients",
                TableSchema {
                    partition_key_names: vec!["HOSPITAL_ID".to_string()],
                    clustering_key_names: vec!["ROOM".to_string()],
                },
            )
            .await
            .unwrap();
        let address = RowAddress::new("patients", &["h1"], &["r1"]).unwrap();
        store.insert(&address, &[Cell::new("a", "1")], deleted_at - 1).await.unwrap();
        store.delete(&address, deleted_at).await;
        store
    }

    #[tokio::test]
    async fn test_local_pass_respects_grace_period() {
        let store = store_with_tombstone(store::now_nanos()).await;
        let coordinator = RepairCoordinator::new(store.clone(), Vec::new(), &NodeConfig::default());
        assert_eq!(coordinator.run_local_pass().await, 0);

        let config = NodeConfig {
            gc_grace_seconds: 0,
            ..NodeConfig::default()
        };
        let coordinator = RepairCoordinator::new(store.clone(), Vec::new(), &config);
        assert_eq!(coordinator.run_local_pass().await, 1);
        assert_eq!(store.stats().await.tombstones, 0);
    }

    #[tokio::test]
    async fn test_only_one_pass_at_a_time() {
        let coordinator = RepairCoordinator::new(TableStore::new(), Vec::new(), &NodeConfig::default());
        let guard = coordinator.try_begin();
        assert!(guard.is_some());
        assert!(coordinator.is_running());
        assert_eq!(coordinator.trigger_local(), RepairTrigger::AlreadyRunning);
        assert_eq!(coordinator.trigger_full(), RepairTrigger::AlreadyRunning);

        drop(guard);
        assert!(!coordinator.is_running());
        assert_eq!(coordinator.trigger_local(), RepairTrigger::Started);
    }

    #[tokio::test]
    async fn test_full_pass_counts_unreachable_peers() {
        let coordinator = RepairCoordinator::new(TableStore::new(), vec![closed_peer()], &NodeConfig::default());
        let report = coordinator.run_full_pass().await;

        assert_eq!(report.peers_pulled, 0);
        assert_eq!(report.peers_pushed, 0);
        assert_eq!(report.failed_exchanges, 2);
        assert!(!report.timed_out);
    }

    #[tokio::test]
    async fn test_full_pass_times_out_and_still_purges() {
        let (_listener, peer) = silent_peer();
        let store = store_with_tombstone(store::now_nanos() - 1_000).await;
        let config = NodeConfig {
            gc_grace_seconds: 0,
            repair_timeout_ms: 100,
            ..NodeConfig::default()
        };
        let coordinator = RepairCoordinator::new(store.clone(), vec![peer], &config);

        let started = std::time::Instant::now();
        let report = coordinator.run_full_pass().await;

        assert!(report.timed_out);
        assert!(started.elapsed() < Duration::from_millis(1_500));
        assert_eq!(report.peers_pulled, 0);
        assert_eq!(report.tombstones_purged, 1);
        assert_eq!(store.stats().await.tombstones, 0);
    }

    #[tokio::test]
    async fn test_replicate_waits_on_silent_peers_together() {
        let silent: Vec<_> = (0..3).map(|_| silent_peer()).collect();
        let config = NodeConfig {
            internal_request_timeout_ms: 300,
            ..NodeConfig::default()
        };
        let peers = silent.iter().map(|(_, peer)| peer.clone()).collect();
        let coordinator = RepairCoordinator::new(TableStore::new(), peers, &config);

        let started = std::time::Instant::now();
        let acknowledged = coordinator.replicate(schema_snapshot()).await;

        assert_eq!(acknowledged, 0);
        // One timeout's worth, not one per peer.
        assert!(started.elapsed() < Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_write_consistency() {
        let relaxed = RepairCoordinator::new(TableStore::new(), vec![closed_peer()], &NodeConfig::default());
        assert_eq!(relaxed.replica_count(), 2);
        assert_eq!(relaxed.replicate_write(schema_snapshot()).await, Ok(0));

        let config = NodeConfig {
            write_consistency: Consistency::All,
            ..NodeConfig::default()
        };
        let strict = RepairCoordinator::new(TableStore::new(), vec![closed_peer()], &config);
        assert_eq!(
            strict.replicate_write(schema_snapshot()).await,
            Err(QuorumError {
                responded: 1,
                required: 2,
                replicas: 2,
            })
        );
    }

    #[tokio::test]
    async fn test_read_repair_needs_enough_replies() {
        let address = RowAddress::new("patients", &["h1"], &["r1"]).unwrap();
        let relaxed = RepairCoordinator::new(TableStore::new(), vec![closed_peer()], &NodeConfig::default());
        assert_eq!(relaxed.read_repair(&address).await, Ok(0));

        let config = NodeConfig {
            read_consistency: Consistency::Quorum,
            ..NodeConfig::default()
        };
        let peers = vec![closed_peer(), closed_peer()];
        let coordinator = RepairCoordinator::new(TableStore::new(), peers, &config);
        let err = coordinator.read_repair(&address).await.unwrap_err();
        assert_eq!(err.required, 2);
        assert_eq!(err.responded, 1);
    }
}
