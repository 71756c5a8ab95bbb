use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::catalog::{Catalog, Connector};
use super::conninfo::ConnectionInfo;
use super::types::{
    DisabledSubscription, InactiveSlot, Lsn, ReplicationPeer, SlotActivity, Subscription,
};
use crate::{Error, Result};

pub const MB: i64 = 1024 * 1024;

/// Catalog contents of one mock host.
#[derive(Debug, Clone, Default)]
pub struct MockHost {
    pub subscriptions: Vec<Subscription>,
    pub slots: Vec<SlotActivity>,
    pub peers: Vec<ReplicationPeer>,
    pub publications: Vec<String>,
    pub wal_positions: Vec<Lsn>,
    pub owners: Vec<(String, String)>,
    pub inactive: Vec<InactiveSlot>,
    pub disabled: Vec<DisabledSubscription>,
    pub subscription_names: HashMap<u32, String>,
    pub tables: HashMap<u32, String>,
    pub failing: HashSet<&'static str>,
    pub fail_all: bool,
    pub unreachable: bool,
    pub query_delay: Option<Duration>,
}

impl MockHost {
    pub fn new() -> Self {
        Self {
            wal_positions: vec![Lsn(0x1000_0000)],
            ..Default::default()
        }
    }

    /// Adds a subscription streaming from `publisher`.
    pub fn subscribe_to(mut self, name: &str, oid: u32, publisher: &str) -> Self {
        self.subscriptions.push(Subscription {
            oid,
            name: name.to_string(),
            conninfo: format!("host={} port=5432 user=repl dbname=app", publisher),
            enabled: true,
            slot_name: Some(name.to_string()),
        });
        self.subscription_names.insert(oid, name.to_string());
        self
    }

    pub fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.subscription_names
            .insert(subscription.oid, subscription.name.clone());
        self.subscriptions.push(subscription);
        self
    }

    pub fn with_slot(mut self, slot: SlotActivity) -> Self {
        self.slots.push(slot);
        self
    }

    /// Adds an active logical slot with the given lag.
    pub fn with_lag_slot(self, name: &str, lag_bytes: i64, state: &str) -> Self {
        self.with_slot(SlotActivity {
            slot_name: name.to_string(),
            plugin: Some("pgoutput".to_string()),
            active: true,
            lag_bytes: Some(lag_bytes),
            retained_bytes: Some(lag_bytes),
            connection_state: Some(state.to_string()),
            ..Default::default()
        })
    }

    /// Adds a logical slot with no consumer attached.
    pub fn with_inactive_slot(mut self, name: &str, retained_bytes: i64) -> Self {
        self.slots.push(SlotActivity {
            slot_name: name.to_string(),
            plugin: Some("pgoutput".to_string()),
            active: false,
            lag_bytes: Some(0),
            retained_bytes: Some(retained_bytes),
            ..Default::default()
        });
        self.inactive.push(InactiveSlot::new(
            name.to_string(),
            Some("logical".to_string()),
            Some(retained_bytes),
        ));
        self
    }

    pub fn with_disabled_subscription(mut self, name: &str) -> Self {
        self.disabled.push(DisabledSubscription {
            name: name.to_string(),
            slot_name: Some(name.to_string()),
        });
        self
    }

    pub fn with_peer(mut self, client_addr: &str, sent: Lsn, replay: Lsn) -> Self {
        self.peers.push(ReplicationPeer {
            application_name: Some("sub".to_string()),
            client_addr: Some(client_addr.to_string()),
            state: Some("streaming".to_string()),
            sent_lsn: Some(sent),
            replay_lsn: Some(replay),
        });
        self
    }

    pub fn with_owner(mut self, subscription: &str, role: &str) -> Self {
        self.owners.push((subscription.to_string(), role.to_string()));
        self
    }

    pub fn with_table(mut self, oid: u32, name: &str) -> Self {
        self.tables.insert(oid, name.to_string());
        self
    }

    pub fn with_subscription_name(mut self, oid: u32, name: &str) -> Self {
        self.subscription_names.insert(oid, name.to_string());
        self
    }

    /// Successive `current_wal_lsn` reads return these positions; the last one repeats.
    pub fn with_wal_positions(mut self, positions: Vec<Lsn>) -> Self {
        self.wal_positions = positions;
        self
    }

    pub fn failing(mut self, query: &'static str) -> Self {
        self.failing.insert(query);
        self
    }

    pub fn failing_all(mut self) -> Self {
        self.fail_all = true;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.unreachable = true;
        self
    }

    pub fn with_query_delay(mut self, delay: Duration) -> Self {
        self.query_delay = Some(delay);
        self
    }
}

#[derive(Debug, Default)]
struct ClusterStats {
    connects: Mutex<HashMap<String, usize>>,
    credentials: Mutex<HashMap<String, ConnectionInfo>>,
    open: Mutex<HashMap<String, usize>>,
    max_open: Mutex<HashMap<String, usize>>,
    queries: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// An in-memory set of hosts reachable through [`Connector`].
#[derive(Debug, Clone, Default)]
pub struct MockCluster {
    hosts: Arc<HashMap<String, MockHost>>,
    stats: Arc<ClusterStats>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, name: &str, host: MockHost) -> Self {
        Arc::make_mut(&mut self.hosts).insert(name.to_string(), host);
        self
    }

    pub fn connects(&self, host: &str) -> usize {
        self.stats
            .connects
            .lock()
            .unwrap()
            .get(host)
            .copied()
            .unwrap_or(0)
    }

    pub fn credentials_used(&self, host: &str) -> Option<ConnectionInfo> {
        self.stats.credentials.lock().unwrap().get(host).cloned()
    }

    /// How many times `query` ran against `host`, failed attempts included.
    pub fn query_count(&self, host: &str, query: &str) -> usize {
        self.stats
            .queries
            .lock()
            .unwrap()
            .get(&format!("{}:{}", host, query))
            .copied()
            .unwrap_or(0)
    }

    /// Most queries that were ever running at once, across all hosts.
    pub fn max_in_flight_queries(&self) -> usize {
        self.stats.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn open_connections(&self, host: &str) -> usize {
        self.stats.open.lock().unwrap().get(host).copied().unwrap_or(0)
    }

    pub fn max_open_connections(&self, host: &str) -> usize {
        self.stats
            .max_open
            .lock()
            .unwrap()
            .get(host)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Connector for MockCluster {
    type Conn = MockConnection;

    async fn connect(&self, info: &ConnectionInfo) -> Result<Self::Conn> {
        let host = info.host.clone().unwrap_or_default();
        *self
            .stats
            .connects
            .lock()
            .unwrap()
            .entry(host.clone())
            .or_default() += 1;
        self.stats
            .credentials
            .lock()
            .unwrap()
            .insert(host.clone(), info.clone());

        let data = match self.hosts.get(&host) {
            Some(data) if !data.unreachable => data.clone(),
            Some(_) => {
                return Err(Error::Connection(format!(
                    "connection to {} refused",
                    host
                )))
            }
            None => {
                return Err(Error::Connection(format!(
                    "could not translate host name \"{}\"",
                    host
                )))
            }
        };

        {
            let mut open = self.stats.open.lock().unwrap();
            let count = open.entry(host.clone()).or_default();
            *count += 1;
            let mut max_open = self.stats.max_open.lock().unwrap();
            let max = max_open.entry(host.clone()).or_default();
            *max = (*max).max(*count);
        }

        Ok(MockConnection {
            host,
            data,
            wal_reads: AtomicUsize::new(0),
            alive: AtomicBool::new(true),
            stats: Arc::clone(&self.stats),
        })
    }
}

pub struct MockConnection {
    host: String,
    data: MockHost,
    wal_reads: AtomicUsize,
    alive: AtomicBool,
    stats: Arc<ClusterStats>,
}

impl MockConnection {
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    async fn check(&self, query: &'static str) -> Result<()> {
        *self
            .stats
            .queries
            .lock()
            .unwrap()
            .entry(format!("{}:{}", self.host, query))
            .or_default() += 1;
        let running = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.data.query_delay {
            tokio::time::sleep(delay).await;
        }
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.data.fail_all || self.data.failing.contains(query) {
            return Err(Error::Query {
                query,
                message: "permission denied".to_string(),
            });
        }
        Ok(())
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        if let Some(count) = self.stats.open.lock().unwrap().get_mut(&self.host) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl Catalog for MockConnection {
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        self.check("list_subscriptions").await?;
        Ok(self.data.subscriptions.clone())
    }

    async fn list_logical_slot_names(&self) -> Result<Vec<String>> {
        self.check("list_logical_slot_names").await?;
        Ok(self.data.slots.iter().map(|s| s.slot_name.clone()).collect())
    }

    async fn list_publications(&self) -> Result<Vec<String>> {
        self.check("list_publications").await?;
        Ok(self.data.publications.clone())
    }

    async fn list_replication_slots(&self) -> Result<Vec<SlotActivity>> {
        self.check("list_replication_slots").await?;
        Ok(self.data.slots.clone())
    }

    async fn list_replication_peers(&self) -> Result<Vec<ReplicationPeer>> {
        self.check("list_replication_peers").await?;
        Ok(self.data.peers.clone())
    }

    async fn current_wal_lsn(&self) -> Result<Lsn> {
        self.check("current_wal_lsn").await?;
        let idx = self.wal_reads.fetch_add(1, Ordering::SeqCst);
        let positions = &self.data.wal_positions;
        positions
            .get(idx.min(positions.len().saturating_sub(1)))
            .copied()
            .ok_or_else(|| Error::Query {
                query: "current_wal_lsn",
                message: "recovery is in progress".to_string(),
            })
    }

    async fn subscription_owners(&self) -> Result<Vec<(String, String)>> {
        self.check("subscription_owners").await?;
        Ok(self.data.owners.clone())
    }

    async fn inactive_slots(&self) -> Result<Vec<InactiveSlot>> {
        self.check("inactive_slots").await?;
        Ok(self.data.inactive.clone())
    }

    async fn disabled_subscriptions(&self) -> Result<Vec<DisabledSubscription>> {
        self.check("disabled_subscriptions").await?;
        Ok(self.data.disabled.clone())
    }

    async fn subscription_name(&self, oid: u32) -> Result<Option<String>> {
        self.check("subscription_name").await?;
        Ok(self.data.subscription_names.get(&oid).cloned())
    }

    async fn table_name(&self, oid: u32) -> Result<Option<String>> {
        self.check("table_name").await?;
        Ok(self.data.tables.get(&oid).cloned())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
