//! Per-host replication probe.
//!
//! A probe runs a fixed battery of independent catalog reads against one
//! host. Every read yields a `Result<T, SoftError>` that is fed through a
//! [`ProbeAccumulator`]: a failed read leaves its field unknown and becomes a
//! warning, and only when every read failed does the host get a top-level
//! error instead of a report.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::error::{SoftError, SoftResultExt};
use crate::pool::ConnectionCache;
use crate::postgres::{
    decode_temporal_slot, format_elapsed, Catalog, ConnectionInfo, Connector,
    DisabledSubscription, InactiveSlot, Lsn, ReplicationPeer, ReplicationSlot, SlotKind,
};

/// Slots lagging more than this are listed in `lagging_slots`.
pub const LAGGING_SLOT_BYTES: i64 = 1024 * 1024;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WalGenerationRate {
    pub bytes_per_sec: f64,
    pub mb_per_sec: f64,
}

impl WalGenerationRate {
    fn between(first: Lsn, second: Lsn, interval: Duration) -> Self {
        let secs = interval.as_secs_f64().max(f64::EPSILON);
        let bytes_per_sec = second.bytes_since(first).max(0) as f64 / secs;
        Self {
            bytes_per_sec,
            mb_per_sec: bytes_per_sec / BYTES_PER_MB,
        }
    }

    /// Time needed to generate `bytes` of WAL at this rate, to the second;
    /// `None` when idle.
    pub fn time_for(&self, bytes: i64) -> Option<Duration> {
        if self.bytes_per_sec <= 0.0 || bytes < 0 {
            return None;
        }
        Duration::try_from_secs_f64((bytes as f64 / self.bytes_per_sec).round()).ok()
    }
}

/// What a probe learned about one host. `None` means the read failed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostReport {
    pub current_lsn: Option<Lsn>,
    pub wal_generation_rate: Option<WalGenerationRate>,
    pub replication_slots: Option<BTreeMap<String, ReplicationSlot>>,
    pub lagging_slots: Vec<String>,
    pub inactive_slots: Option<Vec<InactiveSlot>>,
    pub disabled_subscriptions: Option<Vec<DisabledSubscription>>,
    pub replication_peers: Option<Vec<ReplicationPeer>>,
    pub publications: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    /// Set when a report filter removed every slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl HostReport {
    pub fn slots(&self) -> impl Iterator<Item = &ReplicationSlot> {
        self.replication_slots.iter().flat_map(|slots| slots.values())
    }
}

/// Outcome of probing one host.
///
/// Serializes as `{"error": "..."}` for a failed host and as the bare report
/// otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HostStatus {
    Failed { error: String },
    Probed(Box<HostReport>),
}

impl HostStatus {
    pub fn failed(error: impl Into<String>) -> Self {
        HostStatus::Failed {
            error: error.into(),
        }
    }

    pub fn report(&self) -> Option<&HostReport> {
        match self {
            HostStatus::Probed(report) => Some(report),
            HostStatus::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            HostStatus::Failed { error } => Some(error),
            HostStatus::Probed(_) => None,
        }
    }
}

/// Collects soft failures of the reads that make up one probe.
#[derive(Debug, Default)]
pub struct ProbeAccumulator {
    attempted: usize,
    failed: usize,
    warnings: Vec<SoftError>,
}

impl ProbeAccumulator {
    /// Records the outcome of one battery read.
    pub fn record<T>(&mut self, host: &str, outcome: Result<T, SoftError>) -> Option<T> {
        self.attempted += 1;
        match outcome {
            Ok(value) => Some(value),
            Err(e) => {
                self.failed += 1;
                self.note(host, e);
                None
            }
        }
    }

    /// Records a failure that is not one of the battery reads.
    pub fn note(&mut self, host: &str, error: SoftError) {
        warn!(host = %host, query = error.query, error = %error.message, "Catalog query failed");
        self.warnings.push(error);
    }

    pub fn all_failed(&self) -> bool {
        self.attempted > 0 && self.failed == self.attempted
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn into_warnings(self) -> Vec<String> {
        self.warnings.iter().map(ToString::to_string).collect()
    }

    fn failure_summary(&self) -> String {
        match self.warnings.first() {
            Some(first) => format!(
                "all {} catalog queries failed; first error: {}",
                self.attempted, first
            ),
            None => "no catalog queries were run".to_string(),
        }
    }
}

pub struct HostProber<'a, C: Connector> {
    pool: &'a ConnectionCache<C>,
    credentials: &'a HashMap<String, ConnectionInfo>,
    fallback: &'a ConnectionInfo,
    sample_interval: Duration,
}

impl<'a, C: Connector> HostProber<'a, C> {
    /// `credentials` are the per-host credentials found during discovery;
    /// hosts missing from it are reached with `fallback`.
    pub fn new(
        pool: &'a ConnectionCache<C>,
        credentials: &'a HashMap<String, ConnectionInfo>,
        fallback: &'a ConnectionInfo,
        sample_interval: Duration,
    ) -> Self {
        Self {
            pool,
            credentials,
            fallback,
            sample_interval,
        }
    }

    #[instrument(skip(self))]
    pub async fn probe(&self, host: &str) -> HostStatus {
        let credentials = self.credentials.get(host).unwrap_or(self.fallback);
        let conn = match self.pool.acquire(host, credentials).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(host = %host, error = %e, "Could not connect to host for probing");
                return HostStatus::failed(e.to_string());
            }
        };

        let mut acc = ProbeAccumulator::default();
        let mut report = HostReport::default();

        report.current_lsn = acc.record(host, conn.current_wal_lsn().await.soft("current_wal_lsn"));
        report.wal_generation_rate = acc.record(host, self.sample_rate(&*conn).await);

        let slots = acc.record(
            host,
            conn.list_replication_slots()
                .await
                .soft("list_replication_slots"),
        );
        let owners = acc.record(host, conn.subscription_owners().await.soft("subscription_owners"));
        report.inactive_slots = acc.record(host, conn.inactive_slots().await.soft("inactive_slots"));
        report.disabled_subscriptions = acc.record(
            host,
            conn.disabled_subscriptions()
                .await
                .soft("disabled_subscriptions"),
        );
        report.replication_peers = acc.record(
            host,
            conn.list_replication_peers()
                .await
                .soft("list_replication_peers"),
        );
        report.publications = acc.record(host, conn.list_publications().await.soft("list_publications"));

        if let Some(activity) = slots {
            let owners: HashMap<String, String> = owners.unwrap_or_default().into_iter().collect();
            let mut by_name = BTreeMap::new();
            for entry in activity {
                let mut slot = ReplicationSlot::from_activity(entry);
                slot.owner = owners.get(&slot.name).cloned();
                slot.estimated_time_in_state = report
                    .wal_generation_rate
                    .zip(slot.lag_bytes)
                    .and_then(|(rate, lag)| rate.time_for(lag))
                    .map(format_elapsed);
                match decode_temporal_slot(&*conn, &slot.name).await {
                    Ok(Some(temporal)) => {
                        slot.kind = SlotKind::Temporal;
                        slot.subscription_oid = Some(temporal.subscription_oid);
                        slot.table_oid = Some(temporal.table_oid);
                        slot.owning_subscription = temporal.subscription_name;
                        slot.decoded_table = temporal.table_name;
                        slot.orphaned = temporal.orphaned;
                    }
                    Ok(None) => {}
                    Err(e) => acc.note(host, SoftError::new("decode_temporal_slot", e)),
                }
                by_name.insert(slot.name.clone(), slot);
            }
            report.lagging_slots = by_name
                .values()
                .filter(|slot| slot.lag_bytes.is_some_and(|lag| lag > LAGGING_SLOT_BYTES))
                .map(|slot| slot.name.clone())
                .collect();
            report.replication_slots = Some(by_name);
        }

        if acc.is_clean() {
            conn.release();
        } else {
            conn.discard();
        }

        if acc.all_failed() {
            return HostStatus::failed(acc.failure_summary());
        }

        report.warnings = acc.into_warnings();
        debug!(
            host = %host,
            slots = report.replication_slots.as_ref().map_or(0, BTreeMap::len),
            warnings = report.warnings.len(),
            "Probe finished"
        );
        HostStatus::Probed(Box::new(report))
    }

    /// Samples the write position twice around a pause.
    ///
    /// The rate is computed over the nominal interval so repeated probes of an
    /// idle host agree exactly.
    async fn sample_rate<T: Catalog + ?Sized>(
        &self,
        conn: &T,
    ) -> Result<WalGenerationRate, SoftError> {
        let first = conn.current_wal_lsn().await.soft("wal_generation_rate")?;
        tokio::time::sleep(self.sample_interval).await;
        let second = conn.current_wal_lsn().await.soft("wal_generation_rate")?;
        Ok(WalGenerationRate::between(first, second, self.sample_interval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::test_utils::{MockCluster, MockHost, MB};

    fn seed() -> ConnectionInfo {
        ConnectionInfo {
            user: Some("postgres".to_string()),
            password: Some("pw".to_string()),
            ..Default::default()
        }
    }

    async fn probe(host: MockHost) -> (HostStatus, MockCluster) {
        let cluster = MockCluster::new().with_host("db1", host);
        let cache = ConnectionCache::new(cluster.clone(), 5, Duration::from_millis(200));
        let credentials = HashMap::new();
        let fallback = seed();
        let status = HostProber::new(&cache, &credentials, &fallback, Duration::from_millis(10))
            .probe("db1")
            .await;
        cache.shutdown();
        (status, cluster)
    }

    #[tokio::test]
    async fn test_probe_collects_slot_inventory() {
        let (status, cluster) = probe(
            MockHost::new()
                .with_lag_slot("orders_sub", 150 * MB, "streaming")
                .with_lag_slot("users_sub", 1024, "catchup")
                .with_inactive_slot("old_sub", 3 * MB)
                .with_owner("orders_sub", "replicator"),
        )
        .await;

        let report = status.report().unwrap();
        let slots = report.replication_slots.as_ref().unwrap();
        assert_eq!(slots.len(), 3);
        let orders = &slots["orders_sub"];
        assert_eq!(orders.kind, SlotKind::Plain);
        assert_eq!(orders.owner.as_deref(), Some("replicator"));
        assert_eq!(orders.lag.as_deref(), Some("150 MB"));
        assert_eq!(orders.lag_mb, Some(150.0));
        assert_eq!(report.lagging_slots, vec!["orders_sub".to_string()]);
        assert_eq!(report.inactive_slots.as_ref().unwrap().len(), 1);
        assert!(report.warnings.is_empty());
        // A clean probe returns its connection to the pool.
        assert_eq!(cluster.connects("db1"), 1);
    }

    #[tokio::test]
    async fn test_generation_rate_over_sample_interval() {
        let start = Lsn(0x1000_0000);
        let later = Lsn(0x1000_0000 + 2 * MB as u64);
        // current position, then the two rate samples
        let (status, _) = probe(MockHost::new().with_wal_positions(vec![start, start, later])).await;

        let report = status.report().unwrap();
        assert_eq!(report.current_lsn, Some(Lsn(0x1000_0000)));
        let rate = report.wal_generation_rate.unwrap();
        assert!((rate.mb_per_sec - 200.0).abs() < 1e-6, "{:?}", rate);
    }

    #[tokio::test]
    async fn test_time_in_state_from_lag_and_rate() {
        let start = Lsn(0x1000_0000);
        let later = Lsn(0x1000_0000 + 2 * MB as u64);
        let (status, _) = probe(
            MockHost::new()
                .with_wal_positions(vec![start, start, later])
                .with_lag_slot("orders_sub", 400 * MB, "streaming"),
        )
        .await;

        let slots = status.report().unwrap().slots().collect::<Vec<_>>();
        assert_eq!(slots[0].estimated_time_in_state.as_deref(), Some("00:00:02"));
    }

    #[tokio::test]
    async fn test_idle_host_has_no_time_in_state() {
        let (status, _) =
            probe(MockHost::new().with_lag_slot("orders_sub", 400 * MB, "streaming")).await;

        let slots = status.report().unwrap().slots().collect::<Vec<_>>();
        assert_eq!(slots[0].estimated_time_in_state, None);
    }

    #[tokio::test]
    async fn test_single_query_failure_is_soft() {
        let (status, _) = probe(
            MockHost::new()
                .with_lag_slot("orders_sub", 0, "streaming")
                .failing("subscription_owners"),
        )
        .await;

        let report = status.report().unwrap();
        assert!(report.replication_slots.is_some());
        assert_eq!(report.slots().next().unwrap().owner, None);
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("subscription_owners"));
    }

    #[tokio::test]
    async fn test_failed_slot_listing_leaves_slots_unknown() {
        let (status, _) = probe(MockHost::new().failing("list_replication_slots")).await;

        let report = status.report().unwrap();
        assert!(report.replication_slots.is_none());
        assert!(report.current_lsn.is_some());
    }

    #[tokio::test]
    async fn test_every_query_failing_yields_error_marker() {
        let (status, _) = probe(MockHost::new().with_lag_slot("s", 0, "streaming").failing_all()).await;

        let error = status.error().unwrap();
        assert!(error.contains("permission denied"), "{}", error);

        let json = serde_json::to_value(&status).unwrap();
        let object = json.as_object().unwrap();
        assert_eq!(object.len(), 1);
        assert!(object.contains_key("error"));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_failed() {
        let (status, _) = probe(MockHost::new().unreachable()).await;
        assert!(status.error().unwrap().contains("refused"));
    }

    #[tokio::test]
    async fn test_temporal_slots_are_decoded() {
        let (status, _) = probe(
            MockHost::new()
                .with_lag_slot("pg_16398_sync_24601_1", 0, "startup")
                .with_lag_slot("pg_16399_sync_24602_1", 0, "startup")
                .with_subscription_name(16398, "orders_sub")
                .with_table(24601, "public.orders"),
        )
        .await;

        let report = status.report().unwrap();
        let slots = report.replication_slots.as_ref().unwrap();
        let live = &slots["pg_16398_sync_24601_1"];
        assert_eq!(live.kind, SlotKind::Temporal);
        assert_eq!(live.owning_subscription.as_deref(), Some("orders_sub"));
        assert_eq!(live.decoded_table.as_deref(), Some("public.orders"));
        assert!(!live.orphaned);

        let leaked = &slots["pg_16399_sync_24602_1"];
        assert!(leaked.orphaned);
        assert_eq!(leaked.decoded_table, None);
    }

    #[tokio::test]
    async fn test_temporal_lookup_failure_is_a_warning_not_orphan() {
        let (status, cluster) = probe(
            MockHost::new()
                .with_lag_slot("pg_16398_sync_24601_1", 0, "startup")
                .failing("subscription_name"),
        )
        .await;

        let report = status.report().unwrap();
        let slot = report.slots().next().unwrap();
        assert!(!slot.orphaned);
        assert_eq!(slot.kind, SlotKind::Plain);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(cluster.query_count("db1", "subscription_name"), 1);
    }

    #[test]
    fn test_probed_status_serializes_as_report() {
        let status = HostStatus::Probed(Box::default());
        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("error").is_none());
        assert!(json.get("current_lsn").is_some());
    }

    #[test]
    fn test_accumulator_all_failed() {
        let mut acc = ProbeAccumulator::default();
        assert!(!acc.all_failed());
        acc.record::<()>("db1", Err(SoftError::new("a", "boom")));
        assert!(acc.all_failed());
        acc.record("db1", Ok(1));
        assert!(!acc.all_failed());
        acc.note("db1", SoftError::new("b", "boom"));
        assert!(!acc.all_failed());
        assert_eq!(acc.into_warnings().len(), 2);
    }
}
