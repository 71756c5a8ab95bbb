use tokio::time::Instant;
use tracing::{info, instrument};

use crate::config::{Config, MonitoringConfig};
use crate::discovery::TopologyWalker;
use crate::health::assess;
use crate::pool::ConnectionCache;
use crate::postgres::{ConnectionInfo, Connector, PgConnector};
use crate::probe::HostProber;
use crate::report::ReplicationReport;
use crate::scheduler::ProbeScheduler;
use crate::secrets::{SecretResolver, StaticSecrets};
use crate::{Error, Result};

/// One replication overview run.
///
/// Owns everything scoped to the run (the connection cache and the secret
/// resolver) and tears the cache down before [`run`](Self::run) returns.
pub struct ReplicationOverview<C: Connector> {
    cache: ConnectionCache<C>,
    secrets: Box<dyn SecretResolver>,
    seed_host: String,
    seed: ConnectionInfo,
    settings: MonitoringConfig,
}

impl ReplicationOverview<PgConnector> {
    /// Validates `config` and prepares a run against real servers.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let seed = config.seed_connection()?;
        Self::new(
            PgConnector::new(config.connect_timeout()),
            seed,
            config.monitoring.clone(),
            Box::new(StaticSecrets::new(config.secrets.clone())),
        )
    }
}

impl<C: Connector> ReplicationOverview<C> {
    pub fn new(
        connector: C,
        seed: ConnectionInfo,
        settings: MonitoringConfig,
        secrets: Box<dyn SecretResolver>,
    ) -> Result<Self> {
        let seed_host = seed
            .host
            .clone()
            .ok_or_else(|| Error::Config("seed connection has no host".to_string()))?;

        Ok(Self {
            cache: ConnectionCache::new(connector, settings.pool_size, settings.acquire_timeout()),
            secrets,
            seed_host,
            seed,
            settings,
        })
    }

    /// Discovers, probes and assesses the topology reachable from the seed.
    ///
    /// Always yields a report: unreachable hosts and probes abandoned at the
    /// overall deadline show up as host errors.
    #[instrument(skip(self), fields(seed = %self.seed_host))]
    pub async fn run(self) -> ReplicationReport {
        let deadline = Instant::now() + self.settings.overall_timeout();
        info!("Starting replication overview");

        let topology = TopologyWalker::new(&self.cache, &*self.secrets)
            .follow_peers(self.settings.follow_replication_peers)
            .with_deadline(deadline)
            .discover(&self.seed_host, &self.seed)
            .await;

        let statuses = {
            let prober = HostProber::new(
                &self.cache,
                &topology.credentials,
                &self.seed,
                self.settings.wal_sample_interval(),
            );
            ProbeScheduler::new(self.settings.max_workers)
                .with_deadline(deadline)
                .probe_all(&prober, topology.probe_targets())
                .await
        };

        let health = assess(&topology, &statuses);
        self.cache.shutdown();

        info!(
            hosts = statuses.len(),
            overall = %health.overall,
            issues = health.issues.len(),
            "Replication overview finished"
        );
        ReplicationReport::assemble(&self.seed_host, topology, statuses, health)
    }
}
