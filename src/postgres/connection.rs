use async_trait::async_trait;
use std::time::Duration;
use tokio_postgres::{NoTls, Row};
use tracing::{debug, error, info};

use super::catalog::{Catalog, Connector};
use super::conninfo::ConnectionInfo;
use super::types::{
    DisabledSubscription, InactiveSlot, Lsn, ReplicationPeer, SlotActivity, Subscription,
};
use crate::{Error, Result};

const LIST_SUBSCRIPTIONS: &str = "
    SELECT oid, subname::text, subconninfo, subenabled, subslotname::text
    FROM pg_subscription";

const LIST_LOGICAL_SLOT_NAMES: &str = "
    SELECT slot_name::text
    FROM pg_replication_slots
    WHERE slot_type = 'logical'";

const LIST_PUBLICATIONS: &str = "
    SELECT pubname::text FROM pg_publication ORDER BY pubname";

const LIST_REPLICATION_SLOTS: &str = "
    SELECT
        rs.slot_name::text,
        rs.plugin::text,
        rs.active,
        pg_wal_lsn_diff(pg_current_wal_lsn(), rs.confirmed_flush_lsn)::bigint AS lag_bytes,
        pg_wal_lsn_diff(pg_current_wal_lsn(), rs.restart_lsn)::bigint AS retained_bytes,
        rs.confirmed_flush_lsn::text,
        host(sr.client_addr) AS client_addr,
        sr.usename::text AS connected_user,
        sr.state AS connection_state
    FROM pg_replication_slots rs
    LEFT JOIN pg_stat_replication sr ON rs.active_pid = sr.pid
    WHERE rs.slot_type = 'logical'";

const LIST_REPLICATION_PEERS: &str = "
    SELECT application_name, host(client_addr), state, sent_lsn::text, replay_lsn::text
    FROM pg_stat_replication";

const CURRENT_WAL_LSN: &str = "SELECT pg_current_wal_lsn()::text";

const SUBSCRIPTION_OWNERS: &str = "
    SELECT sub.subname::text, roles.rolname::text
    FROM pg_subscription sub
    JOIN pg_roles roles ON sub.subowner = roles.oid";

const INACTIVE_SLOTS: &str = "
    SELECT
        slot_name::text,
        slot_type,
        pg_wal_lsn_diff(pg_current_wal_lsn(), restart_lsn)::bigint AS retained_bytes
    FROM pg_replication_slots
    WHERE NOT active";

const DISABLED_SUBSCRIPTIONS: &str = "
    SELECT subname::text, subslotname::text
    FROM pg_subscription
    WHERE NOT subenabled";

const SUBSCRIPTION_BY_OID: &str = "SELECT subname::text FROM pg_subscription WHERE oid = $1";

const TABLE_BY_OID: &str = "
    SELECT n.nspname::text, c.relname::text
    FROM pg_class c
    JOIN pg_namespace n ON n.oid = c.relnamespace
    WHERE c.oid = $1";

/// A plain (non-replication) client connection used to read catalogs.
pub struct CatalogConnection {
    client: tokio_postgres::Client,
    connection_task: tokio::task::JoinHandle<()>,
    host: String,
}

impl CatalogConnection {
    pub async fn connect(info: &ConnectionInfo, connect_timeout: Duration) -> Result<Self> {
        let host = info.host.clone().unwrap_or_else(|| "localhost".to_string());
        info!(host = %host, "Establishing connection to host");

        let config = info.to_pg_config(connect_timeout);
        let (client, connection) = tokio::time::timeout(connect_timeout, config.connect(NoTls))
            .await
            .map_err(|_| Error::Timeout {
                message: format!("connecting to {} took longer than {:?}", host, connect_timeout),
            })??;

        let task_host = host.clone();
        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(host = %task_host, "Connection error: {}", e);
            }
        });

        debug!(host = %host, "Connected");

        Ok(Self {
            client,
            connection_task,
            host,
        })
    }
}

impl Drop for CatalogConnection {
    fn drop(&mut self) {
        debug!(host = %self.host, "Closing catalog connection");
        self.connection_task.abort();
    }
}

fn optional_lsn(row: &Row, idx: usize) -> Result<Option<Lsn>> {
    row.try_get::<_, Option<String>>(idx)?
        .map(|raw| raw.parse())
        .transpose()
}

#[async_trait]
impl Catalog for CatalogConnection {
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        let rows = self.client.query(LIST_SUBSCRIPTIONS, &[]).await?;
        rows.iter()
            .map(|row| -> Result<_> {
                Ok(Subscription {
                    oid: row.try_get(0)?,
                    name: row.try_get(1)?,
                    conninfo: row.try_get(2)?,
                    enabled: row.try_get(3)?,
                    slot_name: row.try_get(4)?,
                })
            })
            .collect()
    }

    async fn list_logical_slot_names(&self) -> Result<Vec<String>> {
        let rows = self.client.query(LIST_LOGICAL_SLOT_NAMES, &[]).await?;
        rows.iter()
            .map(|row| -> Result<String> { Ok(row.try_get(0)?) })
            .collect()
    }

    async fn list_publications(&self) -> Result<Vec<String>> {
        let rows = self.client.query(LIST_PUBLICATIONS, &[]).await?;
        rows.iter()
            .map(|row| -> Result<String> { Ok(row.try_get(0)?) })
            .collect()
    }

    async fn list_replication_slots(&self) -> Result<Vec<SlotActivity>> {
        let rows = self.client.query(LIST_REPLICATION_SLOTS, &[]).await?;
        rows.iter()
            .map(|row| -> Result<_> {
                Ok(SlotActivity {
                    slot_name: row.try_get(0)?,
                    plugin: row.try_get(1)?,
                    active: row.try_get(2)?,
                    lag_bytes: row.try_get(3)?,
                    retained_bytes: row.try_get(4)?,
                    confirmed_flush_lsn: optional_lsn(row, 5)?,
                    client_addr: row.try_get(6)?,
                    connected_user: row.try_get(7)?,
                    connection_state: row.try_get(8)?,
                })
            })
            .collect()
    }

    async fn list_replication_peers(&self) -> Result<Vec<ReplicationPeer>> {
        let rows = self.client.query(LIST_REPLICATION_PEERS, &[]).await?;
        rows.iter()
            .map(|row| -> Result<_> {
                Ok(ReplicationPeer {
                    application_name: row.try_get(0)?,
                    client_addr: row.try_get(1)?,
                    state: row.try_get(2)?,
                    sent_lsn: optional_lsn(row, 3)?,
                    replay_lsn: optional_lsn(row, 4)?,
                })
            })
            .collect()
    }

    async fn current_wal_lsn(&self) -> Result<Lsn> {
        let row = self.client.query_one(CURRENT_WAL_LSN, &[]).await?;
        row.try_get::<_, String>(0)?.parse()
    }

    async fn subscription_owners(&self) -> Result<Vec<(String, String)>> {
        let rows = self.client.query(SUBSCRIPTION_OWNERS, &[]).await?;
        rows.iter()
            .map(|row| -> Result<_> { Ok((row.try_get(0)?, row.try_get(1)?)) })
            .collect()
    }

    async fn inactive_slots(&self) -> Result<Vec<InactiveSlot>> {
        let rows = self.client.query(INACTIVE_SLOTS, &[]).await?;
        rows.iter()
            .map(|row| -> Result<_> {
                Ok(InactiveSlot::new(
                    row.try_get(0)?,
                    row.try_get(1)?,
                    row.try_get(2)?,
                ))
            })
            .collect()
    }

    async fn disabled_subscriptions(&self) -> Result<Vec<DisabledSubscription>> {
        let rows = self.client.query(DISABLED_SUBSCRIPTIONS, &[]).await?;
        rows.iter()
            .map(|row| -> Result<_> {
                Ok(DisabledSubscription {
                    name: row.try_get(0)?,
                    slot_name: row.try_get(1)?,
                })
            })
            .collect()
    }

    async fn subscription_name(&self, oid: u32) -> Result<Option<String>> {
        let row = self.client.query_opt(SUBSCRIPTION_BY_OID, &[&oid]).await?;
        row.map(|row| -> Result<String> { Ok(row.try_get(0)?) })
            .transpose()
    }

    async fn table_name(&self, oid: u32) -> Result<Option<String>> {
        let row = self.client.query_opt(TABLE_BY_OID, &[&oid]).await?;
        row.map(|row| -> Result<_> {
            let schema: String = row.try_get(0)?;
            let table: String = row.try_get(1)?;
            Ok(format!("{}.{}", schema, table))
        })
        .transpose()
    }

    fn is_alive(&self) -> bool {
        !self.client.is_closed()
    }
}

/// Opens [`CatalogConnection`]s with a fixed connect timeout.
#[derive(Debug, Clone)]
pub struct PgConnector {
    connect_timeout: Duration,
}

impl PgConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Conn = CatalogConnection;

    async fn connect(&self, info: &ConnectionInfo) -> Result<Self::Conn> {
        CatalogConnection::connect(info, self.connect_timeout).await
    }
}
