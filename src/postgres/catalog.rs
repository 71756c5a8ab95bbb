//! The read-only catalog interface the discovery and probing layers talk to.
//!
//! Everything the engine knows about a host comes through [`Catalog`]. The
//! production implementation is [`CatalogConnection`](super::CatalogConnection);
//! tests use an in-memory cluster. Any method may fail on older servers or
//! with restricted permissions, and callers treat such failures as "unknown".

use async_trait::async_trait;

use super::conninfo::ConnectionInfo;
use super::types::{
    DisabledSubscription, InactiveSlot, Lsn, ReplicationPeer, SlotActivity, Subscription,
};
use crate::Result;

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Subscriptions defined on this host with their upstream descriptors.
    async fn list_subscriptions(&self) -> Result<Vec<Subscription>>;

    /// Names of the logical replication slots on this host.
    async fn list_logical_slot_names(&self) -> Result<Vec<String>>;

    async fn list_publications(&self) -> Result<Vec<String>>;

    /// Logical slots joined with the walsender currently attached to them.
    async fn list_replication_slots(&self) -> Result<Vec<SlotActivity>>;

    /// Live replication-stream peers.
    async fn list_replication_peers(&self) -> Result<Vec<ReplicationPeer>>;

    async fn current_wal_lsn(&self) -> Result<Lsn>;

    /// `(subscription name, owning role)` pairs.
    async fn subscription_owners(&self) -> Result<Vec<(String, String)>>;

    async fn inactive_slots(&self) -> Result<Vec<InactiveSlot>>;

    async fn disabled_subscriptions(&self) -> Result<Vec<DisabledSubscription>>;

    async fn subscription_name(&self, oid: u32) -> Result<Option<String>>;

    /// Schema-qualified name of the relation with this oid.
    async fn table_name(&self, oid: u32) -> Result<Option<String>>;

    /// Cheap liveness check used before handing out a pooled connection.
    fn is_alive(&self) -> bool {
        true
    }
}

/// Opens catalog connections to hosts.
#[async_trait]
pub trait Connector: Send + Sync {
    type Conn: Catalog + 'static;

    async fn connect(&self, info: &ConnectionInfo) -> Result<Self::Conn>;
}
