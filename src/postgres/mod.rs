pub mod catalog;
pub mod connection;
pub mod conninfo;
pub mod temporal;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use catalog::{Catalog, Connector};
pub use connection::{CatalogConnection, PgConnector};
pub use conninfo::ConnectionInfo;
pub use temporal::{decode_temporal_slot, TemporalSlot, TemporalSlotName};
pub use types::*;
