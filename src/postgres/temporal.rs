//! Decoding of table-synchronization slot names.
//!
//! During the initial copy of a subscribed table PostgreSQL creates a slot
//! named `pg_<subscription oid>_sync_<table oid>_<sequence>`. Such a slot is
//! supposed to disappear once the copy finishes. If the subscription or the
//! table it was created for no longer exists, the slot is orphaned and keeps
//! retaining write-ahead log forever.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::debug;

use super::catalog::Catalog;
use crate::Result;

fn sync_slot_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^pg_(\d+)_sync_(\d+)_(\d+)$").expect("sync slot pattern is a valid regex")
    })
}

/// Identifiers encoded in a synchronization slot name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemporalSlotName {
    pub subscription_oid: u32,
    pub table_oid: u32,
    pub sequence: u64,
}

impl TemporalSlotName {
    /// Returns `None` for ordinary slot names, including names that have the
    /// right shape but identifiers too large to be oids.
    pub fn parse(slot_name: &str) -> Option<Self> {
        let captures = sync_slot_pattern().captures(slot_name)?;
        Some(Self {
            subscription_oid: captures[1].parse().ok()?,
            table_oid: captures[2].parse().ok()?,
            sequence: captures[3].parse().ok()?,
        })
    }
}

/// A synchronization slot resolved against the catalogs of its host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalSlot {
    pub slot_name: String,
    pub subscription_oid: u32,
    pub subscription_name: Option<String>,
    pub table_oid: u32,
    pub table_name: Option<String>,
    pub orphaned: bool,
}

/// Decodes `slot_name` using lookups on the same host that owns the slot.
///
/// Returns `Ok(None)` when the name is not a synchronization slot. Catalog
/// errors are propagated so the caller can record them as soft failures.
pub async fn decode_temporal_slot<C>(catalog: &C, slot_name: &str) -> Result<Option<TemporalSlot>>
where
    C: Catalog + ?Sized,
{
    let Some(parsed) = TemporalSlotName::parse(slot_name) else {
        return Ok(None);
    };

    let subscription_name = catalog.subscription_name(parsed.subscription_oid).await?;
    let table_name = catalog.table_name(parsed.table_oid).await?;
    let orphaned = subscription_name.is_none() || table_name.is_none();

    if orphaned {
        debug!(
            slot = %slot_name,
            subscription_oid = parsed.subscription_oid,
            table_oid = parsed.table_oid,
            "Synchronization slot does not resolve to a live subscription and table"
        );
    }

    Ok(Some(TemporalSlot {
        slot_name: slot_name.to_string(),
        subscription_oid: parsed.subscription_oid,
        subscription_name,
        table_oid: parsed.table_oid,
        table_name,
        orphaned,
    }))
}
