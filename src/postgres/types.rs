use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::Error;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// A write-ahead log position, rendered by PostgreSQL as `XXXXXXXX/XXXXXXXX`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl Lsn {
    /// Bytes of write-ahead log between `earlier` and `self`.
    /// Negative when `earlier` is actually ahead.
    pub fn bytes_since(self, earlier: Lsn) -> i64 {
        if self.0 >= earlier.0 {
            i64::try_from(self.0 - earlier.0).unwrap_or(i64::MAX)
        } else {
            -i64::try_from(earlier.0 - self.0).unwrap_or(i64::MAX)
        }
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Query {
            query: "parse_lsn",
            message: format!("invalid LSN '{}'", s),
        };

        let (hi, lo) = s.trim().split_once('/').ok_or_else(invalid)?;
        let hi = u32::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u32::from_str_radix(lo, 16).map_err(|_| invalid())?;
        Ok(Lsn((u64::from(hi) << 32) | u64::from(lo)))
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl Serialize for Lsn {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Lsn {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Renders a byte count the way `pg_size_pretty` does.
pub fn format_size(bytes: i64) -> String {
    const LIMIT: i64 = 10 * 1024;
    const LIMIT2: i64 = LIMIT * 2 - 1;
    const UNITS: [&str; 5] = ["kB", "MB", "GB", "TB", "PB"];

    if bytes.abs() < LIMIT {
        return format!("{} bytes", bytes);
    }

    // Keep one extra bit for rounding.
    let mut size = bytes >> 9;
    let mut unit = UNITS[0];
    for next in &UNITS[1..] {
        if size.abs() < LIMIT2 {
            break;
        }
        size >>= 10;
        unit = next;
    }
    format!("{} {}", half_rounded(size), unit)
}

/// Renders a duration as `HH:MM:SS`, prefixed with whole days when longer.
pub fn format_elapsed(duration: Duration) -> String {
    let total = duration.as_secs();
    let (days, rem) = (total / 86_400, total % 86_400);
    let clock = format!("{:02}:{:02}:{:02}", rem / 3600, rem % 3600 / 60, rem % 60);
    if days > 0 {
        format!("{}d {}", days, clock)
    } else {
        clock
    }
}

fn half_rounded(x: i64) -> i64 {
    (x + if x < 0 { -1 } else { 1 }) / 2
}

pub fn bytes_to_mb(bytes: i64) -> f64 {
    bytes as f64 / BYTES_PER_MB
}

/// One row of `pg_subscription`.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub oid: u32,
    pub name: String,
    pub conninfo: String,
    pub enabled: bool,
    pub slot_name: Option<String>,
}

/// A logical slot joined with the replication stream currently using it.
#[derive(Debug, Clone, Default)]
pub struct SlotActivity {
    pub slot_name: String,
    pub plugin: Option<String>,
    pub active: bool,
    pub lag_bytes: Option<i64>,
    pub retained_bytes: Option<i64>,
    pub confirmed_flush_lsn: Option<Lsn>,
    pub client_addr: Option<String>,
    pub connected_user: Option<String>,
    pub connection_state: Option<String>,
}

/// A live walsender peer from `pg_stat_replication`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationPeer {
    pub application_name: Option<String>,
    pub client_addr: Option<String>,
    pub state: Option<String>,
    pub sent_lsn: Option<Lsn>,
    pub replay_lsn: Option<Lsn>,
}

impl ReplicationPeer {
    /// Bytes sent to the peer but not yet replayed by it.
    pub fn lag_bytes(&self) -> Option<i64> {
        match (self.sent_lsn, self.replay_lsn) {
            (Some(sent), Some(replay)) => Some(sent.bytes_since(replay)),
            _ => None,
        }
    }

    /// Address the report uses to name this peer.
    pub fn label(&self) -> String {
        self.client_addr
            .clone()
            .or_else(|| self.application_name.clone())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotKind {
    Plain,
    Temporal,
}

/// A logical replication slot as observed by one probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSlot {
    pub name: String,
    pub kind: SlotKind,
    pub active: bool,
    pub plugin: Option<String>,
    pub lag_bytes: Option<i64>,
    pub lag_mb: Option<f64>,
    pub lag: Option<String>,
    pub retained_bytes: Option<i64>,
    pub retained_wal: Option<String>,
    pub confirmed_flush_lsn: Option<Lsn>,
    pub client_addr: Option<String>,
    pub connected_user: Option<String>,
    pub connection_state: Option<String>,
    /// Time the host needs to generate this slot's lag at the sampled rate.
    pub estimated_time_in_state: Option<String>,
    pub owner: Option<String>,
    pub owning_subscription: Option<String>,
    pub subscription_oid: Option<u32>,
    pub table_oid: Option<u32>,
    pub decoded_table: Option<String>,
    pub orphaned: bool,
}

impl ReplicationSlot {
    pub fn from_activity(activity: SlotActivity) -> Self {
        Self {
            kind: SlotKind::Plain,
            active: activity.active,
            plugin: activity.plugin,
            lag_mb: activity.lag_bytes.map(bytes_to_mb),
            lag: activity.lag_bytes.map(format_size),
            lag_bytes: activity.lag_bytes,
            retained_wal: activity.retained_bytes.map(format_size),
            retained_bytes: activity.retained_bytes,
            confirmed_flush_lsn: activity.confirmed_flush_lsn,
            client_addr: activity.client_addr,
            connected_user: activity.connected_user,
            connection_state: activity.connection_state,
            estimated_time_in_state: None,
            owner: None,
            owning_subscription: None,
            subscription_oid: None,
            table_oid: None,
            decoded_table: None,
            orphaned: false,
            name: activity.slot_name,
        }
    }

    /// State used to group slots in recommendations.
    pub fn state_label(&self) -> String {
        match &self.connection_state {
            Some(state) if !state.is_empty() => state.clone(),
            _ if !self.active => "inactive".to_string(),
            _ => "unknown".to_string(),
        }
    }
}

/// A slot without an attached consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InactiveSlot {
    pub name: String,
    #[serde(rename = "type")]
    pub slot_type: Option<String>,
    pub retained_bytes: Option<i64>,
    pub retained_wal: String,
}

impl InactiveSlot {
    pub fn new(name: String, slot_type: Option<String>, retained_bytes: Option<i64>) -> Self {
        Self {
            retained_wal: retained_bytes
                .map(format_size)
                .unwrap_or_else(|| "unknown".to_string()),
            name,
            slot_type,
            retained_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisabledSubscription {
    pub name: String,
    pub slot_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsn_parse_and_display() {
        let lsn: Lsn = "16/B374D848".parse().unwrap();
        assert_eq!(lsn.0, (0x16u64 << 32) | 0xB374_D848);
        assert_eq!(lsn.to_string(), "16/B374D848");
    }

    #[test]
    fn test_lsn_rejects_garbage() {
        assert!("".parse::<Lsn>().is_err());
        assert!("16B374D848".parse::<Lsn>().is_err());
        assert!("zz/10".parse::<Lsn>().is_err());
    }

    #[test]
    fn test_lsn_bytes_since() {
        let a: Lsn = "0/1000".parse().unwrap();
        let b: Lsn = "0/3000".parse().unwrap();
        assert_eq!(b.bytes_since(a), 0x2000);
        assert_eq!(a.bytes_since(b), -0x2000);
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::from_secs(2)), "00:00:02");
        assert_eq!(format_elapsed(Duration::from_secs(3 * 3600 + 61)), "03:01:01");
        assert_eq!(format_elapsed(Duration::from_secs(2 * 86_400 + 5)), "2d 00:00:05");
    }

    #[test]
    fn test_format_size_matches_pg_size_pretty() {
        assert_eq!(format_size(0), "0 bytes");
        assert_eq!(format_size(10239), "10239 bytes");
        assert_eq!(format_size(10240), "10 kB");
        assert_eq!(format_size(150 * 1024 * 1024), "150 MB");
        assert_eq!(format_size(20 * 1024 * 1024 * 1024), "20 GB");
    }

    #[test]
    fn test_state_label_prefers_connection_state() {
        let mut slot = ReplicationSlot::from_activity(SlotActivity {
            slot_name: "sub_a".to_string(),
            active: true,
            connection_state: Some("streaming".to_string()),
            ..Default::default()
        });
        assert_eq!(slot.state_label(), "streaming");

        slot.connection_state = None;
        assert_eq!(slot.state_label(), "unknown");

        slot.active = false;
        assert_eq!(slot.state_label(), "inactive");
    }

    #[test]
    fn test_peer_lag() {
        let peer = ReplicationPeer {
            client_addr: Some("10.0.0.7".to_string()),
            sent_lsn: Some("0/5000".parse().unwrap()),
            replay_lsn: Some("0/4000".parse().unwrap()),
            ..Default::default()
        };
        assert_eq!(peer.lag_bytes(), Some(0x1000));
        assert_eq!(peer.label(), "10.0.0.7");
    }
}
