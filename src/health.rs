//! Health classification of a probed topology.
//!
//! [`assess`] is a pure function of the topology and the per-host statuses.
//! Rules run in a fixed order and severity only ever escalates, so a later
//! rule can never downgrade what an earlier one found.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::IpAddr;

use crate::discovery::Topology;
use crate::postgres::{bytes_to_mb, format_size, ReplicationSlot};
use crate::probe::HostStatus;

const MB: i64 = 1024 * 1024;
pub const CRITICAL_LAG_BYTES: i64 = 100 * MB;
pub const WARNING_LAG_BYTES: i64 = 10 * MB;
pub const HIGH_WAL_RATE_MB_PER_SEC: f64 = 10.0;
/// More distinct issues than this is critical on its own.
pub const MAX_ISSUES_BEFORE_CRITICAL: usize = 5;
/// Above this many affected slots recommendations are grouped.
const INDIVIDUAL_RECOMMENDATION_LIMIT: usize = 3;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Healthy,
    Warning,
    Critical,
}

impl Severity {
    /// Raises `self` to at least `to`.
    pub fn escalate(&mut self, to: Severity) {
        if to > *self {
            *self = to;
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Healthy => "HEALTHY",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall: Severity,
    pub issues: Vec<String>,
    pub recommendations: Vec<String>,
}

/// Shortens a DNS name to its first label; IP addresses are kept whole.
pub fn short_hostname(host: &str) -> &str {
    if host.parse::<IpAddr>().is_ok() {
        return host;
    }
    host.split('.').next().unwrap_or(host)
}

/// Display names for the hosts of one assessment: the short name, or the
/// full name when two hosts would share a short name.
struct HostNames<'a> {
    names: HashMap<&'a str, &'a str>,
}

impl<'a> HostNames<'a> {
    fn new(hosts: impl IntoIterator<Item = &'a str>) -> Self {
        let hosts: BTreeSet<&str> = hosts.into_iter().collect();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for host in &hosts {
            *counts.entry(short_hostname(host)).or_default() += 1;
        }
        let names = hosts
            .into_iter()
            .map(|host| {
                let short = short_hostname(host);
                let name = if counts[short] > 1 { host } else { short };
                (host, name)
            })
            .collect();
        Self { names }
    }

    fn get<'h>(&'h self, host: &'h str) -> &'h str {
        self.names.get(host).copied().unwrap_or(host)
    }
}

fn state_explanation(state: &str) -> Option<&'static str> {
    let text = match state {
        "startup" => "Startup state indicates subscribers are initializing connections. If stuck in this state, check for network connectivity issues.",
        "catchup" => "Catchup state means subscribers are actively catching up with WAL. If persistently lagging, check subscriber server resources.",
        "streaming" => "Streaming is the normal operating state. High lag in this state may indicate insufficient resources on subscribers.",
        "backup" => "Backup state indicates a backup operation is in progress. This may temporarily increase replication lag.",
        "stopping" => "Stopping state means replication is being terminated. Check if this is intentional or if there's an error on subscribers.",
        "inactive" => "Inactive slots are not currently connected. Check if the subscriber service is running and has network connectivity.",
        "unknown" => "Unknown state could indicate connection issues or permission problems. Check subscription status on both ends.",
        _ => return None,
    };
    Some(text)
}

/// `a, b, c and N more`
fn truncated_list<'a>(names: impl ExactSizeIterator<Item = &'a str>) -> String {
    let total = names.len();
    let shown: Vec<&str> = names.take(INDIVIDUAL_RECOMMENDATION_LIMIT).collect();
    let mut list = shown.join(", ");
    if total > INDIVIDUAL_RECOMMENDATION_LIMIT {
        list.push_str(&format!(" and {} more", total - INDIVIDUAL_RECOMMENDATION_LIMIT));
    }
    list
}

#[derive(Default)]
struct Assessment {
    overall: Severity,
    issues: Vec<String>,
    seen: BTreeSet<String>,
    recommendations: BTreeSet<String>,
}

impl Assessment {
    fn issue(&mut self, severity: Severity, text: String) {
        self.overall.escalate(severity);
        if self.seen.insert(text.clone()) {
            self.issues.push(text);
        }
    }

    fn recommend(&mut self, text: String) {
        self.recommendations.insert(text);
    }
}

struct AffectedSlot<'a> {
    host: &'a str,
    name: &'a str,
    state: String,
}

pub fn assess(topology: &Topology, statuses: &BTreeMap<String, HostStatus>) -> HealthReport {
    let mut assessment = Assessment::default();
    let names = HostNames::new(
        statuses
            .keys()
            .chain(&topology.hosts)
            .chain(&topology.publishers)
            .chain(&topology.subscribers)
            .chain(topology.links.iter().flat_map(|l| [&l.publisher, &l.subscriber]))
            .map(String::as_str),
    );

    // Connection state of every observed slot, keyed by (host, slot).
    let mut slot_states: BTreeMap<(&str, &str), String> = BTreeMap::new();
    let mut lagging: Vec<AffectedSlot<'_>> = Vec::new();
    let mut inactive: Vec<AffectedSlot<'_>> = Vec::new();

    for (host, status) in statuses {
        let Some(report) = status.report() else {
            continue;
        };
        let short = names.get(host);
        for slot in report.slots() {
            let state = slot.state_label();
            slot_states.insert((host.as_str(), slot.name.as_str()), state.clone());

            let Some(lag) = slot.lag_bytes else {
                continue;
            };
            let severity = if lag >= CRITICAL_LAG_BYTES {
                Severity::Critical
            } else if lag >= WARNING_LAG_BYTES {
                Severity::Warning
            } else {
                continue;
            };
            let label = if severity == Severity::Critical {
                "Critical"
            } else {
                "High"
            };
            assessment.issue(severity, lag_issue(label, slot, short, lag, &state));
            lagging.push(AffectedSlot {
                host,
                name: &slot.name,
                state,
            });
        }
    }

    for (host, status) in statuses {
        let Some(rate) = status.report().and_then(|r| r.wal_generation_rate) else {
            continue;
        };
        if rate.mb_per_sec > HIGH_WAL_RATE_MB_PER_SEC {
            assessment.issue(
                Severity::Warning,
                format!(
                    "High WAL generation rate on {}: {:.2}MB/s",
                    names.get(host),
                    rate.mb_per_sec
                ),
            );
        }
    }

    for (host, status) in statuses {
        let Some(report) = status.report() else {
            continue;
        };
        let short = names.get(host);
        for slot in report.inactive_slots.iter().flatten() {
            assessment.issue(
                Severity::Warning,
                format!(
                    "Inactive replication slot {} ({} WAL retained) on {}",
                    slot.name, slot.retained_wal, short
                ),
            );
            slot_states
                .entry((host.as_str(), slot.name.as_str()))
                .or_insert_with(|| "inactive".to_string());
            inactive.push(AffectedSlot {
                host,
                name: &slot.name,
                state: "inactive".to_string(),
            });
        }
        for subscription in report.disabled_subscriptions.iter().flatten() {
            assessment.issue(
                Severity::Warning,
                format!("Disabled subscription {} on {}", subscription.name, short),
            );
            assessment.recommend(format!(
                "Re-enable or drop disabled subscription {} on {}",
                subscription.name, short
            ));
        }
        for slot in report.slots().filter(|slot| slot.orphaned) {
            let retained = slot
                .retained_bytes
                .map(format_size)
                .unwrap_or_else(|| "unknown".to_string());
            assessment.issue(
                Severity::Warning,
                format!(
                    "Orphaned temporal sync slot {} ({} WAL retained) on {}",
                    slot.name, retained, short
                ),
            );
            assessment.recommend(format!(
                "Drop orphaned sync slot {} on {}: its subscription or table no longer exists",
                slot.name, short
            ));
        }
    }

    for (host, status) in statuses {
        let Some(error) = status.error() else {
            continue;
        };
        let short = names.get(host);
        assessment.issue(Severity::Critical, format!("Error on host {}: {}", short, error));
        assessment.recommend(format!(
            "Check network connectivity and credentials for {}",
            short
        ));
        let subscribers = topology.subscribers_of(host);
        if !subscribers.is_empty() {
            assessment.recommend(format!(
                "Replication from {} cannot be assessed while it is unreachable; affected subscribers: {}",
                short,
                truncated_list(subscribers.into_iter())
            ));
        }
    }

    if assessment.issues.len() > MAX_ISSUES_BEFORE_CRITICAL {
        assessment.overall.escalate(Severity::Critical);
    }

    recommend_for_lagging(&mut assessment, &names, &lagging);
    recommend_for_inactive(&mut assessment, &names, &inactive);

    if !lagging.is_empty() || !inactive.is_empty() {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for state in slot_states.values() {
            *counts.entry(state.as_str()).or_default() += 1;
        }
        let summary = counts
            .iter()
            .map(|(state, count)| format!("{} slots in '{}' state", count, state))
            .collect::<Vec<_>>()
            .join("; ");
        assessment.recommend(format!("Connection state summary: {}", summary));

        for state in counts.keys() {
            if let Some(explanation) = state_explanation(state) {
                assessment.recommend(format!("For {} slots: {}", state, explanation));
            }
        }
    }

    HealthReport {
        overall: assessment.overall,
        issues: assessment.issues,
        recommendations: assessment.recommendations.into_iter().collect(),
    }
}

fn lag_issue(label: &str, slot: &ReplicationSlot, host: &str, lag: i64, state: &str) -> String {
    format!(
        "{} replication lag in slot {} on {}: {} ({:.2} MB), state: {}",
        label,
        slot.name,
        host,
        slot.lag.clone().unwrap_or_else(|| format_size(lag)),
        slot.lag_mb.unwrap_or_else(|| bytes_to_mb(lag)),
        state
    )
}

fn recommend_for_lagging(
    assessment: &mut Assessment,
    names: &HostNames<'_>,
    lagging: &[AffectedSlot<'_>],
) {
    if lagging.len() <= INDIVIDUAL_RECOMMENDATION_LIMIT {
        for slot in lagging {
            assessment.recommend(format!(
                "Check for blocking transactions on subscriber connected to {} on {} (state: {})",
                slot.name,
                names.get(slot.host),
                slot.state
            ));
        }
        return;
    }

    let mut by_state: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for slot in lagging {
        by_state.entry(&slot.state).or_default().push(slot.name);
    }
    for (state, names) in by_state {
        assessment.recommend(format!(
            "Check for blocking transactions on subscribers in {} state: {}",
            state,
            truncated_list(names.into_iter())
        ));
    }
}

fn recommend_for_inactive(
    assessment: &mut Assessment,
    names: &HostNames<'_>,
    inactive: &[AffectedSlot<'_>],
) {
    if inactive.len() <= INDIVIDUAL_RECOMMENDATION_LIMIT {
        for slot in inactive {
            assessment.recommend(format!(
                "Check if the subscriber connected to {} on {} is down or reactivate the slot",
                slot.name,
                names.get(slot.host)
            ));
        }
        return;
    }

    assessment.recommend(format!(
        "Inactive replication slots detected: {}",
        truncated_list(inactive.iter().map(|slot| slot.name))
    ));
    assessment.recommend("Check if subscribers are down or reactivate slots if needed".to_string());
}
