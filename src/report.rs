//! The canonical result object and its persistence.
//!
//! A [`ReplicationReport`] is a flat, serializable structure: links are plain
//! host pairs and statuses are keyed by host address, so the report has no
//! back references and renders directly to JSON.
//!
//! # Example
//!
//! ```rust,no_run
//! use pg_reptool::report::{ReplicationReport, ReportWriter};
//!
//! # async fn example(report: ReplicationReport) -> pg_reptool::Result<()> {
//! let writer = ReportWriter::new("reports");
//! let path = writer.save(&report).await?;
//! println!("Report saved to {}", path.display());
//! # Ok(())
//! # }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use crate::discovery::Topology;
use crate::health::{short_hostname, HealthReport};
use crate::probe::{HostStatus, LAGGING_SLOT_BYTES};
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationReport {
    pub generated_at: DateTime<Utc>,
    pub seed_host: String,
    pub topology: Topology,
    pub instance_statuses: BTreeMap<String, HostStatus>,
    /// Bytes sent but not yet replayed, keyed `"<publisher>-><peer>"`.
    pub replication_lag: BTreeMap<String, Option<i64>>,
    pub health: HealthReport,
}

impl ReplicationReport {
    pub fn assemble(
        seed_host: &str,
        topology: Topology,
        instance_statuses: BTreeMap<String, HostStatus>,
        health: HealthReport,
    ) -> Self {
        let mut replication_lag = BTreeMap::new();
        for publisher in &topology.publishers {
            let peers = instance_statuses
                .get(publisher)
                .and_then(HostStatus::report)
                .and_then(|report| report.replication_peers.as_ref());
            for peer in peers.into_iter().flatten() {
                replication_lag.insert(format!("{}->{}", publisher, peer.label()), peer.lag_bytes());
            }
        }

        Self {
            generated_at: Utc::now(),
            seed_host: seed_host.to_string(),
            topology,
            instance_statuses,
            replication_lag,
            health,
        }
    }

    /// Drops every slot lagging 1 MB or less from the per-host inventories.
    pub fn only_lagging(&mut self) {
        for status in self.instance_statuses.values_mut() {
            let HostStatus::Probed(report) = status else {
                continue;
            };
            let Some(slots) = report.replication_slots.as_mut() else {
                continue;
            };
            slots.retain(|_, slot| slot.lag_bytes.is_some_and(|lag| lag > LAGGING_SLOT_BYTES));
            if slots.is_empty() {
                report.note = Some("No slots lagging more than 1 MB".to_string());
            }
        }
    }

    /// `<short seed>_replication_report_<YYYYmmdd_HHMMSS>.json`
    pub fn file_name(&self) -> String {
        format!(
            "{}_replication_report_{}.json",
            short_hostname(&self.seed_host),
            self.generated_at.format("%Y%m%d_%H%M%S")
        )
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Writes reports into a directory without ever leaving a partial file.
pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Saves `report` atomically and returns the final path.
    ///
    /// The JSON is written and synced to a temporary file next to the target,
    /// which is then renamed into place.
    pub async fn save(&self, report: &ReplicationReport) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(report.file_name());
        let temp_path = path.with_extension("json.tmp");
        debug!("Saving report to {:?}", path);

        let json = report.to_json_pretty()?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        if let Err(e) = fs::rename(&temp_path, &path).await {
            error!("Failed to move report into place: {}", e);
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        info!("Report saved to {}", path.display());
        Ok(path)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<ReplicationReport> {
        let content = fs::read_to_string(path.as_ref()).await?;
        Ok(serde_json::from_str(&content)?)
    }
}
