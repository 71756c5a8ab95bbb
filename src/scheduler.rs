//! Bounded-concurrency probing of every discovered host.

use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::postgres::Connector;
use crate::probe::{HostProber, HostStatus};

pub const ABANDONED_PROBE: &str = "probe abandoned: overall timeout exceeded";

/// Runs [`HostProber::probe`] over a set of hosts with at most `max_workers`
/// probes in flight.
///
/// Results are fanned in through the stream, so the result map has a single
/// writer. Completion order is not preserved.
#[derive(Debug, Clone)]
pub struct ProbeScheduler {
    max_workers: usize,
    deadline: Option<Instant>,
}

impl ProbeScheduler {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            deadline: None,
        }
    }

    /// Probes still running at `deadline` are dropped and reported as failed.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub async fn probe_all<C, I>(
        &self,
        prober: &HostProber<'_, C>,
        hosts: I,
    ) -> BTreeMap<String, HostStatus>
    where
        C: Connector,
        I: IntoIterator<Item = String>,
    {
        let hosts: Vec<String> = hosts.into_iter().collect();
        info!(
            hosts = hosts.len(),
            workers = self.max_workers,
            "Probing hosts"
        );

        let mut results = BTreeMap::new();
        {
            let mut probes = stream::iter(hosts.iter().cloned())
                .map(|host| async move {
                    let status = prober.probe(&host).await;
                    (host, status)
                })
                .buffer_unordered(self.max_workers);

            loop {
                let next = match self.deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, probes.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            warn!(
                                completed = results.len(),
                                pending = hosts.len() - results.len(),
                                "Overall timeout reached; abandoning in-flight probes"
                            );
                            break;
                        }
                    },
                    None => probes.next().await,
                };

                match next {
                    Some((host, status)) => {
                        results.insert(host, status);
                    }
                    None => break,
                }
            }
        }

        for host in hosts {
            results
                .entry(host)
                .or_insert_with(|| HostStatus::failed(ABANDONED_PROBE));
        }
        results
    }
}
