//! Replication topology discovery.
//!
//! Starting from a seed host, the walker follows every subscription to the
//! publisher it streams from, depth first. The walk uses an explicit stack
//! and a visit-state map keyed by host address: a host is marked the moment
//! it is first discovered, before it is pushed, so every host is entered at
//! most once and cycles among publishers and subscribers terminate.
//!
//! Subscribers are found when they are visited themselves, not by walking
//! forward from a publisher. Live walsender peers can optionally be followed
//! as an extra signal (`follow_replication_peers`).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::pool::ConnectionCache;
use crate::postgres::{Catalog, ConnectionInfo, Connector};
use crate::secrets::{SecretRequest, SecretResolver};

/// A publisher → subscriber edge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicationLink {
    pub publisher: String,
    pub subscriber: String,
}

/// The discovered replication graph. Read-only once discovery returns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Topology {
    pub links: BTreeSet<ReplicationLink>,
    pub publishers: BTreeSet<String>,
    pub subscribers: BTreeSet<String>,
    /// Every host the walk entered, reachable or not.
    pub hosts: BTreeSet<String>,
    pub unreachable: BTreeSet<String>,
    /// Credentials each host was reached with; never serialized.
    #[serde(skip)]
    pub credentials: HashMap<String, ConnectionInfo>,
}

impl Topology {
    /// Records `publisher → subscriber`; returns false if already known.
    pub fn record_link(&mut self, publisher: &str, subscriber: &str) -> bool {
        self.links.insert(ReplicationLink {
            publisher: publisher.to_string(),
            subscriber: subscriber.to_string(),
        })
    }

    pub fn subscribers_of(&self, publisher: &str) -> Vec<&str> {
        self.links
            .iter()
            .filter(|link| link.publisher == publisher)
            .map(|link| link.subscriber.as_str())
            .collect()
    }

    pub fn publishers_of(&self, subscriber: &str) -> Vec<&str> {
        self.links
            .iter()
            .filter(|link| link.subscriber == subscriber)
            .map(|link| link.publisher.as_str())
            .collect()
    }

    /// Every host that should be probed: visited hosts, role holders and
    /// link endpoints the walk never got to enter.
    pub fn probe_targets(&self) -> BTreeSet<String> {
        let mut targets = self.hosts.clone();
        targets.extend(self.publishers.iter().cloned());
        targets.extend(self.subscribers.iter().cloned());
        for link in &self.links {
            targets.insert(link.publisher.clone());
            targets.insert(link.subscriber.clone());
        }
        targets
    }
}

#[derive(Debug, Clone, Copy)]
enum VisitState {
    /// Discovered and waiting on the stack, or being explored.
    Visiting,
    Done,
}

pub struct TopologyWalker<'a, C: Connector> {
    pool: &'a ConnectionCache<C>,
    secrets: &'a dyn SecretResolver,
    follow_peers: bool,
    deadline: Option<Instant>,
}

impl<'a, C: Connector> TopologyWalker<'a, C> {
    pub fn new(pool: &'a ConnectionCache<C>, secrets: &'a dyn SecretResolver) -> Self {
        Self {
            pool,
            secrets,
            follow_peers: false,
            deadline: None,
        }
    }

    pub fn follow_peers(mut self, follow: bool) -> Self {
        self.follow_peers = follow;
        self
    }

    /// Stop entering new hosts once `deadline` has passed. A host still being
    /// explored at the deadline is abandoned and recorded as unreachable.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[instrument(skip_all, fields(seed = %seed_host))]
    pub async fn discover(&self, seed_host: &str, seed: &ConnectionInfo) -> Topology {
        let mut topology = Topology::default();
        let mut states: HashMap<String, VisitState> = HashMap::new();
        let mut stack: Vec<(String, ConnectionInfo)> =
            vec![(seed_host.to_string(), seed.for_host(seed_host))];
        states.insert(seed_host.to_string(), VisitState::Visiting);

        while let Some((host, credentials)) = stack.pop() {
            if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!(
                    pending = stack.len() + 1,
                    "Discovery deadline reached; keeping partial topology"
                );
                break;
            }

            info!(host = %host, "Exploring host");
            topology.hosts.insert(host.clone());
            topology.credentials.insert(host.clone(), credentials.clone());

            let visit = self.visit(&host, &credentials, seed, &mut topology);
            let discovered = match self.deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, visit).await {
                    Ok(discovered) => discovered,
                    Err(_) => {
                        warn!(
                            host = %host,
                            pending = stack.len(),
                            "Discovery deadline reached mid-visit; keeping partial topology"
                        );
                        topology.unreachable.insert(host.clone());
                        break;
                    }
                },
                None => visit.await,
            };
            states.insert(host.clone(), VisitState::Done);

            // Reversed so the first subscription is explored first.
            for (next, next_credentials) in discovered.into_iter().rev() {
                if states.contains_key(&next) {
                    debug!(host = %next, "Already discovered; not re-entering");
                    continue;
                }
                states.insert(next.clone(), VisitState::Visiting);
                stack.push((next, next_credentials));
            }
        }

        info!(
            hosts = topology.hosts.len(),
            links = topology.links.len(),
            publishers = topology.publishers.len(),
            subscribers = topology.subscribers.len(),
            "Topology discovery completed"
        );
        topology
    }

    /// Explores one host and returns the hosts it leads to.
    async fn visit(
        &self,
        host: &str,
        credentials: &ConnectionInfo,
        seed: &ConnectionInfo,
        topology: &mut Topology,
    ) -> Vec<(String, ConnectionInfo)> {
        let conn = match self.pool.acquire(host, credentials).await {
            Ok(conn) => conn,
            Err(e) => {
                error!(host = %host, error = %e, "Error connecting to host; abandoning branch");
                topology.unreachable.insert(host.to_string());
                return Vec::new();
            }
        };

        let mut next = Vec::new();
        let mut healthy = true;

        match conn.list_subscriptions().await {
            Ok(subscriptions) => {
                if !subscriptions.is_empty() {
                    topology.subscribers.insert(host.to_string());
                }
                for subscription in subscriptions {
                    let parsed = ConnectionInfo::parse(&subscription.conninfo);
                    let Some(publisher) = parsed.host.clone() else {
                        warn!(
                            host = %host,
                            subscription = %subscription.name,
                            "Subscription descriptor names no host; skipping"
                        );
                        continue;
                    };

                    info!("{} subscribes to {} via {}", host, publisher, subscription.name);
                    topology.record_link(&publisher, host);
                    let publisher_credentials =
                        self.publisher_credentials(parsed, &subscription.name, &publisher, seed);
                    next.push((publisher, publisher_credentials));
                }
            }
            Err(e) => {
                healthy = false;
                warn!(host = %host, error = %e, "Could not list subscriptions");
            }
        }

        match conn.list_logical_slot_names().await {
            Ok(slots) if !slots.is_empty() => {
                info!(host = %host, slots = slots.len(), "Host is a logical publisher");
                topology.publishers.insert(host.to_string());
            }
            Ok(_) => {}
            Err(e) => {
                healthy = false;
                warn!(host = %host, error = %e, "Could not list replication slots");
            }
        }

        if self.follow_peers {
            match conn.list_replication_peers().await {
                Ok(peers) => {
                    for addr in peers.into_iter().filter_map(|peer| peer.client_addr) {
                        debug!(host = %host, peer = %addr, "Following replication peer");
                        topology.publishers.insert(host.to_string());
                        topology.subscribers.insert(addr.clone());
                        topology.record_link(host, &addr);
                        let peer_credentials = seed.for_host(&addr);
                        next.push((addr, peer_credentials));
                    }
                }
                Err(e) => {
                    healthy = false;
                    warn!(host = %host, error = %e, "Could not list replication peers");
                }
            }
        }

        if healthy {
            conn.release();
        } else {
            conn.discard();
        }
        next
    }

    fn publisher_credentials(
        &self,
        mut parsed: ConnectionInfo,
        subscription: &str,
        publisher: &str,
        seed: &ConnectionInfo,
    ) -> ConnectionInfo {
        if parsed.password.is_none() {
            parsed.password = self.secrets.resolve(&SecretRequest {
                subscription,
                host: publisher,
                user: parsed.user.as_deref(),
            });
            if parsed.password.is_none() {
                debug!(
                    subscription = %subscription,
                    publisher = %publisher,
                    "No password for publisher; falling back to seed credentials"
                );
            }
        }
        parsed.or_defaults(seed)
    }
}
