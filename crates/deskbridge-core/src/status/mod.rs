//! Liveness of known remote identifiers.
//!
//! A status cycle first asks the broker for its list of connected peers
//! through [`LivenessDiscovery`], trying the broker's peer-list URLs in
//! turn and remembering the one that answered. When no URL answers, each
//! identifier is probed one by one: a throwaway endpoint opens a data
//! conduit tagged as a liveness probe, an open conduit means online, an
//! error or timeout means offline. A probe conduit is closed only after a
//! short delay following its open, so the peer never sees an abrupt abort.
//!
//! Cycles never overlap; a cycle requested while another is running is
//! skipped.

#[cfg(feature = "http-discovery")]
mod http;

#[cfg(feature = "http-discovery")]
pub use http::HttpDiscovery;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capability::LivenessDiscovery;
use crate::config::{BrokerConfig, StatusConfig};
use crate::identity::generate_identifier;
use crate::transport::{
    ChannelId, Endpoint, EndpointConfig, EndpointId, EventSink, InvitationMetadata, Transport,
    TransportEvent,
};

/// Liveness of one identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerStatus {
    /// Reachable through the broker
    Online,
    /// Unknown to the broker or not answering
    Offline,
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => f.pad("online"),
            Self::Offline => f.pad("offline"),
        }
    }
}

/// Result of one status cycle, keyed by identifier.
pub type StatusReport = BTreeMap<String, PeerStatus>;

/// Resets the in-flight flag when a cycle ends.
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Periodic liveness checker.
pub struct StatusProbe {
    broker: BrokerConfig,
    config: StatusConfig,
    discovery: Arc<dyn LivenessDiscovery>,
    transport: Option<Arc<dyn Transport>>,
    preferred_url: Mutex<Option<String>>,
    in_flight: AtomicBool,
}

impl StatusProbe {
    /// Create a probe that only uses the bulk query.
    ///
    /// Without a transport every identifier is reported offline when the
    /// bulk query is unavailable.
    #[must_use]
    pub fn new(
        broker: BrokerConfig,
        config: StatusConfig,
        discovery: Arc<dyn LivenessDiscovery>,
    ) -> Self {
        Self {
            broker,
            config,
            discovery,
            transport: None,
            preferred_url: Mutex::new(None),
            in_flight: AtomicBool::new(false),
        }
    }

    /// Enable per-identifier probing through `transport`.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Whether a cycle is running.
    pub fn is_checking(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Run one status cycle.
    ///
    /// Returns `None` when another cycle is already in flight.
    pub async fn check(&self, ids: &[String]) -> Option<StatusReport> {
        let Some(_guard) = CycleGuard::acquire(&self.in_flight) else {
            debug!("Status cycle already running, skipped");
            return None;
        };
        if ids.is_empty() {
            return Some(StatusReport::new());
        }

        if let Some(report) = self.query_bulk(ids).await {
            return Some(report);
        }
        debug!(count = ids.len(), "Bulk query unavailable, probing one by one");
        Some(self.probe_each(ids).await)
    }

    /// Check `ids` every interval until cancelled or the receiver is gone.
    pub async fn run(
        &self,
        ids: Vec<String>,
        cancel: CancellationToken,
        reports: mpsc::Sender<StatusReport>,
    ) {
        let period = self.config.interval.max(Duration::from_secs(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(count = ids.len(), period = ?period, "Status probe started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Some(report) = self.check(&ids).await {
                        if reports.send(report).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        info!("Status probe stopped");
    }

    async fn query_bulk(&self, ids: &[String]) -> Option<StatusReport> {
        let mut urls = self.broker.peer_list_urls();
        if let Some(preferred) = self.preferred_url.lock().await.clone() {
            urls.retain(|u| *u != preferred);
            urls.insert(0, preferred);
        }

        for url in urls {
            let Some(online) = self.discovery.query_online(&url).await else {
                continue;
            };
            debug!(url = %url, online = online.len(), "Peer list answered");
            *self.preferred_url.lock().await = Some(url);

            let online: HashSet<&str> = online.iter().map(String::as_str).collect();
            return Some(
                ids.iter()
                    .map(|id| {
                        let status = if online.contains(id.as_str()) {
                            PeerStatus::Online
                        } else {
                            PeerStatus::Offline
                        };
                        (id.clone(), status)
                    })
                    .collect(),
            );
        }
        None
    }

    async fn probe_each(&self, ids: &[String]) -> StatusReport {
        let offline = || {
            ids.iter()
                .map(|id| (id.clone(), PeerStatus::Offline))
                .collect::<StatusReport>()
        };
        let Some(transport) = &self.transport else {
            return offline();
        };

        let (sink, mut events) = EventSink::channel();
        let identifier = format!("probe-{}", generate_identifier());
        let endpoint = match transport
            .open(&identifier, &EndpointConfig::from(&self.broker), sink)
            .await
        {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(error = %e, "Failed to open probe endpoint");
                return offline();
            }
        };

        let ready = tokio::time::timeout(
            self.config.probe_timeout,
            wait_ready(&mut events, endpoint.id()),
        )
        .await
        .unwrap_or(false);
        if !ready {
            warn!("Probe endpoint did not register in time");
            endpoint.dispose();
            return offline();
        }

        let mut report = StatusReport::new();
        for id in ids {
            let status = self.probe_one(endpoint.as_ref(), &mut events, id).await;
            debug!(remote = %id, status = %status, "Probed");
            report.insert(id.clone(), status);
        }
        endpoint.dispose();
        report
    }

    async fn probe_one(
        &self,
        endpoint: &dyn Endpoint,
        events: &mut mpsc::UnboundedReceiver<TransportEvent>,
        remote: &str,
    ) -> PeerStatus {
        let conduit = match endpoint
            .open_conduit(remote, Some(InvitationMetadata::status_probe()))
            .await
        {
            Ok(conduit) => conduit,
            Err(e) => {
                debug!(remote = %remote, error = %e, "Probe conduit refused");
                return PeerStatus::Offline;
            }
        };

        let open = conduit.is_open()
            || tokio::time::timeout(
                self.config.probe_timeout,
                wait_open(events, endpoint.id(), conduit.id()),
            )
            .await
            .unwrap_or(false);

        if open {
            tokio::time::sleep(self.config.probe_close_delay).await;
        }
        conduit.close();

        if open {
            PeerStatus::Online
        } else {
            PeerStatus::Offline
        }
    }
}

async fn wait_ready(
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    endpoint: EndpointId,
) -> bool {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Ready { endpoint: e, .. } if e == endpoint => return true,
            TransportEvent::Error { endpoint: e, kind, .. } if e == endpoint && kind.is_fatal() => {
                return false;
            }
            _ => {}
        }
    }
    false
}

async fn wait_open(
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    endpoint: EndpointId,
    channel: ChannelId,
) -> bool {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::ConduitOpen { channel: c } if c == channel => return true,
            TransportEvent::ConduitError { channel: c, .. }
            | TransportEvent::ConduitClosed { channel: c }
                if c == channel =>
            {
                return false;
            }
            TransportEvent::Error { endpoint: e, .. } if e == endpoint => return false,
            _ => {}
        }
    }
    false
}
