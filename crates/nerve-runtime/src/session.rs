//! Live session: wires feed → dispatcher → aggregator and poller → aggregator.

use std::time::Duration;

use anyhow::Context;

use nerve_core::{ConnectionState, Event};
use nerve_feed::{ConnectionManager, EventDispatcher, ReconnectPolicy, Subscription, WsConnector};
use nerve_poller::{BackendClient, Endpoint, PollHandle, SnapshotPoller};
use nerve_view::{AggregateView, ViewAggregator, ViewWatcher};

/// Everything a session needs; filled from CLI flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub backend_url: String,
    pub feed_url: String,
    pub feed_path: String,
    pub region: String,
    pub stats_interval: Duration,
    pub regions_interval: Duration,
    pub curve_interval: Duration,
    pub reconnect_delay: Duration,
    pub keepalive: Option<Duration>,
}

impl SessionConfig {
    /// Polled endpoints with their intervals.
    pub fn endpoints(&self) -> Vec<(Endpoint, Duration)> {
        vec![
            (Endpoint::DashboardStats, self.stats_interval),
            (Endpoint::RegionsSummary, self.regions_interval),
            (
                Endpoint::PriceCurve {
                    region_id: self.region.clone(),
                },
                self.curve_interval,
            ),
        ]
    }
}

/// One application session. Owns the connection, the poll tasks and the
/// aggregator; [`LiveSession::shutdown`] tears all of them down.
pub struct LiveSession {
    manager: ConnectionManager<WsConnector>,
    poller: SnapshotPoller,
    aggregator: ViewAggregator,
    handles: Vec<PollHandle>,
}

impl LiveSession {
    /// Register every domain and start connecting. Must run inside a tokio runtime.
    pub fn start(config: &SessionConfig) -> anyhow::Result<Self> {
        let dispatcher = EventDispatcher::new();
        let connector = WsConnector::new(&config.feed_url, &config.feed_path);
        let feed_url = connector.url().to_string();
        let mut manager = ConnectionManager::with_policy(
            connector,
            dispatcher.clone(),
            ReconnectPolicy::Fixed(config.reconnect_delay),
        );
        if let Some(interval) = config.keepalive {
            manager = manager.with_keepalive(interval);
        }

        let poller = SnapshotPoller::new();
        let aggregator = ViewAggregator::new(&dispatcher, poller.clone())
            .with_connection_state(manager.watch_state());

        let client = BackendClient::new(&config.backend_url).context("building HTTP client")?;
        let mut handles = Vec::new();
        for (endpoint, interval) in config.endpoints() {
            let domain = endpoint.domain();
            let handle = poller
                .register(domain.clone(), client.fetcher(endpoint), interval)
                .with_context(|| format!("registering domain {domain}"))?;
            handles.push(handle);
        }

        manager.connect();
        tracing::info!(
            feed = %feed_url,
            backend = %config.backend_url,
            domains = handles.len(),
            "session started"
        );

        Ok(Self {
            manager,
            poller,
            aggregator,
            handles,
        })
    }

    pub fn view(&self) -> AggregateView {
        self.aggregator.view()
    }

    pub fn watch(&self) -> ViewWatcher {
        self.aggregator.watch()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Subscribe to raw push events.
    pub fn subscribe_events<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.manager.subscribe(callback)
    }

    pub fn poller(&self) -> &SnapshotPoller {
        &self.poller
    }

    /// Stop every poll task and disconnect. In-flight fetches are discarded.
    pub fn shutdown(self) {
        for handle in &self.handles {
            self.poller.stop(handle);
        }
        self.manager.disconnect();
        let stats = self.manager.stats();
        tracing::info!(
            connect_attempts = stats.connect_attempts,
            reconnects = stats.reconnects_scheduled,
            events = stats.events_dispatched,
            "session stopped"
        );
    }
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
                tracing::info!("received ctrl-c, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        tracing::info!("received ctrl-c, shutting down");
    }
}
