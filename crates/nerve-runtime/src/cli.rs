//! CLI definition using clap derive.

use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::session::SessionConfig;

#[derive(Parser)]
#[command(name = "nerve", about = "Live telemetry monitor for the NERVE backend")]
pub struct Cli {
    /// Backend base URL (HTTP endpoints and, by default, the push feed)
    #[arg(
        long,
        env = "NERVE_BACKEND_URL",
        default_value = "http://localhost:8000",
        global = true
    )]
    pub backend_url: String,

    /// Push feed base URL, if different from the backend URL
    #[arg(long, env = "NERVE_FEED_URL", global = true)]
    pub feed_url: Option<String>,

    /// Push feed path
    #[arg(long, default_value = "/ws/feed", global = true)]
    pub feed_path: String,

    /// Region whose price curve is polled
    #[arg(long, default_value = "francecentral", global = true)]
    pub region: String,

    /// Dashboard stats poll interval in milliseconds
    #[arg(long, default_value = "10000", global = true)]
    pub stats_interval_ms: u64,

    /// Region summary poll interval in milliseconds
    #[arg(long, default_value = "30000", global = true)]
    pub regions_interval_ms: u64,

    /// Price curve poll interval in milliseconds
    #[arg(long, default_value = "60000", global = true)]
    pub curve_interval_ms: u64,

    /// Delay before reconnecting the push feed, in milliseconds
    #[arg(long, default_value = "3000", global = true)]
    pub reconnect_delay_ms: u64,

    /// Keepalive ping interval in seconds (0 disables)
    #[arg(long, default_value = "30", global = true)]
    pub keepalive_secs: u64,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Redraw a live summary until Ctrl-C (default)
    Watch(WatchOpts),
    /// Print the view as JSON once every domain has data
    Json(JsonOpts),
    /// Print each push event as one JSON line until Ctrl-C
    Tail,
}

#[derive(clap::Args)]
pub struct WatchOpts {
    /// Redraw interval in seconds
    #[arg(long, default_value = "2")]
    pub refresh_secs: u64,
}

impl Default for WatchOpts {
    fn default() -> Self {
        Self { refresh_secs: 2 }
    }
}

#[derive(clap::Args)]
pub struct JsonOpts {
    /// Give up waiting for first results after this many seconds
    #[arg(long, default_value = "15")]
    pub timeout_secs: u64,
}

impl Cli {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            backend_url: self.backend_url.clone(),
            feed_url: self
                .feed_url
                .clone()
                .unwrap_or_else(|| self.backend_url.clone()),
            feed_path: self.feed_path.clone(),
            region: self.region.clone(),
            stats_interval: Duration::from_millis(self.stats_interval_ms),
            regions_interval: Duration::from_millis(self.regions_interval_ms),
            curve_interval: Duration::from_millis(self.curve_interval_ms),
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
            keepalive: (self.keepalive_secs > 0).then(|| Duration::from_secs(self.keepalive_secs)),
        }
    }
}
