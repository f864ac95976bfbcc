//! nerve: live telemetry monitor binary.
//! Runs the push feed, the snapshot poller and the view aggregator in-process.

use clap::Parser;

mod cli;
mod cmd_json;
mod cmd_tail;
mod cmd_watch;
mod render;
mod session;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let filter = std::env::var("NERVE_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    let config = args.session_config();
    let session = session::LiveSession::start(&config)?;

    let command = args
        .command
        .unwrap_or_else(|| cli::Command::Watch(cli::WatchOpts::default()));
    let result = match command {
        cli::Command::Watch(opts) => cmd_watch::cmd_watch(&session, opts.refresh_secs).await,
        cli::Command::Json(opts) => cmd_json::cmd_json(&session, opts.timeout_secs).await,
        cli::Command::Tail => cmd_tail::cmd_tail(&session).await,
    };

    session.shutdown();
    result
}
