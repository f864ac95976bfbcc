//! `nerve watch`: live-refresh text summary.

use std::time::Duration;

use crate::render::format_view;
use crate::session::{LiveSession, shutdown_signal};

const MAX_EVENTS_SHOWN: usize = 15;

/// Entry point for `nerve watch`.
pub async fn cmd_watch(session: &LiveSession, refresh_secs: u64) -> anyhow::Result<()> {
    let refresh = Duration::from_secs(refresh_secs.max(1));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        // Clear screen + cursor home
        print!("\x1b[2J\x1b[H");
        println!("{}", format_view(&session.view(), MAX_EVENTS_SHOWN));
        println!("nerve watch, Ctrl-C to quit");

        tokio::select! {
            _ = tokio::time::sleep(refresh) => {}
            () = &mut shutdown => break,
        }
    }

    Ok(())
}
