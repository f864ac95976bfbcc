//! `nerve tail`: push events as JSON lines.

use tokio::sync::mpsc;

use nerve_core::Event;

use crate::session::{LiveSession, shutdown_signal};

/// Entry point for `nerve tail`.
pub async fn cmd_tail(session: &LiveSession) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let subscription = session.subscribe_events(move |event| {
        // Receiver gone means we are shutting down.
        let _ = tx.send(event.clone());
    });

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
            () = &mut shutdown => break,
        }
    }

    subscription.unsubscribe();
    Ok(())
}
