//! `nerve json`: one machine-readable view.

use std::time::Duration;

use nerve_view::AggregateView;

use crate::session::LiveSession;

/// Wait until every domain has a first value (or `timeout_secs`), then
/// print the view as pretty JSON. A timeout still prints what is known.
pub async fn cmd_json(session: &LiveSession, timeout_secs: u64) -> anyhow::Result<()> {
    let view = wait_filled(session, Duration::from_secs(timeout_secs)).await;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

pub(crate) async fn wait_filled(session: &LiveSession, timeout: Duration) -> AggregateView {
    let mut watcher = session.watch();
    let current = watcher.view();
    if current.is_filled() {
        return current;
    }
    let filled = tokio::time::timeout(timeout, async {
        while let Some(view) = watcher.changed().await {
            if view.is_filled() {
                return Some(view);
            }
        }
        None
    })
    .await;

    match filled {
        Ok(Some(view)) => view,
        _ => {
            tracing::warn!(timeout_secs = timeout.as_secs(), "not every domain has data yet");
            session.view()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::session::SessionConfig;

    fn config(backend_url: String) -> SessionConfig {
        SessionConfig {
            // Nothing listens on port 9 locally; the feed just keeps retrying.
            feed_url: "ws://127.0.0.1:9".into(),
            backend_url,
            feed_path: "/ws/feed".into(),
            region: "francecentral".into(),
            stats_interval: Duration::from_secs(60),
            regions_interval: Duration::from_secs(60),
            curve_interval: Duration::from_secs(60),
            reconnect_delay: Duration::from_secs(60),
            keepalive: None,
        }
    }

    #[tokio::test]
    async fn returns_once_every_domain_has_data() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/dashboard/stats"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"active_jobs": 0})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/regions/summary"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/prices/curve"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"region_id": "francecentral", "data": []})),
            )
            .mount(&server)
            .await;

        let session = LiveSession::start(&config(server.uri())).unwrap();
        let view = wait_filled(&session, Duration::from_secs(5)).await;
        assert!(view.is_filled());
        assert_eq!(view.snapshots.len(), 3);

        let text = serde_json::to_value(&view).unwrap();
        assert_eq!(text["snapshots"]["stats"]["value"]["active_jobs"], 0);
        assert_eq!(text["snapshots"]["regions"]["freshness"], "fresh");
        session.shutdown();
    }

    #[tokio::test]
    async fn timeout_returns_partial_view() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let session = LiveSession::start(&config(server.uri())).unwrap();
        let view = wait_filled(&session, Duration::from_millis(300)).await;
        assert!(!view.is_filled());
        assert_eq!(view.snapshots.len(), 3);
        session.shutdown();
    }
}
