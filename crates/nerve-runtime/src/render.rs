//! Plain-text rendering of an [`AggregateView`] for `nerve watch`.

use std::fmt::Write;

use chrono::{DateTime, Utc};

use nerve_core::{Event, EventBody};
use nerve_poller::Freshness;
use nerve_view::{AggregateView, DomainView};

/// Full screen body: connection line, domain table, latest events.
pub fn format_view(view: &AggregateView, max_events: usize) -> String {
    let mut out = String::new();
    let connection = view.connection.map_or("unknown", |c| c.as_str());
    let _ = writeln!(out, "connection: {connection}");
    let _ = writeln!(out);

    let _ = writeln!(out, "{:<32} {:<8} {:>6}  ERROR", "DOMAIN", "STATE", "AGE");
    if view.snapshots.is_empty() {
        let _ = writeln!(out, "(no domains registered)");
    }
    for (domain, dv) in &view.snapshots {
        let _ = writeln!(
            out,
            "{:<32} {:<8} {:>6}  {}",
            domain.as_str(),
            domain_state(dv),
            dv.fetched_at
                .map_or_else(|| "-".to_string(), |t| format_age(t, view.generated_at)),
            dv.last_error.as_deref().unwrap_or("")
        );
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "recent events ({}):", view.recent_events.len());
    for event in view.recent_events.iter().take(max_events) {
        let _ = writeln!(
            out,
            "  {}  {:<20} {}",
            event.timestamp.format("%H:%M:%S"),
            event.kind,
            describe_event(event)
        );
    }
    out
}

fn domain_state(dv: &DomainView) -> &'static str {
    match dv.freshness {
        Freshness::Pending if dv.in_flight => "loading",
        Freshness::Pending => "pending",
        Freshness::Fresh => "fresh",
        Freshness::Stale => "STALE",
    }
}

/// Compact age: `45s`, `3m`, `2h`.
pub(crate) fn format_age(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - then).num_seconds().max(0);
    match secs {
        0..60 => format!("{secs}s"),
        60..3600 => format!("{}m", secs / 60),
        _ => format!("{}h", secs / 3600),
    }
}

/// One-line summary of a push event's payload.
pub(crate) fn describe_event(event: &Event) -> String {
    match event.body() {
        Ok(EventBody::AzPriceUpdate(u)) => {
            let instance = u.instance.as_deref().unwrap_or("?");
            match u.change_ratio() {
                Some(r) => format!(
                    "{} {instance} {:.4} -> {:.4} ({:+.1}%)",
                    u.az,
                    u.old_price,
                    u.new_price,
                    r * 100.0
                ),
                None => format!("{} {instance} {:.4} -> {:.4}", u.az, u.old_price, u.new_price),
            }
        }
        Ok(EventBody::CheckpointEvent(c)) => {
            format!("job {} {} {:.0}%", c.job_id, c.status, c.progress_pct)
        }
        Ok(EventBody::MigrationComplete(m)) => {
            format!("job {} {} -> {}", m.job_id, m.from_az, m.to_az)
        }
        Ok(EventBody::TimeshiftScheduled(t)) => {
            format!("job {} saves ${:.2}", t.job_id, t.estimated_savings_usd)
        }
        Ok(EventBody::Connected(c)) => c.message.unwrap_or_default(),
        Ok(EventBody::Pong) => String::new(),
        Ok(EventBody::Unknown) | Err(_) => serde_json::Value::Object(event.payload.clone()).to_string(),
    }
}
