use std::time::Duration;

use lltrack_core::{EventRecord, dispatch::MetricsSnapshot};

pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs < 1.0 {
        format!("{:.0}ms", secs * 1000.0)
    } else if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        format!("{:.0}m {:.0}s", (secs / 60.0).floor(), secs % 60.0)
    }
}

/// One-line summary of a record: `click  hero/cta_buy  (pricing)`.
pub fn format_record_line(record: &EventRecord) -> String {
    let slot = if record.slot_id.is_empty() {
        "-"
    } else {
        record.slot_id.as_str()
    };
    format!(
        "{:<10} {}/{}  ({})",
        record.event_type.as_str(),
        slot,
        record.id_event,
        record.page_id
    )
}

pub fn format_metrics(metrics: &MetricsSnapshot, queued: usize) -> String {
    format!(
        "delivered {} of {} | queued {} | dropped {} | failed batches {}",
        metrics.delivered, metrics.enqueued, queued, metrics.dropped, metrics.failed_batches
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
    }
}
