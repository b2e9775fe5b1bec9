//! Weekly summary composition: week-over-week deltas rendered as a small
//! self-contained HTML email.

use crate::aggregate::Snapshot;

pub struct WeekComparison {
    pub current: Snapshot,
    pub previous: Snapshot,
}

impl WeekComparison {
    pub fn volume_delta_pct(&self) -> f64 {
        delta_pct(terminal_total(&self.current) as f64, terminal_total(&self.previous) as f64)
    }

    pub fn success_rate_delta(&self) -> f64 {
        success_rate(&self.current) - success_rate(&self.previous)
    }

    pub fn failure_rate_delta(&self) -> f64 {
        failure_rate(&self.current) - failure_rate(&self.previous)
    }
}

fn terminal_total(s: &Snapshot) -> u64 {
    s.succeeded + s.failed
}

pub fn success_rate(s: &Snapshot) -> f64 {
    let total = terminal_total(s);
    if total == 0 {
        0.0
    } else {
        s.succeeded as f64 / total as f64 * 100.0
    }
}

pub fn failure_rate(s: &Snapshot) -> f64 {
    let total = terminal_total(s);
    if total == 0 {
        0.0
    } else {
        s.failed as f64 / total as f64 * 100.0
    }
}

/// Percentage change from `prev` to `cur`; a move from zero counts as a
/// full swing rather than a division blowup.
pub fn delta_pct(cur: f64, prev: f64) -> f64 {
    if prev == 0.0 {
        if cur > 0.0 {
            100.0
        } else {
            0.0
        }
    } else {
        (cur - prev) / prev * 100.0
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn signed(value: f64) -> String {
    format!("{value:+.1}")
}

/// Render the weekly summary. `week_label` names the reporting week in
/// the subject line and heading, e.g. `2025-W33`.
pub fn render_weekly(cmp: &WeekComparison, week_label: &str) -> String {
    let cur = &cmp.current;
    let mut html = String::with_capacity(4096);
    html.push_str(&format!(
        "<html><body style=\"font-family:sans-serif\">\
         <h2>Install telemetry weekly report: {}</h2>",
        escape(week_label)
    ));
    html.push_str(&format!(
        "<p>{} installations finished this week ({} succeeded, {} failed; \
         volume {}% week over week).</p>",
        terminal_total(cur),
        cur.succeeded,
        cur.failed,
        signed(cmp.volume_delta_pct()),
    ));
    html.push_str(&format!(
        "<p>Success rate {:.1}% ({} pts), failure rate {:.1}% ({} pts).</p>",
        success_rate(cur),
        signed(cmp.success_rate_delta()),
        failure_rate(cur),
        signed(cmp.failure_rate_delta()),
    ));

    html.push_str("<h3>Top applications</h3><ol>");
    for entry in cur.top_apps.iter().take(10) {
        html.push_str(&format!(
            "<li>{}: {} installs</li>",
            escape(&entry.name),
            entry.count
        ));
    }
    html.push_str("</ol>");

    if !cur.failure_rates.is_empty() {
        html.push_str("<h3>Highest failure rates</h3><ol>");
        for rate in cur.failure_rates.iter().take(5) {
            html.push_str(&format!(
                "<li>{}: {:.1}% of {} installs</li>",
                escape(&rate.subject),
                rate.rate_pct,
                rate.total
            ));
        }
        html.push_str("</ol>");
    }

    if !cur.error_clusters.is_empty() {
        html.push_str("<h3>Failure classes</h3><ul>");
        for cluster in cur.error_clusters.iter().take(5) {
            html.push_str(&format!(
                "<li>{}: {} affected applications</li>",
                escape(&cluster.label),
                cluster.app_count
            ));
        }
        html.push_str("</ul>");
    }

    html.push_str("<h3>Distribution</h3><table border=\"0\" cellpadding=\"4\"><tr><th align=\"left\">Type</th><th align=\"left\">Count</th></tr>");
    for entry in &cur.kinds {
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td></tr>",
            escape(&entry.name),
            entry.count
        ));
    }
    for entry in &cur.os_mix {
        html.push_str(&format!(
            "<tr><td>{}</td><td>{}</td></tr>",
            escape(&entry.name),
            entry.count
        ));
    }
    html.push_str("</table></body></html>");
    html
}
