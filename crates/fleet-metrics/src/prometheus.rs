//! Prometheus text exposition format.
//!
//! Renders decision counters and ledger state into the Prometheus text
//! exposition format for scraping by a Prometheus server or compatible agent.

use fleet_state::LedgerSnapshot;

use crate::collector::GroupCounters;

/// Render counters and per-group ledger snapshots into Prometheus text format.
///
/// Produces COUNTER metrics for decisions and events and GAUGE metrics for
/// the current period and failure window, all with `group` labels.
pub fn render_prometheus(counters: &[GroupCounters], ledgers: &[LedgerSnapshot]) -> String {
    let mut out = String::new();

    out.push_str("# HELP fleet_check_ins_total Check-in decisions by status.\n");
    out.push_str("# TYPE fleet_check_ins_total counter\n");
    for c in counters {
        for (status, value) in c.check_ins() {
            out.push_str(&format!(
                "fleet_check_ins_total{{group=\"{}\",status=\"{}\"}} {}\n",
                escape_label(&c.group_id), status, value
            ));
        }
    }

    out.push_str("# HELP fleet_events_total Event reports by result.\n");
    out.push_str("# TYPE fleet_events_total counter\n");
    for c in counters {
        out.push_str(&format!(
            "fleet_events_total{{group=\"{}\",result=\"success\"}} {}\n",
            escape_label(&c.group_id), c.events_ok
        ));
        out.push_str(&format!(
            "fleet_events_total{{group=\"{}\",result=\"error\"}} {}\n",
            escape_label(&c.group_id), c.events_failed
        ));
    }

    out.push_str("# HELP fleet_rejected_requests_total Requests answered with an error.\n");
    out.push_str("# TYPE fleet_rejected_requests_total counter\n");
    for c in counters {
        out.push_str(&format!(
            "fleet_rejected_requests_total{{group=\"{}\"}} {}\n",
            escape_label(&c.group_id), c.rejected
        ));
    }

    out.push_str("# HELP fleet_period_granted Updates granted in the current period.\n");
    out.push_str("# TYPE fleet_period_granted gauge\n");
    for l in ledgers {
        out.push_str(&format!(
            "fleet_period_granted{{group=\"{}\"}} {}\n",
            escape_label(&l.group_id), l.granted
        ));
    }

    out.push_str("# HELP fleet_failure_ratio Failure ratio over the trailing window (0.0-1.0).\n");
    out.push_str("# TYPE fleet_failure_ratio gauge\n");
    for l in ledgers {
        out.push_str(&format!(
            "fleet_failure_ratio{{group=\"{}\"}} {:.4}\n",
            escape_label(&l.group_id),
            l.failure_ratio()
        ));
    }

    out.push_str("# HELP fleet_rollout_halted Whether safe mode has halted the group.\n");
    out.push_str("# TYPE fleet_rollout_halted gauge\n");
    for l in ledgers {
        out.push_str(&format!(
            "fleet_rollout_halted{{group=\"{}\"}} {}\n",
            escape_label(&l.group_id),
            u8::from(l.halted)
        ));
    }

    out
}

/// Escape a label value per the text exposition format.
fn escape_label(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters(group: &str) -> GroupCounters {
        GroupCounters {
            group_id: group.to_string(),
            update: 7,
            throttled: 3,
            events_ok: 5,
            events_failed: 2,
            ..Default::default()
        }
    }

    fn ledger(group: &str) -> LedgerSnapshot {
        LedgerSnapshot {
            granted: 7,
            successes: 6,
            failures: 2,
            halted: true,
            ..LedgerSnapshot::empty(group, 3600)
        }
    }

    #[test]
    fn render_empty() {
        let output = render_prometheus(&[], &[]);
        assert!(output.contains("# HELP fleet_check_ins_total"));
        assert!(output.contains("# TYPE fleet_period_granted gauge"));
    }

    #[test]
    fn render_single_group() {
        let output = render_prometheus(&[counters("prod")], &[ledger("prod")]);
        assert!(output.contains("fleet_check_ins_total{group=\"prod\",status=\"update\"} 7"));
        assert!(output.contains("fleet_check_ins_total{group=\"prod\",status=\"throttled\"} 3"));
        assert!(output.contains("fleet_check_ins_total{group=\"prod\",status=\"no-update\"} 0"));
        assert!(output.contains("fleet_events_total{group=\"prod\",result=\"error\"} 2"));
        assert!(output.contains("fleet_period_granted{group=\"prod\"} 7"));
        assert!(output.contains("fleet_failure_ratio{group=\"prod\"} 0.2500"));
        assert!(output.contains("fleet_rollout_halted{group=\"prod\"} 1"));
    }

    #[test]
    fn group_label_is_escaped() {
        let hostile = "x\"} 1\nfake_metric{a=\"b\\";
        let output = render_prometheus(&[counters(hostile)], &[ledger(hostile)]);
        assert!(!output.lines().any(|l| l.starts_with("fake_metric")));
        assert!(output.contains(
            "fleet_period_granted{group=\"x\\\"} 1\\nfake_metric{a=\\\"b\\\\\"} 7"
        ));
    }

    #[test]
    fn render_format_is_prometheus_compatible() {
        let output = render_prometheus(&[counters("a"), counters("b")], &[ledger("a")]);
        for line in output.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            assert!(
                line.contains('{') && line.contains('}'),
                "line should have labels: {line}"
            );
        }
    }
}
