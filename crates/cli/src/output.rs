//! Output formatting for alive detection reports

use anyhow::Result;
use serde_json::json;
use std::time::Duration;

use boreas_alive::DetectionReport;
use boreas_common::{ScanRestrictions, TargetList};

/// Print the report in the specified format
pub fn print_report(
    report: &DetectionReport,
    targets: &TargetList,
    restrictions: &ScanRestrictions,
    format: &str,
) -> Result<()> {
    let format = format.trim().to_lowercase();
    match format.as_str() {
        "json" | "j" => println!("{}", render_json(report, targets, restrictions)?),
        "csv" | "c" => print!("{}", render_csv(report)),
        "table" | "text" | "t" | "" => print!("{}", render_table(report, targets, restrictions)),
        _ => {
            eprintln!("Warning: Unknown format '{}', using default table format", format);
            print!("{}", render_table(report, targets, restrictions));
        }
    }
    Ok(())
}

fn run_duration(report: &DetectionReport) -> Duration {
    (report.finished_at - report.started_at)
        .to_std()
        .unwrap_or_default()
}

fn render_table(
    report: &DetectionReport,
    targets: &TargetList,
    restrictions: &ScanRestrictions,
) -> String {
    let mut out = String::new();
    if report.emitted.is_empty() && report.capped.is_empty() {
        out.push_str("\nNo alive hosts found.\n\n");
    } else {
        out.push_str(&format!("\n{:-<60}\n", ""));
        out.push_str(&format!("{:<40} {:<18}\n", "HOST", "STATE"));
        out.push_str(&format!("{:-<60}\n", ""));
        for record in &report.emitted {
            let label = match targets.get(record.host).and_then(|h| h.name.as_deref()) {
                Some(name) => format!("{} ({})", record.addr, name),
                None => record.addr.clone(),
            };
            out.push_str(&format!("{:<40} {:<18}\n", label, "alive"));
        }
        for addr in &report.capped {
            out.push_str(&format!("{:<40} {:<18}\n", addr, "alive (capped)"));
        }
        out.push_str(&format!("{:-<60}\n", ""));
    }

    let max = match restrictions.get_max_scan_hosts() {
        usize::MAX => "unlimited".to_string(),
        n => n.to_string(),
    };
    out.push_str("\nSummary:\n");
    out.push_str(&format!("  Targets: {}\n", targets.len()));
    out.push_str(&format!("  Alive: {}\n", report.emitted.len()));
    out.push_str(&format!("  Capped: {}\n", report.capped.len()));
    if report.considered_alive > 0 {
        out.push_str(&format!("  Considered alive: {}\n", report.considered_alive));
    }
    out.push_str(&format!(
        "  Probes sent: {} ({} failed)\n",
        report.send.probes_sent, report.send.probes_failed
    ));
    out.push_str(&format!(
        "  Frames captured: {} ({} matched)\n",
        report.capture.frames_read, report.capture.frames_matched
    ));
    out.push_str(&format!(
        "  Alive count / max: {} / {}{}\n",
        restrictions.get_alive_hosts_count(),
        max,
        if restrictions.max_scan_hosts_reached() {
            " (reached)"
        } else {
            ""
        }
    ));
    if report.cancelled {
        out.push_str("  Interrupted: partial results\n");
    }
    out.push_str(&format!(
        "  Duration: {}\n\n",
        format_duration(run_duration(report))
    ));
    out
}

fn render_json(
    report: &DetectionReport,
    targets: &TargetList,
    restrictions: &ScanRestrictions,
) -> Result<String> {
    let max = restrictions.get_max_scan_hosts();
    let output = json!({
        "run": {
            "id": report.run_id,
            "tests": report.selector.to_string(),
            "started_at": report.started_at,
            "finished_at": report.finished_at,
            "duration_seconds": run_duration(report).as_secs_f64(),
            "cancelled": report.cancelled,
            "total_targets": targets.len(),
        },
        "alive": report.emitted.iter().map(|r| &r.addr).collect::<Vec<_>>(),
        "capped": report.capped,
        "observed_non_targets": report.observed_non_targets,
        "restrictions": {
            "alive_hosts_count": restrictions.get_alive_hosts_count(),
            "max_scan_hosts": (max != usize::MAX).then_some(max),
            "max_scan_hosts_reached": restrictions.max_scan_hosts_reached(),
        },
        "send": report.send,
        "capture": report.capture,
    });
    Ok(serde_json::to_string_pretty(&output)?)
}

fn render_csv(report: &DetectionReport) -> String {
    let mut out = String::from("ip,state\n");
    for record in &report.emitted {
        out.push_str(&format!("{},alive\n", record.addr));
    }
    for addr in &report.capped {
        out.push_str(&format!("{},capped\n", addr));
    }
    out
}

/// Format duration in a human-readable way
fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if total_secs == 0 {
        format!("{}ms", millis)
    } else if total_secs < 60 {
        if millis > 0 {
            format!("{}.{:03}s", total_secs, millis)
        } else {
            format!("{}s", total_secs)
        }
    } else {
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    }
}
