//! CLI output formatting.
//!
//! Each result type has a `format_*` function (returns `Vec<String>`) for
//! testability and, where the CLI needs it, a `print_*` wrapper that writes to
//! stdout. Format functions are pure: no I/O, no side effects.
//!
//! # Output Format
//!
//! ## Bake
//!
//! ```text
//! chart: 412 records
//!     cached chart:life-expectancy
//!     rendered chart:gdp
//!         grapher/gdp.html
//!         grapher/exports/gdp.svg
//!     FAILED post:draft-notes: renderer `page` failed (exit Some(1)): ...
//!     removed grapher/old-chart.html
//!
//! Baked 1 record, 410 cached, 4 derivative files, 1 removed
//! Cache: 410 cached, 1 rendered, 1 failed (412 total)
//! Failures
//!     post:draft-notes [render] renderer `page` failed ...
//! ```
//!
//! ## Queue
//!
//! ```text
//! Queue: 3 entries
//! Pending: 2 entries (previous deploy did not finish)
//! ```

use crate::bake::{BakeEvent, BakeReport};
use crate::deploy::DrainOutcome;
use crate::queue::QueueStatus;
use crate::watch::WatchEvent;

/// Longest error text shown inline before truncation.
const MAX_INLINE_ERROR: usize = 120;

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// Truncate text to `max` characters, appending `...` if truncated.
fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

/// Only the first line of a multi-line error.
fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

fn plural(n: usize, one: &str, many: &str) -> String {
    if n == 1 {
        format!("{n} {one}")
    } else {
        format!("{n} {many}")
    }
}

// ============================================================================
// Bake
// ============================================================================

/// Format a single bake progress event as display lines.
pub fn format_bake_event(event: &BakeEvent) -> Vec<String> {
    match event {
        BakeEvent::Enumerated { kind, count } => {
            vec![format!("{kind}: {}", plural(*count, "record", "records"))]
        }
        BakeEvent::Cached { key } => vec![format!("{}cached {key}", indent(1))],
        BakeEvent::Rendered { key, paths } => {
            let mut lines = vec![format!("{}rendered {key}", indent(1))];
            lines.extend(paths.iter().map(|p| format!("{}{p}", indent(2))));
            lines
        }
        BakeEvent::Failed { key, error } => vec![format!(
            "{}FAILED {key}: {}",
            indent(1),
            truncate(first_line(error), MAX_INLINE_ERROR)
        )],
        BakeEvent::Removed { path } => vec![format!("{}removed {path}", indent(1))],
    }
}

/// Format the end-of-run summary of a bake.
pub fn format_bake_report(report: &BakeReport) -> Vec<String> {
    let mut lines = vec![
        String::new(),
        format!(
            "Baked {}, {} cached, {}, {} removed",
            plural(report.rendered.len(), "record", "records"),
            report.clean,
            plural(report.derivatives.len(), "derivative file", "derivative files"),
            report.deleted.len()
        ),
        format!("Cache: {}", report.cache_stats),
    ];
    if !report.failures.is_empty() {
        lines.push("Failures".to_string());
        for failure in &report.failures {
            lines.push(format!(
                "{}{} [{}] {}",
                indent(1),
                failure.key(),
                failure.class,
                truncate(first_line(&failure.message), MAX_INLINE_ERROR)
            ));
        }
    }
    lines
}

pub fn print_bake_report(report: &BakeReport) {
    for line in format_bake_report(report) {
        println!("{}", line);
    }
}

// ============================================================================
// Queue and deploy
// ============================================================================

pub fn format_queue_status(status: &QueueStatus) -> Vec<String> {
    let mut lines = vec![format!(
        "Queue: {}",
        plural(status.queued, "entry", "entries")
    )];
    match status.pending {
        Some(n) => lines.push(format!(
            "Pending: {} (previous deploy did not finish)",
            plural(n, "entry", "entries")
        )),
        None => lines.push("Pending: none".to_string()),
    }
    lines
}

pub fn print_queue_status(status: &QueueStatus) {
    for line in format_queue_status(status) {
        println!("{}", line);
    }
}

pub fn format_drain_outcome(outcome: &DrainOutcome) -> Vec<String> {
    match outcome {
        DrainOutcome::AlreadyRunning => vec!["Deploy already in progress".to_string()],
        DrainOutcome::Drained { published: 0 } => vec!["Nothing to deploy".to_string()],
        DrainOutcome::Drained { published } => vec![format!(
            "Deployed {}",
            plural(*published, "batch", "batches")
        )],
        DrainOutcome::GaveUp {
            published,
            failures,
            last_error,
        } => vec![
            format!(
                "Deploy failed {failures} times in a row, giving up ({} deployed before)",
                plural(*published, "batch", "batches")
            ),
            format!(
                "{}{}",
                indent(1),
                truncate(first_line(last_error), MAX_INLINE_ERROR)
            ),
            format!(
                "{}pending batch kept; it is retried on the next trigger",
                indent(1)
            ),
        ],
    }
}

pub fn print_drain_outcome(outcome: &DrainOutcome) {
    for line in format_drain_outcome(outcome) {
        println!("{}", line);
    }
}

pub fn format_watch_event(event: &WatchEvent) -> Vec<String> {
    match event {
        WatchEvent::Started { recovering: true } => {
            vec!["Watching queue (unfinished deploys found, deploying now)".to_string()]
        }
        WatchEvent::Started { recovering: false } => vec!["Watching queue".to_string()],
        WatchEvent::Changed => vec![format!("{}queue changed", indent(1))],
        WatchEvent::Triggered => vec![format!("{}deploying", indent(1))],
        WatchEvent::Finished(outcome) => format_drain_outcome(outcome)
            .into_iter()
            .map(|l| format!("{}{l}", indent(1)))
            .collect(),
        WatchEvent::DrainFailed(error) => vec![format!(
            "{}drain aborted: {}",
            indent(1),
            truncate(first_line(error), MAX_INLINE_ERROR)
        )],
    }
}
