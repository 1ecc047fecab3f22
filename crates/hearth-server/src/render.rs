//! Human-readable output for the command surface.

use chrono::DateTime;
use hearth_types::{
    DirectoryListing, FileKind, FileSystemItem, RepositoryCandidate, RepositoryStatus, Snapshot,
    TransferJob, TransferProgress,
};
use serde::Serialize;

/// Print `value` as pretty JSON, or through `human`.
pub fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

/// 1024-based sizes: `512 B`, `1.5 KiB`, `3.0 GiB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Milliseconds since the epoch as `YYYY-MM-DD HH:MM` (UTC).
pub fn format_millis(millis: i64) -> String {
    DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn kind_marker(kind: FileKind) -> char {
    match kind {
        FileKind::Directory => 'd',
        FileKind::Symlink => 'l',
        FileKind::File => '-',
        FileKind::Other => '?',
    }
}

pub fn item_line(item: &FileSystemItem) -> String {
    let size = if item.kind.is_dir() {
        String::new()
    } else {
        format_size(item.size)
    };
    format!(
        "{} {:>10}  {}  {}",
        kind_marker(item.kind),
        size,
        format_millis(item.modified_at as i64),
        item.name
    )
}

pub fn print_listing(listing: &DirectoryListing) {
    for item in &listing.files {
        println!("{}", item_line(item));
    }
    if let Some(limit) = listing.truncated_at {
        println!("(listing stopped after {limit} entries)");
    }
}

pub fn print_item(item: &FileSystemItem) {
    println!("path:       {}", item.path);
    println!("type:       {:?}", item.kind);
    if let Some(mime) = &item.mime_type {
        println!("mime:       {mime}");
    }
    println!("size:       {}", format_size(item.size));
    println!("modified:   {}", format_millis(item.modified_at as i64));
    let ops: Vec<String> = item.allowed_operations.iter().map(ToString::to_string).collect();
    println!("operations: {}", ops.join(", "));
}

pub fn print_paths(items: &[FileSystemItem]) {
    for item in items {
        println!("{}", item.path);
    }
}

pub fn progress_line(progress: &TransferProgress) -> String {
    let mut line = format!("{:>3}%", progress.percent);
    if progress.bytes_per_second > 0 {
        line.push_str(&format!("  {}/s", format_size(progress.bytes_per_second)));
    }
    if let Some(eta) = progress.seconds_remaining.filter(|_| progress.percent < 100) {
        line.push_str(&format!("  {eta}s left"));
    }
    line
}

pub fn print_job(job: &TransferJob) {
    println!("{} {} [{}] {}", job.kind, job.id.short(), job.state, progress_line(&job.progress));
    for result in &job.results {
        println!("  → {result}");
    }
    if let Some(error) = &job.error {
        println!("  {error}");
    }
}

pub fn print_timeline(snapshots: &[Snapshot]) {
    for snapshot in snapshots {
        if snapshot.id.is_current() {
            println!("{:<28} now", snapshot.id);
        } else {
            println!("{:<28} {}", snapshot.id, format_millis(snapshot.time));
        }
    }
}

pub fn print_candidate(candidate: &RepositoryCandidate) {
    let status = match candidate.status {
        RepositoryStatus::None => "no repository",
        RepositoryStatus::ExistsNotConfigured => "repository found, not configured",
        RepositoryStatus::AlreadyConfigured => "repository already configured",
    };
    match &candidate.repository_path {
        Some(path) => println!("{}: {status} ({path})", candidate.folder),
        None => println!("{}: {status}", candidate.folder),
    }
}
