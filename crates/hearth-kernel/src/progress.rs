//! Copy-program progress parsing.
//!
//! The copy program (rsync with `--info=progress2`) reports whole-transfer
//! progress as carriage-return separated lines:
//!
//! ```text
//!     1,238,099  44%  140.02kB/s    0:00:05 (xfr#3, to-chk=12/20)
//! ```
//!
//! Everything stringly-typed lives here. [`parse_progress_line`] turns one
//! line into a [`ProgressSample`] or `None`; [`ProgressTracker`] folds samples
//! into monotonic [`TransferProgress`] for a job; [`ProgressLineCodec`] splits
//! the raw byte stream on both `\r` and `\n`.

use std::sync::LazyLock;

use hearth_types::TransferProgress;
use regex::Regex;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

static PROGRESS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([\d,.]+)\s+(\d{1,3})%\s+([\d.]+)([kKMGT]?B)/s")
        .expect("progress regex is valid")
});

/// One parsed progress line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSample {
    pub bytes_copied: u64,
    pub percent: u8,
    pub bytes_per_second: u64,
}

impl ProgressSample {
    /// `round(bytes / percent * 100)`; unknown at 0%.
    pub fn total_bytes(&self) -> Option<u64> {
        if self.percent == 0 {
            return None;
        }
        Some((self.bytes_copied as f64 / f64::from(self.percent) * 100.0).round() as u64)
    }

    /// `round((total - copied) / rate)`; unknown when the rate is zero.
    pub fn seconds_remaining(&self) -> Option<u64> {
        let total = self.total_bytes()?;
        if self.bytes_per_second == 0 {
            return None;
        }
        let remaining = total.saturating_sub(self.bytes_copied) as f64;
        let secs = (remaining / self.bytes_per_second as f64).round();
        secs.is_finite().then_some(secs as u64)
    }
}

fn unit_multiplier(unit: &str) -> f64 {
    match unit {
        "kB" | "KB" => 1024.0,
        "MB" => 1024.0 * 1024.0,
        "GB" => 1024.0 * 1024.0 * 1024.0,
        "TB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => 1.0,
    }
}

/// Parse a single progress line. Returns `None` for anything that is not a
/// progress line (file names, summaries, blank lines).
pub fn parse_progress_line(line: &str) -> Option<ProgressSample> {
    let caps = PROGRESS_LINE.captures(line)?;

    let digits: String = caps[1].chars().filter(char::is_ascii_digit).collect();
    let bytes_copied = digits.parse::<u64>().ok()?;

    let percent = caps[2].parse::<u8>().ok().filter(|p| *p <= 100)?;

    let rate = caps[3].parse::<f64>().ok()?;
    let bytes_per_second = (rate * unit_multiplier(&caps[4])).round();
    if !bytes_per_second.is_finite() {
        return None;
    }

    Some(ProgressSample {
        bytes_copied,
        percent,
        bytes_per_second: bytes_per_second as u64,
    })
}

/// Folds per-source samples into job-wide progress.
///
/// A job with several sources runs the copy program once per source; each run
/// reports 0–100 for its own source. The tracker maps that onto the job's
/// overall range, never lets `percent` go backwards, and holds it below 100
/// until [`ProgressTracker::finish`].
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    sources: usize,
    current: usize,
    last: TransferProgress,
}

impl ProgressTracker {
    pub fn new(sources: usize) -> Self {
        Self {
            sources: sources.max(1),
            current: 0,
            last: TransferProgress::default(),
        }
    }

    /// Move on to source `index` (0-based).
    pub fn begin_source(&mut self, index: usize) {
        self.current = index.min(self.sources - 1);
        self.raise_to(self.current * 100 / self.sources);
    }

    pub fn current(&self) -> TransferProgress {
        self.last
    }

    /// Apply a sample; returns the new progress.
    pub fn observe(&mut self, sample: &ProgressSample) -> TransferProgress {
        let overall = (self.current * 100 + usize::from(sample.percent)) / self.sources;
        self.raise_to(overall);
        self.last.bytes_per_second = sample.bytes_per_second;
        self.last.seconds_remaining = sample.seconds_remaining();
        self.last
    }

    /// The job succeeded: exactly 100.
    pub fn finish(&mut self) -> TransferProgress {
        self.last = TransferProgress::complete();
        self.last
    }

    fn raise_to(&mut self, percent: usize) {
        let capped = percent.min(99) as u8;
        if capped > self.last.percent {
            self.last.percent = capped;
        }
    }
}

/// Splits copy-program output on `\r` or `\n`, yielding non-empty lines.
#[derive(Debug, Default, Clone)]
pub struct ProgressLineCodec;

impl Decoder for ProgressLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        loop {
            let Some(end) = src.iter().position(|b| *b == b'\r' || *b == b'\n') else {
                return Ok(None);
            };
            let line = src.split_to(end + 1);
            let text = String::from_utf8_lossy(&line[..end]).trim().to_string();
            if !text.is_empty() {
                return Ok(Some(text));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        Ok((!text.is_empty()).then_some(text))
    }
}
