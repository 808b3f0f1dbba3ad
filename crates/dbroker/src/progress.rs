//! 📊 progress.rs: "Are we there yet?" Every query, every time, forever.
//!
//! None of the four backends tell us up front how many records are coming, so there is no
//! percentage and no ETA here. Just a spinner, a running count, and a rate table so comfy it
//! has lumbar support.
//!
//! ⚠️ Watching this spinner will not make Splunk finish the job faster. We've tried.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::NOTHING};
use indicatif::{ProgressBar, ProgressStyle};

// -- 📏 one mebibyte. not a megabyte. there's a difference and I will die on this hill.
const MIB: u64 = 1024 * 1024;

/// 📦 Human-readable bytes. "1073741824 bytes" is a war crime in a UI.
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= MIB {
        format!("{:.2} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= 1024 {
        format!("{:.2} KiB", bytes as f64 / 1024.0)
    } else {
        format!("{bytes} bytes")
    }
}

/// 🔢 "1000000" → "1,000,000". You're welcome, eyes.
pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// ⏱️ MM:SS, or HH:MM:SS if you should probably call your mom.
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

struct Rates {
    records_per_sec: f64,
    mib_per_sec: f64,
}

/// 📊 Counts records and bytes as they stream past and renders them under a spinner.
///
/// Rates come from a sliding 5-second window so one slow Splunk page doesn't read as a crash.
pub struct ProgressMetrics {
    label: String,
    total_bytes: u64,
    total_records: u64,
    progress_bar: ProgressBar,
    rate_samples: VecDeque<(Instant, u64, u64)>,
    start_time: Instant,
}

impl std::fmt::Debug for ProgressMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // -- ProgressBar doesn't derive Debug. it's a diva.
        f.debug_struct("ProgressMetrics")
            .field("label", &self.label)
            .field("total_bytes", &self.total_bytes)
            .field("total_records", &self.total_records)
            .finish()
    }
}

impl ProgressMetrics {
    /// 🚀 A spinner on stderr labelled with what we're pulling from.
    pub fn new(label: impl Into<String>) -> Self {
        let progress_bar = ProgressBar::new_spinner();
        progress_bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        progress_bar.enable_steady_tick(Duration::from_millis(120));
        Self::with_bar(label.into(), progress_bar)
    }

    /// 🙈 Same bookkeeping, nothing drawn. For pipes, CI, and tests.
    pub fn hidden(label: impl Into<String>) -> Self {
        Self::with_bar(label.into(), ProgressBar::hidden())
    }

    fn with_bar(label: String, progress_bar: ProgressBar) -> Self {
        let start_time = Instant::now();
        let mut rate_samples = VecDeque::new();
        // -- seed the window with t=0 so we don't divide by zero like animals
        rate_samples.push_back((start_time, 0u64, 0u64));
        Self {
            label,
            total_bytes: 0,
            total_records: 0,
            progress_bar,
            rate_samples,
            start_time,
        }
    }

    /// 🔄 Add what just went by and redraw.
    pub fn update(&mut self, bytes: u64, records: u64) {
        self.total_bytes += bytes;
        self.total_records += records;
        let rates = self.calculate_rates();
        self.render(rates);
    }

    pub fn total_records(&self) -> u64 {
        self.total_records
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// ✅ Stop the spinner, leave the last table on screen.
    pub fn finish(&self) {
        self.progress_bar.finish();
    }

    fn calculate_rates(&mut self) -> Rates {
        let now = Instant::now();
        let window = Duration::from_secs(5);
        while let Some(&(timestamp, _, _)) = self.rate_samples.front() {
            if now.duration_since(timestamp) > window {
                self.rate_samples.pop_front();
            } else {
                break;
            }
        }
        self.rate_samples.push_back((now, self.total_bytes, self.total_records));

        if let Some(&(oldest_time, oldest_bytes, oldest_records)) = self.rate_samples.front() {
            let elapsed = now.duration_since(oldest_time).as_secs_f64();
            if elapsed > 0.0 {
                let bytes_delta = self.total_bytes.saturating_sub(oldest_bytes);
                let records_delta = self.total_records.saturating_sub(oldest_records);
                return Rates {
                    records_per_sec: records_delta as f64 / elapsed,
                    mib_per_sec: (bytes_delta as f64 / elapsed) / MIB as f64,
                };
            }
        }
        Rates {
            records_per_sec: 0.0,
            mib_per_sec: 0.0,
        }
    }

    /// 🎨 Two right-aligned columns, no borders:
    /// ```text
    /// <records/s>   <total records>
    /// <MiB/s>       <total bytes>
    /// <elapsed>
    /// ```
    fn render(&self, rates: Rates) {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.add_row(vec![
            Cell::new(format!("{} Records/s", format_number(rates.records_per_sec as u64)))
                .set_alignment(CellAlignment::Right),
            Cell::new(format!("{} Records", format_number(self.total_records)))
                .set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{:.2} MiB/s", rates.mib_per_sec))
                .set_alignment(CellAlignment::Right),
            Cell::new(format_bytes(self.total_bytes)).set_alignment(CellAlignment::Right),
        ]);
        table.add_row(vec![
            Cell::new(format!("{} elapsed", format_duration(self.start_time.elapsed())))
                .set_alignment(CellAlignment::Right),
            Cell::new(""),
        ]);
        self.progress_bar.set_message(format!("{}\n{}", self.label, table));
    }
}
