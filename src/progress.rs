//! Run progress reporting.
//!
//! Reports what a pipeline run is doing so users see how many units were
//! indexed, how many are done, and the final tally. Progress is emitted on
//! **stderr** so stdout remains parseable for scripts. This is separate
//! from `tracing` diagnostics: a reporter prints one line per event and
//! nothing else.

use std::io::Write;

/// A single progress event for a run.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProgressEvent {
    /// The indexer has produced `total` units so far.
    Indexed { connector: String, total: u64 },
    /// `n` units reached a terminal state, `failed` of them failed.
    Processed { connector: String, n: u64, failed: u64 },
    /// The run is over.
    Finished {
        connector: String,
        succeeded: u64,
        failed: u64,
        skipped: u64,
    },
}

/// Receives progress events from the pipeline.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "ingest local  processed  1,234 units (2 failed)".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Indexed { connector, total } => {
                format!("ingest {}  indexed  {} units\n", connector, format_number(*total))
            }
            ProgressEvent::Processed { connector, n, failed } => format!(
                "ingest {}  processed  {} units ({} failed)\n",
                connector,
                format_number(*n),
                format_number(*failed)
            ),
            ProgressEvent::Finished {
                connector,
                succeeded,
                failed,
                skipped,
            } => format!(
                "ingest {}  done  {} succeeded, {} failed, {} skipped\n",
                connector,
                format_number(*succeeded),
                format_number(*failed),
                format_number(*skipped)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JsonProgress {
    fn to_json(event: &ProgressEvent) -> serde_json::Value {
        match event {
            ProgressEvent::Indexed { connector, total } => serde_json::json!({
                "event": "progress",
                "connector": connector,
                "phase": "indexed",
                "total": total
            }),
            ProgressEvent::Processed { connector, n, failed } => serde_json::json!({
                "event": "progress",
                "connector": connector,
                "phase": "processed",
                "n": n,
                "failed": failed
            }),
            ProgressEvent::Finished {
                connector,
                succeeded,
                failed,
                skipped,
            } => serde_json::json!({
                "event": "finished",
                "connector": connector,
                "succeeded": succeeded,
                "failed": failed,
                "skipped": skipped
            }),
        }
    }
}

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        if let Ok(line) = serde_json::to_string(&Self::to_json(&event)) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
