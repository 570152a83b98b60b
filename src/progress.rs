//! Analysis progress reporting.
//!
//! Two ways to observe a running analysis, neither of which assumes a UI
//! event loop:
//!
//! - **push**: a [`ProgressReporter`] receives [`ProgressEvent`]s as the
//!   engine advances (human or JSON lines on stderr, or nothing);
//! - **pull**: [`ProgressState`] holds the latest position in atomics and
//!   hands out [`ProgressSnapshot`]s to whoever polls.
//!
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Phase of an analysis run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Idle,
    /// Reading every record from the store.
    Loading,
    /// Seed scans over the record set. Counts known.
    Comparing,
    /// Building merged content for each cluster.
    Synthesizing,
    Done,
}

impl Phase {
    fn as_u8(self) -> u8 {
        match self {
            Phase::Idle => 0,
            Phase::Loading => 1,
            Phase::Comparing => 2,
            Phase::Synthesizing => 3,
            Phase::Done => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Phase::Loading,
            2 => Phase::Comparing,
            3 => Phase::Synthesizing,
            4 => Phase::Done,
            _ => Phase::Idle,
        }
    }
}

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    Loading,
    /// `n` seeds processed out of `total` records.
    Comparing { n: u64, total: u64 },
    Synthesizing { clusters: u64 },
    Done { clusters: u64 },
}

/// Receives progress events. Called from the clustering engine.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "analyze  comparing  1,200 / 5,000 records".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Loading => "analyze  loading records...\n".to_string(),
            ProgressEvent::Comparing { n, total } => format!(
                "analyze  comparing  {} / {} records\n",
                format_number(*n),
                format_number(*total)
            ),
            ProgressEvent::Synthesizing { clusters } => format!(
                "analyze  synthesizing  {} clusters\n",
                format_number(*clusters)
            ),
            ProgressEvent::Done { clusters } => {
                format!("analyze  done  {} clusters\n", format_number(*clusters))
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Loading => serde_json::json!({
                "event": "progress",
                "phase": "loading"
            }),
            ProgressEvent::Comparing { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "comparing",
                "n": n,
                "total": total
            }),
            ProgressEvent::Synthesizing { clusters } => serde_json::json!({
                "event": "progress",
                "phase": "synthesizing",
                "clusters": clusters
            }),
            ProgressEvent::Done { clusters } => serde_json::json!({
                "event": "progress",
                "phase": "done",
                "clusters": clusters
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Point-in-time view of [`ProgressState`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProgressSnapshot {
    pub phase: Phase,
    pub processed: u64,
    pub total: u64,
}

impl ProgressSnapshot {
    /// Fraction complete in `[0, 1]`; `0` while the total is unknown.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.processed as f64 / self.total as f64).min(1.0)
        }
    }
}

/// Pull-based progress: updated by the engine, polled by the caller.
#[derive(Debug, Default)]
pub struct ProgressState {
    phase: AtomicU8,
    processed: AtomicU64,
    total: AtomicU64,
}

impl ProgressState {
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            phase: Phase::from_u8(self.phase.load(Ordering::Acquire)),
            processed: self.processed.load(Ordering::Acquire),
            total: self.total.load(Ordering::Acquire),
        }
    }

    pub fn reset(&self) {
        self.set_phase(Phase::Idle);
        self.processed.store(0, Ordering::Release);
        self.total.store(0, Ordering::Release);
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase.as_u8(), Ordering::Release);
    }
}

/// Forwards events to a reporter while mirroring them into a [`ProgressState`].
pub struct Tracked<'a> {
    pub state: &'a ProgressState,
    pub reporter: &'a dyn ProgressReporter,
}

impl ProgressReporter for Tracked<'_> {
    fn report(&self, event: ProgressEvent) {
        match &event {
            ProgressEvent::Loading => self.state.set_phase(Phase::Loading),
            ProgressEvent::Comparing { n, total } => {
                self.state.total.store(*total, Ordering::Release);
                self.state.processed.store(*n, Ordering::Release);
                self.state.set_phase(Phase::Comparing);
            }
            ProgressEvent::Synthesizing { .. } => self.state.set_phase(Phase::Synthesizing),
            ProgressEvent::Done { .. } => self.state.set_phase(Phase::Done),
        }
        self.reporter.report(event);
    }
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

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
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
