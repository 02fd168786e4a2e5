//! Coding and consolidation progress reporting.
//!
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.
//! Log output from `tracing` also goes to stderr; use `--progress off` or
//! `RUST_LOG=warn` to keep the two from interleaving.

use std::io::Write;

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// Thread `n` of `total` is being coded.
    Coding { thread: String, n: u64, total: u64 },
    /// A consolidation iteration finished with `codes` live codes.
    Consolidating { iteration: usize, codes: u64 },
}

/// Reports progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "code thread-7  12 / 1,204 threads".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Coding { thread, n, total } => format!(
                "code {}  {} / {} threads\n",
                thread,
                format_number(*n),
                format_number(*total)
            ),
            ProgressEvent::Consolidating { iteration, codes } => format!(
                "consolidate  iteration {}  {} codes\n",
                iteration,
                format_number(*codes)
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        if let Ok(line) = serde_json::to_string(&event_json(&event)) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

fn event_json(event: &ProgressEvent) -> serde_json::Value {
    match event {
        ProgressEvent::Coding { thread, n, total } => serde_json::json!({
            "event": "progress",
            "phase": "coding",
            "thread": thread,
            "n": n,
            "total": total
        }),
        ProgressEvent::Consolidating { iteration, codes } => serde_json::json!({
            "event": "progress",
            "phase": "consolidating",
            "iteration": iteration,
            "codes": codes
        }),
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

    /// Parse `off`, `human`, or `json`; `None` picks the TTY default.
    pub fn from_flag(flag: Option<&str>) -> anyhow::Result<Self> {
        match flag {
            None => Ok(Self::default_for_tty()),
            Some("off") => Ok(ProgressMode::Off),
            Some("human") => Ok(ProgressMode::Human),
            Some("json") => Ok(ProgressMode::Json),
            Some(other) => anyhow::bail!("Unknown progress mode '{}': use off, human, or json", other),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn progress_flag_parsing() {
        assert_eq!(ProgressMode::from_flag(Some("json")).unwrap(), ProgressMode::Json);
        assert_eq!(ProgressMode::from_flag(Some("off")).unwrap(), ProgressMode::Off);
        assert!(ProgressMode::from_flag(Some("loud")).is_err());
    }

    #[test]
    fn json_events_name_their_phase() {
        let coding = event_json(&ProgressEvent::Coding {
            thread: "t1".into(),
            n: 1,
            total: 3,
        });
        assert_eq!(coding["phase"], "coding");
        assert_eq!(coding["total"], 3);
        let merging = event_json(&ProgressEvent::Consolidating {
            iteration: 2,
            codes: 40,
        });
        assert_eq!(merging["phase"], "consolidating");
        assert_eq!(merging["codes"], 40);
    }
}
