use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Number of runs a logbook keeps; older entries are dropped first.
pub const MAX_LOGBOOK_RUNS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum RunStatus {
    Ok = 0,
    Error = 1,
}

/// Record of a single scraper run, handed to finalize by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLog {
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub status_code: i32,
}

impl RunLog {
    pub fn start_now() -> Self {
        Self::started_at(Utc::now())
    }

    pub fn started_at(start: DateTime<Utc>) -> Self {
        Self {
            start,
            end: None,
            duration_secs: None,
            log: String::new(),
            error: String::new(),
            status_code: RunStatus::Ok as i32,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.end.is_some()
    }

    pub fn finish(&mut self) {
        self.finish_at(Utc::now());
    }

    pub fn finish_at(&mut self, end: DateTime<Utc>) {
        self.end = Some(end);
        self.duration_secs = Some((end - self.start).num_milliseconds() as f64 / 1000.0);
        if !self.error.is_empty() {
            self.status_code = RunStatus::Error as i32;
        }
    }
}

/// Rolling history of runs for one council, stored as JSON next to its data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Logbook {
    pub name: String,
    #[serde(default)]
    pub runs: Vec<serde_json::Value>,
}

impl Logbook {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            runs: Vec::new(),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn to_pretty_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    /// Append a run, dropping the oldest entries beyond [`MAX_LOGBOOK_RUNS`].
    pub fn push_run(&mut self, run: serde_json::Value) {
        self.runs.push(run);
        if self.runs.len() > MAX_LOGBOOK_RUNS {
            let excess = self.runs.len() - MAX_LOGBOOK_RUNS;
            self.runs.drain(..excess);
        }
    }
}
