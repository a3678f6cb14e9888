use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one room × reference pair inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairOutcome {
    pub room: String,
    pub reference: String,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub session_id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub pairs: Vec<PairOutcome>,
}

impl BatchSummary {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            started_at: now_utc_iso(),
            finished_at: None,
            attempted: 0,
            succeeded: 0,
            failed: 0,
            pairs: Vec::new(),
        }
    }

    pub fn record_success(&mut self, room: &str, reference: &str, outputs: Vec<String>) {
        self.attempted += 1;
        self.succeeded += 1;
        self.pairs.push(PairOutcome {
            room: room.to_string(),
            reference: reference.to_string(),
            outputs,
            error: None,
        });
    }

    pub fn record_failure(&mut self, room: &str, reference: &str, error: impl Into<String>) {
        self.attempted += 1;
        self.failed += 1;
        self.pairs.push(PairOutcome {
            room: room.to_string(),
            reference: reference.to_string(),
            outputs: Vec::new(),
            error: Some(error.into()),
        });
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(now_utc_iso());
    }
}

pub fn write_summary(path: &Path, summary: &BatchSummary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(summary)?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
