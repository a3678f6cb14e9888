use std::path::{Path, PathBuf};

use anyhow::Context;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Caller-held record of which references a remix session has already tried.
///
/// References are identified by file name so that the same product keeps its
/// identity if the floors folder moves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemixHistory {
    #[serde(default)]
    pub used: Vec<String>,
}

impl RemixHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Missing or unreadable state starts a fresh history.
    pub fn load(path: &Path) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Self::new();
        };
        let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(&raw) else {
            return Self::new();
        };
        let used = obj
            .get("used")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Self { used }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("failed to write remix state {}", path.display()))?;
        Ok(())
    }

    pub fn is_used(&self, candidate: &Path) -> bool {
        let name = reference_name(candidate);
        self.used.iter().any(|existing| *existing == name)
    }

    pub fn record(&mut self, candidate: &Path) {
        let name = reference_name(candidate);
        if !self.used.contains(&name) {
            self.used.push(name);
        }
    }

    pub fn reset(&mut self) {
        self.used.clear();
    }

    pub fn remaining<'a>(&self, candidates: &'a [PathBuf]) -> Vec<&'a PathBuf> {
        candidates
            .iter()
            .filter(|candidate| !self.is_used(candidate))
            .collect()
    }

    /// A random candidate not tried yet, or `None` once every one has been used.
    pub fn pick_unused<'a, R: Rng + ?Sized>(
        &self,
        candidates: &'a [PathBuf],
        rng: &mut R,
    ) -> Option<&'a PathBuf> {
        self.remaining(candidates).choose(rng).copied()
    }
}

fn reference_name(path: &Path) -> String {
    path.file_name()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}
