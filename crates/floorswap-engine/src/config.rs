use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gemini::DEFAULT_API_BASE;
use crate::normalize::DEFAULT_TARGET_LONG_SIDE;

pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-image-preview";
pub const DEFAULT_TEMPERATURE: f64 = 0.1;
pub const DEFAULT_TOP_P: f64 = 0.5;
pub const DEFAULT_REQUEST_TIMEOUT_S: u64 = 120;
pub const DEFAULT_OUTPUTS_DIR: &str = "outputs";
pub const DEFAULT_CORS_ORIGINS: &[&str] = &[
    "http://localhost:3000",
    "http://127.0.0.1:3000",
    "http://localhost:5173",
    "http://127.0.0.1:5173",
    "http://localhost:8501",
    "http://127.0.0.1:8501",
];

/// Everything the engine needs, passed in explicitly. Nothing below the CLI
/// reads the process environment on its own.
#[derive(Clone, PartialEq)]
pub struct EngineConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub seed: Option<i64>,
    pub outputs_dir: PathBuf,
    /// Event log, receipts and run summaries. Never inside `outputs_dir`,
    /// which is served publicly. `None` means a sibling of `outputs_dir`.
    pub records_dir: Option<PathBuf>,
    pub allowed_roots: Vec<PathBuf>,
    pub events_path: Option<PathBuf>,
    pub request_timeout: Duration,
    pub target_long_side: u32,
    pub cors_origins: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            seed: None,
            outputs_dir: PathBuf::from(DEFAULT_OUTPUTS_DIR),
            records_dir: None,
            allowed_roots: Vec::new(),
            events_path: None,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_S),
            target_long_side: DEFAULT_TARGET_LONG_SIDE,
            cors_origins: DEFAULT_CORS_ORIGINS.iter().map(|o| o.to_string()).collect(),
        }
    }
}

// Keeps the API key out of debug output.
impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "<set>"))
            .field("api_base", &self.api_base)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("seed", &self.seed)
            .field("outputs_dir", &self.outputs_dir)
            .field("records_dir", &self.records_dir)
            .field("allowed_roots", &self.allowed_roots)
            .field("events_path", &self.events_path)
            .field("request_timeout", &self.request_timeout)
            .field("target_long_side", &self.target_long_side)
            .field("cors_origins", &self.cors_origins)
            .finish()
    }
}

impl EngineConfig {
    pub fn records_dir(&self) -> PathBuf {
        self.records_dir
            .clone()
            .unwrap_or_else(|| records_dir_for(&self.outputs_dir))
    }

    pub fn receipts_dir(&self) -> PathBuf {
        self.records_dir().join("receipts")
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Blank values count as unset and numbers that
    /// fail to parse keep their default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        let outputs_dir = get("FLOORSWAP_OUTPUTS_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.outputs_dir);
        let records_dir = get("FLOORSWAP_RECORDS_DIR").map(PathBuf::from);
        let events_path = get("FLOORSWAP_EVENTS_PATH").map(PathBuf::from).or_else(|| {
            let records = records_dir
                .clone()
                .unwrap_or_else(|| records_dir_for(&outputs_dir));
            Some(records.join("events.jsonl"))
        });
        let request_timeout_s = get("FLOORSWAP_REQUEST_TIMEOUT_S")
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_S)
            .clamp(5, 600);

        Self {
            api_key: get("GEMINI_API_KEY").or_else(|| get("GOOGLE_API_KEY")),
            api_base: get("GEMINI_API_BASE")
                .map(|value| value.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_base),
            model: get("FLOORSWAP_MODEL").unwrap_or(defaults.model),
            temperature: get("FLOORSWAP_TEMPERATURE")
                .and_then(|raw| raw.parse::<f64>().ok())
                .unwrap_or(defaults.temperature),
            top_p: get("FLOORSWAP_TOP_P")
                .and_then(|raw| raw.parse::<f64>().ok())
                .unwrap_or(defaults.top_p),
            seed: get("FLOORSWAP_SEED").and_then(|raw| raw.parse::<i64>().ok()),
            allowed_roots: get("FLOORSWAP_ALLOWED_ROOTS")
                .map(|raw| split_list(&raw).into_iter().map(PathBuf::from).collect())
                .unwrap_or_default(),
            cors_origins: get("CORS_ORIGINS")
                .map(|raw| split_list(&raw))
                .unwrap_or(defaults.cors_origins),
            target_long_side: get("FLOORSWAP_TARGET_LONG_SIDE")
                .and_then(|raw| raw.parse::<u32>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(defaults.target_long_side),
            request_timeout: Duration::from_secs(request_timeout_s),
            outputs_dir,
            records_dir,
            events_path,
        }
    }
}

/// `<parent>/<name>-records` for an outputs dir `<parent>/<name>`.
pub fn records_dir_for(outputs_dir: &Path) -> PathBuf {
    let name = outputs_dir
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or(DEFAULT_OUTPUTS_DIR);
    let sibling = format!("{name}-records");
    match outputs_dir.parent() {
        Some(parent) => parent.join(sibling),
        None => PathBuf::from(sibling),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}
