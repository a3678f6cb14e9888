use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use floorswap_contracts::request::GenerationResult;
use uuid::Uuid;

use crate::error::{FloorError, Result};
use crate::mime::extension_for_mime;

pub const OUTPUTS_URL_PREFIX: &str = "/outputs";
const STEM_MAX_CHARS: usize = 80;

/// Human-readable part of output names: `<room>__<reference>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingBasis {
    pub room_stem: String,
    pub reference_stem: String,
}

impl NamingBasis {
    pub fn from_names(room_name: &str, reference_name: &str) -> Self {
        Self {
            room_stem: sanitize_stem(file_stem(room_name)),
            reference_stem: sanitize_stem(file_stem(reference_name)),
        }
    }

    pub fn base_name(&self) -> String {
        format!("{}__{}", self.room_stem, self.reference_stem)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedOutput {
    pub path: PathBuf,
    pub url: String,
    pub file_name: String,
    pub mime_type: String,
    pub bytes: usize,
}

/// Writes generated images under one results directory.
///
/// Every call gets a fresh `<timestamp>_<token>` disambiguator and files are
/// opened with `create_new`, so repeated or concurrent calls for the same
/// room/reference pair never overwrite each other.
#[derive(Debug, Clone)]
pub struct OutputPersister {
    dir: PathBuf,
    url_prefix: String,
}

impl OutputPersister {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            url_prefix: OUTPUTS_URL_PREFIX.to_string(),
        }
    }

    pub fn with_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.url_prefix = prefix.into().trim_end_matches('/').to_string();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn persist(
        &self,
        result: &GenerationResult,
        basis: &NamingBasis,
    ) -> Result<Vec<PersistedOutput>> {
        self.persist_tagged(result, basis, &call_disambiguator())
    }

    /// All or nothing: a failed write removes the files this call created.
    fn persist_tagged(
        &self,
        result: &GenerationResult,
        basis: &NamingBasis,
        call_tag: &str,
    ) -> Result<Vec<PersistedOutput>> {
        std::fs::create_dir_all(&self.dir).map_err(|err| {
            FloorError::io(format!("failed to create {}", self.dir.display()), err)
        })?;

        let base = basis.base_name();
        let mut saved: Vec<PersistedOutput> = Vec::with_capacity(result.images.len());
        for (idx, image) in result.images.iter().enumerate() {
            let ext = extension_for_mime(&image.mime_type);
            let file_name = format!("{base}_{call_tag}_{idx}.{ext}");
            let path = self.dir.join(&file_name);
            if let Err(err) = write_new(&path, &image.bytes) {
                for output in &saved {
                    let _ = std::fs::remove_file(&output.path);
                }
                return Err(err);
            }
            saved.push(PersistedOutput {
                url: format!("{}/{}", self.url_prefix, file_name),
                path,
                file_name,
                mime_type: image.mime_type.clone(),
                bytes: image.bytes.len(),
            });
        }
        Ok(saved)
    }
}

fn write_new(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|err| FloorError::io(format!("failed to create {}", path.display()), err))?;
    if let Err(err) = file.write_all(bytes) {
        drop(file);
        let _ = std::fs::remove_file(path);
        return Err(FloorError::io(format!("failed to write {}", path.display()), err));
    }
    Ok(())
}

fn call_disambiguator() -> String {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
    let token = Uuid::new_v4().simple().to_string();
    format!("{stamp}_{}", &token[..8])
}

fn file_stem(name: &str) -> &str {
    Path::new(name.trim())
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("")
}

/// Keep `[A-Za-z0-9._-]`, map everything else (spaces included) to `_`.
fn sanitize_stem(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .take(STEM_MAX_CHARS)
        .collect();
    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        "image".to_string()
    } else {
        cleaned
    }
}
