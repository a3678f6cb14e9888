use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::request::{GenerationOptions, SegmentManifest};

pub const RECEIPT_SCHEMA_VERSION: u64 = 1;

/// Room or mask upload as it was sent, after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRecord {
    pub name: String,
    pub mime_type: String,
    pub original_bytes: u64,
    pub sent_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// A product reference resolved through the allowlist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub path: String,
    pub name: String,
    pub sha256: String,
    pub original_bytes: u64,
    pub sent_bytes: u64,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationReceipt {
    pub schema_version: u64,
    pub session_id: String,
    pub created_at: String,
    pub generator: String,
    pub options: GenerationOptions,
    pub room: InputRecord,
    #[serde(default)]
    pub mask: Option<InputRecord>,
    pub references: Vec<ReferenceRecord>,
    pub texture_closeups: usize,
    pub instruction_template: String,
    pub prompt_used: String,
    pub request_manifest: Vec<SegmentManifest>,
    pub outputs: Vec<String>,
    #[serde(default)]
    pub notes: Vec<String>,
}

/// `<receipts_dir>/<stem>.receipt.json`, named after the first output image.
pub fn receipt_path_for(receipts_dir: &Path, output: &Path) -> PathBuf {
    let stem = output
        .file_stem()
        .and_then(|value| value.to_str())
        .unwrap_or("output");
    receipts_dir.join(format!("{stem}.receipt.json"))
}

pub fn write_receipt(path: &Path, receipt: &GenerationReceipt) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(receipt)?)
        .with_context(|| format!("failed to write receipt {}", path.display()))?;
    Ok(())
}

pub fn read_receipt(path: &Path) -> anyhow::Result<GenerationReceipt> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read receipt {}", path.display()))?;
    let receipt = serde_json::from_str(&raw)
        .with_context(|| format!("invalid receipt {}", path.display()))?;
    Ok(receipt)
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use crate::request::{ImagePayload, Request};

    use super::*;

    fn sample_receipt() -> GenerationReceipt {
        let mut request = Request::new();
        request.push_text("BASE_IMAGE");
        request.push_image(ImagePayload::new(vec![7; 32], "image/jpeg"));
        GenerationReceipt {
            schema_version: RECEIPT_SCHEMA_VERSION,
            session_id: "session-1".to_string(),
            created_at: "2026-01-01T00:00:00.000000+00:00".to_string(),
            generator: "dryrun".to_string(),
            options: GenerationOptions::new("dryrun-image-1", 0.1, 0.5, Some(12345)),
            room: InputRecord {
                name: "kitchen.jpg".to_string(),
                mime_type: "image/jpeg".to_string(),
                original_bytes: 100,
                sent_bytes: 32,
                width: Some(1200),
                height: Some(800),
            },
            mask: None,
            references: vec![ReferenceRecord {
                path: "/refs/oak.png".to_string(),
                name: "oak.png".to_string(),
                sha256: "ab".repeat(32),
                original_bytes: 2048,
                sent_bytes: 1024,
                width: 3000,
                height: 2250,
            }],
            texture_closeups: 0,
            instruction_template: "universal-floor-replace/v1".to_string(),
            prompt_used: "Replace ONLY the masked floor.".to_string(),
            request_manifest: request.manifest(),
            outputs: vec!["/outputs/kitchen__oak_0.png".to_string()],
            notes: Vec::new(),
        }
    }

    #[test]
    fn receipt_path_is_named_after_output() {
        let path = receipt_path_for(
            Path::new("/tmp/records/receipts"),
            Path::new("/tmp/outputs/kitchen__oak_0.png"),
        );
        assert_eq!(path, Path::new("/tmp/records/receipts/kitchen__oak_0.receipt.json"));
    }

    #[test]
    fn write_then_read_receipt() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("out.receipt.json");
        let receipt = sample_receipt();
        write_receipt(&path, &receipt)?;

        let loaded = read_receipt(&path)?;
        assert_eq!(loaded, receipt);

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(raw["schema_version"], 1);
        assert_eq!(raw["request_manifest"][1]["kind"], "image");
        assert!(raw["request_manifest"][1].get("data").is_none());
        Ok(())
    }
}
