use std::path::Path;

pub const FALLBACK_MIME: &str = "application/octet-stream";

/// Content type inferred from a file name's extension.
pub fn mime_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "heic" | "heif" => "image/heic",
        "bmp" => "image/bmp",
        _ => FALLBACK_MIME,
    }
}

/// A declared content type wins unless it is blank or the generic fallback.
pub fn resolve_mime(declared: Option<&str>, filename: Option<&str>) -> String {
    if let Some(declared) = declared
        .map(str::trim)
        .filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case(FALLBACK_MIME))
    {
        return declared.to_ascii_lowercase();
    }
    filename
        .map(|name| mime_for_path(Path::new(name)))
        .unwrap_or(FALLBACK_MIME)
        .to_string()
}

/// File extension used when persisting an output of the given type.
pub fn extension_for_mime(mime: &str) -> &'static str {
    let lowered = mime.trim().to_ascii_lowercase();
    match lowered.split(';').next().unwrap_or_default().trim() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        _ => "png",
    }
}
