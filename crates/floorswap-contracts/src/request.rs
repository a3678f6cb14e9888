use serde::{Deserialize, Serialize};

/// Raw image content plus the mime type describing its encoding.
///
/// Payloads are immutable once built; derived images (resized, cropped) are
/// new payloads.
#[derive(Clone, PartialEq, Eq)]
pub struct ImagePayload {
    bytes: Vec<u8>,
    mime_type: String,
}

impl ImagePayload {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

// Image bytes are never worth printing.
impl std::fmt::Debug for ImagePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePayload")
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Text,
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSegment {
    Text(String),
    Image(ImagePayload),
}

impl ContentSegment {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn image(payload: ImagePayload) -> Self {
        Self::Image(payload)
    }

    pub fn kind(&self) -> SegmentKind {
        match self {
            Self::Text(_) => SegmentKind::Text,
            Self::Image(_) => SegmentKind::Image,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            Self::Image(_) => None,
        }
    }

    pub fn as_image(&self) -> Option<&ImagePayload> {
        match self {
            Self::Text(_) => None,
            Self::Image(payload) => Some(payload),
        }
    }
}

/// Text segments longer than this are recorded by length only in manifests.
const MANIFEST_TEXT_MAX_CHARS: usize = 64;

/// Byte-free description of one segment, safe to write into receipts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentManifest {
    pub kind: SegmentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_chars: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<usize>,
}

/// One generation request: an ordered sequence of content segments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    segments: Vec<ContentSegment>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&mut self, value: impl Into<String>) {
        self.segments.push(ContentSegment::text(value));
    }

    pub fn push_image(&mut self, payload: ImagePayload) {
        self.segments.push(ContentSegment::image(payload));
    }

    pub fn segments(&self) -> &[ContentSegment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn images(&self) -> impl Iterator<Item = &ImagePayload> {
        self.segments.iter().filter_map(ContentSegment::as_image)
    }

    pub fn manifest(&self) -> Vec<SegmentManifest> {
        self.segments
            .iter()
            .map(|segment| match segment {
                ContentSegment::Text(value) => {
                    let chars = value.chars().count();
                    SegmentManifest {
                        kind: SegmentKind::Text,
                        text: (chars <= MANIFEST_TEXT_MAX_CHARS).then(|| value.clone()),
                        text_chars: Some(chars),
                        mime_type: None,
                        bytes: None,
                    }
                }
                ContentSegment::Image(payload) => SegmentManifest {
                    kind: SegmentKind::Image,
                    text: None,
                    text_chars: None,
                    mime_type: Some(payload.mime_type().to_string()),
                    bytes: Some(payload.len()),
                },
            })
            .collect()
    }
}

/// Sampling settings for one call. `seed` is honoured on a best-effort basis
/// by the remote model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub model_id: String,
    pub temperature: f64,
    pub top_p: f64,
    #[serde(default)]
    pub seed: Option<i64>,
}

impl GenerationOptions {
    pub fn new(model_id: impl Into<String>, temperature: f64, top_p: f64, seed: Option<i64>) -> Self {
        Self {
            model_id: model_id.into(),
            temperature: clamp_unit(temperature),
            top_p: clamp_unit(top_p),
            seed,
        }
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

#[derive(Clone, PartialEq, Eq)]
pub struct OutputImage {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for OutputImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputImage")
            .field("mime_type", &self.mime_type)
            .field("bytes", &self.bytes.len())
            .finish()
    }
}

/// Images returned by one call, in arrival order. Text commentary from the
/// model is kept separately in `notes`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationResult {
    pub images: Vec<OutputImage>,
    pub notes: Vec<String>,
}

impl GenerationResult {
    pub fn push_image(&mut self, mime_type: impl Into<String>, bytes: Vec<u8>) {
        self.images.push(OutputImage {
            mime_type: mime_type.into(),
            bytes,
        });
    }

    pub fn push_note(&mut self, note: impl Into<String>) {
        let note = note.into();
        if !note.trim().is_empty() {
            self.notes.push(note);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }
}
