use std::io::{BufRead, BufReader};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use floorswap_contracts::request::{ContentSegment, GenerationOptions, GenerationResult, Request};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::ACCEPT;
use serde_json::{json, Map, Value};

use crate::error::{CallContext, FloorError, Result};
use crate::generator::{ImageGenerator, GEMINI_GENERATOR};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const API_KEY_HEADER: &str = "x-goog-api-key";
const ERROR_BODY_MAX_CHARS: usize = 512;

/// Streaming client for the Gemini `streamGenerateContent` endpoint.
///
/// Credentials are passed in at construction; nothing here reads the process
/// environment.
pub struct GeminiGenerator {
    api_base: String,
    api_key: Option<String>,
}

impl GeminiGenerator {
    pub fn new(api_base: impl Into<String>, api_key: Option<String>) -> Self {
        let api_base = api_base.into().trim().trim_end_matches('/').to_string();
        Self {
            api_base: if api_base.is_empty() {
                DEFAULT_API_BASE.to_string()
            } else {
                api_base
            },
            api_key: api_key
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty()),
        }
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:streamGenerateContent?alt=sse", self.api_base, model_path)
    }
}

impl ImageGenerator for GeminiGenerator {
    fn name(&self) -> &str {
        GEMINI_GENERATOR
    }

    fn generate(
        &self,
        request: &Request,
        options: &GenerationOptions,
        timeout: Duration,
    ) -> Result<GenerationResult> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(FloorError::Authentication(
                "no API key configured (set GEMINI_API_KEY or GOOGLE_API_KEY)".to_string(),
            ));
        };
        let seconds = timeout.as_secs();
        let endpoint = self.endpoint_for_model(&options.model_id);
        let payload = build_payload(request, options);

        // Built per call so it is created and dropped on the calling thread.
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| transport_error("HTTP client setup failed", err, seconds))?;
        let response = http
            .post(&endpoint)
            .header(API_KEY_HEADER, api_key)
            .header(ACCEPT, "text/event-stream")
            .json(&payload)
            .send()
            .map_err(|err| transport_error("Gemini request failed", err, seconds))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .unwrap_or_else(|err| format!("<unreadable body: {}>", err.without_url()));
            return Err(status_error(status.as_u16(), &body));
        }

        collect_stream(BufReader::new(response)).map_err(|err| match err {
            FloorError::Timeout { context, .. } => FloorError::Timeout { seconds, context },
            other => other,
        })
    }
}

/// JSON body for one call: a single user turn holding every segment in order.
pub fn build_payload(request: &Request, options: &GenerationOptions) -> Value {
    let parts: Vec<Value> = request
        .segments()
        .iter()
        .map(|segment| match segment {
            ContentSegment::Text(text) => json!({ "text": text }),
            ContentSegment::Image(payload) => json!({
                "inlineData": {
                    "mimeType": payload.mime_type(),
                    "data": BASE64.encode(payload.bytes()),
                }
            }),
        })
        .collect();

    let mut generation_config = Map::new();
    generation_config.insert("temperature".to_string(), json!(options.temperature));
    generation_config.insert("topP".to_string(), json!(options.top_p));
    generation_config.insert("responseModalities".to_string(), json!(["IMAGE", "TEXT"]));
    if let Some(seed) = options.seed {
        generation_config.insert("seed".to_string(), json!(seed));
    }

    json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": Value::Object(generation_config),
    })
}

/// Drain an SSE (or newline-delimited JSON) body, collecting image parts in
/// arrival order. A stream with only text yields an empty result.
pub fn collect_stream<R: BufRead>(reader: R) -> Result<GenerationResult> {
    let mut result = GenerationResult::default();
    for line in reader.lines() {
        let line = line.map_err(stream_read_error)?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(':') {
            continue;
        }
        if ["event:", "id:", "retry:"]
            .iter()
            .any(|field| trimmed.starts_with(field))
        {
            continue;
        }
        let data = trimmed.strip_prefix("data:").map(str::trim).unwrap_or(trimmed);
        if data.is_empty() || data == "[DONE]" {
            continue;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            continue;
        };
        match chunk {
            Value::Array(rows) => {
                for row in &rows {
                    extract_chunk_parts(row, &mut result)?;
                }
            }
            other => extract_chunk_parts(&other, &mut result)?,
        }
    }
    Ok(result)
}

/// Append the image and text parts of one streamed chunk to `result`.
pub fn extract_chunk_parts(chunk: &Value, result: &mut GenerationResult) -> Result<()> {
    if let Some(error) = chunk.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(FloorError::generation(
            format!("Gemini stream reported an error: {}", truncate_text(&message, ERROR_BODY_MAX_CHARS)),
            CallContext::default(),
        ));
    }

    if let Some(reason) = chunk
        .get("promptFeedback")
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str)
    {
        result.push_note(format!("prompt blocked: {reason}"));
    }

    let candidates = chunk
        .get("candidates")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for candidate in candidates {
        let parts = candidate
            .get("content")
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                result.push_note(text);
                continue;
            }
            let Some(inline) = part.get("inlineData").or_else(|| part.get("inline_data")) else {
                continue;
            };
            let data = inline.get("data").and_then(Value::as_str).unwrap_or_default();
            if data.is_empty() {
                continue;
            }
            let bytes = BASE64.decode(data.as_bytes()).map_err(|err| FloorError::Generation {
                message: "Gemini image part was not valid base64".to_string(),
                context: CallContext::default(),
                source: Some(Box::new(err)),
            })?;
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            result.push_image(mime_type, bytes);
        }
    }
    Ok(())
}

/// Map a non-2xx reply. The body is trimmed and capped before it is quoted.
fn status_error(code: u16, body: &str) -> FloorError {
    let body = body.trim();
    let quoted = truncate_text(body, ERROR_BODY_MAX_CHARS);
    if code == 401 || code == 403 || body.contains("API_KEY_INVALID") {
        return FloorError::Authentication(format!(
            "Gemini rejected the credential ({code}): {quoted}"
        ));
    }
    FloorError::generation(
        format!("Gemini request failed ({code}): {quoted}"),
        CallContext::default(),
    )
}

fn transport_error(what: &str, err: reqwest::Error, seconds: u64) -> FloorError {
    if err.is_timeout() {
        return FloorError::Timeout {
            seconds,
            context: CallContext::default(),
        };
    }
    FloorError::Generation {
        message: what.to_string(),
        context: CallContext::default(),
        source: Some(Box::new(err.without_url())),
    }
}

fn stream_read_error(err: std::io::Error) -> FloorError {
    let timed_out = err.kind() == std::io::ErrorKind::TimedOut
        || err
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<reqwest::Error>())
            .map(reqwest::Error::is_timeout)
            .unwrap_or(false);
    if timed_out {
        return FloorError::Timeout {
            seconds: 0,
            context: CallContext::default(),
        };
    }
    FloorError::Generation {
        message: "Gemini stream read failed".to_string(),
        context: CallContext::default(),
        source: Some(Box::new(err)),
    }
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
