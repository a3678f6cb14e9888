pub mod allowlist;
pub mod config;
pub mod crop;
pub mod error;
pub mod gemini;
pub mod generator;
pub mod mime;
pub mod normalize;
pub mod persist;
pub mod request;

use std::path::{Path, PathBuf};

use floorswap_contracts::events::{EventPayload, EventWriter};
use floorswap_contracts::request::{GenerationOptions, ImagePayload, SegmentManifest};
use floorswap_contracts::runs::receipts::{
    receipt_path_for, write_receipt, GenerationReceipt, InputRecord, ReferenceRecord,
    RECEIPT_SCHEMA_VERSION,
};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

pub use allowlist::PathAllowlist;
pub use config::EngineConfig;
pub use error::{CallContext, FloorError, Result};
pub use generator::{DryrunGenerator, ImageGenerator, ImageGeneratorRegistry};
pub use persist::{NamingBasis, OutputPersister, PersistedOutput};
pub use request::InstructionTemplate;

use crate::crop::texture_crops;
use crate::gemini::GeminiGenerator;
use crate::mime::resolve_mime;
use crate::normalize::{decode_image, normalize_image_bytes, NormalizedImage, OutputFormat};
use crate::request::{assemble_request, compose_instruction};

pub const MAX_REFERENCES: usize = 2;
/// Seed used for two-reference jobs when neither the job nor the config sets one.
pub const MULTI_REFERENCE_SEED: i64 = 12345;

/// Raw upload as received from a caller: bytes plus whatever naming
/// information came with them.
#[derive(Clone, Default)]
pub struct UploadedImage {
    pub bytes: Vec<u8>,
    pub filename: Option<String>,
    pub declared_mime: Option<String>,
}

impl std::fmt::Debug for UploadedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadedImage")
            .field("bytes", &self.bytes.len())
            .field("filename", &self.filename)
            .field("declared_mime", &self.declared_mime)
            .finish()
    }
}

impl UploadedImage {
    pub fn new(bytes: Vec<u8>, filename: Option<String>, declared_mime: Option<String>) -> Self {
        Self {
            bytes,
            filename,
            declared_mime,
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|err| FloorError::io(format!("failed to read {}", path.display()), err))?;
        let filename = path
            .file_name()
            .and_then(|value| value.to_str())
            .map(str::to_string);
        Ok(Self::new(bytes, filename, None))
    }

    pub fn mime_type(&self) -> String {
        resolve_mime(self.declared_mime.as_deref(), self.filename.as_deref())
    }

    fn name_or(&self, fallback: &str) -> String {
        self.filename
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(fallback)
            .to_string()
    }
}

/// One floor-replacement call. Unset overrides fall back to the engine config.
#[derive(Debug, Clone, Default)]
pub struct FloorJob {
    pub room: UploadedImage,
    pub reference_paths: Vec<String>,
    pub mask: Option<UploadedImage>,
    pub product_hints: Option<String>,
    pub template: Option<InstructionTemplate>,
    pub texture_closeups: bool,
    pub model: Option<String>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub seed: Option<i64>,
}

impl FloorJob {
    pub fn new(room: UploadedImage, reference_path: impl Into<String>) -> Self {
        Self {
            room,
            reference_paths: vec![reference_path.into()],
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct FloorOutcome {
    pub outputs: Vec<PersistedOutput>,
    pub references: Vec<ReferenceRecord>,
    pub room: InputRecord,
    pub template: InstructionTemplate,
    pub prompt_used: String,
    pub options: GenerationOptions,
    pub generator: String,
    pub request_manifest: Vec<SegmentManifest>,
    pub notes: Vec<String>,
    pub receipt_path: PathBuf,
}

impl FloorOutcome {
    /// Externally addressable `/outputs/<file>` paths.
    pub fn output_urls(&self) -> Vec<String> {
        self.outputs.iter().map(|output| output.url.clone()).collect()
    }

    pub fn primary_reference(&self) -> Option<&ReferenceRecord> {
        self.references.first()
    }
}

struct ResolvedReference {
    record: ReferenceRecord,
    source_bytes: Vec<u8>,
    normalized: NormalizedImage,
}

pub struct FloorReplaceEngine {
    config: EngineConfig,
    allowlist: PathAllowlist,
    generators: ImageGeneratorRegistry,
    persister: OutputPersister,
    events: EventWriter,
}

impl FloorReplaceEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let events = match config.events_path.as_ref() {
            Some(path) => EventWriter::new(path, session_id),
            None => EventWriter::disabled(session_id),
        };
        Self::with_event_writer(config, events)
    }

    pub fn with_event_writer(config: EngineConfig, events: EventWriter) -> Result<Self> {
        let allowlist = PathAllowlist::new(&config.allowed_roots);
        let mut generators = ImageGeneratorRegistry::new();
        generators.register(GeminiGenerator::new(
            config.api_base.clone(),
            config.api_key.clone(),
        ));
        generators.register(DryrunGenerator);
        let persister = OutputPersister::new(&config.outputs_dir);

        let engine = Self {
            config,
            allowlist,
            generators,
            persister,
            events,
        };
        engine.emit(
            "session_started",
            json!({
                "model": engine.config.model,
                "outputs_dir": engine.config.outputs_dir.to_string_lossy(),
                "allowed_roots": engine.allowlist.roots().len(),
                "generators": engine.generators.names(),
            }),
        )?;
        Ok(engine)
    }

    /// Replace (or add) a generator; model ids are routed by name prefix.
    pub fn with_generator<G: ImageGenerator + 'static>(mut self, generator: G) -> Self {
        self.generators.register(generator);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn allowlist(&self) -> &PathAllowlist {
        &self.allowlist
    }

    pub fn add_allowed_root(&mut self, root: impl AsRef<Path>) -> bool {
        self.allowlist.add_root(root)
    }

    pub fn event_writer(&self) -> EventWriter {
        self.events.clone()
    }

    pub fn session_id(&self) -> &str {
        self.events.session_id()
    }

    pub fn generate(&self, job: &FloorJob) -> Result<FloorOutcome> {
        let reference_count = job.reference_paths.len();
        if reference_count == 0 || reference_count > MAX_REFERENCES {
            return Err(FloorError::InvalidJob(format!(
                "expected 1 to {MAX_REFERENCES} reference paths, got {reference_count}"
            )));
        }

        let references = job
            .reference_paths
            .iter()
            .map(|raw| self.resolve_reference(raw))
            .collect::<Result<Vec<_>>>()?;

        let room = normalize_image_bytes(&job.room.bytes, self.config.target_long_side, OutputFormat::Jpeg)?;
        let room_record = InputRecord {
            name: job.room.name_or("room"),
            mime_type: room.payload.mime_type().to_string(),
            original_bytes: room.original_bytes as u64,
            sent_bytes: room.payload.len() as u64,
            width: Some(room.width),
            height: Some(room.height),
        };
        self.emit_normalized("room", &room)?;

        let mask = job.mask.as_ref().map(|upload| {
            let payload = ImagePayload::new(upload.bytes.clone(), upload.mime_type());
            let record = InputRecord {
                name: upload.name_or("mask"),
                mime_type: payload.mime_type().to_string(),
                original_bytes: upload.bytes.len() as u64,
                sent_bytes: payload.len() as u64,
                width: None,
                height: None,
            };
            (payload, record)
        });

        let mut reference_payloads: Vec<ImagePayload> = references
            .iter()
            .map(|reference| reference.normalized.payload.clone())
            .collect();
        let mut closeups = 0;
        if job.texture_closeups {
            let first = &references[0];
            let decoded = decode_image(&first.source_bytes, &first.record.name)?;
            for crop in texture_crops(&decoded)? {
                reference_payloads.push(crop.payload);
                closeups += 1;
            }
        }

        let template = job.template.unwrap_or(if reference_count >= 2 {
            InstructionTemplate::MultiReference
        } else {
            InstructionTemplate::Universal
        });
        let prompt_used = compose_instruction(template, job.product_hints.as_deref());
        let request = assemble_request(
            &room.payload,
            mask.as_ref().map(|(payload, _)| payload),
            &reference_payloads,
            &prompt_used,
        )?;
        let request_manifest = request.manifest();
        self.emit(
            "request_assembled",
            json!({
                "template": template.version(),
                "segments": request.len(),
                "images": request.images().count(),
                "texture_closeups": closeups,
                "mask_present": mask.is_some(),
                "hints_chars": job.product_hints.as_deref().map(|hints| hints.trim().chars().count()).unwrap_or(0),
            }),
        )?;

        let seed = job
            .seed
            .or(self.config.seed)
            .or((reference_count >= 2).then_some(MULTI_REFERENCE_SEED));
        let options = GenerationOptions::new(
            job.model
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .unwrap_or(&self.config.model),
            job.temperature.unwrap_or(self.config.temperature),
            job.top_p.unwrap_or(self.config.top_p),
            seed,
        );
        let call = CallContext {
            model: options.model_id.clone(),
            room_bytes: room.payload.len(),
            reference_bytes: reference_payloads.iter().map(ImagePayload::len).collect(),
            mask_present: mask.is_some(),
        };

        let generator = self.generators.route(&options.model_id).ok_or_else(|| {
            FloorError::generation(
                format!("no generator registered for model {:?}", options.model_id),
                call.clone(),
            )
        })?;
        let generator_name = generator.name().to_string();
        self.emit(
            "generation_started",
            json!({
                "generator": generator_name,
                "model": options.model_id,
                "temperature": options.temperature,
                "top_p": options.top_p,
                "seed": options.seed,
                "timeout_s": self.config.request_timeout.as_secs(),
            }),
        )?;

        let result = match generator
            .generate(&request, &options, self.config.request_timeout)
            .map_err(|err| err.with_context(&call))
            .and_then(|result| {
                if result.is_empty() {
                    Err(FloorError::EmptyResult {
                        context: call.clone(),
                    })
                } else {
                    Ok(result)
                }
            }) {
            Ok(result) => result,
            Err(err) => {
                // The generation error is the one callers need to see.
                if let Err(log_err) = self.emit(
                    "generation_failed",
                    json!({
                        "generator": generator_name,
                        "error": err.to_string(),
                    }),
                ) {
                    eprintln!("floorswap: failed to record generation_failed: {log_err}");
                }
                return Err(err);
            }
        };
        self.emit(
            "generation_finished",
            json!({
                "generator": generator_name,
                "images": result.len(),
                "notes": result.notes,
            }),
        )?;

        let basis = NamingBasis::from_names(&room_record.name, &references[0].record.name);
        let outputs = self.persister.persist(&result, &basis)?;
        for output in &outputs {
            self.emit(
                "output_written",
                json!({
                    "path": output.path.to_string_lossy(),
                    "url": output.url,
                    "mime_type": output.mime_type,
                    "bytes": output.bytes,
                }),
            )?;
        }

        let references: Vec<ReferenceRecord> =
            references.into_iter().map(|reference| reference.record).collect();
        // persist() returns one entry per image and the result is non-empty.
        let receipt_path = receipt_path_for(&self.config.receipts_dir(), &outputs[0].path);
        let receipt = GenerationReceipt {
            schema_version: RECEIPT_SCHEMA_VERSION,
            session_id: self.session_id().to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            generator: generator_name.clone(),
            options: options.clone(),
            room: room_record.clone(),
            mask: mask.map(|(_, record)| record),
            references: references.clone(),
            texture_closeups: closeups,
            instruction_template: template.version().to_string(),
            prompt_used: prompt_used.clone(),
            request_manifest: request_manifest.clone(),
            outputs: outputs.iter().map(|output| output.file_name.clone()).collect(),
            notes: result.notes.clone(),
        };
        write_receipt(&receipt_path, &receipt).map_err(|err| record_error("receipt", err))?;

        Ok(FloorOutcome {
            outputs,
            references,
            room: room_record,
            template,
            prompt_used,
            options,
            generator: generator_name,
            request_manifest,
            notes: result.notes,
            receipt_path,
        })
    }

    fn resolve_reference(&self, raw: &str) -> Result<ResolvedReference> {
        let path = self.allowlist.validate(raw)?;
        let source_bytes = std::fs::read(&path)
            .map_err(|err| FloorError::io(format!("failed to read reference {raw:?}"), err))?;
        let sha256 = hex::encode(Sha256::digest(&source_bytes));
        let name = path
            .file_name()
            .and_then(|value| value.to_str())
            .unwrap_or("reference")
            .to_string();
        self.emit(
            "reference_resolved",
            json!({
                "path": path.to_string_lossy(),
                "name": name,
                "sha256": sha256,
                "bytes": source_bytes.len(),
            }),
        )?;

        let normalized = normalize_image_bytes(&source_bytes, self.config.target_long_side, OutputFormat::Jpeg)?;
        self.emit_normalized("reference", &normalized)?;
        Ok(ResolvedReference {
            record: ReferenceRecord {
                path: path.to_string_lossy().to_string(),
                name,
                sha256,
                original_bytes: source_bytes.len() as u64,
                sent_bytes: normalized.payload.len() as u64,
                width: normalized.width,
                height: normalized.height,
            },
            source_bytes,
            normalized,
        })
    }

    fn emit_normalized(&self, role: &str, image: &NormalizedImage) -> Result<()> {
        self.emit(
            "image_normalized",
            json!({
                "role": role,
                "original_bytes": image.original_bytes,
                "sent_bytes": image.payload.len(),
                "width": image.width,
                "height": image.height,
                "mime_type": image.payload.mime_type(),
            }),
        )
    }

    fn emit(&self, event_type: &str, payload: Value) -> Result<()> {
        self.events
            .emit(event_type, map_object(payload))
            .map_err(|err| record_error("event log", err))?;
        Ok(())
    }
}

fn map_object(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    }
}

fn record_error(what: &str, err: anyhow::Error) -> FloorError {
    FloorError::io(
        format!("failed to write {what}"),
        std::io::Error::other(format!("{err:#}")),
    )
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use floorswap_contracts::request::{GenerationResult, Request};
    use floorswap_contracts::runs::receipts::read_receipt;
    use image::{DynamicImage, GenericImageView, ImageFormat, RgbImage};

    use super::*;
    use crate::normalize::tests::gradient_png;

    #[derive(Clone, Default)]
    struct RecordingGenerator {
        requests: Arc<Mutex<Vec<(Request, GenerationOptions)>>>,
        empty: bool,
    }

    impl ImageGenerator for RecordingGenerator {
        fn name(&self) -> &str {
            "recording"
        }

        fn generate(
            &self,
            request: &Request,
            options: &GenerationOptions,
            _timeout: Duration,
        ) -> Result<GenerationResult> {
            self.requests
                .lock()
                .map_err(|_| FloorError::generation("poisoned", CallContext::default()))?
                .push((request.clone(), options.clone()));
            let mut result = GenerationResult::default();
            if !self.empty {
                result.push_image("image/png", gradient_png(16, 16));
            }
            result.push_note("looks good");
            Ok(result)
        }
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        floors: PathBuf,
        outputs: PathBuf,
        records: PathBuf,
        events: PathBuf,
    }

    impl Fixture {
        fn new() -> anyhow::Result<Self> {
            let temp = tempfile::tempdir()?;
            let floors = temp.path().join("floors");
            std::fs::create_dir_all(&floors)?;
            Ok(Self {
                floors,
                outputs: temp.path().join("outputs"),
                records: temp.path().join("records"),
                events: temp.path().join("records").join("events.jsonl"),
                _temp: temp,
            })
        }

        fn config(&self, model: &str) -> EngineConfig {
            EngineConfig {
                model: model.to_string(),
                outputs_dir: self.outputs.clone(),
                records_dir: Some(self.records.clone()),
                allowed_roots: vec![self.floors.clone()],
                events_path: Some(self.events.clone()),
                ..EngineConfig::default()
            }
        }

        fn write_reference(&self, name: &str, width: u32, height: u32) -> anyhow::Result<String> {
            let path = self.floors.join(name);
            std::fs::write(&path, gradient_png(width, height))?;
            Ok(path.to_string_lossy().to_string())
        }

        fn event_types(&self) -> anyhow::Result<Vec<String>> {
            Ok(std::fs::read_to_string(&self.events)?
                .lines()
                .map(serde_json::from_str::<Value>)
                .collect::<std::result::Result<Vec<_>, _>>()?
                .iter()
                .filter_map(|event| event["type"].as_str().map(str::to_string))
                .collect())
        }
    }

    fn room_jpeg(width: u32, height: u32) -> anyhow::Result<UploadedImage> {
        let image = RgbImage::from_fn(width, height, |x, y| {
            image::Rgb([(x % 200) as u8, (y % 200) as u8, 90])
        });
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)?;
        Ok(UploadedImage::new(bytes, Some("living room.jpg".to_string()), Some("image/jpeg".to_string())))
    }

    #[test]
    fn single_reference_job_sends_labelled_request_and_persists_unique_outputs() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let reference = fixture.write_reference("oak.png", 4000, 3000)?;
        let recorder = RecordingGenerator::default();
        let engine = FloorReplaceEngine::new(fixture.config("recording-v1"))?
            .with_generator(recorder.clone());
        let job = FloorJob::new(room_jpeg(1200, 800)?, reference);

        let first = engine.generate(&job)?;
        let second = engine.generate(&job)?;

        let requests = recorder.requests.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        let (request, options) = &requests[0];
        let segments = request.segments();
        assert_eq!(segments.len(), 5);
        assert_eq!(segments[0].as_text(), Some("BASE_IMAGE"));
        assert_eq!(segments[2].as_text(), Some("REFERENCE_IMAGE_1"));
        assert_eq!(segments[4].as_text(), Some(first.prompt_used.as_str()));

        let sent_room = image::load_from_memory(segments[1].as_image().map(|p| p.bytes()).unwrap_or_default())?;
        assert_eq!(sent_room.dimensions(), (1200, 800));
        let sent_reference = image::load_from_memory(segments[3].as_image().map(|p| p.bytes()).unwrap_or_default())?;
        assert_eq!(sent_reference.dimensions(), (3000, 2250));

        assert_eq!(options.model_id, "recording-v1");
        assert_eq!(options.temperature, 0.1);
        assert_eq!(options.seed, None);

        assert_eq!(first.template, InstructionTemplate::Universal);
        assert_eq!(first.references[0].name, "oak.png");
        assert_eq!(first.references[0].sha256.len(), 64);
        assert_eq!((first.references[0].width, first.references[0].height), (3000, 2250));
        assert_eq!(first.generator, "recording");
        assert_ne!(first.outputs[0].file_name, second.outputs[0].file_name);
        assert!(first.outputs[0].file_name.starts_with("living_room__oak_"));
        assert!(first.outputs[0].url.starts_with("/outputs/"));
        assert!(first.outputs[0].path.is_file());

        assert!(first.receipt_path.starts_with(fixture.records.join("receipts")));
        let served: Vec<_> = std::fs::read_dir(&fixture.outputs)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        assert!(served.iter().all(|name| name.ends_with(".png")), "{served:?}");

        let receipt = read_receipt(&first.receipt_path)?;
        assert_eq!(receipt.instruction_template, "universal-floor-replace/v1");
        assert_eq!(receipt.outputs, vec![first.outputs[0].file_name.clone()]);
        assert_eq!(receipt.notes, vec!["looks good".to_string()]);
        assert_eq!(receipt.request_manifest.len(), 5);
        Ok(())
    }

    #[test]
    fn two_references_with_mask_pick_multi_reference_template() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let first_ref = fixture.write_reference("ash-daylight.png", 64, 48)?;
        let second_ref = fixture.write_reference("ash-lamp.png", 48, 64)?;
        let recorder = RecordingGenerator::default();
        let engine = FloorReplaceEngine::new(fixture.config("recording-v1"))?
            .with_generator(recorder.clone());

        let mut job = FloorJob::new(room_jpeg(80, 60)?, first_ref);
        job.reference_paths.push(second_ref);
        job.mask = Some(UploadedImage::new(gradient_png(80, 60), Some("mask.png".to_string()), None));
        job.product_hints = Some("brushed ash, 180mm planks".to_string());
        job.temperature = Some(3.0);

        let outcome = engine.generate(&job)?;
        assert_eq!(outcome.template, InstructionTemplate::MultiReference);
        assert!(outcome.prompt_used.ends_with("# PRODUCT HINTS\nbrushed ash, 180mm planks"));
        assert_eq!(outcome.options.seed, Some(MULTI_REFERENCE_SEED));
        assert_eq!(outcome.options.temperature, 1.0);

        let requests = recorder.requests.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        let labels: Vec<&str> = requests[0]
            .0
            .segments()
            .iter()
            .filter_map(|segment| segment.as_text())
            .take(4)
            .collect();
        assert_eq!(
            labels,
            vec!["BASE_IMAGE", "MASK_IMAGE", "REFERENCE_IMAGE_1", "REFERENCE_IMAGE_2"]
        );
        assert_eq!(
            requests[0].0.segments()[3].as_image().map(|p| p.mime_type()),
            Some("image/png")
        );
        Ok(())
    }

    #[test]
    fn closeups_are_appended_after_full_references() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let reference = fixture.write_reference("tile.png", 600, 400)?;
        let recorder = RecordingGenerator::default();
        let engine = FloorReplaceEngine::new(fixture.config("recording-v1"))?
            .with_generator(recorder.clone());
        let mut job = FloorJob::new(room_jpeg(64, 64)?, reference);
        job.texture_closeups = true;

        let outcome = engine.generate(&job)?;
        let requests = recorder.requests.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
        let segments = requests[0].0.segments();
        assert_eq!(segments.len(), 9);
        assert_eq!(segments[6].as_text(), Some("REFERENCE_IMAGE_3"));
        let center = image::load_from_memory(segments[5].as_image().map(|p| p.bytes()).unwrap_or_default())?;
        assert_eq!(center.dimensions(), (400, 400));
        let corner = image::load_from_memory(segments[7].as_image().map(|p| p.bytes()).unwrap_or_default())?;
        assert_eq!(corner.dimensions(), (200, 200));
        assert_eq!(outcome.request_manifest.len(), 9);
        Ok(())
    }

    #[test]
    fn dryrun_model_runs_offline_end_to_end() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let reference = fixture.write_reference("walnut.png", 32, 32)?;
        let engine = FloorReplaceEngine::new(fixture.config("dryrun-image-1"))?;

        let outcome = engine.generate(&FloorJob::new(room_jpeg(40, 30)?, reference))?;
        assert_eq!(outcome.generator, "dryrun");
        assert_eq!(outcome.outputs.len(), 1);
        let written = image::open(&outcome.outputs[0].path)?;
        assert_eq!(written.dimensions(), (40, 30));

        let types = fixture.event_types()?;
        assert_eq!(
            types,
            vec![
                "session_started",
                "reference_resolved",
                "image_normalized",
                "image_normalized",
                "request_assembled",
                "generation_started",
                "generation_finished",
                "output_written",
            ]
        );
        Ok(())
    }

    #[test]
    fn path_errors_surface_before_any_generation() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let recorder = RecordingGenerator::default();
        let engine = FloorReplaceEngine::new(fixture.config("recording-v1"))?
            .with_generator(recorder.clone());

        let outside = fixture.floors.join("..").join("secret.png");
        std::fs::write(&outside, gradient_png(8, 8))?;
        let err = engine
            .generate(&FloorJob::new(room_jpeg(16, 16)?, outside.to_string_lossy()))
            .unwrap_err();
        assert!(matches!(err, FloorError::PathNotAllowed { .. }));

        let missing = fixture.floors.join("missing.png");
        let err = engine
            .generate(&FloorJob::new(room_jpeg(16, 16)?, missing.to_string_lossy()))
            .unwrap_err();
        assert!(matches!(err, FloorError::FileNotFound { .. }));

        let mut too_many = FloorJob::new(room_jpeg(16, 16)?, "a.png");
        too_many.reference_paths.extend(["b.png".to_string(), "c.png".to_string()]);
        assert!(matches!(engine.generate(&too_many).unwrap_err(), FloorError::InvalidJob(_)));

        assert!(recorder.requests.lock().map_err(|_| anyhow::anyhow!("poisoned"))?.is_empty());
        Ok(())
    }

    #[test]
    fn undecodable_room_is_a_decode_error() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let reference = fixture.write_reference("oak.png", 16, 16)?;
        let engine = FloorReplaceEngine::new(fixture.config("dryrun"))?;
        let room = UploadedImage::new(b"not an image".to_vec(), Some("room.jpg".to_string()), None);
        let err = engine.generate(&FloorJob::new(room, reference)).unwrap_err();
        assert!(matches!(err, FloorError::Decode { .. }));
        Ok(())
    }

    #[test]
    fn empty_model_output_is_reported_with_call_context() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let reference = fixture.write_reference("oak.png", 16, 16)?;
        let recorder = RecordingGenerator {
            empty: true,
            ..RecordingGenerator::default()
        };
        let engine = FloorReplaceEngine::new(fixture.config("recording-v1"))?.with_generator(recorder);

        let err = engine
            .generate(&FloorJob::new(room_jpeg(16, 16)?, reference))
            .unwrap_err();
        match &err {
            FloorError::EmptyResult { context } => {
                assert_eq!(context.model, "recording-v1");
                assert_eq!(context.reference_bytes.len(), 1);
                assert!(!context.mask_present);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().starts_with("Model returned no image output"));
        assert_eq!(fixture.event_types()?.last().map(String::as_str), Some("generation_failed"));
        assert!(!fixture.outputs.exists());
        Ok(())
    }

    // Swaps the event log for a directory mid-call so only the failure event
    // can no longer be written.
    struct LogBreakingGenerator {
        events: PathBuf,
    }

    impl ImageGenerator for LogBreakingGenerator {
        fn name(&self) -> &str {
            "logbreak"
        }

        fn generate(
            &self,
            _request: &Request,
            _options: &GenerationOptions,
            _timeout: Duration,
        ) -> Result<GenerationResult> {
            std::fs::remove_file(&self.events)
                .and_then(|_| std::fs::create_dir(&self.events))
                .map_err(|err| FloorError::io("break event log", err))?;
            Ok(GenerationResult::default())
        }
    }

    #[test]
    fn generation_error_survives_an_unwritable_event_log() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let reference = fixture.write_reference("oak.png", 16, 16)?;
        let engine = FloorReplaceEngine::new(fixture.config("logbreak-v1"))?.with_generator(
            LogBreakingGenerator {
                events: fixture.events.clone(),
            },
        );

        let err = engine
            .generate(&FloorJob::new(room_jpeg(16, 16)?, reference))
            .unwrap_err();
        assert!(matches!(err, FloorError::EmptyResult { .. }), "{err}");
        assert!(fixture.events.is_dir());
        Ok(())
    }

    #[test]
    fn stalled_gemini_call_times_out_without_writing_outputs() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let reference = fixture.write_reference("oak.png", 16, 16)?;
        let server = crate::gemini::tests::StubServer::stalled(Duration::from_secs(4))?;
        let config = EngineConfig {
            api_key: Some("test-key".to_string()),
            api_base: server.base_url(),
            request_timeout: Duration::from_secs(1),
            ..fixture.config("gemini-2.5-flash-image-preview")
        };
        let engine = FloorReplaceEngine::new(config)?;

        let err = engine
            .generate(&FloorJob::new(room_jpeg(16, 16)?, reference))
            .unwrap_err();
        match &err {
            FloorError::Timeout { seconds, context } => {
                assert_eq!(*seconds, 1);
                assert_eq!(context.model, "gemini-2.5-flash-image-preview");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!fixture.outputs.exists());
        assert_eq!(fixture.event_types()?.last().map(String::as_str), Some("generation_failed"));
        Ok(())
    }

    #[test]
    fn missing_credentials_fail_as_authentication() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let reference = fixture.write_reference("oak.png", 16, 16)?;
        let engine = FloorReplaceEngine::new(fixture.config("gemini-2.5-flash-image-preview"))?;
        let err = engine
            .generate(&FloorJob::new(room_jpeg(16, 16)?, reference))
            .unwrap_err();
        assert!(matches!(err, FloorError::Authentication(_)));
        Ok(())
    }
}
