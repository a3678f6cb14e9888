use std::collections::BTreeMap;
use std::io::Cursor;
use std::time::Duration;

use floorswap_contracts::request::{ContentSegment, GenerationOptions, GenerationResult, Request};
use image::{DynamicImage, GenericImageView, ImageFormat, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use crate::error::{FloorError, Result};

pub const DRYRUN_GENERATOR: &str = "dryrun";
pub const GEMINI_GENERATOR: &str = "gemini";

/// One remote (or simulated) image model. Implementations make a single
/// attempt per call; retry policy belongs to the caller.
pub trait ImageGenerator: Send + Sync {
    fn name(&self) -> &str;
    fn generate(
        &self,
        request: &Request,
        options: &GenerationOptions,
        timeout: Duration,
    ) -> Result<GenerationResult>;
}

#[derive(Default)]
pub struct ImageGeneratorRegistry {
    generators: BTreeMap<String, Box<dyn ImageGenerator>>,
}

impl ImageGeneratorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<G: ImageGenerator + 'static>(&mut self, generator: G) {
        self.generators
            .insert(generator.name().to_string(), Box::new(generator));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageGenerator> {
        self.generators.get(name).map(|generator| generator.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.generators.keys().cloned().collect()
    }

    /// Generator whose name is the longest prefix of `model_id`, falling back
    /// to Gemini for every other model id.
    pub fn route(&self, model_id: &str) -> Option<&dyn ImageGenerator> {
        let model = model_id.trim().to_ascii_lowercase();
        self.generators
            .iter()
            .filter(|(name, _)| name.as_str() != GEMINI_GENERATOR && model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, generator)| generator.as_ref())
            .or_else(|| self.get(GEMINI_GENERATOR))
    }
}

/// Offline generator: one solid-colour PNG the size of the base image, with a
/// colour derived from the request text and seed.
pub struct DryrunGenerator;

impl ImageGenerator for DryrunGenerator {
    fn name(&self) -> &str {
        DRYRUN_GENERATOR
    }

    fn generate(
        &self,
        request: &Request,
        options: &GenerationOptions,
        _timeout: Duration,
    ) -> Result<GenerationResult> {
        let (width, height) = request
            .images()
            .next()
            .and_then(|payload| image::load_from_memory(payload.bytes()).ok())
            .map(|decoded| decoded.dimensions())
            .unwrap_or((256, 256));
        let (r, g, b) = color_from_request(request, options.seed.unwrap_or_default());
        let canvas = RgbImage::from_pixel(width, height, Rgb([r, g, b]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(canvas)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .map_err(FloorError::Encode)?;

        let mut result = GenerationResult::default();
        result.push_image("image/png", bytes);
        result.push_note("dryrun: no model call was made");
        Ok(result)
    }
}

fn color_from_request(request: &Request, seed: i64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    for segment in request.segments() {
        match segment {
            ContentSegment::Text(text) => hasher.update(text.as_bytes()),
            ContentSegment::Image(payload) => hasher.update((payload.len() as u64).to_be_bytes()),
        }
    }
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}
