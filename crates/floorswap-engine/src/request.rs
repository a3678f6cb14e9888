use floorswap_contracts::request::{ImagePayload, Request};

use crate::error::{FloorError, Result};

pub const BASE_IMAGE_LABEL: &str = "BASE_IMAGE";
pub const MASK_IMAGE_LABEL: &str = "MASK_IMAGE";
pub const PRODUCT_HINTS_HEADER: &str = "# PRODUCT HINTS";

const UNIVERSAL_INSTRUCTION: &str = "\
SYSTEM: FLOOR REPLACEMENT (room photo -> target floor product)

GOAL
Replace ONLY the floor of BASE_IMAGE with the product shown in the reference images so the result is seamless, photorealistic and physically consistent with the original scene.

INPUTS
- BASE_IMAGE: the original interior photo.
- MASK_IMAGE (optional): binary mask; white = floor region to replace, black = everything else. When present, the edit scope is strictly limited to the mask.
- REFERENCE_IMAGE_1..N: the target floor product (swatch, close-ups, installed photos). They are the only source of truth for colour, grain and texture.
- PRODUCT HINTS (optional): free-text notes on pattern, plank width, gloss, tone.

EDIT SCOPE (STRICT)
- Modify ONLY floor pixels (inside MASK_IMAGE when given). Walls, skirting, trim, furniture, rugs and reflections on non-floor surfaces stay identical.
- Preserve every occlusion: objects standing on the floor remain unchanged on top of the new floor.
- Edges at skirting and thresholds must be clean, with no halos, bleeding or misalignment.

COLOUR FIDELITY (HIGHEST PRIORITY)
- Match the product colour of REFERENCE_IMAGE_1 exactly: hue, saturation, brightness and warmth.
- Do not lighten, darken or shift towards red or yellow unless the reference shows it.
- Keep the room's lighting and shadows by overlaying them on the correct reference colour.
- Do not change white balance or any colour outside the floor.

OUTPUT REQUIREMENTS
- Lay the product at true scale following the floor plane's perspective.
- Preserve original lighting, shadows, reflections and occlusions.
- Natural joints and subtle bevels; no visible tiling or repetition artefacts.

FAILURE MODES TO AVOID
- Editing outside the floor or mask.
- Inventing patterns (chevron, herringbone, panels) not present in the references.
- Altering global colour or contrast of the room.
- Miniaturising or overscaling the product relative to true scale.";

const MULTI_REFERENCE_INSTRUCTION: &str = "\
You are performing a precise floor replacement edit.

INPUT ROLES
- BASE_IMAGE: the room photo. Keep everything outside the floor unchanged.
- MASK_IMAGE (if present): binary mask of the floor region. Edit ONLY inside it.
- REFERENCE_IMAGE_1..N: the SAME product photographed under different lighting or at different distances. Together they are the sole source of truth for grain, texture and especially COLOUR. Tight close-ups show exact texture; use them for detail, not for layout.

COLOUR REQUIREMENTS (STRICT, HIGHEST PRIORITY)
- Reproduce the colour exactly as it appears across the references: hue, saturation, brightness and warmth.
- Do not shift towards lighter, darker, redder or yellower tones.
- Do not adapt the colour to fit the room lighting; if in doubt, prefer the reference colour over room context.
- Colour fidelity matters more than grain variation or lighting adaptation.

OUTPUT REQUIREMENTS
1. Replace ONLY the floor with the referenced product at true scale.
2. Preserve all original lighting effects (shadows, reflections) overlaid on the correct reference colour.
3. Keep natural joints, bevels and staggering; no tiling artefacts.
4. Keep furniture, walls and everything outside the floor identical and sharp.

FAILURE MODES TO AVOID
- Adjusting colour balance to blend in.
- Brightening, washing out or desaturating the floor.
- Altering non-floor colours.
- Changing the laying pattern shown in the references.";

/// Fixed instruction texts. Each carries a version tag recorded in receipts so
/// outputs can be traced to the exact wording that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstructionTemplate {
    #[default]
    Universal,
    MultiReference,
}

impl InstructionTemplate {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "universal" => Some(Self::Universal),
            "multi-reference" | "multi" => Some(Self::MultiReference),
            _ => None,
        }
    }

    pub fn version(self) -> &'static str {
        match self {
            Self::Universal => "universal-floor-replace/v1",
            Self::MultiReference => "multi-reference-floor-replace/v1",
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            Self::Universal => UNIVERSAL_INSTRUCTION,
            Self::MultiReference => MULTI_REFERENCE_INSTRUCTION,
        }
    }
}

pub fn reference_label(index: usize) -> String {
    format!("REFERENCE_IMAGE_{index}")
}

/// Template text with caller hints appended under their own header. Hints
/// never replace the template.
pub fn compose_instruction(template: InstructionTemplate, hints: Option<&str>) -> String {
    match hints.map(str::trim).filter(|value| !value.is_empty()) {
        Some(hints) => format!("{}\n\n{PRODUCT_HINTS_HEADER}\n{hints}", template.text()),
        None => template.text().to_string(),
    }
}

/// Build the labelled request sequence:
/// `BASE_IMAGE, room, [MASK_IMAGE, mask], (REFERENCE_IMAGE_n, ref)..., instruction`.
///
/// Image contents are not inspected.
pub fn assemble_request(
    room: &ImagePayload,
    mask: Option<&ImagePayload>,
    references: &[ImagePayload],
    instruction: &str,
) -> Result<Request> {
    if references.is_empty() {
        return Err(FloorError::InvalidJob(
            "at least one reference image is required".to_string(),
        ));
    }

    let mut request = Request::new();
    request.push_text(BASE_IMAGE_LABEL);
    request.push_image(room.clone());
    if let Some(mask) = mask {
        request.push_text(MASK_IMAGE_LABEL);
        request.push_image(mask.clone());
    }
    for (idx, reference) in references.iter().enumerate() {
        request.push_text(reference_label(idx + 1));
        request.push_image(reference.clone());
    }
    request.push_text(instruction);
    Ok(request)
}

#[cfg(test)]
mod tests {
    use floorswap_contracts::request::{ContentSegment, SegmentKind};

    use super::*;

    fn payload(tag: u8, mime: &str) -> ImagePayload {
        ImagePayload::new(vec![tag; 8], mime)
    }

    #[test]
    fn segments_follow_fixed_order_with_mask_and_two_references() -> anyhow::Result<()> {
        let room = payload(1, "image/jpeg");
        let mask = payload(2, "image/png");
        let refs = vec![payload(3, "image/jpeg"), payload(4, "image/jpeg")];
        let instruction = compose_instruction(InstructionTemplate::Universal, Some("matte"));

        let request = assemble_request(&room, Some(&mask), &refs, &instruction)?;
        let kinds: Vec<SegmentKind> = request.segments().iter().map(ContentSegment::kind).collect();
        assert_eq!(
            kinds,
            vec![
                SegmentKind::Text,
                SegmentKind::Image,
                SegmentKind::Text,
                SegmentKind::Image,
                SegmentKind::Text,
                SegmentKind::Image,
                SegmentKind::Text,
                SegmentKind::Image,
                SegmentKind::Text,
            ]
        );

        let segments = request.segments();
        assert_eq!(segments[0].as_text(), Some("BASE_IMAGE"));
        assert_eq!(segments[1].as_image(), Some(&room));
        assert_eq!(segments[2].as_text(), Some("MASK_IMAGE"));
        assert_eq!(segments[3].as_image(), Some(&mask));
        assert_eq!(segments[4].as_text(), Some("REFERENCE_IMAGE_1"));
        assert_eq!(segments[5].as_image(), Some(&refs[0]));
        assert_eq!(segments[6].as_text(), Some("REFERENCE_IMAGE_2"));
        assert_eq!(segments[7].as_image(), Some(&refs[1]));
        assert_eq!(segments[8].as_text(), Some(instruction.as_str()));
        Ok(())
    }

    #[test]
    fn mask_segments_are_omitted_without_a_mask() -> anyhow::Result<()> {
        let request = assemble_request(
            &payload(1, "image/jpeg"),
            None,
            &[payload(3, "image/jpeg")],
            "do it",
        )?;
        let labels: Vec<&str> = request
            .segments()
            .iter()
            .filter_map(ContentSegment::as_text)
            .collect();
        assert_eq!(labels, vec!["BASE_IMAGE", "REFERENCE_IMAGE_1", "do it"]);
        assert_eq!(request.len(), 5);
        Ok(())
    }

    #[test]
    fn references_are_required() {
        let err = assemble_request(&payload(1, "image/jpeg"), None, &[], "x").unwrap_err();
        assert!(matches!(err, FloorError::InvalidJob(_)));
    }

    #[test]
    fn hints_are_appended_not_substituted() {
        let plain = compose_instruction(InstructionTemplate::Universal, None);
        assert_eq!(plain, InstructionTemplate::Universal.text());
        assert_eq!(compose_instruction(InstructionTemplate::Universal, Some("   ")), plain);

        let hinted = compose_instruction(
            InstructionTemplate::MultiReference,
            Some(" Light natural oak, 200mm planks "),
        );
        assert!(hinted.starts_with(InstructionTemplate::MultiReference.text()));
        assert!(hinted.ends_with("# PRODUCT HINTS\nLight natural oak, 200mm planks"));
    }

    #[test]
    fn templates_parse_and_carry_versions() {
        assert_eq!(
            InstructionTemplate::parse("multi_reference"),
            Some(InstructionTemplate::MultiReference)
        );
        assert_eq!(InstructionTemplate::parse("Universal"), Some(InstructionTemplate::Universal));
        assert_eq!(InstructionTemplate::parse("freeform"), None);
        assert_ne!(
            InstructionTemplate::Universal.version(),
            InstructionTemplate::MultiReference.version()
        );
    }
}
