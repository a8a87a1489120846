//! Top-level extraction engine and record composition.
//!
//! Everything here is pure: bytes in, record out. The only effectful path
//! is [`MetadataExtractor`], which pairs the pure transform with a
//! [`ByteSource`] for callers holding a URL instead of bytes.

use crate::a1111;
use crate::error::FetchError;
use crate::fetch::{ByteSource, HttpByteSource};
use crate::model_scan::{self, ModelScan};
use crate::png_text;
use crate::workflow::{self, PromptExtraction, WorkflowGraph};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Chunk keywords that may hold a JSON workflow, most specific first.
const GRAPH_CANDIDATE_KEYS: &[&str] = &[
    "workflow",
    "Workflow",
    "invokeai_metadata",
    "prompt",
    "Prompt",
    "parameters",
    "Parameters",
];

/// Chunk keywords whose raw text feeds the flat prompt path.
const PROMPT_KEYS: &[&str] = &["prompt", "Prompt"];
const PARAMETER_KEYS: &[&str] = &["parameters", "Parameters"];

/// Generation metadata recovered from one image.
///
/// Only `src` is always present. `parameters` carries the negative prompt;
/// the name is the display convention inherited from the flat A1111 block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedMetadata {
    pub src: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loras: Vec<String>,
}

impl ExtractedMetadata {
    /// A record carrying only the source identifier.
    pub fn bare(src: &str) -> Self {
        ExtractedMetadata {
            src: src.to_string(),
            ..Default::default()
        }
    }

    /// True when nothing beyond the source identifier was recovered.
    pub fn is_bare(&self) -> bool {
        self.prompt.is_none()
            && self.parameters.is_none()
            && self.checkpoint.is_none()
            && self.loras.is_empty()
    }
}

/// True when the source identifier names a PNG, case-insensitively.
pub fn is_png_source(src: &str) -> bool {
    src.get(src.len().saturating_sub(4)..)
        .map(|tail| tail.eq_ignore_ascii_case(".png"))
        .unwrap_or(false)
}

/// Extracts generation metadata from in-memory PNG bytes.
///
/// Pure and deterministic: the same input always yields the same record.
/// Sources not ending in `.png` short-circuit to a bare record before any
/// byte is inspected, and nothing in here ever fails; corrupt input
/// degrades to a bare record.
pub fn extract_from_bytes(src: &str, bytes: &[u8]) -> ExtractedMetadata {
    if !is_png_source(src) {
        return ExtractedMetadata::bare(src);
    }
    let text_map = png_text::extract_text_map(bytes);
    compose(src, &text_map)
}

/// Builds a record from a bare flat parameter block, e.g. the content of
/// a sidecar text file saved next to an image.
pub fn extract_from_parameter_text(src: &str, text: &str) -> ExtractedMetadata {
    let split = a1111::split_parameter_text(text);
    ExtractedMetadata {
        src: src.to_string(),
        prompt: sanitize_field(non_empty(split.positive)),
        parameters: sanitize_field(split.negative),
        ..Default::default()
    }
}

/// Composes the final record from a decoded chunk text map.
fn compose(src: &str, text_map: &HashMap<String, String>) -> ExtractedMetadata {
    let analysis = analyze_candidates(text_map);

    let mut prompt = first_present(text_map, PROMPT_KEYS);
    let mut parameters = first_present(text_map, PARAMETER_KEYS);

    // NovelAI stores prompts in a Software/Description/Comment triple
    // instead; synthesize a flat block so the normal split applies.
    if prompt.is_none() && parameters.is_none() {
        prompt = novelai_parameter_block(text_map);
    }

    if analysis.prompts.positive.is_empty() {
        if let Some(raw) = prompt.take() {
            let split = a1111::split_parameter_text(&raw);
            prompt = non_empty(split.positive);
            if parameters.is_none() {
                parameters = split.negative;
            }
        }
        if let Some(raw) = parameters.clone() {
            if contains_negative_marker(&raw) {
                let split = a1111::split_parameter_text(&raw);
                if prompt.is_none() {
                    prompt = non_empty(split.positive);
                }
                parameters = split.negative;
            }
        }
    } else {
        prompt = Some(analysis.prompts.positive.clone());
    }

    if parameters.is_none() && !analysis.prompts.negative.is_empty() {
        parameters = Some(analysis.prompts.negative.clone());
    }

    ExtractedMetadata {
        src: src.to_string(),
        prompt: sanitize_field(prompt),
        parameters: sanitize_field(parameters),
        checkpoint: analysis.models.checkpoint,
        loras: analysis.models.loras,
    }
}

struct CandidateAnalysis {
    prompts: PromptExtraction,
    models: ModelScan,
}

/// Walks the JSON candidate chunks in priority order.
///
/// The first candidate yielding a positive prompt wins outright and ends
/// the walk. A candidate yielding only a negative prompt is kept as a
/// fallback while later candidates are still tried for a positive; prompt
/// halves from different candidates are never merged. Checkpoint and LoRA
/// scanning accumulate across every candidate parsed before the walk ends.
fn analyze_candidates(text_map: &HashMap<String, String>) -> CandidateAnalysis {
    let mut prompts = PromptExtraction::default();
    let mut models = ModelScan::default();
    let mut seen_loras: HashSet<String> = HashSet::new();

    for key in GRAPH_CANDIDATE_KEYS {
        let Some(raw) = text_map.get(*key) else {
            continue;
        };
        if !looks_like_json(raw) {
            continue;
        }
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(error) => {
                log::debug!("Skipping unparseable {} candidate: {}", key, error);
                continue;
            }
        };
        let Some(graph) = WorkflowGraph::from_value(&value) else {
            log::debug!("No workflow nodes recognized in {} candidate", key);
            continue;
        };

        let scan = model_scan::scan_graph(&graph);
        if models.checkpoint.is_none() {
            models.checkpoint = scan.checkpoint;
        }
        for lora in scan.loras {
            if seen_loras.insert(lora.to_ascii_lowercase()) {
                models.loras.push(lora);
            }
        }

        let extraction = workflow::extract_prompts(&graph);
        if !extraction.positive.is_empty() {
            prompts = extraction;
            break;
        }
        if prompts.negative.is_empty() && !extraction.negative.is_empty() {
            prompts = extraction;
        }
    }

    CandidateAnalysis { prompts, models }
}

fn first_present(text_map: &HashMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| text_map.get(*key))
        .map(|text| text.trim())
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn contains_negative_marker(text: &str) -> bool {
    text.to_ascii_lowercase().contains("negative prompt:")
}

/// True when text plausibly starts a JSON document.
fn looks_like_json(text: &str) -> bool {
    matches!(
        text.trim_start().as_bytes().first(),
        Some(b'{') | Some(b'[')
    )
}

/// Drops empty and still-JSON-shaped values. Raw JSON must never surface
/// in a prompt field, whatever path produced it.
fn sanitize_field(field: Option<String>) -> Option<String> {
    let text = field?;
    let trimmed = text.trim();
    if trimmed.is_empty() || looks_like_json(trimmed) {
        return None;
    }
    Some(trimmed.to_string())
}

fn non_empty(text: String) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Synthesizes an A1111-style block from NovelAI's chunk triple: the
/// positive prompt lives in `Description` and the negative under the `uc`
/// key of the JSON `Comment`.
fn novelai_parameter_block(text_map: &HashMap<String, String>) -> Option<String> {
    let software = text_map
        .get("Software")
        .map(String::as_str)
        .unwrap_or_default();
    if !software.eq_ignore_ascii_case("novelai") {
        return None;
    }

    let description = text_map
        .get("Description")
        .or_else(|| text_map.get("description"))
        .map(|text| text.trim())
        .unwrap_or_default();
    let comment = text_map
        .get("Comment")
        .or_else(|| text_map.get("comment"))
        .map(|text| text.trim())
        .unwrap_or_default();

    if description.is_empty() && comment.is_empty() {
        return None;
    }

    let mut lines = Vec::new();
    if !description.is_empty() {
        lines.push(description.to_string());
    }
    if let Ok(comment_json) = serde_json::from_str::<Value>(comment) {
        if let Some(negative) = comment_json
            .get("uc")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|negative| !negative.is_empty())
        {
            lines.push(format!("Negative prompt: {}", negative));
        }
    }

    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Front door for callers holding a source identifier instead of bytes.
///
/// Holds no mutable state; one value can serve any number of concurrent
/// callers. Exactly one fetch happens per extraction, and only for `.png`
/// sources.
pub struct MetadataExtractor<S> {
    source: S,
}

impl MetadataExtractor<HttpByteSource> {
    /// An extractor backed by the default HTTP byte source.
    pub fn new() -> Result<Self, FetchError> {
        Ok(MetadataExtractor {
            source: HttpByteSource::new()?,
        })
    }
}

impl<S: ByteSource> MetadataExtractor<S> {
    pub fn with_source(source: S) -> Self {
        MetadataExtractor { source }
    }

    /// Extracts metadata for one source identifier.
    ///
    /// Non-`.png` sources return a bare record without touching the byte
    /// source. Fetch failures propagate as-is; there is no partial record
    /// for a failed fetch.
    pub async fn extract(&self, src: &str) -> Result<ExtractedMetadata, FetchError> {
        if !is_png_source(src) {
            return Ok(ExtractedMetadata::bare(src));
        }
        let bytes = self.source.fetch(src).await?;
        Ok(extract_from_bytes(src, &bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::png_text::{build_test_png, text_payload, ztxt_payload};

    fn png_with_text(pairs: &[(&str, &str)]) -> Vec<u8> {
        let chunks: Vec<(&[u8; 4], Vec<u8>)> = pairs
            .iter()
            .map(|(keyword, text)| (b"tEXt", text_payload(keyword, text)))
            .collect();
        build_test_png(&chunks)
    }

    const SAMPLER_GRAPH: &str = r#"{
        "3": {"class_type": "KSampler", "inputs": {
            "positive": ["5", 0], "negative": ["6", 0], "model": ["4", 0], "steps": 20
        }},
        "4": {"class_type": "CheckpointLoaderSimple",
              "inputs": {"ckpt_name": "dreamshaper_8.safetensors"}},
        "5": {"class_type": "CLIPTextEncode", "inputs": {"text": "cat"}},
        "6": {"class_type": "CLIPTextEncode", "inputs": {"text": "lowres"}},
        "7": {"class_type": "LoraLoader", "inputs": {
            "lora_name": "add_detail.safetensors", "model": ["4", 0]
        }}
    }"#;

    #[test]
    fn test_non_png_source_short_circuits() {
        let png = png_with_text(&[("parameters", "a prompt")]);
        let record = extract_from_bytes("image.jpg", &png);
        assert_eq!(record, ExtractedMetadata::bare("image.jpg"));
    }

    #[test]
    fn test_png_extension_check_is_case_insensitive() {
        assert!(is_png_source("photo.PNG"));
        assert!(is_png_source("https://host/images/a.png"));
        assert!(!is_png_source("archive.png.zip"));
        assert!(!is_png_source("png"));
        assert!(!is_png_source(""));
    }

    #[test]
    fn test_png_without_text_chunks_yields_bare_record() {
        let png = build_test_png(&[]);
        let record = extract_from_bytes("empty.png", &png);
        assert!(record.is_bare());
        assert_eq!(record.src, "empty.png");
    }

    #[test]
    fn test_invalid_bytes_yield_bare_record() {
        let record = extract_from_bytes("broken.png", b"this is not a png");
        assert!(record.is_bare());
    }

    #[test]
    fn test_flat_parameters_chunk_is_split() {
        let png = png_with_text(&[(
            "parameters",
            "A, B\nNegative prompt: C, D\nSteps: 20, Sampler: Euler",
        )]);
        let record = extract_from_bytes("flat.png", &png);
        assert_eq!(record.prompt.as_deref(), Some("A, B"));
        assert_eq!(record.parameters.as_deref(), Some("C, D"));
        assert_eq!(record.checkpoint, None);
        assert!(record.loras.is_empty());
    }

    #[test]
    fn test_workflow_graph_end_to_end() {
        let png = png_with_text(&[("workflow", SAMPLER_GRAPH)]);
        let record = extract_from_bytes("graph.png", &png);
        assert_eq!(record.prompt.as_deref(), Some("cat"));
        assert_eq!(record.parameters.as_deref(), Some("lowres"));
        assert_eq!(record.checkpoint.as_deref(), Some("dreamshaper_8.safetensors"));
        assert_eq!(record.loras, vec!["add_detail.safetensors".to_string()]);
    }

    #[test]
    fn test_graph_in_ztxt_chunk_is_decoded() {
        let png = build_test_png(&[(b"zTXt", ztxt_payload("prompt", SAMPLER_GRAPH))]);
        let record = extract_from_bytes("compressed.png", &png);
        assert_eq!(record.prompt.as_deref(), Some("cat"));
        assert_eq!(record.parameters.as_deref(), Some("lowres"));
    }

    #[test]
    fn test_unparseable_json_candidate_yields_no_fields() {
        let png = png_with_text(&[("prompt", "{\"3\": {\"class_type\": \"KSampler\"")]);
        let record = extract_from_bytes("broken.png", &png);
        assert_eq!(record.prompt, None);
        assert_eq!(record.parameters, None);
    }

    #[test]
    fn test_invalid_workflow_falls_through_to_next_candidate() {
        let png = png_with_text(&[("workflow", "{not json"), ("prompt", SAMPLER_GRAPH)]);
        let record = extract_from_bytes("fallthrough.png", &png);
        assert_eq!(record.prompt.as_deref(), Some("cat"));
    }

    #[test]
    fn test_workflow_candidate_outranks_prompt_chunk() {
        let other_graph = r#"{
            "1": {"class_type": "KSampler",
                  "inputs": {"positive": ["2", 0], "negative": ["3", 0]}},
            "2": {"class_type": "CLIPTextEncode", "inputs": {"text": "from workflow"}},
            "3": {"class_type": "CLIPTextEncode", "inputs": {"text": "bad anatomy"}}
        }"#;
        let png = png_with_text(&[("prompt", SAMPLER_GRAPH), ("workflow", other_graph)]);
        let record = extract_from_bytes("priority.png", &png);
        assert_eq!(record.prompt.as_deref(), Some("from workflow"));
        assert_eq!(record.parameters.as_deref(), Some("bad anatomy"));
    }

    #[test]
    fn test_model_scan_accumulates_across_candidates() {
        // The workflow candidate has the loras but no prompt text; the
        // prompt candidate supplies the positive and the checkpoint.
        let lora_only = r#"{
            "7": {"class_type": "LoraLoader", "inputs": {"lora_name": "style.safetensors"}}
        }"#;
        let png = png_with_text(&[("workflow", lora_only), ("prompt", SAMPLER_GRAPH)]);
        let record = extract_from_bytes("both.png", &png);
        assert_eq!(record.prompt.as_deref(), Some("cat"));
        assert_eq!(record.checkpoint.as_deref(), Some("dreamshaper_8.safetensors"));
        assert_eq!(
            record.loras,
            vec!["style.safetensors".to_string(), "add_detail.safetensors".to_string()]
        );
    }

    #[test]
    fn test_dangling_references_never_fail() {
        let dangling = r#"{
            "1": {"class_type": "KSampler",
                  "inputs": {"positive": ["99", 0], "negative": ["98", 0]}}
        }"#;
        let png = png_with_text(&[("workflow", dangling)]);
        let record = extract_from_bytes("dangling.png", &png);
        assert_eq!(record.prompt, None);
        assert_eq!(record.parameters, None);
    }

    #[test]
    fn test_json_shaped_field_values_are_suppressed() {
        // Parses as JSON but holds no nodes, so no graph is built and the
        // flat path sees JSON-shaped text, which sanitization removes.
        let png = png_with_text(&[("parameters", "{\"seed\": 42}")]);
        let record = extract_from_bytes("jsonish.png", &png);
        assert_eq!(record.prompt, None);
        assert_eq!(record.parameters, None);
    }

    #[test]
    fn test_flat_prompt_chunk_without_marker_passes_through() {
        let png = png_with_text(&[("prompt", "a lighthouse at dusk")]);
        let record = extract_from_bytes("plain.png", &png);
        assert_eq!(record.prompt.as_deref(), Some("a lighthouse at dusk"));
        assert_eq!(record.parameters, None);
    }

    #[test]
    fn test_marker_in_parameters_chunk_fills_empty_prompt() {
        let png = png_with_text(&[("parameters", "harbor\nNegative prompt: rain")]);
        let record = extract_from_bytes("params.png", &png);
        assert_eq!(record.prompt.as_deref(), Some("harbor"));
        assert_eq!(record.parameters.as_deref(), Some("rain"));
    }

    #[test]
    fn test_flat_parameters_survive_alongside_graph_prompt() {
        // The graph supplies the positive; the raw parameters chunk holds
        // no marker and stays as-is rather than being replaced by the
        // graph negative.
        let png = png_with_text(&[("workflow", SAMPLER_GRAPH), ("parameters", "raw settings text")]);
        let record = extract_from_bytes("mixed.png", &png);
        assert_eq!(record.prompt.as_deref(), Some("cat"));
        assert_eq!(record.parameters.as_deref(), Some("raw settings text"));
    }

    #[test]
    fn test_graph_negative_fills_only_empty_parameters() {
        let png = png_with_text(&[("workflow", SAMPLER_GRAPH)]);
        let record = extract_from_bytes("graph.png", &png);
        assert_eq!(record.parameters.as_deref(), Some("lowres"));
    }

    #[test]
    fn test_novelai_chunks_are_synthesized() {
        let png = png_with_text(&[
            ("Software", "NovelAI"),
            ("Description", "a shrine in the rain"),
            ("Comment", r#"{"uc": "lowres, bad anatomy", "steps": 28}"#),
        ]);
        let record = extract_from_bytes("novelai.png", &png);
        assert_eq!(record.prompt.as_deref(), Some("a shrine in the rain"));
        assert_eq!(record.parameters.as_deref(), Some("lowres, bad anatomy"));
    }

    #[test]
    fn test_novelai_description_only() {
        let png = png_with_text(&[
            ("Software", "NovelAI"),
            ("Description", "footbridge over a creek"),
        ]);
        let record = extract_from_bytes("novelai.png", &png);
        assert_eq!(record.prompt.as_deref(), Some("footbridge over a creek"));
        assert_eq!(record.parameters, None);
    }

    #[test]
    fn test_novelai_ignored_when_software_differs() {
        let png = png_with_text(&[
            ("Software", "SomethingElse"),
            ("Description", "should not surface"),
        ]);
        let record = extract_from_bytes("other.png", &png);
        assert_eq!(record.prompt, None);
    }

    #[test]
    fn test_extraction_is_deterministic() {
        let png = png_with_text(&[
            ("workflow", SAMPLER_GRAPH),
            ("parameters", "x\nNegative prompt: y\nSteps: 1"),
        ]);
        let first = extract_from_bytes("same.png", &png);
        let second = extract_from_bytes("same.png", &png);
        assert_eq!(first, second);
    }

    #[test]
    fn test_sidecar_parameter_text_builds_record() {
        let record = extract_from_parameter_text(
            "img.png",
            "villa garden\nNegative prompt: powerlines\nSteps: 20",
        );
        assert_eq!(record.prompt.as_deref(), Some("villa garden"));
        assert_eq!(record.parameters.as_deref(), Some("powerlines"));
        assert_eq!(record.checkpoint, None);
    }

    #[test]
    fn test_serialization_omits_absent_fields() {
        let record = ExtractedMetadata::bare("only-src.png");
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, "{\"src\":\"only-src.png\"}");
    }
}
