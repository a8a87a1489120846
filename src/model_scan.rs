//! Checkpoint and LoRA name discovery over workflow nodes.
//!
//! Loader node schemas differ wildly between tools, but the field
//! vocabulary is stable. Each node is serialized back to JSON text and
//! scanned for quoted string values sitting behind the known field names,
//! which keeps this component schema-blind.

use crate::workflow::WorkflowGraph;
use std::collections::HashSet;

/// Checkpoint field names, in match-priority order.
const CHECKPOINT_KEYS: &[&str] = &["ckpt_name", "model", "checkpoint", "model_name"];

/// LoRA field names, in match-priority order.
const LORA_KEYS: &[&str] = &["lora_name", "lora name", "lora"];

/// Model names found across one graph's nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelScan {
    pub checkpoint: Option<String>,
    pub loras: Vec<String>,
}

/// Scans every node of a graph for checkpoint and LoRA references.
///
/// The first checkpoint match wins and later patterns are not applied.
/// LoRA names accumulate across all nodes into a first-seen-ordered list,
/// deduplicated case-insensitively.
pub fn scan_graph(graph: &WorkflowGraph) -> ModelScan {
    let mut scan = ModelScan::default();
    let mut seen_loras = HashSet::new();

    for node in graph.nodes() {
        let serialized = node.raw.to_string();
        let lowered = serialized.to_ascii_lowercase();

        if scan.checkpoint.is_none() {
            scan.checkpoint = CHECKPOINT_KEYS
                .iter()
                .find_map(|key| quoted_values(&serialized, &lowered, key).into_iter().next());
        }

        for key in LORA_KEYS {
            for name in quoted_values(&serialized, &lowered, key) {
                if seen_loras.insert(name.to_ascii_lowercase()) {
                    scan.loras.push(name);
                }
            }
        }
    }

    scan
}

/// Collects every `"key": "value"` string value in serialized JSON text.
///
/// The key match is case-insensitive and exact: the needle includes both
/// quotes, so `"model"` never matches inside `"strength_model"` or
/// `"model_name"`. Values that are arrays or numbers (node references,
/// weights) are not quoted strings and are passed over. Keys and quotes
/// inside string values arrive escaped as `\"` from the serializer, so
/// they cannot produce false positives either.
fn quoted_values(original: &str, lowered: &str, key: &str) -> Vec<String> {
    let needle = format!("\"{}\"", key);
    let bytes = original.as_bytes();
    let mut found = Vec::new();
    let mut cursor = 0;

    while let Some(offset) = lowered[cursor..].find(&needle) {
        let mut position = cursor + offset + needle.len();
        cursor += offset + needle.len();

        while position < bytes.len() && bytes[position].is_ascii_whitespace() {
            position += 1;
        }
        if position >= bytes.len() || bytes[position] != b':' {
            continue;
        }
        position += 1;
        while position < bytes.len() && bytes[position].is_ascii_whitespace() {
            position += 1;
        }
        if position >= bytes.len() || bytes[position] != b'"' {
            continue;
        }
        position += 1;

        let value_start = position;
        while position < bytes.len() {
            match bytes[position] {
                b'"' => break,
                b'\\' => position += 2,
                _ => position += 1,
            }
        }
        if position >= bytes.len() {
            // Unterminated string, nothing more to scan.
            break;
        }

        let value = original[value_start..position].trim();
        if !value.is_empty() {
            found.push(value.to_string());
        }
        cursor = position + 1;
    }

    found
}
