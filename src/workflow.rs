//! Workflow graph analysis for node-based generation pipelines.
//!
//! ComfyUI and its relatives embed the full node graph as JSON. Two wire
//! encodings exist: a map keyed by node id (the API format) and an object
//! with an explicit `nodes` array (the editor format). Both flatten here
//! into one canonical node list, and prompt recovery walks that list.

use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// Input keys that mark a node as carrying canonical sampler wiring.
const POSITIVE_INPUT_KEYS: &[&str] = &["positive", "positive_conditioning", "positive_cond"];
const NEGATIVE_INPUT_KEYS: &[&str] = &["negative", "negative_conditioning", "negative_cond"];

/// Node class whose `inputs.text` holds free prompt text.
const TEXT_ENCODE_CLASS: &str = "CLIPTextEncode";

/// Stock negative-prompt vocabulary used to classify unlabeled text nodes.
const NEGATIVE_FINGERPRINT: &[&str] = &[
    "lowres",
    "bad anatomy",
    "bad hands",
    "text",
    "error",
    "missing fingers",
    "extra digit",
    "fewer digits",
    "cropped",
    "worst quality",
    "low quality",
    "normal quality",
    "jpeg artifacts",
    "signature",
    "watermark",
    "username",
    "blurry",
];

/// A single node of a canonicalized workflow graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub id: Option<String>,
    pub class_type: Option<String>,
    /// Display title, from `_meta.title` or a top-level `title` field.
    pub title: Option<String>,
    pub inputs: Map<String, Value>,
    /// The original JSON value, kept for pattern scanning.
    pub raw: Value,
}

/// A workflow graph flattened into a canonical node list.
///
/// Layout detection happens exactly once, at construction; traversal and
/// reference resolution never look at the original JSON shape again.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
}

/// The wire encodings a workflow JSON value can arrive in.
enum NodeLayout<'a> {
    /// Object with an explicit `nodes` array: every object element is a node.
    ExplicitList(&'a Vec<Value>),
    /// Top-level map keyed by node id; members qualify by shape.
    MapById(&'a Map<String, Value>),
    /// Bare array of node objects; members qualify by shape.
    BareList(&'a Vec<Value>),
}

fn detect_layout(value: &Value) -> Option<NodeLayout<'_>> {
    if let Some(nodes) = value.get("nodes").and_then(Value::as_array) {
        return Some(NodeLayout::ExplicitList(nodes));
    }
    if let Some(map) = value.as_object() {
        return Some(NodeLayout::MapById(map));
    }
    value.as_array().map(NodeLayout::BareList)
}

impl WorkflowGraph {
    /// Parses a JSON value into a canonical graph.
    ///
    /// Returns `None` when no member qualifies as a node, so a random JSON
    /// document never produces an empty graph that downstream code would
    /// mistake for a real workflow.
    pub fn from_value(value: &Value) -> Option<WorkflowGraph> {
        let nodes: Vec<GraphNode> = match detect_layout(value)? {
            NodeLayout::ExplicitList(items) => items
                .iter()
                .filter(|item| item.is_object())
                .filter_map(|item| GraphNode::from_value(item, None))
                .collect(),
            NodeLayout::MapById(map) => {
                let mut keyed: Vec<(&String, &Value)> = map
                    .iter()
                    .filter(|(_, node)| GraphNode::qualifies(node))
                    .collect();
                // Producing tools serialize nodes under ascending numeric
                // ids; sorting the same way keeps first-match rules stable.
                keyed.sort_by(|(a, _), (b, _)| compare_node_ids(a, b));
                keyed
                    .into_iter()
                    .filter_map(|(key, node)| GraphNode::from_value(node, Some(key.as_str())))
                    .collect()
            }
            NodeLayout::BareList(items) => items
                .iter()
                .filter(|item| GraphNode::qualifies(item))
                .filter_map(|item| GraphNode::from_value(item, None))
                .collect(),
        };

        if nodes.is_empty() {
            return None;
        }

        let mut index = HashMap::new();
        for (position, node) in nodes.iter().enumerate() {
            if let Some(id) = &node.id {
                index.entry(id.clone()).or_insert(position);
            }
        }
        Some(WorkflowGraph { nodes, index })
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node_by_id(&self, id: &str) -> Option<&GraphNode> {
        self.index.get(id).map(|&position| &self.nodes[position])
    }
}

impl GraphNode {
    fn from_value(value: &Value, fallback_id: Option<&str>) -> Option<GraphNode> {
        let object = value.as_object()?;
        let id = object
            .get("id")
            .and_then(stringify_id)
            .or_else(|| fallback_id.map(str::to_string));
        let class_type = object
            .get("class_type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let title = object
            .get("_meta")
            .and_then(|meta| meta.get("title"))
            .and_then(Value::as_str)
            .or_else(|| object.get("title").and_then(Value::as_str))
            .map(str::to_string);
        let inputs = object
            .get("inputs")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Some(GraphNode {
            id,
            class_type,
            title,
            inputs,
            raw: value.clone(),
        })
    }

    /// A map member or array element counts as a node when it exposes
    /// `class_type` or `inputs`. Version counters and extra metadata
    /// living next to the nodes fail this test.
    fn qualifies(value: &Value) -> bool {
        value.get("class_type").is_some() || value.get("inputs").is_some()
    }
}

/// Node ids as strings or numbers become strings; anything else is not an id.
fn stringify_id(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Numeric ids sort numerically and before non-numeric ones, matching the
/// integer-key iteration order of the tools that write these maps.
fn compare_node_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(left), Ok(right)) => left.cmp(&right),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// A workflow edge: either `[nodeId, outputIndex]` or a bare id value.
#[derive(Debug, Clone)]
pub struct NodeRef {
    target: Option<String>,
}

impl NodeRef {
    pub fn from_value(value: &Value) -> NodeRef {
        let target = match value {
            Value::Array(items) => items.first().and_then(stringify_id),
            other => stringify_id(other),
        };
        NodeRef { target }
    }

    /// Follows the reference to the target node's `inputs.text`.
    ///
    /// Dangling references and targets without usable text resolve to
    /// `None`; resolution never fails.
    pub fn resolve(&self, graph: &WorkflowGraph) -> Option<String> {
        let node = graph.node_by_id(self.target.as_deref()?)?;
        match node.inputs.get("text")? {
            Value::String(text) => Some(text.clone()),
            Value::Array(items) if !items.is_empty() => Some(stringify_loose(&items[0])),
            _ => None,
        }
    }
}

fn stringify_loose(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Positive and negative prompt text recovered from one graph.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromptExtraction {
    pub positive: String,
    pub negative: String,
}

impl PromptExtraction {
    pub fn is_empty(&self) -> bool {
        self.positive.is_empty() && self.negative.is_empty()
    }
}

/// Recovers prompt text from a canonical graph.
///
/// The sampler wiring is the authoritative source: the first node carrying
/// both a positive- and a negative-family input names the conditioning
/// actually used for generation. Text-encode nodes are swept afterwards as
/// a fallback for graphs without recognizable sampler wiring; duplicates
/// between the two passes collapse in the final join.
pub fn extract_prompts(graph: &WorkflowGraph) -> PromptExtraction {
    let mut positive = Vec::new();
    let mut negative = Vec::new();

    for node in graph.nodes() {
        let positive_ref = first_input_ref(node, POSITIVE_INPUT_KEYS);
        let negative_ref = first_input_ref(node, NEGATIVE_INPUT_KEYS);
        let (Some(positive_ref), Some(negative_ref)) = (positive_ref, negative_ref) else {
            continue;
        };
        if let Some(text) = positive_ref.resolve(graph) {
            positive.push(text);
        }
        if let Some(text) = negative_ref.resolve(graph) {
            negative.push(text);
        }
        break;
    }

    for node in graph.nodes() {
        if node.class_type.as_deref() != Some(TEXT_ENCODE_CLASS) {
            continue;
        }
        let Some(text) = node.inputs.get("text").and_then(Value::as_str) else {
            continue;
        };
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        let title_negative = node
            .title
            .as_deref()
            .map(|title| title.to_ascii_lowercase().contains("negative"))
            .unwrap_or(false);
        if title_negative || looks_negative(trimmed) {
            negative.push(trimmed.to_string());
        } else {
            positive.push(trimmed.to_string());
        }
    }

    PromptExtraction {
        positive: join_unique(&positive),
        negative: join_unique(&negative),
    }
}

fn first_input_ref(node: &GraphNode, keys: &[&str]) -> Option<NodeRef> {
    keys.iter()
        .find_map(|key| node.inputs.get(*key))
        .map(NodeRef::from_value)
}

/// Reports whether free text reads like a stock negative prompt.
///
/// A fingerprint keyword only counts at the start of a comma- or
/// newline-separated fragment and when followed by a non-alphanumeric
/// boundary, so "textured wall" never matches on "text".
pub fn looks_negative(text: &str) -> bool {
    text.to_ascii_lowercase()
        .split([',', '\n'])
        .map(str::trim)
        .filter(|fragment| !fragment.is_empty())
        .any(fragment_opens_with_keyword)
}

fn fragment_opens_with_keyword(fragment: &str) -> bool {
    NEGATIVE_FINGERPRINT.iter().any(|keyword| {
        fragment
            .strip_prefix(keyword)
            .is_some_and(|rest| rest.chars().next().map_or(true, |next| !next.is_alphanumeric()))
    })
}

/// Comma-joins fragments, dropping case-insensitive duplicates and blanks.
fn join_unique(texts: &[String]) -> String {
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();
    for text in texts {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_ascii_lowercase()) {
            ordered.push(trimmed.to_string());
        }
    }
    ordered.join(", ")
}
