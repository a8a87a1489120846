//! Generation-metadata extraction for AI-produced PNG images.
//!
//! Images coming out of Stable Diffusion pipelines carry their own recipe
//! in PNG text chunks: the prompt, the negative prompt, the checkpoint and
//! any LoRA models used. The encodings differ per tool. ComfyUI embeds a
//! JSON node graph, A1111 writes one flat parameter block, NovelAI splits
//! the data across three chunks. This crate reads them all and produces a
//! single flat record per image.
//!
//! Extraction is lossy by contract: nothing that goes wrong while reading
//! an image is an error, the worst case is a record carrying only the
//! source identifier.

pub mod a1111;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod model_scan;
pub mod png_text;
pub mod workflow;

pub use error::FetchError;
pub use extract::{
    extract_from_bytes, extract_from_parameter_text, is_png_source, ExtractedMetadata,
    MetadataExtractor,
};
pub use fetch::{ByteSource, HttpByteSource};
