//! PNG text-chunk extraction.
//!
//! Walks the PNG chunk structure over an in-memory buffer and decodes the
//! three text-bearing chunk types (`tEXt`, `zTXt`, `iTXt`) into keyword/text
//! pairs. Pixel data is never inspected; `IDAT` and every other chunk type
//! are skipped wholesale, and chunk CRCs are not verified.

use byteorder::{BigEndian, ReadBytesExt};
use flate2::read::ZlibDecoder;
use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom};

/// PNG file signature (first 8 bytes of any valid PNG).
const PNG_SIGNATURE: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

/// A text-bearing chunk lifted out of the PNG byte stream.
#[derive(Debug, Clone)]
pub struct TextChunk {
    pub chunk_type: [u8; 4],
    pub payload: Vec<u8>,
}

/// Splits a PNG byte buffer into its text-bearing chunks.
///
/// Buffers that do not start with the PNG signature yield an empty list.
/// A buffer that ends mid-chunk yields the chunks read up to that point,
/// never an error.
pub fn read_text_chunks(bytes: &[u8]) -> Vec<TextChunk> {
    let mut chunks = Vec::new();
    if bytes.len() < PNG_SIGNATURE.len() || bytes[..PNG_SIGNATURE.len()] != PNG_SIGNATURE {
        return chunks;
    }

    let mut reader = Cursor::new(&bytes[PNG_SIGNATURE.len()..]);
    loop {
        let length = match reader.read_u32::<BigEndian>() {
            Ok(length) => length as usize,
            Err(_) => break,
        };
        // A declared length larger than the whole buffer means the stream
        // is corrupt; stop rather than attempt the allocation.
        if length > bytes.len() {
            break;
        }
        let mut chunk_type = [0u8; 4];
        if reader.read_exact(&mut chunk_type).is_err() {
            break;
        }

        match &chunk_type {
            b"tEXt" | b"zTXt" | b"iTXt" => {
                let mut payload = vec![0u8; length];
                if reader.read_exact(&mut payload).is_err() {
                    break;
                }
                chunks.push(TextChunk {
                    chunk_type,
                    payload,
                });
                // Skip the 4-byte CRC.
                if reader.seek(SeekFrom::Current(4)).is_err() {
                    break;
                }
            }
            b"IEND" => break,
            _ => {
                // Skip payload and CRC of chunks we do not care about.
                if reader.seek(SeekFrom::Current(length as i64 + 4)).is_err() {
                    break;
                }
            }
        }
    }

    chunks
}

/// Decodes retained chunks into a keyword to text map.
///
/// Duplicate keywords keep the last chunk encountered. A chunk that fails
/// to decode (bad zlib stream, missing separators) is skipped on its own;
/// the map is built from whatever decodes cleanly.
pub fn build_text_map(chunks: &[TextChunk]) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for chunk in chunks {
        let decoded = match &chunk.chunk_type {
            b"tEXt" => decode_text_chunk(&chunk.payload),
            b"zTXt" => decode_ztxt_chunk(&chunk.payload),
            b"iTXt" => decode_itxt_chunk(&chunk.payload),
            _ => None,
        };
        match decoded {
            Some((keyword, text)) => {
                map.insert(keyword, text);
            }
            None => log::debug!(
                "Skipping undecodable {} chunk ({} bytes)",
                String::from_utf8_lossy(&chunk.chunk_type),
                chunk.payload.len()
            ),
        }
    }
    map
}

/// Extracts the PNG text metadata map from a byte buffer in one step.
pub fn extract_text_map(bytes: &[u8]) -> HashMap<String, String> {
    build_text_map(&read_text_chunks(bytes))
}

/// `tEXt`: keyword, null separator, Latin-1 text.
fn decode_text_chunk(payload: &[u8]) -> Option<(String, String)> {
    let null_pos = payload.iter().position(|&b| b == 0)?;
    let keyword = decode_text_bytes(&payload[..null_pos]);
    let text = decode_text_bytes(&payload[null_pos + 1..]);
    Some((keyword, text))
}

/// `zTXt`: keyword, null separator, compression method byte, zlib stream.
fn decode_ztxt_chunk(payload: &[u8]) -> Option<(String, String)> {
    let null_pos = payload.iter().position(|&b| b == 0)?;
    let keyword = decode_text_bytes(&payload[..null_pos]);

    let mut cursor = null_pos + 1;
    if cursor >= payload.len() {
        return None;
    }
    let compression_method = payload[cursor];
    cursor += 1;
    if compression_method != 0 {
        return None;
    }
    // Some writers emit a stray extra null before the deflate stream; a
    // zlib header never starts with 0x00, so it can only be a separator.
    if cursor < payload.len() && payload[cursor] == 0 {
        cursor += 1;
    }
    let text = decompress_zlib_text(&payload[cursor..])?;
    Some((keyword, text))
}

/// `iTXt`: keyword, null, compression flag and method, language tag, null,
/// translated keyword, null, UTF-8 text (optionally zlib compressed).
fn decode_itxt_chunk(payload: &[u8]) -> Option<(String, String)> {
    let null_pos = payload.iter().position(|&b| b == 0)?;
    let keyword = decode_text_bytes(&payload[..null_pos]);

    let rest = &payload[null_pos + 1..];
    if rest.len() < 2 {
        return None;
    }
    let compression_flag = rest[0];
    let compression_method = rest[1];
    if compression_flag > 1 {
        return None;
    }

    let after_flags = &rest[2..];
    let lang_end = after_flags.iter().position(|&b| b == 0)?;
    let after_lang = &after_flags[lang_end + 1..];
    let translated_end = after_lang.iter().position(|&b| b == 0)?;
    let text_bytes = &after_lang[translated_end + 1..];

    if compression_flag == 1 {
        if compression_method != 0 {
            return None;
        }
        let text = decompress_zlib_text(text_bytes)?;
        return Some((keyword, text));
    }
    String::from_utf8(text_bytes.to_vec())
        .ok()
        .map(|text| (keyword, text))
}

/// Decodes as UTF-8 when valid, falling back to a Latin-1 byte mapping.
///
/// The PNG spec says Latin-1 for `tEXt`/`zTXt`, but generation tools
/// overwhelmingly write UTF-8 into those chunks. Trying UTF-8 first keeps
/// both shapes readable and makes decoding infallible.
fn decode_text_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

fn decompress_zlib_text(data: &[u8]) -> Option<String> {
    let mut decoder = ZlibDecoder::new(data);
    let mut output = Vec::new();
    decoder.read_to_end(&mut output).ok()?;
    Some(decode_text_bytes(&output))
}

#[cfg(test)]
pub(crate) fn build_chunk(chunk_type: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut chunk = Vec::new();
    chunk.extend_from_slice(&(data.len() as u32).to_be_bytes());
    chunk.extend_from_slice(chunk_type);
    chunk.extend_from_slice(data);
    chunk.extend_from_slice(&[0, 0, 0, 0]); // CRC is never checked
    chunk
}

#[cfg(test)]
pub(crate) fn build_test_png(text_chunks: &[(&[u8; 4], Vec<u8>)]) -> Vec<u8> {
    let mut png = PNG_SIGNATURE.to_vec();
    png.extend(build_chunk(b"IHDR", &[0; 13]));
    for (chunk_type, data) in text_chunks {
        png.extend(build_chunk(chunk_type, data));
    }
    png.extend(build_chunk(b"IEND", &[]));
    png
}

#[cfg(test)]
pub(crate) fn text_payload(keyword: &str, text: &str) -> Vec<u8> {
    let mut payload = keyword.as_bytes().to_vec();
    payload.push(0);
    payload.extend_from_slice(text.as_bytes());
    payload
}

#[cfg(test)]
pub(crate) fn ztxt_payload(keyword: &str, text: &str) -> Vec<u8> {
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    let compressed = encoder.finish().unwrap();

    let mut payload = keyword.as_bytes().to_vec();
    payload.push(0); // keyword separator
    payload.push(0); // compression method
    payload.extend_from_slice(&compressed);
    payload
}
