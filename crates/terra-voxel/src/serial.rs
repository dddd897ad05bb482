//! Binary serialization of a [`Block`] into the opaque blob stored by a
//! [`PersistenceGateway`](crate::PersistenceGateway).
//!
//! ## Binary layout
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | Magic bytes `"TVBK"` |
//! | 4 | 1 | Format version (`u8`, currently 1) |
//! | 5 | 1 | Flags (bit 0: payload is LZ4 compressed, size prepended) |
//! | 6 | .. | Payload |
//!
//! Payload:
//!
//! | Size | Field |
//! |------|-------|
//! | 1 | Generation (0 ungenerated, 1 partial, 2 full) |
//! | 1 | State bits (bit 0: underground, bit 1: lighting expired) |
//! | 4096 × 2 | Content ids (`u16`, little-endian) |
//! | 4096 | `param1` |
//! | 4096 | `param2` |
//! | 2 | Metadata entry count (`u16`) |
//! | .. | Entries: node index `u16`, pair count `u16`, then per pair a `u16`-prefixed key and a `u32`-prefixed value |

use lz4_flex::{compress_prepend_size, decompress_size_prepended};

use crate::block::{Block, Generation, NodeMetadata};
use crate::node::{ContentId, Node};
use crate::pos::{BLOCK_VOLUME, BlockPos};
use crate::snapshot::NodeBuffer;

/// Magic bytes identifying a block blob.
const MAGIC: [u8; 4] = *b"TVBK";

/// Current format version.
const FORMAT_VERSION: u8 = 1;

const FLAG_LZ4: u8 = 0x01;

const STATE_UNDERGROUND: u8 = 0x01;
const STATE_LIGHTING_EXPIRED: u8 = 0x02;

const HEADER_LEN: usize = 6;

/// Upper bound on a payload in either direction; guards against corrupt size prefixes.
pub const MAX_PAYLOAD_LEN: usize = 4 * 1024 * 1024;

/// Upper bound on the encoded metadata of a single node.
pub const MAX_NODE_METADATA_LEN: usize = 64 * 1024;

/// Controls when block payloads are compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionConfig {
    /// Whether compression is used at all.
    pub enabled: bool,
    /// Minimum payload size in bytes before compression is applied.
    pub threshold: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 256,
        }
    }
}

/// Errors that can occur while decoding a block blob.
#[derive(Debug, thiserror::Error)]
pub enum BlockSerError {
    /// The data does not start with the expected magic bytes.
    #[error("invalid magic bytes")]
    InvalidMagic,
    /// The format version is not supported by this build.
    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u8),
    /// The header carries flag bits this build does not understand.
    #[error("unknown header flags: {0:#04x}")]
    UnknownFlags(u8),
    /// The data is shorter than its fields require.
    #[error("data truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    /// LZ4 decompression failed.
    #[error("LZ4 decompression failed: {0}")]
    DecompressFailed(String),
    /// The generation byte is not a known state.
    #[error("invalid generation state: {0}")]
    InvalidGeneration(u8),
    /// A metadata string is not valid UTF-8.
    #[error("metadata string is not valid UTF-8")]
    InvalidUtf8,
    /// A metadata entry points outside the block.
    #[error("metadata index {0} out of range")]
    InvalidMetadataIndex(u16),
    /// Bytes remain after the last field.
    #[error("{0} trailing bytes after block payload")]
    TrailingBytes(usize),
    /// A field is too long for its length prefix or size limit.
    #[error("{field} of {len} bytes exceeds the limit of {max}")]
    TooLarge {
        field: &'static str,
        len: usize,
        max: usize,
    },
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Serializes a block to a blob.
///
/// Fails instead of writing a blob that [`deserialize_block`] would reject.
pub fn serialize_block(
    block: &Block,
    compression: &CompressionConfig,
) -> Result<Vec<u8>, BlockSerError> {
    let payload = encode_payload(block)?;

    let (flags, body) = if compression.enabled && payload.len() >= compression.threshold {
        (FLAG_LZ4, compress_prepend_size(&payload))
    } else {
        (0, payload)
    };

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&MAGIC);
    out.push(FORMAT_VERSION);
    out.push(flags);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Checks that one node's metadata fits the blob format.
pub fn check_node_metadata(meta: &NodeMetadata) -> Result<(), BlockSerError> {
    len_u16("metadata pair count", meta.len())?;
    let mut total = 2;
    for (key, value) in meta {
        len_u16("metadata key", key.len())?;
        len_u32("metadata value", value.len())?;
        total += 2 + key.len() + 4 + value.len();
    }
    if total > MAX_NODE_METADATA_LEN {
        return Err(too_large("node metadata", total, MAX_NODE_METADATA_LEN));
    }
    Ok(())
}

fn len_u16(field: &'static str, len: usize) -> Result<u16, BlockSerError> {
    u16::try_from(len).map_err(|_| too_large(field, len, u16::MAX as usize))
}

fn len_u32(field: &'static str, len: usize) -> Result<u32, BlockSerError> {
    u32::try_from(len).map_err(|_| too_large(field, len, u32::MAX as usize))
}

fn too_large(field: &'static str, len: usize, max: usize) -> BlockSerError {
    BlockSerError::TooLarge { field, len, max }
}

fn encode_payload(block: &Block) -> Result<Vec<u8>, BlockSerError> {
    let nodes = block.nodes();
    let mut buf = Vec::with_capacity(2 + BLOCK_VOLUME * 4 + 2);

    buf.push(block.generation().to_byte());
    let mut state = 0;
    if block.is_underground() {
        state |= STATE_UNDERGROUND;
    }
    if block.lighting_expired() {
        state |= STATE_LIGHTING_EXPIRED;
    }
    buf.push(state);

    for n in nodes {
        buf.extend_from_slice(&n.content.0.to_le_bytes());
    }
    buf.extend(nodes.iter().map(|n| n.param1));
    buf.extend(nodes.iter().map(|n| n.param2));

    let entries: Vec<(u16, &NodeMetadata)> = block.metadata_entries().collect();
    buf.extend_from_slice(&len_u16("metadata entry count", entries.len())?.to_le_bytes());
    for (index, meta) in entries {
        buf.extend_from_slice(&index.to_le_bytes());
        buf.extend_from_slice(&len_u16("metadata pair count", meta.len())?.to_le_bytes());
        for (key, value) in meta {
            buf.extend_from_slice(&len_u16("metadata key", key.len())?.to_le_bytes());
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(&len_u32("metadata value", value.len())?.to_le_bytes());
            buf.extend_from_slice(value.as_bytes());
        }
        if buf.len() > MAX_PAYLOAD_LEN {
            break;
        }
    }
    if buf.len() > MAX_PAYLOAD_LEN {
        return Err(too_large("block payload", buf.len(), MAX_PAYLOAD_LEN));
    }
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Deserializes a blob into a block at `pos`.
///
/// The returned block is clean: its modification state matches the stored copy.
pub fn deserialize_block(pos: BlockPos, data: &[u8]) -> Result<Block, BlockSerError> {
    if data.len() < 4 || data[0..4] != MAGIC {
        return Err(BlockSerError::InvalidMagic);
    }
    if data.len() < HEADER_LEN {
        return Err(BlockSerError::Truncated {
            expected: HEADER_LEN,
            actual: data.len(),
        });
    }
    let version = data[4];
    if version != FORMAT_VERSION {
        return Err(BlockSerError::UnsupportedVersion(version));
    }
    let flags = data[5];
    if flags & !FLAG_LZ4 != 0 {
        return Err(BlockSerError::UnknownFlags(flags));
    }

    let body = &data[HEADER_LEN..];
    let decompressed;
    let payload = if flags & FLAG_LZ4 != 0 {
        if body.len() >= 4 {
            let size = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
            if size > MAX_PAYLOAD_LEN {
                return Err(BlockSerError::DecompressFailed(format!(
                    "declared size {size} exceeds limit"
                )));
            }
        }
        decompressed = decompress_size_prepended(body)
            .map_err(|e| BlockSerError::DecompressFailed(e.to_string()))?;
        &decompressed[..]
    } else {
        body
    };

    decode_payload(pos, payload)
}

fn decode_payload(pos: BlockPos, payload: &[u8]) -> Result<Block, BlockSerError> {
    let mut r = ByteReader::new(payload);

    let gen_byte = r.u8()?;
    let generation =
        Generation::from_byte(gen_byte).ok_or(BlockSerError::InvalidGeneration(gen_byte))?;
    let state = r.u8()?;

    let ids = r.bytes(BLOCK_VOLUME * 2)?;
    let param1 = r.bytes(BLOCK_VOLUME)?;
    let param2 = r.bytes(BLOCK_VOLUME)?;
    let nodes: Vec<Node> = (0..BLOCK_VOLUME)
        .map(|i| {
            let id = u16::from_le_bytes([ids[i * 2], ids[i * 2 + 1]]);
            Node::with_params(ContentId(id), param1[i], param2[i])
        })
        .collect();

    let buffer = NodeBuffer::from_vec(nodes).ok_or(BlockSerError::Truncated {
        expected: BLOCK_VOLUME,
        actual: 0,
    })?;
    let mut block = Block::with_buffer(pos, buffer);
    block.set_generation(generation);
    block.set_underground(state & STATE_UNDERGROUND != 0);
    block.set_lighting_expired(state & STATE_LIGHTING_EXPIRED != 0);

    let count = r.u16()?;
    for _ in 0..count {
        let index = r.u16()?;
        if index as usize >= BLOCK_VOLUME {
            return Err(BlockSerError::InvalidMetadataIndex(index));
        }
        let pairs = r.u16()?;
        let mut meta = NodeMetadata::new();
        for _ in 0..pairs {
            let key_len = r.u16()? as usize;
            let key = r.string(key_len)?;
            let value_len = r.u32()? as usize;
            let value = r.string(value_len)?;
            meta.insert(key, value);
        }
        block.insert_metadata_raw(index, meta);
    }

    if r.remaining() != 0 {
        return Err(BlockSerError::TrailingBytes(r.remaining()));
    }
    Ok(block)
}

/// Bounds-checked little-endian reader over a byte slice.
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], BlockSerError> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(BlockSerError::Truncated {
                expected: end,
                actual: self.data.len(),
            });
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, BlockSerError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, BlockSerError> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, BlockSerError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self, n: usize) -> Result<String, BlockSerError> {
        let b = self.bytes(n)?;
        String::from_utf8(b.to_vec()).map_err(|_| BlockSerError::InvalidUtf8)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
