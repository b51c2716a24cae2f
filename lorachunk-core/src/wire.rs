//! Framing: fixed 12-byte big-endian header + type-specific payload.
//!
//! Frame length is a function of the type byte alone (plus the NACK count),
//! which is what lets the resynchronizer find frame boundaries in a raw
//! serial stream.

use crate::protocol::{
    Body, Frame, FrameType, Route, HEADER_LEN, MAX_FRAME_LEN, SEQ_OFFSET, SYNC_BYTE, TYPE_OFFSET,
};

/// Default bytes of file data per DATA frame.
pub const DEFAULT_CHUNK_SIZE: usize = 200;

/// Header plus the checksum byte.
pub const DATA_OVERHEAD: usize = HEADER_LEN + 1;

/// Header plus the 4-byte file size.
///
/// This extends the payload-less 12-byte END of the plain protocol on purpose:
/// the receiver needs the size to strip the last chunk's zero padding. A
/// 12-byte END from a plain peer is not understood and will be resynchronized
/// over together with the first 4 bytes of whatever follows it.
pub const END_LEN: usize = HEADER_LEN + 4;

pub const ACK_LEN: usize = HEADER_LEN;

/// Header plus the 2-byte count that opens the payload.
pub const NACK_FIXED_LEN: usize = HEADER_LEN + 2;

/// Largest chunk that still fits one radio frame.
pub const MAX_CHUNK_SIZE: usize = MAX_FRAME_LEN - DATA_OVERHEAD;

/// Most sequence numbers a single NACK frame can carry.
pub const MAX_NACK_SEQS: usize = (MAX_FRAME_LEN - NACK_FIXED_LEN) / 2;

/// Build a frame from raw fields. No validation beyond what the layout needs;
/// the caller keeps `payload` within the frame budget.
pub fn encode_raw(
    frame_type: FrameType,
    file_id: u16,
    seq_or_count: u16,
    route: &Route,
    payload: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(SYNC_BYTE);
    out.extend_from_slice(&route.dest_addr.to_be_bytes());
    out.push(route.dest_freq_offset);
    out.extend_from_slice(&route.src_addr.to_be_bytes());
    out.push(route.src_freq_offset);
    out.push(frame_type.into());
    out.extend_from_slice(&file_id.to_be_bytes());
    out.extend_from_slice(&seq_or_count.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Frame codec for one configured chunk size. Both ends must agree on it,
/// since it fixes the DATA frame length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    chunk_size: usize,
}

impl Codec {
    pub fn new(chunk_size: usize) -> Result<Self, FrameEncodeError> {
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return Err(FrameEncodeError::ChunkSize(chunk_size));
        }
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Total length of a DATA frame.
    pub fn data_frame_len(&self) -> usize {
        DATA_OVERHEAD + self.chunk_size
    }

    /// Encode a typed frame. Short DATA payloads are zero-padded to the chunk
    /// size; padding leaves the additive checksum unchanged.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
        let payload = match &frame.body {
            Body::Data { checksum, data, .. } => {
                if data.len() > self.chunk_size {
                    return Err(FrameEncodeError::DataTooLong {
                        len: data.len(),
                        max: self.chunk_size,
                    });
                }
                let mut p = Vec::with_capacity(1 + self.chunk_size);
                p.push(*checksum);
                p.extend_from_slice(data);
                p.resize(1 + self.chunk_size, 0);
                p
            }
            Body::End { file_size, .. } => file_size.to_be_bytes().to_vec(),
            Body::Ack => Vec::new(),
            Body::Nack { missing } => {
                if missing.len() > MAX_NACK_SEQS {
                    return Err(FrameEncodeError::NackTooLong(missing.len()));
                }
                let mut p = Vec::with_capacity(2 + missing.len() * 2);
                p.extend_from_slice(&(missing.len() as u16).to_be_bytes());
                for seq in missing {
                    p.extend_from_slice(&seq.to_be_bytes());
                }
                p
            }
        };
        Ok(encode_raw(
            frame.frame_type(),
            frame.file_id,
            frame.seq_or_count(),
            &frame.route,
            &payload,
        ))
    }

    /// Expected total length of a frame of `frame_type` whose first bytes are
    /// `peek`. Only NACK needs to look at `peek` (its count field).
    pub fn decode_length(&self, frame_type: FrameType, peek: &[u8]) -> Result<usize, LengthError> {
        match frame_type {
            FrameType::Data => Ok(self.data_frame_len()),
            FrameType::End => Ok(END_LEN),
            FrameType::Ack => Ok(ACK_LEN),
            FrameType::Nack => {
                if peek.len() < NACK_FIXED_LEN {
                    return Err(LengthError::NeedMore);
                }
                let count = read_u16(peek, HEADER_LEN) as usize;
                if count > MAX_NACK_SEQS {
                    return Err(LengthError::CountTooLarge(count));
                }
                let header_count = read_u16(peek, SEQ_OFFSET) as usize;
                if header_count != count {
                    return Err(LengthError::CountMismatch {
                        header: header_count,
                        payload: count,
                    });
                }
                Ok(NACK_FIXED_LEN + count * 2)
            }
        }
    }

    /// Decode exactly one complete frame.
    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, FrameDecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameDecodeError::Truncated(bytes.len()));
        }
        if bytes[0] != SYNC_BYTE {
            return Err(FrameDecodeError::BadSync(bytes[0]));
        }
        let frame_type =
            FrameType::try_from(bytes[TYPE_OFFSET]).map_err(FrameDecodeError::UnknownType)?;
        let expected = self.decode_length(frame_type, bytes).map_err(|e| match e {
            LengthError::NeedMore => FrameDecodeError::Truncated(bytes.len()),
            other => FrameDecodeError::Length(other),
        })?;
        if bytes.len() != expected {
            return Err(FrameDecodeError::WrongLength {
                expected,
                actual: bytes.len(),
            });
        }

        let route = Route {
            dest_addr: read_u16(bytes, 1),
            dest_freq_offset: bytes[3],
            src_addr: read_u16(bytes, 4),
            src_freq_offset: bytes[6],
        };
        let file_id = read_u16(bytes, 8);
        let seq_or_count = read_u16(bytes, SEQ_OFFSET);
        let payload = &bytes[HEADER_LEN..];

        let body = match frame_type {
            FrameType::Data => Body::Data {
                seq: seq_or_count,
                checksum: payload[0],
                data: payload[1..].to_vec(),
            },
            FrameType::End => Body::End {
                total_chunks: seq_or_count,
                file_size: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
            },
            FrameType::Ack => Body::Ack,
            FrameType::Nack => Body::Nack {
                missing: payload[2..]
                    .chunks_exact(2)
                    .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                    .collect(),
            },
        };
        Ok(Frame {
            route,
            file_id,
            body,
        })
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

/// Error encoding a frame (chunk size or payload limits).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("chunk size {0} outside 1..={max}", max = MAX_CHUNK_SIZE)]
    ChunkSize(usize),
    #[error("chunk data of {len} bytes exceeds chunk size {max}")]
    DataTooLong { len: usize, max: usize },
    #[error("NACK list of {0} entries exceeds {max} per frame", max = MAX_NACK_SEQS)]
    NackTooLong(usize),
}

/// Why a frame length could not be determined from the bytes at hand.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LengthError {
    #[error("need more bytes")]
    NeedMore,
    #[error("NACK count {0} exceeds per-frame maximum")]
    CountTooLarge(usize),
    #[error("NACK count {payload} disagrees with header count {header}")]
    CountMismatch { header: usize, payload: usize },
}

/// Error decoding a complete frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame truncated at {0} bytes")]
    Truncated(usize),
    #[error("bad sync byte 0x{0:02x}")]
    BadSync(u8),
    #[error("unknown frame type 0x{0:02x}")]
    UnknownType(u8),
    #[error("frame is {actual} bytes, expected {expected}")]
    WrongLength { expected: usize, actual: usize },
    #[error(transparent)]
    Length(LengthError),
}
