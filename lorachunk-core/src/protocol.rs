//! lorachunk wire protocol: frame types, header layout, and the typed frame record.

use std::fmt;

/// Marks the first byte of every frame on the wire.
pub const SYNC_BYTE: u8 = 0x7E;

/// sync + route (6) + type + file_id (2) + seq_or_count (2).
pub const HEADER_LEN: usize = 12;

/// Offset of the type byte inside the header.
pub const TYPE_OFFSET: usize = 7;

/// Offset of the big-endian `seq_or_count` field.
pub const SEQ_OFFSET: usize = 10;

/// Largest frame the radio accepts in one transmission (module buffer size).
pub const MAX_FRAME_LEN: usize = 240;

/// Destination address every node accepts.
pub const BROADCAST_ADDR: u16 = 0xFFFF;

/// Frame kind, carried in the type byte at [`TYPE_OFFSET`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// One chunk of file data plus its checksum.
    Data = 0x01,
    /// Sender finished a pass; carries the chunk total and file size.
    End = 0xFF,
    /// Sender acknowledges a NACK list.
    Ack = 0xAA,
    /// Receiver lists missing sequence numbers (empty list = complete).
    Nack = 0xDD,
}

impl TryFrom<u8> for FrameType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Data),
            0xFF => Ok(FrameType::End),
            0xAA => Ok(FrameType::Ack),
            0xDD => Ok(FrameType::Nack),
            other => Err(other),
        }
    }
}

impl From<FrameType> for u8 {
    fn from(t: FrameType) -> u8 {
        t as u8
    }
}

/// Addressing bytes that follow the sync marker.
///
/// Frequency offsets are the sending node's configured channel and never
/// vary per packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Route {
    pub dest_addr: u16,
    pub dest_freq_offset: u8,
    pub src_addr: u16,
    pub src_freq_offset: u8,
}

/// Type-specific part of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Data {
        seq: u16,
        checksum: u8,
        data: Vec<u8>,
    },
    End {
        total_chunks: u16,
        file_size: u32,
    },
    Ack,
    Nack {
        missing: Vec<u16>,
    },
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub route: Route,
    pub file_id: u16,
    pub body: Body,
}

impl Frame {
    pub fn frame_type(&self) -> FrameType {
        match self.body {
            Body::Data { .. } => FrameType::Data,
            Body::End { .. } => FrameType::End,
            Body::Ack => FrameType::Ack,
            Body::Nack { .. } => FrameType::Nack,
        }
    }

    /// Value of the header's `seq_or_count` field for this frame.
    /// NACK lists longer than `u16::MAX` saturate; the codec rejects them anyway.
    pub fn seq_or_count(&self) -> u16 {
        match &self.body {
            Body::Data { seq, .. } => *seq,
            Body::End { total_chunks, .. } => *total_chunks,
            Body::Ack => 0,
            Body::Nack { missing } => u16::try_from(missing.len()).unwrap_or(u16::MAX),
        }
    }
}

/// Displays a file id as `0x1A2B` in logs.
#[derive(Debug, Clone, Copy)]
pub struct HexId(pub u16);

impl fmt::Display for HexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}
