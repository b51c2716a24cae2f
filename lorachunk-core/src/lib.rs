//! lorachunk: chunked file transfer over LoRa UART modules.
//! Host-driven: no I/O; host passes bytes and clock ticks, receives actions.

pub mod chunk;
pub mod config;
pub mod core;
pub mod integrity;
pub mod protocol;
pub mod radio;
pub mod receiver;
pub mod resync;
pub mod sender;
pub mod wire;

pub use chunk::{Chunk, ChunkError, ChunkStore};
pub use config::{ConfigError, ProtocolConfig};
pub use crate::core::{CoreError, NodeCore, OutboundAction, TransferError};
pub use protocol::{Body, Frame, FrameType, HexId, Route, BROADCAST_ADDR};
pub use radio::{RadioConfig, RadioError, Station};
pub use receiver::{output_name, Receiver, TransferPhase, TransferStatus};
pub use resync::{ResyncStats, Resynchronizer};
pub use sender::{Sender, SenderState};
pub use wire::{Codec, FrameDecodeError, FrameEncodeError, LengthError};
