//! Host-driven API: NodeCore receives bytes and clock ticks from the host, returns actions.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::chunk::{ChunkError, ChunkStore};
use crate::config::{ConfigError, ProtocolConfig};
use crate::protocol::{Body, Frame, HexId};
use crate::radio::{RadioConfig, RadioError, Station};
use crate::receiver::Receiver;
use crate::resync::{ResyncStats, Resynchronizer};
use crate::sender::{Sender, SenderState};
use crate::wire::Codec;

/// Action for the host to perform, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Encode with [`NodeCore::codec`] and write to the radio.
    Send(Frame),
    /// Sleep before the next action (radio duty cycle).
    Pause(Duration),
    /// Write a completed file.
    Save {
        file_id: u16,
        name: String,
        bytes: Vec<u8>,
    },
}

/// One radio node: a receiver for inbound transfers plus at most one outbound
/// transfer.
pub struct NodeCore {
    station: Station,
    config: ProtocolConfig,
    codec: Codec,
    resync: Resynchronizer,
    receiver: Receiver,
    sender: Option<Sender>,
}

impl NodeCore {
    pub fn new(radio: RadioConfig, config: ProtocolConfig) -> Result<Self, CoreError> {
        let station = radio.station()?;
        config.validate()?;
        let codec = config.codec()?;
        Ok(Self {
            station,
            receiver: Receiver::new(station, &config),
            resync: Resynchronizer::new(codec),
            codec,
            config,
            sender: None,
        })
    }

    pub fn station(&self) -> Station {
        self.station
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Split `bytes` and start sending to `dest`. Returns the file id and the
    /// bulk pass.
    pub fn start_transfer(
        &mut self,
        dest: u16,
        bytes: &[u8],
    ) -> Result<(u16, Vec<OutboundAction>), TransferError> {
        self.ensure_idle()?;
        let store = ChunkStore::split(bytes, self.config.chunk_size)?;
        self.start_transfer_with(dest, store)
    }

    /// Start sending an already split file.
    pub fn start_transfer_with(
        &mut self,
        dest: u16,
        store: ChunkStore,
    ) -> Result<(u16, Vec<OutboundAction>), TransferError> {
        self.ensure_idle()?;
        // The first chunk is the longest.
        if let Some(first) = store.get(0) {
            if first.data.len() > self.codec.chunk_size() {
                return Err(ChunkError::ChunkSize(first.data.len()).into());
            }
        }
        let file_id = store.file_id();
        let mut sender = Sender::new(self.station.route_to(dest), store, &self.config);
        let actions = sender.start();
        self.sender = Some(sender);
        Ok((file_id, actions))
    }

    fn ensure_idle(&self) -> Result<(), TransferError> {
        match &self.sender {
            Some(s) if !s.state().is_finished() => Err(TransferError::Busy(s.file_id())),
            _ => Ok(()),
        }
    }

    /// Feed bytes read from the radio.
    pub fn on_bytes_received(&mut self, bytes: &[u8], now: Instant) -> Vec<OutboundAction> {
        self.resync.extend(bytes);
        let mut out = Vec::new();
        while let Some(frame) = self.resync.next_frame() {
            out.extend(self.on_frame(frame, now));
        }
        out
    }

    /// Dispatch one decoded frame.
    pub fn on_frame(&mut self, frame: Frame, now: Instant) -> Vec<OutboundAction> {
        if !self.station.accepts(frame.route.dest_addr) {
            trace!(
                dest = frame.route.dest_addr,
                file_id = %HexId(frame.file_id),
                "frame for another node"
            );
            return Vec::new();
        }
        match frame.body {
            Body::Nack { missing } => match self.sender.as_mut() {
                Some(sender) => sender.on_nack(frame.file_id, &missing),
                None => {
                    debug!(file_id = %HexId(frame.file_id), "NACK with no outbound transfer");
                    Vec::new()
                }
            },
            body => self.receiver.on_frame(Frame { body, ..frame }, now),
        }
    }

    /// Advance timers.
    pub fn tick(&mut self, now: Instant) -> Vec<OutboundAction> {
        let mut out = self.receiver.tick(now);
        if let Some(sender) = self.sender.as_mut() {
            out.extend(sender.tick(now));
        }
        out
    }

    /// State of the current or last outbound transfer.
    pub fn sender_state(&self) -> Option<SenderState> {
        self.sender.as_ref().map(Sender::state)
    }

    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    pub fn resync_stats(&self) -> ResyncStats {
        self.resync.stats()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("radio: {0}")]
    Radio(#[from] RadioError),
    #[error("protocol config: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("transfer 0x{0:04X} still in progress")]
    Busy(u16),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
}
