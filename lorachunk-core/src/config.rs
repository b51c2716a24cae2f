//! Protocol timing and limits shared by the sender and receiver.

use std::time::Duration;

use crate::wire::{Codec, FrameEncodeError, DEFAULT_CHUNK_SIZE};

pub const DEFAULT_INTER_CHUNK_DELAY: Duration = Duration::from_millis(50);
pub const DEFAULT_NACK_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RETRY_ROUNDS: u32 = 3;
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_NACK_ACK_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_NACK_RETRIES: u32 = 3;
pub const DEFAULT_TRANSFER_TTL: Duration = Duration::from_secs(60);

/// Timing and limits. Both ends of a link must agree on `chunk_size`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// File bytes per DATA frame.
    pub chunk_size: usize,
    /// Pause after each DATA frame (radio duty cycle).
    pub inter_chunk_delay: Duration,
    /// Sender wait for a NACK after END.
    pub nack_timeout: Duration,
    /// Sender NACK waits before giving up, timeouts and retransmissions together.
    pub max_retry_rounds: u32,
    /// Receiver silence after which END is inferred.
    pub recv_timeout: Duration,
    /// Receiver wait for an ACK after sending a NACK.
    pub nack_ack_timeout: Duration,
    /// NACK sends per round before the receiver stalls.
    pub max_nack_retries: u32,
    /// Idle time after which a transfer is abandoned; also how long a saved
    /// file id is remembered.
    pub transfer_ttl: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            inter_chunk_delay: DEFAULT_INTER_CHUNK_DELAY,
            nack_timeout: DEFAULT_NACK_TIMEOUT,
            max_retry_rounds: DEFAULT_MAX_RETRY_ROUNDS,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            nack_ack_timeout: DEFAULT_NACK_ACK_TIMEOUT,
            max_nack_retries: DEFAULT_MAX_NACK_RETRIES,
            transfer_ttl: DEFAULT_TRANSFER_TTL,
        }
    }
}

impl ProtocolConfig {
    /// Reject values the state machines cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Codec::new(self.chunk_size)?;
        if self.max_retry_rounds == 0 {
            return Err(ConfigError::Zero("max_retry_rounds"));
        }
        if self.max_nack_retries == 0 {
            return Err(ConfigError::Zero("max_nack_retries"));
        }
        for (name, d) in [
            ("nack_timeout", self.nack_timeout),
            ("recv_timeout", self.recv_timeout),
            ("nack_ack_timeout", self.nack_ack_timeout),
            ("transfer_ttl", self.transfer_ttl),
        ] {
            if d.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.transfer_ttl <= self.recv_timeout {
            return Err(ConfigError::TtlTooShort {
                ttl: self.transfer_ttl,
                recv_timeout: self.recv_timeout,
            });
        }
        Ok(())
    }

    /// Codec for the configured chunk size.
    pub fn codec(&self) -> Result<Codec, ConfigError> {
        Ok(Codec::new(self.chunk_size)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    ChunkSize(#[from] FrameEncodeError),
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    #[error("transfer_ttl {ttl:?} must exceed recv_timeout {recv_timeout:?}")]
    TtlTooShort {
        ttl: Duration,
        recv_timeout: Duration,
    },
}
