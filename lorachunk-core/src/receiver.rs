//! Inbound transfers: collect chunks per file id, NACK the gaps, save when whole.
//!
//! Several transfers can be in flight at once; they are multiplexed by file id
//! and owned by one [`Receiver`]. All waits are deadlines checked in
//! [`Receiver::tick`].

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::config::ProtocolConfig;
use crate::core::OutboundAction;
use crate::integrity;
use crate::protocol::{Body, Frame, HexId};
use crate::radio::Station;
use crate::wire::MAX_NACK_SEQS;

/// Output file name for a completed transfer.
pub fn output_name(file_id: u16) -> String {
    format!("received_{file_id:04X}.jpg")
}

/// Public view of a transfer's NACK phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Collecting,
    /// NACK sent `attempts` times, waiting for the sender's ACK.
    AwaitingAck { attempts: u32 },
    /// NACK retries exhausted; waiting for the sender to show up again.
    Stalled,
}

#[derive(Debug)]
enum Phase {
    Collecting,
    AwaitingAck {
        missing: Vec<u16>,
        attempts: u32,
        deadline: Instant,
    },
    Stalled,
}

#[derive(Debug)]
struct Transfer {
    sender_addr: u16,
    chunks: BTreeMap<u16, Vec<u8>>,
    started: Instant,
    last_activity: Instant,
    end_received: bool,
    total_expected: Option<u16>,
    file_size: Option<u32>,
    phase: Phase,
}

impl Transfer {
    fn new(sender_addr: u16, now: Instant) -> Self {
        Self {
            sender_addr,
            chunks: BTreeMap::new(),
            started: now,
            last_activity: now,
            end_received: false,
            total_expected: None,
            file_size: None,
            phase: Phase::Collecting,
        }
    }

    /// Ascending seqs below the expected total that have not arrived.
    fn missing(&self, total: u16) -> Vec<u16> {
        (0..total).filter(|s| !self.chunks.contains_key(s)).collect()
    }

    /// Back to collecting; silence after this re-triggers evaluation.
    fn resume(&mut self) {
        self.end_received = false;
        self.phase = Phase::Collecting;
    }
}

/// Snapshot of one inbound transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferStatus {
    pub sender_addr: u16,
    pub received: Vec<u16>,
    pub total_expected: Option<u16>,
    pub end_received: bool,
    pub phase: TransferPhase,
}

/// What was saved under a file id, so a late duplicate END can be told apart
/// from a new transfer that drew the same random id.
#[derive(Debug, Clone, Copy)]
struct Saved {
    sender_addr: u16,
    total_chunks: u16,
    file_size: Option<u32>,
    at: Instant,
}

impl Saved {
    fn matches_end(&self, src: u16, total_chunks: u16, file_size: u32) -> bool {
        self.sender_addr == src
            && self.total_chunks == total_chunks
            && self.file_size.map_or(true, |size| size == file_size)
    }
}

pub struct Receiver {
    station: Station,
    recv_timeout: Duration,
    nack_ack_timeout: Duration,
    max_nack_retries: u32,
    transfer_ttl: Duration,
    transfers: HashMap<u16, Transfer>,
    /// Saved transfers by file id, kept for `transfer_ttl`.
    completed: HashMap<u16, Saved>,
}

impl Receiver {
    pub fn new(station: Station, config: &ProtocolConfig) -> Self {
        Self {
            station,
            recv_timeout: config.recv_timeout,
            nack_ack_timeout: config.nack_ack_timeout,
            max_nack_retries: config.max_nack_retries,
            transfer_ttl: config.transfer_ttl,
            transfers: HashMap::new(),
            completed: HashMap::new(),
        }
    }

    /// Handle DATA, END or ACK. NACK frames are not for the receiver and are ignored.
    pub fn on_frame(&mut self, frame: Frame, now: Instant) -> Vec<OutboundAction> {
        let file_id = frame.file_id;
        let src = frame.route.src_addr;
        match frame.body {
            Body::Data {
                seq,
                checksum,
                data,
            } => self.on_data(file_id, src, seq, checksum, data, now),
            Body::End {
                total_chunks,
                file_size,
            } => self.on_end(file_id, src, total_chunks, file_size, now),
            Body::Ack => self.on_ack(file_id, now),
            Body::Nack { .. } => Vec::new(),
        }
    }

    fn on_data(
        &mut self,
        file_id: u16,
        src: u16,
        seq: u16,
        checksum: u8,
        data: Vec<u8>,
        now: Instant,
    ) -> Vec<OutboundAction> {
        if !integrity::verify_chunk(&data, checksum) {
            warn!(file_id = %HexId(file_id), seq, "checksum mismatch, dropping chunk");
            return Vec::new();
        }
        if let Some(saved) = self.completed.get(&file_id) {
            if saved.sender_addr == src {
                trace!(file_id = %HexId(file_id), seq, "DATA for saved transfer, ignoring");
                return Vec::new();
            }
            info!(file_id = %HexId(file_id), src, "file id reused by another sender");
            self.completed.remove(&file_id);
        }
        let t = self.transfers.entry(file_id).or_insert_with(|| {
            info!(file_id = %HexId(file_id), src, "new transfer");
            Transfer::new(src, now)
        });
        trace!(file_id = %HexId(file_id), seq, "chunk stored");
        t.chunks.insert(seq, data);
        t.last_activity = now;
        // Retransmissions only follow an ACK, so DATA here means that ACK was lost.
        if !matches!(t.phase, Phase::Collecting) {
            debug!(file_id = %HexId(file_id), seq, "DATA while awaiting ACK, resuming");
            t.resume();
        }
        Vec::new()
    }

    fn on_end(
        &mut self,
        file_id: u16,
        src: u16,
        total_chunks: u16,
        file_size: u32,
        now: Instant,
    ) -> Vec<OutboundAction> {
        if total_chunks == 0 {
            debug!(file_id = %HexId(file_id), src, "END with zero total, ignoring");
            return Vec::new();
        }
        if let Some(saved) = self.completed.get(&file_id) {
            if saved.matches_end(src, total_chunks, file_size) {
                debug!(file_id = %HexId(file_id), "END for saved transfer, repeating completion");
                return vec![self.nack(file_id, src, Vec::new())];
            }
            info!(
                file_id = %HexId(file_id),
                src,
                total_chunks,
                file_size,
                "END differs from saved transfer, treating as new"
            );
            self.completed.remove(&file_id);
        }
        let t = self.transfers.entry(file_id).or_insert_with(|| {
            info!(file_id = %HexId(file_id), src, "END for unseen transfer");
            Transfer::new(src, now)
        });
        debug!(file_id = %HexId(file_id), total_chunks, file_size, "END");
        t.end_received = true;
        t.total_expected = Some(total_chunks);
        t.file_size = Some(file_size);
        t.last_activity = now;
        self.evaluate(file_id, now)
    }

    fn on_ack(&mut self, file_id: u16, now: Instant) -> Vec<OutboundAction> {
        if let Some(t) = self.transfers.get_mut(&file_id) {
            if let Phase::AwaitingAck { .. } = t.phase {
                debug!(file_id = %HexId(file_id), "ACK, collecting retransmissions");
                t.resume();
                t.last_activity = now;
            }
        }
        Vec::new()
    }

    /// Check every transfer's deadlines.
    pub fn tick(&mut self, now: Instant) -> Vec<OutboundAction> {
        let ttl = self.transfer_ttl;
        self.completed
            .retain(|_, saved| now.duration_since(saved.at) <= ttl);

        let mut ids: Vec<u16> = self.transfers.keys().copied().collect();
        ids.sort_unstable();
        let mut out = Vec::new();
        for file_id in ids {
            out.extend(self.tick_transfer(file_id, now));
        }
        out
    }

    fn tick_transfer(&mut self, file_id: u16, now: Instant) -> Vec<OutboundAction> {
        let Some(t) = self.transfers.get_mut(&file_id) else {
            return Vec::new();
        };
        let idle = now.duration_since(t.last_activity);
        if idle > self.transfer_ttl {
            warn!(
                file_id = %HexId(file_id),
                received = t.chunks.len(),
                "transfer idle too long, abandoning"
            );
            self.transfers.remove(&file_id);
            return Vec::new();
        }

        match &mut t.phase {
            Phase::Collecting if !t.end_received && idle >= self.recv_timeout => {
                if t.total_expected.is_none() {
                    let Some(&max_seq) = t.chunks.keys().next_back() else {
                        return Vec::new();
                    };
                    t.total_expected = Some(max_seq.saturating_add(1));
                }
                warn!(
                    file_id = %HexId(file_id),
                    total = ?t.total_expected,
                    "no END, inferring end of transfer"
                );
                t.end_received = true;
                self.evaluate(file_id, now)
            }
            Phase::AwaitingAck {
                missing,
                attempts,
                deadline,
            } if now >= *deadline => {
                if *attempts >= self.max_nack_retries {
                    warn!(file_id = %HexId(file_id), attempts = *attempts, "no ACK, stalling");
                    t.phase = Phase::Stalled;
                    return Vec::new();
                }
                *attempts += 1;
                *deadline = now + self.nack_ack_timeout;
                debug!(file_id = %HexId(file_id), attempts = *attempts, "no ACK, resending NACK");
                let list = missing.clone();
                let src = t.sender_addr;
                vec![self.nack(file_id, src, list)]
            }
            _ => Vec::new(),
        }
    }

    /// Save when complete, otherwise NACK the gaps.
    fn evaluate(&mut self, file_id: u16, now: Instant) -> Vec<OutboundAction> {
        let Some(t) = self.transfers.get_mut(&file_id) else {
            return Vec::new();
        };
        let Some(total) = t.total_expected else {
            return Vec::new();
        };
        let mut missing = t.missing(total);

        if missing.is_empty() {
            let Some(t) = self.transfers.remove(&file_id) else {
                return Vec::new();
            };
            let src = t.sender_addr;
            let bytes = reassemble(&t, total);
            log_throughput(file_id, bytes.len(), now.duration_since(t.started));
            self.completed.insert(
                file_id,
                Saved {
                    sender_addr: src,
                    total_chunks: total,
                    file_size: t.file_size,
                    at: now,
                },
            );
            return vec![
                OutboundAction::Save {
                    file_id,
                    name: output_name(file_id),
                    bytes,
                },
                self.nack(file_id, src, Vec::new()),
            ];
        }

        if missing.len() > MAX_NACK_SEQS {
            warn!(
                file_id = %HexId(file_id),
                missing = missing.len(),
                sent = MAX_NACK_SEQS,
                "NACK list truncated"
            );
            missing.truncate(MAX_NACK_SEQS);
        }
        info!(
            file_id = %HexId(file_id),
            count = missing.len(),
            missing = ?missing,
            "requesting missing chunks"
        );
        let src = t.sender_addr;
        t.phase = Phase::AwaitingAck {
            missing: missing.clone(),
            attempts: 1,
            deadline: now + self.nack_ack_timeout,
        };
        vec![self.nack(file_id, src, missing)]
    }

    fn nack(&self, file_id: u16, dest: u16, missing: Vec<u16>) -> OutboundAction {
        OutboundAction::Send(Frame {
            route: self.station.route_to(dest),
            file_id,
            body: Body::Nack { missing },
        })
    }

    pub fn status(&self, file_id: u16) -> Option<TransferStatus> {
        self.transfers.get(&file_id).map(|t| TransferStatus {
            sender_addr: t.sender_addr,
            received: t.chunks.keys().copied().collect(),
            total_expected: t.total_expected,
            end_received: t.end_received,
            phase: match &t.phase {
                Phase::Collecting => TransferPhase::Collecting,
                Phase::AwaitingAck { attempts, .. } => TransferPhase::AwaitingAck {
                    attempts: *attempts,
                },
                Phase::Stalled => TransferPhase::Stalled,
            },
        })
    }

    /// Stored bytes of one chunk, as received (including any zero padding).
    pub fn chunk(&self, file_id: u16, seq: u16) -> Option<&[u8]> {
        self.transfers
            .get(&file_id)
            .and_then(|t| t.chunks.get(&seq))
            .map(Vec::as_slice)
    }

    pub fn active_transfers(&self) -> usize {
        self.transfers.len()
    }

    /// Whether `file_id` was saved within the last `transfer_ttl`.
    pub fn recently_saved(&self, file_id: u16) -> bool {
        self.completed.contains_key(&file_id)
    }
}

/// Chunks `0..total` in order, trimmed to the announced file size. An inferred
/// END carries no size, so the last chunk keeps its padding.
fn reassemble(t: &Transfer, total: u16) -> Vec<u8> {
    let mut out: Vec<u8> = (0..total)
        .filter_map(|s| t.chunks.get(&s))
        .flat_map(|c| c.iter().copied())
        .collect();
    if let Some(size) = t.file_size {
        out.truncate(size as usize);
    }
    out
}

fn log_throughput(file_id: u16, bytes: usize, elapsed: Duration) {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { bytes as f64 / secs } else { 0.0 };
    info!(
        file_id = %HexId(file_id),
        bytes,
        elapsed = ?elapsed,
        bytes_per_sec = (rate * 10.0).round() / 10.0,
        "transfer saved"
    );
}
