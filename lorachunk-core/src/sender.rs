//! Outbound transfer: bulk pass, then NACK-driven retransmission rounds.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::chunk::{Chunk, ChunkStore};
use crate::config::ProtocolConfig;
use crate::core::OutboundAction;
use crate::protocol::{Body, Frame, HexId, Route};

/// Where an outbound transfer stands.
///
/// `round` counts NACK waits, timeouts and retransmissions together; it never
/// exceeds `max_retry_rounds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    /// Bulk pass handed to the host; waiting starts on the next tick.
    BulkSending,
    AwaitingNack { round: u32 },
    /// Retransmission for the NACK received in `round` handed to the host.
    Retransmitting { round: u32 },
    /// Receiver reported nothing missing.
    Complete { rounds: u32 },
    /// Out of rounds.
    Failed { rounds: u32 },
}

impl SenderState {
    pub fn is_finished(&self) -> bool {
        matches!(self, SenderState::Complete { .. } | SenderState::Failed { .. })
    }
}

pub struct Sender {
    route: Route,
    store: ChunkStore,
    inter_chunk_delay: Duration,
    nack_timeout: Duration,
    max_rounds: u32,
    state: SenderState,
    deadline: Option<Instant>,
    started: bool,
}

impl Sender {
    pub fn new(route: Route, store: ChunkStore, config: &ProtocolConfig) -> Self {
        Self {
            route,
            store,
            inter_chunk_delay: config.inter_chunk_delay,
            nack_timeout: config.nack_timeout,
            max_rounds: config.max_retry_rounds,
            state: SenderState::BulkSending,
            deadline: None,
            started: false,
        }
    }

    pub fn file_id(&self) -> u16 {
        self.store.file_id()
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    /// Bulk pass: every chunk, paced, then END. Only the first call emits.
    pub fn start(&mut self) -> Vec<OutboundAction> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        info!(
            file_id = %HexId(self.file_id()),
            dest = self.route.dest_addr,
            chunks = self.store.total_chunks(),
            bytes = self.store.file_size(),
            "starting transfer"
        );
        let mut out = Vec::with_capacity(usize::from(self.store.total_chunks()) * 2 + 1);
        for chunk in self.store.iter() {
            self.push_data(&mut out, chunk);
        }
        out.push(OutboundAction::Send(self.end_frame()));
        out
    }

    /// Handle a NACK from the receiver.
    pub fn on_nack(&mut self, file_id: u16, missing: &[u16]) -> Vec<OutboundAction> {
        if file_id != self.file_id() {
            debug!(file_id = %HexId(file_id), "NACK for another transfer, ignoring");
            return Vec::new();
        }
        let round = match self.state {
            SenderState::BulkSending => 1,
            SenderState::AwaitingNack { round } => round,
            SenderState::Retransmitting { round } => round + 1,
            SenderState::Complete { .. } | SenderState::Failed { .. } => return Vec::new(),
        };

        if missing.is_empty() {
            info!(file_id = %HexId(file_id), rounds = round, "transfer complete");
            self.state = SenderState::Complete { rounds: round };
            self.deadline = None;
            return Vec::new();
        }

        info!(
            file_id = %HexId(file_id),
            round,
            count = missing.len(),
            missing = ?missing,
            "retransmitting"
        );
        let mut out = vec![OutboundAction::Send(self.frame(Body::Ack))];
        for &seq in missing {
            match self.store.get(seq) {
                Some(chunk) => self.push_data(&mut out, chunk),
                None => warn!(file_id = %HexId(file_id), seq, "NACK names unknown chunk, skipping"),
            }
        }
        out.push(OutboundAction::Send(self.end_frame()));
        self.deadline = None;

        if round >= self.max_rounds {
            warn!(file_id = %HexId(file_id), rounds = round, "retry rounds exhausted");
            self.state = SenderState::Failed { rounds: round };
        } else {
            self.state = SenderState::Retransmitting { round };
        }
        out
    }

    /// Arm or check the NACK deadline.
    pub fn tick(&mut self, now: Instant) -> Vec<OutboundAction> {
        match self.state {
            SenderState::BulkSending if self.started => {
                self.await_round(1, now);
                Vec::new()
            }
            SenderState::Retransmitting { round } => {
                self.await_round(round + 1, now);
                Vec::new()
            }
            SenderState::AwaitingNack { round } => {
                let Some(deadline) = self.deadline else {
                    self.deadline = Some(now + self.nack_timeout);
                    return Vec::new();
                };
                if now < deadline {
                    return Vec::new();
                }
                if round >= self.max_rounds {
                    warn!(file_id = %HexId(self.file_id()), rounds = round, "no NACK, giving up");
                    self.state = SenderState::Failed { rounds: round };
                    self.deadline = None;
                    return Vec::new();
                }
                warn!(file_id = %HexId(self.file_id()), round, "no NACK, resending END");
                self.state = SenderState::AwaitingNack { round: round + 1 };
                self.deadline = Some(now + self.nack_timeout);
                vec![OutboundAction::Send(self.end_frame())]
            }
            _ => Vec::new(),
        }
    }

    fn await_round(&mut self, round: u32, now: Instant) {
        debug!(file_id = %HexId(self.file_id()), round, "awaiting NACK");
        self.state = SenderState::AwaitingNack { round };
        self.deadline = Some(now + self.nack_timeout);
    }

    fn push_data(&self, out: &mut Vec<OutboundAction>, chunk: &Chunk) {
        out.push(OutboundAction::Send(self.frame(Body::Data {
            seq: chunk.seq,
            checksum: chunk.checksum,
            data: chunk.data.clone(),
        })));
        out.push(OutboundAction::Pause(self.inter_chunk_delay));
    }

    fn end_frame(&self) -> Frame {
        self.frame(Body::End {
            total_chunks: self.store.total_chunks(),
            file_size: self.store.file_size(),
        })
    }

    fn frame(&self, body: Body) -> Frame {
        Frame {
            route: self.route,
            file_id: self.file_id(),
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FrameType;

    fn route() -> Route {
        Route {
            dest_addr: 1,
            dest_freq_offset: 23,
            src_addr: 0,
            src_freq_offset: 23,
        }
    }

    fn sender(len: usize) -> Sender {
        let bytes: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let store = ChunkStore::split_with_id(0x0ABC, &bytes, 200).unwrap();
        Sender::new(route(), store, &ProtocolConfig::default())
    }

    fn sent_types(actions: &[OutboundAction]) -> Vec<FrameType> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Send(f) => Some(f.frame_type()),
                _ => None,
            })
            .collect()
    }

    fn data_seqs(actions: &[OutboundAction]) -> Vec<u16> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Send(Frame {
                    body: Body::Data { seq, .. },
                    ..
                }) => Some(*seq),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn bulk_pass_is_paced_and_ends_with_end() {
        let mut s = sender(853);
        let actions = s.start();
        assert_eq!(actions.len(), 5 * 2 + 1);
        assert_eq!(data_seqs(&actions), vec![0, 1, 2, 3, 4]);
        for pair in actions[..10].chunks(2) {
            assert!(matches!(pair[1], OutboundAction::Pause(d) if d == Duration::from_millis(50)));
        }
        match actions.last() {
            Some(OutboundAction::Send(Frame {
                body: Body::End {
                    total_chunks,
                    file_size,
                },
                ..
            })) => {
                assert_eq!(*total_chunks, 5);
                assert_eq!(*file_size, 853);
            }
            other => panic!("expected END, got {other:?}"),
        }
        assert_eq!(s.state(), SenderState::BulkSending);
        assert!(s.start().is_empty());
    }

    #[test]
    fn deadline_armed_on_first_tick() {
        let mut s = sender(100);
        let _ = s.start();
        let t0 = Instant::now();
        assert!(s.tick(t0).is_empty());
        assert_eq!(s.state(), SenderState::AwaitingNack { round: 1 });
        assert!(s.tick(t0 + Duration::from_secs(9)).is_empty());
        let resend = s.tick(t0 + Duration::from_secs(10));
        assert_eq!(sent_types(&resend), vec![FrameType::End]);
        assert_eq!(s.state(), SenderState::AwaitingNack { round: 2 });
    }

    #[test]
    fn empty_nack_completes() {
        let mut s = sender(100);
        let _ = s.start();
        let t0 = Instant::now();
        s.tick(t0);
        assert!(s.on_nack(0x0ABC, &[]).is_empty());
        assert_eq!(s.state(), SenderState::Complete { rounds: 1 });
        assert!(s.state().is_finished());
        assert!(s.tick(t0 + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn nack_triggers_ack_then_retransmission() {
        let mut s = sender(853);
        let _ = s.start();
        let t0 = Instant::now();
        s.tick(t0);
        let actions = s.on_nack(0x0ABC, &[2, 4]);
        assert_eq!(
            sent_types(&actions),
            vec![FrameType::Ack, FrameType::Data, FrameType::Data, FrameType::End]
        );
        assert_eq!(data_seqs(&actions), vec![2, 4]);
        assert_eq!(s.state(), SenderState::Retransmitting { round: 1 });
        s.tick(t0);
        assert_eq!(s.state(), SenderState::AwaitingNack { round: 2 });
    }

    #[test]
    fn unknown_seqs_skipped() {
        let mut s = sender(300);
        let _ = s.start();
        s.tick(Instant::now());
        let actions = s.on_nack(0x0ABC, &[1, 40]);
        assert_eq!(data_seqs(&actions), vec![1]);
    }

    #[test]
    fn nack_for_other_file_ignored() {
        let mut s = sender(100);
        let _ = s.start();
        s.tick(Instant::now());
        assert!(s.on_nack(0x0DEF, &[0]).is_empty());
        assert_eq!(s.state(), SenderState::AwaitingNack { round: 1 });
    }

    #[test]
    fn fails_after_timeouts_exhaust_rounds() {
        let mut s = sender(100);
        let _ = s.start();
        let mut now = Instant::now();
        s.tick(now);
        for round in 1..=2 {
            now += Duration::from_secs(10);
            assert_eq!(sent_types(&s.tick(now)), vec![FrameType::End]);
            assert_eq!(s.state(), SenderState::AwaitingNack { round: round + 1 });
        }
        now += Duration::from_secs(10);
        assert!(s.tick(now).is_empty());
        assert_eq!(s.state(), SenderState::Failed { rounds: 3 });
    }

    #[test]
    fn nack_in_final_round_retransmits_then_fails() {
        let mut s = sender(853);
        let _ = s.start();
        let mut now = Instant::now();
        s.tick(now);
        now += Duration::from_secs(10);
        s.tick(now);
        now += Duration::from_secs(10);
        s.tick(now);
        assert_eq!(s.state(), SenderState::AwaitingNack { round: 3 });
        let actions = s.on_nack(0x0ABC, &[3]);
        assert_eq!(data_seqs(&actions), vec![3]);
        assert_eq!(s.state(), SenderState::Failed { rounds: 3 });
    }
}
