//! Polling loop: move bytes between the transport and NodeCore, perform its actions.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use lorachunk_core::{HexId, NodeCore, OutboundAction, SenderState};
use tracing::{debug, info, warn};

use crate::transport::Transport;

pub struct Node<T> {
    core: NodeCore,
    transport: T,
    output_dir: PathBuf,
    poll_interval: Duration,
}

impl<T: Transport> Node<T> {
    pub fn new(core: NodeCore, transport: T, output_dir: PathBuf, poll_interval: Duration) -> Self {
        Self {
            core,
            transport,
            output_dir,
            poll_interval,
        }
    }

    pub fn core(&self) -> &NodeCore {
        &self.core
    }

    /// One iteration: drain the transport, feed the core, run timers.
    pub fn poll_once(&mut self) -> anyhow::Result<()> {
        let available = self.transport.bytes_available().context("serial status")?;
        if available > 0 {
            let bytes = self.transport.read(available).context("serial read")?;
            let actions = self.core.on_bytes_received(&bytes, Instant::now());
            self.perform(actions)?;
        }
        let actions = self.core.tick(Instant::now());
        self.perform(actions)
    }

    /// Receive until `stop` is set.
    pub fn run(&mut self, stop: &AtomicBool) -> anyhow::Result<()> {
        let station = self.core.station();
        info!(
            address = station.address,
            freq_offset = station.freq_offset,
            output_dir = %self.output_dir.display(),
            "listening"
        );
        while !stop.load(Ordering::SeqCst) {
            self.poll_once()?;
            std::thread::sleep(self.poll_interval);
        }
        Ok(())
    }

    /// Send `bytes` to `dest` and poll until the transfer finishes. Returns
    /// `None` if `stop` was set first.
    pub fn run_transfer(
        &mut self,
        dest: u16,
        bytes: &[u8],
        stop: &AtomicBool,
    ) -> anyhow::Result<Option<SenderState>> {
        let (file_id, actions) = self.core.start_transfer(dest, bytes)?;
        debug!(file_id = %HexId(file_id), "bulk pass queued");
        self.perform(actions)?;
        while !stop.load(Ordering::SeqCst) {
            self.poll_once()?;
            match self.core.sender_state() {
                Some(state) if state.is_finished() => return Ok(Some(state)),
                _ => std::thread::sleep(self.poll_interval),
            }
        }
        Ok(None)
    }

    fn perform(&mut self, actions: Vec<OutboundAction>) -> anyhow::Result<()> {
        for action in actions {
            match action {
                OutboundAction::Send(frame) => {
                    let bytes = self.core.codec().encode(&frame)?;
                    self.transport.write(&bytes).context("serial write")?;
                }
                OutboundAction::Pause(d) => std::thread::sleep(d),
                OutboundAction::Save {
                    file_id,
                    name,
                    bytes,
                } => {
                    // A failed write loses this file, not the receive loop.
                    let path = self.output_dir.join(&name);
                    match std::fs::write(&path, &bytes) {
                        Ok(()) => {
                            info!(file_id = %HexId(file_id), path = %path.display(), bytes = bytes.len(), "saved")
                        }
                        Err(e) => {
                            warn!(file_id = %HexId(file_id), path = %path.display(), error = %e, "could not save file")
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory;
    use lorachunk_core::{ProtocolConfig, RadioConfig};
    use std::sync::Arc;

    fn fast() -> ProtocolConfig {
        ProtocolConfig {
            inter_chunk_delay: Duration::from_millis(1),
            nack_timeout: Duration::from_millis(500),
            recv_timeout: Duration::from_millis(200),
            nack_ack_timeout: Duration::from_millis(100),
            transfer_ttl: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn core(address: u16) -> NodeCore {
        NodeCore::new(
            RadioConfig {
                address,
                freq_mhz: 868,
            },
            fast(),
        )
        .unwrap()
    }

    #[test]
    fn file_crosses_memory_link() {
        let (ta, tb) = memory::pair();
        let dir = tempfile::tempdir().unwrap();
        let poll = Duration::from_millis(2);
        let mut sender = Node::new(core(0), ta, dir.path().join("unused"), poll);
        let mut receiver = Node::new(core(1), tb, dir.path().to_path_buf(), poll);

        let stop = Arc::new(AtomicBool::new(false));
        let rx_stop = stop.clone();
        let rx = std::thread::spawn(move || {
            receiver.run(&rx_stop).unwrap();
            receiver
        });

        let input: Vec<u8> = (0..1234).map(|i| (i % 251) as u8).collect();
        let outcome = sender.run_transfer(1, &input, &AtomicBool::new(false)).unwrap();
        stop.store(true, Ordering::SeqCst);
        let receiver = rx.join().unwrap();

        assert_eq!(outcome, Some(SenderState::Complete { rounds: 1 }));
        assert_eq!(receiver.core().receiver().active_transfers(), 0);
        let saved: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|x| x == "jpg"))
            .collect();
        assert_eq!(saved.len(), 1);
        assert_eq!(std::fs::read(&saved[0]).unwrap(), input);
    }

    #[test]
    fn unwritable_output_dir_does_not_stop_receiver() {
        let (mut radio, tb) = memory::pair();
        let dir = tempfile::tempdir().unwrap();
        let mut receiver = Node::new(
            core(1),
            tb,
            dir.path().join("missing/dir"),
            Duration::from_millis(1),
        );

        let mut sender = core(0);
        let (_, actions) = sender.start_transfer(1, &[5u8; 300]).unwrap();
        for action in actions {
            if let OutboundAction::Send(frame) = action {
                radio.write(&sender.codec().encode(&frame).unwrap()).unwrap();
            }
        }

        receiver.poll_once().unwrap();
        assert_eq!(receiver.core().receiver().active_transfers(), 0);

        let avail = radio.bytes_available().unwrap();
        let reply = radio.read(avail).unwrap();
        assert!(!reply.is_empty());
        sender.on_bytes_received(&reply, Instant::now());
        assert_eq!(sender.sender_state(), Some(SenderState::Complete { rounds: 1 }));
        receiver.poll_once().unwrap();
    }

    #[test]
    fn unanswered_transfer_fails() {
        let (ta, _tb) = memory::pair();
        let dir = tempfile::tempdir().unwrap();
        let mut sender = Node::new(core(0), ta, dir.path().to_path_buf(), Duration::from_millis(5));
        let outcome = sender
            .run_transfer(1, &[1, 2, 3], &AtomicBool::new(false))
            .unwrap();
        assert_eq!(outcome, Some(SenderState::Failed { rounds: 3 }));
    }

    #[test]
    fn stop_flag_interrupts_transfer() {
        let (ta, _tb) = memory::pair();
        let dir = tempfile::tempdir().unwrap();
        let mut sender = Node::new(core(0), ta, dir.path().to_path_buf(), Duration::from_millis(5));
        let outcome = sender
            .run_transfer(1, &[1, 2, 3], &AtomicBool::new(true))
            .unwrap();
        assert_eq!(outcome, None);
    }
}
