//! Command Channel (§4.4): the single entry point for synchronous commands.
//! Retries are *not* performed here (§4.4); bounded retry is the Error &
//! Retry Policy layered on top in [`CommandChannel::send_with_retry`] (§4.9).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::CoreError;
use crate::frame::{encode_reliable, validate_discriminator};
use crate::transport::LineTransport;

/// What the reader delivers into a completed slot.
pub(crate) enum SlotOutcome {
    Response(String),
    /// A checksum-mismatched frame arrived while this was the oldest
    /// in-flight slot (§4.2: a mismatched frame carries no usable `cmd_seq`,
    /// so it can only be correlated by the same "oldest in-flight slot"
    /// rule used for `CMDSEQ`-less responses, per §3's at-most-one-in-flight
    /// invariant).
    ChecksumMismatch { claimed: u8, computed: u8 },
    TransportLost,
    /// Delivered by [`CommandTable::reap_expired`] when a slot's deadline
    /// passes with no response, independent of the caller's own
    /// `recv_timeout` (§3: "resolved by reader or by watchdog timeout").
    WatchdogTimedOut,
}

pub(crate) struct CommandSlot {
    pub seq: u16,
    pub deadline: Instant,
    sink: mpsc::Sender<SlotOutcome>,
}

/// Table of in-flight commands, protected by a mutex distinct from the
/// command mutex (§5) so the reader can complete slots while a caller is
/// preparing the next command. At most one entry is expected at a time
/// (§3), but the table is a deque to implement the documented "oldest
/// in-flight slot" compat-correlation fallback generally.
#[derive(Default)]
pub(crate) struct CommandTable {
    slots: Mutex<VecDeque<CommandSlot>>,
}

impl CommandTable {
    pub fn register(&self, seq: u16, deadline: Instant) -> mpsc::Receiver<SlotOutcome> {
        let (tx, rx) = mpsc::channel();
        self.slots.lock().unwrap().push_back(CommandSlot {
            seq,
            deadline,
            sink: tx,
        });
        rx
    }

    pub fn remove(&self, seq: u16) {
        self.slots.lock().unwrap().retain(|s| s.seq != seq);
    }

    /// Delivers a response with a known `cmd_seq` to the matching slot.
    /// Returns `false` (and the caller should log+discard, per §3) if no
    /// live slot matches.
    pub fn complete_by_seq(&self, cmd_seq: u16, payload: String) -> bool {
        let mut slots = self.slots.lock().unwrap();
        if let Some(pos) = slots.iter().position(|s| s.seq == cmd_seq) {
            let slot = slots.remove(pos).unwrap();
            let _ = slot.sink.send(SlotOutcome::Response(payload));
            true
        } else {
            false
        }
    }

    /// Delivers a response lacking `cmd_seq` to the oldest in-flight slot
    /// (compat path for firmware that omits `CMDSEQ`, §9).
    pub fn complete_oldest(&self, payload: String) -> bool {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.pop_front() {
            let _ = slot.sink.send(SlotOutcome::Response(payload));
            true
        } else {
            false
        }
    }

    /// Delivers a checksum-mismatch record to the oldest in-flight slot, the
    /// same correlation rule `complete_oldest` uses (§4.2, §9). Returns
    /// `false` if no command was waiting, in which case the caller just
    /// bumps a metric (§3: "logged and discarded; never raises an error").
    pub fn complete_checksum_mismatch(&self, claimed: u8, computed: u8) -> bool {
        let mut slots = self.slots.lock().unwrap();
        if let Some(slot) = slots.pop_front() {
            let _ = slot
                .sink
                .send(SlotOutcome::ChecksumMismatch { claimed, computed });
            true
        } else {
            false
        }
    }

    /// Fails every outstanding slot with `TransportLost`, draining the
    /// table. Called once by the reader on terminal I/O failure.
    pub fn fail_all(&self) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.drain(..) {
            let _ = slot.sink.send(SlotOutcome::TransportLost);
        }
    }

    /// Watchdog sweep (§3 "resolved by reader or by watchdog timeout"):
    /// removes and notifies every slot whose deadline has already passed,
    /// independent of whether the registering caller is still waiting on
    /// its own `recv_timeout`. Returns the number of slots reaped. Called
    /// once per reader-loop iteration so no slot can linger past its
    /// deadline even if the thread that registered it never comes back to
    /// remove it.
    pub fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = self.slots.lock().unwrap();
        let mut reaped = 0usize;
        slots.retain(|slot| {
            if slot.deadline <= now {
                let _ = slot.sink.send(SlotOutcome::WatchdogTimedOut);
                reaped += 1;
                false
            } else {
                true
            }
        });
        reaped
    }
}

/// The single entry point for synchronous commands on one transport.
/// Serializes sends with a command mutex (§5); allocates monotone sequence
/// numbers wrapping at 2^16 (§3).
pub struct CommandChannel {
    transport: Arc<Mutex<LineTransport>>,
    table: Arc<CommandTable>,
    send_mutex: Mutex<()>,
    next_seq: AtomicU16,
}

impl CommandChannel {
    pub(crate) fn new(transport: Arc<Mutex<LineTransport>>, table: Arc<CommandTable>) -> Self {
        Self {
            transport,
            table,
            send_mutex: Mutex::new(()),
            next_seq: AtomicU16::new(1),
        }
    }

    fn allocate_seq(&self) -> u16 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates a sequence number for a caller that builds and sends its own
    /// reliable frame directly (the §4.7 pause/resume wrap `test_panel` uses
    /// to bypass the normal reader-mediated response path).
    pub(crate) fn allocate_seq_for_direct_send(&self) -> u16 {
        self.allocate_seq()
    }

    /// Sends `cmd_text` reliably (with the `:SEQ=`/`:CHK=` trailer) and
    /// waits up to `timeout` for a correlated response, optionally
    /// validating it starts with `expected_discriminator`.
    pub fn send(
        &self,
        cmd_text: &str,
        timeout: Duration,
        expected_discriminator: Option<&str>,
    ) -> Result<String, CoreError> {
        let _guard = self.send_mutex.lock().unwrap();

        let seq = self.allocate_seq();
        let deadline = Instant::now() + timeout;
        let rx = self.table.register(seq, deadline);

        {
            let mut transport = self.transport.lock().unwrap();
            transport.discard_input()?;
            let frame = encode_reliable(cmd_text, seq);
            if let Err(e) = transport.write_bytes(format!("{}\n", frame).as_bytes()) {
                self.table.remove(seq);
                return Err(e);
            }
        }

        let outcome = match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                self.table.remove(seq);
                return Err(CoreError::Timeout { seq });
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                self.table.remove(seq);
                return Err(CoreError::Transport(
                    "reader task exited before a response arrived".to_string(),
                ));
            }
        };

        match outcome {
            SlotOutcome::TransportLost => Err(CoreError::Transport(
                "transport lost while waiting for response".to_string(),
            )),
            SlotOutcome::WatchdogTimedOut => Err(CoreError::Timeout { seq }),
            SlotOutcome::ChecksumMismatch { claimed, computed } => {
                Err(CoreError::ChecksumMismatch { claimed, computed })
            }
            SlotOutcome::Response(payload) => {
                if payload.starts_with("ERROR:TEST_IN_PROGRESS") {
                    return Err(CoreError::DeviceBusy);
                }
                match expected_discriminator {
                    Some(d) => validate_discriminator(&payload, d).map(|p| p.to_string()),
                    None => Ok(payload),
                }
            }
        }
    }

    /// Wraps [`send`](Self::send) with the §4.9 bounded-retry policy: a
    /// single read timeout or a single checksum mismatch is retried once
    /// with a fresh sequence number; a second occurrence of either within
    /// the same command surfaces (§7). No command is issued more than
    /// twice consecutively.
    pub fn send_with_retry(
        &self,
        cmd_text: &str,
        timeout: Duration,
        expected_discriminator: Option<&str>,
    ) -> Result<String, CoreError> {
        match self.send(cmd_text, timeout, expected_discriminator) {
            Err(CoreError::Timeout { .. }) | Err(CoreError::ChecksumMismatch { .. }) => {
                self.send(cmd_text, timeout, expected_discriminator)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_by_seq_matches_only_registered_slot() {
        let table = CommandTable::default();
        let rx = table.register(7, Instant::now() + Duration::from_secs(1));
        assert!(!table.complete_by_seq(8, "X".to_string()));
        assert!(table.complete_by_seq(7, "OK:ALL_OFF".to_string()));
        match rx.recv().unwrap() {
            SlotOutcome::Response(s) => assert_eq!(s, "OK:ALL_OFF"),
            _ => panic!("expected a response"),
        }
    }

    #[test]
    fn complete_oldest_is_fifo() {
        let table = CommandTable::default();
        let rx1 = table.register(1, Instant::now() + Duration::from_secs(1));
        let _rx2 = table.register(2, Instant::now() + Duration::from_secs(1));
        assert!(table.complete_oldest("first".to_string()));
        match rx1.recv().unwrap() {
            SlotOutcome::Response(s) => assert_eq!(s, "first"),
            _ => panic!("expected a response"),
        }
    }

    #[test]
    fn unmatched_response_is_reported_as_no_match() {
        let table = CommandTable::default();
        assert!(!table.complete_by_seq(1, "X".to_string()));
        assert!(!table.complete_oldest("X".to_string()));
    }

    #[test]
    fn checksum_mismatch_is_delivered_to_oldest_slot() {
        let table = CommandTable::default();
        let rx = table.register(1, Instant::now() + Duration::from_secs(1));
        assert!(table.complete_checksum_mismatch(0x5A, 0x5B));
        match rx.recv().unwrap() {
            SlotOutcome::ChecksumMismatch { claimed, computed } => {
                assert_eq!(claimed, 0x5A);
                assert_eq!(computed, 0x5B);
            }
            _ => panic!("expected a checksum mismatch outcome"),
        }
    }

    #[test]
    fn checksum_mismatch_with_no_slot_is_reported_as_no_match() {
        let table = CommandTable::default();
        assert!(!table.complete_checksum_mismatch(0x00, 0xFF));
    }

    #[test]
    fn reap_expired_notifies_and_removes_past_deadline_slots() {
        let table = CommandTable::default();
        let past = Instant::now() - Duration::from_millis(10);
        let future = Instant::now() + Duration::from_secs(10);
        let rx_expired = table.register(1, past);
        let _rx_live = table.register(2, future);

        assert_eq!(table.reap_expired(), 1);
        match rx_expired.recv().unwrap() {
            SlotOutcome::WatchdogTimedOut => {}
            _ => panic!("expected a watchdog timeout"),
        }
        // The still-live slot must not be touched by the sweep.
        assert!(!table.complete_by_seq(1, "ignored".to_string()));
        assert!(table.complete_by_seq(2, "OK:ALL_OFF".to_string()));
    }
}
