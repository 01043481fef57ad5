//! Shared connection plumbing used by both the SMT and Offroad controllers:
//! opening the transport after identification, starting the reader, the
//! common `all_off`/`supply_voltage`/`button_state`/`disconnect` commands
//! (§4.7, §6.6), and the pause-wrapped direct-read path `test_panel` needs
//! (§4.7 "Pause/resume wrap").

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cache::DeviceCache;
use crate::command_channel::{CommandChannel, CommandTable};
use crate::error::CoreError;
use crate::frame::{decode_line, encode_reliable, Frame};
use crate::identify::{identify, DeviceIdentity, IdentifyConfig};
use crate::reader::{self, ReaderHandle};
use crate::transport::{LineTransport, ReadOutcome};

/// Default command timeout for commands that do not energize relays
/// (`X`, `V`, `B`, `RESET_SEQ`).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonState {
    Pressed,
    Released,
}

/// RAII guard pairing one [`reader::PauseState::pause`] with its
/// `resume`, released on every exit path including panics (§4.7).
pub struct PauseGuard {
    pause: Arc<reader::PauseState>,
}

impl PauseGuard {
    pub fn acquire(pause: Arc<reader::PauseState>) -> Self {
        pause.pause();
        Self { pause }
    }
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.pause.resume();
    }
}

/// A live connection to a fixture: owns the transport (shared with the
/// reader thread via `Arc<Mutex<..>>` so a paused-mode caller can read
/// directly), the reader task, and the command channel.
pub struct Connection {
    pub identity: DeviceIdentity,
    transport: Arc<Mutex<LineTransport>>,
    reader: ReaderHandle,
    commands: CommandChannel,
}

impl Connection {
    /// Runs identification (§4.6) against `config`, opens the transport at
    /// the detected port/baud, and starts the reader task.
    pub fn connect(config: &IdentifyConfig) -> Result<Self, CoreError> {
        let identity = identify(config)?;
        let transport = Arc::new(Mutex::new(LineTransport::open(
            &identity.port_identifier,
            identity.detected_baud,
            reader::READER_POLL_TIMEOUT,
        )?));
        let table = Arc::new(CommandTable::default());
        let commands = CommandChannel::new(transport.clone(), table.clone());
        let reader = reader::spawn_reader(transport.clone(), table);

        Ok(Self {
            identity,
            transport,
            reader,
            commands,
        })
    }

    /// Wraps an already-open transport and a fresh reader/command channel
    /// around it, for callers (tests, the `Offroad` family) that already
    /// know the device identity and don't need to re-probe.
    pub fn from_identity(identity: DeviceIdentity, transport: LineTransport) -> Self {
        let transport = Arc::new(Mutex::new(transport));
        let table = Arc::new(CommandTable::default());
        let commands = CommandChannel::new(transport.clone(), table.clone());
        let reader = reader::spawn_reader(transport.clone(), table);
        Self {
            identity,
            transport,
            reader,
            commands,
        }
    }

    pub fn commands(&self) -> &CommandChannel {
        &self.commands
    }

    pub fn events(&self) -> &Arc<crate::dispatch::EventDispatcher<String>> {
        &self.reader.events
    }

    pub fn live_samples(&self) -> &Arc<crate::dispatch::BoundedQueue<String>> {
        &self.reader.live_samples
    }

    pub fn metrics(&self) -> &Arc<reader::Metrics> {
        &self.reader.metrics
    }

    /// `X` → `OK:ALL_OFF`: de-energizes all relays.
    pub fn all_off(&self) -> Result<(), CoreError> {
        self.commands
            .send("X", DEFAULT_TIMEOUT, Some("OK:ALL_OFF"))
            .map(|_| ())
    }

    /// `V` → `VOLTAGE:<v>`: supply voltage, no relay action.
    pub fn supply_voltage(&self) -> Result<f32, CoreError> {
        let payload = self.commands.send("V", DEFAULT_TIMEOUT, Some("VOLTAGE:"))?;
        let value = payload
            .strip_prefix("VOLTAGE:")
            .ok_or_else(|| CoreError::Protocol {
                expected: "VOLTAGE:".to_string(),
                got: payload.clone(),
            })?;
        value.trim().parse::<f32>().map_err(|_| CoreError::Protocol {
            expected: "VOLTAGE:<float>".to_string(),
            got: payload,
        })
    }

    /// `B` → `BUTTON:PRESSED|RELEASED`: debounced input state.
    pub fn button_state(&self) -> Result<ButtonState, CoreError> {
        let payload = self.commands.send("B", DEFAULT_TIMEOUT, Some("BUTTON:"))?;
        match payload.strip_prefix("BUTTON:") {
            Some("PRESSED") => Ok(ButtonState::Pressed),
            Some("RELEASED") => Ok(ButtonState::Released),
            _ => Err(CoreError::Protocol {
                expected: "BUTTON:PRESSED|RELEASED".to_string(),
                got: payload,
            }),
        }
    }

    /// Stops the reader and releases the port on every exit path.
    pub fn disconnect(mut self) {
        self.reader.stop();
        self.transport.lock().unwrap().close();
    }

    /// Pauses the reader, sends `cmd_text` reliably, and reads the response
    /// line directly with an explicit deadline, resuming on every exit path
    /// (§4.7 "Pause/resume wrap"). Any `Event`/`LiveSample` frames seen
    /// while waiting are forwarded to the normal dispatcher/queue rather
    /// than dropped, preserving arrival-order delivery even while the
    /// reader is parked. If a checksum-mismatched frame is seen before the
    /// deadline and nothing valid arrives afterward, the deadline surfaces
    /// as `ChecksumMismatch` rather than `Timeout` (§7: "a single occurrence
    /// is retried once, a second within the same command surfaces"); the
    /// caller (`SmtController::test_panel`) retries on either.
    pub fn send_paused(
        &self,
        cmd_text: &str,
        seq: u16,
        timeout: Duration,
        expected_discriminator: &str,
    ) -> Result<String, CoreError> {
        let _guard = PauseGuard::acquire(self.reader.pause.clone());
        let deadline = Instant::now() + timeout;
        let mut seen_mismatch: Option<(u8, u8)> = None;

        {
            let mut transport = self.transport.lock().unwrap();
            transport.discard_input()?;
            let frame = encode_reliable(cmd_text, seq);
            transport.write_bytes(format!("{}\n", frame).as_bytes())?;
        }

        let deadline_error = |seen_mismatch: Option<(u8, u8)>| match seen_mismatch {
            Some((claimed, computed)) => CoreError::ChecksumMismatch { claimed, computed },
            None => CoreError::Timeout { seq },
        };

        loop {
            if Instant::now() >= deadline {
                return Err(deadline_error(seen_mismatch));
            }
            let outcome = {
                let mut transport = self.transport.lock().unwrap();
                transport.read_until_deadline(deadline)?
            };
            let line = match outcome {
                ReadOutcome::TimedOut => return Err(deadline_error(seen_mismatch)),
                ReadOutcome::Line(line) => line,
            };
            if line.is_empty() {
                continue;
            }

            match decode_line(&line) {
                Frame::Response {
                    payload, cmd_seq, ..
                } if cmd_seq == Some(seq) || cmd_seq.is_none() => {
                    if payload.starts_with("ERROR:TEST_IN_PROGRESS") {
                        return Err(CoreError::DeviceBusy);
                    }
                    if !payload.starts_with(expected_discriminator) {
                        return Err(CoreError::Protocol {
                            expected: expected_discriminator.to_string(),
                            got: payload,
                        });
                    }
                    return Ok(payload);
                }
                Frame::Response { .. } => {
                    // A response correlated to some other (stale) sequence;
                    // keep waiting for ours.
                    continue;
                }
                Frame::Event { payload, .. } => {
                    self.reader.events.publish(payload);
                }
                Frame::LiveSample { payload } => {
                    self.reader.live_samples.push(payload);
                }
                Frame::ChecksumMismatch { claimed, computed } => {
                    self.reader
                        .metrics
                        .checksum_mismatches
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    log::warn!(
                        "checksum mismatch during paused read: claimed {:02X}, computed {:02X}",
                        claimed,
                        computed
                    );
                    seen_mismatch = Some((claimed, computed));
                }
            }
        }
    }

    /// Allocates the next sequence number from the underlying command
    /// channel, for callers that build their own reliable frame (e.g.
    /// `test_panel`'s paused direct send).
    pub fn next_seq(&self) -> u16 {
        self.commands.allocate_seq_for_direct_send()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identify::DeviceKind;
    use crate::transport::tests::MockPort;

    fn test_identity() -> DeviceIdentity {
        DeviceIdentity {
            kind: DeviceKind::Smt,
            firmware_string: "DIODE_DYNAMICS_SMT_TESTER_V5".to_string(),
            detected_baud: 115_200,
            port_identifier: "mock".to_string(),
        }
    }

    #[test]
    fn all_off_round_trips_through_reader() {
        let mock = MockPort::new();
        let body = "OK:ALL_OFF:SEQ=1:CMDSEQ=1";
        let chk = crate::frame::xor8(body.as_bytes());
        mock.push_line(&format!("{}:CHK={:02X}", body, chk));

        let conn = Connection::from_identity(
            test_identity(),
            LineTransport::from_port(Box::new(mock)),
        );
        assert!(conn.all_off().is_ok());
        conn.disconnect();
    }

    #[test]
    fn supply_voltage_parses_response() {
        let mock = MockPort::new();
        let body = "VOLTAGE:12.50:SEQ=1:CMDSEQ=1";
        let chk = crate::frame::xor8(body.as_bytes());
        mock.push_line(&format!("{}:CHK={:02X}", body, chk));

        let conn = Connection::from_identity(
            test_identity(),
            LineTransport::from_port(Box::new(mock)),
        );
        let voltage = conn.supply_voltage().expect("expected a parsed voltage");
        assert!((voltage - 12.50).abs() < 1e-6);
        conn.disconnect();
    }

    #[test]
    fn button_state_rejects_unexpected_payload() {
        let mock = MockPort::new();
        let body = "GARBAGE:SEQ=1:CMDSEQ=1";
        let chk = crate::frame::xor8(body.as_bytes());
        mock.push_line(&format!("{}:CHK={:02X}", body, chk));

        let conn = Connection::from_identity(
            test_identity(),
            LineTransport::from_port(Box::new(mock)),
        );
        assert!(matches!(
            conn.button_state(),
            Err(CoreError::Protocol { .. })
        ));
        conn.disconnect();
    }

    #[test]
    fn send_paused_surfaces_checksum_mismatch_when_nothing_valid_follows() {
        let mock = MockPort::new();
        let body = "PANELX:1=12.0,1.0:SEQ=1:CMDSEQ=1";
        let chk = crate::frame::xor8(body.as_bytes()) ^ 0xFF;
        mock.push_line(&format!("{}:CHK={:02X}", body, chk));

        let conn = Connection::from_identity(
            test_identity(),
            LineTransport::from_port(Box::new(mock)),
        );
        let seq = conn.next_seq();
        let err = conn
            .send_paused("TX:1", seq, Duration::from_millis(80), "PANELX:")
            .expect_err("a corrupted checksum with nothing valid behind it must surface");
        assert!(matches!(err, CoreError::ChecksumMismatch { .. }));
        conn.disconnect();
    }
}
