//! End-to-end scenario tests driving the full stack (identification bypassed
//! via `from_identity`, reader task, command channel, SMT controller,
//! orchestrator) against a scripted device simulator built on top of
//! [`MockPort`]. Unit tests elsewhere cover individual modules in isolation;
//! these cover the multi-step exchanges that only show up once the reader
//! task, pause/resume protocol, and retry policy are all running together.

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::config::ConnectConfig;
    use crate::frame::xor8;
    use crate::identify::{DeviceIdentity, DeviceKind};
    use crate::orchestrator::{run_panel_test, FunctionSpec, Limits, OrchestratorOutcome, OrchestratorState, TestPlan};
    use crate::smt::{parse_relay_list, SmtController};
    use crate::transport::tests::MockPort;
    use crate::transport::LineTransport;
    use crate::CoreError;

    fn smt_identity() -> DeviceIdentity {
        DeviceIdentity {
            kind: DeviceKind::Smt,
            firmware_string: "DIODE_DYNAMICS_SMT_TESTER_V5".to_string(),
            detected_baud: 115_200,
            port_identifier: "mock".to_string(),
        }
    }

    /// Everything up to (not including) the `:SEQ=` trailer a reliable
    /// command frame carries.
    fn extract_cmd_text(line: &str) -> &str {
        let pos = line.find(":SEQ=").expect("every command is sent reliably");
        &line[..pos]
    }

    /// The numeric value of a command frame's `:SEQ=` field.
    fn extract_seq(line: &str) -> u16 {
        let pos = line.find(":SEQ=").expect("every command is sent reliably");
        let rest = &line[pos + 5..];
        let end = rest.find(':').unwrap_or(rest.len());
        rest[..end].parse().expect("seq field must be numeric")
    }

    /// Builds a correctly-checksummed response line correlated to `cmd_seq`
    /// (the `:SEQ=` value the client sent).
    fn reliable_response(payload: &str, device_seq: u16, cmd_seq: u16) -> String {
        let body = format!("{}:SEQ={}:CMDSEQ={}", payload, device_seq, cmd_seq);
        let chk = xor8(body.as_bytes());
        format!("{}:CHK={:02X}", body, chk)
    }

    /// Same shape as [`reliable_response`] but with the checksum byte
    /// deliberately wrong, for exercising the §4.9 retry path.
    fn corrupt_checksum_response(payload: &str, device_seq: u16, cmd_seq: u16) -> String {
        let body = format!("{}:SEQ={}:CMDSEQ={}", payload, device_seq, cmd_seq);
        let chk = xor8(body.as_bytes()) ^ 0xFF;
        format!("{}:CHK={:02X}", body, chk)
    }

    /// Runs `respond` against every newly-written command line on `mock`'s
    /// outbound buffer, pushing whatever it returns back into the inbound
    /// queue. Stops when the returned flag is set. Polls rather than
    /// blocking on a condition variable since `MockPort`'s buffers are plain
    /// `Mutex`-guarded collections with no notification primitive.
    fn spawn_device_simulator(
        mock: MockPort,
        mut respond: impl FnMut(&str) -> Vec<String> + Send + 'static,
    ) -> (Arc<AtomicBool>, thread::JoinHandle<()>) {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = stop.clone();
        let handle = thread::spawn(move || {
            let mut seen = 0usize;
            let mut buf: Vec<u8> = Vec::new();
            while !stop_for_thread.load(Ordering::Relaxed) {
                let snapshot = mock.outbound.lock().unwrap().clone();
                if snapshot.len() > seen {
                    buf.extend_from_slice(&snapshot[seen..]);
                    seen = snapshot.len();
                    while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                        let line_bytes: Vec<u8> = buf.drain(..=pos).collect();
                        let line =
                            String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1]).into_owned();
                        for reply in respond(&line) {
                            mock.push_line(&reply);
                        }
                    }
                } else {
                    thread::sleep(Duration::from_millis(5));
                }
            }
        });
        (stop, handle)
    }

    /// Scenario: a `TX:` exchange's first reply has a corrupted checksum,
    /// which surfaces internally as `ChecksumMismatch` once the deadline
    /// elapses with nothing valid behind it (§7); the bounded retry resends
    /// with a fresh sequence number and the second reply is valid. Expected:
    /// `test_panel` succeeds, and the device saw exactly two `TX:` commands
    /// (no more than the single permitted retry).
    #[test]
    fn checksum_mismatch_then_retry_recovers() {
        let mock = MockPort::new();
        let tx_attempts = Arc::new(AtomicUsize::new(0));
        let tx_attempts_sim = tx_attempts.clone();

        let (stop, handle) = spawn_device_simulator(mock.clone(), move |line| {
            let cmd_text = extract_cmd_text(line);
            if !cmd_text.starts_with("TX:") {
                return Vec::new();
            }
            let seq = extract_seq(line);
            let attempt = tx_attempts_sim.fetch_add(1, Ordering::SeqCst);
            if attempt == 0 {
                vec![corrupt_checksum_response("PANELX:1=12.000,2.000", 1, seq)]
            } else {
                vec![reliable_response("PANELX:1=12.000,2.000", 2, seq)]
            }
        });

        let controller = SmtController::from_identity(smt_identity(), LineTransport::from_port(Box::new(mock)));
        let mut config = ConnectConfig::new(vec!["mock".to_string()]);
        config.test_panel_base_timeout = Duration::from_millis(60);
        config.test_panel_per_relay_timeout = Duration::from_millis(0);

        let relays: BTreeSet<u8> = [1].into_iter().collect();
        let result = controller
            .test_panel(&relays, &config)
            .expect("the bounded retry should recover from the corrupted first reply");

        let measurement = result.get(&1).expect("relay 1 measurement present");
        assert!((measurement.voltage_volts - 12.0).abs() < 1e-6);
        assert_eq!(
            tx_attempts.load(Ordering::SeqCst),
            2,
            "expected exactly one retry, not repeated resends"
        );

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
        controller.disconnect();
    }

    /// Scenario: both the original `TX:` reply and its single retry have a
    /// corrupted checksum. Expected: the second mismatch within the same
    /// command surfaces as `CoreError::ChecksumMismatch` (§7), not a generic
    /// timeout, and the device saw exactly two `TX:` commands.
    #[test]
    fn second_checksum_mismatch_surfaces_not_timeout() {
        let mock = MockPort::new();
        let tx_attempts = Arc::new(AtomicUsize::new(0));
        let tx_attempts_sim = tx_attempts.clone();

        let (stop, handle) = spawn_device_simulator(mock.clone(), move |line| {
            let cmd_text = extract_cmd_text(line);
            if !cmd_text.starts_with("TX:") {
                return Vec::new();
            }
            let seq = extract_seq(line);
            tx_attempts_sim.fetch_add(1, Ordering::SeqCst);
            vec![corrupt_checksum_response("PANELX:1=12.000,2.000", 1, seq)]
        });

        let controller = SmtController::from_identity(smt_identity(), LineTransport::from_port(Box::new(mock)));
        let mut config = ConnectConfig::new(vec!["mock".to_string()]);
        config.test_panel_base_timeout = Duration::from_millis(40);
        config.test_panel_per_relay_timeout = Duration::from_millis(0);

        let relays: BTreeSet<u8> = [1].into_iter().collect();
        let err = controller
            .test_panel(&relays, &config)
            .expect_err("two consecutive checksum mismatches must surface, not hang");
        assert!(
            matches!(err, CoreError::ChecksumMismatch { .. }),
            "expected ChecksumMismatch, got {:?}",
            err
        );
        assert_eq!(
            tx_attempts.load(Ordering::SeqCst),
            2,
            "no command may be issued more than twice consecutively"
        );

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
        controller.disconnect();
    }

    /// Scenario: the device never replies to `TX:` at all. Expected: both
    /// the original attempt and its single retry time out, the error
    /// surfaces as `CoreError::Timeout`, and the port is never force-closed
    /// by `test_panel` itself (closing is `disconnect`'s job).
    #[test]
    fn silent_device_surfaces_bounded_timeout() {
        let mock = MockPort::new();
        let tx_attempts = Arc::new(AtomicUsize::new(0));
        let tx_attempts_sim = tx_attempts.clone();

        let (stop, handle) = spawn_device_simulator(mock.clone(), move |line| {
            if extract_cmd_text(line).starts_with("TX:") {
                tx_attempts_sim.fetch_add(1, Ordering::SeqCst);
            }
            Vec::new()
        });

        let controller = SmtController::from_identity(smt_identity(), LineTransport::from_port(Box::new(mock)));
        let mut config = ConnectConfig::new(vec!["mock".to_string()]);
        config.test_panel_base_timeout = Duration::from_millis(40);
        config.test_panel_per_relay_timeout = Duration::from_millis(0);

        let relays: BTreeSet<u8> = [1].into_iter().collect();
        let err = controller
            .test_panel(&relays, &config)
            .expect_err("a silent device must surface as a timeout, not hang");
        assert!(matches!(err, CoreError::Timeout { .. }));
        assert_eq!(
            tx_attempts.load(Ordering::SeqCst),
            2,
            "expected the original attempt plus exactly one retry"
        );

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
        controller.disconnect();
    }

    /// Scenario: a cancellation flag set while the first of two functions is
    /// in flight stops the run before the second function's relays are ever
    /// energized. Expected: the orchestrator reports `Cancelled`, `all_off`
    /// still runs, and the device only ever sees one `TX:` exchange.
    #[test]
    fn cancellation_stops_before_next_function() {
        let mock = MockPort::new();
        let tx_count = Arc::new(AtomicUsize::new(0));
        let tx_count_sim = tx_count.clone();

        let (stop, handle) = spawn_device_simulator(mock.clone(), move |line| {
            let cmd_text = extract_cmd_text(line);
            let seq = extract_seq(line);
            if cmd_text == "X" {
                vec![reliable_response("OK:ALL_OFF", 1, seq)]
            } else if cmd_text == "V" {
                vec![reliable_response("VOLTAGE:12.0", 1, seq)]
            } else if let Some(list) = cmd_text.strip_prefix("TX:") {
                tx_count_sim.fetch_add(1, Ordering::SeqCst);
                let relays = parse_relay_list(list).expect("simulator only ever sees valid relay lists");
                let body = relays
                    .iter()
                    .map(|r| format!("{}=12.000,2.000", r))
                    .collect::<Vec<_>>()
                    .join(";");
                vec![reliable_response(&format!("PANELX:{}", body), 1, seq)]
            } else {
                Vec::new()
            }
        });

        let controller = SmtController::from_identity(smt_identity(), LineTransport::from_port(Box::new(mock)));
        let mut config = ConnectConfig::new(vec!["mock".to_string()]);
        config.test_panel_base_timeout = Duration::from_millis(60);
        config.test_panel_per_relay_timeout = Duration::from_millis(0);

        let wide_open = Limits {
            voltage_min: 0.0,
            voltage_max: 30.0,
            current_min: -50.0,
            current_max: 50.0,
        };
        let mut plan = TestPlan::default();
        plan.functions.push((
            "mainbeam".to_string(),
            FunctionSpec {
                relay_indices: [1].into_iter().collect(),
                duration_ms: 0,
                delay_after_ms: 0,
                limits: wide_open,
            },
        ));
        plan.functions.push((
            "backlight".to_string(),
            FunctionSpec {
                relay_indices: [2].into_iter().collect(),
                duration_ms: 0,
                delay_after_ms: 0,
                limits: wide_open,
            },
        ));
        plan.relay_to_board.insert(1, 1);
        plan.relay_to_board.insert(2, 2);

        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_for_progress = cancel.clone();

        let outcome = run_panel_test(&controller, &plan, &config, &cancel, |state, _progress| {
            if matches!(state, OrchestratorState::PerFunction(0)) {
                cancel_for_progress.store(true, Ordering::Relaxed);
            }
        })
        .expect("cancellation is a clean outcome, not an error");

        assert!(matches!(outcome, OrchestratorOutcome::Cancelled));
        assert_eq!(
            tx_count.load(Ordering::SeqCst),
            1,
            "the second function's relays must never be energized once cancelled"
        );

        stop.store(true, Ordering::Relaxed);
        handle.join().unwrap();
        controller.disconnect();
    }
}
