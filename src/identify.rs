//! Device Identifier (§4.6): probes candidate ports, classifies firmware,
//! and caches the last-good port as a hint. Grounded on
//! `TargetPoint3::connect`'s port-selection fold over
//! `serialport::available_ports()`, generalized from a single
//! "contains usb" heuristic to the probe-then-classify sequence below.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::cache::DeviceCache;
use crate::error::CoreError;
use crate::frame::{encode_bare, decode_line, Frame};
use crate::transport::{LineTransport, ReadOutcome};

/// Baud rate used for the primary SMT/Offroad identification probe (§4.6).
pub const PRIMARY_BAUD: u32 = 115_200;
/// Read timeout for each identification probe step (§4.6).
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(100);
/// Bounded parallelism for the concurrent fallback probe (§4.6 step 3).
pub const MAX_CONCURRENT_PROBES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Smt,
    Offroad,
    Scale,
    Unknown,
}

/// `{kind, firmware_string, detected_baud, port_identifier}` (§3), persisted
/// across restarts as a hint (§3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub kind: DeviceKind,
    pub firmware_string: String,
    pub detected_baud: u32,
    pub port_identifier: String,
}

/// Candidate ports and baud rates to probe, and the cache used for the
/// last-good-port hint. Constructed programmatically by the embedding
/// application (§1.1): the surrounding application is responsible for port
/// enumeration (§6, "Environment & runtime").
pub struct IdentifyConfig {
    pub candidate_ports: Vec<String>,
    /// Baud rates for other device types (e.g. scales at 9600), tried only
    /// if the primary-baud probe fails and the caller permits (§4.6).
    pub fallback_bauds: Vec<u32>,
    pub cache: DeviceCache,
}

fn classify_banner(banner: &str) -> DeviceKind {
    if banner.starts_with("DIODE_DYNAMICS_SMT_TESTER") || banner.starts_with("SMT_BATCH_TESTER") {
        DeviceKind::Smt
    } else if banner.starts_with("DIODE_DYNAMICS_OFFROAD") || banner.starts_with("OFFROAD_TESTER") {
        DeviceKind::Offroad
    } else if banner.contains("SMT") {
        DeviceKind::Smt
    } else {
        DeviceKind::Unknown
    }
}

/// Opens `port` at `baud`, sends `I\n` then (if silent) `ID\n`, and
/// classifies whatever banner comes back. Returns `Ok(None)` (not an error)
/// when the port simply didn't respond — a non-responsive port is an
/// ordinary probe outcome, not a failure.
fn probe_port(port: &str, baud: u32) -> Result<Option<DeviceIdentity>, CoreError> {
    let mut transport = LineTransport::open(port, baud, PROBE_TIMEOUT)?;
    transport.discard_input()?;

    for probe_cmd in ["I", "ID"] {
        transport.write_bytes(format!("{}\n", encode_bare(probe_cmd)).as_bytes())?;
        let deadline = Instant::now() + PROBE_TIMEOUT;
        match transport.read_until_deadline(deadline)? {
            ReadOutcome::Line(line) if !line.is_empty() => {
                let banner = match decode_line(&line) {
                    Frame::Response { payload, .. } => payload,
                    _ => line,
                };
                return Ok(Some(DeviceIdentity {
                    kind: classify_banner(&banner),
                    firmware_string: banner,
                    detected_baud: baud,
                    port_identifier: port.to_string(),
                }));
            }
            _ => continue,
        }
    }

    Ok(None)
}

/// Runs the full identification procedure (§4.6):
/// 1. try the cached last-good port first;
/// 2. probe remaining candidates sequentially at the primary baud;
/// 3. on total sequential failure, probe the rest concurrently (bounded
///    parallelism);
/// 4. only then, if permitted, retry every port at the fallback bauds.
pub fn identify(config: &IdentifyConfig) -> Result<DeviceIdentity, CoreError> {
    let mut ordered_ports = config.candidate_ports.clone();
    if let Some(cached) = config.cache.get_hint() {
        if let Some(pos) = ordered_ports.iter().position(|p| p == &cached.port_identifier) {
            ordered_ports.remove(pos);
        }
        ordered_ports.insert(0, cached.port_identifier);
    }

    for port in &ordered_ports {
        if let Ok(Some(identity)) = probe_port(port, PRIMARY_BAUD) {
            config.cache.record(&identity);
            return Ok(identity);
        }
    }

    if let Some(identity) = probe_concurrent(&ordered_ports, PRIMARY_BAUD) {
        config.cache.record(&identity);
        return Ok(identity);
    }

    for &baud in &config.fallback_bauds {
        for port in &ordered_ports {
            if let Ok(Some(identity)) = probe_port(port, baud) {
                config.cache.record(&identity);
                return Ok(identity);
            }
        }
    }

    Err(CoreError::IdentificationFailed(
        "no device matched any probe".to_string(),
    ))
}

/// Bounded-parallelism fallback probe (§4.6 step 3): probes the remaining
/// ports concurrently, at most [`MAX_CONCURRENT_PROBES`] at a time, and
/// returns the first success.
fn probe_concurrent(ports: &[String], baud: u32) -> Option<DeviceIdentity> {
    let mut result = None;
    for chunk in ports.chunks(MAX_CONCURRENT_PROBES) {
        let found = std::thread::scope(|scope| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|port| scope.spawn(move || probe_port(port, baud)))
                .collect();
            for handle in handles {
                if let Ok(Ok(Some(identity))) = handle.join() {
                    return Some(identity);
                }
            }
            None
        });
        if found.is_some() {
            result = found;
            break;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_banners() {
        assert_eq!(
            classify_banner("DIODE_DYNAMICS_SMT_TESTER_V5"),
            DeviceKind::Smt
        );
        assert_eq!(classify_banner("SMT_BATCH_TESTER_V2"), DeviceKind::Smt);
        assert_eq!(
            classify_banner("DIODE_DYNAMICS_OFFROAD_V3"),
            DeviceKind::Offroad
        );
        assert_eq!(classify_banner("OFFROAD_TESTER"), DeviceKind::Offroad);
        assert_eq!(classify_banner("CONTAINS_SMT_SOMEWHERE"), DeviceKind::Smt);
        assert_eq!(classify_banner("WHO_KNOWS"), DeviceKind::Unknown);
    }
}
