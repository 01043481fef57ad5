//! SMT Controller (§4.7): built on the Command Channel plus the shared
//! [`Connection`] plumbing; does not parse raw frames itself beyond the
//! `PANELX:` response body. Grounded on `pni-sdk::acquisition`'s per-command
//! write-then-typed-parse shape (`get_data`, `get_acq_params`), generalized
//! from binary TLV parsing to ASCII key-value response parsing.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use crate::config::ConnectConfig;
use crate::connection::{ButtonState, Connection};
use crate::error::CoreError;
use crate::identify::DeviceKind;

/// `{relay_index: 1..16, voltage_volts, current_amps}` (§3). Voltage and
/// current are post-averaging means computed on-device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RelayMeasurement {
    pub relay_index: u8,
    pub voltage_volts: f32,
    pub current_amps: f32,
}

const MIN_RELAY: u8 = 1;
const MAX_RELAY: u8 = 16;

/// Minimum run length of consecutive indices worth collapsing into a
/// `a-b` range rather than listing them individually; matches the spec's
/// worked example `1,2,5-8,12` (a run of 2 stays a list, a run of 4
/// collapses).
const MIN_RANGE_RUN: usize = 3;

/// Validates every index is in `1..=16` and the set is non-empty, before
/// any byte is sent (§4.7, §8 boundary behaviors).
fn validate_relays(relays: &BTreeSet<u8>) -> Result<(), CoreError> {
    if relays.is_empty() {
        return Err(CoreError::Validation("relay set must not be empty".to_string()));
    }
    if let Some(&bad) = relays.iter().find(|&&r| r < MIN_RELAY || r > MAX_RELAY) {
        return Err(CoreError::Validation(format!(
            "relay index {} out of range 1..=16",
            bad
        )));
    }
    Ok(())
}

/// `max(config.test_panel_timeout(relay_count), dwell_ms)`: the wait never
/// gets shorter than the function's declared on-device dwell (§3
/// `TestPlan.duration_ms`), even if the `base + per_relay×count` budget
/// would otherwise allow less.
fn test_panel_effective_timeout(config: &ConnectConfig, relay_count: usize, dwell_ms: u64) -> Duration {
    config
        .test_panel_timeout(relay_count)
        .max(Duration::from_millis(dwell_ms))
}

/// Formats a relay set as the comma/range/`ALL` syntax the fixture accepts
/// (§4.7 "Relay-list syntax").
pub fn format_relay_list(relays: &BTreeSet<u8>) -> String {
    if relays.len() == (MAX_RELAY - MIN_RELAY + 1) as usize
        && relays.iter().copied().eq(MIN_RELAY..=MAX_RELAY)
    {
        return "ALL".to_string();
    }

    let sorted: Vec<u8> = relays.iter().copied().collect();
    let mut parts = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i;
        while j + 1 < sorted.len() && sorted[j + 1] == sorted[j] + 1 {
            j += 1;
        }
        let run_len = j - i + 1;
        if run_len >= MIN_RANGE_RUN {
            parts.push(format!("{}-{}", sorted[i], sorted[j]));
        } else {
            for v in &sorted[i..=j] {
                parts.push(v.to_string());
            }
        }
        i = j + 1;
    }
    parts.join(",")
}

/// Parses the comma/range/`ALL` relay-list syntax back into a set (§8
/// round-trip law: `parse(format(S)) == S` for any `S ⊆ {1..16}`).
pub fn parse_relay_list(text: &str) -> Result<BTreeSet<u8>, CoreError> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("ALL") {
        return Ok((MIN_RELAY..=MAX_RELAY).collect());
    }
    if text.is_empty() {
        return Err(CoreError::Validation("relay list must not be empty".to_string()));
    }

    let mut out = BTreeSet::new();
    for term in text.split(',') {
        let term = term.trim();
        if let Some((lo, hi)) = term.split_once('-') {
            let lo: u8 = lo
                .trim()
                .parse()
                .map_err(|_| CoreError::Validation(format!("invalid relay range: {}", term)))?;
            let hi: u8 = hi
                .trim()
                .parse()
                .map_err(|_| CoreError::Validation(format!("invalid relay range: {}", term)))?;
            if lo > hi {
                return Err(CoreError::Validation(format!("invalid relay range: {}", term)));
            }
            for r in lo..=hi {
                out.insert(r);
            }
        } else {
            let r: u8 = term
                .parse()
                .map_err(|_| CoreError::Validation(format!("invalid relay index: {}", term)))?;
            out.insert(r);
        }
    }
    validate_relays(&out)?;
    Ok(out)
}

fn parse_panelx(payload: &str, requested: &BTreeSet<u8>) -> HashMap<u8, RelayMeasurement> {
    let body = payload.strip_prefix("PANELX:").unwrap_or(payload);
    let mut out = HashMap::new();

    for entry in body.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((index_str, rest)) = entry.split_once('=') else {
            log::warn!("malformed PANELX entry, skipping: {:?}", entry);
            continue;
        };
        let Ok(relay_index) = index_str.trim().parse::<u8>() else {
            log::warn!("malformed PANELX relay index, skipping: {:?}", entry);
            continue;
        };
        let Some((v_str, i_str)) = rest.split_once(',') else {
            log::warn!("malformed PANELX measurement, skipping: {:?}", entry);
            continue;
        };
        let (Ok(voltage_volts), Ok(current_amps)) =
            (v_str.trim().parse::<f32>(), i_str.trim().parse::<f32>())
        else {
            log::warn!("unparseable PANELX measurement, skipping: {:?}", entry);
            continue;
        };

        if !(0.0..=30.0).contains(&voltage_volts) || !(-50.0..=50.0).contains(&current_amps) {
            log::warn!(
                "relay {} measurement outside plausibility envelope, skipping: {}V {}A",
                relay_index,
                voltage_volts,
                current_amps
            );
            continue;
        }

        if !requested.contains(&relay_index) {
            log::info!(
                "PANELX response included relay {} not in the request, ignoring",
                relay_index
            );
            continue;
        }

        out.insert(
            relay_index,
            RelayMeasurement {
                relay_index,
                voltage_volts,
                current_amps,
            },
        );
    }

    out
}

/// SMT relay-panel tester control surface (§4.7).
pub struct SmtController {
    conn: Connection,
}

impl SmtController {
    /// Opens the transport, runs identification, and confirms the detected
    /// kind is SMT (§4.7 `connect`).
    pub fn connect(config: &ConnectConfig) -> Result<Self, CoreError> {
        let identify_config = config.identify_config();
        let conn = Connection::connect(&identify_config)?;
        if conn.identity.kind != DeviceKind::Smt {
            return Err(CoreError::IdentificationFailed(format!(
                "expected an SMT fixture, identified {:?} ({})",
                conn.identity.kind, conn.identity.firmware_string
            )));
        }
        Ok(Self { conn })
    }

    /// `X` → `OK:ALL_OFF`.
    pub fn all_off(&self) -> Result<(), CoreError> {
        self.conn.all_off()
    }

    /// `V` → `VOLTAGE:<v>`. Does not energize any relay.
    pub fn supply_voltage(&self) -> Result<f32, CoreError> {
        self.conn.supply_voltage()
    }

    /// `B` → `BUTTON:PRESSED|RELEASED`.
    pub fn button_state(&self) -> Result<ButtonState, CoreError> {
        self.conn.button_state()
    }

    /// Subscribes to button/transport-lost events (§4.5).
    pub fn events(&self) -> &std::sync::Arc<crate::dispatch::EventDispatcher<String>> {
        self.conn.events()
    }

    /// Issues one batched `TX:<list>` command and parses the
    /// `PANELX:<r>=<v>,<c>;...` response into a per-relay measurement map.
    /// Any relay index omitted from the response is simply absent from the
    /// returned map (§4.7, §4.8c "Missing measurement ⇒ fail with reason
    /// NoMeasurement" is the orchestrator's concern, not this layer's).
    ///
    /// Equivalent to [`test_panel_with_dwell`](Self::test_panel_with_dwell)
    /// with no extra dwell-time floor, for callers (the bring-up CLI, tests)
    /// that don't have a `TestPlan`-supplied function duration to honor.
    pub fn test_panel(
        &self,
        relay_indices: &BTreeSet<u8>,
        config: &ConnectConfig,
    ) -> Result<HashMap<u8, RelayMeasurement>, CoreError> {
        self.test_panel_with_dwell(relay_indices, config, 0)
    }

    /// Same as [`test_panel`](Self::test_panel), but the wait is never
    /// shorter than `dwell_ms` (§3 `TestPlan.duration_ms`): the timeout used
    /// is `max(config.test_panel_timeout(count), dwell_ms)`, so a function
    /// whose on-device measurement window is longer than the
    /// `base + per_relay×count` budget can't be cut short waiting on a
    /// result the fixture hasn't produced yet.
    ///
    /// Pauses the reader for the duration of the exchange and reads the
    /// response directly (§4.7 "Pause/resume wrap"), released on every exit
    /// path via `PauseGuard`. A single read timeout or a single checksum
    /// mismatch is retried once with a fresh sequence number, per the §4.9
    /// bounded-retry policy; no command is issued more than twice
    /// consecutively, and a second occurrence of either surfaces (§7).
    pub fn test_panel_with_dwell(
        &self,
        relay_indices: &BTreeSet<u8>,
        config: &ConnectConfig,
        dwell_ms: u64,
    ) -> Result<HashMap<u8, RelayMeasurement>, CoreError> {
        validate_relays(relay_indices)?;

        let cmd_text = format!("TX:{}", format_relay_list(relay_indices));
        let timeout = test_panel_effective_timeout(config, relay_indices.len(), dwell_ms);

        let payload = match self.send_test_panel_command(&cmd_text, timeout) {
            Err(CoreError::Timeout { .. }) | Err(CoreError::ChecksumMismatch { .. }) => {
                self.send_test_panel_command(&cmd_text, timeout)?
            }
            other => other?,
        };

        Ok(parse_panelx(&payload, relay_indices))
    }

    fn send_test_panel_command(&self, cmd_text: &str, timeout: Duration) -> Result<String, CoreError> {
        let seq = self.conn.next_seq();
        self.conn.send_paused(cmd_text, seq, timeout, "PANELX:")
    }

    /// Stops the reader and releases the port on every exit path.
    pub fn disconnect(self) {
        self.conn.disconnect()
    }

    #[cfg(test)]
    pub(crate) fn from_identity(
        identity: crate::identify::DeviceIdentity,
        transport: crate::transport::LineTransport,
    ) -> Self {
        Self {
            conn: Connection::from_identity(identity, transport),
        }
    }
}
