//! Offroad command surface (§6.6, supplemented): a thin wrapper over the
//! Command Channel mirroring `smt`'s relationship to it. The spec's
//! Non-goals never exclude the Offroad fixture, only scope full typed
//! orchestration to SMT (§4.8 is titled "(SMT)" throughout); this module
//! covers the command/response surface without a typed limits/orchestrator
//! layer, since the spec does not enumerate Offroad's per-field semantics
//! the way it does for SMT.

use std::collections::HashMap;
use std::time::Duration;

use crate::config::ConnectConfig;
use crate::connection::{ButtonState, Connection, DEFAULT_TIMEOUT};
use crate::error::CoreError;
use crate::identify::DeviceKind;

/// Timeout for Offroad's function/pressure/RGBW/backlight tests, which
/// (like SMT's `TX`) drive a physical measurement rather than a bare status
/// query.
const OFFROAD_TEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Parses a `KEY=f1,f2,f3;KEY2=f1,f2` style payload into a per-zone map of
/// raw field lists, e.g. `TESTF:MAIN=12.5,1.2,2500,0.45,0.41;BACK=...` ->
/// `{"MAIN": ["12.5","1.2","2500","0.45","0.41"], "BACK": [...]}`. The spec
/// does not fully enumerate Offroad's field semantics (§6.6), so fields are
/// kept as raw strings rather than typed out.
fn parse_zone_fields(payload: &str, prefix: &str) -> HashMap<String, Vec<String>> {
    let body = payload.strip_prefix(prefix).unwrap_or(payload);
    let mut out = HashMap::new();
    for zone in body.split(';') {
        let zone = zone.trim();
        if zone.is_empty() {
            continue;
        }
        if let Some((key, fields)) = zone.split_once('=') {
            out.insert(
                key.trim().to_string(),
                fields.split(',').map(|f| f.trim().to_string()).collect(),
            );
        }
    }
    out
}

/// Offroad optical/pressure tester control surface (§6, Offroad command
/// set).
pub struct OffroadController {
    conn: Connection,
}

impl OffroadController {
    /// Opens the transport, runs identification, and confirms the detected
    /// kind is Offroad.
    pub fn connect(config: &ConnectConfig) -> Result<Self, CoreError> {
        let identify_config = config.identify_config();
        let conn = Connection::connect(&identify_config)?;
        if conn.identity.kind != DeviceKind::Offroad {
            return Err(CoreError::IdentificationFailed(format!(
                "expected an Offroad fixture, identified {:?} ({})",
                conn.identity.kind, conn.identity.firmware_string
            )));
        }
        Ok(Self { conn })
    }

    pub fn all_off(&self) -> Result<(), CoreError> {
        self.conn.all_off()
    }

    pub fn supply_voltage(&self) -> Result<f32, CoreError> {
        self.conn.supply_voltage()
    }

    pub fn button_state(&self) -> Result<ButtonState, CoreError> {
        self.conn.button_state()
    }

    /// `TF` → `TESTF:<zone>=<fields>;...`: main-beam/function test.
    pub fn test_function(&self) -> Result<HashMap<String, Vec<String>>, CoreError> {
        let payload = self
            .conn
            .commands()
            .send_with_retry("TF", OFFROAD_TEST_TIMEOUT, Some("TESTF:"))?;
        Ok(parse_zone_fields(&payload, "TESTF:"))
    }

    /// `TP` → `TESTP:<zone>=<fields>;...`: pressure test.
    pub fn test_pressure(&self) -> Result<HashMap<String, Vec<String>>, CoreError> {
        let payload = self
            .conn
            .commands()
            .send_with_retry("TP", OFFROAD_TEST_TIMEOUT, Some("TESTP:"))?;
        Ok(parse_zone_fields(&payload, "TESTP:"))
    }

    /// `TR` → `TESTR:<zone>=<fields>;...`: RGBW test.
    pub fn test_rgbw(&self) -> Result<HashMap<String, Vec<String>>, CoreError> {
        let payload = self
            .conn
            .commands()
            .send_with_retry("TR", OFFROAD_TEST_TIMEOUT, Some("TESTR:"))?;
        Ok(parse_zone_fields(&payload, "TESTR:"))
    }

    /// `TD` → `TESTD:<zone>=<fields>;...`: dual-backlight test.
    pub fn test_dual_backlight(&self) -> Result<HashMap<String, Vec<String>>, CoreError> {
        let payload = self
            .conn
            .commands()
            .send_with_retry("TD", OFFROAD_TEST_TIMEOUT, Some("TESTD:"))?;
        Ok(parse_zone_fields(&payload, "TESTD:"))
    }

    /// `S` → sensor presence check. Returns `Err(CoreError::Protocol)` if
    /// the device reports `ERROR:SENSOR_MISSING:<name>` (surfaced by the
    /// Command Channel's discriminator check never matching).
    pub fn sensor_check(&self) -> Result<String, CoreError> {
        self.conn
            .commands()
            .send_with_retry("S", DEFAULT_TIMEOUT, None)
    }

    /// `M:0|1` → enables or disables the `LIVE:...` telemetry stream.
    pub fn set_live_stream(&self, enabled: bool) -> Result<(), CoreError> {
        let cmd = if enabled { "M:1" } else { "M:0" };
        self.conn
            .commands()
            .send_with_retry(cmd, DEFAULT_TIMEOUT, None)
            .map(|_| ())
    }

    /// Non-blocking pop of the next queued `LIVE:...` sample, if any.
    pub fn poll_live_sample(&self) -> Option<String> {
        self.conn.live_samples().try_pop()
    }

    pub fn events(&self) -> &std::sync::Arc<crate::dispatch::EventDispatcher<String>> {
        self.conn.events()
    }

    pub fn disconnect(self) {
        self.conn.disconnect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_zone_fields_splits_semicolon_and_comma() {
        let fields = parse_zone_fields(
            "TESTF:MAIN=12.5,1.2,2500,0.45,0.41;BACK=12.0,1.0,2400,0.40,0.39",
            "TESTF:",
        );
        assert_eq!(
            fields.get("MAIN").unwrap(),
            &vec!["12.5", "1.2", "2500", "0.45", "0.41"]
        );
        assert_eq!(
            fields.get("BACK").unwrap(),
            &vec!["12.0", "1.0", "2400", "0.40", "0.39"]
        );
    }
}
