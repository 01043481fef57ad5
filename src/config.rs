//! Connection configuration (§1.1 added, ambient stack): a plain struct
//! with `Default`, constructible programmatically by the embedding
//! application, matching the teacher's style of passing parameters as
//! plain structs (`AcqParams`-style) rather than a config-file framework.

use std::time::Duration;

use crate::cache::DeviceCache;
use crate::identify::{IdentifyConfig, PRIMARY_BAUD};

/// Connection-time parameters: candidate ports to probe, baud rates, and
/// the timeouts/retry bounds used once connected.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Candidate serial port identifiers, supplied by the embedding
    /// application's port enumeration (§6, "Environment & runtime").
    pub candidate_ports: Vec<String>,

    /// Baud rate used for the primary identification probe (§4.6).
    pub primary_baud: u32,

    /// Baud rates for other device types (e.g. scales at 9600), tried only
    /// if the primary-baud probe fails and the caller permits (§4.6).
    pub fallback_bauds: Vec<u32>,

    /// Base timeout for commands that do not energize relays (`X`, `V`,
    /// `B`, `RESET_SEQ`).
    pub base_command_timeout: Duration,

    /// Suggested base timeout contribution for `test_panel`'s batched
    /// relay command (§4.7: "suggested base = 2s").
    pub test_panel_base_timeout: Duration,

    /// Suggested per-relay timeout contribution for `test_panel`
    /// (§4.7: "suggested per_relay = 200ms").
    pub test_panel_per_relay_timeout: Duration,

    /// Path to the persisted device-identity cache (§6.4).
    pub cache_path: std::path::PathBuf,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            candidate_ports: Vec::new(),
            primary_baud: PRIMARY_BAUD,
            fallback_bauds: vec![9600],
            base_command_timeout: Duration::from_secs(2),
            test_panel_base_timeout: Duration::from_secs(2),
            test_panel_per_relay_timeout: Duration::from_millis(200),
            cache_path: crate::cache::default_cache_path(),
        }
    }
}

impl ConnectConfig {
    pub fn new(candidate_ports: Vec<String>) -> Self {
        Self {
            candidate_ports,
            ..Self::default()
        }
    }

    /// Builds the [`IdentifyConfig`] the Device Identifier (§4.6) consumes
    /// from this connection configuration.
    pub fn identify_config(&self) -> IdentifyConfig {
        IdentifyConfig {
            candidate_ports: self.candidate_ports.clone(),
            fallback_bauds: self.fallback_bauds.clone(),
            cache: DeviceCache::new(self.cache_path.clone()),
        }
    }

    /// `base + per_relay * count`, the suggested `test_panel` timeout
    /// formula from §4.7.
    pub fn test_panel_timeout(&self, relay_count: usize) -> Duration {
        self.test_panel_base_timeout + self.test_panel_per_relay_timeout * relay_count as u32
    }
}
