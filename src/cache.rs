//! Persisted device-identity cache (§6.4, §9): a small JSON file keyed by
//! port identifier, holding the last-seen device kind and firmware string
//! per port, used as a connect-time hint. Grounded on the serde-based
//! on-disk state used elsewhere in the pack (`lukeb-aidev-cohesix`,
//! `gawd-ai-sctl::server::config`) rather than a bespoke format.
//!
//! Realizes §9's "global singletons" note: the cache is explicit
//! process-wide state with documented init (loaded lazily on first use) and
//! teardown (process exit; each successful identification flushes
//! synchronously, so there is no separate close-time save).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::identify::DeviceIdentity;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntry {
    pub kind: crate::identify::DeviceKind,
    pub firmware_string: String,
    pub detected_baud: u32,
    pub timestamp: u64,
}

/// Default path for the persisted cache file, `device_cache.json` in the
/// current working directory (§6, "Persisted state").
pub fn default_cache_path() -> PathBuf {
    PathBuf::from("device_cache.json")
}

fn global_cache() -> &'static Mutex<HashMap<String, CachedEntry>> {
    static CACHE: OnceLock<Mutex<HashMap<String, CachedEntry>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Read-through handle onto the process-wide cache, backed by a JSON file
/// on disk. Corrupt or missing files are treated as an empty cache, never a
/// hard error (§6.4) — identification simply proceeds without a hint.
#[derive(Clone)]
pub struct DeviceCache {
    path: PathBuf,
}

impl DeviceCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn at_default_path() -> Self {
        Self::new(default_cache_path())
    }

    fn load_into_memory(&self) {
        let mut guard = global_cache().lock().unwrap();
        if !guard.is_empty() {
            return;
        }
        if let Ok(contents) = std::fs::read_to_string(&self.path) {
            if let Ok(parsed) = serde_json::from_str::<HashMap<String, CachedEntry>>(&contents) {
                *guard = parsed;
            }
        }
    }

    /// Returns the most recently recorded identity across all ports, used
    /// as the §4.6 step-1 "cached last-good port" hint.
    pub fn get_hint(&self) -> Option<DeviceIdentity> {
        self.load_into_memory();
        let guard = global_cache().lock().unwrap();
        guard
            .iter()
            .max_by_key(|(_, entry)| entry.timestamp)
            .map(|(port, entry)| DeviceIdentity {
                kind: entry.kind,
                firmware_string: entry.firmware_string.clone(),
                detected_baud: entry.detected_baud,
                port_identifier: port.clone(),
            })
    }

    /// Records a successful identification and flushes to disk
    /// synchronously.
    pub fn record(&self, identity: &DeviceIdentity) {
        self.load_into_memory();
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut guard = global_cache().lock().unwrap();
        guard.insert(
            identity.port_identifier.clone(),
            CachedEntry {
                kind: identity.kind,
                firmware_string: identity.firmware_string.clone(),
                detected_baud: identity.detected_baud,
                timestamp,
            },
        );
        self.flush(&guard);
    }

    fn flush(&self, guard: &HashMap<String, CachedEntry>) {
        if let Ok(json) = serde_json::to_string_pretty(guard) {
            if let Err(e) = std::fs::write(&self.path, json) {
                log::warn!("failed to write device cache at {:?}: {}", self.path, e);
            }
        }
    }
}

/// Test-only helper: clears the in-process cache so tests don't leak state
/// across each other (the cache is a `OnceLock`-backed singleton).
#[cfg(test)]
pub(crate) fn reset_for_test() {
    global_cache().lock().unwrap().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identify::DeviceKind;

    #[test]
    fn record_then_get_hint_round_trips() {
        reset_for_test();
        let dir = std::env::temp_dir().join(format!("devcache_test_{:?}", std::thread::current().id()));
        let cache = DeviceCache::new(dir.clone());

        let identity = DeviceIdentity {
            kind: DeviceKind::Smt,
            firmware_string: "DIODE_DYNAMICS_SMT_TESTER_V5".to_string(),
            detected_baud: 115_200,
            port_identifier: "A".to_string(),
        };
        cache.record(&identity);

        let hint = cache.get_hint().expect("expected a cached hint");
        assert_eq!(hint.port_identifier, "A");
        assert_eq!(hint.kind, DeviceKind::Smt);

        let _ = std::fs::remove_file(&dir);
    }

    #[test]
    fn missing_file_is_empty_cache_not_an_error() {
        reset_for_test();
        let cache = DeviceCache::new(Path::new("/nonexistent/device_cache.json").to_path_buf());
        assert!(cache.get_hint().is_none());
    }
}
