//! Host-side reliable serial protocol core driving SMT relay-panel and
//! Offroad optical/pressure test fixtures: framing, checksum,
//! command/response multiplexing, device identification, and SMT test
//! orchestration. See the module-level docs below for the component
//! breakdown.

#[macro_use]
extern crate derive_more;

/// Error taxonomy surfaced by every other module (§7).
pub mod error;

/// Frame encoding/decoding and the XOR-8 checksum (§4.2).
pub mod frame;

/// Line Transport: owns one serial handle (§4.1).
pub mod transport;

/// Reader Task: drains the port, classifies frames, runs the pause/resume
/// protocol (§4.3).
pub mod reader;

/// Command Channel: synchronous request/response correlation (§4.4).
pub mod command_channel;

/// Event Dispatcher and the bounded LiveSample queue (§4.5).
pub mod dispatch;

/// Persisted device-identity cache (§6.4).
pub mod cache;

/// Device Identifier: port/baud probing and classification (§4.6).
pub mod identify;

/// Connection-time configuration.
pub mod config;

/// Shared connection plumbing used by both fixture families.
pub mod connection;

/// SMT Controller: batch relay test, supply voltage, button state (§4.7).
pub mod smt;

/// Offroad command surface (§6.6).
pub mod offroad;

/// Test Orchestrator: SKU plan expansion, limits, progress (§4.8).
pub mod orchestrator;

/// Multi-step scenario tests exercising the reader/command-channel/
/// controller/orchestrator stack together against a scripted device
/// simulator (§8).
#[cfg(test)]
mod scenario_tests;

pub use cache::DeviceCache;
pub use config::ConnectConfig;
pub use connection::{ButtonState, Connection};
pub use error::{CoreError, OrchestratorError};
pub use identify::{DeviceIdentity, DeviceKind};
pub use offroad::OffroadController;
pub use orchestrator::{
    run_panel_test, FailureReason, FunctionResult, FunctionSpec, Limits, OrchestratorOutcome,
    OrchestratorState, PanelResult, TestPlan,
};
pub use smt::{RelayMeasurement, SmtController};
