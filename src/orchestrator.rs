//! Test Orchestrator (§4.8): expands a SKU `TestPlan` into a sequence of
//! batched `test_panel` calls, maps per-relay measurements back to board
//! positions, applies per-function limits, and reports progress. New
//! relative to the teacher (`pni-sdk` has no multi-step orchestration);
//! grounded on `NathanHowell/orin-nano-controller`'s orchestrator module
//! shape — a staged state machine driving a device through a bounded
//! sequence with progress percentages and a cooperative cancellation flag.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::{CoreError, OrchestratorError};
use crate::smt::{RelayMeasurement, SmtController};
use crate::config::ConnectConfig;

/// Acceptance limits for one function's measurement (§3 `TestPlan`).
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub voltage_min: f32,
    pub voltage_max: f32,
    pub current_min: f32,
    pub current_max: f32,
}

impl Limits {
    fn accepts(&self, m: &RelayMeasurement) -> bool {
        (self.voltage_min..=self.voltage_max).contains(&m.voltage_volts)
            && (self.current_min..=self.current_max).contains(&m.current_amps)
    }
}

/// One named operating condition (§GLOSSARY "Function"): the relays it
/// closes, how long it runs, the pause before the next function, and the
/// limits a measurement must fall within to pass.
#[derive(Debug, Clone)]
pub struct FunctionSpec {
    pub relay_indices: BTreeSet<u8>,
    /// How long the fixture holds this function's relays closed before it
    /// reports a measurement. Fed into `test_panel_with_dwell` as a floor
    /// on the wait (`max(base + per_relay×count, duration_ms)`) so a dwell
    /// longer than the usual per-relay budget can't be cut short.
    pub duration_ms: u64,
    pub delay_after_ms: u64,
    pub limits: Limits,
}

/// A SKU's full test plan (§3): functions in declared execution order, plus
/// the relay→board mapping used to assign each relay's measurement to a
/// physical board (§4.8c). A `Vec` rather than a `HashMap` for `functions`
/// because execution order is load-bearing (§3: "Functions execute in
/// declared order").
#[derive(Debug, Clone, Default)]
pub struct TestPlan {
    pub functions: Vec<(String, FunctionSpec)>,
    pub relay_to_board: HashMap<u8, u8>,
}

impl TestPlan {
    /// Validates every relay referenced by every function has a board
    /// mapping. A missing mapping is a logic error (§4.9): surfaced
    /// immediately, before any command is sent.
    fn validate(&self) -> Result<(), OrchestratorError> {
        for (name, spec) in &self.functions {
            for relay in &spec.relay_indices {
                if !self.relay_to_board.contains_key(relay) {
                    return Err(OrchestratorError::new(
                        name.clone(),
                        spec.relay_indices.iter().copied().collect(),
                        CoreError::Validation(format!(
                            "relay {} has no board mapping in the plan",
                            relay
                        )),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Why one board failed one function.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    NoMeasurement,
    OutOfLimits { measurement: RelayMeasurement },
}

#[derive(Debug, Clone)]
pub struct FunctionResult {
    pub measurement: Option<RelayMeasurement>,
    pub pass: bool,
    pub failure_reason: Option<FailureReason>,
}

/// `{board_index → {function_name → result}}` (§3 `PanelResult`).
#[derive(Debug, Clone, Default)]
pub struct PanelResult {
    pub boards: HashMap<u8, HashMap<String, FunctionResult>>,
}

impl PanelResult {
    fn record(&mut self, board: u8, function: &str, result: FunctionResult) {
        self.boards
            .entry(board)
            .or_default()
            .insert(function.to_string(), result);
    }

    /// A board passes iff every function recorded for it passed (§4.8.6).
    pub fn board_passed(&self, board: u8) -> bool {
        self.boards
            .get(&board)
            .map(|functions| functions.values().all(|r| r.pass))
            .unwrap_or(false)
    }

    /// Overall verdict: every board passes every function.
    pub fn all_passed(&self) -> bool {
        self.boards.keys().all(|&b| self.board_passed(b))
    }
}

/// Total, named states of one orchestration run (§4.8 "State machine").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Setup,
    PerFunction(usize),
    Analysis,
    Done,
    Failed,
    Cancelled,
}

/// Outcome of a completed (non-error) run: either the full analysis, or an
/// early cooperative cancellation.
#[derive(Debug, Clone)]
pub enum OrchestratorOutcome {
    Completed { result: PanelResult, passed: bool },
    Cancelled,
}

/// Plausible supply-rail envelope checked before any relay is energized
/// (§4.8 step 1).
const SUPPLY_VOLTAGE_MIN: f32 = 5.0;
const SUPPLY_VOLTAGE_MAX: f32 = 20.0;

/// Runs `plan` against `controller`, reporting monotone non-decreasing
/// progress percentages through `on_progress` and honoring `cancel` at
/// every step boundary and on entry to each function (§4.8). `all_off()` is
/// invoked on every exit path, including errors and cancellation,
/// idempotently.
pub fn run_panel_test(
    controller: &SmtController,
    plan: &TestPlan,
    config: &ConnectConfig,
    cancel: &AtomicBool,
    mut on_progress: impl FnMut(OrchestratorState, u8),
) -> Result<OrchestratorOutcome, OrchestratorError> {
    plan.validate()?;

    let mut state = OrchestratorState::Setup;
    on_progress(state, 0);

    let setup_err = |source: CoreError| OrchestratorError::new("setup", Vec::new(), source);

    let supply = controller.supply_voltage().map_err(setup_err)?;
    if !(SUPPLY_VOLTAGE_MIN..=SUPPLY_VOLTAGE_MAX).contains(&supply) {
        let _ = controller.all_off();
        return Err(setup_err(CoreError::Validation(format!(
            "supply rail {:.2}V outside plausible range [{}, {}]",
            supply, SUPPLY_VOLTAGE_MIN, SUPPLY_VOLTAGE_MAX
        ))));
    }
    on_progress(state, 20);

    if let Err(e) = controller.all_off() {
        return Err(setup_err(e));
    }
    on_progress(state, 40);

    let mut result = PanelResult::default();
    let total_functions = plan.functions.len().max(1);

    for (i, (name, spec)) in plan.functions.iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            let _ = controller.all_off();
            on_progress(OrchestratorState::Cancelled, 100);
            return Ok(OrchestratorOutcome::Cancelled);
        }

        state = OrchestratorState::PerFunction(i);

        let measurements = match controller.test_panel_with_dwell(
            &spec.relay_indices,
            config,
            spec.duration_ms,
        ) {
            Ok(m) => m,
            Err(e) => {
                let _ = controller.all_off();
                return Err(OrchestratorError::new(
                    name.clone(),
                    spec.relay_indices.iter().copied().collect(),
                    e,
                ));
            }
        };

        for relay in &spec.relay_indices {
            let board = plan.relay_to_board[relay];
            let function_result = match measurements.get(relay) {
                None => FunctionResult {
                    measurement: None,
                    pass: false,
                    failure_reason: Some(FailureReason::NoMeasurement),
                },
                Some(&m) if spec.limits.accepts(&m) => FunctionResult {
                    measurement: Some(m),
                    pass: true,
                    failure_reason: None,
                },
                Some(&m) => FunctionResult {
                    measurement: Some(m),
                    pass: false,
                    failure_reason: Some(FailureReason::OutOfLimits { measurement: m }),
                },
            };
            result.record(board, name, function_result);
        }

        let progress = 40 + ((i + 1) * 40 / total_functions) as u8;
        on_progress(state, progress.min(80));

        if cancel.load(Ordering::Relaxed) {
            let _ = controller.all_off();
            on_progress(OrchestratorState::Cancelled, 100);
            return Ok(OrchestratorOutcome::Cancelled);
        }
        if spec.delay_after_ms > 0 {
            thread::sleep(Duration::from_millis(spec.delay_after_ms));
        }
    }

    state = OrchestratorState::Analysis;
    on_progress(state, 80);

    if let Err(e) = controller.all_off() {
        return Err(OrchestratorError::new("analysis".to_string(), Vec::new(), e));
    }

    let passed = result.all_passed();
    on_progress(OrchestratorState::Done, 100);

    Ok(OrchestratorOutcome::Completed { result, passed })
}
