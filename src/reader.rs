//! Reader Task (§4.3): a single long-lived thread with two states, Running
//! and Paused, that continuously drains the port and classifies each frame
//! into the Command Channel's table, the Event Dispatcher, or the
//! LiveSample queue. Grounded on `sds011::read_thread`/`write_thread`
//! (dedicated thread owning the port, `std::sync::mpsc` out) and
//! `gawd-ai-sctl::server::modem::modem_thread`'s request/reply shape.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::command_channel::CommandTable;
use crate::dispatch::{BoundedQueue, EventDispatcher};
use crate::frame::{decode_line, Frame};
use crate::transport::{LineTransport, ReadOutcome};

/// Short per-iteration read timeout (§4.3: "repeatedly read_until('\n',
/// short_timeout)"). Bounds both stop-signal and pause-acknowledgement
/// latency to roughly this value.
pub const READER_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Counters updated with atomic operations, no lock (§5).
#[derive(Default)]
pub struct Metrics {
    pub checksum_mismatches: AtomicU64,
    pub unmatched_responses: AtomicU64,
}

struct PauseInner {
    count: u32,
    parked: bool,
}

/// Nested pause/resume coordination (§4.3). Every `pause()` call blocks
/// until the reader has acknowledged by parking; every `pause()` must be
/// matched by exactly one `resume()` on every exit path.
pub struct PauseState {
    state: Mutex<PauseInner>,
    cv: Condvar,
}

impl PauseState {
    fn new() -> Self {
        Self {
            state: Mutex::new(PauseInner {
                count: 0,
                parked: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Requests a pause, blocking until the reader has parked. Safe to call
    /// while another pause is already outstanding (nests).
    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        state.count += 1;
        while !state.parked {
            state = self.cv.wait(state).unwrap();
        }
    }

    /// Releases one pause request. When the nesting count returns to zero
    /// the reader is signaled to resume background reading.
    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        if state.count > 0 {
            state.count -= 1;
        }
        if state.count == 0 {
            self.cv.notify_all();
        }
    }

    fn is_paused(&self) -> bool {
        self.state.lock().unwrap().count > 0
    }

    /// Called by the reader at the top of each iteration: parks while a
    /// pause is outstanding, waking periodically to observe `stop`.
    fn wait_while_paused(&self, stop: &AtomicBool) {
        let mut state = self.state.lock().unwrap();
        if state.count == 0 {
            return;
        }
        state.parked = true;
        self.cv.notify_all();
        while state.count > 0 {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let (new_state, _) = self.cv.wait_timeout(state, READER_POLL_TIMEOUT).unwrap();
            state = new_state;
        }
        state.parked = false;
    }
}

/// Handle to the spawned reader thread and the shared state it drives.
pub struct ReaderHandle {
    pub pause: Arc<PauseState>,
    pub metrics: Arc<Metrics>,
    pub events: Arc<EventDispatcher<String>>,
    pub live_samples: Arc<BoundedQueue<String>>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ReaderHandle {
    /// Signals cooperative stop and waits for the thread to exit. The task
    /// must observe the stop signal within one read timeout (§3) and
    /// terminate within one additional timeout.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        self.pause.cv.notify_all();
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawns the reader thread. Events are published as their raw `EVENT:...`
/// payload string; live samples are enqueued as their raw `LIVE:...` payload
/// string. `command_table` is shared with the [`CommandChannel`](crate::command_channel::CommandChannel)
/// driving the same transport.
pub fn spawn_reader(transport: Arc<Mutex<LineTransport>>, command_table: Arc<CommandTable>) -> ReaderHandle {
    let pause = Arc::new(PauseState::new());
    let metrics = Arc::new(Metrics::default());
    let events = Arc::new(EventDispatcher::new(crate::dispatch::EVENT_QUEUE_CAPACITY));
    let live_samples = Arc::new(BoundedQueue::new(crate::dispatch::EVENT_QUEUE_CAPACITY));
    let stop = Arc::new(AtomicBool::new(false));

    let thread_pause = pause.clone();
    let thread_metrics = metrics.clone();
    let thread_events = events.clone();
    let thread_live = live_samples.clone();
    let thread_stop = stop.clone();

    let join = std::thread::Builder::new()
        .name("reader".to_string())
        .spawn(move || {
            run_reader_loop(
                transport,
                command_table,
                thread_pause,
                thread_metrics,
                thread_events,
                thread_live,
                thread_stop,
            )
        })
        .expect("failed to spawn reader thread");

    ReaderHandle {
        pause,
        metrics,
        events,
        live_samples,
        stop,
        join: Some(join),
    }
}

fn run_reader_loop(
    transport: Arc<Mutex<LineTransport>>,
    command_table: Arc<CommandTable>,
    pause: Arc<PauseState>,
    metrics: Arc<Metrics>,
    events: Arc<EventDispatcher<String>>,
    live_samples: Arc<BoundedQueue<String>>,
    stop: Arc<AtomicBool>,
) {
    log::debug!("reader thread started");

    while !stop.load(Ordering::Relaxed) {
        pause.wait_while_paused(&stop);
        if stop.load(Ordering::Relaxed) {
            break;
        }

        command_table.reap_expired();

        let deadline = Instant::now() + READER_POLL_TIMEOUT;
        let outcome = {
            let mut t = transport.lock().unwrap();
            t.read_until_deadline(deadline)
        };

        let line = match outcome {
            Ok(ReadOutcome::TimedOut) => continue,
            Ok(ReadOutcome::Line(line)) => line,
            Err(e) => {
                log::error!("reader thread transport lost: {}", e);
                command_table.fail_all();
                events.publish("TRANSPORT_LOST".to_string());
                break;
            }
        };

        if line.is_empty() {
            continue;
        }

        match decode_line(&line) {
            Frame::Response {
                payload, cmd_seq, ..
            } => {
                let delivered = match cmd_seq {
                    Some(seq) => command_table.complete_by_seq(seq, payload.clone()),
                    None => command_table.complete_oldest(payload.clone()),
                };
                if !delivered {
                    metrics.unmatched_responses.fetch_add(1, Ordering::Relaxed);
                    log::debug!("discarding response with no matching command slot: {}", payload);
                }
            }
            Frame::Event { payload, .. } => {
                events.publish(payload);
            }
            Frame::LiveSample { payload } => {
                live_samples.push(payload);
            }
            Frame::ChecksumMismatch { claimed, computed } => {
                metrics.checksum_mismatches.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "checksum mismatch: claimed {:02X}, computed {:02X}",
                    claimed,
                    computed
                );
                // A mismatched frame carries no usable cmd_seq (§4.2), so it
                // can only be correlated to the oldest in-flight slot, same
                // as a CMDSEQ-less response (§3, §9). `send_with_retry`
                // turns this into one bounded retry (§4.9, §7).
                if !command_table.complete_checksum_mismatch(claimed, computed) {
                    log::debug!("checksum mismatch with no command awaiting a response");
                }
            }
        }
    }

    log::debug!("reader thread exiting");
}
