//! Concurrent execution of one run cell.
//!
//! A cell walks `PENDING → WARMUP → MEASURING → DONE | ABORTED`. Warm-up and
//! measured calls go through the same worker pool: call indices are dealt
//! round-robin to `concurrency` scoped threads which meet at a barrier before
//! their first call, then run their share sequentially. Completed calls go
//! into one shared buffer as they finish, so a worker that dies keeps the
//! rows it already produced. The buffer is ordered by completion instant
//! after the phase joins.
//!
//! A shared [`CancelToken`] stops the cell. It trips when a backend reports
//! `Unavailable`, when a call panics, or when the watchdog sees the cell
//! timeout expire. Workers check it before each call and discard a call that
//! returns after it tripped.

use std::any::Any;
use std::fmt;
use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Barrier;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::backend::{Backend, BackendError};
use crate::catalog::{ParamBounds, ParamKey, QueryDefinition};
use crate::model::{CallStatus, CellKey, CellRecord, CellState, Complexity, Measurement};
use crate::sampler::{ResourceAverage, ResourceSampler};

/// Why a cell stopped early.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AbortReason {
    /// The backend could not hand out a connection.
    BackendUnavailable(String),
    /// The cell ran past its time limit.
    Timeout(Duration),
    /// A worker thread panicked.
    WorkerPanicked(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::BackendUnavailable(message) => write!(f, "backend unavailable: {message}"),
            AbortReason::Timeout(limit) => write!(f, "cell timed out after {:.1}s", limit.as_secs_f64()),
            AbortReason::WorkerPanicked(message) => write!(f, "worker panicked: {message}"),
        }
    }
}

/// Cell-wide cancellation flag. The first reason recorded wins.
#[derive(Debug, Default)]
pub struct CancelToken {
    tripped: AtomicBool,
    reason: Mutex<Option<AbortReason>>,
}

impl CancelToken {
    /// A token that has not tripped.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips the token.
    pub fn cancel(&self, reason: AbortReason) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        self.tripped.store(true, Ordering::Release);
    }

    /// True once tripped.
    pub fn is_cancelled(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Reason of the first trip.
    pub fn reason(&self) -> Option<AbortReason> {
        self.reason.lock().clone()
    }
}

/// Everything needed to run one cell.
#[derive(Clone, Copy, Debug)]
pub struct CellSpec {
    /// Identity of the cell.
    pub key: CellKey,
    /// Catalog entry to run.
    pub query: &'static QueryDefinition,
    /// Calls per cell, warm-up included.
    pub repetitions: u32,
    /// Leading calls discarded as warm-up.
    pub warmups: u32,
    /// Sweep seed for parameter selection.
    pub seed: u64,
    /// Id ranges of the loaded dataset.
    pub bounds: ParamBounds,
    /// Cell time limit.
    pub timeout: Option<Duration>,
}

/// Outcome of one cell.
#[derive(Clone, Debug)]
pub struct CellReport {
    /// Identity of the cell.
    pub key: CellKey,
    /// Terminal state.
    pub state: CellState,
    /// Why the cell was aborted.
    pub abort_reason: Option<AbortReason>,
    /// Measurement rows in completion order.
    pub measurements: Vec<Measurement>,
    /// Measured calls that raised a query error.
    pub failed_calls: usize,
    /// Warm-up calls that raised a query error.
    pub warmup_failures: usize,
    /// Wall-clock of the measuring phase.
    pub measuring: Duration,
    /// Wall-clock of the whole cell.
    pub wall: Duration,
    /// Resource usage during the measuring phase.
    pub resources: ResourceAverage,
}

impl CellReport {
    /// Ledger row for the sink.
    pub fn record(&self) -> CellRecord {
        CellRecord {
            scale: self.key.scale,
            variant: self.key.variant,
            round: self.key.round,
            concurrency: self.key.concurrency,
            query_id: self.key.query_id,
            complexity: Complexity::of(self.key.query_id),
            state: self.state,
            abort_reason: self.abort_reason.as_ref().map(ToString::to_string),
            measured_rows: self.measurements.len(),
            failed_calls: self.failed_calls,
            warmup_failures: self.warmup_failures,
            wall_ms: self.wall.as_secs_f64() * 1_000.0,
        }
    }

    /// Report for a cell that never ran because its backend could not be set up.
    pub fn not_started(key: CellKey, reason: AbortReason) -> Self {
        Self {
            key,
            state: CellState::Aborted,
            abort_reason: Some(reason),
            measurements: Vec::new(),
            failed_calls: 0,
            warmup_failures: 0,
            measuring: Duration::ZERO,
            wall: Duration::ZERO,
            resources: ResourceAverage::default(),
        }
    }
}

#[derive(Debug)]
struct CallRecord {
    index: u32,
    completed_at: Instant,
    outcome: Result<f64, String>,
}

/// Runs one cell against `backend`, sampling resources while measuring.
pub fn run_cell(backend: &dyn Backend, spec: &CellSpec, sampler: &ResourceSampler) -> CellReport {
    let token = CancelToken::new();
    let (done, finished) = mpsc::channel::<()>();
    thread::scope(|scope| {
        if let Some(limit) = spec.timeout {
            let token = &token;
            scope.spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = finished.recv_timeout(limit) {
                    token.cancel(AbortReason::Timeout(limit));
                }
            });
        }
        let report = drive(backend, spec, sampler, &token);
        drop(done);
        report
    })
}

fn transition(key: &CellKey, state: &mut CellState, next: CellState) {
    debug!(cell = %key, from = ?*state, to = ?next, "cell state");
    *state = next;
}

fn drive(
    backend: &dyn Backend,
    spec: &CellSpec,
    sampler: &ResourceSampler,
    token: &CancelToken,
) -> CellReport {
    let key = spec.key;
    let cell_started = Instant::now();
    let mut state = CellState::Pending;

    transition(&key, &mut state, CellState::Warmup);
    let warmups = spec.warmups.min(spec.repetitions);
    let warm = run_phase(backend, spec, 0..warmups, token);
    let warmup_failures = warm.iter().filter(|call| call.outcome.is_err()).count();
    if token.is_cancelled() {
        transition(&key, &mut state, CellState::Aborted);
        let reason = token.reason();
        if let Some(reason) = &reason {
            warn!(cell = %key, %reason, "cell aborted during warm-up");
        }
        return CellReport {
            key,
            state,
            abort_reason: reason,
            measurements: Vec::new(),
            failed_calls: 0,
            warmup_failures,
            measuring: Duration::ZERO,
            wall: cell_started.elapsed(),
            resources: ResourceAverage::default(),
        };
    }

    transition(&key, &mut state, CellState::Measuring);
    let window = sampler.start();
    let measuring_started = Instant::now();
    let mut calls = run_phase(backend, spec, warmups..spec.repetitions, token);
    let measuring = measuring_started.elapsed();
    let resources = window.finish();
    calls.sort_by_key(|call| call.completed_at);

    let final_state = if token.is_cancelled() {
        CellState::Aborted
    } else {
        CellState::Done
    };
    transition(&key, &mut state, final_state);

    let completed = calls.len();
    let secs = measuring.as_secs_f64();
    let per_query_ms = (completed > 0).then(|| secs * 1_000.0 / completed as f64);
    let qps = (completed > 0 && secs > 0.0).then(|| completed as f64 / secs);

    let mut failed_calls = 0;
    let measurements: Vec<Measurement> = calls
        .into_iter()
        .map(|call| {
            let (duration_ms, status) = match call.outcome {
                Ok(ms) => (Some(ms), CallStatus::Ok),
                Err(message) => {
                    failed_calls += 1;
                    warn!(cell = %key, repetition = call.index, %message, "query failed");
                    (None, CallStatus::QueryError)
                }
            };
            Measurement {
                scale: key.scale,
                variant: key.variant,
                round: key.round,
                concurrency: key.concurrency,
                query_id: key.query_id,
                complexity: spec.query.complexity,
                repetition: call.index - warmups + 1,
                duration_ms,
                per_query_ms,
                qps,
                avg_cpu: resources.cpu_percent,
                avg_mem: resources.memory_mb,
                status,
                cell_state: final_state,
            }
        })
        .collect();

    let abort_reason = token.reason();
    if let Some(reason) = &abort_reason {
        warn!(cell = %key, %reason, kept = measurements.len(), "cell aborted");
    }

    CellReport {
        key,
        state: final_state,
        abort_reason,
        measurements,
        failed_calls,
        warmup_failures,
        measuring,
        wall: cell_started.elapsed(),
        resources,
    }
}

fn run_phase(
    backend: &dyn Backend,
    spec: &CellSpec,
    indices: Range<u32>,
    token: &CancelToken,
) -> Vec<CallRecord> {
    let calls = indices.len();
    if calls == 0 || token.is_cancelled() {
        return Vec::new();
    }
    let workers = spec.key.concurrency.clamp(1, calls);
    let barrier = Barrier::new(workers);
    let completed = Mutex::new(Vec::with_capacity(calls));

    thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let barrier = &barrier;
                let completed = &completed;
                let indices = indices.clone();
                scope.spawn(move || {
                    barrier.wait();
                    for index in indices.skip(worker).step_by(workers) {
                        if token.is_cancelled() {
                            break;
                        }
                        let params = spec.query.bind(
                            ParamKey {
                                seed: spec.seed,
                                scale: spec.key.scale,
                                variant: spec.key.variant,
                                query_id: spec.key.query_id,
                                repetition: index,
                            },
                            &spec.bounds,
                        );
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            backend.execute(spec.query, &params)
                        }));
                        let completed_at = Instant::now();
                        let result = match result {
                            Ok(result) => result,
                            Err(payload) => {
                                token.cancel(AbortReason::WorkerPanicked(panic_message(&*payload)));
                                break;
                            }
                        };
                        if token.is_cancelled() {
                            break;
                        }
                        let outcome = match result {
                            Ok(execution) => Ok(execution.elapsed_ms()),
                            Err(BackendError::QueryExecution(message)) => Err(message),
                            Err(BackendError::Unavailable(message)) => {
                                token.cancel(AbortReason::BackendUnavailable(message));
                                break;
                            }
                        };
                        completed.lock().push(CallRecord {
                            index,
                            completed_at,
                            outcome,
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            if let Err(payload) = handle.join() {
                token.cancel(AbortReason::WorkerPanicked(panic_message(&*payload)));
            }
        }
    });
    completed.into_inner()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
