//! Redirect `warnings.showwarning` to a local collector for the duration of
//! one call.
//!
//! Installed sinks form a LIFO stack. Each frame remembers the `showwarning`
//! hook and the filter list it replaced; releasing a frame restores exactly
//! that state, so nested captures unwind correctly. The stack lock is never
//! held while Python code runs.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use capture_errors::{enverr, CaptureError, CaptureResult, ErrorCode};
use pyo3::exceptions::PyTypeError;
use pyo3::prelude::*;
use pyo3::types::{PyAny, PyDict, PySlice, PyTuple};

use crate::buffer::TestWarnings;
use crate::ffi;
use crate::logging::{record_captured, with_error_code};
use crate::policy::policy_snapshot;
use crate::record::WarningRecord;
use crate::registry::scrub_sys_modules;

struct SinkFrame {
    token: u64,
    saved_show: PyObject,
    saved_filters: PyObject,
    thread: ThreadId,
}

static SINK_STACK: Mutex<Vec<SinkFrame>> = Mutex::new(Vec::new());
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

fn sink_stack() -> MutexGuard<'static, Vec<SinkFrame>> {
    SINK_STACK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Number of captures currently installed.
pub fn depth() -> usize {
    sink_stack().len()
}

/// Handle for one installed sink. Release it explicitly to observe restore
/// failures; dropping an unreleased guard restores and logs instead.
#[must_use = "dropping the guard immediately uninstalls the sink"]
pub struct SinkGuard {
    token: u64,
    released: bool,
}

impl SinkGuard {
    /// Install `observer` as `warnings.showwarning` with every warning forced
    /// through it (`simplefilter("always")`).
    pub fn push(py: Python<'_>, observer: &Bound<'_, PyAny>) -> CaptureResult<Self> {
        let install_failed = |err: PyErr| {
            enverr!(ErrorCode::SinkInstallFailed, "cannot install warning sink")
                .with_context("error", err.to_string())
        };
        let warnings = py.import("warnings").map_err(install_failed)?;
        let saved_show = warnings.getattr("showwarning").map_err(install_failed)?;
        let saved_filters = warnings
            .getattr("filters")
            .and_then(|filters| filters.call_method0("copy"))
            .map_err(install_failed)?;

        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        let frame = SinkFrame {
            token,
            saved_show: saved_show.unbind(),
            saved_filters: saved_filters.unbind(),
            thread: thread::current().id(),
        };

        let installed = warnings
            .call_method1("simplefilter", ("always",))
            .and_then(|_| warnings.setattr("showwarning", observer));
        if let Err(err) = installed {
            if let Err(restore_err) = restore_frame(py, &frame) {
                log::warn!(
                    target: "trial_warnings::interceptor",
                    "failed to roll back partial sink install: {restore_err}"
                );
            }
            return Err(install_failed(err));
        }

        sink_stack().push(frame);
        log::debug!(target: "trial_warnings::interceptor", "installed warning sink {token}");
        Ok(Self {
            token,
            released: false,
        })
    }

    /// Uninstall this sink, restoring the hook and filters it replaced.
    pub fn release(mut self, py: Python<'_>) -> CaptureResult<()> {
        self.released = true;
        release_token(py, self.token)
    }
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let token = self.token;
        Python::with_gil(|py| {
            if let Err(err) = release_token(py, token) {
                with_error_code(err.code, || {
                    log::error!(
                        target: "trial_warnings::interceptor",
                        "failed to restore warning sink {token} during unwind: {err}"
                    );
                });
            }
        });
    }
}

fn release_token(py: Python<'_>, token: u64) -> CaptureResult<()> {
    let frame = {
        let mut stack = sink_stack();
        let Some(index) = stack.iter().position(|frame| frame.token == token) else {
            with_error_code(ErrorCode::SinkStackCorrupted, || {
                log::warn!(
                    target: "trial_warnings::interceptor",
                    "warning sink {token} was already unwound by an outer capture"
                );
            });
            return Ok(());
        };
        if index + 1 != stack.len() {
            with_error_code(ErrorCode::SinkStackCorrupted, || {
                log::warn!(
                    target: "trial_warnings::interceptor",
                    "warning sink {token} released out of order; discarding {} inner frames",
                    stack.len() - index - 1
                );
            });
        }
        let mut popped = stack.split_off(index);
        popped.swap_remove(0)
    };
    if frame.thread != thread::current().id() {
        with_error_code(ErrorCode::SinkStackCorrupted, || {
            log::warn!(
                target: "trial_warnings::interceptor",
                "warning sink {token} released from a different thread than installed it"
            );
        });
    }
    restore_frame(py, &frame)?;
    log::debug!(target: "trial_warnings::interceptor", "restored warning sink {token}");
    Ok(())
}

fn restore_frame(py: Python<'_>, frame: &SinkFrame) -> CaptureResult<()> {
    let restore_failed = |err: PyErr| {
        enverr!(ErrorCode::SinkRestoreFailed, "cannot restore warning sink")
            .with_context("token", frame.token.to_string())
            .with_context("error", err.to_string())
    };
    let warnings = py.import("warnings").map_err(restore_failed)?;

    let filters = warnings
        .getattr("filters")
        .and_then(|filters| filters.set_item(PySlice::full(py), frame.saved_filters.bind(py)));
    if filters.is_ok() {
        // Bumps the filter version so cached per-site decisions are dropped.
        if let Ok(mutated) = warnings.getattr("_filters_mutated") {
            let _ = mutated.call0();
        }
    }
    let show = warnings.setattr("showwarning", frame.saved_show.bind(py));

    filters.and(show).map_err(restore_failed)
}

/// Where an observer delivers records.
pub enum Collector {
    /// A Python callable receiving each `WarningRecord`.
    Callable(PyObject),
    /// A per-test buffer.
    Buffer(Py<TestWarnings>),
}

/// Stand-in for `warnings.showwarning` while a capture is active.
#[pyclass(module = "trial_warnings", frozen)]
pub struct WarningObserver {
    collector: Collector,
    /// Set while this observer's Python collector is running.
    busy: AtomicBool,
}

impl WarningObserver {
    pub fn new(collector: Collector) -> Self {
        Self {
            collector,
            busy: AtomicBool::new(false),
        }
    }

    fn deliver(&self, py: Python<'_>, record: WarningRecord) -> PyResult<()> {
        match &self.collector {
            Collector::Buffer(buffer) => {
                buffer.get().push_record(Py::new(py, record)?);
                Ok(())
            }
            Collector::Callable(callback) => {
                // Only re-entry into this same collector is dropped. Captures the
                // collector starts itself install their own observer.
                if self.busy.swap(true, Ordering::AcqRel) {
                    log::debug!(
                        target: "trial_warnings::interceptor",
                        "dropping warning raised by the collector itself: {}",
                        record.message_str()
                    );
                    return Ok(());
                }
                let result = Py::new(py, record).and_then(|record| callback.call1(py, (record,)));
                self.busy.store(false, Ordering::Release);
                result.map(|_| ())
            }
        }
    }
}

#[pymethods]
impl WarningObserver {
    #[new]
    fn py_new(collector: Bound<'_, PyAny>) -> PyResult<Self> {
        if !collector.is_callable() {
            return Err(PyTypeError::new_err("collector must be callable"));
        }
        Ok(Self::new(Collector::Callable(collector.unbind())))
    }

    #[pyo3(signature = (message, category, filename, lineno, _file=None, _line=None))]
    #[allow(clippy::too_many_arguments)]
    fn __call__(
        &self,
        py: Python<'_>,
        message: Bound<'_, PyAny>,
        category: Bound<'_, PyAny>,
        filename: Bound<'_, PyAny>,
        lineno: Bound<'_, PyAny>,
        _file: Option<Bound<'_, PyAny>>,
        _line: Option<Bound<'_, PyAny>>,
    ) -> PyResult<()> {
        let record = WarningRecord::from_showwarning(&message, &category, &filename, &lineno)?;
        record_captured();
        self.deliver(py, record)
    }
}

/// Run `f(*args, **kwargs)` with every warning it emits routed to `collector`.
pub fn capture_call(
    py: Python<'_>,
    collector: Collector,
    f: &Bound<'_, PyAny>,
    args: &Bound<'_, PyTuple>,
    kwargs: Option<&Bound<'_, PyDict>>,
) -> PyResult<PyObject> {
    if policy_snapshot().scrub_registry {
        // Already logged; a failed scrub only risks missing cached warnings.
        let _ = scrub_sys_modules(py);
    }
    let observer = Bound::new(py, WarningObserver::new(collector))?;
    let guard = SinkGuard::push(py, observer.as_any()).map_err(ffi::map_capture_error)?;
    let result = f.call(args, kwargs);
    let restored = guard.release(py);
    finish_capture(result.map(Bound::unbind), restored)
}

fn finish_capture(
    result: PyResult<PyObject>,
    restored: Result<(), CaptureError>,
) -> PyResult<PyObject> {
    match (result, restored) {
        (result, Ok(())) => result,
        (Ok(_), Err(restore_err)) => Err(ffi::map_capture_error(restore_err)),
        (Err(call_err), Err(restore_err)) => {
            with_error_code(restore_err.code, || {
                log::error!(
                    target: "trial_warnings::interceptor",
                    "{restore_err} (superseded by the wrapped call's exception)"
                );
            });
            Err(call_err)
        }
    }
}

/// Call `f(*args, **kwargs)`, passing each warning it emits to `observer` as a
/// `WarningRecord` instead of the ambient sink. Returns `f`'s result.
#[pyfunction]
#[pyo3(signature = (observer, f, *args, **kwargs))]
pub fn collect_warnings(
    py: Python<'_>,
    observer: Bound<'_, PyAny>,
    f: Bound<'_, PyAny>,
    args: Bound<'_, PyTuple>,
    kwargs: Option<Bound<'_, PyDict>>,
) -> PyResult<PyObject> {
    ffi::wrap_pyfunction("collect_warnings", || {
        if !observer.is_callable() {
            return Err(PyTypeError::new_err("observer must be callable"));
        }
        capture_call(
            py,
            Collector::Callable(observer.unbind()),
            &f,
            &args,
            kwargs.as_ref(),
        )
    })
}

/// Number of nested captures currently active.
#[pyfunction]
pub fn capture_depth() -> usize {
    depth()
}
