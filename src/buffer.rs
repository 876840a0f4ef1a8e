//! Per-test warning buffer: capture, filtered drain, and end-of-test replay.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use capture_errors::{enverr, CaptureResult, ErrorCode};
use pyo3::prelude::*;
use pyo3::types::{PyAny, PyDict, PyTuple};

use crate::ffi;
use crate::interceptor::{capture_call, Collector};
use crate::line_range::LineRangeResolver;
use crate::logging::{record_flushed, record_replayed, set_active_test_id, with_error_code};
use crate::offending::{record_file, resolve_targets, OffendingFunction};
use crate::policy::policy_snapshot;
use crate::record::WarningRecord;

/// Warnings captured while one test runs, in capture order.
#[pyclass(module = "trial_warnings", frozen)]
pub struct TestWarnings {
    records: Mutex<Vec<Py<WarningRecord>>>,
    test_id: Option<String>,
    running: AtomicUsize,
}

/// Decrements the running count and restores the previous log test id.
struct RunScope<'a> {
    buffer: &'a TestWarnings,
    previous_test_id: Option<String>,
}

impl Drop for RunScope<'_> {
    fn drop(&mut self) {
        self.buffer.running.fetch_sub(1, Ordering::SeqCst);
        set_active_test_id(self.previous_test_id.take());
    }
}

impl TestWarnings {
    pub fn new(test_id: Option<String>) -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            test_id,
            running: AtomicUsize::new(0),
        }
    }

    fn records(&self) -> MutexGuard<'_, Vec<Py<WarningRecord>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push_record(&self, record: Py<WarningRecord>) {
        self.records().push(record);
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    fn enter_run(&self) -> RunScope<'_> {
        self.running.fetch_add(1, Ordering::SeqCst);
        RunScope {
            buffer: self,
            previous_test_id: set_active_test_id(self.test_id.clone()),
        }
    }

    /// Remove and return records. With `targets`, only records whose call
    /// site lies inside one of the targets are taken; every target is
    /// validated before the buffer is touched.
    pub fn drain(
        &self,
        py: Python<'_>,
        targets: Option<&[Bound<'_, PyAny>]>,
    ) -> CaptureResult<Vec<Py<WarningRecord>>> {
        let drained = match targets {
            None => std::mem::take(&mut *self.records()),
            Some(targets) => {
                let resolver = LineRangeResolver::new();
                let offending = resolve_targets(py, targets, &resolver)?;
                self.take_matching(&offending)
            }
        };
        record_flushed(drained.len());
        log::debug!(
            target: "trial_warnings::buffer",
            "flushed {} warnings, {} still pending",
            drained.len(),
            self.len()
        );
        Ok(drained)
    }

    fn take_matching(&self, offending: &[OffendingFunction]) -> Vec<Py<WarningRecord>> {
        let mut records = self.records();
        let (matched, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut *records)
                .into_iter()
                .partition(|record| {
                    let record = record.get();
                    record_file(record).is_some_and(|file| {
                        offending
                            .iter()
                            .any(|function| function.matches(&file, record.line()))
                    })
                });
        *records = kept;
        matched
    }

    /// Re-emit every unclaimed record through `warnings.warn_explicit` and
    /// return the exceptions those re-emissions raised, one per failure.
    pub fn replay(&self, py: Python<'_>) -> CaptureResult<Vec<PyObject>> {
        let pending = std::mem::take(&mut *self.records());
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        if !policy_snapshot().replay_unflushed {
            log::info!(
                target: "trial_warnings::buffer",
                "discarding {} unflushed warnings",
                pending.len()
            );
            return Ok(Vec::new());
        }

        let warn_explicit = py
            .import("warnings")
            .and_then(|warnings| warnings.getattr("warn_explicit"))
            .map_err(|err| {
                enverr!(ErrorCode::ReplayFailed, "warnings.warn_explicit is unavailable")
                    .with_context("error", err.to_string())
            })?;

        let mut raised = Vec::new();
        for record in &pending {
            let record = record.get();
            let emitted = warn_explicit.call1((
                record.message_str(),
                record.category_ref().bind(py),
                record.filename_str(),
                record.line(),
            ));
            if let Err(err) = emitted {
                with_error_code(ErrorCode::ReplayFailed, || {
                    log::debug!(
                        target: "trial_warnings::buffer",
                        "replaying {}:{} raised {err}",
                        record.filename_str(),
                        record.line()
                    );
                });
                raised.push(err.into_value(py).into_any());
            }
        }
        record_replayed(pending.len(), raised.len());
        Ok(raised)
    }
}

fn collect_targets<'py>(
    offending_functions: Option<&Bound<'py, PyAny>>,
) -> PyResult<Option<Vec<Bound<'py, PyAny>>>> {
    offending_functions
        .map(|targets| targets.try_iter()?.collect::<PyResult<Vec<_>>>())
        .transpose()
}

#[pymethods]
impl TestWarnings {
    #[new]
    #[pyo3(signature = (test_id=None))]
    fn py_new(test_id: Option<String>) -> Self {
        Self::new(test_id)
    }

    /// Call `f(*args, **kwargs)` capturing its warnings into this buffer.
    #[pyo3(signature = (f, *args, **kwargs))]
    fn run(
        slf: &Bound<'_, Self>,
        f: Bound<'_, PyAny>,
        args: Bound<'_, PyTuple>,
        kwargs: Option<Bound<'_, PyDict>>,
    ) -> PyResult<PyObject> {
        let py = slf.py();
        let buffer = slf.get();
        ffi::wrap_pyfunction("TestWarnings.run", || {
            let _scope = buffer.enter_run();
            capture_call(
                py,
                Collector::Buffer(slf.clone().unbind()),
                &f,
                &args,
                kwargs.as_ref(),
            )
        })
    }

    #[pyo3(signature = (offending_functions=None))]
    fn flush(
        &self,
        py: Python<'_>,
        offending_functions: Option<Bound<'_, PyAny>>,
    ) -> PyResult<Vec<Py<WarningRecord>>> {
        let targets = collect_targets(offending_functions.as_ref())?;
        ffi::dispatch("TestWarnings.flush", || self.drain(py, targets.as_deref()))
    }

    fn finish(&self, py: Python<'_>) -> PyResult<Vec<PyObject>> {
        ffi::dispatch("TestWarnings.finish", || self.replay(py))
    }

    fn pending(&self, py: Python<'_>) -> Vec<Py<WarningRecord>> {
        self.records()
            .iter()
            .map(|record| record.clone_ref(py))
            .collect()
    }

    fn __len__(&self) -> usize {
        self.len()
    }

    #[getter]
    fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst) > 0
    }

    #[getter]
    fn test_id(&self) -> Option<String> {
        self.test_id.clone()
    }

    fn __repr__(&self) -> String {
        format!(
            "TestWarnings(test_id={:?}, pending={})",
            self.test_id,
            self.len()
        )
    }
}

/// Drain `buffer`; see `TestWarnings.flush`.
#[pyfunction]
#[pyo3(signature = (buffer, offending_functions=None))]
pub fn flush_warnings(
    py: Python<'_>,
    buffer: &Bound<'_, TestWarnings>,
    offending_functions: Option<Bound<'_, PyAny>>,
) -> PyResult<Vec<Py<WarningRecord>>> {
    let targets = collect_targets(offending_functions.as_ref())?;
    ffi::dispatch("flush_warnings", || {
        buffer.get().drain(py, targets.as_deref())
    })
}
