//! Reset per-module warning dedup caches (`__warningregistry__`).
//!
//! The walk is a work queue over key snapshots: entries whose attribute setter
//! inserts new keys are tolerated, and the inserted keys are processed on a
//! later pass. Individual entries never abort the scan.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use capture_errors::{enverr, CaptureResult, ErrorCode};
use pyo3::prelude::*;
use pyo3::types::{PyAny, PyDict};

use crate::logging::{record_scrub, with_error_code};
use crate::policy::policy_snapshot;

const REGISTRY_ATTR: &str = "__warningregistry__";

/// Counters describing one scrub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrubReport {
    /// Keys looked at, across all passes.
    pub visited: usize,
    /// Entries whose cache attribute was set to `None`.
    pub reset: usize,
    /// Keys that vanished or mapped to `None`.
    pub skipped: usize,
    /// Entries that refused the attribute.
    pub failed: usize,
    pub passes: usize,
}

/// Outcome of resetting a single entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetOutcome {
    Reset,
    Skipped,
    Failed(String),
}

/// A value stored in the module registry.
pub trait ModuleLike {
    fn try_reset_registry(&self) -> ResetOutcome;
}

/// A mapping of module keys to module-like values that may change while it is
/// being walked.
pub trait ModuleRegistry {
    type Key: Eq + Hash + Clone;
    type Entry: ModuleLike;

    /// Snapshot of the keys present right now.
    fn keys(&self) -> CaptureResult<Vec<Self::Key>>;

    /// Current value for `key`, or `None` when it has been removed.
    fn get(&self, key: &Self::Key) -> Option<Self::Entry>;
}

/// Reset the dedup cache of every entry in `registry`, including entries that
/// appear while the walk is running, for at most `max_passes` passes.
pub fn scrub<R: ModuleRegistry>(registry: &R, max_passes: usize) -> CaptureResult<ScrubReport> {
    let max_passes = max_passes.max(1);
    let mut report = ScrubReport::default();
    let mut seen: HashSet<R::Key> = HashSet::new();
    let mut pending = unseen_keys(registry, &mut seen)?;

    while !pending.is_empty() {
        if report.passes == max_passes {
            log::warn!(
                target: "trial_warnings::registry",
                "registry still growing after {max_passes} passes; {} entries left unscrubbed",
                pending.len()
            );
            break;
        }
        report.passes += 1;
        for key in pending {
            report.visited += 1;
            let Some(entry) = registry.get(&key) else {
                report.skipped += 1;
                continue;
            };
            match entry.try_reset_registry() {
                ResetOutcome::Reset => report.reset += 1,
                ResetOutcome::Skipped => report.skipped += 1,
                ResetOutcome::Failed(reason) => {
                    report.failed += 1;
                    log::debug!(
                        target: "trial_warnings::registry",
                        "could not reset {REGISTRY_ATTR}: {reason}"
                    );
                }
            }
        }
        pending = unseen_keys(registry, &mut seen)?;
    }
    Ok(report)
}

fn unseen_keys<R: ModuleRegistry>(
    registry: &R,
    seen: &mut HashSet<R::Key>,
) -> CaptureResult<Vec<R::Key>> {
    Ok(registry
        .keys()?
        .into_iter()
        .filter(|key| seen.insert(key.clone()))
        .collect())
}

/// Registry key compared by object identity. Holding the object keeps its
/// address from being reused while the scrub runs.
#[derive(Clone)]
pub struct IdentityKey<'py> {
    object: Bound<'py, PyAny>,
}

impl PartialEq for IdentityKey<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.object.as_ptr() == other.object.as_ptr()
    }
}

impl Eq for IdentityKey<'_> {}

impl Hash for IdentityKey<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.object.as_ptr() as usize).hash(state);
    }
}

/// Any Python mapping, normally `sys.modules`.
pub struct PyModuleRegistry<'py> {
    mapping: Bound<'py, PyAny>,
}

impl<'py> PyModuleRegistry<'py> {
    pub fn new(mapping: Bound<'py, PyAny>) -> Self {
        Self { mapping }
    }

    pub fn sys_modules(py: Python<'py>) -> PyResult<Self> {
        Ok(Self::new(py.import("sys")?.getattr("modules")?))
    }
}

pub struct PyModuleEntry<'py> {
    value: Bound<'py, PyAny>,
}

impl ModuleLike for PyModuleEntry<'_> {
    fn try_reset_registry(&self) -> ResetOutcome {
        if self.value.is_none() {
            return ResetOutcome::Skipped;
        }
        match self.value.setattr(REGISTRY_ATTR, self.value.py().None()) {
            Ok(()) => ResetOutcome::Reset,
            Err(err) => ResetOutcome::Failed(err.to_string()),
        }
    }
}

impl<'py> ModuleRegistry for PyModuleRegistry<'py> {
    type Key = IdentityKey<'py>;
    type Entry = PyModuleEntry<'py>;

    fn keys(&self) -> CaptureResult<Vec<Self::Key>> {
        let snapshot = (|| -> PyResult<Vec<Self::Key>> {
            // Materialise before any setter can run.
            self.mapping
                .call_method0("keys")?
                .try_iter()?
                .map(|object| object.map(|object| IdentityKey { object }))
                .collect()
        })();
        snapshot.map_err(|err| {
            enverr!(ErrorCode::RegistryScanFailed, "cannot enumerate module registry keys")
                .with_context("error", err.to_string())
        })
    }

    fn get(&self, key: &Self::Key) -> Option<Self::Entry> {
        match self.mapping.get_item(&key.object) {
            Ok(value) => Some(PyModuleEntry { value }),
            Err(err) => {
                if !err.is_instance_of::<pyo3::exceptions::PyKeyError>(self.mapping.py()) {
                    log::debug!(
                        target: "trial_warnings::registry",
                        "registry lookup failed: {err}"
                    );
                }
                None
            }
        }
    }
}

/// Scrub `sys.modules` using the active policy's pass limit.
pub fn scrub_sys_modules(py: Python<'_>) -> CaptureResult<ScrubReport> {
    let registry = PyModuleRegistry::sys_modules(py).map_err(|err| {
        enverr!(ErrorCode::RegistryScanFailed, "sys.modules is unavailable")
            .with_context("error", err.to_string())
    })?;
    scrub_and_record(&registry)
}

fn scrub_and_record(registry: &PyModuleRegistry<'_>) -> CaptureResult<ScrubReport> {
    let report = scrub(registry, policy_snapshot().max_scrub_passes)
        .inspect_err(|err| {
            with_error_code(err.code, || {
                log::warn!(target: "trial_warnings::registry", "{err}");
            })
        })?;
    record_scrub(&report);
    log::debug!(
        target: "trial_warnings::registry",
        "scrubbed {} entries ({} reset, {} skipped, {} failed) in {} passes",
        report.visited,
        report.reset,
        report.skipped,
        report.failed,
        report.passes
    );
    Ok(report)
}

fn report_to_dict<'py>(py: Python<'py>, report: &ScrubReport) -> PyResult<Bound<'py, PyDict>> {
    let dict = PyDict::new(py);
    dict.set_item("visited", report.visited)?;
    dict.set_item("reset", report.reset)?;
    dict.set_item("skipped", report.skipped)?;
    dict.set_item("failed", report.failed)?;
    dict.set_item("passes", report.passes)?;
    Ok(dict)
}

/// Set `__warningregistry__` to `None` on every value of `modules`
/// (default `sys.modules`).
#[pyfunction]
#[pyo3(signature = (modules=None))]
pub fn set_warning_registry_to_none<'py>(
    py: Python<'py>,
    modules: Option<Bound<'py, PyAny>>,
) -> PyResult<Bound<'py, PyDict>> {
    let report = crate::ffi::dispatch("set_warning_registry_to_none", || match modules {
        Some(mapping) => scrub_and_record(&PyModuleRegistry::new(mapping)),
        None => scrub_sys_modules(py),
    })?;
    report_to_dict(py, &report)
}
