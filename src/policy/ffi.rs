//! PyO3 bindings exposing policy configuration to Python callers.

use super::env::configure_policy_from_env;
use super::model::{apply_policy_update, policy_snapshot, PolicyPath, PolicyUpdate};
use crate::ffi;
use capture_errors::{usage, ErrorCode};
use pyo3::prelude::*;
use pyo3::types::PyDict;

#[pyfunction(name = "configure_policy")]
#[pyo3(signature = (log_level=None, log_file=None, json_errors=None, scrub_registry=None, max_scrub_passes=None, replay_unflushed=None))]
pub fn configure_policy_py(
    log_level: Option<&str>,
    log_file: Option<&str>,
    json_errors: Option<bool>,
    scrub_registry: Option<bool>,
    max_scrub_passes: Option<usize>,
    replay_unflushed: Option<bool>,
) -> PyResult<()> {
    if max_scrub_passes == Some(0) {
        return Err(ffi::map_capture_error(usage!(
            ErrorCode::InvalidPolicyValue,
            "max_scrub_passes must be at least 1"
        )));
    }
    let update = PolicyUpdate {
        log_level: log_level.map(str::to_string),
        log_file: log_file.map(PolicyPath::from_raw),
        json_errors,
        scrub_registry,
        max_scrub_passes,
        replay_unflushed,
    };
    apply_policy_update(update);
    Ok(())
}

#[pyfunction(name = "configure_policy_from_env")]
pub fn py_configure_policy_from_env() -> PyResult<()> {
    configure_policy_from_env().map_err(ffi::map_capture_error)
}

#[pyfunction(name = "policy_snapshot")]
pub fn py_policy_snapshot(py: Python<'_>) -> PyResult<PyObject> {
    let snapshot = policy_snapshot();
    let dict = PyDict::new(py);
    dict.set_item("log_level", snapshot.log_level.as_deref())?;
    dict.set_item(
        "log_file",
        snapshot.log_file.as_ref().map(|p| p.display().to_string()),
    )?;
    dict.set_item("json_errors", snapshot.json_errors)?;
    dict.set_item("scrub_registry", snapshot.scrub_registry)?;
    dict.set_item("max_scrub_passes", snapshot.max_scrub_passes)?;
    dict.set_item("replay_unflushed", snapshot.replay_unflushed)?;
    Ok(dict.into_any().unbind())
}
