//! Per-test warning capture for Python test runners, backed by PyO3.
//!
//! Warnings emitted while a test body runs are redirected into a
//! [`buffer::TestWarnings`] instead of the ambient `warnings` sink. Tests
//! drain them with `flush`, optionally restricted to warnings whose call site
//! lies inside given functions; anything left unclaimed is re-emitted when the
//! test finishes so warnings-as-errors still applies.

pub mod buffer;
pub mod ffi;
pub mod interceptor;
pub mod line_range;
pub mod logging;
pub mod module_identity;
pub mod offending;
pub mod policy;
pub mod record;
pub mod registry;

pub use crate::buffer::{flush_warnings, TestWarnings};
pub use crate::interceptor::{capture_depth, collect_warnings, Collector, SinkGuard, WarningObserver};
pub use crate::line_range::{LineRangeResolver, LineSet, LineTable};
pub use crate::offending::function_lines;
pub use crate::policy::{policy_snapshot, CapturePolicy};
pub use crate::record::WarningRecord;
pub use crate::registry::{scrub, set_warning_registry_to_none, ModuleLike, ModuleRegistry, ScrubReport};

use pyo3::prelude::*;

/// Register every class, function and exception on `m`.
pub fn populate_module(m: &Bound<'_, PyModule>) -> PyResult<()> {
    ffi::register_exceptions(m)?;
    m.add_class::<WarningRecord>()?;
    m.add_class::<TestWarnings>()?;
    m.add_class::<WarningObserver>()?;
    m.add_function(wrap_pyfunction!(collect_warnings, m)?)?;
    m.add_function(wrap_pyfunction!(set_warning_registry_to_none, m)?)?;
    m.add_function(wrap_pyfunction!(flush_warnings, m)?)?;
    m.add_function(wrap_pyfunction!(function_lines, m)?)?;
    m.add_function(wrap_pyfunction!(capture_depth, m)?)?;
    m.add_function(wrap_pyfunction!(policy::configure_policy_py, m)?)?;
    m.add_function(wrap_pyfunction!(policy::py_configure_policy_from_env, m)?)?;
    m.add_function(wrap_pyfunction!(policy::py_policy_snapshot, m)?)?;
    Ok(())
}

#[pymodule]
fn trial_warnings(m: &Bound<'_, PyModule>) -> PyResult<()> {
    // Respect RUST_LOG if present; otherwise only warnings from this crate.
    logging::init_rust_logging_with_default("trial_warnings=warn");
    populate_module(m)
}
