//! FFI helpers bridging `CaptureError` into Python exceptions with panic containment.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use capture_errors::{CaptureError, CaptureResult, ErrorCode, ErrorKind};
use pyo3::create_exception;
use pyo3::exceptions::PyException;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use crate::logging;

create_exception!(trial_warnings, PyCaptureError, PyException);
create_exception!(trial_warnings, PyUsageError, PyCaptureError);
create_exception!(trial_warnings, PyInvalidFilterTarget, PyUsageError);
create_exception!(trial_warnings, PyEnvironmentError, PyCaptureError);
create_exception!(trial_warnings, PyTargetError, PyCaptureError);
create_exception!(trial_warnings, PyInternalError, PyCaptureError);

/// Register the exception hierarchy into the Python module.
pub fn register_exceptions(module: &Bound<'_, PyModule>) -> PyResult<()> {
    let py = module.py();
    module.add("CaptureError", py.get_type::<PyCaptureError>())?;
    module.add("UsageError", py.get_type::<PyUsageError>())?;
    module.add("InvalidFilterTarget", py.get_type::<PyInvalidFilterTarget>())?;
    module.add("EnvironmentError", py.get_type::<PyEnvironmentError>())?;
    module.add("TargetError", py.get_type::<PyTargetError>())?;
    module.add("InternalError", py.get_type::<PyInternalError>())?;
    Ok(())
}

/// Execute `operation`, mapping any `CaptureError` into the Python exception
/// hierarchy and containing panics as `InternalError` instances.
pub fn dispatch<T, F>(label: &'static str, operation: F) -> PyResult<T>
where
    F: FnOnce() -> CaptureResult<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result.map_err(map_capture_error),
        Err(payload) => Err(handle_panic(label, payload)),
    }
}

/// Guard a `#[pyfunction]` body that already speaks `PyResult`, containing panics.
pub fn wrap_pyfunction<T, F>(label: &'static str, operation: F) -> PyResult<T>
where
    F: FnOnce() -> PyResult<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(payload) => Err(handle_panic(label, payload)),
    }
}

fn handle_panic(label: &'static str, payload: Box<dyn Any + Send>) -> PyErr {
    let message = panic_payload_to_string(payload.as_ref());
    logging::record_panic(label);
    map_capture_error(CaptureError::new(
        ErrorKind::Internal,
        ErrorCode::Unknown,
        format!("panic in {label}: {message}"),
    ))
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

/// Map a `CaptureError` into the matching Python exception subclass. The raised
/// instance carries `code`, `kind` and `context` attributes.
pub fn map_capture_error(err: CaptureError) -> PyErr {
    logging::log_capture_error("capture_error", &err);
    logging::emit_error_trailer(&err);

    let mut text = err.to_string();
    if let Some(source) = err.source_ref() {
        text.push_str(": caused by ");
        text.push_str(&source.to_string());
    }

    let pyerr = match (err.kind, err.code) {
        (_, ErrorCode::InvalidFilterTarget) => PyInvalidFilterTarget::new_err(text),
        (ErrorKind::Usage, _) => PyUsageError::new_err(text),
        (ErrorKind::Environment, _) => PyEnvironmentError::new_err(text),
        (ErrorKind::Target, _) => PyTargetError::new_err(text),
        _ => PyInternalError::new_err(text),
    };

    Python::with_gil(|py| {
        let instance = pyerr.value(py);
        let _ = instance.setattr("code", err.code.as_str());
        let _ = instance.setattr("kind", format!("{:?}", err.kind));
        let context = PyDict::new(py);
        for (key, value) in &err.context {
            let _ = context.set_item(*key, value);
        }
        let _ = instance.setattr("context", context);
    });

    pyerr
}
