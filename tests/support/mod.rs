//! Shared fixtures for integration tests driving an embedded interpreter.

#![allow(dead_code)]

use std::ffi::CString;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use pyo3::prelude::*;

static PYTHON_LOCK: Mutex<()> = Mutex::new(());

/// Tests share one interpreter and its `warnings` state; run them one at a time.
pub fn python_lock() -> MutexGuard<'static, ()> {
    PYTHON_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Make `import trial_warnings` resolve to this crate's module.
pub fn install_module(py: Python<'_>) {
    let modules = py.import("sys").unwrap().getattr("modules").unwrap();
    if modules.contains("trial_warnings").unwrap() {
        return;
    }
    let module = PyModule::new(py, "trial_warnings").expect("module object");
    trial_warnings::populate_module(&module).expect("populate module");
    modules.set_item("trial_warnings", module).unwrap();
}

/// Execute `source` as module `name` whose file is `file`; its top-level
/// `assert`s are the test. The module is removed from `sys.modules` afterwards.
pub fn run_fixture(py: Python<'_>, name: &str, file: &Path, source: &str) {
    install_module(py);
    let code = CString::new(source).expect("source");
    let file_name = CString::new(file.to_string_lossy().as_ref()).expect("file name");
    let module_name = CString::new(name).expect("module name");
    let result = PyModule::from_code(py, &code, &file_name, &module_name);
    let _ = py
        .import("sys")
        .unwrap()
        .getattr("modules")
        .unwrap()
        .del_item(name);
    if let Err(err) = result {
        err.print(py);
        panic!("fixture {name} failed: {err}");
    }
}

/// Run a fixture whose file lives in a fresh temporary directory.
pub fn run_in_tempdir(name: &str, source: &str) {
    let _lock = python_lock();
    let tmp = tempfile::tempdir().expect("tempdir");
    let file = tmp.path().join(format!("{name}.py"));
    Python::with_gil(|py| run_fixture(py, name, &file, source));
}
