use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use capture_errors::CaptureError;
use once_cell::sync::OnceCell;

use super::logger;

static JSON_ERRORS_ENABLED: AtomicBool = AtomicBool::new(false);
static ERROR_TRAILER_WRITER: OnceCell<Mutex<Box<dyn Write + Send>>> = OnceCell::new();

pub(crate) fn set_json_errors_enabled(enabled: bool) {
    JSON_ERRORS_ENABLED.store(enabled, Ordering::SeqCst);
}

/// Write a single-line JSON description of `err` when JSON errors are enabled.
pub fn emit_error_trailer(err: &CaptureError) {
    if !JSON_ERRORS_ENABLED.load(Ordering::SeqCst) {
        return;
    }
    let Some((run_id, test_id)) = logger::snapshot_run_and_test() else {
        return;
    };

    let context: serde_json::Map<String, serde_json::Value> = err
        .context
        .iter()
        .map(|(key, value)| ((*key).to_string(), serde_json::Value::String(value.clone())))
        .collect();

    let payload = serde_json::json!({
        "run_id": run_id,
        "test_id": test_id,
        "error_code": err.code.as_str(),
        "error_kind": format!("{:?}", err.kind),
        "message": err.message(),
        "context": context,
    });

    let Ok(mut bytes) = serde_json::to_vec(&payload) else {
        return;
    };
    bytes.push(b'\n');
    match ERROR_TRAILER_WRITER.get() {
        Some(writer) => {
            let mut guard = writer.lock().expect("error trailer writer lock");
            let _ = guard.write_all(&bytes);
            let _ = guard.flush();
        }
        None => {
            let mut stderr = io::stderr().lock();
            let _ = stderr.write_all(&bytes);
            let _ = stderr.flush();
        }
    }
}

#[cfg(test)]
pub fn set_error_trailer_writer_for_tests(writer: Box<dyn Write + Send>) {
    let _ = ERROR_TRAILER_WRITER.set(Mutex::new(writer));
}
