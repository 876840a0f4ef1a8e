//! Diagnostics utilities: structured logging, metrics sinks, and error trailers.

mod logger;
mod metrics;
mod trailer;

pub use logger::{
    init_rust_logging_with_default, log_capture_error, set_active_test_id, with_error_code,
};
pub use metrics::{
    install_metrics, record_captured, record_flushed, record_panic, record_replayed,
    record_scrub, CaptureMetrics,
};
pub use trailer::emit_error_trailer;

#[cfg(test)]
pub use metrics::test_support;
#[cfg(test)]
pub use trailer::set_error_trailer_writer_for_tests;

use crate::policy::CapturePolicy;

pub fn apply_policy(policy: &CapturePolicy) {
    logger::apply_logger_policy(policy);
    trailer::set_json_errors_enabled(policy.json_errors);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ScrubReport;
    use capture_errors::{CaptureError, ErrorCode, ErrorKind};
    use once_cell::sync::OnceCell;
    use serde_json::Value;
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    fn ensure_logger() {
        init_rust_logging_with_default("trial_warnings=debug");
    }

    struct VecWriter {
        buf: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for VecWriter {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.buf.lock().expect("buffer lock").extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn structured_log_records_run_test_and_error_code() {
        let _lock = crate::test_support::python_lock();
        ensure_logger();
        let tmp = tempdir().expect("tempdir");
        let log_path = tmp.path().join("capture.log");

        let mut policy = CapturePolicy::default();
        policy.log_level = Some("debug".to_string());
        policy.log_file = Some(log_path.clone());
        apply_policy(&policy);
        set_active_test_id(Some("pkg.tests.Case.test_thing".to_string()));

        with_error_code(ErrorCode::OriginMismatch, || {
            log::error!(target: "trial_warnings::tests", "sample message");
        });

        log::logger().flush();
        set_active_test_id(None);

        let contents = std::fs::read_to_string(&log_path).expect("read log file");
        let line = contents.lines().last().expect("log line");
        let json: Value = serde_json::from_str(line).expect("valid json log");

        assert!(json.get("run_id").and_then(Value::as_str).is_some());
        assert_eq!(
            json.get("test_id").and_then(Value::as_str),
            Some("pkg.tests.Case.test_thing")
        );
        assert_eq!(
            json.get("error_code").and_then(Value::as_str),
            Some("ERR_ORIGIN_MISMATCH")
        );
        assert_eq!(
            json.get("message").and_then(Value::as_str),
            Some("sample message")
        );

        apply_policy(&CapturePolicy::default());
    }

    #[test]
    fn json_error_trailers_emit_payload() {
        let _lock = crate::test_support::python_lock();
        ensure_logger();
        static BUFFER: OnceCell<Arc<Mutex<Vec<u8>>>> = OnceCell::new();
        let buf = BUFFER.get_or_init(|| {
            let buffer = Arc::new(Mutex::new(Vec::new()));
            set_error_trailer_writer_for_tests(Box::new(VecWriter {
                buf: buffer.clone(),
            }));
            buffer
        });
        buf.lock().expect("buffer lock").clear();

        let mut policy = CapturePolicy::default();
        policy.json_errors = true;
        apply_policy(&policy);

        let err = CaptureError::new(
            ErrorKind::Usage,
            ErrorCode::InvalidFilterTarget,
            "None is not a function or method",
        )
        .with_context("index", "0".to_string());

        emit_error_trailer(&err);

        let data = buf.lock().expect("buffer lock").clone();
        let payload = String::from_utf8(data).expect("utf8");
        let line = payload.lines().last().expect("json line");
        let json: Value = serde_json::from_str(line).expect("valid trailer json");

        assert_eq!(
            json.get("error_code").and_then(Value::as_str),
            Some("ERR_INVALID_FILTER_TARGET")
        );
        assert_eq!(
            json.get("context")
                .and_then(|ctx| ctx.get("index"))
                .and_then(Value::as_str),
            Some("0")
        );

        policy.json_errors = false;
        apply_policy(&policy);
    }

    #[test]
    fn metrics_sink_records_events() {
        let _lock = crate::test_support::python_lock();
        let installed = test_support::install();
        let metrics = &installed.metrics;
        record_captured();
        record_flushed(3);
        record_replayed(2, 1);
        record_scrub(&ScrubReport {
            visited: 4,
            reset: 3,
            skipped: 1,
            failed: 0,
            passes: 1,
        });
        record_panic("flush");
        let events = metrics.take();
        use test_support::MetricEvent;
        assert!(events.contains(&MetricEvent::Captured));
        assert!(events.contains(&MetricEvent::Flushed(3)));
        assert!(events.contains(&MetricEvent::Replayed(2, 1)));
        assert!(events.contains(&MetricEvent::Scrubbed(3, 0)));
        assert!(events.contains(&MetricEvent::Panic("flush")));

        let detached = metrics.clone();
        drop(installed);
        record_captured();
        assert!(detached.take().is_empty());
    }
}
