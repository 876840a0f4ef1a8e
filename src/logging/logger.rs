use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, Once, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use capture_errors::{CaptureError, ErrorCode};
use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;
use serde::Serialize;
use uuid::Uuid;

use crate::policy::CapturePolicy;

thread_local! {
    static ERROR_CODE_OVERRIDE: Cell<Option<ErrorCode>> = const { Cell::new(None) };
}

static LOGGER_INSTANCE: OnceCell<&'static CaptureLogger> = OnceCell::new();
static INIT_LOGGER: Once = Once::new();

/// Install the JSON-lines logger once per process. `RUST_LOG` wins over
/// `default_filter` when it parses.
pub fn init_rust_logging_with_default(default_filter: &str) {
    INIT_LOGGER.call_once(|| {
        let default_directives = Directives::parse(default_filter, LevelFilter::Warn)
            .unwrap_or_else(|_| Directives::new(LevelFilter::Warn));
        let initial = std::env::var("RUST_LOG")
            .ok()
            .and_then(|spec| Directives::parse(&spec, default_directives.fallback).ok())
            .unwrap_or_else(|| default_directives.clone());

        let logger: &'static CaptureLogger =
            Box::leak(Box::new(CaptureLogger::new(default_directives, initial)));
        if log::set_logger(logger).is_err() {
            // Someone else owns the global logger; keep ours reachable for policy updates.
            let _ = LOGGER_INSTANCE.set(logger);
            return;
        }
        log::set_max_level(logger.max_level());
        let _ = LOGGER_INSTANCE.set(logger);
    });
}

pub(crate) fn apply_logger_policy(policy: &CapturePolicy) {
    if let Some(logger) = LOGGER_INSTANCE.get() {
        logger.apply_policy(policy);
    }
}

/// Run `op` with `code` attached to every log line it emits on this thread.
pub fn with_error_code<F, R>(code: ErrorCode, op: F) -> R
where
    F: FnOnce() -> R,
{
    ERROR_CODE_OVERRIDE.with(|cell| {
        let previous = cell.replace(Some(code));
        let result = op();
        cell.set(previous);
        result
    })
}

/// Tag subsequent log lines with the id of the running test. Returns the id
/// that was active before.
pub fn set_active_test_id(test_id: Option<String>) -> Option<String> {
    let logger = LOGGER_INSTANCE.get()?;
    let mut slot = logger
        .test_id
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    std::mem::replace(&mut *slot, test_id)
}

pub fn log_capture_error(label: &str, err: &CaptureError) {
    with_error_code(err.code, || {
        log::error!(target: "trial_warnings::errors", "{label}: {err}");
    });
}

pub(crate) fn snapshot_run_and_test() -> Option<(String, Option<String>)> {
    LOGGER_INSTANCE
        .get()
        .map(|logger| (logger.run_id.clone(), logger.snapshot_test_id()))
}

struct CaptureLogger {
    run_id: String,
    test_id: RwLock<Option<String>>,
    defaults: Directives,
    directives: RwLock<Directives>,
    destination: Mutex<Destination>,
}

impl CaptureLogger {
    fn new(defaults: Directives, initial: Directives) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            test_id: RwLock::new(None),
            defaults,
            directives: RwLock::new(initial),
            destination: Mutex::new(Destination::Stderr),
        }
    }

    fn max_level(&self) -> LevelFilter {
        self.directives.read().expect("directives lock").max_level()
    }

    fn apply_policy(&self, policy: &CapturePolicy) {
        let directives = match policy.log_level.as_deref().map(str::trim) {
            Some(spec) if !spec.is_empty() => Directives::parse(spec, self.defaults.fallback)
                .unwrap_or_else(|_| {
                    with_error_code(ErrorCode::InvalidPolicyValue, || {
                        log::warn!(
                            target: "trial_warnings::logging",
                            "invalid log level filter '{spec}'; reverting to default"
                        );
                    });
                    self.defaults.clone()
                }),
            _ => self.defaults.clone(),
        };
        let max = directives.max_level();
        *self.directives.write().expect("directives lock") = directives;
        log::set_max_level(max);

        let destination = match policy.log_file.as_deref() {
            None => Destination::Stderr,
            Some(path) => match open_log_file(path) {
                Ok(file) => Destination::File(file),
                Err(err) => {
                    with_error_code(ErrorCode::Io, || {
                        log::warn!(
                            target: "trial_warnings::logging",
                            "failed to open log file '{}': {}",
                            path.display(),
                            err
                        );
                    });
                    Destination::Stderr
                }
            },
        };
        *self.destination.lock().expect("destination lock") = destination;
    }

    fn snapshot_test_id(&self) -> Option<String> {
        self.test_id.read().expect("test id lock").clone()
    }

    fn write_line(&self, entry: &LogLine<'_>) {
        let mut bytes = match serde_json::to_vec(entry) {
            Ok(bytes) => bytes,
            Err(_) => format!(
                "{{\"run_id\":\"{}\",\"message\":\"failed to encode log entry\"}}",
                self.run_id
            )
            .into_bytes(),
        };
        bytes.push(b'\n');
        let result = self
            .destination
            .lock()
            .expect("destination lock")
            .write_all(&bytes);
        if let Err(err) = result {
            let mut stderr = io::stderr().lock();
            let _ = stderr.write_all(&bytes);
            let _ = writeln!(
                stderr,
                "{{\"run_id\":\"{}\",\"message\":\"logger write failure: {}\"}}",
                self.run_id, err
            );
        }
    }
}

impl Log for CaptureLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        self.directives
            .read()
            .expect("directives lock")
            .allows(metadata.target(), metadata.level().to_level_filter())
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let error_code = ERROR_CODE_OVERRIDE.with(|cell| cell.get());
        let test_id = self.snapshot_test_id();
        let line = LogLine {
            ts_micros: timestamp_micros(),
            level: record.level().as_str(),
            target: record.target(),
            run_id: &self.run_id,
            test_id: test_id.as_deref(),
            message: record.args().to_string(),
            error_code: error_code.map(|code| code.as_str()),
            file: record.file(),
            line: record.line(),
        };
        self.write_line(&line);
    }

    fn flush(&self) {
        let _ = self.destination.lock().expect("destination lock").flush();
    }
}

/// `RUST_LOG`-style directives: a fallback level plus `target=level` overrides.
#[derive(Clone, Debug)]
struct Directives {
    fallback: LevelFilter,
    targets: Vec<(String, LevelFilter)>,
}

impl Directives {
    fn new(fallback: LevelFilter) -> Self {
        Self {
            fallback,
            targets: Vec::new(),
        }
    }

    fn parse(spec: &str, fallback: LevelFilter) -> Result<Self, ()> {
        let mut directives = Self::new(fallback);
        for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('=') {
                Some((target, level)) => {
                    let level = LevelFilter::from_str(level.trim()).map_err(|_| ())?;
                    directives.targets.push((target.trim().to_string(), level));
                }
                None => directives.fallback = LevelFilter::from_str(part).map_err(|_| ())?,
            }
        }
        Ok(directives)
    }

    /// Longest matching target prefix (on `::` boundaries) decides.
    fn allows(&self, target: &str, level: LevelFilter) -> bool {
        let allowed = self
            .targets
            .iter()
            .filter(|(prefix, _)| {
                target == prefix
                    || target
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with("::"))
            })
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, lvl)| *lvl)
            .unwrap_or(self.fallback);
        allowed >= level
    }

    fn max_level(&self) -> LevelFilter {
        self.targets
            .iter()
            .map(|(_, lvl)| *lvl)
            .fold(self.fallback, |acc, lvl| acc.max(lvl))
    }
}

#[derive(Serialize)]
struct LogLine<'a> {
    ts_micros: u128,
    level: &'a str,
    target: &'a str,
    run_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    test_id: Option<&'a str>,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<u32>,
}

fn timestamp_micros() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros())
        .unwrap_or(0)
}

enum Destination {
    Stderr,
    File(File),
}

impl Destination {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Destination::Stderr => {
                let mut stderr = io::stderr().lock();
                stderr.write_all(bytes)?;
                stderr.flush()
            }
            Destination::File(file) => {
                file.write_all(bytes)?;
                file.flush()
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Destination::Stderr => io::stderr().lock().flush(),
            Destination::File(file) => file.flush(),
        }
    }
}

fn open_log_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}
