//! Policy data structures and in-memory management.

use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::RwLock;

/// Upper bound on registry re-scans when setters keep inserting modules.
pub const DEFAULT_MAX_SCRUB_PASSES: usize = 8;

static POLICY: OnceCell<RwLock<CapturePolicy>> = OnceCell::new();

fn policy_cell() -> &'static RwLock<CapturePolicy> {
    POLICY.get_or_init(|| RwLock::new(CapturePolicy::default()))
}

/// Process-wide capture configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturePolicy {
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub json_errors: bool,
    /// Reset `__warningregistry__` across `sys.modules` before each capture.
    pub scrub_registry: bool,
    pub max_scrub_passes: usize,
    /// Re-emit unclaimed records when a test finishes instead of discarding them.
    pub replay_unflushed: bool,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self {
            log_level: None,
            log_file: None,
            json_errors: false,
            scrub_registry: true,
            max_scrub_passes: DEFAULT_MAX_SCRUB_PASSES,
            replay_unflushed: true,
        }
    }
}

impl CapturePolicy {
    pub(crate) fn apply_update(&mut self, update: PolicyUpdate) {
        if let Some(level) = update.log_level {
            self.log_level = match level.trim() {
                "" => None,
                other => Some(other.to_string()),
            };
        }
        if let Some(path) = update.log_file {
            self.log_file = match path {
                PolicyPath::Clear => None,
                PolicyPath::Value(path) => Some(path),
            };
        }
        if let Some(json_errors) = update.json_errors {
            self.json_errors = json_errors;
        }
        if let Some(scrub) = update.scrub_registry {
            self.scrub_registry = scrub;
        }
        if let Some(passes) = update.max_scrub_passes {
            // A scrub always makes at least its first pass.
            self.max_scrub_passes = passes.max(1);
        }
        if let Some(replay) = update.replay_unflushed {
            self.replay_unflushed = replay;
        }
    }
}

/// Internal helper representing path updates.
#[derive(Debug, Clone)]
pub(crate) enum PolicyPath {
    Clear,
    Value(PathBuf),
}

impl PolicyPath {
    pub(crate) fn from_raw(value: &str) -> Self {
        if value.trim().is_empty() {
            PolicyPath::Clear
        } else {
            PolicyPath::Value(PathBuf::from(value))
        }
    }
}

/// Partial update; `None` leaves the field untouched.
#[derive(Debug, Default, Clone)]
pub(crate) struct PolicyUpdate {
    pub(crate) log_level: Option<String>,
    pub(crate) log_file: Option<PolicyPath>,
    pub(crate) json_errors: Option<bool>,
    pub(crate) scrub_registry: Option<bool>,
    pub(crate) max_scrub_passes: Option<usize>,
    pub(crate) replay_unflushed: Option<bool>,
}

/// Snapshot the current policy.
pub fn policy_snapshot() -> CapturePolicy {
    policy_cell().read().expect("policy lock poisoned").clone()
}

/// Apply the provided update to the global policy and propagate logging changes.
pub(crate) fn apply_policy_update(update: PolicyUpdate) {
    let mut guard = policy_cell().write().expect("policy lock poisoned");
    guard.apply_update(update);
    crate::logging::apply_policy(&guard);
}

#[cfg(test)]
pub(crate) fn reset_policy_for_tests() {
    let mut guard = policy_cell().write().expect("policy lock poisoned");
    *guard = CapturePolicy::default();
    crate::logging::apply_policy(&guard);
}
