//! Environment variable parsing for capture policy overrides.

use crate::policy::model::{apply_policy_update, PolicyPath, PolicyUpdate};
use capture_errors::{usage, CaptureResult, ErrorCode};
use std::env;

/// Log level filter for this crate (`RUST_LOG` syntax).
pub const ENV_LOG_LEVEL: &str = "TRIAL_WARNINGS_LOG_LEVEL";
/// Log destination file; empty means stderr.
pub const ENV_LOG_FILE: &str = "TRIAL_WARNINGS_LOG_FILE";
/// Emit JSON error trailers on stderr.
pub const ENV_JSON_ERRORS: &str = "TRIAL_WARNINGS_JSON_ERRORS";
/// Toggle the `__warningregistry__` scrub before each capture.
pub const ENV_SCRUB_REGISTRY: &str = "TRIAL_WARNINGS_SCRUB_REGISTRY";
/// Maximum number of registry passes when entries keep appearing.
pub const ENV_MAX_SCRUB_PASSES: &str = "TRIAL_WARNINGS_MAX_SCRUB_PASSES";
/// Toggle end-of-test replay of unflushed warnings.
pub const ENV_REPLAY_UNFLUSHED: &str = "TRIAL_WARNINGS_REPLAY_UNFLUSHED";

/// Load policy overrides from environment variables. Nothing is applied when
/// any variable fails to parse.
pub fn configure_policy_from_env() -> CaptureResult<()> {
    let mut update = PolicyUpdate::default();

    if let Ok(value) = env::var(ENV_LOG_LEVEL) {
        update.log_level = Some(value);
    }
    if let Ok(value) = env::var(ENV_LOG_FILE) {
        update.log_file = Some(PolicyPath::from_raw(&value));
    }
    if let Ok(value) = env::var(ENV_JSON_ERRORS) {
        update.json_errors = Some(parse_bool(ENV_JSON_ERRORS, &value)?);
    }
    if let Ok(value) = env::var(ENV_SCRUB_REGISTRY) {
        update.scrub_registry = Some(parse_bool(ENV_SCRUB_REGISTRY, &value)?);
    }
    if let Ok(value) = env::var(ENV_MAX_SCRUB_PASSES) {
        update.max_scrub_passes = Some(parse_passes(&value)?);
    }
    if let Ok(value) = env::var(ENV_REPLAY_UNFLUSHED) {
        update.replay_unflushed = Some(parse_bool(ENV_REPLAY_UNFLUSHED, &value)?);
    }

    apply_policy_update(update);
    Ok(())
}

fn parse_bool(name: &'static str, value: &str) -> CaptureResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" => Ok(true),
        "0" | "false" | "f" | "no" | "n" => Ok(false),
        other => Err(usage!(
            ErrorCode::InvalidPolicyValue,
            "invalid boolean value '{}' (expected true/false)",
            other
        )
        .with_context("variable", name)),
    }
}

fn parse_passes(value: &str) -> CaptureResult<usize> {
    match value.trim().parse::<usize>() {
        Ok(passes) if passes > 0 => Ok(passes),
        _ => Err(usage!(
            ErrorCode::InvalidPolicyValue,
            "invalid {} value '{}' (expected a positive integer)",
            ENV_MAX_SCRUB_PASSES,
            value.trim()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::model::{policy_snapshot, reset_policy_for_tests};

    #[test]
    fn configure_policy_from_env_updates_fields() {
        let _lock = crate::test_support::python_lock();
        let _guard = EnvGuard;
        reset_policy_for_tests();
        std::env::set_var(ENV_LOG_LEVEL, "info");
        std::env::set_var(ENV_LOG_FILE, "/tmp/trial-warnings.log");
        std::env::set_var(ENV_JSON_ERRORS, "yes");
        std::env::set_var(ENV_SCRUB_REGISTRY, "0");
        std::env::set_var(ENV_MAX_SCRUB_PASSES, "3");
        std::env::set_var(ENV_REPLAY_UNFLUSHED, "false");

        configure_policy_from_env().expect("configure from env");
        let snap = policy_snapshot();
        assert_eq!(snap.log_level.as_deref(), Some("info"));
        assert_eq!(
            snap.log_file.as_ref().map(|p| p.display().to_string()),
            Some("/tmp/trial-warnings.log".to_string())
        );
        assert!(snap.json_errors);
        assert!(!snap.scrub_registry);
        assert_eq!(snap.max_scrub_passes, 3);
        assert!(!snap.replay_unflushed);
        drop(_guard);
        reset_policy_for_tests();
    }

    #[test]
    fn invalid_value_leaves_policy_untouched() {
        let _lock = crate::test_support::python_lock();
        let _guard = EnvGuard;
        reset_policy_for_tests();
        std::env::set_var(ENV_SCRUB_REGISTRY, "false");
        std::env::set_var(ENV_MAX_SCRUB_PASSES, "many");

        let err = configure_policy_from_env().expect_err("invalid passes");
        assert_eq!(err.code, ErrorCode::InvalidPolicyValue);
        assert!(policy_snapshot().scrub_registry);
        drop(_guard);
        reset_policy_for_tests();
    }

    #[test]
    fn zero_scrub_passes_are_rejected() {
        let _lock = crate::test_support::python_lock();
        let _guard = EnvGuard;
        reset_policy_for_tests();
        std::env::set_var(ENV_MAX_SCRUB_PASSES, "0");

        let err = configure_policy_from_env().expect_err("zero passes");
        assert_eq!(err.code, ErrorCode::InvalidPolicyValue);
        assert_eq!(
            policy_snapshot().max_scrub_passes,
            crate::policy::DEFAULT_MAX_SCRUB_PASSES
        );
        drop(_guard);
        reset_policy_for_tests();
    }

    #[test]
    fn parse_bool_rejects_invalid() {
        let err = parse_bool(ENV_JSON_ERRORS, "sometimes").expect_err("invalid bool");
        assert_eq!(err.context_value("variable"), Some(ENV_JSON_ERRORS));
        assert!(parse_bool(ENV_JSON_ERRORS, " Y ").expect("valid bool"));
    }

    struct EnvGuard;

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for key in [
                ENV_LOG_LEVEL,
                ENV_LOG_FILE,
                ENV_JSON_ERRORS,
                ENV_SCRUB_REGISTRY,
                ENV_MAX_SCRUB_PASSES,
                ENV_REPLAY_UNFLUSHED,
            ] {
                std::env::remove_var(key);
            }
        }
    }
}
