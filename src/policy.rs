//! Runtime configuration policy for warning capture.

mod env;
mod ffi;
mod model;

pub use env::{
    configure_policy_from_env, ENV_JSON_ERRORS, ENV_LOG_FILE, ENV_LOG_LEVEL,
    ENV_MAX_SCRUB_PASSES, ENV_REPLAY_UNFLUSHED, ENV_SCRUB_REGISTRY,
};
pub use ffi::{configure_policy_py, py_configure_policy_from_env, py_policy_snapshot};
pub use model::{policy_snapshot, CapturePolicy, DEFAULT_MAX_SCRUB_PASSES};
