//! Filter targets for `flush`: validation, callable resolution, and matching
//! a captured record against the source of an offending function.

use std::sync::Arc;

use capture_errors::{usage, CaptureResult, ErrorCode};
use pyo3::prelude::*;
use pyo3::types::PyAny;

use crate::line_range::{LineRangeResolver, LineSet};
use crate::logging::with_error_code;
use crate::module_identity::{equivalent_posix_paths, normalise_source_path, resolve_source_path, SourcePath};
use crate::record::WarningRecord;

/// `__wrapped__` chains longer than this are truncated.
const MAX_WRAPPED_DEPTH: usize = 32;

/// One resolved function body: where it lives and which lines it spans.
#[derive(Debug, Clone)]
pub struct Origin {
    pub source: SourcePath,
    pub lines: Arc<LineSet>,
}

impl Origin {
    fn matches(&self, file: &str, line: u32) -> bool {
        if !self.lines.contains(line) {
            return false;
        }
        if equivalent_posix_paths(&self.source.path, file) {
            return true;
        }
        if self
            .source
            .stale_compiled
            .as_deref()
            .is_some_and(|stale| equivalent_posix_paths(stale, file))
        {
            with_error_code(ErrorCode::OriginMismatch, || {
                log::warn!(
                    target: "trial_warnings::offending",
                    "warning at {file}:{line} names the compiled path of a function whose module now lives at {}; not matching",
                    self.source.path
                );
            });
        }
        false
    }
}

/// A validated filter entry. An entry with no origins matches nothing.
#[derive(Debug, Clone)]
pub struct OffendingFunction {
    origins: Vec<Origin>,
}

impl OffendingFunction {
    pub fn origins(&self) -> &[Origin] {
        &self.origins
    }

    /// `file` must already be normalised with `normalise_source_path`.
    pub fn matches(&self, file: &str, line: u32) -> bool {
        self.origins.iter().any(|origin| origin.matches(file, line))
    }

    pub fn all_lines(&self) -> Vec<u32> {
        let mut lines: Vec<u32> = self
            .origins
            .iter()
            .flat_map(|origin| origin.lines.to_sorted_vec())
            .collect();
        lines.sort_unstable();
        lines.dedup();
        lines
    }
}

/// Python type objects used to classify filter entries.
struct CallableTypes<'py> {
    function: Bound<'py, PyAny>,
    method: Bound<'py, PyAny>,
}

impl<'py> CallableTypes<'py> {
    fn load(py: Python<'py>) -> PyResult<Self> {
        let types = py.import("types")?;
        Ok(Self {
            function: types.getattr("FunctionType")?,
            method: types.getattr("MethodType")?,
        })
    }

    fn is_function(&self, obj: &Bound<'py, PyAny>) -> bool {
        obj.is_instance(&self.function).unwrap_or(false)
    }

    fn is_method(&self, obj: &Bound<'py, PyAny>) -> bool {
        obj.is_instance(&self.method).unwrap_or(false)
    }

    fn is_target(&self, obj: &Bound<'py, PyAny>) -> bool {
        self.is_function(obj) || self.is_method(obj)
    }
}

fn describe(obj: &Bound<'_, PyAny>) -> String {
    obj.repr()
        .map(|repr| repr.to_string())
        .unwrap_or_else(|_| "<unrepresentable object>".to_string())
}

/// Validate every entry before anything is resolved or mutated.
pub fn validate_targets(py: Python<'_>, targets: &[Bound<'_, PyAny>]) -> CaptureResult<()> {
    let types = CallableTypes::load(py).map_err(|err| {
        usage!(ErrorCode::InvalidFilterTarget, "cannot classify filter targets")
            .with_context("error", err.to_string())
    })?;
    for (index, target) in targets.iter().enumerate() {
        if !types.is_target(target) {
            let repr = describe(target);
            return Err(usage!(
                ErrorCode::InvalidFilterTarget,
                "{} is not a function or method",
                repr
            )
            .with_context("index", index.to_string())
            .with_context("repr", repr));
        }
    }
    Ok(())
}

/// Resolve validated targets into origins. Unresolvable pieces degrade to
/// "matches nothing" and never fail the call.
pub fn resolve_targets(
    py: Python<'_>,
    targets: &[Bound<'_, PyAny>],
    resolver: &LineRangeResolver,
) -> CaptureResult<Vec<OffendingFunction>> {
    validate_targets(py, targets)?;
    let types = CallableTypes::load(py).map_err(|err| {
        usage!(ErrorCode::InvalidFilterTarget, "cannot classify filter targets")
            .with_context("error", err.to_string())
    })?;
    Ok(targets
        .iter()
        .map(|target| resolve_one(py, &types, target, resolver))
        .collect())
}

fn resolve_one<'py>(
    py: Python<'py>,
    types: &CallableTypes<'py>,
    target: &Bound<'py, PyAny>,
    resolver: &LineRangeResolver,
) -> OffendingFunction {
    let label = describe(target);
    let origins = function_chain(types, target)
        .iter()
        .filter_map(|function| origin_for(py, function, resolver))
        .collect::<Vec<_>>();
    if origins.is_empty() {
        with_error_code(ErrorCode::LineTableUnavailable, || {
            log::debug!(
                target: "trial_warnings::offending",
                "no source origin for {label}; it will match no warnings"
            );
        });
    }
    OffendingFunction { origins }
}

/// Bound methods unwrap to `__func__`; `__wrapped__` links are followed while
/// they lead to further functions or methods.
fn function_chain<'py>(
    types: &CallableTypes<'py>,
    target: &Bound<'py, PyAny>,
) -> Vec<Bound<'py, PyAny>> {
    let mut chain = Vec::new();
    let mut current = Some(target.clone());
    while let Some(candidate) = current.take() {
        if chain.len() >= MAX_WRAPPED_DEPTH {
            break;
        }
        let function = if types.is_method(&candidate) {
            match candidate.getattr("__func__") {
                Ok(inner) => inner,
                Err(_) => break,
            }
        } else {
            candidate
        };
        if !types.is_function(&function) {
            break;
        }
        current = function
            .getattr("__wrapped__")
            .ok()
            .filter(|next| types.is_target(next));
        chain.push(function);
    }
    chain
}

fn origin_for(
    py: Python<'_>,
    function: &Bound<'_, PyAny>,
    resolver: &LineRangeResolver,
) -> Option<Origin> {
    let code = function.getattr("__code__").ok()?;
    let source = resolve_source_path(py, function, &code)?;
    match resolver.lines_for_code(&code) {
        Ok(lines) if !lines.is_empty() => Some(Origin { source, lines }),
        Ok(_) => None,
        Err(err) => {
            with_error_code(err.code, || {
                log::debug!(target: "trial_warnings::offending", "{err}");
            });
            None
        }
    }
}

/// Normalised filename of a record, computed once per record per flush.
pub fn record_file(record: &WarningRecord) -> Option<String> {
    normalise_source_path(record.filename_str())
}

/// Sorted lines `function` is considered to span (debugging aid).
#[pyfunction]
pub fn function_lines(py: Python<'_>, function: Bound<'_, PyAny>) -> PyResult<Vec<u32>> {
    crate::ffi::dispatch("function_lines", || {
        let resolver = LineRangeResolver::new();
        let resolved = resolve_targets(py, std::slice::from_ref(&function), &resolver)?;
        Ok(resolved
            .first()
            .map(OffendingFunction::all_lines)
            .unwrap_or_default())
    })
}
