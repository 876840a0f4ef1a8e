//! Source-path identity for functions: live module paths, compiled paths, and
//! the normalisation that makes a warning's reported filename comparable to them.

use std::borrow::Cow;
use std::path::{Component, Path, PathBuf};

use pyo3::prelude::*;
use pyo3::types::{PyAny, PyDict};

/// Where an origin path came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathSource {
    /// `sys.modules[func.__module__]`'s `__spec__.origin` / `__file__`.
    LiveModule,
    /// `func.__code__.co_filename`, used when the module is gone.
    Compiled,
}

/// Normalised source path for one function, plus the stale compiled path when
/// it disagrees with the live module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcePath {
    pub path: String,
    pub source: PathSource,
    pub stale_compiled: Option<String>,
}

/// Resolve the source path of `function` (a plain function object) and its
/// code object. Prefers the live module path; falls back to `co_filename`.
pub fn resolve_source_path(
    py: Python<'_>,
    function: &Bound<'_, PyAny>,
    code: &Bound<'_, PyAny>,
) -> Option<SourcePath> {
    let compiled = code
        .getattr("co_filename")
        .ok()
        .and_then(|value| value.extract::<String>().ok())
        .and_then(|raw| normalise_source_path(&raw));

    let live = live_module_path(py, function);
    match (live, compiled) {
        (Some(live), compiled) => {
            let stale_compiled = compiled.filter(|path| !equivalent_posix_paths(&live, path));
            Some(SourcePath {
                path: live,
                source: PathSource::LiveModule,
                stale_compiled,
            })
        }
        (None, Some(compiled)) => Some(SourcePath {
            path: compiled,
            source: PathSource::Compiled,
            stale_compiled: None,
        }),
        (None, None) => None,
    }
}

fn live_module_path(py: Python<'_>, function: &Bound<'_, PyAny>) -> Option<String> {
    let module_name: String = function.getattr("__module__").ok()?.extract().ok()?;
    let modules = py.import("sys").ok()?.getattr("modules").ok()?;
    let modules = modules.downcast::<PyDict>().ok()?;
    let module = modules.get_item(module_name).ok()??;
    if module.is_none() {
        return None;
    }
    module_candidate_paths(&module).into_iter().next()
}

/// Candidate source paths of a module, most trustworthy first.
fn module_candidate_paths(module: &Bound<'_, PyAny>) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Ok(spec) = module.getattr("__spec__") {
        if !spec.is_none() {
            if let Some(origin) = spec
                .getattr("origin")
                .ok()
                .and_then(|origin| extract_normalised_path(&origin))
            {
                candidates.push(origin);
            }
        }
    }
    if let Some(file) = module
        .getattr("__file__")
        .ok()
        .and_then(|file| extract_normalised_path(&file))
    {
        if !candidates.contains(&file) {
            candidates.push(file);
        }
    }
    candidates
}

fn extract_normalised_path(value: &Bound<'_, PyAny>) -> Option<String> {
    if value.is_none() {
        return None;
    }
    let raw: String = value.extract().ok()?;
    // Namespace packages and builtins report pseudo origins.
    if matches!(raw.as_str(), "built-in" | "frozen") {
        return None;
    }
    normalise_source_path(&raw)
}

/// Absolutise against the current directory, resolve `.`/`..` lexically and
/// render with `/` separators, mirroring `os.path.normcase(os.path.abspath(p))`.
pub fn normalise_source_path(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    let path = Path::new(raw);
    let absolute: Cow<'_, Path> = if path.is_absolute() {
        Cow::Borrowed(path)
    } else {
        Cow::Owned(std::path::absolute(path).ok()?)
    };
    let normalised = normalise_to_posix(&lexically_normal(&absolute))?;
    Some(normcase(normalised))
}

fn lexically_normal(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            // `/..` stays `/`, as in `os.path.normpath`.
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(windows)]
fn normcase(path: String) -> String {
    path.to_lowercase()
}

#[cfg(not(windows))]
fn normcase(path: String) -> String {
    path
}

/// Two normalised paths name the same source; a cached `.pyc` stands in for its `.py`.
pub fn equivalent_posix_paths(candidate: &str, target: &str) -> bool {
    if candidate == target {
        return true;
    }
    match (candidate.strip_suffix(".pyc"), target.strip_suffix(".py")) {
        (Some(stem), Some(other)) => stem == other,
        _ => match (candidate.strip_suffix(".py"), target.strip_suffix(".pyc")) {
            (Some(stem), Some(other)) => stem == other,
            _ => false,
        },
    }
}

/// Render a path with `/` separators.
pub fn normalise_to_posix(path: &Path) -> Option<String> {
    if path.as_os_str().is_empty() {
        return None;
    }
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy()),
            Component::Prefix(prefix) => parts.push(prefix.as_os_str().to_string_lossy()),
            Component::RootDir => parts.push(Cow::Borrowed("")),
            Component::CurDir => continue,
            Component::ParentDir => parts.push(Cow::Borrowed("..")),
        }
    }
    match parts.as_slice() {
        [] => None,
        [root] if root.is_empty() => Some("/".to_string()),
        _ => Some(parts.join("/")),
    }
}
