//! Line sets of compiled function bodies.
//!
//! CPython line tables are a weak oracle: entries may come back in any order,
//! some offsets carry no line at all, and the last source line of a function is
//! not necessarily attached to its last instruction. A [`LineSet`] is therefore
//! the union of every line any entry reports, across the code object and every
//! code object nested in its constants, used for membership only.

use std::collections::BTreeSet;
use std::sync::Arc;

use capture_errors::{enverr, CaptureResult, ErrorCode};
use dashmap::DashMap;
use pyo3::prelude::*;
use pyo3::types::{PyAny, PyCode, PyTuple};

/// Nested code objects deeper than this are ignored.
const MAX_NESTING: usize = 64;

/// Source of raw line-table entries for one code object.
pub trait LineTable: Sized {
    /// Every line number the table reports, unordered; `None` for entries
    /// without a line (artificial instructions).
    fn reported_lines(&self) -> CaptureResult<Vec<Option<u32>>>;

    /// Code objects nested in this one (comprehensions, lambdas, inner defs).
    fn nested(&self) -> CaptureResult<Vec<Self>>;
}

/// Unordered set of source lines a function body can report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineSet {
    lines: BTreeSet<u32>,
}

impl LineSet {
    pub fn collect<T: LineTable>(table: &T) -> CaptureResult<Self> {
        let mut set = LineSet::default();
        set.absorb(table, 0)?;
        Ok(set)
    }

    fn absorb<T: LineTable>(&mut self, table: &T, depth: usize) -> CaptureResult<()> {
        self.lines
            .extend(table.reported_lines()?.into_iter().flatten().filter(|l| *l > 0));
        if depth >= MAX_NESTING {
            return Ok(());
        }
        for child in table.nested()? {
            self.absorb(&child, depth + 1)?;
        }
        Ok(())
    }

    pub fn contains(&self, line: u32) -> bool {
        self.lines.contains(&line)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn to_sorted_vec(&self) -> Vec<u32> {
        self.lines.iter().copied().collect()
    }
}

/// Line table backed by a live Python code object.
pub struct PyLineTable<'py> {
    code: Bound<'py, PyAny>,
}

impl<'py> PyLineTable<'py> {
    pub fn new(code: Bound<'py, PyAny>) -> Self {
        Self { code }
    }

    fn lines_from_co_lines(&self) -> PyResult<Option<Vec<Option<u32>>>> {
        let Ok(co_lines) = self.code.getattr("co_lines") else {
            return Ok(None);
        };
        let mut lines = Vec::new();
        for entry in co_lines.call0()?.try_iter()? {
            // (start_offset, end_offset, line)
            let entry = entry?;
            let tuple = entry.downcast::<PyTuple>()?;
            lines.push(extract_line(&tuple.get_item(2)?));
        }
        Ok(Some(lines))
    }

    fn lines_from_findlinestarts(&self) -> PyResult<Vec<Option<u32>>> {
        let py = self.code.py();
        let starts = py
            .import("dis")?
            .getattr("findlinestarts")?
            .call1((self.code.clone(),))?;
        let mut lines = Vec::new();
        for entry in starts.try_iter()? {
            // (offset, line)
            let entry = entry?;
            let tuple = entry.downcast::<PyTuple>()?;
            lines.push(extract_line(&tuple.get_item(1)?));
        }
        Ok(lines)
    }
}

fn extract_line(value: &Bound<'_, PyAny>) -> Option<u32> {
    if value.is_none() {
        return None;
    }
    value
        .extract::<i64>()
        .ok()
        .and_then(|line| u32::try_from(line).ok())
}

impl<'py> LineTable for PyLineTable<'py> {
    fn reported_lines(&self) -> CaptureResult<Vec<Option<u32>>> {
        let lines = match self.lines_from_co_lines() {
            Ok(Some(lines)) => Ok(lines),
            Ok(None) => self.lines_from_findlinestarts(),
            Err(err) => {
                log::debug!(
                    target: "trial_warnings::line_range",
                    "co_lines() failed, falling back to dis.findlinestarts: {err}"
                );
                self.lines_from_findlinestarts()
            }
        };
        lines.map_err(|err| {
            enverr!(ErrorCode::LineTableUnavailable, "failed to read line table")
                .with_context("error", err.to_string())
        })
    }

    fn nested(&self) -> CaptureResult<Vec<Self>> {
        let Ok(consts) = self.code.getattr("co_consts") else {
            return Ok(Vec::new());
        };
        let iter = consts.try_iter().map_err(|err| {
            enverr!(ErrorCode::LineTableUnavailable, "co_consts is not iterable")
                .with_context("error", err.to_string())
        })?;
        Ok(iter
            .flatten()
            .filter(|item| item.is_instance_of::<PyCode>())
            .map(PyLineTable::new)
            .collect())
    }
}

/// Memoises line sets per code object for the lifetime of the resolver.
///
/// Keys are code object addresses, so a resolver must not outlive the objects
/// it was asked about; `flush` builds a fresh one per call.
#[derive(Debug, Default)]
pub struct LineRangeResolver {
    cache: DashMap<usize, Arc<LineSet>>,
}

impl LineRangeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines_for_code(&self, code: &Bound<'_, PyAny>) -> CaptureResult<Arc<LineSet>> {
        let key = code.as_ptr() as usize;
        if let Some(hit) = self.cache.get(&key) {
            return Ok(Arc::clone(hit.value()));
        }
        let set = Arc::new(LineSet::collect(&PyLineTable::new(code.clone()))?);
        self.cache.insert(key, Arc::clone(&set));
        Ok(set)
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
