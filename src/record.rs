//! Structured capture of one warning occurrence.

use pyo3::exceptions::PyKeyError;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyString};

/// Keys accepted by `record[key]`, in the order `to_dict` reports them.
const FIELDS: [&str; 4] = ["message", "category", "filename", "lineno"];

/// One warning as reported to the ambient sink. Immutable.
#[pyclass(module = "trial_warnings", frozen)]
pub struct WarningRecord {
    message: String,
    category: Py<PyAny>,
    filename: String,
    lineno: u32,
}

impl WarningRecord {
    pub fn new(message: String, category: Py<PyAny>, filename: String, lineno: u32) -> Self {
        Self {
            message,
            category,
            filename,
            lineno,
        }
    }

    /// Build a record from the arguments `warnings.showwarning` receives.
    pub fn from_showwarning(
        message: &Bound<'_, PyAny>,
        category: &Bound<'_, PyAny>,
        filename: &Bound<'_, PyAny>,
        lineno: &Bound<'_, PyAny>,
    ) -> PyResult<Self> {
        let text = message.str()?.to_string();
        let filename = filename.str()?.to_string();
        // Negative or oversized line numbers only come from hand-rolled calls.
        let lineno = lineno.extract::<i64>()?.clamp(0, u32::MAX as i64) as u32;
        Ok(Self::new(text, category.clone().unbind(), filename, lineno))
    }

    pub fn message_str(&self) -> &str {
        &self.message
    }

    pub fn filename_str(&self) -> &str {
        &self.filename
    }

    pub fn line(&self) -> u32 {
        self.lineno
    }

    pub fn category_ref(&self) -> &Py<PyAny> {
        &self.category
    }

    fn field(&self, py: Python<'_>, key: &str) -> Option<PyObject> {
        let value = match key {
            "message" => PyString::new(py, &self.message).into_any().unbind(),
            "category" => self.category.clone_ref(py),
            "filename" => PyString::new(py, &self.filename).into_any().unbind(),
            "lineno" => self.lineno.into_pyobject(py).ok()?.into_any().unbind(),
            _ => return None,
        };
        Some(value)
    }
}

#[pymethods]
impl WarningRecord {
    #[new]
    fn py_new(message: String, category: Py<PyAny>, filename: String, lineno: u32) -> Self {
        Self::new(message, category, filename, lineno)
    }

    #[getter]
    fn message(&self) -> &str {
        &self.message
    }

    #[getter]
    fn category(&self, py: Python<'_>) -> Py<PyAny> {
        self.category.clone_ref(py)
    }

    #[getter]
    fn filename(&self) -> &str {
        &self.filename
    }

    #[getter]
    fn lineno(&self) -> u32 {
        self.lineno
    }

    fn __getitem__(&self, py: Python<'_>, key: &str) -> PyResult<PyObject> {
        self.field(py, key)
            .ok_or_else(|| PyKeyError::new_err(key.to_string()))
    }

    fn keys(&self) -> Vec<&'static str> {
        FIELDS.to_vec()
    }

    fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        let dict = PyDict::new(py);
        for key in FIELDS {
            if let Some(value) = self.field(py, key) {
                dict.set_item(key, value)?;
            }
        }
        Ok(dict)
    }

    /// Keyword arguments reproducing this warning through `warnings.warn_explicit`.
    fn warn_explicit_kwargs<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
        self.to_dict(py)
    }

    fn __eq__(&self, other: &Bound<'_, PyAny>) -> bool {
        let Ok(other) = other.downcast::<WarningRecord>() else {
            return false;
        };
        let other = other.get();
        self.message == other.message
            && self.filename == other.filename
            && self.lineno == other.lineno
            && self.category.as_ptr() == other.category.as_ptr()
    }

    fn __repr__(&self, py: Python<'_>) -> String {
        let category = self
            .category
            .bind(py)
            .getattr("__name__")
            .and_then(|name| name.extract::<String>())
            .unwrap_or_else(|_| "<unknown>".to_string());
        format!(
            "WarningRecord(message={:?}, category={}, filename={:?}, lineno={})",
            self.message, category, self.filename, self.lineno
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyo3::exceptions::PyUserWarning;

    #[test]
    fn records_compare_field_wise_and_index_like_dicts() {
        let _lock = crate::test_support::python_lock();
        Python::with_gil(|py| {
            let category = py.get_type::<PyUserWarning>().into_any().unbind();
            let build = |line| {
                Bound::new(
                    py,
                    WarningRecord::new(
                        "oh no".to_string(),
                        category.clone_ref(py),
                        "/src/mod.py".to_string(),
                        line,
                    ),
                )
                .expect("record")
            };
            let first = build(4);
            let same = build(4);
            let other = build(5);

            assert!(first.eq(&same).expect("compare"));
            assert!(!first.eq(&other).expect("compare"));

            let message: String = first
                .get_item("message")
                .expect("message")
                .extract()
                .expect("str");
            assert_eq!(message, "oh no");
            assert_eq!(
                first.get_item("category").expect("category").as_ptr(),
                category.as_ptr()
            );
            assert!(first
                .get_item("nope")
                .expect_err("unknown key")
                .is_instance_of::<PyKeyError>(py));

            let repr = first.repr().expect("repr").to_string();
            assert!(repr.contains("category=UserWarning"), "{repr}");
        });
    }
}
