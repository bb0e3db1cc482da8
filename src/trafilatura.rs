//! [TextExtractor] backed by the trafilatura Python package, called through PyO3.
//! The package has to be installed in the Python environment the binary links against.
use std::ffi::CStr;

use pyo3::{
    ffi::c_str,
    types::{PyAnyMethods, PyModule},
    Py, PyAny, Python,
};

use crate::content::{PipelineError, TextExtractor};

static PYTHON_SCRIPT: &CStr = c_str!(
    r"
from typing import Optional
from trafilatura import extract

def extract_text(content: str) -> Optional[str]:
    text = extract(content, include_comments=False,
                   include_tables=False, deduplicate=True)
    # also return None if utf-8 decoding failed
    if text is None or isinstance(text, bytes):
        return None
    return text
"
);

pub struct Trafilatura {
    extract_text: Py<PyAny>,
}

impl Trafilatura {
    /// Imports trafilatura. Fails if the package is missing.
    pub fn load() -> Result<Self, PipelineError> {
        Python::with_gil(|py| {
            tracing::info!(
                "Loading Python trafilatura with version {:?}.",
                py.version_info()
            );
            let module = PyModule::from_code(
                py,
                PYTHON_SCRIPT,
                c_str!("extraction.py"),
                c_str!("extraction"),
            )
            .map_err(|e| PipelineError::Extraction(format!("failed to load trafilatura: {e}")))?;
            let extract_text = module
                .getattr("extract_text")
                .map_err(|e| PipelineError::Extraction(e.to_string()))?
                .unbind();
            tracing::info!("Loaded Python trafilatura.");
            Ok(Self { extract_text })
        })
    }
}

impl TextExtractor for Trafilatura {
    fn extract(&self, html: &str) -> Result<Option<String>, PipelineError> {
        Python::with_gil(|py| {
            self.extract_text
                .call1(py, (html,))
                .and_then(|text| text.extract(py))
                .map_err(|e| PipelineError::Extraction(e.to_string()))
        })
    }
}
