//! Error types for bindery operations.

use thiserror::Error;

/// Errors that can occur while packaging a book.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("XML parsing error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// Bad caller-supplied configuration. Raised before any output is
    /// written (e.g. an identifier too short to derive a font key).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A manifest entry was declared but its bytes were never supplied.
    /// Aborts the commit with no partial archive.
    #[error("missing resource: {0}")]
    ResourceMissing(String),

    /// A pipeline invariant was violated (link-resolution cycle, invalid
    /// post-split document, write after commit). Never expected in correct
    /// operation.
    #[error("internal error: {0}")]
    FatalInternal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The pipeline stage a diagnostic originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Options,
    InlineToc,
    Filenames,
    Quirks,
    Split,
    Cover,
    Fonts,
    Assembly,
    Extract,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Options => "options",
            Stage::InlineToc => "inline-toc",
            Stage::Filenames => "filenames",
            Stage::Quirks => "quirks",
            Stage::Split => "split",
            Stage::Cover => "cover",
            Stage::Fonts => "fonts",
            Stage::Assembly => "assembly",
            Stage::Extract => "extract",
        };
        f.write_str(name)
    }
}

/// A recoverable diagnostic. Conversion continues; warnings are collected
/// in the [`Report`](crate::convert::Report) and surfaced after success.
#[derive(Debug, Clone)]
pub struct Warning {
    pub stage: Stage,
    pub message: String,
}

impl Warning {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.stage, self.message)
    }
}
