use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("draw a signature first ({points} point(s) recorded)")]
    Empty { points: usize },
}

/// Failure to embed a single overlay. Never aborts an export.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmbedError {
    #[error("raster preview could not be embedded: {0}")]
    Image(String),
    #[error("signature strokes could not be drawn: {0}")]
    Path(String),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("an export is already in progress")]
    Busy,
    #[error("failed to read source document: {0}")]
    Load(#[source] lopdf::Error),
    #[error("failed to save document: {0}")]
    Save(String),
    #[error("page count changed during export ({expected} -> {found})")]
    PageCount { expected: usize, found: usize },
    #[error("malformed document: {0}")]
    Document(String),
}
