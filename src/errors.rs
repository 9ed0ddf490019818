use std::path::PathBuf;
use thiserror::Error;

/// Structured error types for waste composition analysis.
///
/// # Classification
///
/// The first four variants are the domain taxonomy callers branch on:
/// an undecodable upload, a model that ran but found nothing, a broken
/// mask/label contract between the adapter and the composition engine, and a
/// failed inference call. Pipelines never flatten these into strings; only
/// the batch pipeline converts them to per-item messages, and only after
/// logging them.
#[derive(Error, Debug)]
pub enum WasteSegError {
    #[error("Invalid image: {image} ({reason})")]
    InvalidImage { image: String, reason: String },

    #[error("No detection: {image}")]
    NoDetection { image: String },

    #[error("Shape mismatch: {reason}")]
    ShapeMismatch { reason: String },

    #[error("Inference error: model failed on {image}")]
    Inference {
        image: String,
        #[source]
        source: Box<WasteSegError>,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Persistence error: {operation} failed")]
    Persistence {
        operation: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Encoding error: {operation} failed")]
    Encoding {
        operation: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Pipeline error: {stage} failed for {image}")]
    Pipeline {
        image: String,
        stage: &'static str,
        #[source]
        source: Box<WasteSegError>,
    },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, WasteSegError>;

impl WasteSegError {
    pub fn shape_mismatch(reason: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            reason: reason.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn model(
        operation: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Model {
            operation: operation.into(),
            source: source.into(),
        }
    }

    /// Attach image identity to an error raised by a pipeline stage.
    ///
    /// Errors that already name their image keep their classification as-is.
    pub fn in_stage(self, image: &str, stage: &'static str) -> Self {
        match self {
            e @ (Self::InvalidImage { .. }
            | Self::NoDetection { .. }
            | Self::Inference { .. }
            | Self::Pipeline { .. }) => e,
            other => Self::Pipeline {
                image: image.to_string(),
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The innermost classified error, looking through `Pipeline` wrappers.
    pub fn root(&self) -> &WasteSegError {
        match self {
            Self::Pipeline { source, .. } => source.root(),
            other => other,
        }
    }

    /// Mask/label contract violations are integration bugs and must stay loud.
    pub fn is_shape_mismatch(&self) -> bool {
        matches!(self.root(), Self::ShapeMismatch { .. })
    }

    /// This error followed by every cause in its source chain, joined by `": "`.
    pub fn report(&self) -> String {
        let mut message = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        message
    }
}

/// Convert anyhow errors to configuration errors.
///
/// Used where CLI-level helpers hand back `anyhow::Error`; library code
/// constructs typed variants directly.
impl From<anyhow::Error> for WasteSegError {
    fn from(err: anyhow::Error) -> Self {
        WasteSegError::Configuration {
            message: err.to_string(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that has a path should construct `WasteSegError::FileSystem`
/// directly; this is the fallback for bare `?`.
impl From<std::io::Error> for WasteSegError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<rusqlite::Error> for WasteSegError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Persistence {
            operation: "sqlite".to_string(),
            source: err,
        }
    }
}

/// Convert ONNX Runtime errors to model errors.
impl From<ort::Error> for WasteSegError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ndarray shape errors to model errors.
///
/// Shape errors here come from reshaping model output tensors, so they belong
/// to the adapter rather than to the mask/label contract.
impl From<ndarray::ShapeError> for WasteSegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}
