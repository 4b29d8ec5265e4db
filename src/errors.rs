use std::path::PathBuf;
use thiserror::Error;

/// Structured error types for the segmentation pipeline.
///
/// Each variant carries the context of its domain (filesystem, image decoding,
/// tensor runtime, evaluation) so callers can report failures without parsing
/// message strings.
#[derive(Error, Debug)]
pub enum ProcareSegError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },

    #[error("Evaluation error: {reason}")]
    Evaluation { reason: String },
}

pub type Result<T, E = ProcareSegError> = std::result::Result<T, E>;

impl ProcareSegError {
    pub(crate) fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn model(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Model {
            operation: operation.into(),
            source: message.into().into(),
        }
    }

    pub(crate) fn decode(path: impl Into<String>, source: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: path.into(),
            operation: "image decode".to_string(),
            source: Box::new(source),
        }
    }
}

/// Convert anyhow errors to configuration errors.
impl From<anyhow::Error> for ProcareSegError {
    fn from(err: anyhow::Error) -> Self {
        ProcareSegError::Configuration {
            message: err.to_string(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that knows the path and operation should build
/// `ProcareSegError::FileSystem` directly; this is the fallback.
impl From<std::io::Error> for ProcareSegError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for ProcareSegError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors come out of tensor conversions around the network, so they
/// are filed as model errors.
impl From<ndarray::ShapeError> for ProcareSegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<burn::record::RecorderError> for ProcareSegError {
    fn from(err: burn::record::RecorderError) -> Self {
        Self::model("record persistence", format!("{err:?}"))
    }
}

impl From<burn::config::ConfigError> for ProcareSegError {
    fn from(err: burn::config::ConfigError) -> Self {
        Self::Configuration {
            message: format!("{err:?}"),
        }
    }
}

impl From<burn::tensor::DataError> for ProcareSegError {
    fn from(err: burn::tensor::DataError) -> Self {
        Self::model("tensor data extraction", format!("{err:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_fall_back_to_unknown_path() {
        let err: ProcareSegError =
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        match err {
            ProcareSegError::FileSystem { path, .. } => assert_eq!(path, PathBuf::from("unknown")),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn validation_message_names_field() {
        let err = ProcareSegError::validation("image_size", "must be divisible by 8");
        assert_eq!(
            err.to_string(),
            "Validation error: image_size must be divisible by 8"
        );
    }
}
