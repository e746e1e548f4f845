use std::{path::PathBuf, time::Duration};
use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("No model available: supply a model package or configure a default")]
    NoModelAvailable,
    #[error("Model package {archive:?} has no descriptor registered as `{id}`")]
    MissingDescriptor { archive: PathBuf, id: String },
    #[error("Descriptor {path:?} could not be loaded: {reason}")]
    CorruptDescriptor { path: PathBuf, reason: String },
    #[error("Failed to create sandbox {path:?}: {source}")]
    SandboxCreationFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Model package {path:?} could not be unpacked: {reason}")]
    ModelArchive { path: PathBuf, reason: String },
    #[error("Path rejected: {0}")]
    InvalidPath(String),
    #[error("Run set is empty or references nothing resolvable")]
    EmptyOrInvalidJobDescription,
    #[error("Failed to decode {0:?}: file not found or unsupported format")]
    PerItemDecodeFailure(PathBuf),
    #[error("Cancellation not acknowledged within {0:?}")]
    CancelTimeout(Duration),
    #[error("A job is already being processed")]
    Busy,
    #[error("Service is not running")]
    NotRunning,
}

impl From<DetectorError> for Status {
    fn from(err: DetectorError) -> Self {
        let message = err.to_string();
        match err {
            DetectorError::NoModelAvailable => Status::failed_precondition(message),
            DetectorError::MissingDescriptor { .. }
            | DetectorError::CorruptDescriptor { .. }
            | DetectorError::ModelArchive { .. } => Status::failed_precondition(message),
            DetectorError::InvalidPath(_) | DetectorError::EmptyOrInvalidJobDescription => {
                Status::invalid_argument(message)
            }
            DetectorError::PerItemDecodeFailure(_) => Status::invalid_argument(message),
            DetectorError::SandboxCreationFailed { .. } => Status::internal(message),
            DetectorError::CancelTimeout(_) => Status::deadline_exceeded(message),
            DetectorError::Busy => Status::resource_exhausted(message),
            DetectorError::NotRunning => Status::unavailable(message),
        }
    }
}

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to load model: {0}")]
    Load(String),
    #[error("Inference failed: {0}")]
    Inference(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            Status::from(DetectorError::NoModelAvailable).code(),
            Code::FailedPrecondition
        );
        assert_eq!(Status::from(DetectorError::Busy).code(), Code::ResourceExhausted);
        assert_eq!(
            Status::from(DetectorError::EmptyOrInvalidJobDescription).code(),
            Code::InvalidArgument
        );
    }
}
