use crate::engine::EngineError;
use crate::store::StoreError;
use facewatch_core::{EncoderError, MatchError};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to API callers.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The upload could not be read as an image.
    #[error("face detection failed: {0}")]
    DetectionFailed(String),
    #[error("face detection timed out after {0:?}")]
    DetectionTimeout(Duration),
    #[error(transparent)]
    MalformedEncoding(#[from] MatchError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    PayloadTooLarge(String),
    /// Model inference or the engine thread itself failed.
    #[error("recognition engine error: {0}")]
    Engine(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ServiceError::NotFound(what),
            other => ServiceError::Storage(other.to_string()),
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Encoder(EncoderError::Decode(err)) => ServiceError::DetectionFailed(err.to_string()),
            EngineError::Timeout(after) => ServiceError::DetectionTimeout(after),
            other => ServiceError::Engine(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        let err: ServiceError = StoreError::NotFound("person \"Zed\"".into()).into();
        assert!(matches!(err, ServiceError::NotFound(_)));
        assert_eq!(err.to_string(), "person \"Zed\" not found");
    }

    #[test]
    fn test_engine_errors_map() {
        let err: ServiceError = EngineError::Timeout(Duration::from_secs(3)).into();
        assert!(matches!(err, ServiceError::DetectionTimeout(_)));
        let err: ServiceError = EngineError::ChannelClosed.into();
        assert!(matches!(err, ServiceError::Engine(_)));
    }
}
