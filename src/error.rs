//! Error taxonomy shared by every component.
use thiserror::Error;

/// Classifies every fallible outcome described by the error handling design:
/// transient network hiccups are recovered locally, fatal ones tear down a
/// session, protocol/media/resource errors are reported and otherwise
/// isolated to the component that raised them.
#[derive(Error, Debug)]
pub enum VoxError {
    #[error("transient network error: {0}")]
    NetworkTransient(#[from] std::io::Error),

    #[error("control connection closed: {0}")]
    NetworkFatal(String),

    #[error("malformed directive: {0}")]
    ProtocolViolation(String),

    #[error("media hardware failure: {0}")]
    MediaHardwareFailure(String),

    #[error("resource limit: {0}")]
    ResourceLimit(String),
}

pub type VoxResult<T> = Result<T, VoxError>;
