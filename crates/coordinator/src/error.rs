use std::net::AddrParseError;

use fabric_common::CommonError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Failed to load configuration")]
    Config(#[from] config::ConfigError),

    #[error("Invalid server address in configuration")]
    AddrParse(#[from] AddrParseError),

    #[error("gRPC transport error")]
    Transport(#[from] tonic::transport::Error),

    #[error("Container already registered: {0}")]
    DuplicateId(String),

    #[error("Container ID not found: {0}")]
    UnknownContainer(String),

    #[error("Plan declares no partitions")]
    EmptyPlan,

    #[error("Invalid plan: {0}")]
    InvalidPlan(#[from] CommonError),

    #[error("Query ID not found: {0}")]
    QueryNotFound(String),

    #[error("An internal error occurred: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

impl From<CoordinatorError> for tonic::Status {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::EmptyPlan | CoordinatorError::InvalidPlan(_) => {
                tonic::Status::invalid_argument(err.to_string())
            }
            CoordinatorError::DuplicateId(_) => tonic::Status::already_exists(err.to_string()),
            CoordinatorError::UnknownContainer(_) | CoordinatorError::QueryNotFound(_) => {
                tonic::Status::not_found(err.to_string())
            }
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}
