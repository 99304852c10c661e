use std::net::AddrParseError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Failed to load configuration")]
    Config(#[from] config::ConfigError),

    #[error("Invalid worker server address in configuration")]
    WorkerAddrParse(#[from] AddrParseError),

    #[error("gRPC client connection error")]
    ClientConnection(#[from] tonic::transport::Error),

    #[error("gRPC call failed: {0}")]
    RpcError(#[from] tonic::Status),

    #[error("Supervisor rejected registration: {0}")]
    RegistrationRejected(String),

    #[error("Failed to register worker after multiple retries")]
    RegistrationFailed,

    #[error("Failed to connect to supervisor after multiple retries")]
    ConnectionFailed,

    #[error("An internal error occurred: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;
