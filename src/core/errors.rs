// src/core/errors.rs

//! Defines the primary error type for the entire crate.

use std::num::ParseIntError;
use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the core.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum QuartzError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Protocol Error: {0}")]
    Protocol(String),

    #[error("Replication Error: {0}")]
    Replication(String),

    #[error("Cluster Error: {0}")]
    Cluster(String),

    #[error("CLUSTERDOWN {0}")]
    ClusterDown(String),

    #[error("Config Error: {0}")]
    Config(String),

    #[error("Value is not an integer or out of range")]
    NotAnInteger,

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Command not allowed in the current state: {0}")]
    InvalidState(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for QuartzError {
    fn from(err: std::io::Error) -> Self {
        QuartzError::Io(Arc::new(err))
    }
}

impl From<ParseIntError> for QuartzError {
    fn from(_: ParseIntError) -> Self {
        QuartzError::NotAnInteger
    }
}

impl From<std::str::Utf8Error> for QuartzError {
    fn from(err: std::str::Utf8Error) -> Self {
        QuartzError::Protocol(format!("invalid UTF-8 in protocol data: {err}"))
    }
}
