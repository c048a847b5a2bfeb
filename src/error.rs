use thiserror::Error;

use crate::store::StoreError;
use crate::sweep::SweepError;

#[derive(Error, Debug)]
pub enum HeadnodeError {
    #[error("Invalid nodename: {0}")]
    InvalidNodename(String),

    #[error("Invalid host format: {0}")]
    InvalidHost(String),

    #[error("Invalid node pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("Invalid nodes ({count}): [{}]", .names.join(" "))]
    InvalidNodes { count: usize, names: Vec<String> },

    #[error("No valid nodes to create job")]
    NoNodes,

    #[error("Invalid sweep: {0}")]
    Sweep(#[from] SweepError),

    #[error("Sweep placeholder {placeholder} has wrong format or is not in command: {command}")]
    SweepMismatch {
        placeholder: String,
        command: String,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<HeadnodeError> for tonic::Status {
    fn from(err: HeadnodeError) -> Self {
        match err {
            HeadnodeError::Store(_) => tonic::Status::internal(err.to_string()),
            _ => tonic::Status::invalid_argument(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, HeadnodeError>;
