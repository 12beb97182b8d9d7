//! Error types for the cluster client
//!
//! Every failure a caller can observe falls into one of four buckets:
//! caller input was malformed (never sent), the node could not be reached
//! in time, the node answered with a non-success status, or the node's
//! answer did not match the expected schema.

use thiserror::Error;

/// Caller input rejected before any network call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("table name must not be empty")]
    EmptyTable,

    #[error("{0} key set must contain at least one non-empty component")]
    EmptyKeySet(KeyKind),

    #[error("insert requires at least one cell")]
    NoCells,

    #[error("cell names and values differ in length ({names} names, {values} values)")]
    CellCountMismatch { names: usize, values: usize },

    #[error("cell name must not be empty")]
    EmptyCellName,

    #[error("cell '{0}' appears more than once in the row")]
    DuplicateCell(String),

    #[error("request cannot be encoded: {0}")]
    Unencodable(String),
}

/// Which half of a row address a key error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Partition,
    Clustering,
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyKind::Partition => write!(f, "partition"),
            KeyKind::Clustering => write!(f, "clustering"),
        }
    }
}

/// A request or response body that does not match the wire schema
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("read response contained no cells")]
    Empty,

    #[error("unknown operation path '{0}'")]
    UnknownPath(String),
}

/// Failure below the HTTP status layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request to {endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("could not reach {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
}

impl TransportError {
    pub fn endpoint(&self) -> &str {
        match self {
            TransportError::Timeout { endpoint } => endpoint,
            TransportError::Connect { endpoint, .. } => endpoint,
        }
    }
}

/// Membership changes the router refuses
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("cluster topology requires at least one node")]
    Empty,

    #[error("invalid node endpoint '{0}', expected host:port")]
    InvalidEndpoint(String),

    #[error("node '{0}' is already part of the topology")]
    DuplicateNode(String),

    #[error("node '{0}' is not part of the topology")]
    UnknownNode(String),
}

/// Result of any cluster client call that did not succeed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("node unreachable: {0}")]
    Unreachable(#[from] TransportError),

    #[error("node {endpoint} rejected request with status {status}: {body}")]
    ServerRejected {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("undecodable response: {0}")]
    Decode(#[from] DecodeError),
}

impl ClientError {
    /// Short label used for logging and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::Validation(_) => "validation",
            ClientError::Unreachable(_) => "unreachable",
            ClientError::ServerRejected { .. } => "server_rejected",
            ClientError::Decode(_) => "decode",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ValidationError::EmptyKeySet(KeyKind::Clustering);
        assert_eq!(
            err.to_string(),
            "clustering key set must contain at least one non-empty component"
        );

        let err = ClientError::from(TransportError::Timeout {
            endpoint: "127.0.0.1:8000".to_string(),
        });
        assert_eq!(err.kind(), "unreachable");
        assert!(err.to_string().contains("127.0.0.1:8000"));
    }

    #[test]
    fn test_validation_converts_into_client_error() {
        let err: ClientError = ValidationError::NoCells.into();
        assert_eq!(err, ClientError::Validation(ValidationError::NoCells));
        assert_eq!(err.kind(), "validation");
    }
}
