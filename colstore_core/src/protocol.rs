//! JSON request codec for the node HTTP protocol
//!
//! Each [`Operation`] maps to a fixed path and a JSON body whose field names
//! are part of the wire contract. Bodies are produced by serde from typed
//! records, so every user supplied string is escaped and the output is
//! deterministic. The same module decodes request bodies on the node side
//! and response bodies on the client side.

use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, KeyKind, ValidationError};
use crate::key::{self, Cell, RowAddress};

/// Operation tag, one per protocol verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Read,
    Insert,
    Delete,
    Repair,
    FullRepair,
}

impl OperationKind {
    pub const ALL: [OperationKind; 6] = [
        OperationKind::Create,
        OperationKind::Read,
        OperationKind::Insert,
        OperationKind::Delete,
        OperationKind::Repair,
        OperationKind::FullRepair,
    ];

    /// HTTP path the operation is posted to
    pub fn path(&self) -> &'static str {
        match self {
            OperationKind::Create => "/create",
            OperationKind::Read => "/read",
            OperationKind::Insert => "/insert",
            OperationKind::Delete => "/delete",
            OperationKind::Repair => "/repair",
            OperationKind::FullRepair => "/full_repair",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.path() == path)
    }

    /// Anti-entropy triggers are pinned to the coordinator node
    pub fn is_repair(&self) -> bool {
        matches!(self, OperationKind::Repair | OperationKind::FullRepair)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "CREATE",
            OperationKind::Read => "READ",
            OperationKind::Insert => "INSERT",
            OperationKind::Delete => "DELETE",
            OperationKind::Repair => "REPAIR",
            OperationKind::FullRepair => "FULL_REPAIR",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated logical operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Create {
        table: String,
        partition_key_names: Vec<String>,
        clustering_key_names: Vec<String>,
    },
    Read(RowAddress),
    Insert {
        address: RowAddress,
        cells: Vec<Cell>,
    },
    Delete(RowAddress),
    Repair,
    FullRepair,
}

impl Operation {
    /// Schema definition; key names follow the same normalization as key values
    pub fn create<P, C>(table: &str, partition_key_names: &[P], clustering_key_names: &[C]) -> Result<Self, ValidationError>
    where
        P: AsRef<str>,
        C: AsRef<str>,
    {
        Ok(Operation::Create {
            table: key::normalize_table(table)?,
            partition_key_names: key::normalize_components(KeyKind::Partition, partition_key_names)?,
            clustering_key_names: key::normalize_components(KeyKind::Clustering, clustering_key_names)?,
        })
    }

    pub fn insert(address: RowAddress, cells: Vec<Cell>) -> Result<Self, ValidationError> {
        key::validate_cells(&cells)?;
        Ok(Operation::Insert { address, cells })
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Create { .. } => OperationKind::Create,
            Operation::Read(_) => OperationKind::Read,
            Operation::Insert { .. } => OperationKind::Insert,
            Operation::Delete(_) => OperationKind::Delete,
            Operation::Repair => OperationKind::Repair,
            Operation::FullRepair => OperationKind::FullRepair,
        }
    }
}

/// Wire form of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRequest {
    pub kind: OperationKind,
    pub path: &'static str,
    pub body: Vec<u8>,
}

/// Decoded node answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack(Ack),
    Cells(Vec<Cell>),
}

/// Acknowledgment of a non-read operation, carrying the node's status text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CreateBody {
    table_name: String,
    partition_key_names: Vec<String>,
    clustering_key_names: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReadBody {
    table_name: String,
    partition_keys: Vec<String>,
    clustering_keys: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct InsertBody {
    table_name: String,
    partition_keys: Vec<String>,
    clustering_keys: Vec<String>,
    cell_names: Vec<String>,
    cell_values: Vec<String>,
}

// Delete carries key values under the `*_names` fields of the wire contract.
#[derive(Debug, Serialize, Deserialize)]
struct DeleteBody {
    table_name: String,
    partition_key_names: Vec<String>,
    clustering_keys_names: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EmptyBody {}

/// Body of a successful read response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResponseBody {
    pub cells: Vec<Cell>,
}

/// Serialize an operation into its path and JSON body
pub fn encode(operation: &Operation) -> Result<EncodedRequest, ValidationError> {
    let body = match operation {
        Operation::Create {
            table,
            partition_key_names,
            clustering_key_names,
        } => to_body(&CreateBody {
            table_name: table.clone(),
            partition_key_names: partition_key_names.clone(),
            clustering_key_names: clustering_key_names.clone(),
        }),
        Operation::Read(address) => to_body(&ReadBody {
            table_name: address.table().to_string(),
            partition_keys: address.partition_keys().to_vec(),
            clustering_keys: address.clustering_keys().to_vec(),
        }),
        Operation::Insert { address, cells } => to_body(&InsertBody {
            table_name: address.table().to_string(),
            partition_keys: address.partition_keys().to_vec(),
            clustering_keys: address.clustering_keys().to_vec(),
            cell_names: cells.iter().map(|c| c.name.clone()).collect(),
            cell_values: cells.iter().map(|c| c.value.clone()).collect(),
        }),
        Operation::Delete(address) => to_body(&DeleteBody {
            table_name: address.table().to_string(),
            partition_key_names: address.partition_keys().to_vec(),
            clustering_keys_names: address.clustering_keys().to_vec(),
        }),
        Operation::Repair | Operation::FullRepair => to_body(&EmptyBody {}),
    }
    .map_err(unencodable)?;

    let kind = operation.kind();
    Ok(EncodedRequest {
        kind,
        path: kind.path(),
        body,
    })
}

/// Parse a request body received on `path` back into a validated operation
pub fn decode_request(path: &str, body: &[u8]) -> Result<Operation, DecodeError> {
    let kind = OperationKind::from_path(path).ok_or_else(|| DecodeError::UnknownPath(path.to_string()))?;

    let operation = match kind {
        OperationKind::Create => {
            let req: CreateBody = parse(body)?;
            Operation::create(&req.table_name, &req.partition_key_names, &req.clustering_key_names)
                .map_err(invalid)?
        }
        OperationKind::Read => {
            let req: ReadBody = parse(body)?;
            Operation::Read(
                key::normalize(&req.table_name, &req.partition_keys, &req.clustering_keys).map_err(invalid)?,
            )
        }
        OperationKind::Insert => {
            let req: InsertBody = parse(body)?;
            let address =
                key::normalize(&req.table_name, &req.partition_keys, &req.clustering_keys).map_err(invalid)?;
            let cells = Cell::pair(&req.cell_names, &req.cell_values).map_err(invalid)?;
            Operation::Insert { address, cells }
        }
        OperationKind::Delete => {
            let req: DeleteBody = parse(body)?;
            Operation::Delete(
                key::normalize(&req.table_name, &req.partition_key_names, &req.clustering_keys_names)
                    .map_err(invalid)?,
            )
        }
        OperationKind::Repair | OperationKind::FullRepair => {
            if !body.iter().all(u8::is_ascii_whitespace) {
                let value: serde_json::Value = parse(body)?;
                if !value.is_object() {
                    return Err(DecodeError::Malformed("repair body must be a JSON object".to_string()));
                }
            }
            if kind == OperationKind::Repair {
                Operation::Repair
            } else {
                Operation::FullRepair
            }
        }
    };

    Ok(operation)
}

/// Decode the body of a successful (2xx) response.
///
/// Reads yield every cell in order; a read with zero cells is reported as
/// [`DecodeError::Empty`] so callers can tell an absent row apart from a
/// failed round trip. Other verbs yield the body text as an [`Ack`].
pub fn decode_response(kind: OperationKind, body: &[u8]) -> Result<Response, DecodeError> {
    match kind {
        OperationKind::Read => {
            let response: ReadResponseBody = parse(body)?;
            if response.cells.is_empty() {
                return Err(DecodeError::Empty);
            }
            Ok(Response::Cells(response.cells))
        }
        _ => {
            let text = std::str::from_utf8(body)
                .map_err(|e| DecodeError::Malformed(format!("response is not UTF-8: {}", e)))?;
            Ok(Response::Ack(Ack {
                message: text.trim().to_string(),
            }))
        }
    }
}

/// Serialize a read result for the node side
pub fn encode_read_response(cells: &[Cell]) -> Result<Vec<u8>, serde_json::Error> {
    to_body(&ReadResponseBody {
        cells: cells.to_vec(),
    })
}

fn to_body<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

fn unencodable(err: serde_json::Error) -> ValidationError {
    ValidationError::Unencodable(err.to_string())
}

fn parse<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, DecodeError> {
    serde_json::from_slice(body).map_err(|e| DecodeError::Malformed(e.to_string()))
}

fn invalid(err: ValidationError) -> DecodeError {
    DecodeError::Malformed(err.to_string())
}
