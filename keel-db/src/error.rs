//! Database error kinds.
//!
//! Transport-level kinds (parse, content negotiation, cid decode) abort the
//! request at the HTTP boundary; execution-level kinds (unknown field,
//! unknown collection) travel back inside the result envelope.

use keel_crdt::CrdtError;
use keel_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    // request surface
    #[error("body cannot be empty")]
    EmptyBody,

    #[error("missing GraphQL request")]
    MissingRequest,

    #[error("{0}")]
    ParseSyntax(String),

    #[error("unmarshal error: {0}")]
    Unmarshal(String),

    #[error("content type {0} not yet supported")]
    UnsupportedContentType(String),

    // schema surface
    #[error("invalid relation: {0}")]
    InvalidRelation(String),

    #[error("duplicate field. Name: {0}")]
    DuplicateField(String),

    #[error("unknown field kind: {0}")]
    UnknownKind(String),

    #[error("primary declared on both sides of relation: {0}")]
    PrimaryConflict(String),

    #[error("collection already exists. Name: {0}")]
    CollectionExists(String),

    // planning surface
    #[error("The given field does not exist. Name: {0}")]
    FieldUnknown(String),

    #[error("collection not found. Name: {0}")]
    CollectionUnknown(String),

    #[error("unknown explain request type")]
    UnknownExplainRequestType,

    #[error("unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("a document with the given key already exists. DocKey: {0}")]
    DocumentExists(String),

    #[error("related document does not exist. DocKey: {0}")]
    RelatedDocumentMissing(String),

    // runtime surface
    #[error("request canceled or deadline exceeded")]
    CanceledOrTimeout,

    #[error("cid decode error: {0}")]
    CidDecode(String),

    #[error("merge conflict could not be resolved: {0}")]
    MergeConflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crdt(#[from] CrdtError),
}

impl DbError {
    /// Execution-level errors are reported inside a 200 response envelope;
    /// everything else aborts the request with an HTTP status.
    pub fn is_execution_error(&self) -> bool {
        matches!(
            self,
            DbError::FieldUnknown(_)
                | DbError::CollectionUnknown(_)
                | DbError::UnknownExplainRequestType
                | DbError::UnsupportedOperator(_)
                | DbError::DocumentExists(_)
                | DbError::RelatedDocumentMissing(_)
                | DbError::Unmarshal(_)
        )
    }
}

pub type Result<T, E = DbError> = std::result::Result<T, E>;
