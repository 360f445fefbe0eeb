use thiserror::Error;

/// Top level error type for the engine. Subsystems that need their own
/// vocabulary (crypto, catalogue, schema, query) define their own enum and
/// fold into this one with `#[from]`, mirroring how the per-file errors are
/// wrapped and re-raised through the acquisition/ingestion protocols.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Catalogue(#[from] CatalogueError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("an error occurred talking to the object store: {0}")]
    Storage(String),

    #[error("an error occurred talking to the document store")]
    Document(#[from] mongodb::error::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error("reporting error (non-fatal): {0}")]
    Reporting(String),
}

/// Fatal per-run error: a filename in the catalogue could not be parsed.
#[derive(Error, Debug)]
pub enum CatalogueError {
    #[error("could not parse a run timestamp out of key '{key}'")]
    UnparseableTimestamp { key: String },

    #[error("malformed prefix template for dataset '{dataset}': {reason}")]
    MalformedPrefix { dataset: String, reason: String },
}

/// Fatal per-file error: decryption failed authentication or was truncated.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("decryption authentication failed (tag mismatch)")]
    TagMismatch,

    #[error("encrypted stream truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: u64 },

    #[error("invalid password/salt material")]
    InvalidKeyMaterial,
}

/// Fatal per-file error: a required column is missing from the CSV header.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("missing required column(s) {missing:?}; available columns were {available:?}")]
    MissingColumns { missing: Vec<String>, available: Vec<String> },
}

/// Per-request error surfaced to a query caller; never mutates state.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("unsupported construct: {0}")]
    UnsupportedConstruct(String),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("invalid top: {0}")]
    InvalidTop(i64),

    #[error("invalid filter expression: {0}")]
    InvalidFilter(String),

    #[error("invalid order_by expression: {0}")]
    InvalidOrderBy(String),
}

/// Non-fatal per-row error. Counted and logged by the ingestion pipeline,
/// never propagated.
#[derive(Error, Debug)]
pub enum RowError {
    #[error("unrecognised change_type '{0}'")]
    UnknownChangeType(String),
}
