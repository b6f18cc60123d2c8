use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("oracle output unusable: {0}")]
    OracleFormat(String),
    #[error("malformed intent: {0}")]
    MalformedIntent(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, QueryError>;
