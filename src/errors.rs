use thiserror::Error;

/// Errors surfaced to callers of the assembler and the connection table.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("invalid assembler options: {0}")]
    InvalidOptions(String),

    #[error("stream factory returned no consumer")]
    NilStream,

    #[error("connection limit exceeded")]
    ConnectionLimit,

    #[error("page pool exhausted")]
    PoolExhausted,

    #[error("assembler is closed")]
    Closed,
}
