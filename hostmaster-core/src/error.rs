//! Error types for hostmaster-core.

use thiserror::Error;

/// Errors raised while interpreting table names and party identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A table name did not match any known [`crate::TableId`].
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    /// An account or host identifier was empty or only whitespace.
    #[error("blank {kind} identifier")]
    BlankIdentifier { kind: &'static str },
}
