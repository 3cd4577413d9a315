use thiserror::Error;

use crate::keys::HashCode;

/// Failure evaluating a condition against a row.
///
/// The display text is what callers see in a `RuntimeError` response.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("values not comparable")]
    ValuesNotComparable,
    #[error("unknown column {0}")]
    UnknownColumn(String),
    #[error("logical condition has no operands")]
    EmptyLogical,
}

/// Invalid schema definition or alteration.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("schema requires at least one hash key column")]
    NoHashColumn,
    #[error("duplicate column {0}")]
    DuplicateColumn(String),
    #[error("column name must not be empty")]
    EmptyColumnName,
}

/// Errors a tablet reports instead of a response.
///
/// Everything about the op's own semantics is carried in the response
/// status; these cover cases where the op reached the wrong tablet.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TabletError {
    #[error("tablet {tablet_id} does not own hash code {hash_code}")]
    WrongTablet { tablet_id: u64, hash_code: HashCode },
}
