use std::time::Duration;

use holo_tablet::{SchemaError, TabletId};
use thiserror::Error;

/// Errors surfaced by the client, catalog and session APIs.
///
/// Per-op outcomes (stale schema, failed guard evaluation, timeouts) are
/// reported through each op's response; these errors cover calls that could
/// not be carried out at all.
#[derive(Debug, Error)]
pub enum QlError {
    #[error("table {0} not found")]
    TableNotFound(String),
    #[error("table {0} already exists")]
    TableAlreadyExists(String),
    #[error("invalid schema: {0}")]
    Schema(#[from] SchemaError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("tablet {0} not found")]
    TabletNotFound(TabletId),
    #[error("cannot change flush mode with {0} buffered operations")]
    PendingOperations(usize),
    #[error("session is in an errored state")]
    SessionErrored,
    #[error("client is closed")]
    ClientClosed,
    #[error("flush timed out after {timeout:?} with {outstanding} outstanding operations")]
    Timeout {
        timeout: Duration,
        outstanding: usize,
    },
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
