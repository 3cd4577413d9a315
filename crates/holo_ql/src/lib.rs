//! Client side of conditional DML: partition routing, the table catalog, an
//! in-process cluster of tablet servers, table handles and sessions.
//!
//! ```text
//! Cluster ── Master ── Catalog (tables, schemas, partitions)
//!    │
//!    └── TabletServer* ── Tablet* (holo_tablet)
//!            ▲
//! Client ── Session ── TabletTransport
//! ```

pub mod catalog;
pub mod client;
pub mod cluster;
pub mod config;
pub mod error;
pub mod master;
pub mod op;
pub mod partition;
pub mod server;
pub mod session;

pub use catalog::TableDesc;
pub use client::{AlterTable, Client, Table};
pub use cluster::Cluster;
pub use config::{
    ClientConfig, ClusterConfig, FlushMode, SessionConfig, StorageBackend,
    DEFAULT_SESSION_TIMEOUT,
};
pub use error::QlError;
pub use op::{Operation, ReadOp, Statement, StatementKind, WriteOp};
pub use partition::{PartitionScheme, Route, TabletDesc};
pub use server::{LocalTransport, ServerId, TabletServer, TabletTransport};
pub use session::{FlushHandle, FlushSummary, Session, SessionState};

pub use holo_tablet::{
    CompareOp, Condition, DataType, LogicalOp, QlResponse, ResponseStatus, Row, RowBlock, Schema,
    Value, WriteKind, APPLIED_COLUMN,
};
