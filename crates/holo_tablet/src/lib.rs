//! Tablet-side execution for conditional DML.
//!
//! This crate holds everything a single shard needs: the versioned schema,
//! typed values, the condition tree, the request/response model, row-key
//! encoding, storage engines, and the [`Tablet`] that applies guarded writes
//! and executes filtered reads.

pub mod condition;
pub mod error;
pub mod keys;
pub mod load;
pub mod request;
pub mod response;
pub mod row;
pub mod schema;
pub mod storage;
pub mod tablet;
pub mod value;

pub use condition::{CompareOp, Condition, LogicalOp};
pub use error::{EvalError, SchemaError, TabletError};
pub use keys::{hash_code, HashCode, HashRange, HASH_SPACE};
pub use load::TabletLoadSnapshot;
pub use request::{ColumnValue, ReadRequest, TabletRequest, WriteKind, WriteRequest};
pub use response::{QlResponse, ResponseStatus, Row, RowBlock, RowBlockColumn, APPLIED_COLUMN};
pub use schema::{ColumnId, ColumnKind, ColumnSchema, Schema, SchemaBuilder, SchemaVersion};
pub use storage::{FjallRowStorage, MemoryRowStorage, RowStorage};
pub use tablet::{TableId, Tablet, TabletId};
pub use value::{DataType, TypeFamily, Value};
