//! Op responses and row blocks.

use serde::{Deserialize, Serialize};

use crate::value::{DataType, Value};

/// Name of the flag column leading a guarded write's result row.
pub const APPLIED_COLUMN: &str = "[applied]";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseStatus {
    Ok,
    SchemaVersionMismatch,
    RuntimeError,
    Timeout,
    SessionError,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RowBlockColumn {
    pub name: String,
    pub data_type: DataType,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    cells: Vec<Value>,
}

impl Row {
    pub fn new(cells: Vec<Value>) -> Self {
        Self { cells }
    }

    pub fn cells(&self) -> &[Value] {
        &self.cells
    }

    /// Cell at `index`, or null past the end.
    pub fn column(&self, index: usize) -> &Value {
        static NULL: Value = Value::Null;
        self.cells.get(index).unwrap_or(&NULL)
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Result rows with their column layout.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RowBlock {
    columns: Vec<RowBlockColumn>,
    rows: Vec<Row>,
}

impl RowBlock {
    pub fn new(columns: Vec<RowBlockColumn>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[RowBlockColumn] {
        &self.columns
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<&Row> {
        self.rows.get(index)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.rows.is_empty()
    }
}

/// Terminal outcome of one op.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QlResponse {
    status: ResponseStatus,
    error_message: Option<String>,
    rows: RowBlock,
}

impl QlResponse {
    pub fn ok(rows: RowBlock) -> Self {
        Self {
            status: ResponseStatus::Ok,
            error_message: None,
            rows,
        }
    }

    pub fn error(status: ResponseStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            error_message: Some(message.into()),
            rows: RowBlock::default(),
        }
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// Error message, empty for successful ops.
    pub fn error_message(&self) -> &str {
        self.error_message.as_deref().unwrap_or_default()
    }

    pub fn rows(&self) -> &RowBlock {
        &self.rows
    }

    pub fn into_rows(self) -> RowBlock {
        self.rows
    }

    /// The `[applied]` flag of a guarded write, if this response carries one.
    pub fn applied(&self) -> Option<bool> {
        if self.rows.columns.first()?.name != APPLIED_COLUMN {
            return None;
        }
        self.rows.row(0)?.column(0).as_bool()
    }
}
