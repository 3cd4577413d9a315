//! Read and write requests as they reach a tablet.

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::schema::SchemaVersion;
use crate::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

/// A value column assignment. For deletes only the column name matters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnValue {
    pub column: String,
    pub value: Value,
}

/// Single-row mutation.
///
/// INSERT and UPDATE share one upsert path; columns missing from
/// `column_values` keep their current value. A DELETE clears the columns
/// named in `column_values`, or the whole row when none are named.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub kind: WriteKind,
    pub schema_version: SchemaVersion,
    pub hash_values: Vec<Value>,
    pub range_values: Vec<Value>,
    pub column_values: Vec<ColumnValue>,
    /// Compare-and-set guard.
    pub if_expr: Option<Condition>,
    /// Value columns returned with the `[applied]` flag of a guarded write.
    pub column_refs: Vec<String>,
}

impl WriteRequest {
    pub fn new(kind: WriteKind, schema_version: SchemaVersion) -> Self {
        Self {
            kind,
            schema_version,
            hash_values: Vec::new(),
            range_values: Vec::new(),
            column_values: Vec::new(),
            if_expr: None,
            column_refs: Vec::new(),
        }
    }

    pub fn add_hash_value(&mut self, value: impl Into<Value>) -> &mut Self {
        self.hash_values.push(value.into());
        self
    }

    pub fn add_range_value(&mut self, value: impl Into<Value>) -> &mut Self {
        self.range_values.push(value.into());
        self
    }

    /// Set a value column, replacing an earlier assignment to the same column.
    pub fn set_column(&mut self, column: &str, value: impl Into<Value>) -> &mut Self {
        let value = value.into();
        match self.column_values.iter_mut().find(|cv| cv.column == column) {
            Some(existing) => existing.value = value,
            None => self.column_values.push(ColumnValue {
                column: column.to_string(),
                value,
            }),
        }
        self
    }

    /// Name a column for a DELETE to clear.
    pub fn clear_column(&mut self, column: &str) -> &mut Self {
        self.set_column(column, Value::Null)
    }

    pub fn set_if_expr(&mut self, condition: Condition) -> &mut Self {
        self.if_expr = Some(condition);
        self
    }

    pub fn if_expr_mut(&mut self) -> Option<&mut Condition> {
        self.if_expr.as_mut()
    }

    pub fn add_column_ref(&mut self, column: &str) -> &mut Self {
        if !self.column_refs.iter().any(|c| c == column) {
            self.column_refs.push(column.to_string());
        }
        self
    }
}

/// Filtered scan of one hash partition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub schema_version: SchemaVersion,
    pub hash_values: Vec<Value>,
    pub where_expr: Option<Condition>,
    /// Projection. Empty selects every column in schema order.
    pub selected_columns: Vec<String>,
    /// `None` and `Some(0)` both mean no limit.
    pub limit: Option<u64>,
    /// Return rows in descending range-key order.
    pub reverse: bool,
}

impl ReadRequest {
    pub fn new(schema_version: SchemaVersion) -> Self {
        Self {
            schema_version,
            hash_values: Vec::new(),
            where_expr: None,
            selected_columns: Vec::new(),
            limit: None,
            reverse: false,
        }
    }

    pub fn add_hash_value(&mut self, value: impl Into<Value>) -> &mut Self {
        self.hash_values.push(value.into());
        self
    }

    pub fn set_where_expr(&mut self, condition: Condition) -> &mut Self {
        self.where_expr = Some(condition);
        self
    }

    pub fn where_expr_mut(&mut self) -> Option<&mut Condition> {
        self.where_expr.as_mut()
    }

    pub fn add_columns<I, S>(&mut self, columns: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.selected_columns
            .extend(columns.into_iter().map(Into::into));
        self
    }

    pub fn set_limit(&mut self, limit: u64) -> &mut Self {
        self.limit = Some(limit);
        self
    }

    pub fn set_reverse(&mut self, reverse: bool) -> &mut Self {
        self.reverse = reverse;
        self
    }

    /// Effective row limit, `None` meaning unlimited.
    pub fn effective_limit(&self) -> Option<usize> {
        match self.limit {
            None | Some(0) => None,
            Some(n) => Some(usize::try_from(n).unwrap_or(usize::MAX)),
        }
    }
}

/// A request addressed to one tablet.
#[derive(Clone, Debug, PartialEq)]
pub enum TabletRequest {
    Write(WriteRequest),
    Read(ReadRequest),
}

impl TabletRequest {
    pub fn hash_values(&self) -> &[Value] {
        match self {
            TabletRequest::Write(req) => &req.hash_values,
            TabletRequest::Read(req) => &req.hash_values,
        }
    }
}
