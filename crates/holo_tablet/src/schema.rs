//! Table schema: an ordered column list split into hash-key, range-key and
//! value columns.
//!
//! A `Schema` is immutable once built. Schema changes produce a new `Schema`
//! with the version bumped by one; tablets compare the version stamped on a
//! write against their current version before mutating anything.

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::value::DataType;

/// Stable identifier of a column within a table.
pub type ColumnId = u32;
/// Monotonic schema version of a table.
pub type SchemaVersion = u32;

/// Role a column plays in the primary key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    /// Equality-only key column that determines shard placement.
    Hash,
    /// Ordered key column that determines order within a hash partition.
    Range,
    /// Regular, nullable (unless `not_null`) value column.
    Value,
}

/// One column definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub id: ColumnId,
    pub name: String,
    pub data_type: DataType,
    pub kind: ColumnKind,
    /// Key columns are always not-null.
    pub not_null: bool,
}

impl ColumnSchema {
    pub fn is_key(&self) -> bool {
        self.kind != ColumnKind::Value
    }
}

/// Versioned table schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnSchema>,
    num_hash: usize,
    num_range: usize,
    version: SchemaVersion,
    next_column_id: ColumnId,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn hash_columns(&self) -> &[ColumnSchema] {
        &self.columns[..self.num_hash]
    }

    pub fn range_columns(&self) -> &[ColumnSchema] {
        &self.columns[self.num_hash..self.num_hash + self.num_range]
    }

    /// Hash columns followed by range columns.
    pub fn key_columns(&self) -> &[ColumnSchema] {
        &self.columns[..self.num_hash + self.num_range]
    }

    pub fn value_columns(&self) -> &[ColumnSchema] {
        &self.columns[self.num_hash + self.num_range..]
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_by_id(&self, id: ColumnId) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.id == id)
    }

    /// Return a copy of this schema with one more value column and the
    /// version bumped.
    pub fn with_added_column(
        &self,
        name: &str,
        data_type: DataType,
        not_null: bool,
    ) -> Result<Schema, SchemaError> {
        if self.column(name).is_some() {
            return Err(SchemaError::DuplicateColumn(name.to_string()));
        }
        let mut next = self.clone();
        next.columns.push(ColumnSchema {
            id: next.next_column_id,
            name: name.to_string(),
            data_type,
            kind: ColumnKind::Value,
            not_null,
        });
        next.next_column_id += 1;
        next.version += 1;
        Ok(next)
    }
}

/// Collects column declarations and produces a validated [`Schema`].
///
/// Declaration order is kept within each column kind; the built schema always
/// lists hash columns first, then range columns, then value columns.
#[derive(Clone, Debug, Default)]
pub struct SchemaBuilder {
    columns: Vec<(String, DataType, ColumnKind, bool)>,
}

impl SchemaBuilder {
    pub fn add_column(
        mut self,
        name: impl Into<String>,
        data_type: DataType,
        kind: ColumnKind,
        not_null: bool,
    ) -> Self {
        self.columns.push((name.into(), data_type, kind, not_null));
        self
    }

    pub fn hash_column(self, name: impl Into<String>, data_type: DataType) -> Self {
        self.add_column(name, data_type, ColumnKind::Hash, true)
    }

    pub fn range_column(self, name: impl Into<String>, data_type: DataType) -> Self {
        self.add_column(name, data_type, ColumnKind::Range, true)
    }

    pub fn column(self, name: impl Into<String>, data_type: DataType) -> Self {
        self.add_column(name, data_type, ColumnKind::Value, false)
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        let mut seen = std::collections::HashSet::new();
        for (name, ..) in &self.columns {
            if name.is_empty() {
                return Err(SchemaError::EmptyColumnName);
            }
            if !seen.insert(name.as_str()) {
                return Err(SchemaError::DuplicateColumn(name.clone()));
            }
        }

        let mut ordered = Vec::with_capacity(self.columns.len());
        for kind in [ColumnKind::Hash, ColumnKind::Range, ColumnKind::Value] {
            ordered.extend(self.columns.iter().filter(|c| c.2 == kind).cloned());
        }
        let num_hash = ordered.iter().filter(|c| c.2 == ColumnKind::Hash).count();
        let num_range = ordered.iter().filter(|c| c.2 == ColumnKind::Range).count();
        if num_hash == 0 {
            return Err(SchemaError::NoHashColumn);
        }

        let columns = ordered
            .into_iter()
            .enumerate()
            .map(|(idx, (name, data_type, kind, not_null))| ColumnSchema {
                id: idx as ColumnId,
                name,
                data_type,
                kind,
                not_null: not_null || kind != ColumnKind::Value,
            })
            .collect::<Vec<_>>();
        let next_column_id = columns.len() as ColumnId;
        Ok(Schema {
            columns,
            num_hash,
            num_range,
            version: 0,
            next_column_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Schema {
        Schema::builder()
            .column("c1", DataType::Int32)
            .range_column("r1", DataType::Int32)
            .hash_column("h1", DataType::Int32)
            .hash_column("h2", DataType::String)
            .build()
            .expect("build schema")
    }

    #[test]
    fn key_columns_are_ordered_first_and_not_null() {
        let schema = sample();
        let names = schema
            .columns()
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["h1", "h2", "r1", "c1"]);
        assert_eq!(schema.hash_columns().len(), 2);
        assert_eq!(schema.range_columns().len(), 1);
        assert!(schema.key_columns().iter().all(|c| c.not_null));
        assert!(!schema.value_columns()[0].not_null);
    }

    #[test]
    fn build_requires_a_hash_column_and_unique_names() {
        let err = Schema::builder()
            .range_column("r1", DataType::Int32)
            .build()
            .expect_err("no hash column");
        assert_eq!(err, SchemaError::NoHashColumn);

        let err = Schema::builder()
            .hash_column("k", DataType::Int32)
            .column("k", DataType::String)
            .build()
            .expect_err("duplicate column");
        assert_eq!(err, SchemaError::DuplicateColumn("k".to_string()));
    }

    #[test]
    fn adding_a_column_bumps_the_version() {
        let schema = sample();
        let next = schema
            .with_added_column("c3", DataType::Int32, true)
            .expect("add column");
        assert_eq!(next.version(), schema.version() + 1);
        let c3 = next.column("c3").expect("c3 present");
        assert_eq!(c3.id, 4);
        assert!(c3.not_null);
        assert!(next.with_added_column("c3", DataType::Int32, false).is_err());
    }
}
