//! Stored row payload.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::schema::ColumnId;
use crate::value::Value;

static NULL: Value = Value::Null;

/// Cells of one stored row, keyed by column id.
///
/// Key columns are stored alongside value columns so a scan never has to
/// decode the row key. Null cells are simply absent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredRow {
    cells: BTreeMap<ColumnId, Value>,
}

impl StoredRow {
    pub fn get(&self, id: ColumnId) -> &Value {
        self.cells.get(&id).unwrap_or(&NULL)
    }

    pub fn set(&mut self, id: ColumnId, value: Value) {
        if value.is_null() {
            self.cells.remove(&id);
        } else {
            self.cells.insert(id, value);
        }
    }

    pub fn clear(&mut self, id: ColumnId) {
        self.cells.remove(&id);
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
