//! Per-shard execution: the conditional apply engine and read execution.
//!
//! A tablet owns one contiguous hash range of one table. Writes run
//! read-check-mutate under a striped row lock so two writes to the same row
//! identity never interleave; reads take a single storage scan over one hash
//! partition, narrowed by whatever range-key bounds the filter pins down.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::condition::{CompareOp, Condition};
use crate::error::TabletError;
use crate::keys::{encode_value, prefix_end, HashCode, HashRange, RowKey};
use crate::load::TabletLoad;
use crate::request::{ReadRequest, TabletRequest, WriteKind, WriteRequest};
use crate::response::{QlResponse, ResponseStatus, Row, RowBlock, RowBlockColumn, APPLIED_COLUMN};
use crate::row::StoredRow;
use crate::schema::{ColumnId, ColumnKind, ColumnSchema, Schema};
use crate::storage::{IterStats, RowStorage, StorageBatch};
use crate::value::{DataType, Value};

pub type TabletId = u64;
pub type TableId = u64;

const ROW_LOCK_STRIPES: usize = 64;

pub struct Tablet {
    id: TabletId,
    table_id: TableId,
    schema: RwLock<Arc<Schema>>,
    hash_range: RwLock<HashRange>,
    storage: Arc<dyn RowStorage>,
    row_locks: Vec<Mutex<()>>,
    // Writers and readers share it; a split takes it exclusively while rows move.
    split_lock: RwLock<()>,
    load: TabletLoad,
}

/// Resolved row identity: its encoded key plus the typed key cells.
struct Identity {
    key: RowKey,
    cells: Vec<(ColumnId, Value)>,
}

impl Identity {
    fn resolve(
        schema: &Schema,
        hash_values: &[Value],
        range_values: &[Value],
    ) -> Result<Self, String> {
        let hash = cast_key_values(schema.hash_columns(), hash_values, "hash")?;
        let range = cast_key_values(schema.range_columns(), range_values, "range")?;
        let key = RowKey::new(&hash, &range).map_err(|err| err.to_string())?;
        let cells = schema
            .key_columns()
            .iter()
            .map(|c| c.id)
            .zip(hash.into_iter().chain(range))
            .collect();
        Ok(Self { key, cells })
    }

    fn new_row(&self) -> StoredRow {
        let mut row = StoredRow::default();
        for (id, value) in &self.cells {
            row.set(*id, value.clone());
        }
        row
    }
}

fn cast_key_values(
    columns: &[ColumnSchema],
    values: &[Value],
    kind: &str,
) -> Result<Vec<Value>, String> {
    if columns.len() != values.len() {
        return Err(format!(
            "expected {} {kind} key values, got {}",
            columns.len(),
            values.len()
        ));
    }
    columns
        .iter()
        .zip(values)
        .map(|(col, value)| {
            if value.is_null() {
                return Err(format!("key column {} must not be null", col.name));
            }
            value
                .cast(col.data_type)
                .ok_or_else(|| invalid_value(col, value))
        })
        .collect()
}

fn invalid_value(col: &ColumnSchema, value: &Value) -> String {
    format!(
        "invalid value {value} for column {}: expected {}",
        col.name, col.data_type
    )
}

fn resolve_assignments(
    schema: &Schema,
    req: &WriteRequest,
) -> Result<Vec<(ColumnId, Value)>, String> {
    req.column_values
        .iter()
        .map(|cv| {
            let col = schema
                .column(&cv.column)
                .ok_or_else(|| format!("unknown column {}", cv.column))?;
            if col.kind != ColumnKind::Value {
                return Err(format!("cannot modify key column {}", col.name));
            }
            let value = match req.kind {
                WriteKind::Delete => Value::Null,
                WriteKind::Insert | WriteKind::Update => cv
                    .value
                    .cast(col.data_type)
                    .ok_or_else(|| invalid_value(col, &cv.value))?,
            };
            if value.is_null() && col.not_null {
                return Err(format!("null value for not-null column {}", col.name));
            }
            Ok((col.id, value))
        })
        .collect()
}

fn runtime_error(message: impl ToString) -> QlResponse {
    QlResponse::error(ResponseStatus::RuntimeError, message.to_string())
}

impl Tablet {
    pub fn new(
        id: TabletId,
        table_id: TableId,
        schema: Arc<Schema>,
        hash_range: HashRange,
        storage: Arc<dyn RowStorage>,
    ) -> Self {
        Self {
            id,
            table_id,
            schema: RwLock::new(schema),
            hash_range: RwLock::new(hash_range),
            storage,
            row_locks: (0..ROW_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            split_lock: RwLock::new(()),
            load: TabletLoad::default(),
        }
    }

    pub fn id(&self) -> TabletId {
        self.id
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.schema
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install a newer schema; older or equal versions are ignored.
    pub fn update_schema(&self, schema: Arc<Schema>) {
        let mut current = self.schema.write().unwrap_or_else(PoisonError::into_inner);
        if schema.version() > current.version() {
            debug!(
                tablet_id = self.id,
                from = current.version(),
                to = schema.version(),
                "tablet schema updated"
            );
            *current = schema;
        }
    }

    pub fn hash_range(&self) -> HashRange {
        *self.hash_range.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_hash_range(&self, range: HashRange) {
        *self.hash_range.write().unwrap_or_else(PoisonError::into_inner) = range;
    }

    pub fn load(&self) -> &TabletLoad {
        &self.load
    }

    pub fn iter_stats(&self) -> &IterStats {
        self.storage.iter_stats()
    }

    pub fn execute(&self, request: &TabletRequest) -> Result<QlResponse, TabletError> {
        match request {
            TabletRequest::Write(req) => self.write(req),
            TabletRequest::Read(req) => self.read(req),
        }
    }

    fn check_owned(&self, hash_code: HashCode) -> Result<(), TabletError> {
        if self.hash_range().contains(hash_code) {
            Ok(())
        } else {
            Err(TabletError::WrongTablet {
                tablet_id: self.id,
                hash_code,
            })
        }
    }

    fn row_lock(&self, key: &[u8]) -> MutexGuard<'_, ()> {
        let idx = crc32fast::hash(key) as usize % self.row_locks.len();
        self.row_locks[idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one write with single-row atomicity.
    pub fn write(&self, req: &WriteRequest) -> Result<QlResponse, TabletError> {
        let schema = self.schema();
        if req.schema_version != schema.version() {
            debug!(
                tablet_id = self.id,
                request_version = req.schema_version,
                current_version = schema.version(),
                "rejecting write with stale schema version"
            );
            return Ok(QlResponse::error(
                ResponseStatus::SchemaVersionMismatch,
                format!(
                    "schema version mismatch: request has {}, table is at {}",
                    req.schema_version,
                    schema.version()
                ),
            ));
        }
        let identity = match Identity::resolve(&schema, &req.hash_values, &req.range_values) {
            Ok(identity) => identity,
            Err(msg) => return Ok(runtime_error(msg)),
        };
        let assignments = match resolve_assignments(&schema, req) {
            Ok(assignments) => assignments,
            Err(msg) => return Ok(runtime_error(msg)),
        };
        if let Some(guard) = &req.if_expr {
            if let Err(err) = guard.validate(&schema) {
                return Ok(runtime_error(err));
            }
        }
        if let Some(missing) = req.column_refs.iter().find(|c| schema.column(c).is_none()) {
            return Ok(runtime_error(format!("unknown column {missing}")));
        }

        let _split = self.split_lock.read().unwrap_or_else(PoisonError::into_inner);
        self.check_owned(identity.key.hash_code)?;
        let _row = self.row_lock(&identity.key.key);

        let current = match self.load_row(&identity.key.key) {
            Ok(row) => row,
            Err(err) => {
                warn!(tablet_id = self.id, error = ?err, "row lookup failed");
                return Ok(runtime_error(format!("storage error: {err}")));
            }
        };
        let applied = match &req.if_expr {
            None => true,
            Some(guard) => match guard.evaluate(&schema, current.as_ref()) {
                Ok(applied) => applied,
                Err(err) => return Ok(runtime_error(err)),
            },
        };
        let resulting = if applied {
            match self.mutate(&identity, req.kind, &assignments, current) {
                Ok(row) => row,
                Err(err) => {
                    warn!(tablet_id = self.id, error = ?err, "row mutation failed");
                    return Ok(runtime_error(format!("storage error: {err}")));
                }
            }
        } else {
            current
        };
        self.load.record_write();

        let rows = match &req.if_expr {
            Some(_) => guard_result(
                &schema,
                &identity,
                &req.column_refs,
                applied,
                resulting.as_ref(),
            ),
            None => RowBlock::default(),
        };
        Ok(QlResponse::ok(rows))
    }

    fn load_row(&self, key: &[u8]) -> anyhow::Result<Option<StoredRow>> {
        self.storage
            .get(key)?
            .map(|bytes| StoredRow::decode(&bytes))
            .transpose()
    }

    fn mutate(
        &self,
        identity: &Identity,
        kind: WriteKind,
        assignments: &[(ColumnId, Value)],
        current: Option<StoredRow>,
    ) -> anyhow::Result<Option<StoredRow>> {
        let key = &identity.key.key;
        match kind {
            WriteKind::Insert | WriteKind::Update => {
                let mut row = current.unwrap_or_else(|| identity.new_row());
                for (id, value) in assignments {
                    row.set(*id, value.clone());
                }
                self.storage.put(key, &row.encode()?)?;
                Ok(Some(row))
            }
            WriteKind::Delete if assignments.is_empty() => {
                self.storage.delete(key)?;
                Ok(None)
            }
            WriteKind::Delete => {
                let Some(mut row) = current else {
                    return Ok(None);
                };
                for (id, _) in assignments {
                    row.clear(*id);
                }
                self.storage.put(key, &row.encode()?)?;
                Ok(Some(row))
            }
        }
    }

    /// Scan one hash partition and return the matching, projected rows.
    pub fn read(&self, req: &ReadRequest) -> Result<QlResponse, TabletError> {
        let schema = self.schema();
        let hash = match cast_key_values(schema.hash_columns(), &req.hash_values, "hash") {
            Ok(hash) => hash,
            Err(msg) => return Ok(runtime_error(msg)),
        };
        let (hash_code, prefix) = match RowKey::partition(&hash) {
            Ok(partition) => partition,
            Err(err) => return Ok(runtime_error(err)),
        };
        let projection = match resolve_projection(&schema, &req.selected_columns) {
            Ok(projection) => projection,
            Err(msg) => return Ok(runtime_error(msg)),
        };
        if let Some(filter) = &req.where_expr {
            if let Err(err) = filter.validate(&schema) {
                return Ok(runtime_error(err));
            }
        }

        let _split = self.split_lock.read().unwrap_or_else(PoisonError::into_inner);
        self.check_owned(hash_code)?;

        let (start, end) = scan_bounds(&schema, &prefix, req.where_expr.as_ref());
        let limit = req.effective_limit();
        let mut block = RowBlock::new(
            projection
                .iter()
                .map(|c| RowBlockColumn {
                    name: c.name.clone(),
                    data_type: c.data_type,
                })
                .collect(),
        );
        let scan = match self.storage.scan(&start, end.as_deref(), req.reverse) {
            Ok(scan) => scan,
            Err(err) => {
                warn!(tablet_id = self.id, error = ?err, "scan open failed");
                return Ok(runtime_error(format!("storage error: {err}")));
            }
        };
        let mut scanned = 0u64;
        for item in scan {
            let row = match item.and_then(|(_, bytes)| StoredRow::decode(&bytes)) {
                Ok(row) => row,
                Err(err) => {
                    warn!(tablet_id = self.id, error = ?err, "scan failed");
                    return Ok(runtime_error(format!("storage error: {err}")));
                }
            };
            scanned += 1;
            let keep = match &req.where_expr {
                None => true,
                Some(filter) => match filter.evaluate(&schema, Some(&row)) {
                    Ok(keep) => keep,
                    Err(err) => return Ok(runtime_error(err)),
                },
            };
            if !keep {
                continue;
            }
            block.push(Row::new(
                projection.iter().map(|c| row.get(c.id).clone()).collect(),
            ));
            if limit.is_some_and(|limit| block.row_count() >= limit) {
                break;
            }
        }
        self.load.record_read(scanned, block.row_count() as u64);
        Ok(QlResponse::ok(block))
    }

    /// Move every row whose hash code is at or above `split_at` into
    /// `target`, then shrink this tablet's range to end at `split_at`.
    ///
    /// `target` takes over `[split_at, old_end)`. `commit` runs once the rows
    /// are copied and before this tablet starts rejecting the upper half, so
    /// whatever it publishes is visible to writers bounced by the split. If
    /// `commit` fails the copied rows are removed from `target` and this
    /// tablet keeps its full range. Returns the moved row count.
    pub fn split_into<F>(
        &self,
        split_at: u32,
        target: &Tablet,
        commit: F,
    ) -> anyhow::Result<usize>
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        let _split = self.split_lock.write().unwrap_or_else(PoisonError::into_inner);
        let range = self.hash_range();
        anyhow::ensure!(
            split_at > range.start && split_at < range.end,
            "split point {split_at} outside tablet {} range [{}, {})",
            self.id,
            range.start,
            range.end
        );
        let upper = HashRange {
            start: split_at,
            end: range.end,
        };
        let (start, end) = upper.key_bounds();

        // Snapshot the moving rows before touching either side.
        let mut moved = StorageBatch::default();
        let mut removed = StorageBatch::default();
        for item in self.storage.scan(&start, end.as_deref(), false)? {
            let (key, value) = item?;
            removed.deletes.push(key.clone());
            moved.puts.push((key, value));
        }
        let count = moved.puts.len();
        target.storage.apply_batch(moved)?;
        target.set_hash_range(upper);

        if let Err(err) = commit() {
            warn!(
                tablet_id = self.id,
                target_tablet_id = target.id,
                error = ?err,
                "tablet split not committed; rolling back"
            );
            let rollback = StorageBatch {
                puts: Vec::new(),
                deletes: removed.deletes,
            };
            target.storage.apply_batch(rollback)?;
            return Err(err);
        }

        self.storage.apply_batch(removed)?;
        self.set_hash_range(HashRange {
            start: range.start,
            end: split_at,
        });
        info!(
            tablet_id = self.id,
            target_tablet_id = target.id,
            split_at,
            moved = count,
            "tablet split"
        );
        Ok(count)
    }

    /// Drop all rows of this tablet from storage.
    pub fn destroy(&self) -> anyhow::Result<()> {
        self.storage.destroy()
    }
}

fn resolve_projection(schema: &Schema, selected: &[String]) -> Result<Vec<ColumnSchema>, String> {
    if selected.is_empty() {
        return Ok(schema.columns().to_vec());
    }
    selected
        .iter()
        .map(|name| {
            schema
                .column(name)
                .cloned()
                .ok_or_else(|| format!("unknown column {name}"))
        })
        .collect()
}

/// `[applied]`, every key column, then the referenced value columns in
/// schema order, all reflecting the row as it stands after the attempt.
fn guard_result(
    schema: &Schema,
    identity: &Identity,
    column_refs: &[String],
    applied: bool,
    row: Option<&StoredRow>,
) -> RowBlock {
    let mut columns = vec![RowBlockColumn {
        name: APPLIED_COLUMN.to_string(),
        data_type: DataType::Bool,
    }];
    let mut cells = vec![Value::Bool(applied)];
    for (col, (_, value)) in schema.key_columns().iter().zip(&identity.cells) {
        columns.push(RowBlockColumn {
            name: col.name.clone(),
            data_type: col.data_type,
        });
        cells.push(value.clone());
    }
    for col in schema
        .value_columns()
        .iter()
        .filter(|c| column_refs.iter().any(|r| *r == c.name))
    {
        columns.push(RowBlockColumn {
            name: col.name.clone(),
            data_type: col.data_type,
        });
        cells.push(row.map_or(Value::Null, |row| row.get(col.id).clone()));
    }
    let mut block = RowBlock::new(columns);
    block.push(Row::new(cells));
    block
}

/// Narrow the partition scan using the filter's top-level conjuncts.
///
/// Equalities on a leading run of range columns extend the key prefix; the
/// first range column without an equality contributes its bounds. Literals
/// that do not convert exactly to the column type are left to evaluation.
fn scan_bounds(
    schema: &Schema,
    partition_prefix: &[u8],
    filter: Option<&Condition>,
) -> (Vec<u8>, Option<Vec<u8>>) {
    let conjuncts = filter.map(Condition::conjuncts).unwrap_or_default();
    let literal_for = |col: &ColumnSchema, cond: &Condition| -> Option<(CompareOp, Value)> {
        match cond {
            Condition::Comparison { column, op, value } if *column == col.name => value
                .cast(col.data_type)
                .filter(|v| !v.is_null())
                .map(|v| (*op, v)),
            _ => None,
        }
    };

    let mut prefix = partition_prefix.to_vec();
    for col in schema.range_columns() {
        let equal = conjuncts.iter().copied().find_map(|cond| match literal_for(col, cond) {
            Some((CompareOp::Equal, value)) => Some(value),
            _ => None,
        });
        if let Some(value) = equal {
            if encode_value(&mut prefix, &value).is_err() {
                break;
            }
            continue;
        }

        let mut lower = prefix.clone();
        let mut upper = prefix_end(&prefix);
        for (op, value) in conjuncts
            .iter()
            .copied()
            .filter_map(|cond| literal_for(col, cond))
        {
            let mut bound = prefix.clone();
            if encode_value(&mut bound, &value).is_err() {
                continue;
            }
            match op {
                CompareOp::GreaterEqual => lower = lower.max(bound),
                CompareOp::Greater => {
                    if let Some(after) = prefix_end(&bound) {
                        lower = lower.max(after);
                    }
                }
                CompareOp::Less => upper = tighter_upper(upper, Some(bound)),
                CompareOp::LessEqual => upper = tighter_upper(upper, prefix_end(&bound)),
                CompareOp::Equal | CompareOp::NotEqual => {}
            }
        }
        return (lower, upper);
    }
    let end = prefix_end(&prefix);
    (prefix, end)
}

fn tighter_upper(current: Option<Vec<u8>>, candidate: Option<Vec<u8>>) -> Option<Vec<u8>> {
    match (current, candidate) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}
