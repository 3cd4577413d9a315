//! Hash partitioning of a table across tablets.
//!
//! The 16-bit hash code space is cut into contiguous, non-overlapping ranges,
//! one per tablet, sorted by start. Routing a row is a pure function of the
//! scheme and the row's hash-key values, so the same values land on the same
//! tablet across clients and restarts for as long as the scheme is unchanged.

use serde::{Deserialize, Serialize};

use holo_tablet::{hash_code, HashCode, HashRange, Schema, TabletId, Value, HASH_SPACE};

use crate::error::QlError;

/// Placement of one tablet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletDesc {
    pub tablet_id: TabletId,
    pub hash_range: HashRange,
    /// Index of the tablet server hosting the tablet.
    pub server: usize,
}

/// Where an op must be sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Route {
    pub tablet_id: TabletId,
    pub server: usize,
    pub hash_code: HashCode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionScheme {
    tablets: Vec<TabletDesc>,
    /// Bumped on every split so caches can tell newer layouts apart.
    epoch: u64,
}

impl PartitionScheme {
    /// Split the hash space evenly into `num_tablets` ranges, assigning
    /// tablet ids from `first_tablet_id` and servers round-robin.
    pub fn hash_partitions(num_tablets: usize, first_tablet_id: TabletId, servers: usize) -> Self {
        let count = num_tablets.clamp(1, HASH_SPACE as usize) as u64;
        let servers = servers.max(1);
        let space = u64::from(HASH_SPACE);
        let tablets = (0..count)
            .map(|idx| TabletDesc {
                tablet_id: first_tablet_id + idx,
                hash_range: HashRange {
                    start: (idx * space / count) as u32,
                    end: ((idx + 1) * space / count) as u32,
                },
                server: idx as usize % servers,
            })
            .collect();
        Self { tablets, epoch: 1 }
    }

    pub fn tablets(&self) -> &[TabletDesc] {
        &self.tablets
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn tablet(&self, tablet_id: TabletId) -> Option<&TabletDesc> {
        self.tablets.iter().find(|t| t.tablet_id == tablet_id)
    }

    pub fn tablet_for_hash(&self, code: HashCode) -> Option<&TabletDesc> {
        let code = u32::from(code);
        let idx = self
            .tablets
            .partition_point(|t| t.hash_range.start <= code)
            .checked_sub(1)?;
        let tablet = &self.tablets[idx];
        (code < tablet.hash_range.end).then_some(tablet)
    }

    /// Map a row's hash-key values to the tablet owning it.
    ///
    /// Values are converted to the declared column types first so that, for
    /// example, an `Int64` literal for an `INT32` column hashes like the
    /// stored value.
    pub fn route(&self, schema: &Schema, hash_values: &[Value]) -> Result<Route, QlError> {
        let columns = schema.hash_columns();
        if columns.len() != hash_values.len() {
            return Err(QlError::InvalidRequest(format!(
                "expected {} hash key values, got {}",
                columns.len(),
                hash_values.len()
            )));
        }
        let mut typed = Vec::with_capacity(hash_values.len());
        for (col, value) in columns.iter().zip(hash_values) {
            let cast = value
                .cast(col.data_type)
                .filter(|v| !v.is_null())
                .ok_or_else(|| {
                    QlError::InvalidRequest(format!(
                        "invalid hash key value {value} for column {} ({})",
                        col.name, col.data_type
                    ))
                })?;
            typed.push(cast);
        }
        let code = hash_code(&typed)?;
        let tablet = self.tablet_for_hash(code).ok_or_else(|| {
            QlError::InvalidRequest(format!("no tablet owns hash code {code}"))
        })?;
        Ok(Route {
            tablet_id: tablet.tablet_id,
            server: tablet.server,
            hash_code: code,
        })
    }

    /// Split `tablet_id` at the midpoint of its range. The upper half goes to
    /// `new_tablet_id` on `server`. Returns the split point.
    pub fn split(
        &mut self,
        tablet_id: TabletId,
        new_tablet_id: TabletId,
        server: usize,
    ) -> anyhow::Result<u32> {
        let idx = self
            .tablets
            .iter()
            .position(|t| t.tablet_id == tablet_id)
            .ok_or_else(|| anyhow::anyhow!("tablet {tablet_id} is not part of this table"))?;
        let range = self.tablets[idx].hash_range;
        anyhow::ensure!(
            range.len() >= 2,
            "tablet {tablet_id} covers a single hash code and cannot split"
        );
        let split_at = range.start + range.len() / 2;
        self.tablets[idx].hash_range.end = split_at;
        self.tablets.insert(
            idx + 1,
            TabletDesc {
                tablet_id: new_tablet_id,
                hash_range: HashRange {
                    start: split_at,
                    end: range.end,
                },
                server,
            },
        );
        self.epoch += 1;
        Ok(split_at)
    }
}
