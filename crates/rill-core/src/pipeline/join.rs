//! Stream-to-static joins.
//!
//! A [`StaticTable`] is loaded once and indexed on its declared key column.
//! Pipelines hold a [`StaticTableHandle`]; each batch takes one snapshot of
//! the handle so a concurrent [`StaticTableHandle::reload`] never mixes two
//! table versions inside one batch.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::RwLock;

use super::PlanError;
use crate::record::{Record, Value};
use crate::schema::{Schema, SchemaRef};

/// Join semantics for unmatched stream rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum JoinType {
    /// Drop stream rows with no match.
    #[default]
    Inner,
    /// Keep stream rows with no match, null-filling table columns.
    Left,
}

impl JoinType {
    /// Returns true if unmatched rows still produce output.
    #[must_use]
    pub fn emits_on_miss(self) -> bool {
        matches!(self, JoinType::Left)
    }
}

/// An immutable, key-indexed table.
#[derive(Debug)]
pub struct StaticTable {
    schema: SchemaRef,
    key_index: usize,
    rows: Vec<Record>,
    index: FxHashMap<Value, Vec<usize>>,
}

impl StaticTable {
    /// Builds a table keyed on `key_column`.
    ///
    /// Rows whose key is null are kept but can never match.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] if the key column is missing or a row does not
    /// match `schema`.
    pub fn new(
        schema: SchemaRef,
        key_column: &str,
        rows: Vec<Record>,
    ) -> Result<Self, PlanError> {
        let key_index = schema.index_of(key_column)?;
        let mut index: FxHashMap<Value, Vec<usize>> = FxHashMap::default();
        for (i, row) in rows.iter().enumerate() {
            schema.validate(row)?;
            let key = row.get(key_index);
            if !key.is_null() {
                index.entry(key.clone()).or_default().push(i);
            }
        }
        Ok(Self {
            schema,
            key_index,
            rows,
            index,
        })
    }

    /// Builds a table from an Arrow batch.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] if the batch has unsupported columns or no
    /// `key_column`.
    pub fn from_record_batch(
        batch: &arrow_array::RecordBatch,
        key_column: &str,
    ) -> Result<Self, PlanError> {
        let (schema, rows) = crate::record::records_from_arrow(batch)?;
        Self::new(Arc::new(schema), key_column, rows)
    }

    /// Table schema.
    #[must_use]
    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// Name of the key column.
    #[must_use]
    pub fn key_column(&self) -> &str {
        self.schema.fields()[self.key_index].name()
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows whose key equals `key`. Null never matches.
    pub fn lookup<'a>(&'a self, key: &Value) -> impl Iterator<Item = &'a Record> + 'a {
        let hits: &[usize] = if key.is_null() {
            &[]
        } else {
            self.index.get(key).map(Vec::as_slice).unwrap_or_default()
        };
        hits.iter().map(|&i| &self.rows[i])
    }

    /// Values of `row` excluding the key column.
    pub(crate) fn payload<'a>(&self, row: &'a Record) -> impl Iterator<Item = &'a Value> + 'a {
        let key_index = self.key_index;
        row.values()
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != key_index)
            .map(|(_, v)| v)
    }

    /// Number of payload (non-key) columns.
    pub(crate) fn payload_width(&self) -> usize {
        self.schema.len() - 1
    }

    /// Output schema of joining `stream` with this table.
    ///
    /// Stream fields come first, then the table fields except its key. Left
    /// joins make the table fields nullable.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::DuplicateField`] if a table field name is
    /// already used by the stream.
    pub fn joined_schema(&self, stream: &Schema, join_type: JoinType) -> Result<Schema, PlanError> {
        let mut fields = stream.fields().to_vec();
        for (i, field) in self.schema.fields().iter().enumerate() {
            if i == self.key_index {
                continue;
            }
            if stream.index_of(field.name()).is_ok() {
                return Err(PlanError::DuplicateField(field.name().to_string()));
            }
            let nullable = field.is_nullable() || join_type.emits_on_miss();
            fields.push(field.with_nullable(nullable));
        }
        Ok(Schema::new(fields))
    }
}

/// Shared, reloadable reference to a [`StaticTable`].
///
/// Handles compare equal only when they point at the same slot, so two
/// joins against the same handle are recognised as the same stage.
#[derive(Debug, Clone)]
pub struct StaticTableHandle {
    slot: Arc<RwLock<Arc<StaticTable>>>,
}

impl StaticTableHandle {
    /// Wraps a loaded table.
    #[must_use]
    pub fn new(table: StaticTable) -> Self {
        Self {
            slot: Arc::new(RwLock::new(Arc::new(table))),
        }
    }

    /// Current version of the table.
    #[must_use]
    pub fn snapshot(&self) -> Arc<StaticTable> {
        Arc::clone(&self.slot.read())
    }

    /// Replaces the table. Batches already running keep their snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::StaticTable`] if the new table's schema or key
    /// column differs from the current one.
    pub fn reload(&self, table: StaticTable) -> Result<(), PlanError> {
        let mut slot = self.slot.write();
        if slot.schema() != table.schema() || slot.key_column() != table.key_column() {
            return Err(PlanError::StaticTable(format!(
                "reload must keep schema {} keyed on '{}'",
                slot.schema(),
                slot.key_column()
            )));
        }
        *slot = Arc::new(table);
        tracing::info!(rows = slot.len(), "static table reloaded");
        Ok(())
    }
}

impl PartialEq for StaticTableHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl Eq for StaticTableHandle {}

impl Hash for StaticTableHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.slot).hash(state);
    }
}
