//! In-memory tabular data with per-row change tracking.
//!
//! A [`DataTable`] is what the bulk adapter fills from a select and what
//! [`Commander::synchronize`](crate::Commander::synchronize) diffs back into the
//! database: rows remember their state and, once modified, their original values.

use crate::error::{CommanderError, Result};
use crate::schema::{Column, TableSchema};
use crate::value::Value;

/// Change state of a row relative to the last accepted snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    Unchanged,
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    values: Vec<Value>,
    original: Option<Vec<Value>>,
    state: RowState,
}

impl DataRow {
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Values as last accepted (the current values for unchanged/added rows).
    pub fn original_values(&self) -> &[Value] {
        self.original.as_deref().unwrap_or(&self.values)
    }

    pub fn state(&self) -> RowState {
        self.state
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataTable {
    pub name: String,
    pub columns: Vec<Column>,
    rows: Vec<DataRow>,
}

impl DataTable {
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self {
            name: name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    /// Empty table shaped like `schema`.
    pub fn from_schema(schema: &TableSchema) -> Self {
        Self::new(schema.name.clone(), schema.columns.clone())
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn rows(&self) -> &[DataRow] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<&DataRow> {
        self.rows.get(index)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value at (`row`, `column`) by column name.
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row)?.values.get(idx)
    }

    fn check_width(&self, values: &[Value]) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(CommanderError::arity(
                "row values",
                self.columns.len(),
                values.len(),
            ));
        }
        Ok(())
    }

    /// Append a row as already persisted (used when filling from a query).
    pub fn load_row(&mut self, values: Vec<Value>) -> Result<()> {
        self.check_width(&values)?;
        self.rows.push(DataRow {
            values,
            original: None,
            state: RowState::Unchanged,
        });
        Ok(())
    }

    /// Append a new row to be inserted.
    pub fn add_row(&mut self, values: Vec<Value>) -> Result<usize> {
        self.check_width(&values)?;
        self.rows.push(DataRow {
            values,
            original: None,
            state: RowState::Added,
        });
        Ok(self.rows.len() - 1)
    }

    /// Set one field; unchanged rows become modified and keep their originals.
    pub fn set_value(&mut self, row: usize, column: &str, value: impl Into<Value>) -> Result<()> {
        let idx = self
            .column_index(column)
            .ok_or_else(|| CommanderError::UnknownColumn {
                table: self.name.clone(),
                column: column.to_string(),
            })?;
        let data_row = self.row_mut(row)?;
        if data_row.state == RowState::Unchanged {
            data_row.original = Some(data_row.values.clone());
            data_row.state = RowState::Modified;
        }
        data_row.values[idx] = value.into();
        Ok(())
    }

    /// Mark a row deleted. Rows added since the last accept are dropped outright.
    pub fn delete_row(&mut self, row: usize) -> Result<()> {
        if self.row_mut(row)?.state == RowState::Added {
            self.rows.remove(row);
            return Ok(());
        }
        let data_row = self.row_mut(row)?;
        if data_row.state == RowState::Unchanged {
            data_row.original = Some(data_row.values.clone());
        }
        data_row.state = RowState::Deleted;
        Ok(())
    }

    fn row_mut(&mut self, row: usize) -> Result<&mut DataRow> {
        let table = &self.name;
        self.rows
            .get_mut(row)
            .ok_or_else(|| CommanderError::RowOutOfRange {
                table: table.clone(),
                row,
            })
    }

    pub fn has_changes(&self) -> bool {
        self.rows.iter().any(|r| r.state != RowState::Unchanged)
    }

    /// Rows that differ from the accepted snapshot.
    pub fn changes(&self) -> impl Iterator<Item = &DataRow> {
        self.rows.iter().filter(|r| r.state != RowState::Unchanged)
    }

    /// Make the current contents the new baseline.
    pub fn accept_changes(&mut self) {
        self.rows.retain(|r| r.state != RowState::Deleted);
        for row in &mut self.rows {
            row.state = RowState::Unchanged;
            row.original = None;
        }
    }

    /// Mark every row modified (used for update snapshots).
    pub fn mark_all_modified(&mut self) {
        for row in &mut self.rows {
            if row.state == RowState::Unchanged {
                row.original = Some(row.values.clone());
                row.state = RowState::Modified;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DbType;

    fn people() -> DataTable {
        let mut table = DataTable::new(
            "people",
            vec![Column::new("id", DbType::Int64), Column::new("name", DbType::Text)],
        );
        table.load_row(vec![Value::I64(1), "Ada".into()]).unwrap();
        table.load_row(vec![Value::I64(2), "Bob".into()]).unwrap();
        table
    }

    #[test]
    fn test_modification_keeps_original_values() {
        let mut table = people();
        assert!(!table.has_changes());
        table.set_value(0, "name", "Ada L.").unwrap();
        let row = table.row(0).unwrap();
        assert_eq!(row.state(), RowState::Modified);
        assert_eq!(row.original_values()[1], Value::from("Ada"));
        assert_eq!(table.value(0, "name"), Some(&Value::from("Ada L.")));
    }

    #[test]
    fn test_delete_added_row_drops_it() {
        let mut table = people();
        let idx = table.add_row(vec![Value::I64(3), "Cy".into()]).unwrap();
        table.delete_row(idx).unwrap();
        assert_eq!(table.len(), 2);
        table.delete_row(1).unwrap();
        assert_eq!(table.changes().count(), 1);
        table.accept_changes();
        assert_eq!(table.len(), 1);
        assert!(!table.has_changes());
    }

    #[test]
    fn test_row_width_is_checked() {
        let mut table = people();
        let err = table.add_row(vec![Value::I64(9)]).unwrap_err();
        assert!(matches!(err, CommanderError::ArityMismatch { expected: 2, actual: 1, .. }));
    }
}
