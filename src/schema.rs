//! Table metadata and the per-commander schema cache.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CommanderError, Result};
use crate::value::DbType;

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub db_type: DbType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, db_type: DbType) -> Self {
        Self {
            name: name.into(),
            db_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Table metadata: ordered columns and primary key column names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
        }
    }

    pub fn with_column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn with_primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Column names in declaration order, minus `excluded`.
    pub fn field_names(&self, excluded: &[&str]) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| !excluded.contains(&c.name.as_str()))
            .map(|c| c.name.clone())
            .collect()
    }

    /// The only primary key column.
    pub fn single_primary_key(&self) -> Result<&str> {
        match self.primary_key.as_slice() {
            [key] => Ok(key.as_str()),
            keys => Err(CommanderError::NotSinglePrimaryKey {
                table: self.name.clone(),
                found: keys.len(),
            }),
        }
    }

    /// Field to order by when the caller gives none.
    ///
    /// Priority: the single primary key, the first column ending in "Name",
    /// the first ending in "ID" (both case-insensitive), the first 32/64-bit
    /// integer column, the first column.
    pub fn default_sort_field(&self) -> Result<&str> {
        if let [key] = self.primary_key.as_slice() {
            return Ok(key.as_str());
        }

        let ends_with = |suffix: &str| {
            self.columns
                .iter()
                .find(|c| c.name.to_ascii_lowercase().ends_with(suffix))
        };

        ends_with("name")
            .or_else(|| ends_with("id"))
            .or_else(|| {
                self.columns
                    .iter()
                    .find(|c| matches!(c.db_type, DbType::Int32 | DbType::Int64))
            })
            .or_else(|| self.columns.first())
            .map(|c| c.name.as_str())
            .ok_or_else(|| CommanderError::NoSortableField(self.name.clone()))
    }
}

/// Memoized table metadata keyed by table name, ignoring case.
///
/// One lock covers check-then-fill and invalidation, so a table is never
/// loaded twice concurrently.
#[derive(Debug, Default)]
pub struct SchemaCache {
    tables: Mutex<HashMap<String, Arc<TableSchema>>>,
}

fn cache_key(table: &str) -> String {
    table.to_lowercase()
}

impl SchemaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached schema for `table`, calling `load` on a miss.
    ///
    /// A failed load caches nothing.
    pub fn get_or_load<F>(&self, table: &str, load: F) -> Result<Arc<TableSchema>>
    where
        F: FnOnce(&str) -> Result<TableSchema>,
    {
        let key = cache_key(table);
        let mut tables = self.tables.lock();
        if let Some(schema) = tables.get(&key) {
            return Ok(Arc::clone(schema));
        }

        debug!("Loading schema for table: {}", table);
        let mut schema = load(table)?;
        schema.name = table.to_string();
        let schema = Arc::new(schema);
        tables.insert(key, Arc::clone(&schema));
        Ok(schema)
    }

    pub fn get(&self, table: &str) -> Option<Arc<TableSchema>> {
        self.tables.lock().get(&cache_key(table)).cloned()
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.lock().contains_key(&cache_key(table))
    }

    /// Drop every cached entry.
    pub fn invalidate(&self) {
        let mut tables = self.tables.lock();
        debug!("Invalidating schema cache ({} tables)", tables.len());
        tables.clear();
    }

    pub fn len(&self) -> usize {
        self.tables.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn orders() -> TableSchema {
        TableSchema::new("Orders")
            .with_column(Column::new("Total", DbType::Decimal))
            .with_column(Column::new("OrderId", DbType::Int64))
            .with_column(Column::new("CustomerName", DbType::Text))
    }

    #[test]
    fn test_default_sort_field_priority() {
        let keyed = orders().with_primary_key(&["OrderId"]);
        assert_eq!(keyed.default_sort_field().unwrap(), "OrderId");

        assert_eq!(orders().default_sort_field().unwrap(), "CustomerName");

        let by_id = TableSchema::new("t")
            .with_column(Column::new("flag", DbType::Boolean))
            .with_column(Column::new("ParentID", DbType::Text));
        assert_eq!(by_id.default_sort_field().unwrap(), "ParentID");

        let by_int = TableSchema::new("t")
            .with_column(Column::new("flag", DbType::Boolean))
            .with_column(Column::new("small", DbType::Int16))
            .with_column(Column::new("counter", DbType::Int32));
        assert_eq!(by_int.default_sort_field().unwrap(), "counter");

        let first = TableSchema::new("t").with_column(Column::new("flag", DbType::Boolean));
        assert_eq!(first.default_sort_field().unwrap(), "flag");

        let composite = orders().with_primary_key(&["OrderId", "Total"]);
        assert_eq!(composite.default_sort_field().unwrap(), "CustomerName");
    }

    #[test]
    fn test_default_sort_field_without_columns() {
        let err = TableSchema::new("empty").default_sort_field().unwrap_err();
        assert!(matches!(err, CommanderError::NoSortableField(t) if t == "empty"));
    }

    #[test]
    fn test_single_primary_key() {
        assert_eq!(
            orders().with_primary_key(&["OrderId"]).single_primary_key().unwrap(),
            "OrderId"
        );
        let err = orders().single_primary_key().unwrap_err();
        assert!(matches!(err, CommanderError::NotSinglePrimaryKey { found: 0, .. }));
        let err = orders()
            .with_primary_key(&["OrderId", "Total"])
            .single_primary_key()
            .unwrap_err();
        assert!(matches!(err, CommanderError::NotSinglePrimaryKey { found: 2, .. }));
    }

    #[test]
    fn test_field_names_with_exclusions() {
        assert_eq!(orders().field_names(&["Total"]), vec!["OrderId", "CustomerName"]);
    }

    #[test]
    fn test_cache_memoizes_until_invalidated() {
        let cache = SchemaCache::new();
        let loads = AtomicUsize::new(0);
        let load = |_: &str| {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(orders())
        };

        let first = cache.get_or_load("Orders", load).unwrap();
        let second = cache.get_or_load("Orders", load).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        cache.invalidate();
        assert!(cache.is_empty());
        let third = cache.get_or_load("Orders", load).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cache_keys_ignore_case() {
        let cache = SchemaCache::new();
        let loads = AtomicUsize::new(0);
        let load = |_: &str| {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok(orders())
        };

        let upper = cache.get_or_load("Orders", load).unwrap();
        let lower = cache.get_or_load("orders", load).unwrap();
        assert!(Arc::ptr_eq(&upper, &lower));
        assert_eq!(lower.name, "Orders");
        assert!(cache.contains("ORDERS"));
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failed_load_is_not_cached() {
        let cache = SchemaCache::new();
        let result =
            cache.get_or_load("missing", |_| Err(CommanderError::NoSortableField("x".into())));
        assert!(result.is_err());
        assert!(!cache.contains("missing"));
    }

    #[test]
    fn test_concurrent_first_miss_loads_once() {
        let cache = SchemaCache::new();
        let loads = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    cache
                        .get_or_load("Orders", |_| {
                            loads.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(5));
                            Ok(orders())
                        })
                        .unwrap();
                });
            }
        });
        assert_eq!(loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }
}
