//! Backend contract.
//!
//! A [`Provider`] is the only place that knows a concrete database: it opens
//! connections, creates commands, parameters and bulk adapters, and quotes
//! identifiers. Everything else in the crate is written against these traits.

use std::time::Duration;

use crate::error::{CommanderError, Result};
use crate::notify::ChangeKind;
use crate::schema::TableSchema;
use crate::statement::{BatchStatement, Filter, Parameter, Statement, StatementBuilder};
use crate::table::{DataRow, DataTable, RowState};
use crate::value::Value;

/// Maximum identifier length accepted for quoting.
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Reject identifiers that cannot be quoted safely.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CommanderError::InvalidIdentifier(
            "identifier cannot be empty".to_string(),
        ));
    }
    if name.contains('\0') {
        return Err(CommanderError::InvalidIdentifier(format!(
            "identifier contains null byte: {:?}",
            name
        )));
    }
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(CommanderError::InvalidIdentifier(format!(
            "identifier exceeds {} bytes: {:?}",
            MAX_IDENTIFIER_LENGTH, name
        )));
    }
    Ok(())
}

/// Wrap `name` in `open`/`close`, doubling any embedded `close`.
pub fn quote_with(name: &str, open: char, close: char) -> Result<String> {
    validate_identifier(name)?;
    let mut quoted = String::with_capacity(name.len() + 2);
    quoted.push(open);
    for ch in name.chars() {
        if ch == close {
            quoted.push(close);
        }
        quoted.push(ch);
    }
    quoted.push(close);
    Ok(quoted)
}

/// A statement ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub text: String,
    pub parameters: Vec<Parameter>,
    pub timeout: Option<Duration>,
}

impl Command {
    pub fn new(statement: Statement) -> Self {
        Self {
            text: statement.text,
            parameters: statement.parameters,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A statement executed once per row, rebinding one parameter set.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchCommand {
    pub text: String,
    pub parameters: Vec<Parameter>,
    pub rows: Vec<Vec<Value>>,
    pub timeout: Option<Duration>,
}

impl BatchCommand {
    pub fn new(batch: BatchStatement) -> Self {
        Self {
            text: batch.text,
            parameters: batch.parameters,
            rows: batch.rows,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One open backend connection.
///
/// Errors returned here are backend failures and surface to callers as
/// [`CommanderError::Provider`].
pub trait Connection: Send {
    /// Run a non-query; returns affected rows.
    fn execute(&mut self, command: &Command) -> Result<u64>;

    /// Run a batch, binding each row in turn; returns summed affected rows.
    fn execute_batch(&mut self, command: &BatchCommand) -> Result<u64>;

    fn query(&mut self, command: &Command) -> Result<DataTable>;

    /// First column of the first row; `None` for no rows or NULL.
    fn query_scalar(&mut self, command: &Command) -> Result<Option<Value>>;

    /// Column and key metadata for `table`, using the zero-row `select`.
    fn fetch_schema(&mut self, table: &str, select: &Command) -> Result<TableSchema>;

    fn table_names(&mut self) -> Result<Vec<String>>;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;
}

/// One row-level change applied by a bulk adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    pub kind: ChangeKind,
    /// Condition identifying the row.
    pub key: Filter,
    pub affected: u64,
}

/// Moves whole tables between the database and [`DataTable`]s.
pub trait BulkAdapter: Send {
    fn fill(&mut self, conn: &mut dyn Connection, select: &Command) -> Result<DataTable> {
        conn.query(select)
    }

    fn fill_schema(
        &mut self,
        conn: &mut dyn Connection,
        table: &str,
        select: &Command,
    ) -> Result<TableSchema> {
        conn.fetch_schema(table, select)
    }

    /// Apply the added/modified/deleted rows of `table`.
    ///
    /// A modified or deleted row that matches nothing fails with
    /// [`CommanderError::ConcurrencyViolation`].
    fn update(
        &mut self,
        conn: &mut dyn Connection,
        builder: &StatementBuilder,
        schema: &TableSchema,
        table: &DataTable,
        timeout: Option<Duration>,
    ) -> Result<Vec<AppliedChange>>;
}

/// Row-by-row INSERT/UPDATE/DELETE keyed on the primary key.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultBulkAdapter;

impl DefaultBulkAdapter {
    fn key_indexes(schema: &TableSchema, table: &DataTable) -> Result<Vec<usize>> {
        if schema.primary_key.is_empty() {
            return Err(CommanderError::NoPrimaryKey(table.name.clone()));
        }
        schema
            .primary_key
            .iter()
            .map(|key| {
                table
                    .column_index(key)
                    .ok_or_else(|| CommanderError::NoPrimaryKey(table.name.clone()))
            })
            .collect()
    }

    fn key_filter(table: &DataTable, keys: &[usize], values: &[Value]) -> Result<Filter> {
        let mut fields = Vec::with_capacity(keys.len());
        let mut key_values = Vec::with_capacity(keys.len());
        for &i in keys {
            match (table.columns.get(i), values.get(i)) {
                (Some(column), Some(value)) => {
                    fields.push(column.name.as_str());
                    key_values.push(value.clone());
                }
                _ => {
                    return Err(CommanderError::arity(
                        "row values",
                        table.columns.len(),
                        values.len(),
                    ))
                }
            }
        }
        Ok(Filter::all_of(&fields, &key_values))
    }

    fn apply_row(
        conn: &mut dyn Connection,
        builder: &StatementBuilder,
        table: &DataTable,
        keys: &[usize],
        row: &DataRow,
        timeout: Option<Duration>,
    ) -> Result<Option<AppliedChange>> {
        let fields = table.column_names();
        let (kind, key, statement) = match row.state() {
            RowState::Unchanged => return Ok(None),
            RowState::Added => {
                let key = if keys.is_empty() {
                    Filter::all_of(&fields, row.values())
                } else {
                    Self::key_filter(table, keys, row.values())?
                };
                let statement = builder.insert(&table.name, &fields, row.values())?;
                (ChangeKind::Insert, key, statement)
            }
            RowState::Modified => {
                let key = Self::key_filter(table, keys, row.original_values())?;
                let statement = builder.update(&table.name, &fields, row.values(), &key)?;
                (ChangeKind::Update, key, statement)
            }
            RowState::Deleted => {
                let key = Self::key_filter(table, keys, row.original_values())?;
                let statement = builder.delete(&table.name, &key)?;
                (ChangeKind::Delete, key, statement)
            }
        };

        let affected = conn.execute(&Command::new(statement).with_timeout(timeout))?;
        // The row changed or vanished underneath us.
        if affected == 0 && kind != ChangeKind::Insert {
            return Err(CommanderError::ConcurrencyViolation {
                table: table.name.clone(),
                kind,
            });
        }
        Ok(Some(AppliedChange {
            kind,
            key,
            affected,
        }))
    }
}

impl BulkAdapter for DefaultBulkAdapter {
    fn update(
        &mut self,
        conn: &mut dyn Connection,
        builder: &StatementBuilder,
        schema: &TableSchema,
        table: &DataTable,
        timeout: Option<Duration>,
    ) -> Result<Vec<AppliedChange>> {
        let needs_key = table
            .changes()
            .any(|r| matches!(r.state(), RowState::Modified | RowState::Deleted));
        let keys = match Self::key_indexes(schema, table) {
            Ok(keys) => keys,
            Err(err) if needs_key => return Err(err),
            Err(_) => Vec::new(),
        };

        let mut applied = Vec::new();
        for row in table.changes() {
            if let Some(change) = Self::apply_row(conn, builder, table, &keys, row, timeout)? {
                applied.push(change);
            }
        }
        Ok(applied)
    }
}

/// Backend factory: connections, commands, parameters, adapters, quoting.
pub trait Provider: Send + Sync {
    /// Short backend name for logging.
    fn name(&self) -> &str;

    fn open_connection(
        &self,
        connection_string: &str,
        database: Option<&str>,
    ) -> Result<Box<dyn Connection>>;

    fn create_command(&self, statement: Statement, timeout: Option<Duration>) -> Command {
        Command::new(statement).with_timeout(timeout)
    }

    fn create_batch_command(&self, batch: BatchStatement, timeout: Option<Duration>) -> BatchCommand {
        BatchCommand::new(batch).with_timeout(timeout)
    }

    /// Parameter for the placeholder base name `name` (e.g. `value0`).
    fn create_parameter(&self, name: &str, value: Value) -> Parameter {
        Parameter::new(format!("@{}", name), value)
    }

    fn create_bulk_adapter(&self) -> Box<dyn BulkAdapter> {
        Box::new(DefaultBulkAdapter)
    }

    fn quote_identifier(&self, identifier: &str) -> Result<String>;
}
