//! SQLite provider backed by rusqlite.
//!
//! Each [`Provider::open_connection`] call opens the database file named by the
//! connection string. SQLite has a single database per file, so the configured
//! database name is ignored. Parameters bind by name, so the `@condition0`
//! style placeholders produced by the statement builder are used verbatim.

use std::borrow::Cow;
use std::time::Duration;

use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::ToSql;
use tracing::debug;

use crate::error::{CommanderError, Result};
use crate::provider::{quote_with, BatchCommand, Command, Connection, Provider};
use crate::schema::{Column, TableSchema};
use crate::statement::Parameter;
use crate::table::DataTable;
use crate::value::{DbType, Value};

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

impl From<rusqlite::Error> for CommanderError {
    fn from(err: rusqlite::Error) -> Self {
        CommanderError::provider(err)
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        use rusqlite::types::Value as Sql;

        let owned = match self {
            Value::Null => Sql::Null,
            Value::Bool(v) => Sql::Integer(i64::from(*v)),
            Value::Byte(v) => Sql::Integer(i64::from(*v)),
            Value::I16(v) => Sql::Integer(i64::from(*v)),
            Value::I32(v) => Sql::Integer(i64::from(*v)),
            Value::U32(v) => Sql::Integer(i64::from(*v)),
            Value::I64(v) => Sql::Integer(*v),
            Value::U64(v) => Sql::Integer(
                i64::try_from(*v)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            ),
            Value::F32(v) => Sql::Real(f64::from(*v)),
            Value::F64(v) => Sql::Real(*v),
            Value::Decimal(v) => Sql::Text(v.to_string()),
            Value::DateTime(v) => Sql::Text(v.format(DATETIME_FORMAT).to_string()),
            Value::DateTimeOffset(v) => Sql::Text(v.to_rfc3339()),
            Value::Uuid(v) => Sql::Blob(v.as_bytes().to_vec()),
            Value::Text(v) => return Ok(ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes()))),
            Value::Bytes(v) => return Ok(ToSqlOutput::Borrowed(ValueRef::Blob(v))),
        };
        Ok(ToSqlOutput::Owned(owned))
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(v) => Value::I64(v),
            ValueRef::Real(v) => Value::F64(v),
            ValueRef::Text(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
            ValueRef::Blob(v) => Value::Bytes(v.to_vec()),
        }
    }
}

/// Parameter values converted to their declared types.
fn bound_values(parameters: &[Parameter]) -> Result<Vec<Cow<'_, Value>>> {
    parameters.iter().map(Parameter::bound_value).collect()
}

fn bind<'a>(parameters: &'a [Parameter], values: &'a [Cow<'a, Value>]) -> Vec<(&'a str, &'a dyn ToSql)> {
    parameters
        .iter()
        .zip(values)
        .map(|(p, v)| (p.name.as_str(), &**v as &dyn ToSql))
        .collect()
}

fn read_row(row: &rusqlite::Row<'_>, width: usize) -> rusqlite::Result<Vec<Value>> {
    (0..width).map(|i| row.get_ref(i).map(Value::from)).collect()
}

/// SQLite backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteProvider;

impl SqliteProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Provider for SqliteProvider {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn open_connection(
        &self,
        connection_string: &str,
        database: Option<&str>,
    ) -> Result<Box<dyn Connection>> {
        if let Some(database) = database {
            debug!(
                "Ignoring database {} for sqlite connection {}",
                database, connection_string
            );
        }
        let conn = rusqlite::Connection::open(connection_string)?;
        Ok(Box::new(SqliteConnection { conn }))
    }

    fn quote_identifier(&self, identifier: &str) -> Result<String> {
        quote_with(identifier, '"', '"')
    }
}

/// One open SQLite database handle.
pub struct SqliteConnection {
    conn: rusqlite::Connection,
}

impl SqliteConnection {
    /// Wrap an already open rusqlite connection.
    pub fn new(conn: rusqlite::Connection) -> Self {
        Self { conn }
    }

    /// SQLite has no statement timeout; the closest is how long to wait on locks.
    fn apply_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        if let Some(timeout) = timeout {
            self.conn.busy_timeout(timeout)?;
        }
        Ok(())
    }
}

impl Connection for SqliteConnection {
    fn execute(&mut self, command: &Command) -> Result<u64> {
        let values = bound_values(&command.parameters)?;
        self.apply_timeout(command.timeout)?;
        let mut stmt = self.conn.prepare(&command.text)?;
        let affected = stmt.execute(bind(&command.parameters, &values).as_slice())?;
        Ok(affected as u64)
    }

    fn execute_batch(&mut self, command: &BatchCommand) -> Result<u64> {
        // Convert every row before running any of them.
        let mut rows = Vec::with_capacity(command.rows.len());
        for row in &command.rows {
            if row.len() != command.parameters.len() {
                return Err(CommanderError::arity(
                    "batch row values",
                    command.parameters.len(),
                    row.len(),
                ));
            }
            let values = command
                .parameters
                .iter()
                .zip(row)
                .map(|(p, v)| p.bind(v))
                .collect::<Result<Vec<_>>>()?;
            rows.push(values);
        }

        self.apply_timeout(command.timeout)?;
        let mut stmt = self.conn.prepare_cached(&command.text)?;
        let mut affected = 0u64;
        for values in &rows {
            affected += stmt.execute(bind(&command.parameters, values).as_slice())? as u64;
        }
        Ok(affected)
    }

    fn query(&mut self, command: &Command) -> Result<DataTable> {
        let values = bound_values(&command.parameters)?;
        self.apply_timeout(command.timeout)?;
        let mut stmt = self.conn.prepare(&command.text)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

        let mut records = Vec::new();
        let mut rows = stmt.query(bind(&command.parameters, &values).as_slice())?;
        while let Some(row) = rows.next()? {
            records.push(read_row(row, names.len())?);
        }

        let columns = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                let db_type = records
                    .iter()
                    .find_map(|r: &Vec<Value>| r[i].db_type())
                    .unwrap_or(DbType::Text);
                Column::new(name, db_type)
            })
            .collect();

        let mut table = DataTable::new(String::new(), columns);
        for record in records {
            table.load_row(record)?;
        }
        Ok(table)
    }

    fn query_scalar(&mut self, command: &Command) -> Result<Option<Value>> {
        let values = bound_values(&command.parameters)?;
        self.apply_timeout(command.timeout)?;
        let mut stmt = self.conn.prepare(&command.text)?;
        let mut rows = stmt.query(bind(&command.parameters, &values).as_slice())?;
        match rows.next()? {
            Some(row) => {
                let value = Value::from(row.get_ref(0)?);
                Ok((!value.is_null()).then_some(value))
            }
            None => Ok(None),
        }
    }

    fn fetch_schema(&mut self, table: &str, select: &Command) -> Result<TableSchema> {
        // Preparing the zero-row select fails for a missing table and gives
        // the column order callers will see.
        let names: Vec<String> = {
            let stmt = self.conn.prepare(&select.text)?;
            stmt.column_names().into_iter().map(String::from).collect()
        };

        let mut info = self
            .conn
            .prepare("SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1)")?;
        let declared = info
            .query_map([table], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut schema = TableSchema::new(table);
        for name in names {
            let column = match declared.iter().find(|(n, ..)| *n == name) {
                Some((_, decl, not_null, _)) => {
                    let column = Column::new(name, DbType::from_declared(decl));
                    if *not_null {
                        column.not_null()
                    } else {
                        column
                    }
                }
                None => Column::new(name, DbType::Text),
            };
            schema.columns.push(column);
        }

        let mut keys: Vec<&(String, String, bool, i64)> =
            declared.iter().filter(|(.., pk)| *pk > 0).collect();
        keys.sort_by_key(|(.., pk)| *pk);
        schema.primary_key = keys.into_iter().map(|(n, ..)| n.clone()).collect();

        debug!(
            "Fetched schema for {}: {} columns, key {:?}",
            table,
            schema.columns.len(),
            schema.primary_key
        );
        Ok(schema)
    }

    fn table_names(&mut self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    fn begin(&mut self) -> Result<()> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}
