//! Public CRUD surface.
//!
//! [`Commander`] opens one connection per call. [`Transaction`] pins a single
//! connection for its lifetime and buffers change events until it commits.
//! Both expose the same operations through [`DataCommands`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::CommanderConfig;
use crate::error::{CommanderError, Result};
use crate::notify::{
    classify_statement, ChangeEvent, ChangeKind, ChangeNotifier, SubscriptionToken,
    TransactionScope, TransactionStatus,
};
use crate::provider::{AppliedChange, Command, Connection, Provider};
use crate::schema::{Column, SchemaCache, TableSchema};
use crate::statement::{BatchStatement, Filter, Parameter, Projection, Statement, StatementBuilder};
use crate::table::DataTable;
use crate::value::{coerce, DbType, Value};

/// State shared by a [`Commander`], its clones and its transactions.
pub struct CommanderContext {
    provider: Arc<dyn Provider>,
    config: CommanderConfig,
    builder: StatementBuilder,
    schemas: SchemaCache,
    notifier: ChangeNotifier,
}

impl CommanderContext {
    fn open(&self) -> Result<Box<dyn Connection>> {
        debug!("Opening {} connection", self.provider.name());
        self.provider.open_connection(
            &self.config.connection_string,
            self.config.database.as_deref(),
        )
    }

    fn command(&self, statement: Statement, timeout: Option<Duration>) -> Command {
        self.provider.create_command(statement, timeout)
    }

    /// Cached schema for `table`, fetched over `conn` on a miss.
    fn load_schema(
        &self,
        conn: &mut dyn Connection,
        table: &str,
        timeout: Option<Duration>,
    ) -> Result<Arc<TableSchema>> {
        self.schemas.get_or_load(table, |table| {
            let select = self
                .builder
                .select(table, &Projection::All, &Filter::raw("1 = 0", Vec::new()))?;
            let command = self.command(select, timeout);
            self.provider
                .create_bulk_adapter()
                .fill_schema(conn, table, &command)
        })
    }
}

fn execute_command<C: DataCommands + ?Sized>(cmds: &C, command: &Command) -> Result<u64> {
    debug!("Executing: {}", command.text);
    let affected = cmds.with_connection(|conn| conn.execute(command))?;
    debug!("{} rows affected", affected);
    Ok(affected)
}

fn scalar_command<C: DataCommands + ?Sized>(cmds: &C, command: &Command) -> Result<Option<Value>> {
    debug!("Querying scalar: {}", command.text);
    cmds.with_connection(|conn| conn.query_scalar(command))
}

fn fill_command<C: DataCommands + ?Sized>(cmds: &C, command: &Command) -> Result<DataTable> {
    debug!("Querying: {}", command.text);
    let provider = &cmds.context().provider;
    cmds.with_connection(|conn| provider.create_bulk_adapter().fill(conn, command))
}

fn publish<C, F>(cmds: &C, event: F)
where
    C: DataCommands + ?Sized,
    F: FnOnce() -> ChangeEvent,
{
    cmds.context()
        .notifier
        .publish(cmds.transaction_scope(), event);
}

/// Filter as event conditions; unconditional filters carry none.
fn conditions(filter: &Filter) -> Option<Filter> {
    (!filter.is_all()).then(|| filter.clone())
}

fn insert_event(ctx: &CommanderContext, table: &str, fields: &[&str], values: &[Value]) -> ChangeEvent {
    let schema = ctx.schemas.get(table);
    let columns: Vec<Column> = fields
        .iter()
        .zip(values)
        .map(|(field, value)| {
            schema
                .as_ref()
                .and_then(|s| s.column(field).cloned())
                .unwrap_or_else(|| Column::new(*field, value.db_type().unwrap_or(DbType::Text)))
        })
        .collect();
    let name = table.to_string();
    let row = values.to_vec();

    ChangeEvent::new(table, ChangeKind::Insert)
        .with_conditions(Filter::all_of(fields, values))
        .with_snapshot(move || {
            let mut data = DataTable::new(name.clone(), columns.clone());
            data.add_row(row.clone())?;
            Ok(data)
        })
}

fn update_event(
    ctx: &Arc<CommanderContext>,
    table: &str,
    filter: &Filter,
    timeout: Option<Duration>,
) -> ChangeEvent {
    let ctx = Arc::clone(ctx);
    let name = table.to_string();
    let selection = filter.clone();
    let event = ChangeEvent::new(table, ChangeKind::Update).with_snapshot(move || {
        let select = ctx.builder.select(&name, &Projection::All, &selection)?;
        let command = ctx.command(select, timeout);
        let mut conn = ctx.open()?;
        let mut data = ctx.provider.create_bulk_adapter().fill(&mut *conn, &command)?;
        data.name = name.clone();
        data.mark_all_modified();
        Ok(data)
    });
    match conditions(filter) {
        Some(filter) => event.with_conditions(filter),
        None => event,
    }
}

fn split_pairs<K, V, I>(pairs: I) -> (Vec<String>, Vec<Value>)
where
    K: Into<String>,
    V: Into<Value>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| -> (String, Value) { (k.into(), v.into()) })
        .unzip()
}

/// CRUD operations shared by [`Commander`] and [`Transaction`].
///
/// Argument errors (mismatched field and value lists, unquotable identifiers)
/// are returned before any connection is opened. A mutation that affects at
/// least one row raises a change event: immediately on a commander, at commit
/// on a transaction.
pub trait DataCommands {
    fn context(&self) -> &Arc<CommanderContext>;

    /// Buffer for change events, when running inside a transaction.
    fn transaction_scope(&self) -> Option<&TransactionScope>;

    /// Timeout carried by every command issued through `self`.
    fn call_timeout(&self) -> Option<Duration>;

    /// Run `f` on the connection for this call.
    fn with_connection<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn Connection) -> Result<R>;

    /// Column and key metadata for `table`, cached after the first call.
    fn schema(&self, table: &str) -> Result<Arc<TableSchema>> {
        let ctx = self.context();
        if let Some(schema) = ctx.schemas.get(table) {
            return Ok(schema);
        }
        let timeout = self.call_timeout();
        self.with_connection(|conn| ctx.load_schema(conn, table, timeout))
    }

    fn default_sort_field(&self, table: &str) -> Result<String> {
        Ok(self.schema(table)?.default_sort_field()?.to_string())
    }

    fn single_primary_key(&self, table: &str) -> Result<String> {
        Ok(self.schema(table)?.single_primary_key()?.to_string())
    }

    /// Column names of `table` minus `excluded`.
    fn table_fields(&self, table: &str, excluded: &[&str]) -> Result<Vec<String>> {
        Ok(self.schema(table)?.field_names(excluded))
    }

    fn tables(&self) -> Result<Vec<String>> {
        self.with_connection(|conn| conn.table_names())
    }

    /// Schemas of every table in the database.
    fn database_schema(&self) -> Result<Vec<Arc<TableSchema>>> {
        self.tables()?
            .iter()
            .map(|table| self.schema(table))
            .collect()
    }

    /// True when `filter` matches at least one row.
    fn exists(&self, table: &str, filter: &Filter) -> Result<bool> {
        let select = self.context().builder.select(table, &Projection::One, filter)?;
        let command = self.context().command(select, self.call_timeout());
        Ok(scalar_command(self, &command)?.is_some())
    }

    fn count(&self, table: &str, filter: &Filter) -> Result<i64> {
        let select = self.context().builder.select(table, &Projection::Count, filter)?;
        let command = self.context().command(select, self.call_timeout());
        Ok(scalar_command(self, &command)?
            .and_then(|v| v.as_i64())
            .unwrap_or(0))
    }

    /// `field` of the first matching row.
    fn scalar(&self, table: &str, field: &str, filter: &Filter) -> Result<Option<Value>> {
        let projection = Projection::Field(field.to_string());
        let select = self.context().builder.select(table, &projection, filter)?;
        let command = self.context().command(select, self.call_timeout());
        scalar_command(self, &command)
    }

    fn max(&self, table: &str, field: &str, filter: &Filter) -> Result<Option<Value>> {
        let projection = Projection::Max(field.to_string());
        let select = self.context().builder.select(table, &projection, filter)?;
        let command = self.context().command(select, self.call_timeout());
        scalar_command(self, &command)
    }

    /// Integer maximum of `field`; 0 for an empty selection. Text maxima are
    /// parsed.
    fn max_i64(&self, table: &str, field: &str, filter: &Filter) -> Result<i64> {
        match self.max(table, field, filter)? {
            Some(Value::Text(text)) => text
                .trim()
                .parse::<i64>()
                .map_err(|_| CommanderError::unsupported(&text, DbType::Int64)),
            Some(value) => Ok(coerce(value, DbType::Int64)?.as_i64().unwrap_or(0)),
            None => Ok(0),
        }
    }

    /// Rows of `table` matching `filter`.
    ///
    /// An empty `fields` selects every cached column, or `*` when the filter
    /// is unconditional.
    fn query_table(&self, table: &str, fields: &[&str], filter: &Filter) -> Result<DataTable> {
        filter.check_arity()?;
        let projection = if !fields.is_empty() {
            Projection::fields(fields)
        } else if filter.is_all() {
            Projection::All
        } else {
            Projection::Fields(self.schema(table)?.field_names(&[]))
        };

        let select = self.context().builder.select(table, &projection, filter)?;
        let command = self.context().command(select, self.call_timeout());
        let mut data = fill_command(self, &command)?;
        data.name = table.to_string();
        Ok(data)
    }

    /// Free-form query.
    fn query(&self, sql: &str, parameters: &[Parameter]) -> Result<DataTable> {
        let statement = Statement::new(sql).with_parameters(parameters.to_vec());
        fill_command(self, &self.context().command(statement, self.call_timeout()))
    }

    /// Free-form query returning the first column of the first row.
    fn query_scalar(&self, sql: &str, parameters: &[Parameter]) -> Result<Option<Value>> {
        let statement = Statement::new(sql).with_parameters(parameters.to_vec());
        scalar_command(self, &self.context().command(statement, self.call_timeout()))
    }

    /// Free-form non-query. Recognized INSERT/UPDATE/DELETE statements raise
    /// an event for their table.
    fn execute(&self, sql: &str, parameters: &[Parameter]) -> Result<u64> {
        let statement = Statement::new(sql).with_parameters(parameters.to_vec());
        let affected = execute_command(self, &self.context().command(statement, self.call_timeout()))?;
        if affected > 0 {
            match classify_statement(sql) {
                Some((kind, table)) => publish(self, || ChangeEvent::new(table, kind)),
                None => debug!("No change event for unclassified statement"),
            }
        }
        Ok(affected)
    }

    /// Free-form non-query run once per row of `rows`, binding `names` in order.
    fn execute_batch(&self, sql: &str, names: &[&str], rows: &[Vec<Value>]) -> Result<u64> {
        for row in rows {
            if row.len() != names.len() {
                return Err(CommanderError::arity("batch row values", names.len(), row.len()));
            }
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let parameters = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let db_type = rows.iter().find_map(|row| row[i].db_type());
                Parameter {
                    name: name.to_string(),
                    db_type,
                    value: Value::Null,
                }
            })
            .collect();
        let batch = BatchStatement {
            text: sql.to_string(),
            parameters,
            rows: rows.to_vec(),
        };

        let ctx = self.context();
        let command = ctx.provider.create_batch_command(batch, self.call_timeout());
        debug!("Executing batch of {}: {}", rows.len(), sql);
        let affected = self.with_connection(|conn| conn.execute_batch(&command))?;
        if affected > 0 {
            if let Some((kind, table)) = classify_statement(sql) {
                publish(self, || ChangeEvent::new(table, kind));
            }
        }
        Ok(affected)
    }

    fn insert(&self, table: &str, fields: &[&str], values: &[Value]) -> Result<u64> {
        let ctx = self.context();
        let statement = ctx.builder.insert(table, fields, values)?;
        let affected = execute_command(self, &ctx.command(statement, self.call_timeout()))?;
        if affected > 0 {
            publish(self, || insert_event(ctx, table, fields, values));
        }
        Ok(affected)
    }

    /// Insert from a column→value mapping.
    fn insert_record<K, V, I>(&self, table: &str, record: I) -> Result<u64>
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let (fields, values) = split_pairs(record);
        let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
        self.insert(table, &fields, &values)
    }

    /// Insert `rows` with one rendered statement. Raises one event per row.
    fn insert_batch(&self, table: &str, fields: &[&str], rows: &[Vec<Value>]) -> Result<u64> {
        let ctx = self.context();
        let batch = ctx.builder.insert_batch(table, fields, rows)?;
        if rows.is_empty() {
            return Ok(0);
        }

        let command = ctx.provider.create_batch_command(batch, self.call_timeout());
        debug!("Inserting {} rows into {}", rows.len(), table);
        let affected = self.with_connection(|conn| conn.execute_batch(&command))?;
        if affected > 0 {
            for row in rows {
                publish(self, || insert_event(ctx, table, fields, row));
            }
        }
        Ok(affected)
    }

    fn update(&self, table: &str, fields: &[&str], values: &[Value], filter: &Filter) -> Result<u64> {
        let ctx = self.context();
        let timeout = self.call_timeout();
        let statement = ctx.builder.update(table, fields, values, filter)?;
        let affected = execute_command(self, &ctx.command(statement, timeout))?;
        if affected > 0 {
            publish(self, || update_event(ctx, table, filter, timeout));
        }
        Ok(affected)
    }

    /// Update from a column→value mapping.
    fn update_record<K, V, I>(&self, table: &str, record: I, filter: &Filter) -> Result<u64>
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        let (fields, values) = split_pairs(record);
        let fields: Vec<&str> = fields.iter().map(String::as_str).collect();
        self.update(table, &fields, &values, filter)
    }

    fn delete(&self, table: &str, filter: &Filter) -> Result<u64> {
        let ctx = self.context();
        let statement = ctx.builder.delete(table, filter)?;
        let affected = execute_command(self, &ctx.command(statement, self.call_timeout()))?;
        if affected > 0 {
            publish(self, || {
                let event = ChangeEvent::new(table, ChangeKind::Delete);
                match conditions(filter) {
                    Some(filter) => event.with_conditions(filter),
                    None => event,
                }
            });
        }
        Ok(affected)
    }

    /// Delete rows whose `field` is one of `values`.
    fn delete_in(&self, table: &str, field: &str, values: Vec<Value>) -> Result<u64> {
        self.delete(table, &Filter::any_of(field, values))
    }

    fn delete_all(&self, table: &str) -> Result<u64> {
        self.delete(table, &Filter::All)
    }

    /// Raise an `Unknown` event for a change made outside these operations.
    fn announce_change(&self, table: &str) {
        publish(self, || ChangeEvent::new(table, ChangeKind::Unknown));
    }
}

/// Entry point: one provider, one configuration, one schema cache and one set
/// of subscribers. Clones share all of them.
#[derive(Clone)]
pub struct Commander {
    ctx: Arc<CommanderContext>,
    timeout: Option<Duration>,
}

impl fmt::Debug for Commander {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Commander")
            .field("provider", &self.ctx.provider.name())
            .field("config", &self.ctx.config)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Commander {
    /// Create a commander; fails with `MissingConfiguration` on a blank
    /// connection string or database name.
    pub fn new(provider: Arc<dyn Provider>, config: CommanderConfig) -> Result<Self> {
        config.validate()?;
        debug!("Creating commander for {} provider", provider.name());
        let ctx = CommanderContext {
            builder: StatementBuilder::new(Arc::clone(&provider)),
            provider,
            config,
            schemas: SchemaCache::new(),
            notifier: ChangeNotifier::new(),
        };
        Ok(Self {
            ctx: Arc::new(ctx),
            timeout: None,
        })
    }

    /// A handle sharing this commander's state whose calls use `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            ctx: Arc::clone(&self.ctx),
            timeout: Some(timeout),
        }
    }

    pub fn config(&self) -> &CommanderConfig {
        &self.ctx.config
    }

    pub fn builder(&self) -> &StatementBuilder {
        &self.ctx.builder
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&[ChangeEvent]) + Send + Sync + 'static,
    {
        self.ctx.notifier.subscribe(handler)
    }

    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        self.ctx.notifier.unsubscribe(token)
    }

    /// Drop every cached schema.
    pub fn invalidate_schema(&self) {
        self.ctx.schemas.invalidate();
    }

    /// Open a connection and start a transaction on it.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        let mut conn = self.ctx.open()?;
        conn.begin()?;
        let scope = self.ctx.notifier.begin();
        Ok(Transaction {
            commander: self,
            conn: Mutex::new(conn),
            scope,
            finished: false,
        })
    }

    /// Run `f` in a transaction, committing on `Ok` and rolling back on `Err`.
    pub fn transaction<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction<'_>) -> Result<R>,
    {
        let tx = self.begin()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback() {
                    warn!("Rollback after failed transaction also failed: {}", rollback);
                }
                Err(err)
            }
        }
    }

    /// Apply the added, modified and deleted rows of `tables` in one
    /// transaction, then accept them. Returns the number of rows applied.
    ///
    /// Any failure, including a row that no longer matches the database,
    /// rolls the whole transaction back and leaves `tables` untouched.
    pub fn synchronize(&self, tables: &mut [DataTable]) -> Result<usize> {
        let tx = self.begin()?;
        let applied = tx.apply_changes(tables)?;
        tx.commit()?;
        for table in tables.iter_mut() {
            table.accept_changes();
        }
        Ok(applied)
    }
}

impl DataCommands for Commander {
    fn context(&self) -> &Arc<CommanderContext> {
        &self.ctx
    }

    fn transaction_scope(&self) -> Option<&TransactionScope> {
        None
    }

    fn call_timeout(&self) -> Option<Duration> {
        self.ctx.config.resolve_timeout(self.timeout)
    }

    fn with_connection<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn Connection) -> Result<R>,
    {
        let mut conn = self.ctx.open()?;
        f(&mut *conn)
    }
}

/// Statements sharing one connection and one backend transaction.
///
/// Change events are delivered once, after a successful [`commit`]. Dropping
/// an unfinished transaction rolls it back.
///
/// [`commit`]: Transaction::commit
pub struct Transaction<'c> {
    commander: &'c Commander,
    conn: Mutex<Box<dyn Connection>>,
    scope: TransactionScope,
    finished: bool,
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("scope", &self.scope.id())
            .field("status", &self.scope.status())
            .finish()
    }
}

impl<'c> Transaction<'c> {
    pub fn scope(&self) -> &TransactionScope {
        &self.scope
    }

    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        let notifier = &self.commander.ctx.notifier;
        let conn = self.conn.get_mut();
        match conn.commit() {
            Ok(()) => {
                let delivered = notifier.complete(&self.scope, TransactionStatus::Committed);
                debug!("Transaction {} committed, {} events delivered", self.scope.id(), delivered);
                Ok(())
            }
            Err(err) => {
                let status = match conn.rollback() {
                    Ok(()) => TransactionStatus::Aborted,
                    Err(rollback) => {
                        warn!("Rollback after failed commit failed: {}", rollback);
                        TransactionStatus::InDoubt
                    }
                };
                notifier.complete(&self.scope, status);
                Err(err)
            }
        }
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        let result = self.conn.get_mut().rollback();
        self.commander
            .ctx
            .notifier
            .complete(&self.scope, TransactionStatus::Aborted);
        debug!("Transaction {} rolled back", self.scope.id());
        result
    }

    /// Apply pending row changes of `tables` through the provider's bulk
    /// adapter, raising one event per applied row. Does not accept them.
    ///
    /// Stops at the first modified or deleted row that matches nothing, with
    /// [`CommanderError::ConcurrencyViolation`].
    pub fn apply_changes(&self, tables: &[DataTable]) -> Result<usize> {
        let ctx = self.context();
        let timeout = self.call_timeout();
        let mut applied = 0;

        for table in tables.iter().filter(|t| t.has_changes()) {
            let schema = self.schema(&table.name)?;
            let changes = self.with_connection(|conn| {
                ctx.provider
                    .create_bulk_adapter()
                    .update(conn, &ctx.builder, &schema, table, timeout)
            })?;
            debug!("Applied {} changes to {}", changes.len(), table.name);

            for AppliedChange { kind, key, affected } in changes {
                if affected == 0 {
                    continue;
                }
                applied += 1;
                publish(self, move || {
                    ChangeEvent::new(table.name.as_str(), kind).with_conditions(key)
                });
            }
        }
        Ok(applied)
    }
}

impl DataCommands for Transaction<'_> {
    fn context(&self) -> &Arc<CommanderContext> {
        &self.commander.ctx
    }

    fn transaction_scope(&self) -> Option<&TransactionScope> {
        Some(&self.scope)
    }

    fn call_timeout(&self) -> Option<Duration> {
        self.commander.call_timeout()
    }

    fn with_connection<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn Connection) -> Result<R>,
    {
        let mut conn = self.conn.lock();
        f(&mut **conn)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!("Transaction {} dropped without commit, rolling back", self.scope.id());
        if let Err(err) = self.conn.get_mut().rollback() {
            warn!("Rollback of dropped transaction failed: {}", err);
        }
        self.commander
            .ctx
            .notifier
            .complete(&self.scope, TransactionStatus::Aborted);
    }
}
