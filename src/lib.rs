//! Provider-agnostic SQL commands for the Runar ecosystem.
//!
//! # Intention
//!
//! - Build and execute parameterized SELECT/INSERT/UPDATE/DELETE statements
//!   against any backend that implements [`Provider`].
//! - Cache per-table column and primary key metadata.
//! - Notify subscribers of data changes, once per committed transaction.
//!
//! # Architectural Boundaries
//!
//! - Only statement building, execution and change notification belong here.
//! - Backend specifics live behind [`Provider`]; [`SqliteProvider`] is the
//!   bundled implementation.
//! - No pooling, retries or object mapping.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rust_sql_commander::{Commander, CommanderConfig, DataCommands, Filter, SqliteProvider, Value};
//!
//! # fn main() -> rust_sql_commander::Result<()> {
//! let commander = Commander::new(Arc::new(SqliteProvider::new()), CommanderConfig::new("app.db"))?;
//! commander.subscribe(|events| println!("{} changes", events.len()));
//!
//! let tx = commander.begin()?;
//! tx.insert("users", &["id", "name"], &[Value::I64(1), "Ada".into()])?;
//! tx.update("users", &["name"], &["Ada L.".into()], &Filter::eq("id", 1i64))?;
//! tx.commit()?;
//!
//! assert!(commander.exists("users", &Filter::eq("id", 1i64))?);
//! # Ok(())
//! # }
//! ```

pub mod commander;
pub mod config;
pub mod error;
pub mod notify;
pub mod provider;
pub mod schema;
pub mod sqlite;
pub mod statement;
pub mod table;
pub mod value;

pub use commander::{Commander, CommanderContext, DataCommands, Transaction};
pub use config::CommanderConfig;
pub use error::{CommanderError, Result};
pub use notify::{
    classify_statement, ChangeEvent, ChangeKind, ChangeNotifier, SubscriptionToken,
    TransactionScope, TransactionStatus,
};
pub use provider::{
    AppliedChange, BatchCommand, BulkAdapter, Command, Connection, DefaultBulkAdapter, Provider,
};
pub use schema::{Column, SchemaCache, TableSchema};
pub use sqlite::{SqliteConnection, SqliteProvider};
pub use statement::{BatchStatement, Filter, Parameter, Projection, Statement, StatementBuilder};
pub use table::{DataRow, DataTable, RowState};
pub use value::{canonical_type, coerce, CanonicalType, DbType, Value};
