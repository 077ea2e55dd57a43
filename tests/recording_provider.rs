// Commander behavior against an in-memory provider that records every call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rust_sql_commander::provider::quote_with;
use rust_sql_commander::{
    BatchCommand, ChangeKind, Column, Command, Commander,
    CommanderConfig, CommanderError, Connection, DataCommands, DataTable, DbType, Filter,
    Parameter, Provider, Result, TableSchema, Value,
};

#[derive(Default)]
struct Recorder {
    opens: AtomicUsize,
    schema_loads: AtomicUsize,
    commands: Mutex<Vec<Command>>,
    batches: Mutex<Vec<BatchCommand>>,
    databases: Mutex<Vec<Option<String>>>,
    /// Affected-row count every execute reports.
    affected: Mutex<u64>,
}

struct RecordingProvider {
    recorder: Arc<Recorder>,
}

struct RecordingConnection {
    recorder: Arc<Recorder>,
}

impl Provider for RecordingProvider {
    fn name(&self) -> &str {
        "recording"
    }

    fn open_connection(
        &self,
        _connection_string: &str,
        database: Option<&str>,
    ) -> Result<Box<dyn Connection>> {
        self.recorder.opens.fetch_add(1, Ordering::SeqCst);
        self.recorder
            .databases
            .lock()
            .push(database.map(str::to_string));
        Ok(Box::new(RecordingConnection {
            recorder: Arc::clone(&self.recorder),
        }))
    }

    fn create_parameter(&self, name: &str, value: Value) -> Parameter {
        Parameter::new(format!(":{}", name), value)
    }

    fn quote_identifier(&self, identifier: &str) -> Result<String> {
        quote_with(identifier, '[', ']')
    }
}

impl Connection for RecordingConnection {
    fn execute(&mut self, command: &Command) -> Result<u64> {
        self.recorder.commands.lock().push(command.clone());
        Ok(*self.recorder.affected.lock())
    }

    fn execute_batch(&mut self, command: &BatchCommand) -> Result<u64> {
        self.recorder.batches.lock().push(command.clone());
        Ok(*self.recorder.affected.lock() * command.rows.len() as u64)
    }

    fn query(&mut self, command: &Command) -> Result<DataTable> {
        self.recorder.commands.lock().push(command.clone());
        Ok(DataTable::new("", Vec::new()))
    }

    fn query_scalar(&mut self, command: &Command) -> Result<Option<Value>> {
        self.recorder.commands.lock().push(command.clone());
        Ok(None)
    }

    fn fetch_schema(&mut self, table: &str, select: &Command) -> Result<TableSchema> {
        self.recorder.schema_loads.fetch_add(1, Ordering::SeqCst);
        self.recorder.commands.lock().push(select.clone());
        Ok(TableSchema::new(table)
            .with_column(Column::new("Id", DbType::Int32))
            .with_column(Column::new("Name", DbType::Text))
            .with_primary_key(&["Id"]))
    }

    fn table_names(&mut self) -> Result<Vec<String>> {
        Ok(vec!["Orders".to_string()])
    }

    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}

fn recording_commander(config: CommanderConfig) -> (Commander, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    *recorder.affected.lock() = 1;
    let provider = RecordingProvider {
        recorder: Arc::clone(&recorder),
    };
    let commander = Commander::new(Arc::new(provider), config).unwrap();
    (commander, recorder)
}

fn last_command(recorder: &Recorder) -> Command {
    recorder.commands.lock().last().cloned().expect("a command was issued")
}

#[test]
fn test_arity_mismatch_never_reaches_the_provider() {
    let (commander, recorder) = recording_commander(CommanderConfig::new("mem"));
    let bad = Filter::all_of(&["a", "b"], &[Value::I32(1)]);

    let results = [
        commander.exists("Orders", &bad).map(|_| ()),
        commander.count("Orders", &bad).map(|_| ()),
        commander.scalar("Orders", "a", &bad).map(|_| ()),
        commander.query_table("Orders", &[], &bad).map(|_| ()),
        commander.delete("Orders", &bad).map(|_| ()),
        commander
            .update("Orders", &["x"], &[Value::I32(1)], &bad)
            .map(|_| ()),
        commander
            .insert("Orders", &["x", "y"], &[Value::I32(1)])
            .map(|_| ()),
        commander
            .insert_batch("Orders", &["x", "y"], &[vec![Value::I32(1)]])
            .map(|_| ()),
        commander
            .execute_batch("INSERT INTO Orders VALUES (:a)", &["a"], &[vec![]])
            .map(|_| ()),
    ];
    for result in results {
        assert!(matches!(result, Err(CommanderError::ArityMismatch { .. })));
    }
    assert_eq!(recorder.opens.load(Ordering::SeqCst), 0);
}

#[test]
fn test_provider_shapes_statement_text() {
    let (commander, recorder) = recording_commander(CommanderConfig::new("mem"));
    commander
        .update(
            "Orders",
            &["Name"],
            &["x".into()],
            &Filter::all_of(&["Id", "Region"], &[Value::I32(1), "EU".into()]),
        )
        .unwrap();
    let command = last_command(&recorder);
    assert_eq!(
        command.text,
        "UPDATE [Orders] SET [Name] = :value0 WHERE [Id] = :condition0 AND [Region] = :condition1"
    );
    let names: Vec<&str> = command.parameters.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec![":value0", ":condition0", ":condition1"]);

    commander.delete_all("Orders").unwrap();
    assert_eq!(last_command(&recorder).text, "DELETE FROM [Orders]");
}

#[test]
fn test_omitted_fields_use_cached_columns() {
    let (commander, recorder) = recording_commander(CommanderConfig::new("mem"));

    commander.query_table("Orders", &[], &Filter::All).unwrap();
    assert_eq!(last_command(&recorder).text, "SELECT * FROM [Orders]");
    assert_eq!(recorder.schema_loads.load(Ordering::SeqCst), 0);

    commander
        .query_table("Orders", &[], &Filter::eq("Id", 3i32))
        .unwrap();
    assert_eq!(
        last_command(&recorder).text,
        "SELECT [Id], [Name] FROM [Orders] WHERE [Id] = :condition0"
    );
    commander
        .query_table("Orders", &[], &Filter::eq("Id", 4i32))
        .unwrap();
    assert_eq!(recorder.schema_loads.load(Ordering::SeqCst), 1);

    commander.invalidate_schema();
    commander.schema("Orders").unwrap();
    assert_eq!(recorder.schema_loads.load(Ordering::SeqCst), 2);
}

#[test]
fn test_timeouts_and_database_are_passed_through() {
    let config = CommanderConfig::new("mem")
        .with_database("sales")
        .with_command_timeout(Duration::from_secs(30));
    let (commander, recorder) = recording_commander(config);

    commander.count("Orders", &Filter::All).unwrap();
    assert_eq!(last_command(&recorder).timeout, Some(Duration::from_secs(30)));

    commander
        .with_timeout(Duration::from_secs(2))
        .count("Orders", &Filter::All)
        .unwrap();
    assert_eq!(last_command(&recorder).timeout, Some(Duration::from_secs(2)));

    commander
        .with_timeout(Duration::ZERO)
        .insert_batch("Orders", &["Id"], &[vec![Value::I32(1)]])
        .unwrap();
    let batch = recorder.batches.lock().last().cloned().unwrap();
    assert_eq!(batch.timeout, Some(Duration::from_secs(30)));

    assert!(recorder
        .databases
        .lock()
        .iter()
        .all(|db| db.as_deref() == Some("sales")));
}

#[test]
fn test_zero_affected_rows_raise_nothing() {
    let (commander, recorder) = recording_commander(CommanderConfig::new("mem"));
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    commander.subscribe(move |events| {
        counter.fetch_add(events.len(), Ordering::SeqCst);
    });

    *recorder.affected.lock() = 0;
    commander
        .insert("Orders", &["Id"], &[Value::I32(1)])
        .unwrap();
    commander
        .insert_batch("Orders", &["Id"], &[vec![Value::I32(1)], vec![Value::I32(2)]])
        .unwrap();
    commander.delete("Orders", &Filter::eq("Id", 1i32)).unwrap();
    commander.execute("DELETE FROM Orders", &[]).unwrap();
    assert_eq!(delivered.load(Ordering::SeqCst), 0);

    *recorder.affected.lock() = 1;
    commander
        .insert_batch("Orders", &["Id"], &[vec![Value::I32(1)], vec![Value::I32(2)]])
        .unwrap();
    assert_eq!(delivered.load(Ordering::SeqCst), 2);
}

#[test]
fn test_empty_batch_skips_the_provider() {
    let (commander, recorder) = recording_commander(CommanderConfig::new("mem"));
    assert_eq!(commander.insert_batch("Orders", &["Id"], &[]).unwrap(), 0);
    assert_eq!(
        commander
            .execute_batch("INSERT INTO Orders VALUES (:a)", &["a"], &[])
            .unwrap(),
        0
    );
    assert_eq!(recorder.opens.load(Ordering::SeqCst), 0);
}

#[test]
fn test_transaction_uses_one_connection() {
    let (commander, recorder) = recording_commander(CommanderConfig::new("mem"));
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&kinds);
    let token = commander.subscribe(move |events| {
        sink.lock()
            .extend(events.iter().map(|e| (e.table().to_string(), e.kind())));
    });

    let tx = commander.begin().unwrap();
    tx.insert("Orders", &["Id"], &[Value::I32(1)]).unwrap();
    tx.update("Orders", &["Name"], &["n".into()], &Filter::eq("Id", 1i32))
        .unwrap();
    tx.delete_in("Orders", "Id", vec![Value::I32(1), Value::I32(2)])
        .unwrap();
    tx.announce_change("Audit");
    assert!(kinds.lock().is_empty());
    tx.commit().unwrap();
    assert_eq!(recorder.opens.load(Ordering::SeqCst), 1);

    assert_eq!(
        *kinds.lock(),
        vec![
            ("Orders".to_string(), ChangeKind::Insert),
            ("Orders".to_string(), ChangeKind::Update),
            ("Orders".to_string(), ChangeKind::Delete),
            ("Audit".to_string(), ChangeKind::Unknown),
        ]
    );

    assert!(commander.unsubscribe(token));
    commander.insert("Orders", &["Id"], &[Value::I32(2)]).unwrap();
    assert_eq!(kinds.lock().len(), 4);
}
