//! In-memory databases with change tracking.
//!
//! Each database holds tables keyed by primary key, a global change log and
//! a replication watermark. Source sessions read net changes from the log
//! (optionally through a snapshot); destination sessions apply changes
//! inside a transaction that is restored on rollback or drop.

use crate::backend::{Backend, ChangeFeed, DestinationSession, RawChange, SchemaCatalog};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sync_core::{
    Change, DatabaseInfo, ForeignKeyConstraint, Operation, TableDescriptor, UniqueConstraint,
    Version,
};

type Row = Map<String, Value>;
type FetchHook = Box<dyn FnOnce(&mut MemoryData) + Send>;

#[derive(Debug, Clone)]
struct LogEntry {
    version: Version,
    table: String,
    operation: Operation,
    key: Vec<Value>,
}

#[derive(Debug, Clone)]
struct MemoryTable {
    descriptor: TableDescriptor,
    rows: BTreeMap<String, Row>,
    tracked: bool,
    min_valid_version: Version,
}

/// The transactional contents of one database.
#[derive(Debug, Clone, Default)]
pub struct MemoryData {
    tables: BTreeMap<String, MemoryTable>,
    foreign_keys: Vec<ForeignKeyConstraint>,
    disabled: HashSet<String>,
    unique_constraints: Vec<UniqueConstraint>,
    tracking: bool,
    version: Version,
    log: Vec<LogEntry>,
    watermark: Option<Version>,
}

struct MemoryState {
    data: MemoryData,
    snapshot_isolation: bool,
    unavailable: bool,
    watermark_unreadable: bool,
    failing_tables: HashSet<String>,
    on_fetch: Option<FetchHook>,
    statements: Vec<String>,
}

/// A handle to one in-memory database. Clones share the database.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<Mutex<MemoryState>>,
}

/// Connects to [`MemoryDatabase`]s by connection string.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    databases: Arc<Mutex<HashMap<String, MemoryDatabase>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// The database behind `connection_string`, created empty on first use.
    pub fn database(&self, connection_string: &str) -> MemoryDatabase {
        self.databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(connection_string.to_string())
            .or_insert_with(MemoryDatabase::new)
            .clone()
    }

    fn open(&self, database: &DatabaseInfo) -> Result<MemoryDatabase> {
        let db = self
            .databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&database.connection_string)
            .cloned()
            .ok_or_else(|| anyhow!("database {} does not exist", database.name))?;
        if db.state().unavailable {
            bail!("connection to {} refused", database.name);
        }
        Ok(db)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    type Source = MemorySource;
    type Destination = MemoryDestination;

    async fn connect_source(&self, database: &DatabaseInfo) -> Result<MemorySource> {
        let db = self.open(database)?;
        Ok(MemorySource { db, snapshot: None })
    }

    async fn connect_destination(&self, database: &DatabaseInfo) -> Result<MemoryDestination> {
        let db = self.open(database)?;
        Ok(MemoryDestination { db, backup: None })
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryState {
                data: MemoryData::default(),
                snapshot_isolation: true,
                unavailable: false,
                watermark_unreadable: false,
                failing_tables: HashSet::new(),
                on_fetch: None,
                statements: Vec::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a table. Foreign keys and unique constraints on the
    /// descriptor are ignored; add them with [`add_foreign_key`](Self::add_foreign_key)
    /// and [`add_unique_constraint`](Self::add_unique_constraint).
    pub fn create_table(&self, descriptor: TableDescriptor) {
        let mut descriptor = descriptor;
        descriptor.foreign_keys.clear();
        descriptor.unique_constraints.clear();
        self.state().data.tables.insert(
            descriptor.name.clone(),
            MemoryTable {
                descriptor,
                rows: BTreeMap::new(),
                tracked: false,
                min_valid_version: 0,
            },
        );
    }

    pub fn add_foreign_key(&self, fk: ForeignKeyConstraint) {
        self.state().data.foreign_keys.push(fk);
    }

    pub fn add_unique_constraint(&self, constraint: UniqueConstraint) {
        self.state().data.unique_constraints.push(constraint);
    }

    /// Enable change tracking for the database.
    pub fn enable_change_tracking(&self) {
        self.state().data.tracking = true;
    }

    /// Enable change tracking for a table. Re-enabling drops the table's
    /// history and moves its minimum valid version to the current version.
    pub fn track_table(&self, table: &str) -> Result<()> {
        let mut state = self.state();
        let data = &mut state.data;
        let version = data.version;
        let entry = data
            .tables
            .get_mut(table)
            .ok_or_else(|| anyhow!("table {table} does not exist"))?;
        entry.tracked = true;
        entry.min_valid_version = version;
        data.log.retain(|e| e.table != table);
        Ok(())
    }

    pub fn set_min_valid_version(&self, table: &str, version: Version) -> Result<()> {
        let mut state = self.state();
        let entry = state
            .data
            .tables
            .get_mut(table)
            .ok_or_else(|| anyhow!("table {table} does not exist"))?;
        entry.min_valid_version = version;
        Ok(())
    }

    pub fn set_snapshot_isolation(&self, enabled: bool) {
        self.state().snapshot_isolation = enabled;
    }

    /// Refuse connections.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state().unavailable = unavailable;
    }

    /// Fail watermark reads.
    pub fn set_watermark_unreadable(&self, unreadable: bool) {
        self.state().watermark_unreadable = unreadable;
    }

    /// Fail every replicated statement against `table`.
    pub fn fail_writes_to(&self, table: &str) {
        self.state().failing_tables.insert(table.to_string());
    }

    /// Run `hook` against the live data right before the next change feed
    /// read, i.e. after the pass captured its version.
    pub fn on_next_fetch(&self, hook: impl FnOnce(&mut MemoryData) + Send + 'static) {
        self.state().on_fetch = Some(Box::new(hook));
    }

    pub fn insert(&self, table: &str, row: Value) -> Result<()> {
        self.state().data.insert(table, to_row(row)?)
    }

    pub fn update(&self, table: &str, row: Value) -> Result<()> {
        if !self.state().data.update(table, to_row(row)?)? {
            bail!("row not found in table {table}");
        }
        Ok(())
    }

    pub fn delete(&self, table: &str, key: &[Value]) -> Result<()> {
        if !self.state().data.delete(table, key)? {
            bail!("row not found in table {table}");
        }
        Ok(())
    }

    /// All rows of `table` in key order.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.state()
            .data
            .tables
            .get(table)
            .map(|t| t.rows.values().cloned().map(Value::Object).collect())
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, key: &[Value]) -> Option<Value> {
        self.state()
            .data
            .tables
            .get(table)
            .and_then(|t| t.rows.get(&key_string(key)))
            .cloned()
            .map(Value::Object)
    }

    pub fn current_version(&self) -> Option<Version> {
        self.state().data.current_version()
    }

    pub fn watermark(&self) -> Option<Version> {
        self.state().data.watermark
    }

    pub fn set_watermark(&self, version: Version) {
        self.state().data.watermark = Some(version);
    }

    pub fn is_foreign_key_enabled(&self, fk: &ForeignKeyConstraint) -> bool {
        !self.state().data.disabled.contains(&fk.full_name())
    }

    /// Statements issued by destination sessions, oldest first.
    pub fn statements(&self) -> Vec<String> {
        self.state().statements.clone()
    }

    pub fn clear_statements(&self) {
        self.state().statements.clear();
    }

    fn record(&self, statement: String) {
        self.state().statements.push(statement);
    }
}

impl MemoryData {
    fn current_version(&self) -> Option<Version> {
        self.tracking.then_some(self.version)
    }

    fn table(&self, name: &str) -> Result<&MemoryTable> {
        self.tables
            .get(name)
            .ok_or_else(|| anyhow!("table {name} does not exist"))
    }

    fn enabled_foreign_keys(&self) -> impl Iterator<Item = &ForeignKeyConstraint> {
        self.foreign_keys
            .iter()
            .filter(move |fk| !self.disabled.contains(&fk.full_name()))
    }

    /// Insert a JSON object row, e.g. from an [`on_next_fetch`](MemoryDatabase::on_next_fetch) hook.
    pub fn insert_json(&mut self, table: &str, row: Value) -> Result<()> {
        self.insert(table, to_row(row)?)
    }

    pub fn update_json(&mut self, table: &str, row: Value) -> Result<bool> {
        self.update(table, to_row(row)?)
    }

    fn insert(&mut self, table: &str, row: Row) -> Result<()> {
        let descriptor = self.table(table)?.descriptor.clone();
        let mut full = Row::new();
        for column in descriptor.column_names() {
            full.insert(
                column.clone(),
                row.get(column).cloned().unwrap_or(Value::Null),
            );
        }
        let key = row_key(&descriptor, &full)?;
        let key_str = key_string(&key);

        if self.table(table)?.rows.contains_key(&key_str) {
            bail!("duplicate key {key_str} in table {table}");
        }
        self.check_unique(table, &key_str, &full)?;
        self.check_references(table, &full)?;

        if let Some(entry) = self.tables.get_mut(table) {
            entry.rows.insert(key_str, full);
        }
        self.log(table, Operation::Insert, key);
        Ok(())
    }

    /// Returns `false` when no row has the given key.
    fn update(&mut self, table: &str, row: Row) -> Result<bool> {
        let descriptor = self.table(table)?.descriptor.clone();
        let key = row_key(&descriptor, &row)?;
        let key_str = key_string(&key);

        let Some(old) = self.table(table)?.rows.get(&key_str).cloned() else {
            return Ok(false);
        };
        let mut updated = old.clone();
        for (column, value) in row {
            if descriptor.other_columns.contains(&column) {
                updated.insert(column, value);
            }
        }

        self.check_unique(table, &key_str, &updated)?;
        self.check_references(table, &updated)?;
        self.check_referenced_by(table, &old, Some(&updated))?;

        if let Some(entry) = self.tables.get_mut(table) {
            entry.rows.insert(key_str, updated);
        }
        self.log(table, Operation::Update, key);
        Ok(true)
    }

    /// Returns `false` when no row has the given key.
    fn delete(&mut self, table: &str, key: &[Value]) -> Result<bool> {
        let key_str = key_string(key);
        let Some(old) = self.table(table)?.rows.get(&key_str).cloned() else {
            return Ok(false);
        };
        self.check_referenced_by(table, &old, None)?;

        if let Some(entry) = self.tables.get_mut(table) {
            entry.rows.remove(&key_str);
        }
        self.log(table, Operation::Delete, key.to_vec());
        Ok(true)
    }

    fn log(&mut self, table: &str, operation: Operation, key: Vec<Value>) {
        let tracked = self.tables.get(table).is_some_and(|t| t.tracked);
        if !(self.tracking && tracked) {
            return;
        }
        self.version += 1;
        self.log.push(LogEntry {
            version: self.version,
            table: table.to_string(),
            operation,
            key,
        });
    }

    fn check_unique(&self, table: &str, key_str: &str, row: &Row) -> Result<()> {
        let rows = &self.table(table)?.rows;
        for constraint in self.unique_constraints.iter().filter(|u| u.table == table) {
            let values: Vec<&Value> = constraint
                .columns
                .iter()
                .map(|c| row.get(c).unwrap_or(&Value::Null))
                .collect();
            if values.iter().any(|v| v.is_null()) {
                continue;
            }
            let clash = rows.iter().any(|(other_key, other)| {
                other_key != key_str
                    && constraint
                        .columns
                        .iter()
                        .zip(&values)
                        .all(|(c, v)| other.get(c) == Some(*v))
            });
            if clash {
                bail!(
                    "unique constraint {} violated in table {table}",
                    constraint.name
                );
            }
        }
        Ok(())
    }

    /// Outgoing foreign keys of `row` must point at existing rows.
    fn check_references(&self, table: &str, row: &Row) -> Result<()> {
        for fk in self.enabled_foreign_keys().filter(|fk| fk.table == table) {
            let value = match row.get(&fk.column) {
                Some(value) if !value.is_null() => value,
                _ => continue,
            };
            let found = self
                .table(&fk.referenced_table)?
                .rows
                .values()
                .any(|r| r.get(&fk.referenced_column) == Some(value));
            if !found {
                bail!(
                    "foreign key constraint {} violated: {}.{} = {value} has no match in {}",
                    fk.name,
                    table,
                    fk.column,
                    fk.referenced_table
                );
            }
        }
        Ok(())
    }

    /// Rows referencing `old` must not lose their target.
    fn check_referenced_by(&self, table: &str, old: &Row, new: Option<&Row>) -> Result<()> {
        for fk in self
            .enabled_foreign_keys()
            .filter(|fk| fk.referenced_table == table)
        {
            let value = match old.get(&fk.referenced_column) {
                Some(value) if !value.is_null() => value,
                _ => continue,
            };
            if new.is_some_and(|n| n.get(&fk.referenced_column) == Some(value)) {
                continue;
            }
            let referenced = self
                .table(&fk.table)?
                .rows
                .values()
                .any(|r| r.get(&fk.column) == Some(value));
            if referenced {
                bail!(
                    "foreign key constraint {} violated: {}.{} = {value} is still referenced from {}",
                    fk.name,
                    table,
                    fk.referenced_column,
                    fk.table
                );
            }
        }
        Ok(())
    }

    /// Validate every row of the constraint's table.
    fn check_foreign_key(&self, fk: &ForeignKeyConstraint) -> Result<()> {
        let referenced = &self.table(&fk.referenced_table)?.rows;
        for row in self.table(&fk.table)?.rows.values() {
            let value = match row.get(&fk.column) {
                Some(value) if !value.is_null() => value,
                _ => continue,
            };
            if !referenced
                .values()
                .any(|r| r.get(&fk.referenced_column) == Some(value))
            {
                bail!(
                    "foreign key constraint {} violated: {}.{} = {value} has no match in {}",
                    fk.name,
                    fk.table,
                    fk.column,
                    fk.referenced_table
                );
            }
        }
        Ok(())
    }

    /// Net changes of a table since `baseline`, one per key.
    fn net_changes(&self, descriptor: &TableDescriptor, baseline: Version) -> Vec<RawChange> {
        let mut order: Vec<String> = Vec::new();
        let mut by_key: HashMap<String, Vec<&LogEntry>> = HashMap::new();
        for entry in self
            .log
            .iter()
            .filter(|e| e.table == descriptor.name && e.version > baseline)
        {
            let key = key_string(&entry.key);
            by_key
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push(key);
                    Vec::new()
                })
                .push(entry);
        }

        let rows = self.tables.get(&descriptor.name).map(|t| &t.rows);
        let mut changes: Vec<RawChange> = order
            .iter()
            .filter_map(|key| {
                let entries = by_key.get(key)?;
                let first = entries.first()?;
                let last = entries.last()?;
                let operation = if last.operation == Operation::Delete {
                    Operation::Delete
                } else if first.operation == Operation::Insert {
                    Operation::Insert
                } else {
                    Operation::Update
                };
                let creation_version = entries
                    .iter()
                    .filter(|e| e.operation == Operation::Insert)
                    .map(|e| e.version)
                    .max();
                let current = rows.and_then(|r| r.get(key));
                let others = descriptor
                    .other_columns
                    .iter()
                    .map(|c| {
                        current
                            .and_then(|row| row.get(c))
                            .cloned()
                            .unwrap_or(Value::Null)
                    })
                    .collect();

                Some(RawChange {
                    operation: operation.code().to_string(),
                    version: last.version,
                    creation_version,
                    keys: last.key.clone(),
                    others,
                })
            })
            .collect();

        changes.sort_by_key(|c| c.creation_version.unwrap_or(c.version));
        changes
    }
}

/// A source session; reads through a snapshot once one is started.
pub struct MemorySource {
    db: MemoryDatabase,
    snapshot: Option<MemoryData>,
}

impl MemorySource {
    fn read<T>(&self, f: impl FnOnce(&MemoryData) -> T) -> T {
        match &self.snapshot {
            Some(snapshot) => f(snapshot),
            None => f(&self.db.state().data),
        }
    }
}

#[async_trait]
impl SchemaCatalog for MemorySource {
    async fn describe_tracked_tables(&mut self) -> Result<Vec<TableDescriptor>> {
        Ok(self.read(|data| {
            if !data.tracking {
                return Vec::new();
            }
            data.tables
                .values()
                .filter(|t| t.tracked)
                .map(|t| t.descriptor.clone())
                .collect()
        }))
    }

    async fn describe_foreign_keys(&mut self) -> Result<Vec<ForeignKeyConstraint>> {
        Ok(self.read(|data| data.enabled_foreign_keys().cloned().collect()))
    }

    async fn describe_unique_constraints(&mut self) -> Result<Vec<UniqueConstraint>> {
        Ok(self.read(|data| data.unique_constraints.clone()))
    }
}

#[async_trait]
impl ChangeFeed for MemorySource {
    async fn current_version(&mut self) -> Result<Option<Version>> {
        Ok(self.read(MemoryData::current_version))
    }

    async fn begin_snapshot(&mut self) -> Result<bool> {
        let state = self.db.state();
        if !state.snapshot_isolation {
            return Ok(false);
        }
        let data = state.data.clone();
        drop(state);
        self.snapshot = Some(data);
        Ok(true)
    }

    async fn end_snapshot(&mut self) -> Result<()> {
        self.snapshot = None;
        Ok(())
    }

    async fn min_valid_version(&mut self, table: &TableDescriptor) -> Result<Option<Version>> {
        Ok(self.read(|data| {
            data.tables
                .get(&table.name)
                .filter(|t| t.tracked)
                .map(|t| t.min_valid_version)
        }))
    }

    async fn changes_since(
        &mut self,
        table: &TableDescriptor,
        baseline: Version,
    ) -> Result<Vec<RawChange>> {
        {
            let mut state = self.db.state();
            if let Some(hook) = state.on_fetch.take() {
                hook(&mut state.data);
            }
        }
        Ok(self.read(|data| data.net_changes(table, baseline)))
    }
}

/// A destination session. An open transaction is rolled back on drop.
pub struct MemoryDestination {
    db: MemoryDatabase,
    backup: Option<MemoryData>,
}

impl MemoryDestination {
    fn write(&mut self, table: &str, f: impl FnOnce(&mut MemoryData) -> Result<()>) -> Result<()> {
        if self.backup.is_none() {
            bail!("no transaction in progress");
        }
        let mut state = self.db.state();
        if state.failing_tables.contains(table) {
            bail!("statement against {table} failed");
        }
        f(&mut state.data)
    }
}

#[async_trait]
impl DestinationSession for MemoryDestination {
    async fn read_watermark(&mut self) -> Result<Option<Version>> {
        let state = self.db.state();
        if state.watermark_unreadable {
            bail!("permission denied for table change_sync_info");
        }
        Ok(state.data.watermark)
    }

    async fn tracked_version(&mut self) -> Result<Option<Version>> {
        Ok(self.db.current_version())
    }

    async fn begin(&mut self) -> Result<()> {
        let data = self.db.state().data.clone();
        self.backup = Some(data);
        self.db.record("BEGIN".to_string());
        Ok(())
    }

    async fn disable_foreign_key(&mut self, fk: &ForeignKeyConstraint) -> Result<()> {
        let name = fk.full_name();
        self.write(&fk.table, |data| {
            if !data.foreign_keys.iter().any(|f| f == fk) {
                bail!("foreign key constraint {name} does not exist");
            }
            data.disabled.insert(name.clone());
            Ok(())
        })?;
        self.db.record(format!("DISABLE {}", fk.full_name()));
        Ok(())
    }

    async fn enable_foreign_key(&mut self, fk: &ForeignKeyConstraint) -> Result<()> {
        self.write(&fk.table, |data| {
            data.check_foreign_key(fk)?;
            data.disabled.remove(&fk.full_name());
            Ok(())
        })?;
        self.db.record(format!("ENABLE {}", fk.full_name()));
        Ok(())
    }

    async fn insert(&mut self, change: &Change) -> Result<()> {
        let row: Row = change
            .keys
            .iter()
            .chain(change.others.iter())
            .map(|(c, v)| (c.to_string(), v.clone()))
            .collect();
        self.write(change.table_name(), |data| data.insert(change.table_name(), row))?;
        self.db
            .record(format!("INSERT {} {}", change.table_name(), change_key(change)));
        Ok(())
    }

    async fn update(&mut self, change: &Change) -> Result<()> {
        let row: Row = change
            .keys
            .iter()
            .chain(change.others.iter())
            .map(|(c, v)| (c.to_string(), v.clone()))
            .collect();
        self.write(change.table_name(), |data| {
            data.update(change.table_name(), row).map(|_| ())
        })?;
        self.db
            .record(format!("UPDATE {} {}", change.table_name(), change_key(change)));
        Ok(())
    }

    async fn delete(&mut self, change: &Change) -> Result<()> {
        let key: Vec<Value> = change.keys.values().cloned().collect();
        self.write(change.table_name(), |data| {
            data.delete(change.table_name(), &key).map(|_| ())
        })?;
        self.db
            .record(format!("DELETE {} {}", change.table_name(), change_key(change)));
        Ok(())
    }

    async fn write_watermark(&mut self, version: Version) -> Result<()> {
        if self.backup.is_none() {
            bail!("no transaction in progress");
        }
        self.db.state().data.watermark = Some(version);
        self.db.record(format!("WATERMARK {version}"));
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.backup.take().is_none() {
            bail!("no transaction in progress");
        }
        self.db.record("COMMIT".to_string());
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(backup) = self.backup.take() {
            self.db.state().data = backup;
        }
        self.db.record("ROLLBACK".to_string());
        Ok(())
    }
}

impl Drop for MemoryDestination {
    fn drop(&mut self) {
        if let Some(backup) = self.backup.take() {
            self.db.state().data = backup;
        }
    }
}

fn to_row(value: Value) -> Result<Row> {
    match value {
        Value::Object(row) => Ok(row),
        other => bail!("expected a JSON object row, got {other}"),
    }
}

fn row_key(descriptor: &TableDescriptor, row: &Row) -> Result<Vec<Value>> {
    descriptor
        .key_columns
        .iter()
        .map(|c| match row.get(c) {
            Some(value) if !value.is_null() => Ok(value.clone()),
            _ => Err(anyhow!(
                "key column {c} of table {} must not be null",
                descriptor.name
            )),
        })
        .collect()
}

fn key_string(key: &[Value]) -> String {
    Value::Array(key.to_vec()).to_string()
}

fn change_key(change: &Change) -> String {
    key_string(&change.keys.values().cloned().collect::<Vec<_>>())
}
