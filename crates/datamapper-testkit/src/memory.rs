//! In-memory storage speaking the generator's SQL.
//!
//! [`MemoryDatabase`] keeps tables as vectors of column maps and executes
//! parsed statements against them. Every connection opened by a
//! [`MemoryFactory`] shares one database, so two sessions see each other's
//! committed writes the way two pooled connections to one server would.
//!
//! Transactions snapshot the whole store on `BEGIN` and restore it on
//! `ROLLBACK`. That isolates a single writer correctly; concurrent writers
//! on other connections inside the same window are rolled back too.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use asupersync::{CancelKind, Cx, Outcome};
use datamapper_core::error::{QueryError, QueryErrorKind};
use datamapper_core::{Connection, ConnectionFactory, Error, Row, Value};

use crate::sql::{self, Aggregate, Cmp, Condition, Projection, Statement, SubSelect};

type Record = BTreeMap<String, Value>;

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: HashMap<String, Vec<Record>>,
    sequences: HashMap<String, i64>,
}

/// Counters for everything that reached storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    pub connects: u64,
    /// Row-returning statements (`query`, `query_one`, `scalar`).
    pub queries: u64,
    /// Non-query statements (`execute`, `insert`).
    pub executes: u64,
    pub batches: u64,
    /// Every statement executed, including each member of a batch.
    pub statements: u64,
    pub begins: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub pings: u64,
}

#[derive(Debug, Default)]
struct Store {
    tables: Tables,
    snapshots: HashMap<u64, Tables>,
    stats: DatabaseStats,
    failures: VecDeque<String>,
    /// Cancelled once the next statement has run.
    cancel_after: Option<Cx>,
    log: Vec<String>,
}

/// Shared in-memory database. Cloning yields another handle to the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    store: Arc<Mutex<Store>>,
    next_connection: Arc<AtomicU64>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> DatabaseStats {
        self.lock().stats
    }

    pub fn reset_stats(&self) {
        self.lock().stats = DatabaseStats::default();
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.rows.get(table).map_or(0, Vec::len)
    }

    /// Current contents of a table, columns in name order.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .rows
            .get(table)
            .map(|records| {
                records
                    .iter()
                    .map(|r| Row::new(r.keys().cloned().collect(), r.values().cloned().collect()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Seed a row directly, bypassing statistics. Returns its `id`.
    ///
    /// Useful for link tables and for rows written "by another process".
    pub fn insert_row(&self, table: &str, values: &[(&str, Value)]) -> Value {
        let mut store = self.lock();
        let record: Record = values
            .iter()
            .map(|(column, value)| ((*column).to_string(), value.clone()))
            .collect();
        match insert_record(&mut store.tables, table, record, "id") {
            Ok(id) => id,
            Err(message) => panic!("seeding {table}: {message}"),
        }
    }

    /// Overwrite columns on every row of `table` whose `id` matches.
    pub fn update_row(&self, table: &str, id: &Value, values: &[(&str, Value)]) -> usize {
        let mut store = self.lock();
        let Some(records) = store.tables.rows.get_mut(table) else {
            return 0;
        };
        let mut changed = 0;
        for record in records.iter_mut().filter(|r| cell(r, "id").same_as(id)) {
            for (column, value) in values {
                record.insert((*column).to_string(), value.clone());
            }
            changed += 1;
        }
        changed
    }

    /// Make the next statement fail with a storage error carrying `message`.
    ///
    /// Queued failures are consumed in order, one per statement.
    pub fn fail_next(&self, message: &str) {
        self.lock().failures.push_back(message.to_string());
    }

    /// Cancel `cx` right after the next statement completes, so the caller
    /// sees the storage result but finds itself cancelled afterwards.
    pub fn cancel_after_next(&self, cx: &Cx) {
        self.lock().cancel_after = Some(cx.clone());
    }

    /// SQL text of every statement executed so far, oldest first.
    pub fn executed(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    fn connect(&self) -> MemoryConnection {
        self.lock().stats.connects += 1;
        MemoryConnection {
            db: self.clone(),
            id: self.next_connection.fetch_add(1, AtomicOrdering::Relaxed),
        }
    }

    fn run(&self, sql: &str, params: &[Value]) -> Result<Executed, Error> {
        let (result, cancel) = {
            let mut store = self.lock();
            let result = Self::run_locked(&mut store, sql, params);
            (result, store.cancel_after.take())
        };
        if let Some(cx) = cancel {
            cx.cancel_with(CancelKind::User, Some("cancelled after statement"));
        }
        result
    }

    fn run_locked(store: &mut Store, sql: &str, params: &[Value]) -> Result<Executed, Error> {
        store.stats.statements += 1;
        store.log.push(sql.to_string());
        if let Some(message) = store.failures.pop_front() {
            return Err(query_error(QueryErrorKind::Database, sql, message));
        }
        let statement =
            sql::parse(sql, params).map_err(|m| query_error(QueryErrorKind::Syntax, sql, m))?;
        tracing::trace!(sql, "memory statement");
        execute(&mut store.tables, statement).map_err(|(kind, m)| query_error(kind, sql, m))
    }
}

fn query_error(kind: QueryErrorKind, sql: &str, message: String) -> Error {
    Error::Query(QueryError {
        kind,
        sql: Some(sql.to_string()),
        message,
        source: None,
    })
}

/// Result of one statement.
enum Executed {
    Rows(Vec<Row>),
    Affected { count: u64, last_id: Option<Value> },
}

impl Executed {
    fn into_rows(self) -> Vec<Row> {
        match self {
            Executed::Rows(rows) => rows,
            Executed::Affected { .. } => Vec::new(),
        }
    }

    fn affected(&self) -> u64 {
        match self {
            Executed::Rows(rows) => rows.len() as u64,
            Executed::Affected { count, .. } => *count,
        }
    }
}

type ExecError = (QueryErrorKind, String);

static NULL: Value = Value::Null;

fn cell<'a>(record: &'a Record, column: &str) -> &'a Value {
    record.get(column).unwrap_or(&NULL)
}

fn execute(tables: &mut Tables, statement: Statement) -> Result<Executed, ExecError> {
    match statement {
        Statement::Select {
            projection,
            table,
            conditions,
            order,
            limit,
            offset,
        } => {
            let mut matched = Vec::new();
            for record in tables.rows.get(&table).into_iter().flatten() {
                if matches_all(tables, record, &conditions)? {
                    matched.push(record);
                }
            }
            let row = match projection {
                Projection::CountAll => single("count", Value::BigInt(matched.len() as i64)),
                Projection::Aggregate(function, column) => {
                    let values: Vec<&Value> = matched
                        .iter()
                        .map(|r| cell(r, &column))
                        .filter(|v| !v.is_null())
                        .collect();
                    single("value", aggregate(function, &values))
                }
                Projection::Columns(columns) => {
                    matched.sort_by(|a, b| {
                        order
                            .iter()
                            .map(|(column, descending)| {
                                let ord = cell(a, column).compare(cell(b, column));
                                if *descending { ord.reverse() } else { ord }
                            })
                            .find(|o| *o != Ordering::Equal)
                            .unwrap_or(Ordering::Equal)
                    });
                    let rows = matched
                        .into_iter()
                        .skip(offset)
                        .take(limit.unwrap_or(usize::MAX))
                        .map(|r| {
                            Row::new(
                                columns.clone(),
                                columns.iter().map(|c| cell(r, c).clone()).collect(),
                            )
                        })
                        .collect();
                    return Ok(Executed::Rows(rows));
                }
            };
            Ok(Executed::Rows(vec![row]))
        }
        Statement::Insert {
            table,
            columns,
            rows,
            returning,
        } => {
            let key = returning.clone().unwrap_or_else(|| "id".to_string());
            let mut last_id = None;
            let mut count = 0;
            for values in rows {
                let record: Record = columns.iter().cloned().zip(values).collect();
                let id = insert_record(tables, &table, record, &key)
                    .map_err(|m| (QueryErrorKind::Constraint, m))?;
                last_id = Some(id);
                count += 1;
            }
            if let Some(column) = returning {
                let id = last_id.unwrap_or(Value::Null);
                return Ok(Executed::Rows(vec![single(&column, id)]));
            }
            Ok(Executed::Affected { count, last_id })
        }
        Statement::Update {
            table,
            assignments,
            conditions,
        } => {
            let mut hits = Vec::new();
            for (i, record) in tables.rows.get(&table).into_iter().flatten().enumerate() {
                if matches_all(tables, record, &conditions)? {
                    hits.push(i);
                }
            }
            if let Some(records) = tables.rows.get_mut(&table) {
                for i in &hits {
                    for (column, value) in &assignments {
                        records[*i].insert(column.clone(), value.clone());
                    }
                }
            }
            Ok(Executed::Affected {
                count: hits.len() as u64,
                last_id: None,
            })
        }
        Statement::Delete { table, conditions } => {
            let mut keep = Vec::new();
            for record in tables.rows.get(&table).into_iter().flatten() {
                keep.push(!matches_all(tables, record, &conditions)?);
            }
            let removed = keep.iter().filter(|k| !**k).count() as u64;
            if let Some(records) = tables.rows.get_mut(&table) {
                let mut flags = keep.into_iter();
                records.retain(|_| flags.next().unwrap_or(true));
            }
            Ok(Executed::Affected {
                count: removed,
                last_id: None,
            })
        }
    }
}

fn single(column: &str, value: Value) -> Row {
    Row::new(vec![column.to_string()], vec![value])
}

/// Store one record, assigning the next sequence value to `key` when absent.
fn insert_record(
    tables: &mut Tables,
    table: &str,
    mut record: Record,
    key: &str,
) -> Result<Value, String> {
    let sequence = tables.sequences.entry(table.to_string()).or_insert(0);
    let id = match record.get(key) {
        Some(v) if !v.is_null() => {
            if let Some(n) = v.as_i64() {
                *sequence = (*sequence).max(n);
            }
            v.clone()
        }
        _ => {
            *sequence += 1;
            let id = Value::BigInt(*sequence);
            record.insert(key.to_string(), id.clone());
            id
        }
    };
    let records = tables.rows.entry(table.to_string()).or_default();
    if records.iter().any(|r| cell(r, key).same_as(&id)) {
        return Err(format!("duplicate key {id:?} in {table}"));
    }
    records.push(record);
    Ok(id)
}

fn matches_all(
    tables: &Tables,
    record: &Record,
    conditions: &[Condition],
) -> Result<bool, ExecError> {
    for condition in conditions {
        if !matches(tables, record, condition)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Evaluate one condition; comparisons against NULL are never true.
fn matches(tables: &Tables, record: &Record, condition: &Condition) -> Result<bool, ExecError> {
    Ok(match condition {
        Condition::Const(b) => *b,
        Condition::IsNull { column, negated } => cell(record, column).is_null() != *negated,
        Condition::Compare { column, cmp, value } => {
            let left = cell(record, column);
            if left.is_null() || value.is_null() {
                return Ok(false);
            }
            let ord = left.compare(value);
            match cmp {
                Cmp::Eq => ord == Ordering::Equal,
                Cmp::NotEq => ord != Ordering::Equal,
                Cmp::Lt => ord == Ordering::Less,
                Cmp::LtEq => ord != Ordering::Greater,
                Cmp::Gt => ord == Ordering::Greater,
                Cmp::GtEq => ord != Ordering::Less,
            }
        }
        Condition::Like {
            column,
            pattern,
            negated,
        } => match cell(record, column).as_str() {
            Some(text) => sql::like(text, pattern) != *negated,
            None => false,
        },
        Condition::In {
            column,
            values,
            negated,
        } => member_of(cell(record, column), values.iter(), *negated),
        Condition::InSelect {
            column,
            sub,
            negated,
        } => {
            let values = sub_select(tables, sub)?;
            member_of(cell(record, column), values.iter(), *negated)
        }
    })
}

fn member_of<'a>(value: &Value, mut list: impl Iterator<Item = &'a Value>, negated: bool) -> bool {
    if value.is_null() {
        return false;
    }
    list.any(|v| !v.is_null() && value.compare(v) == Ordering::Equal) != negated
}

fn sub_select(tables: &Tables, sub: &SubSelect) -> Result<Vec<Value>, ExecError> {
    let mut out = Vec::new();
    for record in tables.rows.get(&sub.table).into_iter().flatten() {
        if matches_all(tables, record, &sub.conditions)? {
            out.push(cell(record, &sub.column).clone());
        }
    }
    Ok(out)
}

/// Aggregate over non-null values; empty input yields NULL except for COUNT.
fn aggregate(function: Aggregate, values: &[&Value]) -> Value {
    match function {
        Aggregate::Count => Value::BigInt(values.len() as i64),
        _ if values.is_empty() => Value::Null,
        Aggregate::Sum => {
            let integral = values
                .iter()
                .all(|v| matches!(v, Value::Int(_) | Value::BigInt(_)));
            if integral {
                Value::BigInt(values.iter().filter_map(|v| v.as_i64()).sum())
            } else {
                Value::Double(values.iter().filter_map(|v| v.as_f64()).sum())
            }
        }
        Aggregate::Avg => {
            let sum: f64 = values.iter().filter_map(|v| v.as_f64()).sum();
            Value::Double(sum / values.len() as f64)
        }
        Aggregate::Min => pick(values, Ordering::Less),
        Aggregate::Max => pick(values, Ordering::Greater),
    }
}

fn pick(values: &[&Value], wanted: Ordering) -> Value {
    values
        .iter()
        .copied()
        .reduce(|best, v| if v.compare(best) == wanted { v } else { best })
        .cloned()
        .unwrap_or(Value::Null)
}

/// One connection to a [`MemoryDatabase`].
#[derive(Debug)]
pub struct MemoryConnection {
    db: MemoryDatabase,
    id: u64,
}

impl MemoryConnection {
    fn statement(
        &self,
        sql: &str,
        params: &[Value],
        counter: fn(&mut DatabaseStats),
    ) -> Result<Executed, Error> {
        counter(&mut self.db.lock().stats);
        self.db.run(sql, params)
    }

    fn transaction_error(message: &str) -> Error {
        Error::Custom(format!("memory transaction: {message}"))
    }
}

impl Connection for MemoryConnection {
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            match self.statement(sql, params, |s| s.queries += 1) {
                Ok(executed) => Outcome::Ok(executed.into_rows()),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            match self.statement(sql, params, |s| s.executes += 1) {
                Ok(executed) => Outcome::Ok(executed.affected()),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            match self.statement(sql, params, |s| s.executes += 1) {
                Ok(Executed::Affected { last_id, .. }) => {
                    Outcome::Ok(last_id.and_then(|v| v.as_i64()).unwrap_or(0))
                }
                Ok(Executed::Rows(rows)) => Outcome::Ok(
                    rows.first()
                        .and_then(Row::first)
                        .and_then(Value::as_i64)
                        .unwrap_or(0),
                ),
                Err(e) => Outcome::Err(e),
            }
        }
    }

    fn batch(
        &self,
        cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            self.db.lock().stats.batches += 1;
            let mut affected = Vec::with_capacity(statements.len());
            for (sql, params) in statements {
                match self.db.run(sql, params) {
                    Ok(executed) => affected.push(executed.affected()),
                    Err(e) => return Outcome::Err(e),
                }
            }
            Outcome::Ok(affected)
        }
    }

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            let mut store = self.db.lock();
            if store.snapshots.contains_key(&self.id) {
                return Outcome::Err(Self::transaction_error("already in a transaction"));
            }
            store.stats.begins += 1;
            let snapshot = store.tables.clone();
            store.snapshots.insert(self.id, snapshot);
            Outcome::Ok(())
        }
    }

    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            let mut store = self.db.lock();
            if store.snapshots.remove(&self.id).is_none() {
                return Outcome::Err(Self::transaction_error("commit without begin"));
            }
            store.stats.commits += 1;
            Outcome::Ok(())
        }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            let mut store = self.db.lock();
            let Some(snapshot) = store.snapshots.remove(&self.id) else {
                return Outcome::Err(Self::transaction_error("rollback without begin"));
            };
            store.tables = snapshot;
            store.stats.rollbacks += 1;
            Outcome::Ok(())
        }
    }

    fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            self.db.lock().stats.pings += 1;
            Outcome::Ok(())
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        // A connection closed mid-transaction rolls back, like a server would.
        let mut store = self.db.lock();
        if let Some(snapshot) = store.snapshots.remove(&self.id) {
            store.tables = snapshot;
            store.stats.rollbacks += 1;
        }
    }
}

/// Opens [`MemoryConnection`]s to one shared database for any connection string.
#[derive(Debug, Clone)]
pub struct MemoryFactory {
    db: MemoryDatabase,
}

impl MemoryFactory {
    pub fn new(db: MemoryDatabase) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }
}

impl ConnectionFactory for MemoryFactory {
    type Connection = MemoryConnection;

    fn connect(
        &self,
        cx: &Cx,
        connection_string: &str,
    ) -> impl Future<Output = Outcome<Self::Connection, Error>> + Send {
        async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            tracing::debug!(connection_string, "opening memory connection");
            Outcome::Ok(self.db.connect())
        }
    }
}
