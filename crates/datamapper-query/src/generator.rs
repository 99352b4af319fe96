//! SQL command generation.
//!
//! [`SqlCommandGenerator`] turns metadata plus a [`QuerySpec`] into SQL text
//! and an ordered parameter list. It has no observable side effects: the
//! only state it keeps is the statement-text cache, and a cache hit yields
//! exactly the text a miss would have built.
//!
//! Rendering rules:
//! - criteria are ANDed in declaration order, each as `column <op> <placeholder>`;
//!   placeholders are numbered by bind position, so names never collide
//! - `= NULL` / `<> NULL` render as `IS NULL` / `IS NOT NULL`
//! - an empty `IN` list renders `1 = 0`, an empty `NOT IN` list `1 = 1`
//! - ORDER BY lists sort parts in call order and then the identity column,
//!   whenever the query sorts or pages
//! - paging is bound as parameters in the dialect's native syntax

use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, PoisonError};

use datamapper_core::{Entity, EntityMetadata, ManyToManyDescriptor, Result, Value};

use crate::cache::{StatementCache, cache_key};
use crate::criteria::{Operator, shape_of};
use crate::dialect::{Dialect, IdentityReturn, PagingStyle};
use crate::query_spec::{AggregateFunction, Paging, QuerySpec};

/// SQL text plus its bound parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub sql: Arc<str>,
    pub params: Vec<Value>,
}

/// An INSERT and how it reports a storage-assigned identity.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertCommand {
    pub command: Command,
    /// `None` when the identity is not auto-numbered.
    pub identity: Option<IdentityReturn>,
}

/// The table a statement reads, with the columns to project and the
/// discriminator values that select this type's rows from a shared table.
#[derive(Debug, Clone)]
pub struct TableScope<'a> {
    pub meta: &'a EntityMetadata,
    pub columns: Vec<String>,
    pub discriminators: Vec<String>,
}

impl<'a> TableScope<'a> {
    /// Rows of exactly `meta`'s type.
    pub fn new(meta: &'a EntityMetadata) -> Self {
        let mut columns: Vec<String> = meta.properties().iter().map(|p| p.column.clone()).collect();
        let mut discriminators = Vec::new();
        if let Some(d) = meta.discriminator() {
            if let Some(column) = &d.column {
                if !columns.contains(column) {
                    columns.push(column.clone());
                }
            }
            discriminators.push(d.value.clone());
        }
        Self {
            meta,
            columns,
            discriminators,
        }
    }

    /// Rows of every member of a table-per-hierarchy family sharing `meta`'s table.
    ///
    /// Projects the union of the members' columns so each row can be
    /// materialized as its own runtime type.
    pub fn hierarchy(meta: &'a EntityMetadata, family: &[Arc<EntityMetadata>]) -> Self {
        let mut scope = Self::new(meta);
        scope.discriminators.clear();
        for member in family {
            for prop in member.properties() {
                if !scope.columns.contains(&prop.column) {
                    scope.columns.push(prop.column.clone());
                }
            }
            if let Some(d) = member.discriminator() {
                if !scope.discriminators.contains(&d.value) {
                    scope.discriminators.push(d.value.clone());
                }
            }
        }
        scope
    }

    fn discriminator_column(&self) -> Option<&str> {
        self.meta
            .discriminator()
            .and_then(|d| d.column.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Projection<'a> {
    Rows,
    Count,
    Aggregate(AggregateFunction, &'a str),
}

/// Accumulates SQL text and parameters. With `text` off it only collects
/// parameters, which is all a statement-cache hit needs.
struct Writer {
    dialect: Dialect,
    text: bool,
    sql: String,
    params: Vec<Value>,
}

impl Writer {
    fn new(dialect: Dialect, text: bool) -> Self {
        Self {
            dialect,
            text,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push(&mut self, s: &str) {
        if self.text {
            self.sql.push_str(s);
        }
    }

    fn bind(&mut self, value: Value) {
        self.params.push(value);
        if self.text {
            let placeholder = self.dialect.placeholder(self.params.len());
            self.sql.push_str(&placeholder);
        }
    }

    fn id(&mut self, name: &str) {
        if self.text {
            let quoted = self.dialect.safe_id(name);
            self.sql.push_str(&quoted);
        }
    }

    fn qualified(&mut self, alias: Option<&str>, column: &str) {
        if let Some(alias) = alias {
            self.id(alias);
            self.push(".");
        }
        self.id(column);
    }

    fn table(&mut self, meta: &EntityMetadata) {
        if self.text {
            let name = self.dialect.table_name(meta.schema(), meta.table());
            self.sql.push_str(&name);
        }
    }

    fn finish(self) -> Command {
        Command {
            sql: Arc::from(self.sql),
            params: self.params,
        }
    }
}

/// Dialect-aware SQL generator with a statement-text cache.
#[derive(Debug)]
pub struct SqlCommandGenerator {
    dialect: Dialect,
    statements: Option<Mutex<StatementCache>>,
}

impl SqlCommandGenerator {
    /// A generator without statement caching.
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            statements: None,
        }
    }

    /// A generator caching up to `capacity` statement texts.
    pub fn with_statement_cache(dialect: Dialect, capacity: usize) -> Self {
        Self {
            dialect,
            statements: (capacity > 0).then(|| Mutex::new(StatementCache::new(capacity))),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Number of statement texts currently cached.
    pub fn cached_statements(&self) -> usize {
        self.statements
            .as_ref()
            .map_or(0, |c| c.lock().unwrap_or_else(PoisonError::into_inner).len())
    }

    fn render<F>(&self, key: u64, build: F) -> Result<Command>
    where
        F: Fn(&mut Writer) -> Result<()>,
    {
        if let Some(cache) = &self.statements {
            let cached = cache.lock().unwrap_or_else(PoisonError::into_inner).get(key);
            if let Some(sql) = cached {
                let mut w = Writer::new(self.dialect, false);
                build(&mut w)?;
                tracing::trace!(sql = %sql, params = w.params.len(), "statement cache hit");
                return Ok(Command {
                    sql,
                    params: w.params,
                });
            }
        }
        let mut w = Writer::new(self.dialect, true);
        build(&mut w)?;
        let command = w.finish();
        if let Some(cache) = &self.statements {
            cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(key, &command.sql);
        }
        tracing::trace!(sql = %command.sql, params = command.params.len(), "generated statement");
        Ok(command)
    }

    fn shape_key(
        &self,
        scope: &TableScope<'_>,
        spec: &QuerySpec,
        projection: Projection<'_>,
    ) -> Result<u64> {
        let mut h = std::collections::hash_map::DefaultHasher::new();
        scope.meta.type_id().hash(&mut h);
        scope.columns.hash(&mut h);
        scope.discriminators.len().hash(&mut h);
        projection.hash(&mut h);
        for criterion in &spec.criteria {
            criterion.property.hash(&mut h);
            criterion.operator.hash(&mut h);
            shape_of(spec.operand_value(criterion, scope.meta.type_name())?).hash(&mut h);
        }
        if projection == Projection::Rows {
            spec.sort.hash(&mut h);
            std::mem::discriminant(&spec.paging).hash(&mut h);
        }
        Ok(h.finish())
    }

    /// `SELECT` of the scope's columns honoring criteria, sort and paging.
    #[tracing::instrument(level = "trace", skip_all, fields(entity = scope.meta.type_name()))]
    pub fn select(&self, scope: &TableScope<'_>, spec: &QuerySpec) -> Result<Command> {
        let key = self.shape_key(scope, spec, Projection::Rows)?;
        self.render(key, |w| self.write_select(w, scope, spec, Projection::Rows))
    }

    /// `SELECT COUNT(*)` honoring criteria. Sort and paging do not apply.
    pub fn count(&self, scope: &TableScope<'_>, spec: &QuerySpec) -> Result<Command> {
        let key = self.shape_key(scope, spec, Projection::Count)?;
        self.render(key, |w| self.write_select(w, scope, spec, Projection::Count))
    }

    /// `SELECT <FUNC>(column)` honoring criteria.
    pub fn aggregate(
        &self,
        scope: &TableScope<'_>,
        spec: &QuerySpec,
        function: AggregateFunction,
        property: &str,
    ) -> Result<Command> {
        let column = scope.meta.require_property(property)?.column.as_str();
        let projection = Projection::Aggregate(function, column);
        let key = self.shape_key(scope, spec, projection)?;
        self.render(key, |w| self.write_select(w, scope, spec, projection))
    }

    /// `SELECT` of one row by identity.
    pub fn select_by_id(&self, scope: &TableScope<'_>, id: &Value) -> Result<Command> {
        let mut spec = QuerySpec::new(scope.meta.type_id());
        spec.criteria.push(crate::criteria::Criterion::eq(
            scope.meta.identity().name.clone(),
            id.clone(),
        ));
        self.select(scope, &spec)
    }

    /// `SELECT` of every row whose `property` is in `values`.
    pub fn select_where_in(
        &self,
        scope: &TableScope<'_>,
        property: &str,
        values: Vec<Value>,
    ) -> Result<Command> {
        let mut spec = QuerySpec::new(scope.meta.type_id());
        spec.criteria
            .push(crate::criteria::Criterion::is_in(property, values));
        self.select(scope, &spec)
    }

    /// `SELECT COUNT(*)` of live rows with the given identity.
    ///
    /// Used after a zero-row write to tell a stale version from a missing row.
    pub fn exists_by_id(&self, meta: &EntityMetadata, id: &Value) -> Result<Command> {
        let scope = TableScope::new(meta);
        let mut spec = QuerySpec::new(meta.type_id());
        spec.criteria.push(crate::criteria::Criterion::eq(
            meta.identity().name.clone(),
            id.clone(),
        ));
        self.count(&scope, &spec)
    }

    /// Targets of a many-to-many association owned by the entity with `owner_id`.
    pub fn select_many_to_many(
        &self,
        target: &TableScope<'_>,
        relation: &ManyToManyDescriptor,
        owner_id: &Value,
    ) -> Result<Command> {
        let key = cache_key(&(
            target.meta.type_id(),
            "m2m",
            &relation.link_table,
            &relation.local_column,
            &relation.remote_column,
            target.discriminators.len(),
        ));
        self.render(key, |w| {
            let alias = target.meta.alias();
            w.push("SELECT ");
            write_columns(w, alias, &target.columns);
            w.push(" FROM ");
            w.table(target.meta);
            w.push(" AS ");
            w.id(alias);
            w.push(" WHERE ");
            w.qualified(Some(alias), &target.meta.identity().column);
            w.push(" IN (SELECT ");
            w.id(&relation.remote_column);
            w.push(" FROM ");
            w.id(&relation.link_table);
            w.push(" WHERE ");
            w.id(&relation.local_column);
            w.push(" = ");
            w.bind(owner_id.clone());
            w.push(")");
            write_implicit_filters(w, Some(alias), target, true);
            Ok(())
        })
    }

    /// The WHERE clause (without the keyword) for a scope and specification.
    ///
    /// Empty when nothing filters the scope.
    pub fn where_clause(&self, scope: &TableScope<'_>, spec: &QuerySpec) -> Result<Command> {
        let mut w = Writer::new(self.dialect, true);
        write_where(&mut w, Some(scope.meta.alias()), scope, spec, false)?;
        Ok(w.finish())
    }

    /// The ORDER BY clause (without the keyword). Empty when the query neither sorts nor pages.
    pub fn order_by_clause(&self, scope: &TableScope<'_>, spec: &QuerySpec) -> Result<String> {
        let mut w = Writer::new(self.dialect, true);
        write_order_by(&mut w, scope.meta, spec, false)?;
        Ok(w.sql)
    }

    fn write_select(
        &self,
        w: &mut Writer,
        scope: &TableScope<'_>,
        spec: &QuerySpec,
        projection: Projection<'_>,
    ) -> Result<()> {
        let alias = scope.meta.alias();
        let paging = if projection == Projection::Rows {
            spec.paging
        } else {
            Paging::None
        };
        let offset_fetch = self.dialect.paging_style() == PagingStyle::OffsetFetch;

        w.push("SELECT ");
        if let (true, Paging::Top(n)) = (offset_fetch, paging) {
            w.push("TOP (");
            w.bind(Value::BigInt(to_i64(n)));
            w.push(") ");
        }
        match projection {
            Projection::Rows => write_columns(w, alias, &scope.columns),
            Projection::Count => w.push("COUNT(*)"),
            Projection::Aggregate(function, column) => {
                w.push(function.as_sql());
                w.push("(");
                w.qualified(Some(alias), column);
                w.push(")");
            }
        }
        w.push(" FROM ");
        w.table(scope.meta);
        w.push(" AS ");
        w.id(alias);
        write_where(w, Some(alias), scope, spec, true)?;

        if projection == Projection::Rows {
            let ordered = write_order_by(w, scope.meta, spec, true)?;
            match (self.dialect.paging_style(), paging) {
                (_, Paging::None) => {}
                (PagingStyle::LimitOffset, Paging::Page { start, size }) => {
                    w.push(" LIMIT ");
                    w.bind(Value::BigInt(to_i64(size)));
                    w.push(" OFFSET ");
                    w.bind(Value::BigInt(to_i64(start)));
                }
                (PagingStyle::LimitOffset, Paging::Top(n)) => {
                    w.push(" LIMIT ");
                    w.bind(Value::BigInt(to_i64(n)));
                }
                (PagingStyle::OffsetFetch, Paging::Page { start, size }) => {
                    debug_assert!(ordered, "OFFSET/FETCH requires ORDER BY");
                    w.push(" OFFSET ");
                    w.bind(Value::BigInt(to_i64(start)));
                    w.push(" ROWS FETCH NEXT ");
                    w.bind(Value::BigInt(to_i64(size)));
                    w.push(" ROWS ONLY");
                }
                (PagingStyle::OffsetFetch, Paging::Top(_)) => {}
            }
        }
        Ok(())
    }

    /// `INSERT` of one entity.
    pub fn insert(&self, meta: &EntityMetadata, entity: &dyn Entity) -> Result<InsertCommand> {
        let identity = meta
            .identity()
            .flags
            .auto_number
            .then(|| self.dialect.identity_return());
        let key = cache_key(&(meta.type_id(), "insert"));
        let command = self.render(key, |w| {
            let columns = insert_columns(meta);
            w.push("INSERT INTO ");
            w.table(meta);
            if columns.is_empty() {
                match self.dialect {
                    Dialect::Mysql => w.push(" () VALUES ()"),
                    _ => {
                        if identity == Some(IdentityReturn::Output) {
                            w.push(" OUTPUT INSERTED.");
                            w.id(&meta.identity().column);
                        }
                        w.push(" DEFAULT VALUES");
                    }
                }
            } else {
                w.push(" (");
                write_column_list(w, &columns);
                w.push(")");
                if identity == Some(IdentityReturn::Output) {
                    w.push(" OUTPUT INSERTED.");
                    w.id(&meta.identity().column);
                }
                w.push(" VALUES (");
                write_insert_values(w, meta, entity);
                w.push(")");
            }
            if identity == Some(IdentityReturn::Returning) {
                w.push(" RETURNING ");
                w.id(&meta.identity().column);
            }
            Ok(())
        })?;
        Ok(InsertCommand { command, identity })
    }

    /// One multi-row `INSERT` for a batch. Identities are not reported back.
    pub fn insert_many(&self, meta: &EntityMetadata, entities: &[&dyn Entity]) -> Result<Command> {
        let key = cache_key(&(meta.type_id(), "insert_many", entities.len()));
        self.render(key, |w| {
            let columns = insert_columns(meta);
            w.push("INSERT INTO ");
            w.table(meta);
            w.push(" (");
            write_column_list(w, &columns);
            w.push(") VALUES ");
            for (i, entity) in entities.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                w.push("(");
                write_insert_values(w, meta, *entity);
                w.push(")");
            }
            Ok(())
        })
    }

    /// `UPDATE` of one entity by identity, guarded by its row version when the type has one.
    pub fn update(&self, meta: &EntityMetadata, entity: &dyn Entity) -> Result<Command> {
        let key = cache_key(&(meta.type_id(), "update"));
        self.render(key, |w| {
            w.push("UPDATE ");
            w.table(meta);
            w.push(" SET ");
            let mut first = true;
            for prop in meta.update_properties() {
                if !first {
                    w.push(", ");
                }
                first = false;
                w.id(&prop.column);
                w.push(" = ");
                w.bind(prop.get(entity));
            }
            let version = meta.row_version().map(|p| (p, p.get(entity)));
            if let Some((prop, current)) = &version {
                if !first {
                    w.push(", ");
                }
                w.id(&prop.column);
                w.push(" = ");
                w.bind(next_version(current));
            }
            write_identity_guard(w, meta, entity, version.as_ref().map(|(p, v)| (*p, v)));
            Ok(())
        })
    }

    /// `DELETE` by identity, or the soft-delete `UPDATE` when the type has a soft-delete column.
    pub fn delete(&self, meta: &EntityMetadata, entity: &dyn Entity) -> Result<Command> {
        let key = cache_key(&(meta.type_id(), "delete"));
        self.render(key, |w| {
            let version = meta.row_version().map(|p| (p, p.get(entity)));
            if let Some(flag) = meta.soft_delete() {
                w.push("UPDATE ");
                w.table(meta);
                w.push(" SET ");
                w.id(&flag.column);
                w.push(" = ");
                w.bind(Value::Bool(true));
                if let Some((prop, current)) = &version {
                    w.push(", ");
                    w.id(&prop.column);
                    w.push(" = ");
                    w.bind(next_version(current));
                }
            } else {
                w.push("DELETE FROM ");
                w.table(meta);
            }
            write_identity_guard(w, meta, entity, version.as_ref().map(|(p, v)| (*p, v)));
            Ok(())
        })
    }
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// The row version a successful write stores: current + 1 (1 for an unset version).
pub fn next_version(current: &Value) -> Value {
    Value::BigInt(current.as_i64().unwrap_or(0) + 1)
}

fn write_columns(w: &mut Writer, alias: &str, columns: &[String]) {
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.qualified(Some(alias), column);
    }
}

fn write_column_list(w: &mut Writer, columns: &[&str]) {
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.id(column);
    }
}

/// Columns an INSERT writes: mapped properties minus an auto-numbered
/// identity, plus the discriminator column when it is not itself mapped.
fn insert_columns(meta: &EntityMetadata) -> Vec<&str> {
    let mut columns: Vec<&str> = meta.insert_properties().map(|p| p.column.as_str()).collect();
    if let Some(column) = meta.discriminator().and_then(|d| d.column.as_deref()) {
        if meta.properties().iter().all(|p| p.column != column) {
            columns.push(column);
        }
    }
    columns
}

fn write_insert_values(w: &mut Writer, meta: &EntityMetadata, entity: &dyn Entity) {
    let mut first = true;
    for prop in meta.insert_properties() {
        if !first {
            w.push(", ");
        }
        first = false;
        if prop.flags.row_version {
            w.bind(Value::BigInt(1));
        } else {
            w.bind(prop.get(entity));
        }
    }
    if let Some(d) = meta.discriminator() {
        if let Some(column) = &d.column {
            if meta.properties().iter().all(|p| &p.column != column) {
                if !first {
                    w.push(", ");
                }
                w.bind(Value::Text(d.value.clone()));
            }
        }
    }
}

fn write_identity_guard(
    w: &mut Writer,
    meta: &EntityMetadata,
    entity: &dyn Entity,
    version: Option<(&datamapper_core::PropertyDescriptor, &Value)>,
) {
    w.push(" WHERE ");
    w.id(&meta.identity().column);
    w.push(" = ");
    w.bind(meta.identity().get(entity));
    if let Some(flag) = meta.soft_delete() {
        w.push(" AND ");
        w.id(&flag.column);
        w.push(" = ");
        w.bind(Value::Bool(false));
    }
    if let Some((prop, current)) = version {
        w.push(" AND ");
        w.id(&prop.column);
        w.push(" = ");
        w.bind(current.clone());
    }
}

/// Writes ` WHERE …` (with `keyword`) or the bare condition list.
fn write_where(
    w: &mut Writer,
    alias: Option<&str>,
    scope: &TableScope<'_>,
    spec: &QuerySpec,
    keyword: bool,
) -> Result<()> {
    let mut first = true;
    let mut and = |w: &mut Writer| {
        if first {
            if keyword {
                w.push(" WHERE ");
            }
            first = false;
        } else {
            w.push(" AND ");
        }
    };
    for criterion in &spec.criteria {
        let prop = scope.meta.require_property(&criterion.property)?;
        let value = spec.operand_value(criterion, scope.meta.type_name())?;
        and(w);
        write_criterion(w, alias, &prop.column, criterion.operator, value);
    }
    if let Some(flag) = scope.meta.soft_delete() {
        and(w);
        w.qualified(alias, &flag.column);
        w.push(" = ");
        w.bind(Value::Bool(false));
    }
    if let Some(column) = scope.discriminator_column() {
        and(w);
        write_criterion(
            w,
            alias,
            column,
            Operator::In,
            &Value::Array(
                scope
                    .discriminators
                    .iter()
                    .map(|d| Value::Text(d.clone()))
                    .collect(),
            ),
        );
    }
    Ok(())
}

/// Soft-delete and discriminator filters appended to an existing WHERE.
fn write_implicit_filters(w: &mut Writer, alias: Option<&str>, scope: &TableScope<'_>, and: bool) {
    let mut sep = and;
    if let Some(flag) = scope.meta.soft_delete() {
        w.push(if sep { " AND " } else { " WHERE " });
        sep = true;
        w.qualified(alias, &flag.column);
        w.push(" = ");
        w.bind(Value::Bool(false));
    }
    if let Some(column) = scope.discriminator_column() {
        w.push(if sep { " AND " } else { " WHERE " });
        write_criterion(
            w,
            alias,
            column,
            Operator::In,
            &Value::Array(
                scope
                    .discriminators
                    .iter()
                    .map(|d| Value::Text(d.clone()))
                    .collect(),
            ),
        );
    }
}

fn write_criterion(
    w: &mut Writer,
    alias: Option<&str>,
    column: &str,
    operator: Operator,
    value: &Value,
) {
    match (operator, value) {
        (Operator::IsNull, _) | (Operator::Eq, Value::Null) => {
            w.qualified(alias, column);
            w.push(" IS NULL");
        }
        (Operator::IsNotNull, _) | (Operator::NotEq, Value::Null) => {
            w.qualified(alias, column);
            w.push(" IS NOT NULL");
        }
        (Operator::In | Operator::NotIn, _) => {
            let items = match value {
                Value::Array(items) => items.clone(),
                other => vec![other.clone()],
            };
            if items.is_empty() {
                w.push(if operator == Operator::In {
                    "1 = 0"
                } else {
                    "1 = 1"
                });
                return;
            }
            w.qualified(alias, column);
            w.push(" ");
            w.push(operator.as_sql());
            w.push(" (");
            for (i, item) in items.into_iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                w.bind(item);
            }
            w.push(")");
        }
        _ => {
            w.qualified(alias, column);
            w.push(" ");
            w.push(operator.as_sql());
            w.push(" ");
            w.bind(value.clone());
        }
    }
}

/// Writes ` ORDER BY …` (with `keyword`) and reports whether anything was written.
fn write_order_by(
    w: &mut Writer,
    meta: &EntityMetadata,
    spec: &QuerySpec,
    keyword: bool,
) -> Result<bool> {
    if spec.sort.is_empty() && !spec.paging.is_some() {
        return Ok(false);
    }
    let alias = meta.alias();
    let identity = meta.identity();
    if keyword {
        w.push(" ORDER BY ");
    }
    let mut sorted_on_identity = false;
    for (i, part) in spec.sort.iter().enumerate() {
        let prop = meta.require_property(&part.property)?;
        if i > 0 {
            w.push(", ");
        }
        w.qualified(Some(alias), &prop.column);
        w.push(if part.descending { " DESC" } else { " ASC" });
        sorted_on_identity |= prop.name == identity.name;
    }
    if !sorted_on_identity {
        if !spec.sort.is_empty() {
            w.push(", ");
        }
        w.qualified(Some(alias), &identity.column);
        w.push(" ASC");
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::Criterion;
    use crate::query_spec::SortPart;
    use datamapper_core::{EntityErrorKind, Mapped, MetadataRegistry, PropertyDescriptor, assign};

    #[derive(Debug, Clone, Default)]
    struct Invoice {
        id: Option<i64>,
        number: String,
        total: f64,
        version: i64,
    }

    impl Entity for Invoice {
        fn id(&self) -> Value {
            self.id.into()
        }
    }

    impl Mapped for Invoice {
        fn metadata() -> EntityMetadata {
            EntityMetadata::builder::<Self>("Invoice", "invoices")
                .identity(PropertyDescriptor::new::<Self, _, _>(
                    "Id",
                    "id",
                    |e| e.id.into(),
                    |e, v| assign(&mut e.id, v),
                ))
                .auto_number()
                .property(PropertyDescriptor::new::<Self, _, _>(
                    "Number",
                    "number",
                    |e| e.number.clone().into(),
                    |e, v| assign(&mut e.number, v),
                ))
                .property(PropertyDescriptor::new::<Self, _, _>(
                    "Total",
                    "total",
                    |e| e.total.into(),
                    |e, v| assign(&mut e.total, v),
                ))
                .row_version(PropertyDescriptor::new::<Self, _, _>(
                    "Version",
                    "version",
                    |e| e.version.into(),
                    |e, v| assign(&mut e.version, v),
                ))
                .build()
                .unwrap()
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Note {
        id: i64,
        body: String,
        deleted: bool,
    }

    impl Entity for Note {
        fn id(&self) -> Value {
            Value::BigInt(self.id)
        }
    }

    impl Mapped for Note {
        fn metadata() -> EntityMetadata {
            EntityMetadata::builder::<Self>("Note", "notes")
                .schema("app")
                .identity(PropertyDescriptor::new::<Self, _, _>(
                    "Id",
                    "id",
                    |e| e.id.into(),
                    |e, v| assign(&mut e.id, v),
                ))
                .custom_pk()
                .property(PropertyDescriptor::new::<Self, _, _>(
                    "Body",
                    "body",
                    |e| e.body.clone().into(),
                    |e, v| assign(&mut e.body, v),
                ))
                .soft_delete(PropertyDescriptor::new::<Self, _, _>(
                    "Deleted",
                    "deleted",
                    |e| e.deleted.into(),
                    |e, v| assign(&mut e.deleted, v),
                ))
                .build()
                .unwrap()
        }
    }

    fn invoice_meta() -> EntityMetadata {
        Invoice::metadata()
    }

    #[test]
    fn test_select_with_criteria_sort_and_paging() {
        let meta = invoice_meta();
        let scope = TableScope::new(&meta);
        let mut spec = QuerySpec::of::<Invoice>();
        spec.criteria.push(Criterion::gt("Total", 10.0));
        spec.criteria.push(Criterion::like("Number", "INV-%"));
        spec.sort.push(SortPart::desc("Total"));
        spec.paging = Paging::Page { start: 20, size: 10 };

        let cmd = SqlCommandGenerator::new(Dialect::Postgres)
            .select(&scope, &spec)
            .unwrap();
        assert_eq!(
            &*cmd.sql,
            "SELECT \"i\".\"id\", \"i\".\"number\", \"i\".\"total\", \"i\".\"version\" \
             FROM \"invoices\" AS \"i\" \
             WHERE \"i\".\"total\" > $1 AND \"i\".\"number\" LIKE $2 \
             ORDER BY \"i\".\"total\" DESC, \"i\".\"id\" ASC LIMIT $3 OFFSET $4"
        );
        assert_eq!(
            cmd.params,
            vec![
                Value::Double(10.0),
                Value::Text("INV-%".into()),
                Value::BigInt(10),
                Value::BigInt(20)
            ]
        );
    }

    #[test]
    fn test_unsorted_unpaged_select_has_no_order_by() {
        let meta = invoice_meta();
        let cmd = SqlCommandGenerator::new(Dialect::Sqlite)
            .select(&TableScope::new(&meta), &QuerySpec::of::<Invoice>())
            .unwrap();
        assert!(!cmd.sql.contains("ORDER BY"));
        assert!(cmd.params.is_empty());
    }

    #[test]
    fn test_identity_sort_is_not_duplicated() {
        let meta = invoice_meta();
        let mut spec = QuerySpec::of::<Invoice>();
        spec.sort.push(SortPart::asc("Id"));
        let order = SqlCommandGenerator::new(Dialect::Postgres)
            .order_by_clause(&TableScope::new(&meta), &spec)
            .unwrap();
        assert_eq!(order, "\"i\".\"id\" ASC");
    }

    #[test]
    fn test_null_and_in_rendering() {
        let meta = invoice_meta();
        let mut spec = QuerySpec::of::<Invoice>();
        spec.criteria.push(Criterion::eq("Number", Value::Null));
        spec.criteria.push(Criterion::not_eq("Number", Value::Null));
        spec.criteria
            .push(Criterion::is_in("Id", vec![Value::BigInt(1), Value::BigInt(2)]));
        spec.criteria.push(Criterion::is_in("Id", vec![]));
        spec.criteria.push(Criterion::not_in("Id", vec![]));
        let clause = SqlCommandGenerator::new(Dialect::Postgres)
            .where_clause(&TableScope::new(&meta), &spec)
            .unwrap();
        assert_eq!(
            &*clause.sql,
            "\"i\".\"number\" IS NULL AND \"i\".\"number\" IS NOT NULL AND \
             \"i\".\"id\" IN ($1, $2) AND 1 = 0 AND 1 = 1"
        );
        assert_eq!(clause.params.len(), 2);
    }

    #[test]
    fn test_param_bag_and_missing_param() {
        let meta = invoice_meta();
        let mut spec = QuerySpec::of::<Invoice>();
        spec.criteria
            .push(Criterion::param("Number", Operator::Eq, "num"));
        let generator = SqlCommandGenerator::new(Dialect::Mysql);
        let err = generator
            .select(&TableScope::new(&meta), &spec)
            .unwrap_err();
        assert_eq!(err.entity_kind(), Some(EntityErrorKind::MissingParameter));

        spec.params.insert("num".into(), Value::Text("A".into()));
        let cmd = generator.select(&TableScope::new(&meta), &spec).unwrap();
        assert!(cmd.sql.ends_with("WHERE `i`.`number` = ?"));
        assert_eq!(cmd.params, vec![Value::Text("A".into())]);
    }

    #[test]
    fn test_unknown_property_rejected() {
        let meta = invoice_meta();
        let mut spec = QuerySpec::of::<Invoice>();
        spec.sort.push(SortPart::asc("Nope"));
        let err = SqlCommandGenerator::new(Dialect::Postgres)
            .select(&TableScope::new(&meta), &spec)
            .unwrap_err();
        assert_eq!(err.entity_kind(), Some(EntityErrorKind::UnknownProperty));
    }

    #[test]
    fn test_sqlserver_paging() {
        let meta = invoice_meta();
        let generator = SqlCommandGenerator::new(Dialect::SqlServer);
        let mut spec = QuerySpec::of::<Invoice>();
        spec.paging = Paging::Page { start: 4, size: 2 };
        let page = generator.select(&TableScope::new(&meta), &spec).unwrap();
        assert!(page.sql.ends_with(
            "ORDER BY [i].[id] ASC OFFSET @p1 ROWS FETCH NEXT @p2 ROWS ONLY"
        ));
        assert_eq!(page.params, vec![Value::BigInt(4), Value::BigInt(2)]);

        spec.paging = Paging::Top(3);
        let top = generator.select(&TableScope::new(&meta), &spec).unwrap();
        assert!(top.sql.starts_with("SELECT TOP (@p1) [i].[id]"));
        assert!(top.sql.ends_with("ORDER BY [i].[id] ASC"));
    }

    #[test]
    fn test_count_and_aggregate_ignore_paging() {
        let meta = invoice_meta();
        let generator = SqlCommandGenerator::new(Dialect::Postgres);
        let mut spec = QuerySpec::of::<Invoice>();
        spec.criteria.push(Criterion::gt("Total", 1.0));
        spec.sort.push(SortPart::asc("Number"));
        spec.paging = Paging::Top(1);
        let count = generator.count(&TableScope::new(&meta), &spec).unwrap();
        assert_eq!(
            &*count.sql,
            "SELECT COUNT(*) FROM \"invoices\" AS \"i\" WHERE \"i\".\"total\" > $1"
        );
        let sum = generator
            .aggregate(&TableScope::new(&meta), &spec, AggregateFunction::Sum, "Total")
            .unwrap();
        assert!(sum.sql.starts_with("SELECT SUM(\"i\".\"total\") FROM"));
        assert_eq!(sum.params, vec![Value::Double(1.0)]);
    }

    #[test]
    fn test_insert_returning_skips_auto_identity() {
        let meta = invoice_meta();
        let invoice = Invoice {
            id: None,
            number: "INV-1".into(),
            total: 5.0,
            version: 0,
        };
        let insert = SqlCommandGenerator::new(Dialect::Postgres)
            .insert(&meta, &invoice)
            .unwrap();
        assert_eq!(
            &*insert.command.sql,
            "INSERT INTO \"invoices\" (\"number\", \"total\", \"version\") \
             VALUES ($1, $2, $3) RETURNING \"id\""
        );
        assert_eq!(insert.command.params[2], Value::BigInt(1));
        assert_eq!(insert.identity, Some(IdentityReturn::Returning));

        let mysql = SqlCommandGenerator::new(Dialect::Mysql)
            .insert(&meta, &invoice)
            .unwrap();
        assert!(!mysql.command.sql.contains("RETURNING"));
        assert_eq!(mysql.identity, Some(IdentityReturn::LastInsertId));

        let mssql = SqlCommandGenerator::new(Dialect::SqlServer)
            .insert(&meta, &invoice)
            .unwrap();
        assert!(mssql.command.sql.contains("OUTPUT INSERTED.[id] VALUES"));
    }

    #[test]
    fn test_update_guards_row_version() {
        let meta = invoice_meta();
        let invoice = Invoice {
            id: Some(7),
            number: "INV-7".into(),
            total: 1.5,
            version: 3,
        };
        let cmd = SqlCommandGenerator::new(Dialect::Postgres)
            .update(&meta, &invoice)
            .unwrap();
        assert_eq!(
            &*cmd.sql,
            "UPDATE \"invoices\" SET \"number\" = $1, \"total\" = $2, \"version\" = $3 \
             WHERE \"id\" = $4 AND \"version\" = $5"
        );
        assert_eq!(
            cmd.params,
            vec![
                Value::Text("INV-7".into()),
                Value::Double(1.5),
                Value::BigInt(4),
                Value::BigInt(7),
                Value::BigInt(3)
            ]
        );
    }

    #[test]
    fn test_soft_delete_statements() {
        let meta = Note::metadata();
        let note = Note {
            id: 4,
            body: "x".into(),
            deleted: false,
        };
        let generator = SqlCommandGenerator::new(Dialect::Postgres);
        let delete = generator.delete(&meta, &note).unwrap();
        assert_eq!(
            &*delete.sql,
            "UPDATE \"app\".\"notes\" SET \"deleted\" = $1 WHERE \"id\" = $2 AND \"deleted\" = $3"
        );
        assert_eq!(
            delete.params,
            vec![Value::Bool(true), Value::BigInt(4), Value::Bool(false)]
        );

        let select = generator
            .select_by_id(&TableScope::new(&meta), &Value::BigInt(4))
            .unwrap();
        assert!(select.sql.ends_with("WHERE \"n\".\"id\" = $1 AND \"n\".\"deleted\" = $2"));

        let plain = generator.delete(&invoice_meta(), &Invoice::default()).unwrap();
        assert!(plain.sql.starts_with("DELETE FROM \"invoices\" WHERE \"id\" = $1"));
    }

    #[test]
    fn test_insert_many_rows() {
        let meta = invoice_meta();
        let a = Invoice {
            number: "A".into(),
            ..Invoice::default()
        };
        let b = Invoice {
            number: "B".into(),
            ..Invoice::default()
        };
        let cmd = SqlCommandGenerator::new(Dialect::Sqlite)
            .insert_many(&meta, &[&a, &b])
            .unwrap();
        assert_eq!(
            &*cmd.sql,
            "INSERT INTO \"invoices\" (\"number\", \"total\", \"version\") \
             VALUES (?1, ?2, ?3), (?4, ?5, ?6)"
        );
    }

    #[test]
    fn test_many_to_many_subquery() {
        let meta = Note::metadata();
        let relation = ManyToManyDescriptor::new::<Note>("Notes", "invoice_notes", "invoice_id", "note_id");
        let cmd = SqlCommandGenerator::new(Dialect::Postgres)
            .select_many_to_many(&TableScope::new(&meta), &relation, &Value::BigInt(1))
            .unwrap();
        assert!(cmd.sql.contains(
            "WHERE \"n\".\"id\" IN (SELECT \"note_id\" FROM \"invoice_notes\" WHERE \"invoice_id\" = $1) \
             AND \"n\".\"deleted\" = $2"
        ));
    }

    #[test]
    fn test_statement_cache_returns_identical_text() {
        let meta = invoice_meta();
        let generator = SqlCommandGenerator::with_statement_cache(Dialect::Postgres, 8);
        let mut spec = QuerySpec::of::<Invoice>();
        spec.criteria.push(Criterion::eq("Number", "A"));
        let first = generator.select(&TableScope::new(&meta), &spec).unwrap();
        spec.criteria[0] = Criterion::eq("Number", "B");
        let second = generator.select(&TableScope::new(&meta), &spec).unwrap();
        assert_eq!(first.sql, second.sql);
        assert_eq!(second.params, vec![Value::Text("B".into())]);
        assert_eq!(generator.cached_statements(), 1);

        // A NULL operand changes the text, so it must not reuse the entry.
        spec.criteria[0] = Criterion::eq("Number", Value::Null);
        let third = generator.select(&TableScope::new(&meta), &spec).unwrap();
        assert!(third.sql.ends_with("IS NULL"));
        assert_eq!(generator.cached_statements(), 2);
    }

    #[test]
    fn test_hierarchy_scope_filters_discriminators() {
        #[derive(Debug, Clone, Default)]
        struct Animal {
            id: i64,
            name: String,
        }
        #[derive(Debug, Clone, Default)]
        struct Dog {
            id: i64,
            name: String,
            barks: bool,
        }
        impl Entity for Animal {
            fn id(&self) -> Value {
                Value::BigInt(self.id)
            }
        }
        impl Entity for Dog {
            fn id(&self) -> Value {
                Value::BigInt(self.id)
            }
        }
        impl Mapped for Animal {
            fn metadata() -> EntityMetadata {
                EntityMetadata::builder::<Self>("Animal", "animals")
                    .identity(PropertyDescriptor::new::<Self, _, _>(
                        "Id",
                        "id",
                        |e| e.id.into(),
                        |e, v| assign(&mut e.id, v),
                    ))
                    .property(PropertyDescriptor::new::<Self, _, _>(
                        "Name",
                        "name",
                        |e| e.name.clone().into(),
                        |e, v| assign(&mut e.name, v),
                    ))
                    .discriminator_column("kind")
                    .build()
                    .unwrap()
            }
        }
        impl Mapped for Dog {
            fn metadata() -> EntityMetadata {
                EntityMetadata::builder::<Self>("Dog", "animals")
                    .identity(PropertyDescriptor::new::<Self, _, _>(
                        "Id",
                        "id",
                        |e| e.id.into(),
                        |e, v| assign(&mut e.id, v),
                    ))
                    .property(PropertyDescriptor::new::<Self, _, _>(
                        "Name",
                        "name",
                        |e| e.name.clone().into(),
                        |e, v| assign(&mut e.name, v),
                    ))
                    .property(PropertyDescriptor::new::<Self, _, _>(
                        "Barks",
                        "barks",
                        |e| e.barks.into(),
                        |e, v| assign(&mut e.barks, v),
                    ))
                    .base::<Animal>()
                    .build()
                    .unwrap()
            }
        }

        let registry = MetadataRegistry::builder()
            .register::<Animal>()
            .register::<Dog>()
            .build()
            .unwrap();
        let animal = registry.of::<Animal>().unwrap();
        let family = registry
            .concrete_family(std::any::TypeId::of::<Animal>())
            .unwrap();
        let scope = TableScope::hierarchy(animal, &family);
        let cmd = SqlCommandGenerator::new(Dialect::Postgres)
            .select(&scope, &QuerySpec::of::<Animal>())
            .unwrap();
        assert_eq!(
            &*cmd.sql,
            "SELECT \"a\".\"id\", \"a\".\"name\", \"a\".\"kind\", \"a\".\"barks\" \
             FROM \"animals\" AS \"a\" WHERE \"a\".\"kind\" IN ($1, $2)"
        );
        assert_eq!(
            cmd.params,
            vec![Value::Text("Animal".into()), Value::Text("Dog".into())]
        );

        let dog = registry.of::<Dog>().unwrap();
        let insert = SqlCommandGenerator::new(Dialect::Postgres)
            .insert(dog, &Dog::default())
            .unwrap();
        assert_eq!(
            &*insert.command.sql,
            "INSERT INTO \"animals\" (\"id\", \"name\", \"barks\", \"kind\") VALUES ($1, $2, $3, $4)"
        );
        assert_eq!(insert.command.params[3], Value::Text("Dog".into()));
    }
}
