// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! The dialect-aware SQL compiler. A single generic skeleton renders the
//! query-set snapshot into SQL; dialects override small hooks (quoting,
//! placeholder rebinding, case-insensitive matching, RETURNING, bulk-update
//! strategy).
//!
//! Statements are rendered with `?` placeholders and the argument list in
//! clause order — SELECT expressions, then JOIN, WHERE, GROUP BY, HAVING,
//! LIMIT/OFFSET — and rebound to the dialect's placeholder syntax last.

pub mod mariadb;
pub mod mysql;
pub mod postgres;
pub mod registry;
pub mod sqlite;

use crate::errors::{Error, Result};
use crate::expr::Expr;
use crate::joins::{projected_columns, ColumnRef, FieldInfo, JoinDef};
use crate::schema::{FieldDef, FieldType, ModelSchema};
use crate::value::ScalarValue;
use indexmap::IndexMap;
use itertools::Itertools;
use std::collections::HashMap;
use std::fmt::{self, Write as _};

pub use registry::{compiler_for, register_compiler, register_driver, DriverInfo};

/// A dialect's ability to hand back data after an `INSERT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Returning {
    None,
    LastInsertId,
    Columns,
}

/// An SQL string with placeholders, plus its argument values, ready for the
/// executor.
#[derive(Clone, Debug)]
pub struct SqlWithArguments {
    pub sql: String,
    pub args: Vec<ScalarValue>,
}

/// Helper for assembling one statement: accumulates text and arguments,
/// quoting identifiers per dialect.
pub struct SqlWriter<'a> {
    dialect: &'a dyn Dialect,
    text: String,
    args: Vec<ScalarValue>,
}

impl<'a> SqlWriter<'a> {
    pub fn new(dialect: &'a dyn Dialect) -> Self {
        Self {
            dialect,
            text: String::new(),
            args: vec![],
        }
    }

    pub fn write_str(&mut self, s: &str) {
        self.text.push_str(s);
    }

    /// Appends a quoted identifier, doubling embedded quote characters.
    pub fn write_name(&mut self, name: &str) {
        let q = self.dialect.quote_char();
        self.text.reserve(2 + name.len());
        self.text.push(q);
        for c in name.chars() {
            if c == q {
                self.text.push(q);
                self.text.push(q);
            } else {
                self.text.push(c);
            }
        }
        self.text.push(q);
    }

    pub fn write_column(&mut self, col: &ColumnRef) {
        self.write_name(&col.table);
        self.text.push('.');
        self.write_name(&col.column);
    }

    /// Appends a `?` placeholder and queues its argument.
    pub fn push_arg(&mut self, value: ScalarValue) {
        self.text.push('?');
        self.args.push(value);
    }

    /// This method makes the `write!` macro work with this struct.
    pub fn write_fmt(&mut self, fmt: fmt::Arguments<'_>) {
        self.text.write_fmt(fmt).expect("formatting failed")
    }

    /// Finishes the statement, rebinding placeholders to the dialect.
    pub fn finish(self) -> SqlWithArguments {
        SqlWithArguments {
            sql: self.dialect.rebind(self.text),
            args: self.args,
        }
    }
}

/// Lookup suffixes accepted after `__` in a filter key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lookup {
    Exact,
    IExact,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
    Regex,
    IRegex,
    In,
    IsNull,
    Gt,
    Gte,
    Lt,
    Lte,
    Ne,
}

impl Lookup {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "exact" => Self::Exact,
            "iexact" => Self::IExact,
            "contains" => Self::Contains,
            "icontains" => Self::IContains,
            "startswith" => Self::StartsWith,
            "istartswith" => Self::IStartsWith,
            "endswith" => Self::EndsWith,
            "iendswith" => Self::IEndsWith,
            "regex" => Self::Regex,
            "iregex" => Self::IRegex,
            "in" => Self::In,
            "isnull" => Self::IsNull,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "ne" => Self::Ne,
            other => return Err(Error::UnsupportedLookup(other.to_owned())),
        })
    }

    /// Whether this is a candidate `__<lookup>` suffix at all; used to tell
    /// `Name__gt` apart from a field actually named `Name__gt`.
    pub fn is_known(s: &str) -> bool {
        Self::parse(s).is_ok()
    }

    fn comparison_op(&self) -> Option<&'static str> {
        match self {
            Self::Exact => Some("="),
            Self::Ne => Some("!="),
            Self::Gt => Some(">"),
            Self::Gte => Some(">="),
            Self::Lt => Some("<"),
            Self::Lte => Some("<="),
            _ => None,
        }
    }

    fn pattern(&self) -> Option<(bool, bool, bool)> {
        // (leading %, trailing %, case-insensitive)
        match self {
            Self::Contains => Some((true, true, false)),
            Self::IContains => Some((true, true, true)),
            Self::StartsWith => Some((false, true, false)),
            Self::IStartsWith => Some((false, true, true)),
            Self::EndsWith => Some((true, false, false)),
            Self::IEndsWith => Some((true, false, true)),
            _ => None,
        }
    }
}

/// Left-hand side of a lookup: a concrete column, or a projection alias
/// (an annotation referenced from HAVING or a filter).
#[derive(Clone, Debug)]
pub enum LhsRef {
    Column(ColumnRef),
    Alias(String),
}

/// A resolved WHERE/HAVING clause.
#[derive(Clone, Debug)]
pub enum Clause {
    Lookup {
        lhs: LhsRef,
        lookup: Lookup,
        values: Vec<ScalarValue>,
    },
    /// A resolved expression rendering to a boolean fragment.
    Expr(Expr),
    And(Vec<Clause>),
    Or(Vec<Clause>),
    Not(Box<Clause>),
}

impl Clause {
    pub fn pk_eq(table: &str, column: &str, value: ScalarValue) -> Self {
        Clause::Lookup {
            lhs: LhsRef::Column(ColumnRef::new(table, column)),
            lookup: Lookup::Exact,
            values: vec![value],
        }
    }

    pub fn pk_in(table: &str, column: &str, values: Vec<ScalarValue>) -> Self {
        Clause::Lookup {
            lhs: LhsRef::Column(ColumnRef::new(table, column)),
            lookup: Lookup::In,
            values,
        }
    }
}

#[derive(Clone, Debug)]
pub enum OrderTarget {
    Column(ColumnRef),
    /// A projection alias (annotation).
    Alias(String),
}

#[derive(Clone, Debug)]
pub struct OrderBy {
    pub target: OrderTarget,
    pub desc: bool,
}

#[derive(Clone, Debug)]
pub enum GroupRef {
    Column(ColumnRef),
    Alias(String),
    Expr(Expr),
}

/// Borrowed view over a query-set snapshot, handed to the compiler.
pub struct SelectQuery<'a> {
    pub table: &'a str,
    pub infos: &'a [FieldInfo],
    pub annotations: &'a IndexMap<String, Expr>,
    pub joins: &'a [JoinDef],
    pub where_: &'a [Clause],
    pub group_by: &'a [GroupRef],
    pub having: &'a [Clause],
    pub order_by: &'a [OrderBy],
    pub limit: i64,
    pub offset: i64,
    pub distinct: bool,
    pub for_update: bool,
}

/// One row of a (bulk) update.
#[derive(Clone, Debug)]
pub struct UpdateRow {
    /// Primary-key value identifying the row, when it has one.
    pub pk: Option<ScalarValue>,
    pub set_values: Vec<(FieldDef, ScalarValue)>,
    pub set_exprs: Vec<(FieldDef, Expr)>,
    /// Extra per-row conditions; combined with the pk condition.
    pub where_: Vec<Clause>,
}

/// How the executor must drive an insert plan.
#[derive(Clone, Debug)]
pub enum InsertExec {
    /// Single statement; fetch rows back, scanning `columns` in order.
    FetchRows { columns: Vec<FieldDef> },
    /// One statement per row; read each result's last-insert id.
    PerRowLastId,
    /// Single multi-row statement; derive ids from the final last-insert id.
    BulkLastId,
    /// No rows come back.
    Silent,
}

#[derive(Clone, Debug)]
pub struct InsertPlan {
    pub statements: Vec<SqlWithArguments>,
    pub exec: InsertExec,
    /// Insert column order, for callers mapping values back onto objects.
    pub columns: Vec<FieldDef>,
}

/// Per-dialect hooks. Every method has the generic behavior as its default
/// implementation; concrete dialects override the few spots they diverge in.
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn quote_char(&self) -> char {
        '"'
    }

    /// Rewrites `?` placeholders into the dialect's syntax. The generic
    /// dialect keeps `?`.
    fn rebind(&self, sql: String) -> String {
        sql
    }

    /// Whether case-insensitive lookups wrap both sides in `LOWER(...)`.
    /// SQLite instead relies on `LIKE`'s built-in case folding.
    fn lower_for_case_insensitive(&self) -> bool {
        true
    }

    /// Clause appended after a `LIKE` pattern (SQLite needs an explicit
    /// escape character).
    fn like_escape_suffix(&self) -> &'static str {
        ""
    }

    /// String concatenation idiom for assembled patterns.
    fn concat(&self, parts: &[String]) -> String {
        parts.join(" || ")
    }

    /// Renders a regex condition; `lhs` is already quoted.
    fn write_regex(&self, w: &mut SqlWriter<'_>, lhs: &str, ci: bool, value: ScalarValue) {
        if ci && self.lower_for_case_insensitive() {
            w.write_str("LOWER(");
            w.write_str(lhs);
            w.write_str(") REGEXP LOWER(");
            w.push_arg(value);
            w.write_str(")");
        } else {
            w.write_str(lhs);
            w.write_str(" REGEXP ");
            w.push_arg(value);
        }
    }

    /// Escapes `%` and `_` in a value interpolated into a LIKE pattern.
    fn prep_for_like(&self, value: &str) -> String {
        value
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_")
    }

    fn supports_for_update(&self) -> bool {
        true
    }

    /// Suffix appended to an INSERT when the driver capability is
    /// `LastInsertId`; Postgres overrides this to `RETURNING <pk>`.
    fn insert_returning_pk(&self) -> bool {
        false
    }

    /// Whether `LastInsertId` bulk inserts must run one statement per row
    /// (MySQL derives each row's id from its own statement result).
    fn insert_per_row(&self) -> bool {
        false
    }

    /// Whether a multi-row update compiles to a single
    /// `UPDATE ... FROM (VALUES ...)` statement.
    fn update_from_values(&self) -> bool {
        false
    }

    /// Postgres-style cast suffix for VALUES literals.
    fn cast_for(&self, _ty: FieldType) -> &'static str {
        ""
    }
}

/// The generic dialect: plain `?` placeholders, double-quote identifiers.
pub struct Generic;

impl Dialect for Generic {
    fn name(&self) -> &'static str {
        "generic"
    }
}

fn quoted(dialect: &dyn Dialect, name: &str) -> String {
    let q = dialect.quote_char();
    let mut out = String::with_capacity(name.len() + 2);
    out.push(q);
    for c in name.chars() {
        if c == q {
            out.push(q);
            out.push(q);
        } else {
            out.push(c);
        }
    }
    out.push(q);
    out
}

fn quoted_column(dialect: &dyn Dialect, col: &ColumnRef) -> String {
    format!(
        "{}.{}",
        quoted(dialect, &col.table),
        quoted(dialect, &col.column)
    )
}

/// Renders a resolved expression. `Field` paths must have been resolved to
/// `Column` refs by the query set before compilation.
pub fn write_expr(w: &mut SqlWriter<'_>, expr: &Expr) {
    match expr {
        Expr::Field(path) => panic!("unresolved field path `{path}` reached the compiler"),
        Expr::Column(col) => w.write_column(col),
        Expr::Alias(alias) => w.write_name(alias),
        Expr::Value(v) => w.push_arg(v.clone()),
        Expr::Raw { sql, args } => {
            w.write_str(sql);
            w.args.extend(args.iter().cloned());
        }
        Expr::Func { name, args } => {
            w.write_str(name);
            w.write_str("(");
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    w.write_str(", ");
                }
                write_expr(w, arg);
            }
            w.write_str(")");
        }
        Expr::Star => w.write_str("*"),
        Expr::Binary(b) => {
            w.write_str("(");
            write_expr(w, &b.left);
            write!(w, " {} ", b.op.to_sql_string());
            write_expr(w, &b.right);
            w.write_str(")");
        }
    }
}

fn write_lookup(
    dialect: &dyn Dialect,
    w: &mut SqlWriter<'_>,
    lhs: &str,
    lookup: Lookup,
    values: &[ScalarValue],
) -> Result<()> {
    let first = || {
        values
            .first()
            .cloned()
            .unwrap_or_else(|| panic!("lookup `{lookup:?}` requires a value"))
    };

    if let Some(op) = lookup.comparison_op() {
        let value = first();
        if value.is_null() {
            w.write_str(lhs);
            w.write_str(match lookup {
                Lookup::Ne => " IS NOT NULL",
                _ => " IS NULL",
            });
            return Ok(());
        }
        write!(w, "{lhs} {op} ");
        w.push_arg(value);
        return Ok(());
    }

    if let Some((lead, trail, ci)) = lookup.pattern() {
        let value = first();
        let escaped = match value {
            ScalarValue::String(s) => ScalarValue::String(dialect.prep_for_like(&s)),
            other => other,
        };
        let mut parts = vec![];
        if lead {
            parts.push("'%'".to_owned());
        }
        parts.push("?".to_owned());
        if trail {
            parts.push("'%'".to_owned());
        }
        let pattern = dialect.concat(&parts);
        if ci && dialect.lower_for_case_insensitive() {
            write!(w, "LOWER({lhs}) LIKE LOWER({pattern})");
        } else {
            write!(w, "{lhs} LIKE {pattern}");
        }
        // The assembled pattern carries the single `?` for this value.
        w.args.push(escaped);
        w.write_str(dialect.like_escape_suffix());
        return Ok(());
    }

    match lookup {
        Lookup::IExact => {
            let value = first();
            if dialect.lower_for_case_insensitive() {
                write!(w, "LOWER({lhs}) = LOWER(");
                w.push_arg(value);
                w.write_str(")");
            } else {
                let escaped = match value {
                    ScalarValue::String(s) => ScalarValue::String(dialect.prep_for_like(&s)),
                    other => other,
                };
                write!(w, "{lhs} LIKE ");
                w.push_arg(escaped);
                w.write_str(dialect.like_escape_suffix());
            }
        }
        Lookup::In => {
            if values.is_empty() {
                // An empty IN list can never match.
                w.write_str("1 = 0");
            } else {
                write!(w, "{lhs} IN (");
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        w.write_str(", ");
                    }
                    w.push_arg(v.clone());
                }
                w.write_str(")");
            }
        }
        Lookup::IsNull => {
            let want_null = values.first().map(|v| !v.is_zero()).unwrap_or(true);
            w.write_str(lhs);
            w.write_str(if want_null { " IS NULL" } else { " IS NOT NULL" });
        }
        Lookup::Regex => dialect.write_regex(w, lhs, false, first()),
        Lookup::IRegex => dialect.write_regex(w, lhs, true, first()),
        other => panic!("lookup `{other:?}` fell through rendering"),
    }
    Ok(())
}

fn write_clause(dialect: &dyn Dialect, w: &mut SqlWriter<'_>, clause: &Clause) -> Result<()> {
    match clause {
        Clause::Lookup {
            lhs,
            lookup,
            values,
        } => {
            let lhs = match lhs {
                LhsRef::Column(column) => quoted_column(dialect, column),
                LhsRef::Alias(alias) => quoted(dialect, alias),
            };
            write_lookup(dialect, w, &lhs, *lookup, values)?;
        }
        Clause::Expr(expr) => write_expr(w, expr),
        Clause::And(children) | Clause::Or(children) => {
            let sep = match clause {
                Clause::And(_) => " AND ",
                _ => " OR ",
            };
            w.write_str("(");
            for (i, child) in children.iter().enumerate() {
                if i > 0 {
                    w.write_str(sep);
                }
                write_clause(dialect, w, child)?;
            }
            w.write_str(")");
        }
        Clause::Not(inner) => {
            w.write_str("NOT (");
            write_clause(dialect, w, inner)?;
            w.write_str(")");
        }
    }
    Ok(())
}

fn write_clause_list(
    dialect: &dyn Dialect,
    w: &mut SqlWriter<'_>,
    keyword: &str,
    clauses: &[Clause],
) -> Result<()> {
    if clauses.is_empty() {
        return Ok(());
    }
    w.write_str(keyword);
    for (i, clause) in clauses.iter().enumerate() {
        if i > 0 {
            w.write_str(" AND ");
        }
        write_clause(dialect, w, clause)?;
    }
    Ok(())
}

/// A compiler: the generic rendering skeleton plus the dialect hooks and the
/// driver's registered returning capability.
pub struct Compiler {
    pub dialect: Box<dyn Dialect>,
    pub returning: Returning,
}

impl std::fmt::Debug for Compiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compiler")
            .field("dialect", &self.dialect.name())
            .field("returning", &self.returning)
            .finish()
    }
}

impl Compiler {
    pub fn new(dialect: Box<dyn Dialect>, returning: Returning) -> Self {
        Self { dialect, returning }
    }

    fn write_joins(&self, w: &mut SqlWriter<'_>, joins: &[JoinDef]) {
        for join in joins {
            write!(w, " {} ", join.ty.sql());
            w.write_name(&join.table.name);
            if let Some(alias) = &join.table.alias {
                w.write_str(" AS ");
                w.write_name(alias);
            }
            w.write_str(" ON ");
            let mut cond = Some(&join.cond);
            while let Some(c) = cond {
                w.write_column(&c.left);
                write!(w, " {} ", c.op);
                w.write_column(&c.right);
                if c.next.is_some() {
                    w.write_str(" AND ");
                }
                cond = c.next.as_deref();
            }
        }
    }

    fn write_group_by(&self, w: &mut SqlWriter<'_>, groups: &[GroupRef]) -> Result<()> {
        if groups.is_empty() {
            return Ok(());
        }
        w.write_str(" GROUP BY ");
        for (i, group) in groups.iter().enumerate() {
            if i > 0 {
                w.write_str(", ");
            }
            match group {
                GroupRef::Column(col) => w.write_column(col),
                GroupRef::Alias(alias) => w.write_name(alias),
                GroupRef::Expr(expr) => write_expr(w, expr),
            }
        }
        Ok(())
    }

    /// `SELECT [DISTINCT] <fields> FROM <table> <joins> WHERE <where>
    /// GROUP BY <group> HAVING <having> ORDER BY <order> LIMIT ? OFFSET ?
    /// [FOR UPDATE]`.
    pub fn build_select(&self, q: &SelectQuery<'_>) -> Result<SqlWithArguments> {
        let dialect = self.dialect.as_ref();
        let mut w = SqlWriter::new(dialect);
        w.write_str("SELECT ");
        if q.distinct {
            w.write_str("DISTINCT ");
        }

        let cols = projected_columns(q.infos);
        let mut seen_aliases: HashMap<String, usize> = HashMap::new();
        let mut first = true;
        for col in &cols {
            if !first {
                w.write_str(", ");
            }
            first = false;
            w.write_name(col.table);
            w.write_str(".");
            w.write_name(&col.field.column);
            let base = format!("{}_{}", col.table, col.field.column);
            let n = seen_aliases
                .entry(base.clone())
                .and_modify(|n| *n += 1)
                .or_insert(1);
            let alias = if *n == 1 {
                base
            } else {
                format!("{base}_{n}")
            };
            w.write_str(" AS ");
            w.write_name(crate::alias::truncate_identifier(&alias));
        }
        for (alias, expr) in q.annotations {
            if !first {
                w.write_str(", ");
            }
            first = false;
            write_expr(&mut w, expr);
            w.write_str(" AS ");
            w.write_name(alias);
        }
        if first {
            // A projection can't be empty; guard against a degenerate state.
            w.write_str("*");
        }

        w.write_str(" FROM ");
        w.write_name(q.table);
        self.write_joins(&mut w, q.joins);
        write_clause_list(dialect, &mut w, " WHERE ", q.where_)?;
        self.write_group_by(&mut w, q.group_by)?;
        write_clause_list(dialect, &mut w, " HAVING ", q.having)?;

        if !q.order_by.is_empty() {
            w.write_str(" ORDER BY ");
            for (i, order) in q.order_by.iter().enumerate() {
                if i > 0 {
                    w.write_str(", ");
                }
                match &order.target {
                    OrderTarget::Column(col) => w.write_column(col),
                    OrderTarget::Alias(alias) => w.write_name(alias),
                }
                w.write_str(if order.desc { " DESC" } else { " ASC" });
            }
        }

        w.write_str(" LIMIT ");
        w.push_arg(ScalarValue::I64(q.limit));
        w.write_str(" OFFSET ");
        w.push_arg(ScalarValue::I64(q.offset));

        if q.for_update && dialect.supports_for_update() {
            w.write_str(" FOR UPDATE");
        }
        Ok(w.finish())
    }

    /// `SELECT COUNT(*) FROM <table> <joins> WHERE <where> GROUP BY <group>
    /// LIMIT ? OFFSET ?`.
    pub fn build_count(&self, q: &SelectQuery<'_>) -> Result<SqlWithArguments> {
        let dialect = self.dialect.as_ref();
        let mut w = SqlWriter::new(dialect);
        w.write_str("SELECT COUNT(*) FROM ");
        w.write_name(q.table);
        self.write_joins(&mut w, q.joins);
        write_clause_list(dialect, &mut w, " WHERE ", q.where_)?;
        self.write_group_by(&mut w, q.group_by)?;
        w.write_str(" LIMIT ");
        w.push_arg(ScalarValue::I64(q.limit));
        w.write_str(" OFFSET ");
        w.push_arg(ScalarValue::I64(q.offset));
        Ok(w.finish())
    }

    /// `SELECT <expr AS alias, ...> FROM ...` without paging, for aggregate
    /// terminals.
    pub fn build_aggregate(&self, q: &SelectQuery<'_>) -> Result<SqlWithArguments> {
        let dialect = self.dialect.as_ref();
        let mut w = SqlWriter::new(dialect);
        w.write_str("SELECT ");
        for (i, (alias, expr)) in q.annotations.iter().enumerate() {
            if i > 0 {
                w.write_str(", ");
            }
            write_expr(&mut w, expr);
            w.write_str(" AS ");
            w.write_name(alias);
        }
        w.write_str(" FROM ");
        w.write_name(q.table);
        self.write_joins(&mut w, q.joins);
        write_clause_list(dialect, &mut w, " WHERE ", q.where_)?;
        self.write_group_by(&mut w, q.group_by)?;
        write_clause_list(dialect, &mut w, " HAVING ", q.having)?;
        Ok(w.finish())
    }

    /// Columns included in an INSERT: auto-increment and read-only
    /// non-primary fields are excluded.
    pub fn insertable_fields(schema: &ModelSchema) -> Vec<FieldDef> {
        schema
            .local_fields()
            .filter(|f| !f.auto_increment && (f.allow_edit || f.primary))
            .cloned()
            .collect()
    }

    fn insert_values_for(
        schema: &ModelSchema,
        columns: &[FieldDef],
        obj: &crate::object::Object,
    ) -> Result<Vec<ScalarValue>> {
        let mut values = vec![];
        for field in columns {
            let value = obj.get(&field.name).cloned().unwrap_or(ScalarValue::Null);
            if value.is_null() && !field.allow_null {
                return Err(Error::FieldNull {
                    model: schema.name().to_owned(),
                    field: field.name.clone(),
                });
            }
            values.push(value);
        }
        Ok(values)
    }

    fn write_insert_head(&self, w: &mut SqlWriter<'_>, table: &str, columns: &[FieldDef]) {
        w.write_str("INSERT INTO ");
        w.write_name(table);
        w.write_str(" (");
        let mut first = true;
        for field in columns {
            if !first {
                w.write_str(", ");
            }
            first = false;
            w.write_name(&field.column);
        }
        w.write_str(") VALUES ");
    }

    fn returning_columns(schema: &ModelSchema, columns: &[FieldDef]) -> Vec<FieldDef> {
        let mut cols = vec![];
        if let Some(pk) = schema.primary_field() {
            cols.push(pk.clone());
        }
        for field in columns {
            if !field.primary {
                cols.push(field.clone());
            }
        }
        cols
    }

    /// Bulk INSERT. The returned plan tells the executor whether rows come
    /// back (`RETURNING`), whether ids come from last-insert-id, and in what
    /// column order returned rows are scanned.
    pub fn build_insert(
        &self,
        schema: &ModelSchema,
        objs: &[crate::object::Object],
    ) -> Result<InsertPlan> {
        let dialect = self.dialect.as_ref();
        let columns = Self::insertable_fields(schema);
        let per_row = self.returning == Returning::LastInsertId && dialect.insert_per_row();

        let mut statements = vec![];
        if per_row {
            for obj in objs {
                let mut w = SqlWriter::new(dialect);
                self.write_insert_head(&mut w, schema.table(), &columns);
                w.write_str("(");
                for (i, value) in Self::insert_values_for(schema, &columns, obj)?
                    .into_iter()
                    .enumerate()
                {
                    if i > 0 {
                        w.write_str(", ");
                    }
                    w.push_arg(value);
                }
                w.write_str(")");
                statements.push(w.finish());
            }
        } else {
            let mut w = SqlWriter::new(dialect);
            self.write_insert_head(&mut w, schema.table(), &columns);
            for (i, obj) in objs.iter().enumerate() {
                if i > 0 {
                    w.write_str(", ");
                }
                w.write_str("(");
                for (j, value) in Self::insert_values_for(schema, &columns, obj)?
                    .into_iter()
                    .enumerate()
                {
                    if j > 0 {
                        w.write_str(", ");
                    }
                    w.push_arg(value);
                }
                w.write_str(")");
            }
            match self.returning {
                Returning::Columns => {
                    let ret = Self::returning_columns(schema, &columns);
                    w.write_str(" RETURNING ");
                    let names = ret
                        .iter()
                        .map(|f| quoted(dialect, &f.column))
                        .join(", ");
                    w.write_str(&names);
                }
                Returning::LastInsertId if dialect.insert_returning_pk() => {
                    if let Some(pk) = schema.primary_field() {
                        w.write_str(" RETURNING ");
                        w.write_name(&pk.column);
                    }
                }
                _ => {}
            }
            statements.push(w.finish());
        }

        let exec = match self.returning {
            Returning::Columns => InsertExec::FetchRows {
                columns: Self::returning_columns(schema, &columns),
            },
            Returning::LastInsertId => {
                if per_row {
                    InsertExec::PerRowLastId
                } else if dialect.insert_returning_pk() {
                    InsertExec::FetchRows {
                        columns: schema.primary_field().cloned().into_iter().collect(),
                    }
                } else {
                    InsertExec::BulkLastId
                }
            }
            Returning::None => InsertExec::Silent,
        };

        Ok(InsertPlan {
            statements,
            exec,
            columns,
        })
    }

    /// Bulk UPDATE: one statement per row on the generic path, a single
    /// `FROM (VALUES ...)` statement on dialects that support it. Multiple
    /// statements are the executor's cue to wrap in a transaction and sum
    /// `rows_affected`.
    pub fn build_update(
        &self,
        schema: &ModelSchema,
        joins: &[JoinDef],
        rows: &[UpdateRow],
    ) -> Result<Vec<SqlWithArguments>> {
        let dialect = self.dialect.as_ref();
        if rows.is_empty() {
            return Ok(vec![]);
        }

        if dialect.update_from_values() && Self::values_update_applies(schema, rows) {
            return Ok(vec![self.build_update_from_values(schema, rows)?]);
        }

        let mut statements = vec![];
        for row in rows {
            let mut w = SqlWriter::new(dialect);
            w.write_str("UPDATE ");
            w.write_name(schema.table());
            w.write_str(" SET ");
            let mut first = true;
            for (field, value) in &row.set_values {
                if !first {
                    w.write_str(", ");
                }
                first = false;
                w.write_name(&field.column);
                w.write_str(" = ");
                w.push_arg(value.clone());
            }
            for (field, expr) in &row.set_exprs {
                if !first {
                    w.write_str(", ");
                }
                first = false;
                w.write_name(&field.column);
                w.write_str(" = ");
                write_expr(&mut w, expr);
            }
            if first {
                panic!("update with no SET items");
            }
            self.write_joins(&mut w, joins);

            let mut where_ = row.where_.clone();
            if let (Some(pk_value), Some(pk_field)) = (&row.pk, schema.primary_field()) {
                where_.push(Clause::pk_eq(
                    schema.table(),
                    &pk_field.column,
                    pk_value.clone(),
                ));
            }
            if where_.is_empty() {
                return Err(Error::NoWhereClause);
            }
            write_clause_list(dialect, &mut w, " WHERE ", &where_)?;
            statements.push(w.finish());
        }
        Ok(statements)
    }

    /// The VALUES form needs every row identified by primary key and the
    /// same plain-value SET columns on each row.
    fn values_update_applies(schema: &ModelSchema, rows: &[UpdateRow]) -> bool {
        if rows.len() < 2 || schema.primary_field().is_none() {
            return false;
        }
        let shape: Vec<&str> = rows[0]
            .set_values
            .iter()
            .map(|(f, _)| f.name.as_str())
            .collect();
        if shape.is_empty() {
            return false;
        }
        rows.iter().all(|row| {
            row.pk.is_some()
                && row.where_.is_empty()
                && row.set_exprs.is_empty()
                && row
                    .set_values
                    .iter()
                    .map(|(f, _)| f.name.as_str())
                    .collect::<Vec<_>>()
                    == shape
        })
    }

    fn write_values_literal(
        &self,
        w: &mut SqlWriter<'_>,
        value: &ScalarValue,
        ty: FieldType,
    ) {
        let cast = self.dialect.cast_for(ty);
        match value {
            // NULL is written literally so the cast can't fail on it.
            ScalarValue::Null => w.write_str("NULL"),
            ScalarValue::Bool(v) => w.write_str(if *v { "TRUE" } else { "FALSE" }),
            other => {
                w.push_arg(other.clone());
                w.write_str(cast);
            }
        }
    }

    fn build_update_from_values(
        &self,
        schema: &ModelSchema,
        rows: &[UpdateRow],
    ) -> Result<SqlWithArguments> {
        let dialect = self.dialect.as_ref();
        let pk = schema.primary_field().expect("checked by caller");
        let columns: Vec<&FieldDef> = rows[0].set_values.iter().map(|(f, _)| f).collect();

        let mut w = SqlWriter::new(dialect);
        w.write_str("UPDATE ");
        w.write_name(schema.table());
        w.write_str(" SET ");
        for (i, field) in columns.iter().enumerate() {
            if i > 0 {
                w.write_str(", ");
            }
            w.write_name(&field.column);
            w.write_str(" = _u.");
            w.write_name(&field.column);
        }
        w.write_str(" FROM (VALUES ");
        for (i, row) in rows.iter().enumerate() {
            if i > 0 {
                w.write_str(", ");
            }
            w.write_str("(");
            self.write_values_literal(&mut w, row.pk.as_ref().expect("checked"), pk.ty);
            for (field, value) in &row.set_values {
                w.write_str(", ");
                self.write_values_literal(&mut w, value, field.ty);
            }
            w.write_str(")");
        }
        w.write_str(") AS _u(");
        w.write_name(&pk.column);
        for field in &columns {
            w.write_str(", ");
            w.write_name(&field.column);
        }
        w.write_str(") WHERE ");
        w.write_column(&ColumnRef::new(schema.table(), &pk.column));
        w.write_str(" = _u.");
        w.write_name(&pk.column);
        Ok(w.finish())
    }

    /// `DELETE FROM <t> <joins> WHERE <where> GROUP BY <group>`.
    pub fn build_delete(
        &self,
        table: &str,
        joins: &[JoinDef],
        where_: &[Clause],
        group_by: &[GroupRef],
    ) -> Result<SqlWithArguments> {
        let dialect = self.dialect.as_ref();
        if where_.is_empty() {
            return Err(Error::NoWhereClause);
        }
        let mut w = SqlWriter::new(dialect);
        w.write_str("DELETE FROM ");
        w.write_name(table);
        self.write_joins(&mut w, joins);
        write_clause_list(dialect, &mut w, " WHERE ", where_)?;
        self.write_group_by(&mut w, group_by)?;
        Ok(w.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDef;

    fn user_schema() -> ModelSchema {
        ModelSchema::new(
            "User",
            "users",
            vec![
                FieldDef::new("ID", FieldType::I64).primary().auto(),
                FieldDef::new("Name", FieldType::Text),
                FieldDef::new("Age", FieldType::I64),
            ],
        )
    }

    fn select_query<'a>(
        infos: &'a [FieldInfo],
        annotations: &'a IndexMap<String, Expr>,
        where_: &'a [Clause],
    ) -> SelectQuery<'a> {
        SelectQuery {
            table: "users",
            infos,
            annotations,
            joins: &[],
            where_,
            group_by: &[],
            having: &[],
            order_by: &[],
            limit: 1000,
            offset: 0,
            distinct: false,
            for_update: false,
        }
    }

    #[test]
    fn test_select_rendering() {
        let schema = std::sync::Arc::new(user_schema());
        let infos = vec![FieldInfo::root(
            schema.clone(),
            schema.local_fields().cloned().collect(),
        )];
        let annotations = IndexMap::new();
        let where_ = vec![Clause::Lookup {
            lhs: LhsRef::Column(ColumnRef::new("users", "age")),
            lookup: Lookup::Gt,
            values: vec![ScalarValue::I64(21)],
        }];
        let compiler = Compiler::new(Box::new(Generic), Returning::None);
        let q = compiler
            .build_select(&select_query(&infos, &annotations, &where_))
            .unwrap();
        assert_eq!(
            q.sql,
            "SELECT \"users\".\"id\" AS \"users_id\", \"users\".\"name\" AS \"users_name\", \
             \"users\".\"age\" AS \"users_age\" FROM \"users\" WHERE \"users\".\"age\" > ? \
             LIMIT ? OFFSET ?"
        );
        assert_eq!(q.args.len(), 3);
    }

    #[test]
    fn test_placeholder_count_matches_args() {
        let schema = std::sync::Arc::new(user_schema());
        let infos = vec![FieldInfo::root(
            schema.clone(),
            schema.local_fields().cloned().collect(),
        )];
        let mut annotations = IndexMap::new();
        annotations.insert(
            "older".to_owned(),
            crate::expr::Expr::Column(ColumnRef::new("users", "age")).add(5i64),
        );
        let where_ = vec![
            Clause::Lookup {
                lhs: LhsRef::Column(ColumnRef::new("users", "name")),
                lookup: Lookup::IContains,
                values: vec![ScalarValue::from("an")],
            },
            Clause::Lookup {
                lhs: LhsRef::Column(ColumnRef::new("users", "age")),
                lookup: Lookup::In,
                values: vec![ScalarValue::I64(1), ScalarValue::I64(2)],
            },
        ];
        let compiler = Compiler::new(Box::new(Generic), Returning::None);
        let q = compiler
            .build_select(&select_query(&infos, &annotations, &where_))
            .unwrap();
        let placeholders = q.sql.matches('?').count();
        assert_eq!(placeholders, q.args.len());
    }

    #[test]
    fn test_insert_bulk_rendering() {
        let schema = user_schema();
        let compiler = Compiler::new(Box::new(Generic), Returning::None);
        let objs = vec![
            crate::object::Object::new("User").with("Name", "Jane").with("Age", 30i64),
            crate::object::Object::new("User").with("Name", "Joe").with("Age", 40i64),
        ];
        let plan = compiler.build_insert(&schema, &objs).unwrap();
        assert_eq!(plan.statements.len(), 1);
        assert_eq!(
            plan.statements[0].sql,
            "INSERT INTO \"users\" (\"name\", \"age\") VALUES (?, ?), (?, ?)"
        );
        assert_eq!(plan.statements[0].args.len(), 4);
        assert!(matches!(plan.exec, InsertExec::Silent));
    }

    #[test]
    fn test_insert_rejects_null_in_non_nullable() {
        let schema = user_schema();
        let compiler = Compiler::new(Box::new(Generic), Returning::None);
        let objs = vec![crate::object::Object::new("User").with("Age", 30i64)];
        let err = compiler.build_insert(&schema, &objs).unwrap_err();
        assert!(matches!(err, Error::FieldNull { .. }));
    }

    #[test]
    fn test_update_per_row() {
        let schema = user_schema();
        let compiler = Compiler::new(Box::new(Generic), Returning::None);
        let age = schema.get_field("Age").unwrap().clone();
        let rows = vec![UpdateRow {
            pk: Some(ScalarValue::I64(7)),
            set_values: vec![(age, ScalarValue::I64(31))],
            set_exprs: vec![],
            where_: vec![],
        }];
        let stmts = compiler.build_update(&schema, &[], &rows).unwrap();
        assert_eq!(stmts.len(), 1);
        assert_eq!(
            stmts[0].sql,
            "UPDATE \"users\" SET \"age\" = ? WHERE \"users\".\"id\" = ?"
        );
        assert_eq!(stmts[0].args.len(), 2);
    }

    #[test]
    fn test_update_requires_some_identity() {
        let schema = user_schema();
        let compiler = Compiler::new(Box::new(Generic), Returning::None);
        let age = schema.get_field("Age").unwrap().clone();
        let rows = vec![UpdateRow {
            pk: None,
            set_values: vec![(age, ScalarValue::I64(31))],
            set_exprs: vec![],
            where_: vec![],
        }];
        let err = compiler.build_update(&schema, &[], &rows).unwrap_err();
        assert!(matches!(err, Error::NoWhereClause));
    }

    #[test]
    fn test_delete_requires_where() {
        let compiler = Compiler::new(Box::new(Generic), Returning::None);
        let err = compiler.build_delete("users", &[], &[], &[]).unwrap_err();
        assert!(matches!(err, Error::NoWhereClause));
    }

    #[test]
    fn test_empty_in_lookup_never_matches() {
        let compiler = Compiler::new(Box::new(Generic), Returning::None);
        let schema = std::sync::Arc::new(user_schema());
        let infos = vec![FieldInfo::root(
            schema.clone(),
            schema.local_fields().cloned().collect(),
        )];
        let annotations = IndexMap::new();
        let where_ = vec![Clause::Lookup {
            lhs: LhsRef::Column(ColumnRef::new("users", "id")),
            lookup: Lookup::In,
            values: vec![],
        }];
        let q = compiler
            .build_select(&select_query(&infos, &annotations, &where_))
            .unwrap();
        assert!(q.sql.contains("1 = 0"));
    }
}
