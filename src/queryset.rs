// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! The query-set state machine: an immutable, chainable builder over one
//! registered model. Every builder call forks a fresh snapshot; terminal
//! operations compile the snapshot per dialect, execute it, and materialize
//! the rows back into object trees.

use crate::alias::AliasGenerator;
use crate::compiler::{
    compiler_for, Clause, Compiler, GroupRef, InsertExec, InsertPlan, LhsRef, Lookup, OrderBy,
    OrderTarget, SelectQuery, SqlWithArguments, UpdateRow,
};
use crate::errors::{Error, Result};
use crate::exec::{decode_any, decode_field, Database, TxHandle};
use crate::expr::{Args, Connector, Expr, Q, QChild};
use crate::joins::{plan_relation, projected_columns, ColumnRef, FieldInfo, JoinDef, PlanInput};
use crate::object::Object;
use crate::rows::materialize_rows;
use crate::schema::{FieldDef, HookKind, ModelSchema, Registry};
use crate::value::ScalarValue;
use crate::walker::{walk, PathInfo};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Default page cap applied to every snapshot.
pub const DEFAULT_LIMIT: i64 = 1000;

/// `get()` fetches up to this many rows so a multiplicity failure can
/// report how bad it was.
const GET_LIMIT: i64 = 21;

/// The mutable-in-private, immutable-in-public snapshot state.
#[derive(Clone)]
struct State {
    infos: Vec<FieldInfo>,
    where_: Vec<Clause>,
    having: Vec<Clause>,
    joins: Vec<JoinDef>,
    join_keys: HashSet<String>,
    group_by: Vec<GroupRef>,
    order_by: Vec<OrderBy>,
    annotations: IndexMap<String, Expr>,
    limit: i64,
    offset: i64,
    for_update: bool,
    distinct: bool,
    explicit_save: bool,
    aliases: AliasGenerator,
}

/// A chainable, immutable query set over one model. Builder operations fork
/// a new snapshot; the receiver is never mutated, so snapshots already
/// handed out stay valid.
pub struct QuerySet {
    db: Database,
    registry: Arc<Registry>,
    model: Arc<ModelSchema>,
    compiler: Arc<Compiler>,
    state: State,
    tx: Option<TxHandle>,
    /// Last compiled statement, for observability only. Forks start empty.
    latest: Arc<Mutex<Option<SqlWithArguments>>>,
}

/// Entry point: a query set over `model`, with the compiler looked up from
/// the database's driver identity.
pub fn objects(db: &Database, registry: &Arc<Registry>, model: &str) -> Result<QuerySet> {
    QuerySet::new(db, registry, model)
}

impl QuerySet {
    pub fn new(db: &Database, registry: &Arc<Registry>, model: &str) -> Result<Self> {
        let schema = registry
            .lookup(model)
            .unwrap_or_else(|| panic!("model `{model}` is not registered"));
        if schema.table().is_empty() {
            return Err(Error::NoTableName(model.to_owned()));
        }
        let compiler = compiler_for(db.driver())?;
        let state = State {
            infos: vec![FieldInfo::root(
                schema.clone(),
                schema.local_fields().cloned().collect(),
            )],
            where_: vec![],
            having: vec![],
            joins: vec![],
            join_keys: HashSet::new(),
            group_by: vec![],
            order_by: vec![],
            annotations: IndexMap::new(),
            limit: DEFAULT_LIMIT,
            offset: 0,
            for_update: false,
            distinct: false,
            explicit_save: false,
            aliases: AliasGenerator::new(),
        };
        Ok(Self {
            db: db.clone(),
            registry: registry.clone(),
            model: schema,
            compiler: Arc::new(compiler),
            state,
            tx: None,
            latest: Arc::new(Mutex::new(None)),
        })
    }

    /// Forks the snapshot. The fork's executed-statement cache starts empty.
    fn fork(&self) -> QuerySet {
        QuerySet {
            db: self.db.clone(),
            registry: self.registry.clone(),
            model: self.model.clone(),
            compiler: self.compiler.clone(),
            state: self.state.clone(),
            tx: self.tx.clone(),
            latest: Arc::new(Mutex::new(None)),
        }
    }

    pub fn model(&self) -> &Arc<ModelSchema> {
        &self.model
    }

    /// The last statement this snapshot compiled, if any.
    pub fn latest_query(&self) -> Option<SqlWithArguments> {
        self.latest.lock().expect("latest-query lock poisoned").clone()
    }

    fn record_latest(&self, q: &SqlWithArguments) {
        *self.latest.lock().expect("latest-query lock poisoned") = Some(q.clone());
    }

    // ---- path resolution ------------------------------------------------

    /// Plans joins for every hop of a resolved path; only the last hop
    /// contributes projection groups, and only when `project_last` is set.
    fn plan_hops(
        registry: &Arc<Registry>,
        model: &Arc<ModelSchema>,
        state: &mut State,
        info: &PathInfo,
        project_last: bool,
    ) -> Result<Vec<FieldInfo>> {
        let mut result = vec![];
        for depth in 0..info.chain.len() {
            let last = depth == info.chain.len() - 1;
            let parent_schema = if depth == 0 {
                model
            } else {
                &info.hop_models[depth - 1]
            };
            let parent_table = if depth == 0 {
                model.table().to_owned()
            } else {
                info.aliases[depth - 1].clone()
            };
            let terminal = if last {
                info.terminal.as_ref().filter(|t| !t.is_relation())
            } else {
                None
            };
            let input = PlanInput {
                registry: &**registry,
                parent_schema,
                parent_table: &parent_table,
                parent_field: &info.hop_fields[depth],
                terminal,
                chain: &info.chain[..=depth],
                chain_kinds: &info.chain_kinds[..=depth],
                target_alias: &info.aliases[depth],
                expand_all: info.expand_all && last,
                project: project_last && last,
            };
            let (infos, joins) = plan_relation(&input, &mut state.aliases, &mut state.join_keys)?;
            state.joins.extend(joins);
            if project_last && last {
                result.extend(infos);
            }
        }
        Ok(result)
    }

    /// Resolves a dotted path to a concrete column, planning the joins it
    /// crosses. A trailing relation with a local column resolves to that
    /// column on its parent (no join for the final hop); a trailing
    /// column-less relation resolves to the target's primary key.
    fn try_resolve_column(&mut self, path: &str) -> Result<ColumnRef> {
        let registry = self.registry.clone();
        let model = self.model.clone();
        let mut info = walk(&registry, &model, path, &mut self.state.aliases)?;

        if let Some(t) = info.terminal.clone() {
            if t.is_relation() && t.has_column() && !info.chain.is_empty() {
                info.chain.pop();
                info.chain_kinds.pop();
                info.hop_fields.pop();
                info.hop_models.pop();
                info.aliases.pop();
                info.is_related = !info.chain.is_empty();
            }
        }
        Self::plan_hops(&registry, &model, &mut self.state, &info, false)?;

        let table = info
            .aliases
            .last()
            .cloned()
            .unwrap_or_else(|| model.table().to_owned());
        let column = match &info.terminal {
            Some(t) if !t.is_relation() || t.has_column() => t.column.clone(),
            Some(_) => info
                .model
                .primary_field()
                .map(|f| f.column.clone())
                .ok_or_else(|| Error::FieldNotFound {
                    model: info.model.name().to_owned(),
                    field: "<primary>".to_owned(),
                })?,
            None => {
                return Err(Error::FieldNotFound {
                    model: model.name().to_owned(),
                    field: path.to_owned(),
                })
            }
        };
        Ok(ColumnRef::new(&table, &column))
    }

    /// Builds the clause for one `key`/`values` condition. Resolution
    /// failures fall back to the annotations map; only then do they surface
    /// as a panic, since an unknown filter key is a caller bug.
    fn resolve_cond(&mut self, key: &str, values: Vec<ScalarValue>) -> Clause {
        let (path, lookup) = match key.rsplit_once("__") {
            Some((p, suffix)) if Lookup::is_known(suffix) => {
                (p, Lookup::parse(suffix).expect("suffix checked"))
            }
            _ => (key, Lookup::Exact),
        };
        match self.try_resolve_column(path) {
            Ok(column) => Clause::Lookup {
                lhs: LhsRef::Column(column),
                lookup,
                values,
            },
            Err(err) => {
                if self.state.annotations.contains_key(path) {
                    Clause::Lookup {
                        lhs: LhsRef::Alias(path.to_owned()),
                        lookup,
                        values,
                    }
                } else {
                    panic!("cannot resolve filter key `{key}`: {err}")
                }
            }
        }
    }

    fn resolve_q(&mut self, q: Q) -> Clause {
        let children: Vec<Clause> = q
            .children
            .into_iter()
            .map(|child| match child {
                QChild::Cond { key, values } => self.resolve_cond(&key, values),
                QChild::Expr(e) => Clause::Expr(self.resolve_expr(e)),
                QChild::Nested(nested) => self.resolve_q(nested),
            })
            .collect();
        let clause = match q.connector {
            Connector::And => Clause::And(children),
            Connector::Or => Clause::Or(children),
        };
        if q.negated {
            Clause::Not(Box::new(clause))
        } else {
            clause
        }
    }

    /// Resolves field paths inside an expression, planning joins they need.
    fn resolve_expr(&mut self, expr: Expr) -> Expr {
        match expr {
            Expr::Field(path) => match self.try_resolve_column(&path) {
                Ok(col) => Expr::Column(col),
                Err(err) => {
                    if self.state.annotations.contains_key(&path) {
                        Expr::Alias(path)
                    } else {
                        panic!("cannot resolve expression path `{path}`: {err}")
                    }
                }
            },
            Expr::Func { name, args } => Expr::Func {
                name,
                args: args.into_iter().map(|a| self.resolve_expr(a)).collect(),
            },
            Expr::Binary(b) => {
                let left = self.resolve_expr(b.left);
                let right = self.resolve_expr(b.right);
                Expr::Binary(Box::new(crate::expr::BinaryExpr {
                    left,
                    op: b.op,
                    right,
                }))
            }
            other => other,
        }
    }

    fn order_target(&mut self, path: &str) -> OrderTarget {
        match self.try_resolve_column(path) {
            Ok(col) => OrderTarget::Column(col),
            Err(err) => {
                if self.state.annotations.contains_key(path) {
                    OrderTarget::Alias(path.to_owned())
                } else {
                    panic!("cannot order by `{path}`: {err}")
                }
            }
        }
    }

    // ---- builder operations ---------------------------------------------

    /// Replaces the projection. Selectors are field names, dotted paths,
    /// `"*"`, or `"<rel>.*"`; related selections plan their joins here.
    pub fn select(&self, selectors: &[&str]) -> QuerySet {
        let mut qs = self.fork();
        qs.state.infos.clear();
        let registry = qs.registry.clone();
        let model = qs.model.clone();

        let mut root_fields: Vec<FieldDef> = vec![];
        let mut related: Vec<FieldInfo> = vec![];
        for selector in selectors {
            let info = walk(&registry, &model, selector, &mut qs.state.aliases)
                .unwrap_or_else(|err| panic!("cannot select `{selector}`: {err}"));
            if !info.is_related {
                match &info.terminal {
                    None => root_fields.extend(model.local_fields().cloned()),
                    Some(f) if f.has_column() => root_fields.push(f.clone()),
                    Some(f) => panic!(
                        "field `{}` has no column of its own; select `{}.*` instead",
                        f.name, f.name
                    ),
                }
            } else {
                let infos =
                    Self::plan_hops(&registry, &model, &mut qs.state, &info, true)
                        .unwrap_or_else(|err| panic!("cannot select `{selector}`: {err}"));
                related.extend(infos);
            }
        }

        if !root_fields.is_empty() {
            let mut seen = HashSet::new();
            root_fields.retain(|f| seen.insert(f.name.clone()));
            qs.state
                .infos
                .push(FieldInfo::root(model.clone(), root_fields));
        }
        qs.state.infos.extend(related);
        qs
    }

    /// Appends an `AND` condition. `key` is a field path with an optional
    /// `__<lookup>` suffix.
    pub fn filter(&self, key: &str, values: impl Into<Args>) -> QuerySet {
        let mut qs = self.fork();
        let clause = qs.resolve_cond(key, values.into().0);
        qs.state.where_.push(clause);
        qs
    }

    /// Appends a composed `Q` filter.
    pub fn filter_q(&self, q: Q) -> QuerySet {
        let mut qs = self.fork();
        let clause = qs.resolve_q(q);
        qs.state.where_.push(clause);
        qs
    }

    /// Appends a boolean expression filter.
    pub fn filter_expr(&self, expr: Expr) -> QuerySet {
        let mut qs = self.fork();
        let clause = Clause::Expr(qs.resolve_expr(expr));
        qs.state.where_.push(clause);
        qs
    }

    /// Appends several conditions at once, AND-combined.
    pub fn filter_map(&self, pairs: Vec<(&str, Args)>) -> QuerySet {
        let mut qs = self.fork();
        for (key, values) in pairs {
            let clause = qs.resolve_cond(key, values.0);
            qs.state.where_.push(clause);
        }
        qs
    }

    /// Like [`filter`](Self::filter), accumulated into `HAVING`.
    pub fn having(&self, key: &str, values: impl Into<Args>) -> QuerySet {
        let mut qs = self.fork();
        let clause = qs.resolve_cond(key, values.into().0);
        qs.state.having.push(clause);
        qs
    }

    /// Replaces the group list.
    pub fn group_by(&self, fields: &[&str]) -> QuerySet {
        let mut qs = self.fork();
        qs.state.group_by.clear();
        for field in fields {
            let group = match qs.try_resolve_column(field) {
                Ok(col) => GroupRef::Column(col),
                Err(err) => {
                    if qs.state.annotations.contains_key(*field) {
                        GroupRef::Alias((*field).to_owned())
                    } else {
                        panic!("cannot group by `{field}`: {err}")
                    }
                }
            };
            qs.state.group_by.push(group);
        }
        qs
    }

    /// Replaces the order list; a leading `-` orders descending.
    pub fn order_by(&self, fields: &[&str]) -> QuerySet {
        let mut qs = self.fork();
        qs.state.order_by.clear();
        for field in fields {
            let (path, desc) = match field.strip_prefix('-') {
                Some(rest) => (rest, true),
                None => (*field, false),
            };
            let target = qs.order_target(path);
            qs.state.order_by.push(OrderBy { target, desc });
        }
        qs
    }

    /// Inverts the current order list.
    pub fn reverse(&self) -> QuerySet {
        let mut qs = self.fork();
        for order in &mut qs.state.order_by {
            order.desc = !order.desc;
        }
        qs
    }

    pub fn limit(&self, n: i64) -> QuerySet {
        let mut qs = self.fork();
        qs.state.limit = n;
        qs
    }

    pub fn offset(&self, n: i64) -> QuerySet {
        let mut qs = self.fork();
        qs.state.offset = n;
        qs
    }

    pub fn distinct(&self) -> QuerySet {
        let mut qs = self.fork();
        qs.state.distinct = true;
        qs
    }

    pub fn for_update(&self) -> QuerySet {
        let mut qs = self.fork();
        qs.state.for_update = true;
        qs
    }

    /// Disables delegation to the model's registered saver in `create`.
    pub fn explicit_save(&self) -> QuerySet {
        let mut qs = self.fork();
        qs.state.explicit_save = true;
        qs
    }

    /// Adds a virtual field under `alias`, projected alongside the model's
    /// columns and materialized into each object's annotations.
    pub fn annotate(&self, alias: &str, expr: Expr) -> QuerySet {
        let mut qs = self.fork();
        if qs.state.annotations.contains_key(alias) {
            panic!("duplicate annotation alias `{alias}`");
        }
        let resolved = qs.resolve_expr(expr);
        qs.state.annotations.insert(alias.to_owned(), resolved);
        qs
    }

    pub fn annotate_map(&self, pairs: Vec<(&str, Expr)>) -> QuerySet {
        pairs
            .into_iter()
            .fold(self.fork(), |qs, (alias, expr)| qs.annotate(alias, expr))
    }

    /// Applies a user function to a fork of this snapshot.
    pub fn scope<F>(&self, f: F) -> QuerySet
    where
        F: FnOnce(QuerySet) -> QuerySet,
    {
        f(self.fork())
    }

    /// Binds the transaction carried by `tx` when it belongs to the same
    /// database; a foreign-database handle is ignored.
    pub fn with_context(&self, tx: &TxHandle) -> QuerySet {
        let mut qs = self.fork();
        if tx.database_name() == qs.db.name() {
            qs.tx = Some(tx.clone());
        }
        qs
    }

    /// Starts a transaction bound to the returned snapshot. Starting one on
    /// a snapshot that already holds a transaction is refused.
    pub async fn begin_transaction(&self) -> Result<QuerySet> {
        if self.tx.is_some() {
            return Err(Error::TransactionStarted);
        }
        let tx = self.db.begin().await?;
        let mut qs = self.fork();
        qs.tx = Some(tx);
        Ok(qs)
    }

    pub fn transaction(&self) -> Option<&TxHandle> {
        self.tx.as_ref()
    }

    // ---- terminal operations --------------------------------------------

    fn select_view(&self) -> SelectQuery<'_> {
        SelectQuery {
            table: self.model.table(),
            infos: &self.state.infos,
            annotations: &self.state.annotations,
            joins: &self.state.joins,
            where_: &self.state.where_,
            group_by: &self.state.group_by,
            having: &self.state.having,
            order_by: &self.state.order_by,
            limit: self.state.limit,
            offset: self.state.offset,
            distinct: self.state.distinct,
            for_update: self.state.for_update,
        }
    }

    fn run_hooks(&self, kind: HookKind, obj: &mut Object) -> Result<()> {
        for hook in self.registry.hooks(self.model.name(), kind) {
            hook(obj).map_err(|e| Error::Hook {
                label: kind.label(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Executes the snapshot and materializes the deduplicated object rows.
    pub async fn all(&self) -> Result<Vec<Object>> {
        let q = self.compiler.build_select(&self.select_view())?;
        self.record_latest(&q);
        let rows = self.db.fetch_all(&q, self.tx.as_ref()).await?;
        let aliases: Vec<String> = self.state.annotations.keys().cloned().collect();
        let mut objs =
            materialize_rows(&self.registry, &self.model, &self.state.infos, &aliases, &rows)?;
        for obj in &mut objs {
            self.run_hooks(HookKind::AfterQuery, obj)?;
        }
        Ok(objs)
    }

    /// First row in the current order (primary-key order when none is set).
    pub async fn first(&self) -> Result<Option<Object>> {
        let mut qs = self.fork();
        if qs.state.order_by.is_empty() {
            if let Some(pk) = qs.model.primary_field() {
                qs.state.order_by.push(OrderBy {
                    target: OrderTarget::Column(ColumnRef::new(qs.model.table(), &pk.column)),
                    desc: false,
                });
            }
        }
        qs.state.limit = 1;
        qs.state.offset = 0;
        Ok(qs.all().await?.into_iter().next())
    }

    /// Last row in the current order.
    pub async fn last(&self) -> Result<Option<Object>> {
        let mut qs = self.fork();
        if qs.state.order_by.is_empty() {
            if let Some(pk) = qs.model.primary_field() {
                qs.state.order_by.push(OrderBy {
                    target: OrderTarget::Column(ColumnRef::new(qs.model.table(), &pk.column)),
                    desc: true,
                });
            }
        } else {
            for order in &mut qs.state.order_by {
                order.desc = !order.desc;
            }
        }
        qs.state.limit = 1;
        qs.state.offset = 0;
        Ok(qs.all().await?.into_iter().next())
    }

    /// Exactly one object. Requires a WHERE clause; fetches a few extra
    /// rows so the multiplicity failure can say how many matched.
    pub async fn get(&self) -> Result<Object> {
        if self.state.where_.is_empty() {
            return Err(Error::NoWhereClause);
        }
        let mut qs = self.fork();
        qs.state.limit = GET_LIMIT;
        qs.state.offset = 0;
        let objs = qs.all().await?;
        match objs.len() as i64 {
            0 => Err(Error::NoRows),
            1 => Ok(objs.into_iter().next().expect("one row")),
            n if n >= GET_LIMIT => Err(Error::MultipleRows {
                found: format!("{}+", GET_LIMIT - 1),
            }),
            n => Err(Error::MultipleRows {
                found: n.to_string(),
            }),
        }
    }

    /// `get()`, creating `obj` when nothing matched. Returns the object and
    /// whether it was created.
    pub async fn get_or_create(&self, obj: Object) -> Result<(Object, bool)> {
        if self.state.where_.is_empty() {
            return Err(Error::NoWhereClause);
        }
        match self.get().await {
            Ok(found) => Ok((found, false)),
            Err(Error::NoRows) => {
                let created = self.create(obj).await?;
                Ok((created, true))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self) -> Result<bool> {
        let mut qs = self.fork();
        qs.state.limit = 1;
        qs.state.offset = 0;
        Ok(qs.count().await? > 0)
    }

    /// Row count under the same WHERE/JOIN planning as `all()`.
    pub async fn count(&self) -> Result<i64> {
        let q = self.compiler.build_count(&self.select_view())?;
        self.record_latest(&q);
        let rows = self.db.fetch_all(&q, self.tx.as_ref()).await?;
        if !self.state.group_by.is_empty() {
            return Ok(rows.len() as i64);
        }
        Ok(rows
            .first()
            .map(|row| decode_any(row, 0).as_i64().unwrap_or(0))
            .unwrap_or(0))
    }

    /// Evaluates aggregate expressions in one statement, returning a map
    /// with exactly the given aliases.
    pub async fn aggregate(
        &self,
        pairs: Vec<(&str, Expr)>,
    ) -> Result<IndexMap<String, ScalarValue>> {
        let mut qs = self.fork();
        let mut annotations = IndexMap::new();
        for (alias, expr) in pairs {
            let resolved = qs.resolve_expr(expr);
            annotations.insert(alias.to_owned(), resolved);
        }
        let view = SelectQuery {
            table: qs.model.table(),
            infos: &[],
            annotations: &annotations,
            joins: &qs.state.joins,
            where_: &qs.state.where_,
            group_by: &qs.state.group_by,
            having: &qs.state.having,
            order_by: &[],
            limit: 0,
            offset: 0,
            distinct: false,
            for_update: false,
        };
        let q = qs.compiler.build_aggregate(&view)?;
        qs.record_latest(&q);
        let row = match qs.db.fetch_one(&q, qs.tx.as_ref()).await {
            Err(Error::NoRows) => return Err(Error::NoResults),
            other => other?,
        };
        let mut out = IndexMap::new();
        for (i, alias) in annotations.keys().enumerate() {
            out.insert(alias.clone(), decode_any(&row, i));
        }
        Ok(out)
    }

    /// Flat value tuples in projection order, without materialization.
    pub async fn values_list(&self, fields: &[&str]) -> Result<Vec<Vec<ScalarValue>>> {
        let qs = if fields.is_empty() {
            self.fork()
        } else {
            self.select(fields)
        };
        let q = qs.compiler.build_select(&qs.select_view())?;
        qs.record_latest(&q);
        let rows = qs.db.fetch_all(&q, qs.tx.as_ref()).await?;
        let cols = projected_columns(&qs.state.infos);
        let mut out = vec![];
        for row in &rows {
            let mut tuple = vec![];
            for (idx, col) in cols.iter().enumerate() {
                tuple.push(decode_field(row, idx, col.field, col.info.model.name())?);
            }
            for i in 0..qs.state.annotations.len() {
                tuple.push(decode_any(row, cols.len() + i));
            }
            out.push(tuple);
        }
        Ok(out)
    }

    /// Like [`values_list`](Self::values_list), but keyed by dotted path.
    pub async fn values(&self, fields: &[&str]) -> Result<Vec<IndexMap<String, ScalarValue>>> {
        let qs = if fields.is_empty() {
            self.fork()
        } else {
            self.select(fields)
        };
        let q = qs.compiler.build_select(&qs.select_view())?;
        qs.record_latest(&q);
        let rows = qs.db.fetch_all(&q, qs.tx.as_ref()).await?;
        let cols = projected_columns(&qs.state.infos);
        let mut out = vec![];
        for row in &rows {
            let mut map = IndexMap::new();
            for (idx, col) in cols.iter().enumerate() {
                let mut key = col.info.chain.join(".");
                if !key.is_empty() {
                    key.push('.');
                }
                key.push_str(&col.field.name);
                map.insert(key, decode_field(row, idx, col.field, col.info.model.name())?);
            }
            for (i, alias) in qs.state.annotations.keys().enumerate() {
                map.insert(alias.clone(), decode_any(row, cols.len() + i));
            }
            out.push(map);
        }
        Ok(out)
    }

    // ---- writes ----------------------------------------------------------

    async fn run_insert(&self, plan: InsertPlan, mut objs: Vec<Object>) -> Result<Vec<Object>> {
        let pk = self.model.primary_field().cloned();
        match &plan.exec {
            InsertExec::FetchRows { columns } => {
                let rows = self
                    .db
                    .fetch_all(&plan.statements[0], self.tx.as_ref())
                    .await?;
                for (obj, row) in objs.iter_mut().zip(rows.iter()) {
                    for (i, field) in columns.iter().enumerate() {
                        let value = decode_field(row, i, field, self.model.name())?;
                        obj.set(&field.name, value);
                    }
                }
            }
            InsertExec::PerRowLastId => {
                let statements = &plan.statements;
                let db = self.db.clone();
                let pk = pk.clone();
                let objs_ref = &mut objs;
                self.db
                    .run_in_transaction(self.tx.as_ref(), |tx| {
                        let db = db.clone();
                        let pk = pk.clone();
                        async move {
                            for (q, obj) in statements.iter().zip(objs_ref.iter_mut()) {
                                let done = db.execute(q, Some(&tx)).await?;
                                if let Some(pk) = pk.as_ref().filter(|f| f.auto_increment) {
                                    let id = done.last_insert_id.ok_or(Error::LastInsertId)?;
                                    obj.set(&pk.name, id);
                                }
                            }
                            Ok(())
                        }
                    })
                    .await?;
            }
            InsertExec::BulkLastId => {
                let done = self
                    .db
                    .execute(&plan.statements[0], self.tx.as_ref())
                    .await?;
                if let Some(pk) = pk.as_ref().filter(|f| f.auto_increment) {
                    let last = done.last_insert_id.ok_or(Error::LastInsertId)?;
                    // One multi-row statement on one connection: ids are
                    // consecutive and end at `last`.
                    let n = objs.len() as i64;
                    for (i, obj) in objs.iter_mut().enumerate() {
                        obj.set(&pk.name, last - n + 1 + i as i64);
                    }
                }
            }
            InsertExec::Silent => {
                self.db
                    .execute(&plan.statements[0], self.tx.as_ref())
                    .await?;
            }
        }
        Ok(objs)
    }

    /// Inserts one object. With a registered saver and no `explicit_save`,
    /// delegates to the saver inside a core-owned transaction.
    pub async fn create(&self, obj: Object) -> Result<Object> {
        let mut obj = obj;
        self.run_hooks(HookKind::BeforeCreate, &mut obj)?;
        self.run_hooks(HookKind::BeforeSave, &mut obj)?;
        self.registry.emit_pre_save(&obj);

        if !self.state.explicit_save {
            if let Some(saver) = self.registry.saver(self.model.name()) {
                let db = self.db.clone();
                {
                    let obj_ref = &mut obj;
                    self.db
                        .run_in_transaction(self.tx.as_ref(), |tx| {
                            let db = db.clone();
                            async move {
                                saver(&db, Some(&tx), obj_ref).await.map_err(|e| Error::Hook {
                                    label: "save",
                                    source: e,
                                })
                            }
                        })
                        .await?;
                }
                self.run_hooks(HookKind::AfterCreate, &mut obj)?;
                self.run_hooks(HookKind::AfterSave, &mut obj)?;
                self.registry.emit_post_save(&obj);
                return Ok(obj);
            }
        }

        let plan = self
            .compiler
            .build_insert(&self.model, std::slice::from_ref(&obj))?;
        if let Some(first) = plan.statements.first() {
            self.record_latest(first);
        }
        let mut created = self.run_insert(plan, vec![obj]).await?;
        let mut obj = created.pop().expect("one object in, one out");
        self.run_hooks(HookKind::AfterCreate, &mut obj)?;
        self.run_hooks(HookKind::AfterSave, &mut obj)?;
        self.registry.emit_post_save(&obj);
        Ok(obj)
    }

    /// Inserts many objects in one plan. An empty input is a no-op that
    /// emits no SQL.
    pub async fn bulk_create(&self, objs: Vec<Object>) -> Result<Vec<Object>> {
        if objs.is_empty() {
            return Ok(vec![]);
        }
        let mut objs = objs;
        for obj in &mut objs {
            self.run_hooks(HookKind::BeforeCreate, obj)?;
            self.run_hooks(HookKind::BeforeSave, obj)?;
        }
        for obj in &objs {
            self.registry.emit_pre_save(obj);
        }
        let plan = self.compiler.build_insert(&self.model, &objs)?;
        if let Some(first) = plan.statements.first() {
            self.record_latest(first);
        }
        let mut objs = self.run_insert(plan, objs).await?;
        for obj in &mut objs {
            self.run_hooks(HookKind::AfterCreate, obj)?;
            self.run_hooks(HookKind::AfterSave, obj)?;
        }
        for obj in &objs {
            self.registry.emit_post_save(obj);
        }
        Ok(objs)
    }

    /// Per-object write-back identity: primary key when usable, then the
    /// model's registered clause hook, then declared unique constraints.
    fn identifying_clause(&self, obj: &Object) -> Result<Clause> {
        if let Some(pk) = self.model.primary_field() {
            let value = obj.primary_value(&self.model);
            if !value.is_zero() {
                return Ok(Clause::pk_eq(self.model.table(), &pk.column, value));
            }
        }
        if let Some(f) = self.registry.clause_fn(self.model.name()) {
            if let Some(clause) = f(obj) {
                return Ok(clause);
            }
        }
        for field in self
            .model
            .all_fields()
            .filter(|f| f.unique && !f.primary && f.has_column())
        {
            if let Some(value) = obj.get(&field.name) {
                if !value.is_zero() {
                    return Ok(Clause::pk_eq(
                        self.model.table(),
                        &field.column,
                        value.clone(),
                    ));
                }
            }
        }
        for set in self.model.unique_together() {
            let mut clauses = vec![];
            for name in set {
                let field = match self.model.get_field(name) {
                    Some(f) => f,
                    None => break,
                };
                match obj.get(name) {
                    Some(value) => clauses.push(Clause::pk_eq(
                        self.model.table(),
                        &field.column,
                        value.clone(),
                    )),
                    None => break,
                }
            }
            if clauses.len() == set.len() {
                return Ok(Clause::And(clauses));
            }
        }
        Err(Error::NoUniqueKey(self.model.name().to_owned()))
    }

    fn update_row_for(
        &mut self,
        obj: &Object,
        exprs: &[(FieldDef, Expr)],
        use_filters: bool,
    ) -> Result<UpdateRow> {
        let model = self.model.clone();
        let expr_fields: HashSet<&str> = exprs.iter().map(|(f, _)| f.name.as_str()).collect();

        let mut set_values = vec![];
        for field in model.local_fields() {
            if field.primary || field.auto_increment || !field.allow_edit {
                continue;
            }
            if expr_fields.contains(field.name.as_str()) {
                continue;
            }
            if let Some(value) = obj.get(&field.name) {
                if value.is_null() && !field.allow_null {
                    return Err(Error::FieldNull {
                        model: model.name().to_owned(),
                        field: field.name.clone(),
                    });
                }
                set_values.push((field.clone(), value.clone()));
            }
        }

        if use_filters && !self.state.where_.is_empty() {
            return Ok(UpdateRow {
                pk: None,
                set_values,
                set_exprs: exprs.to_vec(),
                where_: self.state.where_.clone(),
            });
        }
        if self.model.primary_field().is_some() && obj.has_primary(&self.model) {
            return Ok(UpdateRow {
                pk: Some(obj.primary_value(&self.model)),
                set_values,
                set_exprs: exprs.to_vec(),
                where_: vec![],
            });
        }
        Ok(UpdateRow {
            pk: None,
            set_values,
            set_exprs: exprs.to_vec(),
            where_: vec![self.identifying_clause(obj)?],
        })
    }

    /// Resolves `(field, expr)` setters, panicking on a duplicate target
    /// field — two expressions for one column is a caller bug.
    fn resolve_setters(&mut self, exprs: Vec<(&str, Expr)>) -> Vec<(FieldDef, Expr)> {
        let model = self.model.clone();
        let mut seen = HashSet::new();
        let mut out = vec![];
        for (name, expr) in exprs {
            let field = model
                .get_field(name)
                .unwrap_or_else(|| panic!("model `{}` has no field `{name}`", model.name()))
                .clone();
            if !seen.insert(field.name.clone()) {
                panic!("duplicate update expression for field `{}`", field.name);
            }
            let resolved = self.resolve_expr(expr);
            out.push((field, resolved));
        }
        out
    }

    /// Updates rows matching the snapshot's filters (or the object's own
    /// identity when no filter is set). Returns rows affected.
    pub async fn update(&self, obj: Object, exprs: Vec<(&str, Expr)>) -> Result<u64> {
        let mut obj = obj;
        self.run_hooks(HookKind::BeforeUpdate, &mut obj)?;
        self.run_hooks(HookKind::BeforeSave, &mut obj)?;
        self.registry.emit_pre_save(&obj);

        let mut qs = self.fork();
        let setters = qs.resolve_setters(exprs);
        let row = qs.update_row_for(&obj, &setters, true)?;
        let stmts = qs.compiler.build_update(&qs.model, &qs.state.joins, &[row])?;
        if let Some(first) = stmts.first() {
            qs.record_latest(first);
        }
        let affected = qs.db.execute_all(&stmts, qs.tx.as_ref()).await?;

        self.run_hooks(HookKind::AfterUpdate, &mut obj)?;
        self.run_hooks(HookKind::AfterSave, &mut obj)?;
        self.registry.emit_post_save(&obj);
        Ok(affected)
    }

    /// Updates each object by its own identity, summing rows affected.
    /// Multi-statement plans run inside one core-owned transaction.
    pub async fn bulk_update(&self, objs: Vec<Object>, exprs: Vec<(&str, Expr)>) -> Result<u64> {
        if objs.is_empty() {
            return Ok(0);
        }
        let mut objs = objs;
        for obj in &mut objs {
            self.run_hooks(HookKind::BeforeUpdate, obj)?;
            self.run_hooks(HookKind::BeforeSave, obj)?;
        }
        for obj in &objs {
            self.registry.emit_pre_save(obj);
        }

        let mut qs = self.fork();
        let setters = qs.resolve_setters(exprs);
        let mut rows = vec![];
        for obj in &objs {
            rows.push(qs.update_row_for(obj, &setters, false)?);
        }
        let stmts = qs.compiler.build_update(&qs.model, &qs.state.joins, &rows)?;
        if let Some(first) = stmts.first() {
            qs.record_latest(first);
        }
        let affected = qs.db.execute_all(&stmts, qs.tx.as_ref()).await?;

        for obj in &mut objs {
            self.run_hooks(HookKind::AfterUpdate, obj)?;
            self.run_hooks(HookKind::AfterSave, obj)?;
        }
        for obj in &objs {
            self.registry.emit_post_save(obj);
        }
        Ok(affected)
    }

    /// Deletes rows matching the snapshot's filters; object arguments
    /// contribute their identifying clauses, OR-combined.
    pub async fn delete(&self, objs: &[Object]) -> Result<u64> {
        let mut where_ = self.state.where_.clone();
        if !objs.is_empty() {
            let clauses: Result<Vec<Clause>> =
                objs.iter().map(|o| self.identifying_clause(o)).collect();
            where_.push(Clause::Or(clauses?));
        }
        let q = self.compiler.build_delete(
            self.model.table(),
            &self.state.joins,
            &where_,
            &self.state.group_by,
        )?;
        self.record_latest(&q);
        Ok(self.db.execute(&q, self.tx.as_ref()).await?.rows_affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{count, f, sum};
    use crate::schema::Relation;
    use crate::schema::RelationKind;
    use crate::value::ScalarValue;

    fn test_registry() -> Arc<Registry> {
        let mut registry = Registry::new();
        registry.register(ModelSchema::new(
            "User",
            "users",
            vec![
                FieldDef::new("ID", crate::schema::FieldType::I64).primary().auto(),
                FieldDef::new("Name", crate::schema::FieldType::Text),
                FieldDef::new("Email", crate::schema::FieldType::Text),
                FieldDef::new("Age", crate::schema::FieldType::I64),
            ],
        ));
        registry.register(ModelSchema::new(
            "Author",
            "authors",
            vec![
                FieldDef::new("ID", crate::schema::FieldType::I64).primary().auto(),
                FieldDef::new("Name", crate::schema::FieldType::Text),
                FieldDef::new("BookSet", crate::schema::FieldType::I64).with_relation(
                    Relation::new(RelationKind::OneToMany, "Book").with_target_field("Author"),
                ),
            ],
        ));
        registry.register(ModelSchema::new(
            "Book",
            "books",
            vec![
                FieldDef::new("ID", crate::schema::FieldType::I64).primary().auto(),
                FieldDef::new("Title", crate::schema::FieldType::Text),
                FieldDef::new("Author", crate::schema::FieldType::I64)
                    .with_column("author_id")
                    .nullable()
                    .with_relation(Relation::new(RelationKind::ManyToOne, "Author")),
            ],
        ));
        registry.register(ModelSchema::new(
            "Post",
            "posts",
            vec![
                FieldDef::new("ID", crate::schema::FieldType::I64).primary().auto(),
                FieldDef::new("Title", crate::schema::FieldType::Text),
                FieldDef::new("Tags", crate::schema::FieldType::I64).with_relation(
                    Relation::new(RelationKind::ManyToMany, "Tag").with_through(
                        "PostTag", "post_id", "tag_id",
                    ),
                ),
            ],
        ));
        registry.register(ModelSchema::new(
            "Tag",
            "tags",
            vec![
                FieldDef::new("ID", crate::schema::FieldType::I64).primary().auto(),
                FieldDef::new("Label", crate::schema::FieldType::Text),
            ],
        ));
        registry.register(ModelSchema::new(
            "PostTag",
            "post_tags",
            vec![
                FieldDef::new("ID", crate::schema::FieldType::I64).primary().auto(),
                FieldDef::new("PostID", crate::schema::FieldType::I64).with_column("post_id"),
                FieldDef::new("TagID", crate::schema::FieldType::I64).with_column("tag_id"),
                FieldDef::new("AddedAt", crate::schema::FieldType::DateTime)
                    .with_column("added_at")
                    .nullable(),
            ],
        ));
        registry.register(ModelSchema::new(
            "Product",
            "products",
            vec![
                FieldDef::new("ID", crate::schema::FieldType::I64).primary().auto(),
                FieldDef::new("Name", crate::schema::FieldType::Text),
                FieldDef::new("Category", crate::schema::FieldType::Text),
                FieldDef::new("Price", crate::schema::FieldType::F64),
            ],
        ));
        Arc::new(registry)
    }

    fn raw(sql: &str) -> SqlWithArguments {
        SqlWithArguments {
            sql: sql.to_owned(),
            args: vec![],
        }
    }

    async fn setup() -> (Database, Arc<Registry>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let db = Database::connect("default", "sqlite::memory:", 1)
            .await
            .unwrap();
        for ddl in [
            "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT, email TEXT, age INTEGER)",
            "CREATE TABLE authors (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT)",
            "CREATE TABLE books (id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT, author_id INTEGER)",
            "CREATE TABLE posts (id INTEGER PRIMARY KEY AUTOINCREMENT, title TEXT)",
            "CREATE TABLE tags (id INTEGER PRIMARY KEY AUTOINCREMENT, label TEXT)",
            "CREATE TABLE post_tags (id INTEGER PRIMARY KEY AUTOINCREMENT, post_id INTEGER, tag_id INTEGER, added_at TEXT)",
            "CREATE TABLE products (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT, category TEXT, price REAL)",
        ] {
            db.execute(&raw(ddl), None).await.unwrap();
        }
        (db, test_registry())
    }

    fn user(name: &str, email: &str, age: i64) -> Object {
        Object::new("User")
            .with("Name", name)
            .with("Email", email)
            .with("Age", age)
    }

    async fn seed_users(db: &Database, registry: &Arc<Registry>) {
        let qs = objects(db, registry, "User").unwrap();
        qs.bulk_create(vec![
            user("Jane", "jane@x", 30),
            user("Joe", "joe@x", 20),
            user("Max", "max@x", 40),
        ])
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_create_then_get_round_trips() {
        let (db, registry) = setup().await;
        let qs = objects(&db, &registry, "User").unwrap();

        let created = qs.create(user("Jane", "j@x", 30)).await.unwrap();
        let id = created.get("ID").unwrap().as_i64().unwrap();
        assert!(id > 0);

        let fetched = qs.filter("ID", id).get().await.unwrap();
        assert_eq!(fetched.get("Name"), created.get("Name"));
        assert_eq!(fetched.get("Email"), created.get("Email"));
        assert_eq!(fetched.get("Age"), created.get("Age"));
    }

    #[tokio::test]
    async fn test_builder_calls_do_not_mutate_the_receiver() {
        let (db, registry) = setup().await;
        seed_users(&db, &registry).await;

        let qs = objects(&db, &registry, "User").unwrap();
        let filtered = qs.filter("Age__gt", 25);
        assert_eq!(filtered.all().await.unwrap().len(), 2);
        // The original snapshot kept its empty filter list.
        assert_eq!(qs.all().await.unwrap().len(), 3);

        let ordered = qs.order_by(&["Age"]);
        let _ = ordered;
        let sql = {
            qs.all().await.unwrap();
            qs.latest_query().unwrap().sql
        };
        assert!(!sql.contains("ORDER BY"));
    }

    #[tokio::test]
    async fn test_fk_join_populates_related_object() {
        let (db, registry) = setup().await;
        let authors = objects(&db, &registry, "Author").unwrap();
        let jane = authors
            .create(Object::new("Author").with("Name", "Jane"))
            .await
            .unwrap();
        let jane_id = jane.get("ID").unwrap().clone();

        let books = objects(&db, &registry, "Book").unwrap();
        books
            .create(
                Object::new("Book")
                    .with("Title", "First")
                    .with("Author", jane_id.clone()),
            )
            .await
            .unwrap();
        let second = books
            .create(
                Object::new("Book")
                    .with("Title", "Second")
                    .with("Author", jane_id.clone()),
            )
            .await
            .unwrap();

        let fetched = books
            .select(&["*", "Author.*"])
            .filter("ID", second.get("ID").unwrap().clone())
            .get()
            .await
            .unwrap();
        assert_eq!(fetched.get("Title").unwrap().as_str(), Some("Second"));
        let author = fetched
            .relation("Author")
            .and_then(|r| r.as_single())
            .expect("author assigned");
        assert_eq!(author.object.get("Name").unwrap().as_str(), Some("Jane"));
    }

    #[tokio::test]
    async fn test_absent_fk_materializes_as_none() {
        let (db, registry) = setup().await;
        let books = objects(&db, &registry, "Book").unwrap();
        let orphan = books
            .create(Object::new("Book").with("Title", "Orphan").with("Author", ScalarValue::Null))
            .await
            .unwrap();

        let fetched = books
            .select(&["*", "Author.*"])
            .filter("ID", orphan.get("ID").unwrap().clone())
            .get()
            .await
            .unwrap();
        match fetched.relation("Author") {
            Some(crate::object::Related::Single(None)) => {}
            other => panic!("expected absent author, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reverse_fk_collects_children_in_first_seen_order() {
        let (db, registry) = setup().await;
        let authors = objects(&db, &registry, "Author").unwrap();
        let jane = authors
            .create(Object::new("Author").with("Name", "Jane"))
            .await
            .unwrap();
        let jane_id = jane.get("ID").unwrap().clone();
        let books = objects(&db, &registry, "Book").unwrap();
        for title in ["A", "B", "C"] {
            books
                .create(
                    Object::new("Book")
                        .with("Title", title)
                        .with("Author", jane_id.clone()),
                )
                .await
                .unwrap();
        }

        let fetched = authors
            .select(&["*", "BookSet.*"])
            .filter("ID", jane_id.clone())
            .order_by(&["BookSet.ID"])
            .get()
            .await
            .unwrap();
        let titles: Vec<_> = fetched
            .relation("BookSet")
            .unwrap()
            .as_many()
            .iter()
            .map(|r| r.object.get("Title").unwrap().as_str().unwrap().to_owned())
            .collect();
        assert_eq!(titles, vec!["A", "B", "C"]);

        // Three joined rows still collapse onto a single author.
        let all = authors
            .select(&["*", "BookSet.*"])
            .filter("ID", jane_id)
            .all()
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_many_to_many_carries_through_instances() {
        let (db, registry) = setup().await;
        db.execute(&raw("INSERT INTO posts (title) VALUES ('Hello')"), None)
            .await
            .unwrap();
        db.execute(&raw("INSERT INTO tags (label) VALUES ('a'), ('b')"), None)
            .await
            .unwrap();
        db.execute(
            &raw(
                "INSERT INTO post_tags (post_id, tag_id, added_at) VALUES \
                 (1, 1, '2023-01-02T03:04:05Z'), (1, 2, '2023-02-03T04:05:06Z')",
            ),
            None,
        )
        .await
        .unwrap();

        let posts = objects(&db, &registry, "Post").unwrap();
        let post = posts
            .select(&["*", "Tags.*"])
            .filter("ID", 1)
            .get()
            .await
            .unwrap();
        let tags = post.relation("Tags").unwrap().as_many();
        assert_eq!(tags.len(), 2);
        let labels: Vec<_> = tags
            .iter()
            .map(|t| t.object.get("Label").unwrap().as_str().unwrap().to_owned())
            .collect();
        assert_eq!(labels, vec!["a", "b"]);
        for tag in tags {
            let through = tag.through.as_ref().expect("through instance");
            assert!(matches!(
                through.get("AddedAt"),
                Some(ScalarValue::DateTime(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_filter_across_relation_plans_one_join() {
        let (db, registry) = setup().await;
        let authors = objects(&db, &registry, "Author").unwrap();
        let jane = authors
            .create(Object::new("Author").with("Name", "Jane"))
            .await
            .unwrap();
        let books = objects(&db, &registry, "Book").unwrap();
        books
            .create(
                Object::new("Book")
                    .with("Title", "Hers")
                    .with("Author", jane.get("ID").unwrap().clone()),
            )
            .await
            .unwrap();

        let qs = books
            .select(&["*", "Author.*"])
            .filter("Author.Name", "Jane");
        let found = qs.all().await.unwrap();
        assert_eq!(found.len(), 1);
        let sql = qs.latest_query().unwrap().sql;
        assert_eq!(sql.matches("LEFT JOIN").count(), 1);
    }

    #[tokio::test]
    async fn test_get_boundaries() {
        let (db, registry) = setup().await;
        seed_users(&db, &registry).await;
        let qs = objects(&db, &registry, "User").unwrap();

        assert!(matches!(qs.get().await, Err(Error::NoWhereClause)));
        assert!(matches!(
            qs.filter("ID", 999).get().await,
            Err(Error::NoRows)
        ));
        match qs.filter("Age__gt", 0).get().await {
            Err(Error::MultipleRows { found }) => assert_eq!(found, "3"),
            other => panic!("expected MultipleRows, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_limit_and_offset() {
        let (db, registry) = setup().await;
        seed_users(&db, &registry).await;
        let qs = objects(&db, &registry, "User").unwrap();

        assert_eq!(qs.limit(1).all().await.unwrap().len(), 1);
        let page = qs.order_by(&["Age"]).limit(2).offset(1).all().await.unwrap();
        let ages: Vec<_> = page
            .iter()
            .map(|u| u.get("Age").unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(ages, vec![30, 40]);
    }

    #[tokio::test]
    async fn test_count_matches_all() {
        let (db, registry) = setup().await;
        seed_users(&db, &registry).await;
        let qs = objects(&db, &registry, "User").unwrap().filter("Age__gte", 30);
        assert_eq!(qs.count().await.unwrap() as usize, qs.all().await.unwrap().len());
    }

    #[tokio::test]
    async fn test_reverse_twice_is_identity() {
        let (db, registry) = setup().await;
        seed_users(&db, &registry).await;
        let qs = objects(&db, &registry, "User").unwrap().order_by(&["-Age"]);

        let names = |objs: Vec<Object>| {
            objs.iter()
                .map(|o| o.get("Name").unwrap().as_str().unwrap().to_owned())
                .collect::<Vec<_>>()
        };
        let plain = names(qs.all().await.unwrap());
        assert_eq!(plain, vec!["Max", "Jane", "Joe"]);
        let twice = names(qs.reverse().reverse().all().await.unwrap());
        assert_eq!(plain, twice);
        let once = names(qs.reverse().all().await.unwrap());
        assert_eq!(once, vec!["Joe", "Jane", "Max"]);
    }

    #[tokio::test]
    async fn test_first_and_last() {
        let (db, registry) = setup().await;
        seed_users(&db, &registry).await;
        let qs = objects(&db, &registry, "User").unwrap();

        let first = qs.first().await.unwrap().unwrap();
        assert_eq!(first.get("Name").unwrap().as_str(), Some("Jane"));
        let last = qs.last().await.unwrap().unwrap();
        assert_eq!(last.get("Name").unwrap().as_str(), Some("Max"));
        let youngest = qs.order_by(&["Age"]).first().await.unwrap().unwrap();
        assert_eq!(youngest.get("Name").unwrap().as_str(), Some("Joe"));
    }

    #[tokio::test]
    async fn test_exists() {
        let (db, registry) = setup().await;
        seed_users(&db, &registry).await;
        let qs = objects(&db, &registry, "User").unwrap();
        assert!(qs.filter("Name", "Jane").exists().await.unwrap());
        assert!(!qs.filter("Name", "Nobody").exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_bulk_create_empty_is_a_no_op() {
        let (db, registry) = setup().await;
        let qs = objects(&db, &registry, "User").unwrap();
        let created = qs.bulk_create(vec![]).await.unwrap();
        assert!(created.is_empty());
        assert!(qs.latest_query().is_none());
    }

    #[tokio::test]
    async fn test_bulk_create_assigns_sequential_ids() {
        let (db, registry) = setup().await;
        let qs = objects(&db, &registry, "User").unwrap();
        let created = qs
            .bulk_create(vec![
                user("A", "a@x", 1),
                user("B", "b@x", 2),
                user("C", "c@x", 3),
            ])
            .await
            .unwrap();
        let ids: Vec<_> = created
            .iter()
            .map(|u| u.get("ID").unwrap().as_i64().unwrap())
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_aggregate_returns_exactly_the_requested_keys() {
        let (db, registry) = setup().await;
        seed_users(&db, &registry).await;
        let qs = objects(&db, &registry, "User").unwrap();
        let out = qs
            .aggregate(vec![("total", sum("Age")), ("count", count("*"))])
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out["total"], ScalarValue::I64(90));
        assert_eq!(out["count"], ScalarValue::I64(3));
    }

    #[tokio::test]
    async fn test_values_list() {
        let (db, registry) = setup().await;
        seed_users(&db, &registry).await;
        let qs = objects(&db, &registry, "User").unwrap().order_by(&["Age"]);
        let rows = qs.values_list(&["Name", "Age"]).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec![ScalarValue::from("Joe"), ScalarValue::I64(20)]);
    }

    #[tokio::test]
    async fn test_values_keys_by_dotted_path() {
        let (db, registry) = setup().await;
        seed_users(&db, &registry).await;
        let qs = objects(&db, &registry, "User").unwrap().order_by(&["Age"]);
        let rows = qs.values(&["Name"]).await.unwrap();
        assert_eq!(rows[0]["Name"], ScalarValue::from("Joe"));
    }

    #[tokio::test]
    async fn test_annotate_and_order_by_alias() {
        let (db, registry) = setup().await;
        seed_users(&db, &registry).await;
        let qs = objects(&db, &registry, "User")
            .unwrap()
            .annotate("older", f("Age").add(10i64))
            .order_by(&["-older"]);
        let objs = qs.all().await.unwrap();
        assert_eq!(
            objs[0].annotation("older"),
            Some(&ScalarValue::I64(50))
        );
        assert_eq!(objs[0].get("Name").unwrap().as_str(), Some("Max"));
    }

    #[tokio::test]
    async fn test_filter_q_or_combination() {
        let (db, registry) = setup().await;
        seed_users(&db, &registry).await;
        let qs = objects(&db, &registry, "User").unwrap();
        let found = qs
            .filter_q(crate::expr::q("Name", "Jane").or(crate::expr::q("Age__lt", 25)))
            .order_by(&["Age"])
            .all()
            .await
            .unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|u| u.get("Name").unwrap().as_str().unwrap().to_owned())
            .collect();
        assert_eq!(names, vec!["Joe", "Jane"]);
    }

    #[tokio::test]
    async fn test_update_with_expression() {
        let (db, registry) = setup().await;
        let qs = objects(&db, &registry, "Product").unwrap();
        qs.bulk_create(vec![
            Object::new("Product")
                .with("Name", "a")
                .with("Category", "sale")
                .with("Price", 10.0),
            Object::new("Product")
                .with("Name", "b")
                .with("Category", "sale")
                .with("Price", 20.0),
            Object::new("Product")
                .with("Name", "c")
                .with("Category", "new")
                .with("Price", 30.0),
        ])
        .await
        .unwrap();

        let affected = qs
            .filter("Category", "sale")
            .update(Object::new("Product"), vec![("Price", f("Price").mul(0.9))])
            .await
            .unwrap();
        assert_eq!(affected, 2);

        let prices = qs
            .order_by(&["ID"])
            .values_list(&["Price"])
            .await
            .unwrap();
        assert_eq!(
            prices,
            vec![
                vec![ScalarValue::F64(9.0)],
                vec![ScalarValue::F64(18.0)],
                vec![ScalarValue::F64(30.0)],
            ]
        );
    }

    #[tokio::test]
    async fn test_bulk_update_by_primary_key() {
        let (db, registry) = setup().await;
        seed_users(&db, &registry).await;
        let qs = objects(&db, &registry, "User").unwrap();
        let mut objs = qs.order_by(&["ID"]).all().await.unwrap();
        for obj in &mut objs {
            let age = obj.get("Age").unwrap().as_i64().unwrap();
            obj.set("Age", age + 1);
        }
        let affected = qs.bulk_update(objs, vec![]).await.unwrap();
        assert_eq!(affected, 3);

        let ages = qs.order_by(&["ID"]).values_list(&["Age"]).await.unwrap();
        assert_eq!(
            ages,
            vec![
                vec![ScalarValue::I64(31)],
                vec![ScalarValue::I64(21)],
                vec![ScalarValue::I64(41)],
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_with_objects() {
        let (db, registry) = setup().await;
        seed_users(&db, &registry).await;
        let qs = objects(&db, &registry, "User").unwrap();
        let joe = qs.filter("Name", "Joe").get().await.unwrap();
        let affected = qs.delete(std::slice::from_ref(&joe)).await.unwrap();
        assert_eq!(affected, 1);
        assert_eq!(qs.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_delete_without_where_is_refused() {
        let (db, registry) = setup().await;
        seed_users(&db, &registry).await;
        let qs = objects(&db, &registry, "User").unwrap();
        assert!(matches!(qs.delete(&[]).await, Err(Error::NoWhereClause)));
        assert_eq!(qs.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_get_or_create() {
        let (db, registry) = setup().await;
        let qs = objects(&db, &registry, "User").unwrap();
        let (obj, created) = qs
            .filter("Email", "j@x")
            .get_or_create(user("Jane", "j@x", 30))
            .await
            .unwrap();
        assert!(created);
        let (again, created) = qs
            .filter("Email", "j@x")
            .get_or_create(user("Jane", "j@x", 30))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(obj.get("ID"), again.get("ID"));
    }

    #[tokio::test]
    async fn test_hooks_run_around_create() {
        let (db, _) = setup().await;
        let mut registry = Registry::new();
        registry.register(ModelSchema::new(
            "User",
            "users",
            vec![
                FieldDef::new("ID", crate::schema::FieldType::I64).primary().auto(),
                FieldDef::new("Name", crate::schema::FieldType::Text),
                FieldDef::new("Email", crate::schema::FieldType::Text),
                FieldDef::new("Age", crate::schema::FieldType::I64),
            ],
        ));
        registry.register_hook(
            "User",
            HookKind::BeforeCreate,
            Box::new(|obj| {
                obj.set("Name", "hooked");
                Ok(())
            }),
        );
        let registry = Arc::new(registry);
        let qs = objects(&db, &registry, "User").unwrap();
        let created = qs.create(user("original", "h@x", 1)).await.unwrap();
        assert_eq!(created.get("Name").unwrap().as_str(), Some("hooked"));

        let fetched = qs
            .filter("ID", created.get("ID").unwrap().clone())
            .get()
            .await
            .unwrap();
        assert_eq!(fetched.get("Name").unwrap().as_str(), Some("hooked"));
    }

    #[tokio::test]
    async fn test_failing_hook_aborts_create() {
        let (db, _) = setup().await;
        let mut registry = Registry::new();
        registry.register(ModelSchema::new(
            "User",
            "users",
            vec![
                FieldDef::new("ID", crate::schema::FieldType::I64).primary().auto(),
                FieldDef::new("Name", crate::schema::FieldType::Text),
                FieldDef::new("Email", crate::schema::FieldType::Text),
                FieldDef::new("Age", crate::schema::FieldType::I64),
            ],
        ));
        registry.register_hook(
            "User",
            HookKind::BeforeCreate,
            Box::new(|_| anyhow::bail!("nope")),
        );
        let registry = Arc::new(registry);
        let qs = objects(&db, &registry, "User").unwrap();
        assert!(matches!(
            qs.create(user("x", "x@x", 1)).await,
            Err(Error::Hook { .. })
        ));
        assert_eq!(qs.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transaction_binding_via_context() {
        let (db, registry) = setup().await;
        let qs = objects(&db, &registry, "User").unwrap();

        let tx = db.begin().await.unwrap();
        let in_tx = qs.with_context(&tx);
        in_tx.create(user("Jane", "j@x", 30)).await.unwrap();
        assert_eq!(in_tx.count().await.unwrap(), 1);
        tx.rollback().await.unwrap();

        assert_eq!(qs.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_begin_transaction_is_not_reentrant() {
        let (db, registry) = setup().await;
        let qs = objects(&db, &registry, "User").unwrap();
        let in_tx = qs.begin_transaction().await.unwrap();
        assert!(matches!(
            in_tx.begin_transaction().await,
            Err(Error::TransactionStarted)
        ));
        in_tx.transaction().unwrap().rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_distinct_select() {
        let (db, registry) = setup().await;
        seed_users(&db, &registry).await;
        let qs = objects(&db, &registry, "User").unwrap().distinct();
        qs.all().await.unwrap();
        assert!(qs.latest_query().unwrap().sql.starts_with("SELECT DISTINCT"));
    }

    #[tokio::test]
    async fn test_select_argument_order_does_not_change_columns() {
        let (db, registry) = setup().await;
        seed_users(&db, &registry).await;
        let qs = objects(&db, &registry, "User").unwrap();
        let a = qs.select(&["Name", "Age"]);
        let b = qs.select(&["Age", "Name"]);
        a.all().await.unwrap();
        b.all().await.unwrap();
        let count_cols = |sql: &str| sql.matches(" AS ").count();
        assert_eq!(
            count_cols(&a.latest_query().unwrap().sql),
            count_cols(&b.latest_query().unwrap().sql)
        );
    }
}
