// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use crate::compiler::Clause;
use crate::exec::{Database, TxHandle};
use crate::object::Object;
use anyhow::Result as AnyResult;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Storage type of a concrete column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldType {
    Bool,
    I64,
    F64,
    Text,
    Bytes,
    DateTime,
}

/// How a relation field links two models.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelationKind {
    /// Forward foreign key: the column lives on this model.
    ManyToOne,
    /// Reverse foreign key: the column lives on the target model.
    OneToMany,
    /// One-to-one, optionally crossing a junction table.
    OneToOne,
    /// Many-to-many, always crossing a junction table.
    ManyToMany,
}

impl RelationKind {
    /// Relations that may contribute more than one row per parent.
    pub fn is_multi_valued(&self) -> bool {
        matches!(self, RelationKind::OneToMany | RelationKind::ManyToMany)
    }
}

/// Junction-table descriptor for relations that cross one.
#[derive(Clone, Debug)]
pub struct Through {
    /// Registry name of the junction model.
    pub model: String,
    /// Column on the junction table referencing the source side.
    pub source_column: String,
    /// Column on the junction table referencing the target side.
    pub target_column: String,
}

/// Hook that substitutes the default equality join condition, for
/// polymorphic or soft-deleted relations.
pub type TargetClauseFn =
    Arc<dyn Fn(&str, &str) -> crate::joins::JoinCond + Send + Sync>;

/// Relation descriptor attached to a field. Targets are resolved by registry
/// name, never by reference, so cyclic model graphs are representable.
#[derive(Clone)]
pub struct Relation {
    pub kind: RelationKind,
    /// Registry name of the target model.
    pub target: String,
    /// Explicit target field name; the target's primary field when absent.
    pub target_field: Option<String>,
    pub through: Option<Through>,
    /// Optional custom join-condition hook; receives the parent and target
    /// table aliases.
    pub target_clause: Option<TargetClauseFn>,
}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("kind", &self.kind)
            .field("target", &self.target)
            .field("target_field", &self.target_field)
            .field("through", &self.through)
            .field("target_clause", &self.target_clause.as_ref().map(|_| "fn"))
            .finish()
    }
}

impl Relation {
    pub fn new(kind: RelationKind, target: &str) -> Self {
        Self {
            kind,
            target: target.to_owned(),
            target_field: None,
            through: None,
            target_clause: None,
        }
    }

    pub fn with_target_field(mut self, field: &str) -> Self {
        self.target_field = Some(field.to_owned());
        self
    }

    pub fn with_through(mut self, model: &str, source_column: &str, target_column: &str) -> Self {
        self.through = Some(Through {
            model: model.to_owned(),
            source_column: source_column.to_owned(),
            target_column: target_column.to_owned(),
        });
        self
    }

    pub fn with_target_clause(mut self, f: TargetClauseFn) -> Self {
        self.target_clause = Some(f);
        self
    }
}

/// One declared field of a model.
#[derive(Clone, Debug)]
pub struct FieldDef {
    pub name: String,
    pub column: String,
    pub ty: FieldType,
    pub primary: bool,
    pub allow_null: bool,
    pub allow_edit: bool,
    pub auto_increment: bool,
    pub unique: bool,
    pub relation: Option<Relation>,
}

impl FieldDef {
    pub fn new(name: &str, ty: FieldType) -> Self {
        Self {
            name: name.to_owned(),
            column: name.to_lowercase(),
            ty,
            primary: false,
            allow_null: false,
            allow_edit: true,
            auto_increment: false,
            unique: false,
            relation: None,
        }
    }

    pub fn with_column(mut self, column: &str) -> Self {
        self.column = column.to_owned();
        self
    }

    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    pub fn auto(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.allow_null = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.allow_edit = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_relation(mut self, relation: Relation) -> Self {
        self.relation = Some(relation);
        self
    }

    /// Whether the field is backed by a column on its own table. Reverse and
    /// junction-crossing relations live entirely on the other side.
    pub fn has_column(&self) -> bool {
        match &self.relation {
            None => true,
            Some(r) => match r.kind {
                RelationKind::ManyToOne => true,
                RelationKind::OneToOne => r.through.is_none(),
                RelationKind::OneToMany | RelationKind::ManyToMany => false,
            },
        }
    }

    pub fn is_relation(&self) -> bool {
        self.relation.is_some()
    }
}

/// Schema of one registered model: the shape the query-set layer consumes.
/// How a schema is produced (codegen, hand-written describe methods) is the
/// caller's business.
#[derive(Debug)]
pub struct ModelSchema {
    name: String,
    table: String,
    fields: Vec<FieldDef>,
    unique_together: Vec<Vec<String>>,
}

impl ModelSchema {
    pub fn new(name: &str, table: &str, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.to_owned(),
            table: table.to_owned(),
            fields,
            unique_together: vec![],
        }
    }

    pub fn with_unique_together(mut self, fields: &[&str]) -> Self {
        self.unique_together
            .push(fields.iter().map(|f| (*f).to_owned()).collect());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn primary_field(&self) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.primary)
    }

    pub fn all_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter()
    }

    /// Fields backed by a column on this model's table, in declaration order.
    pub fn local_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.has_column())
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.get_field(name).is_some()
    }

    pub fn unique_together(&self) -> &[Vec<String>] {
        &self.unique_together
    }
}

/// A model-side mutation hook. Hooks run around create/update/save and after
/// query materialization; an error aborts the surrounding operation.
pub type HookFn = Box<dyn Fn(&mut Object) -> AnyResult<()> + Send + Sync>;

/// A model-side saver; when registered, `Create` delegates to it unless the
/// query set opted out with `explicit_save`. Runs inside a core-owned
/// transaction, handed in so the saver can participate.
pub type SaveFn = Box<
    dyn for<'a> Fn(
            &'a Database,
            Option<&'a TxHandle>,
            &'a mut Object,
        ) -> BoxFuture<'a, AnyResult<()>>
        + Send
        + Sync,
>;

/// Per-model unique-key policy consulted during row deduplication.
pub type UniqueKeyFn = Box<dyn Fn(&Object) -> Option<String> + Send + Sync>;

/// Per-model write-back identity policy: produces a clause identifying one
/// object when it has no usable primary key.
pub type ClauseFn = Box<dyn Fn(&Object) -> Option<Clause> + Send + Sync>;

/// Save-signal observer.
pub type SignalFn = Box<dyn Fn(&Object) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HookKind {
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeSave,
    AfterSave,
    AfterQuery,
}

impl HookKind {
    pub fn label(&self) -> &'static str {
        match self {
            HookKind::BeforeCreate => "before-create",
            HookKind::AfterCreate => "after-create",
            HookKind::BeforeUpdate => "before-update",
            HookKind::AfterUpdate => "after-update",
            HookKind::BeforeSave => "before-save",
            HookKind::AfterSave => "after-save",
            HookKind::AfterQuery => "after-query",
        }
    }
}

/// Registry of model schemas plus everything registered against them: hooks,
/// savers, unique-key and identity policies, and save signals.
#[derive(Default)]
pub struct Registry {
    models: HashMap<String, Arc<ModelSchema>>,
    hooks: HashMap<(String, HookKind), Vec<HookFn>>,
    savers: HashMap<String, SaveFn>,
    unique_key_fns: HashMap<String, UniqueKeyFn>,
    clause_fns: HashMap<String, ClauseFn>,
    pre_save: Vec<SignalFn>,
    post_save: Vec<SignalFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: ModelSchema) -> Arc<ModelSchema> {
        let schema = Arc::new(schema);
        self.models.insert(schema.name().to_owned(), schema.clone());
        schema
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<ModelSchema>> {
        self.models.get(name).cloned()
    }

    /// Looks a model up, panicking on an unknown name. Referencing an
    /// unregistered model is a schema bug the caller must fix.
    pub fn expect(&self, name: &str) -> Arc<ModelSchema> {
        self.lookup(name)
            .unwrap_or_else(|| panic!("model `{name}` is not registered"))
    }

    pub fn register_hook(&mut self, model: &str, kind: HookKind, hook: HookFn) {
        self.hooks
            .entry((model.to_owned(), kind))
            .or_default()
            .push(hook);
    }

    pub fn hooks(&self, model: &str, kind: HookKind) -> &[HookFn] {
        self.hooks
            .get(&(model.to_owned(), kind))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn register_saver(&mut self, model: &str, saver: SaveFn) {
        self.savers.insert(model.to_owned(), saver);
    }

    pub fn saver(&self, model: &str) -> Option<&SaveFn> {
        self.savers.get(model)
    }

    pub fn register_unique_key_fn(&mut self, model: &str, f: UniqueKeyFn) {
        self.unique_key_fns.insert(model.to_owned(), f);
    }

    pub fn unique_key_fn(&self, model: &str) -> Option<&UniqueKeyFn> {
        self.unique_key_fns.get(model)
    }

    pub fn register_clause_fn(&mut self, model: &str, f: ClauseFn) {
        self.clause_fns.insert(model.to_owned(), f);
    }

    pub fn clause_fn(&self, model: &str) -> Option<&ClauseFn> {
        self.clause_fns.get(model)
    }

    pub fn on_pre_save(&mut self, f: SignalFn) {
        self.pre_save.push(f);
    }

    pub fn on_post_save(&mut self, f: SignalFn) {
        self.post_save.push(f);
    }

    pub fn emit_pre_save(&self, obj: &Object) {
        for f in &self.pre_save {
            f(obj);
        }
    }

    pub fn emit_post_save(&self, obj: &Object) {
        for f in &self.post_save {
            f(obj);
        }
    }
}
