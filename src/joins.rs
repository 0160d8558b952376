// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! Join planning: one planner per relation kind, each emitting LEFT JOIN
//! definitions with stable dedup keys plus the projection groups that ride
//! on them.

use crate::alias::AliasGenerator;
use crate::errors::{Error, Result};
use crate::schema::{FieldDef, ModelSchema, Registry, RelationKind};
use std::collections::HashSet;
use std::fmt::Write;
use std::sync::Arc;

/// A table reference, optionally aliased.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            alias: None,
        }
    }

    pub fn aliased(name: &str, alias: &str) -> Self {
        Self {
            name: name.to_owned(),
            alias: Some(alias.to_owned()),
        }
    }

    /// The name this table is addressable under inside the statement.
    pub fn addressable(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// `table.column` reference, `table` being an addressable name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: &str, column: &str) -> Self {
        Self {
            table: table.to_owned(),
            column: column.to_owned(),
        }
    }
}

/// One join condition; `next` continues the list, combined with `AND`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinCond {
    pub left: ColumnRef,
    pub op: &'static str,
    pub right: ColumnRef,
    pub next: Option<Box<JoinCond>>,
}

impl JoinCond {
    pub fn eq(left: ColumnRef, right: ColumnRef) -> Self {
        Self {
            left,
            op: "=",
            right,
            next: None,
        }
    }

    /// Appends `next` to the end of the condition list (`AND`).
    pub fn and_then(mut self, next: JoinCond) -> Self {
        self.next = Some(Box::new(match self.next.take() {
            Some(tail) => tail.and_then(next),
            None => next,
        }));
        self
    }

    /// Canonical rendering of the whole condition list, used as the join
    /// dedup key.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        let mut cond = Some(self);
        while let Some(c) = cond {
            if !out.is_empty() {
                out.push_str(" AND ");
            }
            write!(
                out,
                "{}.{} {} {}.{}",
                c.left.table, c.left.column, c.op, c.right.table, c.right.column
            )
            .expect("formatting failed");
            cond = c.next.as_deref();
        }
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinType {
    Left,
}

impl JoinType {
    pub fn sql(&self) -> &'static str {
        match self {
            JoinType::Left => "LEFT JOIN",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinDef {
    pub ty: JoinType,
    pub table: TableRef,
    pub cond: JoinCond,
}

impl JoinDef {
    pub fn left(table: TableRef, cond: JoinCond) -> Self {
        Self {
            ty: JoinType::Left,
            table,
            cond,
        }
    }

    pub fn dedup_key(&self) -> String {
        self.cond.canonical()
    }
}

/// A logical column group in the projection: one table (the root, or a
/// relation hop) plus the concrete fields selected from it. Junction-table
/// columns ride along in `through`.
#[derive(Clone, Debug)]
pub struct FieldInfo {
    pub table: TableRef,
    /// The relation field that produced this hop; `None` for the root group.
    pub source_field: Option<FieldDef>,
    pub model: Arc<ModelSchema>,
    pub kind: Option<RelationKind>,
    /// Hop names leading to this group, empty for the root.
    pub chain: Vec<String>,
    /// Relation kind of each hop in `chain`.
    pub chain_kinds: Vec<RelationKind>,
    pub fields: Vec<FieldDef>,
    pub through: Option<Box<FieldInfo>>,
}

impl FieldInfo {
    /// The root projection group: the model's own table, no hops.
    pub fn root(model: Arc<ModelSchema>, fields: Vec<FieldDef>) -> Self {
        Self {
            table: TableRef::named(model.table()),
            source_field: None,
            model,
            kind: None,
            chain: vec![],
            chain_kinds: vec![],
            fields,
            through: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.source_field.is_none()
    }
}

/// One concrete column of the projection, in SELECT order.
#[derive(Clone, Debug)]
pub struct ProjectedCol<'a> {
    pub info_idx: usize,
    pub info: &'a FieldInfo,
    pub field: &'a FieldDef,
    /// Addressable table name the column is read from.
    pub table: &'a str,
    pub is_through: bool,
}

/// Flattens the projection groups into the ordered column list. The compiler
/// renders the SELECT list from this and the materializer scans rows against
/// it, so the two can never disagree on column order: for every group, the
/// junction-table columns come first, then the group's own fields.
pub fn projected_columns(infos: &[FieldInfo]) -> Vec<ProjectedCol<'_>> {
    let mut cols = vec![];
    for (info_idx, info) in infos.iter().enumerate() {
        if let Some(through) = &info.through {
            for field in &through.fields {
                cols.push(ProjectedCol {
                    info_idx,
                    info: through,
                    field,
                    table: through.table.addressable(),
                    is_through: true,
                });
            }
        }
        for field in &info.fields {
            cols.push(ProjectedCol {
                info_idx,
                info,
                field,
                table: info.table.addressable(),
                is_through: false,
            });
        }
    }
    cols
}

/// Inputs shared by the per-kind join planners.
pub struct PlanInput<'a> {
    pub registry: &'a Registry,
    pub parent_schema: &'a Arc<ModelSchema>,
    /// Addressable name of the parent table inside the statement.
    pub parent_table: &'a str,
    /// The relation field on the parent that produces this hop.
    pub parent_field: &'a FieldDef,
    /// Concrete target field to project; `None` with `expand_all` selects
    /// every projectable field.
    pub terminal: Option<&'a FieldDef>,
    pub chain: &'a [String],
    pub chain_kinds: &'a [RelationKind],
    pub target_alias: &'a str,
    pub expand_all: bool,
    /// Whether this hop is the path's last; only the last hop projects.
    pub project: bool,
}

/// Plans the joins for one relation hop, dispatching on the relation kind.
/// Duplicate joins (same canonical condition) are dropped from the returned
/// definitions but the projection group is returned regardless, so column
/// order stays aligned.
pub fn plan_relation(
    input: &PlanInput<'_>,
    aliases: &mut AliasGenerator,
    dedup: &mut HashSet<String>,
) -> Result<(Vec<FieldInfo>, Vec<JoinDef>)> {
    let relation = input
        .parent_field
        .relation
        .as_ref()
        .unwrap_or_else(|| panic!("field `{}` is not a relation", input.parent_field.name));
    match relation.kind {
        RelationKind::ManyToOne | RelationKind::OneToMany => plan_fk(input, dedup),
        RelationKind::OneToOne => {
            if relation.through.is_some() {
                plan_through(input, aliases, dedup)
            } else {
                plan_fk(input, dedup)
            }
        }
        RelationKind::ManyToMany => plan_through(input, aliases, dedup),
    }
}

fn target_schema(input: &PlanInput<'_>) -> (Arc<ModelSchema>, RelationKind) {
    let relation = input.parent_field.relation.as_ref().unwrap();
    (input.registry.expect(&relation.target), relation.kind)
}

/// Column on the parent side of the hop: the relation field's own column
/// when it has one (forward FK), the parent's primary otherwise.
fn parent_column<'a>(input: &'a PlanInput<'_>) -> Result<&'a str> {
    if input.parent_field.has_column() {
        return Ok(&input.parent_field.column);
    }
    input
        .parent_schema
        .primary_field()
        .map(|f| f.column.as_str())
        .ok_or_else(|| Error::FieldNotFound {
            model: input.parent_schema.name().to_owned(),
            field: "<primary>".to_owned(),
        })
}

/// Column on the target side: the relation's explicit field if given, else
/// the target's primary.
fn target_column(input: &PlanInput<'_>, target: &ModelSchema) -> Result<String> {
    let relation = input.parent_field.relation.as_ref().unwrap();
    let field = match &relation.target_field {
        Some(name) => target.get_field(name).ok_or_else(|| Error::FieldNotFound {
            model: target.name().to_owned(),
            field: name.clone(),
        })?,
        None => target
            .primary_field()
            .ok_or_else(|| Error::FieldNotFound {
                model: target.name().to_owned(),
                field: "<primary>".to_owned(),
            })?,
    };
    Ok(field.column.clone())
}

fn projected_fields(input: &PlanInput<'_>, target: &ModelSchema) -> Vec<FieldDef> {
    if !input.project {
        return vec![];
    }
    if input.expand_all {
        target.local_fields().cloned().collect()
    } else {
        input.terminal.cloned().into_iter().collect()
    }
}

fn push_join(joins: &mut Vec<JoinDef>, dedup: &mut HashSet<String>, join: JoinDef) {
    if dedup.insert(join.dedup_key()) {
        joins.push(join);
    }
}

/// Forward FK, reverse FK, and one-to-one without a junction table: a single
/// LEFT JOIN on column equality.
fn plan_fk(
    input: &PlanInput<'_>,
    dedup: &mut HashSet<String>,
) -> Result<(Vec<FieldInfo>, Vec<JoinDef>)> {
    let (target, kind) = target_schema(input);
    let relation = input.parent_field.relation.as_ref().unwrap();

    let cond = match &relation.target_clause {
        Some(custom) => custom(input.parent_table, input.target_alias),
        None => JoinCond::eq(
            ColumnRef::new(input.parent_table, parent_column(input)?),
            ColumnRef::new(input.target_alias, &target_column(input, &target)?),
        ),
    };

    let mut joins = vec![];
    push_join(
        &mut joins,
        dedup,
        JoinDef::left(TableRef::aliased(target.table(), input.target_alias), cond),
    );

    let info = FieldInfo {
        table: TableRef::aliased(target.table(), input.target_alias),
        source_field: Some(input.parent_field.clone()),
        model: target.clone(),
        kind: Some(kind),
        chain: input.chain.to_vec(),
        chain_kinds: input.chain_kinds.to_vec(),
        fields: projected_fields(input, &target),
        through: None,
    };
    Ok((vec![info], joins))
}

/// Many-to-many, and one-to-one across a junction table: two LEFT JOINs, the
/// junction first. The junction's columns are attached to the target group
/// so they get projected alongside.
fn plan_through(
    input: &PlanInput<'_>,
    _aliases: &mut AliasGenerator,
    dedup: &mut HashSet<String>,
) -> Result<(Vec<FieldInfo>, Vec<JoinDef>)> {
    let (target, kind) = target_schema(input);
    let relation = input.parent_field.relation.as_ref().unwrap();
    let through = relation.through.as_ref().unwrap();
    let through_schema = input.registry.expect(&through.model);
    let through_alias = format!("{}_through", input.target_alias);

    let mut joins = vec![];
    push_join(
        &mut joins,
        dedup,
        JoinDef::left(
            TableRef::aliased(through_schema.table(), &through_alias),
            JoinCond::eq(
                ColumnRef::new(input.parent_table, parent_column(input)?),
                ColumnRef::new(&through_alias, &through.source_column),
            ),
        ),
    );

    let target_cond = match &relation.target_clause {
        Some(custom) => custom(&through_alias, input.target_alias),
        None => JoinCond::eq(
            ColumnRef::new(&through_alias, &through.target_column),
            ColumnRef::new(input.target_alias, &target_column(input, &target)?),
        ),
    };
    push_join(
        &mut joins,
        dedup,
        JoinDef::left(
            TableRef::aliased(target.table(), input.target_alias),
            target_cond,
        ),
    );

    let through_info = FieldInfo {
        table: TableRef::aliased(through_schema.table(), &through_alias),
        source_field: Some(input.parent_field.clone()),
        model: through_schema.clone(),
        kind: Some(kind),
        chain: input.chain.to_vec(),
        chain_kinds: input.chain_kinds.to_vec(),
        fields: if input.project {
            through_schema.local_fields().cloned().collect()
        } else {
            vec![]
        },
        through: None,
    };

    let info = FieldInfo {
        table: TableRef::aliased(target.table(), input.target_alias),
        source_field: Some(input.parent_field.clone()),
        model: target.clone(),
        kind: Some(kind),
        chain: input.chain.to_vec(),
        chain_kinds: input.chain_kinds.to_vec(),
        fields: projected_fields(input, &target),
        through: Some(Box::new(through_info)),
    };
    Ok((vec![info], joins))
}
