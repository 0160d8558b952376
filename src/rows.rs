// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! Row materialization: flat driver rows become a tree of objects. Repeated
//! parent rows introduced by multi-valued joins collapse onto one object per
//! unique key, children keep first-seen order, and junction-table rows ride
//! along as through-instances.

use crate::errors::{Error, Result};
use crate::exec::{decode_any, decode_field};
use crate::joins::{projected_columns, FieldInfo};
use crate::object::{Object, Related, RelatedObject};
use crate::schema::{ModelSchema, Registry, RelationKind};
use crate::value::ScalarValue;
use indexmap::IndexMap;
use sqlx::any::AnyRow;
use std::collections::HashMap;
use std::sync::Arc;

/// One level of the intermediate tree: the instance, its junction row, and
/// its child buckets keyed by hop name.
#[derive(Debug)]
struct Node {
    object: Object,
    through: Option<Object>,
    relations: IndexMap<String, Bucket>,
}

impl Node {
    fn new(object: Object, through: Option<Object>) -> Self {
        Self {
            object,
            through,
            relations: IndexMap::new(),
        }
    }
}

/// Children of one relation hop, insertion-ordered and deduplicated by the
/// child's primary key.
#[derive(Debug)]
struct Bucket {
    kind: RelationKind,
    children: IndexMap<String, Node>,
}

/// Resolves the model of every hop along a chain.
fn chain_models(
    registry: &Registry,
    root: &Arc<ModelSchema>,
    chain: &[String],
) -> Vec<Arc<ModelSchema>> {
    let mut models = vec![];
    let mut current = root.clone();
    for hop in chain {
        let field = current
            .get_field(hop)
            .unwrap_or_else(|| panic!("model `{}` has no field `{hop}`", current.name()));
        let relation = field
            .relation
            .as_ref()
            .unwrap_or_else(|| panic!("field `{hop}` is not a relation"));
        current = registry.expect(&relation.target);
        models.push(current.clone());
    }
    models
}

/// Computes the unique key identifying a scanned root row: its primary key
/// when non-zero, else the model's registered key policy, else a key derived
/// from unique / unique-together fields. With no multi-valued relation in
/// the query a synthetic per-row key is allowed — it deliberately makes
/// every row distinct, suppressing deduplication entirely.
pub(crate) fn unique_key_for(
    registry: &Registry,
    schema: &ModelSchema,
    obj: &Object,
    row_index: usize,
    has_multi_valued: bool,
) -> Result<String> {
    let pk = obj.primary_value(schema);
    if !pk.is_zero() {
        return Ok(pk.key_part());
    }
    if let Some(f) = registry.unique_key_fn(schema.name()) {
        if let Some(key) = f(obj) {
            return Ok(key);
        }
    }
    for field in schema.all_fields().filter(|f| f.unique && !f.primary) {
        if let Some(value) = obj.get(&field.name) {
            if !value.is_zero() {
                return Ok(value.key_part());
            }
        }
    }
    for set in schema.unique_together() {
        let values: Vec<_> = set.iter().filter_map(|name| obj.get(name)).collect();
        if values.len() == set.len() && values.iter().any(|v| !v.is_zero()) {
            return Ok(values
                .iter()
                .map(|v| v.key_part())
                .collect::<Vec<_>>()
                .join(":"));
        }
    }
    if !has_multi_valued {
        return Ok((row_index + 1).to_string());
    }
    Err(Error::NoUniqueKey(schema.name().to_owned()))
}

fn chain_key(chain: &[String], depth: usize) -> String {
    chain[..depth].join(".")
}

/// Materializes driver rows into deduplicated object trees.
pub fn materialize_rows(
    registry: &Registry,
    schema: &Arc<ModelSchema>,
    infos: &[FieldInfo],
    annotation_aliases: &[String],
    rows: &[AnyRow],
) -> Result<Vec<Object>> {
    let cols = projected_columns(infos);
    let has_multi_valued = infos
        .iter()
        .any(|i| i.chain_kinds.iter().any(|k| k.is_multi_valued()));

    // Chains seen in the projection, with their hop models, shortest first
    // so parents merge before descendants.
    let mut chains: Vec<(&FieldInfo, Vec<Arc<ModelSchema>>)> = vec![];
    for info in infos.iter().filter(|i| !i.is_root()) {
        if chains
            .iter()
            .any(|(seen, _)| seen.chain == info.chain)
        {
            continue;
        }
        let models = chain_models(registry, schema, &info.chain);
        chains.push((info, models));
    }
    chains.sort_by_key(|(info, _)| info.chain.len());

    let mut roots: IndexMap<String, Node> = IndexMap::new();

    for (row_index, row) in rows.iter().enumerate() {
        // Phase 2: scan the row into fresh instances, one per chain prefix.
        let mut root = Object::new(schema.name());
        let mut instances: HashMap<String, Object> = HashMap::new();
        let mut throughs: HashMap<String, Object> = HashMap::new();

        for (idx, col) in cols.iter().enumerate() {
            if col.is_through {
                let key = chain_key(&col.info.chain, col.info.chain.len());
                let through = throughs
                    .entry(key)
                    .or_insert_with(|| Object::new(col.info.model.name()));
                let value = decode_field(row, idx, col.field, col.info.model.name())?;
                through.set(&col.field.name, value);
            } else if col.info.is_root() {
                let value = decode_field(row, idx, col.field, schema.name())?;
                root.set(&col.field.name, value);
            } else {
                let key = chain_key(&col.info.chain, col.info.chain.len());
                let instance = instances
                    .entry(key)
                    .or_insert_with(|| Object::new(col.info.model.name()));
                let value = decode_field(row, idx, col.field, col.info.model.name())?;
                instance.set(&col.field.name, value);
            }
        }
        for (i, alias) in annotation_aliases.iter().enumerate() {
            let value = decode_any(row, cols.len() + i);
            root.set_annotation(alias, value);
        }

        // Phase 3: merge into the tree, deduplicating by unique key.
        let key = unique_key_for(registry, schema, &root, row_index, has_multi_valued)?;
        let root_node = roots
            .entry(key)
            .or_insert_with(|| Node::new(root, None));

        for (info, models) in &chains {
            let mut node = &mut *root_node;
            for depth in 1..=info.chain.len() {
                let hop = &info.chain[depth - 1];
                let kind = info.chain_kinds[depth - 1];
                let hop_model = &models[depth - 1];
                let prefix = chain_key(&info.chain, depth);

                let instance = instances.get(&prefix).cloned();
                let pk = instance
                    .as_ref()
                    .map(|i| i.primary_value(hop_model))
                    .unwrap_or(ScalarValue::Null);

                if pk.is_zero() {
                    // A zero key on a single-valued hop is a legitimately
                    // absent relation: record the empty bucket so the field
                    // is assigned nil. Multi-valued hops just vanish.
                    if !kind.is_multi_valued() {
                        node.relations.entry(hop.clone()).or_insert_with(|| Bucket {
                            kind,
                            children: IndexMap::new(),
                        });
                    }
                    break;
                }

                let bucket = node.relations.entry(hop.clone()).or_insert_with(|| Bucket {
                    kind,
                    children: IndexMap::new(),
                });
                let child_key = pk.key_part();
                let child = bucket.children.entry(child_key).or_insert_with(|| {
                    Node::new(
                        instance.unwrap_or_else(|| Object::new(hop_model.name())),
                        throughs.get(&prefix).cloned(),
                    )
                });
                node = child;
            }
        }
    }

    // Phase 4: assignment, depth first.
    Ok(roots
        .into_values()
        .map(|node| assemble(registry, schema, node))
        .collect())
}

fn assemble(registry: &Registry, schema: &Arc<ModelSchema>, node: Node) -> Object {
    let Node {
        mut object,
        relations,
        ..
    } = node;
    for (hop, bucket) in relations {
        let child_schema = schema
            .get_field(&hop)
            .and_then(|f| f.relation.as_ref())
            .map(|r| registry.expect(&r.target))
            .unwrap_or_else(|| panic!("model `{}` has no relation `{hop}`", schema.name()));

        let children: Vec<RelatedObject> = bucket
            .children
            .into_values()
            .map(|child| {
                let through = child.through.clone();
                let object = assemble(registry, &child_schema, child);
                RelatedObject { object, through }
            })
            .collect();

        match bucket.kind {
            RelationKind::ManyToOne | RelationKind::OneToOne => {
                assert!(
                    children.len() <= 1,
                    "single-valued relation `{hop}` produced {} children",
                    children.len()
                );
                object.set_relation(&hop, Related::Single(children.into_iter().next().map(Box::new)));
            }
            RelationKind::OneToMany | RelationKind::ManyToMany => {
                object.set_relation(&hop, Related::Many(children));
            }
        }
    }
    object
}
