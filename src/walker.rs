// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! Dotted field-path resolution: `"Author.Books.Title"` walks relation hops
//! from the root model, assigning a stable table alias to every hop.

use crate::alias::AliasGenerator;
use crate::errors::{Error, Result};
use crate::schema::{FieldDef, ModelSchema, Registry, RelationKind};
use std::sync::Arc;

/// Outcome of resolving one dotted path against a root model.
#[derive(Clone, Debug)]
pub struct PathInfo {
    /// Model the terminal field lives on (the root when no hop was taken).
    pub model: Arc<ModelSchema>,
    /// Model one hop before `model`; `None` at the root.
    pub parent: Option<Arc<ModelSchema>>,
    /// The resolved terminal field; `None` for `"*"` and `"<rel>.*"`.
    pub terminal: Option<FieldDef>,
    /// Relation hop names crossed on the way, in order.
    pub chain: Vec<String>,
    /// Relation kind of each hop in `chain`.
    pub chain_kinds: Vec<RelationKind>,
    /// The relation field definition of each hop, on its parent model.
    pub hop_fields: Vec<FieldDef>,
    /// Target model of each hop in `chain`.
    pub hop_models: Vec<Arc<ModelSchema>>,
    /// Table alias assigned to each hop in `chain`.
    pub aliases: Vec<String>,
    /// Whether any hop was taken.
    pub is_related: bool,
    /// Whether the path ended in `"*"`.
    pub expand_all: bool,
}

impl PathInfo {
    pub fn terminal_is_relation(&self) -> bool {
        self.terminal
            .as_ref()
            .map(|f| f.is_relation())
            .unwrap_or(false)
    }
}

/// Resolves `path` against `root`. Every non-terminal segment must name a
/// relation field; the walker advances to its target model and binds a table
/// alias that stays stable for the same `(root, dotted-prefix)` pair.
pub fn walk(
    registry: &Registry,
    root: &Arc<ModelSchema>,
    path: &str,
    aliases: &mut AliasGenerator,
) -> Result<PathInfo> {
    if path == "*" {
        return Ok(PathInfo {
            model: root.clone(),
            parent: None,
            terminal: None,
            chain: vec![],
            chain_kinds: vec![],
            hop_fields: vec![],
            hop_models: vec![],
            aliases: vec![],
            is_related: false,
            expand_all: true,
        });
    }

    let mut segments: Vec<&str> = path.split('.').collect();
    let expand_all = segments.last() == Some(&"*");
    if expand_all {
        segments.pop();
    }

    let mut current = root.clone();
    let mut parent: Option<Arc<ModelSchema>> = None;
    let mut chain = vec![];
    let mut chain_kinds = vec![];
    let mut hop_fields = vec![];
    let mut hop_models = vec![];
    let mut hop_aliases = vec![];
    let mut terminal = None;

    for (i, segment) in segments.iter().enumerate() {
        let last = i == segments.len() - 1;
        let field = current
            .get_field(segment)
            .ok_or_else(|| Error::FieldNotFound {
                model: current.name().to_owned(),
                field: (*segment).to_owned(),
            })?
            .clone();

        // A terminal non-relation segment is the projected field; everything
        // before it must cross a relation.
        if last && !expand_all && !field.is_relation() {
            terminal = Some(field);
            break;
        }

        let relation = field.relation.as_ref().ok_or_else(|| Error::TypeMismatch {
            model: current.name().to_owned(),
            field: (*segment).to_owned(),
            detail: "segment is not a relation field".to_owned(),
        })?;

        let target = registry.expect(&relation.target);
        chain.push((*segment).to_owned());
        chain_kinds.push(relation.kind);
        hop_fields.push(field.clone());
        hop_models.push(target.clone());
        let prefix = format!("{}.{}", root.name(), chain.join("."));
        hop_aliases.push(aliases.table_alias(target.table(), &prefix));

        parent = Some(current);
        current = target;

        if last && !expand_all {
            // The path ends on the relation itself; the terminal is the
            // relation field, resolved but not expanded.
            terminal = Some(field);
        }
    }

    Ok(PathInfo {
        model: current,
        parent,
        terminal,
        is_related: !chain.is_empty(),
        chain,
        chain_kinds,
        hop_fields,
        hop_models,
        aliases: hop_aliases,
        expand_all,
    })
}
