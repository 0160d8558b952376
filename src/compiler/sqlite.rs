// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use super::Dialect;

/// SQLite: `LIKE` is case-insensitive for ASCII, so the case-insensitive
/// lookups use it directly with an explicit escape character instead of
/// wrapping in `LOWER(...)`. No `FOR UPDATE` (the whole database locks).
pub struct Sqlite;

impl Dialect for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn lower_for_case_insensitive(&self) -> bool {
        false
    }

    fn like_escape_suffix(&self) -> &'static str {
        " ESCAPE '\\'"
    }

    fn supports_for_update(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{write_expr, Clause, Compiler, LhsRef, Lookup, Returning, SelectQuery};
    use crate::joins::{ColumnRef, FieldInfo};
    use crate::schema::{FieldDef, FieldType, ModelSchema};
    use crate::value::ScalarValue;
    use indexmap::IndexMap;
    use std::sync::Arc;

    #[test]
    fn test_icontains_uses_like_with_escape() {
        let schema = Arc::new(ModelSchema::new(
            "User",
            "users",
            vec![
                FieldDef::new("ID", FieldType::I64).primary().auto(),
                FieldDef::new("Name", FieldType::Text),
            ],
        ));
        let infos = vec![FieldInfo::root(
            schema.clone(),
            schema.local_fields().cloned().collect(),
        )];
        let annotations = IndexMap::new();
        let where_ = vec![Clause::Lookup {
            lhs: LhsRef::Column(ColumnRef::new("users", "name")),
            lookup: Lookup::IContains,
            values: vec![ScalarValue::from("a_b")],
        }];
        let compiler = Compiler::new(Box::new(Sqlite), Returning::LastInsertId);
        let q = compiler
            .build_select(&SelectQuery {
                table: "users",
                infos: &infos,
                annotations: &annotations,
                joins: &[],
                where_: &where_,
                group_by: &[],
                having: &[],
                order_by: &[],
                limit: 1000,
                offset: 0,
                distinct: false,
                for_update: true,
            })
            .unwrap();
        assert!(q
            .sql
            .contains("\"users\".\"name\" LIKE '%' || ? || '%' ESCAPE '\\'"));
        // `_` in the needle arrives escaped.
        assert_eq!(q.args[0], ScalarValue::from("a\\_b"));
        // No FOR UPDATE on sqlite even with the flag set.
        assert!(!q.sql.contains("FOR UPDATE"));
    }

    #[test]
    fn test_expr_rendering_is_dialect_neutral() {
        let mut w = crate::compiler::SqlWriter::new(&Sqlite);
        let expr = crate::expr::Expr::Column(ColumnRef::new("t", "price")).mul(0.9);
        write_expr(&mut w, &expr);
        let out = w.finish();
        assert_eq!(out.sql, "(\"t\".\"price\" * ?)");
        assert_eq!(out.args, vec![ScalarValue::F64(0.9)]);
    }
}
