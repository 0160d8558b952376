// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use super::{Dialect, SqlWriter};
use crate::schema::FieldType;
use crate::value::ScalarValue;

/// PostgreSQL: `$n` placeholders, native regex operators, `RETURNING`, and
/// single-statement bulk updates through `FROM (VALUES ...)`.
pub struct Postgres;

impl Dialect for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    /// Rewrites `?` into `$1, $2, ...`, skipping string literals.
    fn rebind(&self, sql: String) -> String {
        let mut out = String::with_capacity(sql.len() + 8);
        let mut n = 0usize;
        let mut in_literal = false;
        for c in sql.chars() {
            match c {
                '\'' => {
                    in_literal = !in_literal;
                    out.push(c);
                }
                '?' if !in_literal => {
                    n += 1;
                    out.push('$');
                    out.push_str(&n.to_string());
                }
                _ => out.push(c),
            }
        }
        out
    }

    fn write_regex(&self, w: &mut SqlWriter<'_>, lhs: &str, ci: bool, value: ScalarValue) {
        w.write_str(lhs);
        w.write_str(if ci { " ~* " } else { " ~ " });
        w.push_arg(value);
    }

    fn insert_returning_pk(&self) -> bool {
        true
    }

    fn update_from_values(&self) -> bool {
        true
    }

    fn cast_for(&self, ty: FieldType) -> &'static str {
        match ty {
            FieldType::Bool => "::BOOLEAN",
            FieldType::I64 => "::BIGINT",
            FieldType::F64 => "::DOUBLE PRECISION",
            FieldType::Text => "::TEXT",
            FieldType::Bytes => "::BYTEA",
            FieldType::DateTime => "::TEXT",
        }
    }
}
