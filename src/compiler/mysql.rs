// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use super::Dialect;

/// MySQL: backtick quoting, `CONCAT` for patterns, and per-row inserts so
/// each row's id can be read from its own statement result.
pub struct MySql;

impl Dialect for MySql {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_char(&self) -> char {
        '`'
    }

    fn concat(&self, parts: &[String]) -> String {
        format!("CONCAT({})", parts.join(", "))
    }

    fn insert_per_row(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{Compiler, InsertExec, Returning};
    use crate::object::Object;
    use crate::schema::{FieldDef, FieldType, ModelSchema};

    fn user_schema() -> ModelSchema {
        ModelSchema::new(
            "User",
            "users",
            vec![
                FieldDef::new("ID", FieldType::I64).primary().auto(),
                FieldDef::new("Name", FieldType::Text),
            ],
        )
    }

    #[test]
    fn test_insert_is_per_row() {
        let compiler = Compiler::new(Box::new(MySql), Returning::LastInsertId);
        let objs = vec![
            Object::new("User").with("Name", "a"),
            Object::new("User").with("Name", "b"),
        ];
        let plan = compiler.build_insert(&user_schema(), &objs).unwrap();
        assert_eq!(plan.statements.len(), 2);
        assert_eq!(
            plan.statements[0].sql,
            "INSERT INTO `users` (`name`) VALUES (?)"
        );
        assert!(matches!(plan.exec, InsertExec::PerRowLastId));
    }

    #[test]
    fn test_concat_pattern() {
        let parts = vec!["'%'".to_owned(), "?".to_owned()];
        assert_eq!(MySql.concat(&parts), "CONCAT('%', ?)");
    }
}
