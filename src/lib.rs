// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! # Query sets
//!
//! ## Requirements
//!
//! - Callers describe their models once (fields, flags, relations) and get
//!   a chainable, immutable query builder over them.
//! - Dotted field paths (`"Author.Books.Title"`, `"Tags.*"`) compile into
//!   validated joins with stable aliases and no duplicates.
//! - The same abstract query renders per SQL dialect (generic, Postgres,
//!   MySQL, MariaDB, SQLite) and runs over a pluggable sqlx driver.
//! - Flat result rows materialize back into object trees, with repeated
//!   parents collapsed by unique key and junction rows carried along.
//!
//! ## Design
//!
//! A [`QuerySet`] is a snapshot: every builder call forks it, so a snapshot
//! handed to other code never changes underneath it. Terminal operations
//! (`all`, `get`, `count`, `create`, `update`, `delete`, ...) compile the
//! snapshot with the dialect registered for the database's driver, execute
//! it, and scan the rows back.
//!
//! ```ignore
//! let mut registry = Registry::new();
//! registry.register(ModelSchema::new("Book", "books", vec![
//!     FieldDef::new("ID", FieldType::I64).primary().auto(),
//!     FieldDef::new("Title", FieldType::Text),
//!     FieldDef::new("Author", FieldType::I64)
//!         .with_column("author_id")
//!         .with_relation(Relation::new(RelationKind::ManyToOne, "Author")),
//! ]));
//! let registry = Arc::new(registry);
//!
//! let db = Database::connect("default", "sqlite::memory:", 1).await?;
//! let book = objects(&db, &registry, "Book")?
//!     .select(&["*", "Author.*"])
//!     .filter("ID", 2)
//!     .get()
//!     .await?;
//! ```

pub mod alias;
pub mod compiler;
pub mod errors;
pub mod exec;
pub mod expr;
pub mod joins;
pub mod object;
pub mod queryset;
pub mod rows;
pub mod schema;
pub mod value;
pub mod walker;

pub use compiler::{register_compiler, register_driver, Returning, SqlWithArguments};
pub use errors::{Error, Result};
pub use exec::{Database, TxHandle};
pub use expr::{avg, count, f, max, min, q, raw, sum, Expr, Q};
pub use object::{Object, Related, RelatedObject};
pub use queryset::{objects, QuerySet};
pub use schema::{
    FieldDef, FieldType, HookKind, ModelSchema, Registry, Relation, RelationKind,
};
pub use value::ScalarValue;
