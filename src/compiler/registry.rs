// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! Driver and compiler registries. A driver identity (the string derived
//! from the connection, or registered explicitly) maps to a dialect name and
//! a returning capability, and separately to a compiler constructor looked
//! up when a query set is built.

use super::{mariadb, mysql, postgres, sqlite, Compiler, Dialect, Generic, Returning};
use crate::errors::{Error, Result};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Clone, Debug)]
pub struct DriverInfo {
    pub dialect: String,
    pub returning: Returning,
}

type DialectCtor = fn() -> Box<dyn Dialect>;

static DRIVERS: Lazy<RwLock<HashMap<String, DriverInfo>>> = Lazy::new(|| {
    let mut map = HashMap::new();
    map.insert(
        "postgres".to_owned(),
        DriverInfo {
            dialect: "postgres".to_owned(),
            returning: Returning::Columns,
        },
    );
    map.insert(
        "mysql".to_owned(),
        DriverInfo {
            dialect: "mysql".to_owned(),
            returning: Returning::LastInsertId,
        },
    );
    map.insert(
        "mariadb".to_owned(),
        DriverInfo {
            dialect: "mariadb".to_owned(),
            returning: Returning::LastInsertId,
        },
    );
    map.insert(
        "sqlite".to_owned(),
        DriverInfo {
            dialect: "sqlite".to_owned(),
            returning: Returning::LastInsertId,
        },
    );
    RwLock::new(map)
});

static COMPILERS: Lazy<RwLock<HashMap<String, DialectCtor>>> = Lazy::new(|| {
    let mut map: HashMap<String, DialectCtor> = HashMap::new();
    map.insert("postgres".to_owned(), || Box::new(postgres::Postgres));
    map.insert("mysql".to_owned(), || Box::new(mysql::MySql));
    map.insert("mariadb".to_owned(), || Box::new(mariadb::MariaDb));
    map.insert("sqlite".to_owned(), || Box::new(sqlite::Sqlite));
    map.insert("generic".to_owned(), || Box::new(Generic));
    RwLock::new(map)
});

/// Registers (or replaces) a driver identity with its dialect name and
/// returning capability.
pub fn register_driver(driver: &str, dialect: &str, returning: Returning) {
    DRIVERS.write().expect("driver registry poisoned").insert(
        driver.to_owned(),
        DriverInfo {
            dialect: dialect.to_owned(),
            returning,
        },
    );
}

/// Registers (or replaces) the compiler constructor for a driver identity.
pub fn register_compiler(driver: &str, ctor: fn() -> Box<dyn Dialect>) {
    COMPILERS
        .write()
        .expect("compiler registry poisoned")
        .insert(driver.to_owned(), ctor);
}

pub fn driver_info(driver: &str) -> Result<DriverInfo> {
    DRIVERS
        .read()
        .expect("driver registry poisoned")
        .get(driver)
        .cloned()
        .ok_or_else(|| Error::UnknownDriver(driver.to_owned()))
}

/// Looks up the compiler for a driver identity: the registered constructor
/// for its dialect, paired with its returning capability.
pub fn compiler_for(driver: &str) -> Result<Compiler> {
    let info = driver_info(driver)?;
    let compilers = COMPILERS.read().expect("compiler registry poisoned");
    let ctor = compilers
        .get(driver)
        .or_else(|| compilers.get(&info.dialect))
        .ok_or_else(|| Error::UnknownDriver(driver.to_owned()))?;
    Ok(Compiler::new(ctor(), info.returning))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registrations() {
        let c = compiler_for("sqlite").unwrap();
        assert_eq!(c.dialect.name(), "sqlite");
        assert_eq!(c.returning, Returning::LastInsertId);

        let c = compiler_for("postgres").unwrap();
        assert_eq!(c.dialect.name(), "postgres");
        assert_eq!(c.returning, Returning::Columns);
    }

    #[test]
    fn test_unknown_driver() {
        let err = compiler_for("oracle").unwrap_err();
        assert!(matches!(err, Error::UnknownDriver(_)));
    }

    #[test]
    fn test_custom_registration() {
        register_driver("my-sqlite-fork", "sqlite", Returning::None);
        let c = compiler_for("my-sqlite-fork").unwrap();
        assert_eq!(c.dialect.name(), "sqlite");
        assert_eq!(c.returning, Returning::None);
    }
}
