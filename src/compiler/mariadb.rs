// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use super::mysql::MySql;
use super::Dialect;

/// MariaDB speaks the MySQL dialect; bulk updates stay multi-statement and
/// the executor wraps them in one transaction, summing rows-affected.
pub struct MariaDb;

impl Dialect for MariaDb {
    fn name(&self) -> &'static str {
        "mariadb"
    }

    fn quote_char(&self) -> char {
        MySql.quote_char()
    }

    fn concat(&self, parts: &[String]) -> String {
        MySql.concat(&parts.to_vec())
    }

    fn insert_per_row(&self) -> bool {
        MySql.insert_per_row()
    }
}
