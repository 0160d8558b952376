// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Tagged scalar carried across the driver boundary.
///
/// Every column value scanned out of a row and every argument bound into a
/// statement is one of these. Datetimes travel as RFC 3339 text on the wire;
/// booleans as integers.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(#[serde(with = "time::serde::rfc3339")] OffsetDateTime),
}

impl ScalarValue {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Null => "Null",
            Self::Bool(_) => "Bool",
            Self::I64(_) => "I64",
            Self::F64(_) => "F64",
            Self::String(_) => "String",
            Self::Bytes(_) => "Bytes",
            Self::DateTime(_) => "DateTime",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Whether the value is the zero value of its kind. Primary keys holding
    /// a zero value are treated as "not yet assigned".
    pub fn is_zero(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Bool(v) => !v,
            Self::I64(v) => *v == 0,
            Self::F64(v) => *v == 0.0,
            Self::String(v) => v.is_empty(),
            Self::Bytes(v) => v.is_empty(),
            Self::DateTime(_) => false,
        }
    }

    /// Renders the value as it appears inside a derived unique key: strings
    /// URL-encoded, bytes base64, datetimes RFC 3339 in UTC, the rest in
    /// display form.
    pub fn key_part(&self) -> String {
        match self {
            Self::Null => "null".to_owned(),
            Self::Bool(v) => v.to_string(),
            Self::I64(v) => v.to_string(),
            Self::F64(v) => v.to_string(),
            Self::String(v) => {
                form_urlencoded::byte_serialize(v.as_bytes()).collect::<String>()
            }
            Self::Bytes(v) => base64::encode(v),
            Self::DateTime(v) => v
                .to_offset(time::UtcOffset::UTC)
                .format(&Rfc3339)
                .unwrap_or_else(|_| v.unix_timestamp().to_string()),
        }
    }
}

macro_rules! define_is_method {
    ($method_name:ident, $typ:ident) => {
        pub fn $method_name(&self) -> bool {
            matches!(self, Self::$typ(_))
        }
    };
}

impl ScalarValue {
    define_is_method! {is_bool, Bool}
    define_is_method! {is_i64, I64}
    define_is_method! {is_f64, F64}
    define_is_method! {is_string, String}
    define_is_method! {is_bytes, Bytes}
    define_is_method! {is_datetime, DateTime}
}

macro_rules! as_copy {
    ($method_name:ident, $variant:ident, $typ:ty) => {
        pub fn $method_name(&self) -> Option<$typ> {
            match self {
                Self::$variant(v) => Some(*v),
                _ => None,
            }
        }
    };
}

macro_rules! as_ref {
    ($method_name:ident, $variant:ident, $typ:ty) => {
        pub fn $method_name(&self) -> Option<&$typ> {
            match self {
                Self::$variant(v) => Some(v),
                _ => None,
            }
        }
    };
}

impl ScalarValue {
    as_copy!(as_bool, Bool, bool);
    as_copy!(as_i64, I64, i64);
    as_copy!(as_f64, F64, f64);
    as_ref!(as_str, String, str);
    as_ref!(as_bytes, Bytes, [u8]);
    as_copy!(as_datetime, DateTime, OffsetDateTime);
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        Self::I64(v as i64)
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for ScalarValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<OffsetDateTime> for ScalarValue {
    fn from(v: OffsetDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl<T> From<Option<T>> for ScalarValue
where
    T: Into<ScalarValue>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Self::Null,
        }
    }
}
