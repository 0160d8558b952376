// SPDX-FileCopyrightText: © 2022 ChiselStrike <info@chiselstrike.com>

//! The expression sub-language: field references, literals, aggregate calls,
//! arithmetic, and `Q` filter combinators. Expressions resolve to SQL
//! fragments when the query set that owns them is compiled.

use crate::joins::ColumnRef;
use crate::value::ScalarValue;
use time::OffsetDateTime;

/// An expression node.
///
/// `Field` carries an unresolved dotted path; applying the expression to a
/// query set resolves it into `Column` (planning joins along the way).
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// Dotted field path, unresolved.
    Field(String),
    /// Concrete table/alias + column, produced by path resolution.
    Column(ColumnRef),
    /// Reference to a projection alias (an annotation), produced when path
    /// resolution falls back to the annotations map.
    Alias(String),
    /// Literal value, bound as a placeholder argument.
    Value(ScalarValue),
    /// Raw SQL fragment with its bound arguments, passed through verbatim.
    Raw { sql: String, args: Vec<ScalarValue> },
    /// Function call, e.g. `SUM(...)`.
    Func { name: String, args: Vec<Expr> },
    /// `*`, only meaningful inside `COUNT`.
    Star,
    Binary(Box<BinaryExpr>),
}

/// A binary expression.
#[derive(Clone, Debug, PartialEq)]
pub struct BinaryExpr {
    pub left: Expr,
    pub op: BinaryOp,
    pub right: Expr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn to_sql_string(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
        }
    }
}

impl Expr {
    fn binary(self, op: BinaryOp, right: Expr) -> Expr {
        Expr::Binary(Box::new(BinaryExpr {
            left: self,
            op,
            right,
        }))
    }

    pub fn add(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Add, rhs.into())
    }

    pub fn sub(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Sub, rhs.into())
    }

    pub fn mul(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Mul, rhs.into())
    }

    pub fn div(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Div, rhs.into())
    }

    pub fn eq(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Eq, rhs.into())
    }

    pub fn gt(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Gt, rhs.into())
    }

    pub fn lt(self, rhs: impl Into<Expr>) -> Expr {
        self.binary(BinaryOp::Lt, rhs.into())
    }
}

macro_rules! expr_from_scalar {
    ($typ:ty) => {
        impl From<$typ> for Expr {
            fn from(v: $typ) -> Self {
                Expr::Value(v.into())
            }
        }
    };
}

expr_from_scalar!(bool);
expr_from_scalar!(i32);
expr_from_scalar!(i64);
expr_from_scalar!(f64);
expr_from_scalar!(&str);
expr_from_scalar!(String);
expr_from_scalar!(OffsetDateTime);
expr_from_scalar!(ScalarValue);

/// References a field by dotted path, e.g. `f("Price")` or
/// `f("Author.Name")`.
pub fn f(path: &str) -> Expr {
    Expr::Field(path.to_owned())
}

/// Raw SQL fragment with bound arguments.
pub fn raw(sql: &str, args: Vec<ScalarValue>) -> Expr {
    Expr::Raw {
        sql: sql.to_owned(),
        args,
    }
}

fn func(name: &str, arg: Expr) -> Expr {
    Expr::Func {
        name: name.to_owned(),
        args: vec![arg],
    }
}

pub fn sum(path: &str) -> Expr {
    func("SUM", f(path))
}

pub fn avg(path: &str) -> Expr {
    func("AVG", f(path))
}

pub fn min(path: &str) -> Expr {
    func("MIN", f(path))
}

pub fn max(path: &str) -> Expr {
    func("MAX", f(path))
}

/// `count("*")` or `count("Field")`.
pub fn count(path: &str) -> Expr {
    let arg = if path == "*" { Expr::Star } else { f(path) };
    func("COUNT", arg)
}

/// How the children of a [`Q`] node combine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq)]
pub enum QChild {
    /// `key` is a field path with an optional `__<lookup>` suffix.
    Cond {
        key: String,
        values: Vec<ScalarValue>,
    },
    Expr(Expr),
    Nested(Q),
}

/// Composable filter tree, combined into WHERE/HAVING clauses.
#[derive(Clone, Debug, PartialEq)]
pub struct Q {
    pub connector: Connector,
    pub negated: bool,
    pub children: Vec<QChild>,
}

/// Single-condition `Q`: `q("Age__gte", 21)`.
pub fn q(key: &str, values: impl Into<Args>) -> Q {
    Q {
        connector: Connector::And,
        negated: false,
        children: vec![QChild::Cond {
            key: key.to_owned(),
            values: values.into().0,
        }],
    }
}

impl Q {
    fn combine(self, connector: Connector, other: Q) -> Q {
        Q {
            connector,
            negated: false,
            children: vec![QChild::Nested(self), QChild::Nested(other)],
        }
    }

    pub fn and(self, other: Q) -> Q {
        self.combine(Connector::And, other)
    }

    pub fn or(self, other: Q) -> Q {
        self.combine(Connector::Or, other)
    }

    pub fn not(mut self) -> Q {
        self.negated = !self.negated;
        self
    }
}

impl From<Expr> for Q {
    fn from(e: Expr) -> Self {
        Q {
            connector: Connector::And,
            negated: false,
            children: vec![QChild::Expr(e)],
        }
    }
}

/// Argument list for filter conditions. Single values and value lists both
/// convert into it, standing in for a variadic parameter.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Args(pub Vec<ScalarValue>);

macro_rules! args_from_scalar {
    ($typ:ty) => {
        impl From<$typ> for Args {
            fn from(v: $typ) -> Self {
                Args(vec![v.into()])
            }
        }
    };
}

args_from_scalar!(bool);
args_from_scalar!(i32);
args_from_scalar!(i64);
args_from_scalar!(f64);
args_from_scalar!(&str);
args_from_scalar!(String);
args_from_scalar!(OffsetDateTime);
args_from_scalar!(ScalarValue);

impl From<Vec<ScalarValue>> for Args {
    fn from(v: Vec<ScalarValue>) -> Self {
        Args(v)
    }
}

impl From<&[ScalarValue]> for Args {
    fn from(v: &[ScalarValue]) -> Self {
        Args(v.to_vec())
    }
}

impl<const N: usize> From<[ScalarValue; N]> for Args {
    fn from(v: [ScalarValue; N]) -> Self {
        Args(v.to_vec())
    }
}
