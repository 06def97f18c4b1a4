// Copyright (C) 2025  Tom Waddington
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published
// by the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Boolean condition expressions for rules and transition guards
//!
//! Grammar, loosest binding first:
//! - `a || b`, `a or b`
//! - `a && b`, `a and b`
//! - `!a`, `not a`
//! - `a == b`, `!=`, `<`, `<=`, `>`, `>=`
//! - numbers, `"text"`, `true`, `false`, dotted variable names, `( ... )`
//!
//! Evaluation is strict: both sides of `&&` and `||` are evaluated, so a
//! reference to an undefined variable always surfaces as an error.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{tag, take_until},
    character::complete::{alpha1, alphanumeric1, char, digit1, multispace0},
    combinator::{map_res, not, opt, recognize, value},
    multi::many0_count,
    sequence::{delimited, pair, preceded, terminated},
};
use std::fmt;
use std::str::FromStr;

use crate::context::{ExecutionContext, Value};
use crate::error::{EvalError, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    pub fn eval(&self, ctx: &ExecutionContext) -> Result<Value, EvalError> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Var(name) => ctx
                .get(name)
                .cloned()
                .ok_or_else(|| EvalError::UndefinedVariable(name.clone())),
            Expr::Not(inner) => Ok(Value::Bool(!expect_bool(inner.eval(ctx)?, "!")?)),
            Expr::And(lhs, rhs) => {
                let l = expect_bool(lhs.eval(ctx)?, "&&")?;
                let r = expect_bool(rhs.eval(ctx)?, "&&")?;
                Ok(Value::Bool(l && r))
            }
            Expr::Or(lhs, rhs) => {
                let l = expect_bool(lhs.eval(ctx)?, "||")?;
                let r = expect_bool(rhs.eval(ctx)?, "||")?;
                Ok(Value::Bool(l || r))
            }
            Expr::Cmp(op, lhs, rhs) => compare(*op, lhs.eval(ctx)?, rhs.eval(ctx)?).map(Value::Bool),
        }
    }

    fn collect_vars<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Var(name) => out.push(name),
            Expr::Not(inner) => inner.collect_vars(out),
            Expr::And(l, r) | Expr::Or(l, r) | Expr::Cmp(_, l, r) => {
                l.collect_vars(out);
                r.collect_vars(out);
            }
        }
    }
}

fn expect_bool(value: Value, op: &str) -> Result<bool, EvalError> {
    match value {
        Value::Bool(b) => Ok(b),
        other => Err(EvalError::TypeMismatch(format!(
            "'{}' needs booleans, got {}",
            op,
            other.type_name()
        ))),
    }
}

fn compare(op: CmpOp, lhs: Value, rhs: Value) -> Result<bool, EvalError> {
    use std::cmp::Ordering;

    let ordering = match (&lhs, &rhs) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => match op {
            CmpOp::Eq | CmpOp::Ne => Some(a.cmp(b)),
            _ => {
                return Err(EvalError::TypeMismatch(format!(
                    "booleans cannot be compared with '{}'",
                    op
                )));
            }
        },
        _ => {
            return Err(EvalError::TypeMismatch(format!(
                "cannot compare {} {} {}",
                lhs.type_name(),
                op,
                rhs.type_name()
            )));
        }
    };

    // NaN compares unequal to everything
    let Some(ordering) = ordering else {
        return Ok(op == CmpOp::Ne);
    };

    Ok(match op {
        CmpOp::Eq => ordering == Ordering::Equal,
        CmpOp::Ne => ordering != Ordering::Equal,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
    })
}

fn parse_identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0_count(alt((alphanumeric1, tag("_"), tag(".")))),
    ))
    .parse(input)
}

fn keyword(word: &'static str) -> impl Fn(&str) -> IResult<&str, &str> {
    move |input: &str| {
        let (rest, ident) = parse_identifier(input)?;
        if ident == word {
            Ok((rest, ident))
        } else {
            Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )))
        }
    }
}

fn parse_number(input: &str) -> IResult<&str, Expr> {
    map_res(
        recognize((opt(char('-')), digit1, opt(pair(char('.'), digit1)))),
        |text: &str| text.parse::<f64>().map(|n| Expr::Literal(Value::Number(n))),
    )
    .parse(input)
}

fn parse_string(input: &str) -> IResult<&str, Expr> {
    let (input, _) = char('"')(input)?;
    let (input, text) = take_until("\"")(input)?;
    let (input, _) = char('"')(input)?;
    Ok((input, Expr::Literal(Value::Text(text.to_string()))))
}

fn parse_name(input: &str) -> IResult<&str, Expr> {
    let (rest, ident) = parse_identifier(input)?;
    let expr = match ident {
        "true" => Expr::Literal(Value::Bool(true)),
        "false" => Expr::Literal(Value::Bool(false)),
        "and" | "or" | "not" => {
            return Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Tag,
            )));
        }
        name => Expr::Var(name.to_string()),
    };
    Ok((rest, expr))
}

fn parse_group(input: &str) -> IResult<&str, Expr> {
    delimited(char('('), parse_or, preceded(multispace0, char(')'))).parse(input)
}

fn parse_atom(input: &str) -> IResult<&str, Expr> {
    let (input, _) = multispace0(input)?;
    alt((parse_group, parse_string, parse_number, parse_name)).parse(input)
}

fn parse_cmp_op(input: &str) -> IResult<&str, CmpOp> {
    let (input, _) = multispace0(input)?;
    alt((
        value(CmpOp::Eq, tag("==")),
        value(CmpOp::Ne, tag("!=")),
        value(CmpOp::Le, tag("<=")),
        value(CmpOp::Ge, tag(">=")),
        value(CmpOp::Lt, tag("<")),
        value(CmpOp::Gt, tag(">")),
    ))
    .parse(input)
}

fn parse_cmp(input: &str) -> IResult<&str, Expr> {
    let (input, lhs) = parse_atom(input)?;
    match parse_cmp_op(input) {
        Ok((input, op)) => {
            let (input, rhs) = parse_atom(input)?;
            Ok((input, Expr::Cmp(op, Box::new(lhs), Box::new(rhs))))
        }
        Err(nom::Err::Error(_)) => Ok((input, lhs)),
        Err(e) => Err(e),
    }
}

fn parse_not(input: &str) -> IResult<&str, Expr> {
    let (input, _) = multispace0(input)?;
    let negation = alt((
        value((), terminated(char('!'), not(char('=')))),
        value((), keyword("not")),
    ))
    .parse(input);
    match negation {
        Ok((input, ())) => {
            let (input, inner) = parse_not(input)?;
            Ok((input, Expr::Not(Box::new(inner))))
        }
        Err(nom::Err::Error(_)) => parse_cmp(input),
        Err(e) => Err(e),
    }
}

fn parse_and_op(input: &str) -> IResult<&str, ()> {
    let (input, _) = multispace0(input)?;
    alt((value((), tag("&&")), value((), keyword("and")))).parse(input)
}

fn parse_or_op(input: &str) -> IResult<&str, ()> {
    let (input, _) = multispace0(input)?;
    alt((value((), tag("||")), value((), keyword("or")))).parse(input)
}

fn parse_and(input: &str) -> IResult<&str, Expr> {
    let (mut input, mut lhs) = parse_not(input)?;
    loop {
        match parse_and_op(input) {
            Ok((rest, ())) => {
                let (rest, rhs) = parse_not(rest)?;
                lhs = Expr::And(Box::new(lhs), Box::new(rhs));
                input = rest;
            }
            Err(nom::Err::Error(_)) => return Ok((input, lhs)),
            Err(e) => return Err(e),
        }
    }
}

fn parse_or(input: &str) -> IResult<&str, Expr> {
    let (mut input, mut lhs) = parse_and(input)?;
    loop {
        match parse_or_op(input) {
            Ok((rest, ())) => {
                let (rest, rhs) = parse_and(rest)?;
                lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
                input = rest;
            }
            Err(nom::Err::Error(_)) => return Ok((input, lhs)),
            Err(e) => return Err(e),
        }
    }
}

/// A parsed, side-effect free boolean predicate over an [`ExecutionContext`].
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    pub fn parse(source: &str) -> Result<Self, ValidationError> {
        let invalid = |message: String| ValidationError::Condition {
            source_text: source.to_string(),
            message,
        };

        if source.trim().is_empty() {
            return Err(ValidationError::Empty { field: "condition" });
        }

        match parse_or(source) {
            Ok((remaining, expr)) => {
                if !remaining.trim().is_empty() {
                    return Err(invalid(format!(
                        "unexpected text '{}'",
                        remaining.trim()
                    )));
                }
                Ok(Self {
                    source: source.trim().to_string(),
                    expr,
                })
            }
            Err(e) => Err(invalid(e.to_string())),
        }
    }

    /// Condition that always holds, used for unguarded transitions.
    pub fn always() -> Self {
        Self {
            source: "true".to_string(),
            expr: Expr::Literal(Value::Bool(true)),
        }
    }

    pub fn evaluate(&self, ctx: &ExecutionContext) -> Result<bool, EvalError> {
        match self.expr.eval(ctx)? {
            Value::Bool(b) => Ok(b),
            other => Err(EvalError::NotBoolean(other.type_name().to_string())),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn variables(&self) -> Vec<&str> {
        let mut vars = Vec::new();
        self.expr.collect_vars(&mut vars);
        vars
    }
}

impl FromStr for Condition {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Condition::parse(s)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::with_vars([
            ("hp", Value::Number(40.0)),
            ("state", Value::Text("town".into())),
            ("boss_visible", Value::Bool(false)),
            ("gate.ok_button.confidence", Value::Number(0.91)),
        ])
    }

    fn eval(src: &str) -> Result<bool, EvalError> {
        Condition::parse(src).unwrap().evaluate(&ctx())
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(eval("hp < 50"), Ok(true));
        assert_eq!(eval("hp >= 50"), Ok(false));
        assert_eq!(eval("state == \"town\""), Ok(true));
        assert_eq!(eval("gate.ok_button.confidence > 0.9"), Ok(true));
        assert_eq!(eval("hp != -1"), Ok(true));
    }

    #[test]
    fn test_boolean_operators_and_precedence() {
        assert_eq!(eval("boss_visible || hp < 50 && state == \"town\""), Ok(true));
        assert_eq!(eval("(boss_visible || hp < 50) && state == \"dungeon\""), Ok(false));
        assert_eq!(eval("!boss_visible"), Ok(true));
        assert_eq!(eval("not boss_visible and hp > 10"), Ok(true));
        assert_eq!(eval("true or false"), Ok(true));
    }

    #[test]
    fn test_undefined_variable_is_error() {
        assert_eq!(
            eval("mana > 3"),
            Err(EvalError::UndefinedVariable("mana".to_string()))
        );
        // strict evaluation: the right-hand side is still checked
        assert_eq!(
            eval("false && mana > 3"),
            Err(EvalError::UndefinedVariable("mana".to_string()))
        );
    }

    #[test]
    fn test_type_errors() {
        assert!(matches!(eval("hp == \"40\""), Err(EvalError::TypeMismatch(_))));
        assert!(matches!(eval("hp"), Err(EvalError::NotBoolean(_))));
        assert!(matches!(eval("hp && true"), Err(EvalError::TypeMismatch(_))));
    }

    #[test]
    fn test_syntax_errors() {
        assert!(Condition::parse("hp <").is_err());
        assert!(Condition::parse("hp < 3 )").is_err());
        assert!(Condition::parse("").is_err());
        assert!(Condition::parse("and").is_err());
    }

    #[test]
    fn test_keyword_prefix_is_identifier() {
        let cond = Condition::parse("orange || android").unwrap();
        assert_eq!(cond.variables(), vec!["orange", "android"]);
    }
}
