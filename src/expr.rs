//! Attribute value and search template expressions.
//!
//! Attribute mapping values and PAM search templates share a small
//! substitution language: a template is literal text interleaved with
//! variable references of the form `$name`, `${name}` or
//! `${name:-default}`, where the default may itself contain references.
//! Templates are compiled once, at configuration load, so malformed
//! expressions are rejected up front instead of at lookup time.

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::char;
use nom::combinator::{all_consuming, map, opt};
use nom::multi::many0;
use nom::sequence::{delimited, pair, preceded};
use nom::IResult;

use crate::result::{NsdError, Result};

#[derive(Clone, Debug, PartialEq)]
enum Piece {
    Literal(String),
    Ref {
        name: String,
        default: Option<Expr>,
    },
}

/// A compiled template expression.
#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pieces: Vec<Piece>,
}

impl Expr {
    /// Compile a template. Fails on unterminated or malformed references.
    pub fn parse(input: &str) -> Result<Expr> {
        match all_consuming(template)(input) {
            Ok((_, expr)) => Ok(expr),
            Err(_) => Err(NsdError::Config(format!("invalid expression \"{}\"", input))),
        }
    }

    /// Evaluate against a variable lookup.
    ///
    /// Returns `None` iff a referenced variable is absent and carries no
    /// default.
    pub fn eval<F>(&self, lookup: &F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut out = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Literal(text) => out.push_str(text),
                Piece::Ref { name, default } => match lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => match default {
                        Some(expr) => out.push_str(&expr.eval(lookup)?),
                        None => return None,
                    },
                },
            }
        }
        Some(out)
    }

    /// Collect every referenced variable name, including those inside
    /// defaults. Used to build search attribute lists.
    pub fn var_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names(&self, names: &mut Vec<String>) {
        for piece in &self.pieces {
            if let Piece::Ref { name, default } = piece {
                if !names.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                    names.push(name.clone());
                }
                if let Some(expr) = default {
                    expr.collect_names(names);
                }
            }
        }
    }

    /// True when the template contains no references at all.
    pub fn is_constant(&self) -> bool {
        self.pieces
            .iter()
            .all(|p| matches!(p, Piece::Literal(_)))
    }
}

fn var_name(i: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == ';' || c == '-')(i)
}

fn simple_ref(i: &str) -> IResult<&str, Piece> {
    map(preceded(char('$'), var_name), |name: &str| Piece::Ref {
        name: name.to_string(),
        default: None,
    })(i)
}

fn braced_ref(i: &str) -> IResult<&str, Piece> {
    map(
        delimited(
            tag("${"),
            pair(var_name, opt(preceded(tag(":-"), default_template))),
            char('}'),
        ),
        |(name, default)| Piece::Ref {
            name: name.to_string(),
            default,
        },
    )(i)
}

fn literal(i: &str) -> IResult<&str, Piece> {
    map(take_while1(|c: char| c != '$'), |text: &str| {
        Piece::Literal(text.to_string())
    })(i)
}

fn default_literal(i: &str) -> IResult<&str, Piece> {
    map(take_while1(|c: char| c != '$' && c != '}'), |text: &str| {
        Piece::Literal(text.to_string())
    })(i)
}

fn template(i: &str) -> IResult<&str, Expr> {
    map(many0(alt((braced_ref, simple_ref, literal))), |pieces| Expr {
        pieces,
    })(i)
}

fn default_template(i: &str) -> IResult<&str, Expr> {
    map(
        many0(alt((braced_ref, simple_ref, default_literal))),
        |pieces| Expr { pieces },
    )(i)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn eval(template: &str, pairs: &[(&str, &str)]) -> Option<String> {
        let map = vars(pairs);
        Expr::parse(template)
            .unwrap()
            .eval(&|name| map.get(name).cloned())
    }

    #[test]
    fn plain_literal() {
        assert_eq!(eval("hello", &[]), Some("hello".to_string()));
    }

    #[test]
    fn simple_substitution() {
        assert_eq!(
            eval("(uid=$username)", &[("username", "alice")]),
            Some("(uid=alice)".to_string())
        );
    }

    #[test]
    fn braced_substitution() {
        assert_eq!(
            eval("${shadowLastChange}", &[("shadowLastChange", "12345")]),
            Some("12345".to_string())
        );
    }

    #[test]
    fn default_taken_when_absent() {
        assert_eq!(eval("${shadowMax:--1}", &[]), Some("-1".to_string()));
        assert_eq!(
            eval("${shadowMax:--1}", &[("shadowMax", "90")]),
            Some("90".to_string())
        );
    }

    #[test]
    fn missing_without_default_is_none() {
        assert_eq!(eval("${shadowMax}", &[]), None);
        assert_eq!(eval("$shadowMax", &[]), None);
    }

    #[test]
    fn nested_reference_in_default() {
        assert_eq!(
            eval("${a:-${b:-x}}", &[("b", "beta")]),
            Some("beta".to_string())
        );
        assert_eq!(eval("${a:-${b:-x}}", &[]), Some("x".to_string()));
    }

    #[test]
    fn unterminated_reference_rejected() {
        assert!(Expr::parse("${broken").is_err());
    }

    #[test]
    fn collects_names_recursively() {
        let expr = Expr::parse("(&(cn=$service)(member=${dn:-cn=$username}))").unwrap();
        let names = expr.var_names();
        assert_eq!(names, vec!["service", "dn", "username"]);
    }

    #[test]
    fn constant_detection() {
        assert!(Expr::parse("*").unwrap().is_constant());
        assert!(!Expr::parse("${flag:-0}").unwrap().is_constant());
    }
}
