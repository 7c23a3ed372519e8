// Pest-based parser producing the restricted AST.

use pest::iterators::Pair;
use pest::Parser;

use crate::ast::{Arg, Call, Program, RValue, Stmt};
use crate::error::ParseError;
use crate::values::Value;

#[derive(pest_derive::Parser)]
#[grammar = "callscript.pest"]
pub struct CallscriptParser;

/// Parse a source string into a [`Program`].
pub fn parse_program(source: &str) -> Result<Program, ParseError> {
    let mut pairs = CallscriptParser::parse(Rule::program, source)
        .map_err(|e| ParseError::Syntax(e.to_string()))?;
    let program = pairs.next().expect("grammar yields one program rule");

    let mut statements = Vec::new();
    for pair in program.into_inner() {
        match pair.as_rule() {
            Rule::statement => statements.push(build_statement(pair)?),
            Rule::EOI => {}
            rule => return Err(ParseError::unexpected(rule_name(rule))),
        }
    }
    Ok(Program { statements })
}

fn build_statement(pair: Pair<Rule>) -> Result<Stmt, ParseError> {
    let inner = first_inner(pair)?;
    match inner.as_rule() {
        Rule::assignment => {
            let mut parts = inner.into_inner();
            let name = parts
                .next()
                .ok_or_else(|| ParseError::unexpected("empty assignment"))?
                .as_str()
                .to_string();
            let value = build_rvalue(
                parts
                    .next()
                    .ok_or_else(|| ParseError::unexpected("assignment without value"))?,
            )?;
            Ok(Stmt::Assign { name, value })
        }
        Rule::expr_stmt => Ok(Stmt::Expr(build_rvalue(first_inner(inner)?)?)),
        rule => Err(ParseError::unexpected(rule_name(rule))),
    }
}

fn build_rvalue(pair: Pair<Rule>) -> Result<RValue, ParseError> {
    let inner = first_inner(pair)?;
    match inner.as_rule() {
        Rule::call => Ok(RValue::Call(build_call(inner)?)),
        Rule::expr => match build_arg_from_expr(inner)? {
            Arg::Literal(v) => Ok(RValue::Literal(v)),
            Arg::Name(n) => Ok(RValue::Name(n)),
        },
        rule => Err(ParseError::unexpected(rule_name(rule))),
    }
}

fn build_call(pair: Pair<Rule>) -> Result<Call, ParseError> {
    let mut inner = pair.into_inner();
    let function = inner
        .next()
        .ok_or_else(|| ParseError::unexpected("call without function name"))?
        .as_str()
        .to_string();

    let mut args = Vec::new();
    let mut kwargs = Vec::new();
    if let Some(arg_list) = inner.next() {
        for arg in arg_list.into_inner() {
            let arg = first_inner(arg)?;
            match arg.as_rule() {
                Rule::kwarg => {
                    let mut parts = arg.into_inner();
                    let key = parts
                        .next()
                        .ok_or_else(|| ParseError::unexpected("empty keyword argument"))?
                        .as_str()
                        .to_string();
                    let value = build_arg_from_expr(
                        parts
                            .next()
                            .ok_or_else(|| ParseError::unexpected("keyword without value"))?,
                    )?;
                    kwargs.push((key, value));
                }
                Rule::expr => {
                    let value = build_arg_from_expr(arg)?;
                    if !kwargs.is_empty() {
                        return Err(ParseError::Syntax(
                            "positional argument after keyword argument".to_string(),
                        ));
                    }
                    args.push(value);
                }
                rule => return Err(ParseError::unexpected(rule_name(rule))),
            }
        }
    }
    Ok(Call {
        function,
        args,
        kwargs,
    })
}

fn build_arg_from_expr(pair: Pair<Rule>) -> Result<Arg, ParseError> {
    let inner = first_inner(pair)?;
    match inner.as_rule() {
        Rule::literal => Ok(Arg::Literal(build_literal(inner)?)),
        Rule::ident => Ok(Arg::Name(inner.as_str().to_string())),
        rule => Err(ParseError::unexpected(rule_name(rule))),
    }
}

fn build_literal(pair: Pair<Rule>) -> Result<Value, ParseError> {
    let inner = first_inner(pair)?;
    match inner.as_rule() {
        Rule::int => inner
            .as_str()
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| ParseError::InvalidLiteral(inner.as_str().to_string())),
        Rule::float => inner
            .as_str()
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| ParseError::InvalidLiteral(inner.as_str().to_string())),
        Rule::boolean => Ok(Value::Bool(matches!(inner.as_str(), "True" | "true"))),
        Rule::none => Ok(Value::Null),
        Rule::string => Ok(Value::Str(unescape(string_body(inner)?))),
        Rule::list => {
            let mut items = Vec::new();
            for item in inner.into_inner() {
                items.push(build_literal(item)?);
            }
            Ok(Value::List(items))
        }
        Rule::map => {
            let mut map = std::collections::HashMap::new();
            for entry in inner.into_inner() {
                let mut parts = entry.into_inner();
                let key = parts
                    .next()
                    .ok_or_else(|| ParseError::unexpected("empty map entry"))?;
                let key = unescape(string_body(key)?);
                let value = build_literal(
                    parts
                        .next()
                        .ok_or_else(|| ParseError::unexpected("map entry without value"))?,
                )?;
                map.insert(key, value);
            }
            Ok(Value::Map(map))
        }
        rule => Err(ParseError::unexpected(rule_name(rule))),
    }
}

/// Extracts the raw body of a `string` pair (without quotes).
fn string_body(pair: Pair<Rule>) -> Result<&str, ParseError> {
    let quoted = first_inner(pair)?;
    let body = first_inner(quoted)?;
    Ok(body.as_str())
}

fn first_inner(pair: Pair<Rule>) -> Result<Pair<Rule>, ParseError> {
    let rule = pair.as_rule();
    pair.into_inner()
        .next()
        .ok_or_else(|| ParseError::unexpected(rule_name(rule)))
}

fn rule_name(rule: Rule) -> String {
    format!("{:?}", rule)
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some(other) => out.push(other),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}
