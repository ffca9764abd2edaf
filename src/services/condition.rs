//! Condition language for workflow edges.
//!
//! Side-effect-free boolean expressions over upstream stage results:
//!
//! ```text
//! $build.status == "succeeded" && !($lint.output.errors == "none")
//! ```
//!
//! Operands are `$<stage>.status`, `$<stage>.output.<path>`, string
//! literals, and booleans. Operators: `==`, `!=`, `&&`, `||`, `!`,
//! parentheses. Numeric comparison is deliberately absent.

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{char, multispace0, none_of, satisfy},
    combinator::{all_consuming, map, recognize, value},
    error::ParseError,
    multi::{many0, separated_list1},
    sequence::{delimited, pair, preceded},
    IResult,
};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::domain::errors::{OrchestratorError, OrchestratorResult};
use crate::domain::models::{StageId, StageOutcome};

/// A reference to an upstream stage's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRef {
    pub stage_id: StageId,
    pub field: RefField,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefField {
    /// `$stage.status` — "succeeded" | "failed" | "skipped"
    Status,
    /// `$stage.output.<dotted.path>` — structured output access
    Output(Vec<String>),
}

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Literal(Value),
    Reference(StageRef),
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Eq(Box<Condition>, Box<Condition>),
    Ne(Box<Condition>, Box<Condition>),
}

impl Condition {
    /// Parse an expression. Fails with `BadCondition` on syntax errors
    /// or trailing input.
    pub fn parse(input: &str) -> OrchestratorResult<Self> {
        match all_consuming(ws(parse_or))(input) {
            Ok((_, condition)) => Ok(condition),
            Err(err) => Err(OrchestratorError::BadCondition {
                expression: input.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    /// Stage ids referenced anywhere in the expression; used at
    /// workflow compile time to verify each is a declared upstream.
    pub fn referenced_stages(&self) -> Vec<StageId> {
        let mut stages = Vec::new();
        self.collect_stages(&mut stages);
        stages.sort();
        stages.dedup();
        stages
    }

    fn collect_stages(&self, out: &mut Vec<StageId>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(r) => out.push(r.stage_id.clone()),
            Self::Not(inner) => inner.collect_stages(out),
            Self::And(a, b) | Self::Or(a, b) | Self::Eq(a, b) | Self::Ne(a, b) => {
                a.collect_stages(out);
                b.collect_stages(out);
            }
        }
    }

    /// Evaluate against a run context.
    pub fn evaluate(&self, context: &BTreeMap<StageId, StageOutcome>) -> OrchestratorResult<bool> {
        match self.eval_value(context)? {
            Value::Bool(b) => Ok(b),
            other => Err(OrchestratorError::BadCondition {
                expression: format!("{self:?}"),
                reason: format!("expression evaluates to non-boolean {other}"),
            }),
        }
    }

    fn eval_value(&self, context: &BTreeMap<StageId, StageOutcome>) -> OrchestratorResult<Value> {
        match self {
            Self::Literal(v) => Ok(v.clone()),
            Self::Reference(r) => resolve_reference(r, context),
            Self::Not(inner) => match inner.eval_value(context)? {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(OrchestratorError::BadCondition {
                    expression: format!("{inner:?}"),
                    reason: format!("'!' applied to non-boolean {other}"),
                }),
            },
            Self::And(a, b) => {
                let left = a.evaluate(context)?;
                // Short-circuit: the right side is only evaluated when
                // needed, matching `&&` expectations.
                Ok(Value::Bool(left && b.evaluate(context)?))
            }
            Self::Or(a, b) => {
                let left = a.evaluate(context)?;
                Ok(Value::Bool(left || b.evaluate(context)?))
            }
            Self::Eq(a, b) => Ok(Value::Bool(a.eval_value(context)? == b.eval_value(context)?)),
            Self::Ne(a, b) => Ok(Value::Bool(a.eval_value(context)? != b.eval_value(context)?)),
        }
    }
}

fn resolve_reference(
    reference: &StageRef,
    context: &BTreeMap<StageId, StageOutcome>,
) -> OrchestratorResult<Value> {
    let outcome = context
        .get(&reference.stage_id)
        .ok_or_else(|| OrchestratorError::UnknownStageRef {
            stage: reference.stage_id.clone(),
        })?;

    match &reference.field {
        RefField::Status => Ok(Value::String(outcome.status.as_str().to_string())),
        RefField::Output(path) => {
            let mut current = &outcome.output;
            for segment in path {
                current = match current {
                    Value::Object(map) => map.get(segment).unwrap_or(&Value::Null),
                    _ => &Value::Null,
                };
            }
            Ok(current.clone())
        }
    }
}

// -- nom combinators --

fn ws<'a, F, O, E: ParseError<&'a str>>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O, E>
where
    F: FnMut(&'a str) -> IResult<&'a str, O, E>,
{
    delimited(multispace0, inner, multispace0)
}

fn identifier(input: &str) -> IResult<&str, String> {
    map(
        recognize(pair(
            satisfy(|c: char| c.is_ascii_alphanumeric() || c == '_'),
            many0(satisfy(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-')),
        )),
        String::from,
    )(input)
}

/// `$stage.status` or `$stage.output.path.to.field`
fn parse_reference(input: &str) -> IResult<&str, Condition> {
    let (rest, segments) = preceded(char('$'), separated_list1(char('.'), identifier))(input)?;

    if segments.len() < 2 {
        return Err(nom::Err::Error(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Verify,
        )));
    }

    let stage_id = segments[0].clone();
    let field = match segments[1].as_str() {
        "status" if segments.len() == 2 => RefField::Status,
        "output" => RefField::Output(segments[2..].to_vec()),
        _ => {
            return Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Verify,
            )));
        }
    };

    Ok((rest, Condition::Reference(StageRef { stage_id, field })))
}

fn parse_string_literal(input: &str) -> IResult<&str, Condition> {
    alt((
        map(
            delimited(char('"'), many0(none_of("\"")), char('"')),
            |chars: Vec<char>| Condition::Literal(Value::String(chars.into_iter().collect())),
        ),
        map(
            delimited(char('\''), many0(none_of("'")), char('\'')),
            |chars: Vec<char>| Condition::Literal(Value::String(chars.into_iter().collect())),
        ),
    ))(input)
}

fn parse_boolean(input: &str) -> IResult<&str, Condition> {
    alt((
        value(Condition::Literal(Value::Bool(true)), tag("true")),
        value(Condition::Literal(Value::Bool(false)), tag("false")),
    ))(input)
}

fn parse_primary(input: &str) -> IResult<&str, Condition> {
    alt((
        delimited(ws(char('(')), parse_or, ws(char(')'))),
        map(preceded(ws(char('!')), parse_primary), |inner| {
            Condition::Not(Box::new(inner))
        }),
        ws(parse_reference),
        ws(parse_string_literal),
        ws(parse_boolean),
    ))(input)
}

fn parse_equality(input: &str) -> IResult<&str, Condition> {
    let (rest, first) = parse_primary(input)?;
    let (rest, tail) = many0(pair(ws(alt((tag("=="), tag("!=")))), parse_primary))(rest)?;

    let condition = tail.into_iter().fold(first, |acc, (op, rhs)| {
        if op == "==" {
            Condition::Eq(Box::new(acc), Box::new(rhs))
        } else {
            Condition::Ne(Box::new(acc), Box::new(rhs))
        }
    });
    Ok((rest, condition))
}

fn parse_and(input: &str) -> IResult<&str, Condition> {
    let (rest, first) = parse_equality(input)?;
    let (rest, tail) = many1_or_none(rest, tag("&&"), parse_equality)?;
    Ok((rest, fold_binary(first, tail, |a, b| Condition::And(Box::new(a), Box::new(b)))))
}

fn parse_or(input: &str) -> IResult<&str, Condition> {
    let (rest, first) = parse_and(input)?;
    let (rest, tail) = many1_or_none(rest, tag("||"), parse_and)?;
    Ok((rest, fold_binary(first, tail, |a, b| Condition::Or(Box::new(a), Box::new(b)))))
}

fn many1_or_none<'a, F>(
    input: &'a str,
    mut op: impl FnMut(&'a str) -> IResult<&'a str, &'a str>,
    mut operand: F,
) -> IResult<&'a str, Vec<Condition>>
where
    F: FnMut(&'a str) -> IResult<&'a str, Condition>,
{
    let mut rest = input;
    let mut out = Vec::new();
    loop {
        let Ok((after_op, _)) = ws(&mut op)(rest) else {
            return Ok((rest, out));
        };
        let (after_operand, rhs) = operand(after_op)?;
        out.push(rhs);
        rest = after_operand;
    }
}

fn fold_binary(
    first: Condition,
    tail: Vec<Condition>,
    combine: impl Fn(Condition, Condition) -> Condition,
) -> Condition {
    tail.into_iter().fold(first, combine)
}
