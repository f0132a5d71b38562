//! Formula sublanguage: a small expression grammar compiled into a
//! [`crate::ast::Expr`] fragment. Column refs are resolved against the
//! node's input schema at compile time; every literal becomes a typed
//! AST node, never a raw interpolated string.

use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use thiserror::Error;
use vizql_types::ColumnSchema;

use crate::ast::{BinOp, Expr, Literal};

#[derive(Parser)]
#[grammar = "formula.pest"]
struct FormulaParser;

/// Whitelisted function set. Anything outside this list is rejected at
/// compile time rather than passed through to the store.
const WHITELISTED_FUNCTIONS: &[&str] = &[
    // math
    "abs", "round", "floor", "ceil", "sqrt", "pow",
    // string
    "upper", "lower", "concat", "length", "trim", "substring",
    // date
    "date_trunc", "date_add", "date_diff", "now",
    // casts
    "cast_float", "cast_int", "cast_string", "coalesce",
];

#[derive(Error, Debug)]
pub enum FormulaError {
    #[error("formula syntax error: {0}")]
    Syntax(String),
    #[error("column {0:?} referenced by formula is not present in the input schema")]
    UnresolvedColumn(String),
    #[error("function {0:?} is not in the whitelisted function set")]
    UnknownFunction(String),
}

pub fn compile(formula_text: &str, input_schema: &[ColumnSchema]) -> Result<Expr, FormulaError> {
    let mut pairs = FormulaParser::parse(Rule::formula, formula_text)
        .map_err(|e| FormulaError::Syntax(e.to_string()))?;
    let formula_pair = pairs.next().expect("formula rule always matches on success");
    let expr_pair = formula_pair
        .into_inner()
        .next()
        .expect("formula = { SOI ~ expr ~ EOI } always has an expr child");
    lower_expr(expr_pair, input_schema)
}

fn lower_expr(pair: Pair<Rule>, schema: &[ColumnSchema]) -> Result<Expr, FormulaError> {
    match pair.as_rule() {
        Rule::expr => lower_expr(inner_single(pair), schema),
        Rule::or_expr => lower_left_assoc(pair, schema, &[("or_op", BinOp::Or)]),
        Rule::and_expr => lower_left_assoc(pair, schema, &[("and_op", BinOp::And)]),
        Rule::not_expr => {
            let mut inner = pair.into_inner().peekable();
            let negated = matches!(inner.peek().map(|p| p.as_rule()), Some(Rule::not_op));
            if negated {
                inner.next();
            }
            let operand = lower_expr(inner.next().expect("comparison is required"), schema)?;
            Ok(if negated {
                Expr::Not(Box::new(operand))
            } else {
                operand
            })
        }
        Rule::comparison => {
            let mut inner = pair.into_inner();
            let left = lower_expr(inner.next().expect("left operand required"), schema)?;
            match inner.next() {
                Some(op_pair) => {
                    let op = comp_op(op_pair.as_str());
                    let right = lower_expr(inner.next().expect("right operand required"), schema)?;
                    Ok(Expr::Binary(Box::new(left), op, Box::new(right)))
                }
                None => Ok(left),
            }
        }
        Rule::additive => lower_left_assoc_mixed(pair, schema, |tok| match tok {
            "+" => Some(BinOp::Add),
            "-" => Some(BinOp::Sub),
            _ => None,
        }),
        Rule::multiplicative => lower_left_assoc_mixed(pair, schema, |tok| match tok {
            "*" => Some(BinOp::Mul),
            "/" => Some(BinOp::Div),
            "%" => Some(BinOp::Mod),
            _ => None,
        }),
        Rule::unary => {
            let mut inner = pair.into_inner().peekable();
            let negate = matches!(inner.peek().map(|p| p.as_rule()), Some(Rule::neg_op));
            if negate {
                inner.next();
            }
            let operand = lower_expr(inner.next().expect("primary is required"), schema)?;
            Ok(if negate {
                Expr::Binary(
                    Box::new(Expr::Literal(Literal::Int(0))),
                    BinOp::Sub,
                    Box::new(operand),
                )
            } else {
                operand
            })
        }
        Rule::primary => lower_expr(inner_single(pair), schema),
        Rule::if_expr => {
            let mut inner = pair.into_inner();
            let cond = lower_expr(inner.next().expect("IF condition required"), schema)?;
            let then = lower_expr(inner.next().expect("IF then-branch required"), schema)?;
            let or_else = lower_expr(inner.next().expect("IF else-branch required"), schema)?;
            Ok(Expr::Case {
                cond: Box::new(cond),
                then: Box::new(then),
                or_else: Box::new(or_else),
            })
        }
        Rule::function_call => {
            let mut inner = pair.into_inner();
            let name = inner.next().expect("function name required").as_str().to_lowercase();
            if !WHITELISTED_FUNCTIONS.contains(&name.as_str()) {
                return Err(FormulaError::UnknownFunction(name));
            }
            let args = inner
                .map(|p| lower_expr(p, schema))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Expr::FunctionCall { name, args })
        }
        Rule::column_ref => {
            let name = pair
                .into_inner()
                .next()
                .expect("column_ref always wraps an ident")
                .as_str()
                .to_string();
            if !schema.iter().any(|c| c.name == name) {
                return Err(FormulaError::UnresolvedColumn(name));
            }
            Ok(Expr::Column(name))
        }
        Rule::literal => lower_expr(inner_single(pair), schema),
        Rule::number => {
            let text = pair.as_str();
            if text.contains('.') {
                Ok(Expr::Literal(Literal::Float(text.parse().unwrap_or(0.0))))
            } else {
                Ok(Expr::Literal(Literal::Int(text.parse().unwrap_or(0))))
            }
        }
        Rule::string => {
            let raw = pair.as_str();
            let unquoted = &raw[1..raw.len() - 1];
            Ok(Expr::Literal(Literal::Str(unquoted.to_string())))
        }
        Rule::bool_lit => Ok(Expr::Literal(Literal::Bool(
            pair.as_str().eq_ignore_ascii_case("true"),
        ))),
        Rule::null_lit => Ok(Expr::Literal(Literal::Null)),
        other => unreachable!("lower_expr called on non-expression rule {other:?}"),
    }
}

fn inner_single(pair: Pair<Rule>) -> Pair<Rule> {
    pair.into_inner()
        .next()
        .expect("wrapper rule always has exactly one meaningful child")
}

fn comp_op(token: &str) -> BinOp {
    match token {
        "=" => BinOp::Eq,
        "!=" => BinOp::NotEq,
        "<" => BinOp::Lt,
        "<=" => BinOp::Lte,
        ">" => BinOp::Gt,
        ">=" => BinOp::Gte,
        other => unreachable!("grammar only emits known comparison tokens, got {other:?}"),
    }
}

fn lower_left_assoc(
    pair: Pair<Rule>,
    schema: &[ColumnSchema],
    ops: &[(&str, BinOp)],
) -> Result<Expr, FormulaError> {
    let mut inner = pair.into_inner();
    let mut acc = lower_expr(inner.next().expect("at least one operand required"), schema)?;
    let mut rest = inner.peekable();
    while let Some(op_pair) = rest.next() {
        let op = ops
            .iter()
            .find(|(name, _)| *name == rule_name(&op_pair))
            .map(|(_, op)| *op)
            .unwrap_or(ops[0].1);
        let rhs = lower_expr(rest.next().expect("operator is always followed by an operand"), schema)?;
        acc = Expr::Binary(Box::new(acc), op, Box::new(rhs));
    }
    Ok(acc)
}

fn lower_left_assoc_mixed(
    pair: Pair<Rule>,
    schema: &[ColumnSchema],
    op_for_token: impl Fn(&str) -> Option<BinOp>,
) -> Result<Expr, FormulaError> {
    let mut inner = pair.into_inner();
    let mut acc = lower_expr(inner.next().expect("at least one operand required"), schema)?;
    let mut rest = inner.peekable();
    while let Some(op_pair) = rest.next() {
        let op = op_for_token(op_pair.as_str()).unwrap_or(BinOp::Add);
        let rhs = lower_expr(rest.next().expect("operator is always followed by an operand"), schema)?;
        acc = Expr::Binary(Box::new(acc), op, Box::new(rhs));
    }
    Ok(acc)
}

fn rule_name(pair: &Pair<Rule>) -> &'static str {
    match pair.as_rule() {
        Rule::or_op => "or_op",
        Rule::and_op => "and_op",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vizql_types::DType;

    fn schema() -> Vec<ColumnSchema> {
        vec![
            ColumnSchema::new("price", DType::Float64, false),
            ColumnSchema::new("qty", DType::Int64, false),
        ]
    }

    #[test]
    fn arithmetic_over_columns_lowers_to_binary_tree() {
        let expr = compile("[price] * [qty]", &schema()).unwrap();
        match expr {
            Expr::Binary(l, BinOp::Mul, r) => {
                assert_eq!(*l, Expr::Column("price".to_string()));
                assert_eq!(*r, Expr::Column("qty".to_string()));
            }
            other => panic!("expected multiplication, got {other:?}"),
        }
    }

    #[test]
    fn unresolved_column_is_rejected() {
        let err = compile("[notional]", &schema()).unwrap_err();
        assert!(matches!(err, FormulaError::UnresolvedColumn(_)));
    }

    #[test]
    fn unknown_function_is_rejected() {
        let err = compile("exec('rm -rf /')", &schema()).unwrap_err();
        assert!(matches!(err, FormulaError::UnknownFunction(_)));
    }

    #[test]
    fn whitelisted_function_compiles() {
        let expr = compile("round([price], 2)", &schema());
        assert!(matches!(expr, Ok(Expr::FunctionCall { .. })));
    }

    #[test]
    fn if_conditional_lowers_to_case() {
        let expr = compile("IF([qty] > 0, [price], 0)", &schema()).unwrap();
        assert!(matches!(expr, Expr::Case { .. }));
    }

    #[test]
    fn string_and_numeric_literals_are_typed() {
        assert_eq!(
            compile("'AAPL'", &schema()).unwrap(),
            Expr::Literal(Literal::Str("AAPL".to_string()))
        );
        assert_eq!(
            compile("100", &schema()).unwrap(),
            Expr::Literal(Literal::Int(100))
        );
        assert_eq!(
            compile("1.5", &schema()).unwrap(),
            Expr::Literal(Literal::Float(1.5))
        );
    }
}
