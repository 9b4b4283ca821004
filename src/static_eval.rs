//! Compile-time constant folding for static fragments.
//!
//! A static fragment whose expression is literal-only folds straight into the
//! skeleton text; everything else stays a fragment evaluated once at first
//! render.

use crate::scope::unwrap_expression;
use oxc_ast::ast::{BinaryOperator, Expression, UnaryOperator};

#[derive(Debug, Clone, PartialEq)]
pub enum ConstValue {
    Str(String),
    Num(f64),
    Bool(bool),
}

impl ConstValue {
    /// Renders the way JS string coercion would.
    pub fn render(&self) -> String {
        match self {
            ConstValue::Str(s) => s.clone(),
            ConstValue::Num(n) => render_number(*n),
            ConstValue::Bool(b) => b.to_string(),
        }
    }
}

fn render_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

/// Folds a literal-only expression to its value. `None` means the expression
/// involves something non-literal and must be evaluated at runtime.
pub fn fold_const(expr: &Expression) -> Option<ConstValue> {
    match unwrap_expression(expr) {
        Expression::StringLiteral(s) => Some(ConstValue::Str(s.value.to_string())),
        Expression::NumericLiteral(n) => Some(ConstValue::Num(n.value)),
        Expression::BooleanLiteral(b) => Some(ConstValue::Bool(b.value)),
        Expression::TemplateLiteral(tpl) if tpl.expressions.is_empty() => {
            let mut out = String::new();
            for quasi in &tpl.quasis {
                match &quasi.value.cooked {
                    Some(cooked) => out.push_str(cooked),
                    None => out.push_str(&quasi.value.raw),
                }
            }
            Some(ConstValue::Str(out))
        }
        Expression::UnaryExpression(unary) => {
            let value = fold_const(&unary.argument)?;
            match unary.operator {
                UnaryOperator::UnaryNegation => match value {
                    ConstValue::Num(n) => Some(ConstValue::Num(-n)),
                    _ => None,
                },
                UnaryOperator::UnaryPlus => match value {
                    ConstValue::Num(n) => Some(ConstValue::Num(n)),
                    _ => None,
                },
                // Truthiness coercion of non-booleans is left to the runtime.
                UnaryOperator::LogicalNot => match value {
                    ConstValue::Bool(b) => Some(ConstValue::Bool(!b)),
                    _ => None,
                },
                _ => None,
            }
        }
        Expression::BinaryExpression(binary) => {
            let left = fold_const(&binary.left)?;
            let right = fold_const(&binary.right)?;
            match binary.operator {
                BinaryOperator::Addition => match (left, right) {
                    (ConstValue::Num(a), ConstValue::Num(b)) => Some(ConstValue::Num(a + b)),
                    (a, b)
                        if matches!(a, ConstValue::Str(_)) || matches!(b, ConstValue::Str(_)) =>
                    {
                        Some(ConstValue::Str(format!("{}{}", a.render(), b.render())))
                    }
                    _ => None,
                },
                BinaryOperator::Subtraction => num_op(left, right, |a, b| a - b),
                BinaryOperator::Multiplication => num_op(left, right, |a, b| a * b),
                BinaryOperator::Division => num_op(left, right, |a, b| a / b),
                BinaryOperator::Remainder => num_op(left, right, |a, b| a % b),
                BinaryOperator::Exponential => num_op(left, right, |a, b| a.powf(b)),
                _ => None,
            }
        }
        _ => None,
    }
}

fn num_op(
    left: ConstValue,
    right: ConstValue,
    op: impl Fn(f64, f64) -> f64,
) -> Option<ConstValue> {
    match (left, right) {
        (ConstValue::Num(a), ConstValue::Num(b)) => Some(ConstValue::Num(op(a, b))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxc_allocator::Allocator;
    use oxc_parser::Parser;
    use oxc_span::SourceType;

    fn fold(source: &str) -> Option<String> {
        let allocator = Allocator::default();
        let source_type = SourceType::default().with_typescript(true);
        let expr = Parser::new(&allocator, source, source_type)
            .parse_expression()
            .expect("fixture must parse");
        fold_const(&expr).map(|v| v.render())
    }

    #[test]
    fn folds_arithmetic() {
        assert_eq!(fold("1 + 2"), Some("3".to_string()));
        assert_eq!(fold("-4 * 2"), Some("-8".to_string()));
        assert_eq!(fold("7 % 4"), Some("3".to_string()));
        assert_eq!(fold("2.5 + 0.25"), Some("2.75".to_string()));
    }

    #[test]
    fn folds_string_concatenation() {
        assert_eq!(fold("\"a\" + \"b\""), Some("ab".to_string()));
        assert_eq!(fold("\"v\" + 2"), Some("v2".to_string()));
    }

    #[test]
    fn folds_plain_template_literals() {
        assert_eq!(fold("`hello world`"), Some("hello world".to_string()));
    }

    #[test]
    fn folds_booleans() {
        assert_eq!(fold("!false"), Some("true".to_string()));
        assert_eq!(fold("true"), Some("true".to_string()));
    }

    #[test]
    fn leaves_identifiers_alone() {
        assert_eq!(fold("1 + x"), None);
        assert_eq!(fold("`a ${b}`"), None);
        assert_eq!(fold("fn()"), None);
    }

    #[test]
    fn folds_parenthesized() {
        assert_eq!(fold("(2 + 3) * 4"), Some("20".to_string()));
    }
}
