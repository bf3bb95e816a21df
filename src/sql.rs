// SPDX-License-Identifier: BSD-3-Clause

//! The constrained SQL query surface.
//!
//! Accepts `select * from <table> [where <field><op><value> [and ...]*]`
//! plus optional `order by` / `limit`, nothing else: no joins, no
//! projections, no `OR`. The parsed table name is resolved against the
//! cluster by the caller; this module only performs syntax work.

use serde_json::Value as JsonValue;
use sqlparser::ast::{
    self, BinaryOperator, Expr, ObjectName, OrderByKind, SelectItem, SetExpr, Statement,
    TableFactor, Value as SqlValue,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::error::{Error, Result};
use crate::filter::{Condition, Operator};

/// Outcome of parsing one restricted `SELECT` statement.
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    /// Table token as written; plural, singular, short name or kind.
    pub table: String,
    /// `WHERE` predicates in source order.
    pub conditions: Vec<Condition>,
    pub order: Option<String>,
    pub limit: Option<u64>,
}

/// Parse a full `select * from ...` statement.
pub fn parse_select(sql: &str) -> Result<ParsedQuery> {
    let sql_trimmed = sql.trim().trim_end_matches(';');
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql_trimmed)
        .map_err(|e| Error::syntax(format!("{e} in {sql_trimmed:?}")))?;
    if statements.len() != 1 {
        return Err(Error::syntax(format!(
            "expected a single statement, got {} in {sql_trimmed:?}",
            statements.len()
        )));
    }

    let query = match &statements[0] {
        Statement::Query(q) => q,
        other => {
            return Err(Error::syntax(format!(
                "only SELECT is supported, got {other}"
            )))
        }
    };
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(Error::syntax("only plain SELECT is supported")),
    };

    if select.projection.len() != 1 || !matches!(select.projection[0], SelectItem::Wildcard(_)) {
        return Err(Error::syntax("only `select *` is supported"));
    }

    if select.from.len() != 1 {
        return Err(Error::syntax("exactly one table is required"));
    }
    let table = match &select.from[0].relation {
        TableFactor::Table { name, .. } => object_name_to_table(name)?,
        other => {
            return Err(Error::syntax(format!(
                "complex table expressions are not supported: {other}"
            )))
        }
    };

    let mut conditions = Vec::new();
    if let Some(selection) = &select.selection {
        extract_conditions(selection, &mut conditions)?;
    }

    let order = match &query.order_by {
        Some(ob) => Some(convert_order_by(ob)?),
        None => None,
    };
    let limit = extract_limit(query)?;

    Ok(ParsedQuery {
        table,
        conditions,
        order,
        limit,
    })
}

/// Parse a bare condition fragment such as `status.phase='Running'` or
/// `a='1' and b='2'`, used by the fluent `where_clause` call.
pub fn parse_conditions(fragment: &str) -> Result<Vec<Condition>> {
    let wrapped = format!("select * from _kubeq where {fragment}");
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, &wrapped)
        .map_err(|e| Error::syntax(format!("{e} in {fragment:?}")))?;
    let query = match statements.first() {
        Some(Statement::Query(q)) => q,
        _ => return Err(Error::syntax(format!("invalid condition {fragment:?}"))),
    };
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(Error::syntax(format!("invalid condition {fragment:?}"))),
    };
    let selection = select
        .selection
        .as_ref()
        .ok_or_else(|| Error::syntax(format!("invalid condition {fragment:?}")))?;
    let mut conditions = Vec::new();
    extract_conditions(selection, &mut conditions)?;
    Ok(conditions)
}

fn object_name_to_table(name: &ObjectName) -> Result<String> {
    let parts: Vec<&str> = name
        .0
        .iter()
        .filter_map(|part| part.as_ident())
        .map(|ident| ident.value.as_str())
        .collect();
    match parts.as_slice() {
        [table] => Ok(table.to_string()),
        _ => Err(Error::syntax(format!(
            "qualified table names are not supported: {name}"
        ))),
    }
}

fn extract_conditions(expr: &Expr, conditions: &mut Vec<Condition>) -> Result<()> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            BinaryOperator::And => {
                extract_conditions(left, conditions)?;
                extract_conditions(right, conditions)?;
            }
            BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq => {
                conditions.push(Condition {
                    field: extract_field(left)?,
                    operator: convert_operator(op)?,
                    value: extract_value(right)?,
                });
            }
            other => {
                return Err(Error::syntax(format!("unsupported operator {other}")));
            }
        },
        Expr::Nested(inner) => extract_conditions(inner, conditions)?,
        other => {
            return Err(Error::syntax(format!(
                "unsupported WHERE expression {other}"
            )));
        }
    }
    Ok(())
}

fn extract_field(expr: &Expr) -> Result<String> {
    match expr {
        Expr::Identifier(ident) => Ok(ident.value.clone()),
        Expr::CompoundIdentifier(idents) => Ok(idents
            .iter()
            .map(|i| i.value.as_str())
            .collect::<Vec<_>>()
            .join(".")),
        other => Err(Error::syntax(format!("expected a field name, got {other}"))),
    }
}

fn extract_value(expr: &Expr) -> Result<JsonValue> {
    match expr {
        Expr::Value(v) => match &v.value {
            SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => {
                Ok(JsonValue::String(s.clone()))
            }
            SqlValue::Number(n, _) => {
                let parsed: f64 = n
                    .parse()
                    .map_err(|_| Error::syntax(format!("invalid number {n:?}")))?;
                Ok(serde_json::Number::from_f64(parsed)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null))
            }
            SqlValue::Boolean(b) => Ok(JsonValue::Bool(*b)),
            SqlValue::Null => Ok(JsonValue::Null),
            other => Err(Error::syntax(format!("unsupported value {other}"))),
        },
        // Bare tokens on the right-hand side (`phase=Running`) arrive as
        // identifiers; treat them as strings.
        Expr::Identifier(ident) => Ok(JsonValue::String(ident.value.clone())),
        other => Err(Error::syntax(format!("expected a value, got {other}"))),
    }
}

fn convert_operator(op: &BinaryOperator) -> Result<Operator> {
    match op {
        BinaryOperator::Eq => Ok(Operator::Eq),
        BinaryOperator::NotEq => Ok(Operator::Ne),
        BinaryOperator::Lt => Ok(Operator::Lt),
        BinaryOperator::LtEq => Ok(Operator::Le),
        BinaryOperator::Gt => Ok(Operator::Gt),
        BinaryOperator::GtEq => Ok(Operator::Ge),
        other => Err(Error::syntax(format!("unsupported operator {other}"))),
    }
}

fn convert_order_by(order_by: &ast::OrderBy) -> Result<String> {
    match &order_by.kind {
        OrderByKind::Expressions(exprs) => {
            let first = exprs
                .first()
                .ok_or_else(|| Error::syntax("empty ORDER BY"))?;
            let field = extract_field(&first.expr)?;
            let descending = first.options.asc.map(|asc| !asc).unwrap_or(false);
            Ok(if descending {
                format!("{field} desc")
            } else {
                field
            })
        }
        OrderByKind::All(_) => Err(Error::syntax("ORDER BY ALL is not supported")),
    }
}

fn extract_limit(query: &ast::Query) -> Result<Option<u64>> {
    let Some(limit_clause) = &query.limit_clause else {
        return Ok(None);
    };
    let expr = match limit_clause {
        ast::LimitClause::LimitOffset { limit, .. } => match limit {
            Some(e) => e,
            None => return Ok(None),
        },
        ast::LimitClause::OffsetCommaLimit { limit, .. } => limit,
    };
    match expr {
        Expr::Value(v) => match &v.value {
            SqlValue::Number(n, _) => n
                .parse()
                .map(Some)
                .map_err(|_| Error::syntax(format!("invalid LIMIT {n:?}"))),
            other => Err(Error::syntax(format!("LIMIT must be a number, got {other}"))),
        },
        other => Err(Error::syntax(format!("LIMIT must be a number, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_select() {
        let q = parse_select("select * from pods").unwrap();
        assert_eq!(q.table, "pods");
        assert!(q.conditions.is_empty());
    }

    #[test]
    fn parses_where_with_quoted_and_bare_values() {
        let q = parse_select(
            "select * from pods where metadata.namespace='ns1' and status.phase=Running",
        )
        .unwrap();
        assert_eq!(q.conditions.len(), 2);
        assert_eq!(q.conditions[0].field, "metadata.namespace");
        assert_eq!(q.conditions[0].value, JsonValue::String("ns1".into()));
        assert_eq!(q.conditions[1].field, "status.phase");
        assert_eq!(q.conditions[1].value, JsonValue::String("Running".into()));
    }

    #[test]
    fn parses_label_condition() {
        let q = parse_select("select * from pods where labels.app='test'").unwrap();
        assert_eq!(q.conditions[0].field, "labels.app");
        assert_eq!(q.conditions[0].operator, Operator::Eq);
    }

    #[test]
    fn parses_order_and_limit() {
        let q = parse_select(
            "select * from pods order by metadata.creationTimestamp desc limit 10",
        )
        .unwrap();
        assert_eq!(q.order.as_deref(), Some("metadata.creationTimestamp desc"));
        assert_eq!(q.limit, Some(10));
    }

    #[test]
    fn rejects_projections_joins_and_or() {
        assert!(matches!(
            parse_select("select name from pods"),
            Err(Error::Syntax(_))
        ));
        assert!(matches!(
            parse_select("select * from pods, nodes"),
            Err(Error::Syntax(_))
        ));
        assert!(matches!(
            parse_select("select * from pods where a='1' or b='2'"),
            Err(Error::Syntax(_))
        ));
    }

    #[test]
    fn malformed_sql_reports_offending_text() {
        let err = parse_select("select * frm pods").unwrap_err();
        assert!(matches!(err, Error::Syntax(_)));
        assert!(err.to_string().contains("frm"));
    }

    #[test]
    fn parses_condition_fragment() {
        let conds = parse_conditions("status.phase='Running'").unwrap();
        assert_eq!(conds.len(), 1);
        assert_eq!(conds[0].field, "status.phase");
    }
}
