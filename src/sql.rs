use std::collections::HashMap;

use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::engine::{parse_civil_date, parse_clock_time, parse_instant};
use crate::model::*;

/// Parsed command from SQL input.
///
/// INSERT values are positional, in the column order each variant lists.
#[derive(Debug, PartialEq)]
pub enum Command {
    /// `bookings (id, user_id, date_time, reservation_type_id)`
    InsertBooking {
        id: Ulid,
        user_id: String,
        date_time: Ms,
        reservation_type_id: Option<Ulid>,
    },
    /// `DELETE FROM bookings WHERE id = .. AND user_id = ..`. Soft cancel.
    CancelBooking {
        id: Ulid,
        user_id: String,
    },
    /// `urgent_requests (id, user_id, message)`
    InsertUrgentRequest {
        id: Ulid,
        user_id: String,
        message: String,
    },
    /// `urgent_request_decisions (id, status)`
    ResolveUrgentRequest {
        id: Ulid,
        status: UrgentStatus,
    },
    /// `availability (id, date, from_hour, to_hour)`
    SetAvailability {
        id: Ulid,
        date: CivilDate,
        from_hour: ClockTime,
        to_hour: ClockTime,
    },
    /// `reservation_types (id, name, duration_minutes, description)`
    InsertReservationType {
        id: Ulid,
        name: String,
        duration_minutes: u32,
        description: Option<String>,
    },
    /// `quota (max_bookings_per_user)`
    SetQuota {
        max_bookings_per_user: Option<u32>,
    },
    SelectAvailability,
    SelectBookings {
        user_id: Option<String>,
    },
    SelectReservationTypes,
    SelectSlots {
        date: CivilDate,
    },
    SelectBookableDates,
    SelectUrgentRequest {
        user_id: String,
    },
    SelectQuota,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(first) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match first {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;
    let arg = |i: usize| values.get(i);

    match table.as_str() {
        "bookings" => {
            require(&values, "bookings", 3)?;
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                user_id: parse_string(&values[1])?,
                date_time: parse_instant_expr(&values[2])?,
                reservation_type_id: arg(3).map(parse_ulid_or_null).transpose()?.flatten(),
            })
        }
        "urgent_requests" => {
            require(&values, "urgent_requests", 3)?;
            Ok(Command::InsertUrgentRequest {
                id: parse_ulid(&values[0])?,
                user_id: parse_string(&values[1])?,
                message: parse_string(&values[2])?,
            })
        }
        "urgent_request_decisions" => {
            require(&values, "urgent_request_decisions", 2)?;
            let raw = parse_string(&values[1])?;
            let status = UrgentStatus::parse(&raw)
                .ok_or_else(|| SqlError::Parse(format!("bad urgent request status: {raw}")))?;
            Ok(Command::ResolveUrgentRequest {
                id: parse_ulid(&values[0])?,
                status,
            })
        }
        "availability" => {
            require(&values, "availability", 4)?;
            Ok(Command::SetAvailability {
                id: parse_ulid(&values[0])?,
                date: parse_date_expr(&values[1])?,
                from_hour: parse_time_expr(&values[2])?,
                to_hour: parse_time_expr(&values[3])?,
            })
        }
        "reservation_types" => {
            require(&values, "reservation_types", 3)?;
            Ok(Command::InsertReservationType {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
                duration_minutes: parse_u32(&values[2])?,
                description: arg(3).map(parse_string_or_null).transpose()?.flatten(),
            })
        }
        "quota" => {
            require(&values, "quota", 1)?;
            let max_bookings_per_user = if is_null(&values[0]) {
                None
            } else {
                Some(parse_u32(&values[0])?)
            };
            Ok(Command::SetQuota { max_bookings_per_user })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "bookings" {
        return Err(SqlError::Unsupported(format!("DELETE FROM {table}")));
    }
    let filters = extract_filters(delete.selection.as_ref())?;
    Ok(Command::CancelBooking {
        id: parse_ulid(filters.get("id").ok_or(SqlError::MissingFilter("id"))?)?,
        user_id: parse_string(filters.get("user_id").ok_or(SqlError::MissingFilter("user_id"))?)?,
    })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = extract_filters(select.selection.as_ref())?;

    match table.as_str() {
        "availability" => Ok(Command::SelectAvailability),
        "bookings" => Ok(Command::SelectBookings {
            user_id: filters.get("user_id").map(parse_string).transpose()?,
        }),
        "reservation_types" => Ok(Command::SelectReservationTypes),
        "slots" => Ok(Command::SelectSlots {
            date: parse_date_expr(filters.get("date").ok_or(SqlError::MissingFilter("date"))?)?,
        }),
        "bookable_dates" => Ok(Command::SelectBookableDates),
        "urgent_requests" => Ok(Command::SelectUrgentRequest {
            user_id: parse_string(filters.get("user_id").ok_or(SqlError::MissingFilter("user_id"))?)?,
        }),
        "quota" => Ok(Command::SelectQuota),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Collect `column = value` terms of an AND-chain. Other predicates are rejected.
fn extract_filters(selection: Option<&Expr>) -> Result<HashMap<String, Expr>, SqlError> {
    let mut filters = HashMap::new();
    if let Some(expr) = selection {
        collect_eq_terms(expr, &mut filters)?;
    }
    Ok(filters)
}

fn collect_eq_terms(expr: &Expr, out: &mut HashMap<String, Expr>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op: ast::BinaryOperator::And, right } => {
            collect_eq_terms(left, out)?;
            collect_eq_terms(right, out)
        }
        Expr::BinaryOp { left, op: ast::BinaryOperator::Eq, right } => {
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.insert(col, right.as_ref().clone());
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_terms(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn require(values: &[Expr], table: &'static str, min: usize) -> Result<(), SqlError> {
    if values.len() < min {
        return Err(SqlError::WrongArity(table, min, values.len()));
    }
    Ok(())
}

fn object_name_last(name: &ast::ObjectName) -> Option<String> {
    name.0.last().and_then(|part| match part {
        ObjectNamePart::Identifier(ident) => Some(ident.value.to_lowercase()),
        _ => None,
    })
}

fn insert_table_name(insert: &ast::Insert) -> Result<String, SqlError> {
    match &insert.table {
        TableObject::TableName(name) => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("unsupported table object in INSERT".into())),
    }
}

fn delete_table_name(delete: &ast::Delete) -> Result<String, SqlError> {
    let tables_with_joins = match &delete.from {
        FromTable::WithFromKeyword(t) | FromTable::WithoutKeyword(t) => t,
    };
    match tables_with_joins.first() {
        Some(first) => table_factor_name(&first.relation),
        None => Err(SqlError::Parse("DELETE without table".into())),
    }
}

fn table_factor_name(tf: &TableFactor) -> Result<String, SqlError> {
    match tf {
        TableFactor::Table { name, .. } => {
            object_name_last(name).ok_or_else(|| SqlError::Parse("empty table name".into()))
        }
        _ => Err(SqlError::Parse("complex table expression".into())),
    }
}

/// First VALUES row. Multi-row inserts are refused: every write is one
/// engine operation with its own outcome.
fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => match values.rows.as_slice() {
            [] => Err(SqlError::Parse("empty VALUES".into())),
            [row] => Ok(row.clone()),
            _ => Err(SqlError::Unsupported("multi-row INSERT".into())),
        },
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn expr_column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.to_lowercase()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.to_lowercase()),
        _ => None,
    }
}

fn extract_value(expr: &Expr) -> Option<&Value> {
    match expr {
        Expr::Value(ValueWithSpan { value, .. }) => Some(value),
        _ => None,
    }
}

fn is_null(expr: &Expr) -> bool {
    matches!(extract_value(expr), Some(Value::Null))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(other) => Err(SqlError::Parse(format!("expected string, got {other}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    if is_null(expr) {
        return Ok(None);
    }
    parse_ulid(expr).map(Some)
}

fn parse_i64_expr(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp { op: ast::UnaryOperator::Minus, expr } = expr {
        return Ok(-parse_i64_expr(expr)?);
    }
    let s = parse_string(expr)?;
    s.parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64_expr(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u32 range")))
}

fn parse_instant_expr(expr: &Expr) -> Result<Ms, SqlError> {
    parse_instant(&parse_string(expr)?).map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_date_expr(expr: &Expr) -> Result<CivilDate, SqlError> {
    parse_civil_date(&parse_string(expr)?).map_err(|e| SqlError::Parse(e.to_string()))
}

fn parse_time_expr(expr: &Expr) -> Result<ClockTime, SqlError> {
    parse_clock_time(&parse_string(expr)?).map_err(|e| SqlError::Parse(e.to_string()))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected at least {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
