use std::collections::HashMap;

use chrono::{DateTime, NaiveDate};
use sqlparser::ast::{
    self, AssignmentTarget, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

/// How a `SELECT … FROM bookings` is keyed.
#[derive(Debug, Clone, PartialEq)]
pub enum BookingFilter {
    Id(Ulid),
    Student {
        student_id: Ulid,
        idempotency_key: Option<String>,
    },
    Teacher(Ulid),
}

/// Parsed command from SQL input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ReplaceAvailability {
        teacher_id: Ulid,
        rules: Vec<AvailabilityRule>,
    },
    ClearAvailability {
        teacher_id: Ulid,
    },
    SelectAvailability {
        teacher_id: Ulid,
        /// With a day only that day's active rules; without, every rule.
        day_of_week: Option<u8>,
    },
    SelectSlots {
        teacher_id: Ulid,
        date: NaiveDate,
        duration_minutes: u32,
        step_minutes: Option<u32>,
    },
    InsertBooking {
        student_id: Ulid,
        teacher_id: Ulid,
        topic_id: Ulid,
        start: Ms,
        duration_minutes: u32,
        idempotency_key: Option<String>,
    },
    UpdateBookingStatus {
        id: Ulid,
        status: BookingStatus,
        admin_override: bool,
        actor: Actor,
    },
    CancelBooking {
        id: Ulid,
        actor: Actor,
    },
    SelectBookings {
        filter: BookingFilter,
    },
    InsertPackage {
        package: LessonPackage,
    },
    SelectPackages {
        student_id: Ulid,
    },
    SelectAttendanceLog {
        booking_id: Ulid,
    },
    Listen {
        channel: String,
    },
    Unlisten {
        channel: String,
    },
    UnlistenAll,
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        return Ok(Command::Listen {
            channel: channel_name(&trimmed[7..])?,
        });
    }
    if upper == "UNLISTEN *" {
        return Ok(Command::UnlistenAll);
    }
    if upper.starts_with("UNLISTEN ") {
        return Ok(Command::Unlisten {
            channel: channel_name(&trimmed[9..])?,
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn channel_name(raw: &str) -> Result<String, SqlError> {
    let channel = raw.trim().trim_matches('"').to_string();
    if channel.is_empty() || !channel.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SqlError::Parse(format!("bad channel name: {raw:?}")));
    }
    Ok(channel)
}

// ── INSERT ────────────────────────────────────────────────────

const AVAILABILITY_COLUMNS: &[&str] = &["teacher_id", "day_of_week", "start_time", "end_time", "is_active"];
const BOOKING_COLUMNS: &[&str] = &["student_id", "teacher_id", "topic_id", "start", "duration", "idempotency_key"];
const PACKAGE_COLUMNS: &[&str] = &["id", "student_id", "total_lessons", "valid_until", "used_lessons"];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let known = match table.as_str() {
        "availability" => AVAILABILITY_COLUMNS,
        "bookings" => BOOKING_COLUMNS,
        "packages" => PACKAGE_COLUMNS,
        _ => return Err(SqlError::UnknownTable(table)),
    };
    let rows = insert_rows(insert, known)?;

    match table.as_str() {
        "availability" => {
            let mut teacher_id = None;
            let mut rules = Vec::with_capacity(rows.len());
            for (i, row) in rows.iter().enumerate() {
                let t = parse_ulid(required(row, "teacher_id")?)?;
                if *teacher_id.get_or_insert(t) != t {
                    return Err(SqlError::Parse(format!(
                        "row {i}: every availability row must name the same teacher"
                    )));
                }
                let day = parse_u32(required(row, "day_of_week")?)?;
                let mut rule = AvailabilityRule::new(
                    u8::try_from(day).unwrap_or(u8::MAX),
                    parse_minute(required(row, "start_time")?)?,
                    parse_minute(required(row, "end_time")?)?,
                );
                if let Some(expr) = row.get("is_active") {
                    rule.is_active = parse_bool(expr)?;
                }
                rules.push(rule);
            }
            let teacher_id = teacher_id.ok_or(SqlError::Parse("empty VALUES".into()))?;
            Ok(Command::ReplaceAvailability { teacher_id, rules })
        }
        "bookings" => {
            let row = single_row(&rows, "bookings")?;
            Ok(Command::InsertBooking {
                student_id: parse_ulid(required(row, "student_id")?)?,
                teacher_id: parse_ulid(required(row, "teacher_id")?)?,
                topic_id: parse_ulid(required(row, "topic_id")?)?,
                start: parse_instant(required(row, "start")?)?,
                duration_minutes: parse_u32(required(row, "duration")?)?,
                idempotency_key: row.get("idempotency_key").map(|e| parse_string_or_null(e)).transpose()?.flatten(),
            })
        }
        _ => {
            let row = single_row(&rows, "packages")?;
            let used_lessons = match row.get("used_lessons") {
                Some(expr) => parse_u32(expr)?,
                None => 0,
            };
            Ok(Command::InsertPackage {
                package: LessonPackage {
                    id: parse_ulid(required(row, "id")?)?,
                    student_id: parse_ulid(required(row, "student_id")?)?,
                    total_lessons: parse_u32(required(row, "total_lessons")?)?,
                    used_lessons,
                    valid_until: parse_instant(required(row, "valid_until")?)?,
                },
            })
        }
    }
}

type Row<'a> = HashMap<String, &'a Expr>;

/// Pair every VALUES row with its column names. Without a column list,
/// values are taken in the table's default column order.
fn insert_rows<'a>(insert: &'a ast::Insert, known: &[&str]) -> Result<Vec<Row<'a>>, SqlError> {
    let columns: Vec<String> = if insert.columns.is_empty() {
        known.iter().map(|c| c.to_string()).collect()
    } else {
        insert.columns.iter().map(|c| c.value.to_lowercase()).collect()
    };
    if let Some(unknown) = columns.iter().find(|c| !known.contains(&c.as_str())) {
        return Err(SqlError::UnknownColumn(unknown.clone()));
    }

    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    let values = match body.body.as_ref() {
        SetExpr::Values(values) => values,
        _ => return Err(SqlError::Parse("expected VALUES".into())),
    };
    if values.rows.is_empty() {
        return Err(SqlError::Parse("empty VALUES".into()));
    }

    let mut rows = Vec::with_capacity(values.rows.len());
    for (i, exprs) in values.rows.iter().enumerate() {
        if exprs.len() > columns.len() {
            return Err(SqlError::Parse(format!(
                "row {i}: {} values for {} columns",
                exprs.len(),
                columns.len()
            )));
        }
        rows.push(columns.iter().cloned().zip(exprs.iter()).collect());
    }
    Ok(rows)
}

fn single_row<'r, 'a>(rows: &'r [Row<'a>], table: &'static str) -> Result<&'r Row<'a>, SqlError> {
    match rows {
        [row] => Ok(row),
        _ => Err(SqlError::Unsupported(format!("multi-row INSERT into {table}"))),
    }
}

fn required<'a>(row: &Row<'a>, column: &'static str) -> Result<&'a Expr, SqlError> {
    row.get(column).copied().ok_or(SqlError::MissingColumn(column))
}

// ── DELETE / UPDATE ───────────────────────────────────────────

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = where_filters(delete.selection.as_ref())?;

    match table.as_str() {
        "availability" => {
            only_columns(&filters, &["teacher_id"])?;
            Ok(Command::ClearAvailability {
                teacher_id: parse_ulid(filter(&filters, "teacher_id")?)?,
            })
        }
        "bookings" => {
            only_columns(&filters, &["id", "actor"])?;
            Ok(Command::CancelBooking {
                id: parse_ulid(filter(&filters, "id")?)?,
                actor: actor_filter(&filters)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let name = table_factor_name(&table.relation)?;
    if name != "bookings" {
        return Err(SqlError::UnknownTable(name));
    }

    let mut status = None;
    let mut admin_override = false;
    for assignment in assignments {
        let column = match &assignment.target {
            AssignmentTarget::ColumnName(name) => object_name_last(name),
            AssignmentTarget::Tuple(_) => None,
        }
        .ok_or(SqlError::Unsupported("tuple assignment".into()))?;
        match column.as_str() {
            "status" => {
                let raw = parse_string(&assignment.value)?;
                status = Some(raw.parse::<BookingStatus>().map_err(SqlError::Parse)?);
            }
            "admin_override" => admin_override = parse_bool(&assignment.value)?,
            _ => return Err(SqlError::UnknownColumn(column)),
        }
    }

    let filters = where_filters(selection.as_ref())?;
    only_columns(&filters, &["id", "actor"])?;
    Ok(Command::UpdateBookingStatus {
        id: parse_ulid(filter(&filters, "id")?)?,
        status: status.ok_or(SqlError::MissingColumn("status"))?,
        admin_override,
        actor: actor_filter(&filters)?,
    })
}

/// Requests without an `actor` filter run as the system.
fn actor_filter(filters: &Filters<'_>) -> Result<Actor, SqlError> {
    match filters.get("actor") {
        Some(expr) => parse_string(expr)?.parse().map_err(SqlError::Parse),
        None => Ok(Actor::System),
    }
}

// ── SELECT ────────────────────────────────────────────────────

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };
    let Some(from) = select.from.first() else {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    };
    let table = table_factor_name(&from.relation)?;
    let filters = where_filters(select.selection.as_ref())?;

    match table.as_str() {
        "availability" => {
            only_columns(&filters, &["teacher_id", "day_of_week"])?;
            let day_of_week = match filters.get("day_of_week") {
                Some(expr) => Some(u8::try_from(parse_u32(expr)?).unwrap_or(u8::MAX)),
                None => None,
            };
            Ok(Command::SelectAvailability {
                teacher_id: parse_ulid(filter(&filters, "teacher_id")?)?,
                day_of_week,
            })
        }
        "bookable_slots" => {
            only_columns(&filters, &["teacher_id", "date", "duration", "step"])?;
            Ok(Command::SelectSlots {
                teacher_id: parse_ulid(filter(&filters, "teacher_id")?)?,
                date: parse_date(filter(&filters, "date")?)?,
                duration_minutes: parse_u32(filter(&filters, "duration")?)?,
                step_minutes: filters.get("step").map(|e| parse_u32(e)).transpose()?,
            })
        }
        "bookings" => {
            only_columns(&filters, &["id", "student_id", "teacher_id", "idempotency_key"])?;
            let filter = if let Some(id) = filters.get("id") {
                BookingFilter::Id(parse_ulid(id)?)
            } else if let Some(student) = filters.get("student_id") {
                BookingFilter::Student {
                    student_id: parse_ulid(student)?,
                    idempotency_key: filters.get("idempotency_key").map(|e| parse_string(e)).transpose()?,
                }
            } else if let Some(teacher) = filters.get("teacher_id") {
                BookingFilter::Teacher(parse_ulid(teacher)?)
            } else {
                return Err(SqlError::MissingFilter("id, student_id or teacher_id"));
            };
            Ok(Command::SelectBookings { filter })
        }
        "packages" => {
            only_columns(&filters, &["student_id"])?;
            Ok(Command::SelectPackages {
                student_id: parse_ulid(filter(&filters, "student_id")?)?,
            })
        }
        "attendance_log" => {
            only_columns(&filters, &["booking_id"])?;
            Ok(Command::SelectAttendanceLog {
                booking_id: parse_ulid(filter(&filters, "booking_id")?)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

// ── WHERE ─────────────────────────────────────────────────────

type Filters<'a> = HashMap<String, &'a Expr>;

/// Flatten `col = value AND col = value …` into a column map.
fn where_filters(selection: Option<&Expr>) -> Result<Filters<'_>, SqlError> {
    let mut filters = HashMap::new();
    if let Some(expr) = selection {
        collect_eq_filters(expr, &mut filters)?;
    }
    Ok(filters)
}

fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Filters<'a>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::And,
            right,
        } => {
            collect_eq_filters(left, out)?;
            collect_eq_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } => {
            let column = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.insert(column, right.as_ref());
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("filter {other}"))),
    }
}

fn only_columns(filters: &Filters<'_>, allowed: &[&str]) -> Result<(), SqlError> {
    match filters.keys().find(|k| !allowed.contains(&k.as_str())) {
        Some(unknown) => Err(SqlError::UnknownColumn(unknown.clone())),
        None => Ok(()),
    }
}

fn filter<'a>(filters: &Filters<'a>, column: &'static str) -> Result<&'a Expr, SqlError> {
    filters.get(column).copied().ok_or(SqlError::MissingFilter(column))
}

// ── Helpers ───────────────────────────────────────────────────

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
    if let Some(first) = tables_with_joins.first() {
        table_factor_name(&first.relation)
    } else {
        Err(SqlError::Parse("DELETE without table".into()))
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

/// String literal or bare number, as text.
fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_string(expr).map(Some),
    }
}

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID {s:?}: {e}")))
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(-parse_i64(expr)?);
    }
    let s = parse_string(expr)?;
    s.parse().map_err(|e| SqlError::Parse(format!("bad integer {s:?}: {e}")))
}

fn parse_u32(expr: &Expr) -> Result<u32, SqlError> {
    let v = parse_i64(expr)?;
    u32::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    match extract_value(expr) {
        Some(Value::Boolean(b)) => Ok(*b),
        Some(Value::SingleQuotedString(s)) => match s.to_lowercase().as_str() {
            "true" | "t" | "1" => Ok(true),
            "false" | "f" | "0" => Ok(false),
            _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
        },
        Some(Value::Number(n, _)) => Ok(n != "0"),
        _ => Err(SqlError::Parse(format!("expected bool, got {expr}"))),
    }
}

/// Unix ms, or an RFC 3339 timestamp string.
fn parse_instant(expr: &Expr) -> Result<Ms, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.contains('T')
    {
        return DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| SqlError::Parse(format!("bad timestamp {s:?}: {e}")));
    }
    parse_i64(expr)
}

/// `'HH:MM'` or a minute offset from midnight.
fn parse_minute(expr: &Expr) -> Result<u16, SqlError> {
    if let Some(Value::SingleQuotedString(s)) = extract_value(expr)
        && s.contains(':')
    {
        return parse_time_of_day(s).ok_or_else(|| SqlError::Parse(format!("bad time of day: {s:?}")));
    }
    let v = parse_i64(expr)?;
    u16::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of range")))
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date {s:?}: {e}")))
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
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("missing column: {0}")]
    MissingColumn(&'static str),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
}
