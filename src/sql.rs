use chrono::NaiveDate;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::{parse_hhmm, BookingStatus, Minutes};

/// Date filter on a slots query. A missing filter means today; a
/// malformed date is remembered as such so the query can return the
/// documented empty result instead of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateParam {
    Today,
    On(NaiveDate),
    Invalid,
}

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertShop {
        id: Ulid,
        name: String,
    },
    DeleteShop {
        id: Ulid,
    },
    SetHours {
        shop_id: Ulid,
        weekday: u8,
        open: Option<Minutes>,
        close: Option<Minutes>,
        closed: bool,
    },
    InsertClosure {
        shop_id: Ulid,
        date: NaiveDate,
        start: Option<Minutes>,
        end: Option<Minutes>,
    },
    DeleteClosure {
        shop_id: Ulid,
        date: NaiveDate,
    },
    InsertService {
        id: Ulid,
        shop_id: Ulid,
        name: String,
        duration_min: Minutes,
        price_cents: i64,
        buffer_before: Minutes,
        buffer_after: Minutes,
    },
    DeleteService {
        id: Ulid,
    },
    InsertStaff {
        id: Ulid,
        shop_id: Ulid,
        name: String,
    },
    DeleteStaff {
        id: Ulid,
    },
    SetStaffHours {
        staff_id: Ulid,
        weekday: u8,
        start: Option<Minutes>,
        end: Option<Minutes>,
        day_off: bool,
    },
    AssignService {
        staff_id: Ulid,
        service_id: Ulid,
    },
    UnassignService {
        staff_id: Ulid,
        service_id: Ulid,
    },
    InsertTimeOff {
        id: Ulid,
        staff_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        approved: bool,
    },
    DeleteTimeOff {
        id: Ulid,
    },
    InsertBooking {
        id: Ulid,
        staff_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        start: Minutes,
        status: Option<BookingStatus>,
        customer: Option<String>,
    },
    DeleteBooking {
        id: Ulid,
    },
    SetBookingStatus {
        id: Ulid,
        status: BookingStatus,
        reason: Option<String>,
    },
    SelectShops,
    SelectServices {
        shop_id: Ulid,
    },
    SelectStaff {
        shop_id: Ulid,
        service_id: Option<Ulid>,
    },
    SelectSlots {
        shop_id: Ulid,
        service_id: Ulid,
        staff_id: Option<Ulid>,
        date: DateParam,
    },
    SelectBookings {
        shop_id: Ulid,
        date: Option<NaiveDate>,
        staff_id: Option<Ulid>,
        status: Option<BookingStatus>,
    },
    SelectStats {
        shop_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
    },
    Listen {
        channel: String,
    },
    /// `None` means `UNLISTEN *`.
    Unlisten {
        channel: Option<String>,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let trimmed = sql.trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("LISTEN ") {
        let channel = trimmed[7..].trim().trim_matches(';').to_string();
        return Ok(Command::Listen { channel });
    }
    if upper.starts_with("UNLISTEN") {
        let channel = trimmed[8..].trim().trim_matches(';').to_string();
        return Ok(Command::Unlisten {
            channel: if channel == "*" || channel.is_empty() {
                None
            } else {
                Some(channel)
            },
        });
    }

    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => parse_update(table, assignments, selection),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "shops" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("shops", 2, values.len()));
            }
            Ok(Command::InsertShop {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
            })
        }
        "hours" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("hours", 5, values.len()));
            }
            Ok(Command::SetHours {
                shop_id: parse_ulid(&values[0])?,
                weekday: parse_u8(&values[1])?,
                open: parse_time_or_null(&values[2])?,
                close: parse_time_or_null(&values[3])?,
                closed: parse_bool(&values[4])?,
            })
        }
        "closures" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("closures", 2, values.len()));
            }
            let start = if values.len() >= 3 {
                parse_time_or_null(&values[2])?
            } else {
                None
            };
            let end = if values.len() >= 4 {
                parse_time_or_null(&values[3])?
            } else {
                None
            };
            Ok(Command::InsertClosure {
                shop_id: parse_ulid(&values[0])?,
                date: parse_date(&values[1])?,
                start,
                end,
            })
        }
        "services" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("services", 5, values.len()));
            }
            let buffer_before = if values.len() >= 6 {
                parse_i64(&values[5])? as Minutes
            } else {
                0
            };
            let buffer_after = if values.len() >= 7 {
                parse_i64(&values[6])? as Minutes
            } else {
                0
            };
            Ok(Command::InsertService {
                id: parse_ulid(&values[0])?,
                shop_id: parse_ulid(&values[1])?,
                name: parse_string(&values[2])?,
                duration_min: parse_i64(&values[3])? as Minutes,
                price_cents: parse_i64(&values[4])?,
                buffer_before,
                buffer_after,
            })
        }
        "staff" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("staff", 3, values.len()));
            }
            Ok(Command::InsertStaff {
                id: parse_ulid(&values[0])?,
                shop_id: parse_ulid(&values[1])?,
                name: parse_string(&values[2])?,
            })
        }
        "staff_hours" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("staff_hours", 5, values.len()));
            }
            Ok(Command::SetStaffHours {
                staff_id: parse_ulid(&values[0])?,
                weekday: parse_u8(&values[1])?,
                start: parse_time_or_null(&values[2])?,
                end: parse_time_or_null(&values[3])?,
                day_off: parse_bool(&values[4])?,
            })
        }
        "staff_services" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("staff_services", 2, values.len()));
            }
            Ok(Command::AssignService {
                staff_id: parse_ulid(&values[0])?,
                service_id: parse_ulid(&values[1])?,
            })
        }
        "time_off" => {
            if values.len() < 4 {
                return Err(SqlError::WrongArity("time_off", 4, values.len()));
            }
            let approved = if values.len() >= 5 {
                parse_bool(&values[4])?
            } else {
                true
            };
            Ok(Command::InsertTimeOff {
                id: parse_ulid(&values[0])?,
                staff_id: parse_ulid(&values[1])?,
                start_date: parse_date(&values[2])?,
                end_date: parse_date(&values[3])?,
                approved,
            })
        }
        "bookings" => {
            if values.len() < 5 {
                return Err(SqlError::WrongArity("bookings", 5, values.len()));
            }
            let status = if values.len() >= 6 {
                parse_status_or_null(&values[5])?
            } else {
                None
            };
            let customer = if values.len() >= 7 {
                parse_string_or_null(&values[6])?
            } else {
                None
            };
            Ok(Command::InsertBooking {
                id: parse_ulid(&values[0])?,
                staff_id: parse_ulid(&values[1])?,
                service_id: parse_ulid(&values[2])?,
                date: parse_date(&values[3])?,
                start: parse_time(&values[4])?,
                status,
                customer,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let filters = extract_eq_filters(&delete.selection)?;

    match table.as_str() {
        "shops" => Ok(Command::DeleteShop { id: require_ulid(&filters, "id")? }),
        "services" => Ok(Command::DeleteService { id: require_ulid(&filters, "id")? }),
        "staff" => Ok(Command::DeleteStaff { id: require_ulid(&filters, "id")? }),
        "time_off" => Ok(Command::DeleteTimeOff { id: require_ulid(&filters, "id")? }),
        "bookings" => Ok(Command::DeleteBooking { id: require_ulid(&filters, "id")? }),
        "closures" => Ok(Command::DeleteClosure {
            shop_id: require_ulid(&filters, "shop_id")?,
            date: require_date(&filters, "date")?,
        }),
        "staff_services" => Ok(Command::UnassignService {
            staff_id: require_ulid(&filters, "staff_id")?,
            service_id: require_ulid(&filters, "service_id")?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_update(
    table: &ast::TableWithJoins,
    assignments: &[ast::Assignment],
    selection: &Option<Expr>,
) -> Result<Command, SqlError> {
    let table = table_factor_name(&table.relation)?;
    if table != "bookings" {
        return Err(SqlError::UnknownTable(table));
    }

    let mut status = None;
    let mut reason = None;
    for assignment in assignments {
        match assignment_column(assignment).as_deref() {
            Some("status") => {
                let s = parse_string(&assignment.value)?;
                status = Some(
                    BookingStatus::parse(&s)
                        .ok_or_else(|| SqlError::Parse(format!("bad status: {s}")))?,
                );
            }
            Some("reason") => reason = parse_string_or_null(&assignment.value)?,
            _ => return Err(SqlError::Unsupported("only status/reason can be updated".into())),
        }
    }
    let status = status.ok_or(SqlError::MissingFilter("status"))?;

    let filters = extract_eq_filters(selection)?;
    Ok(Command::SetBookingStatus {
        id: require_ulid(&filters, "id")?,
        status,
        reason,
    })
}

fn parse_select(query: &ast::Query) -> Result<Command, SqlError> {
    let select = match query.body.as_ref() {
        SetExpr::Select(s) => s,
        _ => return Err(SqlError::Unsupported("non-SELECT query".into())),
    };

    if select.from.is_empty() {
        return Err(SqlError::Parse("SELECT without FROM".into()));
    }
    let table = table_factor_name(&select.from[0].relation)?;

    match table.as_str() {
        "shops" => Ok(Command::SelectShops),
        "services" => {
            let filters = extract_eq_filters(&select.selection)?;
            Ok(Command::SelectServices {
                shop_id: require_ulid(&filters, "shop_id")?,
            })
        }
        "staff" => {
            let filters = extract_eq_filters(&select.selection)?;
            Ok(Command::SelectStaff {
                shop_id: require_ulid(&filters, "shop_id")?,
                service_id: optional_ulid(&filters, "service_id")?,
            })
        }
        "slots" => {
            let filters = extract_eq_filters(&select.selection)?;
            let date = match find_filter(&filters, "date") {
                None => DateParam::Today,
                Some(expr) => match parse_date(expr) {
                    Ok(date) => DateParam::On(date),
                    Err(_) => DateParam::Invalid,
                },
            };
            Ok(Command::SelectSlots {
                shop_id: require_ulid(&filters, "shop_id")?,
                service_id: require_ulid(&filters, "service_id")?,
                staff_id: optional_ulid(&filters, "staff_id")?,
                date,
            })
        }
        "bookings" => {
            let filters = extract_eq_filters(&select.selection)?;
            let status = match find_filter(&filters, "status") {
                None => None,
                Some(expr) => {
                    let s = parse_string(expr)?;
                    Some(
                        BookingStatus::parse(&s)
                            .ok_or_else(|| SqlError::Parse(format!("bad status: {s}")))?,
                    )
                }
            };
            Ok(Command::SelectBookings {
                shop_id: require_ulid(&filters, "shop_id")?,
                date: optional_date(&filters, "date")?,
                staff_id: optional_ulid(&filters, "staff_id")?,
                status,
            })
        }
        "booking_stats" => {
            let filters = extract_eq_filters(&select.selection)?;
            let (mut start_date, mut end_date) = (None, None);
            if let Some(expr) = &select.selection {
                extract_date_range(expr, &mut start_date, &mut end_date)?;
            }
            Ok(Command::SelectStats {
                shop_id: require_ulid(&filters, "shop_id")?,
                start_date: start_date.ok_or(SqlError::MissingFilter("date >="))?,
                end_date: end_date.ok_or(SqlError::MissingFilter("date <="))?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Walk an AND tree collecting `date >= '..'` / `date <= '..'` bounds.
fn extract_date_range(
    expr: &Expr,
    start: &mut Option<NaiveDate>,
    end: &mut Option<NaiveDate>,
) -> Result<(), SqlError> {
    if let Expr::BinaryOp { left, op, right } = expr {
        match op {
            ast::BinaryOperator::And => {
                extract_date_range(left, start, end)?;
                extract_date_range(right, start, end)?;
            }
            ast::BinaryOperator::GtEq => {
                if expr_column_name(left).as_deref() == Some("date") {
                    *start = Some(parse_date(right)?);
                }
            }
            ast::BinaryOperator::LtEq => {
                if expr_column_name(left).as_deref() == Some("date") {
                    *end = Some(parse_date(right)?);
                }
            }
            _ => {}
        }
    }
    Ok(())
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

fn assignment_column(assignment: &ast::Assignment) -> Option<String> {
    match &assignment.target {
        ast::AssignmentTarget::ColumnName(name) => object_name_last(name),
        _ => None,
    }
}

fn extract_insert_values(insert: &ast::Insert) -> Result<Vec<Expr>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows[0].clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

/// Flatten a WHERE clause of AND-ed `col = value` terms.
fn extract_eq_filters<'a>(
    selection: &'a Option<Expr>,
) -> Result<Vec<(String, &'a Expr)>, SqlError> {
    let mut filters = Vec::new();
    if let Some(expr) = selection {
        collect_eq(expr, &mut filters)?;
    }
    Ok(filters)
}

fn collect_eq<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
    match expr {
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_eq(left, out)?;
                collect_eq(right, out)?;
            }
            ast::BinaryOperator::Eq => {
                if let Some(col) = expr_column_name(left) {
                    out.push((col, right));
                }
            }
            // Range operators are handled per-table where they mean something.
            ast::BinaryOperator::GtEq | ast::BinaryOperator::LtEq => {}
            other => {
                return Err(SqlError::Unsupported(format!("operator {other} in WHERE")));
            }
        },
        Expr::Nested(inner) => collect_eq(inner, out)?,
        other => {
            return Err(SqlError::Unsupported(format!("expression {other} in WHERE")));
        }
    }
    Ok(())
}

fn find_filter<'a>(filters: &'a [(String, &'a Expr)], col: &str) -> Option<&'a Expr> {
    filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e)
}

fn require_ulid(filters: &[(String, &Expr)], col: &'static str) -> Result<Ulid, SqlError> {
    find_filter(filters, col)
        .ok_or(SqlError::MissingFilter(col))
        .and_then(parse_ulid)
}

fn optional_ulid(filters: &[(String, &Expr)], col: &str) -> Result<Option<Ulid>, SqlError> {
    find_filter(filters, col).map(parse_ulid).transpose()
}

fn require_date(filters: &[(String, &Expr)], col: &'static str) -> Result<NaiveDate, SqlError> {
    find_filter(filters, col)
        .ok_or(SqlError::MissingFilter(col))
        .and_then(parse_date)
}

fn optional_date(filters: &[(String, &Expr)], col: &str) -> Result<Option<NaiveDate>, SqlError> {
    find_filter(filters, col).map(parse_date).transpose()
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

fn parse_ulid(expr: &Expr) -> Result<Ulid, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) | Value::Number(s, _) => {
                Ulid::from_string(s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
            }
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_i64(expr: &Expr) -> Result<i64, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Number(s, _) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            Value::SingleQuotedString(s) => s
                .parse()
                .map_err(|e| SqlError::Parse(format!("bad i64: {e}"))),
            _ => Err(SqlError::Parse(format!("expected number, got {value:?}"))),
        }
    } else if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        Ok(-parse_i64(expr)?)
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_u8(expr: &Expr) -> Result<u8, SqlError> {
    let v = parse_i64(expr)?;
    u8::try_from(v).map_err(|_| SqlError::Parse(format!("{v} out of u8 range")))
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::SingleQuotedString(s) => Ok(s.clone()),
            _ => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

fn parse_string_or_null(expr: &Expr) -> Result<Option<String>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    parse_string(expr).map(Some)
}

fn parse_status_or_null(expr: &Expr) -> Result<Option<BookingStatus>, SqlError> {
    match parse_string_or_null(expr)? {
        None => Ok(None),
        Some(s) => BookingStatus::parse(&s)
            .map(Some)
            .ok_or_else(|| SqlError::Parse(format!("bad status: {s}"))),
    }
}

fn parse_date(expr: &Expr) -> Result<NaiveDate, SqlError> {
    let s = parse_string(expr)?;
    NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| SqlError::Parse(format!("bad date: {e}")))
}

fn parse_time(expr: &Expr) -> Result<Minutes, SqlError> {
    let s = parse_string(expr)?;
    parse_hhmm(&s).ok_or_else(|| SqlError::Parse(format!("bad time: {s}")))
}

fn parse_time_or_null(expr: &Expr) -> Result<Option<Minutes>, SqlError> {
    if let Some(Value::Null) = extract_value(expr) {
        return Ok(None);
    }
    parse_time(expr).map(Some)
}

fn parse_bool(expr: &Expr) -> Result<bool, SqlError> {
    if let Some(value) = extract_value(expr) {
        match value {
            Value::Boolean(b) => Ok(*b),
            Value::SingleQuotedString(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "1" => Ok(true),
                "false" | "f" | "0" => Ok(false),
                _ => Err(SqlError::Parse(format!("bad bool: {s}"))),
            },
            Value::Number(n, _) => Ok(n != "0"),
            _ => Err(SqlError::Parse(format!("expected bool, got {value:?}"))),
        }
    } else {
        Err(SqlError::Parse(format!("expected value, got {expr:?}")))
    }
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SqlError {
    Parse(String),
    Empty,
    Unsupported(String),
    UnknownTable(String),
    WrongArity(&'static str, usize, usize),
    MissingFilter(&'static str),
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SqlError::Parse(s) => write!(f, "parse error: {s}"),
            SqlError::Empty => write!(f, "empty query"),
            SqlError::Unsupported(s) => write!(f, "unsupported: {s}"),
            SqlError::UnknownTable(t) => write!(f, "unknown table: {t}"),
            SqlError::WrongArity(t, expected, got) => {
                write!(f, "{t}: expected {expected} values, got {got}")
            }
            SqlError::MissingFilter(col) => write!(f, "missing filter: {col}"),
        }
    }
}

impl std::error::Error for SqlError {}
