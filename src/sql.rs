use rust_decimal::Decimal;
use sqlparser::ast::{self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value, ValueWithSpan};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::engine::parse_day;
use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertVehicle {
        id: Ulid,
        name: String,
    },
    UpsertIntervals {
        vehicle_id: Ulid,
        manager_id: Option<Ulid>,
        intervals: Vec<IntervalInput>,
    },
    DeleteInterval {
        id: Ulid,
    },
    InsertContract {
        listing_id: Ulid,
        request: BookingRequest,
    },
    DeleteContract {
        id: Ulid,
    },
    SelectListing {
        vehicle_id: Ulid,
    },
    /// Raw paging values; coercion happens in the engine.
    SelectVehicles {
        page: Option<String>,
        limit: Option<String>,
        search: Option<String>,
    },
    SelectContracts {
        listing_id: Ulid,
    },
}

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    let Some(stmt) = stmts.first() else {
        return Err(SqlError::Empty);
    };

    match stmt {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

const VEHICLE_COLUMNS: &[&str] = &["id", "name"];
const INTERVAL_COLUMNS: &[&str] = &["id", "vehicle_id", "open_date", "close_date", "price", "manager_id"];
const CONTRACT_COLUMNS: &[&str] = &[
    "listing_id",
    "customer_id",
    "employee_id",
    "agreed_price",
    "start_date",
    "end_date",
];

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let rows = extract_insert_rows(insert)?;

    match table.as_str() {
        "vehicles" => {
            check_columns(insert, "vehicles", VEHICLE_COLUMNS)?;
            let values = single_row(&rows, "vehicles")?;
            if values.len() < 2 {
                return Err(SqlError::WrongArity("vehicles", 2, values.len()));
            }
            Ok(Command::InsertVehicle {
                id: parse_ulid(&values[0])?,
                name: parse_string(&values[1])?,
            })
        }
        "intervals" => {
            check_columns(insert, "intervals", INTERVAL_COLUMNS)?;
            parse_interval_rows(&rows)
        }
        "contracts" => {
            check_columns(insert, "contracts", CONTRACT_COLUMNS)?;
            let values = single_row(&rows, "contracts")?;
            if values.len() < 6 {
                return Err(SqlError::WrongArity("contracts", 6, values.len()));
            }
            Ok(Command::InsertContract {
                listing_id: parse_ulid(&values[0])?,
                request: BookingRequest {
                    customer_id: parse_ulid(&values[1])?,
                    employee_id: parse_ulid(&values[2])?,
                    agreed_price: parse_decimal(&values[3])?,
                    start: parse_date(&values[4])?,
                    end: parse_date(&values[5])?,
                },
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `(id, vehicle_id, open_date, close_date, price[, manager_id])` per row.
/// Every row must target the same vehicle; the batch becomes one upsert.
fn parse_interval_rows(rows: &[Vec<Expr>]) -> Result<Command, SqlError> {
    let mut vehicle_id = None;
    let mut manager_id = None;
    let mut intervals = Vec::with_capacity(rows.len());

    for (i, row) in rows.iter().enumerate() {
        if row.len() < 5 {
            return Err(SqlError::WrongArity("intervals", 5, row.len()));
        }
        let row_err = |e: SqlError| e.in_row(i);

        let row_vehicle = parse_ulid(&row[1]).map_err(row_err)?;
        match vehicle_id {
            None => vehicle_id = Some(row_vehicle),
            Some(v) if v != row_vehicle => {
                return Err(SqlError::Parse(format!(
                    "row {i}: all rows must share one vehicle_id"
                )));
            }
            Some(_) => {}
        }

        if let Some(expr) = row.get(5)
            && let Some(m) = parse_ulid_or_null(expr).map_err(row_err)?
        {
            match manager_id {
                Some(existing) if existing != m => {
                    return Err(SqlError::Parse(format!(
                        "row {i}: all rows must share one manager_id"
                    )));
                }
                _ => manager_id = Some(m),
            }
        }

        intervals.push(IntervalInput {
            id: parse_ulid_or_null(&row[0]).map_err(row_err)?,
            open_date: parse_date(&row[2]).map_err(row_err)?,
            close_date: parse_date(&row[3]).map_err(row_err)?,
            price: parse_decimal(&row[4]).map_err(row_err)?,
        });
    }

    Ok(Command::UpsertIntervals {
        vehicle_id: vehicle_id.ok_or_else(|| SqlError::Parse("empty VALUES".into()))?,
        manager_id,
        intervals,
    })
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    let id = extract_where_ulid(&delete.selection, "id")?;

    match table.as_str() {
        "intervals" => Ok(Command::DeleteInterval { id }),
        "contracts" => Ok(Command::DeleteContract { id }),
        _ => Err(SqlError::UnknownTable(table)),
    }
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

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_eq_filters(selection, &mut filters)?;
    }
    let filter = |col: &str| filters.iter().find(|(c, _)| c == col).map(|(_, e)| *e);

    match table.as_str() {
        "listings" => {
            let expr = filter("vehicle_id").ok_or(SqlError::MissingFilter("vehicle_id"))?;
            Ok(Command::SelectListing {
                vehicle_id: parse_ulid(expr)?,
            })
        }
        "vehicles" => Ok(Command::SelectVehicles {
            page: filter("page").and_then(optional_text),
            limit: filter("limit").and_then(optional_text),
            search: filter("search").and_then(optional_text),
        }),
        "contracts" => {
            let expr = filter("listing_id").ok_or(SqlError::MissingFilter("listing_id"))?;
            Ok(Command::SelectContracts {
                listing_id: parse_ulid(expr)?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// Flatten `a = x AND b = y AND ...` into `(column, value)` pairs.
fn collect_eq_filters<'a>(expr: &'a Expr, out: &mut Vec<(String, &'a Expr)>) -> Result<(), SqlError> {
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
            let col = expr_column_name(left)
                .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
            out.push((col, right.as_ref()));
            Ok(())
        }
        Expr::Nested(inner) => collect_eq_filters(inner, out),
        other => Err(SqlError::Unsupported(format!("WHERE {other}"))),
    }
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

/// Values are read by position, so a named column list must follow the
/// table's column order. Leading columns only is allowed; omitting the list
/// is too.
fn check_columns(insert: &ast::Insert, table: &'static str, expected: &[&str]) -> Result<(), SqlError> {
    let in_order = insert.columns.len() <= expected.len()
        && insert
            .columns
            .iter()
            .zip(expected)
            .all(|(named, want)| named.value.eq_ignore_ascii_case(want));
    if in_order {
        Ok(())
    } else {
        Err(SqlError::ColumnOrder(table, expected.join(", ")))
    }
}

fn extract_insert_rows(insert: &ast::Insert) -> Result<Vec<Vec<Expr>>, SqlError> {
    let body = insert
        .source
        .as_ref()
        .ok_or(SqlError::Parse("no VALUES".into()))?;
    match body.body.as_ref() {
        SetExpr::Values(values) => {
            if values.rows.is_empty() {
                return Err(SqlError::Parse("empty VALUES".into()));
            }
            Ok(values.rows.clone())
        }
        _ => Err(SqlError::Parse("expected VALUES".into())),
    }
}

fn single_row<'a>(rows: &'a [Vec<Expr>], table: &'static str) -> Result<&'a [Expr], SqlError> {
    match rows {
        [row] => Ok(row),
        _ => Err(SqlError::Unsupported(format!("multi-row INSERT into {table}"))),
    }
}

fn extract_where_ulid(selection: &Option<Expr>, column: &'static str) -> Result<Ulid, SqlError> {
    let sel = selection.as_ref().ok_or(SqlError::MissingFilter(column))?;
    match sel {
        Expr::BinaryOp {
            left,
            op: ast::BinaryOperator::Eq,
            right,
        } if expr_column_name(left).as_deref() == Some(column) => parse_ulid(right),
        _ => Err(SqlError::MissingFilter(column)),
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

/// String or number literal as its source text. Negative numbers keep the sign.
fn raw_text(expr: &Expr) -> Result<String, SqlError> {
    if let Expr::UnaryOp {
        op: ast::UnaryOperator::Minus,
        expr,
    } = expr
    {
        return Ok(format!("-{}", raw_text(expr)?));
    }
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) | Some(Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected literal, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
    }
}

/// Paging and search values: `NULL` or anything that is not a plain literal
/// counts as absent.
fn optional_text(expr: &Expr) -> Option<String> {
    raw_text(expr).ok()
}

fn parse_string(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value:?}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr:?}"))),
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

fn parse_ulid_or_null(expr: &Expr) -> Result<Option<Ulid>, SqlError> {
    match extract_value(expr) {
        Some(Value::Null) => Ok(None),
        _ => parse_ulid(expr).map(Some),
    }
}

fn parse_date(expr: &Expr) -> Result<Day, SqlError> {
    let text = parse_string(expr)?;
    parse_day(&text).map_err(|e| SqlError::BadDate(e.to_string()))
}

fn parse_decimal(expr: &Expr) -> Result<Decimal, SqlError> {
    let text = raw_text(expr)?;
    text.trim()
        .parse::<Decimal>()
        .map_err(|e| SqlError::Parse(format!("bad decimal {text:?}: {e}")))
}

// ── Errors ────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SqlError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty query")]
    Empty,
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("{0}: expected {1} values, got {2}")]
    WrongArity(&'static str, usize, usize),
    #[error("{0}: columns must be ({1})")]
    ColumnOrder(&'static str, String),
    #[error("missing filter: {0}")]
    MissingFilter(&'static str),
    #[error("{0}")]
    BadDate(String),
}

impl SqlError {
    fn in_row(self, row: usize) -> SqlError {
        match self {
            SqlError::BadDate(s) => SqlError::BadDate(format!("row {row}: {s}")),
            other => SqlError::Parse(format!("row {row}: {other}")),
        }
    }
}
