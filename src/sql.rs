use chrono::{NaiveDate, NaiveDateTime};
use sqlparser::ast::{
    self, Expr, FromTable, ObjectNamePart, SetExpr, Statement, TableFactor, TableObject, Value,
    ValueWithSpan,
};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;
use ulid::Ulid;

use crate::model::*;

/// Parsed command from SQL input.
#[derive(Debug, PartialEq)]
pub enum Command {
    InsertDonor {
        id: DonorId,
        cpr: String,
        name: String,
    },
    InsertAppointment {
        donor_id: DonorId,
        start: NaiveDateTime,
    },
    DeleteAppointment {
        id: AppointmentId,
    },
    DeleteAppointmentByStart {
        donor_id: DonorId,
        start: NaiveDateTime,
    },
    SelectAppointments {
        donor_id: Option<DonorId>,
    },
    SelectFutureAppointments,
    SelectUnavailableTimes {
        date: NaiveDate,
    },
    SelectDonors {
        id: Option<DonorId>,
    },
}

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

pub fn parse_sql(sql: &str) -> Result<Command, SqlError> {
    let dialect = PostgreSqlDialect {};
    let stmts = Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))?;
    if stmts.is_empty() {
        return Err(SqlError::Empty);
    }

    match &stmts[0] {
        Statement::Insert(insert) => parse_insert(insert),
        Statement::Delete(delete) => parse_delete(delete),
        Statement::Query(query) => parse_select(query),
        other => Err(SqlError::Unsupported(format!("{other}"))),
    }
}

/// Parse a clinic-local timestamp, `YYYY-MM-DD HH:MM[:SS]` with a space or `T`.
pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime, SqlError> {
    let s = s.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .ok_or_else(|| SqlError::Parse(format!("bad timestamp: {s}")))
}

pub fn parse_date(s: &str) -> Result<NaiveDate, SqlError> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| parse_timestamp(s).map(|t| t.date()))
        .map_err(|_| SqlError::Parse(format!("bad date: {s}")))
}

fn parse_insert(insert: &ast::Insert) -> Result<Command, SqlError> {
    let table = insert_table_name(insert)?;
    let values = extract_insert_values(insert)?;

    match table.as_str() {
        "donors" => {
            if values.len() < 3 {
                return Err(SqlError::WrongArity("donors", 3, values.len()));
            }
            Ok(Command::InsertDonor {
                id: parse_ulid_expr(&values[0])?,
                cpr: parse_string_expr(&values[1])?,
                name: parse_string_expr(&values[2])?,
            })
        }
        "appointments" => {
            if values.len() < 2 {
                return Err(SqlError::WrongArity("appointments", 2, values.len()));
            }
            Ok(Command::InsertAppointment {
                donor_id: parse_ulid_expr(&values[0])?,
                start: parse_timestamp_expr(&values[1])?,
            })
        }
        _ => Err(SqlError::UnknownTable(table)),
    }
}

fn parse_delete(delete: &ast::Delete) -> Result<Command, SqlError> {
    let table = delete_table_name(delete)?;
    if table != "appointments" {
        return Err(SqlError::UnknownTable(table));
    }

    let filters = where_filters(delete.selection.as_ref())?;
    if let Some(id) = filters.get("id") {
        return Ok(Command::DeleteAppointment {
            id: parse_ulid_expr(id)?,
        });
    }
    let donor_id = filters.get("donor_id").ok_or(SqlError::MissingFilter("donor_id"))?;
    let start = filters.get("start").ok_or(SqlError::MissingFilter("start"))?;
    Ok(Command::DeleteAppointmentByStart {
        donor_id: parse_ulid_expr(donor_id)?,
        start: parse_timestamp_expr(start)?,
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
    let filters = where_filters(select.selection.as_ref())?;

    match table.as_str() {
        "appointments" => Ok(Command::SelectAppointments {
            donor_id: filters.get("donor_id").map(parse_ulid_expr).transpose()?,
        }),
        "future_appointments" => Ok(Command::SelectFutureAppointments),
        "unavailable_times" => {
            let date = filters.get("date").ok_or(SqlError::MissingFilter("date"))?;
            Ok(Command::SelectUnavailableTimes {
                date: parse_date(&parse_string_expr(date)?)?,
            })
        }
        "donors" => Ok(Command::SelectDonors {
            id: filters.get("id").map(parse_ulid_expr).transpose()?,
        }),
        _ => Err(SqlError::UnknownTable(table)),
    }
}

/// `column = value` pairs from a WHERE clause of AND-ed equalities.
#[derive(Default)]
struct Filters<'a>(Vec<(String, &'a Expr)>);

impl<'a> Filters<'a> {
    fn get(&self, column: &str) -> Option<&'a Expr> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, e)| *e)
    }
}

fn where_filters(selection: Option<&Expr>) -> Result<Filters<'_>, SqlError> {
    let mut filters = Filters::default();
    if let Some(expr) = selection {
        collect_filters(expr, &mut filters)?;
    }
    Ok(filters)
}

fn collect_filters<'a>(expr: &'a Expr, filters: &mut Filters<'a>) -> Result<(), SqlError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, filters),
        Expr::BinaryOp { left, op, right } => match op {
            ast::BinaryOperator::And => {
                collect_filters(left, filters)?;
                collect_filters(right, filters)
            }
            ast::BinaryOperator::Eq => {
                let col = expr_column_name(left)
                    .ok_or_else(|| SqlError::Unsupported(format!("filter on {left}")))?;
                filters.0.push((col, right.as_ref()));
                Ok(())
            }
            other => Err(SqlError::Unsupported(format!("operator {other} in WHERE"))),
        },
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

fn parse_string_expr(expr: &Expr) -> Result<String, SqlError> {
    match extract_value(expr) {
        Some(Value::SingleQuotedString(s) | Value::Number(s, _)) => Ok(s.clone()),
        Some(value) => Err(SqlError::Parse(format!("expected string, got {value}"))),
        None => Err(SqlError::Parse(format!("expected value, got {expr}"))),
    }
}

fn parse_ulid_expr(expr: &Expr) -> Result<Ulid, SqlError> {
    let s = parse_string_expr(expr)?;
    Ulid::from_string(&s).map_err(|e| SqlError::Parse(format!("bad ULID: {e}")))
}

fn parse_timestamp_expr(expr: &Expr) -> Result<NaiveDateTime, SqlError> {
    parse_timestamp(&parse_string_expr(expr)?)
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

#[cfg(test)]
mod tests {
    use super::*;

    const DONOR: &str = "01ARZ3NDEKTSV4RRFFQ69G5FAV";

    fn ts(s: &str) -> NaiveDateTime {
        parse_timestamp(s).unwrap()
    }

    #[test]
    fn parse_insert_donor() {
        let sql = format!(
            "INSERT INTO donors (id, cpr, name) VALUES ('{DONOR}', '010190-1234', 'Karen Holm')"
        );
        let cmd = parse_sql(&sql).unwrap();
        match cmd {
            Command::InsertDonor { id, cpr, name } => {
                assert_eq!(id.to_string(), DONOR);
                assert_eq!(cpr, "010190-1234");
                assert_eq!(name, "Karen Holm");
            }
            _ => panic!("expected InsertDonor, got {cmd:?}"),
        }
    }

    #[test]
    fn parse_insert_donor_short_arity() {
        let sql = format!("INSERT INTO donors (id, cpr) VALUES ('{DONOR}', '0101901234')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::WrongArity("donors", 3, 2))));
    }

    #[test]
    fn parse_insert_appointment() {
        let sql = format!(
            "INSERT INTO appointments (donor_id, start) VALUES ('{DONOR}', '2030-03-05 09:00')"
        );
        let cmd = parse_sql(&sql).unwrap();
        assert_eq!(
            cmd,
            Command::InsertAppointment {
                donor_id: Ulid::from_string(DONOR).unwrap(),
                start: ts("2030-03-05 09:00:00"),
            }
        );
    }

    #[test]
    fn parse_insert_appointment_bad_timestamp() {
        let sql = format!(
            "INSERT INTO appointments (donor_id, start) VALUES ('{DONOR}', 'tomorrow')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Parse(_))));
    }

    #[test]
    fn parse_multi_row_insert_unsupported() {
        let sql = format!(
            "INSERT INTO appointments (donor_id, start) VALUES ('{DONOR}', '2030-03-05 09:00'), ('{DONOR}', '2030-03-05 10:00')"
        );
        assert!(matches!(parse_sql(&sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn parse_delete_by_id() {
        let sql = format!("DELETE FROM appointments WHERE id = '{DONOR}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::DeleteAppointment { .. }));
    }

    #[test]
    fn parse_delete_by_start() {
        let sql = format!(
            "DELETE FROM appointments WHERE donor_id = '{DONOR}' AND start = '2030-03-05T10:30'"
        );
        match parse_sql(&sql).unwrap() {
            Command::DeleteAppointmentByStart { donor_id, start } => {
                assert_eq!(donor_id.to_string(), DONOR);
                assert_eq!(start, ts("2030-03-05 10:30"));
            }
            other => panic!("expected DeleteAppointmentByStart, got {other:?}"),
        }
    }

    #[test]
    fn parse_delete_missing_start() {
        let sql = format!("DELETE FROM appointments WHERE donor_id = '{DONOR}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::MissingFilter("start"))));
    }

    #[test]
    fn parse_delete_donor_unsupported() {
        let sql = format!("DELETE FROM donors WHERE id = '{DONOR}'");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_select_appointments() {
        assert_eq!(
            parse_sql("SELECT * FROM appointments").unwrap(),
            Command::SelectAppointments { donor_id: None }
        );
        let sql = format!("SELECT * FROM appointments WHERE donor_id = '{DONOR}'");
        assert!(matches!(
            parse_sql(&sql).unwrap(),
            Command::SelectAppointments { donor_id: Some(_) }
        ));
    }

    #[test]
    fn parse_select_future_appointments() {
        assert_eq!(
            parse_sql("SELECT * FROM future_appointments").unwrap(),
            Command::SelectFutureAppointments
        );
    }

    #[test]
    fn parse_select_unavailable_times() {
        let cmd = parse_sql("SELECT * FROM unavailable_times WHERE date = '2030-03-05'").unwrap();
        assert_eq!(
            cmd,
            Command::SelectUnavailableTimes {
                date: NaiveDate::from_ymd_opt(2030, 3, 5).unwrap()
            }
        );
    }

    #[test]
    fn parse_select_unavailable_times_requires_date() {
        assert!(matches!(
            parse_sql("SELECT * FROM unavailable_times"),
            Err(SqlError::MissingFilter("date"))
        ));
    }

    #[test]
    fn parse_select_donors() {
        assert_eq!(
            parse_sql("SELECT * FROM donors").unwrap(),
            Command::SelectDonors { id: None }
        );
        let sql = format!("SELECT * FROM donors WHERE id = '{DONOR}'");
        assert!(matches!(parse_sql(&sql).unwrap(), Command::SelectDonors { id: Some(_) }));
    }

    #[test]
    fn parse_range_filter_unsupported() {
        let sql = "SELECT * FROM appointments WHERE start >= '2030-03-05 09:00'";
        assert!(matches!(parse_sql(sql), Err(SqlError::Unsupported(_))));
    }

    #[test]
    fn timestamp_formats() {
        let expected = NaiveDate::from_ymd_opt(2030, 3, 5)
            .unwrap()
            .and_hms_opt(9, 30, 0)
            .unwrap();
        for s in [
            "2030-03-05 09:30",
            "2030-03-05 09:30:00",
            "2030-03-05T09:30",
            "2030-03-05T09:30:00.000",
            " 2030-03-05 09:30 ",
        ] {
            assert_eq!(parse_timestamp(s).unwrap(), expected, "{s}");
        }
        assert!(parse_timestamp("2030-03-05").is_err());
        assert!(parse_timestamp("05/03/2030 09:30").is_err());
    }

    #[test]
    fn parse_unknown_table_errors() {
        let sql = format!("INSERT INTO foobar (id) VALUES ('{DONOR}')");
        assert!(matches!(parse_sql(&sql), Err(SqlError::UnknownTable(_))));
    }

    #[test]
    fn parse_empty_errors() {
        assert!(matches!(parse_sql(""), Err(SqlError::Empty)));
    }
}
