use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{DefaultServerParameterProvider, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo,
    QueryResponse, Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;

use crate::auth::DonorslotAuthSource;
use crate::booking::{BookingError, BookingService, ReserveError, ValidationError};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::sql::{self, Command};
use crate::store::{MemoryStore, StoreError};

pub type Service = BookingService<MemoryStore>;

const TIMESTAMP_OUT: &str = "%Y-%m-%d %H:%M:%S";

pub struct DonorslotHandler {
    service: Arc<Service>,
    query_parser: Arc<DonorslotQueryParser>,
}

impl DonorslotHandler {
    pub fn new(service: Arc<Service>) -> Self {
        Self {
            service,
            query_parser: Arc::new(DonorslotQueryParser),
        }
    }

    async fn run(&self, sql: &str) -> PgWireResult<Vec<Response>> {
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn execute_command(&self, cmd: Command) -> PgWireResult<Vec<Response>> {
        let svc = &self.service;
        match cmd {
            Command::InsertDonor { id, cpr, name } => {
                svc.register_donor(id, &cpr, &name).await.map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::InsertAppointment { donor_id, start } => {
                svc.create_appointment(donor_id, start)
                    .await
                    .map_err(booking_err)?;
                Ok(vec![Response::Execution(Tag::new("INSERT").with_rows(1))])
            }
            Command::DeleteAppointment { id } => {
                let deleted = svc.delete_appointment(id).await.map_err(booking_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("DELETE").with_rows(usize::from(deleted)),
                )])
            }
            Command::DeleteAppointmentByStart { donor_id, start } => {
                let deleted = svc
                    .delete_appointment_by_start(donor_id, start)
                    .await
                    .map_err(booking_err)?;
                Ok(vec![Response::Execution(
                    Tag::new("DELETE").with_rows(usize::from(deleted)),
                )])
            }
            Command::SelectAppointments { donor_id } => {
                let appts = match donor_id {
                    Some(d) => svc.appointments_for_donor(d).await,
                    None => svc.appointments().await,
                }
                .map_err(booking_err)?;
                Ok(vec![appointment_rows(appts)])
            }
            Command::SelectFutureAppointments => {
                let appts = svc.future_appointments().await.map_err(booking_err)?;
                Ok(vec![appointment_rows(appts)])
            }
            Command::SelectUnavailableTimes { date } => {
                let times = svc.unavailable_times(date).await.map_err(booking_err)?;
                let schema = Arc::new(unavailable_times_schema());
                let date = date.format("%Y-%m-%d").to_string();
                let rows: Vec<PgWireResult<_>> = times
                    .into_iter()
                    .map(|time| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&date)?;
                        encoder.encode_field(&time)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
            Command::SelectDonors { id } => {
                let donors = match id {
                    Some(id) => svc
                        .get_donor(id)
                        .await
                        .map(|d| d.into_iter().collect::<Vec<_>>()),
                    None => svc.list_donors().await,
                }
                .map_err(booking_err)?;

                let schema = Arc::new(donor_schema());
                let rows: Vec<PgWireResult<_>> = donors
                    .into_iter()
                    .map(|donor| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&donor.id.to_string())?;
                        encoder.encode_field(&donor.cpr.formatted())?;
                        encoder.encode_field(&donor.name)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(
                    schema,
                    stream::iter(rows),
                ))])
            }
        }
    }
}

fn appointment_rows(appts: Vec<Appointment>) -> Response {
    let schema = Arc::new(appointment_schema());
    let rows: Vec<PgWireResult<_>> = appts
        .into_iter()
        .map(|a| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&a.id.to_string())?;
            encoder.encode_field(&a.donor_id.to_string())?;
            encoder.encode_field(&a.start().format(TIMESTAMP_OUT).to_string())?;
            encoder.encode_field(&a.end().format(TIMESTAMP_OUT).to_string())?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn appointment_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("donor_id"),
        text_field("start"),
        text_field("end"),
    ]
}

fn unavailable_times_schema() -> Vec<FieldInfo> {
    vec![text_field("date"), text_field("time")]
}

fn donor_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("cpr"), text_field("name")]
}

/// Result columns for a statement that has not been bound yet.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.trim_start().starts_with("SELECT") {
        vec![]
    } else if upper.contains("UNAVAILABLE_TIMES") {
        unavailable_times_schema()
    } else if upper.contains("APPOINTMENTS") {
        appointment_schema()
    } else if upper.contains("DONORS") {
        donor_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for DonorslotHandler {
    async fn do_query<C>(
        &self,
        _client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        self.run(query).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct DonorslotQueryParser;

#[async_trait]
impl QueryParser for DonorslotQueryParser {
    type Statement = String;

    async fn parse_sql<C>(
        &self,
        _client: &C,
        sql: &str,
        _types: &[Option<Type>],
    ) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(
        &self,
        stmt: &String,
        _column_format: Option<&Format>,
    ) -> PgWireResult<Vec<FieldInfo>> {
        Ok(result_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for DonorslotHandler {
    type Statement = String;
    type QueryParser = DonorslotQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        _client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let sql = substitute_params(portal);
        let mut responses = self.run(&sql).await?;
        if responses.is_empty() {
            return Ok(Response::EmptyQuery);
        }
        Ok(responses.remove(0))
    }

    async fn do_describe_statement<C>(
        &self,
        _client: &mut C,
        target: &StoredStatement<Self::Statement>,
    ) -> PgWireResult<DescribeStatementResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let param_types = vec![Type::VARCHAR; count_params(&target.statement)];
        Ok(DescribeStatementResponse::new(
            param_types,
            result_schema(&target.statement),
        ))
    }

    async fn do_describe_portal<C>(
        &self,
        _client: &mut C,
        target: &Portal<Self::Statement>,
    ) -> PgWireResult<DescribePortalResponse>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        Ok(DescribePortalResponse::new(result_schema(
            &target.statement.statement,
        )))
    }
}

/// Count the highest $N parameter placeholder in the SQL string.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i > start
                && let Ok(n) = sql[start..i].parse::<usize>()
            {
                max = max.max(n);
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let mut result = portal.statement.statement.to_string();

    // Highest index first so $1 never clobbers the prefix of $10.
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let placeholder = format!("${}", i + 1);
        let value = match param {
            Some(bytes) => {
                let text = String::from_utf8_lossy(bytes);
                format!("'{}'", text.replace('\'', "''"))
            }
            None => "NULL".to_string(),
        };
        result = result.replace(&placeholder, &value);
    }

    result
}

// ── Factory ──────────────────────────────────────────────────────

pub struct DonorslotFactory {
    handler: Arc<DonorslotHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<DonorslotAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl DonorslotFactory {
    pub fn new(service: Arc<Service>, auth_source: DonorslotAuthSource) -> Self {
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(DonorslotHandler::new(service)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for DonorslotFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.auth_handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    service: Arc<Service>,
    auth: DonorslotAuthSource,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = DonorslotFactory::new(service, auth);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE for a booking failure.
fn sqlstate(e: &BookingError) -> &'static str {
    match e {
        BookingError::Validation(ValidationError::InvalidTime) => "22007",
        BookingError::Validation(_) | BookingError::BeyondHorizon { .. } => "22008",
        BookingError::SlotTaken { .. } => "23P01",
        BookingError::UnknownDonor(_) => "23503",
        BookingError::InvalidCpr(_) => "22023",
        BookingError::Store(StoreError::DuplicateDonor(_)) => "23505",
        BookingError::Store(StoreError::LimitExceeded(_)) => "54000",
        BookingError::Reserve(ReserveError::RetriesExhausted { .. }) => "40001",
        BookingError::Timeout(_) => "57014",
        BookingError::Reserve(_) | BookingError::Store(_) => "XX000",
    }
}

fn booking_err(e: BookingError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(&e).into(),
        e.to_string(),
    )))
}

fn sql_err(e: crate::sql::SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::NaiveDate;
    use ulid::Ulid;

    use crate::booking::Contention;
    use crate::cpr::Cpr;

    #[test]
    fn count_params_finds_highest() {
        assert_eq!(count_params("SELECT * FROM donors"), 0);
        assert_eq!(
            count_params("DELETE FROM appointments WHERE donor_id = $1 AND start = $2"),
            2
        );
        assert_eq!(count_params("SELECT $3, $1"), 3);
    }

    #[test]
    fn result_schema_by_table() {
        assert_eq!(result_schema("SELECT * FROM appointments").len(), 4);
        assert_eq!(result_schema("select * from future_appointments").len(), 4);
        assert_eq!(
            result_schema("SELECT * FROM unavailable_times WHERE date = $1").len(),
            2
        );
        assert_eq!(result_schema("SELECT * FROM donors WHERE id = $1").len(), 3);
        assert!(
            result_schema("INSERT INTO appointments (donor_id, start) VALUES ($1, $2)").is_empty()
        );
    }

    #[test]
    fn sqlstates() {
        let start = NaiveDate::from_ymd_opt(2030, 1, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        let cases = [
            (BookingError::Validation(ValidationError::InvalidTime), "22007"),
            (BookingError::Validation(ValidationError::PastTime(start)), "22008"),
            (BookingError::BeyondHorizon { start }, "22008"),
            (BookingError::SlotTaken { start }, "23P01"),
            (BookingError::UnknownDonor(Ulid::new()), "23503"),
            (
                BookingError::InvalidCpr(Cpr::parse("x").unwrap_err()),
                "22023",
            ),
            (
                BookingError::Store(StoreError::DuplicateDonor("x".into())),
                "23505",
            ),
            (
                BookingError::Reserve(ReserveError::RetriesExhausted {
                    attempts: 3,
                    last: Contention { overlapping: 2 },
                }),
                "40001",
            ),
            (
                BookingError::Reserve(ReserveError::ConsistencyAnomaly { id: Ulid::new() }),
                "XX000",
            ),
            (BookingError::Store(StoreError::Wal("disk".into())), "XX000"),
            (BookingError::Timeout(Duration::from_secs(1)), "57014"),
        ];
        for (e, code) in cases {
            assert_eq!(sqlstate(&e), code, "{e}");
        }
    }
}
