use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono_tz::Tz;
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
use pgwire::messages::data::DataRow;
use pgwire::messages::PgWireBackendMessage;
use tokio::net::TcpStream;

use crate::auth::SharedPasswordAuthSource;
use crate::engine::{format_instant, Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability::{command_label, QUERIES_TOTAL, QUERY_DURATION_SECONDS};
use crate::registry::CalendarRegistry;
use crate::sql::{self, Command, SqlError};

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    registry: Arc<CalendarRegistry>,
    password: String,
) -> io::Result<()> {
    let factory = Arc::new(SlotbookFactory::new(registry, password));
    pgwire::tokio::process_socket(socket, None, factory).await
}

pub struct SlotbookHandler {
    registry: Arc<CalendarRegistry>,
    query_parser: Arc<SlotbookQueryParser>,
}

impl SlotbookHandler {
    pub fn new(registry: Arc<CalendarRegistry>) -> Self {
        Self {
            registry,
            query_parser: Arc::new(SlotbookQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.registry.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("calendar error: {e}"),
            )))
        })
    }

    /// Parse, run and time one statement.
    async fn run(&self, engine: &Engine, query: &str) -> PgWireResult<Response> {
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        let label = command_label(&cmd);
        let started = Instant::now();
        let result = execute_command(engine, cmd).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        metrics::histogram!(QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        result
    }
}

/// `user_id` values come from the statement, not the session; see
/// [`SharedPasswordAuthSource`] for the trust boundary.
async fn execute_command(engine: &Engine, cmd: Command) -> PgWireResult<Response> {
    let tz = engine.config().time_zone;
    match cmd {
        Command::InsertBooking { id, user_id, date_time, reservation_type_id } => {
            engine
                .create_booking(id, user_id, date_time, reservation_type_id)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::CancelBooking { id, user_id } => {
            engine.cancel_booking(id, &user_id).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
        }
        Command::InsertUrgentRequest { id, user_id, message } => {
            engine
                .submit_urgent_request(id, user_id, message)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::ResolveUrgentRequest { id, status } => {
            engine.resolve_urgent_request(id, status).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::SetAvailability { id, date, from_hour, to_hour } => {
            engine
                .set_availability(id, date, from_hour, to_hour)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::InsertReservationType { id, name, duration_minutes, description } => {
            engine
                .create_reservation_type(id, name, duration_minutes, description)
                .await
                .map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::SetQuota { max_bookings_per_user } => {
            engine.set_quota(max_bookings_per_user).await.map_err(engine_err)?;
            Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
        }
        Command::SelectAvailability => {
            let schema = Arc::new(availability_schema());
            let rows = engine
                .list_availability()
                .await
                .into_iter()
                .map(|a| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&a.id.to_string())?;
                    encoder.encode_field(&a.date.to_string())?;
                    encoder.encode_field(&a.from_hour.format("%H:%M").to_string())?;
                    encoder.encode_field(&a.to_hour.format("%H:%M").to_string())?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(query_response(schema, rows))
        }
        Command::SelectBookings { user_id } => {
            let bookings = match user_id {
                Some(user) => engine.bookings_for_user(&user).await,
                None => engine.list_bookings().await,
            };
            let schema = Arc::new(bookings_schema());
            let rows = bookings
                .iter()
                .map(|b| encode_booking(&schema, b, tz))
                .collect();
            Ok(query_response(schema, rows))
        }
        Command::SelectReservationTypes => {
            let schema = Arc::new(reservation_types_schema());
            let rows = engine
                .list_reservation_types()
                .await
                .into_iter()
                .map(|t| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&t.id.to_string())?;
                    encoder.encode_field(&t.name)?;
                    encoder.encode_field(&(t.duration_minutes as i32))?;
                    encoder.encode_field(&t.description)?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(query_response(schema, rows))
        }
        Command::SelectSlots { date } => {
            let schema = Arc::new(slots_schema());
            let rows = engine
                .available_slots(date)
                .await
                .into_iter()
                .map(|start| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&format_instant(start, tz))?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(query_response(schema, rows))
        }
        Command::SelectBookableDates => {
            let schema = Arc::new(bookable_dates_schema());
            let rows = engine
                .bookable_dates()
                .await
                .into_iter()
                .map(|date| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&date.to_string())?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(query_response(schema, rows))
        }
        Command::SelectUrgentRequest { user_id } => {
            let schema = Arc::new(urgent_requests_schema());
            let rows = engine
                .urgent_request_for(&user_id)
                .await
                .into_iter()
                .map(|r| {
                    let mut encoder = DataRowEncoder::new(schema.clone());
                    encoder.encode_field(&r.id.to_string())?;
                    encoder.encode_field(&r.user_id)?;
                    encoder.encode_field(&r.message)?;
                    encoder.encode_field(&r.status.as_str())?;
                    encoder.encode_field(&format_instant(r.submitted_at, tz))?;
                    Ok(encoder.take_row())
                })
                .collect();
            Ok(query_response(schema, rows))
        }
        Command::SelectQuota => {
            let schema = Arc::new(quota_schema());
            let mut encoder = DataRowEncoder::new(schema.clone());
            encoder.encode_field(&engine.quota().await.map(i64::from))?;
            Ok(query_response(schema, vec![Ok(encoder.take_row())]))
        }
    }
}

fn encode_booking(schema: &Arc<Vec<FieldInfo>>, b: &Booking, tz: Tz) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&b.id.to_string())?;
    encoder.encode_field(&b.user_id)?;
    encoder.encode_field(&format_instant(b.span.start, tz))?;
    encoder.encode_field(&format_instant(b.span.end, tz))?;
    encoder.encode_field(&b.status.as_str())?;
    encoder.encode_field(&b.reservation_type_id.map(|t| t.to_string()))?;
    encoder.encode_field(&format_instant(b.created_at, tz))?;
    Ok(encoder.take_row())
}

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("date"),
        text_field("from_hour"),
        text_field("to_hour"),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("user_id"),
        text_field("date_time"),
        text_field("end_time"),
        text_field("status"),
        text_field("reservation_type_id"),
        text_field("created_at"),
    ]
}

fn reservation_types_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("name"),
        FieldInfo::new("duration_minutes".into(), None, None, Type::INT4, FieldFormat::Text),
        text_field("description"),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![text_field("date_time")]
}

fn bookable_dates_schema() -> Vec<FieldInfo> {
    vec![text_field("date")]
}

fn urgent_requests_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("user_id"),
        text_field("message"),
        text_field("status"),
        text_field("submitted_at"),
    ]
}

fn quota_schema() -> Vec<FieldInfo> {
    vec![FieldInfo::new(
        "max_bookings_per_user".into(),
        None,
        None,
        Type::INT8,
        FieldFormat::Text,
    )]
}

/// Row description of a SELECT, judged from its FROM table. Empty for writes.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let lower = sql.to_lowercase();
    let mut words = lower.split(|c: char| c.is_whitespace() || c == ';');
    if words.clone().find(|w| !w.is_empty()) != Some("select") {
        return Vec::new();
    }
    let table = words
        .skip_while(|w| *w != "from")
        .find(|w| !w.is_empty() && *w != "from");
    match table {
        Some("availability") => availability_schema(),
        Some("bookings") => bookings_schema(),
        Some("reservation_types") => reservation_types_schema(),
        Some("slots") => slots_schema(),
        Some("bookable_dates") => bookable_dates_schema(),
        Some("urgent_requests") => urgent_requests_schema(),
        Some("quota") => quota_schema(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotbookHandler {
    async fn do_query<C>(
        &self,
        client: &mut C,
        query: &str,
    ) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        Ok(vec![self.run(&engine, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotbookQueryParser;

#[async_trait]
impl QueryParser for SlotbookQueryParser {
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
impl ExtendedQueryHandler for SlotbookHandler {
    type Statement = String;
    type QueryParser = SlotbookQueryParser;

    fn query_parser(&self) -> Arc<Self::QueryParser> {
        self.query_parser.clone()
    }

    async fn do_query<C>(
        &self,
        client: &mut C,
        portal: &Portal<Self::Statement>,
        _max_rows: usize,
    ) -> PgWireResult<Response>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::PortalStore: PortalStore<Statement = Self::Statement>,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let sql = substitute_params(portal);
        self.run(&engine, &sql).await
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
        Ok(DescribeStatementResponse::new(param_types, result_schema(&target.statement)))
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
        Ok(DescribePortalResponse::new(result_schema(&target.statement.statement)))
    }
}

/// Highest `$N` placeholder outside quoted literals.
fn count_params(sql: &str) -> usize {
    let mut max = 0usize;
    let mut in_literal = false;
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_literal = !in_literal,
            b'$' if !in_literal => {
                let digits = bytes[i + 1..].iter().take_while(|b| b.is_ascii_digit()).count();
                if let Ok(n) = sql[i + 1..i + 1 + digits].parse::<usize>() {
                    max = max.max(n);
                }
                i += digits;
            }
            _ => {}
        }
        i += 1;
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    bind_params(&portal.statement.statement, &portal.parameters)
}

/// One left-to-right pass over `sql`. Each `$N` outside a quoted literal is
/// expanded exactly once; bound text is never rescanned.
fn bind_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut in_literal = false;
    let mut rest = sql;
    while let Some(c) = rest.chars().next() {
        if c == '\'' {
            in_literal = !in_literal;
        }
        if c == '$' && !in_literal {
            let digits = rest[1..].bytes().take_while(u8::is_ascii_digit).count();
            let param = rest[1..1 + digits]
                .parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| params.get(i));
            if let Some(param) = param {
                match param {
                    Some(bytes) => {
                        let text = String::from_utf8_lossy(bytes.as_ref());
                        out.push('\'');
                        out.push_str(&text.replace('\'', "''"));
                        out.push('\'');
                    }
                    None => out.push_str("NULL"),
                }
                rest = &rest[1 + digits..];
                continue;
            }
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }
    out
}

// ── Factory ──────────────────────────────────────────────────────

pub struct SlotbookFactory {
    handler: Arc<SlotbookHandler>,
    auth_handler: Arc<
        CleartextPasswordAuthStartupHandler<SharedPasswordAuthSource, DefaultServerParameterProvider>,
    >,
    noop: Arc<NoopHandler>,
}

impl SlotbookFactory {
    pub fn new(registry: Arc<CalendarRegistry>, password: String) -> Self {
        let auth_source = SharedPasswordAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotbookHandler::new(registry)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotbookFactory {
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

// ── Errors ───────────────────────────────────────────────────────

/// SQLSTATE each error kind is reported under.
pub fn sqlstate(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "22023",
        ErrorKind::Conflict => "23P01",
        ErrorKind::QuotaExceeded => "54000",
        ErrorKind::NotFound => "P0002",
        ErrorKind::Authorization => "42501",
        ErrorKind::Internal => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let kind = e.kind();
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        sqlstate(kind).into(),
        format!("{}: {e}", kind.as_str()),
    )))
}

fn sql_err(e: SqlError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "42601".into(),
        e.to_string(),
    )))
}
