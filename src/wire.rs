use std::fmt::Debug;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::NaiveDate;
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
use ulid::Ulid;

use crate::auth::SlotdAuthSource;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, DateParam};
use crate::tenant::TenantManager;

pub struct SlotdHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<SlotdQueryParser>,
}

impl SlotdHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(SlotdQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            PgWireError::UserError(Box::new(ErrorInfo::new(
                "ERROR".into(),
                "08006".into(),
                format!("tenant error: {e}"),
            )))
        })
    }

    async fn execute(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        let label = observability::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(engine, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Vec<Response>> {
        match cmd {
            Command::InsertShop { id, name } => {
                engine.create_shop(id, name).await.map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::DeleteShop { id } => {
                engine.delete_shop(id).await.map_err(engine_err)?;
                Ok(vec![delete_tag(1)])
            }
            Command::SetHours { shop_id, weekday, open, close, closed } => {
                engine
                    .set_shop_hours(shop_id, weekday, DayRule { open, close, closed })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::InsertClosure { shop_id, date, start, end } => {
                let span = closure_span(start, end)?;
                engine
                    .add_closure(shop_id, date, span)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::DeleteClosure { shop_id, date } => {
                engine
                    .remove_closure(shop_id, date)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![delete_tag(1)])
            }
            Command::InsertService {
                id,
                shop_id,
                name,
                duration_min,
                price_cents,
                buffer_before,
                buffer_after,
            } => {
                engine
                    .create_service(id, shop_id, name, duration_min, price_cents, buffer_before, buffer_after)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::DeleteService { id } => {
                engine.delete_service(id).await.map_err(engine_err)?;
                Ok(vec![delete_tag(1)])
            }
            Command::InsertStaff { id, shop_id, name } => {
                engine
                    .create_staff(id, shop_id, name)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::DeleteStaff { id } => {
                engine.delete_staff(id).await.map_err(engine_err)?;
                Ok(vec![delete_tag(1)])
            }
            Command::SetStaffHours { staff_id, weekday, start, end, day_off } => {
                engine
                    .set_staff_hours(staff_id, weekday, DayRule { open: start, close: end, closed: day_off })
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::AssignService { staff_id, service_id } => {
                engine
                    .assign_service(staff_id, service_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::UnassignService { staff_id, service_id } => {
                engine
                    .unassign_service(staff_id, service_id)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![delete_tag(1)])
            }
            Command::InsertTimeOff { id, staff_id, start_date, end_date, approved } => {
                engine
                    .add_time_off(id, staff_id, start_date, end_date, approved)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::DeleteTimeOff { id } => {
                engine.remove_time_off(id).await.map_err(engine_err)?;
                Ok(vec![delete_tag(1)])
            }
            Command::InsertBooking { id, staff_id, service_id, date, start, status, customer } => {
                let status = status.unwrap_or(BookingStatus::Pending);
                let result = engine
                    .create_booking(id, staff_id, service_id, date, start, status, customer)
                    .await;
                if matches!(result, Err(EngineError::Conflict(_))) {
                    metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                }
                result.map_err(engine_err)?;
                Ok(vec![insert_tag(1)])
            }
            Command::DeleteBooking { id } => {
                engine.cancel_booking(id, None).await.map_err(engine_err)?;
                Ok(vec![delete_tag(1)])
            }
            Command::SetBookingStatus { id, status, reason } => {
                engine
                    .set_booking_status(id, status, reason)
                    .await
                    .map_err(engine_err)?;
                Ok(vec![Response::Execution(Tag::new("UPDATE").with_rows(1))])
            }
            Command::SelectShops => {
                let shops = engine.list_shops();
                let schema = Arc::new(shops_schema());
                let rows: Vec<PgWireResult<_>> = shops
                    .into_iter()
                    .map(|shop| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&shop.id.to_string())?;
                        encoder.encode_field(&shop.name)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectServices { shop_id } => {
                let services = engine.list_services(shop_id).await.map_err(engine_err)?;
                let schema = Arc::new(services_schema());
                let rows: Vec<PgWireResult<_>> = services
                    .into_iter()
                    .map(|s| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&s.id.to_string())?;
                        encoder.encode_field(&s.shop_id.to_string())?;
                        encoder.encode_field(&s.name)?;
                        encoder.encode_field(&(s.duration_min as i64))?;
                        encoder.encode_field(&s.price_cents)?;
                        encoder.encode_field(&(s.buffer_before as i64))?;
                        encoder.encode_field(&(s.buffer_after as i64))?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectStaff { shop_id, service_id } => {
                let staff = engine
                    .list_staff(shop_id, service_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(staff_schema());
                let rows: Vec<PgWireResult<_>> = staff
                    .into_iter()
                    .map(|m| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&m.id.to_string())?;
                        encoder.encode_field(&m.shop_id.to_string())?;
                        encoder.encode_field(&m.name)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectSlots { shop_id, service_id, staff_id, date } => {
                // Missing date filter means today; a malformed one yields
                // no rows.
                let slots = match date {
                    DateParam::Today => engine
                        .available_slots(shop_id, service_id, staff_id, today())
                        .await
                        .map_err(engine_err)?,
                    DateParam::On(date) => engine
                        .available_slots(shop_id, service_id, staff_id, date)
                        .await
                        .map_err(engine_err)?,
                    DateParam::Invalid => Vec::new(),
                };

                let schema = Arc::new(slots_schema());
                let rows: Vec<PgWireResult<_>> = slots
                    .into_iter()
                    .map(|slot| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&slot.key())?;
                        encoder.encode_field(&fmt_hhmm(slot.end))?;
                        encoder.encode_field(&slot.label())?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectBookings { shop_id, date, staff_id, status } => {
                let bookings = engine
                    .list_bookings(shop_id, date, staff_id, status)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(bookings_schema());
                let rows: Vec<PgWireResult<_>> = bookings
                    .into_iter()
                    .map(|b| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&b.id.to_string())?;
                        encoder.encode_field(&b.staff_id.to_string())?;
                        encoder.encode_field(&b.service_id.to_string())?;
                        encoder.encode_field(&b.date.to_string())?;
                        encoder.encode_field(&fmt_hhmm(b.span.start))?;
                        encoder.encode_field(&fmt_hhmm(b.span.end))?;
                        encoder.encode_field(&b.status.as_str())?;
                        encoder.encode_field(&b.customer)?;
                        encoder.encode_field(&b.price_cents)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::SelectStats { shop_id, start_date, end_date } => {
                let stats = engine
                    .booking_stats(shop_id, start_date, end_date)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(stats_schema());
                let rows: Vec<PgWireResult<_>> = stats
                    .into_iter()
                    .map(|row| {
                        let mut encoder = DataRowEncoder::new(schema.clone());
                        encoder.encode_field(&row.status.as_str())?;
                        encoder.encode_field(&(row.count as i64))?;
                        encoder.encode_field(&row.revenue_cents)?;
                        Ok(encoder.take_row())
                    })
                    .collect();
                Ok(vec![Response::Query(QueryResponse::new(schema, stream::iter(rows)))])
            }
            Command::Listen { channel } => {
                let shop_id_str = channel.strip_prefix("shop_").ok_or_else(|| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("invalid channel: {channel} (expected shop_{{id}})"),
                    )))
                })?;
                let _shop_id = Ulid::from_string(shop_id_str).map_err(|e| {
                    PgWireError::UserError(Box::new(ErrorInfo::new(
                        "ERROR".into(),
                        "42000".into(),
                        format!("bad ULID in channel: {e}"),
                    )))
                })?;
                Ok(vec![Response::Execution(Tag::new("LISTEN"))])
            }
            Command::Unlisten { .. } => Ok(vec![Response::Execution(Tag::new("UNLISTEN"))]),
        }
    }
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

fn insert_tag(rows: usize) -> Response {
    Response::Execution(Tag::new("INSERT").with_rows(rows))
}

fn delete_tag(rows: usize) -> Response {
    Response::Execution(Tag::new("DELETE").with_rows(rows))
}

fn closure_span(start: Option<Minutes>, end: Option<Minutes>) -> PgWireResult<Option<Span>> {
    match (start, end) {
        (None, None) => Ok(None),
        (Some(start), Some(end)) if start < end => Ok(Some(Span::new(start, end))),
        (Some(_), Some(_)) => Err(PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "22000".into(),
            "closure start must precede end".into(),
        )))),
        _ => Err(PgWireError::UserError(Box::new(ErrorInfo::new(
            "ERROR".into(),
            "22000".into(),
            "closure start and end must both be set, or neither".into(),
        )))),
    }
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn int_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::INT8, FieldFormat::Text)
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![text_field("start"), text_field("end"), text_field("label")]
}

fn shops_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("name")]
}

fn services_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("shop_id"),
        text_field("name"),
        int_field("duration"),
        int_field("price_cents"),
        int_field("buffer_before"),
        int_field("buffer_after"),
    ]
}

fn staff_schema() -> Vec<FieldInfo> {
    vec![text_field("id"), text_field("shop_id"), text_field("name")]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        text_field("id"),
        text_field("staff_id"),
        text_field("service_id"),
        text_field("date"),
        text_field("start"),
        text_field("end"),
        text_field("status"),
        text_field("customer"),
        int_field("price_cents"),
    ]
}

fn stats_schema() -> Vec<FieldInfo> {
    vec![text_field("status"), int_field("count"), int_field("revenue_cents")]
}

/// Result schema for a SELECT, keyed by the table mentioned in the text.
fn schema_for_statement(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    if !upper.contains("SELECT") {
        return vec![];
    }
    if upper.contains("BOOKING_STATS") {
        stats_schema()
    } else if upper.contains("SLOTS") {
        slots_schema()
    } else if upper.contains("BOOKINGS") {
        bookings_schema()
    } else if upper.contains("SERVICES") {
        services_schema()
    } else if upper.contains("STAFF") {
        staff_schema()
    } else if upper.contains("SHOPS") {
        shops_schema()
    } else {
        vec![]
    }
}

#[async_trait]
impl SimpleQueryHandler for SlotdHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(query).map_err(sql_err)?;
        self.execute(&engine, cmd).await
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct SlotdQueryParser;

#[async_trait]
impl QueryParser for SlotdQueryParser {
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
        Ok(schema_for_statement(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for SlotdHandler {
    type Statement = String;
    type QueryParser = SlotdQueryParser;

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
        let cmd = sql::parse_sql(&sql).map_err(sql_err)?;
        let mut responses = self.execute(&engine, cmd).await?;
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
            schema_for_statement(&target.statement),
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
        Ok(DescribePortalResponse::new(schema_for_statement(
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
            if i > start {
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    if n > max {
                        max = n;
                    }
                }
            }
        } else {
            i += 1;
        }
    }
    max
}

/// Substitute $1, $2, ... placeholders with bound parameter values (text format).
fn substitute_params(portal: &Portal<String>) -> String {
    let sql = portal.statement.statement.to_string();
    let params = &portal.parameters;
    let mut result = sql;

    for (i, param) in params.iter().enumerate().rev() {
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

pub struct SlotdFactory {
    handler: Arc<SlotdHandler>,
    auth_handler:
        Arc<CleartextPasswordAuthStartupHandler<SlotdAuthSource, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl SlotdFactory {
    pub fn new(tenant_manager: Arc<TenantManager>, password: String) -> Self {
        let auth_source = SlotdAuthSource::new(password);
        let param_provider = DefaultServerParameterProvider::default();
        Self {
            handler: Arc::new(SlotdHandler::new(tenant_manager)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                auth_source,
                param_provider,
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for SlotdFactory {
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

/// Serve one client connection to completion.
pub async fn process_connection(
    socket: TcpStream,
    tenant_manager: Arc<TenantManager>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> Result<(), std::io::Error> {
    let factory = SlotdFactory::new(tenant_manager, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

fn engine_err(e: EngineError) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        "P0001".into(),
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
