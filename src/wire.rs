use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream;
use futures::Sink;
use pgwire::api::auth::noop::NoopStartupHandler;
use pgwire::api::auth::StartupHandler;
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
use pgwire::tokio::{process_socket, TlsAcceptor};
use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::engine::{Engine, EngineError, ErrorKind};
use crate::model::*;
use crate::observability;
use crate::sql::{self, Command, SqlError};
use crate::tenant::TenantManager;

pub struct RentLedgerHandler {
    tenant_manager: Arc<TenantManager>,
    query_parser: Arc<RentLedgerQueryParser>,
}

impl RentLedgerHandler {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            tenant_manager,
            query_parser: Arc::new(RentLedgerQueryParser),
        }
    }

    fn resolve_engine<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Engine>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.tenant_manager.get_or_create(&db).map_err(|e| {
            user_error("08006", format!("tenant error: {e}"))
        })
    }

    /// Parse, execute and record metrics for one statement.
    async fn run_sql<C: ClientInfo>(&self, client: &C, sql: &str) -> PgWireResult<Response> {
        let engine = self.resolve_engine(client)?;
        let cmd = sql::parse_sql(sql).map_err(sql_err)?;
        let label = observability::command_label(&cmd);

        let start = Instant::now();
        let result = self.execute_command(&engine, cmd).await;
        metrics::histogram!(observability::QUERY_DURATION_SECONDS, "command" => label)
            .record(start.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::QUERIES_TOTAL, "command" => label, "status" => status)
            .increment(1);
        result
    }

    async fn execute_command(&self, engine: &Engine, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::InsertVehicle { id, name } => {
                engine.register_vehicle(id, name).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::UpsertIntervals {
                vehicle_id,
                manager_id,
                intervals,
            } => {
                let written = engine
                    .upsert_intervals(vehicle_id, manager_id, intervals)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(interval_schema());
                let rows: Vec<_> = written
                    .iter()
                    .map(|i| encode_interval(&schema, vehicle_id, i))
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::DeleteInterval { id } => {
                engine.delete_interval(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::InsertContract {
                listing_id,
                request,
            } => {
                let contract = engine
                    .request_booking(listing_id, request)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(contract_schema());
                let row = encode_contract(&schema, &contract);
                Ok(query_response(schema, vec![row]))
            }
            Command::DeleteContract { id } => {
                engine.cancel_booking(id).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(1)))
            }
            Command::SelectListing { vehicle_id } => {
                let view = engine.get_listing_view(vehicle_id).await.map_err(engine_err)?;
                let schema = Arc::new(listing_schema());
                let row = encode_listing(&schema, None, &view);
                Ok(query_response(schema, vec![row]))
            }
            Command::SelectVehicles {
                page,
                limit,
                search,
            } => {
                let result = engine
                    .list_vehicles(page.as_deref(), limit.as_deref(), search.as_deref())
                    .await;
                let schema = Arc::new(vehicles_schema());
                let paging = (result.page, result.limit);
                let rows = result
                    .data
                    .iter()
                    .map(|view| encode_listing(&schema, Some(paging), view))
                    .collect();
                Ok(query_response(schema, rows))
            }
            Command::SelectContracts { listing_id } => {
                let contracts = engine
                    .list_active_contracts(listing_id)
                    .await
                    .map_err(engine_err)?;
                let schema = Arc::new(contract_schema());
                let rows = contracts
                    .iter()
                    .map(|c| encode_contract(&schema, c))
                    .collect();
                Ok(query_response(schema, rows))
            }
        }
    }
}

// ── Result schemas ───────────────────────────────────────────────

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, Type::VARCHAR, FieldFormat::Text)
}

fn interval_schema() -> Vec<FieldInfo> {
    ["id", "vehicle_id", "open_date", "close_date", "price", "status"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn contract_schema() -> Vec<FieldInfo> {
    [
        "id",
        "listing_id",
        "customer_id",
        "employee_id",
        "agreed_price",
        "start_date",
        "end_date",
    ]
    .into_iter()
    .map(text_field)
    .collect()
}

fn listing_schema() -> Vec<FieldInfo> {
    ["vehicle_id", "name", "listing_id", "manager_id", "intervals", "contracts"]
        .into_iter()
        .map(text_field)
        .collect()
}

fn vehicles_schema() -> Vec<FieldInfo> {
    let mut fields = vec![
        FieldInfo::new("page".into(), None, None, Type::INT8, FieldFormat::Text),
        FieldInfo::new("limit".into(), None, None, Type::INT8, FieldFormat::Text),
    ];
    fields.extend(listing_schema());
    fields
}

/// Schema a statement will return, guessed from its text so that Describe
/// works before parameters are bound.
fn result_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.trim_start().to_uppercase();
    if upper.starts_with("SELECT") {
        if upper.contains("LISTINGS") {
            listing_schema()
        } else if upper.contains("VEHICLES") {
            vehicles_schema()
        } else if upper.contains("CONTRACTS") {
            contract_schema()
        } else {
            vec![]
        }
    } else if upper.starts_with("INSERT") && upper.contains("INTERVALS") {
        interval_schema()
    } else if upper.starts_with("INSERT") && upper.contains("CONTRACTS") {
        contract_schema()
    } else {
        vec![]
    }
}

// ── Row encoding ─────────────────────────────────────────────────

fn query_response(schema: Arc<Vec<FieldInfo>>, rows: Vec<PgWireResult<DataRow>>) -> Response {
    Response::Query(QueryResponse::new(schema, stream::iter(rows)))
}

fn encode_interval(
    schema: &Arc<Vec<FieldInfo>>,
    vehicle_id: ulid::Ulid,
    interval: &RentableInterval,
) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&interval.id.to_string())?;
    encoder.encode_field(&vehicle_id.to_string())?;
    encoder.encode_field(&interval.range.start.to_string())?;
    encoder.encode_field(&interval.range.end.to_string())?;
    encoder.encode_field(&interval.price.to_string())?;
    encoder.encode_field(&interval.status.to_string())?;
    Ok(encoder.take_row())
}

fn encode_contract(schema: &Arc<Vec<FieldInfo>>, contract: &BookingContract) -> PgWireResult<DataRow> {
    let mut encoder = DataRowEncoder::new(schema.clone());
    encoder.encode_field(&contract.id.to_string())?;
    encoder.encode_field(&contract.listing_id.to_string())?;
    encoder.encode_field(&contract.customer_id.to_string())?;
    encoder.encode_field(&contract.employee_id.to_string())?;
    encoder.encode_field(&contract.agreed_price.to_string())?;
    encoder.encode_field(&contract.range.start.to_string())?;
    encoder.encode_field(&contract.range.end.to_string())?;
    Ok(encoder.take_row())
}

/// One assembled listing; `paging` adds the leading page/limit columns.
fn encode_listing(
    schema: &Arc<Vec<FieldInfo>>,
    paging: Option<(u32, u32)>,
    view: &AssembledListing,
) -> PgWireResult<DataRow> {
    let intervals = serde_json::to_string(&view.intervals).map_err(json_err)?;
    let contracts = serde_json::to_string(&view.contracts).map_err(json_err)?;

    let mut encoder = DataRowEncoder::new(schema.clone());
    if let Some((page, limit)) = paging {
        encoder.encode_field(&i64::from(page))?;
        encoder.encode_field(&i64::from(limit))?;
    }
    encoder.encode_field(&view.vehicle.id.to_string())?;
    encoder.encode_field(&view.vehicle.name)?;
    encoder.encode_field(&view.listing_id.map(|id| id.to_string()))?;
    encoder.encode_field(&view.manager_id.map(|id| id.to_string()))?;
    encoder.encode_field(&intervals)?;
    encoder.encode_field(&contracts)?;
    Ok(encoder.take_row())
}

#[async_trait]
impl SimpleQueryHandler for RentLedgerHandler {
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
        Ok(vec![self.run_sql(client, query).await?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct RentLedgerQueryParser;

#[async_trait]
impl QueryParser for RentLedgerQueryParser {
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
impl ExtendedQueryHandler for RentLedgerHandler {
    type Statement = String;
    type QueryParser = RentLedgerQueryParser;

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
        let sql = substitute_params(&portal.statement.statement, &portal.parameters);
        self.run_sql(client, &sql).await
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

/// Highest `$N` placeholder outside quoted literals and identifiers.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut quote: Option<u8> = None;
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        i += 1;
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let start = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if let Ok(n) = sql[start..i].parse::<usize>() {
                    max = max.max(n);
                }
            }
            None => {}
        }
    }
    max
}

/// Replace `$N` placeholders with bound values (text format) in one pass.
/// Placeholders inside quoted literals or identifiers are left alone, and
/// substituted values are never rescanned.
fn substitute_params<B: AsRef<[u8]>>(sql: &str, params: &[Option<B>]) -> String {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut quote: Option<u8> = None;
    let mut copied = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None if b == b'$' => {
                let digits_end = bytes[i + 1..]
                    .iter()
                    .position(|c| !c.is_ascii_digit())
                    .map_or(bytes.len(), |n| i + 1 + n);
                let param = sql[i + 1..digits_end]
                    .parse::<usize>()
                    .ok()
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|idx| params.get(idx));
                if let Some(param) = param {
                    out.push_str(&sql[copied..i]);
                    match param {
                        Some(value) => {
                            let text = String::from_utf8_lossy(value.as_ref());
                            out.push('\'');
                            out.push_str(&text.replace('\'', "''"));
                            out.push('\'');
                        }
                        None => out.push_str("NULL"),
                    }
                    copied = digits_end;
                    i = digits_end;
                    continue;
                }
            }
            None => {}
        }
        i += 1;
    }
    out.push_str(&sql[copied..]);
    out
}

// ── Startup / factory ────────────────────────────────────────────

impl NoopStartupHandler for RentLedgerHandler {}

pub struct RentLedgerFactory {
    handler: Arc<RentLedgerHandler>,
    noop: Arc<NoopHandler>,
}

impl RentLedgerFactory {
    pub fn new(tenant_manager: Arc<TenantManager>) -> Self {
        Self {
            handler: Arc::new(RentLedgerHandler::new(tenant_manager)),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for RentLedgerFactory {
    fn simple_query_handler(&self) -> Arc<impl SimpleQueryHandler> {
        self.handler.clone()
    }

    fn extended_query_handler(&self) -> Arc<impl ExtendedQueryHandler> {
        self.handler.clone()
    }

    fn startup_handler(&self) -> Arc<impl StartupHandler> {
        self.handler.clone()
    }

    fn copy_handler(&self) -> Arc<impl CopyHandler> {
        self.noop.clone()
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    factory: Arc<RentLedgerFactory>,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    process_socket(socket, tls, factory).await
}

// ── Error mapping ────────────────────────────────────────────────

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".into(),
        code.into(),
        message,
    )))
}

/// SQLSTATE for an engine failure.
fn engine_sqlstate(e: &EngineError) -> &'static str {
    match (e.kind(), e) {
        (_, EngineError::InvalidRange { .. }) => "22007",
        (_, EngineError::AlreadyExists(_)) => "23505",
        (ErrorKind::Validation, _) => "22023",
        (ErrorKind::NotFound, _) => "P0002",
        (ErrorKind::Conflict, _) => "23P01",
        (ErrorKind::Internal, _) => "XX000",
    }
}

fn engine_err(e: EngineError) -> PgWireError {
    let code = engine_sqlstate(&e);
    if e.kind() == ErrorKind::Internal {
        error!("storage failure: {e}");
        return user_error(code, "internal storage error".into());
    }
    debug!("request rejected ({code}): {e}");
    user_error(code, e.to_string())
}

fn sql_sqlstate(e: &SqlError) -> &'static str {
    match e {
        SqlError::BadDate(_) => "22007",
        SqlError::UnknownTable(_) => "42P01",
        _ => "42601",
    }
}

fn sql_err(e: SqlError) -> PgWireError {
    user_error(sql_sqlstate(&e), e.to_string())
}

fn json_err(e: serde_json::Error) -> PgWireError {
    error!("row encoding failed: {e}");
    user_error("XX000", "internal encoding error".into())
}
