use std::collections::HashMap;
use std::fmt::Debug;
use std::io;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use futures::{Sink, SinkExt, stream};
use pgwire::api::auth::cleartext::CleartextPasswordAuthStartupHandler;
use pgwire::api::auth::{AuthSource, DefaultServerParameterProvider, LoginInfo, Password, StartupHandler};
use pgwire::api::copy::CopyHandler;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::query::{ExtendedQueryHandler, SimpleQueryHandler};
use pgwire::api::results::{
    DataRowEncoder, DescribePortalResponse, DescribeStatementResponse, FieldFormat, FieldInfo, QueryResponse,
    Response, Tag,
};
use pgwire::api::stmt::{QueryParser, StoredStatement};
use pgwire::api::store::PortalStore;
use pgwire::api::{ClientInfo, ClientPortalStore, NoopHandler, PgWireServerHandlers, Type};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::PgWireBackendMessage;
use pgwire::messages::response::NotificationResponse;
use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::TryRecvError;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::engine::{EngineError, NewBooking};
use crate::limits::MAX_LISTEN_CHANNELS;
use crate::model::*;
use crate::notify::{Notice, student_channel, teacher_channel};
use crate::observability as obs;
use crate::scheduling::Scheduler;
use crate::schools::SchoolRegistry;
use crate::sql::{self, BookingFilter, Command};

static NEXT_BACKEND_PID: AtomicI32 = AtomicI32::new(1);

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    schools: Arc<SchoolRegistry>,
    password: String,
    tls: Option<TlsAcceptor>,
) -> io::Result<()> {
    let factory = ClassbookFactory::new(schools, password);
    pgwire::tokio::process_socket(socket, tls, factory).await
}

// ── Auth ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SharedPasswordAuth {
    password: String,
}

impl SharedPasswordAuth {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SharedPasswordAuth {
    async fn get_password(&self, _login: &LoginInfo) -> PgWireResult<Password> {
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

// ── Handler ──────────────────────────────────────────────────────

/// Per-connection query handler. Owns the connection's LISTEN subscriptions.
pub struct ClassbookHandler {
    schools: Arc<SchoolRegistry>,
    query_parser: Arc<ClassbookQueryParser>,
    listens: Mutex<HashMap<String, broadcast::Receiver<Notice>>>,
    pid: i32,
}

impl ClassbookHandler {
    pub fn new(schools: Arc<SchoolRegistry>) -> Self {
        Self {
            schools,
            query_parser: Arc::new(ClassbookQueryParser),
            listens: Mutex::new(HashMap::new()),
            pid: NEXT_BACKEND_PID.fetch_add(1, Ordering::Relaxed),
        }
    }

    fn resolve_school<C: ClientInfo>(&self, client: &C) -> PgWireResult<Arc<Scheduler>> {
        let db = client
            .metadata()
            .get("database")
            .cloned()
            .unwrap_or_else(|| "default".to_string());
        self.schools.get_or_create(&db).map_err(|e| {
            metrics::counter!(obs::AUTH_FAILURES_TOTAL).increment(1);
            user_error("08006", format!("school {db:?} unavailable: {e}"))
        })
    }

    /// Parse, execute and record metrics for one statement.
    async fn run(&self, scheduler: &Scheduler, query: &str) -> PgWireResult<Response> {
        let cmd = match sql::parse_sql(query) {
            Ok(cmd) => cmd,
            Err(e) => {
                metrics::counter!(obs::QUERIES_TOTAL, "command" => "parse", "status" => "error").increment(1);
                return Err(user_error("42601", e.to_string()));
            }
        };
        let label = obs::command_label(&cmd);
        let started = Instant::now();
        let result = self.execute_command(scheduler, cmd).await;
        metrics::histogram!(obs::QUERY_DURATION_SECONDS, "command" => label)
            .record(started.elapsed().as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(obs::QUERIES_TOTAL, "command" => label, "status" => status).increment(1);
        result
    }

    async fn execute_command(&self, scheduler: &Scheduler, cmd: Command) -> PgWireResult<Response> {
        match cmd {
            Command::ReplaceAvailability { teacher_id, rules } => {
                let count = rules.len();
                scheduler
                    .replace_availability(teacher_id, rules)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(count)))
            }
            Command::ClearAvailability { teacher_id } => {
                let count = scheduler.availability(&teacher_id, None).await.len();
                scheduler
                    .clear_availability(teacher_id)
                    .await
                    .map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("DELETE").with_rows(count)))
            }
            Command::SelectAvailability { teacher_id, day_of_week } => {
                let rules = scheduler.availability(&teacher_id, day_of_week).await;
                Ok(rows(availability_schema(), &rules, |enc, rule| {
                    enc.encode_field(&rule.id.to_string())?;
                    enc.encode_field(&teacher_id.to_string())?;
                    enc.encode_field(&(rule.day_of_week as i32))?;
                    enc.encode_field(&format_time_of_day(rule.start_minute))?;
                    enc.encode_field(&format_time_of_day(rule.end_minute))?;
                    enc.encode_field(&rule.is_active)
                }))
            }
            Command::SelectSlots {
                teacher_id,
                date,
                duration_minutes,
                step_minutes,
            } => {
                let plan = scheduler
                    .list_bookable_slots(teacher_id, date, duration_minutes, step_minutes)
                    .await
                    .map_err(engine_err)?;
                let slots: Vec<BookableSlot> = plan.iter().collect();
                Ok(rows(slots_schema(), &slots, |enc, slot| {
                    enc.encode_field(&slot.teacher_id.to_string())?;
                    enc.encode_field(&slot.start)?;
                    enc.encode_field(&slot.end)
                }))
            }
            Command::InsertBooking {
                student_id,
                teacher_id,
                topic_id,
                start,
                duration_minutes,
                idempotency_key,
            } => {
                let booking = scheduler
                    .reserve(NewBooking {
                        student_id,
                        teacher_id,
                        topic_id,
                        start,
                        duration_minutes,
                        idempotency_key,
                    })
                    .await
                    .map_err(engine_err)?;
                Ok(booking_rows(&[booking]))
            }
            Command::UpdateBookingStatus {
                id,
                status,
                admin_override,
                actor,
            } => {
                let booking = if admin_override {
                    scheduler.override_status(id, status, actor).await
                } else {
                    scheduler.set_status(id, status, actor).await
                }
                .map_err(engine_err)?;
                Ok(booking_rows(&[booking]))
            }
            Command::CancelBooking { id, actor } => {
                let booking = scheduler.release(id, actor).await.map_err(engine_err)?;
                Ok(booking_rows(&[booking]))
            }
            Command::SelectBookings { filter } => {
                let bookings = match filter {
                    BookingFilter::Id(id) => vec![scheduler.booking(&id).await.map_err(engine_err)?],
                    BookingFilter::Student {
                        student_id,
                        idempotency_key: Some(key),
                    } => scheduler.booking_by_key(student_id, &key).await.into_iter().collect(),
                    BookingFilter::Student {
                        student_id,
                        idempotency_key: None,
                    } => scheduler.bookings_for_student(&student_id).await,
                    BookingFilter::Teacher(teacher_id) => scheduler.bookings_for_teacher(&teacher_id).await,
                };
                Ok(booking_rows(&bookings))
            }
            Command::InsertPackage { package } => {
                scheduler.grant_package(package).await.map_err(engine_err)?;
                Ok(Response::Execution(Tag::new("INSERT").with_rows(1)))
            }
            Command::SelectPackages { student_id } => {
                let packages = scheduler.packages(&student_id).await;
                let now = crate::engine::now_ms();
                Ok(rows(packages_schema(), &packages, |enc, p| {
                    enc.encode_field(&p.id.to_string())?;
                    enc.encode_field(&p.student_id.to_string())?;
                    enc.encode_field(&(p.total_lessons as i64))?;
                    enc.encode_field(&(p.used_lessons as i64))?;
                    enc.encode_field(&(p.remaining_lessons() as i64))?;
                    enc.encode_field(&p.valid_until)?;
                    enc.encode_field(&p.is_active(now))
                }))
            }
            Command::SelectAttendanceLog { booking_id } => {
                let log = scheduler.attendance_log(&booking_id).await.map_err(engine_err)?;
                Ok(rows(attendance_schema(), &log, |enc, entry| {
                    enc.encode_field(&entry.booking_id.to_string())?;
                    enc.encode_field(&entry.action.to_string())?;
                    enc.encode_field(&entry.timestamp)?;
                    enc.encode_field(&entry.source.to_string())
                }))
            }
            Command::Listen { channel } => {
                let channel = canonical_channel(&channel)?;
                let mut listens = self.lock_listens();
                if !listens.contains_key(&channel) {
                    if listens.len() >= MAX_LISTEN_CHANNELS {
                        return Err(user_error("54000", "too many LISTEN channels".into()));
                    }
                    let rx = scheduler.engine().notify.subscribe(&channel);
                    listens.insert(channel, rx);
                }
                Ok(Response::Execution(Tag::new("LISTEN")))
            }
            Command::Unlisten { channel } => {
                let channel = canonical_channel(&channel)?;
                self.lock_listens().remove(&channel);
                scheduler.engine().notify.prune();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
            Command::UnlistenAll => {
                self.lock_listens().clear();
                scheduler.engine().notify.prune();
                Ok(Response::Execution(Tag::new("UNLISTEN")))
            }
        }
    }

    fn lock_listens(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Receiver<Notice>>> {
        self.listens.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Everything published on this connection's channels since the last drain.
    fn drain_notices(&self) -> Vec<Notice> {
        let mut pending = Vec::new();
        for (channel, rx) in self.lock_listens().iter_mut() {
            loop {
                match rx.try_recv() {
                    Ok(notice) => pending.push(notice),
                    Err(TryRecvError::Lagged(skipped)) => {
                        warn!("listener on {channel} lagged, {skipped} notices dropped");
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
                }
            }
        }
        pending
    }

    /// Notices go out at statement boundaries, ahead of the statement's own result.
    async fn deliver_notices<C>(&self, client: &mut C) -> PgWireResult<()>
    where
        C: Sink<PgWireBackendMessage> + Unpin + Send,
        PgWireError: From<C::Error>,
    {
        for notice in self.drain_notices() {
            debug!("delivering notice on {}", notice.channel);
            client
                .send(PgWireBackendMessage::NotificationResponse(NotificationResponse::new(
                    self.pid,
                    notice.channel,
                    notice.payload,
                )))
                .await?;
        }
        Ok(())
    }
}

/// Channels are `teacher_<id>` or `student_<id>`; the id is normalized so a
/// lower-cased LISTEN still matches what the engine publishes.
fn canonical_channel(channel: &str) -> PgWireResult<String> {
    let bad = || user_error("22023", format!("invalid channel: {channel} (expected teacher_<id> or student_<id>)"));
    let (prefix, id) = channel.split_once('_').ok_or_else(bad)?;
    let id = Ulid::from_string(id).map_err(|_| bad())?;
    match prefix.to_ascii_lowercase().as_str() {
        "teacher" => Ok(teacher_channel(id)),
        "student" => Ok(student_channel(id)),
        _ => Err(bad()),
    }
}

// ── Row schemas ──────────────────────────────────────────────────

fn field(name: &str, ty: Type) -> FieldInfo {
    FieldInfo::new(name.into(), None, None, ty, FieldFormat::Text)
}

fn availability_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("teacher_id", Type::VARCHAR),
        field("day_of_week", Type::INT4),
        field("start_time", Type::VARCHAR),
        field("end_time", Type::VARCHAR),
        field("is_active", Type::BOOL),
    ]
}

fn slots_schema() -> Vec<FieldInfo> {
    vec![
        field("teacher_id", Type::VARCHAR),
        field("start", Type::INT8),
        field("end", Type::INT8),
    ]
}

fn bookings_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("student_id", Type::VARCHAR),
        field("teacher_id", Type::VARCHAR),
        field("topic_id", Type::VARCHAR),
        field("package_id", Type::VARCHAR),
        field("scheduled_at", Type::INT8),
        field("duration", Type::INT8),
        field("status", Type::VARCHAR),
        field("cancelled_at", Type::INT8),
        field("attended_at", Type::INT8),
        field("meeting_link", Type::VARCHAR),
        field("idempotency_key", Type::VARCHAR),
        field("refunded", Type::BOOL),
        field("created_at", Type::INT8),
    ]
}

fn packages_schema() -> Vec<FieldInfo> {
    vec![
        field("id", Type::VARCHAR),
        field("student_id", Type::VARCHAR),
        field("total_lessons", Type::INT8),
        field("used_lessons", Type::INT8),
        field("remaining_lessons", Type::INT8),
        field("valid_until", Type::INT8),
        field("is_active", Type::BOOL),
    ]
}

fn attendance_schema() -> Vec<FieldInfo> {
    vec![
        field("booking_id", Type::VARCHAR),
        field("action", Type::VARCHAR),
        field("timestamp", Type::INT8),
        field("source", Type::VARCHAR),
    ]
}

/// Result columns a statement will produce, judged from its text. Used to
/// describe prepared statements before their parameters are bound.
fn statement_schema(sql: &str) -> Vec<FieldInfo> {
    let upper = sql.to_uppercase();
    let is_select = upper.trim_start().starts_with("SELECT");
    if upper.contains("BOOKABLE_SLOTS") {
        slots_schema()
    } else if upper.contains("ATTENDANCE_LOG") {
        attendance_schema()
    } else if upper.contains("BOOKINGS") {
        bookings_schema()
    } else if is_select && upper.contains("AVAILABILITY") {
        availability_schema()
    } else if is_select && upper.contains("PACKAGES") {
        packages_schema()
    } else {
        Vec::new()
    }
}

fn rows<T>(
    schema: Vec<FieldInfo>,
    items: &[T],
    encode: impl Fn(&mut DataRowEncoder, &T) -> PgWireResult<()>,
) -> Response {
    let schema = Arc::new(schema);
    let data: Vec<PgWireResult<_>> = items
        .iter()
        .map(|item| {
            let mut encoder = DataRowEncoder::new(schema.clone());
            encode(&mut encoder, item)?;
            Ok(encoder.take_row())
        })
        .collect();
    Response::Query(QueryResponse::new(schema, stream::iter(data)))
}

fn booking_rows(bookings: &[Booking]) -> Response {
    rows(bookings_schema(), bookings, |enc, b| {
        enc.encode_field(&b.id.to_string())?;
        enc.encode_field(&b.student_id.to_string())?;
        enc.encode_field(&b.teacher_id.to_string())?;
        enc.encode_field(&b.topic_id.to_string())?;
        enc.encode_field(&b.package_id.to_string())?;
        enc.encode_field(&b.scheduled_at)?;
        enc.encode_field(&(b.duration_minutes as i64))?;
        enc.encode_field(&b.status.to_string())?;
        enc.encode_field(&b.cancelled_at)?;
        enc.encode_field(&b.attended_at)?;
        enc.encode_field(&b.meeting_link)?;
        enc.encode_field(&b.idempotency_key)?;
        enc.encode_field(&b.refunded)?;
        enc.encode_field(&b.created_at)
    })
}

// ── Simple Query Protocol ────────────────────────────────────────

#[async_trait]
impl SimpleQueryHandler for ClassbookHandler {
    async fn do_query<C>(&self, client: &mut C, query: &str) -> PgWireResult<Vec<Response>>
    where
        C: ClientInfo + ClientPortalStore + Sink<PgWireBackendMessage> + Unpin + Send + Sync,
        C::Error: Debug,
        PgWireError: From<C::Error>,
    {
        let scheduler = self.resolve_school(client)?;
        let result = self.run(&scheduler, query).await;
        self.deliver_notices(client).await?;
        Ok(vec![result?])
    }
}

// ── Extended Query Protocol ──────────────────────────────────────

#[derive(Debug)]
pub struct ClassbookQueryParser;

#[async_trait]
impl QueryParser for ClassbookQueryParser {
    type Statement = String;

    async fn parse_sql<C>(&self, _client: &C, sql: &str, _types: &[Option<Type>]) -> PgWireResult<String>
    where
        C: ClientInfo + Unpin + Send + Sync,
    {
        Ok(sql.to_string())
    }

    fn get_parameter_types(&self, stmt: &String) -> PgWireResult<Vec<Type>> {
        Ok(vec![Type::VARCHAR; count_params(stmt)])
    }

    fn get_result_schema(&self, stmt: &String, _column_format: Option<&Format>) -> PgWireResult<Vec<FieldInfo>> {
        Ok(statement_schema(stmt))
    }
}

#[async_trait]
impl ExtendedQueryHandler for ClassbookHandler {
    type Statement = String;
    type QueryParser = ClassbookQueryParser;

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
        let scheduler = self.resolve_school(client)?;
        let sql = substitute_params(portal);
        let result = self.run(&scheduler, &sql).await;
        self.deliver_notices(client).await?;
        result
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
            statement_schema(&target.statement),
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
        Ok(DescribePortalResponse::new(statement_schema(
            &target.statement.statement,
        )))
    }
}

/// Highest `$N` placeholder in the statement.
fn count_params(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut max = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'$' {
            i += 1;
            continue;
        }
        i += 1;
        let start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if let Ok(n) = sql[start..i].parse::<usize>() {
            max = max.max(n);
        }
    }
    max
}

/// Inline bound text parameters as quoted literals, highest index first so
/// `$1` never clobbers the prefix of `$10`.
fn substitute_params(portal: &Portal<String>) -> String {
    let mut sql = portal.statement.statement.to_string();
    for (i, param) in portal.parameters.iter().enumerate().rev() {
        let value = match param {
            Some(bytes) => format!("'{}'", String::from_utf8_lossy(bytes).replace('\'', "''")),
            None => "NULL".to_string(),
        };
        sql = sql.replace(&format!("${}", i + 1), &value);
    }
    sql
}

// ── Factory ──────────────────────────────────────────────────────

pub struct ClassbookFactory {
    handler: Arc<ClassbookHandler>,
    auth_handler: Arc<CleartextPasswordAuthStartupHandler<SharedPasswordAuth, DefaultServerParameterProvider>>,
    noop: Arc<NoopHandler>,
}

impl ClassbookFactory {
    pub fn new(schools: Arc<SchoolRegistry>, password: String) -> Self {
        Self {
            handler: Arc::new(ClassbookHandler::new(schools)),
            auth_handler: Arc::new(CleartextPasswordAuthStartupHandler::new(
                SharedPasswordAuth::new(password),
                DefaultServerParameterProvider::default(),
            )),
            noop: Arc::new(NoopHandler),
        }
    }
}

impl PgWireServerHandlers for ClassbookFactory {
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

fn user_error(code: &str, message: String) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new("ERROR".into(), code.into(), message)))
}

fn engine_err(e: EngineError) -> PgWireError {
    user_error(e.sqlstate(), e.to_string())
}
