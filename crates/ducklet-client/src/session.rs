//! Connection session
//!
//! A session runs statements on one engine connection and arbitrates its single active-stream
//! slot: a cursor whose result is streaming occupies the slot, and any later execute on the same
//! session supersedes it. The superseded cursor is released immediately and its reader sees
//! [`DuckletError::StreamSuperseded`].
//!
//! Engine work starts as soon as `execute*` is called; the returned [`PendingQuery`] only waits
//! for it. Closing the session afterwards does not stop the statement.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use ducklet_common::{BigIntMode, ClientConfig, DuckletError, Result, RowFormat};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn, Span};

use crate::cursor::{ResultCursor, RowShape};
use crate::engine::{QueryEngine, ResultKind};
use crate::metadata::Row;
use crate::stream::RowStream;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-call execution options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Deliver rows as a push stream instead of a pull cursor
    pub streaming: bool,
    /// Buffer the whole result and release the engine handle before returning
    pub force_materialized: bool,
    /// Overrides [`ClientConfig::default_row_format`]
    pub row_format: Option<RowFormat>,
    /// Overrides [`ClientConfig::bigint_mode`]
    pub bigint_mode: Option<BigIntMode>,
    /// Overrides [`ClientConfig::stream_high_water_mark`]
    pub high_water_mark: Option<usize>,
}

impl ExecuteOptions {
    pub fn streaming() -> Self {
        Self {
            streaming: true,
            ..Self::default()
        }
    }

    pub fn materialized() -> Self {
        Self {
            force_materialized: true,
            ..Self::default()
        }
    }

    pub fn with_row_format(mut self, format: RowFormat) -> Self {
        self.row_format = Some(format);
        self
    }

    pub fn with_bigint_mode(mut self, mode: BigIntMode) -> Self {
        self.bigint_mode = Some(mode);
        self
    }

    pub fn with_high_water_mark(mut self, rows: usize) -> Self {
        self.high_water_mark = Some(rows);
        self
    }

    fn kind(&self) -> ResultKind {
        if self.force_materialized {
            ResultKind::Materialized
        } else {
            ResultKind::Streaming
        }
    }
}

/// Outcome of [`Session::execute`]
#[derive(Debug)]
pub enum QueryResult {
    Cursor(Arc<ResultCursor>),
    Stream(RowStream),
}

impl QueryResult {
    pub fn into_cursor(self) -> Option<Arc<ResultCursor>> {
        match self {
            QueryResult::Cursor(cursor) => Some(cursor),
            QueryResult::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<RowStream> {
        match self {
            QueryResult::Cursor(_) => None,
            QueryResult::Stream(stream) => Some(stream),
        }
    }
}

/// A statement already running on the engine
///
/// Dropping it does not cancel the statement; the result is released once it completes.
#[must_use = "the query result is only available by awaiting it"]
pub struct PendingQuery<T> {
    inner: BoxFuture<'static, Result<T>>,
}

impl<T: Send + 'static> PendingQuery<T> {
    fn new(future: impl Future<Output = Result<T>> + Send + 'static) -> Self {
        Self {
            inner: future.boxed(),
        }
    }

    fn failed(err: DuckletError) -> Self {
        Self::new(futures::future::ready(Err(err)))
    }
}

impl<T> Future for PendingQuery<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

/// The session's active-stream slot
type ActiveStream = Arc<Mutex<Option<Weak<ResultCursor>>>>;

/// One connection's worth of query execution
pub struct Session {
    id: u64,
    engine: Arc<dyn QueryEngine>,
    config: ClientConfig,
    active_stream: ActiveStream,
    /// Held from engine execute until the slot is updated, so slot order follows engine order
    execute_lock: Arc<Mutex<()>>,
    closed: Arc<AtomicBool>,
}

impl Session {
    pub fn new(engine: Arc<dyn QueryEngine>, config: ClientConfig) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(session = id, "Session opened");
        Self {
            id,
            engine,
            config,
            active_stream: Arc::new(Mutex::new(None)),
            execute_lock: Arc::new(Mutex::new(())),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Run `sql`, returning a pull cursor or a push stream per `options.streaming`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn execute(&self, sql: &str, options: ExecuteOptions) -> PendingQuery<QueryResult> {
        if options.streaming {
            let stream = self.execute_stream(sql, options);
            PendingQuery::new(async move { stream.await.map(QueryResult::Stream) })
        } else {
            let cursor = self.execute_iterator(sql, options);
            PendingQuery::new(async move { cursor.await.map(QueryResult::Cursor) })
        }
    }

    /// Run `sql` and hand back a pull cursor
    pub fn execute_iterator(
        &self,
        sql: &str,
        options: ExecuteOptions,
    ) -> PendingQuery<Arc<ResultCursor>> {
        self.start(sql, &options)
    }

    /// Run `sql` and hand back a backpressured row stream
    pub fn execute_stream(&self, sql: &str, options: ExecuteOptions) -> PendingQuery<RowStream> {
        let high_water_mark = options
            .high_water_mark
            .unwrap_or(self.config.stream_high_water_mark);
        let cursor = self.start(sql, &options);
        PendingQuery::new(async move {
            let cursor = cursor.await?;
            Ok(RowStream::new(cursor, high_water_mark))
        })
    }

    /// Run `sql` materialized and collect every row
    pub async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let cursor = self
            .execute_iterator(sql, ExecuteOptions::materialized())
            .await?;
        let rows = cursor.fetch_all();
        cursor.close();
        rows
    }

    /// Stop accepting statements and close the active stream.
    ///
    /// Statements already started still complete; their cursors are handed back unattached and
    /// stay readable. Materialized cursors handed out earlier are untouched.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let active = self.active_stream.lock().take().and_then(|weak| weak.upgrade());
        if let Some(cursor) = active {
            cursor.close();
            debug!(session = self.id, "Active stream closed with its session");
        }
        info!(session = self.id, "Session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// A streaming cursor currently occupies the active slot
    pub fn has_active_stream(&self) -> bool {
        self.active_stream
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|cursor| !cursor.is_closed())
    }

    #[instrument(skip(self, options), fields(session = self.id, kind = %options.kind()))]
    fn start(&self, sql: &str, options: &ExecuteOptions) -> PendingQuery<Arc<ResultCursor>> {
        if self.is_closed() {
            return PendingQuery::failed(DuckletError::ConnectionClosed("Connection".into()));
        }

        let kind = options.kind();
        let shape = RowShape {
            format: options.row_format.unwrap_or(self.config.default_row_format),
            bigint_mode: options.bigint_mode.unwrap_or(self.config.bigint_mode),
        };
        let engine = self.engine.clone();
        let active_stream = self.active_stream.clone();
        let execute_lock = self.execute_lock.clone();
        let closed = self.closed.clone();
        let session = self.id;
        let sql = sql.to_string();
        let span = Span::current();

        let task = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let _executing = execute_lock.lock();
            let handle = engine.execute_statement(&sql, kind)?;
            let cursor = Arc::new(ResultCursor::attach(engine, handle, kind, shape)?);

            if kind == ResultKind::Materialized {
                cursor.materialize()?;
            }
            assign_active_stream(&active_stream, &closed, &cursor, session);
            Ok(cursor)
        });

        PendingQuery::new(async move {
            task.await
                .map_err(|e| DuckletError::internal(format!("Execute task failed: {}", e)))?
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("is_closed", &self.is_closed())
            .field("has_active_stream", &self.has_active_stream())
            .finish()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Give `cursor` the session's active-stream slot.
///
/// The previous occupant is superseded whatever the new kind is, since the engine has already
/// invalidated it; only a streaming cursor takes the slot. Nothing is installed once the session
/// is closed.
fn assign_active_stream(
    slot: &Mutex<Option<Weak<ResultCursor>>>,
    closed: &AtomicBool,
    cursor: &Arc<ResultCursor>,
    session: u64,
) {
    let mut slot = slot.lock();
    if let Some(previous) = slot.take().and_then(|weak| weak.upgrade()) {
        if !Arc::ptr_eq(&previous, cursor) && previous.supersede() {
            warn!(
                session,
                rows = previous.rows_fetched(),
                "Active stream superseded by a newer statement"
            );
        }
    }

    if cursor.kind() == ResultKind::Streaming && !closed.load(Ordering::SeqCst) {
        *slot = Some(Arc::downgrade(cursor));
        debug!(session, "Cursor installed as active stream");
    }
}
