//! Result cursor: sequential pull access to one native result
//!
//! A cursor owns exactly one [`NativeResultHandle`] and releases it exactly once, whether it is
//! closed explicitly, superseded by a newer stream on its session, or dropped.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use ducklet_common::{BigIntMode, DuckletError, Result, RowFormat};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::engine::{NativeResultHandle, QueryEngine, ResultKind};
use crate::metadata::{ResultMetadata, Row};
use crate::value::{coerce_row, NativeValue};

const OPEN: u8 = 0;
const CLOSED: u8 = 1;
const SUPERSEDED: u8 = 2;

/// How engine tuples are turned into rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowShape {
    pub format: RowFormat,
    pub bigint_mode: BigIntMode,
}

struct CursorInner {
    handle: Option<NativeResultHandle>,
    /// Rows already drained from the engine (materialized cursors)
    buffered: VecDeque<Row>,
    /// The engine returned its end-marker
    exhausted: bool,
}

/// Forward-only cursor over one query result
pub struct ResultCursor {
    kind: ResultKind,
    shape: RowShape,
    engine: Option<Arc<dyn QueryEngine>>,
    metadata: ResultMetadata,
    state: AtomicU8,
    inner: Mutex<CursorInner>,
    closed_tx: watch::Sender<bool>,
    rows_fetched: AtomicUsize,
}

impl ResultCursor {
    /// Take ownership of a freshly executed result.
    ///
    /// The handle is released again if describing it fails.
    pub fn attach(
        engine: Arc<dyn QueryEngine>,
        handle: NativeResultHandle,
        kind: ResultKind,
        shape: RowShape,
    ) -> Result<Self> {
        let mut cursor = Self::new(Some(engine), Some(handle), kind, shape, OPEN);
        let columns = {
            let inner = cursor.inner.get_mut();
            match (&cursor.engine, &inner.handle) {
                (Some(engine), Some(handle)) => engine.describe_result(handle)?,
                _ => return Err(DuckletError::ResultClosed),
            }
        };
        cursor.metadata = ResultMetadata::new(columns);
        debug!(kind = %kind, columns = cursor.metadata.len(), "Cursor attached");
        Ok(cursor)
    }

    /// A cursor with no result behind it; every read fails with `ResultClosed`
    pub fn detached() -> Self {
        Self::new(None, None, ResultKind::Materialized, RowShape::default(), CLOSED)
    }

    fn new(
        engine: Option<Arc<dyn QueryEngine>>,
        handle: Option<NativeResultHandle>,
        kind: ResultKind,
        shape: RowShape,
        state: u8,
    ) -> Self {
        let (closed_tx, _) = watch::channel(state != OPEN);
        Self {
            kind,
            shape,
            engine,
            metadata: ResultMetadata::default(),
            state: AtomicU8::new(state),
            inner: Mutex::new(CursorInner {
                handle,
                buffered: VecDeque::new(),
                exhausted: false,
            }),
            closed_tx,
            rows_fetched: AtomicUsize::new(0),
        }
    }

    /// Materialized or streaming
    pub fn kind(&self) -> ResultKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) != OPEN
    }

    /// Closed because a newer streaming execute took over the session
    pub fn is_superseded(&self) -> bool {
        self.state.load(Ordering::SeqCst) == SUPERSEDED
    }

    /// Rows handed out so far
    pub fn rows_fetched(&self) -> usize {
        self.rows_fetched.load(Ordering::Relaxed)
    }

    fn closed_error(&self) -> DuckletError {
        if self.is_superseded() {
            DuckletError::StreamSuperseded
        } else {
            DuckletError::ResultClosed
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(self.closed_error())
        } else {
            Ok(())
        }
    }

    /// Next row, or `None` once the result is exhausted.
    ///
    /// Keeps returning `None` after the end until the cursor is closed. A close that lands while
    /// the engine is fetching discards the fetched row and fails the call.
    pub fn fetch_row(&self) -> Result<Option<Row>> {
        self.check_open()?;
        let mut inner = self.inner.lock();
        // close may have won while we waited for the lock
        self.check_open()?;

        if let Some(row) = inner.buffered.pop_front() {
            self.rows_fetched.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(row));
        }
        if inner.exhausted {
            return Ok(None);
        }

        let (Some(engine), Some(handle)) = (self.engine.as_ref(), inner.handle.as_ref()) else {
            return Err(DuckletError::ResultClosed);
        };

        match engine.fetch_next(handle) {
            Ok(Some(values)) => {
                self.check_open()?;
                self.rows_fetched.fetch_add(1, Ordering::Relaxed);
                Ok(Some(self.shape_row(values)))
            }
            Ok(None) => {
                inner.exhausted = true;
                Ok(None)
            }
            Err(DuckletError::StreamSuperseded) => {
                if self.transition(SUPERSEDED) {
                    warn!("Streaming result was superseded on its connection");
                    self.release_locked(&mut inner);
                }
                Err(self.closed_error())
            }
            Err(e) => Err(e),
        }
    }

    /// Every remaining row, in cursor order
    pub fn fetch_all(&self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.fetch_row()? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// `(name, type label)` of every column
    pub fn describe(&self) -> Result<Vec<(String, String)>> {
        self.check_open()?;
        Ok(self.metadata.describe())
    }

    pub fn metadata(&self) -> &ResultMetadata {
        &self.metadata
    }

    /// Drain the engine result into memory and release the native handle.
    ///
    /// Reads keep working from the buffer afterwards.
    pub fn materialize(&self) -> Result<()> {
        self.check_open()?;
        let mut inner = self.inner.lock();
        if inner.exhausted {
            return Ok(());
        }
        let (Some(engine), Some(handle)) = (self.engine.as_ref(), inner.handle.as_ref()) else {
            return Err(DuckletError::ResultClosed);
        };

        let mut drained = Vec::new();
        while let Some(values) = engine.fetch_next(handle)? {
            drained.push(self.shape_row(values));
        }
        inner.buffered.extend(drained);
        inner.exhausted = true;
        self.release_locked(&mut inner);
        debug!(rows = inner.buffered.len(), "Result materialized");
        Ok(())
    }

    /// Close the cursor and release its native result. Safe to call any number of times.
    pub fn close(&self) {
        if self.transition(CLOSED) {
            let mut inner = self.inner.lock();
            self.release_locked(&mut inner);
            debug!(
                kind = %self.kind,
                rows = self.rows_fetched(),
                "Cursor closed"
            );
        }
    }

    /// Close on behalf of the session when a newer stream takes the active slot
    pub(crate) fn supersede(&self) -> bool {
        if self.transition(SUPERSEDED) {
            let mut inner = self.inner.lock();
            self.release_locked(&mut inner);
            true
        } else {
            false
        }
    }

    /// Resolves once the cursor is closed, immediately if it already is
    pub fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut closed_rx = self.closed_tx.subscribe();
        async move {
            // A dropped sender means the cursor itself is gone, which also released it
            let _ = closed_rx.wait_for(|closed| *closed).await;
        }
    }

    /// Move out of `OPEN`; only the first caller wins
    fn transition(&self, target: u8) -> bool {
        let won = self
            .state
            .compare_exchange(OPEN, target, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if won {
            self.closed_tx.send_replace(true);
        }
        won
    }

    fn release_locked(&self, inner: &mut CursorInner) {
        if let (Some(engine), Some(handle)) = (self.engine.as_ref(), inner.handle.take()) {
            engine.release_result(&handle);
        }
        if self.is_closed() {
            inner.buffered.clear();
        }
    }

    fn shape_row(&self, values: Vec<NativeValue>) -> Row {
        let values = coerce_row(values, self.shape.bigint_mode);
        self.metadata.shape_row(values, self.shape.format)
    }
}

impl Drop for ResultCursor {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ResultCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCursor")
            .field("kind", &self.kind)
            .field("is_closed", &self.is_closed())
            .field("columns", &self.metadata.len())
            .finish()
    }
}
