//! Backpressured push delivery over a result cursor
//!
//! A blocking pump task pulls rows from the cursor into a bounded channel whose capacity is the
//! stream's high watermark, so the engine is never read further ahead of the consumer than that.
//!
//! Event order seen by a consumer:
//! - rows in cursor order, then end of stream (`None`)
//! - or rows, then exactly one `Err`, then end of stream
//!
//! The cursor is closed whenever the stream ends, fails, is cancelled or dropped, and
//! [`RowStream::closed`] resolves after that release.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use ducklet_common::{DuckletError, Result};
use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::cursor::ResultCursor;
use crate::engine::ResultKind;
use crate::metadata::Row;

/// Cancellation flag shared with the pump
struct CancellationToken {
    cancelled: AtomicBool,
}

impl CancellationToken {
    fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Push-based row stream over one cursor
pub struct RowStream {
    cursor: Arc<ResultCursor>,
    rows: ReceiverStream<Result<Row>>,
    cancel_token: Arc<CancellationToken>,
    finished: bool,
    rows_delivered: usize,
}

impl RowStream {
    /// Start pumping `cursor` with at most `high_water_mark` rows buffered ahead.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(cursor: Arc<ResultCursor>, high_water_mark: usize) -> Self {
        let (tx, rx) = mpsc::channel(high_water_mark.max(1));
        let cancel_token = Arc::new(CancellationToken::new());

        let pump_cursor = cursor.clone();
        let pump_token = cancel_token.clone();
        tokio::task::spawn_blocking(move || pump(pump_cursor, tx, pump_token));

        Self {
            cursor,
            rows: ReceiverStream::new(rx),
            cancel_token,
            finished: false,
            rows_delivered: 0,
        }
    }

    pub fn kind(&self) -> ResultKind {
        self.cursor.kind()
    }

    /// `(name, type label)` of every column
    pub fn describe(&self) -> Vec<(String, String)> {
        self.cursor.metadata().describe()
    }

    /// Rows handed to the consumer so far
    pub fn rows_delivered(&self) -> usize {
        self.rows_delivered
    }

    /// Underlying cursor has been released
    pub fn is_closed(&self) -> bool {
        self.cursor.is_closed()
    }

    /// Resolves once the underlying cursor is released
    pub fn closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        self.cursor.closed()
    }

    /// Abandon the stream without blocking.
    ///
    /// The pump stops after its current fetch and releases the cursor on its way out;
    /// [`RowStream::closed`] resolves then.
    pub fn cancel(&mut self) {
        if !self.cancel_token.is_cancelled() {
            debug!(rows = self.rows_delivered, "Row stream cancelled");
        }
        self.finish();
    }

    fn finish(&mut self) {
        self.finished = true;
        self.cancel_token.cancel();
        self.rows.close();
    }
}

impl Stream for RowStream {
    type Item = Result<Row>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        // Supersession wins over rows still buffered in the channel
        if self.cursor.is_superseded() {
            self.finish();
            return Poll::Ready(Some(Err(DuckletError::StreamSuperseded)));
        }

        match Pin::new(&mut self.rows).poll_next(cx) {
            Poll::Ready(Some(Ok(row))) => {
                self.rows_delivered += 1;
                Poll::Ready(Some(Ok(row)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for RowStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowStream")
            .field("kind", &self.kind())
            .field("rows_delivered", &self.rows_delivered())
            .field("is_closed", &self.is_closed())
            .finish()
    }
}

impl Drop for RowStream {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel();
        }
    }
}

/// Pull rows until the end, an error, cancellation or the consumer going away; then close
fn pump(
    cursor: Arc<ResultCursor>,
    tx: mpsc::Sender<Result<Row>>,
    cancel_token: Arc<CancellationToken>,
) {
    let mut pulled = 0usize;
    loop {
        if cancel_token.is_cancelled() {
            debug!(pulled, "Pump stopped by cancellation");
            break;
        }
        match cursor.fetch_row() {
            Ok(Some(row)) => {
                pulled += 1;
                // Blocks while the channel is at its high watermark
                if tx.blocking_send(Ok(row)).is_err() {
                    debug!(pulled, "Row stream consumer went away");
                    break;
                }
            }
            Ok(None) => {
                debug!(pulled, "Row stream reached end of result");
                break;
            }
            Err(e) => {
                if !cancel_token.is_cancelled() {
                    warn!(error = %e, code = e.code(), pulled, "Row stream failed");
                    let _ = tx.blocking_send(Err(e));
                }
                break;
            }
        }
    }
    cursor.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::RowShape;
    use crate::engine::testing::ScriptedEngine;
    use crate::engine::QueryEngine;
    use futures::StreamExt;
    use std::time::Duration;

    fn streaming_cursor(engine: &Arc<ScriptedEngine>) -> Arc<ResultCursor> {
        let dyn_engine: Arc<dyn QueryEngine> = engine.clone();
        let handle = dyn_engine
            .execute_statement("SELECT", ResultKind::Streaming)
            .unwrap();
        Arc::new(
            ResultCursor::attach(dyn_engine, handle, ResultKind::Streaming, RowShape::default())
                .unwrap(),
        )
    }

    async fn wait_closed(stream: &RowStream) {
        tokio::time::timeout(Duration::from_secs(5), stream.closed())
            .await
            .expect("cursor was not released");
    }

    #[tokio::test]
    async fn test_rows_then_end() {
        let engine = Arc::new(ScriptedEngine::with_rows(100));
        let mut stream = RowStream::new(streaming_cursor(&engine), 8);

        let mut ids = Vec::new();
        while let Some(row) = stream.next().await {
            ids.push(row.unwrap().get(0).and_then(|v| v.as_f64()).unwrap());
        }

        assert_eq!(ids, (0..100).map(f64::from).collect::<Vec<_>>());
        assert_eq!(stream.rows_delivered(), 100);
        assert!(stream.next().await.is_none());
        wait_closed(&stream).await;
        assert_eq!(engine.releases(), 1);
    }

    #[tokio::test]
    async fn test_error_then_close() {
        let engine = Arc::new(ScriptedEngine::with_rows(10).failing_at(3));
        let mut stream = RowStream::new(streaming_cursor(&engine), 4);
        let closed = stream.closed();

        let mut rows = 0;
        let mut errors = Vec::new();
        while let Some(item) = stream.next().await {
            match item {
                Ok(_) => rows += 1,
                Err(e) => errors.push(e),
            }
        }

        assert_eq!(rows, 3);
        assert_eq!(errors, vec![DuckletError::engine("IO Error: scripted failure")]);
        tokio::time::timeout(Duration::from_secs(5), closed)
            .await
            .unwrap();
        assert_eq!(engine.releases(), 1);
    }

    #[tokio::test]
    async fn test_pump_respects_high_water_mark() {
        let engine = Arc::new(ScriptedEngine::with_rows(1_000));
        let mut stream = RowStream::new(streaming_cursor(&engine), 4);

        assert!(stream.next().await.unwrap().is_ok());
        tokio::time::sleep(Duration::from_millis(100)).await;

        // channel capacity, the row delivered, plus one row held by the blocked pump
        assert!(engine.fetches() <= 4 + 1 + 1, "pulled {}", engine.fetches());
        stream.cancel();
    }

    #[tokio::test]
    async fn test_drop_cancels_and_releases() {
        let engine = Arc::new(ScriptedEngine::with_rows(1_000));
        let stream = RowStream::new(streaming_cursor(&engine), 2);
        let closed = stream.closed();
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(stream);
        tokio::time::timeout(Duration::from_secs(5), closed)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fetched = engine.fetches();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.fetches(), fetched);
        assert!(fetched < 1_000);
        assert_eq!(engine.releases(), 1);
    }

    #[tokio::test]
    async fn test_drop_does_not_wait_for_engine_fetch() {
        let engine = Arc::new(
            ScriptedEngine::with_rows(10).with_fetch_delay(Duration::from_millis(300)),
        );
        let stream = RowStream::new(streaming_cursor(&engine), 4);
        let closed = stream.closed();
        // let the pump enter a slow fetch
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        drop(stream);
        assert!(started.elapsed() < Duration::from_millis(150));

        tokio::time::timeout(Duration::from_secs(5), closed)
            .await
            .unwrap();
        assert_eq!(engine.releases(), 1);
        assert!(engine.fetches() <= 2, "pulled {}", engine.fetches());
    }

    #[tokio::test]
    async fn test_superseded_with_buffered_rows() {
        let engine = Arc::new(ScriptedEngine::with_rows(50));
        let cursor = streaming_cursor(&engine);
        let mut stream = RowStream::new(cursor.clone(), 16);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cursor.supersede());

        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err, DuckletError::StreamSuperseded);
        assert!(stream.next().await.is_none());
        wait_closed(&stream).await;
        assert_eq!(engine.releases(), 1);
    }
}
