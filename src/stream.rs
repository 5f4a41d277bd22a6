//! Write-coalescing stream over an atomic batch sink.
//!
//! Producers issue one [`WriteItem`] at a time; the stream accumulates them
//! in a pending buffer and periodically drains the whole buffer into a
//! single [`BatchSink::commit`] call.
//!
//! ```text
//! write ──► pending buffer ──► deferred flush ──► sink.commit(batch)
//!               ▲                                      │
//!               └── writes during a commit land ◄──────┘ settle: re-arm if
//!                   in a fresh buffer                    non-empty, wake
//!                                                        parked waiters
//! ```
//!
//! ## Scheduling
//!
//! The first append into an empty buffer arms a deferred flush. The driver
//! task only runs once the producer yields, so a burst of back-to-back
//! writes lands in one commit. At most one commit is in flight at any
//! time; writes that arrive while one is outstanding accumulate in a fresh
//! buffer and are picked up by the same driver when the commit settles.
//!
//! ## Backpressure
//!
//! With a bounded buffer, a write that finds the buffer full parks on a
//! one-shot waiter and retries after the in-flight flush settles. Waiters
//! are woken in arrival order.
//!
//! ## Termination
//!
//! [`WriteStream::end`] drains the stream to empty before reporting it
//! closed; [`WriteStream::destroy`] discards buffered data immediately.
//! Either way the stream settles exactly one terminal outcome, observable
//! through [`WriteStream::closed`]: an erroring outcome is always observed
//! as the error, never as a clean close.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::buffer::PendingBuffer;
use crate::config::StreamConfig;
use crate::sink::{BatchSink, SinkError};
use crate::types::{BatchOp, OperationKind, WriteItem};

/// Error type for stream operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// An item failed validation at the point of writing. Fatal to the
    /// stream; a batch already submitted to the sink still completes.
    InvalidItem(String),
    /// The sink failed a commit. Always fatal to the stream.
    Commit(SinkError),
    /// The stream was destroyed, optionally with a caller-supplied reason.
    Cancelled(Option<String>),
    /// The stream no longer accepts this operation (ended or destroyed).
    Closed,
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::InvalidItem(msg) => write!(f, "invalid write item: {}", msg),
            StreamError::Commit(e) => write!(f, "batch commit failed: {}", e),
            StreamError::Cancelled(Some(reason)) => {
                write!(f, "stream destroyed: {}", reason)
            }
            StreamError::Cancelled(None) => write!(f, "stream destroyed"),
            StreamError::Closed => write!(f, "stream is closed"),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<SinkError> for StreamError {
    fn from(e: SinkError) -> Self {
        StreamError::Commit(e)
    }
}

// ============================================================================
// State
// ============================================================================

/// Flush scheduler state. `Armed` means a deferred flush will fire at the
/// driver's next turn; `InFlight` means a commit is outstanding at the
/// sink. While the state is not `Idle`, exactly one driver task exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushState {
    Idle,
    Armed,
    InFlight,
}

/// Stream lifecycle. `Draining` is entered by `end` and holds until the
/// buffer is empty and no flush is outstanding. `Closed` and `Destroyed`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Draining,
    Closed,
    Destroyed,
}

type Waiter = oneshot::Sender<Result<(), StreamError>>;

struct StreamState {
    buffer: PendingBuffer,
    flush: FlushState,
    lifecycle: Lifecycle,
    /// Terminal outcome, set exactly once.
    terminal: Option<Result<(), StreamError>>,
    /// Parked writers and the finalize loop, resolved in registration order
    /// whenever a flush settles.
    flush_waiters: Vec<Waiter>,
    /// Observers of the terminal notification.
    close_waiters: Vec<Waiter>,
}

struct Shared<S> {
    sink: S,
    config: StreamConfig,
    state: Mutex<StreamState>,
}

// ============================================================================
// WriteStream
// ============================================================================

/// Coalescing write handle over a [`BatchSink`].
///
/// Cheap to clone; all clones share one buffer and scheduler. The stream is
/// designed for a single producer issuing an ordered sequence of writes;
/// operations are committed in strict arrival order.
pub struct WriteStream<S: BatchSink> {
    shared: Arc<Shared<S>>,
}

impl<S: BatchSink> Clone for WriteStream<S> {
    fn clone(&self) -> Self {
        WriteStream {
            shared: self.shared.clone(),
        }
    }
}

impl<S: BatchSink> WriteStream<S> {
    /// Create a stream writing into `sink`.
    pub fn new(sink: S, config: StreamConfig) -> Self {
        WriteStream {
            shared: Arc::new(Shared {
                sink,
                config,
                state: Mutex::new(StreamState {
                    buffer: PendingBuffer::new(),
                    flush: FlushState::Idle,
                    lifecycle: Lifecycle::Open,
                    terminal: None,
                    flush_waiters: Vec::new(),
                    close_waiters: Vec::new(),
                }),
            }),
        }
    }

    /// Accept one write.
    ///
    /// Resolves once the item has been admitted to the pending buffer,
    /// which is before it is committed. With a bounded buffer the call
    /// suspends while the buffer is full and resumes after the in-flight
    /// flush settles. Fails fast on an invalid item (fatal to the stream)
    /// and with [`StreamError::Closed`] once `end` or `destroy` has been
    /// called.
    pub async fn write(&self, item: WriteItem) -> Result<(), StreamError> {
        if !self.is_writable() {
            return Err(StreamError::Closed);
        }

        let op = match resolve(&self.shared.config, item) {
            Ok(op) => op,
            Err(e) => {
                terminate(&self.shared, Err(e.clone()), e.clone());
                return Err(e);
            }
        };

        let mut op = Some(op);
        loop {
            let mut armed = false;
            let parked = {
                let mut state = self.shared.state.lock();
                if state.lifecycle != Lifecycle::Open {
                    return Err(StreamError::Closed);
                }

                let full = match self.shared.config.effective_bound() {
                    Some(max) => state.buffer.len() >= max,
                    None => false,
                };

                if full {
                    let (tx, rx) = oneshot::channel();
                    state.flush_waiters.push(tx);
                    Some(rx)
                } else {
                    state
                        .buffer
                        .append(op.take().expect("write op admitted once"));
                    if state.flush == FlushState::Idle {
                        state.flush = FlushState::Armed;
                        armed = true;
                    }
                    None
                }
            };

            if armed {
                debug!("armed deferred flush");
                tokio::spawn(drive_flushes(self.shared.clone()));
            }

            match parked {
                None => return Ok(()),
                Some(rx) => match rx.await {
                    // Flush settled and freed capacity; retry the append.
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Err(StreamError::Closed),
                },
            }
        }
    }

    /// Signal end of input and drain the stream.
    ///
    /// Resolves once every previously accepted item has been handed to the
    /// sink in some committed batch and no flush is outstanding, then
    /// reports the stream closed. Fails if a flush it waits on fails.
    pub async fn end(&self) -> Result<(), StreamError> {
        self.finish(None).await
    }

    /// Write one final item, then drain as [`WriteStream::end`] does.
    pub async fn end_with(&self, item: WriteItem) -> Result<(), StreamError> {
        self.finish(Some(item)).await
    }

    async fn finish(&self, last: Option<WriteItem>) -> Result<(), StreamError> {
        if let Some(item) = last {
            self.write(item).await?;
        }

        {
            let mut state = self.shared.state.lock();
            match state.lifecycle {
                Lifecycle::Open => state.lifecycle = Lifecycle::Draining,
                _ => return Err(StreamError::Closed),
            }
        }

        // Drain loop: new data may race with a flush that was already in
        // flight when the drain started, so recheck after every settle.
        loop {
            let parked = {
                let mut state = self.shared.state.lock();
                if state.lifecycle == Lifecycle::Destroyed {
                    return Err(match &state.terminal {
                        Some(Err(e)) => e.clone(),
                        _ => StreamError::Closed,
                    });
                }

                if state.flush != FlushState::Idle {
                    let (tx, rx) = oneshot::channel();
                    state.flush_waiters.push(tx);
                    Some(rx)
                } else {
                    // An idle scheduler implies an empty buffer; done.
                    state.lifecycle = Lifecycle::Closed;
                    state.terminal = Some(Ok(()));
                    let observers = std::mem::take(&mut state.close_waiters);
                    drop(state);
                    for tx in observers {
                        let _ = tx.send(Ok(()));
                    }
                    debug!("stream closed");
                    None
                }
            };

            match parked {
                None => return Ok(()),
                Some(rx) => match rx.await {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Err(StreamError::Closed),
                },
            }
        }
    }

    /// Cancel the stream immediately, discarding unflushed data.
    ///
    /// An in-flight commit is not interrupted; its outcome is ignored once
    /// the stream is destroyed. Discarded data is an accepted consequence
    /// of explicit cancellation, so the terminal outcome is a clean close.
    pub fn destroy(&self) {
        terminate(&self.shared, Ok(()), StreamError::Cancelled(None));
    }

    /// Cancel the stream immediately, surfacing `reason` as the stream
    /// error ahead of the close notification.
    pub fn destroy_with(&self, reason: impl Into<String>) {
        let err = StreamError::Cancelled(Some(reason.into()));
        terminate(&self.shared, Err(err.clone()), err);
    }

    /// Terminal notification.
    ///
    /// Resolves once the stream reaches its terminal state: `Ok` for a
    /// clean close, `Err` when a validation failure, commit failure, or
    /// erroring destroy preceded it. Every caller observes the same
    /// outcome; it is settled exactly once per stream.
    pub async fn closed(&self) -> Result<(), StreamError> {
        let rx = {
            let mut state = self.shared.state.lock();
            if let Some(outcome) = &state.terminal {
                return outcome.clone();
            }
            let (tx, rx) = oneshot::channel();
            state.close_waiters.push(tx);
            rx
        };
        rx.await.unwrap_or(Err(StreamError::Closed))
    }

    /// Whether the stream still accepts writes.
    pub fn is_writable(&self) -> bool {
        self.shared.state.lock().lifecycle == Lifecycle::Open
    }

    /// Number of operations buffered and not yet handed to the sink.
    pub fn buffered_len(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }
}

// ============================================================================
// Internals
// ============================================================================

/// Resolve a producer item against the stream default. The item's own kind
/// wins; a put must carry a value; a value supplied with a delete is
/// dropped.
fn resolve(config: &StreamConfig, item: WriteItem) -> Result<BatchOp, StreamError> {
    let kind = item.kind.unwrap_or(config.default_kind);
    match kind {
        OperationKind::Put => match item.value {
            Some(value) => Ok(BatchOp {
                kind,
                key: item.key,
                value: Some(value),
            }),
            None => Err(StreamError::InvalidItem(
                "a put operation requires a value".to_string(),
            )),
        },
        OperationKind::Delete => Ok(BatchOp {
            kind,
            key: item.key,
            value: None,
        }),
    }
}

/// Single driver task behind the deferred-flush discipline.
///
/// Spawned when the scheduler arms from `Idle`; drains and commits until
/// the buffer stays empty across a settle, then exits. Exactly one driver
/// runs while the scheduler is not `Idle`, which is what bounds the sink
/// to one outstanding commit.
async fn drive_flushes<S: BatchSink>(shared: Arc<Shared<S>>) {
    loop {
        let ops = {
            let mut state = shared.state.lock();
            if state.lifecycle == Lifecycle::Destroyed {
                return;
            }
            state.flush = FlushState::InFlight;
            state.buffer.drain()
        };

        if ops.is_empty() {
            // Nothing to submit; still settle, and keep driving if a write
            // slipped in between the drain and the settle.
            if settle(&shared) {
                tokio::task::yield_now().await;
                continue;
            }
            return;
        }

        debug!("submitting batch of {} operations", ops.len());
        match shared.sink.commit(ops).await {
            Ok(()) => {
                if settle(&shared) {
                    // More data arrived while the commit was outstanding;
                    // yield once so a racing burst keeps coalescing.
                    tokio::task::yield_now().await;
                    continue;
                }
                return;
            }
            Err(e) => {
                error!("batch commit failed: {}", e);
                let err = StreamError::Commit(e);
                terminate(&shared, Err(err.clone()), err);
                return;
            }
        }
    }
}

/// Handle a settled flush: wake parked waiters and decide whether the
/// driver re-arms. Returns true when writes arrived during the commit and
/// another cycle is needed.
fn settle<S>(shared: &Shared<S>) -> bool {
    let (waiters, rearm) = {
        let mut state = shared.state.lock();
        if state.lifecycle == Lifecycle::Destroyed {
            // Destroyed while the commit was outstanding: the outcome is
            // dropped and any parked waiters were already failed.
            return false;
        }
        let rearm = !state.buffer.is_empty();
        state.flush = if rearm {
            FlushState::Armed
        } else {
            FlushState::Idle
        };
        (std::mem::take(&mut state.flush_waiters), rearm)
    };
    for tx in waiters {
        let _ = tx.send(Ok(()));
    }
    rearm
}

/// Settle the stream's terminal outcome: mark it destroyed, discard the
/// pending buffer, fail parked waiters with `waiter_err` and notify close
/// observers with `outcome`. No-op when a terminal outcome is already set.
fn terminate<S>(
    shared: &Shared<S>,
    outcome: Result<(), StreamError>,
    waiter_err: StreamError,
) {
    let (flush_waiters, close_waiters) = {
        let mut state = shared.state.lock();
        if state.terminal.is_some() {
            return;
        }
        state.lifecycle = Lifecycle::Destroyed;
        state.terminal = Some(outcome.clone());
        let discarded = state.buffer.drain();
        if !discarded.is_empty() {
            debug!("discarding {} unflushed operations", discarded.len());
        }
        (
            std::mem::take(&mut state.flush_waiters),
            std::mem::take(&mut state.close_waiters),
        )
    };
    for tx in flush_waiters {
        let _ = tx.send(Err(waiter_err.clone()));
    }
    for tx in close_waiters {
        let _ = tx.send(outcome.clone());
    }
}

// ============================================================================
// Tests
// ============================================================================
