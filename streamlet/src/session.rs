//! Bridge session - lifecycle state machine, worker thread, and delivery.
//!
//! Flow:
//! 1. `SessionHandle::create` runs the factory on the caller's context and
//!    allocates both channels (`Created`)
//! 2. The caller registers delivery callbacks on the handle
//! 3. `start` spawns the worker thread and the delivery task (`Running`)
//! 4. Execute return/fault becomes the terminal marker (`Draining`)
//! 5. The delivery task flushes the channel, joins the thread, and fires
//!    exactly one terminal callback (`Terminated`)
//!
//! Callbacks run on the controller's execution context only - the worker
//! thread never calls into controller code. No lock is held across a
//! callback invocation, so a callback may push new messages freely.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::inbound::{self, InboundReceiver, InboundSender, SessionClosed};
use crate::message::{Message, Options};
use crate::outbound::{self, OutboundDrain, OutboundSender, Terminal};
use crate::worker::{Worker, WorkerFactory};

/// Unique identifier for a bridge session, attached to every log line the
/// session emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a bridge session. Transitions are monotonic; no
/// state is ever revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerState {
    Created,
    Running,
    Draining,
    Terminated,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Terminated => "terminated",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Terminated,
        }
    }
}

/// Atomic holder for the session state. Transitions happen on the worker
/// thread at execute-return and on the controller side at teardown; the
/// forward-only `fetch_max` keeps them monotonic whichever lands first.
struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(WorkerState::Created as u8))
    }

    fn get(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn advance(&self, to: WorkerState) -> bool {
        self.0.fetch_max(to as u8, Ordering::AcqRel) < to as u8
    }
}

/// Errors from session creation and startup.
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// The factory (or the worker constructor it runs) faulted. Surfaced
    /// synchronously from `create`; no thread was started.
    #[error("worker factory failed: {0}")]
    Factory(anyhow::Error),

    #[error("failed to spawn worker thread: {0}")]
    Thread(#[from] std::io::Error),

    #[error("session already started")]
    AlreadyStarted,
}

#[derive(Default)]
struct DeliveryHooks {
    on_message: Option<Arc<dyn Fn(Message) + Send + Sync>>,
    on_complete: Option<Box<dyn FnOnce() + Send>>,
    on_error: Option<Box<dyn FnOnce(String) + Send>>,
}

struct SessionShared {
    id: SessionId,
    state: StateCell,
    inbound: InboundSender,
    hooks: Mutex<DeliveryHooks>,
    done: Notify,
}

impl SessionShared {
    fn hooks(&self) -> MutexGuard<'_, DeliveryHooks> {
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Everything `start` needs that `create` cannot hand out earlier.
struct Startup {
    worker: Box<dyn Worker>,
    inbound_rx: InboundReceiver,
    outbound_tx: OutboundSender,
    outbound_rx: OutboundDrain,
}

/// Controller-side handle to one bridge session.
///
/// The canonical call order is `create` → register callbacks → `start`;
/// with that order no message or terminal signal can race registration.
/// Dropping the handle closes the inbound queue, which lets a cooperative
/// worker drain remaining input and wind down.
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    startup: Mutex<Option<Startup>>,
}

impl SessionHandle {
    /// Constructs a session. The factory runs synchronously on the caller's
    /// execution context, so constructor-time faults surface here and no
    /// thread is started for a worker that never existed.
    pub fn create<F: WorkerFactory>(factory: F, options: Options) -> Result<Self, SpawnError> {
        let id = SessionId::new();
        let worker = factory.create(&options).map_err(SpawnError::Factory)?;

        let (inbound_tx, inbound_rx) = inbound::queue();
        let (outbound_tx, outbound_rx) = outbound::channel();

        tracing::debug!(session_id = %id, "session created");

        Ok(Self {
            shared: Arc::new(SessionShared {
                id,
                state: StateCell::new(),
                inbound: inbound_tx,
                hooks: Mutex::new(DeliveryHooks::default()),
                done: Notify::new(),
            }),
            startup: Mutex::new(Some(Startup {
                worker,
                inbound_rx,
                outbound_tx,
                outbound_rx,
            })),
        })
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state.get()
    }

    /// Registers the message callback. Messages drained while no callback
    /// is registered are dropped with a warning, so register before
    /// [`start`](Self::start) to observe every message.
    pub fn on_message(&self, callback: impl Fn(Message) + Send + Sync + 'static) {
        self.shared.hooks().on_message = Some(Arc::new(callback));
    }

    /// Registers the completion callback. Fires at most once, after every
    /// buffered message has been delivered.
    pub fn on_complete(&self, callback: impl FnOnce() + Send + 'static) {
        self.shared.hooks().on_complete = Some(Box::new(callback));
    }

    /// Registers the failure callback. Fires at most once with the failure
    /// reason, after every buffered message has been delivered.
    pub fn on_error(&self, callback: impl FnOnce(String) + Send + 'static) {
        self.shared.hooks().on_error = Some(Box::new(callback));
    }

    /// Spawns the worker thread and the delivery task. Must be called from
    /// within a Tokio runtime; the delivery task is the session's foothold
    /// on the controller's execution context.
    pub fn start(&self) -> Result<(), SpawnError> {
        let startup = self
            .startup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SpawnError::AlreadyStarted)?;

        let Startup {
            mut worker,
            inbound_rx,
            outbound_tx,
            outbound_rx,
        } = startup;

        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name(format!("streamlet-worker-{}", self.shared.id))
            .spawn(move || worker_main(shared, worker.as_mut(), inbound_rx, outbound_tx));

        let thread = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.state.advance(WorkerState::Terminated);
                self.shared.inbound.close();
                return Err(SpawnError::Thread(e));
            }
        };

        self.shared.state.advance(WorkerState::Running);
        tokio::spawn(delivery_loop(
            Arc::clone(&self.shared),
            outbound_rx,
            thread,
        ));

        tracing::info!(session_id = %self.shared.id, "session started");
        Ok(())
    }

    /// Fire-and-forget: appends to the inbound queue without blocking and
    /// returns no acknowledgement of worker-side consumption. Fails once
    /// the session has shut down.
    pub fn push(&self, message: Message) -> Result<(), SessionClosed> {
        self.shared.inbound.push(message)
    }

    /// Signals end-of-input. The worker drains whatever is still queued,
    /// then sees end-of-input on its next pop; a cooperative worker returns
    /// promptly after that. The bridge never terminates the thread by force.
    pub fn close(&self) {
        self.shared.inbound.close();
    }

    /// Resolves once the session reaches `Terminated`: thread joined, all
    /// messages delivered, terminal callback fired. A session that was
    /// never started never terminates.
    pub async fn wait(&self) {
        loop {
            // Register interest before the state check - `notify_waiters`
            // only reaches waiters that are already enabled.
            let mut notified = std::pin::pin!(self.shared.done.notified());
            notified.as_mut().enable();
            if self.shared.state.get().is_terminal() {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.shared.inbound.close();
    }
}

/// Worker-thread entry point. Converts every execute outcome - normal
/// return, error, panic - into the terminal marker; no fault crosses the
/// thread boundary raw.
fn worker_main(
    shared: Arc<SessionShared>,
    worker: &mut dyn Worker,
    inbound: InboundReceiver,
    outbound: OutboundSender,
) {
    tracing::debug!(session_id = %shared.id, "worker thread starting");

    let result = catch_unwind(AssertUnwindSafe(|| worker.execute(&inbound, &outbound)));

    match result {
        Ok(Ok(())) => {
            tracing::debug!(session_id = %shared.id, "worker completed");
            outbound.finish(Terminal::Completed);
        }
        Ok(Err(e)) => {
            tracing::warn!(session_id = %shared.id, error = %e, "worker failed");
            outbound.finish(Terminal::Failed(format!("{e:#}")));
        }
        Err(payload) => {
            let reason = panic_reason(payload.as_ref());
            tracing::error!(session_id = %shared.id, %reason, "worker panicked");
            outbound.finish(Terminal::Failed(reason));
        }
    }

    shared.state.advance(WorkerState::Draining);
}

fn panic_reason(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("worker panicked: {s}")
    } else {
        "worker panicked".to_string()
    }
}

/// Delivery task - the only place outbound traffic crosses onto the
/// controller's execution context. Dispatches drained messages in send
/// order, then tears the session down once the terminal marker arrives.
async fn delivery_loop(
    shared: Arc<SessionShared>,
    outbound: OutboundDrain,
    thread: thread::JoinHandle<()>,
) {
    let terminal = loop {
        // Arm the wake future before draining so a send that lands between
        // the two is never missed.
        let wake = outbound.notified();
        let batch = outbound.drain();

        if batch.is_empty() {
            wake.await;
            continue;
        }

        for message in batch.messages {
            deliver_message(&shared, message);
        }

        if let Some(terminal) = batch.terminal {
            break terminal;
        }
    };

    // The drain that carried the terminal marker was the final flush:
    // sends are rejected from the instant the marker is set.
    shared.state.advance(WorkerState::Draining);

    // Unblock a pop the worker may still be sitting in (e.g. it signaled
    // completion explicitly and went back to waiting), then join.
    shared.inbound.close();
    match tokio::task::spawn_blocking(move || thread.join()).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            tracing::error!(session_id = %shared.id, "worker thread panicked outside execute")
        }
        Err(e) => tracing::error!(session_id = %shared.id, error = %e, "worker thread join failed"),
    }

    deliver_terminal(&shared, terminal);

    shared.state.advance(WorkerState::Terminated);
    shared.done.notify_waiters();
    tracing::debug!(session_id = %shared.id, "session terminated");
}

fn deliver_message(shared: &SessionShared, message: Message) {
    let callback = shared.hooks().on_message.clone();
    match callback {
        Some(callback) => callback(message),
        None => tracing::warn!(
            session_id = %shared.id,
            name = message.name(),
            "message dropped: no message callback registered"
        ),
    }
}

fn deliver_terminal(shared: &SessionShared, terminal: Terminal) {
    match terminal {
        Terminal::Completed => {
            tracing::info!(session_id = %shared.id, "session completed");
            let callback = shared.hooks().on_complete.take();
            if let Some(callback) = callback {
                callback();
            }
        }
        Terminal::Failed(reason) => {
            tracing::info!(session_id = %shared.id, error = %reason, "session failed");
            let callback = shared.hooks().on_error.take();
            match callback {
                Some(callback) => callback(reason),
                None => tracing::warn!(
                    session_id = %shared.id,
                    %reason,
                    "session failed with no error callback registered"
                ),
            }
        }
    }
}
