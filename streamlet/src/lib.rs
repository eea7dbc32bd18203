//! streamlet: a streaming message bridge between an event loop and a
//! dedicated worker thread.
//!
//! A session runs a user-supplied [`Worker`] on its own thread, feeds it
//! messages through a blocking FIFO, and marshals the worker's output back
//! onto the controller's Tokio context, where registered callbacks receive
//! every message in send order followed by exactly one terminal signal.

mod inbound;
mod message;
mod outbound;
mod session;
mod worker;

pub use inbound::{InboundReceiver, SessionClosed};
pub use message::{Message, Options};
pub use outbound::{ChannelClosed, OutboundSender};
pub use session::{SessionHandle, SessionId, SpawnError, WorkerState};
pub use worker::{Worker, WorkerFactory};
