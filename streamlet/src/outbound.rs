//! Worker-to-controller buffered channel with a one-shot terminal marker.
//!
//! The worker thread must never call into controller code directly, so
//! `send` only buffers. The delivery task on the controller's execution
//! context is woken through a [`Notify`] and pulls everything out with
//! [`OutboundDrain::drain`] - the single crossing point between the two
//! threads. Because `send` and terminal-setting serialize on one lock, the
//! drain that observes the terminal marker has already flushed every
//! message that preceded it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::sync::futures::Notified;

use crate::message::Message;

/// How a session ended. Set exactly once, always the last thing drained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Completed,
    Failed(String),
}

/// Error returned by [`OutboundSender::send`] once the terminal marker is
/// set. A worker may ignore it or use it to stop producing early.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("outbound channel closed: terminal marker already set")]
pub struct ChannelClosed;

struct Inner {
    items: VecDeque<Message>,
    terminal: Option<Terminal>,
}

struct Shared {
    inner: Mutex<Inner>,
    wake: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Creates the outbound channel, returning the worker and controller halves.
pub fn channel() -> (OutboundSender, OutboundDrain) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            items: VecDeque::new(),
            terminal: None,
        }),
        wake: Notify::new(),
    });
    (
        OutboundSender {
            shared: Arc::clone(&shared),
        },
        OutboundDrain { shared },
    )
}

/// Worker half: buffers messages and sets the terminal marker.
#[derive(Clone)]
pub struct OutboundSender {
    shared: Arc<Shared>,
}

impl OutboundSender {
    /// Queues a message for in-order delivery on the controller side.
    /// Rejected once a terminal marker exists.
    pub fn send(&self, message: Message) -> Result<(), ChannelClosed> {
        let mut inner = self.shared.lock();
        if inner.terminal.is_some() {
            drop(inner);
            tracing::warn!(
                name = message.name(),
                "message sent after terminal marker, dropping"
            );
            return Err(ChannelClosed);
        }
        inner.items.push_back(message);
        drop(inner);
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Marks the stream complete. The first terminal marker wins; a second
    /// explicit signal indicates a worker bug and is logged, not honored.
    pub fn complete(&self) {
        if !self.try_set_terminal(Terminal::Completed) {
            tracing::warn!("complete() called after terminal marker already set");
        }
    }

    /// Marks the stream failed with a reason. First terminal marker wins.
    pub fn fail(&self, reason: impl Into<String>) {
        if !self.try_set_terminal(Terminal::Failed(reason.into())) {
            tracing::warn!("fail() called after terminal marker already set");
        }
    }

    /// Automatic terminal signal at execute-return. Silent when the worker
    /// already signaled explicitly.
    pub(crate) fn finish(&self, terminal: Terminal) {
        self.try_set_terminal(terminal);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().terminal.is_some()
    }

    fn try_set_terminal(&self, terminal: Terminal) -> bool {
        let mut inner = self.shared.lock();
        if inner.terminal.is_some() {
            return false;
        }
        inner.terminal = Some(terminal);
        drop(inner);
        self.shared.wake.notify_one();
        true
    }
}

/// Everything accumulated in the channel since the last drain.
pub(crate) struct Drained {
    pub(crate) messages: Vec<Message>,
    pub(crate) terminal: Option<Terminal>,
}

impl Drained {
    pub(crate) fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.terminal.is_none()
    }
}

/// Controller half: drains buffered messages at delivery checkpoints.
pub(crate) struct OutboundDrain {
    shared: Arc<Shared>,
}

impl OutboundDrain {
    /// Removes and returns all buffered messages, in send order, plus the
    /// terminal marker if one has been set.
    pub(crate) fn drain(&self) -> Drained {
        let mut inner = self.shared.lock();
        Drained {
            messages: inner.items.drain(..).collect(),
            terminal: inner.terminal.clone(),
        }
    }

    /// Wake future for the delivery task. Arm this before draining so a
    /// send landing between drain and await is not missed.
    pub(crate) fn notified(&self) -> Notified<'_> {
        self.shared.wake.notified()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_preserves_send_order() {
        let (tx, rx) = channel();
        tx.send(Message::new("n", "1")).unwrap();
        tx.send(Message::new("n", "2")).unwrap();
        tx.send(Message::new("n", "3")).unwrap();

        let drained = rx.drain();
        let data: Vec<&str> = drained.messages.iter().map(|m| m.data()).collect();
        assert_eq!(data, ["1", "2", "3"]);
        assert!(drained.terminal.is_none());
    }

    #[test]
    fn drain_removes_buffered_items() {
        let (tx, rx) = channel();
        tx.send(Message::new("n", "1")).unwrap();

        assert_eq!(rx.drain().messages.len(), 1);
        assert!(rx.drain().is_empty());
    }

    #[test]
    fn send_after_terminal_is_rejected() {
        let (tx, rx) = channel();
        tx.send(Message::new("n", "1")).unwrap();
        tx.complete();

        assert_eq!(tx.send(Message::new("n", "2")), Err(ChannelClosed));
        assert!(tx.is_closed());

        let drained = rx.drain();
        assert_eq!(drained.messages.len(), 1);
        assert_eq!(drained.terminal, Some(Terminal::Completed));

        // The rejected message must not surface in a later drain either.
        assert!(rx.drain().messages.is_empty());
    }

    #[test]
    fn first_terminal_marker_wins() {
        let (tx, rx) = channel();
        tx.complete();
        tx.fail("too late");

        assert_eq!(rx.drain().terminal, Some(Terminal::Completed));
    }

    #[test]
    fn failure_reason_is_preserved() {
        let (tx, rx) = channel();
        tx.fail("sensor went dark");

        assert_eq!(
            rx.drain().terminal,
            Some(Terminal::Failed("sensor went dark".to_string()))
        );
    }

    #[tokio::test]
    async fn send_wakes_an_armed_waiter() {
        let (tx, rx) = channel();
        let wake = rx.notified();
        tx.send(Message::new("n", "1")).unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(1), wake)
            .await
            .expect("send did not wake the drain task");
        assert_eq!(rx.drain().messages.len(), 1);
    }
}
