//! Controller-to-worker FIFO with a blocking pop.
//!
//! The queue is split into a sender half held by the session and a receiver
//! half that moves onto the worker thread. That split is the whole
//! cross-thread contract: the controller can only produce, the worker can
//! only consume, and nothing else is shared.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::message::Message;

/// Error returned by [`InboundSender::push`] once the queue is closed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("session closed: inbound queue no longer accepts messages")]
pub struct SessionClosed;

struct Inner {
    items: VecDeque<Message>,
    closed: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    available: Condvar,
}

impl Shared {
    /// Locks the queue state, recovering from poison. The critical sections
    /// here run no user code, so a poisoned lock still holds consistent data.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Creates the inbound queue, returning the controller and worker halves.
pub fn queue() -> (InboundSender, InboundReceiver) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            items: VecDeque::new(),
            closed: false,
        }),
        available: Condvar::new(),
    });
    (
        InboundSender {
            shared: Arc::clone(&shared),
        },
        InboundReceiver { shared },
    )
}

/// Controller half: appends messages and signals end-of-input.
#[derive(Clone)]
pub struct InboundSender {
    shared: Arc<Shared>,
}

impl InboundSender {
    /// Appends a message to the tail. Never blocks; wakes one waiting pop.
    pub fn push(&self, message: Message) -> Result<(), SessionClosed> {
        let mut inner = self.shared.lock();
        if inner.closed {
            return Err(SessionClosed);
        }
        inner.items.push_back(message);
        drop(inner);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Closes the queue. Idempotent. Pending items remain poppable; a pop
    /// blocked on an empty queue unblocks with end-of-input.
    pub fn close(&self) {
        let mut inner = self.shared.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        drop(inner);
        self.shared.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

/// Worker half: consumes messages in push order.
///
/// There is exactly one receiver per queue; it moves onto the worker thread
/// and is not clonable, so no message can be popped twice.
pub struct InboundReceiver {
    shared: Arc<Shared>,
}

impl InboundReceiver {
    /// Blocks the calling thread until a message is available. Returns
    /// `None` once the queue is closed and drained - the end-of-input
    /// signal a cooperative worker uses to wind down.
    pub fn pop(&self) -> Option<Message> {
        let mut inner = self.shared.lock();
        loop {
            if let Some(message) = inner.items.pop_front() {
                return Some(message);
            }
            if inner.closed {
                return None;
            }
            inner = self
                .shared
                .available
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Non-blocking pop for workers that interleave production with input
    /// checks. `None` means "nothing pending right now", not end-of-input;
    /// use [`pop`](Self::pop) or [`is_closed`](Self::is_closed) for that.
    pub fn try_pop(&self) -> Option<Message> {
        self.shared.lock().items.pop_front()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn pop_returns_messages_in_push_order() {
        let (tx, rx) = queue();
        tx.push(Message::new("n", "1")).unwrap();
        tx.push(Message::new("n", "2")).unwrap();
        tx.push(Message::new("n", "3")).unwrap();

        assert_eq!(rx.pop().unwrap().data(), "1");
        assert_eq!(rx.pop().unwrap().data(), "2");
        assert_eq!(rx.pop().unwrap().data(), "3");
    }

    #[test]
    fn pop_blocks_until_push() {
        let (tx, rx) = queue();
        let (result_tx, result_rx) = std::sync::mpsc::channel();

        let popper = thread::spawn(move || {
            result_tx.send(rx.pop()).unwrap();
        });

        // Nothing should arrive while the queue is empty and open.
        assert!(
            result_rx
                .recv_timeout(Duration::from_millis(50))
                .is_err()
        );

        tx.push(Message::new("wake", "up")).unwrap();
        let popped = result_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("pop did not unblock after push");
        assert_eq!(popped.unwrap().name(), "wake");
        popper.join().unwrap();
    }

    #[test]
    fn close_unblocks_pending_pop_with_end_of_input() {
        let (tx, rx) = queue();
        let popper = thread::spawn(move || rx.pop());

        thread::sleep(Duration::from_millis(50));
        tx.close();

        assert_eq!(popper.join().unwrap(), None);
    }

    #[test]
    fn close_drains_pending_items_before_end_of_input() {
        let (tx, rx) = queue();
        tx.push(Message::new("n", "1")).unwrap();
        tx.push(Message::new("n", "2")).unwrap();
        tx.close();

        assert_eq!(rx.pop().unwrap().data(), "1");
        assert_eq!(rx.pop().unwrap().data(), "2");
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn push_after_close_is_rejected() {
        let (tx, rx) = queue();
        assert!(!tx.is_closed());
        tx.close();
        tx.close(); // idempotent

        assert!(tx.is_closed());
        assert_eq!(tx.push(Message::new("n", "1")), Err(SessionClosed));
        assert_eq!(rx.pop(), None);
    }

    #[test]
    fn try_pop_does_not_block() {
        let (tx, rx) = queue();
        assert_eq!(rx.try_pop(), None);

        tx.push(Message::new("n", "1")).unwrap();
        assert_eq!(rx.try_pop().unwrap().data(), "1");
        assert_eq!(rx.try_pop(), None);
        assert!(!rx.is_closed());
    }
}
