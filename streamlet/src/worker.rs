//! Worker contract - the user-supplied computation a session runs.

use crate::inbound::InboundReceiver;
use crate::message::Options;
use crate::outbound::OutboundSender;

/// A long-running computation driven by a bridge session.
///
/// [`execute`](Worker::execute) is invoked exactly once, entirely on a
/// dedicated thread. It is free to block in `inbound.pop()`, to send any
/// number of messages, and to interleave the two in any pattern - pure
/// producer, pure consumer, or request/response.
///
/// Returning `Ok(())` completes the session (the bridge signals completion
/// if the worker has not already); returning an error or panicking fails it
/// with the formatted reason. Neither ever crosses the thread boundary as a
/// raw fault.
///
/// State owned by the implementation is touched only from the worker
/// thread. An implementation that shares its own state with other threads
/// owns that synchronization - the bridge protects only its two channels.
pub trait Worker: Send + 'static {
    fn execute(
        &mut self,
        inbound: &InboundReceiver,
        outbound: &OutboundSender,
    ) -> anyhow::Result<()>;
}

/// Constructs the worker for one session.
///
/// Injected per session rather than looked up in any process-wide registry,
/// and invoked exactly once on the caller's execution context before the
/// worker thread starts - so constructor faults surface synchronously from
/// session creation.
pub trait WorkerFactory {
    fn create(&self, options: &Options) -> anyhow::Result<Box<dyn Worker>>;
}

impl<F> WorkerFactory for F
where
    F: Fn(&Options) -> anyhow::Result<Box<dyn Worker>>,
{
    fn create(&self, options: &Options) -> anyhow::Result<Box<dyn Worker>> {
        self(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    struct Echo;

    impl Worker for Echo {
        fn execute(
            &mut self,
            inbound: &InboundReceiver,
            outbound: &OutboundSender,
        ) -> anyhow::Result<()> {
            while let Some(message) = inbound.pop() {
                let _ = outbound.send(message);
            }
            Ok(())
        }
    }

    #[test]
    fn closure_factories_satisfy_the_trait() {
        let factory = |_: &Options| -> anyhow::Result<Box<dyn Worker>> { Ok(Box::new(Echo)) };
        assert!(factory.create(&Options::default()).is_ok());
    }

    #[test]
    fn factory_faults_are_returned_not_raised() {
        let factory =
            |_: &Options| -> anyhow::Result<Box<dyn Worker>> { anyhow::bail!("bad options") };
        let err = match factory.create(&Options::default()) {
            Ok(_) => panic!("expected factory to fault"),
            Err(e) => e,
        };
        assert_eq!(err.to_string(), "bad options");
    }

    #[test]
    fn workers_drive_the_channel_pair_directly() {
        let (in_tx, in_rx) = crate::inbound::queue();
        let (out_tx, out_rx) = crate::outbound::channel();

        in_tx.push(Message::new("n", "1")).unwrap();
        in_tx.close();

        Echo.execute(&in_rx, &out_tx).unwrap();

        let drained = out_rx.drain();
        assert_eq!(drained.messages.len(), 1);
        assert_eq!(drained.messages[0].data(), "1");
    }
}
