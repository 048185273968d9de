//! The cross-thread control plane: a queue of [`Command`]s a controller can
//! push at a running [`crate::iothread::IOThread`] to resize its connection
//! pool or ask it to shut down.
//!
//! This favors a plain queue over a bounded SPSC channel, since the control
//! plane is human/controller-driven and never a throughput path;
//! `crossbeam_channel` gives us the mutex-guarded FIFO plus a blocking-free
//! sender for free. The
//! enqueue side always wakes the loop through a [`mio::Waker`] afterward, and
//! the loop drains every pending command in one batch per wake — multiple
//! enqueues between wakes collapse into the one drain, which is exactly what
//! an edge-triggered wake needs to tolerate.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use mio::Waker;

/// A control message accepted by a running [`crate::iothread::IOThread`].
#[derive(Debug, Clone, Copy)]
pub enum Command {
    /// Flag every connection non-reopening and arm a forced-teardown
    /// deadline `timeout_secs` from now.
    Stop {
        /// Grace period before remaining connections are force-closed.
        timeout_secs: u64,
    },
    /// Resize the live connection pool to exactly `new_count`.
    SetConnections {
        /// Desired number of live connections.
        new_count: usize,
    },
}

/// The sending half, held by whatever is controlling the benchmark run.
#[derive(Debug, Clone)]
pub struct CommandSender {
    tx: Sender<Command>,
    waker: Arc<Waker>,
}

impl CommandSender {
    /// Enqueues `cmd` and wakes the owning loop.
    ///
    /// Returns `Err(cmd)` if the loop has already exited and dropped its
    /// receiver; the caller gets the command back rather than it vanishing
    /// silently.
    pub fn send(&self, cmd: Command) -> Result<(), Command> {
        self.tx.send(cmd).map_err(|e| e.into_inner())?;
        let _ = self.waker.wake();
        Ok(())
    }
}

/// The receiving half, owned by the [`crate::iothread::IOThread`] event loop.
#[derive(Debug)]
pub struct CommandQueue {
    rx: Receiver<Command>,
}

impl CommandQueue {
    /// Creates a fresh sender/receiver pair, with the sender pre-wired to
    /// wake `waker` on every enqueue.
    pub fn new(waker: Arc<Waker>) -> (CommandSender, CommandQueue) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (CommandSender { tx, waker }, CommandQueue { rx })
    }

    /// Drains every command currently queued, in FIFO order.
    pub fn drain(&self) -> Vec<Command> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(cmd) => out.push(cmd),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Poll, Token};

    #[test]
    fn drain_returns_commands_in_fifo_order() {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let (tx, queue) = CommandQueue::new(waker);

        tx.send(Command::SetConnections { new_count: 3 }).unwrap();
        tx.send(Command::Stop { timeout_secs: 1 }).unwrap();

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(matches!(drained[0], Command::SetConnections { new_count: 3 }));
        assert!(matches!(drained[1], Command::Stop { timeout_secs: 1 }));
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn send_after_receiver_dropped_returns_command_back() {
        let poll = Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
        let (tx, queue) = CommandQueue::new(waker);
        drop(queue);

        let err = tx.send(Command::Stop { timeout_secs: 5 }).unwrap_err();
        assert!(matches!(err, Command::Stop { timeout_secs: 5 }));
    }
}
