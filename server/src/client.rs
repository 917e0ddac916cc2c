use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TrySendError;

use crate::error::{GameError, GameResult};
use shared::Message;

/// Per-connection outbound queue depth. A client that falls this far behind is dropped.
pub const OUTBOUND_QUEUE: usize = 256;

/// Identifier the network layer assigns to every accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Work items for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// Handle to one client socket's independent outbound path.
///
/// Sending never blocks the coordination loop: frames are encoded up front and pushed with
/// `try_send`. A full queue is reported as [`GameError::QueueFull`] so the caller can log the
/// backpressure, and a queue whose writer is gone as [`GameError::ConnectionClosed`].
///
/// Closing does not depend on queue space. Besides the best-effort [`Outbound::Close`] item,
/// a close flag is raised that the socket tasks wait on through a [`CloseSignal`].
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ClientId,
    pub addr: SocketAddr,
    sender: mpsc::Sender<Outbound>,
    closed: Arc<watch::Sender<bool>>,
}

impl Connection {
    pub fn new(id: ClientId, addr: SocketAddr, sender: mpsc::Sender<Outbound>) -> Self {
        let (closed, _) = watch::channel(false);

        Connection {
            id,
            addr,
            sender,
            closed: Arc::new(closed),
        }
    }

    /// Creates a connection together with the receiving end of its outbound queue.
    pub fn channel(id: ClientId, addr: SocketAddr) -> (Self, mpsc::Receiver<Outbound>) {
        let (sender, receiver) = mpsc::channel(OUTBOUND_QUEUE);
        (Connection::new(id, addr, sender), receiver)
    }

    pub fn send(&self, message: &Message) -> GameResult {
        let frame = message.encode()?;

        self.sender
            .try_send(Outbound::Text(frame))
            .map_err(|e| match e {
                TrySendError::Full(_) => GameError::QueueFull(self.id),
                TrySendError::Closed(_) => GameError::ConnectionClosed(self.id),
            })
    }

    /// Asks the writer task to close the socket.
    ///
    /// If the queue has room, frames queued before this are still sent. A saturated queue is
    /// skipped and the socket tasks are told to stop through the close flag alone.
    pub fn close(&self) {
        if self.sender.try_send(Outbound::Close).is_err() {
            log::debug!("client {} queue unavailable on close; signalling only", self.id);
        }

        self.signal_closed();
    }

    /// Raises the close flag without queueing anything.
    pub fn signal_closed(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.sender.is_closed()
    }

    pub fn close_signal(&self) -> CloseSignal {
        CloseSignal(self.closed.subscribe())
    }
}

/// Resolves once the owning [`Connection`] has been closed.
#[derive(Debug)]
pub struct CloseSignal(watch::Receiver<bool>);

impl CloseSignal {
    pub async fn wait(&mut self) {
        loop {
            if *self.0.borrow_and_update() {
                return;
            }

            if self.0.changed().await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    /// Pops every text frame queued so far and parses it.
    pub(crate) fn drain(receiver: &mut mpsc::Receiver<Outbound>) -> Vec<Message> {
        let mut messages = Vec::new();

        while let Ok(item) = receiver.try_recv() {
            if let Outbound::Text(frame) = item {
                messages.push(Message::parse(&frame).unwrap());
            }
        }

        messages
    }

    #[test]
    fn test_send_encodes_frame() {
        let (conn, mut rx) = Connection::channel(ClientId(1), test_addr());

        conn.send(&Message::new("ship_tick").with("seconds_left", 3.0))
            .unwrap();

        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind(), "ship_tick");
    }

    #[test]
    fn test_full_queue_reports_backpressure() {
        let (sender, _rx) = mpsc::channel(1);
        let conn = Connection::new(ClientId(2), test_addr(), sender);

        conn.send(&Message::new("a")).unwrap();

        assert!(matches!(
            conn.send(&Message::new("b")),
            Err(GameError::QueueFull(ClientId(2)))
        ));
    }

    #[test]
    fn test_closed_queue() {
        let (conn, rx) = Connection::channel(ClientId(3), test_addr());
        drop(rx);

        assert!(conn.is_closed());
        assert!(matches!(
            conn.send(&Message::new("a")),
            Err(GameError::ConnectionClosed(ClientId(3)))
        ));
    }

    #[test]
    fn test_encode_failure_is_not_sent() {
        let (conn, mut rx) = Connection::channel(ClientId(4), test_addr());

        let result = conn.send(&Message::new("x").with("type", "y"));

        assert!(matches!(result, Err(GameError::Encode(_))));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_close_is_queued_after_frames() {
        let (conn, mut rx) = Connection::channel(ClientId(5), test_addr());

        conn.send(&Message::new("bye")).unwrap();
        conn.close();

        assert!(matches!(rx.try_recv(), Ok(Outbound::Text(_))));
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
    }

    #[test]
    fn test_close_on_full_queue_still_signals() {
        let (conn, mut rx) = Connection::channel(ClientId(6), test_addr());
        let mut signal = conn.close_signal();
        let mut waiting = tokio_test::task::spawn(async move { signal.wait().await });
        tokio_test::assert_pending!(waiting.poll());

        while conn.send(&Message::new("flood")).is_ok() {}
        conn.close();

        assert!(conn.is_closed());
        assert!(waiting.is_woken());
        tokio_test::assert_ready!(waiting.poll());

        // The close went out of band; the queue holds only the flood.
        let mut queued = 0;
        while let Ok(item) = rx.try_recv() {
            assert_ne!(item, Outbound::Close);
            queued += 1;
        }
        assert_eq!(queued, OUTBOUND_QUEUE);
    }

    #[test]
    fn test_signal_without_close_frame() {
        let (conn, mut rx) = Connection::channel(ClientId(7), test_addr());

        conn.signal_closed();

        assert!(conn.is_closed());
        assert!(rx.try_recv().is_err());
    }
}
