//! A connection: one shared page, the side this party plays, and the event
//! channel that rings the peer's doorbell.
//!
//! [`Connection::send`] writes what fits and notifies the peer once if any
//! byte was accepted. [`Connection::recv`] reads what is there. Either one
//! detecting a protocol violation (corrupt ring indices, a port the peer
//! does not own) tears the connection down for good: the local port is
//! closed and every later call fails with [`ConnectionError::TornDown`].

use std::ops::Deref;

use crate::event::{EventChannel, EventError, EventTable};
use crate::host::Host;
use crate::page::{SharedPage, Side};
use crate::ring::{CapacityCheck, RingError};
use crate::trace::{debug, warn};

/// Errors produced by [`Connection`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Event(#[from] EventError),
    #[error("connection has been torn down")]
    TornDown,
    /// `written` bytes are on the ring but the peer's doorbell failed.
    #[error("{written} bytes written but the peer was not notified: {source}")]
    Unnotified {
        written: usize,
        #[source]
        source: EventError,
    },
}

impl ConnectionError {
    /// Whether the peer broke the page or channel contract.
    pub const fn is_protocol_violation(&self) -> bool {
        match self {
            Self::Ring(RingError::ProtocolViolation { .. }) => true,
            Self::Event(err) | Self::Unnotified { source: err, .. } => {
                err.is_protocol_violation()
            }
            Self::TornDown => false,
        }
    }

    /// Bytes that reached the ring before the error.
    pub const fn written(&self) -> usize {
        match self {
            Self::Unnotified { written, .. } => *written,
            _ => 0,
        }
    }
}

/// One party's view of a page-plus-doorbell connection.
///
/// `P` derefs to the [`SharedPage`], `T` to the event tables, `H` is the
/// host used to wake the peer.
pub struct Connection<P, T, H, const N: usize> {
    page: P,
    side: Side,
    channel: EventChannel<T, H>,
    torn_down: bool,
}

impl<P, T, H, const N: usize> Connection<P, T, H, N>
where
    P: Deref<Target = SharedPage<N>>,
    T: Deref<Target = EventTable>,
    H: Host,
{
    pub fn new(page: P, side: Side, channel: EventChannel<T, H>) -> Self {
        let () = CapacityCheck::<N>::OK;
        debug!(%side, local_port = %channel.local_port(), "connection up");
        Self {
            page,
            side,
            channel,
            torn_down: false,
        }
    }

    /// Front end: writes the `out` ring, reads the `in` ring.
    pub fn front(page: P, channel: EventChannel<T, H>) -> Self {
        Self::new(page, Side::Front, channel)
    }

    /// Back end: writes the `in` ring, reads the `out` ring.
    pub fn back(page: P, channel: EventChannel<T, H>) -> Self {
        Self::new(page, Side::Back, channel)
    }

    /// Write what fits of `bytes`, then notify the peer once if anything was
    /// written. Returns the number of bytes accepted.
    ///
    /// # Errors
    ///
    /// Protocol violations tear the connection down. A failed doorbell
    /// after bytes were accepted is [`ConnectionError::Unnotified`], which
    /// carries the accepted count: those bytes are on the ring already.
    pub fn send(&mut self, bytes: &[u8]) -> Result<usize, ConnectionError> {
        let written = self.write(bytes)?;
        if written > 0 {
            self.notify().map_err(|err| match err {
                ConnectionError::Event(source) => {
                    ConnectionError::Unnotified { written, source }
                }
                other => other,
            })?;
        }
        Ok(written)
    }

    /// Write without notifying; follow a batch of writes with one
    /// [`notify`](Self::notify).
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn write(&mut self, bytes: &[u8]) -> Result<usize, ConnectionError> {
        self.ensure_up()?;
        let result = self.page.ring(self.side.tx()).write(bytes);
        self.check(result)
    }

    /// Ring the peer's doorbell.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub fn notify(&mut self) -> Result<(), ConnectionError> {
        self.ensure_up()?;
        let result = self.channel.notify();
        self.check(result)
    }

    /// Read up to `buf.len()` bytes. Zero means nothing is available now.
    ///
    /// # Errors
    ///
    /// Protocol violations tear the connection down.
    pub fn recv(&mut self, buf: &mut [u8]) -> Result<usize, ConnectionError> {
        self.ensure_up()?;
        let result = self.page.ring(self.side.rx()).read(buf);
        self.check(result)
    }

    /// Bytes ready to [`recv`](Self::recv).
    ///
    /// # Errors
    ///
    /// Protocol violations tear the connection down.
    pub fn available_to_read(&mut self) -> Result<usize, ConnectionError> {
        self.ensure_up()?;
        let result = self.page.ring(self.side.rx()).available_to_read();
        self.check(result)
    }

    /// Room left for [`send`](Self::send).
    ///
    /// # Errors
    ///
    /// Protocol violations tear the connection down.
    pub fn available_to_write(&mut self) -> Result<usize, ConnectionError> {
        self.ensure_up()?;
        let result = self.page.ring(self.side.tx()).available_to_write();
        self.check(result)
    }

    /// Clear this connection's pending doorbell, returning whether it rang.
    ///
    /// # Errors
    ///
    /// Protocol violations tear the connection down.
    pub fn consume_pending(&mut self) -> Result<bool, ConnectionError> {
        self.ensure_up()?;
        let result = self.channel.consume_pending();
        self.check(result)
    }

    /// Close the local port and refuse further use. Idempotent.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        // Already closed if the table was reset under us; nothing left to undo.
        let _ = self.channel.close();
        debug!(side = %self.side, "connection torn down");
    }

    #[inline]
    pub const fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    #[inline]
    pub const fn side(&self) -> Side {
        self.side
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[inline]
    pub fn channel(&self) -> &EventChannel<T, H> {
        &self.channel
    }

    #[inline]
    pub fn page(&self) -> &SharedPage<N> {
        &self.page
    }

    fn ensure_up(&self) -> Result<(), ConnectionError> {
        if self.torn_down {
            return Err(ConnectionError::TornDown);
        }
        Ok(())
    }

    fn check<R, E>(&mut self, result: Result<R, E>) -> Result<R, ConnectionError>
    where
        E: Into<ConnectionError>,
    {
        result.map_err(|err| {
            let err = err.into();
            if err.is_protocol_violation() {
                warn!(side = %self.side, %err, "protocol violation; tearing down connection");
                self.teardown();
            }
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChannelState;
    use crate::host::testing::CountingHost;
    use crate::page::Direction;
    use std::sync::Arc;

    type Conn = Connection<Arc<SharedPage<8>>, Arc<EventTable>, Arc<CountingHost>, 8>;

    struct Pair {
        front: Conn,
        back: Conn,
        page: Arc<SharedPage<8>>,
        host: Arc<CountingHost>,
    }

    fn pair() -> Pair {
        let page = Arc::new(SharedPage::<8>::new());
        let host = Arc::new(CountingHost::default());
        let (front_ch, back_ch) = EventChannel::pair(
            Arc::new(EventTable::new()),
            Arc::new(EventTable::new()),
            Arc::clone(&host),
        )
        .unwrap();
        Pair {
            front: Connection::front(Arc::clone(&page), front_ch),
            back: Connection::back(Arc::clone(&page), back_ch),
            page,
            host,
        }
    }

    #[test]
    fn send_notifies_once_per_batch() {
        let Pair {
            mut front,
            mut back,
            host,
            ..
        } = pair();
        assert_eq!(front.send(b"HELLOWORLD").unwrap(), 8);
        assert_eq!(front.send(b"more").unwrap(), 0);
        assert_eq!(back.channel().state().unwrap(), ChannelState::Pending);
        assert_eq!(host.wakes(), 1);

        let mut buf = [0u8; 100];
        let n = back.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"HELLOWOR");
        assert!(back.consume_pending().unwrap());
        assert_eq!(front.send(b"LD").unwrap(), 2);
        assert_eq!(back.channel().state().unwrap(), ChannelState::Pending);
        // The back context never blocked in between, so its wake word is
        // still raised and the second doorbell coalesces.
        assert_eq!(host.wakes(), 1);
    }

    #[test]
    fn full_ring_send_does_not_notify() {
        let Pair {
            mut front,
            mut back,
            ..
        } = pair();
        front.send(b"12345678").unwrap();
        assert!(back.consume_pending().unwrap());
        assert_eq!(front.send(b"9").unwrap(), 0);
        assert!(!back.consume_pending().unwrap());
    }

    #[test]
    fn both_directions_are_independent() {
        let Pair {
            mut front,
            mut back,
            ..
        } = pair();
        front.send(b"ping").unwrap();
        back.send(b"pong!").unwrap();
        let mut buf = [0u8; 8];
        let n = front.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong!");
        let n = back.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(front.available_to_write().unwrap(), 8);
    }

    #[test]
    fn corrupt_indices_tear_down() {
        let Pair {
            mut front,
            mut back,
            page,
            ..
        } = pair();
        front.send(b"abc").unwrap();
        page.force_indices(Direction::Out, 3, 7);

        let err = back.available_to_read().unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(back.is_torn_down());
        assert!(matches!(
            back.recv(&mut [0u8; 4]),
            Err(ConnectionError::TornDown)
        ));

        // The peer's doorbell now points at a closed port.
        let err = front.notify().unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(front.is_torn_down());
    }

    #[test]
    fn failed_doorbell_reports_accepted_bytes() {
        let page = Arc::new(SharedPage::<8>::new());
        let host = Arc::new(CountingHost::failing_wake(rustix::io::Errno::FAULT));
        let (front_ch, back_ch) = EventChannel::pair(
            Arc::new(EventTable::new()),
            Arc::new(EventTable::new()),
            Arc::clone(&host),
        )
        .unwrap();
        let mut front: Conn = Connection::front(Arc::clone(&page), front_ch);
        let mut back: Conn = Connection::back(page, back_ch);

        let err = front.send(b"hi").unwrap_err();
        assert_eq!(err.written(), 2);
        assert!(matches!(
            err,
            ConnectionError::Unnotified {
                written: 2,
                source: EventError::Host(_)
            }
        ));
        assert!(!err.is_protocol_violation());
        assert!(!front.is_torn_down());

        // The bytes are there for the peer to find on its next poll.
        let mut buf = [0u8; 8];
        assert_eq!(back.recv(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");
    }

    #[test]
    fn teardown_is_idempotent() {
        let Pair { mut front, .. } = pair();
        front.teardown();
        front.teardown();
        assert!(matches!(front.send(b"x"), Err(ConnectionError::TornDown)));
    }
}
