use std::fmt;
use std::ops::Deref;

use crate::event::{ChannelState, Delivery, EventError, EventTable, Port};
use crate::host::Host;
use crate::trace::{debug, trace};

/// One party's end of an event channel.
///
/// Holds the local port (bound in the party's own table, which it masks and
/// consumes) and the remote port (bound in the peer's table, which it
/// notifies). `T` is any handle to an [`EventTable`]: an `Arc` between
/// threads, a shared memory mapping between processes.
pub struct EventChannel<T, H> {
    local: T,
    local_port: Port,
    remote: T,
    remote_port: Port,
    host: H,
}

impl<T: Deref<Target = EventTable>, H: Host> EventChannel<T, H> {
    /// Channel over already bound ports.
    ///
    /// # Errors
    ///
    /// [`EventError::Unbound`] if `local_port` is not bound in `local`.
    pub fn new(
        local: T,
        local_port: Port,
        remote: T,
        remote_port: Port,
        host: H,
    ) -> Result<Self, EventError> {
        if !local.is_bound(local_port) {
            return Err(EventError::Unbound(local_port));
        }
        Ok(Self {
            local,
            local_port,
            remote,
            remote_port,
            host,
        })
    }

    /// Bind a fresh port in each table and return the two connected ends:
    /// the first owned by `a`'s context, the second by `b`'s.
    ///
    /// # Errors
    ///
    /// [`EventError::Exhausted`] if either table is full.
    pub fn pair(a: T, b: T, host: H) -> Result<(Self, Self), EventError>
    where
        T: Clone,
        H: Clone,
    {
        let a_port = a.bind()?;
        let b_port = match b.bind() {
            Ok(port) => port,
            Err(err) => {
                let _ = a.close(a_port);
                return Err(err);
            }
        };
        debug!(%a_port, %b_port, "event channel pair bound");
        Ok((
            Self {
                local: a.clone(),
                local_port: a_port,
                remote: b.clone(),
                remote_port: b_port,
                host: host.clone(),
            },
            Self {
                local: b,
                local_port: b_port,
                remote: a,
                remote_port: a_port,
                host,
            },
        ))
    }

    /// Ring the peer's doorbell.
    ///
    /// Coalesces with any notification the peer has not consumed yet, and is
    /// held pending (not lost) while the peer has the channel masked.
    ///
    /// # Errors
    ///
    /// [`EventError::Unbound`] if the peer has closed its port,
    /// [`EventError::Host`] if waking the peer failed.
    pub fn notify(&self) -> Result<(), EventError> {
        let delivery = self.remote.raise(self.remote_port)?;
        trace!(port = %self.remote_port, ?delivery, "notify");
        self.kick(&self.remote, delivery)
    }

    fn kick(&self, table: &EventTable, delivery: Delivery) -> Result<(), EventError> {
        if delivery == Delivery::Wake {
            self.host.wake(table.wake_word())?;
        }
        Ok(())
    }

    /// Suppress delivery of this channel to the local context.
    ///
    /// # Errors
    ///
    /// [`EventError::Unbound`] if the local port was closed.
    pub fn mask(&self) -> Result<(), EventError> {
        self.local.mask(self.local_port)
    }

    /// Re-enable delivery; a notification that arrived while masked is
    /// delivered now.
    ///
    /// # Errors
    ///
    /// [`EventError::Unbound`] if the local port was closed,
    /// [`EventError::Host`] if the replayed wake failed.
    pub fn unmask(&self) -> Result<(), EventError> {
        let delivery = self.local.unmask(self.local_port)?;
        self.kick(&self.local, delivery)
    }

    /// Clear the local pending flag, returning whether it was set.
    ///
    /// # Errors
    ///
    /// [`EventError::Unbound`] if the local port was closed.
    pub fn consume_pending(&self) -> Result<bool, EventError> {
        self.local.consume_pending(self.local_port)
    }

    /// # Errors
    ///
    /// [`EventError::Unbound`] if the local port was closed.
    pub fn state(&self) -> Result<ChannelState, EventError> {
        self.local.state(self.local_port)
    }

    /// Unbind the local port. The peer's further notifies fail with
    /// [`EventError::Unbound`].
    ///
    /// # Errors
    ///
    /// [`EventError::Unbound`] if already closed.
    pub fn close(&self) -> Result<(), EventError> {
        self.local.close(self.local_port)
    }

    #[inline]
    pub const fn local_port(&self) -> Port {
        self.local_port
    }

    #[inline]
    pub const fn remote_port(&self) -> Port {
        self.remote_port
    }

    #[inline]
    pub fn local_table(&self) -> &EventTable {
        &self.local
    }
}

impl<T, H> fmt::Debug for EventChannel<T, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("local_port", &self.local_port)
            .field("remote_port", &self.remote_port)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::CountingHost;
    use std::sync::Arc;

    type Channel = EventChannel<Arc<EventTable>, Arc<CountingHost>>;

    fn pair() -> (Channel, Channel, Arc<CountingHost>) {
        let host = Arc::new(CountingHost::default());
        let (a, b) = EventChannel::pair(
            Arc::new(EventTable::new()),
            Arc::new(EventTable::new()),
            Arc::clone(&host),
        )
        .unwrap();
        (a, b, host)
    }

    #[test]
    fn notify_marks_peer_pending_and_wakes_once() {
        let (a, b, host) = pair();
        a.notify().unwrap();
        a.notify().unwrap();
        assert_eq!(b.state().unwrap(), ChannelState::Pending);
        assert_eq!(host.wakes(), 1);

        assert!(b.consume_pending().unwrap());
        assert_eq!(b.state().unwrap(), ChannelState::Idle);
        assert_eq!(a.state().unwrap(), ChannelState::Idle);
    }

    #[test]
    fn masked_notify_is_held_until_unmask() {
        let (a, b, host) = pair();
        b.mask().unwrap();
        a.notify().unwrap();
        a.notify().unwrap();
        assert_eq!(b.state().unwrap(), ChannelState::MaskedPending);
        assert_eq!(host.wakes(), 0);

        b.unmask().unwrap();
        assert_eq!(b.state().unwrap(), ChannelState::Pending);
        assert_eq!(host.wakes(), 1);
    }

    #[test]
    fn notify_after_peer_close_is_protocol_violation() {
        let (a, b, _) = pair();
        b.close().unwrap();
        let err = a.notify().unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(matches!(b.consume_pending(), Err(EventError::Unbound(_))));
    }

    #[test]
    fn new_requires_bound_local_port() {
        let local = Arc::new(EventTable::new());
        let remote = Arc::new(EventTable::new());
        let host = Arc::new(CountingHost::default());
        let err = EventChannel::new(local, Port::new(5), remote, Port::new(0), host).unwrap_err();
        assert!(matches!(err, EventError::Unbound(p) if p == Port::new(5)));
    }

    #[test]
    fn pair_releases_first_port_when_second_table_is_full() {
        let a = Arc::new(EventTable::new());
        let b = Arc::new(EventTable::new());
        for _ in 0..crate::event::MAX_PORTS {
            b.bind().unwrap();
        }
        let host = Arc::new(CountingHost::default());
        let err = EventChannel::pair(Arc::clone(&a), b, host).unwrap_err();
        assert!(matches!(err, EventError::Exhausted));
        assert!(!a.is_bound(Port::new(0)));
    }
}
