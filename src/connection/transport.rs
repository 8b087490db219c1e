//! Non-blocking socket abstraction used by the state machine.
//!
//! The state machine never awaits. It performs `try_*` calls and, when the
//! socket would block, asks the transport for a readiness future that the
//! worker thread runs as a local task. When the future resolves the worker
//! runs the connection's state machine again.

use std::future::Future;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::ops::BitOr;
use std::pin::Pin;
use std::rc::Rc;
use tokio::io::Interest;
use tokio::net::TcpStream;

/// Readiness a connection is interested in or was woken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EventMask(u8);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const READ: EventMask = EventMask(1);
    pub const WRITE: EventMask = EventMask(2);

    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    fn interest(self) -> Option<Interest> {
        match (self.contains(Self::READ), self.contains(Self::WRITE)) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, rhs: EventMask) -> EventMask {
        EventMask(self.0 | rhs.0)
    }
}

/// Future resolving once the socket is ready for the requested events.
pub type Readiness = Pin<Box<dyn Future<Output = io::Result<EventMask>>>>;

/// The operations the state machine needs from a socket.
pub trait Transport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn try_write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;

    /// A future that resolves when the socket becomes ready for `mask`.
    ///
    /// Returns `None` if the transport cannot be waited on.
    fn readiness(&self, mask: EventMask) -> Option<Readiness>;

    /// Stops all I/O. Further reads and writes fail.
    fn close(&mut self);

    fn is_closed(&self) -> bool;

    /// OS level descriptor, for diagnostics.
    fn descriptor(&self) -> i64;

    fn peer_addr(&self) -> Option<SocketAddr>;
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport closed")
}

/// A TCP socket registered with the worker thread's runtime.
pub struct TcpTransport {
    stream: Option<Rc<TcpStream>>,
    descriptor: i64,
    peer: Option<SocketAddr>,
}

impl TcpTransport {
    /// Wraps an accepted socket. Must be called on the worker thread
    /// inside its runtime.
    pub fn new(stream: TcpStream) -> Self {
        #[cfg(unix)]
        let descriptor = {
            use std::os::unix::io::AsRawFd;
            stream.as_raw_fd() as i64
        };
        #[cfg(not(unix))]
        let descriptor = -1;

        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr().ok();
        Self {
            stream: Some(Rc::new(stream)),
            descriptor,
            peer,
        }
    }
}

impl Transport for TcpTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.stream {
            Some(stream) => stream.try_read(buf),
            None => Err(closed_error()),
        }
    }

    fn try_write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        match &self.stream {
            Some(stream) => stream.try_write_vectored(bufs),
            None => Err(closed_error()),
        }
    }

    fn readiness(&self, mask: EventMask) -> Option<Readiness> {
        let stream = Rc::clone(self.stream.as_ref()?);
        let interest = mask.interest()?;
        Some(Box::pin(async move {
            let ready = stream.ready(interest).await?;
            let mut fired = EventMask::NONE;
            if ready.is_readable() || ready.is_read_closed() {
                fired = fired | EventMask::READ;
            }
            if ready.is_writable() || ready.is_write_closed() {
                fired = fired | EventMask::WRITE;
            }
            Ok(fired)
        }))
    }

    fn close(&mut self) {
        // The socket closes once the last readiness task lets go of it.
        self.stream = None;
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    fn descriptor(&self) -> i64 {
        self.descriptor
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! An in-memory transport for driving the state machine by hand.

    use super::*;
    use std::cell::RefCell;

    #[derive(Debug, Default)]
    pub struct MockState {
        pub input: Vec<u8>,
        pub output: Vec<u8>,
        /// Peer closed its side once `input` is drained
        pub eof: bool,
        /// Maximum bytes accepted per write call
        pub write_limit: Option<usize>,
        /// Writes fail with WouldBlock while set
        pub write_blocked: bool,
        pub closed: bool,
    }

    #[derive(Clone, Default)]
    pub struct MockTransport {
        pub state: Rc<RefCell<MockState>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_input(&self, bytes: &[u8]) {
            self.state.borrow_mut().input.extend_from_slice(bytes);
        }

        pub fn take_output(&self) -> Vec<u8> {
            std::mem::take(&mut self.state.borrow_mut().output)
        }
    }

    impl Transport for MockTransport {
        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return Err(closed_error());
            }
            if state.input.is_empty() {
                if state.eof {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(state.input.len());
            buf[..n].copy_from_slice(&state.input[..n]);
            state.input.drain(..n);
            Ok(n)
        }

        fn try_write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return Err(closed_error());
            }
            if state.write_blocked {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let mut budget = state.write_limit.unwrap_or(usize::MAX);
            let mut written = 0;
            for buf in bufs {
                let n = buf.len().min(budget);
                state.output.extend_from_slice(&buf[..n]);
                written += n;
                budget -= n;
                if budget == 0 {
                    break;
                }
            }
            Ok(written)
        }

        fn readiness(&self, _mask: EventMask) -> Option<Readiness> {
            None
        }

        fn close(&mut self) {
            self.state.borrow_mut().closed = true;
        }

        fn is_closed(&self) -> bool {
            self.state.borrow().closed
        }

        fn descriptor(&self) -> i64 {
            -1
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_mask() {
        let both = EventMask::READ | EventMask::WRITE;
        assert!(both.contains(EventMask::READ));
        assert!(both.contains(EventMask::WRITE));
        assert!(!EventMask::READ.contains(EventMask::WRITE));
        assert!(!EventMask::READ.contains(EventMask::NONE));
        assert!(EventMask::NONE.is_empty());
        assert!(EventMask::NONE.interest().is_none());
    }
}
