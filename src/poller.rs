use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::fmt;

use crate::ready::Ready;
use crate::sys;
use crate::token::Token;

/// One kind of readiness a descriptor can be watched for.
///
/// Registrations are per-filter: watching both directions of one
/// descriptor takes two changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Readable,
    Writable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Delete,
}

/// A single registration change for a [`Multiplex`] submission.
#[derive(Debug, Clone, Copy)]
pub struct Change {
    pub fd: RawFd,
    pub filter: Filter,
    pub kind: ChangeKind,
    pub token: Token,
}

impl Change {
    pub fn add(fd: RawFd, filter: Filter, token: Token) -> Change {
        Change {
            fd,
            filter,
            kind: ChangeKind::Add,
            token,
        }
    }

    pub fn delete(fd: RawFd, filter: Filter, token: Token) -> Change {
        Change {
            fd,
            filter,
            kind: ChangeKind::Delete,
            token,
        }
    }
}

/// Per-change outcome of a receipt-mode submission.
#[derive(Debug, Clone, Copy)]
pub struct Receipt {
    pub filter: Filter,
    /// Raw OS errno; `None` when the change was applied.
    pub error: Option<i32>,
}

impl Receipt {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// A readiness event reported by the multiplexer.
#[derive(Debug, Clone, Copy)]
pub struct PollEvent {
    pub token: Token,
    pub filter: Filter,
    /// Bytes available to read, or writable buffer space, when the
    /// platform reports it.
    pub data: i64,
    /// End-of-file was observed on the descriptor.
    pub eof: bool,
    /// The event reports a failure instead of readiness.
    pub error: bool,
}

impl PollEvent {
    /// Collapses the kernel event into readiness flags.
    ///
    /// An error event maps to `ERROR` alone. Otherwise a non-zero
    /// payload emits the filter's readiness, and end-of-file adds
    /// `CLOSED` (possibly combined with data readiness).
    pub fn readiness(&self) -> Ready {
        if self.error {
            return Ready::error();
        }

        let mut ready = Ready::empty();

        if self.data > 0 {
            ready |= match self.filter {
                Filter::Readable => Ready::readable(),
                Filter::Writable => Ready::writable(),
            };
        }

        if self.eof {
            ready |= Ready::closed();
        }

        ready
    }
}

/// Kernel readiness multiplexer contract.
///
/// `submit` applies registration changes in receipt mode: the result
/// carries one [`Receipt`] per change, in order, instead of delivering
/// events. `wait` blocks until readiness or timeout and fills `events`.
///
/// The event loop is written against this trait only, so a loop can be
/// driven by a substitute multiplexer (see
/// [`EventLoop::with_multiplexer`]).
///
/// [`EventLoop::with_multiplexer`]: crate::EventLoop::with_multiplexer
pub trait Multiplex: Send {
    fn submit(&mut self, changes: &[Change]) -> io::Result<Vec<Receipt>>;

    fn wait(&mut self, events: &mut Vec<PollEvent>, timeout: Option<Duration>)
        -> io::Result<usize>;
}

/// The system multiplexer: kqueue on BSD-family platforms, epoll on
/// Linux.
pub struct Poller {
    selector: sys::Selector,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            selector: sys::Selector::new()?,
        })
    }
}

impl Multiplex for Poller {
    fn submit(&mut self, changes: &[Change]) -> io::Result<Vec<Receipt>> {
        self.selector.submit(changes)
    }

    fn wait(
        &mut self,
        events: &mut Vec<PollEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        self.selector.wait(events, timeout)
    }
}

impl AsRawFd for Poller {
    fn as_raw_fd(&self) -> RawFd {
        self.selector.as_raw_fd()
    }
}

impl fmt::Debug for Poller {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Poller")
    }
}

#[cfg(test)]
mod test {
    use super::{Filter, PollEvent};
    use crate::{Ready, Token};

    fn event(filter: Filter, data: i64, eof: bool, error: bool) -> PollEvent {
        PollEvent {
            token: Token(0),
            filter,
            data,
            eof,
            error,
        }
    }

    #[test]
    fn translation() {
        let ev = event(Filter::Readable, 16, false, false);
        assert_eq!(ev.readiness(), Ready::readable());

        let ev = event(Filter::Writable, 4096, false, false);
        assert_eq!(ev.readiness(), Ready::writable());

        let ev = event(Filter::Readable, 16, true, false);
        assert_eq!(ev.readiness(), Ready::readable() | Ready::closed());

        let ev = event(Filter::Readable, 0, true, false);
        assert_eq!(ev.readiness(), Ready::closed());

        let ev = event(Filter::Readable, 0, false, false);
        assert_eq!(ev.readiness(), Ready::empty());

        // the error flag wins over everything else
        let ev = event(Filter::Writable, 32, true, true);
        assert_eq!(ev.readiness(), Ready::error());
    }
}
