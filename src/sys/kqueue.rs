use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{fmt, io, mem, ptr};

use libc::{self, c_int};

use crate::poller::{Change, ChangeKind, Filter, PollEvent, Receipt};
use crate::token::Token;

const EVENTS_CAPACITY: usize = 256;

/// Kqueue-backed selector.
///
/// Registrations are per-filter kevents; submissions always carry
/// `EV_RECEIPT`, so the kernel reports one outcome per change instead
/// of delivering events.
pub struct Selector {
    kq: RawFd,
    buf: Vec<libc::kevent>,
}

// The kevent buffer is scratch storage; its udata pointers are tokens,
// never dereferenced.
unsafe impl Send for Selector {}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;

        let selector = Selector {
            kq,
            buf: Vec::with_capacity(EVENTS_CAPACITY),
        };

        syscall!(fcntl(selector.kq, libc::F_SETFD, libc::FD_CLOEXEC))?;

        Ok(selector)
    }

    pub fn submit(&mut self, changes: &[Change]) -> io::Result<Vec<Receipt>> {
        if changes.is_empty() {
            return Ok(Vec::new());
        }

        let mut kevs: Vec<libc::kevent> = changes.iter().map(kevent_from).collect();

        // With EV_RECEIPT the eventlist holds one EV_ERROR entry per
        // change, data carrying the errno (zero on success).
        let zero = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        let n = syscall!(kevent(
            self.kq,
            kevs.as_ptr(),
            kevs.len() as c_int,
            kevs.as_mut_ptr(),
            kevs.len() as c_int,
            &zero
        ))?;

        let receipts = kevs[..n as usize]
            .iter()
            .map(|kev| Receipt {
                filter: filter_from(kev.filter),
                error: if kev.data == 0 {
                    None
                } else {
                    Some(kev.data as i32)
                },
            })
            .collect();

        Ok(receipts)
    }

    pub fn wait(
        &mut self,
        events: &mut Vec<PollEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let ts = timeout.map(timespec_from);
        let ts_ptr = ts
            .as_ref()
            .map(|ts| ts as *const libc::timespec)
            .unwrap_or(ptr::null());

        let n = syscall!(kevent(
            self.kq,
            ptr::null(),
            0,
            self.buf.as_mut_ptr(),
            self.buf.capacity() as c_int,
            ts_ptr
        ))?;

        unsafe { self.buf.set_len(n as usize) };

        events.clear();
        for kev in &self.buf {
            events.push(PollEvent {
                token: Token(kev.udata as usize),
                filter: filter_from(kev.filter),
                data: kev.data as i64,
                eof: kev.flags & libc::EV_EOF != 0,
                error: kev.flags & libc::EV_ERROR != 0,
            });
        }

        Ok(events.len())
    }
}

// Zero-initialized rather than a struct literal: the kevent layout
// grows trailing fields on some BSDs.
fn kevent_from(change: &Change) -> libc::kevent {
    let mut kev: libc::kevent = unsafe { mem::zeroed() };

    kev.ident = change.fd as libc::uintptr_t;
    kev.filter = match change.filter {
        Filter::Readable => libc::EVFILT_READ,
        Filter::Writable => libc::EVFILT_WRITE,
    };
    kev.flags = match change.kind {
        ChangeKind::Add => libc::EV_ADD | libc::EV_RECEIPT,
        ChangeKind::Delete => libc::EV_DELETE | libc::EV_RECEIPT,
    };
    kev.udata = change.token.0 as *mut libc::c_void;

    kev
}

fn filter_from(filter: i16) -> Filter {
    if filter == libc::EVFILT_WRITE {
        Filter::Writable
    } else {
        Filter::Readable
    }
}

/// Seconds past the platform `time_t` are clamped to its maximum with
/// the sub-second part zeroed.
fn timespec_from(dur: Duration) -> libc::timespec {
    let secs = dur.as_secs();

    if secs > libc::time_t::MAX as u64 {
        libc::timespec {
            tv_sec: libc::time_t::MAX,
            tv_nsec: 0,
        }
    } else {
        libc::timespec {
            tv_sec: secs as libc::time_t,
            tv_nsec: dur.subsec_nanos() as libc::c_long,
        }
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.kq
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.kq);
        }
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Selector {{ kq: {} }}", self.kq)
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::time::Duration;

    use crate::poller::Change;
    use crate::token::Token;
    use crate::{Filter, Ready};

    use super::Selector;

    #[test]
    fn register_and_wait() {
        let mut selector = Selector::new().unwrap();
        let (reader, writer) = crate::sys::pipe().unwrap();

        let receipts = selector
            .submit(&[Change::add(reader.as_raw_fd(), Filter::Readable, Token(7))])
            .unwrap();
        assert_eq!(receipts.len(), 1);
        assert!(receipts[0].is_ok());

        (&writer).write_all(b"x").unwrap();

        let mut events = Vec::new();
        let n = selector
            .wait(&mut events, Some(Duration::from_secs(1)))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].token, Token(7));
        assert_eq!(events[0].readiness(), Ready::readable());
    }

    #[test]
    fn delete_unregistered_filter_reports_error() {
        let mut selector = Selector::new().unwrap();
        let (reader, _writer) = crate::sys::pipe().unwrap();

        let receipts = selector
            .submit(&[Change::delete(reader.as_raw_fd(), Filter::Readable, Token(0))])
            .unwrap();
        assert_eq!(receipts.len(), 1);
        assert!(!receipts[0].is_ok());
    }
}
