use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{cmp, fmt, io};

use indexmap::IndexMap;
use libc::{self, c_int};

use crate::poller::{Change, ChangeKind, Filter, PollEvent, Receipt};
use crate::token::Token;

const EVENTS_CAPACITY: usize = 256;

/// Epoll-backed selector presenting the kqueue-style changelist
/// contract.
///
/// Epoll keeps a single registration per descriptor, so per-filter
/// changes are folded into a combined interest mask held here and
/// turned into `EPOLL_CTL_ADD`/`MOD`/`DEL` calls; the errno of each
/// control call becomes the change's receipt.
pub struct Selector {
    epfd: RawFd,
    buf: Vec<libc::epoll_event>,
    regs: IndexMap<RawFd, FdReg>,
}

#[derive(Clone, Copy)]
struct FdReg {
    token: Token,
    read: bool,
    write: bool,
}

impl FdReg {
    fn has(&self, filter: Filter) -> bool {
        match filter {
            Filter::Readable => self.read,
            Filter::Writable => self.write,
        }
    }

    fn set(&mut self, filter: Filter, on: bool) {
        match filter {
            Filter::Readable => self.read = on,
            Filter::Writable => self.write = on,
        }
    }

    fn mask(&self) -> u32 {
        let mut kind = libc::EPOLLRDHUP;

        if self.read {
            kind |= libc::EPOLLIN;
        }

        if self.write {
            kind |= libc::EPOLLOUT;
        }

        kind as u32
    }
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;

        Ok(Selector {
            epfd,
            buf: Vec::with_capacity(EVENTS_CAPACITY),
            regs: IndexMap::new(),
        })
    }

    pub fn submit(&mut self, changes: &[Change]) -> io::Result<Vec<Receipt>> {
        let mut receipts = Vec::with_capacity(changes.len());

        for change in changes {
            let error = self
                .apply(change)
                .err()
                .map(|err| err.raw_os_error().unwrap_or(libc::EINVAL));

            receipts.push(Receipt {
                filter: change.filter,
                error,
            });
        }

        Ok(receipts)
    }

    fn apply(&mut self, change: &Change) -> io::Result<()> {
        match change.kind {
            ChangeKind::Add => {
                let (op, mut reg) = match self.regs.get(&change.fd) {
                    Some(reg) => (libc::EPOLL_CTL_MOD, *reg),
                    None => (
                        libc::EPOLL_CTL_ADD,
                        FdReg {
                            token: change.token,
                            read: false,
                            write: false,
                        },
                    ),
                };

                reg.token = change.token;
                reg.set(change.filter, true);
                self.ctl(op, change.fd, &reg)?;
                self.regs.insert(change.fd, reg);

                Ok(())
            }
            ChangeKind::Delete => {
                let mut reg = match self.regs.get(&change.fd) {
                    Some(reg) if reg.has(change.filter) => *reg,
                    _ => return Err(io::Error::from_raw_os_error(libc::ENOENT)),
                };

                reg.set(change.filter, false);

                if reg.read || reg.write {
                    self.ctl(libc::EPOLL_CTL_MOD, change.fd, &reg)?;
                    self.regs.insert(change.fd, reg);
                } else {
                    self.ctl(libc::EPOLL_CTL_DEL, change.fd, &reg)?;
                    self.regs.swap_remove(&change.fd);
                }

                Ok(())
            }
        }
    }

    fn ctl(&self, op: c_int, fd: RawFd, reg: &FdReg) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: reg.mask(),
            u64: reg.token.0 as u64,
        };

        syscall!(epoll_ctl(self.epfd, op, fd, &mut info))?;

        Ok(())
    }

    pub fn wait(
        &mut self,
        events: &mut Vec<PollEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let timeout = timeout
            .map(|to| cmp::min(to.as_millis(), c_int::MAX as u128) as c_int)
            .unwrap_or(-1);

        let n = syscall!(epoll_wait(
            self.epfd,
            self.buf.as_mut_ptr(),
            self.buf.capacity() as c_int,
            timeout
        ))?;

        unsafe { self.buf.set_len(n as usize) };

        events.clear();
        for event in &self.buf {
            let kind = event.events as c_int;
            let token = Token(event.u64 as usize);
            let eof = kind & (libc::EPOLLHUP | libc::EPOLLRDHUP) != 0;

            // EPOLLHUP/EPOLLERR - usually means a socket error happened
            if kind & libc::EPOLLERR != 0 {
                events.push(PollEvent {
                    token,
                    filter: Filter::Readable,
                    data: 0,
                    eof,
                    error: true,
                });
                continue;
            }

            if kind & (libc::EPOLLIN | libc::EPOLLPRI) != 0 {
                events.push(PollEvent {
                    token,
                    filter: Filter::Readable,
                    data: 1,
                    eof,
                    error: false,
                });
            } else if eof {
                // peer gone with nothing buffered to read
                events.push(PollEvent {
                    token,
                    filter: Filter::Readable,
                    data: 0,
                    eof: true,
                    error: false,
                });
            }

            if kind & libc::EPOLLOUT != 0 {
                events.push(PollEvent {
                    token,
                    filter: Filter::Writable,
                    data: 1,
                    eof,
                    error: false,
                });
            }
        }

        Ok(events.len())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::close(self.epfd);
        }
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Selector {{ epfd: {} }}", self.epfd)
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
    fn second_filter_joins_registration() {
        let mut selector = Selector::new().unwrap();
        let (_reader, writer) = crate::sys::pipe().unwrap();
        let fd = writer.as_raw_fd();

        let receipts = selector
            .submit(&[Change::add(fd, Filter::Writable, Token(3))])
            .unwrap();
        assert!(receipts[0].is_ok());

        // A pipe write end never becomes readable, but the registration
        // itself must succeed via EPOLL_CTL_MOD.
        let receipts = selector
            .submit(&[Change::add(fd, Filter::Readable, Token(3))])
            .unwrap();
        assert!(receipts[0].is_ok());

        let receipts = selector
            .submit(&[
                Change::delete(fd, Filter::Readable, Token(3)),
                Change::delete(fd, Filter::Writable, Token(3)),
            ])
            .unwrap();
        assert!(receipts.iter().all(|receipt| receipt.is_ok()));
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
