use std::io;
use std::os::unix::io::FromRawFd;

macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)* )) => {{
        let res = unsafe { libc::$fn($($arg,)*) };
        if res < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

mod fd;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
mod kqueue;

pub use fd::FileDesc;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use epoll::Selector;

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub use kqueue::Selector;

/// Creates a non-blocking, close-on-exec pipe.
pub fn pipe() -> io::Result<(FileDesc, FileDesc)> {
    let mut fds: [libc::c_int; 2] = [-1; 2];

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        syscall!(pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
    }

    // No pipe2 on Darwin: open, then set the flags on each end.
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        syscall!(pipe(fds.as_mut_ptr()))?;

        for &fd in fds.iter() {
            if let Err(err) = syscall!(fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK))
                .and_then(|_| syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC)))
            {
                unsafe {
                    libc::close(fds[0]);
                    libc::close(fds[1]);
                }
                return Err(err);
            }
        }
    }

    let reader = unsafe { FileDesc::from_raw_fd(fds[0]) };
    let writer = unsafe { FileDesc::from_raw_fd(fds[1]) };

    Ok((reader, writer))
}
