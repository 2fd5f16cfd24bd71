use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::sys::{self, FileDesc};

/// Self-signal pipe.
///
/// The read end is registered on the multiplexer under a reserved
/// token; writing one byte from any thread wakes the event thread.
/// Multiple writes coalesce into at least one wake, and the event
/// thread drains whatever accumulated.
#[derive(Debug)]
pub struct Awakener {
    reader: FileDesc,
    writer: FileDesc,
}

impl Awakener {
    pub fn new() -> io::Result<Awakener> {
        let (reader, writer) = sys::pipe()?;

        Ok(Awakener { reader, writer })
    }

    /// Wakes the event thread. A full pipe counts as success: the
    /// queued bytes already guarantee a wake.
    pub fn wake(&self) -> io::Result<()> {
        match (&self.writer).write(&[1]) {
            Ok(_) => Ok(()),
            Err(err) => {
                if err.kind() == io::ErrorKind::WouldBlock {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Consumes pending signal bytes until the pipe is empty.
    pub fn drain(&self) {
        let mut buf = [0; 128];

        loop {
            match (&self.reader).read(&mut buf) {
                Ok(n) if n > 0 => {}
                _ => return,
            }
        }
    }

    pub fn reader_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}
