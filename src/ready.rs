use std::{fmt, ops};

/// A set of readiness flags.
///
/// `Ready` describes what an I/O handle is ready for: reading, writing,
/// or neither because the peer went away (`closed`) or the registration
/// itself failed (`error`). Values combine with the bitwise operators.
///
/// # Examples
///
/// ```
/// use kestrel_io::Ready;
///
/// let ready = Ready::readable() | Ready::writable();
///
/// assert!(ready.is_readable());
/// assert!(ready.is_writable());
/// ```
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct Ready(usize);

const READABLE: usize = 0b0001;
const WRITABLE: usize = 0b0010;
const CLOSED: usize   = 0b0100;
const ERROR: usize    = 0b1000;
const READY_ALL: usize = READABLE | WRITABLE | CLOSED | ERROR;

impl Ready {
    /// Returns the empty `Ready` set.
    pub fn empty() -> Ready {
        Ready(0)
    }

    /// Readiness to perform a `read` without blocking.
    #[inline]
    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    /// Readiness to perform a `write` without blocking.
    #[inline]
    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    /// The peer closed its end; end-of-file was observed.
    ///
    /// May arrive combined with [`readable`]: a closed stream can still
    /// have buffered data to drain.
    ///
    /// [`readable`]: #method.readable
    #[inline]
    pub fn closed() -> Ready {
        Ready(CLOSED)
    }

    /// The subscription failed; no events will be delivered for the
    /// handle until it is subscribed again.
    #[inline]
    pub fn error() -> Ready {
        Ready(ERROR)
    }

    /// Returns true if `Ready` is the empty set.
    #[inline]
    pub fn is_empty(&self) -> bool {
        *self == Ready::empty()
    }

    /// Returns true if the value includes readable readiness.
    #[inline]
    pub fn is_readable(&self) -> bool {
        self.contains(Ready::readable())
    }

    /// Returns true if the value includes writable readiness.
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.contains(Ready::writable())
    }

    /// Returns true if the value includes end-of-file readiness.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.contains(Ready(CLOSED))
    }

    /// Returns true if the value carries the error flag.
    #[inline]
    pub fn is_error(&self) -> bool {
        self.contains(Ready(ERROR))
    }

    /// Adds all readiness represented by `other` into `self`.
    #[inline]
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    /// Removes all flags represented by `other` from `self`.
    #[inline]
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    /// Returns true if `self` is a superset of `other`.
    #[inline]
    pub fn contains(&self, other: Ready) -> bool {
        (*self & other) == other
    }

    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    #[inline]
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    #[inline]
    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Ready;

    #[inline]
    fn sub(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl ops::Not for Ready {
    type Output = Ready;

    #[inline]
    fn not(self) -> Ready {
        Ready(!self.0 & READY_ALL)
    }
}

impl From<usize> for Ready {
    fn from(ready: usize) -> Ready {
        Ready(ready & READY_ALL)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ready::readable(), "Readable"),
            (Ready::writable(), "Writable"),
            (Ready(CLOSED), "Closed"),
            (Ready(ERROR), "Error")];

        write!(fmt, "Ready {{")?;

        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one { write!(fmt, " | ")? }
                write!(fmt, "{}", msg)?;

                one = true
            }
        }

        write!(fmt, "}}")?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::Ready;

    #[test]
    fn combine_and_test() {
        let ready = Ready::readable() | Ready::closed();

        assert!(ready.is_readable());
        assert!(ready.is_closed());
        assert!(!ready.is_writable());
        assert!(!ready.is_error());
    }

    #[test]
    fn insert_remove() {
        let mut ready = Ready::empty();
        assert!(ready.is_empty());

        ready.insert(Ready::writable());
        assert!(ready.is_writable());

        ready.remove(Ready::writable());
        assert!(ready.is_empty());
    }

    #[test]
    fn contains_superset() {
        let both = Ready::readable() | Ready::writable();

        assert!(both.contains(Ready::readable()));
        assert!(both.contains(both));
        assert!(!Ready::readable().contains(both));
    }
}
