use std::{fmt, ops};

/// A set of readiness operations, doubling as the per-connection interest
/// mask.
///
/// `readable` and `writable` map to the kernel event mask. `error` and
/// `hup` are hints reported by the kernel but never requested. The two
/// sentinel bits are user-space only: `register` marks a connection whose
/// registration has not been executed yet, and `callback` marks an
/// interest posted on behalf of a blocked helper waiting on a latch
/// rather than a worker dispatch.
///
/// `Ready` values can be combined using the bitwise operators.
///
/// ```
/// use hive_io::Ready;
///
/// let ready = Ready::readable() | Ready::writable();
///
/// assert!(ready.is_readable());
/// assert!(ready.is_writable());
/// ```
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord)]
pub struct Ready(usize);

const READABLE: usize = 0b0000_0001;
const WRITABLE: usize = 0b0000_0010;
const ERROR: usize = 0b0000_0100;
const HUP: usize = 0b0000_1000;
const REGISTER: usize = 0b0001_0000;
const CALLBACK: usize = 0b0010_0000;

impl Ready {
    pub fn empty() -> Ready {
        Ready(0)
    }

    #[inline]
    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    #[inline]
    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    #[inline]
    pub fn error() -> Ready {
        Ready(ERROR)
    }

    #[inline]
    pub fn hup() -> Ready {
        Ready(HUP)
    }

    /// Sentinel: registration pending, not yet executed by the poller.
    #[inline]
    pub fn register() -> Ready {
        Ready(REGISTER)
    }

    /// Sentinel: readiness should count down a latch instead of
    /// dispatching a worker.
    #[inline]
    pub fn callback() -> Ready {
        Ready(CALLBACK)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.contains(Ready::readable())
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.contains(Ready::writable())
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.contains(Ready::error())
    }

    #[inline]
    pub fn is_hup(&self) -> bool {
        self.contains(Ready::hup())
    }

    #[inline]
    pub fn is_register(&self) -> bool {
        self.contains(Ready::register())
    }

    #[inline]
    pub fn is_callback(&self) -> bool {
        self.contains(Ready::callback())
    }

    #[inline]
    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }

    #[inline]
    pub fn contains(&self, other: Ready) -> bool {
        (*self & other) == other
    }

    #[inline]
    pub fn intersects(&self, other: Ready) -> bool {
        (self.0 & other.0) != 0
    }

    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }

    #[inline]
    pub fn from_usize(val: usize) -> Ready {
        Ready(val)
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    #[inline]
    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
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
        Ready(!self.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ready::readable(), "Readable"),
            (Ready::writable(), "Writable"),
            (Ready::error(), "Error"),
            (Ready::hup(), "Hup"),
            (Ready::register(), "Register"),
            (Ready::callback(), "Callback"),
        ];

        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;

                one = true
            }
        }

        if !one {
            fmt.write_str("(empty)")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::Ready;

    #[test]
    fn bit_ops() {
        let mut ops = Ready::readable() | Ready::writable();
        assert!(ops.is_readable());
        assert!(ops.is_writable());
        assert!(ops.intersects(Ready::readable()));
        assert!(!ops.contains(Ready::readable() | Ready::callback()));

        ops.remove(Ready::readable());
        assert!(!ops.is_readable());
        assert_eq!(ops, Ready::writable());

        ops.insert(Ready::callback());
        assert!(ops.is_callback());
        assert_eq!(ops - Ready::callback(), Ready::writable());
    }

    #[test]
    fn sentinels_do_not_overlap_kernel_bits() {
        let kernel = Ready::readable() | Ready::writable() | Ready::error() | Ready::hup();
        assert!(!kernel.intersects(Ready::register() | Ready::callback()));
    }
}
