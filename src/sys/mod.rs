use std::io;

use libc::c_int;

macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

mod epoll;
mod eventfd;
mod fd;
mod socket;

pub use epoll::{Epoll, Event, Events};
pub use eventfd::EventFd;
pub use fd::FileDesc;
pub use socket::Socket;

pub fn cvt(t: c_int) -> io::Result<c_int> {
    if t == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(t)
    }
}
