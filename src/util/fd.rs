use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// True when `fd` names an open descriptor in this process.
pub fn fd_is_valid(fd: RawFd) -> bool {
    fd >= 0 && unsafe { libc::fcntl(fd, libc::F_GETFD) } != -1
}

/// Pending socket error (`SO_ERROR`), if any.
pub fn socket_error(fd: RawFd) -> Option<i32> {
    let mut err_code: i32 = 0;
    let mut err_len: libc::socklen_t = std::mem::size_of::<i32>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err_code as *mut _ as *mut libc::c_void,
            &mut err_len,
        )
    };
    if rc != 0 {
        return io::Error::last_os_error().raw_os_error();
    }
    (err_code != 0).then_some(err_code)
}

/// Nonblocking eventfd used as a wakeup doorbell.
#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    pub fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Bump the counter so a poller on this fd becomes readable.
    pub fn notify(&self) -> io::Result<()> {
        let kick: u64 = 1;
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &kick as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            // counter saturated: the reader has not caught up but is already due to wake
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    /// Reset the counter. Returns how many notifications were pending.
    pub fn clear(&self) -> io::Result<u64> {
        let mut buf: u64 = 0;
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut buf as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(buf)
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
