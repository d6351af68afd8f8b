//! Full-buffer I/O: `read_all`/`write_all` on non-blocking fds.
//!
//! Loops `read`/`write`, treating `EINTR` as retry and `EAGAIN` as "wait
//! for readiness and retry". A zero-byte read with bytes still wanted
//! signals peer close and is reported as a transport error. Not
//! thread-safe; callers must serialize use per fd, same as the original.

use crate::error::{PtyfwdError, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{read, write};
use std::os::fd::{BorrowedFd, RawFd};

fn wait_ready(fd: RawFd, for_write: bool) -> Result<()> {
    let flag = if for_write {
        PollFlags::POLLOUT
    } else {
        PollFlags::POLLIN
    };
    loop {
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, flag)];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(PtyfwdError::Errno(e)),
        }
    }
}

/// Read exactly `buf.len()` bytes, or fail. `buf` must not be empty —
/// callers check for "nothing to read" before calling this, same as the
/// original's `assert(len)`.
pub fn read_all(fd: RawFd, buf: &mut [u8]) -> Result<()> {
    debug_assert!(!buf.is_empty());
    let mut done = 0;
    while done < buf.len() {
        match read(fd, &mut buf[done..]) {
            Ok(0) => {
                return Err(PtyfwdError::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed connection mid-frame",
                )))
            }
            Ok(n) => done += n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => wait_ready(fd, false)?,
            Err(e) => return Err(PtyfwdError::Errno(e)),
        }
    }
    Ok(())
}

/// Write the entire buffer, or fail.
pub fn write_all(fd: RawFd, buf: &[u8]) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let mut done = 0;
    while done < buf.len() {
        match write(unsafe { BorrowedFd::borrow_raw(fd) }, &buf[done..]) {
            Ok(0) => {
                return Err(PtyfwdError::Transport(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "write returned 0 bytes",
                )))
            }
            Ok(n) => done += n,
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => wait_ready(fd, true)?,
            Err(e) => return Err(PtyfwdError::Errno(e)),
        }
    }
    Ok(())
}

/// Non-blocking read that returns `Ok(None)` on EAGAIN instead of
/// waiting — used by the server/client main loops after a readiness
/// primitive has already reported the fd as readable.
pub fn try_read(fd: RawFd, buf: &mut [u8]) -> Result<Option<usize>> {
    loop {
        match read(fd, buf) {
            Ok(n) => return Ok(Some(n)),
            Err(Errno::EINTR) => continue,
            Err(Errno::EAGAIN) => return Ok(None),
            Err(e) => return Err(PtyfwdError::Errno(e)),
        }
    }
}

pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(PtyfwdError::Errno)?;
    let new_flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(new_flags)).map_err(PtyfwdError::Errno)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use std::os::fd::IntoRawFd;

    #[test]
    fn read_all_write_all_round_trip() {
        let (r, w) = pipe().unwrap();
        let rfd = r.into_raw_fd();
        let wfd = w.into_raw_fd();
        set_nonblocking(rfd).unwrap();
        set_nonblocking(wfd).unwrap();

        write_all(wfd, b"hello world").unwrap();
        let mut buf = [0u8; 11];
        read_all(rfd, &mut buf).unwrap();
        assert_eq!(&buf, b"hello world");

        nix::unistd::close(rfd).ok();
        nix::unistd::close(wfd).ok();
    }

    #[test]
    fn read_all_reports_eof_as_transport_error() {
        let (r, w) = pipe().unwrap();
        let rfd = r.into_raw_fd();
        let wfd = w.into_raw_fd();
        set_nonblocking(rfd).unwrap();
        nix::unistd::close(wfd).ok();

        let mut buf = [0u8; 4];
        let err = read_all(rfd, &mut buf).unwrap_err();
        assert!(matches!(err, PtyfwdError::Transport(_)));
        nix::unistd::close(rfd).ok();
    }
}
