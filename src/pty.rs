//! PTY master/slave setup, factored out of the worker so both the
//! initialization sequence and the winsize ioctls have one home.
//!
//! Grounded in the original's `server_worker_loop` (`/dev/ptmx` +
//! `grantpt`/`unlockpt`/`ptsname`) and in a `set_pty_size`/
//! `get_terminal_size`-style pair of ioctl wrappers.

use crate::error::{PtyfwdError, Result};
use nix::fcntl::{open, OFlag};
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster};
use nix::sys::stat::Mode;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Open `/dev/ptmx` non-blocking, grant/unlock it, and open its slave
/// side read-write. Mirrors `server.c`'s `server_worker_loop` setup.
pub fn open_pair() -> Result<PtyPair> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)
        .map_err(|e| PtyfwdError::Resource(format!("opening /dev/ptmx: {e}")))?;
    crate::ioutil::set_nonblocking(master.as_raw_fd())?;

    grantpt(&master).map_err(|e| PtyfwdError::Resource(format!("grantpt: {e}")))?;
    unlockpt(&master).map_err(|e| PtyfwdError::Resource(format!("unlockpt: {e}")))?;

    let slave_name = slave_name(&master)?;
    let slave_fd = open(slave_name.as_str(), OFlag::O_RDWR, Mode::empty())
        .map_err(|e| PtyfwdError::Resource(format!("opening {slave_name}: {e}")))?;

    Ok(PtyPair {
        master: owned_from_ptymaster(master),
        slave: unsafe { OwnedFd::from_raw_fd(slave_fd) },
    })
}

#[cfg(target_os = "linux")]
fn slave_name(master: &PtyMaster) -> Result<String> {
    nix::pty::ptsname_r(master).map_err(|e| PtyfwdError::Resource(format!("ptsname: {e}")))
}

#[cfg(not(target_os = "linux"))]
fn slave_name(master: &PtyMaster) -> Result<String> {
    // ptsname_r is a Linux extension; the worker is strictly
    // single-threaded, so the non-reentrant ptsname(3) is safe here.
    let raw = master.as_raw_fd();
    let name = unsafe {
        let ptr = nix::libc::ptsname(raw);
        if ptr.is_null() {
            return Err(PtyfwdError::Resource("ptsname returned NULL".into()));
        }
        std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
    };
    Ok(name)
}

fn owned_from_ptymaster(master: PtyMaster) -> OwnedFd {
    unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) }
}

pub fn set_size(fd: RawFd, rows: u16, cols: u16) {
    let size = nix::libc::winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe {
        nix::libc::ioctl(fd, nix::libc::TIOCSWINSZ, &size);
    }
}

pub fn get_size(fd: RawFd) -> Option<nix::libc::winsize> {
    let mut size: nix::libc::winsize = unsafe { std::mem::zeroed() };
    let ret = unsafe { nix::libc::ioctl(fd, nix::libc::TIOCGWINSZ, &mut size) };
    if ret == 0 {
        Some(size)
    } else {
        None
    }
}
