//! Readiness primitive: wait for any of up to 8 FDs to be
//! read/write-ready.
//!
//! A proxy main loop typically builds a fresh `Vec<PollFd>` out of raw
//! fds every iteration (nix 0.29's `PollFd<'fd>` borrows its fd, so it
//! can't be cached across iterations without unsafe raw-fd re-borrowing
//! anyway). This wraps that same pattern behind an `init`/`change`/`wait`
//! surface, backed solely by `poll(2)` — the portable fallback and the
//! only backend this crate needs.

use crate::error::{PtyfwdError, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::os::fd::{BorrowedFd, RawFd};

pub const MAX_FDS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Read,
    Write,
    ReadWrite,
}

impl Mode {
    fn flags(self) -> PollFlags {
        match self {
            Mode::Read => PollFlags::POLLIN,
            Mode::Write => PollFlags::POLLOUT,
            Mode::ReadWrite => PollFlags::POLLIN | PollFlags::POLLOUT,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Watch {
    fd: RawFd,
    mode: Mode,
    active: bool,
}

/// A uniform "wait for any of N FDs" instance, capped at [`MAX_FDS`].
pub struct Readiness {
    watches: Vec<Watch>,
}

impl Readiness {
    pub fn init(list: &[(RawFd, Mode)]) -> Result<Self> {
        if list.len() > MAX_FDS {
            return Err(PtyfwdError::Resource(format!(
                "readiness primitive supports at most {MAX_FDS} fds, got {}",
                list.len()
            )));
        }
        let watches = list
            .iter()
            .map(|&(fd, mode)| Watch {
                fd,
                mode,
                active: true,
            })
            .collect();
        Ok(Readiness { watches })
    }

    pub fn resize(&mut self, list: &[(RawFd, Mode)]) -> Result<()> {
        *self = Readiness::init(list)?;
        Ok(())
    }

    /// Replace or add the watch at `index`. Growing past the current
    /// length is allowed up to `MAX_FDS`.
    pub fn change(&mut self, index: usize, fd: RawFd, mode: Mode) -> Result<()> {
        if index >= MAX_FDS {
            return Err(PtyfwdError::Resource(format!(
                "index {index} exceeds readiness primitive capacity {MAX_FDS}"
            )));
        }
        while self.watches.len() <= index {
            self.watches.push(Watch {
                fd: -1,
                mode: Mode::Read,
                active: false,
            });
        }
        self.watches[index] = Watch { fd, mode, active: true };
        Ok(())
    }

    /// Mark a watch inactive without shifting indices (used when a slot
    /// becomes "no current fd", e.g. a detached client).
    pub fn deactivate(&mut self, index: usize) {
        if let Some(w) = self.watches.get_mut(index) {
            w.active = false;
        }
    }

    /// Wait indefinitely until at least one watched fd is ready, or an
    /// interrupted/partial result occurs (tolerated: caller gets an empty
    /// list and loops again).
    pub fn wait(&self) -> Result<Vec<RawFd>> {
        let active: Vec<&Watch> = self.watches.iter().filter(|w| w.active && w.fd >= 0).collect();
        if active.is_empty() {
            return Ok(Vec::new());
        }

        let mut poll_fds: Vec<PollFd> = active
            .iter()
            .map(|w| PollFd::new(unsafe { BorrowedFd::borrow_raw(w.fd) }, w.mode.flags()))
            .collect();

        match poll(&mut poll_fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(PtyfwdError::Errno(e)),
        }

        let mut ready = Vec::new();
        for (w, pfd) in active.iter().zip(poll_fds.iter()) {
            if let Some(revents) = pfd.revents() {
                if revents.intersects(
                    PollFlags::POLLIN
                        | PollFlags::POLLOUT
                        | PollFlags::POLLHUP
                        | PollFlags::POLLERR,
                ) {
                    ready.push(w.fd);
                }
            }
        }
        Ok(ready)
    }

    pub fn destroy(self) {
        // poll(2) holds no persistent kernel-side registration to tear down.
    }
}
