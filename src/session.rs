//! Session registry and handoff channel.
//!
//! Lives only in the supervisor: the registry is touched only from the
//! supervisor process, never the worker. A `Session` is created when
//! a client requests a new persistent connection and is destroyed when
//! its worker exits or is deliberately dropped on error.

use crate::error::{PtyfwdError, Result};
use nix::sys::socket::{
    self, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType,
    UnixAddr,
};
use nix::unistd::Pid;
use rand::RngCore;
use std::collections::HashMap;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

pub const INVALID_SESSION_ID: u64 = 0;
pub const MAX_SESSIONS: usize = 64;

/// One endpoint of a connected, FD-passing-capable datagram socket pair.
/// Endpoint 0 is held by the supervisor, endpoint 1 by the worker.
pub struct HandoffPair {
    pub supervisor_end: OwnedFd,
    pub worker_end: OwnedFd,
}

pub fn new_handoff_pair() -> Result<HandoffPair> {
    let (a, b) = socket::socketpair(
        AddressFamily::Unix,
        SockType::Datagram,
        None,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
    )
    .map_err(PtyfwdError::Errno)?;
    Ok(HandoffPair {
        supervisor_end: a,
        worker_end: b,
    })
}

/// Send `fd_to_pass` over `endpoint` as ancillary data, with a single
/// dummy payload byte (datagram sockets can't carry a zero-length
/// message with ancillary data reliably across all platforms).
pub fn send_fd(endpoint: RawFd, fd_to_pass: RawFd) -> Result<()> {
    let iov = [IoSlice::new(&[0u8])];
    let fds = [fd_to_pass];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    socket::sendmsg::<UnixAddr>(endpoint, &iov, &cmsg, MsgFlags::empty(), None)
        .map_err(PtyfwdError::Errno)?;
    Ok(())
}

/// Receive one passed fd from `endpoint`. Returns `Ok(None)` if the
/// endpoint is non-blocking and nothing is pending yet.
pub fn recv_fd(endpoint: RawFd) -> Result<Option<OwnedFd>> {
    let mut dummy = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut dummy)];
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 1]);

    let msg = match socket::recvmsg::<UnixAddr>(endpoint, &mut iov, Some(&mut cmsg_buf), MsgFlags::empty())
    {
        Ok(msg) => msg,
        Err(nix::errno::Errno::EAGAIN) => return Ok(None),
        Err(e) => return Err(PtyfwdError::Errno(e)),
    };

    for cmsg in msg.cmsgs().map_err(PtyfwdError::Errno)? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(&fd) = fds.first() {
                // Safety: `fd` came straight out of recvmsg's ScmRights
                // and is not owned by anything else yet.
                return Ok(Some(unsafe { std::os::fd::FromRawFd::from_raw_fd(fd) }));
            }
        }
    }
    Ok(None)
}

#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub child_pid: Pid,
    pub handoff: RawFd, // supervisor's endpoint 0 for this session
}

#[derive(Default)]
pub struct SessionRegistry {
    by_id: HashMap<u64, Session>,
    pid_to_id: HashMap<Pid, u64>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh nonzero id absent from the registry, reserving it
    /// with a placeholder `child_pid`; callers fill in the real pid and
    /// handoff fd once the fork succeeds via [`SessionRegistry::finalize`].
    pub fn reserve(&mut self) -> Result<u64> {
        if self.by_id.len() >= MAX_SESSIONS {
            return Err(PtyfwdError::Resource(format!(
                "session registry at capacity ({MAX_SESSIONS})"
            )));
        }
        let mut rng = rand::thread_rng();
        loop {
            let id = rng.next_u64();
            if id != INVALID_SESSION_ID && !self.by_id.contains_key(&id) {
                return Ok(id);
            }
        }
    }

    pub fn insert(&mut self, id: u64, child_pid: Pid, handoff: RawFd) {
        self.pid_to_id.insert(child_pid, id);
        self.by_id.insert(
            id,
            Session {
                id,
                child_pid,
                handoff,
            },
        );
    }

    pub fn get(&self, id: u64) -> Option<&Session> {
        self.by_id.get(&id)
    }

    pub fn get_by_pid(&self, pid: Pid) -> Option<&Session> {
        self.pid_to_id.get(&pid).and_then(|id| self.by_id.get(id))
    }

    /// Remove a session, closing its supervisor-side handoff endpoint.
    pub fn delete(&mut self, id: u64) {
        if let Some(session) = self.by_id.remove(&id) {
            self.pid_to_id.remove(&session.child_pid);
            let _ = nix::unistd::close(session.handoff);
        }
    }

    pub fn delete_by_pid(&mut self, pid: Pid) {
        if let Some(&id) = self.pid_to_id.get(&pid) {
            self.delete(id);
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_never_returns_zero_and_is_fresh() {
        let mut reg = SessionRegistry::new();
        let id = reg.reserve().unwrap();
        assert_ne!(id, INVALID_SESSION_ID);
        reg.insert(id, Pid::from_raw(1234), 3);
        let id2 = reg.reserve().unwrap();
        assert_ne!(id, id2);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut reg = SessionRegistry::new();
        for i in 0..MAX_SESSIONS {
            let id = reg.reserve().unwrap();
            reg.insert(id, Pid::from_raw(1000 + i as i32), 3);
        }
        assert!(reg.reserve().is_err());
    }

    #[test]
    fn delete_removes_both_mappings() {
        let pair = new_handoff_pair().unwrap();
        let fd = pair.supervisor_end.as_raw_fd();
        // Leak the fd deliberately: delete() closes it, so we must not
        // also drop `pair.supervisor_end` and double-close.
        std::mem::forget(pair.supervisor_end);

        let mut reg = SessionRegistry::new();
        let id = reg.reserve().unwrap();
        let pid = Pid::from_raw(42);
        reg.insert(id, pid, fd);

        assert!(reg.get(id).is_some());
        assert!(reg.get_by_pid(pid).is_some());

        reg.delete(id);
        assert!(reg.get(id).is_none());
        assert!(reg.get_by_pid(pid).is_none());
    }

    #[test]
    fn fd_passing_round_trip() {
        let pair = new_handoff_pair().unwrap();
        let (r, w) = nix::unistd::pipe().unwrap();
        use std::os::fd::IntoRawFd;
        let rfd = r.into_raw_fd();

        send_fd(pair.supervisor_end.as_raw_fd(), rfd).unwrap();
        nix::unistd::close(rfd).ok();

        // give the kernel a moment; AF_UNIX SOCK_DGRAM delivery is local
        // and synchronous enough not to need this in practice, but poll
        // defensively since the fd is non-blocking.
        let received = loop {
            match recv_fd(pair.worker_end.as_raw_fd()) {
                Ok(Some(fd)) => break fd,
                Ok(None) => continue,
                Err(e) => panic!("recv_fd failed: {e}"),
            }
        };
        assert!(received.as_raw_fd() >= 0);
        nix::unistd::close(w.into_raw_fd()).ok();
    }
}
