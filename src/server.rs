//! Server supervisor & worker.
//!
//! The supervisor accepts connections and, per connection, forks a
//! worker that owns one PTY pair, one launched child, and the current
//! client fd. Workers never touch the session registry; the supervisor
//! never touches PTY descriptors.

use crate::error::{PtyfwdError, Result};
use crate::proto::{self, DataType, MAX_PAYLOAD};
use crate::readiness::{Mode, Readiness};
use crate::session::{self, SessionRegistry};
use crate::transport::{self, Listeners};
use crate::{ioutil, negotiate, pty};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup2, execvp, fork, setsid, ForkResult, Pid};
use std::collections::VecDeque;
use std::ffi::CString;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

const REPLAY_CAP: usize = 1024 * 1024;
const READ_CHUNK: usize = 8192;

static SOME_CHILD_EXITED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_sigchld(_sig: i32) {
    SOME_CHILD_EXITED.store(true, Ordering::Relaxed);
}

#[derive(Clone)]
pub struct ServerConfig {
    pub launch_argv: String,
    pub cookie: Option<Vec<u8>>,
    pub persistent: bool,
}

/// The supervisor loop: listen, accept, negotiate, dispatch to a worker.
/// Returns only on a fatal-setup error; per-connection failures are
/// logged and the connection dropped.
pub fn run_server(listeners: Listeners, cfg: ServerConfig) -> Result<()> {
    for fd in &listeners.fds {
        transport::listen(fd.as_raw_fd())?;
    }

    if cfg.persistent {
        unsafe {
            signal::signal(Signal::SIGCHLD, SigHandler::Handler(handle_sigchld))
                .map_err(|e| PtyfwdError::FatalSetup(format!("installing SIGCHLD handler: {e}")))?;
        }
    }

    let mut registry = SessionRegistry::new();

    let watch_list: Vec<(RawFd, Mode)> = listeners.fds.iter().map(|f| (f.as_raw_fd(), Mode::Read)).collect();
    let readiness = Readiness::init(&watch_list)?;

    loop {
        if cfg.persistent && SOME_CHILD_EXITED.swap(false, Ordering::Relaxed) {
            reap_exited_workers(&mut registry);
        }

        let ready = readiness.wait()?;
        for listen_fd in ready {
            match transport::accept(listen_fd) {
                Ok(client_fd) => {
                    if let Err(e) = handle_new_connection(client_fd, &cfg, &mut registry) {
                        tracing::warn!("connection dropped: {e}");
                    }
                }
                Err(e) => tracing::warn!("accept error: {e}"),
            }
        }
    }
}

fn reap_exited_workers(registry: &mut SessionRegistry) {
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                registry.delete_by_pid(pid);
            }
            Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => break,
            Ok(_) => continue,
            Err(_) => break,
        }
    }
}

fn handle_new_connection(client_fd: OwnedFd, cfg: &ServerConfig, registry: &mut SessionRegistry) -> Result<()> {
    let fd = client_fd.as_raw_fd();

    negotiate::server_preamble(fd)?;
    negotiate::server_auth(fd, cfg.cookie.as_deref())?;

    let requested = negotiate::read_sessid(fd)?;

    match requested {
        None => new_session(client_fd, cfg, registry),
        Some(id) if id != session::INVALID_SESSION_ID => resume_session(client_fd, id, registry),
        Some(_) => {
            // An explicit SESSID payload of the reserved-invalid value is a
            // malformed resume request, not "no session requested" — S5.
            proto::write_frame(client_fd.as_raw_fd(), DataType::Close, &[]).ok();
            Err(PtyfwdError::Parse("resume requested with invalid session id 0".into()))
        }
    }
}

fn resume_session(client_fd: OwnedFd, id: u64, registry: &mut SessionRegistry) -> Result<()> {
    let Some(existing) = registry.get(id) else {
        proto::write_frame(client_fd.as_raw_fd(), DataType::Close, &[]).ok();
        return Err(PtyfwdError::Parse(format!("resume requested for unknown session {id}")));
    };

    session::send_fd(existing.handoff, client_fd.as_raw_fd())?;
    // client_fd drops here, closing the supervisor's copy; the worker now
    // holds the only remaining reference via the fd it just received.
    Ok(())
}

fn new_session(client_fd: OwnedFd, cfg: &ServerConfig, registry: &mut SessionRegistry) -> Result<()> {
    if cfg.persistent {
        let id = registry.reserve()?;
        let pair = session::new_handoff_pair()?;

        match unsafe { fork() }.map_err(PtyfwdError::Errno)? {
            ForkResult::Parent { child } => {
                drop(client_fd);
                drop(pair.worker_end);
                registry.insert(id, child, pair.supervisor_end.into_raw_fd());
                Ok(())
            }
            ForkResult::Child => {
                drop(pair.supervisor_end);
                let worker_cfg = WorkerConfig {
                    launch_argv: cfg.launch_argv.clone(),
                    session_id: Some(id),
                    handoff: Some(pair.worker_end.into_raw_fd()),
                };
                worker_main(client_fd.into_raw_fd(), worker_cfg);
                unreachable!("worker_main exits the process");
            }
        }
    } else {
        match unsafe { fork() }.map_err(PtyfwdError::Errno)? {
            ForkResult::Parent { child } => {
                drop(client_fd);
                waitpid(child, None).ok();
                Ok(())
            }
            ForkResult::Child => match unsafe { fork() }.map_err(PtyfwdError::Errno)? {
                ForkResult::Parent { .. } => std::process::exit(0),
                ForkResult::Child => {
                    let worker_cfg = WorkerConfig {
                        launch_argv: cfg.launch_argv.clone(),
                        session_id: None,
                        handoff: None,
                    };
                    worker_main(client_fd.into_raw_fd(), worker_cfg);
                    unreachable!("worker_main exits the process");
                }
            },
        }
    }
}

struct WorkerConfig {
    launch_argv: String,
    session_id: Option<u64>,
    handoff: Option<RawFd>,
}

struct WorkerState {
    active_client: Option<RawFd>,
    pending_client: Option<RawFd>,
    ptym: RawFd,
    handoff: Option<RawFd>,
    stop: bool,
    /// Set only by the client-FD-lost routine's non-persistent, no-pending
    /// branch: the worker must exit 1, not report the launched program's
    /// exit status as its own.
    errored: bool,
    replay: VecDeque<u8>,
    persistent: bool,
}

/// Runs the worker process to completion and exits. Never returns.
fn worker_main(client_fd: RawFd, cfg: WorkerConfig) -> ! {
    // The supervisor's SIGCHLD handler has no meaning here; reset to
    // default so the worker's own waitpid isn't confused by it.
    unsafe {
        signal::signal(Signal::SIGCHLD, SigHandler::SigDfl).ok();
    }

    // Per spec.md §4.5 "New path": the worker writes the session id back
    // to the client, *then* enters worker initialization (PTY setup).
    if let Err(e) = negotiate::write_sessid(client_fd, cfg.session_id) {
        tracing::warn!("worker: failed to send session id to client: {e}");
    }

    let pair = match pty::open_pair() {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("worker: PTY setup failed: {e}");
            proto::write_frame(client_fd, DataType::Close, &[]).ok();
            std::process::exit(1);
        }
    };

    let master_fd = pair.master.as_raw_fd();
    let slave_fd = pair.slave.as_raw_fd();

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            drop(pair.master);
            close(client_fd).ok();
            if let Some(h) = cfg.handoff {
                close(h).ok();
            }
            exec_shell(slave_fd, &cfg.launch_argv);
            // exec_shell never returns on success.
            std::process::exit(1);
        }
        Ok(ForkResult::Parent { child }) => {
            drop(pair.slave);
            let errored = run_worker_loop(client_fd, master_fd, cfg.handoff, cfg.session_id.is_some());
            if errored {
                std::process::exit(1);
            }
            reap_and_exit(child);
        }
        Err(e) => {
            tracing::error!("worker: fork for shell failed: {e}");
            proto::write_frame(client_fd, DataType::Close, &[]).ok();
            std::process::exit(1);
        }
    }
}

fn exec_shell(slave_fd: RawFd, launch_argv: &str) -> ! {
    setsid().ok();
    unsafe {
        nix::libc::ioctl(slave_fd, nix::libc::TIOCSCTTY as _, 0);
    }
    nix::unistd::tcsetpgrp(unsafe { std::os::fd::BorrowedFd::borrow_raw(slave_fd) }, nix::unistd::getpid()).ok();

    for stdio_fd in 0..=2 {
        if dup2(slave_fd, stdio_fd).is_err() {
            std::process::exit(1);
        }
    }
    if slave_fd > 2 {
        close(slave_fd).ok();
    }

    let Ok(prog) = CString::new(launch_argv) else {
        std::process::exit(1);
    };
    let args = [prog.clone()];
    let _ = execvp(&prog, &args);
    std::process::exit(1);
}

fn reap_and_exit(child: Pid) -> ! {
    let code = match waitpid(child, None) {
        Ok(WaitStatus::Exited(_, code)) => code,
        Ok(WaitStatus::Signaled(_, sig, _)) => 128 + sig as i32,
        _ => 1,
    };
    std::process::exit(code);
}

/// Runs the worker's multiplex loop to completion. Returns `true` if the
/// loop stopped because of an unrecoverable error (non-persistent worker
/// that lost its only client), in which case the caller must exit 1
/// instead of reporting the launched program's exit status.
fn run_worker_loop(client_fd: RawFd, master_fd: RawFd, handoff: Option<RawFd>, persistent: bool) -> bool {
    let mut state = WorkerState {
        active_client: Some(client_fd),
        pending_client: None,
        ptym: master_fd,
        handoff,
        stop: false,
        errored: false,
        replay: VecDeque::with_capacity(READ_CHUNK),
        persistent,
    };

    let mut readiness = match build_readiness(&state) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("worker: readiness init failed: {e}");
            return true;
        }
    };

    while !state.stop {
        refresh_readiness(&mut readiness, &state);

        let ready = match readiness.wait() {
            Ok(r) => r,
            Err(e) => {
                tracing::error!("worker: readiness wait failed: {e}");
                state.errored = true;
                break;
            }
        };

        for fd in ready {
            if Some(fd) == state.active_client {
                handle_client_readable(&mut state);
            } else if fd == state.ptym {
                handle_pty_readable(&mut state);
            } else if Some(fd) == state.handoff {
                handle_handoff_readable(&mut state);
            }
        }
    }

    if let Some(fd) = state.active_client {
        proto::write_frame(fd, DataType::Close, &[]).ok();
    }
    if let Some(fd) = state.active_client {
        close(fd).ok();
    }
    if let Some(fd) = state.pending_client {
        close(fd).ok();
    }
    if let Some(fd) = state.handoff {
        close(fd).ok();
    }
    close(state.ptym).ok();

    state.errored
}

fn watch_list(state: &WorkerState) -> Vec<(RawFd, Mode)> {
    let mut list = Vec::with_capacity(3);
    if let Some(fd) = state.active_client {
        list.push((fd, Mode::Read));
    }
    if state.replay.len() < REPLAY_CAP {
        list.push((state.ptym, Mode::Read));
    }
    if let Some(fd) = state.handoff {
        list.push((fd, Mode::Read));
    }
    list
}

fn build_readiness(state: &WorkerState) -> Result<Readiness> {
    Readiness::init(&watch_list(state))
}

fn refresh_readiness(readiness: &mut Readiness, state: &WorkerState) {
    // Rebuilding from scratch each iteration keeps the "only poll the PTY
    // when the replay buffer has room" back-pressure rule trivially
    // correct, at the cost of a small per-iteration allocation.
    if let Ok(fresh) = build_readiness(state) {
        *readiness = fresh;
    }
}

fn handle_client_readable(state: &mut WorkerState) {
    let Some(fd) = state.active_client else { return };
    match proto::read_frame(fd) {
        Ok(frame) => match frame.tag {
            DataType::Regular => {
                if ioutil::write_all(state.ptym, &frame.payload).is_err() {
                    state.stop = true;
                }
            }
            DataType::Winch => match proto::WinchData::decode(&frame.payload) {
                Ok(winch) => pty::set_size(state.ptym, winch.rows, winch.cols),
                Err(e) => tracing::warn!("worker: bad WINCH payload: {e}"),
            },
            DataType::Close => state.stop = true,
            DataType::None => {}
            other => tracing::warn!("worker: unexpected frame {other:?} from client, ignoring"),
        },
        Err(_) => client_fd_lost(state),
    }
}

fn handle_pty_readable(state: &mut WorkerState) {
    let remaining = REPLAY_CAP - state.replay.len();
    if remaining == 0 {
        return;
    }
    let to_read = remaining.min(READ_CHUNK);
    let mut buf = vec![0u8; to_read];

    match ioutil::try_read(state.ptym, &mut buf) {
        Ok(Some(0)) => state.stop = true,
        Ok(Some(n)) => {
            state.replay.extend(&buf[..n]);
            drain_to_client(state);
        }
        Ok(None) => {}
        Err(_) => state.stop = true,
    }
}

fn drain_to_client(state: &mut WorkerState) {
    loop {
        let Some(fd) = state.active_client else { return };
        if state.replay.is_empty() {
            return;
        }
        let chunk_len = state.replay.len().min(MAX_PAYLOAD);
        let chunk: Vec<u8> = state.replay.iter().take(chunk_len).copied().collect();

        match proto::write_frame(fd, DataType::Regular, &chunk) {
            Ok(()) => {
                state.replay.drain(..chunk_len);
            }
            Err(_) => {
                client_fd_lost(state);
                // client_fd_lost may have promoted a pending fd and
                // already attempted a drain; either way, stop looping
                // here to avoid re-entering with a half-consistent state.
                return;
            }
        }
    }
}

fn handle_handoff_readable(state: &mut WorkerState) {
    let Some(handoff) = state.handoff else { return };
    match session::recv_fd(handoff) {
        Ok(Some(owned)) => {
            let raw = owned.into_raw_fd();
            if state.active_client.is_none() {
                state.active_client = Some(raw);
                drain_to_client(state);
            } else if let Some(old_pending) = state.pending_client.replace(raw) {
                close(old_pending).ok();
            }
        }
        Ok(None) => {}
        Err(e) => tracing::warn!("worker: recv_fd failed: {e}"),
    }
}

/// The client-FD-lost routine: promote a pending fd if one exists
/// (recursing at most once more if that also fails to drain), else
/// detach (persistent) or stop (non-persistent).
fn client_fd_lost(state: &mut WorkerState) {
    if let Some(old) = state.active_client.take() {
        close(old).ok();
    }

    if let Some(pending) = state.pending_client.take() {
        state.active_client = Some(pending);
        drain_to_client(state);
    } else if state.persistent {
        state.active_client = None;
    } else {
        state.stop = true;
        state.errored = true;
    }
}
