//! Client driver: raw terminal mode, stdin/transport multiplexing,
//! and session-id-aware reconnection.
//!
//! Grounded in `examples/original_source/client.c`'s `set_tty_raw` (the
//! exact `c_lflag`/`c_iflag`/`c_cflag`/`c_oflag`/`VMIN`/`VTIME` sequence)
//! and in an async-signal-safe atomic-flag handling style for
//! `SIGWINCH`/termination signals.

use crate::error::{PtyfwdError, Result};
use crate::proto::{self, DataType, MAX_PAYLOAD};
use crate::readiness::{Mode, Readiness};
use crate::{ioutil, negotiate, pty};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::termios::{self, LocalFlags, InputFlags, OutputFlags, SetArg, SpecialCharacterIndices, Termios};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

static HALT_REQUESTED: AtomicBool = AtomicBool::new(false);
static WINCH_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_halt_signal(_sig: i32) {
    HALT_REQUESTED.store(true, Ordering::Relaxed);
}

extern "C" fn handle_winch(_sig: i32) {
    WINCH_RECEIVED.store(true, Ordering::Relaxed);
}

const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

pub struct ClientConfig {
    pub cookie: Option<Vec<u8>>,
}

/// Puts the controlling terminal into raw mode, runs the session to
/// completion (across reconnects if the server granted a session id),
/// and always restores the terminal before returning.
pub fn run_client(connect: impl Fn() -> Result<RawFd>, cfg: ClientConfig) -> Result<()> {
    install_signal_handlers()?;

    let stdin_fd = 0;
    let original = termios::tcgetattr(unsafe { std::os::fd::BorrowedFd::borrow_raw(stdin_fd) }).ok();
    set_raw_mode(stdin_fd)?;

    let result = session_loop(&connect, &cfg);

    if let Some(t) = original {
        restore_mode(stdin_fd, &t);
    }
    result
}

fn install_signal_handlers() -> Result<()> {
    unsafe {
        signal::signal(Signal::SIGINT, SigHandler::Handler(handle_halt_signal))
            .map_err(PtyfwdError::Errno)?;
        signal::signal(Signal::SIGTERM, SigHandler::Handler(handle_halt_signal))
            .map_err(PtyfwdError::Errno)?;
        signal::signal(Signal::SIGHUP, SigHandler::Handler(handle_halt_signal))
            .map_err(PtyfwdError::Errno)?;
        signal::signal(Signal::SIGWINCH, SigHandler::Handler(handle_winch))
            .map_err(PtyfwdError::Errno)?;
    }
    Ok(())
}

/// Mirrors `client.c`'s `set_tty_raw`: disable canonical mode, echo,
/// signal generation and most input/output translation, and read one
/// byte at a time with no inter-byte timeout.
fn set_raw_mode(fd: RawFd) -> Result<()> {
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    let mut t = termios::tcgetattr(borrowed).map_err(PtyfwdError::Errno)?;

    t.input_flags &= !(InputFlags::IGNBRK
        | InputFlags::BRKINT
        | InputFlags::PARMRK
        | InputFlags::ISTRIP
        | InputFlags::INLCR
        | InputFlags::IGNCR
        | InputFlags::ICRNL
        | InputFlags::IXON);
    t.output_flags &= !OutputFlags::OPOST;
    t.local_flags &= !(LocalFlags::ECHO
        | LocalFlags::ECHONL
        | LocalFlags::ICANON
        | LocalFlags::ISIG
        | LocalFlags::IEXTEN);
    t.control_flags &= !(nix::sys::termios::ControlFlags::CSIZE | nix::sys::termios::ControlFlags::PARENB);
    t.control_flags |= nix::sys::termios::ControlFlags::CS8;
    t.control_chars[SpecialCharacterIndices::VMIN as usize] = 1;
    t.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;

    termios::tcsetattr(borrowed, SetArg::TCSANOW, &t).map_err(PtyfwdError::Errno)?;
    Ok(())
}

fn restore_mode(fd: RawFd, original: &Termios) {
    let borrowed = unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) };
    termios::tcsetattr(borrowed, SetArg::TCSANOW, original).ok();
}

fn session_loop(connect: &impl Fn() -> Result<RawFd>, cfg: &ClientConfig) -> Result<()> {
    let mut session_id: Option<u64> = None;

    loop {
        let fd = match connect() {
            Ok(fd) => fd,
            Err(e) => {
                if session_id.is_some() {
                    tracing::warn!("reconnect failed ({e}), retrying in {RECONNECT_BACKOFF:?}");
                    std::thread::sleep(RECONNECT_BACKOFF);
                    continue;
                }
                return Err(e);
            }
        };

        match negotiate_and_run(fd, cfg, &mut session_id) {
            Ok(()) => return Ok(()),
            // Auth errors always terminate, reconnect attempt or not.
            Err(e @ PtyfwdError::Auth(_)) => {
                nix::unistd::close(fd).ok();
                return Err(e);
            }
            Err(e) if session_id.is_some() && !HALT_REQUESTED.load(Ordering::Relaxed) => {
                tracing::warn!("connection lost ({e}), reconnecting in {RECONNECT_BACKOFF:?}");
                nix::unistd::close(fd).ok();
                std::thread::sleep(RECONNECT_BACKOFF);
            }
            Err(e) => {
                nix::unistd::close(fd).ok();
                return Err(e);
            }
        }

        if HALT_REQUESTED.load(Ordering::Relaxed) {
            return Ok(());
        }
    }
}

fn negotiate_and_run(fd: RawFd, cfg: &ClientConfig, session_id: &mut Option<u64>) -> Result<()> {
    negotiate::client_preamble(fd)?;
    negotiate::client_auth(fd, cfg.cookie.as_deref())?;

    let wants = *session_id;
    negotiate::write_sessid(fd, wants)?;

    if wants.is_none() {
        // Fresh-session request: the server always answers with a SESSID
        // frame (the granted id, or empty if persistence is disabled).
        *session_id = negotiate::read_sessid(fd)?;
    }
    // Resume request: the server either silently hands the fd to the
    // worker (no reply frame at all — the first bytes may already be
    // replayed REGULAR data) or answers CLOSE, which read_frame surfaces
    // as an error out of run_io_loop. Either way there is no SESSID frame
    // to read here.

    run_io_loop(fd)
}

fn run_io_loop(fd: RawFd) -> Result<()> {
    let stdin_fd = 0;
    let mut readiness = Readiness::init(&[(stdin_fd, Mode::Read), (fd, Mode::Read)])?;
    let mut buf = [0u8; MAX_PAYLOAD];

    send_initial_winch(fd)?;

    loop {
        if HALT_REQUESTED.load(Ordering::Relaxed) {
            proto::write_frame(fd, DataType::Close, &[]).ok();
            return Ok(());
        }

        if WINCH_RECEIVED.swap(false, Ordering::Relaxed) {
            send_winch(fd)?;
        }

        let ready = match readiness.wait() {
            Ok(r) => r,
            Err(_) => {
                readiness = Readiness::init(&[(stdin_fd, Mode::Read), (fd, Mode::Read)])?;
                continue;
            }
        };

        for ready_fd in ready {
            if ready_fd == stdin_fd {
                match ioutil::try_read(stdin_fd, &mut buf) {
                    Ok(Some(0)) => {
                        proto::write_frame(fd, DataType::Close, &[]).ok();
                        return Ok(());
                    }
                    Ok(Some(n)) => proto::write_frame(fd, DataType::Regular, &buf[..n])?,
                    Ok(None) => {}
                    Err(e) => return Err(e),
                }
            } else if ready_fd == fd {
                match proto::read_frame(fd) {
                    Ok(frame) => match frame.tag {
                        DataType::Regular => ioutil::write_all(1, &frame.payload)?,
                        DataType::Close => return Ok(()),
                        DataType::None => {}
                        other => tracing::warn!("client: unexpected frame {other:?} from server, ignoring"),
                    },
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

fn send_initial_winch(fd: RawFd) -> Result<()> {
    send_winch(fd)
}

fn send_winch(fd: RawFd) -> Result<()> {
    if let Some(size) = pty::get_size(0) {
        let winch = proto::WinchData {
            rows: size.ws_row,
            cols: size.ws_col,
        };
        proto::write_frame(fd, DataType::Winch, &winch.encode())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn raw_mode_clears_canonical_and_echo_then_restores_cleanly() {
        let pty = nix::pty::openpty(None, None).expect("openpty");
        let fd = pty.slave.as_raw_fd();

        let original = termios::tcgetattr(&pty.slave).expect("tcgetattr");
        assert!(original.local_flags.contains(LocalFlags::ICANON), "pty starts in canonical mode");

        set_raw_mode(fd).expect("set_raw_mode");
        let raw = termios::tcgetattr(&pty.slave).expect("tcgetattr after raw");
        assert!(!raw.local_flags.contains(LocalFlags::ICANON));
        assert!(!raw.local_flags.contains(LocalFlags::ECHO));
        assert!(!raw.local_flags.contains(LocalFlags::ISIG));
        assert_eq!(raw.control_chars[SpecialCharacterIndices::VMIN as usize], 1);
        assert_eq!(raw.control_chars[SpecialCharacterIndices::VTIME as usize], 0);

        restore_mode(fd, &original);
        let restored = termios::tcgetattr(&pty.slave).expect("tcgetattr after restore");
        assert!(restored.local_flags.contains(LocalFlags::ICANON), "restore must bring canonical mode back");
    }
}
