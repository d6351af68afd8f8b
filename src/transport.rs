//! Transport construction, implemented minimally. Each constructor
//! hands back raw, non-blocking fds; the core only ever treats a
//! transport as "a byte stream with connect/accept".
//!
//! Grounded directly in `examples/original_source/socks.c`.

use crate::error::{PtyfwdError, Result};
use crate::ioutil::{set_nonblocking, write_all};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

const LISTEN_BACKLOG: i32 = 8;

/// One or more listening sockets (TCP may resolve to both an IPv4 and an
/// IPv6 address; UDS and VSOCK always resolve to exactly one).
pub struct Listeners {
    pub fds: Vec<OwnedFd>,
}

pub fn create_tcp_server(host: &str, port: u16) -> Result<Listeners> {
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| PtyfwdError::FatalSetup(format!("resolving {host}:{port}: {e}")))?;

    let mut fds = Vec::new();
    for addr in addrs {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = match Socket::new(domain, Type::STREAM, Some(Protocol::TCP)) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("error creating socket for {addr}: {e}");
                continue;
            }
        };
        socket.set_reuse_address(true).ok();
        if let Err(e) = socket.set_nonblocking(true) {
            tracing::warn!("error setting socket nonblocking: {e}");
            continue;
        }
        if let Err(e) = socket.bind(&SockAddr::from(addr)) {
            tracing::warn!("error binding {addr}: {e}");
            continue;
        }
        fds.push(unsafe { OwnedFd::from_raw_fd(socket.into_raw_fd()) });
    }

    if fds.is_empty() {
        return Err(PtyfwdError::FatalSetup(format!(
            "no usable address for {host}:{port}"
        )));
    }
    Ok(Listeners { fds })
}

pub fn create_tcp_client(host: &str, port: u16) -> Result<OwnedFd> {
    let stream = TcpStream::connect((host, port))
        .map_err(|e| PtyfwdError::Transport(e))?;
    let fd = stream.into_raw_fd();
    set_nonblocking(fd)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn create_uds_server(path: &Path) -> Result<Listeners> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)
        .map_err(|e| PtyfwdError::FatalSetup(format!("binding {}: {e}", path.display())))?;
    let fd = listener.into_raw_fd();
    set_nonblocking(fd)?;
    Ok(Listeners {
        fds: vec![unsafe { OwnedFd::from_raw_fd(fd) }],
    })
}

pub fn create_uds_client(path: &Path) -> Result<OwnedFd> {
    let stream = UnixStream::connect(path)
        .map_err(|e| PtyfwdError::Transport(e))?;
    let fd = stream.into_raw_fd();
    set_nonblocking(fd)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Accept one connection from a listening socket and return it
/// non-blocking, matching `server.c`'s `set_fd_flags(commfd, true,
/// O_NONBLOCK)` immediately after `accept`.
pub fn accept(listen_fd: RawFd) -> Result<OwnedFd> {
    let fd = nix::sys::socket::accept(listen_fd).map_err(PtyfwdError::Errno)?;
    set_nonblocking(fd)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

pub fn listen(fd: RawFd) -> Result<()> {
    let ret = unsafe { libc::listen(fd, LISTEN_BACKLOG) };
    if ret < 0 {
        return Err(PtyfwdError::FatalSetup(format!(
            "listen failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// The 18-byte `"%08x.%08x\n"` preamble a VSOCK-multiplexer client sends
/// right after connecting, naming the CID and port it wants the
/// multiplexer to dial on its behalf.
pub fn vsock_mult_preamble(cid: u32, port: u32) -> [u8; 18] {
    let s = format!("{cid:08x}.{port:08x}\n");
    let mut buf = [0u8; 18];
    buf.copy_from_slice(s.as_bytes());
    buf
}

pub fn create_vsock_mult_client(path: &Path, cid: u32, port: u32) -> Result<OwnedFd> {
    let fd = create_uds_client(path)?;
    let preamble = vsock_mult_preamble(cid, port);
    write_all(fd.as_raw_fd(), &preamble)?;
    Ok(fd)
}

#[cfg(target_os = "linux")]
pub mod vsock {
    //! Plain VSOCK (no multiplexer), Linux-only — gated exactly like the
    //! original's `#ifdef __linux__`.

    use super::*;
    use std::mem;

    const VMADDR_CID_ANY: u32 = 0xFFFFFFFF;

    fn sockaddr_vm(cid: u32, port: u32) -> libc::sockaddr_vm {
        let mut addr: libc::sockaddr_vm = unsafe { mem::zeroed() };
        addr.svm_family = libc::AF_VSOCK as libc::sa_family_t;
        addr.svm_cid = cid;
        addr.svm_port = port;
        addr
    }

    pub fn create_vsock_server(port: u32) -> Result<Listeners> {
        let fd = unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(PtyfwdError::FatalSetup("creating VSOCK socket failed".into()));
        }
        set_nonblocking(fd)?;

        let addr = sockaddr_vm(VMADDR_CID_ANY, port);
        let ret = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_vm>() as u32,
            )
        };
        if ret < 0 {
            unsafe { libc::close(fd) };
            return Err(PtyfwdError::FatalSetup("binding VSOCK socket failed".into()));
        }

        Ok(Listeners {
            fds: vec![unsafe { OwnedFd::from_raw_fd(fd) }],
        })
    }

    pub fn create_vsock_client(cid: u32, port: u32) -> Result<OwnedFd> {
        let fd = unsafe { libc::socket(libc::AF_VSOCK, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(PtyfwdError::FatalSetup("creating VSOCK socket failed".into()));
        }

        let addr = sockaddr_vm(cid, port);
        let ret = unsafe {
            libc::connect(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_vm>() as u32,
            )
        };
        if ret < 0 {
            unsafe { libc::close(fd) };
            return Err(PtyfwdError::Transport(std::io::Error::last_os_error()));
        }
        set_nonblocking(fd)?;
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vsock_mult_preamble_format() {
        let buf = vsock_mult_preamble(0x2, 0x1000);
        assert_eq!(&buf, b"00000002.00001000\n");
        assert_eq!(buf.len(), 18);
    }

    #[test]
    fn uds_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ptyfwd-test.sock");

        let server = create_uds_server(&path).unwrap();
        let listen_fd = server.fds[0].as_raw_fd();
        listen(listen_fd).unwrap();

        let _client = create_uds_client(&path).unwrap();
        // accept() may need a beat for the non-blocking listener; in
        // practice the connect above already completed the handshake.
        std::thread::sleep(std::time::Duration::from_millis(20));
        let accepted = accept(listen_fd);
        assert!(accepted.is_ok());
    }
}
