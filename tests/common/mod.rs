//! Reusable test harness for end-to-end scenarios: spawns the compiled
//! `ptyfwd` binary in server mode over a Unix socket and speaks the wire
//! protocol from the client side, independent of the crate's internal
//! modules (integration tests only ever see the binary, same as a real
//! peer would).

#![allow(dead_code)]

use std::fs;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::{Duration, Instant};

pub const TAG_PREAMBLE: u8 = 0;
pub const TAG_AUTH: u8 = 1;
pub const TAG_NONE: u8 = 2;
pub const TAG_CLOSE: u8 = 3;
pub const TAG_REGULAR: u8 = 4;
pub const TAG_WINCH: u8 = 5;
pub const TAG_SESSID: u8 = 6;

pub const PREAMBLE_MAGIC: [u8; 8] = [b'P', b'T', b'Y', b'F', b'W', b'D', 0, 1];

pub struct Frame {
    pub tag: u8,
    pub payload: Vec<u8>,
}

/// Running server process. Kills the child and removes the socket on drop.
pub struct ServerHandle {
    pub child: Child,
    pub socket_path: PathBuf,
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = fs::remove_file(&self.socket_path);
    }
}

fn binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ptyfwd"))
}

/// Spawn `ptyfwd -s <program> -u <socket>`, waiting for the socket file to
/// appear before returning.
pub fn spawn_server(program: &str, extra_args: &[&str]) -> ServerHandle {
    let dir = std::env::temp_dir();
    let socket_path = dir.join(format!("ptyfwd-test-{}.sock", std::process::id()));
    let _ = fs::remove_file(&socket_path);

    let mut cmd = Command::new(binary_path());
    cmd.arg("-s").arg(program).arg("-u").arg(&socket_path);
    for a in extra_args {
        cmd.arg(a);
    }

    let child = cmd.spawn().expect("failed to spawn ptyfwd binary");

    let deadline = Instant::now() + Duration::from_secs(5);
    while !socket_path.exists() {
        if Instant::now() > deadline {
            panic!("server socket never appeared at {}", socket_path.display());
        }
        std::thread::sleep(Duration::from_millis(20));
    }

    ServerHandle { child, socket_path }
}

pub fn connect(path: &Path) -> UnixStream {
    let stream = UnixStream::connect(path).expect("failed to connect to server socket");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("setting read timeout");
    stream
}

pub fn write_frame(stream: &mut UnixStream, tag: u8, payload: &[u8]) {
    let mut header = Vec::with_capacity(3);
    if payload.len() > 0xFF {
        header.push(tag | 0x80);
        header.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    } else {
        header.push(tag);
        header.push(payload.len() as u8);
    }
    stream.write_all(&header).expect("writing frame header");
    if !payload.is_empty() {
        stream.write_all(payload).expect("writing frame payload");
    }
}

pub fn read_frame(stream: &mut UnixStream) -> Frame {
    let mut hbyte = [0u8; 1];
    stream.read_exact(&mut hbyte).expect("reading frame tag byte");

    let size_len = if hbyte[0] & 0x80 != 0 { 2 } else { 1 };
    let tag = hbyte[0] & 0x7F;

    let length = if size_len == 1 {
        let mut lbuf = [0u8; 1];
        stream.read_exact(&mut lbuf).expect("reading 1-byte length");
        lbuf[0] as usize
    } else {
        let mut lbuf = [0u8; 2];
        stream.read_exact(&mut lbuf).expect("reading 2-byte length");
        u16::from_le_bytes(lbuf) as usize
    };

    let mut payload = vec![0u8; length];
    if length > 0 {
        stream.read_exact(&mut payload).expect("reading frame payload");
    }
    Frame { tag, payload }
}

/// Drive preamble exchange plus (optional) cookie auth. Returns `true` if
/// the connection is authenticated and should proceed to a SESSID
/// request, `false` if the server rejected the cookie (closed already).
fn negotiate_preamble_and_auth(stream: &mut UnixStream, cookie: Option<&[u8]>) -> bool {
    write_frame(stream, TAG_PREAMBLE, &PREAMBLE_MAGIC);
    let echoed = read_frame(stream);
    assert_eq!(echoed.tag, TAG_PREAMBLE);
    assert_eq!(echoed.payload, PREAMBLE_MAGIC);

    let challenge = read_frame(stream);
    match challenge.tag {
        TAG_NONE => true,
        TAG_AUTH => {
            use sha1::{Digest, Sha1};
            let cookie = cookie.expect("server sent AUTH but test supplied no cookie");
            let mut hasher = Sha1::new();
            hasher.update(&challenge.payload);
            hasher.update(cookie);
            let digest = hasher.finalize();
            write_frame(stream, TAG_AUTH, &digest);

            let verdict = read_frame(stream);
            verdict.tag == TAG_NONE
        }
        other => panic!("expected NONE or AUTH after preamble, got tag {other}"),
    }
}

/// Drive the client side of a **new-session** handshake: preamble, auth,
/// an empty SESSID request. Per spec.md §4.4 step 3 the server always
/// answers a new-session request with a SESSID frame (the granted id, or
/// empty if persistence is disabled), so this reads that reply.
pub fn handshake(stream: &mut UnixStream, cookie: Option<&[u8]>) -> Option<u64> {
    if !negotiate_preamble_and_auth(stream, cookie) {
        return None;
    }

    write_frame(stream, TAG_SESSID, &[]);

    let granted = read_frame(stream);
    if granted.tag != TAG_SESSID {
        return None;
    }
    match granted.payload.len() {
        8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&granted.payload);
            Some(u64::from_le_bytes(buf))
        }
        _ => None,
    }
}

/// Drive the client side of a **resume** handshake: preamble, auth, a
/// SESSID request carrying `id`. Per spec.md §4.4 step 3 the server
/// either silently hands the fd to the worker (no reply frame — the next
/// bytes on the wire may already be replayed `REGULAR` data) or answers
/// `CLOSE` if the id is unknown; there is no SESSID reply to read here.
pub fn handshake_resume(stream: &mut UnixStream, cookie: Option<&[u8]>, id: u64) {
    let authed = negotiate_preamble_and_auth(stream, cookie);
    assert!(authed, "resume handshake expects auth to succeed");
    write_frame(stream, TAG_SESSID, &id.to_le_bytes());
}
