//! Negotiation & authentication: preamble exchange, challenge-response
//! auth, and the SESSID request/response frames.
//!
//! This module implements the parts of the handshake that are identical
//! regardless of which side decides "new vs. resume" — that decision
//! needs the session registry and lives in `server.rs`.

use crate::error::{PtyfwdError, Result};
use crate::proto::{self, DataType};
use std::os::fd::RawFd;

/// Server side of step 1: write the preamble, then verify the client's
/// echo matches exactly.
pub fn server_preamble(fd: RawFd) -> Result<()> {
    proto::write_frame(fd, DataType::Preamble, &proto::PREAMBLE_MAGIC)?;
    let echoed = proto::read_frame(fd)?;
    if echoed.tag != DataType::Preamble || echoed.payload != proto::PREAMBLE_MAGIC {
        return Err(PtyfwdError::Auth("preamble echo mismatch".into()));
    }
    Ok(())
}

/// Client side of step 1: read the preamble, reject on mismatch, else
/// echo it back.
pub fn client_preamble(fd: RawFd) -> Result<()> {
    let frame = proto::read_frame(fd)?;
    if frame.tag != DataType::Preamble || frame.payload != proto::PREAMBLE_MAGIC {
        return Err(PtyfwdError::Auth("server preamble mismatch".into()));
    }
    proto::write_frame(fd, DataType::Preamble, &frame.payload)?;
    Ok(())
}

/// Server side of step 2. `cookie` is `None` when the server runs
/// unauthenticated (a bare `NONE` is sent and anything the client does is
/// accepted).
pub fn server_auth(fd: RawFd, cookie: Option<&[u8]>) -> Result<()> {
    let Some(cookie) = cookie else {
        proto::write_frame(fd, DataType::None, &[])?;
        return Ok(());
    };

    let mut nonce = [0u8; 16];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce);
    proto::write_frame(fd, DataType::Auth, &nonce)?;

    let answer = proto::read_frame(fd)?;
    let expected = proto::auth_digest(&nonce, cookie);
    if answer.tag != DataType::Auth || answer.payload.as_slice() != expected.as_slice() {
        proto::write_frame(fd, DataType::Close, &[]).ok();
        return Err(PtyfwdError::Auth("client answered auth challenge incorrectly".into()));
    }

    proto::write_frame(fd, DataType::None, &[])?;
    Ok(())
}

/// Client side of step 2. `cookie` is `None` when the client holds no
/// secret; if the server nonetheless requires one, it will reply `CLOSE`
/// and this call reports an auth error.
pub fn client_auth(fd: RawFd, cookie: Option<&[u8]>) -> Result<()> {
    let frame = proto::read_frame(fd)?;
    match frame.tag {
        DataType::None => {
            if cookie.is_some() {
                tracing::warn!("server has no cookie but client was configured with one; proceeding unauthenticated");
            }
            Ok(())
        }
        DataType::Auth => {
            let Some(cookie) = cookie else {
                return Err(PtyfwdError::Auth(
                    "server requires a cookie but none was configured".into(),
                ));
            };
            let digest = proto::auth_digest(&frame.payload, cookie);
            proto::write_frame(fd, DataType::Auth, &digest)?;

            let verdict = proto::read_frame(fd)?;
            match verdict.tag {
                DataType::None => Ok(()),
                DataType::Close => Err(PtyfwdError::Auth("server rejected cookie".into())),
                other => Err(PtyfwdError::Parse(format!(
                    "expected NONE or CLOSE after auth answer, got {other:?}"
                ))),
            }
        }
        other => Err(PtyfwdError::Parse(format!(
            "expected NONE or AUTH frame, got {other:?}"
        ))),
    }
}

/// Write a SESSID frame: empty for "new session"/"not supported", or the
/// 8-byte little-endian id.
pub fn write_sessid(fd: RawFd, id: Option<u64>) -> Result<()> {
    match id {
        None => proto::write_frame(fd, DataType::Sessid, &[]),
        Some(id) => proto::write_frame(fd, DataType::Sessid, &id.to_le_bytes()),
    }
}

/// Read a SESSID frame and decode its payload (empty => `None`, 8 bytes
/// => `Some(id)`).
pub fn read_sessid(fd: RawFd) -> Result<Option<u64>> {
    let frame = proto::read_frame(fd)?;
    if frame.tag != DataType::Sessid {
        return Err(PtyfwdError::Parse(format!(
            "expected SESSID frame, got {:?}",
            frame.tag
        )));
    }
    match frame.payload.len() {
        0 => Ok(None),
        8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&frame.payload);
            Ok(Some(u64::from_le_bytes(buf)))
        }
        other => Err(PtyfwdError::Parse(format!(
            "SESSID payload must be 0 or 8 bytes, got {other}"
        ))),
    }
}
