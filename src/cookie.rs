//! Cookie file loading.
//!
//! A cookie is an opaque shared-secret byte string, 64–1024 bytes, read
//! once at startup. Anything outside that range is rejected before any
//! socket operation.

use crate::error::{PtyfwdError, Result};
use std::path::Path;

pub const MIN_COOKIE_LEN: usize = 64;
pub const MAX_COOKIE_LEN: usize = 1024;

pub fn load_cookie(path: &Path) -> Result<Vec<u8>> {
    let data = std::fs::read(path).map_err(|e| {
        PtyfwdError::FatalSetup(format!("failed to read cookie file {}: {e}", path.display()))
    })?;

    if data.len() < MIN_COOKIE_LEN || data.len() > MAX_COOKIE_LEN {
        return Err(PtyfwdError::FatalSetup(format!(
            "cookie file {} must be {}..={} bytes, got {}",
            path.display(),
            MIN_COOKIE_LEN,
            MAX_COOKIE_LEN,
            data.len()
        )));
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn rejects_oversize_cookie() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; 1025]).unwrap();
        assert!(load_cookie(f.path()).is_err());
    }

    #[test]
    fn rejects_undersize_cookie() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&vec![0u8; 63]).unwrap();
        assert!(load_cookie(f.path()).is_err());
    }

    #[test]
    fn accepts_boundary_sizes() {
        for len in [MIN_COOKIE_LEN, MAX_COOKIE_LEN] {
            let mut f = tempfile::NamedTempFile::new().unwrap();
            f.write_all(&vec![0x42u8; len]).unwrap();
            let cookie = load_cookie(f.path()).unwrap();
            assert_eq!(cookie.len(), len);
        }
    }
}
