//! Command-line entry point: parse flags, build the requested transport,
//! and dispatch to the server supervisor or the client driver.
//!
//! Flag surface mirrors `examples/original_source/app.c`'s `getopt`
//! table, extended with long forms and a `--persistent`/`--cookie` pair
//! `clap`'s derive API expresses more legibly than raw `getopt`.

mod client;
mod cookie;
mod error;
mod ioutil;
mod logging;
mod negotiate;
mod proto;
mod pty;
mod readiness;
mod server;
mod session;
mod transport;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::os::fd::{IntoRawFd, RawFd};
use std::path::PathBuf;

/// Forward an interactive PTY session over TCP, a Unix socket, or VSOCK.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Run in server mode, launching PROGRAM for each connection.
    #[arg(short = 's', long = "server", value_name = "PROGRAM")]
    server: Option<String>,

    /// Connect/listen over TCP using this IPv4 host.
    #[arg(short = 'h', long = "host", value_name = "HOST")]
    host: Option<String>,

    /// Connect/listen over TCP using this IPv6 host.
    #[arg(short = '6', long = "host6", value_name = "HOST")]
    host6: Option<String>,

    /// Connect/listen over a Unix socket at this path (combine with
    /// --vsock-cid to dial a VSOCK multiplexer instead).
    #[arg(short = 'u', long = "unix", value_name = "PATH")]
    unix: Option<PathBuf>,

    /// VSOCK CID (plain VSOCK on Linux, or multiplexer CID with --unix).
    #[arg(short = 'v', long = "vsock-cid", value_name = "CID")]
    vsock_cid: Option<u32>,

    /// TCP or VSOCK port.
    #[arg(short = 'p', long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// Path to a shared-secret cookie file (64-1024 bytes) for
    /// challenge-response authentication.
    #[arg(short = 'c', long = "cookie", value_name = "FILE")]
    cookie: Option<PathBuf>,

    /// Server only: keep workers alive across client disconnects so a
    /// reconnecting client can resume with a session id.
    #[arg(long)]
    persistent: bool,

    /// Increase log verbosity (equivalent to PTYFWD_LOG=debug).
    #[arg(long)]
    verbose: bool,
}

enum ConnMode {
    Tcp { host: String },
    Uds { path: PathBuf },
    VsockMult { path: PathBuf, cid: u32 },
    Vsock { cid: u32 },
}

fn resolve_mode(cli: &Cli) -> Result<ConnMode> {
    let host = cli.host.clone().or_else(|| cli.host6.clone());

    match (host, &cli.unix, cli.vsock_cid) {
        (Some(host), None, None) => Ok(ConnMode::Tcp { host }),
        (None, Some(path), None) => Ok(ConnMode::Uds { path: path.clone() }),
        (None, Some(path), Some(cid)) => Ok(ConnMode::VsockMult { path: path.clone(), cid }),
        (None, None, Some(cid)) => Ok(ConnMode::Vsock { cid }),
        _ => bail!("specify exactly one of -h/-6, -u, -u+-v, or -v as the connection mode"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cookie = cli
        .cookie
        .as_deref()
        .map(cookie::load_cookie)
        .transpose()
        .context("loading cookie file")?;

    let mode = resolve_mode(&cli)?;

    match &cli.server {
        Some(program) => run_server_mode(&cli, mode, program, cookie),
        None => run_client_mode(&cli, mode, cookie),
    }
}

fn run_server_mode(cli: &Cli, mode: ConnMode, program: &str, cookie: Option<Vec<u8>>) -> Result<()> {
    let listeners = match mode {
        ConnMode::Tcp { host } => {
            let port = cli.port.context("-p/--port is required for TCP mode")?;
            transport::create_tcp_server(&host, port)?
        }
        ConnMode::Uds { path } => transport::create_uds_server(&path)?,
        ConnMode::VsockMult { .. } => {
            bail!("server mode does not support VSOCK-multiplexer; use --vsock-cid alone")
        }
        ConnMode::Vsock { cid } => {
            #[cfg(target_os = "linux")]
            {
                let port = cli.port.context("-p/--port is required for VSOCK mode")?;
                let _ = cid;
                transport::vsock::create_vsock_server(port)?
            }
            #[cfg(not(target_os = "linux"))]
            {
                let _ = cid;
                bail!("VSOCK is only supported on Linux");
            }
        }
    };

    let cfg = server::ServerConfig {
        launch_argv: program.to_string(),
        cookie,
        persistent: cli.persistent,
    };

    server::run_server(listeners, cfg).context("server loop failed")
}

fn run_client_mode(cli: &Cli, mode: ConnMode, cookie: Option<Vec<u8>>) -> Result<()> {
    let port = cli.port;
    let connect = move || -> error::Result<RawFd> {
        let fd = match &mode {
            ConnMode::Tcp { host } => {
                let port = port.ok_or_else(|| {
                    error::PtyfwdError::FatalSetup("-p/--port is required for TCP mode".into())
                })?;
                transport::create_tcp_client(host, port)?
            }
            ConnMode::Uds { path } => transport::create_uds_client(path)?,
            ConnMode::VsockMult { path, cid } => {
                let port = port.ok_or_else(|| {
                    error::PtyfwdError::FatalSetup("-p/--port is required for VSOCK multiplexer mode".into())
                })?;
                transport::create_vsock_mult_client(path, *cid, port)?
            }
            ConnMode::Vsock { cid } => {
                #[cfg(target_os = "linux")]
                {
                    let port = port.ok_or_else(|| {
                        error::PtyfwdError::FatalSetup("-p/--port is required for VSOCK mode".into())
                    })?;
                    transport::vsock::create_vsock_client(*cid, port)?
                }
                #[cfg(not(target_os = "linux"))]
                {
                    let _ = cid;
                    return Err(error::PtyfwdError::FatalSetup(
                        "VSOCK is only supported on Linux".into(),
                    ));
                }
            }
        };
        Ok(fd.into_raw_fd())
    };

    let cfg = client::ClientConfig { cookie };
    client::run_client(connect, cfg).context("client session failed")
}
