//! Remote socket establishment.
//!
//! Candidates are tried in order under a per-attempt connect timeout;
//! the client only learns of failure once every address is exhausted.
//! On Linux with fast open enabled, the first relay flush rides in the
//! SYN via `MSG_FASTOPEN`; platforms that refuse it latch fast open off
//! for the rest of the run and fall back to a plain connect.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::buffer::StreamBuf;
use crate::error::{ProxyError, Result};
use crate::proxy::ProxyCtx;

/// Connect to the first reachable candidate. `first_flush` is the
/// already-prepared opening payload; fast open may consume a prefix of
/// it before the stream is returned.
pub async fn establish(
    ctx: &ProxyCtx,
    candidates: &[SocketAddr],
    mut first_flush: Option<&mut StreamBuf>,
    allow_tfo: bool,
) -> Result<TcpStream> {
    debug_assert!(!candidates.is_empty());
    for &addr in candidates {
        let attempt = connect_one(ctx, addr, first_flush.as_deref_mut(), allow_tfo);
        match timeout(ctx.connect_timeout(), attempt).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => {
                debug!(remote = %addr, error = %e, "connect failed, trying next");
            }
            Err(_) => {
                debug!(remote = %addr, "connect timed out, trying next");
            }
        }
    }
    Err(ProxyError::ConnectFailed {
        addr: candidates
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(", "),
    })
}

async fn connect_one(
    ctx: &ProxyCtx,
    addr: SocketAddr,
    first_flush: Option<&mut StreamBuf>,
    allow_tfo: bool,
) -> Result<TcpStream> {
    let socket = build_socket(ctx, addr)?;

    #[cfg(target_os = "linux")]
    if allow_tfo && ctx.fast_open_enabled() {
        if let Some(buf) = first_flush {
            if !buf.is_empty() {
                return tfo_connect(ctx, socket, addr, buf).await;
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = (first_flush, allow_tfo);

    plain_connect(socket, addr).await
}

fn build_socket(ctx: &ProxyCtx, addr: SocketAddr) -> Result<Socket> {
    let config = ctx.config();
    let domain = Domain::for_address(addr);
    let ty = Type::STREAM.nonblocking();

    let socket = if config.network.mptcp {
        match mptcp_socket(domain, ty) {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, "mptcp unavailable, using plain tcp");
                Socket::new(domain, ty, Some(Protocol::TCP))?
            }
        }
    } else {
        Socket::new(domain, ty, Some(Protocol::TCP))?
    };

    #[cfg(target_os = "linux")]
    if let Some(iface) = &config.network.interface {
        socket.bind_device(Some(iface.as_bytes()))?;
    }
    #[cfg(not(target_os = "linux"))]
    if config.network.interface.is_some() {
        tracing::warn!("network.interface binding is linux-only, ignored");
    }

    Ok(socket)
}

#[cfg(target_os = "linux")]
fn mptcp_socket(domain: Domain, ty: Type) -> std::io::Result<Socket> {
    Socket::new(domain, ty, Some(Protocol::from(libc::IPPROTO_MPTCP)))
}

#[cfg(not(target_os = "linux"))]
fn mptcp_socket(_domain: Domain, _ty: Type) -> std::io::Result<Socket> {
    Err(std::io::Error::from(std::io::ErrorKind::Unsupported))
}

async fn plain_connect(socket: Socket, addr: SocketAddr) -> Result<TcpStream> {
    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpSocket::from_std_stream(std_stream).connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Hand the opening payload to `sendto(MSG_FASTOPEN)` so it travels in
/// the SYN when the kernel holds a cookie for this peer.
#[cfg(target_os = "linux")]
async fn tfo_connect(
    ctx: &ProxyCtx,
    socket: Socket,
    addr: SocketAddr,
    buf: &mut StreamBuf,
) -> Result<TcpStream> {
    use std::os::fd::AsRawFd;

    let sa = socket2::SockAddr::from(addr);
    loop {
        let pending = buf.unsent();
        let sent = unsafe {
            libc::sendto(
                socket.as_raw_fd(),
                pending.as_ptr().cast(),
                pending.len(),
                libc::MSG_FASTOPEN,
                sa.as_ptr(),
                sa.len(),
            )
        };
        if sent >= 0 {
            buf.consume(sent as usize);
            return finish_connect(socket).await;
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            // No cookie yet: the SYN went out empty, the payload stays
            // queued for the regular write path.
            Some(libc::EINPROGRESS) => return finish_connect(socket).await,
            Some(libc::EINTR) => continue,
            Some(libc::EOPNOTSUPP | libc::EPROTONOSUPPORT | libc::ENOPROTOOPT) => {
                ctx.disable_fast_open();
                return plain_connect(socket, addr).await;
            }
            _ => return Err(err.into()),
        }
    }
}

/// Wait for writability, then use getpeername as the connect-completion
/// check: success means connected, failure carries the pending
/// SO_ERROR.
#[cfg(target_os = "linux")]
async fn finish_connect(socket: Socket) -> Result<TcpStream> {
    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream)?;
    stream.writable().await?;
    match stream.peer_addr() {
        Ok(_) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Err(_) => {
            let err = stream
                .take_error()?
                .unwrap_or_else(|| std::io::Error::from(std::io::ErrorKind::NotConnected));
            Err(err.into())
        }
    }
}
