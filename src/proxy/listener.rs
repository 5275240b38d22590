//! Listener bind and accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::error::{ProxyError, Result};
use crate::proxy::{ClientHandler, ProxyCtx};

pub fn bind(ctx: &ProxyCtx) -> Result<TcpListener> {
    let config = ctx.config();
    let addr: SocketAddr = format!(
        "{}:{}",
        config.server.local_address, config.server.local_port
    )
    .parse()
    .map_err(|_| {
        ProxyError::Config(format!(
            "invalid listen address {}:{}",
            config.server.local_address, config.server.local_port
        ))
    })?;

    let socket = Socket::new(
        Domain::for_address(addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if config.server.reuse_port {
        socket.set_reuse_port(true)?;
        info!("tcp port reuse enabled");
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    let listener = TcpListener::from_std(socket.into())?;
    info!(address = %addr, "listener established");
    Ok(listener)
}

/// One accept per wakeup; each connection gets its own task and a spot
/// in the connection table until teardown.
pub async fn accept_loop(listener: TcpListener, ctx: Arc<ProxyCtx>) -> Result<()> {
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        stream.set_nodelay(true).ok();
                        ClientHandler::spawn(ctx.clone(), stream, peer);
                    }
                    Err(e) => {
                        // Transient accept failures (EMFILE and friends)
                        // must not kill the listener.
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
}
