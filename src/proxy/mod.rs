//! Proxy Defs

pub mod client;
pub mod connect;
pub mod listener;
pub mod registry;
pub mod relay;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::acl::{Acl, AclHandle};
use crate::buffer::ChunkPool;
use crate::config::{ProxyConfig, split_host_port};
use crate::crypto::{CipherKind, kdf};
use crate::error::Result;
use crate::resolver;

pub use client::ClientHandler;
pub use registry::ConnTable;

/// Connect attempts never wait longer than this, whatever the
/// configured idle timeout says.
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How many small chunks the pool keeps cached.
const POOL_CACHED_CHUNKS: usize = 1024;

/// Shared state handed to every accepted connection.
pub struct ProxyCtx {
    pub config_rx: watch::Receiver<Arc<ProxyConfig>>,
    pub kind: CipherKind,
    pub master_key: Zeroizing<Vec<u8>>,
    pub remotes: Vec<SocketAddr>,
    pub acl: AclHandle,
    pub pool: Arc<ChunkPool>,
    pub conns: ConnTable,
    /// Latched off at runtime when the platform rejects fast open.
    pub fast_open: AtomicBool,
    pub shutdown: CancellationToken,
    timeout: Duration,
}

impl ProxyCtx {
    /// Build the shared context. The returned `watch::Sender` feeds the
    /// reload watcher; dropping it (tests, no watcher) pins the initial
    /// snapshot.
    pub async fn new(
        config: ProxyConfig,
    ) -> Result<(Arc<ProxyCtx>, watch::Sender<Arc<ProxyConfig>>)> {
        config.validate()?;

        let kind: CipherKind = config.crypto.method.parse()?;
        let master_key = match &config.crypto.key {
            Some(hex_key) => kdf::parse_raw_key(hex_key, kind.key_len())?,
            None => kdf::evp_bytes_to_key(config.crypto.password.as_bytes(), kind.key_len()),
        };

        let remotes = resolve_remotes(&config).await?;
        info!(method = %kind, remotes = remotes.len(), "proxy context ready");

        let acl = match &config.acl.path {
            Some(path) => {
                let rules = Acl::load(path)?;
                info!(path = %path.display(), "acl rules loaded");
                AclHandle::new(rules)
            }
            None => AclHandle::disabled(),
        };

        let timeout = config.timeout();
        let fast_open = config.server.fast_open;
        let (config_tx, config_rx) = watch::channel(Arc::new(config));

        let ctx = Arc::new(ProxyCtx {
            config_rx,
            kind,
            master_key,
            remotes,
            acl,
            pool: ChunkPool::new(POOL_CACHED_CHUNKS),
            conns: ConnTable::new(),
            fast_open: AtomicBool::new(fast_open),
            shutdown: CancellationToken::new(),
            timeout,
        });
        Ok((ctx, config_tx))
    }

    pub fn config(&self) -> Arc<ProxyConfig> {
        self.config_rx.borrow().clone()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.timeout.min(MAX_CONNECT_TIMEOUT)
    }

    pub fn fast_open_enabled(&self) -> bool {
        self.fast_open.load(Ordering::Relaxed)
    }

    pub fn disable_fast_open(&self) {
        if self.fast_open.swap(false, Ordering::Relaxed) {
            warn!("tcp fast open unsupported here, disabled for this run");
        }
    }
}

async fn resolve_remotes(config: &ProxyConfig) -> Result<Vec<SocketAddr>> {
    if let Some(port) = config.remote.plugin_port {
        // The pluggable transport stands in for every configured relay.
        return Ok(vec![SocketAddr::from(([127, 0, 0, 1], port))]);
    }
    let mut remotes = Vec::new();
    for entry in &config.remote.servers {
        let (host, port) = split_host_port(entry)?;
        match resolver::resolve(&host, port, config.network.ipv6_first).await {
            Ok(addrs) => remotes.extend(addrs),
            Err(e) => warn!(remote = entry.as_str(), error = %e, "skipping unresolvable relay"),
        }
    }
    if remotes.is_empty() {
        return Err(crate::error::ProxyError::Resolver(
            "no relay address resolved".into(),
        ));
    }
    Ok(remotes)
}

/// Bind, serve, and drain on SIGINT/SIGTERM.
pub async fn run(ctx: Arc<ProxyCtx>) -> Result<()> {
    let listener = listener::bind(&ctx)?;
    let accept = listener::accept_loop(listener, ctx.clone());

    tokio::select! {
        res = accept => res,
        _ = shutdown_signal() => {
            info!(active = ctx.conns.len(), "shutdown requested, draining connections");
            ctx.shutdown.cancel();
            ctx.conns.abort_all();
            drain(&ctx.conns, Duration::from_secs(3)).await;
            Ok(())
        }
    }
}

async fn drain(conns: &ConnTable, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    while !conns.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    if !conns.is_empty() {
        warn!(remaining = conns.len(), "connections still open at exit");
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigint = signal(SignalKind::interrupt()).expect("sigint handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
}
