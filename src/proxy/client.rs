//! Per-connection mediator.
//!
//! Owns the client socket from accept to teardown: negotiates SOCKS5
//! (or a minimal HTTP CONNECT on the same port), probes IP-literal
//! destinations for a real hostname, decides bypass/relay/block, dials
//! the remote with failover, then hands both sockets to the stream
//! relay.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, info, warn};

use crate::acl::{Acl, AclMode};
use crate::buffer::StreamBuf;
use crate::config::ProxyConfig;
use crate::crypto::{TcpDecryptor, TcpEncryptor};
use crate::error::{ProxyError, Result};
use crate::protocol::sniff::{self, Sniff};
use crate::protocol::socks5::{self, AddrDecode, Address};
use crate::proxy::relay::RelayCrypto;
use crate::proxy::{ProxyCtx, connect, relay};
use crate::resolver;

/// How long to keep collecting client bytes for the hostname probe
/// before connecting to the literal IP.
const SNI_PROBE_DELAY: Duration = Duration::from_millis(50);

/// Probe accumulation cap. A hello that needs more than this is routed
/// by IP.
const SNI_PROBE_LIMIT: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Init,
    MethodSelected,
    Handshake,
    SniProbe,
    Stream,
    Closing,
}

/// Which client front is talking, and whether it already got its
/// success reply (the hostname probe answers early).
enum Front {
    Socks { reply_sent: bool },
    Http,
}

enum Route {
    Relay,
    Direct(Vec<SocketAddr>),
}

pub struct ClientHandler {
    id: u64,
    peer: SocketAddr,
    ctx: Arc<ProxyCtx>,
    stage: Stage,
}

impl ClientHandler {
    pub fn spawn(ctx: Arc<ProxyCtx>, stream: TcpStream, peer: SocketAddr) {
        let token = ctx.shutdown.child_token();
        let id = ctx.conns.register(token.clone());
        tokio::spawn(async move {
            let mut handler = ClientHandler {
                id,
                peer,
                ctx: ctx.clone(),
                stage: Stage::Init,
            };
            let outcome = tokio::select! {
                res = handler.handle(stream) => Some(res),
                _ = token.cancelled() => None,
            };
            match outcome {
                Some(Ok(())) => debug!(conn = id, "connection closed"),
                Some(Err(e)) if e.is_noisy() => {
                    warn!(conn = id, stage = ?handler.stage, error = %e, "connection failed")
                }
                Some(Err(e)) => {
                    debug!(conn = id, stage = ?handler.stage, error = %e, "connection closed")
                }
                None => debug!(conn = id, "connection aborted by shutdown"),
            }
            ctx.conns.remove(id);
        });
    }

    async fn handle(&mut self, mut stream: TcpStream) -> Result<()> {
        debug!(conn = self.id, peer = %self.peer, "connection accepted");
        let mut buf = StreamBuf::small(&self.ctx.pool);
        self.read_more(&mut stream, &mut buf).await?;

        if buf.unsent()[0] != socks5::SVERSION {
            return self.handle_http(stream, buf).await;
        }

        self.negotiate_method(&mut stream, &mut buf).await?;
        self.stage = Stage::MethodSelected;

        let (cmd, dst) = self.read_request(&mut stream, &mut buf).await?;
        self.stage = Stage::Handshake;

        match cmd {
            socks5::CMD_CONNECT => {}
            socks5::CMD_UDP_ASSOCIATE => return self.udp_associate(stream).await,
            other => {
                stream
                    .write_all(&socks5::encode_reply(socks5::REP_CMD_NOT_SUPPORTED, None))
                    .await?;
                return Err(ProxyError::ClientProtocol(format!(
                    "unsupported command: {other}"
                )));
            }
        }

        self.dispatch(stream, buf, dst, Front::Socks { reply_sent: false })
            .await
    }

    /// `ver | nmethods | methods…`; only NOAUTH is acceptable. Any
    /// trailing bytes stay buffered and flow into the request stage.
    async fn negotiate_method(
        &mut self,
        stream: &mut TcpStream,
        buf: &mut StreamBuf,
    ) -> Result<()> {
        loop {
            let data = buf.unsent();
            if data.len() >= 2 {
                if data[0] != socks5::SVERSION {
                    return Err(ProxyError::ClientProtocol(format!(
                        "bad socks version: {}",
                        data[0]
                    )));
                }
                let nmethods = data[1] as usize;
                if data.len() >= 2 + nmethods {
                    let offered = &data[2..2 + nmethods];
                    let method = if offered.contains(&socks5::METHOD_NOAUTH) {
                        socks5::METHOD_NOAUTH
                    } else {
                        socks5::METHOD_UNACCEPTABLE
                    };
                    stream.write_all(&[socks5::SVERSION, method]).await?;
                    if method == socks5::METHOD_UNACCEPTABLE {
                        return Err(ProxyError::ClientProtocol(
                            "no acceptable auth method".into(),
                        ));
                    }
                    buf.consume(2 + nmethods);
                    return Ok(());
                }
            }
            self.read_more(stream, buf).await?;
        }
    }

    /// `ver | cmd | rsv | atyp | addr | port`. The address block is kept
    /// verbatim — re-encoding `dst` reproduces it byte for byte as the
    /// relay destination header.
    async fn read_request(
        &mut self,
        stream: &mut TcpStream,
        buf: &mut StreamBuf,
    ) -> Result<(u8, Address)> {
        loop {
            let data = buf.unsent();
            if data.len() >= 3 {
                if data[0] != socks5::SVERSION {
                    return Err(ProxyError::ClientProtocol(format!(
                        "bad socks version in request: {}",
                        data[0]
                    )));
                }
                let cmd = data[1];
                match Address::decode(&data[3..]) {
                    Ok(AddrDecode::Parsed { addr, consumed }) => {
                        buf.consume(3 + consumed);
                        return Ok((cmd, addr));
                    }
                    Ok(AddrDecode::Incomplete) => {}
                    Err(e) => {
                        stream
                            .write_all(&socks5::encode_reply(
                                socks5::REP_ADDRTYPE_NOT_SUPPORTED,
                                None,
                            ))
                            .await?;
                        return Err(e);
                    }
                }
            }
            self.read_more(stream, buf).await?;
        }
    }

    /// Reply with our bound address, then park the TCP side: the UDP
    /// flow lives with its own relay, this socket just anchors the
    /// association until the client drops it.
    async fn udp_associate(&mut self, mut stream: TcpStream) -> Result<()> {
        let local = stream.local_addr().ok();
        stream
            .write_all(&socks5::encode_reply(socks5::REP_SUCCEEDED, local))
            .await?;
        info!(conn = self.id, "udp associate accepted");
        let mut sink = [0u8; 256];
        loop {
            match stream.read(&mut sink).await {
                Ok(0) | Err(_) => return Ok(()),
                Ok(_) => {}
            }
        }
    }

    async fn dispatch(
        &mut self,
        mut stream: TcpStream,
        mut buf: StreamBuf,
        mut dst: Address,
        mut front: Front,
    ) -> Result<()> {
        let config = self.ctx.config();
        let acl = self.ctx.acl.snapshot();

        // The literal the client named, kept as the connect target even
        // if the hostname probe rewrites the destination header.
        let orig_ip = match &dst {
            Address::Ip(sa) => Some(*sa),
            Address::Domain(..) => None,
        };

        // Hostname probe: an IP-literal CONNECT on a web port usually
        // hides the real destination one layer up. Answer the client
        // early so it starts talking, then race its first bytes against
        // a short timer.
        if let Front::Socks { reply_sent } = &mut front {
            if acl.is_some() && dst.is_ip() && matches!(dst.port(), 80 | 443) {
                stream
                    .write_all(&socks5::encode_reply(socks5::REP_SUCCEEDED, None))
                    .await?;
                *reply_sent = true;
                self.stage = Stage::SniProbe;
                if let Some(host) = self.probe_hostname(&mut stream, &mut buf, dst.port()).await? {
                    debug!(conn = self.id, host = host.as_str(), "destination hostname sniffed");
                    dst = Address::Domain(host, dst.port());
                }
            }
        }

        let route = match self.decide_route(acl.as_deref(), &config, &dst, orig_ip).await {
            Ok(route) => route,
            Err(e @ ProxyError::Blocked(_)) => {
                self.fail_reply(&mut stream, &front, socks5::REP_CONN_DISALLOWED)
                    .await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let (remote, crypto) = match route {
            Route::Direct(addrs) => {
                info!(conn = self.id, dst = %dst, "bypass");
                // Direct pairs carry the client payload as-is: no
                // destination header, no crypto, plain connect.
                let remote = connect::establish(&self.ctx, &addrs, Some(&mut buf), false).await;
                (remote, None)
            }
            Route::Relay => {
                info!(conn = self.id, dst = %dst, "relay");
                let mut encryptor = TcpEncryptor::new(self.ctx.kind, self.ctx.master_key.clone());
                let decryptor = TcpDecryptor::new(self.ctx.kind, self.ctx.master_key.clone());

                // The destination header leads the session; any payload
                // the client already sent follows it in the same first
                // flush.
                let mut abuf = StreamBuf::small(&self.ctx.pool);
                abuf.extend_from_slice(&dst.to_socks5_bytes())?;
                encryptor.encrypt(&mut abuf)?;
                if !buf.is_empty() {
                    encryptor.encrypt(&mut buf)?;
                }
                buf.prepend(abuf.unsent())?;

                let candidates = self.rotated_remotes();
                let remote =
                    connect::establish(&self.ctx, &candidates, Some(&mut buf), true).await;
                (remote, Some(RelayCrypto { encryptor, decryptor }))
            }
        };

        let remote = match remote {
            Ok(remote) => remote,
            Err(e) => {
                self.fail_reply(&mut stream, &front, socks5::REP_HOST_UNREACHABLE)
                    .await;
                return Err(e);
            }
        };

        match &front {
            Front::Socks { reply_sent: false } => {
                stream
                    .write_all(&socks5::encode_reply(socks5::REP_SUCCEEDED, None))
                    .await?;
            }
            Front::Socks { reply_sent: true } => {}
            Front::Http => {
                stream
                    .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await?;
            }
        }

        self.stage = Stage::Stream;
        let res = relay::run(&self.ctx, stream, remote, buf, crypto).await;
        self.stage = Stage::Closing;
        res
    }

    /// Collect client bytes until a hostname shows up, the bytes rule
    /// one out, the buffer fills, or the probe timer expires.
    async fn probe_hostname(
        &mut self,
        stream: &mut TcpStream,
        buf: &mut StreamBuf,
        port: u16,
    ) -> Result<Option<String>> {
        let deadline = Instant::now() + SNI_PROBE_DELAY;
        loop {
            let verdict = if port == 80 {
                sniff::http_host(buf.unsent())
            } else {
                sniff::tls_server_name(buf.unsent())
            };
            match verdict {
                Sniff::Found(host) => return Ok(Some(host)),
                Sniff::NotFound => return Ok(None),
                Sniff::Incomplete => {}
            }
            if buf.len() >= SNI_PROBE_LIMIT || buf.ensure_spare(1).is_err() {
                // Buffer full without a verdict: go with the IP.
                return Ok(None);
            }
            match timeout_at(deadline, stream.read(buf.spare_mut())).await {
                Ok(Ok(0)) => {
                    return Err(ProxyError::ClientProtocol(
                        "connection closed during hostname probe".into(),
                    ));
                }
                Ok(Ok(n)) => buf.advance(n),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Ok(None),
            }
        }
    }

    /// The routing ladder: outbound block first, then explicit host
    /// rules, then (optionally) resolve-and-reclassify by IP, then the
    /// default mode.
    async fn decide_route(
        &self,
        acl: Option<&Acl>,
        config: &ProxyConfig,
        dst: &Address,
        connect_hint: Option<SocketAddr>,
    ) -> Result<Route> {
        let Some(acl) = acl else {
            return Ok(Route::Relay);
        };
        let host = dst.host_str();
        if acl.blocked(&host) {
            return Err(ProxyError::Blocked(host));
        }

        let mut bypass = false;
        match dst {
            Address::Domain(name, port) => match acl.match_host(name) {
                1 => bypass = true,
                -1 => bypass = false,
                _ => {
                    if let Some(sa) = connect_hint {
                        // Sniffed hostname over a literal destination:
                        // the IP rules apply to that literal directly.
                        bypass = mode_bypasses(acl.mode(), acl.match_host(&sa.ip().to_string()));
                    } else if config.acl.resolve_names {
                        // Resolve locally so geo-IP rules apply to
                        // names too.
                        if let Ok(addrs) =
                            resolver::resolve(name, *port, config.network.ipv6_first).await
                        {
                            let ip = addrs[0].ip().to_string();
                            if mode_bypasses(acl.mode(), acl.match_host(&ip)) {
                                return Ok(Route::Direct(addrs));
                            }
                        }
                    }
                    // Remote-DNS mode, or resolution failed: the relay
                    // resolves the name itself.
                }
            },
            Address::Ip(sa) => {
                bypass = mode_bypasses(acl.mode(), acl.match_host(&sa.ip().to_string()));
            }
        }

        if bypass {
            // A sniffed hostname only ever rewrites the header; the
            // connect still targets the literal the client asked for.
            if let Some(sa) = connect_hint {
                return Ok(Route::Direct(vec![sa]));
            }
            match resolver::resolve_addr(dst, config.network.ipv6_first).await {
                Ok(addrs) => return Ok(Route::Direct(addrs)),
                Err(e) => {
                    debug!(conn = self.id, dst = %dst, error = %e,
                           "bypass target unresolvable, relaying instead");
                }
            }
        }
        Ok(Route::Relay)
    }

    fn rotated_remotes(&self) -> Vec<SocketAddr> {
        let remotes = &self.ctx.remotes;
        let start = if remotes.len() > 1 {
            rand::rng().random_range(0..remotes.len())
        } else {
            0
        };
        let mut candidates = Vec::with_capacity(remotes.len());
        candidates.extend_from_slice(&remotes[start..]);
        candidates.extend_from_slice(&remotes[..start]);
        candidates
    }

    /// Best-effort failure notice; errors here change nothing about the
    /// teardown.
    async fn fail_reply(&self, stream: &mut TcpStream, front: &Front, rep: u8) {
        let socks_bytes;
        let bytes: &[u8] = match front {
            Front::Socks { reply_sent: true } => return,
            Front::Socks { reply_sent: false } => {
                socks_bytes = socks5::encode_reply(rep, None);
                &socks_bytes
            }
            Front::Http => {
                if rep == socks5::REP_CONN_DISALLOWED {
                    b"HTTP/1.1 403 Forbidden\r\n\r\n"
                } else {
                    b"HTTP/1.1 502 Bad Gateway\r\n\r\n"
                }
            }
        };
        stream.write_all(bytes).await.ok();
    }

    /// Minimal HTTP CONNECT front sharing the listener with SOCKS5.
    async fn handle_http(&mut self, mut stream: TcpStream, mut buf: StreamBuf) -> Result<()> {
        loop {
            if let Some(end) = find_subslice(buf.unsent(), b"\r\n\r\n") {
                let head = buf.unsent()[..end].to_vec();
                buf.consume(end + 4);

                let line_end = find_subslice(&head, b"\r\n").unwrap_or(head.len());
                let line = std::str::from_utf8(&head[..line_end]).map_err(|_| {
                    ProxyError::ClientProtocol("http request line is not utf-8".into())
                })?;
                let mut parts = line.split_whitespace();
                let method = parts.next().unwrap_or("");
                let target = parts.next().unwrap_or("");

                if !method.eq_ignore_ascii_case("CONNECT") {
                    stream
                        .write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n")
                        .await?;
                    return Err(ProxyError::ClientProtocol(format!(
                        "http method not supported: {method}"
                    )));
                }
                let (host, port) = crate::config::split_host_port(target).map_err(|_| {
                    ProxyError::ClientProtocol(format!("bad connect target: {target}"))
                })?;
                let dst = match host.parse::<IpAddr>() {
                    Ok(ip) => Address::Ip(SocketAddr::new(ip, port)),
                    Err(_) => Address::Domain(host, port),
                };
                self.stage = Stage::Handshake;
                return self.dispatch(stream, buf, dst, Front::Http).await;
            }
            self.read_more(&mut stream, &mut buf).await?;
        }
    }

    async fn read_more(&self, stream: &mut TcpStream, buf: &mut StreamBuf) -> Result<()> {
        buf.ensure_spare(1)?;
        let n = timeout(self.ctx.timeout(), stream.read(buf.spare_mut()))
            .await
            .map_err(|_| ProxyError::Timeout("client handshake"))??;
        if n == 0 {
            return Err(ProxyError::ClientProtocol(
                "connection closed mid-handshake".into(),
            ));
        }
        buf.advance(n);
        Ok(())
    }
}

fn mode_bypasses(mode: AclMode, ip_match: i8) -> bool {
    match mode {
        AclMode::ProxyAll => ip_match > 0,
        AclMode::BypassAll => ip_match >= 0,
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_bypass_table() {
        assert!(mode_bypasses(AclMode::ProxyAll, 1));
        assert!(!mode_bypasses(AclMode::ProxyAll, 0));
        assert!(!mode_bypasses(AclMode::ProxyAll, -1));
        assert!(mode_bypasses(AclMode::BypassAll, 1));
        assert!(mode_bypasses(AclMode::BypassAll, 0));
        assert!(!mode_bypasses(AclMode::BypassAll, -1));
    }

    #[test]
    fn subslice_search() {
        assert_eq!(find_subslice(b"ab\r\n\r\ncd", b"\r\n\r\n"), Some(2));
        assert_eq!(find_subslice(b"ab\r\n", b"\r\n\r\n"), None);
    }
}
