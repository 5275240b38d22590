//! End-to-end tests against an in-process mock relay: a SOCKS5 client
//! talks to the proxy over loopback, the proxy either relays through an
//! encrypted session or connects direct, and every byte is accounted
//! for.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

use cloakline::buffer::{ChunkPool, StreamBuf};
use cloakline::config::ProxyConfig;
use cloakline::crypto::{CipherKind, DecryptStep, TcpDecryptor, TcpEncryptor, kdf};
use cloakline::protocol::socks5::{self, AddrDecode, Address};
use cloakline::proxy::{self, ProxyCtx};

const METHOD: &str = "chacha20-ietf-poly1305";
const PASSWORD: &str = "p";

fn test_config(remotes: &[SocketAddr], acl_rules: Option<&str>) -> ProxyConfig {
    let acl_section = match acl_rules {
        Some(rules) => {
            let path = std::env::temp_dir().join(format!(
                "cloakline-acl-{}-{}.txt",
                std::process::id(),
                rand_suffix()
            ));
            std::fs::write(&path, rules).unwrap();
            format!("[acl]\npath = {:?}\n", path.to_str().unwrap())
        }
        None => String::new(),
    };
    let servers: Vec<String> = remotes.iter().map(|a| format!("\"{a}\"")).collect();
    let text = format!(
        r#"
[server]
local_address = "127.0.0.1"
local_port = 0
timeout_secs = 30

[remote]
servers = [{}]

[crypto]
method = "{METHOD}"
password = "{PASSWORD}"

{acl_section}
"#,
        servers.join(", ")
    );
    toml::from_str(&text).unwrap()
}

fn rand_suffix() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .subsec_nanos() as u64;
    (nanos << 16) | SEQ.fetch_add(1, Ordering::Relaxed) as u64
}

async fn start_proxy(config: ProxyConfig) -> (SocketAddr, Arc<ProxyCtx>) {
    let (ctx, _config_tx) = ProxyCtx::new(config).await.unwrap();
    let listener = proxy::listener::bind(&ctx).unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(proxy::listener::accept_loop(listener, ctx.clone()));
    (addr, ctx)
}

/// What the mock relay observed for one session: the destination header
/// and whatever plaintext arrived in the same first flush.
#[derive(Debug)]
struct RelaySeen {
    dst: Address,
    early_body: Vec<u8>,
}

/// A relay that speaks the real session framing: consumes the salt and
/// records, parses the destination header, replies with `ok:` plus the
/// early body, then echoes every later chunk back encrypted.
async fn start_mock_relay() -> (SocketAddr, mpsc::UnboundedReceiver<RelaySeen>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(relay_session(stream, tx));
        }
    });
    (addr, rx)
}

async fn relay_session(mut stream: TcpStream, tx: mpsc::UnboundedSender<RelaySeen>) {
    let kind: CipherKind = METHOD.parse().unwrap();
    let master = kdf::evp_bytes_to_key(PASSWORD.as_bytes(), kind.key_len());
    let mut dec = TcpDecryptor::new(kind, master.clone());
    let mut enc = TcpEncryptor::new(kind, master);

    let pool = ChunkPool::new(4);
    let mut buf = StreamBuf::small(&pool);
    let mut plain = Vec::new();
    let mut seen_header = false;

    loop {
        if buf.ensure_spare(1).is_err() {
            return;
        }
        let n = match stream.read(buf.spare_mut()).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.advance(n);
        match dec.decrypt(&mut buf) {
            Ok(DecryptStep::Ok) => {
                plain.extend_from_slice(buf.unsent());
                buf.clear();
            }
            Ok(DecryptStep::NeedMore) => continue,
            Err(_) => return,
        }

        if !seen_header {
            match Address::decode(&plain) {
                Ok(AddrDecode::Parsed { addr, consumed }) => {
                    seen_header = true;
                    let body = plain[consumed..].to_vec();
                    tx.send(RelaySeen {
                        dst: addr,
                        early_body: body.clone(),
                    })
                    .ok();
                    let mut reply = StreamBuf::small(&pool);
                    reply.extend_from_slice(b"ok:").unwrap();
                    reply.extend_from_slice(&body).unwrap();
                    enc.encrypt(&mut reply).unwrap();
                    if stream.write_all(reply.unsent()).await.is_err() {
                        return;
                    }
                    plain.clear();
                }
                Ok(AddrDecode::Incomplete) => continue,
                Err(_) => return,
            }
        } else if !plain.is_empty() {
            let mut reply = StreamBuf::small(&pool);
            reply.extend_from_slice(&plain).unwrap();
            enc.encrypt(&mut reply).unwrap();
            if stream.write_all(reply.unsent()).await.is_err() {
                return;
            }
            plain.clear();
        }
    }
}

/// Plain echo server for direct-bypass scenarios.
async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut chunk = [0u8; 4096];
                loop {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&chunk[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// A listener that must never be contacted; counts accepts.
async fn start_tripwire() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let count = hits.clone();
    tokio::spawn(async move {
        while listener.accept().await.is_ok() {
            count.fetch_add(1, Ordering::SeqCst);
        }
    });
    (addr, hits)
}

/// An address that refuses connections: bind, learn the port, drop.
async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Run the SOCKS5 client handshake up to the request, return the stream
/// and the raw reply.
async fn socks5_request(proxy: SocketAddr, cmd: u8, dst: &Address) -> (TcpStream, Vec<u8>) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut req = vec![0x05, cmd, 0x00];
    dst.write_socks5(&mut req);
    stream.write_all(&req).await.unwrap();

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.unwrap();
    assert_eq!(head[0], 0x05);
    let addr_len = match head[3] {
        0x01 => 4,
        0x04 => 16,
        other => panic!("unexpected reply atyp {other}"),
    };
    let mut tail = vec![0u8; addr_len + 2];
    stream.read_exact(&mut tail).await.unwrap();
    let mut reply = head.to_vec();
    reply.extend_from_slice(&tail);
    (stream, reply)
}

#[tokio::test]
async fn proxied_domain_over_aead() {
    let (relay, mut seen) = start_mock_relay().await;
    let (proxy, ctx) = start_proxy(test_config(&[relay], None)).await;

    let dst = Address::Domain("example.com".into(), 443);
    let (mut stream, reply) = socks5_request(proxy, socks5::CMD_CONNECT, &dst).await;
    assert_eq!(reply, vec![5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);

    stream.write_all(b"ping").await.unwrap();

    let observed = timeout(Duration::from_secs(5), seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(observed.dst, dst);

    // The reply comes back decrypted and in order.
    let mut got = vec![0u8; 7];
    timeout(Duration::from_secs(5), stream.read_exact(&mut got))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&got, b"ok:ping");

    drop(stream);
    wait_for_drain(&ctx).await;
}

#[tokio::test]
async fn header_only_first_record_when_client_is_silent() {
    let (relay, mut seen) = start_mock_relay().await;
    let (proxy, _ctx) = start_proxy(test_config(&[relay], None)).await;

    let dst = Address::Domain("example.com".into(), 443);
    let (mut stream, _reply) = socks5_request(proxy, socks5::CMD_CONNECT, &dst).await;

    // No application bytes at all: the relay still sees the address
    // header as the session opening and the reply streams normally.
    let observed = timeout(Duration::from_secs(5), seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(observed.dst, dst);
    assert!(observed.early_body.is_empty());

    let mut got = vec![0u8; 3];
    timeout(Duration::from_secs(5), stream.read_exact(&mut got))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&got, b"ok:");
}

#[tokio::test]
async fn direct_bypass_skips_relay_and_crypto() {
    let echo = start_echo().await;
    let (tripwire, hits) = start_tripwire().await;
    let (proxy, ctx) = start_proxy(test_config(
        &[tripwire],
        Some("[proxy_all]\n[bypass_list]\n127.0.0.0/8\n"),
    ))
    .await;

    let dst = Address::Ip(echo);
    let (mut stream, reply) = socks5_request(proxy, socks5::CMD_CONNECT, &dst).await;
    assert_eq!(reply, vec![5, 0, 0, 1, 0, 0, 0, 0, 0, 0]);

    stream.write_all(b"raw bytes straight through").await.unwrap();
    let mut got = vec![0u8; 26];
    timeout(Duration::from_secs(5), stream.read_exact(&mut got))
        .await
        .unwrap()
        .unwrap();
    // Echoed verbatim: nothing was encrypted on the wire.
    assert_eq!(&got, b"raw bytes straight through");
    assert_eq!(hits.load(Ordering::SeqCst), 0, "relay must not be contacted");

    drop(stream);
    wait_for_drain(&ctx).await;
}

#[tokio::test]
async fn outbound_block_closes_with_disallowed() {
    let (tripwire, hits) = start_tripwire().await;
    let (proxy, _ctx) = start_proxy(test_config(
        &[tripwire],
        Some("[outbound_block_list]\nfacebook\\.com\n"),
    ))
    .await;

    let dst = Address::Domain("graph.facebook.com".into(), 443);
    let (mut stream, reply) = socks5_request(proxy, socks5::CMD_CONNECT, &dst).await;
    assert_eq!(reply[1], socks5::REP_CONN_DISALLOWED);

    // Pair closes, nothing was dialed.
    let mut probe = [0u8; 1];
    let n = timeout(Duration::from_secs(5), stream.read(&mut probe))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn udp_associate_reports_bound_address() {
    let (relay, _seen) = start_mock_relay().await;
    let (proxy, _ctx) = start_proxy(test_config(&[relay], None)).await;

    let dst = Address::Ip("0.0.0.0:0".parse().unwrap());
    let (mut stream, reply) = socks5_request(proxy, socks5::CMD_UDP_ASSOCIATE, &dst).await;
    assert_eq!(reply[1], socks5::REP_SUCCEEDED);
    assert_eq!(reply[3], socks5::ATYP_IPV4);
    let port = u16::from_be_bytes([reply[8], reply[9]]);
    assert_eq!(port, proxy.port());

    // The TCP side stays open until we close it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    stream.write_all(b"noise").await.unwrap();
    drop(stream);
}

#[tokio::test]
async fn failover_reaches_second_remote() {
    let dead = dead_addr().await;
    let (relay, mut seen) = start_mock_relay().await;
    let (proxy, _ctx) = start_proxy(test_config(&[dead, relay], None)).await;

    let dst = Address::Domain("fallback.example".into(), 80);
    let (mut stream, reply) = socks5_request(proxy, socks5::CMD_CONNECT, &dst).await;
    assert_eq!(reply[1], socks5::REP_SUCCEEDED);

    stream.write_all(b"x").await.unwrap();
    let observed = timeout(Duration::from_secs(5), seen.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(observed.dst, dst);
}

#[tokio::test]
async fn exhausted_remotes_reply_host_unreachable() {
    let dead1 = dead_addr().await;
    let dead2 = dead_addr().await;
    let (proxy, _ctx) = start_proxy(test_config(&[dead1, dead2], None)).await;

    let dst = Address::Domain("nowhere.example".into(), 80);
    let (_stream, reply) = socks5_request(proxy, socks5::CMD_CONNECT, &dst).await;
    assert_eq!(reply[1], socks5::REP_HOST_UNREACHABLE);
}

#[tokio::test]
async fn sni_probe_rewrites_header_for_the_relay() {
    let (relay, mut seen) = start_mock_relay().await;
    // ACL present (otherwise no probe) but with no rules: default mode
    // keeps the destination on the relay path.
    let (proxy, _ctx) = start_proxy(test_config(&[relay], Some("[proxy_all]\n"))).await;

    let dst = Address::Ip("127.0.0.1:443".parse().unwrap());
    let (mut stream, reply) = socks5_request(proxy, socks5::CMD_CONNECT, &dst).await;
    assert_eq!(reply[1], socks5::REP_SUCCEEDED);

    let hello = client_hello("example.com");
    stream.write_all(&hello).await.unwrap();

    let observed = timeout(Duration::from_secs(5), seen.recv())
        .await
        .unwrap()
        .unwrap();
    // The header now names the sniffed host, and the buffered
    // ClientHello followed it unmodified in the same opening flush.
    assert_eq!(observed.dst, Address::Domain("example.com".into(), 443));
    assert_eq!(observed.early_body, hello);
}

#[tokio::test]
async fn http_connect_front_shares_the_listener() {
    let echo = start_echo().await;
    let (tripwire, _hits) = start_tripwire().await;
    let (proxy, _ctx) = start_proxy(test_config(
        &[tripwire],
        Some("[bypass_list]\n127.0.0.0/8\n"),
    ))
    .await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let req = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
    stream.write_all(req.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();
    assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");

    stream.write_all(b"tunnel payload").await.unwrap();
    let mut got = vec![0u8; 14];
    timeout(Duration::from_secs(5), stream.read_exact(&mut got))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&got, b"tunnel payload");
}

#[tokio::test]
async fn client_vanishing_mid_handshake_leaves_no_remote() {
    let (tripwire, hits) = start_tripwire().await;
    let (proxy, ctx) = start_proxy(test_config(&[tripwire], None)).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05]).await.unwrap();
    drop(stream);

    wait_for_drain(&ctx).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // The proxy is still healthy afterwards.
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);
}

#[tokio::test]
async fn large_transfer_round_trips() {
    let (relay, _seen) = start_mock_relay().await;
    let (proxy, ctx) = start_proxy(test_config(&[relay], None)).await;

    let dst = Address::Domain("bulk.example".into(), 80);
    let (stream, reply) = socks5_request(proxy, socks5::CMD_CONNECT, &dst).await;
    assert_eq!(reply[1], socks5::REP_SUCCEEDED);

    // 256 KiB forces record splitting and short-write handling in both
    // directions; the echo must come back byte-exact and in order.
    let payload: Vec<u8> = (0..256 * 1024u32).map(|i| (i * 31 % 251) as u8).collect();
    let (mut rd, mut wr) = stream.into_split();

    let to_send = payload.clone();
    let writer = tokio::spawn(async move {
        wr.write_all(&to_send).await.unwrap();
        wr.shutdown().await.unwrap();
    });

    let mut got = Vec::with_capacity(payload.len() + 8);
    let mut chunk = vec![0u8; 8192];
    while got.len() < 3 + payload.len() {
        let n = timeout(Duration::from_secs(20), rd.read(&mut chunk))
            .await
            .unwrap()
            .unwrap();
        if n == 0 {
            break;
        }
        got.extend_from_slice(&chunk[..n]);
    }
    writer.await.unwrap();

    assert_eq!(&got[..3], b"ok:");
    assert_eq!(&got[3..], &payload[..]);

    wait_for_drain(&ctx).await;
}

#[tokio::test]
async fn concurrent_pairs_are_isolated() {
    let (relay, _seen) = start_mock_relay().await;
    let (proxy, ctx) = start_proxy(test_config(&[relay], None)).await;

    let sessions = (0..8).map(|i| async move {
        let dst = Address::Domain(format!("host-{i}.example"), 80);
        let (mut stream, reply) = socks5_request(proxy, socks5::CMD_CONNECT, &dst).await;
        assert_eq!(reply[1], socks5::REP_SUCCEEDED);

        let msg = format!("payload-{i}");
        stream.write_all(msg.as_bytes()).await.unwrap();

        let mut got = vec![0u8; 3 + msg.len()];
        timeout(Duration::from_secs(10), stream.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, [b"ok:", msg.as_bytes()].concat());
    });
    futures::future::join_all(sessions).await;

    wait_for_drain(&ctx).await;
}

#[tokio::test]
async fn unacceptable_auth_method_is_refused() {
    let (relay, _seen) = start_mock_relay().await;
    let (proxy, _ctx) = start_proxy(test_config(&[relay], None)).await;

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    // Offers only username/password auth.
    stream.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0xff]);
}

/// Every accepted pair leaves the registry once it is torn down.
async fn wait_for_drain(ctx: &ProxyCtx) {
    for _ in 0..200 {
        if ctx.conns.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("connection table still has {} entries", ctx.conns.len());
}

/// Minimal ClientHello carrying one SNI entry.
fn client_hello(host: &str) -> Vec<u8> {
    let sni_entry_len = 3 + host.len();
    let ext_len = 2 + sni_entry_len;
    let exts_len = 4 + ext_len;
    let hello_len = 2 + 32 + 1 + 2 + 2 + 1 + 1 + 2 + exts_len;
    let hs_len = 4 + hello_len;

    let mut out = vec![0x16, 0x03, 0x01];
    out.extend_from_slice(&(hs_len as u16).to_be_bytes());
    out.push(0x01);
    out.extend_from_slice(&(hello_len as u32).to_be_bytes()[1..]);
    out.extend_from_slice(&[0x03, 0x03]);
    out.extend_from_slice(&[0u8; 32]);
    out.push(0);
    out.extend_from_slice(&2u16.to_be_bytes());
    out.extend_from_slice(&[0x13, 0x01]);
    out.push(1);
    out.push(0);
    out.extend_from_slice(&(exts_len as u16).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&(ext_len as u16).to_be_bytes());
    out.extend_from_slice(&(sni_entry_len as u16).to_be_bytes());
    out.push(0);
    out.extend_from_slice(&(host.len() as u16).to_be_bytes());
    out.extend_from_slice(host.as_bytes());
    out
}
