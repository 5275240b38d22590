//! The Stream stage: full-duplex forwarding between the client and the
//! remote.
//!
//! Each direction owns its half of both sockets and one buffer. A read
//! lands in the buffer, the relay-path crypto transforms it in place,
//! and the writer drains `[offset, len)` — a short write simply leaves
//! the remainder pending, so bytes never reorder and the source socket
//! is not read again until the buffer empties. EOF on one side flushes
//! and shuts down the paired write half; the opposite direction then
//! gets a lingering-close grace period to finish draining.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::time::{Instant, timeout};
use tracing::debug;

use crate::buffer::StreamBuf;
use crate::crypto::{DecryptStep, TcpDecryptor, TcpEncryptor};
use crate::error::{ProxyError, Result};
use crate::proxy::ProxyCtx;

/// Per-read cap. Keeps a full read's ciphertext (payload plus salt and
/// record overhead) inside the big buffer tier.
const MAX_READ: usize = 16 * 1024;

/// How long a finished direction waits for its peer to drain.
const LINGER: Duration = Duration::from_secs(10);

/// Relay-path crypto, absent for direct (bypassed) pairs.
pub struct RelayCrypto {
    pub encryptor: TcpEncryptor,
    pub decryptor: TcpDecryptor,
}

pub async fn run(
    ctx: &ProxyCtx,
    client: TcpStream,
    remote: TcpStream,
    uplink_buf: StreamBuf,
    crypto: Option<RelayCrypto>,
) -> Result<()> {
    let (encryptor, decryptor) = match crypto {
        Some(c) => (Some(c.encryptor), Some(c.decryptor)),
        None => (None, None),
    };
    let downlink_buf = StreamBuf::small(&ctx.pool);

    let (client_rd, client_wr) = client.into_split();
    let (remote_rd, remote_wr) = remote.into_split();

    let started = Instant::now();
    let activity = Arc::new(AtomicU64::new(0));

    let up = pipe(client_rd, remote_wr, Transform::Encrypt(encryptor), uplink_buf, started, activity.clone());
    let down = pipe(remote_rd, client_wr, Transform::Decrypt(decryptor), downlink_buf, started, activity.clone());
    tokio::pin!(up, down);

    tokio::select! {
        res = &mut up => {
            res?;
            linger(down).await
        }
        res = &mut down => {
            res?;
            linger(up).await
        }
        _ = idle_watchdog(started, activity, ctx.timeout()) => {
            Err(ProxyError::Timeout("idle connection"))
        }
    }
}

/// Give the remaining direction its grace period; expiry is a normal
/// close, not an error.
async fn linger(rest: impl Future<Output = Result<()>>) -> Result<()> {
    match timeout(LINGER, rest).await {
        Ok(res) => res,
        Err(_) => {
            debug!("lingering close expired");
            Ok(())
        }
    }
}

enum Transform {
    Encrypt(Option<TcpEncryptor>),
    Decrypt(Option<TcpDecryptor>),
}

impl Transform {
    /// Apply to a freshly-read buffer. `false` means nothing is ready
    /// to forward yet.
    fn apply(&mut self, buf: &mut StreamBuf) -> Result<bool> {
        match self {
            Transform::Encrypt(Some(enc)) => {
                enc.encrypt(buf)?;
                Ok(true)
            }
            Transform::Decrypt(Some(dec)) => match dec.decrypt(buf)? {
                DecryptStep::Ok => Ok(true),
                DecryptStep::NeedMore => Ok(false),
            },
            _ => Ok(true),
        }
    }
}

async fn pipe(
    mut rd: OwnedReadHalf,
    mut wr: OwnedWriteHalf,
    mut transform: Transform,
    mut buf: StreamBuf,
    started: Instant,
    activity: Arc<AtomicU64>,
) -> Result<()> {
    loop {
        while !buf.is_empty() {
            let n = wr.write(buf.unsent()).await?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
            }
            buf.consume(n);
            touch(started, &activity);
        }

        let spare = buf.spare_mut();
        let cap = spare.len().min(MAX_READ);
        let n = rd.read(&mut spare[..cap]).await?;
        if n == 0 {
            // Peer finished sending: pass the FIN along cleanly.
            wr.shutdown().await.ok();
            return Ok(());
        }
        buf.advance(n);
        touch(started, &activity);
        if !transform.apply(&mut buf)? {
            // Partial crypto record, keep accumulating.
            continue;
        }
    }
}

fn touch(started: Instant, activity: &AtomicU64) {
    activity.store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
}

async fn idle_watchdog(started: Instant, activity: Arc<AtomicU64>, idle: Duration) {
    loop {
        let last = Duration::from_millis(activity.load(Ordering::Relaxed));
        let wake = started + last + idle;
        if Instant::now() >= wake {
            return;
        }
        tokio::time::sleep_until(wake).await;
    }
}
