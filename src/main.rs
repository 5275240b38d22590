use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cloakline::config::{ProxyConfig, spawn_config_watcher};
use cloakline::proxy::{self, ProxyCtx};

const CONFIG_RELOAD_INTERVAL: Duration = Duration::from_secs(60);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    let config = ProxyConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    config.validate().context("validating config")?;

    #[cfg(unix)]
    raise_nofile_limit();

    // The whole datapath is cooperative; one thread carries every pair.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;

    runtime.block_on(async move {
        let (ctx, config_tx) = ProxyCtx::new(config).await?;
        spawn_config_watcher(
            config_path,
            config_tx,
            ctx.acl.clone(),
            ctx.pool.clone(),
            CONFIG_RELOAD_INTERVAL,
        );
        proxy::run(ctx).await
    })?;

    info!("bye");
    Ok(())
}

/// Thousands of concurrent pairs burn two fds each; lift the soft
/// nofile limit to the hard one up front.
#[cfg(unix)]
fn raise_nofile_limit() {
    unsafe {
        let mut lim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) == 0 && lim.rlim_cur < lim.rlim_max {
            lim.rlim_cur = lim.rlim_max;
            if libc::setrlimit(libc::RLIMIT_NOFILE, &lim) != 0 {
                tracing::warn!("failed to raise RLIMIT_NOFILE");
            }
        }
    }
}
