//! Hot-reload: re-reads the config file on SIGHUP (Unix) or on a
//! periodic timer (all platforms) and swaps the ACL snapshot in place.
//!
//! # What can be reloaded without restart
//!
//! | Section | Field           | Effect                                   |
//! |---------|-----------------|------------------------------------------|
//! | `acl`   | `path`          | Rule file re-read, snapshot swapped      |
//! | `acl`   | `resolve_names` | Applied on the next routing decision     |
//!
//! Fields that require re-binding sockets or re-keying sessions
//! (`server.*`, `remote.*`, `crypto.*`, `network.*`) are **not**
//! applied; a warning is emitted. A successful swap also drains the
//! chunk-pool freelist so arenas sized for the old rule set are
//! released.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::acl::{Acl, AclHandle};
use crate::buffer::ChunkPool;
use super::load::ProxyConfig;

/// The subset of the config that is safe to swap while running.
#[derive(Debug, Clone, PartialEq)]
struct HotFields {
    acl_path: Option<PathBuf>,
    resolve_names: bool,
}

impl HotFields {
    fn from_config(cfg: &ProxyConfig) -> Self {
        Self {
            acl_path: cfg.acl.path.clone(),
            resolve_names: cfg.acl.resolve_names,
        }
    }
}

/// Warn if any non-hot fields changed (i.e. require restart).
fn warn_non_hot_changes(old: &ProxyConfig, new: &ProxyConfig) {
    if old.server != new.server {
        warn!("config reload: [server] changed; restart required");
    }
    if old.remote != new.remote {
        warn!("config reload: [remote] changed; restart required");
    }
    if old.crypto != new.crypto {
        warn!("config reload: [crypto] changed; restart required");
    }
    if old.network != new.network {
        warn!("config reload: [network] changed; restart required");
    }
}

/// Spawn the reload watcher task.
///
/// Accepted snapshots are broadcast through `config_tx`; routing code
/// reads `acl.resolve_names` from its receiver per connection.
pub fn spawn_config_watcher(
    config_path: PathBuf,
    config_tx: watch::Sender<Arc<ProxyConfig>>,
    acl: AclHandle,
    pool: Arc<ChunkPool>,
    reload_interval: Duration,
) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let mut sighup = {
            use tokio::signal::unix::{SignalKind, signal};
            signal(SignalKind::hangup()).expect("failed to register SIGHUP handler")
        };

        let mut interval = tokio::time::interval(reload_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The immediate first tick would re-load what main just loaded.
        interval.tick().await;

        loop {
            #[cfg(unix)]
            tokio::select! {
                _ = interval.tick() => {},
                _ = sighup.recv() => {
                    info!("SIGHUP received, reloading config from {:?}", config_path);
                }
            }
            #[cfg(not(unix))]
            interval.tick().await;

            let new_cfg = match ProxyConfig::load(&config_path) {
                Ok(c) => c,
                Err(e) => {
                    error!("config reload: failed to parse {:?}: {}", config_path, e);
                    continue;
                }
            };

            if let Err(e) = new_cfg.validate() {
                error!("config reload: validation failed: {}; keeping old config", e);
                continue;
            }

            let old_cfg = config_tx.borrow().clone();
            warn_non_hot_changes(&old_cfg, &new_cfg);

            let old_hot = HotFields::from_config(&old_cfg);
            let new_hot = HotFields::from_config(&new_cfg);

            if old_hot.resolve_names != new_hot.resolve_names {
                info!(
                    "config reload: acl.resolve_names: {} -> {}",
                    old_hot.resolve_names, new_hot.resolve_names
                );
            }

            // Re-read the rule file even when the path is unchanged:
            // SIGHUP is how an edited rule file is picked up.
            match &new_hot.acl_path {
                Some(path) => match Acl::load(path) {
                    Ok(rules) => {
                        acl.replace(rules);
                        pool.drain();
                        info!(path = %path.display(), "acl rules reloaded");
                    }
                    Err(e) => {
                        error!("config reload: acl reload failed: {e}; keeping old rules");
                        continue;
                    }
                },
                None => {
                    if old_hot.acl_path.is_some() {
                        warn!("config reload: acl.path removed; keeping old rules until restart");
                    }
                }
            }

            config_tx.send(Arc::new(new_cfg)).ok();
        }
    });
}
