// Flush the cache index when the process is asked to terminate.

use std::sync::{Arc, Weak};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::span_cache::SpanCache;

/// Spawn a task that flushes `cache` on Ctrl-C / SIGINT.
///
/// Holds only a weak reference, so the hook never keeps the cache alive;
/// if the cache was already dropped its own `Drop` has flushed it.
pub fn flush_on_shutdown(cache: &Arc<SpanCache>) -> JoinHandle<()> {
    let weak: Weak<SpanCache> = Arc::downgrade(cache);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("shutdown hook unavailable: {}", e);
            return;
        }
        if let Some(cache) = weak.upgrade() {
            match cache.flush() {
                Ok(()) => info!("cache index flushed on shutdown"),
                Err(e) => warn!("cache flush on shutdown failed: {}", e),
            }
        }
    })
}
