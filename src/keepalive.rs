use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use registry::Heartbeat;

use crate::PluginContext;

/// How long a destroyed session lingers before the reaper frees it.
const REAP_AFTER: Duration = Duration::from_secs(5);
const REAP_PERIOD: Duration = Duration::from_millis(500);

/// Periodic heartbeat toward the registry, on its own HTTP handle.
pub(crate) fn spawn(pc: Arc<PluginContext>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(url) = pc.config.registry.keepalive_service_url.clone() else {
            debug!("no keepalive service configured");
            return;
        };
        let client = registry::Client::new();
        let interval = pc.config.registry.keepalive_interval;
        let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if pc.is_stopping() {
                break;
            }
            let beat = Heartbeat {
                pid: pc.process_id.clone(),
                dly: interval.to_string(),
            };
            if let Err(e) = client.keepalive(&url, &beat).await {
                warn!("keepalive failed: {}", e);
            }
        }
    })
}

/// Lazy-free garbage collector for destroyed sessions.
pub(crate) fn spawn_watchdog(pc: Arc<PluginContext>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(REAP_PERIOD);
        loop {
            ticker.tick().await;
            if pc.is_stopping() {
                break;
            }
            pc.reap_older_than(REAP_AFTER);
        }
    })
}
