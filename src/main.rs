use std::sync::Arc;

use anyhow::Result;
use clap::{ArgAction, Parser};
use serde_json::Value;
use tracing::{debug, info, warn};

use livebridge::config::Config;
use livebridge::{log, signal, HandleId, HostCallbacks, Jsep, Plugin};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Verbose mode [default: config level, -v "info", -vv "debug", -vvv "trace"]
    #[arg(short = 'v', action = ArgAction::Count, default_value_t = 0)]
    verbose: u8,
    /// Config file path
    #[arg(short, long)]
    config: Option<String>,
}

/// Stand-in host for running the plugin outside a gateway: relays go to the
/// log, events too.
struct TracingHost;

impl HostCallbacks for TracingHost {
    fn relay_rtp(&self, handle: HandleId, video: bool, data: &[u8]) {
        debug!(
            "relay rtp [{:?}] {} {} bytes",
            handle,
            if video { "video" } else { "audio" },
            data.len()
        );
    }

    fn relay_rtcp(&self, handle: HandleId, video: bool, data: &[u8]) {
        debug!(
            "relay rtcp [{:?}] {} {} bytes",
            handle,
            if video { "video" } else { "audio" },
            data.len()
        );
    }

    fn push_event(&self, handle: HandleId, transaction: &str, event: Value, jsep: Option<Jsep>) {
        info!(
            "event [{:?}] tx={} {} jsep={}",
            handle,
            transaction,
            event,
            jsep.is_some()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = Config::parse(args.config)?;

    let level = match args.verbose {
        0 => cfg.log.level.clone(),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    log::set(level);

    let plugin = Plugin::init(cfg, Arc::new(TracingHost))?;
    info!("=== rtsp server ready on {} ===", plugin.rtsp_addr());

    let msg = signal::wait_for_stop_signal().await;
    warn!("Received signal: {}", msg);
    plugin.destroy().await;
    Ok(())
}
