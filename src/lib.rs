use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rtsp::{RtspHandle, RtspRuntime, RuntimeConfig};

use crate::config::Config;
use crate::error::{ErrorCode, PluginError};
use crate::net::PortPool;
use crate::session::Session;

pub mod config;
pub mod error;
pub mod log;
pub mod net;
pub mod rtcp;
pub mod sdp;
pub mod session;
pub mod signal;

mod keepalive;

pub const PLUGIN_NAME: &str = "livebridge";
pub const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Host plugin ABI compatibility version.
pub const API_VERSION: u32 = 1;

/// Opaque host handle identifying one attached peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Jsep {
    #[serde(rename = "type")]
    pub kind: String,
    pub sdp: String,
}

/// Outbound surface toward the host gateway. Relay calls happen on the
/// media path and must not block.
pub trait HostCallbacks: Send + Sync + 'static {
    fn relay_rtp(&self, handle: HandleId, video: bool, data: &[u8]);
    fn relay_rtcp(&self, handle: HandleId, video: bool, data: &[u8]);
    fn push_event(&self, handle: HandleId, transaction: &str, event: Value, jsep: Option<Jsep>);
}

/// Synchronous outcome of `handle_message`; everything else arrives as a
/// pushed event.
#[derive(Debug)]
pub enum MessageResult {
    OkWait,
    Error(PluginError),
}

enum PluginMessage {
    Handle {
        session: Arc<Session>,
        transaction: String,
        message: Value,
        jsep: Option<Jsep>,
    },
    Destroy {
        session: Arc<Session>,
    },
}

/// Process-wide state. Tests instantiate several side by side.
pub(crate) struct PluginContext {
    pub config: Config,
    pub pool: Arc<PortPool>,
    pub sessions: RwLock<HashMap<HandleId, Arc<Session>>>,
    pub rtsp: RtspHandle,
    pub registry: registry::Client,
    pub host: Arc<dyn HostCallbacks>,
    pub process_id: String,
    stopping: AtomicBool,
    reap: Mutex<Vec<Arc<Session>>>,
}

impl PluginContext {
    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub(crate) fn enqueue_reap(&self, session: Arc<Session>) {
        self.reap.lock().unwrap().push(session);
    }

    pub(crate) fn reap_older_than(&self, age: Duration) {
        let mut reap = self.reap.lock().unwrap();
        reap.retain(|session| match session.destroyed_for() {
            Some(elapsed) => elapsed < age,
            None => true,
        });
    }

    fn session(&self, handle: HandleId) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(&handle).cloned()
    }
}

/// The host-facing plugin: owns the singletons and the worker loops.
pub struct Plugin {
    ctx: Arc<PluginContext>,
    messages: UnboundedSender<PluginMessage>,
    message_task: JoinHandle<()>,
    keepalive_task: JoinHandle<()>,
    watchdog_task: JoinHandle<()>,
    rtsp_runtime: RtspRuntime,
}

impl Plugin {
    /// Boots the plugin: config, port pool, HTTP, message handler, RTSP
    /// runtime, process id, keepalive. Must run inside a tokio runtime.
    pub fn init(config: Config, host: Arc<dyn HostCallbacks>) -> Result<Plugin> {
        config.validate()?;
        let (min_port, max_port) = config.udp.range()?;
        let pool = Arc::new(PortPool::new(min_port, max_port)?);

        let rtsp_runtime = RtspRuntime::spawn(RuntimeConfig {
            listen: config.rtsp_listen()?,
            interface: config.rtsp.interface.clone(),
            session_timeout: 60,
        })?;

        let process_id = Uuid::new_v4().to_string();
        let ctx = Arc::new(PluginContext {
            config,
            pool,
            sessions: RwLock::new(HashMap::new()),
            rtsp: rtsp_runtime.handle(),
            registry: registry::Client::new(),
            host,
            process_id,
            stopping: AtomicBool::new(false),
            reap: Mutex::new(Vec::new()),
        });

        let (messages, message_rx) = unbounded_channel();
        let message_task = tokio::spawn(message_loop(ctx.clone(), message_rx));
        let keepalive_task = keepalive::spawn(ctx.clone());
        let watchdog_task = keepalive::spawn_watchdog(ctx.clone());

        info!(
            "{} v{} up (pid {}, rtsp {})",
            PLUGIN_NAME,
            PLUGIN_VERSION,
            ctx.process_id,
            rtsp_runtime.local_addr()
        );

        Ok(Plugin {
            ctx,
            messages,
            message_task,
            keepalive_task,
            watchdog_task,
            rtsp_runtime,
        })
    }

    /// Address the embedded RTSP server actually bound.
    pub fn rtsp_addr(&self) -> std::net::SocketAddr {
        self.rtsp_runtime.local_addr()
    }

    /// Glue ports currently drawn from the pool, across all sessions.
    pub fn ports_in_use(&self) -> usize {
        self.ctx.pool.allocated()
    }

    pub fn create_session(&self, handle: HandleId) -> Result<()> {
        if self.ctx.is_stopping() {
            return Err(anyhow!("plugin is stopping"));
        }
        let mut sessions = self.ctx.sessions.write().unwrap();
        if sessions.contains_key(&handle) {
            return Err(anyhow!("session {:?} already exists", handle));
        }
        sessions.insert(handle, Arc::new(Session::new(handle)));
        debug!("session {:?} created", handle);
        Ok(())
    }

    /// Validates the envelope synchronously (411/412) and queues the rest
    /// for the message handler.
    pub fn handle_message(
        &self,
        handle: HandleId,
        transaction: &str,
        message: Option<&str>,
        jsep: Option<&str>,
    ) -> MessageResult {
        if self.ctx.is_stopping() {
            return MessageResult::Error(PluginError::internal("plugin is stopping"));
        }
        let Some(session) = self.ctx.session(handle) else {
            return MessageResult::Error(PluginError::internal("no such session"));
        };
        let Some(raw) = message else {
            return MessageResult::Error(PluginError::new(ErrorCode::NoMessage, "no message"));
        };
        let message: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(e) => {
                return MessageResult::Error(PluginError::new(
                    ErrorCode::InvalidJson,
                    format!("invalid json: {}", e),
                ))
            }
        };
        let jsep: Option<Jsep> = match jsep {
            Some(raw) => match serde_json::from_str(raw) {
                Ok(jsep) => Some(jsep),
                Err(e) => {
                    return MessageResult::Error(PluginError::new(
                        ErrorCode::InvalidJson,
                        format!("invalid jsep: {}", e),
                    ))
                }
            },
            None => None,
        };

        let queued = self.messages.send(PluginMessage::Handle {
            session,
            transaction: transaction.to_string(),
            message,
            jsep,
        });
        match queued {
            Ok(()) => MessageResult::OkWait,
            Err(_) => MessageResult::Error(PluginError::internal("message handler is gone")),
        }
    }

    /// The peer's media path is up.
    pub fn setup_media(&self, handle: HandleId) {
        if self.ctx.is_stopping() {
            return;
        }
        if let Some(session) = self.ctx.session(handle) {
            session.media_ready(&self.ctx);
        }
    }

    pub fn incoming_rtp(&self, handle: HandleId, video: bool, data: &[u8]) {
        if self.ctx.is_stopping() {
            return;
        }
        if let Some(session) = self.ctx.session(handle) {
            session.incoming_rtp(video, data);
        }
    }

    pub fn incoming_rtcp(&self, handle: HandleId, video: bool, data: &[u8]) {
        if self.ctx.is_stopping() {
            return;
        }
        if let Some(session) = self.ctx.session(handle) {
            session.incoming_rtcp(video, data);
        }
    }

    /// Data channel traffic is accepted and ignored.
    pub fn incoming_data(&self, _handle: HandleId, _data: &[u8]) {}

    pub fn slow_link(&self, handle: HandleId, uplink: bool, video: bool) {
        if self.ctx.is_stopping() {
            return;
        }
        if let Some(session) = self.ctx.session(handle) {
            session.slow_link(&self.ctx, uplink, video);
        }
    }

    pub fn hangup_media(&self, handle: HandleId) {
        if let Some(session) = self.ctx.session(handle) {
            session.hangup_media(&self.ctx);
        }
    }

    /// Removes the session and queues its teardown behind any in-flight
    /// messages. Destroying an unknown or already-destroyed session is a
    /// no-op.
    pub fn destroy_session(&self, handle: HandleId) -> Result<()> {
        let removed = self.ctx.sessions.write().unwrap().remove(&handle);
        let Some(session) = removed else {
            return Ok(());
        };
        if session.is_destroyed() {
            return Ok(());
        }
        self.messages
            .send(PluginMessage::Destroy { session })
            .map_err(|_| anyhow!("message handler is gone"))
    }

    pub fn query_session(&self, handle: HandleId) -> Result<Value> {
        let session = self
            .ctx
            .session(handle)
            .ok_or_else(|| anyhow!("no such session"))?;
        Ok(session.query())
    }

    /// Full shutdown in the fixed order: stop intake, drain the message
    /// handler, tear down sessions, stop the RTSP runtime, deregister the
    /// process id, stop the watchdog.
    pub async fn destroy(self) {
        let Plugin {
            ctx,
            messages,
            message_task,
            keepalive_task,
            watchdog_task,
            rtsp_runtime,
        } = self;

        ctx.stopping.store(true, Ordering::SeqCst);
        drop(messages);
        if let Err(e) = message_task.await {
            warn!("message handler ended badly: {}", e);
        }

        let sessions: Vec<Arc<Session>> =
            ctx.sessions.write().unwrap().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.destroy(&ctx).await;
        }

        let _ = tokio::task::spawn_blocking(move || rtsp_runtime.shutdown()).await;

        keepalive_task.abort();
        if let Some(url) = &ctx.config.registry.keepalive_service_url {
            if let Err(e) = ctx.registry.delete(url, &ctx.process_id).await {
                warn!("keepalive deregistration failed: {}", e);
            }
        }
        watchdog_task.abort();
        ctx.reap_older_than(Duration::ZERO);
        info!("{} destroyed", PLUGIN_NAME);
    }
}

/// Single consumer of the message queue; everything SDP- or HTTP-shaped
/// runs here, in FIFO order per session.
async fn message_loop(ctx: Arc<PluginContext>, mut rx: UnboundedReceiver<PluginMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            PluginMessage::Handle {
                session,
                transaction,
                message,
                jsep,
            } => {
                if ctx.is_stopping() || session.is_destroyed() {
                    continue;
                }
                session
                    .handle_message(&ctx, &transaction, message, jsep)
                    .await;
            }
            PluginMessage::Destroy { session } => {
                session.destroy(&ctx).await;
            }
        }
    }
    debug!("message handler drained");
}
