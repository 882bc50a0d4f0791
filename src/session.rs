use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use registry::CreateStream;
use rtsp::{element, Codec, Mountpoint, PipelineContext, PipelineSpec, StreamKind, StreamSpec};

use crate::error::{ErrorCode, PluginError};
use crate::net::{GlueSocket, SocketFactory};
use crate::rtcp;
use crate::sdp;
use crate::{HandleId, Jsep, PluginContext};

/// Seed for slow-link halving while the session is unbounded.
const SLOWLINK_SEED_BITRATE: u32 = 512_000;
/// Floor the slow-link halving never goes below.
const SLOWLINK_FLOOR_BITRATE: u32 = 64_000;

struct Negotiated {
    codec: Codec,
    pt: u8,
}

/// The five glue sockets of one stream kind, in provisioning order.
struct StreamSockets {
    rtp_srv: GlueSocket,
    rtp_cli: GlueSocket,
    rtcp_rcv_srv: GlueSocket,
    rtcp_rcv_cli: GlueSocket,
    rtcp_snd_srv: GlueSocket,
}

impl StreamSockets {
    async fn provision(factory: &SocketFactory) -> anyhow::Result<Self> {
        let rtp_srv = factory.open_server().await?;
        let rtp_cli = factory.open_client(rtp_srv.port()).await?;
        let rtcp_rcv_srv = factory.open_server().await?;
        let rtcp_rcv_cli = factory.open_client(rtcp_rcv_srv.port()).await?;
        let rtcp_snd_srv = factory.open_server().await?;
        Ok(StreamSockets {
            rtp_srv,
            rtp_cli,
            rtcp_rcv_srv,
            rtcp_rcv_cli,
            rtcp_snd_srv,
        })
    }

    fn close_all(&mut self) {
        self.rtp_srv.close();
        self.rtp_cli.close();
        self.rtcp_rcv_srv.close();
        self.rtcp_rcv_cli.close();
        self.rtcp_snd_srv.close();
    }
}

/// Everything `setup_media` provisions; torn down as a unit on destroy.
struct MediaGlue {
    video: Option<Negotiated>,
    audio: Option<Negotiated>,
    video_sockets: StreamSockets,
    audio_sockets: StreamSockets,
    ctx: Arc<PipelineContext>,
}

/// One attached peer. Lives in the facade's sessions map; the media pumps
/// hold only weak references back.
pub struct Session {
    pub handle: HandleId,
    id: Mutex<Option<String>>,
    rtsp_url: Mutex<Option<String>>,
    registry_id: Mutex<Option<String>>,
    audio_active: AtomicBool,
    video_active: AtomicBool,
    bitrate: AtomicU32,
    video_ssrc: AtomicU32,
    slowlink_count: AtomicU32,
    hanging_up: AtomicBool,
    destroyed: AtomicBool,
    destroyed_at: Mutex<Option<Instant>>,
    media: Mutex<Option<MediaGlue>>,
}

impl Session {
    pub(crate) fn new(handle: HandleId) -> Self {
        Session {
            handle,
            id: Mutex::new(None),
            rtsp_url: Mutex::new(None),
            registry_id: Mutex::new(None),
            audio_active: AtomicBool::new(true),
            video_active: AtomicBool::new(true),
            bitrate: AtomicU32::new(0),
            video_ssrc: AtomicU32::new(0),
            slowlink_count: AtomicU32::new(0),
            hanging_up: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            destroyed_at: Mutex::new(None),
            media: Mutex::new(None),
        }
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub(crate) fn destroyed_for(&self) -> Option<Duration> {
        self.destroyed_at.lock().unwrap().map(|at| at.elapsed())
    }

    pub(crate) fn query(&self) -> Value {
        json!({
            "audio_active": self.audio_active.load(Ordering::Relaxed),
            "video_active": self.video_active.load(Ordering::Relaxed),
            "bitrate": self.bitrate.load(Ordering::Relaxed),
            "slowlink_count": self.slowlink_count.load(Ordering::Relaxed),
            "destroyed": self.is_destroyed(),
        })
    }

    pub(crate) async fn handle_message(
        self: &Arc<Self>,
        pc: &Arc<PluginContext>,
        transaction: &str,
        message: Value,
        jsep: Option<Jsep>,
    ) {
        if let Err(err) = self.process_message(pc, transaction, message, jsep).await {
            warn!("[{:?}] message failed: {}", self.handle, err);
            pc.host.push_event(self.handle, transaction, err.event(), None);
        }
    }

    async fn process_message(
        self: &Arc<Self>,
        pc: &Arc<PluginContext>,
        transaction: &str,
        message: Value,
        jsep: Option<Jsep>,
    ) -> Result<(), PluginError> {
        let body = message.as_object().ok_or_else(|| {
            PluginError::new(ErrorCode::InvalidJson, "message is not a JSON object")
        })?;

        if let Some(value) = body.get("audio") {
            let active = value
                .as_bool()
                .ok_or_else(|| PluginError::invalid_element("audio"))?;
            self.audio_active.store(active, Ordering::Relaxed);
        }
        if let Some(value) = body.get("video") {
            let active = value
                .as_bool()
                .ok_or_else(|| PluginError::invalid_element("video"))?;
            let before = self.video_active.swap(active, Ordering::Relaxed);
            if active && !before {
                // Ask for a keyframe so the re-enabled stream restarts clean.
                self.send_pli(pc);
            }
        }
        if let Some(value) = body.get("bitrate") {
            let bitrate = value
                .as_u64()
                .and_then(|b| u32::try_from(b).ok())
                .ok_or_else(|| PluginError::invalid_element("bitrate"))?;
            self.bitrate.store(bitrate, Ordering::Relaxed);
            if bitrate > 0 {
                self.send_remb(pc, bitrate);
            }
        }
        if let Some(value) = body.get("record") {
            value
                .as_bool()
                .ok_or_else(|| PluginError::invalid_element("record"))?;
        }
        if let Some(value) = body.get("filename") {
            value
                .as_str()
                .ok_or_else(|| PluginError::invalid_element("filename"))?;
        }
        if let Some(value) = body.get("id") {
            let id = value
                .as_str()
                .ok_or_else(|| PluginError::invalid_element("id"))?;
            *self.id.lock().unwrap() = Some(id.to_string());
        }

        match jsep {
            Some(jsep) => self.setup_media(pc, transaction, jsep).await,
            None => {
                pc.host.push_event(
                    self.handle,
                    transaction,
                    json!({"source": "event", "result": "ok"}),
                    None,
                );
                Ok(())
            }
        }
    }

    /// The SDP path: munge, pick a codec, provision the glue, publish the
    /// mountpoint, register, answer.
    async fn setup_media(
        self: &Arc<Self>,
        pc: &Arc<PluginContext>,
        transaction: &str,
        jsep: Jsep,
    ) -> Result<(), PluginError> {
        let munged = sdp::munge_offer(&jsep.sdp);
        let priority = pc.config.codec.list();
        let chosen = sdp::select_video_codec_by_priority(&munged, &priority);
        let answer_sdp = sdp::rewrite_video_line(&munged, chosen);

        let video = sdp::first_media_codec(&answer_sdp, "video")
            .filter(|(codec, _)| codec.is_video())
            .map(|(codec, pt)| Negotiated { codec, pt });
        let audio = sdp::first_media_codec(&answer_sdp, "audio")
            .filter(|(codec, _)| !codec.is_video())
            .map(|(codec, pt)| Negotiated { codec, pt });

        if video.is_none() && audio.is_none() {
            // Nothing negotiable; the session stays valid without a pipeline.
            debug!("[{:?}] offer carries no usable media", self.handle);
            self.push_ok(pc, transaction, &jsep, answer_sdp);
            return Ok(());
        }

        let id = {
            let mut id = self.id.lock().unwrap();
            id.get_or_insert_with(|| Uuid::new_v4().simple().to_string())
                .clone()
        };
        let listen = pc
            .config
            .rtsp_listen()
            .map_err(|e| PluginError::internal(e))?;
        let rtsp_url = format!(
            "rtsp://{}:{}/{}",
            pc.config.rtsp.interface,
            listen.port(),
            id
        );

        // Provisioning order is fixed; a failure drops the partial set and
        // every port goes straight back to the pool.
        let factory = SocketFactory::new(pc.pool.clone());
        let mut video_sockets = StreamSockets::provision(&factory)
            .await
            .map_err(|e| PluginError::internal(format!("socket provisioning failed: {}", e)))?;
        let mut audio_sockets = StreamSockets::provision(&factory)
            .await
            .map_err(|e| PluginError::internal(format!("socket provisioning failed: {}", e)))?;

        let spec = PipelineSpec {
            video: video.as_ref().map(|v| StreamSpec {
                kind: StreamKind::Video,
                codec: v.codec,
                payload_type: v.pt,
                rtcp_send_port: video_sockets.rtcp_snd_srv.port(),
            }),
            audio: audio.as_ref().map(|a| StreamSpec {
                kind: StreamKind::Audio,
                codec: a.codec,
                payload_type: a.pt,
                rtcp_send_port: audio_sockets.rtcp_snd_srv.port(),
            }),
        };

        // RTCP return path: whatever the pipeline emits on the snd sockets
        // goes back to the peer through the host relay.
        self.attach_rtcp_return(pc, &mut video_sockets.rtcp_snd_srv, true);
        self.attach_rtcp_return(pc, &mut audio_sockets.rtcp_snd_srv, false);

        if let Some(url) = &pc.config.registry.status_service_url {
            let record = pc
                .registry
                .create(
                    url,
                    &CreateStream {
                        uri: rtsp_url.clone(),
                        id: id.clone(),
                    },
                )
                .await;
            match record {
                Ok(record) if record.is_duplicate() => {
                    self.hangup_media(pc);
                    return Err(PluginError::new(
                        ErrorCode::InvalidUrlId,
                        format!("stream id {} is already registered", id),
                    ));
                }
                Ok(record) => {
                    *self.registry_id.lock().unwrap() = record.id;
                }
                Err(e) => {
                    // Mountpoint is still published without registry state.
                    warn!("[{:?}] registry create failed: {}", self.handle, e);
                }
            }
        }

        let mut shared = HashMap::new();
        shared.insert(element::VIDEO_RTP_SRC, video_sockets.rtp_srv.shared());
        shared.insert(element::VIDEO_RTCP_SRC, video_sockets.rtcp_rcv_srv.shared());
        shared.insert(element::AUDIO_RTP_SRC, audio_sockets.rtp_srv.shared());
        shared.insert(element::AUDIO_RTCP_SRC, audio_sockets.rtcp_rcv_srv.shared());
        let ctx = Arc::new(PipelineContext::new(id.clone(), rtsp_url.clone(), shared));

        let mount = Mountpoint::new(format!("/{}", id), spec, ctx.clone());
        pc.rtsp
            .add_mountpoint(mount)
            .map_err(|e| PluginError::internal(e))?;

        *self.media.lock().unwrap() = Some(MediaGlue {
            video,
            audio,
            video_sockets,
            audio_sockets,
            ctx,
        });
        *self.rtsp_url.lock().unwrap() = Some(rtsp_url.clone());

        info!("[{:?}] published {}", self.handle, rtsp_url);
        self.push_ok(pc, transaction, &jsep, answer_sdp);
        Ok(())
    }

    fn push_ok(&self, pc: &PluginContext, transaction: &str, offer: &Jsep, sdp: String) {
        let kind = match offer.kind.as_str() {
            "offer" => "answer",
            "answer" => "offer",
            other => other,
        };
        pc.host.push_event(
            self.handle,
            transaction,
            json!({"source": "event", "result": "ok"}),
            Some(Jsep {
                kind: kind.to_string(),
                sdp,
            }),
        );
    }

    fn attach_rtcp_return(
        self: &Arc<Self>,
        pc: &Arc<PluginContext>,
        socket: &mut GlueSocket,
        video: bool,
    ) {
        let weak: Weak<Session> = Arc::downgrade(self);
        let pc = pc.clone();
        socket.attach_read(move |data| {
            if pc.is_stopping() {
                return false;
            }
            match weak.upgrade() {
                Some(session) if !session.is_destroyed() => {
                    pc.host.relay_rtcp(session.handle, video, data);
                    true
                }
                _ => false,
            }
        });
    }

    /// Relay path: synchronous, non-blocking, nothing escapes the call.
    pub(crate) fn incoming_rtp(&self, video: bool, data: &[u8]) {
        if self.is_destroyed() || self.hanging_up.load(Ordering::Relaxed) {
            return;
        }
        if video {
            if let Some(ssrc) = rtcp::rtp_ssrc(data) {
                self.video_ssrc.store(ssrc, Ordering::Relaxed);
            }
            if !self.video_active.load(Ordering::Relaxed) {
                return;
            }
        } else if !self.audio_active.load(Ordering::Relaxed) {
            return;
        }
        let media = self.media.lock().unwrap();
        if let Some(glue) = media.as_ref() {
            let socket = if video {
                &glue.video_sockets.rtp_cli
            } else {
                &glue.audio_sockets.rtp_cli
            };
            socket.try_send(data);
        }
    }

    pub(crate) fn incoming_rtcp(&self, video: bool, data: &[u8]) {
        if self.is_destroyed() || self.hanging_up.load(Ordering::Relaxed) {
            return;
        }
        let media = self.media.lock().unwrap();
        if let Some(glue) = media.as_ref() {
            let socket = if video {
                &glue.video_sockets.rtcp_rcv_cli
            } else {
                &glue.audio_sockets.rtcp_rcv_cli
            };
            socket.try_send(data);
        }
    }

    pub(crate) fn slow_link(&self, pc: &PluginContext, uplink: bool, video: bool) {
        self.slowlink_count.fetch_add(1, Ordering::Relaxed);
        if !video || uplink {
            return;
        }
        let current = self.bitrate.load(Ordering::Relaxed);
        let base = if current == 0 {
            SLOWLINK_SEED_BITRATE
        } else {
            current
        };
        let capped = (base / 2).max(SLOWLINK_FLOOR_BITRATE);
        self.bitrate.store(capped, Ordering::Relaxed);
        self.send_remb(pc, capped);
        pc.host.push_event(
            self.handle,
            "",
            json!({"source": "event", "result": {"status": "slow_link", "bitrate": capped}}),
            None,
        );
    }

    /// Nudges the encoder once the media path is up.
    pub(crate) fn media_ready(&self, pc: &PluginContext) {
        let wants_keyframe = self
            .media
            .lock()
            .unwrap()
            .as_ref()
            .map(|glue| glue.video.is_some())
            .unwrap_or(true);
        if wants_keyframe {
            self.send_pli(pc);
        }
    }

    pub(crate) fn hangup_media(&self, pc: &PluginContext) {
        if self.hanging_up.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[{:?}] hanging up", self.handle);
        pc.host.push_event(
            self.handle,
            "",
            json!({"source": "event", "result": "done"}),
            None,
        );
        self.audio_active.store(true, Ordering::Relaxed);
        self.video_active.store(true, Ordering::Relaxed);
        self.bitrate.store(0, Ordering::Relaxed);
    }

    /// Tears the session down: mountpoint, registry record, sockets. Runs
    /// on the message handler; the reaper frees the carcass later.
    pub(crate) async fn destroy(self: &Arc<Self>, pc: &Arc<PluginContext>) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        let media = self.media.lock().unwrap().take();
        if let Some(mut glue) = media {
            debug!(
                "[{:?}] releasing glue (video: {}, audio: {})",
                self.handle,
                glue.video.is_some(),
                glue.audio.is_some()
            );
            let path = format!("/{}", glue.ctx.id);
            let (done_tx, done_rx) = oneshot::channel();
            if pc.rtsp.remove_mountpoint(&path, Some(done_tx)).is_ok() {
                // Wait for the runtime to let go of the borrowed sockets
                // before the ports return to the pool.
                let _ = tokio::time::timeout(Duration::from_secs(2), done_rx).await;
            }

            let registry_id = self.registry_id.lock().unwrap().take();
            if let (Some(url), Some(registry_id)) =
                (&pc.config.registry.status_service_url, registry_id)
            {
                if let Err(e) = pc.registry.delete(url, &registry_id).await {
                    warn!("[{:?}] registry delete failed: {}", self.handle, e);
                }
            }

            glue.video_sockets.close_all();
            glue.audio_sockets.close_all();
        }
        self.id.lock().unwrap().take();
        self.rtsp_url.lock().unwrap().take();
        *self.destroyed_at.lock().unwrap() = Some(Instant::now());
        pc.enqueue_reap(self.clone());
        info!("[{:?}] destroyed", self.handle);
    }

    fn send_pli(&self, pc: &PluginContext) {
        match rtcp::pli(self.video_ssrc.load(Ordering::Relaxed)) {
            Ok(data) => pc.host.relay_rtcp(self.handle, true, &data),
            Err(e) => warn!("[{:?}] pli build failed: {}", self.handle, e),
        }
    }

    fn send_remb(&self, pc: &PluginContext, bitrate: u32) {
        match rtcp::remb(self.video_ssrc.load(Ordering::Relaxed), bitrate) {
            Ok(data) => pc.host.relay_rtcp(self.handle, true, &data),
            Err(e) => warn!("[{:?}] remb build failed: {}", self.handle, e),
        }
    }
}
