use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use webrtc::rtp::packet::Packet;
use webrtc::util::{Marshal, Unmarshal};

use crate::mountpoint::PipelineContext;
use crate::types::{Codec, StreamKind};

/// Payload type the video stream is repackaged to on the RTSP side.
pub const VIDEO_OUTPUT_PT: u8 = 96;
/// Payload type the audio stream is repackaged to on the RTSP side.
pub const AUDIO_OUTPUT_PT: u8 = 127;

/// Names of the UDP source slots the runtime rebinds at the Prepared
/// transition. These are the only load-bearing element names besides
/// `pay0`/`pay1`.
pub mod element {
    pub const VIDEO_RTP_SRC: &str = "video_rtp_srv";
    pub const VIDEO_RTCP_SRC: &str = "video_rtcp_rcv_srv";
    pub const AUDIO_RTP_SRC: &str = "audio_rtp_srv";
    pub const AUDIO_RTCP_SRC: &str = "audio_rtcp_rcv_srv";
}

/// One negotiated elementary stream of a mountpoint pipeline.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub kind: StreamKind,
    pub codec: Codec,
    /// Payload type the gateway relays toward us.
    pub payload_type: u8,
    /// Loopback port of the `*_rtcp_snd_srv` socket the pipeline's RTCP-out
    /// sink is aimed at.
    pub rtcp_send_port: u16,
}

impl StreamSpec {
    pub fn output_pt(&self) -> u8 {
        match self.kind {
            StreamKind::Video => VIDEO_OUTPUT_PT,
            StreamKind::Audio => AUDIO_OUTPUT_PT,
        }
    }

    pub fn rtp_src_name(&self) -> &'static str {
        match self.kind {
            StreamKind::Video => element::VIDEO_RTP_SRC,
            StreamKind::Audio => element::AUDIO_RTP_SRC,
        }
    }

    pub fn rtcp_src_name(&self) -> &'static str {
        match self.kind {
            StreamKind::Video => element::VIDEO_RTCP_SRC,
            StreamKind::Audio => element::AUDIO_RTCP_SRC,
        }
    }

    fn caps(&self) -> String {
        match self.kind {
            StreamKind::Video => format!(
                "application/x-rtp, media=video, payload={}, encoding-name={}, \
                 clock-rate=90000, rtcp-fb-nack-pli=1, rtcp-fb-nack=1, \
                 rtcp-fb-ccm-fir=1, rtp-profile=3",
                self.payload_type,
                self.codec.encoding_name()
            ),
            StreamKind::Audio => format!(
                "application/x-rtp, media=audio, payload={}, encoding-name={}, \
                 clock-rate=48000, encoding-params=1, rtp-profile=3",
                self.payload_type,
                self.codec.encoding_name()
            ),
        }
    }

    fn fragment(&self, pay_index: usize) -> String {
        let label = self.kind.label();
        format!(
            "udpsrc name={rtp_src} caps=\"{caps}\" ! {depay} ! {pay} pt={out_pt} name=pay{idx} \
             udpsrc name={rtcp_src} ! {label}_rtcp.recv_rtcp_sink \
             rtpsession name={label}_rtcp \
             {label}_rtcp.send_rtcp_src ! udpsink host=127.0.0.1 port={snd_port} sync=false async=false",
            rtp_src = self.rtp_src_name(),
            caps = self.caps(),
            depay = self.codec.depay(),
            pay = self.codec.pay(),
            out_pt = self.output_pt(),
            idx = pay_index,
            rtcp_src = self.rtcp_src_name(),
            label = label,
            snd_port = self.rtcp_send_port,
        )
    }
}

/// The negotiated pipeline of a mountpoint: at most one video and one audio
/// stream, video first when both are present.
#[derive(Debug, Clone, Default)]
pub struct PipelineSpec {
    pub video: Option<StreamSpec>,
    pub audio: Option<StreamSpec>,
}

impl PipelineSpec {
    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }

    /// Streams in payloader order: `pay0` first, `pay1` second.
    pub fn streams(&self) -> Vec<&StreamSpec> {
        self.video.iter().chain(self.audio.iter()).collect()
    }

    pub fn stream(&self, kind: StreamKind) -> Option<&StreamSpec> {
        match kind {
            StreamKind::Video => self.video.as_ref(),
            StreamKind::Audio => self.audio.as_ref(),
        }
    }

    /// Renders the declarative launch description of the pipeline.
    pub fn launch(&self) -> String {
        let parts: Vec<String> = self
            .streams()
            .iter()
            .enumerate()
            .map(|(idx, stream)| stream.fragment(idx))
            .collect();
        format!("( {} )", parts.join(" "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Provisioned,
    Prepared,
    Playing,
    Teardown,
}

/// Executes a `PipelineSpec` once the pre-bound sockets are adopted.
///
/// The sockets stay owned by the session controller; this side only holds
/// borrowed clones and must never close them.
pub struct Pipeline {
    spec: PipelineSpec,
    state: Mutex<PipelineState>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    pub fn new(spec: PipelineSpec) -> Self {
        Pipeline {
            spec,
            state: Mutex::new(PipelineState::Provisioned),
            pumps: Mutex::new(Vec::new()),
        }
    }

    pub fn spec(&self) -> &PipelineSpec {
        &self.spec
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap()
    }

    /// Adopts the pre-bound server sockets out of `ctx` by element name and
    /// starts the media pumps. Runs exactly once; later calls are no-ops.
    pub fn prepare(&self, ctx: &Arc<PipelineContext>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if *state != PipelineState::Provisioned {
            return Ok(());
        }

        let mut pumps = self.pumps.lock().unwrap();
        for stream in self.spec.streams() {
            let rtp = ctx
                .take_socket(stream.rtp_src_name())
                .ok_or_else(|| anyhow!("no socket bound for {}", stream.rtp_src_name()))?;
            let rtcp = ctx
                .take_socket(stream.rtcp_src_name())
                .ok_or_else(|| anyhow!("no socket bound for {}", stream.rtcp_src_name()))?;

            pumps.push(tokio::spawn(rtp_pump(
                rtp,
                ctx.clone(),
                stream.kind,
                stream.output_pt(),
            )));
            pumps.push(tokio::spawn(rtcp_pump(rtcp, ctx.clone(), stream.kind)));
        }

        *state = PipelineState::Prepared;
        debug!("[{}] pipeline prepared", ctx.id);
        Ok(())
    }

    pub fn set_playing(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == PipelineState::Prepared {
            *state = PipelineState::Playing;
        }
    }

    /// Stops the pumps and drops the borrowed sockets. Idempotent.
    pub fn teardown(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == PipelineState::Teardown {
            return;
        }
        *state = PipelineState::Teardown;
        for pump in self.pumps.lock().unwrap().drain(..) {
            pump.abort();
        }
    }
}

/// Reads gateway RTP off the adopted server socket, repackages the payload
/// type and fans it out to every playing client.
async fn rtp_pump(
    socket: Arc<tokio::net::UdpSocket>,
    ctx: Arc<PipelineContext>,
    kind: StreamKind,
    output_pt: u8,
) {
    let mut buf = vec![0u8; 1600];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!("[{}] {} rtp source closed: {}", ctx.id, kind.label(), e);
                break;
            }
        };
        let mut raw = &buf[..n];
        let packet = match Packet::unmarshal(&mut raw) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("[{}] dropping malformed rtp: {}", ctx.id, e);
                continue;
            }
        };
        let mut packet = packet;
        packet.header.payload_type = output_pt;
        let bytes = match packet.marshal() {
            Ok(bytes) => bytes,
            Err(_) => continue,
        };
        ctx.for_each_client(|client| {
            if client.is_playing() {
                client.send_rtp(kind, &bytes);
            }
        });
    }
}

/// Forwards gateway RTCP (sender reports) to every connected client.
async fn rtcp_pump(socket: Arc<tokio::net::UdpSocket>, ctx: Arc<PipelineContext>, kind: StreamKind) {
    let mut buf = vec![0u8; 1500];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!("[{}] {} rtcp source closed: {}", ctx.id, kind.label(), e);
                break;
            }
        };
        let data = &buf[..n];
        ctx.for_each_client(|client| {
            client.send_rtcp(kind, data);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_spec() -> StreamSpec {
        StreamSpec {
            kind: StreamKind::Video,
            codec: Codec::Vp8,
            payload_type: 100,
            rtcp_send_port: 4010,
        }
    }

    fn audio_spec() -> StreamSpec {
        StreamSpec {
            kind: StreamKind::Audio,
            codec: Codec::Opus,
            payload_type: 111,
            rtcp_send_port: 4020,
        }
    }

    #[test]
    fn test_launch_video_only() {
        let spec = PipelineSpec {
            video: Some(video_spec()),
            audio: None,
        };
        let launch = spec.launch();
        assert!(launch.starts_with("( "));
        assert!(launch.ends_with(" )"));
        assert!(launch.contains("name=video_rtp_srv"));
        assert!(launch.contains("name=video_rtcp_rcv_srv"));
        assert!(launch.contains("payload=100"));
        assert!(launch.contains("encoding-name=VP8"));
        assert!(launch.contains("rtpvp8depay"));
        assert!(launch.contains("pt=96 name=pay0"));
        assert!(launch.contains("port=4010"));
        assert!(!launch.contains("pay1"));
    }

    #[test]
    fn test_launch_audio_video_pay_order() {
        let spec = PipelineSpec {
            video: Some(video_spec()),
            audio: Some(audio_spec()),
        };
        let launch = spec.launch();
        let pay0 = launch.find("name=pay0").unwrap();
        let pay1 = launch.find("name=pay1").unwrap();
        assert!(pay0 < pay1);
        assert!(launch.contains("encoding-name=OPUS"));
        assert!(launch.contains("pt=127 name=pay1"));
        assert!(launch.contains("clock-rate=48000"));
    }

    #[test]
    fn test_launch_audio_only_is_pay0() {
        let spec = PipelineSpec {
            video: None,
            audio: Some(audio_spec()),
        };
        let launch = spec.launch();
        assert!(launch.contains("pt=127 name=pay0"));
        assert!(!launch.contains("pay1"));
    }

    #[test]
    fn test_h264_caps_feedback_flags() {
        let spec = PipelineSpec {
            video: Some(StreamSpec {
                kind: StreamKind::Video,
                codec: Codec::H264,
                payload_type: 107,
                rtcp_send_port: 4030,
            }),
            audio: None,
        };
        let launch = spec.launch();
        assert!(launch.contains("rtph264depay"));
        assert!(launch.contains("rtcp-fb-nack-pli=1"));
        assert!(launch.contains("rtcp-fb-nack=1"));
        assert!(launch.contains("rtcp-fb-ccm-fir=1"));
        assert!(launch.contains("rtp-profile=3"));
    }
}
