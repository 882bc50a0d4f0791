use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::routing::{delete, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use livebridge::config::{CodecPriority, Config, Registry, Rtsp, Udp};
use livebridge::{HandleId, HostCallbacks, Jsep};

/// Host double that records everything the plugin pushes back.
#[derive(Default)]
pub struct CollectingHost {
    pub events: Mutex<Vec<(HandleId, String, Value, Option<Jsep>)>>,
    pub rtcp: Mutex<Vec<(bool, Vec<u8>)>>,
    pub rtp: Mutex<Vec<(bool, Vec<u8>)>>,
}

impl CollectingHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Oldest undelivered event, FIFO.
    pub async fn wait_event(&self) -> (HandleId, String, Value, Option<Jsep>) {
        for _ in 0..200 {
            {
                let mut events = self.events.lock().unwrap();
                if !events.is_empty() {
                    return events.remove(0);
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("no event pushed within 5s");
    }

    pub async fn wait_rtcp(&self) -> (bool, Vec<u8>) {
        for _ in 0..200 {
            {
                let mut rtcp = self.rtcp.lock().unwrap();
                if !rtcp.is_empty() {
                    return rtcp.remove(0);
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("no rtcp relayed within 5s");
    }
}

impl HostCallbacks for CollectingHost {
    fn relay_rtp(&self, _handle: HandleId, video: bool, data: &[u8]) {
        self.rtp.lock().unwrap().push((video, data.to_vec()));
    }

    fn relay_rtcp(&self, _handle: HandleId, video: bool, data: &[u8]) {
        self.rtcp.lock().unwrap().push((video, data.to_vec()));
    }

    fn push_event(&self, handle: HandleId, transaction: &str, event: Value, jsep: Option<Jsep>) {
        self.events
            .lock()
            .unwrap()
            .push((handle, transaction.to_string(), event, jsep));
    }
}

/// In-process registry double.
#[derive(Default)]
pub struct RegistryState {
    pub duplicate: AtomicBool,
    pub creates: Mutex<Vec<Value>>,
    pub deletes: Mutex<Vec<String>>,
    pub beats: Mutex<Vec<Value>>,
}

pub struct StubRegistry {
    pub addr: SocketAddr,
    pub state: Arc<RegistryState>,
}

impl StubRegistry {
    pub fn streams_url(&self) -> String {
        format!("http://{}/streams", self.addr)
    }

    pub fn keepalive_url(&self) -> String {
        format!("http://{}/alive", self.addr)
    }
}

async fn create_stream(
    State(state): State<Arc<RegistryState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    state.creates.lock().unwrap().push(body);
    if state.duplicate.load(Ordering::SeqCst) {
        Json(json!({"code": 11000}))
    } else {
        Json(json!({"_id": "r1"}))
    }
}

async fn delete_stream(State(state): State<Arc<RegistryState>>, Path(id): Path<String>) {
    state.deletes.lock().unwrap().push(id);
}

async fn heartbeat(State(state): State<Arc<RegistryState>>, Json(body): Json<Value>) {
    state.beats.lock().unwrap().push(body);
}

async fn delete_heartbeat(State(state): State<Arc<RegistryState>>, Path(pid): Path<String>) {
    state.deletes.lock().unwrap().push(pid);
}

pub async fn stub_registry() -> StubRegistry {
    let state = Arc::new(RegistryState::default());
    let app = Router::new()
        .route("/streams", post(create_stream))
        .route("/streams/:id", delete(delete_stream))
        .route("/alive", post(heartbeat))
        .route("/alive/:pid", delete(delete_heartbeat))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    StubRegistry { addr, state }
}

/// Config aimed at the stub registry, with a dedicated UDP glue range per
/// test so parallel tests never contend for ports.
pub fn test_config(registry: &StubRegistry, port_base: u16, priority: Option<&str>) -> Config {
    Config {
        udp: Udp {
            port_range: format!("{}-{}", port_base, port_base + 99),
        },
        rtsp: Rtsp {
            listen: "127.0.0.1:0".to_string(),
            interface: "127.0.0.1".to_string(),
        },
        registry: Registry {
            status_service_url: Some(registry.streams_url()),
            keepalive_service_url: Some(registry.keepalive_url()),
            keepalive_interval: 1,
        },
        codec: CodecPriority {
            video_priority: priority.map(str::to_string),
        },
        log: Default::default(),
    }
}

pub const OFFER_VP8: &str = "v=0\r\n\
    o=- 0 0 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    t=0 0\r\n\
    m=video 9 UDP/TLS/RTP/SAVPF 100 96\r\n\
    a=rtpmap:100 VP8/90000\r\n\
    a=sendonly\r\n";

pub const OFFER_DUAL_VIDEO: &str = "v=0\r\n\
    o=- 0 0 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    t=0 0\r\n\
    m=video 9 UDP/TLS/RTP/SAVPF 96 107\r\n\
    a=rtpmap:96 VP8/90000\r\n\
    a=rtpmap:107 H264/90000\r\n";

pub const OFFER_AUDIO_VIDEO: &str = "v=0\r\n\
    o=- 0 0 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    t=0 0\r\n\
    m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
    a=rtpmap:111 opus/48000/2\r\n\
    m=video 9 UDP/TLS/RTP/SAVPF 100\r\n\
    a=rtpmap:100 VP8/90000\r\n";

pub fn offer_jsep(sdp: &str) -> String {
    serde_json::to_string(&json!({"type": "offer", "sdp": sdp})).unwrap()
}

/// Minimal valid RTP packet with the given payload type and ssrc.
pub fn rtp_packet(pt: u8, ssrc: u32, seq: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 16];
    packet[0] = 0x80;
    packet[1] = pt & 0x7f;
    packet[2..4].copy_from_slice(&seq.to_be_bytes());
    packet[8..12].copy_from_slice(&ssrc.to_be_bytes());
    packet[12..16].copy_from_slice(b"data");
    packet
}
