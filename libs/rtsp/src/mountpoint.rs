use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rtsp_types::{headers, Message, Method, Request, Version};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::pipeline::{Pipeline, PipelineSpec};
use crate::types::StreamKind;

/// RTP profile announced to RTSP clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    Avp,
    Avpf,
}

impl Profile {
    pub fn as_sdp(&self) -> &'static str {
        match self {
            Profile::Avp => "RTP/AVP",
            Profile::Avpf => "RTP/AVPF",
        }
    }
}

/// Parameters of the media factory behind a mountpoint.
#[derive(Debug, Clone)]
pub struct MediaFactory {
    pub launch: String,
    pub latency_ms: u32,
    pub profile: Profile,
    pub retransmission_ms: u32,
    pub shared: bool,
}

impl MediaFactory {
    pub fn new(launch: String) -> Self {
        MediaFactory {
            launch,
            latency_ms: 0,
            profile: Profile::Avpf,
            retransmission_ms: 100,
            shared: true,
        }
    }
}

/// Per-mountpoint companion state consulted by the RTSP runtime.
///
/// Owns borrowed clones of the pipeline-side server sockets until the
/// pipeline adopts them, and tracks every client that completed SETUP so
/// teardown can address each one.
pub struct PipelineContext {
    pub id: String,
    pub rtsp_url: String,
    sockets: Mutex<HashMap<&'static str, Arc<UdpSocket>>>,
    clients: Mutex<Vec<Arc<MountClient>>>,
}

impl PipelineContext {
    pub fn new(
        id: String,
        rtsp_url: String,
        sockets: HashMap<&'static str, Arc<UdpSocket>>,
    ) -> Self {
        PipelineContext {
            id,
            rtsp_url,
            sockets: Mutex::new(sockets),
            clients: Mutex::new(Vec::new()),
        }
    }

    /// Hands the named server socket to the pipeline. Each slot can be
    /// taken once.
    pub fn take_socket(&self, name: &str) -> Option<Arc<UdpSocket>> {
        self.sockets.lock().unwrap().remove(name)
    }

    pub fn add_client(&self, client: Arc<MountClient>) {
        self.clients.lock().unwrap().push(client);
    }

    /// Removes a tracked client, returning it so the caller decides whether
    /// to close. Unknown ids are a no-op.
    pub fn remove_client(&self, session_id: &str) -> Option<Arc<MountClient>> {
        let mut clients = self.clients.lock().unwrap();
        let pos = clients.iter().position(|c| c.session_id == session_id)?;
        Some(clients.remove(pos))
    }

    pub fn drain_clients(&self) -> Vec<Arc<MountClient>> {
        self.clients.lock().unwrap().drain(..).collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn for_each_client<F: FnMut(&MountClient)>(&self, mut f: F) {
        for client in self.clients.lock().unwrap().iter() {
            f(client);
        }
    }

    /// Drops any socket the pipeline never adopted and forgets remaining
    /// clients. Idempotent.
    pub fn release(&self) {
        self.sockets.lock().unwrap().clear();
        self.clients.lock().unwrap().clear();
    }
}

/// A mountpoint published on the server, keyed by `/<id>`.
pub struct Mountpoint {
    pub path: String,
    pub factory: MediaFactory,
    pub pipeline: Pipeline,
    pub ctx: Arc<PipelineContext>,
}

impl Mountpoint {
    pub fn new(path: String, spec: PipelineSpec, ctx: Arc<PipelineContext>) -> Self {
        let factory = MediaFactory::new(spec.launch());
        Mountpoint {
            path,
            factory,
            pipeline: Pipeline::new(spec),
            ctx,
        }
    }

    pub fn spec(&self) -> &PipelineSpec {
        self.pipeline.spec()
    }
}

/// UDP legs toward one client for one stream kind.
pub struct ClientTransport {
    pub rtp: Arc<UdpSocket>,
    pub rtcp: Arc<UdpSocket>,
    pub rtp_dest: SocketAddr,
    pub rtcp_dest: SocketAddr,
}

/// One RTSP client that completed SETUP on a mountpoint.
pub struct MountClient {
    pub session_id: String,
    pub addr: SocketAddr,
    control: Mutex<Option<UnboundedSender<Message<Vec<u8>>>>>,
    close_signal: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
    playing: AtomicBool,
    closed: AtomicBool,
    transports: Mutex<HashMap<StreamKind, ClientTransport>>,
    return_pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl MountClient {
    pub fn new(
        session_id: String,
        addr: SocketAddr,
        control: UnboundedSender<Message<Vec<u8>>>,
        close_signal: Option<tokio::sync::oneshot::Sender<()>>,
    ) -> Self {
        MountClient {
            session_id,
            addr,
            control: Mutex::new(Some(control)),
            close_signal: Mutex::new(close_signal),
            playing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            transports: Mutex::new(HashMap::new()),
            return_pumps: Mutex::new(Vec::new()),
        }
    }

    /// Registers the UDP legs for one stream and starts relaying the
    /// client's RTCP reports to the loopback return port, where the session
    /// controller picks them up.
    pub fn add_transport(&self, kind: StreamKind, transport: ClientTransport, return_port: u16) {
        let rtcp = transport.rtcp.clone();
        let session_id = self.session_id.clone();
        self.return_pumps
            .lock()
            .unwrap()
            .push(tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                loop {
                    match rtcp.recv_from(&mut buf).await {
                        Ok((n, from)) => {
                            trace!("[{}] {} bytes of client rtcp from {}", session_id, n, from);
                            let _ = rtcp.try_send_to(&buf[..n], ([127, 0, 0, 1], return_port).into());
                        }
                        Err(e) => {
                            debug!("[{}] client rtcp socket closed: {}", session_id, e);
                            break;
                        }
                    }
                }
            }));
        self.transports.lock().unwrap().insert(kind, transport);
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Relaxed);
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    pub fn send_rtp(&self, kind: StreamKind, data: &[u8]) {
        let transports = self.transports.lock().unwrap();
        if let Some(t) = transports.get(&kind) {
            let _ = t.rtp.try_send_to(data, t.rtp_dest);
        }
    }

    pub fn send_rtcp(&self, kind: StreamKind, data: &[u8]) {
        let transports = self.transports.lock().unwrap();
        if let Some(t) = transports.get(&kind) {
            let _ = t.rtcp.try_send_to(data, t.rtcp_dest);
        }
    }

    /// Directs a TEARDOWN at the mount URI over the client's control
    /// connection. Best effort; the connection may already be gone.
    pub fn send_teardown(&self, uri: &Url) {
        let request = Request::builder(Method::Teardown, Version::V1_0)
            .request_uri(uri.clone())
            .header(headers::CSEQ, "1")
            .header(headers::SESSION, self.session_id.as_str())
            .build(Vec::new());
        let control = self.control.lock().unwrap();
        if let Some(tx) = control.as_ref() {
            if tx.send(Message::Request(request)).is_err() {
                warn!("[{}] teardown not delivered, client gone", self.session_id);
            } else {
                info!("[{}] teardown sent for {}", self.session_id, uri);
            }
        }
    }

    /// Stops the return pumps, severs the control channel and asks the
    /// connection to close. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for pump in self.return_pumps.lock().unwrap().drain(..) {
            pump.abort();
        }
        self.control.lock().unwrap().take();
        if let Some(close) = self.close_signal.lock().unwrap().take() {
            let _ = close.send(());
        }
        self.transports.lock().unwrap().clear();
    }
}

impl Drop for MountClient {
    fn drop(&mut self) {
        self.close();
    }
}
