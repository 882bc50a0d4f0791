use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use rtsp_types::{headers, Message, Method, Request, Response, StatusCode, Version};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::mountpoint::{ClientTransport, MountClient, Mountpoint};
use crate::sdp::mount_description;
use crate::server::{MountTable, RuntimeConfig};

/// Per-connection RTSP exchange. One handler per accepted client; all
/// instances live on the runtime thread.
pub(crate) struct ClientHandler {
    addr: SocketAddr,
    cseq: u32,
    session_id: Option<String>,
    mount: Option<Arc<Mountpoint>>,
    client: Option<Arc<MountClient>>,
    control: UnboundedSender<Message<Vec<u8>>>,
    close_signal: Option<tokio::sync::oneshot::Sender<()>>,
    mounts: MountTable,
    config: RuntimeConfig,
}

impl ClientHandler {
    pub(crate) fn new(
        addr: SocketAddr,
        mounts: MountTable,
        config: RuntimeConfig,
        control: UnboundedSender<Message<Vec<u8>>>,
        close_signal: tokio::sync::oneshot::Sender<()>,
    ) -> Self {
        ClientHandler {
            addr,
            cseq: 0,
            session_id: None,
            mount: None,
            client: None,
            control,
            close_signal: Some(close_signal),
            mounts,
            config,
        }
    }

    pub(crate) fn handle_request(&mut self, request: &Request<Vec<u8>>) -> Response<Vec<u8>> {
        self.update_cseq(request);
        let result = match request.method() {
            Method::Options => self.handle_options(),
            Method::Describe => self.handle_describe(request),
            Method::Setup => self.handle_setup(request),
            Method::Play => self.handle_play(),
            Method::Pause => self.handle_pause(),
            Method::Teardown => self.handle_teardown(),
            Method::GetParameter => self.handle_get_parameter(),
            _ => Ok(self.status(StatusCode::MethodNotAllowed)),
        };
        result.unwrap_or_else(|e| {
            warn!("request from {} failed: {}", self.addr, e);
            self.status(StatusCode::InternalServerError)
        })
    }

    /// Drops the tracked client when the control connection dies without a
    /// TEARDOWN.
    pub(crate) fn on_disconnect(&mut self) {
        if let (Some(mount), Some(client)) = (self.mount.take(), self.client.take()) {
            mount.ctx.remove_client(&client.session_id);
            client.close();
            debug!("client {} vanished, released", self.addr);
        }
    }

    fn update_cseq(&mut self, request: &Request<Vec<u8>>) {
        if let Some(cseq) = request.header(&headers::CSEQ) {
            self.cseq = cseq.as_str().parse().unwrap_or(0);
        }
    }

    fn status(&self, code: StatusCode) -> Response<Vec<u8>> {
        Response::builder(Version::V1_0, code)
            .header(headers::CSEQ, self.cseq.to_string())
            .empty()
            .map_body(|_| vec![])
    }

    fn handle_options(&self) -> Result<Response<Vec<u8>>> {
        let response = Response::builder(Version::V1_0, StatusCode::Ok)
            .header(headers::CSEQ, self.cseq.to_string())
            .header(
                headers::PUBLIC,
                "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER",
            )
            .empty();
        Ok(response.map_body(|_| vec![]))
    }

    fn handle_describe(&mut self, request: &Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
        let Some((mount, _)) = self.resolve(request) else {
            return Ok(self.status(StatusCode::NotFound));
        };

        let sdp = match mount_description(
            mount.spec(),
            mount.factory.profile,
            &mount.ctx.id,
            &self.config.interface,
        ) {
            Ok(sdp) => sdp,
            Err(e) => {
                // SDP creation failure refuses this client only.
                warn!("describe for {} refused: {}", mount.path, e);
                return Ok(self.status(StatusCode::InternalServerError));
            }
        };

        let body = sdp.into_bytes();
        let response = Response::builder(Version::V1_0, StatusCode::Ok)
            .header(headers::CSEQ, self.cseq.to_string())
            .header(headers::CONTENT_TYPE, "application/sdp")
            .header(headers::CONTENT_BASE, mount.ctx.rtsp_url.clone())
            .header(headers::CONTENT_LENGTH, body.len().to_string())
            .build(body);
        Ok(response)
    }

    fn handle_setup(&mut self, request: &Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
        let Some((mount, stream_index)) = self.resolve(request) else {
            return Ok(self.status(StatusCode::NotFound));
        };
        let streams = mount.spec().streams();
        let Some(stream) = streams.get(stream_index.unwrap_or(0)).copied() else {
            return Ok(self.status(StatusCode::NotFound));
        };

        let transport_header = match request.header(&headers::TRANSPORT) {
            Some(value) => value.as_str().to_string(),
            None => return Ok(self.status(StatusCode::BadRequest)),
        };
        if transport_header.contains("interleaved") || transport_header.contains("/TCP") {
            return Ok(self.status(StatusCode::UnsupportedTransport));
        }
        let (client_rtp_port, client_rtcp_port) = match parse_client_ports(&transport_header) {
            Ok(ports) => ports,
            Err(_) => return Ok(self.status(StatusCode::UnsupportedTransport)),
        };

        let rtp = std::net::UdpSocket::bind("0.0.0.0:0")?;
        rtp.set_nonblocking(true)?;
        let rtcp = std::net::UdpSocket::bind("0.0.0.0:0")?;
        rtcp.set_nonblocking(true)?;
        let server_rtp_port = rtp.local_addr()?.port();
        let server_rtcp_port = rtcp.local_addr()?.port();
        let transport = ClientTransport {
            rtp: Arc::new(UdpSocket::from_std(rtp)?),
            rtcp: Arc::new(UdpSocket::from_std(rtcp)?),
            rtp_dest: SocketAddr::new(self.addr.ip(), client_rtp_port),
            rtcp_dest: SocketAddr::new(self.addr.ip(), client_rtcp_port),
        };

        let session_id = match &self.session_id {
            Some(id) => id.clone(),
            None => {
                let id = Uuid::new_v4().to_string();
                self.session_id = Some(id.clone());
                id
            }
        };
        let client = match &self.client {
            Some(client) => {
                // A SETUP after PAUSE re-subscribes the client.
                mount.ctx.remove_client(&session_id);
                mount.ctx.add_client(client.clone());
                client.clone()
            }
            None => {
                let client = Arc::new(MountClient::new(
                    session_id.clone(),
                    self.addr,
                    self.control.clone(),
                    self.close_signal.take(),
                ));
                mount.ctx.add_client(client.clone());
                self.client = Some(client.clone());
                self.mount = Some(mount.clone());
                client
            }
        };
        client.add_transport(stream.kind, transport, stream.rtcp_send_port);

        // First SETUP is pipeline-prepared time: adopt the pre-bound server
        // sockets and start pumping.
        if let Err(e) = mount.pipeline.prepare(&mount.ctx) {
            warn!("pipeline for {} failed to prepare: {}", mount.path, e);
            return Ok(self.status(StatusCode::InternalServerError));
        }

        info!(
            "client {} set up {} (stream {}) rtp {} -> {}",
            self.addr,
            mount.path,
            stream.kind.label(),
            server_rtp_port,
            client_rtp_port
        );

        let response = Response::builder(Version::V1_0, StatusCode::Ok)
            .header(headers::CSEQ, self.cseq.to_string())
            .header(
                headers::SESSION,
                format!("{};timeout={}", session_id, self.config.session_timeout),
            )
            .header(
                headers::TRANSPORT,
                format!(
                    "RTP/AVP;unicast;client_port={}-{};server_port={}-{}",
                    client_rtp_port, client_rtcp_port, server_rtp_port, server_rtcp_port
                ),
            )
            .empty();
        Ok(response.map_body(|_| vec![]))
    }

    fn handle_play(&mut self) -> Result<Response<Vec<u8>>> {
        let (Some(mount), Some(client), Some(session_id)) =
            (&self.mount, &self.client, &self.session_id)
        else {
            return Ok(self.status(StatusCode::SessionNotFound));
        };
        client.set_playing(true);
        mount.pipeline.set_playing();

        let response = Response::builder(Version::V1_0, StatusCode::Ok)
            .header(headers::CSEQ, self.cseq.to_string())
            .header(headers::SESSION, session_id.as_str())
            .header(headers::RANGE, "npt=0.000-")
            .empty();
        Ok(response.map_body(|_| vec![]))
    }

    /// PAUSE releases the tracked reference: the client stops counting as a
    /// subscriber until it sets up again.
    fn handle_pause(&mut self) -> Result<Response<Vec<u8>>> {
        let (Some(mount), Some(client), Some(session_id)) =
            (&self.mount, &self.client, &self.session_id)
        else {
            return Ok(self.status(StatusCode::SessionNotFound));
        };
        client.set_playing(false);
        mount.ctx.remove_client(session_id);

        let response = Response::builder(Version::V1_0, StatusCode::Ok)
            .header(headers::CSEQ, self.cseq.to_string())
            .header(headers::SESSION, session_id.as_str())
            .empty();
        Ok(response.map_body(|_| vec![]))
    }

    fn handle_teardown(&mut self) -> Result<Response<Vec<u8>>> {
        if let (Some(mount), Some(client)) = (self.mount.take(), self.client.take()) {
            mount.ctx.remove_client(&client.session_id);
            client.close();
            info!("client {} tore down {}", self.addr, mount.path);
        }
        let mut builder = Response::builder(Version::V1_0, StatusCode::Ok)
            .header(headers::CSEQ, self.cseq.to_string());
        if let Some(session_id) = self.session_id.take() {
            builder = builder.header(headers::SESSION, session_id);
        }
        Ok(builder.empty().map_body(|_| vec![]))
    }

    fn handle_get_parameter(&self) -> Result<Response<Vec<u8>>> {
        let mut builder = Response::builder(Version::V1_0, StatusCode::Ok)
            .header(headers::CSEQ, self.cseq.to_string());
        if let Some(session_id) = &self.session_id {
            builder = builder.header(headers::SESSION, session_id.as_str());
        }
        Ok(builder.empty().map_body(|_| vec![]))
    }

    /// Maps the request URI onto a mountpoint and an optional stream index
    /// from a trailing `streamid=<n>` control segment.
    fn resolve(&self, request: &Request<Vec<u8>>) -> Option<(Arc<Mountpoint>, Option<usize>)> {
        let uri = request.request_uri()?;
        let mut path = uri.path().trim_end_matches('/').to_string();
        let mut stream_index = None;
        if let Some((head, tail)) = path.rsplit_once('/') {
            if let Some(idx) = tail.strip_prefix("streamid=") {
                stream_index = idx.parse::<usize>().ok();
                path = head.to_string();
            }
        }
        let mount = self.mounts.lock().unwrap().get(&path).cloned()?;
        Some((mount, stream_index))
    }
}

/// Client port pair from a Transport header: the `client_port=<rtp>-<rtcp>`
/// parameter of the semicolon-separated parameter list.
fn parse_client_ports(transport: &str) -> Result<(u16, u16)> {
    let pair = transport
        .split(';')
        .find_map(|param| param.trim().strip_prefix("client_port="))
        .ok_or_else(|| anyhow!("transport carries no client_port"))?;
    match pair.split_once('-') {
        Some((rtp, rtcp)) => Ok((rtp.trim().parse()?, rtcp.trim().parse()?)),
        None => Err(anyhow!("client_port is not a port pair: {}", pair)),
    }
}
