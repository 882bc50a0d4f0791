use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::pool::PortPool;

/// Creates loopback UDP sockets on ports drawn from the shared pool.
#[derive(Clone)]
pub struct SocketFactory {
    pool: Arc<PortPool>,
}

impl SocketFactory {
    pub fn new(pool: Arc<PortPool>) -> Self {
        SocketFactory { pool }
    }

    /// Binds a pipeline-side socket on a pool port.
    pub async fn open_server(&self) -> Result<GlueSocket> {
        self.open(None).await
    }

    /// Binds on a pool port and connects to `127.0.0.1:peer_port`.
    pub async fn open_client(&self, peer_port: u16) -> Result<GlueSocket> {
        self.open(Some(peer_port)).await
    }

    async fn open(&self, connect_to: Option<u16>) -> Result<GlueSocket> {
        let attempts = self.pool.capacity();
        let mut last_err = None;

        for _ in 0..attempts {
            let port = self.pool.acquire(None)?;
            match UdpSocket::bind((Ipv4Addr::LOCALHOST, port)).await {
                Ok(socket) => {
                    if let Some(peer) = connect_to {
                        if let Err(e) = socket.connect((Ipv4Addr::LOCALHOST, peer)).await {
                            self.pool.release(port);
                            last_err = Some(anyhow!("connect to {}: {}", peer, e));
                            continue;
                        }
                    }
                    trace!(
                        "opened {} socket on port {}",
                        if connect_to.is_some() { "client" } else { "server" },
                        port
                    );
                    return Ok(GlueSocket {
                        port,
                        socket: Arc::new(socket),
                        is_client: connect_to.is_some(),
                        pool: self.pool.clone(),
                        reader: None,
                        closed: false,
                    });
                }
                Err(e) => {
                    // Port is poisoned (still bound elsewhere); try another.
                    self.pool.release(port);
                    last_err = Some(anyhow!("bind 127.0.0.1:{}: {}", port, e));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("no bindable port in pool")))
    }
}

/// One pool-backed loopback socket. Owned by exactly one side; the pipeline
/// only ever receives the shared (non-owning) view. Closing returns the
/// port to the pool exactly once.
pub struct GlueSocket {
    port: u16,
    socket: Arc<UdpSocket>,
    is_client: bool,
    pool: Arc<PortPool>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

impl GlueSocket {
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_client(&self) -> bool {
        self.is_client
    }

    /// Non-owning view for the pipeline side. Dropping it never releases
    /// the port.
    pub fn shared(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Best-effort send on a connected socket; the media path swallows
    /// errors.
    pub fn try_send(&self, data: &[u8]) {
        let _ = self.socket.try_send(data);
    }

    /// Invokes `on_datagram` for every received datagram until it returns
    /// false or the read side is detached.
    pub fn attach_read<F>(&mut self, mut on_datagram: F)
    where
        F: FnMut(&[u8]) -> bool + Send + 'static,
    {
        self.detach_read();
        let socket = self.socket.clone();
        let port = self.port;
        self.reader = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            loop {
                match socket.recv(&mut buf).await {
                    Ok(n) => {
                        if !on_datagram(&buf[..n]) {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("read source on port {} stopped: {}", port, e);
                        break;
                    }
                }
            }
        }));
    }

    pub fn detach_read(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    /// Idempotent; detaches the read source and returns the port.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.detach_read();
        self.pool.release(self.port);
    }
}

impl Drop for GlueSocket {
    fn drop(&mut self) {
        self.close();
    }
}
