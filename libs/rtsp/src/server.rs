use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use rtsp_types::{Message, Method, ParseError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use url::Url;

use crate::handler::ClientHandler;
use crate::mountpoint::Mountpoint;

const READ_BUFFER_SIZE: usize = 8192;
const MAX_BUFFER_SIZE: usize = 256 * 1024;

pub(crate) type MountTable = Arc<Mutex<HashMap<String, Arc<Mountpoint>>>>;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: SocketAddr,
    /// Interface the server advertises in mountpoint descriptions.
    pub interface: String,
    pub session_timeout: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            listen: "0.0.0.0:8554".parse().unwrap(),
            interface: "localhost".to_string(),
            session_timeout: 60,
        }
    }
}

/// Work submitted to the runtime. Every server mutation crosses this queue;
/// the submitting side never touches the mountpoint table directly.
pub enum RtspCommand {
    AddMountpoint {
        mount: Mountpoint,
    },
    RemoveMountpoint {
        path: String,
        done: Option<oneshot::Sender<()>>,
    },
    Shutdown,
}

/// Cloneable submission side of the runtime queue.
#[derive(Clone)]
pub struct RtspHandle {
    tx: UnboundedSender<RtspCommand>,
}

impl RtspHandle {
    pub fn add_mountpoint(&self, mount: Mountpoint) -> Result<()> {
        self.tx
            .send(RtspCommand::AddMountpoint { mount })
            .map_err(|_| anyhow!("rtsp runtime is gone"))
    }

    pub fn remove_mountpoint(&self, path: &str, done: Option<oneshot::Sender<()>>) -> Result<()> {
        self.tx
            .send(RtspCommand::RemoveMountpoint {
                path: path.to_string(),
                done,
            })
            .map_err(|_| anyhow!("rtsp runtime is gone"))
    }

    fn shutdown(&self) {
        let _ = self.tx.send(RtspCommand::Shutdown);
    }
}

/// The embedded RTSP server: a dedicated OS thread running its own
/// single-threaded loop. All mountpoint and client handling executes there.
pub struct RtspRuntime {
    handle: RtspHandle,
    thread: Option<std::thread::JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl RtspRuntime {
    pub fn spawn(config: RuntimeConfig) -> Result<Self> {
        let (tx, rx) = unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<std::io::Result<SocketAddr>>();

        let thread = std::thread::Builder::new()
            .name("rtsp-runtime".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("rtsp runtime loop");
                rt.block_on(run_loop(config, rx, ready_tx));
            })?;

        let local_addr = ready_rx
            .recv()
            .map_err(|_| anyhow!("rtsp runtime died before binding"))??;
        info!("rtsp server listening on {}", local_addr);

        Ok(RtspRuntime {
            handle: RtspHandle { tx },
            thread: Some(thread),
            local_addr,
        })
    }

    pub fn handle(&self) -> RtspHandle {
        self.handle.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Quits the loop, tears down every mountpoint and joins the thread.
    pub fn shutdown(mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for RtspRuntime {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn run_loop(
    config: RuntimeConfig,
    mut rx: UnboundedReceiver<RtspCommand>,
    ready_tx: std::sync::mpsc::Sender<std::io::Result<SocketAddr>>,
) {
    let listener = match TcpListener::bind(config.listen).await {
        Ok(listener) => {
            let addr = listener.local_addr().unwrap_or(config.listen);
            let _ = ready_tx.send(Ok(addr));
            listener
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let mounts: MountTable = Arc::new(Mutex::new(HashMap::new()));

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(RtspCommand::AddMountpoint { mount }) => {
                    info!("mountpoint {} published", mount.path);
                    let path = mount.path.clone();
                    mounts.lock().unwrap().insert(path, Arc::new(mount));
                }
                Some(RtspCommand::RemoveMountpoint { path, done }) => {
                    let removed = mounts.lock().unwrap().remove(&path);
                    if let Some(mount) = removed {
                        teardown_mount(mount);
                        info!("mountpoint {} removed", path);
                    }
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                Some(RtspCommand::Shutdown) | None => break,
            },
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("rtsp client connected from {}", addr);
                    let mounts = mounts.clone();
                    let config = config.clone();
                    tokio::spawn(handle_connection(stream, addr, mounts, config));
                }
                Err(e) => warn!("rtsp accept failed: {}", e),
            },
        }
    }

    let remaining: Vec<Arc<Mountpoint>> = mounts.lock().unwrap().drain().map(|(_, m)| m).collect();
    for mount in remaining {
        teardown_mount(mount);
    }
    debug!("rtsp runtime stopped");
}

/// Sends TEARDOWN to every tracked client, closes them, stops the pipeline
/// and releases the context.
fn teardown_mount(mount: Arc<Mountpoint>) {
    let uri = Url::parse(&mount.ctx.rtsp_url).ok();
    for client in mount.ctx.drain_clients() {
        if let Some(uri) = &uri {
            client.send_teardown(uri);
        }
        client.close();
    }
    mount.pipeline.teardown();
    mount.ctx.release();
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    mounts: MountTable,
    config: RuntimeConfig,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = unbounded_channel::<Message<Vec<u8>>>();
    let (close_tx, mut close_rx) = tokio::sync::oneshot::channel::<()>();

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let mut wire = Vec::new();
            if message.write(&mut wire).is_err() {
                continue;
            }
            if write_half.write_all(&wire).await.is_err() {
                break;
            }
            let _ = write_half.flush().await;
        }
    });

    let mut handler = ClientHandler::new(addr, mounts, config, out_tx.clone(), close_tx);
    let mut buffer: Vec<u8> = Vec::with_capacity(READ_BUFFER_SIZE);
    let mut chunk = vec![0u8; READ_BUFFER_SIZE];

    'conn: loop {
        let n = tokio::select! {
            read = read_half.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("read from {} failed: {}", addr, e);
                    break;
                }
            },
            _ = &mut close_rx => {
                debug!("server closed client {}", addr);
                break;
            }
        };
        if buffer.len() + n > MAX_BUFFER_SIZE {
            warn!("client {} overflowed the control buffer", addr);
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);

        loop {
            match Message::<Vec<u8>>::parse(&buffer) {
                Ok((message, consumed)) => {
                    buffer.drain(..consumed);
                    match message {
                        Message::Request(request) => {
                            let is_teardown = request.method() == Method::Teardown;
                            let response = handler.handle_request(&request);
                            if out_tx.send(Message::Response(response)).is_err() {
                                break 'conn;
                            }
                            if is_teardown {
                                break 'conn;
                            }
                        }
                        Message::Response(response) => {
                            // Reply to a server-initiated request (teardown).
                            debug!("client {} answered {:?}", addr, response.status());
                        }
                        Message::Data(_) => {}
                    }
                }
                Err(ParseError::Incomplete(_)) => break,
                Err(e) => {
                    warn!("client {} sent garbage: {:?}", addr, e);
                    break 'conn;
                }
            }
        }
    }

    handler.on_disconnect();
    drop(out_tx);
    let _ = writer.await;
    debug!("rtsp client {} disconnected", addr);
}
