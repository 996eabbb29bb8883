//! Application transport: loopback TCP accept loop driving the registry.
//! One reader task and one writer task per connection; writers are fed through unbounded channels,
//! so each connection sees messages in the order the registry emitted them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use haggle_core::wire::{decode_payload, encode_frame, frame_len, FrameError, LEN_SIZE};
use haggle_core::{ApplicationRegistry, ConnId, DataObject, Message, Outbound};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::DaemonConfig;

/// How long connection tasks get to flush after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct ConnEntry {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    close: Arc<Notify>,
}

struct Shared {
    registry: Mutex<ApplicationRegistry>,
    conns: Mutex<HashMap<ConnId, ConnEntry>>,
    stop_tx: watch::Sender<bool>,
    next_conn: AtomicU64,
    served: AtomicU64,
}

impl Shared {
    /// Carry out registry actions. Called with the registry lock held so per-connection order
    /// matches registry order.
    async fn route(&self, actions: Vec<Outbound>) {
        let conns = self.conns.lock().await;
        for action in actions {
            match action {
                Outbound::Send(conn, msg) => {
                    let Some(entry) = conns.get(&conn) else {
                        debug!(conn, "dropping message for closed connection");
                        continue;
                    };
                    match encode_frame(&msg) {
                        Ok(frame) => {
                            let _ = entry.tx.send(frame);
                        }
                        Err(e) => error!(conn, error = %e, "failed to encode message"),
                    }
                }
                Outbound::Close(conn) => {
                    if let Some(entry) = conns.get(&conn) {
                        info!(conn, "closing connection of replaced registration");
                        entry.close.notify_one();
                    }
                }
                Outbound::Shutdown => {
                    info!("daemon shutting down");
                    self.stop_tx.send_replace(true);
                }
            }
        }
    }
}

/// Cloneable control surface for a running server.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Stop accepting; open connections flush queued messages and close.
    pub fn shutdown(&self) {
        self.shared.stop_tx.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.shared.stop_tx.borrow()
    }

    /// Neighbor set changed: notify subscribed applications.
    pub async fn announce_neighbors(&self, neighbors: DataObject) {
        let mut registry = self.shared.registry.lock().await;
        let actions = registry.on_neighbor_update(neighbors);
        self.shared.route(actions).await;
    }

    /// Application requests processed so far.
    pub fn requests_served(&self) -> u64 {
        self.shared.served.load(Ordering::Relaxed)
    }

    pub async fn application_count(&self) -> usize {
        self.shared.registry.lock().await.application_count()
    }
}

pub struct Server {
    listener: TcpListener,
    handle: ServerHandle,
}

impl Server {
    pub async fn bind(cfg: &DaemonConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(cfg.listen_addr()).await?;
        let (stop_tx, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            registry: Mutex::new(ApplicationRegistry::new(
                cfg.storage_dir.display().to_string(),
            )),
            conns: Mutex::new(HashMap::new()),
            stop_tx,
            next_conn: AtomicU64::new(1),
            served: AtomicU64::new(0),
        });
        Ok(Self {
            listener,
            handle: ServerHandle { shared },
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Accept applications until shutdown (requested by an application or through the handle).
    pub async fn run(self) -> std::io::Result<()> {
        let shared = self.handle.shared.clone();
        let mut stop = shared.stop_tx.subscribe();
        let mut tasks = JoinSet::new();
        info!(addr = %self.listener.local_addr()?, "accepting applications");
        loop {
            if *stop.borrow_and_update() {
                break;
            }
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn = shared.next_conn.fetch_add(1, Ordering::Relaxed);
                        debug!(conn, %peer, "application connected");
                        tasks.spawn(serve_connection(stream, conn, shared.clone()));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = stop.changed() => {}
            }
        }
        drop(self.listener);
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(remaining = tasks.len(), "connections did not close in time");
            tasks.abort_all();
        }
        info!("stopped");
        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, conn: ConnId, shared: Arc<Shared>) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let close = Arc::new(Notify::new());
    shared.conns.lock().await.insert(
        conn,
        ConnEntry {
            tx,
            close: close.clone(),
        },
    );
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut stop = shared.stop_tx.subscribe();
    loop {
        if *stop.borrow_and_update() {
            break;
        }
        let msg = tokio::select! {
            msg = read_message(&mut reader) => msg,
            _ = close.notified() => break,
            _ = stop.changed() => continue,
        };
        match msg {
            Ok(Message::Request { seq, command }) => {
                shared.served.fetch_add(1, Ordering::Relaxed);
                let mut registry = shared.registry.lock().await;
                let actions = registry.on_request(conn, seq, command);
                shared.route(actions).await;
            }
            Ok(other) => {
                warn!(conn, ?other, "unexpected message from application");
                break;
            }
            Err(FrameError::Closed) => break,
            Err(e) => {
                error!(conn, error = %e, "dropping application connection");
                break;
            }
        }
    }

    shared.registry.lock().await.on_disconnected(conn);
    // Dropping the sender lets the writer flush what is queued, then exit.
    shared.conns.lock().await.remove(&conn);
    let _ = writer_task.await;
    debug!(conn, "application disconnected");
}

async fn read_message(r: &mut OwnedReadHalf) -> Result<Message, FrameError> {
    let mut prefix = [0u8; LEN_SIZE];
    if let Err(e) = r.read_exact(&mut prefix).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => FrameError::Closed,
            _ => FrameError::Io(e),
        });
    }
    let len = frame_len(prefix)?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    decode_payload(&payload)
}

/// A server on its own runtime thread. Used to embed the daemon in-process.
pub struct BackgroundServer {
    addr: SocketAddr,
    handle: ServerHandle,
    runtime: tokio::runtime::Handle,
    thread: Option<std::thread::JoinHandle<()>>,
}

/// Bind `cfg` and serve on a background thread. Port 0 picks an ephemeral port.
pub fn spawn_background(cfg: DaemonConfig) -> std::io::Result<BackgroundServer> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    let server = rt.block_on(Server::bind(&cfg))?;
    let addr = server.local_addr()?;
    let handle = server.handle();
    let runtime = rt.handle().clone();
    let thread = std::thread::Builder::new()
        .name("haggled".into())
        .spawn(move || {
            if let Err(e) = rt.block_on(server.run()) {
                error!(error = %e, "server failed");
            }
        })?;
    Ok(BackgroundServer {
        addr,
        handle,
        runtime,
        thread: Some(thread),
    })
}

impl BackgroundServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn handle(&self) -> &ServerHandle {
        &self.handle
    }

    pub fn requests_served(&self) -> u64 {
        self.handle.requests_served()
    }

    pub fn announce_neighbors(&self, neighbors: DataObject) {
        self.runtime
            .block_on(self.handle.announce_neighbors(neighbors));
    }

    pub fn application_count(&self) -> usize {
        self.runtime.block_on(self.handle.application_count())
    }

    /// Block until the server stops on its own (for example after an application's shutdown command).
    pub fn join(mut self) {
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for BackgroundServer {
    fn drop(&mut self) {
        self.handle.shutdown();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}
