//! Session channel to the daemon. A reader thread demultiplexes the stream:
//! replies resolve pending commands by sequence number, events are queued for the event loop.

use std::collections::HashMap;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use haggle_core::status::Status;
use haggle_core::{read_frame, write_frame, Command, FrameError, Message, PROTOCOL_VERSION};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::ClientConfig;
use crate::error::{Error, RegistrationError, Result};
use crate::event_loop::LoopSignal;

/// What the daemon handed back on registration.
pub(crate) struct Registration {
    pub session_id: u32,
    pub storage_dir: String,
}

pub(crate) struct Connection {
    writer: Mutex<TcpStream>,
    pending: Mutex<HashMap<u64, mpsc::Sender<Status>>>,
    next_seq: AtomicU64,
    ended: AtomicBool,
    reply_timeout: Duration,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Connect and register `name`. On success the reader thread is running and forwards events
    /// to `events`.
    pub fn register(
        cfg: &ClientConfig,
        name: &str,
        events: mpsc::Sender<LoopSignal>,
    ) -> Result<(Arc<Connection>, Registration)> {
        let mut stream = connect(cfg)?;
        let seq = 1;
        let request = Message::Request {
            seq,
            command: Command::Register {
                protocol_version: PROTOCOL_VERSION,
                name: name.to_string(),
            },
        };
        write_frame(&mut stream, &request).map_err(RegistrationError::from)?;
        let registration = match read_frame(&mut stream) {
            Ok(Message::Registered {
                seq: s,
                session_id,
                storage_dir,
            }) if s == seq => Registration {
                session_id,
                storage_dir,
            },
            Ok(Message::Reply { seq: s, status }) if s == seq => {
                let status = Status(status);
                return Err(if status.is_busy() {
                    Error::Busy(name.to_string())
                } else {
                    RegistrationError::Rejected(status).into()
                });
            }
            Ok(_) => return Err(RegistrationError::BadReply.into()),
            Err(FrameError::Io(e)) if is_timeout(&e) => {
                return Err(Error::Timeout(cfg.reply_timeout()))
            }
            Err(e) => return Err(RegistrationError::Frame(e).into()),
        };
        stream
            .set_read_timeout(None)
            .map_err(|e| RegistrationError::Frame(e.into()))?;
        let read_half = stream
            .try_clone()
            .map_err(|e| RegistrationError::Frame(e.into()))?;

        let conn = Arc::new(Connection {
            writer: Mutex::new(stream),
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(seq + 1),
            ended: AtomicBool::new(false),
            reply_timeout: cfg.reply_timeout(),
            reader: Mutex::new(None),
        });
        let reader_conn = conn.clone();
        let handle = std::thread::Builder::new()
            .name(format!("haggle-reader-{}", name))
            .spawn(move || read_loop(read_half, reader_conn, events))
            .map_err(|e| RegistrationError::Frame(e.into()))?;
        *conn.reader.lock() = Some(handle);
        Ok((conn, registration))
    }

    /// One request/reply round trip. Zero status is success; anything else is the daemon's error.
    pub fn call(&self, command: Command) -> Result<()> {
        let name = command.name();
        let (tx, rx) = mpsc::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut pending = self.pending.lock();
            if self.is_ended() {
                return Err(Error::SessionClosed);
            }
            pending.insert(seq, tx);
        }
        let sent = {
            let mut w = self.writer.lock();
            write_frame(&mut *w, &Message::Request { seq, command })
        };
        if let Err(e) = sent {
            self.pending.lock().remove(&seq);
            if self.is_ended() {
                return Err(Error::SessionClosed);
            }
            return Err(Error::Channel(e));
        }
        trace!(seq, command = name, "request sent");
        match rx.recv_timeout(self.reply_timeout) {
            Ok(status) if status.is_ok() => Ok(()),
            Ok(status) => {
                debug!(seq, command = name, %status, "daemon rejected command");
                Err(Error::Daemon(status))
            }
            Err(RecvTimeoutError::Timeout) => {
                self.pending.lock().remove(&seq);
                Err(Error::Timeout(self.reply_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::SessionClosed),
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    fn resolve(&self, seq: u64, status: Status) {
        match self.pending.lock().remove(&seq) {
            Some(tx) => {
                let _ = tx.send(status);
            }
            None => debug!(seq, "reply for unknown or expired request"),
        }
    }

    /// Mark the channel dead and fail everything still waiting.
    fn mark_ended(&self) {
        self.ended.store(true, Ordering::Release);
        self.pending.lock().clear();
    }

    /// Close the stream and wait for the reader to finish.
    pub fn shutdown(&self) {
        self.mark_ended();
        let _ = self.writer.lock().shutdown(Shutdown::Both);
        let reader = self.reader.lock().take();
        if let Some(handle) = reader {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn connect(cfg: &ClientConfig) -> Result<TcpStream> {
    let addr = cfg.daemon_addr();
    let unreachable = |source| RegistrationError::Unreachable { addr, source };
    let stream = TcpStream::connect_timeout(&addr, cfg.reply_timeout()).map_err(unreachable)?;
    stream
        .set_read_timeout(Some(cfg.reply_timeout()))
        .map_err(unreachable)?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// One-shot administrative request on a throw-away connection.
pub(crate) fn call_once(cfg: &ClientConfig, command: Command) -> Result<()> {
    let mut stream = connect(cfg)?;
    let name = command.name();
    write_frame(&mut stream, &Message::Request { seq: 1, command })?;
    let reply = match read_frame(&mut stream) {
        Err(FrameError::Io(e)) if is_timeout(&e) => {
            return Err(Error::Timeout(cfg.reply_timeout()))
        }
        other => other?,
    };
    let _ = stream.shutdown(Shutdown::Both);
    match reply {
        Message::Reply { seq: 1, status } if status == 0 => Ok(()),
        Message::Reply { seq: 1, status } => {
            debug!(command = name, status, "daemon rejected command");
            Err(Error::Daemon(Status(status)))
        }
        other => {
            warn!(command = name, ?other, "unexpected reply");
            Err(Error::Channel(FrameError::Closed))
        }
    }
}

fn read_loop(mut stream: TcpStream, conn: Arc<Connection>, events: mpsc::Sender<LoopSignal>) {
    loop {
        match read_frame(&mut stream) {
            Ok(Message::Reply { seq, status }) => conn.resolve(seq, Status(status)),
            Ok(Message::Event { category, payload }) => {
                trace!(category, "event received");
                let _ = events.send(LoopSignal::Event { category, payload });
            }
            Ok(other) => warn!(?other, "unexpected message from daemon"),
            Err(FrameError::Closed) => break,
            Err(e) => {
                if !conn.is_ended() {
                    warn!(error = %e, "daemon connection failed");
                }
                break;
            }
        }
    }
    if !conn.is_ended() {
        debug!("daemon closed the session");
    }
    conn.mark_ended();
    let _ = events.send(LoopSignal::Ended);
}
