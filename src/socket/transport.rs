use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use super::frame::{self, Frame};
use super::{lock, SocketBuilder, SocketError};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// One connected peer. Writes are serialized, reads happen on the pipe's own task.
#[derive(Debug)]
pub(crate) struct Pipe {
    id: u64,
    peer: Option<SocketAddr>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
}

impl Pipe {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) async fn send(&self, context: u32, body: &[u8]) -> Result<(), SocketError> {
        let mut writer = self.writer.lock().await;
        frame::write_frame(&mut *writer, context, body).await
    }
}

#[derive(Debug)]
pub(crate) struct Incoming {
    pub context: u32,
    pub body: Vec<u8>,
    pub pipe: Arc<Pipe>,
}

/// Outstanding requests keyed by context, tagged with the pipe they were sent on so they can be
/// failed when that peer disconnects.
pub(crate) type Pending = Mutex<HashMap<u32, (u64, oneshot::Sender<Vec<u8>>)>>;

/// What a pipe does with the frames it reads, this is the only thing that differs between roles.
#[derive(Clone)]
pub(crate) enum Inbound {
    Replies(Arc<Pending>),
    Requests(mpsc::Sender<Incoming>),
    Messages(mpsc::Sender<Vec<u8>>),
    Discard,
}

impl Inbound {
    /// Returns false once the owning socket has stopped listening.
    async fn deliver(&self, pipe: &Arc<Pipe>, frame: Frame) -> bool {
        match self {
            Inbound::Replies(pending) => {
                if let Some((_, waiter)) = lock(pending).remove(&frame.context) {
                    //Requester may have given up on this context already
                    let _ = waiter.send(frame.body);
                } else {
                    debug!(
                        "SOCKET: Dropping reply for unknown context {} from pipe {}",
                        frame.context, pipe.id
                    );
                }
                true
            }
            Inbound::Requests(tx) => tx
                .send(Incoming {
                    context: frame.context,
                    body: frame.body,
                    pipe: Arc::clone(pipe),
                })
                .await
                .is_ok(),
            Inbound::Messages(tx) => tx.send(frame.body).await.is_ok(),
            Inbound::Discard => true,
        }
    }

    fn disconnected(&self, pipe_id: u64) {
        if let Inbound::Replies(pending) = self {
            //Dropping the senders wakes the waiting requests with a disconnect
            lock(pending).retain(|_, (owner, _)| *owner != pipe_id);
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct PipeSet {
    pipes: Mutex<Vec<Arc<Pipe>>>,
    added: Notify,
    next_pipe: AtomicUsize,
    next_id: AtomicU64,
}

impl PipeSet {
    fn attach(self: &Arc<Self>, stream: TcpStream, inbound: Inbound, shutdown: CancellationToken) {
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr().ok();
        let (mut reader, writer) = stream.into_split();

        let pipe = Arc::new(Pipe {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            peer,
            writer: tokio::sync::Mutex::new(writer),
        });
        debug!("SOCKET: Attached pipe {} for peer {:?}", pipe.id, pipe.peer);
        lock(&self.pipes).push(Arc::clone(&pipe));
        self.added.notify_waiters();

        let pipes = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let read = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    read = frame::read_frame(&mut reader) => read,
                };
                match read {
                    Ok(frame) => {
                        if !inbound.deliver(&pipe, frame).await {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!("SOCKET: Pipe {} closed: {}", pipe.id, err);
                        break;
                    }
                }
            }
            pipes.remove(pipe.id);
            inbound.disconnected(pipe.id);
        });
    }

    pub(crate) fn remove(&self, pipe_id: u64) {
        lock(&self.pipes).retain(|pipe| pipe.id != pipe_id);
    }

    pub(crate) fn contains(&self, pipe_id: u64) -> bool {
        lock(&self.pipes).iter().any(|pipe| pipe.id == pipe_id)
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Pipe>> {
        lock(&self.pipes).clone()
    }

    fn clear(&self) {
        lock(&self.pipes).clear();
    }

    /// Round-robins across connected peers.
    fn pick(&self) -> Option<Arc<Pipe>> {
        let pipes = lock(&self.pipes);
        if pipes.is_empty() {
            return None;
        }
        let pos = self.next_pipe.fetch_add(1, Ordering::Relaxed) % pipes.len();
        pipes.get(pos).cloned()
    }

    /// Waits until at least one peer is connected.
    pub(crate) async fn next(&self) -> Arc<Pipe> {
        loop {
            //Registered before the check so an attach in between is not missed
            let added = self.added.notified();
            if let Some(pipe) = self.pick() {
                return pipe;
            }
            added.await;
        }
    }
}

/// State shared by every socket role: the listener or dialled stream, the connected pipes and
/// the shutdown signal.
#[derive(Debug)]
pub(crate) struct Transport {
    host: String,
    port: u16,
    closed: AtomicBool,
    shutdown: CancellationToken,
    pipes: Arc<PipeSet>,
}

impl Transport {
    pub(crate) async fn open(builder: &SocketBuilder, inbound: Inbound) -> Result<Self, SocketError> {
        let shutdown = CancellationToken::new();
        let pipes = Arc::new(PipeSet::default());

        let port = if builder.dial {
            let stream = TcpStream::connect((builder.host.as_str(), builder.port)).await?;
            pipes.attach(stream, inbound, shutdown.clone());
            builder.port
        } else {
            let listener = bind(builder).await?;
            let port = listener.local_addr()?.port();
            accept_loop(listener, Arc::clone(&pipes), inbound, shutdown.clone());
            port
        };

        Ok(Self {
            host: builder.host.clone(),
            port,
            closed: AtomicBool::new(false),
            shutdown,
            pipes,
        })
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn pipes(&self) -> &PipeSet {
        &self.pipes
    }

    pub(crate) fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn ensure_open(&self) -> Result<(), SocketError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SocketError::Closed);
        }
        Ok(())
    }

    pub(crate) fn close(&self) -> Result<(), SocketError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(SocketError::Closed);
        }
        debug!("SOCKET: Closing {}:{}", self.host, self.port);
        self.shutdown.cancel();
        self.pipes.clear();
        Ok(())
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

async fn bind(builder: &SocketBuilder) -> Result<TcpListener, SocketError> {
    let host = builder.host.as_str();
    if builder.port != 0 {
        return Ok(TcpListener::bind((host, builder.port)).await?);
    }

    for candidate in builder.range.iter() {
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => return Ok(listener),
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                debug!("SOCKET: Port {} in use, trying next", candidate);
            }
            Err(err) => return Err(SocketError::Transport(err)),
        }
    }
    Err(SocketError::NoFreePorts {
        min: builder.range.min(),
        max: builder.range.max(),
    })
}

fn accept_loop(
    listener: TcpListener,
    pipes: Arc<PipeSet>,
    inbound: Inbound,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, _peer)) => pipes.attach(stream, inbound.clone(), shutdown.clone()),
                Err(err) => {
                    warn!("SOCKET: Failed to accept connection: {}", err);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    });
}
