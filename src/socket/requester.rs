use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::oneshot;

use super::transport::{Inbound, Pending, Transport};
use super::{lock, within, RequestOptions, SocketBuilder, SocketError};

/// Sends requests and blocks for the matching reply.
#[derive(Debug)]
pub struct Requester {
    transport: Transport,
    pending: Arc<Pending>,
    next_context: AtomicU32,
}

/// Removes a context from the pending table when the request finishes or is dropped mid-flight.
struct ContextGuard<'a> {
    pending: &'a Pending,
    context: u32,
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.context);
    }
}

impl Requester {
    pub async fn new(host: &str, port: u16, dial: bool) -> Result<Self, SocketError> {
        SocketBuilder::new(host)
            .with_port(port)
            .with_dial(dial)
            .requester()
            .await
    }

    pub(super) async fn open(builder: &SocketBuilder) -> Result<Self, SocketError> {
        let pending: Arc<Pending> = Arc::default();
        let transport = Transport::open(builder, Inbound::Replies(Arc::clone(&pending))).await?;
        Ok(Self {
            transport,
            pending,
            //Zero is reserved for publications
            next_context: AtomicU32::new(1),
        })
    }

    fn context(&self) -> u32 {
        loop {
            let context = self.next_context.fetch_add(1, Ordering::Relaxed);
            if context != 0 {
                return context;
            }
        }
    }

    /// Sends `msg` to the next connected peer and waits for its reply.
    ///
    /// If no peer is connected yet, the request waits for one up to the send timeout.
    pub async fn request<Req, Rep>(&self, msg: &Req, opts: RequestOptions) -> Result<Rep, SocketError>
    where
        Req: Serialize + ?Sized,
        Rep: DeserializeOwned,
    {
        self.transport.ensure_open()?;
        let body = serde_json::to_vec(msg)?;
        let context = self.context();
        let shutdown = self.transport.shutdown().clone();

        let (tx, rx) = oneshot::channel();
        let _guard = ContextGuard {
            pending: &self.pending,
            context,
        };

        let send = async {
            let pipe = self.transport.pipes().next().await;
            lock(&self.pending).insert(context, (pipe.id(), tx));
            //A pipe removed before the insert has already failed its pending requests
            if !self.transport.pipes().contains(pipe.id()) {
                return Err(SocketError::Disconnected);
            }
            pipe.send(context, &body).await
        };
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(SocketError::Closed),
            sent = within(opts.send_timeout, send) => sent??,
        }

        let reply = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(SocketError::Closed),
            reply = within(opts.recv_timeout, rx) => reply?,
        };
        match reply {
            Ok(body) => Ok(serde_json::from_slice(&body)?),
            Err(_) => Err(SocketError::Disconnected),
        }
    }

    pub fn host(&self) -> &str {
        self.transport.host()
    }

    pub fn port(&self) -> u16 {
        self.transport.port()
    }

    /// Number of connected peers.
    pub fn peers(&self) -> usize {
        self.transport.pipes().snapshot().len()
    }

    pub fn close(&self) -> Result<(), SocketError> {
        self.transport.close()
    }
}
