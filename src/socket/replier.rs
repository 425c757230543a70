use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use super::transport::{Inbound, Incoming, Pipe, Transport};
use super::{within, SocketBuilder, SocketError};

const BACKLOG: usize = 1024;

/// Receives requests from any connected peer, each one is answered through its [ReplyHandle].
#[derive(Debug)]
pub struct Replier {
    transport: Transport,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Incoming>>,
}

/// Answers exactly one request. `reply` consumes the handle so a request cannot be answered
/// twice.
#[derive(Debug)]
pub struct ReplyHandle {
    context: u32,
    pipe: Option<Arc<Pipe>>,
}

impl ReplyHandle {
    pub async fn reply<T>(mut self, msg: &T) -> Result<(), SocketError>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(msg)?;
        match self.pipe.take() {
            Some(pipe) => pipe.send(self.context, &body).await,
            None => Err(SocketError::Closed),
        }
    }
}

impl Drop for ReplyHandle {
    fn drop(&mut self) {
        if self.pipe.is_some() {
            debug!("SOCKET: Context {} dropped without a reply", self.context);
        }
    }
}

impl Replier {
    pub async fn new(host: &str, port: u16, dial: bool) -> Result<Self, SocketError> {
        SocketBuilder::new(host)
            .with_port(port)
            .with_dial(dial)
            .replier()
            .await
    }

    pub(super) async fn open(builder: &SocketBuilder) -> Result<Self, SocketError> {
        let (tx, rx) = mpsc::channel(BACKLOG);
        let transport = Transport::open(builder, Inbound::Requests(tx)).await?;
        Ok(Self {
            transport,
            inbound: tokio::sync::Mutex::new(rx),
        })
    }

    /// Blocks until a request arrives or the socket is closed.
    pub async fn receive<T>(&self) -> Result<(T, ReplyHandle), SocketError>
    where
        T: DeserializeOwned,
    {
        self.receive_within(None).await
    }

    /// As [receive](Replier::receive) but gives up with [SocketError::Timeout].
    pub async fn receive_timeout<T>(&self, timeout: Duration) -> Result<(T, ReplyHandle), SocketError>
    where
        T: DeserializeOwned,
    {
        self.receive_within(Some(timeout)).await
    }

    async fn receive_within<T>(&self, limit: Option<Duration>) -> Result<(T, ReplyHandle), SocketError>
    where
        T: DeserializeOwned,
    {
        self.transport.ensure_open()?;
        let shutdown = self.transport.shutdown().clone();

        let next = async { self.inbound.lock().await.recv().await };
        let incoming = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(SocketError::Closed),
            incoming = within(limit, next) => incoming?,
        };
        let incoming = incoming.ok_or(SocketError::Closed)?;

        let handle = ReplyHandle {
            context: incoming.context,
            pipe: Some(incoming.pipe),
        };
        match serde_json::from_slice(&incoming.body) {
            Ok(msg) => Ok((msg, handle)),
            Err(source) => Err(SocketError::Malformed { source, handle }),
        }
    }

    pub fn host(&self) -> &str {
        self.transport.host()
    }

    pub fn port(&self) -> u16 {
        self.transport.port()
    }

    pub fn close(&self) -> Result<(), SocketError> {
        self.transport.close()
    }
}
