use std::time::Duration;

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;

use super::transport::{Inbound, Transport};
use super::{within, SocketBuilder, SocketError};

const BACKLOG: usize = 1024;
const PUBLICATION: u32 = 0;

/// Receives everything published to it, there is no reply.
#[derive(Debug)]
pub struct Subscriber {
    transport: Transport,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl Subscriber {
    /// Dials a publisher at `host:port`.
    pub async fn new(host: &str, port: u16) -> Result<Self, SocketError> {
        SocketBuilder::new(host)
            .with_port(port)
            .with_dial(true)
            .subscriber()
            .await
    }

    pub(super) async fn open(builder: &SocketBuilder) -> Result<Self, SocketError> {
        let (tx, rx) = mpsc::channel(BACKLOG);
        let transport = Transport::open(builder, Inbound::Messages(tx)).await?;
        Ok(Self {
            transport,
            inbound: tokio::sync::Mutex::new(rx),
        })
    }

    pub async fn receive<T>(&self) -> Result<T, SocketError>
    where
        T: DeserializeOwned,
    {
        self.receive_within(None).await
    }

    pub async fn receive_timeout<T>(&self, timeout: Duration) -> Result<T, SocketError>
    where
        T: DeserializeOwned,
    {
        self.receive_within(Some(timeout)).await
    }

    async fn receive_within<T>(&self, limit: Option<Duration>) -> Result<T, SocketError>
    where
        T: DeserializeOwned,
    {
        self.transport.ensure_open()?;
        let shutdown = self.transport.shutdown().clone();

        let next = async { self.inbound.lock().await.recv().await };
        let body = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(SocketError::Closed),
            body = within(limit, next) => body?,
        };
        let body = body.ok_or(SocketError::Closed)?;
        Ok(serde_json::from_slice(&body)?)
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

/// Sends every message to all connected subscribers.
#[derive(Debug)]
pub struct Publisher {
    transport: Transport,
}

impl Publisher {
    /// Listens on `host:port`, port zero scans the default range.
    pub async fn new(host: &str, port: u16) -> Result<Self, SocketError> {
        SocketBuilder::new(host).with_port(port).publisher().await
    }

    pub(super) async fn open(builder: &SocketBuilder) -> Result<Self, SocketError> {
        let transport = Transport::open(builder, Inbound::Discard).await?;
        Ok(Self { transport })
    }

    /// Returns the number of subscribers the message was written to. Subscribers that fail the
    /// write are dropped.
    pub async fn publish<T>(&self, msg: &T) -> Result<usize, SocketError>
    where
        T: Serialize + ?Sized,
    {
        self.transport.ensure_open()?;
        let body = serde_json::to_vec(msg)?;

        let mut delivered = 0;
        for pipe in self.transport.pipes().snapshot() {
            match pipe.send(PUBLICATION, &body).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    debug!("SOCKET: Dropping subscriber pipe {}: {}", pipe.id(), err);
                    self.transport.pipes().remove(pipe.id());
                }
            }
        }
        Ok(delivered)
    }

    /// Number of connected subscribers.
    pub fn peers(&self) -> usize {
        self.transport.pipes().snapshot().len()
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
