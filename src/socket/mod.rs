//! Message sockets over TCP.
//!
//! Four roles are provided: [Requester] sends a request and waits for the matching reply,
//! [Replier] receives requests and answers each one exactly once, [Publisher] broadcasts to every
//! connected [Subscriber]. Any role can either dial a known address or listen, a listening socket
//! accepts any number of peers. Requests sent from a listening [Requester] are spread round-robin
//! across the connected peers, which is how the worker pool hands work to remote workers.
//!
//! Listening on port zero does not ask the OS for an ephemeral port, it scans the configured
//! [PortRange] in order and takes the first port that binds. Ports in the range are the ones an
//! orchestrator is allowed to advertise to workers running elsewhere.
//!
//! Every message is serialized with serde_json and written as one length-prefixed frame. Each
//! request carries a context id, replies echo it back, so many requests can be in flight on one
//! connection at the same time.
//!
//! [close](Requester::close) can be called from any thread. It wakes every blocked receive or
//! request with [SocketError::Closed], loops use that to exit without logging an error. A second
//! close also returns [SocketError::Closed] and does nothing else.
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use derive_more::{Display, Error};

use crate::config::PortRange;

mod frame;
mod pubsub;
mod replier;
mod requester;
mod transport;

pub use frame::MAX_FRAME;
pub use pubsub::{Publisher, Subscriber};
pub use replier::{ReplyHandle, Replier};
pub use requester::Requester;

#[derive(Debug, Display, Error)]
pub enum SocketError {
    #[display("socket closed")]
    Closed,
    #[display("operation timed out")]
    Timeout,
    #[display("peer disconnected before replying")]
    Disconnected,
    #[display("no free ports between {min} and {max}")]
    NoFreePorts { min: u16, max: u16 },
    #[display("frame of {size} bytes exceeds limit")]
    FrameTooLarge { size: usize },
    #[display("transport error: {_0}")]
    Transport(std::io::Error),
    #[display("codec error: {_0}")]
    Codec(serde_json::Error),
    /// The request could not be decoded, the handle lets the caller still answer it.
    #[display("malformed request: {source}")]
    Malformed {
        source: serde_json::Error,
        handle: ReplyHandle,
    },
}

impl SocketError {
    pub fn is_closed(&self) -> bool {
        matches!(self, SocketError::Closed)
    }
}

impl From<std::io::Error> for SocketError {
    fn from(value: std::io::Error) -> Self {
        SocketError::Transport(value)
    }
}

impl From<serde_json::Error> for SocketError {
    fn from(value: serde_json::Error) -> Self {
        SocketError::Codec(value)
    }
}

/// Treats the closed sentinel as success, for teardown paths that may race with another close.
pub fn ignore_closed(result: Result<(), SocketError>) -> Result<(), SocketError> {
    match result {
        Err(SocketError::Closed) => Ok(()),
        other => other,
    }
}

/// Per-call limits for [Requester::request]. `None` waits forever.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub send_timeout: Option<Duration>,
    pub recv_timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = Some(timeout);
        self
    }
}

/// Builds any of the socket roles.
///
/// ```no_run
/// # async fn example() -> Result<(), mercurius::socket::SocketError> {
/// use mercurius::socket::SocketBuilder;
///
/// let replier = SocketBuilder::new("127.0.0.1").replier().await?;
/// let requester = SocketBuilder::new("127.0.0.1")
///     .with_port(replier.port())
///     .with_dial(true)
///     .requester()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct SocketBuilder {
    host: String,
    port: u16,
    dial: bool,
    range: PortRange,
}

impl SocketBuilder {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 0,
            dial: false,
            range: PortRange::default(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_dial(mut self, dial: bool) -> Self {
        self.dial = dial;
        self
    }

    pub fn with_port_range(mut self, range: PortRange) -> Self {
        self.range = range;
        self
    }

    pub async fn requester(self) -> Result<Requester, SocketError> {
        Requester::open(&self).await
    }

    pub async fn replier(self) -> Result<Replier, SocketError> {
        Replier::open(&self).await
    }

    pub async fn subscriber(self) -> Result<Subscriber, SocketError> {
        Subscriber::open(&self).await
    }

    pub async fn publisher(self) -> Result<Publisher, SocketError> {
        Publisher::open(&self).await
    }
}

/// Races `fut` against an optional deadline.
pub(crate) async fn within<F>(limit: Option<Duration>, fut: F) -> Result<F::Output, SocketError>
where
    F: std::future::Future,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| SocketError::Timeout),
        None => Ok(fut.await),
    }
}

/// Poisoning only happens if a holder panicked, the guarded data is still usable.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
