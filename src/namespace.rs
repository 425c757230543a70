//! Shared state passed between algorithm functions.
//!
//! A [Namespace] is a fixed set of keys, each holding a map of fields. Workers read and write it
//! remotely through the pool's namespace socket while a cycle is running, the pool flushes it at
//! the start of every cycle so nothing leaks from one timestamp into the next.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use derive_more::{Display, Error};
use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::socket::{RequestOptions, ReplyHandle, Replier, Requester, SocketError};
use crate::wire::{Envelope, Fields};

pub const GET: &str = "get";
pub const SET: &str = "set";

#[derive(Debug, Display, Error)]
pub enum NamespaceError {
    #[display("unknown namespace key {key}")]
    UnknownKey { key: String },
    #[display("namespace service error: {reason}")]
    Remote { reason: String },
    #[display("namespace socket error: {_0}")]
    Socket(SocketError),
}

impl From<SocketError> for NamespaceError {
    fn from(value: SocketError) -> Self {
        NamespaceError::Socket(value)
    }
}

/// Keys are fixed between calls to [declare](Namespace::declare), values sit behind their own
/// lock so writers to different keys never wait on each other.
#[derive(Debug, Default)]
pub struct Namespace {
    entries: RwLock<HashMap<String, Mutex<Fields>>>,
}

impl Namespace {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let namespace = Self::default();
        namespace.declare(keys);
        namespace
    }

    /// Replaces the key set, every key starts empty.
    pub fn declare<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries = keys
            .into_iter()
            .map(|key| (key.into(), Mutex::new(Fields::new())))
            .collect();
        *self.entries.write().unwrap_or_else(PoisonError::into_inner) = entries;
    }

    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Copy of the value at `key`, `None` if the key was never declared.
    pub fn get(&self, key: &str) -> Option<Fields> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .map(|value| value.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// Merges `fields` into the value at `key`. Fields not in `fields` are left alone.
    pub fn set(&self, key: &str, fields: Fields) -> Result<(), NamespaceError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let value = entries.get(key).ok_or_else(|| NamespaceError::UnknownKey {
            key: key.to_string(),
        })?;
        let mut value = value.lock().unwrap_or_else(PoisonError::into_inner);
        for (field, field_value) in fields {
            value.insert(field, field_value);
        }
        Ok(())
    }

    pub fn flush(&self) {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        for value in entries.values() {
            value.lock().unwrap_or_else(PoisonError::into_inner).clear();
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GetRequest {
    pub key: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SetRequest {
    pub key: String,
    pub value: Fields,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct NamespaceReply {
    #[serde(default)]
    pub value: Option<Fields>,
    #[serde(default)]
    pub error: Option<String>,
}

impl NamespaceReply {
    fn failed(reason: impl ToString) -> Self {
        Self {
            value: None,
            error: Some(reason.to_string()),
        }
    }
}

fn handle(namespace: &Namespace, envelope: &Envelope) -> NamespaceReply {
    match envelope.task.as_str() {
        GET => match envelope.parse::<GetRequest>() {
            Ok(req) => NamespaceReply {
                value: namespace.get(&req.key),
                error: None,
            },
            Err(e) => NamespaceReply::failed(e),
        },
        SET => match envelope.parse::<SetRequest>() {
            Ok(req) => match namespace.set(&req.key, req.value) {
                Ok(()) => NamespaceReply::default(),
                Err(e) => NamespaceReply::failed(e),
            },
            Err(e) => NamespaceReply::failed(e),
        },
        other => NamespaceReply::failed(format!("unknown namespace task {other}")),
    }
}

async fn answer(handle: ReplyHandle, reply: &NamespaceReply) {
    if let Err(e) = handle.reply(reply).await {
        if !e.is_closed() {
            error!("NAMESPACE: Failed to reply: {}", e);
        }
    }
}

/// Answers namespace requests on `replier` until it is closed.
pub async fn serve(namespace: Arc<Namespace>, replier: Arc<Replier>) {
    debug!("NAMESPACE: Serving on port {}", replier.port());
    loop {
        match replier.receive::<Envelope>().await {
            Ok((envelope, reply_handle)) => {
                let reply = handle(&namespace, &envelope);
                answer(reply_handle, &reply).await;
            }
            Err(SocketError::Closed) => break,
            Err(SocketError::Malformed { source, handle }) => {
                answer(handle, &NamespaceReply::failed(source)).await;
            }
            Err(e) => error!("NAMESPACE: Receive failed: {}", e),
        }
    }
    debug!("NAMESPACE: Service stopped");
}

/// What a worker uses to reach the namespace of the pool that called it.
#[derive(Debug)]
pub struct NamespaceClient {
    requester: Requester,
    opts: RequestOptions,
}

impl NamespaceClient {
    pub async fn connect(host: &str, port: u16) -> Result<Self, NamespaceError> {
        let requester = Requester::new(host, port, true).await?;
        Ok(Self {
            requester,
            opts: RequestOptions::default(),
        })
    }

    pub fn with_options(mut self, opts: RequestOptions) -> Self {
        self.opts = opts;
        self
    }

    async fn call<P: Serialize>(&self, task: &str, payload: P) -> Result<NamespaceReply, NamespaceError> {
        let reply: NamespaceReply = self
            .requester
            .request(&Envelope::new(task, payload), self.opts)
            .await?;
        match reply.error {
            Some(reason) => Err(NamespaceError::Remote { reason }),
            None => Ok(reply),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Fields>, NamespaceError> {
        let reply = self
            .call(
                GET,
                GetRequest {
                    key: key.to_string(),
                },
            )
            .await?;
        Ok(reply.value)
    }

    pub async fn set(&self, key: &str, value: Fields) -> Result<(), NamespaceError> {
        self.call(
            SET,
            SetRequest {
                key: key.to_string(),
                value,
            },
        )
        .await?;
        Ok(())
    }

    pub fn close(&self) -> Result<(), SocketError> {
        self.requester.close()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;
    use crate::socket::SocketBuilder;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("Expected object"),
        }
    }

    #[test]
    fn test_that_set_merges_fields() {
        let namespace = Namespace::new(["signals"]);
        namespace.set("signals", fields(json!({"a": 1}))).unwrap();
        namespace.set("signals", fields(json!({"b": 2}))).unwrap();
        namespace.set("signals", fields(json!({"a": 3}))).unwrap();

        assert_eq!(namespace.get("signals"), Some(fields(json!({"a": 3, "b": 2}))));
    }

    #[test]
    fn test_that_flush_empties_every_key() {
        let namespace = Namespace::new(["one", "two"]);
        namespace.set("one", fields(json!({"a": 1}))).unwrap();
        namespace.set("two", fields(json!({"b": 1}))).unwrap();
        namespace.flush();

        for key in namespace.keys() {
            assert_eq!(namespace.get(&key), Some(Fields::new()));
        }
    }

    #[test]
    fn test_that_unknown_keys_are_handled() {
        let namespace = Namespace::new(["one"]);
        assert!(namespace.get("two").is_none());
        let res = namespace.set("two", Fields::new());
        assert!(matches!(res, Err(NamespaceError::UnknownKey { .. })));
    }

    #[test]
    fn test_that_declare_replaces_keys() {
        let namespace = Namespace::new(["old"]);
        namespace.declare(["b", "a"]);
        assert_eq!(namespace.keys(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_that_client_reaches_served_namespace() {
        let namespace = Arc::new(Namespace::new(["signals"]));
        let replier = Arc::new(SocketBuilder::new("127.0.0.1").replier().await.unwrap());
        let service = tokio::spawn(serve(Arc::clone(&namespace), Arc::clone(&replier)));

        let client = NamespaceClient::connect("127.0.0.1", replier.port()).await.unwrap();
        client.set("signals", fields(json!({"ABC": 0.5}))).await.unwrap();
        let value = client.get("signals").await.unwrap();
        assert_eq!(value, Some(fields(json!({"ABC": 0.5}))));
        assert_eq!(namespace.get("signals"), value);

        let err = client.set("missing", Fields::new()).await.unwrap_err();
        assert!(matches!(err, NamespaceError::Remote { .. }));

        replier.close().unwrap();
        service.await.unwrap();
    }
}
