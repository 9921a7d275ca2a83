//! A minimal async client for driving a `kvbus` server from tests and from
//! other Rust programs embedding this crate.
//!
//! This is a programmatic request/response and subscription API, not an
//! interactive command-line front-end — there is no REPL, argument
//! parsing, or help text here.

use serde_json::{json, Value};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::instrument;

use crate::conn::Connection;

/// A connection to a `kvbus` server.
pub struct Client {
    conn: Connection,
}

/// Connects to `addr` and returns a ready-to-use [`Client`].
pub async fn connect<T: ToSocketAddrs>(addr: T) -> crate::Result<Client> {
    let socket = TcpStream::connect(addr).await?;
    Ok(Client { conn: Connection::new(socket) })
}

impl Client {
    /// Sends one request and waits for its response frame.
    #[instrument(skip(self, request))]
    pub async fn call(&mut self, request: Value) -> crate::Result<Value> {
        self.conn.write_frame(&request).await?;
        match self.conn.read_frame().await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err("connection closed by server".into()),
        }
    }

    pub async fn get(&mut self, key: &str) -> crate::Result<Value> {
        self.call(json!({ "action": "get", "key": key })).await
    }

    pub async fn set(&mut self, key: &str, value: &str) -> crate::Result<Value> {
        self.call(json!({ "action": "set", "key": key, "value": value })).await
    }

    pub async fn set_with_ttl(&mut self, key: &str, value: &str, ttl: u64) -> crate::Result<Value> {
        self.call(json!({ "action": "set_with_ttl", "key": key, "value": value, "ttl": ttl }))
            .await
    }

    pub async fn delete(&mut self, key: &str) -> crate::Result<Value> {
        self.call(json!({ "action": "delete", "key": key })).await
    }

    pub async fn keys(&mut self) -> crate::Result<Value> {
        self.call(json!({ "action": "keys" })).await
    }

    pub async fn subscribe(&mut self, channel: &str) -> crate::Result<Value> {
        self.call(json!({ "type": "pubsub", "action": "subscribe", "channel": channel }))
            .await
    }

    pub async fn publish(&mut self, channel: &str, message: Value) -> crate::Result<Value> {
        self.call(json!({ "type": "pubsub", "action": "publish", "channel": channel, "message": message }))
            .await
    }

    /// Reads the next frame pushed on the connection without sending a
    /// request first — used after `subscribe` to receive fan-out messages.
    pub async fn recv_push(&mut self) -> crate::Result<Option<Value>> {
        match self.conn.read_frame().await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}
