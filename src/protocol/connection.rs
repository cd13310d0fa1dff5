//! Request/response client over one TCP connection.

use super::frame::{read_frame, write_frame, Envelope};
use super::Operation;
use crate::error::{FlexError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Default connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-request timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A lazily connected, reconnecting framed connection.
///
/// Requests on one connection are serialized. A failed request drops the
/// stream and the next call reconnects.
pub struct Connection {
    addr: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
    next_request_id: AtomicU64,
}

impl Connection {
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_timeouts(addr, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeouts(
        addr: impl Into<String>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
            request_timeout,
            stream: Mutex::new(None),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Send one request and wait for its response.
    pub async fn call<Req, Resp>(&self, request: Req) -> Result<Resp>
    where
        Req: Serialize + Operation,
        Resp: DeserializeOwned,
    {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
                .await?
                .map_err(|e| FlexError::Network(format!("connect {}: {}", self.addr, e)))?;
            stream.set_nodelay(true)?;
            debug!(addr = %self.addr, "Connected");
            *guard = Some(stream);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(FlexError::Internal("connection missing after connect".into()));
        };

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::new(request_id, request.operation(), request);

        let exchange = async {
            write_frame(stream, &envelope).await?;
            read_frame::<_, Resp>(stream).await
        };
        let outcome = match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(Ok(Some(reply))) if reply.request_id == request_id => Ok(reply.body),
            Ok(Ok(Some(reply))) => Err(FlexError::Protocol(format!(
                "response id {} does not match request {}",
                reply.request_id, request_id
            ))),
            Ok(Ok(None)) => Err(FlexError::Network(format!(
                "{} closed the connection",
                self.addr
            ))),
            Ok(Err(FlexError::Io(e))) => Err(FlexError::Network(format!("{}: {}", self.addr, e))),
            Ok(Err(e)) => Err(e),
            Err(elapsed) => Err(elapsed.into()),
        };

        if outcome.is_err() {
            *guard = None;
        }
        outcome
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("addr", &self.addr).finish()
    }
}
