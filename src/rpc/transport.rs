//! Socket ownership and the request/response exchange
//!
//! The framework answers strictly in order and responses carry no usable correlation, so a
//! transport handles one call at a time. `call` takes `&mut self`, which makes an
//! overlapping call on the same transport impossible to express.

use async_trait::async_trait;
use rmpv::Value;
use std::{fmt, time::{Duration, Instant}};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::{ReconError, Result},
    log_rpc_call,
    rpc::codec,
};

pub trait RpcStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RpcStream for T {}

pub type BoxedStream = Box<dyn RpcStream>;

/// Opens byte streams to the RPC endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> Result<BoxedStream>;
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let stream = timeout(self.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ReconError::network(format!("connection to {}:{} timed out", host, port)))?
            .map_err(|e| ReconError::network(format!("cannot connect to {}:{}: {}", host, port, e)))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Socket open, not yet authenticated
    Connected,
    Authenticating,
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Authenticating => "authenticating",
            Self::Ready => "ready",
        };
        f.write_str(name)
    }
}

pub struct RpcTransport {
    stream: Option<BoxedStream>,
    state: ConnectionState,
    read_buf: Vec<u8>,
    call_timeout: Duration,
    /// Set while a request is on the wire without its response read back
    in_flight: bool,
}

impl RpcTransport {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            stream: None,
            state: ConnectionState::Disconnected,
            read_buf: Vec::new(),
            call_timeout,
            in_flight: false,
        }
    }

    /// Whether a previous call was dropped mid-exchange, leaving its response unread
    pub fn has_abandoned_call(&self) -> bool {
        self.in_flight
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        debug!(from = %self.state, to = %state, "RPC connection state change");
        self.state = state;
    }

    /// Replace any existing socket with a fresh unauthenticated one
    pub async fn open(&mut self, connector: &dyn Connector, host: &str, port: u16) -> Result<()> {
        self.close();
        self.set_state(ConnectionState::Connecting);
        match connector.connect(host, port).await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    pub fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("RPC socket closed");
        }
        self.read_buf.clear();
        self.in_flight = false;
        if self.state != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Send one request and wait for its response.
    ///
    /// A response carrying an `error` field fails with [`ReconError::RpcProtocol`] and leaves the
    /// connection usable. Socket failures and timeouts close the connection.
    pub async fn call(&mut self, method: &str, params: Vec<Value>) -> Result<Value> {
        let started = Instant::now();
        let Some(stream) = self.stream.as_mut() else {
            return Err(ReconError::ConnectionClosed);
        };

        let id = Uuid::new_v4().simple().to_string();
        let frame = codec::encode_request(method, &params, &id)?;

        self.in_flight = true;
        let read_buf = &mut self.read_buf;
        let exchange = async {
            stream.write_all(&frame).await?;
            stream.flush().await?;
            read_frame(stream, read_buf).await
        };
        let outcome = timeout(self.call_timeout, exchange).await;
        self.in_flight = false;

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(method, "RPC exchange failed, closing connection: {}", e);
                self.close();
                return Err(e);
            }
            Err(_) => {
                // A late response would be read as the answer to the next request.
                warn!(method, "RPC call timed out after {:?}, closing connection", self.call_timeout);
                self.close();
                return Err(ReconError::network(format!(
                    "{} timed out after {}s",
                    method,
                    self.call_timeout.as_secs()
                )));
            }
        };

        log_rpc_call!(method, started.elapsed());

        match codec::error_message(&response) {
            Some(message) => Err(ReconError::rpc(method, message)),
            None => Ok(codec::unwrap_result(response)),
        }
    }
}

async fn read_frame(stream: &mut BoxedStream, buf: &mut Vec<u8>) -> Result<Value> {
    let mut chunk = [0u8; 8192];
    let mut scanner = codec::FrameScanner::default();
    loop {
        if let Some(len) = scanner.scan(buf)? {
            let (value, _) = codec::try_decode_frame(&buf[..len])?
                .ok_or_else(|| ReconError::codec("frame ended inside a value"))?;
            buf.drain(..len);
            return Ok(value);
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ReconError::ConnectionClosed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
